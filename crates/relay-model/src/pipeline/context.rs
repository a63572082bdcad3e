use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

/// One named context-fragment source (profile lookup, semantic search, a
/// ticketing queue snapshot, …). `fetch` must never propagate an error: on
/// any internal failure an implementation should return `""` so a single
/// slow or broken fragment never blocks prompt assembly. The default
/// `fetch` is itself the no-op — callers that have nothing to plug into a
/// slot simply don't register a fetcher for it.
#[async_trait]
pub trait ContextFetcher: Send + Sync {
    /// Stable lowercase identifier used in logs when a fetch times out.
    fn name(&self) -> &str;

    async fn fetch(&self, channel: &str, user_message: &str) -> String;
}

/// Fixed slots in the Context Assembler's composition order. Registration
/// order among fetchers does not matter; the slot a fetcher is registered
/// under determines where its text lands in the assembled prompt.
///
/// Two slots (`LiveSignals`, `WorkItemContext`) and one (`ActiveSkill`) each
/// fold more than one of the ~10 external fragment kinds into a single
/// composition position: forest/awareness + live forest signals both land
/// in `LiveSignals`; work-item lookup + queue context both land in
/// `WorkItemContext`; a skills snapshot lands in `ActiveSkill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentSlot {
    ActiveSkill,
    Profile,
    StructuredContext,
    RecentMessages,
    SemanticAndFullText,
    LiveSignals,
    WorkItemContext,
}

impl FragmentSlot {
    const ORDER: [FragmentSlot; 7] = [
        FragmentSlot::ActiveSkill,
        FragmentSlot::Profile,
        FragmentSlot::StructuredContext,
        FragmentSlot::RecentMessages,
        FragmentSlot::SemanticAndFullText,
        FragmentSlot::LiveSignals,
        FragmentSlot::WorkItemContext,
    ];
}

/// Static policy text composed around the fetched fragments. Unlike the
/// fetcher slots these require no I/O, so they're supplied directly rather
/// than fanned out.
#[derive(Debug, Clone, Default)]
pub struct StaticFragments {
    pub tool_policy: String,
    pub user_identity: String,
    pub memory_management_policy: String,
    pub approval_policy: String,
}

/// Gathers up to ~10 context fragments from external collaborators in
/// parallel and assembles them into a single prompt with a fixed
/// composition order. Pure over its inputs: owns no state and performs no
/// persistence of intermediates — a fresh assembler can be built per turn,
/// or one shared across turns, with identical results.
pub struct ContextAssembler {
    fetchers: Vec<(FragmentSlot, Arc<dyn ContextFetcher>)>,
    per_fetch_timeout: Duration,
}

impl ContextAssembler {
    pub fn new(per_fetch_timeout: Duration) -> Self {
        Self {
            fetchers: Vec::new(),
            per_fetch_timeout,
        }
    }

    /// Registers `fetcher` for `slot`. Registering a second fetcher for an
    /// already-occupied slot replaces the first — callers own composing
    /// multiple external sources into one fetcher if a slot needs more than
    /// one (see `CombinedFetcher`).
    pub fn register(&mut self, slot: FragmentSlot, fetcher: Arc<dyn ContextFetcher>) {
        self.fetchers.retain(|(s, _)| *s != slot);
        self.fetchers.push((slot, fetcher));
    }

    /// Fans out every registered fetcher in parallel, each bounded by the
    /// assembler's per-fetch timeout and isolated so one panicking or
    /// slow fetch never blocks the others; composes results into one
    /// prompt in the spec's fixed order:
    /// system preamble → active skill → tool policy → user identity →
    /// profile → structured context → recent messages → semantic/full-text
    /// → live signals → memory-management policy → approval policy →
    /// work-item context → user message.
    #[instrument(skip(self, system_preamble, statics, user_message), fields(channel, fetcher_count = self.fetchers.len()))]
    pub async fn assemble(
        &self,
        channel: &str,
        system_preamble: &str,
        statics: &StaticFragments,
        user_message: &str,
    ) -> String {
        let mut handles = Vec::with_capacity(self.fetchers.len());
        for (slot, fetcher) in &self.fetchers {
            let fetcher = fetcher.clone();
            let channel = channel.to_string();
            let message = user_message.to_string();
            let timeout = self.per_fetch_timeout;
            let slot = *slot;
            handles.push(tokio::spawn(async move {
                let text = match tokio::time::timeout(timeout, fetcher.fetch(&channel, &message)).await
                {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(fragment = fetcher.name(), "context fragment fetch timed out");
                        String::new()
                    }
                };
                (slot, text)
            }));
        }

        let mut fragments: HashMap<FragmentSlot, String> = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok((slot, text)) => {
                    fragments.insert(slot, text);
                }
                Err(e) => warn!(error = %e, "context fragment fetch task panicked"),
            }
        }

        let mut sections = Vec::with_capacity(FragmentSlot::ORDER.len() + 6);
        if !system_preamble.is_empty() {
            sections.push(system_preamble.to_string());
        }

        let push_fragment = |sections: &mut Vec<String>, slot: FragmentSlot| {
            if let Some(text) = fragments.get(&slot) {
                if !text.is_empty() {
                    sections.push(text.clone());
                }
            }
        };

        push_fragment(&mut sections, FragmentSlot::ActiveSkill);
        if !statics.tool_policy.is_empty() {
            sections.push(statics.tool_policy.clone());
        }
        if !statics.user_identity.is_empty() {
            sections.push(statics.user_identity.clone());
        }
        push_fragment(&mut sections, FragmentSlot::Profile);
        push_fragment(&mut sections, FragmentSlot::StructuredContext);
        push_fragment(&mut sections, FragmentSlot::RecentMessages);
        push_fragment(&mut sections, FragmentSlot::SemanticAndFullText);
        push_fragment(&mut sections, FragmentSlot::LiveSignals);
        if !statics.memory_management_policy.is_empty() {
            sections.push(statics.memory_management_policy.clone());
        }
        if !statics.approval_policy.is_empty() {
            sections.push(statics.approval_policy.clone());
        }
        push_fragment(&mut sections, FragmentSlot::WorkItemContext);

        sections.push(format!("User: {user_message}"));
        sections.join("\n\n")
    }
}

/// Fetcher that always returns `""` — the default binding for any of the
/// ~10 external fragment kinds a deployment hasn't wired a real collaborator
/// for yet (forest/awareness, work-item lookup, skills snapshot, live
/// forest signals, queue context, …). Mirrors the no-op `SearchText`/
/// `SearchSimilar` convention used elsewhere for unconfigured external
/// interfaces.
pub struct NoopFetcher {
    name: String,
}

impl NoopFetcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ContextFetcher for NoopFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _channel: &str, _user_message: &str) -> String {
        String::new()
    }
}

/// Joins several fetchers' text with blank lines, for slots the spec folds
/// more than one external fragment kind into (e.g. `LiveSignals` =
/// forest/awareness + live forest signals). Each inner fetch still gets
/// the assembler's per-fetch timeout individually since they run inside
/// one outer `fetch` call driven sequentially — a slow inner fetcher here
/// delays its siblings in the same slot, not fragments in other slots.
pub struct CombinedFetcher {
    name: String,
    parts: Vec<Arc<dyn ContextFetcher>>,
}

impl CombinedFetcher {
    pub fn new(name: impl Into<String>, parts: Vec<Arc<dyn ContextFetcher>>) -> Self {
        Self {
            name: name.into(),
            parts,
        }
    }
}

#[async_trait]
impl ContextFetcher for CombinedFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, channel: &str, user_message: &str) -> String {
        let mut out = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let text = part.fetch(channel, user_message).await;
            if !text.is_empty() {
                out.push(text);
            }
        }
        out.join("\n\n")
    }
}

/// Fetches the Context Assembler's "recent messages" and "semantic/full-
/// text" fragments from the local memory store — the only two of the ~10
/// fragment kinds this workspace owns data for directly; the rest are
/// external-collaborator fragments bound via [`NoopFetcher`] or a real
/// client by the caller wiring up the gateway.
pub struct MemoryFetcher {
    memory: Arc<relay_memory::manager::MemoryManager>,
    kind: MemoryFetchKind,
    limit: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum MemoryFetchKind {
    RecentMessages,
    SemanticAndFullText,
}

impl MemoryFetcher {
    pub fn new(
        memory: Arc<relay_memory::manager::MemoryManager>,
        kind: MemoryFetchKind,
        limit: u32,
    ) -> Self {
        Self { memory, kind, limit }
    }
}

#[async_trait]
impl ContextFetcher for MemoryFetcher {
    fn name(&self) -> &str {
        match self.kind {
            MemoryFetchKind::RecentMessages => "recent_messages",
            MemoryFetchKind::SemanticAndFullText => "semantic_and_full_text",
        }
    }

    async fn fetch(&self, channel: &str, user_message: &str) -> String {
        let result = match self.kind {
            MemoryFetchKind::RecentMessages => self
                .memory
                .recent_messages(channel, self.limit)
                .map(|rows| {
                    rows.into_iter()
                        .map(|m| format!("{}: {}", m.role, m.content))
                        .collect::<Vec<_>>()
                        .join("\n")
                }),
            MemoryFetchKind::SemanticAndFullText => self
                .memory
                .search_memory(user_message, self.limit)
                .map(|rows| {
                    rows.into_iter()
                        .map(|m| m.content)
                        .collect::<Vec<_>>()
                        .join("\n")
                }),
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, fetcher = self.name(), "memory context fetch failed");
            String::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedFetcher(&'static str, &'static str);

    #[async_trait]
    impl ContextFetcher for FixedFetcher {
        fn name(&self) -> &str {
            self.0
        }

        async fn fetch(&self, _channel: &str, _user_message: &str) -> String {
            self.1.to_string()
        }
    }

    struct SlowFetcher;

    #[async_trait]
    impl ContextFetcher for SlowFetcher {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, _channel: &str, _user_message: &str) -> String {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "never seen".to_string()
        }
    }

    #[tokio::test]
    async fn composes_fragments_in_fixed_order() {
        let mut assembler = ContextAssembler::new(Duration::from_millis(200));
        assembler.register(
            FragmentSlot::Profile,
            Arc::new(FixedFetcher("profile", "profile text")),
        );
        assembler.register(
            FragmentSlot::WorkItemContext,
            Arc::new(FixedFetcher("work_item", "work item text")),
        );
        let statics = StaticFragments {
            tool_policy: "tool policy text".to_string(),
            ..Default::default()
        };
        let prompt = assembler
            .assemble("general", "system preamble", &statics, "hello")
            .await;

        let profile_pos = prompt.find("profile text").unwrap();
        let tool_policy_pos = prompt.find("tool policy text").unwrap();
        let work_item_pos = prompt.find("work item text").unwrap();
        let user_pos = prompt.find("User: hello").unwrap();
        assert!(profile_pos < tool_policy_pos);
        assert!(tool_policy_pos < work_item_pos);
        assert!(work_item_pos < user_pos);
    }

    #[tokio::test]
    async fn timed_out_fetch_contributes_empty_text() {
        let mut assembler = ContextAssembler::new(Duration::from_millis(20));
        assembler.register(FragmentSlot::LiveSignals, Arc::new(SlowFetcher));
        let prompt = assembler
            .assemble("general", "", &StaticFragments::default(), "hi")
            .await;
        assert!(!prompt.contains("never seen"));
    }

    #[tokio::test]
    async fn empty_fragments_and_empty_statics_are_omitted() {
        let mut assembler = ContextAssembler::new(Duration::from_millis(50));
        assembler.register(
            FragmentSlot::Profile,
            Arc::new(FixedFetcher("profile", "")),
        );
        let prompt = assembler
            .assemble("general", "", &StaticFragments::default(), "hi")
            .await;
        assert_eq!(prompt, "User: hi");
    }
}
