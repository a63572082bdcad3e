//! Pure parsing of inline control markers out of a model response. No I/O —
//! everything here is string in, struct out, so it is exhaustively
//! unit-testable with literal fixtures.
use serde::{Deserialize, Serialize};

use relay_core::types::Visibility;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryIntent {
    pub content: String,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalIntent {
    pub content: String,
    pub deadline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneIntent {
    pub search: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingIntent {
    pub finding_type: String,
    pub confidence: f64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub cleaned_text: String,
    pub memory_intents: Vec<MemoryIntent>,
    pub goal_intents: Vec<GoalIntent>,
    pub done_intents: Vec<DoneIntent>,
    pub findings: Vec<FindingIntent>,
    pub confirmations: Vec<Confirmation>,
    pub playbook_commands: Vec<String>,
}

/// Parse and strip every recognised marker family out of `text`, returning
/// the cleaned text alongside each family's intents in encounter order.
///
/// Markers are matched case-insensitively and non-greedily inside a single
/// pair of square brackets — a marker never spans a `]`.
pub fn extract(text: &str) -> ExtractionResult {
    let mut result = ExtractionResult::default();
    let mut cleaned = String::with_capacity(text.len());

    for line in text.split_inclusive('\n') {
        let (line_body, trailing_newline) = split_trailing_newline(line);
        let without_command = strip_playbook_command(line_body, &mut result.playbook_commands);
        let stripped = strip_bracket_markers(&without_command, &mut result);
        cleaned.push_str(stripped.trim_end_matches(' '));
        cleaned.push_str(trailing_newline);
    }

    result.cleaned_text = collapse_blank_runs(cleaned.trim());
    result
}

fn split_trailing_newline(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// `ELLIE::COMMAND args` anchored at end-of-line, invisible to the user.
fn strip_playbook_command(line: &str, commands: &mut Vec<String>) -> String {
    const MARKER: &str = "ELLIE::";
    match line.rfind(MARKER) {
        Some(idx) => {
            let command = line[idx + MARKER.len()..].trim().to_string();
            if !command.is_empty() {
                commands.push(command);
            }
            line[..idx].to_string()
        }
        None => line.to_string(),
    }
}

fn strip_bracket_markers(line: &str, result: &mut ExtractionResult) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let Some(close_rel) = rest[open..].find(']') else {
            out.push_str(rest);
            return out;
        };
        let close = open + close_rel;
        out.push_str(&rest[..open]);
        let marker = &rest[open + 1..close];
        if !classify_marker(marker, result) {
            out.push('[');
            out.push_str(marker);
            out.push(']');
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Returns `true` when `marker` was recognised (and therefore consumed).
fn classify_marker(marker: &str, result: &mut ExtractionResult) -> bool {
    let lower = marker.to_ascii_lowercase();

    if let Some(body) = strip_prefix_ci(&lower, marker, "remember-private:") {
        result.memory_intents.push(MemoryIntent {
            content: body.trim().to_string(),
            visibility: Visibility::Private,
        });
        return true;
    }
    if let Some(body) = strip_prefix_ci(&lower, marker, "remember-global:") {
        result.memory_intents.push(MemoryIntent {
            content: body.trim().to_string(),
            visibility: Visibility::Global,
        });
        return true;
    }
    if let Some(body) = strip_prefix_ci(&lower, marker, "remember:") {
        result.memory_intents.push(MemoryIntent {
            content: body.trim().to_string(),
            visibility: Visibility::Shared,
        });
        return true;
    }
    if let Some(body) = strip_prefix_ci(&lower, marker, "goal:") {
        let (content, deadline) = split_deadline(body.trim());
        result.goal_intents.push(GoalIntent { content, deadline });
        return true;
    }
    if let Some(body) = strip_prefix_ci(&lower, marker, "done:") {
        let search = body.trim().trim_start_matches("search").trim().to_string();
        result.done_intents.push(DoneIntent { search });
        return true;
    }
    if let Some(body) = strip_prefix_ci(&lower, marker, "memory:") {
        result.findings.push(parse_finding(body.trim()));
        return true;
    }
    if let Some(body) = strip_prefix_ci(&lower, marker, "confirm:") {
        result.confirmations.push(Confirmation {
            description: body.trim().to_string(),
        });
        return true;
    }
    false
}

/// Case-insensitive prefix strip that returns the remainder from the
/// original (non-lowercased) string so content casing is preserved.
fn strip_prefix_ci<'a>(lower: &str, original: &'a str, prefix: &str) -> Option<&'a str> {
    if lower.starts_with(prefix) {
        Some(&original[prefix.len()..])
    } else {
        None
    }
}

fn split_deadline(body: &str) -> (String, Option<String>) {
    match body.to_ascii_lowercase().find("| deadline:") {
        Some(idx) => {
            let content = body[..idx].trim().to_string();
            let deadline = body[idx + "| deadline:".len()..].trim().to_string();
            (content, if deadline.is_empty() { None } else { Some(deadline) })
        }
        None => (body.to_string(), None),
    }
}

/// `[MEMORY:(type:)?(confidence:)?content]` — `type` and `confidence` are
/// optional leading `key:value` segments, each terminated by the colon that
/// starts the next segment (or by end of string if `content` itself has no
/// colon); anything left is the content.
fn parse_finding(body: &str) -> FindingIntent {
    let mut finding_type = "finding".to_string();
    let mut confidence = 0.7;
    let mut rest = body;

    loop {
        let Some(key_colon) = rest.find(':') else { break };
        let key = rest[..key_colon].trim();
        let lower_key = key.to_ascii_lowercase();
        if lower_key != "type" && lower_key != "confidence" {
            break;
        }

        let after_key = &rest[key_colon + 1..];
        let (value, remainder) = match after_key.find(':') {
            Some(value_colon) => (&after_key[..value_colon], &after_key[value_colon + 1..]),
            None => (after_key, ""),
        };

        if lower_key == "type" {
            finding_type = value.trim().to_string();
        } else if let Ok(parsed) = value.trim().parse::<f64>() {
            confidence = parsed;
        }
        rest = remainder;
    }

    FindingIntent {
        finding_type,
        confidence,
        content: rest.trim().to_string(),
    }
}

fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_streak = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_streak += 1;
            if blank_streak > 1 {
                continue;
            }
        } else {
            blank_streak = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_markers_map_to_visibility() {
        let r = extract("Sure. [REMEMBER: likes tea] [REMEMBER-PRIVATE: ssn is secret] [REMEMBER-GLOBAL: company holiday is dec 25]");
        assert_eq!(r.memory_intents.len(), 3);
        assert_eq!(r.memory_intents[0].visibility, Visibility::Shared);
        assert_eq!(r.memory_intents[1].visibility, Visibility::Private);
        assert_eq!(r.memory_intents[2].visibility, Visibility::Global);
        assert!(!r.cleaned_text.contains('['));
    }

    #[test]
    fn goal_marker_parses_optional_deadline() {
        let r = extract("[GOAL: finish the report | DEADLINE: 2026-08-01]");
        assert_eq!(r.goal_intents.len(), 1);
        assert_eq!(r.goal_intents[0].content, "finish the report");
        assert_eq!(r.goal_intents[0].deadline.as_deref(), Some("2026-08-01"));
    }

    #[test]
    fn goal_marker_without_deadline_leaves_it_none() {
        let r = extract("[GOAL: water the plants]");
        assert_eq!(r.goal_intents[0].deadline, None);
    }

    #[test]
    fn done_marker_captures_search_text() {
        let r = extract("[DONE: search water the plants]");
        assert_eq!(r.done_intents[0].search, "water the plants");
    }

    #[test]
    fn memory_marker_defaults_type_and_confidence() {
        let r = extract("[MEMORY: the build takes 12 minutes]");
        assert_eq!(r.findings[0].finding_type, "finding");
        assert_eq!(r.findings[0].confidence, 0.7);
        assert_eq!(r.findings[0].content, "the build takes 12 minutes");
    }

    #[test]
    fn memory_marker_honours_explicit_type_and_confidence() {
        let r = extract("[MEMORY:type:risk:confidence:0.9:the deploy window is narrow]");
        assert_eq!(r.findings[0].finding_type, "risk");
        assert_eq!(r.findings[0].confidence, 0.9);
        assert_eq!(r.findings[0].content, "the deploy window is narrow");
    }

    #[test]
    fn confirm_marker_produces_confirmation_without_delivering_it() {
        let r = extract("About to do something. [CONFIRM: restart the database]");
        assert_eq!(r.confirmations.len(), 1);
        assert_eq!(r.confirmations[0].description, "restart the database");
        assert!(!r.cleaned_text.contains("CONFIRM"));
    }

    #[test]
    fn playbook_command_is_stripped_and_invisible() {
        let r = extract("All done.\nELLIE::RUN_DEPLOY staging");
        assert_eq!(r.playbook_commands, vec!["RUN_DEPLOY staging"]);
        assert!(!r.cleaned_text.contains("ELLIE"));
    }

    #[test]
    fn markers_are_case_insensitive() {
        let r = extract("[remember: likes jazz]");
        assert_eq!(r.memory_intents.len(), 1);
        assert_eq!(r.memory_intents[0].content, "likes jazz");
    }

    #[test]
    fn unrecognised_brackets_are_left_untouched() {
        let r = extract("see section [3.2] for details");
        assert_eq!(r.cleaned_text, "see section [3.2] for details");
        assert!(r.memory_intents.is_empty());
    }

    #[test]
    fn plain_text_round_trips_unchanged() {
        let r = extract("just a normal reply with no markers at all");
        assert_eq!(r.cleaned_text, "just a normal reply with no markers at all");
    }
}
