//! Response Pipeline (§4.G) and its Context Assembler (§4.F).
//!
//! `context` gathers the fan-out/fan-in prompt fragments; `process` is the
//! single-turn orchestration that the Channel Dispatcher invokes through a
//! `relay_dispatcher::TurnHandler` for every dequeued inbound message.

pub mod context;
pub mod process;

pub use context::{
    CombinedFetcher, ContextAssembler, ContextFetcher, FragmentSlot, MemoryFetchKind,
    MemoryFetcher, NoopFetcher, StaticFragments,
};
pub use process::{
    AgentRouter, ExecutionMode, GeneralAgentRouter, ModelInvoker, MultiStepOrchestrator,
    MultiStepOutcome, PipelineConfig, ResponsePipeline, TurnOutcome,
};
