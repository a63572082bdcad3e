pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod session;

pub use error::{ModelError, Result};
pub use gateway::{InvokeOptions, ModelGateway};
pub use pipeline::{
    AgentRouter, CombinedFetcher, ContextAssembler, ContextFetcher, ExecutionMode, FragmentSlot,
    GeneralAgentRouter, MemoryFetchKind, MemoryFetcher, ModelInvoker, MultiStepOrchestrator,
    MultiStepOutcome, NoopFetcher, PipelineConfig, ResponsePipeline, StaticFragments, TurnOutcome,
};
pub use session::{ModelSession, SessionStore};
