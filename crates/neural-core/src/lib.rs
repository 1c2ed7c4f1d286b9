pub mod compaction;
pub mod context_lane;
pub mod credentials;
pub mod engine;
pub mod error_handling;
pub mod event_sink;
pub mod interaction;
pub mod lane_store;
pub mod memory_notes;
pub mod onboarding;
pub mod paths;
pub mod prompts;
pub mod render_output;
pub mod secret_guard;
pub mod state_capture;
pub mod streaming;
pub mod telemetry;
pub mod tool_definitions;
pub mod tool_dispatch;
pub mod tools;
pub mod workspace;

pub use compaction::{CompactionResult, CompactionSettings, LaneCompactor, ProviderSummarizer, Summarizer};
pub use context_lane::{ContextLane, LaneEstimate, LaneKey, Turn};
pub use credentials::{CredentialStore, InMemoryCredentialStore};
pub use engine::{
    catalog_from_config, Engine, OpenAIProviderFactory, ProviderFactory, StaticProviderFactory, TurnReport,
    TurnRequest,
};
pub use event_sink::{ChannelEventSink, CollectingEventSink, EngineEvent, EventSink, NullEventSink};
pub use interaction::{Interaction, Viewport};
pub use lane_store::ContextLaneStore;
pub use onboarding::{Checkpoint, Lifecycle, OnboardingError, OnboardingState, OnboardingStore};
pub use render_output::{ReadMode, RenderOutputState};
pub use secret_guard::looks_sensitive_secret;
pub use streaming::TurnOutcome;
pub use telemetry::{NullTelemetry, TelemetryRecord, TelemetrySink, TracingTelemetry};
pub use workspace::{SandboxError, SandboxErrorCode, WorkspacePolicy, WorkspaceSandbox};
