//! Context and result types shared by every tool implementation.

use neural_config::Config;
use neural_execution::CodeExecutor;
use neural_providers::ModelCatalog;
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialStore;
use crate::event_sink::EventSink;
use crate::onboarding::OnboardingStore;
use crate::render_output::{ReadScreenUsage, RenderLimits, RenderOutputState};
use crate::tools::web_search::WebSearch;
use crate::workspace::WorkspaceSandbox;

/// Context passed to tool executors containing the per-turn state.
pub struct ToolContext<'a> {
    pub config: &'a Config,
    pub session_id: &'a str,
    pub app_context: &'a str,
    /// Owns the sandbox; replaced when the workspace root moves
    pub onboarding: &'a mut OnboardingStore,
    pub onboarding_gated: bool,
    pub render: &'a mut RenderOutputState,
    pub read_usage: &'a mut ReadScreenUsage,
    pub render_limits: &'a RenderLimits,
    pub credentials: &'a dyn CredentialStore,
    pub catalog: &'a dyn ModelCatalog,
    pub web_search: Option<&'a dyn WebSearch>,
    pub executor: &'a CodeExecutor,
    pub events: &'a dyn EventSink,
    pub cancel: &'a CancellationToken,
}

impl<'a> ToolContext<'a> {
    pub fn sandbox(&self) -> &WorkspaceSandbox {
        self.onboarding.sandbox()
    }
}

/// Text returned to the model for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}
