//! Tool dispatch module - routes tool calls to their implementations.
//!
//! Raw provider tool calls are parsed into the closed [`ToolInvocation`] enum,
//! one argument struct per tool, before anything runs. Unknown names, bad
//! arguments and onboarding-blocked tools all come back as failed tool
//! results so the loop can continue.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::onboarding::tool_allowed_during_onboarding;
use crate::tools::executor::{ToolContext, ToolOutput};
use crate::tools::file_ops::{EditArgs, ReadArgs, WriteArgs};
use crate::tools::onboarding::{ModelPreferencesArgs, NoArgs, SaveCredentialArgs, SetWorkspaceRootArgs};
use crate::tools::screen::{EmitScreenArgs, ReadScreenArgs};
use crate::tools::shell::BashArgs;
use crate::tools::web_search::WebSearchArgs;
use crate::tools::{file_ops, onboarding, screen, shell, web_search};
use neural_providers::ToolCall;

/// Every tool name the dispatcher knows.
pub const KNOWN_TOOLS: [&str; 12] = [
    "emit_screen",
    "read_screen",
    "read",
    "write",
    "edit",
    "bash",
    "web_search",
    "onboarding_get_state",
    "onboarding_set_workspace_root",
    "save_provider_credential",
    "onboarding_set_model_preferences",
    "onboarding_complete",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolInvocation {
    EmitScreen(EmitScreenArgs),
    ReadScreen(ReadScreenArgs),
    Read(ReadArgs),
    Write(WriteArgs),
    Edit(EditArgs),
    Bash(BashArgs),
    WebSearch(WebSearchArgs),
    OnboardingGetState(NoArgs),
    OnboardingSetWorkspaceRoot(SetWorkspaceRootArgs),
    SaveProviderCredential(SaveCredentialArgs),
    OnboardingSetModelPreferences(ModelPreferencesArgs),
    OnboardingComplete(NoArgs),
}

impl ToolInvocation {
    /// Parse a provider tool call. Missing or null arguments count as `{}`.
    pub fn parse(call: &ToolCall) -> Result<Self, String> {
        if !KNOWN_TOOLS.contains(&call.tool.as_str()) {
            return Err(format!("Unknown tool '{}'", call.tool));
        }
        let args = if call.args.is_null() {
            json!({})
        } else {
            call.args.clone()
        };
        serde_json::from_value(json!({ "tool": call.tool, "args": args }))
            .map_err(|e| format!("Invalid arguments for '{}': {}", call.tool, e))
    }
}

/// Dispatch a tool call to the appropriate handler.
pub async fn dispatch_tool(tool_call: &ToolCall, ctx: &mut ToolContext<'_>) -> ToolOutput {
    debug!("Dispatching tool: {}", tool_call.tool);

    if ctx.onboarding_gated && !tool_allowed_during_onboarding(&tool_call.tool) {
        warn!("Blocked tool '{}' during onboarding", tool_call.tool);
        return ToolOutput::error(format!(
            "Tool '{}' is blocked during required onboarding",
            tool_call.tool
        ));
    }

    let invocation = match ToolInvocation::parse(tool_call) {
        Ok(invocation) => invocation,
        Err(message) => {
            warn!("{}", message);
            return ToolOutput::error(message);
        }
    };

    if ctx.cancel.is_cancelled() {
        return ToolOutput::error("Cancelled before the tool ran");
    }

    match invocation {
        // Screen
        ToolInvocation::EmitScreen(args) => screen::execute_emit_screen(&args, ctx),
        ToolInvocation::ReadScreen(args) => screen::execute_read_screen(&args, ctx),

        // File operations
        ToolInvocation::Read(args) => file_ops::execute_read(&args, ctx).await,
        ToolInvocation::Write(args) => file_ops::execute_write(&args, ctx).await,
        ToolInvocation::Edit(args) => file_ops::execute_edit(&args, ctx).await,

        ToolInvocation::Bash(args) => shell::execute_bash(&args, ctx).await,
        ToolInvocation::WebSearch(args) => web_search::execute_web_search(&args, ctx).await,

        // Onboarding
        ToolInvocation::OnboardingGetState(_) => onboarding::execute_get_state(ctx),
        ToolInvocation::OnboardingSetWorkspaceRoot(args) => onboarding::execute_set_workspace_root(&args, ctx),
        ToolInvocation::SaveProviderCredential(args) => onboarding::execute_save_credential(&args, ctx),
        ToolInvocation::OnboardingSetModelPreferences(args) => {
            onboarding::execute_set_model_preferences(&args, ctx)
        }
        ToolInvocation::OnboardingComplete(_) => onboarding::execute_complete(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentialStore;
    use crate::event_sink::{CollectingEventSink, EngineEvent};
    use crate::onboarding::OnboardingStore;
    use crate::render_output::{ReadMode, ReadScreenUsage, RenderLimits, RenderOutputState};
    use crate::workspace::{WorkspacePolicy, WorkspaceSandbox};
    use neural_config::Config;
    use neural_execution::CodeExecutor;
    use neural_providers::StaticModelCatalog;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn call(tool: &str, args: Value) -> ToolCall {
        ToolCall {
            id: format!("call_{}", tool),
            tool: tool.to_string(),
            args,
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: Config,
        onboarding: OnboardingStore,
        render: RenderOutputState,
        read_usage: ReadScreenUsage,
        limits: RenderLimits,
        credentials: InMemoryCredentialStore,
        catalog: StaticModelCatalog,
        executor: CodeExecutor,
        events: CollectingEventSink,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let policy = WorkspacePolicy {
                default_root: dir.path().to_path_buf(),
                allowed_roots: Vec::new(),
            };
            let sandbox = WorkspaceSandbox::open(None, &policy).unwrap();
            Self {
                _dir: dir,
                config: Config::default(),
                onboarding: OnboardingStore::new(sandbox),
                render: RenderOutputState::new(),
                read_usage: ReadScreenUsage::default(),
                limits: RenderLimits::default(),
                credentials: InMemoryCredentialStore::new(),
                catalog: StaticModelCatalog::new(),
                executor: CodeExecutor::new(),
                events: CollectingEventSink::new(),
                cancel: CancellationToken::new(),
            }
        }

        async fn run(&mut self, gated: bool, tool_call: &ToolCall) -> ToolOutput {
            let mut ctx = ToolContext {
                config: &self.config,
                session_id: "s1",
                app_context: "notes",
                onboarding: &mut self.onboarding,
                onboarding_gated: gated,
                render: &mut self.render,
                read_usage: &mut self.read_usage,
                render_limits: &self.limits,
                credentials: &self.credentials,
                catalog: &self.catalog,
                web_search: None,
                executor: &self.executor,
                events: &self.events,
                cancel: &self.cancel,
            };
            dispatch_tool(tool_call, &mut ctx).await
        }
    }

    #[test]
    fn test_parse_per_variant() {
        let parsed = ToolInvocation::parse(&call("read_screen", Value::Null)).unwrap();
        assert_eq!(parsed, ToolInvocation::ReadScreen(ReadScreenArgs::default()));

        let parsed = ToolInvocation::parse(&call(
            "read_screen",
            json!({ "mode": "outline", "recovery": true }),
        ))
        .unwrap();
        match parsed {
            ToolInvocation::ReadScreen(args) => {
                assert_eq!(args.mode, ReadMode::Outline);
                assert!(args.recovery);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            ToolInvocation::parse(&call("onboarding_complete", json!({}))),
            Ok(ToolInvocation::OnboardingComplete(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        let err = ToolInvocation::parse(&call("rm_rf", json!({}))).unwrap_err();
        assert_eq!(err, "Unknown tool 'rm_rf'");

        let err = ToolInvocation::parse(&call("write", json!({ "path": "a.txt" }))).unwrap_err();
        assert!(err.starts_with("Invalid arguments for 'write'"), "{}", err);
    }

    #[tokio::test]
    async fn test_onboarding_gate_blocks_before_parsing() {
        let mut fx = Fixture::new();
        let output = fx.run(true, &call("bash", json!({ "command": "ls" }))).await;
        assert!(output.is_error);
        assert_eq!(output.text, "Tool 'bash' is blocked during required onboarding");

        let output = fx.run(true, &call("onboarding_get_state", Value::Null)).await;
        assert!(!output.is_error, "{}", output.text);
    }

    #[tokio::test]
    async fn test_write_then_read_inside_workspace() {
        let mut fx = Fixture::new();
        let output = fx
            .run(false, &call("write", json!({ "path": "notes/a.txt", "content": "one\ntwo\nthree" })))
            .await;
        assert!(!output.is_error, "{}", output.text);

        let output = fx
            .run(false, &call("read", json!({ "path": "notes/a.txt", "offset": 2, "limit": 1 })))
            .await;
        assert_eq!(output.text, "two\n[lines 2-2 of 3]");

        let output = fx.run(false, &call("read", json!({ "path": "../outside.txt" }))).await;
        assert!(output.is_error);
        assert!(output.text.starts_with("[path_escape]"), "{}", output.text);
    }

    #[tokio::test]
    async fn test_read_with_oversized_limit_stops_at_end_of_file() {
        let mut fx = Fixture::new();
        fx.run(false, &call("write", json!({ "path": "a.txt", "content": "one\ntwo\nthree" })))
            .await;

        let output = fx
            .run(false, &call("read", json!({ "path": "a.txt", "offset": 2, "limit": u64::MAX })))
            .await;
        assert!(!output.is_error, "{}", output.text);
        assert_eq!(output.text, "two\nthree\n[lines 2-3 of 3]");
    }

    #[tokio::test]
    async fn test_edit_requires_unique_match() {
        let mut fx = Fixture::new();
        fx.run(false, &call("write", json!({ "path": "a.md", "content": "x x" }))).await;

        let output = fx
            .run(false, &call("edit", json!({ "path": "a.md", "old_text": "x", "new_text": "y" })))
            .await;
        assert!(output.is_error);
        assert!(output.text.contains("matches 2 times"));

        let output = fx
            .run(
                false,
                &call("edit", json!({ "path": "a.md", "old_text": "x", "new_text": "y", "replace_all": true })),
            )
            .await;
        assert!(!output.is_error, "{}", output.text);
        let content = std::fs::read_to_string(fx.onboarding.sandbox().root().join("a.md")).unwrap();
        assert_eq!(content, "y y");
    }

    #[tokio::test]
    async fn test_secret_is_never_written() {
        let mut fx = Fixture::new();
        let output = fx
            .run(
                false,
                &call("write", json!({ "path": "env.txt", "content": "OPENAI_API_KEY=sk-abcdefghijklmnopqrstuvwxyz123456" })),
            )
            .await;
        assert!(output.is_error);
        assert!(output.text.contains("save_provider_credential"));
        assert!(!fx.onboarding.sandbox().root().join("env.txt").exists());
    }

    #[tokio::test]
    async fn test_memory_write_seeds_checkpoint_during_onboarding() {
        let mut fx = Fixture::new();
        fx.run(true, &call("write", json!({ "path": "MEMORY.md", "content": "# Memory\n" })))
            .await;
        assert!(fx.onboarding.load().unwrap().checkpoints.memory_seeded);
    }

    #[tokio::test]
    async fn test_emit_screen_emits_revision_event() {
        let mut fx = Fixture::new();
        let output = fx
            .run(false, &call("emit_screen", json!({ "html": "<main>hi</main>", "is_final": true })))
            .await;
        assert_eq!(output.text, "Published revision 1 (final)");

        let output = fx.run(false, &call("emit_screen", json!({ "html": "" }))).await;
        assert!(output.is_error);
        assert_eq!(fx.render.render_count(), 1);

        assert_eq!(fx.events.revisions(), vec![1]);
        match &fx.events.events()[0] {
            EngineEvent::RenderOutput { app_id, .. } => assert_eq!(app_id.as_deref(), Some("notes")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_credential_marks_provider_ready() {
        let mut fx = Fixture::new();
        let output = fx
            .run(
                true,
                &call("save_provider_credential", json!({ "provider_id": "openai", "api_key": "sk-test" })),
            )
            .await;
        assert!(!output.is_error, "{}", output.text);
        assert!(!output.text.contains("sk-test"));
        assert!(fx.onboarding.load().unwrap().checkpoints.provider_ready);
        assert_eq!(
            crate::credentials::CredentialStore::resolve_api_key(&fx.credentials, "s1", "openai").as_deref(),
            Some("sk-test")
        );
    }

    #[tokio::test]
    async fn test_complete_lifts_gate_only_when_ready() {
        let mut fx = Fixture::new();
        let output = fx.run(true, &call("onboarding_complete", Value::Null)).await;
        assert!(output.is_error);
        assert!(output.text.contains("workspace_ready"));
    }
}
