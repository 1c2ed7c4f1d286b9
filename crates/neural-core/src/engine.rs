//! The per-request tool loop.
//!
//! [`Engine::run_turn`] drives one interaction to a named terminal state:
//! it prepares the workspace and onboarding gate, compacts memory ahead of
//! the request when needed, streams the model, dispatches tool calls, and
//! recovers once from context overflow and once from a missing publish.

use anyhow::{Context, Result};
use neural_config::Config;
use neural_execution::CodeExecutor;
use neural_providers::{
    AssistantMessage, CompletionRequest, LLMProvider, Message, ModelCatalog, ModelInfo,
    OpenAIProvider, ProviderInfo, StaticModelCatalog, StopReason,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionResult, CompactionSettings, LaneCompactor, ProviderSummarizer};
use crate::context_lane::{LaneKey, Turn};
use crate::credentials::{CredentialStore, InMemoryCredentialStore};
use crate::error_handling::{classify_error, retry_with_backoff, ErrorContext, ErrorType, RecoverableError};
use crate::event_sink::{EngineEvent, EventSink};
use crate::interaction::{Interaction, Viewport};
use crate::lane_store::ContextLaneStore;
use crate::memory_notes::scaffold_workspace;
use crate::onboarding::{Checkpoint, OnboardingError, OnboardingStore, ONBOARDING_APP_CONTEXT};
use crate::prompts;
use crate::render_output::{ReadScreenUsage, RenderLimits, RenderOutputState};
use crate::state_capture::{capture_state_summary, TurnFacts};
use crate::streaming::{consume_stream, StreamOutcome, StreamingState, TurnOutcome};
use crate::telemetry::{TelemetryRecord, TelemetrySink, TracingTelemetry};
use crate::tool_definitions::{create_tool_definitions, ToolConfig};
use crate::tool_dispatch::dispatch_tool;
use crate::tools::executor::ToolContext;
use crate::tools::web_search::{BraveSearch, WebSearch};
use crate::workspace::{SandboxError, WorkspacePolicy, WorkspaceSandbox};

/// App context used when neither the request nor the interaction names one.
pub const DEFAULT_APP_CONTEXT: &str = "default";

/// Builds a provider for a (provider, model, api key) triple.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, provider_id: &str, model_id: &str, api_key: Option<String>) -> Result<Arc<dyn LLMProvider>>;
}

/// Always hands out the same provider; used for tests and embedding.
pub struct StaticProviderFactory {
    provider: Arc<dyn LLMProvider>,
}

impl StaticProviderFactory {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }
}

impl ProviderFactory for StaticProviderFactory {
    fn create(&self, _provider_id: &str, _model_id: &str, _api_key: Option<String>) -> Result<Arc<dyn LLMProvider>> {
        Ok(self.provider.clone())
    }
}

/// Builds OpenAI-compatible providers from the `providers` config section.
pub struct OpenAIProviderFactory {
    config: Config,
}

impl OpenAIProviderFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ProviderFactory for OpenAIProviderFactory {
    fn create(&self, provider_id: &str, model_id: &str, api_key: Option<String>) -> Result<Arc<dyn LLMProvider>> {
        self.config.validate_provider_reference(provider_id)?;
        let settings = self
            .config
            .provider(provider_id)
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' is not configured", provider_id))?;
        let api_key = api_key
            .or_else(|| settings.api_key.clone())
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No API key available for provider '{}'", provider_id))?;

        let provider = OpenAIProvider::new_with_name(
            provider_id.to_string(),
            api_key,
            Some(model_id.to_string()),
            settings.base_url.clone(),
            settings.max_tokens,
            settings.temperature,
        )?
        .with_context_window(Some(self.config.context_window_for(provider_id, model_id)));
        Ok(Arc::new(provider))
    }
}

/// Model catalog built from the configured providers.
pub fn catalog_from_config(config: &Config) -> StaticModelCatalog {
    let mut ids: Vec<&String> = config.providers.openai_compatible.keys().collect();
    ids.sort();

    let mut catalog = StaticModelCatalog::new();
    for id in ids {
        let settings = &config.providers.openai_compatible[id];
        catalog = catalog.with_provider(ProviderInfo {
            id: id.clone(),
            display_name: id.clone(),
            base_url: settings.base_url.clone(),
        });
        for model in &settings.models {
            catalog = catalog.with_model(ModelInfo {
                provider_id: id.clone(),
                id: model.id.clone(),
                context_window: model.context_window,
                max_output_tokens: model.max_output_tokens,
            });
        }
    }
    catalog
}

fn sandbox_error(error: &anyhow::Error) -> Option<&SandboxError> {
    if let Some(sandbox) = error.downcast_ref::<SandboxError>() {
        return Some(sandbox);
    }
    match error.downcast_ref::<OnboardingError>() {
        Some(OnboardingError::Sandbox(sandbox)) => Some(sandbox),
        _ => None,
    }
}

/// One inbound request.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub interaction: Interaction,
    /// Overrides the interaction's app context
    pub app_context: Option<String>,
    pub viewport: Option<Viewport>,
    /// The client's last known screen
    pub previous_html: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub reopen_onboarding: bool,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, interaction: Interaction) -> Self {
        Self {
            session_id: session_id.into(),
            interaction,
            app_context: None,
            viewport: None,
            previous_html: None,
            workspace_root: None,
            provider_id: None,
            model_id: None,
            reopen_onboarding: false,
        }
    }
}

/// What happened during a turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub text: String,
    pub revisions: u32,
    pub iterations: u32,
    pub tool_calls: u32,
    pub app_context: String,
    /// Workspace root at the end of the turn
    pub workspace_root: Option<PathBuf>,
    pub error: Option<String>,
}

impl TurnReport {
    fn failed(app_context: String, message: String) -> Self {
        Self {
            outcome: TurnOutcome::Failed,
            text: String::new(),
            revisions: 0,
            iterations: 0,
            tool_calls: 0,
            app_context,
            workspace_root: None,
            error: Some(message),
        }
    }
}

/// Loop states. Each step consumes the current phase and yields the next.
enum LoopPhase {
    Request,
    ExecuteTools(AssistantMessage),
    RecoverOverflow,
    CheckPublish,
    Finished(TurnOutcome, Option<String>),
}

/// Per-turn values fixed before the loop starts.
struct TurnSetup {
    key: LaneKey,
    provider: Arc<dyn LLMProvider>,
    compactor: LaneCompactor,
    turn_prompt: String,
    publish_required: bool,
}

/// Owns the shared stores and runs turns against them.
pub struct Engine {
    config: Config,
    policy: WorkspacePolicy,
    providers: Arc<dyn ProviderFactory>,
    catalog: Arc<dyn ModelCatalog>,
    credentials: Arc<dyn CredentialStore>,
    lanes: Arc<ContextLaneStore>,
    web_search: Option<Arc<dyn WebSearch>>,
    telemetry: Arc<dyn TelemetrySink>,
    executor: CodeExecutor,
}

impl Engine {
    pub fn new(config: Config, providers: Arc<dyn ProviderFactory>) -> Self {
        let web_search: Option<Arc<dyn WebSearch>> = match BraveSearch::from_config(&config.web_search) {
            Ok(search) => search.map(|s| Arc::new(s) as Arc<dyn WebSearch>),
            Err(e) => {
                warn!("Web search unavailable: {:#}", e);
                None
            }
        };
        Self {
            policy: WorkspacePolicy::from_config(&config),
            catalog: Arc::new(catalog_from_config(&config)),
            config,
            providers,
            credentials: Arc::new(InMemoryCredentialStore::new()),
            lanes: Arc::new(ContextLaneStore::new()),
            web_search,
            telemetry: Arc::new(TracingTelemetry),
            executor: CodeExecutor::new(),
        }
    }

    pub fn with_policy(mut self, policy: WorkspacePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_web_search(mut self, web_search: Option<Arc<dyn WebSearch>>) -> Self {
        self.web_search = web_search;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lanes(&self) -> &Arc<ContextLaneStore> {
        &self.lanes
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Run one turn to completion. Never fails: every error becomes a terminal outcome.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: &dyn EventSink,
        cancel: CancellationToken,
    ) -> TurnReport {
        let fallback_app = self.requested_app_context(&request);
        match self.run_turn_inner(&request, events, &cancel).await {
            Ok(report) => report,
            Err(e) => {
                let (code, message) = match sandbox_error(&e) {
                    Some(sandbox) => (sandbox.code.as_str().to_string(), sandbox.to_string()),
                    None => {
                        error!(session = %request.session_id, "Turn failed: {:#}", e);
                        (
                            TurnOutcome::Failed.as_str().to_string(),
                            "The request could not be completed".to_string(),
                        )
                    }
                };
                events.emit(EngineEvent::Error {
                    code,
                    message: message.clone(),
                });
                events.emit(EngineEvent::Done {
                    outcome: TurnOutcome::Failed.as_str().to_string(),
                    text: String::new(),
                    revisions: 0,
                });
                TurnReport::failed(fallback_app, message)
            }
        }
    }

    fn requested_app_context(&self, request: &TurnRequest) -> String {
        request
            .app_context
            .clone()
            .or_else(|| request.interaction.app_context_id.clone())
            .filter(|app| !app.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_APP_CONTEXT.to_string())
    }

    async fn run_turn_inner(
        &self,
        request: &TurnRequest,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnReport> {
        let sandbox = WorkspaceSandbox::open(request.workspace_root.as_deref(), &self.policy)?;
        if let Err(e) = scaffold_workspace(&sandbox) {
            warn!("Failed to scaffold workspace {}: {:#}", sandbox.root().display(), e);
        }

        let mut onboarding = OnboardingStore::new(sandbox.clone());
        let mut state = onboarding.load()?;
        if request.reopen_onboarding {
            state = onboarding.reopen()?;
        }
        let mut gated = state.is_gated();
        if gated {
            state = onboarding.start_run(false)?;
        }
        let app_context = if gated {
            ONBOARDING_APP_CONTEXT.to_string()
        } else {
            self.requested_app_context(request)
        };

        let provider_id = request
            .provider_id
            .clone()
            .or_else(|| state.provider_id.clone())
            .unwrap_or_else(|| self.config.providers.default_provider.clone());
        let model_id = request
            .model_id
            .clone()
            .or_else(|| state.model_id.clone())
            .unwrap_or_else(|| self.config.providers.default_model.clone());
        let api_key = self
            .credentials
            .resolve_api_key(&request.session_id, &provider_id)
            .or_else(|| self.config.provider(&provider_id).and_then(|p| p.api_key.clone()));
        if gated && api_key.is_some() && !state.checkpoints.provider_ready {
            onboarding.set_checkpoint(Checkpoint::ProviderReady, true)?;
        }
        let provider = self
            .providers
            .create(&provider_id, &model_id, api_key)
            .with_context(|| format!("Failed to create provider '{}'", provider_id))?;

        let context_window = self
            .catalog
            .get_model(&provider_id, &model_id)
            .map(|m| m.context_window)
            .or_else(|| provider.context_window_size())
            .unwrap_or(self.config.memory.default_context_window);
        let settings = CompactionSettings::from_config(&self.config.memory, context_window);
        let compactor = LaneCompactor::new(
            self.lanes.clone(),
            Arc::new(ProviderSummarizer::new(provider.clone())),
            settings,
            Some(sandbox.clone()),
        );

        let key = LaneKey::new(request.session_id.clone(), app_context.clone());
        let turn_prompt = prompts::turn_prompt(
            &request.interaction,
            &app_context,
            request.viewport.as_ref(),
            request.previous_html.as_deref(),
        );
        info!(
            session = %request.session_id,
            app = %app_context,
            provider = %provider_id,
            model = %model_id,
            onboarding = gated,
            "Starting turn: {}",
            request.interaction.describe()
        );

        let setup = TurnSetup {
            publish_required: !self
                .config
                .render
                .publish_exempt_apps
                .iter()
                .any(|app| app == &app_context),
            key,
            provider,
            compactor,
            turn_prompt,
        };

        if let Err(e) = self.preflight_compaction(&setup, cancel).await {
            if cancel.is_cancelled() {
                events.emit(EngineEvent::Done {
                    outcome: TurnOutcome::Cancelled.as_str().to_string(),
                    text: String::new(),
                    revisions: 0,
                });
                return Ok(self.report(TurnOutcome::Cancelled, &StreamingState::new(), 0, &app_context, &onboarding, None));
            }
            return Err(e);
        }

        let mut render = RenderOutputState::seeded(request.previous_html.clone());
        let mut read_usage = ReadScreenUsage::default();
        let render_limits = RenderLimits::from_config(&self.config.render);
        let mut stream_state = StreamingState::new();

        let mut messages = self.initial_messages(&setup, gated, None);
        let mut phase = LoopPhase::Request;
        let (outcome, error_message) = loop {
            phase = match phase {
                LoopPhase::Finished(outcome, message) => break (outcome, message),

                LoopPhase::Request => {
                    if cancel.is_cancelled() {
                        LoopPhase::Finished(TurnOutcome::Cancelled, None)
                    } else {
                        stream_state.iteration_count += 1;
                        self.request_step(&setup, &request.session_id, &messages, gated, &mut stream_state, events, cancel)
                            .await
                    }
                }

                LoopPhase::ExecuteTools(message) => {
                    messages.push(Message::assistant_with_tools(
                        message.content.clone(),
                        message.tool_calls.clone(),
                    ));
                    let mut cancelled = false;
                    for call in &message.tool_calls {
                        if cancel.is_cancelled() {
                            cancelled = true;
                            break;
                        }
                        let mut ctx = ToolContext {
                            config: &self.config,
                            session_id: &request.session_id,
                            app_context: &app_context,
                            onboarding: &mut onboarding,
                            onboarding_gated: gated,
                            render: &mut render,
                            read_usage: &mut read_usage,
                            render_limits: &render_limits,
                            credentials: self.credentials.as_ref(),
                            catalog: self.catalog.as_ref(),
                            web_search: self.web_search.as_deref(),
                            executor: &self.executor,
                            events,
                            cancel,
                        };
                        let output = dispatch_tool(call, &mut ctx).await;
                        gated = ctx.onboarding_gated;

                        stream_state.record_tool(&call.tool);
                        events.emit(EngineEvent::ToolCallResult {
                            id: call.id.clone(),
                            name: call.tool.clone(),
                            is_error: output.is_error,
                            text: output.text.clone(),
                        });
                        messages.push(Message::tool_result(&call.id, output.text, output.is_error));
                    }
                    if cancelled {
                        LoopPhase::Finished(TurnOutcome::Cancelled, None)
                    } else {
                        LoopPhase::Request
                    }
                }

                LoopPhase::RecoverOverflow => {
                    stream_state.overflow_retry_used = true;
                    warn!("Context overflow in lane {}, compacting and retrying once", setup.key);
                    match setup.compactor.compact_now(&setup.key, cancel).await {
                        Ok(result) if result.freed_room() => {
                            self.record_compaction(&setup.key, &result);
                            let correction = stream_state
                                .publish_retry_used
                                .then_some(prompts::MISSING_PUBLISH_CORRECTION);
                            messages[1] = Message::user(self.user_message(&setup, correction));
                            LoopPhase::Request
                        }
                        Ok(_) => LoopPhase::Finished(
                            TurnOutcome::OverflowFailed,
                            Some("Context window exceeded and compaction freed no room".to_string()),
                        ),
                        Err(_) if cancel.is_cancelled() => LoopPhase::Finished(TurnOutcome::Cancelled, None),
                        Err(e) => LoopPhase::Finished(TurnOutcome::OverflowFailed, Some(e.to_string())),
                    }
                }

                LoopPhase::CheckPublish => {
                    if !setup.publish_required || render.published_this_turn() {
                        LoopPhase::Finished(TurnOutcome::Done, None)
                    } else if !stream_state.publish_retry_used {
                        stream_state.publish_retry_used = true;
                        warn!("Turn ended without publishing a screen, retrying with a correction");
                        messages = self.initial_messages(&setup, gated, Some(prompts::MISSING_PUBLISH_CORRECTION));
                        LoopPhase::Request
                    } else {
                        LoopPhase::Finished(
                            TurnOutcome::MissingPublishFailed,
                            Some("The assistant did not publish a screen".to_string()),
                        )
                    }
                }
            };
        };

        self.finish_turn(
            request,
            &setup,
            outcome,
            error_message,
            &stream_state,
            &render,
            &app_context,
            &onboarding,
            gated,
            events,
        )
        .await
    }

    /// Compact ahead of the request when the lane plus this prompt is over threshold.
    async fn preflight_compaction(&self, setup: &TurnSetup, cancel: &CancellationToken) -> Result<()> {
        let settings = setup.compactor.settings();
        let estimate = self.lanes.estimate(
            &setup.key,
            &setup.turn_prompt,
            settings.context_window,
            settings.reserve_tokens,
        );
        if !estimate.over_threshold() {
            return Ok(());
        }

        info!(
            "Lane {} is over threshold ({} > {}), compacting before the request",
            setup.key, estimate.tokens, estimate.threshold
        );
        let result = setup.compactor.compact_now(&setup.key, cancel).await?;
        self.record_compaction(&setup.key, &result);

        let after = self.lanes.estimate(
            &setup.key,
            &setup.turn_prompt,
            settings.context_window,
            settings.reserve_tokens,
        );
        debug!("Lane {} estimate after compaction: {}", setup.key, after.tokens);
        Ok(())
    }

    fn user_message(&self, setup: &TurnSetup, correction: Option<&str>) -> String {
        let memory = self.lanes.render_memory(&setup.key);
        prompts::user_message(&memory, &setup.turn_prompt, correction)
    }

    fn initial_messages(&self, setup: &TurnSetup, gated: bool, correction: Option<&str>) -> Vec<Message> {
        vec![
            Message::system(prompts::system_prompt(gated)),
            Message::user(self.user_message(setup, correction)),
        ]
    }

    /// Open one provider stream and classify how it ended.
    #[allow(clippy::too_many_arguments)]
    async fn request_step(
        &self,
        setup: &TurnSetup,
        session_id: &str,
        messages: &[Message],
        gated: bool,
        stream_state: &mut StreamingState,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> LoopPhase {
        let provider = &setup.provider;
        let request = CompletionRequest {
            messages: messages.to_vec(),
            max_tokens: Some(self.config.agent.max_tokens),
            temperature: Some(provider.temperature()),
            stream: true,
            tools: Some(create_tool_definitions(ToolConfig {
                web_search: self.web_search.is_some(),
                onboarding_gated: gated,
            })),
        };
        let context_tokens = self
            .lanes
            .with_lane(&setup.key, |lane| lane.last_estimate.as_ref().map(|e| e.tokens).unwrap_or(0));
        let error_context = ErrorContext::new(
            "stream",
            provider.name(),
            provider.model(),
            session_id,
            &setup.key.app_context,
            context_tokens,
        );

        let opened = retry_with_backoff(
            "stream",
            || {
                let provider = provider.clone();
                let request = request.clone();
                async move { provider.stream(request).await }
            },
            &error_context,
            self.config.agent.max_retry_attempts,
            cancel,
        )
        .await;

        let stream = match opened {
            Ok(stream) => stream,
            Err(_) if cancel.is_cancelled() => return LoopPhase::Finished(TurnOutcome::Cancelled, None),
            Err(e) => {
                if classify_error(&e) == ErrorType::Recoverable(RecoverableError::ContextLengthExceeded) {
                    return self.on_overflow(stream_state, "");
                }
                return LoopPhase::Finished(TurnOutcome::ProviderError, Some(format!("{:#}", e)));
            }
        };

        let (message, streamed_text) = match consume_stream(stream, events, &self.config.render, cancel).await {
            Ok(StreamOutcome::Completed { message, streamed_text }) => (message, streamed_text),
            Ok(StreamOutcome::Cancelled) => return LoopPhase::Finished(TurnOutcome::Cancelled, None),
            Err(e) => {
                error_context.log_error(&e);
                return LoopPhase::Finished(TurnOutcome::ProviderError, Some(format!("{:#}", e)));
            }
        };

        stream_state.add_usage(message.usage.as_ref());
        if !message.content.is_empty() {
            if !stream_state.full_text.is_empty() {
                stream_state.full_text.push('\n');
            }
            stream_state.full_text.push_str(&message.content);
        }

        match message.stop_reason {
            StopReason::ToolUse if !message.tool_calls.is_empty() => LoopPhase::ExecuteTools(message),
            StopReason::ContextOverflow => self.on_overflow(stream_state, &streamed_text),
            StopReason::Error | StopReason::Aborted => {
                let detail = message
                    .error_message
                    .unwrap_or_else(|| format!("Provider stopped with {:?}", message.stop_reason));
                LoopPhase::Finished(TurnOutcome::ProviderError, Some(detail))
            }
            _ if !message.tool_calls.is_empty() => LoopPhase::ExecuteTools(message),
            _ => LoopPhase::CheckPublish,
        }
    }

    fn on_overflow(&self, stream_state: &StreamingState, streamed_text: &str) -> LoopPhase {
        if streamed_text.is_empty() && !stream_state.overflow_retry_used {
            LoopPhase::RecoverOverflow
        } else {
            LoopPhase::Finished(
                TurnOutcome::OverflowFailed,
                Some("Context window exceeded".to_string()),
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_turn(
        &self,
        request: &TurnRequest,
        setup: &TurnSetup,
        outcome: TurnOutcome,
        error_message: Option<String>,
        stream_state: &StreamingState,
        render: &RenderOutputState,
        app_context: &str,
        onboarding: &OnboardingStore,
        gated: bool,
        events: &dyn EventSink,
    ) -> Result<TurnReport> {
        if matches!(outcome, TurnOutcome::Done | TurnOutcome::MissingPublishFailed) {
            let facts = TurnFacts {
                interaction: request.interaction.describe(),
                output_chars: stream_state.full_text.chars().count(),
                revisions: render.render_count(),
                tools_used: stream_state.tools_used.clone(),
                final_text: stream_state.full_text.clone(),
            };
            let summary = capture_state_summary(
                setup.provider.as_ref(),
                &facts,
                self.config.agent.state_summary_max_tokens,
            )
            .await;
            let turn = Turn::new(
                app_context,
                facts.interaction,
                setup.turn_prompt.clone(),
                summary,
                stream_state.usage.clone(),
            );
            self.lanes
                .append_turn(&setup.key, turn, self.config.memory.usage_fraction);
        }
        if outcome != TurnOutcome::Cancelled {
            // onboarding may have moved the root during the turn
            setup
                .compactor
                .clone()
                .with_sandbox(onboarding.sandbox().clone())
                .schedule(setup.key.clone());
        }

        if let Some(message) = &error_message {
            warn!(session = %request.session_id, app = %app_context, "Turn ended with {}: {}", outcome, message);
            if gated {
                if let Err(e) = onboarding.record_error(message) {
                    warn!("Failed to record onboarding error: {}", e);
                }
            }
            events.emit(EngineEvent::Error {
                code: outcome.as_str().to_string(),
                message: message.clone(),
            });
        }
        events.emit(EngineEvent::Done {
            outcome: outcome.as_str().to_string(),
            text: stream_state.full_text.clone(),
            revisions: render.render_count(),
        });

        self.telemetry.record(TelemetryRecord::Turn {
            session_id: request.session_id.clone(),
            app_context: app_context.to_string(),
            outcome: outcome.as_str().to_string(),
            iterations: stream_state.iteration_count,
            revisions: render.render_count(),
            tool_calls: stream_state.tool_calls_executed,
            duration_ms: stream_state.elapsed().as_millis() as u64,
        });
        info!(
            session = %request.session_id,
            app = %app_context,
            iterations = stream_state.iteration_count,
            tool_calls = stream_state.tool_calls_executed,
            revisions = render.render_count(),
            "Turn finished: {}",
            outcome
        );

        Ok(self.report(
            outcome,
            stream_state,
            render.render_count(),
            app_context,
            onboarding,
            error_message,
        ))
    }

    fn report(
        &self,
        outcome: TurnOutcome,
        stream_state: &StreamingState,
        revisions: u32,
        app_context: &str,
        onboarding: &OnboardingStore,
        error: Option<String>,
    ) -> TurnReport {
        TurnReport {
            outcome,
            text: stream_state.full_text.clone(),
            revisions,
            iterations: stream_state.iteration_count,
            tool_calls: stream_state.tool_calls_executed,
            app_context: app_context.to_string(),
            workspace_root: Some(onboarding.sandbox().root().to_path_buf()),
            error,
        }
    }

    fn record_compaction(&self, key: &LaneKey, result: &CompactionResult) {
        if result.turns_dropped == 0 && !result.split_turn {
            return;
        }
        self.telemetry.record(TelemetryRecord::Compaction {
            session_id: key.session_id.clone(),
            app_context: key.app_context.clone(),
            turns_dropped: result.turns_dropped,
            tokens_before: result.tokens_before,
            tokens_after: result.tokens_after,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_from_config() {
        let catalog = catalog_from_config(&Config::default());
        let model = catalog.get_model("openai", "gpt-4o").unwrap();
        assert_eq!(model.context_window, 128_000);
        assert_eq!(catalog.list_providers().len(), 1);
    }

    #[test]
    fn test_openai_factory_requires_a_key() {
        let factory = OpenAIProviderFactory::new(Config::default());
        let err = factory.create("openai", "gpt-4o", None).err().unwrap();
        assert!(err.to_string().contains("No API key"), "{}", err);

        let provider = factory.create("openai", "gpt-4o", Some("sk-test".into())).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.context_window_size(), Some(128_000));

        assert!(factory.create("missing", "m", Some("k".into())).is_err());
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(TurnOutcome::MissingPublishFailed.as_str(), "missing_publish_failed");
        assert_eq!(TurnOutcome::OverflowFailed.to_string(), "overflow_failed");
    }
}
