//! Onboarding tools: state inspection, workspace root, credentials, model
//! preferences and gated completion.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::memory_notes::scaffold_workspace;
use crate::onboarding::{Checkpoint, OnboardingState};

use super::executor::{ToolContext, ToolOutput};

/// Arguments for tools that take none.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NoArgs {}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetWorkspaceRootArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaveCredentialArgs {
    pub provider_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelPreferencesArgs {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default)]
    pub tool_tier: Option<String>,
}

fn state_output(state: &OnboardingState) -> ToolOutput {
    match serde_json::to_string_pretty(state) {
        Ok(json) => ToolOutput::ok(json),
        Err(e) => ToolOutput::error(format!("Failed to serialize onboarding state: {}", e)),
    }
}

/// Execute the `onboarding_get_state` tool.
pub fn execute_get_state(ctx: &ToolContext<'_>) -> ToolOutput {
    match ctx.onboarding.load() {
        Ok(state) => state_output(&state),
        Err(e) => ToolOutput::error(e.to_string()),
    }
}

/// Execute the `onboarding_set_workspace_root` tool.
pub fn execute_set_workspace_root(args: &SetWorkspaceRootArgs, ctx: &mut ToolContext<'_>) -> ToolOutput {
    let expanded = shellexpand::tilde(args.path.trim()).into_owned();
    let path = PathBuf::from(&expanded);
    if !path.is_absolute() {
        return ToolOutput::error(format!("Workspace root must be an absolute path, got '{}'", args.path));
    }

    let (store, state) = match ctx.onboarding.set_workspace_root(&path) {
        Ok(moved) => moved,
        Err(e) => {
            let message = e.to_string();
            if let Err(record) = ctx.onboarding.record_error(&message) {
                warn!("Failed to record onboarding error: {}", record);
            }
            return ToolOutput::error(message);
        }
    };
    *ctx.onboarding = store;
    info!("Workspace root is now {}", ctx.sandbox().root().display());

    if let Err(e) = scaffold_workspace(ctx.sandbox()) {
        warn!("Failed to scaffold new workspace root: {:#}", e);
    }
    state_output(&state)
}

/// Execute the `save_provider_credential` tool.
///
/// The key is stored for this session only and never echoed back.
pub fn execute_save_credential(args: &SaveCredentialArgs, ctx: &mut ToolContext<'_>) -> ToolOutput {
    let provider_id = args.provider_id.trim();
    if provider_id.is_empty() || args.api_key.trim().is_empty() {
        return ToolOutput::error("provider_id and api_key are both required");
    }
    let providers = ctx.catalog.list_providers();
    if !providers.is_empty() && !providers.iter().any(|p| p.id == provider_id) {
        let known: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
        return ToolOutput::error(format!(
            "Unknown provider '{}'. Known providers: {}",
            provider_id,
            known.join(", ")
        ));
    }

    ctx.credentials.save(ctx.session_id, provider_id, &args.api_key);
    debug!("Saved credential for provider {} (session {})", provider_id, ctx.session_id);

    match ctx.onboarding.set_checkpoint(Checkpoint::ProviderReady, true) {
        Ok(_) => ToolOutput::ok(format!("Credential saved for provider '{}'", provider_id)),
        Err(e) => ToolOutput::error(e.to_string()),
    }
}

/// Execute the `onboarding_set_model_preferences` tool.
pub fn execute_set_model_preferences(args: &ModelPreferencesArgs, ctx: &mut ToolContext<'_>) -> ToolOutput {
    let models = ctx.catalog.list_models(&args.provider_id);
    if !models.is_empty() && ctx.catalog.get_model(&args.provider_id, &args.model_id).is_none() {
        let known: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        return ToolOutput::error(format!(
            "Unknown model '{}' for provider '{}'. Known models: {}",
            args.model_id,
            args.provider_id,
            known.join(", ")
        ));
    }

    match ctx.onboarding.set_model_preferences(
        &args.provider_id,
        &args.model_id,
        args.tool_tier.as_deref(),
    ) {
        Ok(state) => state_output(&state),
        Err(e) => ToolOutput::error(e.to_string()),
    }
}

/// Execute the `onboarding_complete` tool.
pub fn execute_complete(ctx: &mut ToolContext<'_>) -> ToolOutput {
    match ctx.onboarding.complete() {
        Ok(state) => {
            ctx.onboarding_gated = false;
            state_output(&state)
        }
        Err(e) => ToolOutput::error(e.to_string()),
    }
}
