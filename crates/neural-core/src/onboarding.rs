//! Onboarding lifecycle.
//!
//! A small persisted state machine (`pending -> active -> completed`, plus
//! `revisit`) with named checkpoints. Until it reaches `completed` the tool
//! loop runs in the onboarding app context with a restricted tool set.
//!
//! State lives in `<root>/.neural/onboarding-state.json` and is rewritten on
//! every mutation; each mutation is also appended to
//! `<root>/.neural/onboarding-events.jsonl`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::paths;
use crate::workspace::{SandboxError, SandboxErrorCode, WorkspaceSandbox};

/// App context forced while onboarding is incomplete.
pub const ONBOARDING_APP_CONTEXT: &str = "onboarding";

/// Tools reachable while onboarding is incomplete.
pub const ONBOARDING_TOOL_ALLOWLIST: [&str; 10] = [
    "emit_screen",
    "read_screen",
    "onboarding_get_state",
    "onboarding_set_workspace_root",
    "save_provider_credential",
    "onboarding_set_model_preferences",
    "onboarding_complete",
    "read",
    "write",
    "edit",
];

pub fn tool_allowed_during_onboarding(tool: &str) -> bool {
    ONBOARDING_TOOL_ALLOWLIST.contains(&tool)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Pending,
    Active,
    Completed,
    Revisit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    WorkspaceReady,
    ProviderReady,
    ModelReady,
    MemorySeeded,
    Completed,
}

impl Checkpoint {
    /// Checkpoints the gated completion requires.
    pub const PREREQUISITES: [Checkpoint; 4] = [
        Checkpoint::WorkspaceReady,
        Checkpoint::ProviderReady,
        Checkpoint::ModelReady,
        Checkpoint::MemorySeeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::WorkspaceReady => "workspace_ready",
            Checkpoint::ProviderReady => "provider_ready",
            Checkpoint::ModelReady => "model_ready",
            Checkpoint::MemorySeeded => "memory_seeded",
            Checkpoint::Completed => "completed",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoints {
    pub workspace_ready: bool,
    pub provider_ready: bool,
    pub model_ready: bool,
    pub memory_seeded: bool,
    pub completed: bool,
}

impl Checkpoints {
    pub fn get(&self, checkpoint: Checkpoint) -> bool {
        match checkpoint {
            Checkpoint::WorkspaceReady => self.workspace_ready,
            Checkpoint::ProviderReady => self.provider_ready,
            Checkpoint::ModelReady => self.model_ready,
            Checkpoint::MemorySeeded => self.memory_seeded,
            Checkpoint::Completed => self.completed,
        }
    }

    fn slot(&mut self, checkpoint: Checkpoint) -> &mut bool {
        match checkpoint {
            Checkpoint::WorkspaceReady => &mut self.workspace_ready,
            Checkpoint::ProviderReady => &mut self.provider_ready,
            Checkpoint::ModelReady => &mut self.model_ready,
            Checkpoint::MemorySeeded => &mut self.memory_seeded,
            Checkpoint::Completed => &mut self.completed,
        }
    }

    pub fn missing_prerequisites(&self) -> Vec<Checkpoint> {
        Checkpoint::PREREQUISITES
            .into_iter()
            .filter(|c| !self.get(*c))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingState {
    pub lifecycle: Lifecycle,
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub workspace_root: Option<String>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub tool_tier: Option<String>,
    #[serde(default)]
    pub checkpoints: Checkpoints,
    pub last_error: Option<String>,
}

impl OnboardingState {
    pub fn new(workspace_root: &Path) -> Self {
        let now = Utc::now();
        Self {
            lifecycle: Lifecycle::Pending,
            run_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            workspace_root: Some(workspace_root.to_string_lossy().into_owned()),
            provider_id: None,
            model_id: None,
            tool_tier: None,
            checkpoints: Checkpoints::default(),
            last_error: None,
        }
    }

    /// Whether the tool loop must run in restricted onboarding mode.
    pub fn is_gated(&self) -> bool {
        self.lifecycle != Lifecycle::Completed
    }
}

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error("Onboarding cannot be completed yet. Missing checkpoints: {}", join_checkpoints(.missing))]
    Incomplete { missing: Vec<Checkpoint> },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("Onboarding state I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Onboarding state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_checkpoints(checkpoints: &[Checkpoint]) -> String {
    checkpoints
        .iter()
        .map(Checkpoint::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type OnboardingResult<T> = std::result::Result<T, OnboardingError>;

/// Reads and mutates the onboarding state of one workspace root.
#[derive(Debug, Clone)]
pub struct OnboardingStore {
    sandbox: WorkspaceSandbox,
}

impl OnboardingStore {
    pub fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }

    pub fn sandbox(&self) -> &WorkspaceSandbox {
        &self.sandbox
    }

    /// Load the state, creating and persisting defaults on first read.
    pub fn load(&self) -> OnboardingResult<OnboardingState> {
        match self.sandbox.resolve_read(&paths::onboarding_state_path(), None) {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)?;
                match serde_json::from_str(&content) {
                    Ok(state) => Ok(state),
                    Err(e) => {
                        warn!("Onboarding state at {} is unreadable ({}), resetting", path.display(), e);
                        self.create_default()
                    }
                }
            }
            Err(e) if e.code == SandboxErrorCode::PathNotFound => self.create_default(),
            Err(e) => Err(e.into()),
        }
    }

    fn create_default(&self) -> OnboardingResult<OnboardingState> {
        let mut state = OnboardingState::new(self.sandbox.root());
        self.persist(&mut state, "created", json!({}))?;
        Ok(state)
    }

    fn persist(&self, state: &mut OnboardingState, event: &str, detail: serde_json::Value) -> OnboardingResult<()> {
        state.updated_at = Utc::now();
        let path = self.sandbox.resolve_write(&paths::onboarding_state_path())?;
        std::fs::write(&path, serde_json::to_string_pretty(state)?)?;
        self.append_event(state, event, detail)?;
        debug!("Onboarding state saved ({}): {:?}", event, state.lifecycle);
        Ok(())
    }

    fn append_event(&self, state: &OnboardingState, event: &str, detail: serde_json::Value) -> OnboardingResult<()> {
        let path = self.sandbox.resolve_write(&paths::onboarding_events_path())?;
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "runId": state.run_id,
            "event": event,
            "lifecycle": state.lifecycle,
            "detail": detail,
        });
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn mutate(
        &self,
        event: &str,
        detail: serde_json::Value,
        f: impl FnOnce(&mut OnboardingState),
    ) -> OnboardingResult<OnboardingState> {
        let mut state = self.load()?;
        f(&mut state);
        self.persist(&mut state, event, detail)?;
        Ok(state)
    }

    /// Move into `active`. A completed onboarding is left alone unless `force_revisit`.
    pub fn start_run(&self, force_revisit: bool) -> OnboardingResult<OnboardingState> {
        let state = self.load()?;
        if state.lifecycle == Lifecycle::Completed && !force_revisit {
            return Ok(state);
        }
        self.mutate("start_run", json!({ "forceRevisit": force_revisit }), |state| {
            if state.lifecycle == Lifecycle::Completed {
                begin_revisit(state);
            }
            state.lifecycle = Lifecycle::Active;
            if state.run_id.is_none() {
                state.run_id = Some(uuid::Uuid::new_v4().to_string());
            }
            if state.started_at.is_none() {
                state.started_at = Some(Utc::now());
            }
        })
    }

    pub fn reopen(&self) -> OnboardingResult<OnboardingState> {
        info!("Reopening onboarding in {}", self.sandbox.root().display());
        self.mutate("reopen", json!({}), begin_revisit)
    }

    /// Low-level checkpoint primitive. Setting `completed` bypasses the gate,
    /// so it is only used by trusted internal callers.
    pub fn set_checkpoint(&self, checkpoint: Checkpoint, value: bool) -> OnboardingResult<OnboardingState> {
        let current = self.load()?;
        if current.checkpoints.get(checkpoint) == value {
            return Ok(current);
        }
        self.mutate(
            "set_checkpoint",
            json!({ "checkpoint": checkpoint, "value": value }),
            |state| {
                *state.checkpoints.slot(checkpoint) = value;
                if checkpoint == Checkpoint::Completed {
                    if value {
                        state.lifecycle = Lifecycle::Completed;
                        state.completed_at = Some(Utc::now());
                    } else if state.lifecycle == Lifecycle::Completed {
                        state.lifecycle = Lifecycle::Active;
                    }
                }
            },
        )
    }

    /// Gated completion: succeeds only when every prerequisite checkpoint is set.
    pub fn complete(&self) -> OnboardingResult<OnboardingState> {
        let state = self.load()?;
        let missing = state.checkpoints.missing_prerequisites();
        if !missing.is_empty() {
            let error = OnboardingError::Incomplete { missing: missing.clone() };
            let message = error.to_string();
            self.mutate(
                "complete_rejected",
                json!({ "missing": missing }),
                |state| state.last_error = Some(message),
            )?;
            return Err(error);
        }

        info!("Onboarding completed in {}", self.sandbox.root().display());
        self.mutate("completed", json!({}), |state| {
            state.checkpoints.completed = true;
            state.lifecycle = Lifecycle::Completed;
            state.completed_at = Some(Utc::now());
            state.last_error = None;
        })
    }

    pub fn set_model_preferences(
        &self,
        provider_id: &str,
        model_id: &str,
        tool_tier: Option<&str>,
    ) -> OnboardingResult<OnboardingState> {
        self.mutate(
            "set_model_preferences",
            json!({ "providerId": provider_id, "modelId": model_id, "toolTier": tool_tier }),
            |state| {
                state.provider_id = Some(provider_id.to_string());
                state.model_id = Some(model_id.to_string());
                if let Some(tier) = tool_tier {
                    state.tool_tier = Some(tier.to_string());
                }
                state.checkpoints.model_ready = true;
            },
        )
    }

    pub fn record_error(&self, message: &str) -> OnboardingResult<OnboardingState> {
        self.mutate("error", json!({ "message": message }), |state| {
            state.last_error = Some(message.to_string());
        })
    }

    /// Move the whole persisted state to a new root under the same policy.
    ///
    /// Returns the store bound to the new root. Files at the old root are left in place.
    pub fn set_workspace_root(&self, new_root: &Path) -> OnboardingResult<(OnboardingStore, OnboardingState)> {
        let mut state = self.load()?;
        let destination = OnboardingStore::new(self.sandbox.reopen_at(new_root)?);
        if destination.sandbox.root() == self.sandbox.root() {
            let state = self.set_checkpoint(Checkpoint::WorkspaceReady, true)?;
            return Ok((destination, state));
        }

        let from = self.sandbox.root().to_string_lossy().into_owned();
        state.workspace_root = Some(destination.sandbox.root().to_string_lossy().into_owned());
        state.checkpoints.workspace_ready = true;

        if let Ok(old_events) = self.sandbox.resolve_read(&paths::onboarding_events_path(), None) {
            let history = std::fs::read_to_string(old_events)?;
            let path = destination.sandbox.resolve_write(&paths::onboarding_events_path())?;
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(history.as_bytes())?;
        }
        destination.persist(&mut state, "workspace_root_migrated", json!({ "from": from }))?;

        info!(
            "Onboarding state migrated from {} to {}",
            from,
            destination.sandbox.root().display()
        );
        Ok((destination, state))
    }
}

fn begin_revisit(state: &mut OnboardingState) {
    state.lifecycle = Lifecycle::Revisit;
    state.run_id = Some(uuid::Uuid::new_v4().to_string());
    state.last_error = None;
    state.checkpoints.completed = false;
    state.started_at = None;
}
