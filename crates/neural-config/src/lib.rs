use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};


/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub workspace: WorkspaceConfig,
    pub sandbox: SandboxConfig,
    pub memory: MemoryConfig,
    pub render: RenderConfig,
    pub agent: AgentConfig,
    pub web_search: WebSearchConfig,
}

/// Provider configuration: one named entry per OpenAI-compatible endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider used when neither the request nor onboarding state names one
    pub default_provider: String,
    /// Model used when neither the request nor onboarding state names one
    pub default_model: String,
    #[serde(default)]
    pub openai_compatible: HashMap<String, OpenAIConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Fallback key when no per-session credential has been saved
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Models offered by this endpoint
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub context_window: u32,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root used when a request does not name one
    pub default_root: String,
    /// When non-empty, every workspace root must live under one of these
    pub allowed_roots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub command_timeout_secs: u64,
    /// Window between the graceful termination signal and the forced kill
    pub kill_grace_ms: u64,
    /// Cap applied independently to stdout and stderr
    pub max_output_bytes: usize,
    /// Cap on bytes returned by a single file read
    pub max_read_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Used when the catalog has no entry for the active model
    pub default_context_window: u32,
    pub reserve_tokens: u32,
    pub keep_recent_tokens: u32,
    /// Share of the latest provider-reported completion tokens used as a per-turn floor
    pub usage_fraction: f32,
    pub summary_max_tokens: u32,
    pub background_retry_ms: u64,
    /// Write compaction summaries to `memory/<date>.md` under the workspace root
    pub durable_notes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub max_html_chars: usize,
    pub max_note_chars: usize,
    pub max_emit_calls_per_turn: u32,
    pub partial_min_delta_chars: usize,
    pub partial_min_interval_ms: u64,
    pub partial_large_delta_chars: usize,
    pub snippet_default_chars: usize,
    pub snippet_max_chars: usize,
    pub outline_max_headings: usize,
    pub outline_max_interaction_ids: usize,
    pub outline_max_controls: usize,
    /// App contexts that may finish a turn without publishing a screen
    pub publish_exempt_apps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_retry_attempts: u32,
    pub max_tokens: u32,
    pub state_summary_max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub max_results: usize,
    pub timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        let mut openai_compatible = HashMap::new();
        openai_compatible.insert(
            "openai".to_string(),
            OpenAIConfig {
                api_key: None,
                base_url: Some("https://api.openai.com/v1".to_string()),
                max_tokens: Some(8192),
                temperature: None,
                models: vec![ModelConfig {
                    id: "gpt-4o".to_string(),
                    context_window: 128_000,
                    max_output_tokens: Some(16_384),
                }],
            },
        );
        Self {
            default_provider: "openai".to_string(),
            default_model: "gpt-4o".to_string(),
            openai_compatible,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            default_root: "~/neural-workspace".to_string(),
            allowed_roots: Vec::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            kill_grace_ms: 2000,
            max_output_bytes: 64 * 1024,
            max_read_bytes: 256 * 1024,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_context_window: 128_000,
            reserve_tokens: 16_384,
            keep_recent_tokens: 20_000,
            usage_fraction: 0.5,
            summary_max_tokens: 2_000,
            background_retry_ms: 250,
            durable_notes: true,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_html_chars: 200_000,
            max_note_chars: 280,
            max_emit_calls_per_turn: 8,
            partial_min_delta_chars: 400,
            partial_min_interval_ms: 150,
            partial_large_delta_chars: 4_000,
            snippet_default_chars: 1_200,
            snippet_max_chars: 4_000,
            outline_max_headings: 12,
            outline_max_interaction_ids: 24,
            outline_max_controls: 24,
            publish_exempt_apps: vec!["terminal".to_string(), "settings".to_string()],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            max_tokens: 8192,
            state_summary_max_tokens: 600,
        }
    }
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            endpoint: "https://api.search.brave.com/res/v1/web/search".to_string(),
            max_results: 5,
            timeout_secs: 15,
        }
    }
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./neural.toml", "~/.config/neural/config.toml"];

impl Config {
    /// Load configuration from an explicit path, or the first default path that exists.
    /// Falls back to built-in defaults when no file is found.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path_to_load = match config_path {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    anyhow::bail!("Config file '{}' not found", expanded);
                }
                Some(expanded)
            }
            None => DEFAULT_CONFIG_PATHS.iter().find_map(|path| {
                let expanded = shellexpand::tilde(path);
                Path::new(expanded.as_ref())
                    .exists()
                    .then(|| expanded.to_string())
            }),
        };

        let Some(path) = path_to_load else {
            debug!("No configuration file found, using defaults");
            return Ok(Self::default());
        };

        info!("Loading configuration from {}", path);
        let config_content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.validate_provider_reference(&self.providers.default_provider)?;

        if self.memory.keep_recent_tokens == 0 {
            anyhow::bail!("memory.keep_recent_tokens must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.memory.usage_fraction) {
            anyhow::bail!(
                "memory.usage_fraction must be between 0 and 1, got {}",
                self.memory.usage_fraction
            );
        }
        if self.render.max_html_chars == 0 {
            anyhow::bail!("render.max_html_chars must be greater than zero");
        }
        Ok(())
    }

    /// Validate that a provider id names a configured endpoint
    pub fn validate_provider_reference(&self, reference: &str) -> Result<()> {
        if !self.providers.openai_compatible.contains_key(reference) {
            let mut available: Vec<_> = self.providers.openai_compatible.keys().collect();
            available.sort();
            anyhow::bail!(
                "Provider config '{}' not found. Available: {:?}",
                reference,
                available
            );
        }
        Ok(())
    }

    pub fn provider(&self, provider_id: &str) -> Option<&OpenAIConfig> {
        self.providers.openai_compatible.get(provider_id)
    }

    /// Context window for a model, falling back to the memory default.
    pub fn context_window_for(&self, provider_id: &str, model_id: &str) -> u32 {
        self.provider(provider_id)
            .and_then(|p| p.models.iter().find(|m| m.id == model_id))
            .map(|m| m.context_window)
            .unwrap_or(self.memory.default_context_window)
    }

    pub fn default_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.workspace.default_root).as_ref())
    }

    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        self.workspace
            .allowed_roots
            .iter()
            .map(|root| PathBuf::from(shellexpand::tilde(root).as_ref()))
            .collect()
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn load_with_overrides(
        config_path: Option<&str>,
        provider_override: Option<String>,
        model_override: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path)?;

        if let Some(provider) = provider_override {
            config.validate_provider_reference(&provider)?;
            config.providers.default_provider = provider;
        }

        if let Some(model) = model_override {
            config.providers.default_model = model;
        }

        Ok(config)
    }
}
