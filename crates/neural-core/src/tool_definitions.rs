//! Tool definitions for the agent's available tools.
//!
//! JSON schemas handed to the provider. Argument parsing on the way back in
//! lives in [`crate::tool_dispatch`].

use neural_providers::Tool;
use serde_json::json;

use crate::onboarding::tool_allowed_during_onboarding;

/// Configuration for which tools are offered on a request
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolConfig {
    pub web_search: bool,
    /// Restrict to the onboarding allowlist
    pub onboarding_gated: bool,
}

/// Create tool definitions for native tool calling providers.
pub fn create_tool_definitions(config: ToolConfig) -> Vec<Tool> {
    let mut tools = create_screen_tools();
    tools.extend(create_file_tools());
    tools.push(Tool {
        name: "bash".to_string(),
        description: "Run a shell command inside the workspace root. Command substitution, variable \
            expansion and changing to directories outside the workspace are rejected; paths must stay \
            inside the workspace."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to run"
                }
            },
            "required": ["command"]
        }),
    });
    if config.web_search {
        tools.push(Tool {
            name: "web_search".to_string(),
            description: "Search the web and return titles, URLs and snippets.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "count": { "type": "integer", "description": "Maximum number of results (1-10)" }
                },
                "required": ["query"]
            }),
        });
    }
    tools.extend(create_onboarding_tools());

    if config.onboarding_gated {
        tools.retain(|tool| tool_allowed_during_onboarding(&tool.name));
    }
    tools
}

fn create_screen_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "emit_screen".to_string(),
            description: "Publish the complete HTML for the user's screen. Always send the whole \
                document, never a diff; it replaces what is shown. Give interactive elements a \
                data-interaction-id attribute. Call at least once per turn."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "html": {
                        "type": "string",
                        "description": "The full HTML document or fragment to display"
                    },
                    "app_id": {
                        "type": "string",
                        "description": "Label of the app this screen belongs to"
                    },
                    "revision_note": {
                        "type": "string",
                        "description": "Short note describing what changed"
                    },
                    "is_final": {
                        "type": "boolean",
                        "description": "True when this is the last screen for the turn"
                    }
                },
                "required": ["html"]
            }),
        },
        Tool {
            name: "read_screen".to_string(),
            description: "Inspect the most recently published screen. Use `metadata` first, then \
                `outline`, and `snippet` only when needed. At most two reads per turn; the second \
                must set recovery=true."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "mode": {
                        "type": "string",
                        "enum": ["metadata", "outline", "snippet"],
                        "description": "How much of the screen to return"
                    },
                    "recovery": {
                        "type": "boolean",
                        "description": "Set on the second read of a turn"
                    },
                    "max_chars": {
                        "type": "integer",
                        "description": "Snippet length (snippet mode only)"
                    }
                },
                "required": []
            }),
        },
    ]
}

fn create_file_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "read".to_string(),
            description: "Read a file in the workspace. Paths are relative to the workspace root."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative file path" },
                    "offset": { "type": "integer", "description": "First line to return (1-based)" },
                    "limit": { "type": "integer", "description": "Maximum number of lines" }
                },
                "required": ["path"]
            }),
        },
        Tool {
            name: "write".to_string(),
            description: "Create or overwrite a file in the workspace. Parent directories are \
                created. Never write credentials."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative file path" },
                    "content": { "type": "string", "description": "Full file content" }
                },
                "required": ["path", "content"]
            }),
        },
        Tool {
            name: "edit".to_string(),
            description: "Replace exact text in a workspace file. `old_text` must match exactly \
                once unless replace_all is set."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative file path" },
                    "old_text": { "type": "string", "description": "Text to find" },
                    "new_text": { "type": "string", "description": "Replacement text" },
                    "replace_all": { "type": "boolean", "description": "Replace every occurrence" }
                },
                "required": ["path", "old_text", "new_text"]
            }),
        },
    ]
}

fn create_onboarding_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "onboarding_get_state".to_string(),
            description: "Return the onboarding state: lifecycle, checkpoints and last error."
                .to_string(),
            input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
        },
        Tool {
            name: "onboarding_set_workspace_root".to_string(),
            description: "Move the workspace to a new absolute directory. Onboarding state moves \
                with it."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Absolute directory path" }
                },
                "required": ["path"]
            }),
        },
        Tool {
            name: "save_provider_credential".to_string(),
            description: "Store an API key for a model provider for this session. The only safe \
                place for credentials."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "provider_id": { "type": "string", "description": "Provider identifier, e.g. openai" },
                    "api_key": { "type": "string", "description": "The API key" }
                },
                "required": ["provider_id", "api_key"]
            }),
        },
        Tool {
            name: "onboarding_set_model_preferences".to_string(),
            description: "Choose the provider and model to use, and optionally a tool tier."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "provider_id": { "type": "string" },
                    "model_id": { "type": "string" },
                    "tool_tier": { "type": "string", "description": "e.g. basic, standard, full" }
                },
                "required": ["provider_id", "model_id"]
            }),
        },
        Tool {
            name: "onboarding_complete".to_string(),
            description: "Finish onboarding. Fails with the list of missing checkpoints until the \
                workspace, provider, model and memory are all set up."
                .to_string(),
            input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
        },
    ]
}
