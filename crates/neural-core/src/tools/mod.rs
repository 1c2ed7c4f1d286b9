//! Tool implementations the model can call.
//!
//! Tools are organized by category:
//! - `screen` - Publishing and inspecting the user's screen
//! - `file_ops` - File reading, writing, and editing
//! - `shell` - Confined shell command execution
//! - `web_search` - Web search
//! - `onboarding` - Setup lifecycle actions

pub mod executor;
pub mod file_ops;
pub mod onboarding;
pub mod screen;
pub mod shell;
pub mod web_search;

pub use executor::{ToolContext, ToolOutput};
pub use web_search::{BraveSearch, SearchResult, WebSearch};
