//! Interaction records supplied by the presentation layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionElement {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub interaction_id: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// A user action: a typed prompt, a click on a published control, a form submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: String,
    /// e.g. `prompt`, `click`, `submit`, `input`
    pub kind: String,
    pub value: Option<String>,
    pub element: Option<InteractionElement>,
    pub app_context_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_pixel_ratio: Option<f32>,
}

impl Interaction {
    pub fn prompt(text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: "prompt".to_string(),
            value: Some(text.to_string()),
            element: None,
            app_context_id: None,
        }
    }

    pub fn with_app_context(mut self, app_context_id: &str) -> Self {
        self.app_context_id = Some(app_context_id.to_string());
        self
    }

    /// One-line description used in prompts and state summaries.
    pub fn describe(&self) -> String {
        let mut out = self.kind.clone();
        if let Some(element) = &self.element {
            let tag = element.tag.as_deref().unwrap_or("element");
            out.push_str(&format!(" on {}", tag));
            if let Some(id) = element.interaction_id.as_deref().or(element.id.as_deref()) {
                out.push_str(&format!(" #{}", id));
            }
            if let Some(text) = element.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                out.push_str(&format!(" \"{}\"", text.chars().take(80).collect::<String>()));
            }
        }
        if let Some(value) = self.value.as_deref().filter(|v| !v.is_empty()) {
            out.push_str(&format!(": {}", value.chars().take(400).collect::<String>()));
        }
        out
    }
}
