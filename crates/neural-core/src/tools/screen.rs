//! Screen tools: `emit_screen` publishes a revision, `read_screen` inspects it.

use serde::Deserialize;
use tracing::debug;

use crate::event_sink::EngineEvent;
use crate::render_output::{read_screen, ReadMode};

use super::executor::{ToolContext, ToolOutput};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmitScreenArgs {
    pub html: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub revision_note: Option<String>,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReadScreenArgs {
    #[serde(default)]
    pub mode: ReadMode,
    #[serde(default)]
    pub recovery: bool,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

/// Execute the `emit_screen` tool.
pub fn execute_emit_screen(args: &EmitScreenArgs, ctx: &mut ToolContext<'_>) -> ToolOutput {
    let app_id = args
        .app_id
        .clone()
        .or_else(|| Some(ctx.app_context.to_string()));
    let revision = match ctx.render.publish(
        &args.html,
        app_id,
        args.revision_note.as_deref(),
        args.is_final,
        ctx.render_limits,
    ) {
        Ok(revision) => revision,
        Err(e) => return ToolOutput::error(e.to_string()),
    };

    debug!(
        "Published revision {} ({} chars, final={})",
        revision.revision,
        revision.html.len(),
        revision.is_final
    );
    let text = format!(
        "Published revision {}{}",
        revision.revision,
        if revision.is_final { " (final)" } else { "" }
    );
    ctx.events.emit(EngineEvent::RenderOutput {
        revision: revision.revision,
        html: revision.html,
        is_final: revision.is_final,
        note: revision.note,
        app_id: revision.app_id,
    });
    ToolOutput::ok(text)
}

/// Execute the `read_screen` tool.
pub fn execute_read_screen(args: &ReadScreenArgs, ctx: &mut ToolContext<'_>) -> ToolOutput {
    debug!("Processing read_screen: {:?} (recovery={})", args.mode, args.recovery);
    match read_screen(
        ctx.render,
        ctx.read_usage,
        args.mode,
        args.recovery,
        args.max_chars,
        ctx.render_limits,
    ) {
        Ok(json) => ToolOutput::ok(json),
        Err(e) => ToolOutput::error(e.to_string()),
    }
}
