//! Published screen state for one turn.
//!
//! `emit_screen` commits whole HTML documents as numbered revisions;
//! `read_screen` lets the model inspect the latest one under a small budget.
//! While `emit_screen` arguments are still streaming, [`PartialRenderThrottle`]
//! decides when the in-progress document is forwarded as an advisory partial.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct RenderLimits {
    pub max_html_chars: usize,
    pub max_note_chars: usize,
    pub max_emit_calls: u32,
    pub snippet_default_chars: usize,
    pub snippet_max_chars: usize,
    pub outline_max_headings: usize,
    pub outline_max_interaction_ids: usize,
    pub outline_max_controls: usize,
}

impl RenderLimits {
    pub fn from_config(render: &neural_config::RenderConfig) -> Self {
        Self {
            max_html_chars: render.max_html_chars,
            max_note_chars: render.max_note_chars,
            max_emit_calls: render.max_emit_calls_per_turn,
            snippet_default_chars: render.snippet_default_chars,
            snippet_max_chars: render.snippet_max_chars,
            outline_max_headings: render.outline_max_headings,
            outline_max_interaction_ids: render.outline_max_interaction_ids,
            outline_max_controls: render.outline_max_controls,
        }
    }
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self::from_config(&neural_config::RenderConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("emit_screen requires a non-empty html document")]
    EmptyHtml,
    #[error("html is {len} characters; the limit is {max}")]
    HtmlTooLarge { len: usize, max: usize },
    #[error("emit_screen may be called at most {max} times per turn")]
    EmitBudgetExceeded { max: u32 },
    #[error("No screen has been published yet; call emit_screen first")]
    NoPublishedScreen,
    #[error("read_screen budget exhausted for this turn (2 reads)")]
    ReadBudgetExhausted,
    #[error("A second read_screen call must set recovery=true")]
    RecoveryFlagRequired,
    #[error("The recovery read_screen call has already been used this turn")]
    RecoveryAlreadyUsed,
}

/// A committed publish, as sent to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRevision {
    pub revision: u32,
    pub html: String,
    pub is_final: bool,
    pub note: Option<String>,
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOutputState {
    render_count: u32,
    latest_html: Option<String>,
    last_is_final: bool,
    emit_calls: u32,
}

impl RenderOutputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a turn from the client's last known screen.
    pub fn seeded(previous_html: Option<String>) -> Self {
        Self {
            latest_html: previous_html.filter(|html| !html.trim().is_empty()),
            ..Self::default()
        }
    }

    pub fn render_count(&self) -> u32 {
        self.render_count
    }

    pub fn latest_html(&self) -> Option<&str> {
        self.latest_html.as_deref()
    }

    pub fn last_is_final(&self) -> bool {
        self.last_is_final
    }

    /// Whether this turn has committed at least one revision.
    pub fn published_this_turn(&self) -> bool {
        self.render_count > 0
    }

    /// Whether there is any screen to inspect, from this turn or a seed.
    pub fn has_lineage(&self) -> bool {
        self.latest_html.is_some()
    }

    pub fn publish(
        &mut self,
        html: &str,
        app_id: Option<String>,
        note: Option<&str>,
        is_final: bool,
        limits: &RenderLimits,
    ) -> Result<RenderRevision, RenderError> {
        if self.emit_calls >= limits.max_emit_calls {
            return Err(RenderError::EmitBudgetExceeded {
                max: limits.max_emit_calls,
            });
        }
        self.emit_calls += 1;

        if html.trim().is_empty() {
            return Err(RenderError::EmptyHtml);
        }
        let len = html.chars().count();
        if len > limits.max_html_chars {
            return Err(RenderError::HtmlTooLarge {
                len,
                max: limits.max_html_chars,
            });
        }

        let note = note
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| n.chars().take(limits.max_note_chars).collect::<String>());

        self.render_count += 1;
        self.latest_html = Some(html.to_string());
        self.last_is_final = is_final;

        Ok(RenderRevision {
            revision: self.render_count,
            html: html.to_string(),
            is_final,
            note,
            app_id,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadScreenUsage {
    read_count: u32,
    recovery_read_used: bool,
}

impl ReadScreenUsage {
    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    fn consume(&mut self, recovery: bool) -> Result<(), RenderError> {
        if self.read_count >= 2 {
            return Err(RenderError::ReadBudgetExhausted);
        }
        if recovery && self.recovery_read_used {
            return Err(RenderError::RecoveryAlreadyUsed);
        }
        if self.read_count == 1 && !recovery {
            return Err(RenderError::RecoveryFlagRequired);
        }
        self.read_count += 1;
        if recovery {
            self.recovery_read_used = true;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    #[default]
    Metadata,
    Outline,
    Snippet,
}

#[derive(Debug, Serialize)]
struct ScreenMetadata {
    revision: u32,
    length: usize,
    sha256: String,
    interaction_id_count: usize,
    is_final: bool,
}

#[derive(Debug, Serialize)]
struct ScreenOutline {
    revision: u32,
    headings: Vec<String>,
    interaction_ids: Vec<String>,
    controls: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ScreenSnippet {
    revision: u32,
    length: usize,
    truncated: bool,
    html: String,
}

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h([1-6])\b[^>]*>(.*?)</h[1-6]\s*>").expect("Invalid heading regex"));
static INTERACTION_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)data-interaction-id\s*=\s*["']([^"']+)["']"#).expect("Invalid interaction id regex")
});
static CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(button|a|input|select|textarea)\b([^>]*)>([^<]*)").expect("Invalid control regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("Invalid tag regex"));

/// Answer a `read_screen` call, consuming read budget only on success.
pub fn read_screen(
    state: &RenderOutputState,
    usage: &mut ReadScreenUsage,
    mode: ReadMode,
    recovery: bool,
    max_chars: Option<usize>,
    limits: &RenderLimits,
) -> Result<String, RenderError> {
    let html = state.latest_html().ok_or(RenderError::NoPublishedScreen)?;
    usage.consume(recovery)?;
    let revision = state.render_count();

    let value = match mode {
        ReadMode::Metadata => serde_json::to_value(ScreenMetadata {
            revision,
            length: html.chars().count(),
            sha256: hex::encode(Sha256::digest(html.as_bytes())),
            interaction_id_count: INTERACTION_ID.captures_iter(html).count(),
            is_final: state.last_is_final(),
        }),
        ReadMode::Outline => serde_json::to_value(outline(html, revision, limits)),
        ReadMode::Snippet => {
            let cap = max_chars
                .unwrap_or(limits.snippet_default_chars)
                .min(limits.snippet_max_chars);
            let length = html.chars().count();
            serde_json::to_value(ScreenSnippet {
                revision,
                length,
                truncated: length > cap,
                html: html.chars().take(cap).collect(),
            })
        }
    };

    Ok(value
        .map(|v| v.to_string())
        .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e)))
}

fn outline(html: &str, revision: u32, limits: &RenderLimits) -> ScreenOutline {
    let headings = HEADING
        .captures_iter(html)
        .filter_map(|c| {
            let text = collapse_text(&c[2]);
            (!text.is_empty()).then(|| format!("h{} {}", &c[1], text))
        })
        .take(limits.outline_max_headings)
        .collect();

    let mut seen = HashSet::new();
    let interaction_ids = INTERACTION_ID
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .filter(|id| seen.insert(id.clone()))
        .take(limits.outline_max_interaction_ids)
        .collect();

    let controls = CONTROL
        .captures_iter(html)
        .map(|c| describe_control(&c[1], &c[2], &c[3]))
        .take(limits.outline_max_controls)
        .collect();

    ScreenOutline {
        revision,
        headings,
        interaction_ids,
        controls,
    }
}

fn describe_control(tag: &str, attrs: &str, text: &str) -> String {
    let mut out = tag.to_ascii_lowercase();
    for name in ["type", "id", "name", "data-interaction-id"] {
        if let Some(value) = attribute(attrs, name) {
            out.push_str(&format!(" {}={}", name, value));
        }
    }
    let label = attribute(attrs, "aria-label")
        .or_else(|| attribute(attrs, "placeholder"))
        .or_else(|| Some(collapse_text(text)).filter(|t| !t.is_empty()));
    if let Some(label) = label {
        out.push_str(&format!(" \"{}\"", label.chars().take(60).collect::<String>()));
    }
    out
}

/// Attributes an outline reads from a control.
const CONTROL_ATTRIBUTES: [&str; 6] = ["type", "id", "name", "data-interaction-id", "aria-label", "placeholder"];

static ATTRIBUTE_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    CONTROL_ATTRIBUTES
        .iter()
        .map(|name| {
            let pattern = format!(r#"(?i)(?:^|\s){}\s*=\s*["']([^"']*)["']"#, regex::escape(name));
            (*name, Regex::new(&pattern).expect("Invalid attribute regex"))
        })
        .collect()
});

fn attribute(attrs: &str, name: &str) -> Option<String> {
    let (_, pattern) = ATTRIBUTE_PATTERNS.iter().find(|(known, _)| *known == name)?;
    pattern.captures(attrs).map(|c| c[1].to_string())
}

fn collapse_text(fragment: &str) -> String {
    TAG.replace_all(fragment, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rate limiter for `render_output_partial` events.
#[derive(Debug, Clone)]
pub struct PartialRenderThrottle {
    min_delta_chars: usize,
    min_interval: Duration,
    large_delta_chars: usize,
    last_len: usize,
    last_sent: Option<Instant>,
}

impl PartialRenderThrottle {
    pub fn new(render: &neural_config::RenderConfig) -> Self {
        Self {
            min_delta_chars: render.partial_min_delta_chars,
            min_interval: Duration::from_millis(render.partial_min_interval_ms),
            large_delta_chars: render.partial_large_delta_chars,
            last_len: 0,
            last_sent: None,
        }
    }

    /// Whether a partial of `len` chars should go out at `now`. Records it if so.
    pub fn should_emit(&mut self, len: usize, now: Instant) -> bool {
        if len <= self.last_len {
            return false;
        }
        let delta = len - self.last_len;
        let interval_elapsed = self
            .last_sent
            .map(|sent| now.duration_since(sent) >= self.min_interval)
            .unwrap_or(true);

        if (delta >= self.min_delta_chars && interval_elapsed) || delta >= self.large_delta_chars {
            self.last_len = len;
            self.last_sent = Some(now);
            true
        } else {
            false
        }
    }
}

/// Decode the (possibly unterminated) `html` string from partial tool-call JSON.
pub fn extract_partial_html(partial_args: &str) -> Option<String> {
    let key = partial_args.find("\"html\"")?;
    let rest = partial_args[key + 6..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let body = rest.strip_prefix('"')?;

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('b') => out.push('\u{8}'),
                Some('f') => out.push('\u{c}'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    if hex.len() < 4 {
                        break;
                    }
                    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        Some(decoded) => out.push(decoded),
                        None => out.push('\u{fffd}'),
                    }
                }
                Some(other) => out.push(other),
                None => break,
            },
            other => out.push(other),
        }
    }
    Some(out)
}

/// Whether partial html already reads as a whole-document replacement.
pub fn looks_like_document(html: &str) -> bool {
    let head: String = html.trim_start().chars().take(32).collect::<String>().to_ascii_lowercase();
    ["<!doctype", "<html", "<body", "<main", "<div", "<section", "<article", "<header"]
        .iter()
        .any(|prefix| head.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<main>
  <h1>Tasks</h1>
  <h2>Today <small>(3)</small></h2>
  <button data-interaction-id="add-task" aria-label="Add task">+</button>
  <input type="text" name="title" placeholder="New task" data-interaction-id="title">
  <a href="#done" data-interaction-id="add-task">Done</a>
</main>"##;

    fn limits() -> RenderLimits {
        RenderLimits::default()
    }

    #[test]
    fn test_attribute_matches_whole_names_only() {
        let attrs = r#" type="text" data-interaction-id='title' placeholder="New task""#;
        assert_eq!(attribute(attrs, "type").as_deref(), Some("text"));
        assert_eq!(attribute(attrs, "data-interaction-id").as_deref(), Some("title"));
        assert_eq!(attribute(attrs, "id"), None);
        assert_eq!(attribute(attrs, "placeholder").as_deref(), Some("New task"));
        assert_eq!(attribute(attrs, "onclick"), None);
        assert_eq!(
            describe_control("input", attrs, ""),
            "input type=text data-interaction-id=title \"New task\""
        );
    }

    #[test]
    fn test_revisions_are_monotonic_and_replace_html() {
        let mut state = RenderOutputState::new();
        for n in 1..=3 {
            let html = format!("<main>v{}</main>", n);
            let revision = state.publish(&html, None, None, n == 3, &limits()).unwrap();
            assert_eq!(revision.revision, n);
            assert_eq!(state.latest_html(), Some(html.as_str()));
        }
        assert!(state.last_is_final());
    }

    #[test]
    fn test_empty_html_leaves_revision_unchanged() {
        let mut state = RenderOutputState::new();
        state.publish("<main>a</main>", None, None, false, &limits()).unwrap();
        assert_eq!(state.publish("  ", None, None, false, &limits()), Err(RenderError::EmptyHtml));
        assert_eq!(state.render_count(), 1);
        assert_eq!(state.latest_html(), Some("<main>a</main>"));
    }

    #[test]
    fn test_oversized_html_and_note_truncation() {
        let limits = RenderLimits {
            max_html_chars: 10,
            max_note_chars: 5,
            ..limits()
        };
        let mut state = RenderOutputState::new();
        assert!(matches!(
            state.publish("<main>toolong</main>", None, None, false, &limits),
            Err(RenderError::HtmlTooLarge { .. })
        ));
        let revision = state.publish("<p>ok</p>", None, Some("abcdefgh"), false, &limits).unwrap();
        assert_eq!(revision.note.as_deref(), Some("abcde"));
    }

    #[test]
    fn test_emit_budget_fails_only_excess_calls() {
        let limits = RenderLimits {
            max_emit_calls: 2,
            ..limits()
        };
        let mut state = RenderOutputState::new();
        state.publish("<p>1</p>", None, None, false, &limits).unwrap();
        state.publish("<p>2</p>", None, None, false, &limits).unwrap();
        assert_eq!(
            state.publish("<p>3</p>", None, None, false, &limits),
            Err(RenderError::EmitBudgetExceeded { max: 2 })
        );
        assert_eq!(state.latest_html(), Some("<p>2</p>"));
    }

    #[test]
    fn test_read_requires_published_screen() {
        let state = RenderOutputState::new();
        let mut usage = ReadScreenUsage::default();
        let err = read_screen(&state, &mut usage, ReadMode::Metadata, false, None, &limits());
        assert_eq!(err, Err(RenderError::NoPublishedScreen));
        assert_eq!(usage.read_count(), 0);

        let seeded = RenderOutputState::seeded(Some("<main>prev</main>".to_string()));
        assert!(read_screen(&seeded, &mut usage, ReadMode::Snippet, false, None, &limits()).is_ok());
    }

    #[test]
    fn test_read_budget_and_recovery_flag() {
        let mut state = RenderOutputState::new();
        state.publish(PAGE, None, None, false, &limits()).unwrap();
        let mut usage = ReadScreenUsage::default();

        read_screen(&state, &mut usage, ReadMode::Metadata, false, None, &limits()).unwrap();
        assert_eq!(
            read_screen(&state, &mut usage, ReadMode::Outline, false, None, &limits()),
            Err(RenderError::RecoveryFlagRequired)
        );
        read_screen(&state, &mut usage, ReadMode::Outline, true, None, &limits()).unwrap();
        assert_eq!(
            read_screen(&state, &mut usage, ReadMode::Snippet, true, None, &limits()),
            Err(RenderError::ReadBudgetExhausted)
        );
    }

    #[test]
    fn test_metadata_and_outline_content() {
        let mut state = RenderOutputState::new();
        state.publish(PAGE, None, None, true, &limits()).unwrap();

        let mut usage = ReadScreenUsage::default();
        let meta: serde_json::Value = serde_json::from_str(
            &read_screen(&state, &mut usage, ReadMode::Metadata, false, None, &limits()).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["revision"], 1);
        assert_eq!(meta["interaction_id_count"], 3);
        assert_eq!(meta["sha256"].as_str().unwrap().len(), 64);

        let outline: serde_json::Value = serde_json::from_str(
            &read_screen(&state, &mut usage, ReadMode::Outline, true, None, &limits()).unwrap(),
        )
        .unwrap();
        assert_eq!(outline["headings"][0], "h1 Tasks");
        assert_eq!(outline["headings"][1], "h2 Today (3)");
        assert_eq!(outline["interaction_ids"].as_array().unwrap().len(), 2);
        let controls = outline["controls"].as_array().unwrap();
        assert!(controls[0].as_str().unwrap().contains("\"Add task\""));
        assert!(controls[1].as_str().unwrap().contains("name=title"));
    }

    #[test]
    fn test_snippet_is_bounded() {
        let mut state = RenderOutputState::new();
        state.publish(PAGE, None, None, false, &limits()).unwrap();
        let mut usage = ReadScreenUsage::default();
        let snippet: serde_json::Value = serde_json::from_str(
            &read_screen(&state, &mut usage, ReadMode::Snippet, false, Some(20), &limits()).unwrap(),
        )
        .unwrap();
        assert_eq!(snippet["html"].as_str().unwrap().chars().count(), 20);
        assert_eq!(snippet["truncated"], true);
    }

    #[test]
    fn test_partial_throttle() {
        let config = neural_config::RenderConfig {
            partial_min_delta_chars: 100,
            partial_min_interval_ms: 50,
            partial_large_delta_chars: 1000,
            ..Default::default()
        };
        let mut throttle = PartialRenderThrottle::new(&config);
        let start = Instant::now();

        assert!(!throttle.should_emit(50, start));
        assert!(throttle.should_emit(150, start));
        // enough delta but too soon
        assert!(!throttle.should_emit(300, start + Duration::from_millis(10)));
        // large delta overrides the interval
        assert!(throttle.should_emit(1200, start + Duration::from_millis(20)));
        assert!(throttle.should_emit(1400, start + Duration::from_millis(100)));
        assert!(!throttle.should_emit(1400, start + Duration::from_millis(500)));
    }

    #[test]
    fn test_extract_partial_html() {
        let partial = r#"{"app_id":"todo","html":"<main>\n<h1>Hi \"there\"</h1><p>café"#;
        assert_eq!(
            extract_partial_html(partial).unwrap(),
            "<main>\n<h1>Hi \"there\"</h1><p>café"
        );
        assert_eq!(extract_partial_html(r#"{"html": "<div>\u00"#).unwrap(), "<div>");
        assert!(extract_partial_html(r#"{"app_id":"x""#).is_none());
        assert!(looks_like_document("  <!DOCTYPE html><html>"));
        assert!(!looks_like_document("Hello <b>world</b>"));
    }
}
