//! Lane compaction.
//!
//! Older turns are folded into the lane's rolling summary so the lane stays
//! under `context_window - reserve_tokens`. The newest turns worth up to
//! `keep_recent_tokens` are kept verbatim; a newest turn that alone exceeds
//! that budget is split so compaction always makes progress.

use anyhow::Result;
use async_trait::async_trait;
use neural_providers::{CompletionRequest, LLMProvider, Message};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context_lane::{estimate_tokens, LaneKey, Turn, COMPACTED_STATE_MARKER};
use crate::lane_store::{CompactionSlot, ContextLaneStore};
use crate::memory_notes;
use crate::workspace::WorkspaceSandbox;

/// Heading under which the excerpt of a split turn's dropped prefix is kept.
pub const SPLIT_TURN_HEADING: &str = "## Compacted oversized turn";

const SPLIT_EXCERPT_CHARS: usize = 600;

/// Result of a compaction operation.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    pub turns_dropped: usize,
    pub split_turn: bool,
    /// Whether the summarizer produced a new summary
    pub summary_updated: bool,
    pub tokens_before: u32,
    pub tokens_after: u32,
    /// Summarizer error, if any
    pub error: Option<String>,
}

impl CompactionResult {
    pub fn nothing_to_do(tokens: u32) -> Self {
        Self {
            tokens_before: tokens,
            tokens_after: tokens,
            ..Default::default()
        }
    }

    pub fn freed_room(&self) -> bool {
        self.tokens_after < self.tokens_before
    }
}

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    pub context_window: u32,
    pub reserve_tokens: u32,
    pub keep_recent_tokens: u32,
    pub summary_max_tokens: u32,
    pub retry_interval: Duration,
    pub durable_notes: bool,
}

impl CompactionSettings {
    pub fn from_config(memory: &neural_config::MemoryConfig, context_window: u32) -> Self {
        Self {
            context_window,
            reserve_tokens: memory.reserve_tokens,
            keep_recent_tokens: memory.keep_recent_tokens,
            summary_max_tokens: memory.summary_max_tokens,
            retry_interval: Duration::from_millis(memory.background_retry_ms),
            durable_notes: memory.durable_notes,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.context_window.saturating_sub(self.reserve_tokens)
    }

    /// Upper bound on characters of dropped history handed to the summarizer.
    fn summarizer_input_chars(&self) -> usize {
        (self.threshold() as usize).saturating_mul(2).max(4_000)
    }
}

/// How the newest turn is cut when it alone exceeds the keep budget.
#[derive(Debug, Clone)]
pub struct TurnSplit {
    pub turn_id: String,
    pub kept_prompt: String,
    pub dropped_prefix: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionPlan {
    /// Turns to fold into the summary, oldest first
    pub dropped: Vec<Turn>,
    pub split: Option<TurnSplit>,
}

impl CompactionPlan {
    pub fn is_empty(&self) -> bool {
        self.dropped.is_empty() && self.split.is_none()
    }

    /// Text handed to the summarizer.
    pub fn serialize_dropped(&self, max_chars: usize) -> String {
        let mut parts: Vec<String> = self.dropped.iter().map(Turn::render).collect();
        if let Some(split) = &self.split {
            parts.push(format!(
                "### Earlier part of the latest turn\n{}",
                split.dropped_prefix
            ));
        }
        head_chars(&parts.join("\n\n"), max_chars)
    }
}

/// Decide which turns to drop. Pure; does not touch the lane.
pub fn plan_compaction(turns: &[Turn], keep_recent_tokens: u32) -> CompactionPlan {
    let mut kept_tokens: u32 = 0;
    let mut cutoff = turns.len();
    for (index, turn) in turns.iter().enumerate().rev() {
        if kept_tokens.saturating_add(turn.estimated_tokens) > keep_recent_tokens {
            break;
        }
        kept_tokens += turn.estimated_tokens;
        cutoff = index;
    }

    if cutoff < turns.len() || turns.is_empty() {
        return CompactionPlan {
            dropped: turns[..cutoff].to_vec(),
            split: None,
        };
    }

    // The newest turn alone is over budget: drop everything before it and split it.
    let newest = &turns[turns.len() - 1];
    let marker_tokens = estimate_tokens(COMPACTED_STATE_MARKER);
    let prompt_budget = keep_recent_tokens.saturating_sub(marker_tokens);
    let kept_prompt = tail_within_tokens(&newest.prompt, prompt_budget);
    let dropped_len = newest.prompt.len() - kept_prompt.len();

    CompactionPlan {
        dropped: turns[..turns.len() - 1].to_vec(),
        split: Some(TurnSplit {
            turn_id: newest.id.clone(),
            dropped_prefix: newest.prompt[..dropped_len].to_string(),
            kept_prompt,
        }),
    }
}

/// Produces updated rolling summaries.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, previous_summary: &str, dropped: &str, max_tokens: u32) -> Result<String>;
}

/// Summarizer backed by the request's provider.
pub struct ProviderSummarizer {
    provider: Arc<dyn LLMProvider>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, previous_summary: &str, dropped: &str, max_tokens: u32) -> Result<String> {
        let previous = if previous_summary.trim().is_empty() {
            "(none yet)"
        } else {
            previous_summary
        };
        let request = CompletionRequest::plain(
            vec![
                Message::system(
                    "You maintain a rolling summary of an assistant-driven UI session. Merge the \
                     earlier turns into the previous summary. Keep user goals, decisions, current \
                     screen state, files touched, and unresolved issues. Drop chit-chat. Reply \
                     with the updated summary only.",
                ),
                Message::user(format!(
                    "Previous summary:\n{}\n\nEarlier turns to fold in:\n{}\n\nKeep the result under {} tokens.",
                    previous, dropped, max_tokens
                )),
            ],
            max_tokens,
        );

        let response = self.provider.complete(request).await?;
        let summary = response.content.trim().to_string();
        if summary.is_empty() {
            anyhow::bail!("Summarizer returned an empty summary");
        }
        Ok(summary)
    }
}

/// Compact one lane. The caller must hold the lane's compaction slot.
pub async fn compact_lane(
    store: &ContextLaneStore,
    key: &LaneKey,
    summarizer: &dyn Summarizer,
    settings: &CompactionSettings,
    sandbox: Option<&WorkspaceSandbox>,
) -> CompactionResult {
    let (previous_summary, plan, tokens_before) = store.with_lane(key, |lane| {
        let tokens = lane.estimate("", settings.context_window, settings.reserve_tokens).tokens;
        (
            lane.summary.clone(),
            plan_compaction(&lane.turns, settings.keep_recent_tokens),
            tokens,
        )
    });

    if plan.is_empty() {
        debug!("Nothing to compact in lane {}", key);
        return CompactionResult::nothing_to_do(tokens_before);
    }

    let dropped_text = plan.serialize_dropped(settings.summarizer_input_chars());
    let new_summary = match summarizer
        .summarize(&previous_summary, &dropped_text, settings.summary_max_tokens)
        .await
    {
        Ok(summary) => {
            let mut summary = head_within_tokens(&summary, settings.summary_max_tokens);
            if let Some(split) = &plan.split {
                summary.push_str(&format!(
                    "\n\n{}\n{}",
                    SPLIT_TURN_HEADING,
                    head_chars(split.dropped_prefix.trim(), SPLIT_EXCERPT_CHARS)
                ));
            }
            summary
        }
        Err(e) => {
            // Turns only leave the lane once they are folded into a summary
            warn!("Summarization failed for lane {}, keeping history as is: {}", key, e);
            return CompactionResult {
                error: Some(e.to_string()),
                ..CompactionResult::nothing_to_do(tokens_before)
            };
        }
    };

    let dropped_ids: HashSet<&str> = plan.dropped.iter().map(|t| t.id.as_str()).collect();
    let tokens_after = store.with_lane(key, |lane| {
        lane.turns.retain(|t| !dropped_ids.contains(t.id.as_str()));
        if let Some(split) = &plan.split {
            if let Some(turn) = lane.turns.iter_mut().find(|t| t.id == split.turn_id) {
                turn.prompt = split.kept_prompt.clone();
                turn.compacted = true;
                turn.estimated_tokens = turn.heuristic_tokens();
            }
        }
        lane.summary = new_summary.clone();
        lane.estimate("", settings.context_window, settings.reserve_tokens).tokens
    });

    info!(
        "Compacted lane {}: dropped {} turn(s), split={}, tokens {} -> {}",
        key,
        plan.dropped.len(),
        plan.split.is_some(),
        tokens_before,
        tokens_after
    );

    if let (Some(sandbox), true) = (sandbox, settings.durable_notes) {
        if let Err(e) = memory_notes::append_daily_note(sandbox, key, &new_summary) {
            warn!("Failed to write durable memory note: {}", e);
        }
    }

    CompactionResult {
        turns_dropped: plan.dropped.len(),
        split_turn: plan.split.is_some(),
        summary_updated: true,
        tokens_before,
        tokens_after,
        error: None,
    }
}

/// Runs compactions for lanes of one store, in the foreground or in the background.
#[derive(Clone)]
pub struct LaneCompactor {
    store: Arc<ContextLaneStore>,
    summarizer: Arc<dyn Summarizer>,
    settings: CompactionSettings,
    sandbox: Option<WorkspaceSandbox>,
}

impl LaneCompactor {
    pub fn new(
        store: Arc<ContextLaneStore>,
        summarizer: Arc<dyn Summarizer>,
        settings: CompactionSettings,
        sandbox: Option<WorkspaceSandbox>,
    ) -> Self {
        Self {
            store,
            summarizer,
            settings,
            sandbox,
        }
    }

    /// Write durable notes under `sandbox` from now on.
    pub fn with_sandbox(mut self, sandbox: WorkspaceSandbox) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    /// Compact synchronously, waiting for any running compaction on the lane first.
    pub async fn compact_now(&self, key: &LaneKey, cancel: &CancellationToken) -> Result<CompactionResult> {
        loop {
            if self.store.try_begin_compaction(key, false) == CompactionSlot::Acquired {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_interval) => {}
                _ = cancel.cancelled() => anyhow::bail!("Cancelled while waiting for compaction"),
            }
        }

        let result = compact_lane(
            &self.store,
            key,
            self.summarizer.as_ref(),
            &self.settings,
            self.sandbox.as_ref(),
        )
        .await;

        if self.store.finish_compaction(key) {
            self.schedule(key.clone());
        }
        Ok(result)
    }

    /// Schedule a background check that compacts the lane if it is over threshold.
    pub fn schedule(&self, key: LaneKey) -> tokio::task::JoinHandle<()> {
        let compactor = self.clone();
        tokio::spawn(async move { compactor.run_background(key).await })
    }

    async fn run_background(&self, key: LaneKey) {
        loop {
            if self.store.try_begin_compaction(&key, true) != CompactionSlot::Acquired {
                debug!("Compaction already running for lane {}, queued", key);
                return;
            }

            let estimate = self.store.estimate(
                &key,
                "",
                self.settings.context_window,
                self.settings.reserve_tokens,
            );
            if estimate.over_threshold() {
                compact_lane(
                    &self.store,
                    &key,
                    self.summarizer.as_ref(),
                    &self.settings,
                    self.sandbox.as_ref(),
                )
                .await;
            }

            if !self.store.finish_compaction(&key) {
                return;
            }
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }
}

fn head_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    match text.char_indices().nth(total - max_chars) {
        Some((byte_index, _)) => &text[byte_index..],
        None => "",
    }
}

/// Longest prefix (by shrinking) whose estimate fits `budget`.
pub(crate) fn head_within_tokens(text: &str, budget: u32) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }
    let mut chars = (budget as usize).saturating_mul(3);
    loop {
        let head = head_chars(text, chars);
        if estimate_tokens(&head) <= budget || chars == 0 {
            return head;
        }
        chars = chars * 3 / 4;
    }
}

fn tail_within_tokens(text: &str, budget: u32) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }
    let mut chars = (budget as usize).saturating_mul(3);
    loop {
        let tail = tail_chars(text, chars);
        if estimate_tokens(tail) <= budget || chars == 0 {
            return tail.to_string();
        }
        chars = chars * 3 / 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_lane::ContextLane;
    use crate::state_capture::AssistantStateSummary;
    use neural_providers::{MockProvider, MockResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, previous: &str, _dropped: &str, _max: u32) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("{} [pass {}]", previous, n).trim().to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _previous: &str, _dropped: &str, _max: u32) -> Result<String> {
            anyhow::bail!("provider unavailable")
        }
    }

    fn settings(window: u32) -> CompactionSettings {
        CompactionSettings {
            context_window: window,
            reserve_tokens: 16_384,
            keep_recent_tokens: 20_000,
            summary_max_tokens: 2_000,
            retry_interval: Duration::from_millis(10),
            durable_notes: false,
        }
    }

    /// A plain-text prompt of roughly `tokens` estimated tokens.
    fn turn_of(tokens: u32) -> Turn {
        let chars = (tokens as f32 / 1.1 * 4.0) as usize;
        Turn::new(
            "notes",
            "typed a note".to_string(),
            "w".repeat(chars),
            AssistantStateSummary::default(),
            None,
        )
    }

    fn fill(store: &ContextLaneStore, key: &LaneKey, count: usize, tokens: u32) {
        for _ in 0..count {
            store.append_turn(key, turn_of(tokens), 0.5);
        }
    }

    #[test]
    fn test_plan_keeps_recent_budget() {
        let mut lane = ContextLane::new(LaneKey::new("s", "a"));
        for _ in 0..10 {
            lane.append_turn(turn_of(5_000), 0.5);
        }
        let plan = plan_compaction(&lane.turns, 20_000);
        assert!(plan.split.is_none());
        // at most three ~5000-token turns fit in 20000 along with their state text
        let kept = lane.turns.len() - plan.dropped.len();
        assert!((1..=3).contains(&kept), "kept {}", kept);
        assert_eq!(plan.dropped[0].id, lane.turns[0].id);
    }

    #[test]
    fn test_plan_splits_oversized_newest_turn() {
        let mut lane = ContextLane::new(LaneKey::new("s", "a"));
        lane.append_turn(turn_of(1_000), 0.5);
        lane.append_turn(turn_of(50_000), 0.5);

        let plan = plan_compaction(&lane.turns, 20_000);
        assert_eq!(plan.dropped.len(), 1);
        let split = plan.split.expect("newest turn should be split");
        assert_eq!(split.turn_id, lane.turns[1].id);
        assert!(estimate_tokens(&split.kept_prompt) + estimate_tokens(COMPACTED_STATE_MARKER) <= 20_000);
        assert_eq!(
            split.dropped_prefix.len() + split.kept_prompt.len(),
            lane.turns[1].prompt.len()
        );
    }

    #[test]
    fn test_plan_is_empty_when_everything_fits() {
        let mut lane = ContextLane::new(LaneKey::new("s", "a"));
        lane.append_turn(turn_of(100), 0.5);
        assert!(plan_compaction(&lane.turns, 20_000).is_empty());
        assert!(plan_compaction(&[], 20_000).is_empty());
    }

    #[tokio::test]
    async fn test_below_threshold_lane_is_not_compacted_in_background() {
        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        fill(&store, &key, 10, 4_800);

        let estimate = store.estimate(&key, "", 100_000, 16_384);
        assert!(!estimate.over_threshold(), "estimate {}", estimate.tokens);

        let compactor = LaneCompactor::new(
            store.clone(),
            Arc::new(FixedSummarizer { calls: AtomicUsize::new(0) }),
            settings(100_000),
            None,
        );
        compactor.schedule(key.clone()).await.unwrap();
        assert_eq!(store.snapshot(&key).turns.len(), 10);
    }

    #[tokio::test]
    async fn test_compaction_converges_below_threshold() {
        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        fill(&store, &key, 20, 5_000);
        let settings = settings(100_000);
        assert!(store.estimate(&key, "", 100_000, 16_384).over_threshold());

        let summarizer = FixedSummarizer { calls: AtomicUsize::new(0) };
        let result = compact_lane(&store, &key, &summarizer, &settings, None).await;
        assert!(result.freed_room());
        assert!(result.summary_updated);
        assert!(result.tokens_after <= settings.threshold());
        assert!(store.snapshot(&key).summary.contains("[pass 1]"));
    }

    #[tokio::test]
    async fn test_split_path_converges_for_single_huge_turn() {
        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        fill(&store, &key, 1, 150_000);
        let settings = settings(100_000);

        let summarizer = FixedSummarizer { calls: AtomicUsize::new(0) };
        let mut passes = 0;
        while store.estimate(&key, "", 100_000, 16_384).over_threshold() {
            compact_lane(&store, &key, &summarizer, &settings, None).await;
            passes += 1;
            assert!(passes <= 3, "compaction did not converge");
        }

        let lane = store.snapshot(&key);
        assert_eq!(lane.turns.len(), 1);
        assert!(lane.turns[0].compacted);
        assert!(lane.summary.contains(SPLIT_TURN_HEADING));
    }

    #[tokio::test]
    async fn test_failed_summary_keeps_previous_summary() {
        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        store.with_lane(&key, |lane| lane.summary = "user is planning a trip".to_string());
        fill(&store, &key, 20, 5_000);

        let result = compact_lane(&store, &key, &FailingSummarizer, &settings(100_000), None).await;
        assert!(!result.summary_updated);
        assert!(result.error.unwrap().contains("provider unavailable"));
        let lane = store.snapshot(&key);
        assert_eq!(lane.summary, "user is planning a trip");
        assert_eq!(lane.turns.len(), 20);
    }

    #[tokio::test]
    async fn test_failed_summary_drops_no_turns() {
        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        fill(&store, &key, 20, 18_000);
        let settings = settings(100_000);
        let before = store.snapshot(&key);

        let result = compact_lane(&store, &key, &FailingSummarizer, &settings, None).await;
        assert!(!result.freed_room());
        assert_eq!(result.turns_dropped, 0);
        assert!(!result.split_turn);
        assert_eq!(result.tokens_after, result.tokens_before);

        let after = store.snapshot(&key);
        assert!(after.summary.is_empty());
        assert_eq!(after.turns.len(), before.turns.len());
        assert!(after.turns.iter().all(|t| !t.compacted));
    }

    #[tokio::test]
    async fn test_background_notes_follow_replaced_sandbox() {
        use crate::workspace::WorkspacePolicy;

        let open = |dir: &tempfile::TempDir| {
            let policy = WorkspacePolicy {
                default_root: dir.path().to_path_buf(),
                allowed_roots: Vec::new(),
            };
            WorkspaceSandbox::open(None, &policy).unwrap()
        };
        let old_dir = tempfile::TempDir::new().unwrap();
        let new_dir = tempfile::TempDir::new().unwrap();

        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        fill(&store, &key, 20, 5_000);
        let settings = CompactionSettings {
            durable_notes: true,
            ..settings(100_000)
        };

        let compactor = LaneCompactor::new(
            store.clone(),
            Arc::new(FixedSummarizer { calls: AtomicUsize::new(0) }),
            settings,
            Some(open(&old_dir)),
        )
        .with_sandbox(open(&new_dir));
        compactor.schedule(key.clone()).await.unwrap();

        let note = crate::paths::daily_note_path(chrono::Local::now().date_naive());
        assert!(new_dir.path().join(&note).exists());
        assert!(!old_dir.path().join(&note).exists());
    }

    #[tokio::test]
    async fn test_provider_summarizer_uses_completion() {
        let provider = MockProvider::new()
            .with_completion(MockResponse::text("User wants a weather dashboard."));
        let summarizer = ProviderSummarizer::new(Arc::new(provider.clone()));

        let summary = summarizer.summarize("", "### Turn ...", 500).await.unwrap();
        assert_eq!(summary, "User wants a weather dashboard.");
        let request = &provider.get_requests()[0];
        assert!(!request.stream);
        assert_eq!(request.max_tokens, Some(500));
    }

    #[tokio::test]
    async fn test_compact_now_waits_for_running_compaction() {
        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        fill(&store, &key, 20, 5_000);
        assert_eq!(store.try_begin_compaction(&key, false), CompactionSlot::Acquired);

        let compactor = LaneCompactor::new(
            store.clone(),
            Arc::new(FixedSummarizer { calls: AtomicUsize::new(0) }),
            settings(100_000),
            None,
        );
        let releaser = store.clone();
        let release_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.finish_compaction(&release_key);
        });

        let result = compactor
            .compact_now(&key, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.turns_dropped > 0);
        assert!(!store.snapshot(&key).compaction_in_flight);
    }

    #[tokio::test]
    async fn test_compact_now_honours_cancellation() {
        let store = Arc::new(ContextLaneStore::new());
        let key = LaneKey::new("s", "notes");
        store.try_begin_compaction(&key, false);
        let compactor = LaneCompactor::new(
            store,
            Arc::new(FailingSummarizer),
            settings(100_000),
            None,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(compactor.compact_now(&key, &cancel).await.is_err());
    }
}
