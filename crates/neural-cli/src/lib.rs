//! Neural CLI - runs turns against a local workspace and streams events as NDJSON.

mod cli_args;
mod event_output;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use neural_config::Config;
use neural_core::{Engine, Interaction, OpenAIProviderFactory, TurnReport, TurnRequest};

pub use cli_args::Cli;
pub use event_output::NdjsonEventSink;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = Config::load_with_overrides(cli.config.as_deref(), cli.provider.clone(), cli.model.clone())?;
    let engine = Engine::new(config.clone(), Arc::new(OpenAIProviderFactory::new(config)));
    let session_id = cli
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(session = %session_id, "Session started");

    let previous_html = match &cli.previous_html {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read previous screen from {}", path.display()))?,
        ),
        None => None,
    };
    let mut session = SessionState {
        id: session_id,
        workspace_root: cli.workspace.clone(),
        previous_html,
        reopen_onboarding: cli.reopen_onboarding,
    };

    if !cli.interactive {
        let prompt = cli
            .prompt
            .clone()
            .context("A prompt is required unless --interactive is set")?;
        let report = run_one(&engine, &cli, &mut session, &prompt).await;
        if !report.outcome.is_success() {
            anyhow::bail!(
                "Turn ended with {}: {}",
                report.outcome,
                report.error.unwrap_or_default()
            );
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if let Some(prompt) = cli.prompt.clone() {
        run_one(&engine, &cli, &mut session, &prompt).await;
    }
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "/exit" || prompt == "/quit" {
            break;
        }
        run_one(&engine, &cli, &mut session, prompt).await;
    }
    Ok(())
}

/// What carries over between turns of one CLI session.
struct SessionState {
    id: String,
    /// Follows the root when onboarding moves the workspace
    workspace_root: Option<PathBuf>,
    previous_html: Option<String>,
    reopen_onboarding: bool,
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    // stdout carries the event stream
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

async fn run_one(
    engine: &Engine,
    cli: &Cli,
    session: &mut SessionState,
    prompt: &str,
) -> TurnReport {
    let mut interaction = Interaction::prompt(prompt);
    if let Some(app) = &cli.app {
        interaction = interaction.with_app_context(app);
    }
    let mut request = TurnRequest::new(session.id.clone(), interaction);
    request.workspace_root = session.workspace_root.clone();
    request.previous_html = session.previous_html.clone();
    request.provider_id = cli.provider.clone();
    request.model_id = cli.model.clone();
    request.reopen_onboarding = std::mem::take(&mut session.reopen_onboarding);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupt received, cancelling turn");
                cancel.cancel();
            }
        })
    };

    let sink = NdjsonEventSink::new(std::io::stdout());
    let report = engine.run_turn(request, &sink, cancel).await;
    ctrl_c.abort();

    if report.workspace_root.is_some() {
        session.workspace_root = report.workspace_root.clone();
    }
    if let Some(html) = sink.latest_html() {
        session.previous_html = Some(html);
    }
    info!(
        outcome = %report.outcome,
        iterations = report.iterations,
        revisions = report.revisions,
        "Turn complete"
    );
    report
}
