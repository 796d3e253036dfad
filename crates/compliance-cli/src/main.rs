//! Operator-facing CLI for the compliance vision pipeline: drives the
//! Pipeline Orchestrator over a file or a still frame, and inspects/resets
//! checklist state. HTTP/WebSocket transport is out of scope;
//! this binary is the synchronous, single-shot front door in the meantime.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use compliance_core::{AnalyzeResponse, Configuration, FrameAnalyzeRequest, Orchestrator};
use compliance_schemas::policy::Policy;

#[derive(Parser)]
#[command(name = "compliance-cli", about = "Compliance vision pipeline CLI")]
struct Args {
    /// Path to a TOML configuration file. Missing file falls back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a video file against a policy.
    AnalyzeVideo {
        /// Path to the video file.
        video: PathBuf,
        /// Path to a JSON-encoded Policy.
        #[arg(long)]
        policy: PathBuf,
    },
    /// Analyze a single JPEG frame against a policy.
    AnalyzeFrame {
        /// Path to a JPEG file.
        frame: PathBuf,
        #[arg(long)]
        policy: PathBuf,
    },
    /// Inspect or reset the checklist tracker.
    Checklist {
        #[command(subcommand)]
        action: ChecklistAction,
    },
}

#[derive(Subcommand)]
enum ChecklistAction {
    /// Dump the full checklist snapshot as JSON.
    Dump,
    /// Wipe all checklist state.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let orchestrator = Orchestrator::new(config, async_openai::Client::new());

    match args.command {
        Command::AnalyzeVideo { video, policy } => {
            let policy = load_policy(&policy)?;
            let cancellation = cancellation_token();
            let result = orchestrator.analyze_video(&video, &policy, &cancellation).await;
            print_response(result.into());
        }
        Command::AnalyzeFrame { frame, policy } => {
            let policy = load_policy(&policy)?;
            let jpeg = std::fs::read(&frame)
                .with_context(|| format!("reading frame file {}", frame.display()))?;
            let request = FrameAnalyzeRequest::single_frame(jpeg, policy);
            let cancellation = cancellation_token();
            let result = orchestrator.analyze_frame(request, &cancellation).await;
            print_response(result.into());
        }
        Command::Checklist { action } => match action {
            ChecklistAction::Dump => {
                let snapshot = orchestrator.export_checklist();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            ChecklistAction::Reset => {
                orchestrator.reset_checklist();
                tracing::info!("checklist state reset");
            }
        },
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Configuration> {
    let Some(path) = path else {
        return Ok(Configuration::default());
    };
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration file {}", path.display()))?;
    Configuration::from_toml_str(&source).with_context(|| format!("parsing configuration file {}", path.display()))
}

fn load_policy(path: &std::path::Path) -> Result<Policy> {
    let source = std::fs::read_to_string(path).with_context(|| format!("reading policy file {}", path.display()))?;
    serde_json::from_str(&source).with_context(|| format!("parsing policy file {}", path.display()))
}

/// A Ctrl-C during a long-running analysis cancels all in-flight AI calls
/// and detector threads ("Cancellation").
fn cancellation_token() -> CancellationToken {
    let token = CancellationToken::new();
    let guard = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            guard.cancel();
        }
    });
    token
}

fn print_response(response: AnalyzeResponse) {
    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to serialize response: {err}"),
    }

    if let AnalyzeResponse::Error { .. } = response {
        std::process::exit(1);
    }
}
