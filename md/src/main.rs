//! missiond - autonomous R&D mission engine
//!
//! CLI entry point: wires the state store, stage registry, integration
//! bus, prompt factory, context watcher, and LLM driver into a
//! conductor and drives the mission.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use missiond::cli::{Cli, Command};
use missiond::conductor::{Conductor, ConductorConfig, MissionOutcome};
use missiond::config::Config;
use missiond::events::IntegrationBus;
use missiond::integrations;
use missiond::llm::CliDriver;
use missiond::orchestrator::Orchestrator;
use missiond::prompts::PromptFactory;
use missiond::stages::StageRegistry;
use missiond::state::{MissionRecord, StateStore, shared};
use missiond::watcher::{ContextWatcher, ProjectsDirResolver, WatcherConfig};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let level = match cli_log_level.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            other => {
                eprintln!("Warning: Unknown log-level '{other}', defaulting to INFO");
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            mission,
            workspace,
            cycles,
        } => cmd_run(&config, mission, workspace, cycles).await,
        Command::Status => cmd_status(&config),
        Command::Reset => cmd_reset(&config),
    }
}

async fn cmd_run(
    config: &Config,
    mission: Option<String>,
    workspace: Option<PathBuf>,
    cycles: Option<u32>,
) -> Result<()> {
    let mut store = StateStore::new(&config.state.mission_path);

    if let Some(problem_statement) = mission {
        let workspace = workspace.unwrap_or_else(|| PathBuf::from("workspace"));
        let mission_dir = config
            .state
            .mission_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let record = MissionRecord {
            mission_id: format!("mission-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S")),
            original_problem_statement: Some(problem_statement.clone()),
            problem_statement,
            cycle_budget: cycles.unwrap_or(1).max(1),
            mission_workspace: Some(workspace),
            mission_dir: Some(mission_dir),
            ..Default::default()
        };
        info!(mission_id = %record.mission_id, "Creating mission");
        store.set_mission(record)?;
    }

    let mission_dir = store
        .mission()
        .mission_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let workspace_dir = store.workspace_dir();

    let bus = Arc::new(IntegrationBus::new());
    let recovery = integrations::register_defaults(&bus, &mission_dir, &workspace_dir);

    let registry = StageRegistry::with_overrides(config.stage_restriction_overrides());
    let prompts = PromptFactory::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let orchestrator = Orchestrator::new(shared(store), registry, bus, prompts)
        .with_recovery(recovery)
        .with_llm_provider(&config.llm.provider);

    let transcript_root = config.watcher.transcript_root.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("projects")
    });
    let watcher = ContextWatcher::new(
        WatcherConfig::from(&config.watcher),
        Arc::new(ProjectsDirResolver::new(transcript_root)),
    );
    let _poll_loop = watcher.spawn_poll_loop();

    let llm = Arc::new(CliDriver::new(&config.llm.command, config.llm.args.clone()));

    let conductor_config = ConductorConfig {
        max_restarts: config.conductor.max_restarts,
        turn_timeout: Duration::from_secs(config.llm.timeout_secs),
        max_turns: config.conductor.max_turns,
    };

    let mut conductor = Conductor::new(orchestrator, llm, watcher, conductor_config);
    let report = conductor.run().await?;

    match &report.outcome {
        MissionOutcome::Completed => {
            println!(
                "Mission complete after {} turns ({} graceful restarts).",
                report.turns, report.graceful_restarts
            );
        }
        MissionOutcome::Halted { message, .. } => {
            println!("{message}");
            std::process::exit(1);
        }
        MissionOutcome::TurnLimit => {
            println!("Mission stopped at the turn ceiling after {} turns.", report.turns);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let mut store = StateStore::new(&config.state.mission_path);
    let m = store.mission();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "mission_id": m.mission_id,
            "current_stage": m.current_stage.as_str(),
            "iteration": m.iteration,
            "cycle": m.current_cycle,
            "cycle_budget": m.cycle_budget,
            "last_updated": m.last_updated,
        }))?
    );
    Ok(())
}

fn cmd_reset(config: &Config) -> Result<()> {
    let mut store = StateStore::new(&config.state.mission_path);
    let old = store.mission().clone();
    let record = MissionRecord {
        problem_statement: old.problem_statement,
        original_problem_statement: old.original_problem_statement,
        mission_workspace: old.mission_workspace,
        mission_dir: old.mission_dir,
        cycle_budget: old.cycle_budget,
        ..Default::default()
    };
    store.set_mission(record)?;
    println!("Mission reset to PLANNING.");
    Ok(())
}
