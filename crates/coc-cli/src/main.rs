//! COC - Chain-of-Command directive orchestrator CLI
//!
//! The `coc` command decomposes a directive into tasks and drives them to
//! completion with the in-process mock collaborators.
//!
//! ## Commands
//!
//! - `run`: plan and execute a directive (or a prepared spec file)
//! - `plan`: print the plan the planner model produces for a directive
//! - `arms`: list or register bandit strategies
//! - `trace`: summarize the trace log per task

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use coc_core::mock::{MemoryRetriever, MockModelRegistry};
use coc_core::{
    init_tracing, summarize, AcceptanceEvaluator, ArmRecord, ArmScope, ArmSelector, Collaborators,
    DirectiveOutcome, DirectivePlanner, DirectiveSpec, DriverSettings, FsBanditStore,
    JsonlTraceLog, Orchestrator, OrchestratorConfig, PromptRenderer, RunMode,
};
use coc_state::read_trace_log;

#[derive(Parser)]
#[command(name = "coc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chain-of-Command directive orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a directive
    Run {
        /// Natural-language directive
        directive: String,

        /// Run this DirectiveSpec YAML instead of asking the planner
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Extra planner metadata as a JSON object
        #[arg(long)]
        meta: Option<String>,

        /// Tasks allowed in flight at once (overrides COC_MAX_CONCURRENT)
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Exploration probability (overrides COC_EPSILON)
        #[arg(long)]
        epsilon: Option<f64>,

        /// `global` or `per_role` (overrides COC_ARM_SCOPE)
        #[arg(long)]
        arm_scope: Option<ArmScope>,
    },

    /// Print the plan for a directive without running it
    Plan {
        directive: String,
    },

    /// Inspect or register bandit arms
    Arms {
        #[command(subcommand)]
        action: ArmsAction,
    },

    /// Summarize the trace log
    Trace {
        /// Trace log (default: $TRACE_DIR/events.jsonl)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Only show this task
        #[arg(long)]
        task: Option<String>,
    },
}

#[derive(Subcommand)]
enum ArmsAction {
    /// List arms with their win rates
    List,

    /// Register a strategy (existing arms keep their counters)
    Add {
        id: String,

        #[arg(long)]
        model: Option<String>,

        /// Context size hint (`short` / `large`)
        #[arg(long)]
        context: Option<String>,

        #[arg(long)]
        top_k: Option<u32>,

        #[arg(long)]
        prompt_template: Option<String>,

        /// Restrict the arm to one role
        #[arg(long)]
        role: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = OrchestratorConfig::from_env().context("Invalid COC configuration")?;

    match cli.command {
        Commands::Run {
            directive,
            spec,
            meta,
            max_concurrent,
            epsilon,
            arm_scope,
        } => {
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            if let Some(e) = epsilon {
                config.epsilon = e;
            }
            if let Some(scope) = arm_scope {
                config.arm_scope = scope;
            }
            config.validate()?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling directive");
                    on_signal.cancel();
                }
            });

            let outcome =
                cmd_run(&config, &directive, spec.as_deref(), meta.as_deref(), cancel).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_success() {
                anyhow::bail!(
                    "Directive {} finished with status {:?}",
                    outcome.directive_id,
                    outcome.status
                );
            }
            Ok(())
        }
        Commands::Plan { directive } => cmd_plan(&config, &directive).await,
        Commands::Arms { action } => match action {
            ArmsAction::List => cmd_arms_list(&config).await,
            ArmsAction::Add {
                id,
                model,
                context,
                top_k,
                prompt_template,
                role,
            } => {
                let mut arm = ArmRecord::new(id);
                arm.model_name = model;
                arm.context = context;
                arm.top_k = top_k;
                arm.prompt_template = prompt_template;
                arm.role = role;
                cmd_arms_add(&config, arm).await
            }
        },
        Commands::Trace { path, task } => {
            let path = path.unwrap_or_else(|| config.trace_log_path());
            cmd_trace(&path, task.as_deref())
        }
    }
}

fn ensure_mock(config: &OrchestratorConfig) -> Result<()> {
    if config.mode == RunMode::Real {
        anyhow::bail!(
            "COC_MODE=real requires an external model registry; this binary only ships the mock collaborators"
        );
    }
    Ok(())
}

async fn load_bandit(config: &OrchestratorConfig) -> Result<ArmSelector> {
    let store = Arc::new(FsBanditStore::new(&config.bandit_path));
    ArmSelector::load(store, config.epsilon, config.arm_scope, config.mock_seed)
        .await
        .with_context(|| format!("Failed to load bandit state from {:?}", config.bandit_path))
}

async fn build_orchestrator(config: &OrchestratorConfig) -> Result<Orchestrator> {
    ensure_mock(config)?;
    let trace_log = JsonlTraceLog::open(config.trace_log_path())
        .with_context(|| format!("Failed to open trace log in {:?}", config.trace_dir))?;
    let bandit = load_bandit(config).await?;

    Ok(Orchestrator::new(
        DriverSettings::from(config),
        Collaborators {
            registry: Arc::new(MockModelRegistry::from_config(config)),
            retriever: Arc::new(MemoryRetriever::new()),
            evaluator: Arc::new(AcceptanceEvaluator),
            bandit: Arc::new(bandit),
            renderer: PromptRenderer::new(&config.template_dir),
            trace_sink: Arc::new(trace_log),
        },
    ))
}

async fn cmd_run(
    config: &OrchestratorConfig,
    directive: &str,
    spec_path: Option<&Path>,
    meta: Option<&str>,
    cancel: CancellationToken,
) -> Result<DirectiveOutcome> {
    let orchestrator = build_orchestrator(config).await?;
    info!(
        mode = %config.mode,
        trace = ?config.trace_log_path(),
        bandit = ?config.bandit_path,
        "Running directive"
    );

    let outcome = match spec_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read spec {:?}", path))?;
            let spec = DirectiveSpec::from_yaml(&text)?;
            orchestrator.run_spec(directive, spec, cancel).await?
        }
        None => {
            let meta = match meta {
                Some(raw) => serde_json::from_str(raw).context("--meta must be a JSON object")?,
                None => serde_json::Value::Null,
            };
            orchestrator.run_directive(directive, meta, cancel).await?
        }
    };
    Ok(outcome)
}

async fn cmd_plan(config: &OrchestratorConfig, directive: &str) -> Result<()> {
    ensure_mock(config)?;
    let planner = DirectivePlanner::new(
        Arc::new(MockModelRegistry::from_config(config)),
        config.call_timeout,
    );
    let spec = planner
        .plan(directive, &serde_json::Value::Null, &CancellationToken::new())
        .await?;
    print!("{}", spec.to_yaml()?);
    Ok(())
}

async fn cmd_arms_list(config: &OrchestratorConfig) -> Result<()> {
    let bandit = load_bandit(config).await?;
    let stats = bandit.stats().await;

    println!(
        "{:<28} {:<12} {:<18} {:>6} {:>6} {:>6}",
        "ARM", "ROLE", "MODEL", "WINS", "PLAYS", "RATE"
    );
    for s in stats {
        println!(
            "{:<28} {:<12} {:<18} {:>6} {:>6} {:>6.2}",
            s.id,
            s.role.as_deref().unwrap_or("*"),
            s.model_name.as_deref().unwrap_or("-"),
            s.wins,
            s.plays,
            s.win_rate
        );
    }
    Ok(())
}

async fn cmd_arms_add(config: &OrchestratorConfig, arm: ArmRecord) -> Result<()> {
    let bandit = load_bandit(config).await?;
    let stored = bandit.add_arm(arm).await?;
    bandit
        .flush()
        .await
        .with_context(|| format!("Failed to persist arm {}", stored.id))?;
    println!(
        "Registered arm {} (wins {}, plays {})",
        stored.id, stored.wins, stored.plays
    );
    Ok(())
}

fn cmd_trace(path: &Path, task: Option<&str>) -> Result<()> {
    let records =
        read_trace_log(path).with_context(|| format!("Failed to read trace log {:?}", path))?;
    let summaries: Vec<_> = summarize(&records)
        .into_iter()
        .filter(|s| task.map_or(true, |t| s.task_id == t))
        .collect();

    if summaries.is_empty() {
        println!("No task records in {:?}", path);
        return Ok(());
    }
    for s in summaries {
        let score = s
            .last_score
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} [{}] picks={} requeues={} score={} -> {}",
            s.task_id,
            s.role.as_deref().unwrap_or("?"),
            s.picks,
            s.requeues,
            score,
            s.terminal.as_deref().unwrap_or("pending")
        );
        if let Some(parent) = &s.parent {
            println!("    parent: {parent}");
        }
        if !s.arms.is_empty() {
            println!("    arms:   {}", s.arms.join(", "));
        }
        if s.terminal_count > 1 {
            warn!(task = %s.task_id, count = s.terminal_count, "Task has more than one terminal record");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            out_dir: dir.to_path_buf(),
            trace_dir: dir.join("traces"),
            bandit_path: dir.join("bandit_state.json"),
            template_dir: dir.join("templates"),
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "coc",
            "--json",
            "run",
            "Add a health endpoint",
            "--max-concurrent",
            "3",
            "--arm-scope",
            "per_role",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                directive,
                max_concurrent,
                arm_scope,
                ..
            } => {
                assert_eq!(directive, "Add a health endpoint");
                assert_eq!(max_concurrent, Some(3));
                assert_eq!(arm_scope, Some(ArmScope::PerRole));
            }
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn run_writes_trace_and_bandit_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let outcome = cmd_run(
            &config,
            "Add a health endpoint",
            None,
            Some(r#"{"directive_id":"d-cli"}"#),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.directive_id, "d-cli");
        assert!(config.bandit_path.exists());
        assert!(!read_trace_log(&config.trace_log_path()).unwrap().is_empty());
        cmd_trace(&config.trace_log_path(), None).unwrap();
    }

    #[tokio::test]
    async fn run_from_spec_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let spec_path = dir.path().join("plan.yaml");
        std::fs::write(
            &spec_path,
            "metadata:\n  directive_id: d-file\nspec:\n  - id: t1\n    title: Write docs\n    role: worker\n",
        )
        .unwrap();

        let outcome = cmd_run(&config, "docs", Some(&spec_path), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.directive_id, "d-file");
        assert_eq!(outcome.done, 1);
    }

    #[tokio::test]
    async fn real_mode_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            mode: RunMode::Real,
            ..config_in(dir.path())
        };
        assert!(cmd_run(&config, "x", None, None, CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn added_arm_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let mut arm = ArmRecord::new("arm-qwen");
        arm.model_name = Some("qwen2.5:7b".into());
        cmd_arms_add(&config, arm).await.unwrap();

        let reloaded = load_bandit(&config).await.unwrap();
        let ids: Vec<String> = reloaded.arms().await.into_iter().map(|a| a.id).collect();
        assert!(ids.contains(&"arm-qwen".to_string()));
        assert!(ids.contains(&"arm-short-context".to_string()));
    }
}
