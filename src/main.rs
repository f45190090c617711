use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use agentflow::{
    AgentSpec, ExecutionError, FnExecutor, Orchestrator, OrchestratorConfig, Result, TaskId,
    TaskSpec, TaskState,
};

const CAPABILITY: &str = "sim";

/// agentflow - in-process agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "agentflow")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    AGENTFLOW_DEBUG=1    Enable debug logging (alternative to --debug)\n    AGENTFLOW_LOG        tracing filter directive, overrides both"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.agentflow/agentflow.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file to use instead of ~/.agentflow/agentflow.toml
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the effective configuration as TOML
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },

    /// Run a simulated workload and print the final system status as JSON
    Simulate {
        /// Number of tasks to submit
        #[arg(long, default_value_t = 20)]
        tasks: usize,

        /// Number of agents to register
        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Time each task spends working, in milliseconds
        #[arg(long, default_value_t = 50)]
        work_ms: u64,

        /// Make every Nth task fail its first attempt (0 disables)
        #[arg(long, default_value_t = 0)]
        fail_every: usize,

        /// Make each task depend on the previous one
        #[arg(long)]
        chain: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = if cli.debug {
        Some(OrchestratorConfig::app_dir()?.join("agentflow.log"))
    } else {
        None
    };
    agentflow::log::init(cli.debug, log_file.as_deref())?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => OrchestratorConfig::config_path()?,
    };

    match cli.command {
        Command::Config { init } => run_config(&config_path, init),
        Command::Simulate {
            tasks,
            agents,
            work_ms,
            fail_every,
            chain,
        } => {
            let config = OrchestratorConfig::load_from(&config_path)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_simulation(
                config,
                Simulation {
                    tasks,
                    agents,
                    work: Duration::from_millis(work_ms),
                    fail_every,
                    chain,
                },
            ))
        }
    }
}

fn run_config(path: &std::path::Path, init: bool) -> Result<()> {
    if init {
        if path.exists() {
            println!("Config already exists at {}", path.display());
            return Ok(());
        }
        OrchestratorConfig::default().save_to(path)?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = OrchestratorConfig::load_from(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

struct Simulation {
    tasks: usize,
    agents: usize,
    work: Duration,
    fail_every: usize,
    chain: bool,
}

async fn run_simulation(config: OrchestratorConfig, sim: Simulation) -> Result<()> {
    let work = sim.work;
    let fail_every = sim.fail_every;
    let executor = Arc::new(FnExecutor::new(move |ctx| async move {
        let index = ctx.payload.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(work) => {}
        }
        if fail_every > 0 && (index + 1) % fail_every == 0 && ctx.attempt == 1 {
            return Err(ExecutionError::Failed(format!("simulated failure of task {}", index)));
        }
        Ok(serde_json::json!({ "index": index, "agent": ctx.agent_id.to_string() }))
    }));

    let orchestrator = Orchestrator::new(config, executor)?;
    for n in 0..sim.agents.max(1) {
        orchestrator.register_agent(
            AgentSpec::new(&format!("sim-agent-{}", n), [CAPABILITY]).with_id(format!("agent-{}", n)),
        )?;
    }
    orchestrator.start()?;

    let specs: Vec<TaskSpec> = (0..sim.tasks)
        .map(|i| {
            let spec = TaskSpec::new(&format!("sim-task-{}", i), CAPABILITY)
                .with_id(format!("task-{}", i))
                .with_payload(serde_json::json!({ "index": i }));
            if sim.chain && i > 0 {
                spec.with_dependencies(vec![TaskId::from(format!("task-{}", i - 1))])
            } else {
                spec
            }
        })
        .collect();
    let ids = orchestrator.submit_tasks(specs).await?;
    tracing::info!(tasks = ids.len(), agents = sim.agents, chain = sim.chain, "simulation submitted");

    let finished = async {
        loop {
            let status = orchestrator.system_status().await;
            let terminal: usize = [
                TaskState::Completed,
                TaskState::Failed,
                TaskState::TimedOut,
                TaskState::Cancelled,
            ]
            .into_iter()
            .map(|s| status.count(s))
            .sum();
            if terminal >= ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    tokio::select! {
        _ = finished => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, shutting down");
        }
    }

    let report = orchestrator.shutdown().await;
    let status = orchestrator.system_status().await;
    let output = serde_json::json!({
        "status": status,
        "shutdown": report,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
