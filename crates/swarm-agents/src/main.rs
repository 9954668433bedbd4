use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::messaging::TracingAuditSink;
use coordination::TaskSeed;
use tracing::{info, warn};

use swarm_agents::config::SwarmConfig;
use swarm_agents::inference::{check_endpoint, HttpInferenceClient};
use swarm_agents::planner;
use swarm_agents::swarm::{new_task_id, SwarmBuilder};

#[derive(Parser)]
#[command(name = "swarm-agents", about = "Run an objective through an agent swarm")]
struct Cli {
    /// TOML configuration file; defaults plus environment overrides when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the phased plan for an objective without running it.
    Plan { objective: String },

    /// Plan and execute an objective, then print the run summary.
    Run {
        objective: String,

        #[arg(long, default_value = "cli")]
        user: String,

        /// Reuse a task id; generated when omitted.
        #[arg(long)]
        task_id: Option<String>,

        /// RocksDB directory for task records and the audit trail
        /// (needs the `heavy-state` feature).
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SwarmConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SwarmConfig::from_env()?,
    };

    match cli.command {
        Command::Plan { objective } => {
            let plan = planner::create_plan(&objective)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Run {
            objective,
            user,
            task_id,
            db,
        } => {
            let task_id = task_id.unwrap_or_else(new_task_id);
            info!(
                task_id = %task_id,
                endpoint = %config.inference.url,
                "Swarm starting"
            );

            if !check_endpoint(&config.inference.url).await {
                warn!(endpoint = %config.inference.url, "Inference endpoint not reachable; subtasks will fail until it is");
            }
            let client = HttpInferenceClient::new(config.inference.clone())?.shared();
            let builder = SwarmBuilder::new(&task_id, TaskSeed::new(user, objective), client)
                .config(config)
                .audit(Arc::new(TracingAuditSink));

            #[cfg(feature = "heavy-state")]
            let builder = match db {
                Some(path) => {
                    let store = coordination::state::RocksTaskStore::open(&path)
                        .with_context(|| format!("opening {}", path.display()))?
                        .shared();
                    builder.store(store.clone()).audit(store)
                }
                None => builder,
            };
            #[cfg(not(feature = "heavy-state"))]
            if db.is_some() {
                anyhow::bail!("--db needs a build with the heavy-state feature");
            }

            let swarm = builder.launch().await?;
            let outcome = swarm.run().await;
            swarm.shutdown().await;

            let summary = outcome?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.error.is_some() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
