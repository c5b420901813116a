use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use extgraph::{
    config::{ConfigManager, EnvConfigManager, PathTimeoutInfo},
    graph::{GraphDefinition, RoutingTable, graph_schema},
    logger::{LogConfig, init_tracing},
};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "extgraph",
    about = "Inspect graphs of extensions and their command paths",
    version = "0.1.0"
)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct LogArgs {
    /// Log filter (e.g. error, warn, info, debug, trace, extgraph=debug)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files; stdout only when absent
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a graph file and print the effective path timeouts per node
    Validate {
        file: PathBuf,

        /// `.env` file with PATH_TIMEOUT_IN_US, PATH_TIMEOUT_OUT_US and
        /// PATH_CHECK_INTERVAL_US overrides
        #[arg(long, default_value = ".env")]
        env_file: PathBuf,
    },

    /// Emit the JSON Schema of graph files
    Schema {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_tracing(&LogConfig::new(
        &cli.log.log_level,
        cli.log.log_dir.clone(),
        cli.log.otel_endpoint.clone(),
    ))?;

    match cli.command {
        Commands::Validate { file, env_file } => {
            if let Err(e) = validate(&file, env_file).await {
                error!("{e:#}");
                eprintln!("❌ {e:#}");
                process::exit(1);
            }
            Ok(())
        }
        Commands::Schema { out } => {
            let schema = serde_json::to_string_pretty(&graph_schema())?;
            match out {
                Some(path) => {
                    fs::write(&path, schema)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Schema written to {}", path.display());
                }
                None => println!("{schema}"),
            }
            Ok(())
        }
    }
}

async fn validate(file: &Path, env_file: PathBuf) -> anyhow::Result<()> {
    let def = GraphDefinition::from_file(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let routing = RoutingTable::from_definition(&def)?;
    let config = ConfigManager(EnvConfigManager::new(env_file));
    let base = PathTimeoutInfo::from_config(&config).await;

    let nodes: Vec<_> = routing
        .nodes()
        .iter()
        .map(|node| {
            json!({
                "extension": node.loc.to_string(),
                "addon": node.addon,
                "path_timeouts": base.with_properties(&node.property),
            })
        })
        .collect();
    info!(graph = %routing.graph_id(), nodes = nodes.len(), "graph is valid");
    println!("✅ Graph `{}` is valid.", routing.graph_id());
    println!("{}", serde_json::to_string_pretty(&nodes)?);
    Ok(())
}
