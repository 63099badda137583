//! `warden` command-line entry point.
//!
//! `warden run` evaluates one guest program in a fresh kernel wired to an
//! in-process VM link, optionally calls an exported entry point, then
//! retires the kernel and prints everything the guest wrote.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use warden::config::{config_dir, load_config, WardenConfig};
use warden::engine::{SourceUnit, Value};
use warden::kernel::{CallOptions, OutputRecord};
use warden::ledger::ResourceLedger;
use warden::link::{ChannelLink, LinkPayload, LinkRequest, LinkResponse};
use warden::supervisor::KernelSupervisor;
use warden::types::StreamKind;
use warden::vmdb::{InMemoryVmStore, SqliteVmStore, VmStore};

/// Warden: sandbox kernels for guest scripts.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run a guest program in a fresh kernel and print its output.
    Run {
        /// Guest source file.
        guest: PathBuf,
        /// Config file. Defaults to `~/.warden/config.toml` when it exists.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Exported entry point to call after evaluation.
        #[arg(long)]
        call: Option<String>,
        /// JSON array of arguments passed to `--call`.
        #[arg(long, default_value = "[]")]
        args: String,
    },
    /// Validate a config file and print the module install order.
    CheckConfig {
        /// Config file to validate.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            guest,
            config,
            call,
            args,
        } => handle_run(&guest, config.as_deref(), call.as_deref(), &args).await,
        Command::CheckConfig { path } => handle_check_config(&path),
    }
}

fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<WardenConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let default_path = config_dir()?.join("config.toml");
    if default_path.exists() {
        load_config(&default_path)
    } else {
        Ok(WardenConfig::default())
    }
}

async fn handle_run(
    guest: &Path,
    config_path: Option<&Path>,
    call: Option<&str>,
    args: &str,
) -> anyhow::Result<()> {
    let config = resolve_config(config_path)?;
    let _logging_guard = match &config.logging.dir {
        Some(dir) => Some(warden::logging::init_production(dir)?),
        None => {
            warden::logging::init_cli();
            None
        }
    };

    let args: Vec<Value> = serde_json::from_str(args).context("--args must be a JSON array")?;
    let unit = SourceUnit::from_file(guest)
        .with_context(|| format!("failed to read guest {}", guest.display()))?;

    let store: Arc<dyn VmStore> = match &config.database.path {
        Some(path) => Arc::new(SqliteVmStore::open(path).await?),
        None => Arc::new(InMemoryVmStore::new()),
    };
    let ledger = Arc::new(ResourceLedger::new(&config.quota));
    let supervisor = KernelSupervisor::new(config.kernel_config(), ledger, store);

    let (link, endpoint) = ChannelLink::pair("cli", config.link.buffer, config.link_timeout());
    let server = endpoint.serve(answer_locally);

    let kernel = supervisor.spawn(Arc::new(link)).await?;
    let id = kernel.id();
    drop(kernel);

    let outcome = async {
        let evaluated = supervisor.run(id, unit, CallOptions::default()).await?;
        let value = match call {
            Some(entry) => {
                supervisor
                    .call(id, entry, args, CallOptions::default())
                    .await?
                    .value
            }
            None => evaluated.value,
        };
        Ok::<Value, anyhow::Error>(value)
    }
    .await;

    let output = supervisor.retire(id).await?;
    server.abort();
    print_output(&output);

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn handle_check_config(path: &Path) -> anyhow::Result<()> {
    warden::logging::init_cli();
    let config = load_config(path)?;
    info!(path = %path.display(), modules = config.modules.len(), "config is valid");
    for (index, module) in config.modules.iter().enumerate() {
        println!("{index}: {}", module.name());
    }
    Ok(())
}

/// Stand-in for the outer VM process: answers pings, echoes RPCs.
fn answer_locally(request: &LinkRequest) -> LinkResponse {
    match &request.payload {
        LinkPayload::Ping => LinkResponse::ok(request, json!("pong")),
        LinkPayload::Rpc { method, params } => {
            LinkResponse::ok(request, json!({ "method": method, "params": params }))
        }
        LinkPayload::Lifecycle { state } => {
            info!(kernel = %request.kernel, state = %state, "kernel lifecycle");
            LinkResponse::ok(request, Value::Null)
        }
    }
}

fn print_output(records: &[OutputRecord]) {
    for record in records {
        match record.stream {
            StreamKind::Stdout => println!("{}", record.text),
            StreamKind::Stderr => eprintln!("{}", record.text),
        }
    }
}
