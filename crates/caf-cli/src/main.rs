use anyhow::{anyhow, Result};
use caf_core::{ExpRun, PayloadStore};
use caf_runner::config::expand_input_paths;
use caf_runner::{CafConfig, DependencyGraph, RunSummary};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "caf", version, about = "Calibration orchestration driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every calibration of a configuration file.
    Run {
        config: PathBuf,
        /// Input files or directories for calibrations without configured inputs.
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        heartbeat_seconds: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration and print the execution order.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Inspect a local payload database.
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    List {
        #[arg(long)]
        database: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Lookup {
        #[arg(long)]
        database: PathBuf,
        #[arg(long)]
        payload: String,
        #[arg(long)]
        exp: i32,
        #[arg(long)]
        run: i32,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Outcome { payload, success }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

struct Outcome {
    payload: Option<Value>,
    success: bool,
}

impl Outcome {
    fn ok(payload: Option<Value>) -> Self {
        Self {
            payload,
            success: true,
        }
    }
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Run {
            config,
            inputs,
            output_dir,
            heartbeat_seconds,
            json,
        } => {
            let files = match expand_input_paths(&inputs) {
                Ok(files) => files,
                Err(err) => usage_exit(&err.to_string(), json),
            };
            let mut cfg = CafConfig::load(&config)?;
            if let Some(dir) = output_dir {
                cfg.caf.output_dir = dir;
            }
            if let Some(seconds) = heartbeat_seconds {
                cfg.caf.heartbeat_seconds = seconds;
            }
            cfg.fill_missing_inputs(&files);
            let mut caf = cfg.build()?;
            info!(config = %config.display(), "configuration loaded");
            let summary = caf.run()?;
            let success = summary.all_done();
            if json {
                let payload = json!({
                    "ok": success,
                    "command": "run",
                    "summary": summary.to_json()?,
                });
                return Ok(Outcome {
                    payload: Some(payload),
                    success,
                });
            }
            print!("{}", summary.render());
            print_summary_path(&summary);
            Ok(Outcome {
                payload: None,
                success,
            })
        }
        Commands::Describe { config, json } => {
            let description = describe(&config)?;
            if json {
                return Ok(Outcome::ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "describe": description,
                }))));
            }
            print_description(&description);
            Ok(Outcome::ok(None))
        }
        Commands::Db { command } => db_command(command),
    }
}

fn db_command(command: DbCommands) -> Result<Outcome> {
    match command {
        DbCommands::List { database, json } => {
            let store = PayloadStore::open_existing(&database)?;
            let entries = store.entries()?;
            if json {
                return Ok(Outcome::ok(Some(json!({
                    "ok": true,
                    "command": "db-list",
                    "database": store.dir().display().to_string(),
                    "entries": entries,
                }))));
            }
            for entry in &entries {
                println!("{} rev {} iov {}", entry.name, entry.revision, entry.iov);
            }
            Ok(Outcome::ok(None))
        }
        DbCommands::Lookup {
            database,
            payload,
            exp,
            run,
            json,
        } => {
            let store = PayloadStore::open_existing(&database)?;
            let exprun = ExpRun::new(exp, run);
            let (entry, bytes) = store
                .lookup(&payload, exprun)?
                .ok_or_else(|| anyhow!("no revision of {} is valid for run {}", payload, exprun))?;
            let blob = store.dir().join(entry.blob_file_name());
            if json {
                return Ok(Outcome::ok(Some(json!({
                    "ok": true,
                    "command": "db-lookup",
                    "entry": entry,
                    "blob": blob.display().to_string(),
                    "bytes": bytes.len(),
                }))));
            }
            println!("payload: {}", entry.name);
            println!("revision: {}", entry.revision);
            println!("iov: {}", entry.iov);
            println!("blob: {}", blob.display());
            println!("bytes: {}", bytes.len());
            Ok(Outcome::ok(None))
        }
    }
}

/// Loads and validates a configuration without touching the filesystem
/// beyond reading it.
fn describe(config: &Path) -> Result<Value> {
    let cfg = CafConfig::load(config)?;
    cfg.validate()?;
    let graph = DependencyGraph::from_dependencies(
        cfg.calibrations
            .iter()
            .map(|c| (c.name.as_str(), c.depends_on.as_slice())),
    )?;
    let order = graph.topological_order()?;
    let calibrations: Vec<Value> = order
        .iter()
        .filter_map(|name| cfg.calibrations.iter().find(|c| &c.name == name))
        .map(|c| {
            json!({
                "name": c.name,
                "depends_on": c.depends_on,
                "algorithms": c.algorithms.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
                "max_iterations": c.max_iterations.unwrap_or(cfg.caf.max_iterations),
                "input_entries": c.input_files.len(),
            })
        })
        .collect();
    Ok(json!({
        "config": config.display().to_string(),
        "backend": cfg.backend.kind,
        "output_dir": cfg.caf.output_dir.display().to_string(),
        "order": order,
        "calibrations": calibrations,
    }))
}

fn print_description(description: &Value) {
    println!("backend: {}", description["backend"].as_str().unwrap_or("?"));
    println!("output_dir: {}", description["output_dir"].as_str().unwrap_or("?"));
    let empty = Vec::new();
    let calibrations = description["calibrations"].as_array().unwrap_or(&empty);
    for (i, cal) in calibrations.iter().enumerate() {
        let deps: Vec<&str> = cal["depends_on"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        println!(
            "{}. {} (max_iterations {}){}",
            i + 1,
            cal["name"].as_str().unwrap_or("?"),
            cal["max_iterations"],
            if deps.is_empty() {
                String::new()
            } else {
                format!(" after {}", deps.join(", "))
            }
        );
    }
}

fn print_summary_path(summary: &RunSummary) {
    println!(
        "summary: {}",
        summary.output_dir.join(caf_runner::summary::SUMMARY_FILE).display()
    );
}

fn usage_exit(message: &str, json: bool) -> ! {
    if json {
        emit_json(&json_error("usage", message.to_string(), json!({})));
    } else {
        eprintln!("error: {}\n\n{}", message, Cli::command().render_usage());
    }
    std::process::exit(1);
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Db { command } => match command {
            DbCommands::List { json, .. } | DbCommands::Lookup { json, .. } => *json,
        },
    }
}
