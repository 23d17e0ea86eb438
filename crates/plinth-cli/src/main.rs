use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plinth_core::{
    app,
    config::Config,
    discovery,
    plugin::PluginRegistry,
    server::Server,
};
use regex::Regex;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

#[path = "../../../plugins/legacy/legacy.plugin.rs"]
mod legacy;
#[path = "../../../plugins/notes/notes.plugin.rs"]
mod notes;
#[path = "../../../plugins/ping/ping.plugin.rs"]
mod ping;

const DEFAULT_CONFIG: &str = "config/plinth.toml";

#[derive(Parser, Debug)]
#[command(name = "plinth", author, version, about = "Plugin-hosting REST API server")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load plugins and serve the API.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate or print configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect plugins under the configured root.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Run a full load without serving and dump config, report and routes as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled default configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists discovered manifests and whether an implementation is registered.
    List {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Run { config } => handle_run(&config).await,
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command),
        Commands::Diag { config } => handle_diag(&config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    fmt().with_env_filter(log_filter(level)).try_init().ok();
    Ok(())
}

/// Filter built from `--log-level` alone; unparsable levels fall back to `info`.
fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Plugins compiled into this binary, keyed by their directory id.
fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register_default::<ping::Ping>("ping")
        .register_default::<notes::Notes>("notes")
        .register_default::<legacy::Legacy>("legacy");
    registry
}

async fn handle_run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let (router, report) = app::build(&config, &registry())?;
    for (plugin, err) in report.failures() {
        tracing::warn!(%plugin, error = %err, "plugin not loaded");
    }
    tracing::info!(
        api = %config.api.prefix(),
        plugins = ?report.compatible_plugins,
        routes = router.len(),
        docs = %config.docs.path,
        "api ready"
    );
    Server::new(&config, router)?.run().await
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../config/plinth.toml"));
        }
    }
    Ok(())
}

fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { config } => {
            let cfg = load_config(&config)?;
            let registry = registry();
            let found = discovery::discover(&cfg.plugins.root, &cfg.plugins)?;
            if found.manifests.is_empty() {
                println!("no plugins found under {}", cfg.plugins.root.display());
            }
            for (id, manifest) in found.manifests.iter() {
                let mut flags = Vec::new();
                if !manifest.enabled {
                    flags.push("disabled");
                }
                if !registry.contains(id) {
                    flags.push("no implementation");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(", "))
                };
                let description = manifest
                    .description()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default();
                println!(
                    "- {id} ({} v{}){flags}{description}",
                    manifest.name, manifest.version
                );
            }
            for rejected in &found.rejected {
                println!("! {rejected}");
            }
        }
    }
    Ok(())
}

fn handle_diag(path: &Path) -> Result<()> {
    let cfg = load_config(path)?;
    let (router, report) = app::build(&cfg, &registry())?;
    let routes: Vec<_> = router
        .routes()
        .map(|route| {
            json!({
                "method": route.method.as_str(),
                "path": route.pattern,
                "plugin": route.owner,
            })
        })
        .collect();
    let failures: serde_json::Map<_, _> = report
        .failures()
        .map(|(id, err)| (id.to_string(), json!(err.to_string())))
        .collect();
    let dump = json!({
        "config": cfg,
        "report": report,
        "failures": failures,
        "routes": routes,
    });
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(cfg)
}

/// Expands `${VAR}` and `${VAR:default}` from the process environment.
fn interpolate_env(input: &str) -> Result<String> {
    let regex = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}")?;
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}
