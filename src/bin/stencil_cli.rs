//! Stencil CLI - Bridge interface for host applications
//!
//! Commands: units, check, render
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on sandbox or runtime failure

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use stencil_core::{
    Context, EngineConfig, Policy, RenderError, Renderer, UnitLoader, UnitRegistry,
    unit_cache_key,
};

#[derive(Parser)]
#[command(name = "stencil-cli")]
#[command(about = "Stencil CLI - Sandboxed Template Renderer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to engine config (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to compiled units directory (overrides config)
    #[arg(short, long)]
    units_dir: Option<PathBuf>,

    /// Path to policy file (overrides config)
    #[arg(short, long)]
    policy: Option<PathBuf>,

    /// Fail on undefined variables
    #[arg(long)]
    strict: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List compiled units
    Units,

    /// Run the sandbox check for a unit
    Check {
        /// Unit name
        #[arg(short, long)]
        unit: String,
    },

    /// Render a unit
    Render {
        /// Unit name
        #[arg(short, long)]
        unit: String,

        /// JSON object used as render context
        #[arg(short = 'x', long, default_value = "{}")]
        context: String,
    },
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn failure(error: impl std::fmt::Display) -> String {
    serde_json::json!({"success": false, "error": error.to_string()}).to_string()
}

fn error_json(e: &RenderError) -> serde_json::Value {
    match e {
        RenderError::Security(err) => serde_json::json!({
            "success": false,
            "error": e.to_string(),
            "kind": err.kind(),
            "name": err.name(),
            "line": err.line(),
            "unit": err.template_name(),
        }),
        _ => serde_json::json!({
            "success": false,
            "error": e.to_string(),
            "unit": e.unit_name(),
        }),
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                println!("{}", failure(e));
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };
    if let Some(dir) = cli.units_dir {
        config.units_dir = dir;
    }
    if let Some(path) = &cli.policy {
        config.policy = match Policy::from_file(path) {
            Ok(p) => p,
            Err(e) => {
                println!("{}", failure(e));
                return ExitCode::FAILURE;
            }
        };
    }
    if cli.strict {
        config.strict_variables = true;
    }
    debug!(units_dir = %config.units_dir.display(), "configuration resolved");

    let registry = match UnitRegistry::load_from_dir(&config.units_dir) {
        Ok(r) => r,
        Err(e) => {
            println!("{}", failure(format!("Failed to load units: {}", e)));
            return ExitCode::FAILURE;
        }
    };

    let renderer = Renderer::new(registry).with_options(config.render_options());
    let policy = &config.policy;

    match cli.command {
        Commands::Units => {
            let units: Vec<_> = renderer.loader().list()
                .iter()
                .map(|u| serde_json::json!({
                    "name": u.name(),
                    "path": u.source().path(),
                    "parent": u.parent(),
                    "usage": u.usage(),
                    "cacheKey": unit_cache_key(u),
                }))
                .collect();

            println!("{}", serde_json::Value::Array(units));
            ExitCode::SUCCESS
        }

        Commands::Check { unit } => {
            let loaded = match renderer.loader().load(&unit) {
                Ok(u) => u,
                Err(e) => {
                    println!("{}", failure(e));
                    return ExitCode::FAILURE;
                }
            };

            match renderer.check(&loaded, policy) {
                Ok(()) => {
                    println!("{}", serde_json::json!({"success": true, "unit": unit}));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    println!("{}", error_json(&RenderError::Security(e)));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Render { unit, context } => {
            let context: Context = match serde_json::from_str(&context) {
                Ok(c) => c,
                Err(e) => {
                    println!("{}", failure(format!("Invalid context: {}", e)));
                    return ExitCode::FAILURE;
                }
            };

            match renderer.render_named(&unit, &context, policy) {
                Ok(output) => {
                    println!("{}", serde_json::json!({
                        "success": true,
                        "unit": unit,
                        "output": output,
                    }));
                    ExitCode::SUCCESS
                }
                Err(e @ RenderError::Loader(_)) => {
                    println!("{}", error_json(&e));
                    ExitCode::FAILURE
                }
                Err(e) => {
                    println!("{}", error_json(&e));
                    ExitCode::from(2)
                }
            }
        }
    }
}
