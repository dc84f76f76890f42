//! CircuitGraph CLI - ingest draw.io electrical schematics from the command line.

use anyhow::Context;
use circuitgraph::{
    discover_diagrams, Category, CircuitGraph, Config, IngestResult, Inspection, Neo4jConfig,
    StoreConfig, UnsupportedPolicy,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "circuitgraph")]
#[command(about = "Ingest draw.io electrical schematics into a graph store", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest draw.io files (or every diagram under a directory) into a store
    Ingest {
        /// Paths to .drawio/.xml files or directories
        #[arg(value_name = "FILE", required = true)]
        paths: Vec<PathBuf>,

        /// JSON configuration file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Store backend; overrides the config file
        #[arg(long, value_enum)]
        store: Option<StoreKind>,

        /// SQLite database path (implies --store sqlite)
        #[arg(long, value_name = "PATH")]
        sqlite_path: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,

        /// Emit an outcome for elements with an unsupported shape
        #[arg(long)]
        report_unsupported: bool,

        /// Exit with error code if any element failed to commit
        #[arg(long)]
        fail_on_error: bool,
    },

    /// Parse and classify a diagram without committing it
    Inspect {
        /// Path to a .drawio file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// List supported element categories
    Categories {
        /// Show category descriptions
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output for scripts
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Memory,
    Sqlite,
    Neo4j,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Ingest {
            paths,
            config,
            store,
            sqlite_path,
            format,
            report_unsupported,
            fail_on_error,
        } => {
            let overrides = Overrides {
                log_level: cli.log_level,
                store,
                sqlite_path,
                report_unsupported,
            };
            handle_ingest(&paths, config.as_deref(), overrides, format, fail_on_error).await
        }
        Commands::Inspect { file, format } => handle_inspect(&file, cli.log_level, format),
        Commands::Categories { verbose } => {
            handle_categories(verbose);
            Ok(0)
        }
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    process::exit(exit_code);
}

struct Overrides {
    log_level: Option<String>,
    store: Option<StoreKind>,
    sqlite_path: Option<PathBuf>,
    report_unsupported: bool,
}

fn load_config(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env().context("applying environment overrides")?;

    if let Some(level) = overrides.log_level {
        config.log_level = level;
    }
    let store = match (overrides.store, overrides.sqlite_path) {
        (Some(StoreKind::Sqlite) | None, Some(path)) => Some(StoreConfig::Sqlite { path }),
        (Some(StoreKind::Sqlite), None) => match &config.store {
            StoreConfig::Sqlite { .. } => None,
            _ => Some(StoreConfig::Sqlite {
                path: PathBuf::from("circuitgraph.db"),
            }),
        },
        (Some(StoreKind::Memory), _) => Some(StoreConfig::Memory),
        (Some(StoreKind::Neo4j), _) => match &config.store {
            StoreConfig::Neo4j(_) => None,
            _ => Some(StoreConfig::Neo4j(Neo4jConfig::default())),
        },
        (None, None) => None,
    };
    if let Some(store) = store {
        config.store = store;
    }
    if overrides.report_unsupported {
        config.pipeline.unsupported = UnsupportedPolicy::Report;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(config.level()?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

async fn handle_ingest(
    paths: &[PathBuf],
    config_path: Option<&Path>,
    overrides: Overrides,
    format: OutputFormat,
    fail_on_error: bool,
) -> anyhow::Result<i32> {
    let config = load_config(config_path, overrides)?;
    init_logging(&config)?;

    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(discover_diagrams(path)?);
        } else {
            files.push(path.clone());
        }
    }
    if files.is_empty() {
        anyhow::bail!("no draw.io files found");
    }

    let service = CircuitGraph::from_config(&config)?;
    tracing::debug!(files = files.len(), store = service.store().name(), "starting ingest");
    let mut results = Vec::new();
    let mut fatal = false;
    for file in &files {
        match service.ingest_file(file).await {
            Ok(result) => results.push(result),
            Err(e) => {
                eprintln!("Error: {}: {}", file.display(), e);
                fatal = true;
            }
        }
    }

    match format {
        OutputFormat::Human => output_human(&results),
        OutputFormat::Json => output_json(&results)?,
    }

    if fatal {
        return Ok(1);
    }
    if fail_on_error && results.iter().any(|r| r.stats.has_failures()) {
        return Ok(1);
    }
    Ok(0)
}

fn output_human(results: &[IngestResult]) {
    for result in results {
        let file = result
            .file
            .as_ref()
            .map(|f| f.display().to_string())
            .unwrap_or_default();
        println!("\nFile: {}", file);
        println!("{}", "─".repeat(60));
        println!(
            "  Diagram: {} ({})",
            result.report.diagram_name, result.report.diagram_id
        );
        println!("  Store:   {}", result.report.store);

        let failures: Vec<_> = result.failures().collect();
        if !failures.is_empty() {
            println!("\n  FAILURES:");
            for outcome in failures {
                let el = &outcome.element;
                let error = outcome.error().map(|e| e.to_string()).unwrap_or_default();
                println!("    - #{} ({}): {}", el.id, el.kind, error);
            }
        }

        println!("\n  Summary:");
        println!("    Components:  {}", result.stats.committed_components);
        println!("    Connections: {}", result.stats.committed_connections);
        println!("    Failed:      {}", result.stats.failed);
        println!("    Rejected:    {}", result.stats.rejected);
    }
}

fn output_json(results: &[IngestResult]) -> anyhow::Result<()> {
    let output = serde_json::json!({
        "results": results.iter().map(|r| {
            serde_json::json!({
                "file": r.file.as_ref().map(|f| f.display().to_string()),
                "diagram_id": r.report.diagram_id,
                "stats": r.stats,
                "report": r.report,
                "failures": r.failures().collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
        "summary": {
            "total_files": results.len(),
            "committed": results.iter().map(|r| r.stats.committed()).sum::<usize>(),
            "failed": results.iter().map(|r| r.stats.failed).sum::<usize>(),
        }
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn handle_inspect(file: &Path, log_level: Option<String>, format: OutputFormat) -> anyhow::Result<i32> {
    let mut config = Config::default();
    config.log_level = log_level.unwrap_or_else(|| "warn".to_string());
    init_logging(&config)?;

    let service = CircuitGraph::from_config(&config)?;
    let inspection = service
        .inspect_file(file)
        .with_context(|| format!("inspecting {}", file.display()))?;

    match format {
        OutputFormat::Human => output_inspection(&inspection),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&inspection)?),
    }
    Ok(0)
}

fn output_inspection(inspection: &Inspection) {
    println!(
        "Diagram: {} ({})",
        inspection.diagram.name, inspection.diagram.uuid
    );
    println!("{}", "─".repeat(60));
    for el in &inspection.elements {
        let endpoints = match (el.source_id, el.target_id) {
            (None, None) if el.route() != "edge" => String::new(),
            (s, t) => format!(
                " {} -> {}",
                s.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
                t.map(|v| v.to_string()).unwrap_or_else(|| "?".into())
            ),
        };
        println!(
            "  #{:<5} {:<12} {:<11} {}{}",
            el.id,
            el.route(),
            el.kind,
            el.sub_kind,
            endpoints
        );
    }
    println!(
        "\n  {} elements, {} supported",
        inspection.elements.len(),
        inspection.supported()
    );
}

fn handle_categories(verbose: bool) {
    println!("Supported element categories:\n");
    for category in Category::ALL {
        let role = if category.is_component() {
            "component"
        } else {
            "connection"
        };
        println!("  {} ({})", category, role);
        if verbose {
            println!("    {}", category.description());
        }
        println!();
    }
}
