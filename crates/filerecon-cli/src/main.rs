mod commands;
mod logging;
mod progress;

use std::io;
use std::process;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, OutputFormat};
use dotenv::dotenv;
use filerecon_core::{AppConfig, FileDescriptor, LogicalFileSummary, SyncEngine};
use progress::CliReporter;
use tracing::{error, info, warn};

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match filerecon_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let outcome = match args.command {
        Some(Commands::Sync { list }) => run_sync(&config, list),
        Some(Commands::Files { format }) => run_files(&config, format),
        Some(Commands::Entries { json }) => run_entries(&config, json),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
            Ok(())
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = outcome {
        error!("Error: {:#}", err);
        process::exit(1);
    }
}

fn build_engine(config: &AppConfig) -> Result<SyncEngine> {
    if config.backends.is_empty() {
        warn!("No backends configured; set [[backends]] in Config.toml or LOCAL_ROOT");
    }
    SyncEngine::from_config(config).context("initializing sync engine")
}

fn run_sync(config: &AppConfig, list: bool) -> Result<()> {
    let engine = build_engine(config)?;
    let reporter = CliReporter::new();
    let report = engine.sync(&reporter)?;

    println!();
    info!(
        "Sync: {}, {} descriptors, {} comparisons",
        format!("{:.2}s", report.duration.as_secs_f64()).green(),
        format!("{}", report.descriptors_processed).cyan(),
        format!("{}", report.comparisons).cyan(),
    );
    info!(
        "{} logical files, {} classifier fallbacks",
        format!("{}", report.logical_files).green(),
        format!("{}", report.classifier_fallbacks).yellow(),
    );
    for failure in &report.degraded {
        warn!("{} {}", "degraded".red(), failure);
    }

    if list {
        print_table(&engine.list_files());
    }
    Ok(())
}

fn run_files(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let engine = build_engine(config)?;
    engine.trigger_sync()?;
    let files = engine.list_files();

    match format {
        OutputFormat::Table => print_table(&files),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&files)?),
        OutputFormat::Csv => write_csv(&files)?,
    }
    Ok(())
}

fn run_entries(config: &AppConfig, json: bool) -> Result<()> {
    let engine = build_engine(config)?;
    let enumeration = engine.collect_descriptors()?;
    for failure in &enumeration.degraded {
        warn!("{} {}", "degraded".red(), failure);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&enumeration.descriptors)?);
    } else {
        print_descriptors(&enumeration.descriptors);
    }
    Ok(())
}

fn print_table(files: &[LogicalFileSummary]) {
    if files.is_empty() {
        println!("{}", "No files reconciled".yellow());
        return;
    }
    println!(
        "{:<40} {:>12} {:>8} {:<12} {}",
        "NAME".bold(),
        "SIZE".bold(),
        "BACKUPS".bold(),
        "SENSITIVITY".bold(),
        "LOCATIONS".bold(),
    );
    for file in files {
        let sensitivity = match file.sensitivity {
            filerecon_core::Sensitivity::Sensitive => file.sensitivity.to_string().red(),
            filerecon_core::Sensitivity::Insensitive => file.sensitivity.to_string().normal(),
        };
        let backups = if file.backup_count == 0 {
            file.backup_count.to_string().yellow()
        } else {
            file.backup_count.to_string().green()
        };
        println!(
            "{:<40} {:>12} {:>8} {:<12} {}",
            truncate(&file.name, 40),
            file.size,
            backups,
            sensitivity,
            file.locations.join(", "),
        );
    }
    println!("\n{} logical files", files.len());
}

fn print_descriptors(descriptors: &[FileDescriptor]) {
    for d in descriptors {
        println!(
            "{:<12} {:<50} {:>12} {}",
            d.backend_id.cyan(),
            truncate(&d.path, 50),
            d.size,
            &d.fingerprint.as_str()[..12.min(d.fingerprint.as_str().len())],
        );
    }
    println!("\n{} descriptors", descriptors.len());
}

fn write_csv(files: &[LogicalFileSummary]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(io::stdout());
    writer.write_record([
        "id",
        "name",
        "path",
        "size",
        "last_modified",
        "fingerprint",
        "sensitivity",
        "backup_count",
        "locations",
        "updated_at",
    ])?;
    for file in files {
        writer.write_record([
            file.id.to_string(),
            file.name.clone(),
            file.path.clone(),
            file.size.to_string(),
            file.last_modified.map(|t| t.to_rfc3339()).unwrap_or_default(),
            file.fingerprint.to_string(),
            file.sensitivity.to_string(),
            file.backup_count.to_string(),
            file.locations.join(";"),
            file.updated_at.to_rfc3339(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let kept: String = value.chars().take(width.saturating_sub(1)).collect();
    format!("{}…", kept)
}
