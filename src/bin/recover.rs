//! ppk-recover - Validation, recovery and export tool for probe sessions
//!
//! Usage:
//!   ppk-recover validate <container>                 - Check container integrity
//!   ppk-recover info <session-dir|container>         - Show metadata
//!   ppk-recover recover <session.raw> [-o <dir>]     - Rebuild sidecars of a bare log
//!   ppk-recover export <session-dir> -o <container>  - Bundle a session
//!   ppk-recover import <container> -o <dir>          - Unpack a container
//!   ppk-recover import-legacy <file> -o <dir>        - Convert a legacy recording

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ppk_rs::common::cli::{RecoverArgs, RecoverCommand};
use ppk_rs::common::{index_to_offset, offset_to_index, AcquisitionCounters};
use ppk_rs::config::Config;
use ppk_rs::folding::FoldingBuffer;
use ppk_rs::session::{
    recover_log, ContainerReader, ContainerValidation, Session, SessionMetadata, LOG_FILE,
    METADATA_FILE, MINIMAP_FILE,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ppk_rs=info".parse()?))
        .init();

    let args = RecoverArgs::parse();
    let config = Config::load_or_default(&args.common.config_file)
        .with_context(|| format!("loading {}", args.common.config_file))?;

    match args.command {
        RecoverCommand::Validate { file } => validate_container(&file),
        RecoverCommand::Info { path } => show_info(&path),
        RecoverCommand::Recover {
            log,
            output,
            duration,
        } => recover(&log, output.as_deref(), &config, duration),
        RecoverCommand::Export { session, output } => export(&session, &output, &config).await,
        RecoverCommand::Import { file, output } => {
            let session = Session::import(&file, &output, &config, counters()).await?;
            println!(
                "\x1b[32m✓ Imported {} samples into {}\x1b[0m",
                session.sample_count(),
                output.display()
            );
            session.close().await?;
            Ok(())
        }
        RecoverCommand::ImportLegacy { file, output } => {
            let session = Session::import_legacy(&file, &output, &config, counters()).await?;
            println!(
                "\x1b[32m✓ Converted {} samples at {} samples/s into {}\x1b[0m",
                session.sample_count(),
                session.metadata().samples_per_second,
                output.display()
            );
            session.close().await?;
            Ok(())
        }
    }
}

fn counters() -> Arc<AcquisitionCounters> {
    Arc::new(AcquisitionCounters::new())
}

fn format_time(unix_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(unix_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| format!("{unix_ms} (invalid)"))
}

fn open_container(path: &Path) -> Result<ContainerReader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(ContainerReader::new(BufReader::new(file))?)
}

fn validate_container(path: &Path) -> Result<()> {
    println!("Validating: {}", path.display());
    println!();

    let mut reader = open_container(path)?;
    let result = reader.validate();
    print_validation_result(&result);

    if result.is_valid {
        println!("\n\x1b[32m✓ Container is valid\x1b[0m");
        Ok(())
    } else {
        println!("\n\x1b[31m✗ Container is corrupted\x1b[0m");
        bail!("{} validation error(s)", result.errors.len())
    }
}

fn print_validation_result(result: &ContainerValidation) {
    if let Some(header) = &result.header {
        println!("  Samples/s:      {}", header.samples_per_second);
        println!("  Samples:        {}", header.sample_count);
    }
    for (name, len) in [METADATA_FILE, MINIMAP_FILE, LOG_FILE]
        .iter()
        .zip(&result.section_lengths)
    {
        println!("  {:<15} {} bytes", format!("{name}:"), len);
    }
    if let Some(footer) = &result.footer {
        println!("  Complete:       {}", footer.is_complete());
        println!("  Checksum:       {:016x}", footer.checksum);
    }
    for err in &result.errors {
        println!("  \x1b[31mError: {}\x1b[0m", err);
    }
}

fn show_info(path: &Path) -> Result<()> {
    if path.is_dir() {
        show_session_info(path)
    } else {
        show_container_info(path)
    }
}

fn show_session_info(dir: &Path) -> Result<()> {
    let metadata = SessionMetadata::load(dir.join(METADATA_FILE))
        .with_context(|| format!("reading {}", dir.join(METADATA_FILE).display()))?;
    let log_len = std::fs::metadata(dir.join(LOG_FILE))
        .map(|m| m.len())
        .unwrap_or(0);
    let samples = offset_to_index(log_len);

    println!("Session: {}", dir.display());
    println!();
    println!("=== Metadata ===");
    println!("  Format Version: {}", metadata.format_version);
    println!("  Samples/s:      {}", metadata.samples_per_second);
    println!("  Start Time:     {}", format_time(metadata.start_system_time));
    println!();
    println!("=== Log ===");
    println!("  Size:           {} bytes", log_len);
    println!("  Samples:        {}", samples);
    println!(
        "  Duration:       {:.3} s",
        samples as f64 / metadata.samples_per_second
    );
    if log_len != index_to_offset(samples) {
        println!("  \x1b[33mTrailing partial record\x1b[0m");
    }

    println!();
    println!("=== Minimap ===");
    match std::fs::read_to_string(dir.join(MINIMAP_FILE))
        .map_err(anyhow::Error::from)
        .and_then(|json| Ok(FoldingBuffer::from_json(&json)?))
    {
        Ok(folding) => {
            println!("  Slots:          {}", folding.len());
            println!("  Capacity:       {}", folding.max_number_of_elements());
            println!("  Samples/slot:   {}", folding.number_of_times_to_fold());
        }
        Err(e) => {
            println!("  \x1b[33mUnavailable: {}\x1b[0m", e);
            println!("  Run: ppk-recover recover \"{}\"", dir.join(LOG_FILE).display());
        }
    }
    Ok(())
}

fn show_container_info(path: &Path) -> Result<()> {
    let mut reader = open_container(path)?;
    let header = reader.header().clone();

    println!("Container: {}", path.display());
    println!("Size: {} bytes", std::fs::metadata(path)?.len());
    println!();
    println!("=== Header ===");
    println!("  Version:        {}", header.version);
    println!("  Format Version: {}", header.format_version);
    println!("  Samples/s:      {}", header.samples_per_second);
    println!("  Start Time:     {}", format_time(header.start_system_time));
    println!("  Samples:        {}", header.sample_count);

    println!();
    println!("=== Footer ===");
    match reader.read_footer() {
        Ok(footer) => {
            println!("  Complete:       {}", footer.is_complete());
            println!("  Section Bytes:  {}", footer.section_bytes);
            println!("  Checksum:       {:016x}", footer.checksum);
            println!("  Exported:       {}", format_time(footer.export_time_ms));
        }
        Err(e) => println!("  \x1b[33mCould not read footer: {}\x1b[0m", e),
    }
    Ok(())
}

fn recover(log: &Path, output: Option<&Path>, config: &Config, duration: Option<f64>) -> Result<()> {
    println!("Recovering: {}", log.display());

    let report = recover_log(log, output, config, duration)?;

    println!();
    println!("\x1b[32m✓ Recovery complete\x1b[0m");
    println!("  Session:        {}", report.session_dir.display());
    println!("  Samples:        {}", report.sample_count);
    println!("  Duration:       {:.3} s", report.duration_secs);
    println!("  Inferred rate:  {} samples/s", report.samples_per_second);
    println!("  Start Time:     {}", format_time(report.start_system_time));
    println!("  Minimap slots:  {}", report.folding_len);
    Ok(())
}

async fn export(dir: &Path, output: &Path, config: &Config) -> Result<()> {
    println!("Exporting: {}", dir.display());

    let mut session = Session::open(dir, config, counters()).await?;
    let footer = session.export(output).await;
    let closed = session.close().await;
    let footer = footer?;
    closed?;

    println!();
    println!("\x1b[32m✓ Export complete\x1b[0m");
    println!("  Output:         {}", output.display());
    println!("  Samples:        {}", footer.sample_count);
    println!("  Checksum:       {:016x}", footer.checksum);
    println!(
        "  Output size:    {} bytes",
        std::fs::metadata(output)?.len()
    );
    Ok(())
}
