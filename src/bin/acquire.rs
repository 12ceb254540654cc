//! acquire - Decode a probe byte stream into a session directory
//!
//! Usage:
//!   acquire [-f config.toml] [-o <dir>] [--seconds N]     - Record from the built-in emulator
//!   acquire -i capture.bin --variant escaped -o <dir>     - Decode a raw capture
//!   acquire --trigger-level 1000                          - Record in trigger mode
//!
//! Progress is logged once per second. Ctrl+C stops the acquisition and
//! closes the session cleanly.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ppk_rs::acquisition::{AcquisitionController, AcquisitionSummary};
use ppk_rs::common::cli::{AcquireArgs, VariantArg};
use ppk_rs::common::shutdown::{setup_shutdown, ShutdownSender};
use ppk_rs::common::AcquisitionCounters;
use ppk_rs::config::Config;
use ppk_rs::decoder::{Decoder, WireVariant};
use ppk_rs::emulator::ProbeEmulator;
use ppk_rs::session::Session;
use ppk_rs::transport::{RttTransport, SerialTransport, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ppk_rs=info".parse()?))
        .init();

    let args = AcquireArgs::parse();
    let mut config = Config::load_or_default(&args.common.config_file)
        .with_context(|| format!("loading {}", args.common.config_file))?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    info!(
        config_file = %args.common.config_file,
        variant = %config.decoder.variant,
        samples_per_second = config.session.samples_per_second,
        trigger = config.trigger.enabled,
        "Configuration loaded"
    );

    // Commands are rendered but go nowhere without a device attached
    let transport: Box<dyn Transport + Send> = match config.decoder.variant {
        WireVariant::EscapedBurst => Box::new(RttTransport::new(std::io::sink())),
        WireVariant::FixedFrame => Box::new(SerialTransport::new(std::io::sink())),
    };
    let decoder = transport.decoder(&config);

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.session.output_dir.clone());
    let counters = Arc::new(AcquisitionCounters::new());
    let session = Session::create(&output_dir, &config, counters.clone())
        .await
        .with_context(|| format!("creating session in {}", output_dir.display()))?;
    let start_time = session.metadata().start_time();

    let (shutdown_tx, _shutdown_rx) = setup_shutdown();
    let controller =
        AcquisitionController::new(config.clone(), transport.capabilities(), counters.clone())
            .with_transport(transport);
    let progress = spawn_progress(counters.clone());

    let result = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            info!(input = %path.display(), "Decoding capture");
            run(controller, file, decoder, session, shutdown_tx).await
        }
        None => {
            let frames = args.seconds * config.session.samples_per_second.round() as u64;
            let (stream, emulator) = ProbeEmulator::new(config.emulator.clone()).spawn_stream(frames);
            info!(frames, "Recording from emulator");
            let result = run(controller, stream, decoder, session, shutdown_tx).await;
            emulator.abort();
            result
        }
    };
    progress.abort();

    let summary = result?;
    print_summary(&output_dir, start_time, &summary);
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &AcquireArgs) {
    match args.variant {
        Some(VariantArg::Escaped) => config.decoder.variant = WireVariant::EscapedBurst,
        Some(VariantArg::Fixed) => config.decoder.variant = WireVariant::FixedFrame,
        None => {}
    }
    if args.input.is_none() && config.decoder.variant != WireVariant::FixedFrame {
        warn!("The emulator produces fixed frames, switching variant");
        config.decoder.variant = WireVariant::FixedFrame;
    }
    if let Some(level) = args.trigger_level {
        config.trigger.enabled = true;
        config.trigger.level_ua = level;
    }
}

async fn run<R>(
    controller: AcquisitionController,
    source: R,
    decoder: Decoder,
    session: Session,
    shutdown_tx: ShutdownSender,
) -> Result<AcquisitionSummary>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Ok(controller.run(source, decoder, session, shutdown_tx).await?)
}

fn spawn_progress(counters: Arc<AcquisitionCounters>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        let mut prev = counters.snapshot();
        let mut last = Instant::now();
        loop {
            ticker.tick().await;
            let snapshot = counters.snapshot();
            let elapsed = last.elapsed().as_secs_f64();
            info!(
                samples = snapshot.samples_decoded,
                rate = format!("{:.0}/s", snapshot.sample_rate_from(&prev, elapsed)),
                lost = snapshot.samples_lost,
                pending_bytes = snapshot.pending_bytes(),
                failed_io = snapshot.failed_io_tasks,
                "Progress"
            );
            prev = snapshot;
            last = Instant::now();
        }
    })
}

fn print_summary(dir: &Path, start: Option<DateTime<Utc>>, summary: &AcquisitionSummary) {
    let c = &summary.counters;
    println!();
    println!("\x1b[32m✓ Acquisition complete\x1b[0m");
    println!("  Session:        {}", dir.display());
    if let Some(start) = start {
        println!(
            "  Started:        {}",
            start.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("  Samples:        {}", summary.sample_count);
    println!("  Placeholders:   {}", c.placeholder_samples);
    println!("  Lost:           {}", c.samples_lost);
    println!("  Replayed:       {}", c.frames_replayed);
    println!("  Written:        {} bytes", c.bytes_flushed);
    if summary.storage_errors > 0 || c.failed_io_tasks > 0 {
        println!(
            "  \x1b[31mStorage errors: {} ({} failed writes)\x1b[0m",
            summary.storage_errors, c.failed_io_tasks
        );
    }
    if !summary.windows.is_empty() {
        println!("  Trigger windows: {}", summary.windows.len());
        for (i, window) in summary.windows.iter().enumerate() {
            println!(
                "    [{i}] samples {}..{} ({:.1} us)",
                window.start_index,
                window.end_index,
                window.duration_us()
            );
        }
        if summary.stopped_by_trigger {
            println!("  Stopped after single-shot trigger");
        }
    }
}
