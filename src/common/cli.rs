//! CLI argument parsing for the acquisition binaries
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Each binary has its own Args struct that embeds CommonArgs

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Common arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file (defaults are used when it does not exist)
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,
}

/// Wire variant selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VariantArg {
    /// Escaped-burst frames (RTT probe)
    Escaped,
    /// Fixed 4-byte frames (serial probe)
    Fixed,
}

/// Arguments for the acquire binary
#[derive(Parser, Debug, Clone)]
#[command(name = "acquire")]
#[command(about = "Decode a probe byte stream into a session directory")]
pub struct AcquireArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Raw probe capture to decode (omit to use the built-in emulator)
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Wire variant of the input
    #[arg(long, value_enum)]
    pub variant: Option<VariantArg>,

    /// Output session directory
    #[arg(short = 'o', long = "output")]
    pub output_dir: Option<PathBuf>,

    /// Emulated acquisition length in seconds
    #[arg(long, default_value = "1")]
    pub seconds: u64,

    /// Soft trigger level in microamperes (enables trigger mode)
    #[arg(long = "trigger-level")]
    pub trigger_level: Option<f32>,
}

/// Arguments for the recover binary
#[derive(Parser, Debug, Clone)]
#[command(name = "ppk-recover")]
#[command(about = "Validation, recovery and export tool for probe sessions")]
#[command(version)]
pub struct RecoverArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: RecoverCommand,
}

/// Subcommands of the recover binary
#[derive(Subcommand, Debug, Clone)]
pub enum RecoverCommand {
    /// Validate an export container
    Validate {
        /// Path to the container
        file: PathBuf,
    },

    /// Show session or container metadata
    Info {
        /// Session directory or container path
        path: PathBuf,
    },

    /// Rebuild metadata and minimap from a bare session log
    Recover {
        /// Path to session.raw
        log: PathBuf,

        /// Output directory (default: directory of the log)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Recording length in seconds when the filesystem has no birth time
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Bundle a session directory into an export container
    Export {
        /// Session directory
        session: PathBuf,

        /// Output container path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Unpack an export container into a session directory
    Import {
        /// Container path
        file: PathBuf,

        /// Output session directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import a legacy single-stream file into a new session directory
    ImportLegacy {
        /// Legacy file
        file: PathBuf,

        /// Output session directory
        #[arg(short, long)]
        output: PathBuf,
    },
}
