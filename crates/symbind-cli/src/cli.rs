use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use symbind::{CONFIG_FILE, Scope};

/// symbind - locate and bind internal entry points of a stripped host binary
#[derive(Debug, Parser)]
#[command(name = "symbind", version, about, long_about = None)]
pub struct Cli {
    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the compiled-in mapping table, hook sites and feature patches.
    Check,

    /// Scan an image for a byte pattern such as "48 8D 0D XX XX XX XX ".
    Scan {
        /// PE file to load.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        pattern: String,

        /// Region to scan: Image or Code.
        #[arg(short, long, default_value = "Code")]
        scope: Scope,

        /// Section treated as code.
        #[arg(long, default_value = symbind::CODE_SECTION)]
        section: String,

        #[arg(short, long, default_value_t = 32)]
        limit: usize,
    },

    /// Decode the call or lea/mov at an address.
    Decode {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Absolute address, or `+RVA` relative to the image base (hex).
        address: String,

        #[arg(short, long, value_enum, default_value_t = DecodeKind::Lea)]
        kind: DecodeKind,
    },

    /// Run both resolution phases against an image.
    Resolve {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,

        /// Write the resolved symbols as JSON.
        #[arg(long, value_name = "OUT")]
        json: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecodeKind {
    Call,
    Lea,
}
