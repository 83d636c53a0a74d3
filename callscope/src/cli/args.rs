//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "callscope",
    about = "Function-level instrumenting profiler",
    after_help = "\
EXAMPLES:
    callscope functions ./target/release/app --filter parse    List patchable functions
    callscope replay trace.json                                 Call-graph report of a recorded trace
    callscope demo --threads 8 --output stats.jsonl             Profile the built-in workload"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Per-thread trace budget in records (overrides the config file)
    #[arg(long, global = true, value_name = "RECORDS")]
    pub trace_limit: Option<usize>,

    /// Statistics update period (overrides the config file)
    #[arg(long, global = true, value_name = "MS")]
    pub interval: Option<u64>,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the functions of an ELF binary and whether they can be detoured
    Functions {
        /// Binary or shared object to inspect
        binary: PathBuf,

        /// Only show functions whose name contains this text
        #[arg(long)]
        filter: Option<String>,
    },

    /// Analyze a recorded trace and print call-graph statistics
    Replay {
        /// Trace file (JSON)
        trace: PathBuf,

        /// Records handed to the analyzer per batch
        #[arg(long, default_value = "384")]
        chunk: usize,

        /// Print the statistics as a JSON update message instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Instrument a built-in workload in this process and profile it
    Demo {
        /// Worker threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Checksum rounds per worker
        #[arg(long, default_value = "200")]
        iterations: u64,

        /// Write JSON-lines statistics messages to FILE
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Stop after N seconds even if the workload is still running (0 = unlimited)
        #[arg(long, default_value = "0")]
        duration: u64,
    },
}
