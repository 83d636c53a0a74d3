//! # callscope - Main Entry Point
//!
//! Three subcommands:
//! - **functions** (`callscope functions <BINARY>`): which functions of an ELF
//!   file a detour can be placed on
//! - **replay** (`callscope replay <TRACE>`): call-graph statistics of a
//!   recorded enter/exit trace
//! - **demo** (`callscope demo`): instrument a built-in multi-threaded
//!   workload in this process, stream statistics and print a report

// Time conversions lose precision for display
#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use callscope::analysis::Analyzer;
use callscope::bridge::protocol::{Message, StatisticsUpdate, ThreadStatistics};
use callscope::bridge::{Frontend, JsonLinesFrontend};
use callscope::cli::{Args, Command};
use callscope::clock::ticks_per_second;
use callscope::config::Config;
use callscope::context::Profiler;
use callscope::demo;
use callscope::inspect::inspect_binary;
use callscope::patcher::{ModuleResolver, PatchStatus};
use callscope::replay::ReplayTrace;
use callscope::report::format_report;
use clap::Parser;
use log::{info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else if msg.contains("invalid buffering policy") || msg.contains("invalid config") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    let quiet = args.quiet;

    match args.command {
        Command::Functions { binary, filter } => list_functions(&binary, filter.as_deref(), quiet),
        Command::Replay { trace, chunk, json } => replay(&trace, chunk, json),
        Command::Demo { threads, iterations, output, duration } => {
            run_demo(&config, threads, iterations, output, duration, quiet).await
        }
    }
}

fn list_functions(binary: &Path, filter: Option<&str>, quiet: bool) -> Result<()> {
    let reports = inspect_binary(binary, filter)?;
    let mut patchable = 0;
    for report in &reports {
        match &report.verdict {
            Ok(fragment) => {
                patchable += 1;
                println!("{:#014x} {:>8}  ok ({fragment:>2})  {}", report.address, report.size, report.name);
            }
            Err(e) => println!("{:#014x} {:>8}  no         {}  [{e}]", report.address, report.size, report.name),
        }
    }
    if !quiet {
        eprintln!("{patchable} of {} functions can be instrumented", reports.len());
    }
    Ok(())
}

fn replay(path: &Path, chunk: usize, json: bool) -> Result<()> {
    let trace = ReplayTrace::from_file(path)?;
    let mut analyzer = Analyzer::default();
    let records = trace.replay(&mut analyzer, chunk);
    info!("replayed {records} records from {} threads", trace.threads.len());

    let open: usize = analyzer.threads().map(|(_, t)| t.open_calls()).sum();
    if open > 0 {
        warn!("{open} calls never returned; they are not in the statistics");
    }

    if json {
        let mut statistics: Vec<ThreadStatistics> =
            analyzer.threads().map(|(id, t)| ThreadStatistics::from_map(id, t.statistics())).collect();
        statistics.sort_unstable_by_key(|s| s.thread);
        let message = Message::UpdateStatistics(StatisticsUpdate::new(Vec::new(), statistics));
        println!("{}", serde_json::to_string_pretty(&message)?);
    } else {
        print!("{}", format_report(&analyzer.merged(), &|a: usize| trace.name_of(a), trace.ticks_per_second));
    }
    Ok(())
}

async fn run_demo(
    config: &Config,
    threads: usize,
    iterations: u64,
    output: Option<PathBuf>,
    duration: u64,
    quiet: bool,
) -> Result<()> {
    let mut profiler = Profiler::new(config)?;
    let module = profiler
        .modules()
        .module_of(demo::checksum as usize)
        .context("demo workload is not in any loaded module")?
        .id;
    let rvas = profiler.find_functions(module, &|name: &str| {
        name.starts_with(demo::SYMBOL_PREFIX) && !name.contains("{{closure}}") && !name.ends_with("run_workload")
    });

    let results = profiler.instrument(module, &rvas);
    let names: HashMap<usize, String> = profiler
        .modules()
        .lock_module(module)
        .map(|m| m.symbols.iter().map(|(rva, s)| (m.address_of(*rva), s.name.clone())).collect())
        .unwrap_or_default();
    for result in &results {
        if let PatchStatus::Failed(e) = &result.status {
            warn!("rva {:#x} not instrumented: {e}", result.rva);
        }
    }
    let installed: Vec<_> = results.iter().filter(|r| r.status == PatchStatus::Ok).map(|r| r.rva).collect();
    if installed.is_empty() {
        anyhow::bail!("none of the {} demo functions could be instrumented", rvas.len());
    }
    if !quiet {
        println!("callscope v{}", env!("CARGO_PKG_VERSION"));
        println!("instrumented: {} of {} functions", installed.len(), rvas.len());
        println!("workload: {threads} threads x {iterations} iterations");
    }

    let frontend: Box<dyn Frontend> = match &output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(JsonLinesFrontend::new(BufWriter::new(file)))
        }
        None => Box::new(JsonLinesFrontend::new(std::io::sink())),
    };
    let mut bridge = profiler.bridge(frontend)?;

    let mut workload = tokio::task::spawn_blocking(move || demo::run_workload(threads, iterations));
    let ctrl_c = tokio::signal::ctrl_c();
    let limit = async move {
        if duration == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(duration)).await;
        }
    };
    let shutdown = async {
        tokio::select! {
            result = &mut workload => {
                if let Err(e) = result {
                    warn!("workload failed: {e}");
                }
            }
            _ = ctrl_c => info!("interrupted"),
            () = limit => info!("duration reached"),
        }
    };
    bridge.run(config.poll_interval(), shutdown).await?;

    let name_of = |address: usize| names.get(&address).cloned().unwrap_or_else(|| format!("{address:#x}"));
    print!("{}", format_report(bridge.totals(), &name_of, Some(ticks_per_second())));

    if !workload.is_finished() {
        // Workers may still be inside detoured code and return through the exit stub.
        warn!("workload still running; leaving patches in place until exit");
        std::mem::forget(bridge);
        std::mem::forget(profiler);
        return Ok(());
    }

    let removed = profiler.patches().remove(module, &installed);
    let restored = removed.iter().filter(|r| r.status == PatchStatus::Ok).count();
    if !quiet {
        println!("restored {restored} functions");
        if let Some(path) = output {
            println!("statistics written to {}", path.display());
        }
    }
    Ok(())
}
