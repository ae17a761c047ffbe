//! CLI entrypoint for the memtrace demonstration harness.
//!
//! `simulate` runs a synthetic multi-subsystem workload with deliberate
//! leaks and writes every export format; `leak-demo` is the smallest
//! possible end-to-end run whose exit code is the leak signal.

use std::cell::Cell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memtrace_core::shadow::ShadowFrameGuard;
use memtrace_core::tracker::{MemTracker, Phase, SubsystemResolver, SubsystemTag};
use memtrace_core::{NullUnwinder, SystemHeap, TrackerConfig};
use memtrace_report::{
    export_allocations, export_call_graph, export_statistics_csv, report_hottest, report_leaks,
    write_assignment_stats_json, write_live_stats_json,
};

/// Allocation tracking demonstration harness.
#[derive(Debug, Parser)]
#[command(name = "memtrace")]
#[command(about = "Demonstration harness for the memtrace allocation tracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a synthetic multi-subsystem workload and write every export.
    Simulate {
        /// Output directory for report files.
        #[arg(long, default_value = "memtrace-out")]
        output: PathBuf,
        /// Worker threads per subsystem.
        #[arg(long, default_value_t = 2)]
        threads: usize,
        /// Allocations per worker.
        #[arg(long, default_value_t = 500)]
        allocs: usize,
    },
    /// Allocate once, never free, and report. Exits nonzero on leaks.
    LeakDemo,
}

thread_local! {
    static CURRENT_SUBSYSTEM: Cell<SubsystemTag> =
        const { Cell::new(SubsystemTag { id: 0, name: "main" }) };
}

/// Resolver backed by a per-thread tag set at worker startup.
struct ThreadTagResolver;

impl SubsystemResolver for ThreadTagResolver {
    fn current(&self) -> SubsystemTag {
        CURRENT_SUBSYSTEM.with(Cell::get)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Simulate {
            output,
            threads,
            allocs,
        } => match simulate(&output, threads, allocs) {
            Ok(leaks) => {
                println!("simulation done: {leaks} leak bucket(s), reports in {}", output.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!(%err, "simulation failed");
                ExitCode::FAILURE
            }
        },
        Command::LeakDemo => leak_demo(),
    }
}

fn leak_demo() -> ExitCode {
    let tracker = MemTracker::with_defaults();
    tracker.set_phase(Phase::Running);

    let never_freed = vec![0u8; 100];
    {
        let _scope = ShadowFrameGuard::enter("leak_demo", file!(), line!(), false);
        tracker.allocate(never_freed.as_ptr() as usize, 100, 100, 0);
    }

    let mut stdout = std::io::stdout();
    let leaks = match report_leaks(&tracker, &mut stdout) {
        Ok(n) => n,
        Err(err) => {
            tracing::warn!(%err, "leak report failed");
            return ExitCode::FAILURE;
        }
    };
    tracker.shutdown();
    drop(never_freed);
    if leaks > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn simulate(output: &PathBuf, threads: usize, allocs: usize) -> memtrace_report::Result<usize> {
    std::fs::create_dir_all(output)?;

    let tracker = Arc::new(MemTracker::new(
        TrackerConfig::from_env(),
        Box::new(SystemHeap),
        Box::new(NullUnwinder),
        Box::new(ThreadTagResolver),
    ));

    // Pre-init configuration tables, intentionally long-lived.
    let config_tables: Vec<Vec<u8>> = {
        let _scope = ShadowFrameGuard::enter("load_config", file!(), line!(), false);
        let _ignore = tracker.ignore_leaks();
        (0..4)
            .map(|_| {
                let buf = vec![0u8; 256];
                tracker.allocate(buf.as_ptr() as usize, 256, 256, 0);
                buf
            })
            .collect()
    };
    tracker.set_phase(Phase::Running);

    let subsystems: &[(u16, &'static str)] = &[(1, "world"), (2, "render"), (3, "audio")];
    let mut handles = Vec::new();
    for &(id, name) in subsystems {
        for worker in 0..threads {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                CURRENT_SUBSYSTEM.with(|tag| tag.set(SubsystemTag { id, name }));
                run_worker(&tracker, name, worker, allocs);
            }));
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }

    // Ownership-handle provenance demo: two handles share one target.
    let target = config_tables[0].as_ptr() as usize;
    tracker.track_assignment(0x1000, Some(target));
    tracker.track_assignment(0x2000, Some(target));

    let mut stdout = std::io::stdout();
    let leaks = report_leaks(&tracker, &mut stdout)?;
    report_hottest(&tracker, &mut stdout)?;

    export_statistics_csv(&tracker, output.join("statistics.csv"))?;
    export_call_graph(&tracker, output.join("callgraph.out"))?;
    export_allocations(&tracker, output.join("allocations.txt"))?;
    let mut stats_json = std::fs::File::create(output.join("live_stats.json"))?;
    write_live_stats_json(&tracker, &mut stats_json)?;
    let mut assign_json = std::fs::File::create(output.join("assignments.json"))?;
    write_assignment_stats_json(&tracker, &mut assign_json)?;

    for buf in &config_tables {
        tracker.deallocate(buf.as_ptr() as usize);
    }
    tracker.shutdown();
    Ok(leaks)
}

/// One worker: allocation churn with a couple of deliberate leaks.
fn run_worker(tracker: &MemTracker, name: &'static str, worker: usize, allocs: usize) {
    let _scope = ShadowFrameGuard::enter(name, file!(), line!(), false);
    let mut live: Vec<Vec<u8>> = Vec::new();
    let mut leaked: Vec<Vec<u8>> = Vec::new();

    for i in 0..allocs {
        let size = 16 << (i % 5);
        let _frame = ShadowFrameGuard::enter("churn", file!(), line!(), true);
        let buf = vec![0u8; size];
        tracker.allocate(buf.as_ptr() as usize, size, size, 0);
        live.push(buf);

        // Free most of the backlog, keep churn bounded.
        if live.len() >= 8 {
            let buf = live.remove(0);
            tracker.deallocate(buf.as_ptr() as usize);
        }
    }

    // Deliberate leak: one allocation per worker survives the run.
    {
        let _frame = ShadowFrameGuard::enter("leak_one", file!(), line!(), false);
        let buf = vec![0u8; 64 + worker];
        tracker.allocate(buf.as_ptr() as usize, 64 + worker, 64 + worker, 0);
        leaked.push(buf);
    }

    for buf in &live {
        tracker.deallocate(buf.as_ptr() as usize);
    }
    // Leaked buffers intentionally kept alive past tracking.
    std::mem::forget(leaked);
}
