use clap::Parser;
use std::path::{Path, PathBuf};

use opsched::graph::Graph;
use opsched::id::{ProcessTaskIds, WorkerHandle};
use opsched::scripted::{Scenario, ScriptedCompiler};
use opsched::{CompileStrategy, OpCompileScheduler, SchedulerOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, clap::ValueEnum)]
enum Emit {
    Text,
    Json,
    Fingerprint,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StrategyArg {
    Default,
    KeepOptimize,
    NoTune,
    FuzzyOnline,
}

impl From<StrategyArg> for CompileStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Default => CompileStrategy::Default,
            StrategyArg::KeepOptimize => CompileStrategy::KeepOptimize,
            StrategyArg::NoTune => CompileStrategy::NoTune,
            StrategyArg::FuzzyOnline => CompileStrategy::FuzzyOnline,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "opsched",
    version,
    about = "Replays an operator compile scenario against the scripted kernel compiler"
)]
struct Cli {
    /// Scenario JSON: nodes, options, strategy and compiler plan
    scenario: PathBuf,

    /// Scheduler options JSON (replaces the scenario's options)
    #[arg(long)]
    options: Option<PathBuf>,

    /// Compile strategy (overrides the scenario)
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Give up waiting for completions after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Report format
    #[arg(long, value_enum, default_value_t = Emit::Text)]
    emit: Emit,

    /// Log scheduler transitions and per-task events
    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "opsched=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("opsched: error: {}: {}", path.display(), e);
            std::process::exit(2);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // ── Load scenario ──
    let mut scenario = match Scenario::from_json(&read(&cli.scenario)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("opsched: error: {}: {}", cli.scenario.display(), e);
            std::process::exit(2);
        }
    };
    if let Some(path) = &cli.options {
        scenario.options = match serde_json::from_str::<SchedulerOptions>(&read(path)) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("opsched: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        };
    }
    if let Some(ms) = cli.deadline_ms {
        scenario.options.deadline_ms = Some(ms);
    }
    let strategy = cli.strategy.map_or(scenario.strategy, CompileStrategy::from);
    let worker = scenario.worker.map_or_else(WorkerHandle::fresh, WorkerHandle);

    if cli.verbose {
        eprintln!(
            "opsched: {} nodes, strategy {}, worker {}",
            scenario.nodes.len(),
            strategy.as_str(),
            worker
        );
    }

    // ── Compile ──
    let mut graph = Graph::from_nodes(scenario.nodes);
    let compiler = ScriptedCompiler::new(scenario.plan);
    let ids = ProcessTaskIds;
    let scheduler = OpCompileScheduler::new(&compiler, &ids, scenario.options);
    let report = match scheduler.compile_graph(&mut graph, worker, strategy) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("opsched: fatal: {}", e);
            std::process::exit(2);
        }
    };

    // ── Emit ──
    let rendered = match cli.emit {
        Emit::Text => Ok(report.to_string()),
        Emit::Json => report.to_json().map(|s| s + "\n"),
        Emit::Fingerprint => report.fingerprint().map(|s| s + "\n"),
    };
    match rendered {
        Ok(s) => print!("{}", s),
        Err(e) => {
            eprintln!("opsched: error: cannot render report: {}", e);
            std::process::exit(2);
        }
    }

    if !report.is_success() || report.has_rollback() {
        std::process::exit(1);
    }
}
