//! The `sisyphus` executable: `manager` runs the control loop, `worker`
//! executes one task subprocess-style, `console` is a stub pointing at the
//! out-of-scope interactive tool (`spec.md §6`).
//!
//! Grounded on `casparian`'s `main.rs`: a `clap::Parser`/`Subcommand` CLI,
//! a `signal_hook` thread flipping an `AtomicBool`/forwarding a stop
//! signal through an `mpsc` channel, and a graceful-shutdown sequence
//! around the long-running loop.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use sisyphus_engine::LocalCapacity;
use sisyphus_graph::{Graph, Recipe};
use sisyphus_logging::LogConfig;
use sisyphus_manager::Manager;
use sisyphus_protocol::ProcessRole;
use sisyphus_settings::Settings;
use sisyphus_worker::TaskRegistry;

#[derive(Parser, Debug)]
#[command(name = "sisyphus", about = "Workflow manager for reproducible computational pipelines")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Work directory (defaults to ~/.sisyphus/work)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control loop (graph-update + dispatch phases)
    #[command(alias = "m")]
    Manager(ManagerArgs),

    /// Execute one task as a subprocess (used by engines)
    Worker(WorkerArgs),

    /// Interactive session (external tool; not implemented here)
    #[command(alias = "c")]
    Console,
}

#[derive(Parser, Debug)]
struct ManagerArgs {
    /// Run without a confirmation prompt
    #[arg(short = 'r', long = "run")]
    run: bool,

    /// Dotted path to the recipe's entry function. Stored as an opaque
    /// string; no dynamic recipe loader exists yet (`spec.md §6`), so a
    /// recipe binary embedding this crate's library surface wires its own
    /// `Recipe` directly instead of going through this flag.
    #[arg(long)]
    config: Option<String>,

    /// Observability HTTP port (accepted and stored; the dashboard itself
    /// is an external consumer per `spec.md §1`)
    #[arg(long)]
    http: Option<u16>,

    /// Local engine capacity: CPU slots
    #[arg(long, default_value_t = 4)]
    cpu: u32,

    /// Local engine capacity: memory in GB
    #[arg(long, default_value_t = 16.0)]
    mem_gb: f64,

    /// Local engine capacity: GPU slots
    #[arg(long, default_value_t = 0)]
    gpu: u32,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// The job's work directory
    job_dir: PathBuf,

    /// Task (function) name to execute
    task: String,

    /// Shard index (defaults to 0 for unsharded tasks)
    shard: Option<u32>,
}

/// No jobs registered: this binary ships as the generic toolkit runner, not
/// a concrete pipeline. A recipe author links `sisyphus_manager` directly
/// and supplies their own [`Recipe`] instead of using this stub.
struct EmptyRecipe;

impl Recipe for EmptyRecipe {
    fn build(&self, _graph: &Graph) {}
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = sisyphus_logging::init_logging(LogConfig {
        app_name: "sisyphus",
        verbose: cli.verbose,
        tui_mode: false,
    }) {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::from(1);
    }

    let work_dir = cli
        .work_dir
        .clone()
        .unwrap_or_else(sisyphus_protocol::paths::default_work_dir);

    match cli.command {
        Commands::Manager(args) => run_manager(work_dir, args),
        Commands::Worker(args) => run_worker(work_dir, args),
        Commands::Console => {
            eprintln!(
                "console is an external interactive tool and out of scope for this binary \
                 (spec.md \u{a7}1); it consumes the toolkit API this crate exposes."
            );
            ExitCode::from(2)
        }
    }
}

fn run_worker(work_dir: PathBuf, args: WorkerArgs) -> ExitCode {
    ProcessRole::install(ProcessRole::Worker);
    let _ = work_dir;
    let registry = TaskRegistry::new();
    match sisyphus_worker::run(&args.job_dir, &args.task, args.shard.unwrap_or(0), &registry) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("worker failed: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run_manager(work_dir: PathBuf, args: ManagerArgs) -> ExitCode {
    ProcessRole::install(ProcessRole::Manager);

    if let Some(config) = &args.config {
        info!(config, "recipe entry point configured (opaque, not dynamically loaded)");
    }
    if let Some(port) = args.http {
        info!(port, "observability HTTP dashboard requested but out of scope; ignoring");
    }
    if !args.run {
        eprint!("Run manager against {}? [y/N] ", work_dir.display());
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() || !answer.trim().eq_ignore_ascii_case("y") {
            info!("aborted at confirmation prompt");
            return ExitCode::SUCCESS;
        }
    }

    let lock_path = sisyphus_protocol::paths::default_lockfile_path();
    let _lock = match sisyphus_manager::ManagerLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(err) => {
            error!("failed to acquire manager lock at {}: {err}", lock_path.display());
            return ExitCode::from(1);
        }
    };

    let worker_binary = match std::env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            error!("failed to resolve own executable path: {err}");
            return ExitCode::from(1);
        }
    };

    let capacity = LocalCapacity {
        cpu: args.cpu,
        mem_gb: args.mem_gb,
        gpu: args.gpu,
    };
    let settings = Arc::new(Settings::with_local_engine(work_dir, worker_binary, capacity).apply_env_overrides());
    let graph = Arc::new(Graph::new());
    let recipe: Arc<dyn Recipe> = Arc::new(EmptyRecipe);
    let manager = Manager::new(graph, settings, recipe);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            return ExitCode::from(1);
        }
    };

    let (stop_tx, stop_rx) = tokio::sync::mpsc::channel::<()>(1);
    install_signal_handler(stop_tx);

    info!("manager starting");
    match runtime.block_on(manager.run_with_shutdown(stop_rx)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("manager stopped with an error: {err}");
            ExitCode::from(1)
        }
    }
}

/// Forward SIGINT/SIGTERM into `stop_tx`, mirroring the teacher's
/// `signal_hook`-thread-plus-`mpsc` shutdown wiring.
fn install_signal_handler(stop_tx: tokio::sync::mpsc::Sender<()>) {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = match Signals::new([SIGINT, SIGTERM]) {
            Ok(signals) => signals,
            Err(err) => {
                error!("failed to install signal handler: {err}");
                return;
            }
        };
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("received signal {sig}, requesting shutdown");
                let _ = stop_tx.blocking_send(());
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = stop_tx;
    }
}
