//! Process entry point: parses the two supported CLI flags, discovers NUMA
//! topology and the resctrl/cpufreq control surfaces, wires the polling
//! thread to a reference in-memory broker, and runs the controller loop
//! until SIGINT.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use isolation_controller::broker::ChannelBroker;
use isolation_controller::config::Config;
use isolation_controller::controller::{polling_loop, Controller, WorkloadRegistry};
use isolation_controller::error::AppError;
use isolation_controller::os::cpufreq::CpuFreqBounds;
use isolation_controller::os::resctrl::ResctrlInfo;
use isolation_controller::pending_queue::PendingQueue;
use isolation_controller::policy::PolicyKind;
use isolation_controller::topology::NumaTopology;

const CPUSET_MOUNT: &str = "/sys/fs/cgroup/cpuset";
const RESCTRL_MOUNT: &str = "/sys/fs/resctrl";

/// Minimal stderr logger: every `log` consumer is welcome to replace it by
/// calling `log::set_boxed_logger` before `run()` is invoked directly as a
/// library, but the binary always wires this one up so it runs standalone.
struct StderrLogger {
    level: log::LevelFilter,
}

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging() {
    let level = std::env::var("ISOLATION_CONTROLLER_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(log::LevelFilter::Info);
    let logger = Box::new(StderrLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

struct Cli {
    metric_buf_size: Option<usize>,
    swap_off: bool,
    config_path: Option<PathBuf>,
}

/// Hand-rolled argument parsing for the two flags the design names plus an
/// optional config file path — a CLI parsing crate is out of scope here.
fn parse_args(args: impl Iterator<Item = String>) -> Result<Cli, String> {
    let mut cli = Cli {
        metric_buf_size: None,
        swap_off: false,
        config_path: None,
    };
    let mut args = args.peekable();
    args.next(); // argv[0]
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--metric-buf-size" => {
                let value = args.next().ok_or("--metric-buf-size requires a value")?;
                let n: usize = value.parse().map_err(|_| format!("invalid --metric-buf-size value {:?}", value))?;
                if n == 0 {
                    return Err("--metric-buf-size must be >= 1".into());
                }
                cli.metric_buf_size = Some(n);
            }
            "--swap-off" => cli.swap_off = true,
            "--config" => {
                let value = args.next().ok_or("--config requires a value")?;
                cli.config_path = Some(PathBuf::from(value));
            }
            other => return Err(format!("unrecognized argument {:?}", other)),
        }
    }
    Ok(cli)
}

fn run() -> Result<(), AppError> {
    init_logging();

    let cli = parse_args(std::env::args()).map_err(AppError::Config)?;

    let mut config = Config::load(cli.config_path.as_deref())?;
    if let Some(n) = cli.metric_buf_size {
        config.metric_buf_size = n;
    }
    if cli.swap_off {
        config.swap_off = true;
    }
    config.validate()?;

    let topology = NumaTopology::discover()?;
    let resctrl_info = ResctrlInfo::discover()?;
    let cpufreq_bounds = CpuFreqBounds::discover()?;
    log::info!(
        "discovered {} socket(s), resctrl bits [{}, {}], cpufreq [{}, {}] kHz",
        topology.num_sockets(),
        resctrl_info.min_bits,
        resctrl_info.max_bits,
        cpufreq_bounds.min_khz,
        cpufreq_bounds.max_khz,
    );

    let pending = Arc::new(PendingQueue::new());
    let registry = Arc::new(WorkloadRegistry::new());
    let (broker, broker_handle) = ChannelBroker::new();

    // A real deployment's transport adapter feeds `broker_handle` from its
    // own receive loop (AMQP, a Unix socket bridge, whatever is wired up
    // downstream); that adapter is an external collaborator this binary
    // does not implement. Keeping the handle alive for the process
    // lifetime, rather than dropping it, means the broker blocks on
    // `recv()` until shutdown instead of seeing its channel close
    // immediately.
    let _broker_handle = broker_handle;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("received shutdown signal");
            shutdown.store(true, Ordering::Relaxed);
        })
        .map_err(|e| AppError::Config(format!("installing signal handler: {}", e)))?;
    }

    let metric_buf_size = config.metric_buf_size;
    let polling_topology = topology.clone();
    let polling_pending = pending.clone();
    let polling_registry = registry.clone();
    let polling_handle = thread::spawn(move || {
        polling_loop(
            &broker,
            &polling_pending,
            &polling_registry,
            &polling_topology,
            Path::new(CPUSET_MOUNT),
            Path::new(RESCTRL_MOUNT),
            metric_buf_size,
        );
    });

    let mut controller = Controller::new(
        topology,
        resctrl_info,
        cpufreq_bounds,
        config,
        PolicyKind::Conservative,
        true,
        pending,
    );
    let result = controller.run(&shutdown);

    // The polling thread only exits once its broker closes; in the
    // reference binary that only happens if the process itself is torn
    // down, so we do not join it on a clean controller shutdown.
    drop(polling_handle);

    result
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("isolation_controller: {}", e);
            ExitCode::FAILURE
        }
    }
}
