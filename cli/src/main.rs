//! Evolve syscall invocations against a traced executor.
//!
//! # Usage
//!
//! ```sh
//! cargo build --release
//! sudo ./target/release/evofuzz --workers 8 --duration 600
//! ```
//!
//! Every job runs `evofuzz-executor` (found next to `evofuzz` unless `--executor` is given)
//! with the syscall number and its arguments. When started as root, targets run as the
//! unprivileged `--uid`/`--gid` unless their syscall needs root.
//!
//! The run ends on `SIGINT`/`SIGTERM`, after `--duration` seconds, or once `--generations`
//! generations were evaluated. Findings are logged as they occur.

use clap::{builder::RangedU64ValueParser, value_parser, Arg, ArgAction, ArgMatches, Command};
use evofuzz_genetic::{setup_genetic_module, Config, StopFlag, TransportKind, MAX_WORKERS};
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    thread,
    time::{Duration, Instant},
};
use tracing::{error, info, Level};

mod catalog;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

const WORKERS_FLAG: &str = "workers";
const POPULATION_FLAG: &str = "population";
const TRANSPORT_FLAG: &str = "transport";
const EXECUTOR_FLAG: &str = "executor";
const CATALOG_FLAG: &str = "catalog";
const DURATION_FLAG: &str = "duration";
const GENERATIONS_FLAG: &str = "generations";
const ALARM_FLAG: &str = "alarm";
const UID_FLAG: &str = "uid";
const GID_FLAG: &str = "gid";
const LOG_LEVEL_FLAG: &str = "log-level";
const JSON_FLAG: &str = "json";

/// Name of the executor binary built alongside this one.
const EXECUTOR: &str = "evofuzz-executor";

/// How often the god process is checked on.
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

fn command() -> Command {
    Command::new("evofuzz")
        .version(crate_version())
        .about("Evolve syscall invocations and report the ones that crash or hang.")
        .arg(
            Arg::new(WORKERS_FLAG)
                .long(WORKERS_FLAG)
                .default_value("4")
                .help("Number of worker processes")
                .value_parser(RangedU64ValueParser::<usize>::new().range(1..=MAX_WORKERS as u64)),
        )
        .arg(
            Arg::new(POPULATION_FLAG)
                .long(POPULATION_FLAG)
                .help("Organisms per syscall [default: 1000]")
                .value_parser(RangedU64ValueParser::<usize>::new().range(1..)),
        )
        .arg(
            Arg::new(TRANSPORT_FLAG)
                .long(TRANSPORT_FLAG)
                .default_value("pipe")
                .help("How workers are connected")
                .value_parser(["pipe", "port"]),
        )
        .arg(
            Arg::new(EXECUTOR_FLAG)
                .long(EXECUTOR_FLAG)
                .help("Target run for every job")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(CATALOG_FLAG)
                .long(CATALOG_FLAG)
                .help("Path to YAML syscall catalog (built-in table if omitted)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(DURATION_FLAG)
                .long(DURATION_FLAG)
                .help("Stop after this many seconds")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new(GENERATIONS_FLAG)
                .long(GENERATIONS_FLAG)
                .help("Stop after evaluating this many generations of every syscall")
                .value_parser(RangedU64ValueParser::<u64>::new().range(1..)),
        )
        .arg(
            Arg::new(ALARM_FLAG)
                .long(ALARM_FLAG)
                .default_value("2000")
                .help("Milliseconds a target may run when its syscall needs an alarm")
                .value_parser(RangedU64ValueParser::<u64>::new().range(1..)),
        )
        .arg(
            Arg::new(UID_FLAG)
                .long(UID_FLAG)
                .default_value("65534")
                .help("User id of unprivileged targets")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new(GID_FLAG)
                .long(GID_FLAG)
                .default_value("65534")
                .help("Group id of unprivileged targets")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new(LOG_LEVEL_FLAG)
                .long(LOG_LEVEL_FLAG)
                .default_value("info")
                .value_parser(["error", "warn", "info", "debug", "trace"]),
        )
        .arg(
            Arg::new(JSON_FLAG)
                .long(JSON_FLAG)
                .help("Log in JSON")
                .action(ArgAction::SetTrue),
        )
}

/// The executor installed next to the running binary.
fn default_executor() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(EXECUTOR)))
        .unwrap_or_else(|| PathBuf::from(EXECUTOR))
}

/// Map parsed flags onto a run configuration.
fn config(matches: &ArgMatches) -> Config {
    let mut cfg = Config::default();
    if let Some(&workers) = matches.get_one::<usize>(WORKERS_FLAG) {
        cfg.workers = workers;
    }
    if let Some(&population) = matches.get_one::<usize>(POPULATION_FLAG) {
        cfg.species_population = population;
        cfg.species_cap = cfg.species_cap.max(population);
    }
    if matches.get_one::<String>(TRANSPORT_FLAG).map(String::as_str) == Some("port") {
        cfg.transport = TransportKind::Port;
    }
    cfg.executor = matches
        .get_one::<PathBuf>(EXECUTOR_FLAG)
        .cloned()
        .unwrap_or_else(default_executor);
    cfg.max_generations = matches.get_one::<u64>(GENERATIONS_FLAG).copied();
    if let Some(&alarm) = matches.get_one::<u64>(ALARM_FLAG) {
        cfg.target.alarm = Duration::from_millis(alarm);
    }
    if let Some(&uid) = matches.get_one::<u32>(UID_FLAG) {
        cfg.target.uid = uid;
    }
    if let Some(&gid) = matches.get_one::<u32>(GID_FLAG) {
        cfg.target.gid = gid;
    }
    cfg
}

fn main() -> ExitCode {
    let matches = command().get_matches();

    // Create logger
    let level = matches
        .get_one::<String>(LOG_LEVEL_FLAG)
        .and_then(|level| Level::from_str(level).ok())
        .unwrap_or(Level::INFO);
    if matches.get_flag(JSON_FLAG) {
        tracing_subscriber::fmt().json().with_max_level(level).init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    // Load catalog
    let catalog = match matches.get_one::<PathBuf>(CATALOG_FLAG) {
        Some(path) => catalog::load(path),
        None => catalog::builtin(),
    };
    let catalog = match catalog {
        Ok(catalog) => catalog,
        Err(err) => {
            error!(?err, "unable to load catalog");
            return ExitCode::FAILURE;
        }
    };
    let cfg = config(&matches);
    info!(
        syscalls = catalog.enabled().count(),
        workers = cfg.workers,
        population = cfg.species_population,
        transport = ?cfg.transport,
        executor = %cfg.executor.display(),
        "loaded configuration"
    );

    // Handlers are installed before forking so that the god and its workers outlive an
    // interrupt and shut down through the stop flag.
    let stop = match StopFlag::new() {
        Ok(stop) => stop,
        Err(err) => {
            error!(?err, "unable to create stop flag");
            return ExitCode::FAILURE;
        }
    };
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            error!(?err, "unable to register signal handlers");
            return ExitCode::FAILURE;
        }
    };
    {
        let stop = stop.clone();
        thread::spawn(move || {
            for signal in signals.forever() {
                info!(signal, "stopping");
                stop.stop();
            }
        });
    }

    // Start the god process
    let god = match setup_genetic_module(cfg, catalog, stop.clone()) {
        Ok(god) => god,
        Err(err) => {
            error!(?err, "unable to start");
            return ExitCode::FAILURE;
        }
    };
    let deadline = matches
        .get_one::<u64>(DURATION_FLAG)
        .map(|&seconds| Instant::now() + Duration::from_secs(seconds));

    // Wait for it to finish
    loop {
        match waitpid(god, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            Ok(WaitStatus::Exited(_, 0)) => {
                info!("finished");
                return ExitCode::SUCCESS;
            }
            Ok(status) => {
                error!(?status, "god failed");
                return ExitCode::FAILURE;
            }
            Err(err) => {
                error!(?err, "unable to wait for god");
                return ExitCode::FAILURE;
            }
        }
        if !stop.is_stopped() && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("duration elapsed");
            stop.stop();
        }
        thread::sleep(WAIT_INTERVAL);
    }
}
