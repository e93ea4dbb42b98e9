//! RouteDNS - DNS stub resolver, proxy and router
//!
//! Listens for incoming DNS requests, routes, modifies and forwards to
//! upstream resolvers. The pipeline is defined in one or more TOML
//! configuration files given as arguments; splitting listeners, groups and
//! routers over multiple files is supported.

use std::env;

use getopts::Options;

use routedns::builder::{self, Config};

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options] <config> [<config>..]", program);
    print!("{}", opts.usage(&brief));
}

fn print_version() {
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
}

fn log_level(level: u32) -> Option<log::LevelFilter> {
    let filter = match level {
        0 => log::LevelFilter::Off,
        1 | 2 => log::LevelFilter::Error,
        3 => log::LevelFilter::Warn,
        4 => log::LevelFilter::Info,
        5 => log::LevelFilter::Debug,
        6 => log::LevelFilter::Trace,
        _ => return None,
    };
    Some(filter)
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optflag("v", "version", "prints code version string");
    opts.optopt("l", "log-level", "log level; 0=None .. 6=Trace", "LEVEL");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    if matches.opt_present("h") {
        print_usage(&program, &opts);
        return;
    }
    if matches.opt_present("v") {
        print_version();
        return;
    }

    let level = matches
        .opt_str("l")
        .map(|l| l.parse::<u32>().unwrap_or(u32::MAX))
        .unwrap_or(4);
    let filter = match log_level(level) {
        Some(filter) => filter,
        None => {
            eprintln!("invalid log level: {}", level);
            std::process::exit(1);
        }
    };
    if let Err(err) = simple_logger::SimpleLogger::new().with_level(filter).init() {
        eprintln!("failed to initialize logger: {}", err);
        std::process::exit(1);
    }

    if matches.free.is_empty() {
        eprintln!("not enough arguments");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(&matches.free)) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(config_files: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_files)?;
    if config.listeners.is_empty() {
        return Err("no listeners configured".into());
    }

    let manager = builder::build(&config).await?;

    // Listeners restart after a pause if they fail; cert monitors run on
    // their own timers
    let _handles = manager.spawn_listeners();
    manager.start_tasks();

    wait_for_signal().await;
    manager.close().await;

    Ok(())
}

/// Block until SIGINT, SIGTERM or SIGHUP.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                log::error!("failed to install signal handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(err) => {
                log::error!("failed to install signal handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hangup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
