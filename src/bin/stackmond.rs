//! stackmond - cloud inventory exporter daemon.
//!
//! Polls the cloud backend on a fixed interval and republishes backend
//! inventory as Prometheus series on an HTTP scrape endpoint.
//!
//! Usage:
//!   stackmond                          # poll every 60s, listen on :9103
//!   stackmond --interval 30            # poll every 30s
//!   stackmond --api-exclude octavia    # skip the octavia service
//!
//! Every flag can also be set through OS_EXPORTER_* environment variables.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stackmon::collector::Collector;
use stackmon::config::ExporterConfig;
use stackmon::metrics::PromSink;
use stackmon::scheduler::Scheduler;
use stackmon::source::{DataSource, MockSource};
use stackmon::web;

/// Cloud inventory exporter.
#[derive(Parser)]
#[command(name = "stackmond", about = "Cloud inventory Prometheus exporter", version = stackmon::VERSION)]
struct Args {
    /// Address to serve /metrics on.
    #[arg(long, default_value = "0.0.0.0:9103", env = "OS_EXPORTER_LISTEN")]
    listen: String,

    /// Seconds between poll cycles.
    #[arg(long, default_value_t = 60, env = "OS_EXPORTER_INTERVAL_SECONDS")]
    interval: u64,

    /// Prefix of every exported metric name.
    #[arg(long, default_value = "openstack", env = "OS_EXPORTER_METRIC_PREFIX")]
    metric_prefix: String,

    /// Comma-separated catalog service names to skip.
    #[arg(long, env = "OS_EXPORTER_API_EXCLUDE", value_delimiter = ',')]
    api_exclude: Vec<String>,

    /// Backend to poll. Only "simulated" ships with this build.
    #[arg(long, default_value = "simulated", env = "OS_EXPORTER_BACKEND")]
    backend: String,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log warnings and errors only.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stackmond={level},stackmon={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_source(backend: &str) -> Option<Box<dyn DataSource>> {
    match backend {
        "simulated" => Some(Box::new(MockSource::small_cloud())),
        _ => None,
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = ExporterConfig {
        metric_prefix: args.metric_prefix,
        interval_secs: args.interval,
        listen_addr: args.listen,
        api_exclude: args.api_exclude,
    };

    let addr: SocketAddr = match config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "invalid listen address");
            process::exit(1);
        }
    };
    let Some(source) = build_source(&args.backend) else {
        error!(backend = %args.backend, "unknown backend");
        process::exit(1);
    };

    let sink = PromSink::new();
    let registry = sink.registry().clone();
    if let Err(e) = web::spawn(addr, registry) {
        error!(addr = %addr, error = %e, "could not bind exposition endpoint");
        process::exit(1);
    }

    let collector = match Collector::new(&config, source, Box::new(sink)) {
        Ok(collector) => collector,
        Err(e) => {
            error!(error = %e, "could not discover the service catalog");
            process::exit(1);
        }
    };
    run(collector, &config);
}

fn run(collector: Collector, config: &ExporterConfig) {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    }) {
        error!(error = %e, "could not install signal handler");
        process::exit(1);
    }

    info!(
        version = stackmon::VERSION,
        interval = config.interval_secs,
        "starting poll loop"
    );
    let exit = Scheduler::new(config.interval()).run(collector, running);
    info!(?exit, "exiting");
    process::exit(exit.code());
}
