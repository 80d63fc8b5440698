use clap::Parser;
use netprobe_agent::conf::{read_conf, Args, Conf};
use netprobe_agent::{NetworkTester, Scheduler};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let conf = read_conf(&args.conf).await;
    let level = conf
        .as_ref()
        .map(Conf::log_level)
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let conf = match conf {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Load conf {} fail: {:#}", args.conf, e);
            process::exit(exitcode::CONFIG);
        }
    };
    info!("Load conf from {}", args.conf);

    let code = if args.tests.is_empty() {
        run_scheduler(conf).await
    } else {
        run_once(conf, &args.tests).await
    };
    process::exit(code);
}

async fn run_once(conf: Arc<Conf>, tests: &[String]) -> exitcode::ExitCode {
    let tester = NetworkTester::new(conf);
    let tests: Vec<&str> = tests.iter().map(String::as_str).collect();
    let (results, errors) = tester.run_tests(&tests).await;

    // partial results of failed probes are printed too
    let partials = errors.iter().filter_map(|e| e.partial());
    let printed: Vec<_> = results.iter().chain(partials).collect();
    match serde_json::to_string_pretty(&printed) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Serialize results fail: {}", e);
            return exitcode::SOFTWARE;
        }
    }

    if errors.is_empty() {
        exitcode::OK
    } else {
        exitcode::UNAVAILABLE
    }
}

async fn run_scheduler(conf: Arc<Conf>) -> exitcode::ExitCode {
    let scheduler = Arc::new(Scheduler::new(conf.scheduler.clone()));
    if let Err(e) = scheduler.start().await {
        error!("Start scheduler fail: {}", e);
        return exitcode::SOFTWARE;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Listen for ctrl-c fail: {}", e);
    }
    info!("Shutting down");

    match scheduler.stop().await {
        Ok(()) => exitcode::OK,
        Err(e) => {
            error!("Stop scheduler fail: {}", e);
            exitcode::IOERR
        }
    }
}
