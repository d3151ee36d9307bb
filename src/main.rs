use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use log::{error, trace, warn, LevelFilter};
use rethebes::cli::{Cli, Mode, WorkerArgs};
use rethebes::config::{self, process_configuration, rethebes_home, DEFAULT_CONFIGURATION};
use rethebes::director::Outcome;
use rethebes::loader::{load_core, WorkerLauncher};
use rethebes::run::Session;
use rethebes::topology::Topology;
use simple_logger::SimpleLogger;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raised by CTRL+C (and SIGTERM).
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .context("Failed to install the CTRL+C handler")?;
    Ok(flag)
}

fn run(config_name: Option<String>, log_level: LevelFilter) -> Result<()> {
    let home = rethebes_home()?;
    let configuration = match config_name {
        None => DEFAULT_CONFIGURATION.clone(),
        Some(name) => config::load(&config::find(&name, &home)?)?,
    };
    let configuration = process_configuration(configuration, &home, Local::now())?;
    let topology = Topology::detect()?;
    let launcher = WorkerLauncher::current(log_level)?;
    let session = Session::new(configuration, topology, launcher)?.with_interrupt(interrupt_flag()?);
    match session.run()? {
        outcome @ Outcome::Critical { .. } => bail!("Run aborted, {outcome}"),
        _ => Ok(()),
    }
}

fn worker(args: &WorkerArgs) -> Result<()> {
    let spec = args.spec()?;
    let stop = interrupt_flag()?;
    let report = load_core(&spec, Arc::clone(&stop))?;
    if stop.load(Ordering::Relaxed) {
        warn!("cpu{}: worker terminated by CTRL+C", spec.cpu);
    }
    if args.report {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = SimpleLogger::new().with_level(cli.log_level).env().init() {
        eprintln!("Failed to initialise logging: {e}");
    }
    trace!("{cli:?}");

    let result = match &cli.mode {
        Mode::Run { config } => run(config.clone(), cli.log_level),
        Mode::Worker(args) => worker(args),
    };
    if let Err(e) = result {
        error!("{e:#}");
        process::exit(1);
    }
}
