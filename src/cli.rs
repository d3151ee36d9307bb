use crate::loader::WorkerSpec;
use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value_t = LevelFilter::Info,
        help = "Log level (off, error, warn, info, debug, trace); RUST_LOG takes precedence"
    )]
    pub log_level: LevelFilter,
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run a benchmark
    Run {
        #[arg(
            name = "CONFIG",
            help = "Configuration file, or its name under ~/rethebes/config (with or without .json). \
                    The default configuration is used when omitted"
        )]
        config: Option<String>,
    },
    /// Load one logical CPU; started by the loader
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Everything a worker process needs, passed on its command line.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long, help = "Logical CPU to pin to")]
    pub core: usize,
    #[arg(long, help = "Target load in percent of one logical CPU")]
    pub load: f64,
    #[arg(long, help = "Seconds to run; runs until interrupted when omitted")]
    pub duration: Option<f64>,
    #[arg(long, default_value_t = 0.1, help = "Seconds between load samples")]
    pub sampling_interval: f64,
    #[arg(long, help = "Print a JSON summary on stdout when done")]
    pub report: bool,
}

impl WorkerArgs {
    pub fn spec(&self) -> Result<WorkerSpec> {
        if !(0.0..=100.0).contains(&self.load) {
            bail!("Load {} is outside 0 to 100", self.load);
        }
        if !(self.sampling_interval.is_finite() && self.sampling_interval > 0.0) {
            bail!("Sampling interval must be positive, got {}", self.sampling_interval);
        }
        let duration = match self.duration {
            Some(seconds) if seconds >= 0.0 => Some(Duration::try_from_secs_f64(seconds)?),
            _ => None,
        };
        Ok(WorkerSpec {
            cpu: self.core,
            load: self.load / 100.0,
            duration,
            sampling_interval: Duration::try_from_secs_f64(self.sampling_interval)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_without_config() {
        let cli = Cli::try_parse_from(["rethebes", "run"]).unwrap();
        assert_eq!(cli.log_level, LevelFilter::Info);
        assert!(matches!(cli.mode, Mode::Run { config: None }));
    }

    #[test]
    fn test_run_with_config_and_level() {
        let cli = Cli::try_parse_from(["rethebes", "run", "heavy", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, LevelFilter::Debug);
        assert!(matches!(cli.mode, Mode::Run { config: Some(ref name) } if name == "heavy"));
    }

    #[test]
    fn test_worker_line_from_launcher() {
        let cli = Cli::try_parse_from([
            "rethebes",
            "--log-level",
            "WARN",
            "worker",
            "--core",
            "2",
            "--load",
            "50",
            "--sampling-interval",
            "0.1",
            "--duration",
            "4",
            "--report",
        ])
        .unwrap();
        assert_eq!(cli.log_level, LevelFilter::Warn);
        let Mode::Worker(args) = cli.mode else {
            panic!("not a worker");
        };
        assert!(args.report);
        let spec = args.spec().unwrap();
        assert_eq!(spec.cpu, 2);
        assert_eq!(spec.load, 0.5);
        assert_eq!(spec.duration, Some(Duration::from_secs(4)));
        assert_eq!(spec.sampling_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_worker_rejects_bad_load() {
        let cli = Cli::try_parse_from(["rethebes", "worker", "--core", "0", "--load", "150"]).unwrap();
        let Mode::Worker(args) = cli.mode else {
            panic!("not a worker");
        };
        assert!(args.spec().is_err());
        assert_eq!(args.duration, None);
    }
}
