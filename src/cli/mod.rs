pub mod commands;

use crate::config::{parse_duration, Config};
use crate::ebpf::ringbuf::OutputFormat;
use crate::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "hooktail")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Load eBPF probes, attach them and tail what they report", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "YAML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory containing compiled probe objects")]
    pub probes_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Stream fcntl(2) callers from an fentry probe until interrupted")]
    Fcntl {
        #[arg(long, help = "bpffs path where the state map is pinned")]
        pin_path: Option<PathBuf>,

        #[arg(short, long, value_enum, help = "Output format")]
        output: Option<OutputFormat>,
    },
    #[command(about = "Run the init-guard probe directly and tail the kernel trace log")]
    Guard {
        #[arg(short, long, help = "Number of program runs")]
        runs: Option<u32>,

        #[arg(long, value_parser = duration_arg, help = "Wait after a non-zero return (e.g. 500ms)")]
        flush_delay: Option<Duration>,

        #[arg(long, value_parser = duration_arg, help = "Period of the callback program while lingering (e.g. 1s)")]
        callback_interval: Option<Duration>,

        #[arg(long, value_parser = duration_arg, help = "Time to keep tailing before exit (e.g. 5s)")]
        linger: Option<Duration>,
    },
}

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

impl Cli {
    /// File configuration with command-line overrides applied
    pub fn resolve_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;

        if let Some(dir) = &self.probes_dir {
            config.probes_dir = Some(dir.clone());
        }

        match &self.command {
            Some(Commands::Fcntl { pin_path, output }) => {
                if let Some(path) = pin_path {
                    config.fcntl.pin_path = path.clone();
                }
                if let Some(output) = output {
                    config.fcntl.output = *output;
                }
            }
            Some(Commands::Guard {
                runs,
                flush_delay,
                callback_interval,
                linger,
            }) => {
                if let Some(runs) = runs {
                    config.guard.runs = *runs;
                }
                if let Some(delay) = flush_delay {
                    config.guard.flush_delay = *delay;
                }
                if let Some(interval) = callback_interval {
                    config.guard.callback_interval = *interval;
                }
                if let Some(linger) = linger {
                    config.guard.linger = *linger;
                }
            }
            None => {}
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "hooktail",
            "--probes-dir",
            "/tmp/probes",
            "guard",
            "--runs",
            "3",
            "--linger",
            "250ms",
            "--callback-interval",
            "50ms",
        ]);
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.probes_dir, Some(PathBuf::from("/tmp/probes")));
        assert_eq!(config.guard.runs, 3);
        assert_eq!(config.guard.linger, Duration::from_millis(250));
        assert_eq!(config.guard.callback_interval, Duration::from_millis(50));
        assert_eq!(config.guard.flush_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_fcntl_flags() {
        let cli = Cli::parse_from([
            "hooktail", "fcntl", "--output", "json", "--pin-path", "/tmp/pin",
        ]);
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.fcntl.output, OutputFormat::Json);
        assert_eq!(config.fcntl.pin_path, PathBuf::from("/tmp/pin"));
    }

    #[test]
    fn test_zero_runs_rejected() {
        let cli = Cli::parse_from(["hooktail", "guard", "--runs", "0"]);
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_zero_callback_interval_rejected() {
        let cli = Cli::parse_from(["hooktail", "guard", "--callback-interval", "0s"]);
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_bad_duration_rejected_by_parser() {
        assert!(Cli::try_parse_from(["hooktail", "guard", "--linger", "soon"]).is_err());
    }
}
