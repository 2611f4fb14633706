//! Command-line interface for Layerdeck
//!
//! Handles argument parsing and logging configuration.

use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;

use layerdeck::audio::BackendKind;

/// Layerdeck - pocket multi-track recorder
#[derive(Parser, Debug)]
#[command(name = "layerdeck")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Audio backend: simulated or pipewire
    #[arg(long, global = true, default_value = "simulated")]
    pub backend: BackendKind,

    /// Keep preferences in this JSON file instead of dconf
    #[arg(long, global = true)]
    pub prefs_file: Option<PathBuf>,

    /// Directory takes are written to (overrides the config file)
    #[arg(long, global = true)]
    pub recordings_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record a plain take
    Record {
        /// Length of the take
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Record a take while the project's tracks play, then add it to the project
    Overdub {
        /// Track list (JSON)
        #[arg(long)]
        project: PathBuf,
        /// Length of the take
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        /// Timeline position to start from
        #[arg(long, default_value_t = 0)]
        from_ms: i64,
    },
    /// List a project's tracks and the timeline length
    Tracks {
        #[arg(long)]
        project: PathBuf,
    },
    /// Split a container file at millisecond boundaries
    Split {
        file: PathBuf,
        /// Ascending boundaries in ms
        #[arg(required = true)]
        boundaries_ms: Vec<i64>,
        /// Output directory (defaults to the source's directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the current latency estimate
    Latency,
    /// Set the persisted manual latency offset (-500..=500 ms)
    Offset {
        #[arg(allow_negative_numbers = true)]
        offset_ms: i64,
    },
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set layerdeck modules to requested verbosity level
    builder.filter_module("layerdeck", args.log_level());

    // Audio server bindings only at -vvvv (very verbose)
    if args.verbose >= 4 {
        builder.filter_module("pipewire", args.log_level());
        builder.filter_module("libspa", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overdub() {
        let args = Args::parse_from([
            "layerdeck", "-vv", "overdub", "--project", "p.json", "--seconds", "3",
        ]);
        assert_eq!(args.log_level(), LevelFilter::Debug);
        assert_eq!(args.backend, BackendKind::Simulated);
        match args.command {
            Command::Overdub {
                project, seconds, ..
            } => {
                assert_eq!(project, PathBuf::from("p.json"));
                assert_eq!(seconds, 3);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_negative_offset_and_split() {
        let args = Args::parse_from(["layerdeck", "-q", "offset", "-120"]);
        assert_eq!(args.log_level(), LevelFilter::Error);
        assert!(matches!(args.command, Command::Offset { offset_ms: -120 }));

        let args = Args::parse_from(["layerdeck", "split", "take.wav", "3000", "7000"]);
        match args.command {
            Command::Split { boundaries_ms, .. } => assert_eq!(boundaries_ms, vec![3000, 7000]),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
