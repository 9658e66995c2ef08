//! Command-line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "emu-harness")]
#[command(about = "Boot throwaway Android emulators and drive their console")]
#[command(version)]
pub struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot an emulator, run console commands, tear it down
    Start {
        /// AVD to boot (overrides emulator.avd_name)
        #[arg(long)]
        avd: Option<String>,

        /// First boot of a fresh AVD; waits longer
        #[arg(long)]
        first_boot: bool,

        /// Console command to run once booted (repeatable)
        #[arg(long = "command", short = 'x', value_name = "COMMAND")]
        commands: Vec<String>,

        /// Timeout per console command (ms)
        #[arg(long, default_value = "10000")]
        command_timeout_ms: u64,

        /// Keep the emulator running until Ctrl-C
        #[arg(long)]
        hold: bool,

        /// Capture logcat next to the emulator output
        #[arg(long)]
        logcat: bool,

        /// Directory for captured output (overrides output.dir)
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Send one command to a running emulator's console
    #[command(alias = "con")]
    Console {
        /// Console port of the emulator
        port: u16,
        /// Command line to send
        command: String,
        /// Session timeout (ms)
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,
    },

    /// Reserve a port lease, print it and release it again
    Ports {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_flag_short_and_long() {
        let cli = Cli::try_parse_from(["emu-harness", "-v", "ports"]).unwrap();
        assert_eq!(cli.verbose, 1);

        let cli = Cli::try_parse_from(["emu-harness", "ports", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn start_collects_commands() {
        let cli = Cli::try_parse_from([
            "emu-harness",
            "start",
            "--avd",
            "Pixel_API_34",
            "-x",
            "power capacity 50",
            "--command",
            "network speed full",
            "--hold",
        ])
        .unwrap();

        match cli.command {
            Commands::Start {
                avd,
                commands,
                hold,
                first_boot,
                command_timeout_ms,
                ..
            } => {
                assert_eq!(avd.as_deref(), Some("Pixel_API_34"));
                assert_eq!(commands, vec!["power capacity 50", "network speed full"]);
                assert!(hold);
                assert!(!first_boot);
                assert_eq!(command_timeout_ms, 10_000);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn console_alias_and_port() {
        let cli = Cli::try_parse_from(["emu-harness", "con", "5586", "avd name"]).unwrap();
        match cli.command {
            Commands::Console { port, command, timeout_ms } => {
                assert_eq!(port, 5586);
                assert_eq!(command, "avd name");
                assert_eq!(timeout_ms, 10_000);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn console_rejects_bad_port() {
        assert!(Cli::try_parse_from(["emu-harness", "console", "70000", "kill"]).is_err());
    }
}
