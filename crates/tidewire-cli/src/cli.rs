//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tidewire_core::CompressionMode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Compression applied to every payload (none, gzip, brotli)
    #[arg(long, global = true)]
    pub compression: Option<CompressionMode>,

    /// Sliding transfer timeout in milliseconds; 0 disables it
    #[arg(long, global = true)]
    pub transfer_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Listen for connections and log every received message
    Serve {
        /// Listen address, e.g. tcp://0.0.0.0:7000 or ws://0.0.0.0:8080
        #[arg(short, long)]
        listen: Option<String>,
        /// Send every received message back to its connection
        #[arg(long)]
        echo: bool,
        /// Idle-sweep period in milliseconds; 0 disables it
        #[arg(long)]
        idle_timeout_ms: Option<u64>,
    },
    /// Connect, send one message and exit
    Send {
        /// Server address
        #[arg(short, long)]
        to: String,
        /// Send the contents of this file instead of MESSAGE
        #[arg(short, long, conflicts_with = "message")]
        file: Option<PathBuf>,
        /// Message text
        #[arg(required_unless_present = "file")]
        message: Option<String>,
    },
    /// Round-trip a payload through a server started with --echo
    EchoCheck {
        /// Server address
        #[arg(short, long)]
        to: String,
        /// Payload size in bytes
        #[arg(short, long, default_value_t = 5001)]
        size: usize,
        /// Number of round trips
        #[arg(short, long, default_value_t = 1)]
        rounds: u32,
        /// How long to wait for each reply, in milliseconds
        #[arg(long, default_value_t = 10_000)]
        wait_ms: u64,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from([
            "tidewire",
            "serve",
            "--listen",
            "ws://127.0.0.1:8080",
            "--echo",
            "--compression",
            "gzip",
        ]);
        assert_eq!(cli.compression, Some(CompressionMode::GZip));
        match cli.command {
            Commands::Serve { listen, echo, .. } => {
                assert_eq!(listen.as_deref(), Some("ws://127.0.0.1:8080"));
                assert!(echo);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_send_requires_message_or_file() {
        assert!(Cli::try_parse_from(["tidewire", "send", "--to", "tcp://127.0.0.1:1"]).is_err());
        let cli = Cli::try_parse_from([
            "tidewire",
            "send",
            "--to",
            "tcp://127.0.0.1:1",
            "--file",
            "payload.bin",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Send { file: Some(_), message: None, .. }));
    }

    #[test]
    fn test_echo_check_defaults() {
        let cli = Cli::parse_from(["tidewire", "echo-check", "--to", "tcp://127.0.0.1:1"]);
        match cli.command {
            Commands::EchoCheck { size, rounds, .. } => {
                assert_eq!(size, 5001);
                assert_eq!(rounds, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
