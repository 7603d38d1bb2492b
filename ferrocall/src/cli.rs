//! # CLI
//!
//! This module defines the command-line interface of `ferrocall` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers are `key:value`).
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "ferrocall",
    version,
    about = "Runs RPCs through the Ferrocall call engine against an in-process echo service"
)]
pub struct Cli {
    /// Log level used when RUST_LOG is not set (e.g. info, debug, ferrocall_core=trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Time the echo service waits before each response, in milliseconds
    #[arg(long, global = true, default_value_t = 0)]
    pub server_delay_ms: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one message and receive one echo
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// ferrocall unary hello -H x-request-id:42
    /// ```
    Unary {
        message: String,

        #[command(flatten)]
        call: CallArgs,
    },

    /// Stream messages to the service and receive them joined by commas
    ClientStreaming {
        #[arg(required = true)]
        messages: Vec<String>,

        #[command(flatten)]
        call: CallArgs,
    },

    /// Send a comma separated message and receive every part as its own response
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// ferrocall --server-delay-ms 100 server-streaming a,b,c,d --cancel-after 2
    /// ```
    ServerStreaming {
        message: String,

        #[command(flatten)]
        call: CallArgs,

        /// Cancel the call after receiving this many responses
        #[arg(long)]
        cancel_after: Option<usize>,
    },

    /// Exchange messages one at a time, each answered in uppercase
    Duplex {
        #[arg(required = true)]
        messages: Vec<String>,

        #[command(flatten)]
        call: CallArgs,

        /// Cancel the call after receiving this many responses
        #[arg(long)]
        cancel_after: Option<usize>,
    },
}

/// Options shared by every call.
#[derive(Args)]
pub struct CallArgs {
    /// Request header, repeatable
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Deadline of the call, in milliseconds from its start
    #[arg(long)]
    pub deadline_ms: Option<u64>,
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| "Format must be 'key:value'".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_split_on_the_first_colon() {
        assert_eq!(
            parse_header("x-trace : a:b").unwrap(),
            ("x-trace".to_string(), "a:b".to_string())
        );
        assert!(parse_header("no-separator").is_err());
    }

    #[test]
    fn parses_a_streaming_command() {
        let cli = Cli::try_parse_from([
            "ferrocall",
            "--log-format",
            "json",
            "duplex",
            "a",
            "b",
            "--deadline-ms",
            "500",
            "--cancel-after",
            "1",
            "-H",
            "x-id:7",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Duplex {
                messages,
                call,
                cancel_after,
            } => {
                assert_eq!(messages, vec!["a", "b"]);
                assert_eq!(call.deadline_ms, Some(500));
                assert_eq!(call.headers, vec![("x-id".to_string(), "7".to_string())]);
                assert_eq!(cancel_after, Some(1));
            }
            _ => panic!("expected the duplex command"),
        }
    }

    #[test]
    fn streaming_commands_need_messages() {
        assert!(Cli::try_parse_from(["ferrocall", "client-streaming"]).is_err());
    }
}
