//! Command-line argument parsing for the `gracht-echo` demo binary.

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::path::PathBuf;

use crate::defaults;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// gracht-echo: a minimal server exercising the gracht RPC runtime over a
/// stream and/or datagram UNIX-domain link, with a single echo protocol.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to bind the stream-oriented UNIX-domain socket at.
    ///
    /// Pass an empty string to disable the stream link entirely; at least
    /// one of --stream-socket or --datagram-socket must resolve to a path.
    #[arg(long, default_value = defaults::STREAM_SOCKET_PATH)]
    pub stream_socket: String,

    /// Path to bind the datagram-oriented UNIX-domain socket at.
    #[arg(long, default_value = "")]
    pub datagram_socket: String,

    /// Number of worker threads. `0` or `1` runs the single-threaded
    /// cooperative execution mode; `2` or more spins up a worker pool.
    #[arg(short = 'w', long, default_value_t = 0)]
    pub workers: usize,

    /// Maximum size, in bytes, of one framed message.
    #[arg(short = 's', long, default_value_t = defaults::MAX_MESSAGE_SIZE)]
    pub max_message_size: u32,

    /// Where to write detailed diagnostic logs. Pass "stderr" to log there
    /// instead of to a rotating file.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Silence user-facing informational output on stdout.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr/log file.
    ///
    ///  -v: debug
    ///  -vv or more: trace
    /// By default, only INFO and above is shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

impl Args {
    pub fn stream_path(&self) -> Option<PathBuf> {
        if self.stream_socket.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.stream_socket))
        }
    }

    pub fn datagram_path(&self) -> Option<PathBuf> {
        if self.datagram_socket.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.datagram_socket))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_socket_path_disables_that_link() {
        let args = Args::parse_from(["gracht-echo", "--stream-socket", "", "--datagram-socket", "/tmp/x.sock"]);
        assert!(args.stream_path().is_none());
        assert_eq!(args.datagram_path(), Some(PathBuf::from("/tmp/x.sock")));
    }

    #[test]
    fn default_stream_socket_is_set() {
        let args = Args::parse_from(["gracht-echo"]);
        assert!(args.stream_path().is_some());
        assert!(args.datagram_path().is_none());
    }
}
