//! `gracht-echo`: a minimal demo server exercising the gracht RPC runtime.
//!
//! Registers one application protocol (id 1) with a single echo action that
//! returns its in-parameters as out-parameters, then runs the event loop
//! until the process is terminated.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use gracht::cli::Args;
use gracht::logging::ColorizedFormatter;
use gracht::{ActionDescriptor, GrachtServer, GrachtServerConfig, Link, UnixSocketLink};

const ECHO_PROTOCOL: u8 = 1;
const ECHO_ACTION: u8 = 1;

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(log_level).boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("gracht.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "gracht.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    let link = UnixSocketLink::new(args.stream_path(), args.datagram_path(), args.max_message_size);
    let config = GrachtServerConfig::new(Box::new(link) as Box<dyn Link>)
        .workers(args.workers)
        .max_message_size(args.max_message_size)
        .on_client_connected(|handle| info!(handle, "client connected"))
        .on_client_disconnected(|handle| info!(handle, "client disconnected"));

    let mut server = GrachtServer::initialize(config).context("failed to initialize gracht server")?;
    server
        .register_protocol(ECHO_PROTOCOL, vec![echo_action()])
        .context("failed to register echo protocol")?;

    info!(
        stream = ?args.stream_path(),
        datagram = ?args.datagram_path(),
        workers = args.workers,
        "gracht-echo listening"
    );

    if let Err(e) = server.run() {
        warn!(error = %e, "event loop exited with an error");
        return Err(e.into());
    }
    Ok(())
}

fn echo_action() -> ActionDescriptor {
    ActionDescriptor {
        action_id: ECHO_ACTION,
        handler: std::sync::Arc::new(|ctx: &gracht::ActionContext| {
            if let Err(e) = ctx.respond(ctx.params.clone()) {
                warn!(error = %e, "failed to send echo response");
            }
        }),
    }
}
