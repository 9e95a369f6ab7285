// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use bfd::event::EventSink;
use bfd::{clock, config, Dispatcher, BFD_CONTROL_PORT};
use clap::{Parser, Subcommand};
use slog::{error, info, warn, Drain, Logger};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set on SIGHUP; the loop re-reads the configuration on the next tick.
static RELOAD: AtomicBool = AtomicBool::new(false);

/// Set on SIGINT/SIGTERM; the loop tears everything down and exits.
static TERMINATE: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, styles = get_styles())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the BFD daemon.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Configuration file.
    #[arg(long, default_value = "/etc/bfdd.conf")]
    config: String,

    /// Path of a pipe or file state change events are written to.
    #[arg(long)]
    event_pipe: Option<String>,

    /// UDP port to listen on for BFD control packets.
    #[arg(long, default_value_t = BFD_CONTROL_PORT)]
    port: u16,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let log = init_logger();
    init_signals();

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read config {}", args.config))?;
    let sink = EventSink::new(open_event_pipe(&args, &log), log.clone());
    let store = config::load(&text, &log);

    let mut dispatcher =
        Dispatcher::new(store, sink, log.clone()).with_port(args.port);
    // no point staying alive without the listening socket
    dispatcher.init().context("start bfd dispatcher")?;
    info!(log, "bfd dispatcher running";
        "sessions" => dispatcher.store.len(), "port" => args.port);

    while !TERMINATE.load(Ordering::Relaxed) {
        if RELOAD.swap(false, Ordering::Relaxed) {
            reload(&mut dispatcher, &args.config, &log);
        }
        if let Err(e) = dispatcher.run_once() {
            error!(log, "dispatcher: {e}");
        }
    }

    info!(log, "terminating");
    dispatcher.shutdown();
    Ok(())
}

fn reload(dispatcher: &mut Dispatcher, path: &str, log: &Logger) {
    let started = clock::timer_now();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            error!(log, "reload: read config {path}: {e}");
            return;
        }
    };
    match dispatcher.reload(&text) {
        Ok(()) => info!(log,
            "reload finished in {} usec", clock::timer_now() - started;
            "sessions" => dispatcher.store.len()),
        Err(e) => error!(log, "reload: {e}"),
    }
}

fn open_event_pipe(
    args: &RunArgs,
    log: &Logger,
) -> Option<Box<dyn Write + Send>> {
    let path = args.event_pipe.as_ref()?;
    match std::fs::OpenOptions::new().write(true).open(path) {
        Ok(f) => Some(Box::new(f)),
        Err(e) => {
            warn!(log, "open event pipe {path}: {e}, events disabled");
            None
        }
    }
}

extern "C" fn on_sighup(_: libc::c_int) {
    RELOAD.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigend(_: libc::c_int) {
    TERMINATE.store(true, Ordering::Relaxed);
}

/// Flag-setting handlers only; all real work happens on the dispatcher
/// thread.
fn init_signals() {
    unsafe {
        libc::signal(
            libc::SIGHUP,
            on_sighup as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            on_sigend as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            on_sigend as *const () as libc::sighandler_t,
        );
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Create a bunyan style logger.
fn init_logger() -> Logger {
    let drain = slog_bunyan::new(std::io::stdout()).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x8000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .header(anstyle::Style::new().bold().underline().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(245, 207, 101)),
        )))
        .literal(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(72, 213, 151)),
        )))
        .invalid(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(72, 213, 151)),
        )))
        .valid(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(72, 213, 151)),
        )))
        .usage(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(245, 207, 101)),
        )))
        .error(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(232, 104, 134)),
        )))
}
