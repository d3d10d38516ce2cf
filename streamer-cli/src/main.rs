//! Command line streamer.
//!
//! Opens one connection, logs every notification, starts an optional
//! local recording once media flows, and reconnects on network failures.

mod settings;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};
use url::Url;

use streamer_engine::SessionManager;
use streamer_ipc::{ConnectionId, ConnectionState, ConnectionStatus, StreamerEvent};
use streamer_transport::DriverRegistry;

use crate::settings::Settings;

/// Stream to an RTMP endpoint.
///
/// SRT and RIST settings are understood but need a link backend, which
/// this binary does not bundle.
#[derive(Debug, Parser)]
#[command(name = "streamer", version, about)]
struct Cli {
    /// JSON settings file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stream URL, e.g. rtmp://host/app/key.
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// Record locally to this file:// URL once media flows.
    #[arg(short, long, value_name = "URL")]
    record: Option<Url>,

    /// Override the reconnect attempt limit.
    #[arg(long, value_name = "N")]
    max_reconnects: Option<u32>,
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Closed because the user asked to stop.
    Stopped,

    /// Ended on its own.
    Ended {
        status: ConnectionStatus,
        reached_record: bool,
    },
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "streamer=debug,streamer_engine=debug,streamer_transport=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Raise `should_stop` on Ctrl-C.
fn watch_ctrl_c(should_stop: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("Failed to build signal runtime")?;

    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping");
                    should_stop.store(true, Ordering::SeqCst);
                }
            });
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut settings = Settings::resolve(cli.config.as_deref(), cli.url.as_deref())?;
    if let Some(record) = cli.record {
        settings.record = Some(record);
    }
    if let Some(max) = cli.max_reconnects {
        settings.reconnect.max_attempts = max;
    }

    let should_stop = Arc::new(AtomicBool::new(false));
    watch_ctrl_c(Arc::clone(&should_stop))?;

    run(&settings, &should_stop)
}

fn run(settings: &Settings, should_stop: &AtomicBool) -> Result<()> {
    let drivers = DriverRegistry::with_defaults();
    settings.ensure_supported(&drivers)?;

    let (manager, events) = SessionManager::builder()
        .drivers(drivers)
        .config(settings.session.clone())
        .build_with_channel()
        .context("Failed to start session manager")?;

    info!(target_addr = %settings.connection.describe(), "Streamer starting");

    let mut retries = 0;
    loop {
        let id = manager
            .open(settings.connection.clone())
            .context("Failed to open connection")?;

        match watch(&manager, &events, id, settings.record.as_ref(), should_stop)? {
            Outcome::Stopped => {
                info!("Streamer stopped");
                return Ok(());
            }
            Outcome::Ended {
                status: ConnectionStatus::Success,
                ..
            } => {
                info!("Connection closed");
                return Ok(());
            }
            Outcome::Ended {
                status,
                reached_record,
            } => {
                if reached_record {
                    retries = 0;
                }
                if !settings.reconnect.should_reconnect(status, retries) {
                    bail!("{}", status.message());
                }

                retries += 1;
                let delay = settings.reconnect.delay_for_attempt(retries);
                warn!(
                    attempt = retries,
                    max_attempts = settings.reconnect.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting"
                );
                if sleep_unless_stopped(delay, should_stop) {
                    info!("Streamer stopped");
                    return Ok(());
                }
            }
        }
    }
}

/// Follow one connection until it is disconnected.
fn watch(
    manager: &SessionManager,
    events: &Receiver<StreamerEvent>,
    id: ConnectionId,
    record: Option<&Url>,
    should_stop: &AtomicBool,
) -> Result<Outcome> {
    let mut closing = false;
    let mut reached_record = false;

    loop {
        if !closing && should_stop.load(Ordering::SeqCst) {
            closing = true;
            close_if_live(manager, id)?;
        }

        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("Notification channel closed"),
        };

        match event {
            StreamerEvent::ConnectionStateChanged {
                connection_id,
                state,
                status,
                info,
            } => {
                info!(%connection_id, state = state.name(), ?status, ?info, "Connection state changed");
                if connection_id != id {
                    continue;
                }

                if state == ConnectionState::Record {
                    reached_record = true;
                    if let Some(url) = record {
                        if let Err(e) = manager.start_recording(id, url.clone()) {
                            error!(error = %e, "Failed to start recording");
                        }
                    }
                }

                if state.is_terminal() {
                    return Ok(if closing {
                        Outcome::Stopped
                    } else {
                        Outcome::Ended {
                            status,
                            reached_record,
                        }
                    });
                }
            }
            StreamerEvent::RecordStateChanged { state, url } => {
                let url = url.map(String::from).unwrap_or_default();
                info!(?state, %url, "Record state changed");
            }
        }
    }
}

/// Close `id`, treating an id that is already gone as closed.
fn close_if_live(manager: &SessionManager, id: ConnectionId) -> Result<()> {
    match manager.close(id) {
        Ok(()) => Ok(()),
        Err(e) if e.is_stale_id() => {
            debug!(error = %e, "Connection already gone");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to close connection"),
    }
}

/// Sleep for `delay`. Returns true if a stop was requested meanwhile.
fn sleep_unless_stopped(delay: Duration, should_stop: &AtomicBool) -> bool {
    let step = Duration::from_millis(50);
    let mut remaining = delay;
    while !remaining.is_zero() {
        if should_stop.load(Ordering::SeqCst) {
            return true;
        }
        let nap = remaining.min(step);
        thread::sleep(nap);
        remaining -= nap;
    }
    should_stop.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "streamer",
            "--url",
            "rtmp://live.example.com/app/key",
            "--record",
            "file:///tmp/out.ts",
            "--max-reconnects",
            "5",
        ])
        .unwrap();

        assert_eq!(cli.url.as_deref(), Some("rtmp://live.example.com/app/key"));
        assert_eq!(cli.record.unwrap().scheme(), "file");
        assert_eq!(cli.max_reconnects, Some(5));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_closing_a_gone_connection_is_not_an_error() {
        let (manager, _events) = SessionManager::builder().build_with_channel().unwrap();
        assert!(close_if_live(&manager, ConnectionId::new(42)).is_ok());
    }

    #[test]
    fn test_sleep_returns_early_on_stop() {
        let stop = AtomicBool::new(true);
        assert!(sleep_unless_stopped(Duration::from_secs(60), &stop));

        let go = AtomicBool::new(false);
        assert!(!sleep_unless_stopped(Duration::from_millis(10), &go));
    }
}
