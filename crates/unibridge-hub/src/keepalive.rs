//! Per-session keepalive supervisor.
//!
//! One task per registered session. On a fixed interval it checks how long
//! ago the plugin last answered a ping; past the dead threshold it signals
//! the connection's read loop to close (treated exactly like a disconnect).
//! Otherwise it sends the next ping — a failed send means the writer is
//! already gone, which closes immediately.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use unibridge_core::SessionId;

use crate::config::KeepaliveConfig;
use crate::connection::CloseReason;
use crate::protocol::ServerMessage;

/// Shared last-pong timestamp, updated by the read loop on every `pong`.
pub(crate) type LastPong = Arc<Mutex<Instant>>;

pub(crate) fn read_last_pong(last_pong: &LastPong) -> Instant {
    *last_pong.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn touch_last_pong(last_pong: &LastPong) {
    *last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
}

/// Run the keepalive loop for one session until it closes the connection,
/// the connection disappears, or the daemon shuts down.
pub(crate) async fn run_keepalive(
    session_id: SessionId,
    config: KeepaliveConfig,
    last_pong: LastPong,
    outbound: mpsc::Sender<ServerMessage>,
    close: mpsc::Sender<CloseReason>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = config.interval();
    let dead_after = config.dead_after();
    debug!(session = %session_id, interval_secs = config.interval_secs, "Keepalive supervisor started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!(session = %session_id, "Keepalive supervisor shutting down");
                return;
            }
            () = tokio::time::sleep(interval) => {
                let idle = read_last_pong(&last_pong).elapsed();
                if idle > dead_after {
                    warn!(
                        session = %session_id,
                        idle_secs = idle.as_secs(),
                        "No pong within the dead-connection window, closing"
                    );
                    let _ = close.try_send(CloseReason::KeepaliveTimeout);
                    return;
                }
                if outbound.send(ServerMessage::Ping).await.is_err() {
                    // Writer task exited — the connection is already dying.
                    let _ = close.try_send(CloseReason::KeepaliveTimeout);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_secs: u64, dead_after_secs: u64) -> KeepaliveConfig {
        KeepaliveConfig {
            interval_secs,
            dead_after_secs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pings_while_pongs_keep_arriving() {
        let last_pong: LastPong = Arc::new(Mutex::new(Instant::now()));
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(run_keepalive(
            SessionId::new(),
            config(10, 20),
            Arc::clone(&last_pong),
            outbound_tx,
            close_tx,
            shutdown_rx,
        ));

        // Three intervals of healthy pongs produce three pings.
        for _ in 0..3 {
            touch_last_pong(&last_pong);
            let msg = outbound_rx.recv().await.unwrap();
            assert!(matches!(msg, ServerMessage::Ping));
        }
        assert!(close_rx.try_recv().is_err());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_threshold_closes() {
        let last_pong: LastPong = Arc::new(Mutex::new(Instant::now()));
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(run_keepalive(
            SessionId::new(),
            config(10, 20),
            last_pong,
            outbound_tx,
            close_tx,
            shutdown_rx,
        ));

        // Never touch last_pong: the first two checks (10s, 20s) still sit
        // at/below the threshold and ping; the third (30s) is past it.
        assert!(matches!(
            outbound_rx.recv().await,
            Some(ServerMessage::Ping)
        ));
        assert!(matches!(
            outbound_rx.recv().await,
            Some(ServerMessage::Ping)
        ));
        let reason = close_rx.recv().await.unwrap();
        assert!(matches!(reason, CloseReason::KeepaliveTimeout));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_writer_ends_supervision() {
        let last_pong: LastPong = Arc::new(Mutex::new(Instant::now()));
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        drop(outbound_rx);

        let task = tokio::spawn(run_keepalive(
            SessionId::new(),
            config(10, 20),
            last_pong,
            outbound_tx,
            close_tx,
            shutdown_rx,
        ));

        let reason = close_rx.recv().await.unwrap();
        assert!(matches!(reason, CloseReason::KeepaliveTimeout));
        task.await.unwrap();
    }
}
