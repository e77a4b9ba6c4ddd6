use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::engine::SyncEngine;

/// Why a sync cycle was requested. Signals carry no payload: the cycle
/// always reconciles everything, so any burst can collapse into one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    Timer,
    Connectivity,
    Visibility,
    Nudge,
    Manual,
}

/// Cheap, cloneable handle for anything that wants to request a sync.
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::UnboundedSender<SyncSignal>,
}

impl TriggerHandle {
    pub fn request(&self, signal: SyncSignal) {
        // a closed coordinator means the daemon is shutting down
        let _ = self.tx.send(signal);
    }
}

/// Funnels every sync trigger through one channel so the engine sees a
/// serialized request stream.
pub struct TriggerCoordinator {
    rx: mpsc::UnboundedReceiver<SyncSignal>,
    engine: Arc<SyncEngine>,
}

pub fn trigger_channel(engine: Arc<SyncEngine>) -> (TriggerHandle, TriggerCoordinator) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TriggerHandle { tx }, TriggerCoordinator { rx, engine })
}

impl TriggerCoordinator {
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let mut coalesced = 0usize;
            while self.rx.try_recv().is_ok() {
                coalesced += 1;
            }
            tracing::debug!(signal = ?first, coalesced, "sync requested");
            let outcome = self.engine.run_sync_cycle().await;
            if outcome.pushed > 0 || outcome.pulled > 0 || outcome.errors > 0 {
                tracing::info!(
                    pushed = outcome.pushed,
                    pulled = outcome.pulled,
                    errors = outcome.errors,
                    "sync cycle finished"
                );
            }
        }
    }
}

pub fn spawn_timer(handle: TriggerHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the daemon kicks off an initial cycle itself
        ticker.tick().await;
        loop {
            ticker.tick().await;
            handle.request(SyncSignal::Timer);
        }
    })
}

/// Listens on the server's nudge socket: one line per remote change. The
/// first outbound line authenticates the connection.
pub async fn run_nudge_listener(
    addr: &str,
    token: &str,
    handle: TriggerHandle,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(format!("AUTH {token}\n").as_bytes())
        .await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        tracing::debug!(line = %line, "nudge received");
        handle.request(SyncSignal::Nudge);
    }
    Ok(())
}
