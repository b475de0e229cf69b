use std::path::Path;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::SecurityEvent;
use crate::writer::EventWriter;

/// Channel buffer size used between producers and the background writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Maximum events drained from the channel per write batch.
const BATCH_SIZE: usize = 64;

/// A cheap, cloneable handle used to submit [`SecurityEvent`] values into the
/// background event-log writer.
///
/// `EventSink` is `Clone + Send + Sync` so it can be shared freely across
/// connection tasks and components.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SecurityEvent>,
}

impl EventSink {
    /// Spawn the background writer task and return a `(sink, join_handle)`
    /// pair.
    ///
    /// The writer opens (or creates) the rotating log at `path` and drains
    /// the internal channel in batches of up to [`BATCH_SIZE`], flushing
    /// once per batch. When the last sink clone drops the remaining events
    /// are written out and the task exits. The background task never
    /// panics; I/O errors are logged and the affected event is skipped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), crate::writer::EventWriteError> {
        let (tx, rx) = mpsc::channel::<SecurityEvent>(CHANNEL_BUFFER);

        let mut writer = EventWriter::new(path).await?;

        let handle = tokio::spawn(async move {
            run_writer_loop(&mut writer, rx).await;
        });

        Ok((Self { tx }, handle))
    }

    /// A sink whose events go nowhere. Useful for tests and for components
    /// constructed before the real sink exists.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel::<SecurityEvent>(1);
        Self { tx }
    }

    /// Send a security event to the background writer.
    ///
    /// If the channel is full this waits asynchronously until space is
    /// available. If the background task has already exited the event is
    /// dropped and a warning is logged.
    pub async fn log(&self, event: SecurityEvent) {
        if let Err(err) = self.tx.send(event).await {
            tracing::warn!(
                kind = ?err.0.kind,
                "event sink channel closed, event dropped"
            );
        }
    }

    /// Non-blocking variant of [`log`](Self::log) for synchronous call sites
    /// (the vault and the filters run outside any async context).
    ///
    /// If the channel is full or closed the event is dropped and a warning is
    /// logged; event delivery is best-effort by design.
    pub fn try_log(&self, event: SecurityEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::warn!(%err, "event sink unavailable, event dropped");
        }
    }
}

/// Core loop executed inside the background task.
///
/// Waits for at least one event, drains whatever else is already queued (up
/// to [`BATCH_SIZE`]), writes the batch, and flushes once. A burst of events
/// therefore costs one flush, while a lone event still reaches disk
/// immediately. Exits when the channel closes.
async fn run_writer_loop(writer: &mut EventWriter, mut rx: mpsc::Receiver<SecurityEvent>) {
    let mut batch: Vec<SecurityEvent> = Vec::with_capacity(BATCH_SIZE);

    loop {
        batch.clear();
        if rx.recv_many(&mut batch, BATCH_SIZE).await == 0 {
            // Channel closed and empty.
            tracing::debug!(
                events = writer.events_written(),
                "event writer background task shutting down"
            );
            return;
        }

        for event in batch.drain(..) {
            if let Err(err) = writer.write(&event).await {
                tracing::error!(%err, kind = ?event.kind, "failed to write security event");
            }
        }
        if let Err(err) = writer.flush().await {
            tracing::error!(%err, "failed to flush event log");
        }
    }
}
