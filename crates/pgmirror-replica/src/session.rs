//! The replication session: slot and publication setup, the receive loop,
//! acknowledgement timing and reconnect-with-resume.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pgmirror_pg::wire::{decode_frame, PgOutputDecoder, ReplicationFrame};
use pgmirror_pg::{format_lsn, PgError, ReplicationTransport, Source};
use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::applier::ApplyOutcome;
use crate::engine::EngineInner;
use crate::error::{ReplicaError, ReplicaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    SlotCreated,
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::SlotCreated => "slot_created",
            SessionState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Deadline for the next standby status update.
#[derive(Debug)]
pub(crate) struct AckTimer {
    interval: Duration,
    deadline: Instant,
}

impl AckTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + interval,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_due(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Make the next loop iteration acknowledge immediately.
    pub fn expire(&mut self) {
        self.deadline = Instant::now();
    }

    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.interval;
    }
}

/// Exponential reconnect delays, capped, with an optional attempt limit.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
    /// Zero retries forever.
    max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts != 0 && self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Session<S: Source> {
    inner: Arc<EngineInner<S>>,
    state: SessionState,
    transport: Option<Box<dyn ReplicationTransport>>,
    /// Position just past the last frame read and applied.
    lsn: u64,
    lsn_tx: watch::Sender<u64>,
    ack: AckTimer,
    backoff: Backoff,
    decoder: PgOutputDecoder,
    shutdown: watch::Receiver<bool>,
}

impl<S: Source> Session<S> {
    pub fn new(inner: Arc<EngineInner<S>>, shutdown: watch::Receiver<bool>) -> Self {
        let config = &inner.config;
        let ack = AckTimer::new(config.status_interval);
        let backoff = Backoff::new(
            config.reconnect_backoff,
            config.max_backoff,
            config.max_reconnect_attempts,
        );
        let (lsn_tx, _) = watch::channel(0);
        Self {
            inner,
            state: SessionState::Disconnected,
            transport: None,
            lsn: 0,
            lsn_tx,
            ack,
            backoff,
            decoder: PgOutputDecoder::new(),
            shutdown,
        }
    }

    pub fn subscribe_lsn(&self) -> watch::Receiver<u64> {
        self.lsn_tx.subscribe()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Session state changed");
            self.state = next;
        }
    }

    /// Ensure the publication and slot exist and start streaming.
    pub async fn establish(&mut self) -> ReplicaResult<()> {
        let slot = self.inner.config.slot_name.clone();
        let publication = self.inner.config.publication_name.clone();

        self.inner.source.ensure_publication(&publication).await?;
        self.transition(SessionState::Connected);

        let start = self.inner.source.ensure_slot(&slot).await?;
        self.transition(SessionState::SlotCreated);
        self.advance(start.lsn());

        let transport = self
            .inner
            .source
            .open_replication(&slot, &publication, start.lsn())
            .await?;
        self.transport = Some(transport);
        self.ack.reset();
        self.transition(SessionState::Streaming);
        info!(slot = %slot, publication = %publication, lsn = %format_lsn(start.lsn()), "Streaming started");
        Ok(())
    }

    /// Run the receive loop until shutdown or a fatal error.
    pub async fn run(mut self) -> ReplicaResult<()> {
        let result = self.stream().await;
        self.disconnect().await;
        match &result {
            Ok(()) => info!(lsn = %format_lsn(self.lsn), "Replication session stopped"),
            Err(e) => error!(error = %e, lsn = %format_lsn(self.lsn), "Replication session failed"),
        }
        result
    }

    async fn stream(&mut self) -> ReplicaResult<()> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            if self.ack.is_due() {
                if let Err(e) = self.send_status().await {
                    match self.recover(e).await? {
                        Flow::Continue => continue,
                        Flow::Stop => return Ok(()),
                    }
                }
            }

            let deadline = self.ack.deadline();
            let Some(transport) = self.transport.as_mut() else {
                return Ok(());
            };

            let received = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                received = timeout_at(deadline, transport.recv()) => received,
            };

            let flow = match received {
                // Deadline reached with no data; the next iteration acks.
                Err(_) => Flow::Continue,
                Ok(Ok(Some(payload))) => {
                    self.handle_payload(payload).await?;
                    Flow::Continue
                }
                Ok(Ok(None)) => {
                    self.recover(PgError::Connection("server ended the replication stream".into()))
                        .await?
                }
                Ok(Err(e)) => self.recover(e).await?,
            };
            if let Flow::Stop = flow {
                return Ok(());
            }
        }
    }

    async fn handle_payload(&mut self, payload: Bytes) -> ReplicaResult<()> {
        match decode_frame(payload)? {
            ReplicationFrame::KeepAlive(keepalive) => {
                if keepalive.reply_requested {
                    debug!(wal_end = %format_lsn(keepalive.wal_end), "Keepalive requested a reply");
                    self.ack.expire();
                }
            }
            ReplicationFrame::XLogData(xlog) => {
                let end = xlog.end_lsn();
                let msg = self.decoder.decode(&xlog.data)?;
                debug!(kind = msg.kind(), lsn = %format_lsn(xlog.wal_start), "Received change");

                let outcome = self.inner.replica.lock().await.apply(msg);
                if let ApplyOutcome::Drift { table, reason } = outcome {
                    info!(table = %table, reason = %reason, "Resyncing table");
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.resync(&table).await });
                }
                self.advance(end);
            }
        }
        Ok(())
    }

    fn advance(&mut self, lsn: u64) {
        if lsn > self.lsn {
            self.lsn = lsn;
            self.lsn_tx.send_replace(lsn);
        }
    }

    async fn send_status(&mut self) -> Result<(), PgError> {
        if let Some(transport) = self.transport.as_mut() {
            transport.send_status(self.lsn).await?;
            debug!(lsn = %format_lsn(self.lsn), "Acknowledged");
        }
        self.ack.reset();
        Ok(())
    }

    /// Reconnect after a transient failure. Streaming restarts from LSN 0 so
    /// the source replays from the slot's confirmed position; the ack
    /// position never moves backwards.
    async fn recover(&mut self, err: PgError) -> ReplicaResult<Flow> {
        if !err.is_transient() {
            return Err(err.into());
        }
        warn!(error = %err, "Replication connection lost");
        self.disconnect().await;

        let slot = self.inner.config.slot_name.clone();
        let publication = self.inner.config.publication_name.clone();
        let mut last_error = err.to_string();

        loop {
            let Some(delay) = self.backoff.next_delay() else {
                return Err(ReplicaError::ReconnectExhausted {
                    attempts: self.backoff.attempts(),
                    last_error,
                });
            };
            info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(Flow::Stop),
                _ = sleep(delay) => {}
            }

            match self.inner.source.open_replication(&slot, &publication, 0).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.backoff.reset();
                    self.ack.reset();
                    self.transition(SessionState::Streaming);
                    return Ok(Flow::Continue);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Reconnect failed");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Acknowledge what was read and close the stream, best effort.
    async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.send_status(self.lsn).await {
                debug!(error = %e, "Final acknowledgement failed");
            }
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Closing replication stream failed");
            }
        }
        self.transition(SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(12), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(12)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(12)));
        assert_eq!(backoff.attempts(), 4);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_attempt_limit() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timer() {
        let mut timer = AckTimer::new(Duration::from_secs(10));
        assert!(!timer.is_due());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(timer.is_due());

        timer.reset();
        assert!(!timer.is_due());
        assert_eq!(timer.deadline(), Instant::now() + Duration::from_secs(10));

        timer.expire();
        assert!(timer.is_due());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::SlotCreated.to_string(), "slot_created");
        assert_eq!(SessionState::Streaming.to_string(), "streaming");
    }
}
