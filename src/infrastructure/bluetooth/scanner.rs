//! BLE Scanner Module
//!
//! Time-bounded advertisement scan for a single target service. A session
//! always ends in exactly one outcome, and exactly one stop-scan reaches the
//! transport no matter whether a match, a failure or the deadline ends it.

use crate::domain::error::{SessionError, SessionResult};
use crate::domain::models::{Peripheral, ScanOutcome};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, ScanId, Transport, TransportFailure,
};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ScanReply = oneshot::Sender<SessionResult<ScanOutcome>>;

struct ScanSession {
    id: ScanId,
    filter: Uuid,
    deadline: Instant,
    reply: ScanReply,
}

/// BLE Scanner for locating the target peripheral
pub struct BleScanner {
    active: Option<ScanSession>,
    next_id: u64,
}

impl Default for BleScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl BleScanner {
    pub fn new() -> Self {
        Self {
            active: None,
            next_id: 1,
        }
    }

    /// Start scanning for advertisements carrying `filter`.
    ///
    /// The outcome is delivered through `reply` once the session ends. If the
    /// scan cannot start, the error is sent through `reply` and also returned.
    pub async fn start(
        &mut self,
        transport: &dyn Transport,
        filter: Uuid,
        timeout: Duration,
        reply: ScanReply,
    ) -> SessionResult<()> {
        match self.begin(transport, filter).await {
            Ok(id) => {
                self.active = Some(ScanSession {
                    id,
                    filter,
                    deadline: Instant::now() + timeout,
                    reply,
                });
                Ok(())
            }
            Err(e) => {
                let _ = reply.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    async fn begin(&mut self, transport: &dyn Transport, filter: Uuid) -> SessionResult<ScanId> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyScanning);
        }
        if !transport.adapter_enabled().await {
            return Err(SessionError::AdapterDisabled);
        }

        let id = ScanId(self.next_id);
        self.next_id += 1;

        info!("Starting BLE scan for service UUID: {}", filter);
        transport.start_scan(id, filter).await?;
        Ok(id)
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|s| s.deadline)
    }

    /// Handle an advertisement. Returns the outcome if it ended the session.
    pub async fn on_result(
        &mut self,
        transport: &dyn Transport,
        scan: ScanId,
        advertisement: Advertisement,
    ) -> Option<ScanOutcome> {
        let session = self.active.as_ref().filter(|s| s.id == scan)?;

        if !advertisement.services.contains(&session.filter) {
            debug!(
                "Ignoring advertisement from {} without target service",
                advertisement.address
            );
            return None;
        }

        if Instant::now() >= session.deadline {
            return self.finish(transport, ScanOutcome::TimedOut).await;
        }

        let peripheral = Peripheral {
            address: advertisement.address,
            name: advertisement.name.filter(|n| !n.is_empty()),
            services: advertisement.services,
        };
        info!("Found peripheral {}", peripheral);
        self.finish(transport, ScanOutcome::Matched(peripheral))
            .await
    }

    pub async fn on_failed(
        &mut self,
        transport: &dyn Transport,
        scan: ScanId,
        reason: TransportFailure,
    ) -> Option<ScanOutcome> {
        self.active.as_ref().filter(|s| s.id == scan)?;
        warn!("Scan failed: {}", reason);
        self.finish(transport, ScanOutcome::Failed(reason.to_string()))
            .await
    }

    /// Called when the scan deadline fires
    pub async fn on_deadline(&mut self, transport: &dyn Transport) -> Option<ScanOutcome> {
        let session = self.active.as_ref()?;
        if Instant::now() < session.deadline {
            return None;
        }
        info!("Scan timed out without a match");
        self.finish(transport, ScanOutcome::TimedOut).await
    }

    /// Abort a running scan (session teardown)
    pub async fn cancel(&mut self, transport: &dyn Transport) -> Option<ScanOutcome> {
        self.active.as_ref()?;
        self.finish(transport, ScanOutcome::Failed("scan cancelled".to_string()))
            .await
    }

    async fn finish(
        &mut self,
        transport: &dyn Transport,
        outcome: ScanOutcome,
    ) -> Option<ScanOutcome> {
        // Whoever takes the session first stops the scan; later callers see None.
        let session = self.active.take()?;
        info!("Stopping BLE scan...");
        if let Err(e) = transport.stop_scan(session.id).await {
            warn!("Failed to stop scan cleanly: {}", e);
        }
        let _ = session.reply.send(Ok(outcome.clone()));
        Some(outcome)
    }
}
