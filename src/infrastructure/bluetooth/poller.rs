//! Characteristic Poller
//!
//! Periodic read of one characteristic while the connection is `Ready`. The
//! first tick fires as soon as polling starts. A tick is skipped while the
//! previous poll read is still waiting in the queue, so at most one poll read
//! is queued behind the one in flight.
//!
//! Stopping is two-phase: [`CharacteristicPoller::stop`] ends scheduling at
//! once, and [`CharacteristicPoller::take_stopped`] reports the stop as
//! confirmed only after every poll read already issued has resolved. A
//! restart does not cancel that confirmation. Reads of the stopped run are
//! counted apart and, since the queue is FIFO, they resolve before any read of
//! the new run.

use crate::domain::error::{SessionError, SessionResult};
use crate::infrastructure::bluetooth::connection::BleConnection;
use crate::infrastructure::bluetooth::queue::{Completion, GattOp, GattRequest};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

struct Schedule {
    characteristic: Uuid,
    interval: Duration,
    next_tick: Instant,
}

#[derive(Default)]
pub struct CharacteristicPoller {
    schedule: Option<Schedule>,
    outstanding: usize,
    // Unresolved reads issued before the last stop
    retiring: usize,
    stopping: bool,
}

impl CharacteristicPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn next_tick(&self) -> Option<Instant> {
        self.schedule.as_ref().map(|s| s.next_tick)
    }

    /// Begin polling `characteristic` every `interval`.
    ///
    /// Restarting replaces the previous schedule.
    pub fn start(
        &mut self,
        connection: &BleConnection,
        characteristic: Uuid,
        interval: Duration,
    ) -> SessionResult<()> {
        if !connection.is_ready() {
            return Err(SessionError::NotReady);
        }
        if connection.resolve(characteristic).is_none() {
            return Err(SessionError::ResourceNotFound(characteristic));
        }

        info!(
            "Polling {} every {} ms",
            characteristic,
            interval.as_millis()
        );
        self.schedule = Some(Schedule {
            characteristic,
            interval,
            next_tick: Instant::now(),
        });
        Ok(())
    }

    /// Handle a due tick.
    ///
    /// Returns the read to enqueue, if any. Leaving `Ready` stops the poller
    /// instead of producing a read.
    pub fn on_tick(&mut self, connection_ready: bool, poll_queued: bool) -> Option<GattRequest> {
        let now = Instant::now();
        let schedule = self.schedule.as_mut()?;
        if now < schedule.next_tick {
            return None;
        }
        schedule.next_tick = now + schedule.interval;
        let characteristic = schedule.characteristic;

        if !connection_ready {
            info!("Connection left Ready, stopping poller");
            self.stop();
            return None;
        }
        if poll_queued {
            debug!("Previous poll read still queued, skipping tick");
            return None;
        }

        self.outstanding += 1;
        Some(GattRequest::new(GattOp::Read, characteristic, Completion::Poll))
    }

    /// Stop scheduling ticks. Returns whether the poller was running.
    pub fn stop(&mut self) -> bool {
        if self.schedule.take().is_none() {
            return false;
        }
        self.retiring += std::mem::take(&mut self.outstanding);
        self.stopping = true;
        true
    }

    /// One poll read reached its outcome
    pub fn on_poll_complete(&mut self) {
        if self.retiring > 0 {
            self.retiring -= 1;
        } else {
            self.outstanding = self.outstanding.saturating_sub(1);
        }
    }

    /// Poll reads issued and not yet resolved
    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.outstanding + self.retiring
    }

    /// True once per stop, when every poll read issued before it is resolved
    pub fn take_stopped(&mut self) -> bool {
        if self.stopping && self.retiring == 0 {
            self.stopping = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::{ready_connection, FakeTransport};
    use crate::infrastructure::bluetooth::protocol::READ_CHAR_UUID;

    const INTERVAL: Duration = Duration::from_millis(3000);

    #[tokio::test]
    async fn test_start_requires_ready() {
        let connection = BleConnection::new(INTERVAL);
        let mut poller = CharacteristicPoller::new();
        assert_eq!(
            poller.start(&connection, READ_CHAR_UUID, INTERVAL),
            Err(SessionError::NotReady)
        );
        assert!(!poller.is_active());
    }

    #[tokio::test]
    async fn test_start_requires_known_characteristic() {
        let fake = FakeTransport::new();
        let connection = ready_connection(&fake).await;
        let mut poller = CharacteristicPoller::new();
        let unknown = Uuid::from_u128(7);
        assert_eq!(
            poller.start(&connection, unknown, INTERVAL),
            Err(SessionError::ResourceNotFound(unknown))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_immediate_then_interval() {
        let fake = FakeTransport::new();
        let connection = ready_connection(&fake).await;
        let mut poller = CharacteristicPoller::new();
        poller.start(&connection, READ_CHAR_UUID, INTERVAL).unwrap();

        let request = poller.on_tick(true, false).unwrap();
        assert_eq!(request.op, GattOp::Read);
        assert_eq!(request.characteristic, READ_CHAR_UUID);
        assert!(matches!(request.completion, Completion::Poll));

        assert!(poller.on_tick(true, false).is_none());
        tokio::time::advance(INTERVAL).await;
        assert!(poller.on_tick(true, false).is_some());
        assert_eq!(poller.outstanding(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skipped_while_poll_queued() {
        let fake = FakeTransport::new();
        let connection = ready_connection(&fake).await;
        let mut poller = CharacteristicPoller::new();
        poller.start(&connection, READ_CHAR_UUID, INTERVAL).unwrap();

        assert!(poller.on_tick(true, true).is_none());
        assert_eq!(poller.outstanding(), 0);
        assert!(poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_ready_stops_poller() {
        let fake = FakeTransport::new();
        let connection = ready_connection(&fake).await;
        let mut poller = CharacteristicPoller::new();
        poller.start(&connection, READ_CHAR_UUID, INTERVAL).unwrap();
        poller.on_tick(true, false).unwrap();

        tokio::time::advance(INTERVAL).await;
        assert!(poller.on_tick(false, false).is_none());
        assert!(!poller.is_active());
        assert_eq!(poller.next_tick(), None);

        // Confirmation waits for the read issued on the first tick.
        assert!(!poller.take_stopped());
        poller.on_poll_complete();
        assert!(poller.take_stopped());
        assert!(!poller.take_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_pending_stop_confirmation() {
        let fake = FakeTransport::new();
        let connection = ready_connection(&fake).await;
        let mut poller = CharacteristicPoller::new();
        poller.start(&connection, READ_CHAR_UUID, INTERVAL).unwrap();
        poller.on_tick(true, false).unwrap();

        assert!(poller.stop());
        poller.start(&connection, READ_CHAR_UUID, INTERVAL).unwrap();
        poller.on_tick(true, false).unwrap();
        assert!(!poller.take_stopped());

        // The read from the first run resolves first and confirms its stop.
        poller.on_poll_complete();
        assert!(poller.take_stopped());
        assert!(poller.is_active());
        assert_eq!(poller.outstanding(), 1);

        poller.on_poll_complete();
        assert!(!poller.take_stopped());
        assert!(poller.stop());
        assert!(poller.take_stopped());
    }

    #[test]
    fn test_stop_when_idle() {
        let mut poller = CharacteristicPoller::new();
        assert!(!poller.stop());
        assert!(!poller.take_stopped());
    }
}
