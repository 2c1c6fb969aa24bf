//! GATT Operation Queue
//!
//! Serializes reads and writes against the active connection. Requests are
//! served in arrival order and only one is ever outstanding with the
//! transport; the next is dispatched once the previous completes, fails or
//! times out.
//!
//! The queue never resolves a request itself. Every path that ends a request
//! hands back a [`Finished`] record and the session settles it, so cached
//! values and observers are updated in one place.

use crate::domain::error::{SessionError, SessionResult};
use crate::infrastructure::bluetooth::connection::BleConnection;
use crate::infrastructure::bluetooth::transport::{
    LinkId, RequestId, Transport, TransportResult,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// `Ok(Some(bytes))` for reads, `Ok(None)` for acknowledged writes
pub type GattResult = SessionResult<Option<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
    Read,
    Write(Vec<u8>),
}

impl GattOp {
    pub fn is_read(&self) -> bool {
        matches!(self, GattOp::Read)
    }
}

/// Who is waiting for a request
#[derive(Debug)]
pub enum Completion {
    Caller(oneshot::Sender<GattResult>),
    Poll,
}

#[derive(Debug)]
pub struct GattRequest {
    pub op: GattOp,
    pub characteristic: Uuid,
    pub completion: Completion,
}

impl GattRequest {
    pub fn new(op: GattOp, characteristic: Uuid, completion: Completion) -> Self {
        Self {
            op,
            characteristic,
            completion,
        }
    }
}

/// A request that reached its terminal outcome
#[derive(Debug)]
pub struct Finished {
    pub characteristic: Uuid,
    pub was_read: bool,
    pub completion: Completion,
    pub result: GattResult,
}

impl Finished {
    fn new(request: GattRequest, result: GattResult) -> Self {
        Self {
            characteristic: request.characteristic,
            was_read: request.op.is_read(),
            completion: request.completion,
            result,
        }
    }
}

struct InFlight {
    id: RequestId,
    link: LinkId,
    deadline: Instant,
    request: GattRequest,
}

pub struct GattQueue {
    pending: VecDeque<GattRequest>,
    in_flight: Option<InFlight>,
    next_request: u64,
    timeout: Duration,
}

impl GattQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            next_request: 1,
            timeout,
        }
    }

    /// Queued plus in-flight requests
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Deadline of the outstanding request
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// Whether a poll read is waiting for dispatch
    pub fn has_queued_poll(&self) -> bool {
        self.pending
            .iter()
            .any(|r| matches!(r.completion, Completion::Poll))
    }

    /// Accept a request, or hand it back already failed.
    ///
    /// Rejection happens without any transport call: `NotReady` unless the
    /// connection is `Ready`, `ResourceNotFound` if discovery did not report
    /// the characteristic.
    pub fn enqueue(
        &mut self,
        connection: &BleConnection,
        request: GattRequest,
    ) -> Option<Finished> {
        if !connection.is_ready() {
            return Some(Finished::new(request, Err(SessionError::NotReady)));
        }
        if connection.resolve(request.characteristic).is_none() {
            let uuid = request.characteristic;
            warn!("Characteristic not found: {}", uuid);
            return Some(Finished::new(
                request,
                Err(SessionError::ResourceNotFound(uuid)),
            ));
        }
        self.pending.push_back(request);
        None
    }

    /// Dispatch the next request if nothing is outstanding.
    ///
    /// A request the transport refuses outright is finished and the one after
    /// it is tried, so one bad request never stalls the queue.
    pub async fn pump(
        &mut self,
        transport: &dyn Transport,
        connection: &BleConnection,
    ) -> Vec<Finished> {
        let mut finished = Vec::new();
        if !connection.is_ready() {
            return finished;
        }
        let Some(link) = connection.link() else {
            return finished;
        };

        while self.in_flight.is_none() {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            let Some((service, _)) = connection.resolve(request.characteristic) else {
                let uuid = request.characteristic;
                finished.push(Finished::new(
                    request,
                    Err(SessionError::ResourceNotFound(uuid)),
                ));
                continue;
            };

            let id = RequestId(self.next_request);
            self.next_request += 1;

            let issued = match &request.op {
                GattOp::Read => {
                    debug!("Reading characteristic {}", request.characteristic);
                    transport
                        .read_characteristic(link, id, service, request.characteristic)
                        .await
                }
                GattOp::Write(value) => {
                    debug!(
                        "Writing {} bytes to characteristic {}",
                        value.len(),
                        request.characteristic
                    );
                    transport
                        .write_characteristic(
                            link,
                            id,
                            service,
                            request.characteristic,
                            value.clone(),
                        )
                        .await
                }
            };

            match issued {
                Ok(()) => {
                    self.in_flight = Some(InFlight {
                        id,
                        link,
                        deadline: Instant::now() + self.timeout,
                        request,
                    });
                }
                Err(e) => {
                    warn!("Transport refused GATT request: {}", e);
                    finished.push(Finished::new(request, Err(e.into())));
                }
            }
        }
        finished
    }

    /// Match a read completion to the outstanding request
    pub fn on_read_complete(
        &mut self,
        link: LinkId,
        request: RequestId,
        result: TransportResult<Vec<u8>>,
    ) -> Option<Finished> {
        let in_flight = self.take_matching(link, request)?;
        Some(Finished::new(
            in_flight.request,
            result.map(Some).map_err(SessionError::from),
        ))
    }

    pub fn on_write_complete(
        &mut self,
        link: LinkId,
        request: RequestId,
        result: TransportResult,
    ) -> Option<Finished> {
        let in_flight = self.take_matching(link, request)?;
        Some(Finished::new(
            in_flight.request,
            result.map(|()| None).map_err(SessionError::from),
        ))
    }

    /// Fail the outstanding request if its deadline has passed
    pub fn on_timeout(&mut self) -> Option<Finished> {
        let deadline = self.deadline()?;
        if Instant::now() < deadline {
            return None;
        }
        let in_flight = self.in_flight.take()?;
        warn!(
            "GATT operation on {} timed out",
            in_flight.request.characteristic
        );
        Some(Finished::new(in_flight.request, Err(SessionError::Timeout)))
    }

    /// Fail every request not yet dispatched
    pub fn cancel_pending(&mut self) -> Vec<Finished> {
        self.pending
            .drain(..)
            .map(|r| Finished::new(r, Err(SessionError::Disconnected)))
            .collect()
    }

    /// Fail everything, including the outstanding request
    pub fn cancel_all(&mut self) -> Vec<Finished> {
        let mut finished: Vec<Finished> = self
            .in_flight
            .take()
            .map(|f| Finished::new(f.request, Err(SessionError::Disconnected)))
            .into_iter()
            .collect();
        finished.extend(self.cancel_pending());
        finished
    }

    fn take_matching(&mut self, link: LinkId, request: RequestId) -> Option<InFlight> {
        match &self.in_flight {
            Some(f) if f.id == request && f.link == link => self.in_flight.take(),
            _ => {
                debug!("Ignoring completion for stale request {:?}", request);
                None
            }
        }
    }
}
