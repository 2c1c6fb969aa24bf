//! Bluetooth Service Module
//!
//! Session service coordinating scanning, connection, GATT I/O and polling
//! for one peripheral.
//!
//! All session state lives in a single worker task. Transport events, caller
//! commands and deadlines are consumed one at a time from a single
//! `select!` loop, so the state machine and the queue never see two events
//! at once. [`BluetoothService`] is the cloneable handle callers talk to.

use crate::domain::error::{SessionError, SessionResult};
use crate::domain::models::{
    ConnectionState, MessageSeverity, Peripheral, ScanOutcome, SessionEvent, StatusMessage,
    ValueUpdate,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    connection::{BleConnection, ServiceDescriptor, StateChange},
    poller::CharacteristicPoller,
    protocol::{self, CharacteristicKind},
    queue::{Completion, Finished, GattOp, GattQueue, GattRequest, GattResult},
    scanner::{BleScanner, ScanReply},
    transport::{Transport, TransportEvent},
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifiers and timing used by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub advertising_uuid: Uuid,
    pub service_uuid: Uuid,
    pub read_char_uuid: Uuid,
    pub percentage_char_uuid: Uuid,
    pub switch_char_uuid: Uuid,
    pub scan_timeout: Duration,
    pub operation_timeout: Duration,
    pub poll_interval: Duration,
    /// Start polling the read characteristic as soon as the connection is ready
    pub auto_poll: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            advertising_uuid: protocol::ADVERTISING_UUID,
            service_uuid: protocol::SERVICE_UUID,
            read_char_uuid: protocol::READ_CHAR_UUID,
            percentage_char_uuid: protocol::PERCENTAGE_CHAR_UUID,
            switch_char_uuid: protocol::SWITCH_CHAR_UUID,
            scan_timeout: Duration::from_millis(protocol::SCAN_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(protocol::OPERATION_TIMEOUT_MS),
            poll_interval: Duration::from_millis(protocol::POLL_INTERVAL_MS),
            auto_poll: true,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            advertising_uuid: protocol::parse_uuid(&settings.ble_advertising_uuid)?,
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            read_char_uuid: protocol::parse_uuid(&settings.ble_read_char_uuid)?,
            percentage_char_uuid: protocol::parse_uuid(&settings.ble_percentage_char_uuid)?,
            switch_char_uuid: protocol::parse_uuid(&settings.ble_switch_char_uuid)?,
            scan_timeout: Duration::from_millis(settings.scan_timeout_ms),
            operation_timeout: Duration::from_millis(settings.operation_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            auto_poll: settings.auto_poll,
        })
    }

    /// How payloads of `characteristic` are decoded for observers
    pub fn kind_of(&self, characteristic: Uuid) -> CharacteristicKind {
        if characteristic == self.percentage_char_uuid || characteristic == self.read_char_uuid {
            CharacteristicKind::Percentage
        } else if characteristic == self.switch_char_uuid {
            CharacteristicKind::Switch
        } else {
            CharacteristicKind::Raw
        }
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub peripheral: Option<Peripheral>,
    pub services: Vec<ServiceDescriptor>,
    pub scanning: bool,
    pub polling: bool,
    pub queue_depth: usize,
}

enum SessionCommand {
    StartScan {
        filter: Uuid,
        timeout: Duration,
        connect_on_match: bool,
        reply: ScanReply,
    },
    Connect {
        peripheral: Peripheral,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Enqueue(GattRequest),
    StartPolling {
        characteristic: Uuid,
        interval: Duration,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    StopPolling {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Completion handle for one queued read or write
#[derive(Debug)]
pub struct PendingOperation {
    receiver: oneshot::Receiver<GattResult>,
}

impl PendingOperation {
    /// Wait for the request to resolve
    pub async fn outcome(self) -> GattResult {
        self.receiver
            .await
            .unwrap_or(Err(SessionError::SessionClosed))
    }
}

/// Completion handle for a scan
#[derive(Debug)]
pub struct PendingScan {
    receiver: oneshot::Receiver<SessionResult<ScanOutcome>>,
}

impl PendingScan {
    /// Wait for the scan's terminal outcome
    pub async fn outcome(self) -> SessionResult<ScanOutcome> {
        self.receiver
            .await
            .unwrap_or(Err(SessionError::SessionClosed))
    }
}

async fn request<T>(
    commands: &mpsc::UnboundedSender<SessionCommand>,
    build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
) -> SessionResult<T> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(build(tx))
        .map_err(|_| SessionError::SessionClosed)?;
    rx.await.map_err(|_| SessionError::SessionClosed)
}

/// Handle to a running session
#[derive(Clone)]
pub struct BluetoothService {
    commands: mpsc::UnboundedSender<SessionCommand>,
    config: Arc<SessionConfig>,
}

impl BluetoothService {
    /// Spawn the session worker.
    ///
    /// `transport_events` must be the receiving end of the channel the
    /// transport was built with. Returns the handle and the event stream for
    /// observers.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);

        let worker = SessionWorker {
            transport,
            scanner: BleScanner::new(),
            connection: BleConnection::new(config.operation_timeout),
            queue: GattQueue::new(config.operation_timeout),
            poller: CharacteristicPoller::new(),
            connect_on_match: false,
            config: config.clone(),
            event_sender: event_tx,
        };
        tokio::spawn(worker.run(command_rx, transport_events));

        (
            Self {
                commands: command_tx,
                config,
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Scan for advertisements carrying `filter`
    pub fn start_scan(&self, filter: Uuid, timeout: Duration) -> PendingScan {
        self.scan(filter, timeout, false)
    }

    /// Scan for the configured advertising UUID and connect to the first match
    pub fn scan_and_connect(&self) -> PendingScan {
        self.scan(self.config.advertising_uuid, self.config.scan_timeout, true)
    }

    fn scan(&self, filter: Uuid, timeout: Duration, connect_on_match: bool) -> PendingScan {
        let (reply, receiver) = oneshot::channel();
        let _ = self.commands.send(SessionCommand::StartScan {
            filter,
            timeout,
            connect_on_match,
            reply,
        });
        PendingScan { receiver }
    }

    pub async fn connect(&self, peripheral: Peripheral) -> SessionResult<()> {
        request(&self.commands, |reply| SessionCommand::Connect { peripheral, reply }).await?
    }

    /// Connect to a peripheral known only by its address
    pub async fn request_connect(&self, address: &str) -> SessionResult<()> {
        self.connect(Peripheral::from_address(address)).await
    }

    pub async fn request_disconnect(&self) -> SessionResult<()> {
        request(&self.commands, |reply| SessionCommand::Disconnect { reply }).await?
    }

    /// Queue a GATT operation.
    ///
    /// The request is handed to the session before this returns, so requests
    /// from one caller are served in call order.
    pub fn enqueue(&self, op: GattOp, characteristic: Uuid) -> PendingOperation {
        let (tx, receiver) = oneshot::channel();
        let request = GattRequest::new(op, characteristic, Completion::Caller(tx));
        // A closed session drops the request and with it the sender.
        let _ = self.commands.send(SessionCommand::Enqueue(request));
        PendingOperation { receiver }
    }

    pub async fn read(&self, characteristic: Uuid) -> SessionResult<Vec<u8>> {
        let value = self.enqueue(GattOp::Read, characteristic).outcome().await?;
        Ok(value.unwrap_or_default())
    }

    pub async fn write(&self, characteristic: Uuid, value: Vec<u8>) -> SessionResult<()> {
        self.enqueue(GattOp::Write(value), characteristic)
            .outcome()
            .await
            .map(|_| ())
    }

    /// Write a percentage to the percentage characteristic
    pub fn send_percentage(&self, value: i32) -> PendingOperation {
        let payload = protocol::encode_percentage(value).to_vec();
        self.enqueue(GattOp::Write(payload), self.config.percentage_char_uuid)
    }

    /// Write an on/off value to the switch characteristic
    pub fn send_switch(&self, is_on: bool) -> PendingOperation {
        let payload = protocol::encode_switch(is_on).to_vec();
        self.enqueue(GattOp::Write(payload), self.config.switch_char_uuid)
    }

    pub async fn start_polling(
        &self,
        characteristic: Uuid,
        interval: Duration,
    ) -> SessionResult<()> {
        request(&self.commands, |reply| SessionCommand::StartPolling {
            characteristic,
            interval,
            reply,
        })
        .await?
    }

    /// Stop polling. Returns whether a poller was running.
    pub async fn stop_polling(&self) -> SessionResult<bool> {
        request(&self.commands, |reply| SessionCommand::StopPolling { reply }).await
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        request(&self.commands, |reply| SessionCommand::Snapshot { reply }).await
    }

    /// Cancel the scan, release the connection and stop the worker
    pub async fn shutdown(&self) {
        let _ = request(&self.commands, |reply| SessionCommand::Shutdown { reply }).await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct SessionWorker {
    transport: Arc<dyn Transport>,
    config: Arc<SessionConfig>,
    scanner: BleScanner,
    connection: BleConnection,
    queue: GattQueue,
    poller: CharacteristicPoller,
    connect_on_match: bool,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut transport_open = true;

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => {
                        self.run_due_timers().await;
                        self.handle_transport_event(event).await;
                    }
                    None => {
                        warn!("Transport event channel closed");
                        transport_open = false;
                    }
                },

                command = commands.recv() => {
                    self.run_due_timers().await;
                    match command {
                        Some(SessionCommand::Shutdown { reply }) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.teardown().await;
                            break;
                        }
                    }
                },

                _ = sleep_until_opt(deadline) => self.run_due_timers().await,
            }

            self.pump_queue().await;
        }

        info!("Bluetooth session stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.scanner.deadline(),
            self.queue.deadline(),
            self.poller.next_tick(),
            self.connection.disconnect_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every deadline that has passed. Each handler ignores a deadline
    /// that is not yet due.
    async fn run_due_timers(&mut self) {
        if let Some(outcome) = self.scanner.on_deadline(self.transport.as_ref()).await {
            self.on_scan_finished(outcome).await;
        }
        if let Some(finished) = self.queue.on_timeout() {
            self.settle(finished);
        }
        let changes = self
            .connection
            .on_disconnect_deadline(self.transport.as_ref())
            .await;
        self.apply_changes(changes);
        self.poll_tick();
        self.pump_queue().await;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let transport = self.transport.clone();
        match event {
            TransportEvent::ScanResult {
                scan,
                advertisement,
            } => {
                if let Some(outcome) = self
                    .scanner
                    .on_result(transport.as_ref(), scan, advertisement)
                    .await
                {
                    self.on_scan_finished(outcome).await;
                }
            }
            TransportEvent::ScanFailed { scan, reason } => {
                if let Some(outcome) = self
                    .scanner
                    .on_failed(transport.as_ref(), scan, reason)
                    .await
                {
                    self.on_scan_finished(outcome).await;
                }
            }
            TransportEvent::ConnectionStateChanged {
                link,
                connected,
                status,
            } => {
                let changes = self
                    .connection
                    .on_connection_state(transport.as_ref(), link, connected, status)
                    .await;
                self.apply_changes(changes);
            }
            TransportEvent::ServicesDiscovered { link, result } => {
                let changes = self
                    .connection
                    .on_services_discovered(transport.as_ref(), link, result)
                    .await;
                self.apply_changes(changes);
            }
            TransportEvent::ReadComplete {
                link,
                request,
                result,
                ..
            } => {
                if let Some(finished) = self.queue.on_read_complete(link, request, result) {
                    self.settle(finished);
                }
            }
            TransportEvent::WriteComplete {
                link,
                request,
                result,
                ..
            } => {
                if let Some(finished) = self.queue.on_write_complete(link, request, result) {
                    self.settle(finished);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let transport = self.transport.clone();
        match command {
            SessionCommand::StartScan {
                filter,
                timeout,
                connect_on_match,
                reply,
            } => {
                let started = self
                    .scanner
                    .start(transport.as_ref(), filter, timeout, reply)
                    .await;
                match started {
                    Ok(()) => self.connect_on_match = connect_on_match,
                    Err(e) => {
                        self.log(format!("Scan could not start: {e}"), MessageSeverity::Error)
                    }
                }
            }
            SessionCommand::Connect { peripheral, reply } => {
                let result = self.connect(peripheral).await;
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect { reply } => {
                let changes = self.connection.disconnect(transport.as_ref()).await;
                self.apply_changes(changes);
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Enqueue(request) => {
                if let Some(finished) = self.queue.enqueue(&self.connection, request) {
                    self.settle(finished);
                }
            }
            SessionCommand::StartPolling {
                characteristic,
                interval,
                reply,
            } => {
                let result = self.start_poller(characteristic, interval);
                let _ = reply.send(result);
            }
            SessionCommand::StopPolling { reply } => {
                let was_running = self.poller.stop();
                if was_running {
                    info!("Polling stopped");
                }
                self.confirm_poller_stopped();
                let _ = reply.send(was_running);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown { .. } => {}
        }
    }

    async fn connect(&mut self, peripheral: Peripheral) -> SessionResult<()> {
        let changes = self
            .connection
            .connect(self.transport.as_ref(), peripheral)
            .await
            .inspect_err(|e| error!("Connect request failed: {}", e))?;
        self.apply_changes(changes);
        Ok(())
    }

    async fn on_scan_finished(&mut self, outcome: ScanOutcome) {
        let connect = std::mem::take(&mut self.connect_on_match);
        match &outcome {
            ScanOutcome::Matched(peripheral) => {
                self.log(format!("Found {}", peripheral), MessageSeverity::Success)
            }
            ScanOutcome::TimedOut => {
                self.log("No device found before the scan timed out", MessageSeverity::Warning)
            }
            ScanOutcome::Failed(reason) => {
                self.log(format!("Scan failed: {reason}"), MessageSeverity::Error)
            }
        }
        self.emit(SessionEvent::ScanOutcome(outcome.clone()));

        if let (true, ScanOutcome::Matched(peripheral)) = (connect, outcome) {
            if let Err(e) = self.connect(peripheral).await {
                self.log(format!("Failed to connect: {e}"), MessageSeverity::Error);
            }
        }
    }

    /// Publish state changes and run their side effects on queue and poller
    fn apply_changes(&mut self, changes: Vec<StateChange>) {
        for change in changes {
            if change.from == ConnectionState::Ready || change.to == ConnectionState::Disconnected {
                self.poller.stop();
            }
            if change.from == ConnectionState::Ready {
                for finished in self.queue.cancel_pending() {
                    self.settle(finished);
                }
            }
            if change.to == ConnectionState::Disconnected {
                for finished in self.queue.cancel_all() {
                    self.settle(finished);
                }
            }

            self.emit(SessionEvent::ConnectionStatus {
                state: change.to,
                reason: change.reason.clone(),
            });

            match change.to {
                ConnectionState::Ready => self.on_ready(),
                ConnectionState::Disconnected => {
                    let message = match &change.reason {
                        Some(reason) => format!("Disconnected: {reason}"),
                        None => "Disconnected from device".to_string(),
                    };
                    let severity = if change.reason.is_some() {
                        MessageSeverity::Warning
                    } else {
                        MessageSeverity::Info
                    };
                    self.log(message, severity);
                }
                _ => {}
            }
        }
        self.confirm_poller_stopped();
    }

    fn on_ready(&mut self) {
        let name = self
            .connection
            .peripheral()
            .map(|p| p.to_string())
            .unwrap_or_default();
        self.log(format!("Connected to {name}"), MessageSeverity::Success);

        let has_service = self
            .connection
            .services()
            .iter()
            .any(|s| s.uuid == self.config.service_uuid);
        if !has_service {
            warn!(
                "Configured service {} was not discovered",
                self.config.service_uuid
            );
        }

        if self.config.auto_poll {
            let characteristic = self.config.read_char_uuid;
            let interval = self.config.poll_interval;
            if let Err(e) = self.start_poller(characteristic, interval) {
                warn!("Could not start polling: {}", e);
            }
        }
    }

    fn start_poller(&mut self, characteristic: Uuid, interval: Duration) -> SessionResult<()> {
        self.poller.start(&self.connection, characteristic, interval)?;
        // First tick fires right away.
        self.poll_tick();
        Ok(())
    }

    fn poll_tick(&mut self) {
        let request = self
            .poller
            .on_tick(self.connection.is_ready(), self.queue.has_queued_poll());
        if let Some(request) = request {
            if let Some(finished) = self.queue.enqueue(&self.connection, request) {
                self.settle(finished);
            }
        }
        self.confirm_poller_stopped();
    }

    async fn pump_queue(&mut self) {
        let finished = self
            .queue
            .pump(self.transport.as_ref(), &self.connection)
            .await;
        for finished in finished {
            self.settle(finished);
        }
        self.confirm_poller_stopped();
    }

    /// Deliver a request's outcome to whoever is waiting for it
    fn settle(&mut self, mut finished: Finished) {
        if let (true, Ok(Some(raw))) = (finished.was_read, &finished.result) {
            let kind = self.config.kind_of(finished.characteristic);
            match protocol::decode_value(kind, raw) {
                Ok((percentage, switch)) => {
                    self.connection.record_value(finished.characteristic, raw);
                    self.emit(SessionEvent::ValueUpdated(ValueUpdate {
                        characteristic: finished.characteristic,
                        raw: raw.clone(),
                        percentage,
                        switch,
                    }));
                }
                Err(e) => {
                    warn!("No data received from {}", finished.characteristic);
                    finished.result = Err(e);
                }
            }
        }

        match finished.completion {
            Completion::Caller(reply) => {
                let _ = reply.send(finished.result);
            }
            Completion::Poll => {
                if let Err(e) = &finished.result {
                    debug!("Poll read failed: {}", e);
                }
                self.poller.on_poll_complete();
            }
        }
    }

    fn confirm_poller_stopped(&mut self) {
        if self.poller.take_stopped() {
            self.emit(SessionEvent::PollerStopped);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.connection.state(),
            peripheral: self.connection.peripheral().cloned(),
            services: self.connection.services(),
            scanning: self.scanner.is_scanning(),
            polling: self.poller.is_active(),
            queue_depth: self.queue.len(),
        }
    }

    async fn teardown(&mut self) {
        info!("Shutting down Bluetooth session...");
        let transport = self.transport.clone();
        if let Some(outcome) = self.scanner.cancel(transport.as_ref()).await {
            self.emit(SessionEvent::ScanOutcome(outcome));
        }
        self.poller.stop();
        let changes = self
            .connection
            .release(transport.as_ref(), "Session shut down")
            .await;
        self.apply_changes(changes);
        for finished in self.queue.cancel_all() {
            self.settle(finished);
        }
        self.confirm_poller_stopped();
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }

    fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.emit(SessionEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }
}
