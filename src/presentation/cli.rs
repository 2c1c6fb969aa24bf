//! Command line front end
//!
//! Reads commands from stdin, forwards them to the session and prints the
//! session's events as they arrive.

use crate::domain::models::{ConnectionState, MessageSeverity, ScanOutcome, SessionEvent};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::BluetoothService;
use anyhow::{anyhow, bail, Result};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

pub const HELP: &str = "\
Commands:
  scan                 scan for the peripheral and connect to it
  connect [address]    connect by address (defaults to the last device)
  disconnect           close the connection
  percent <n>          write a percentage
  switch on|off        write the switch value
  read [uuid]          read a characteristic (defaults to the level)
  poll start [ms]      poll the level characteristic
  poll stop            stop polling
  status               show the session state
  help                 show this text
  quit                 exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    Scan,
    Connect(Option<String>),
    Disconnect,
    Percent(i32),
    Switch(bool),
    Read(Option<Uuid>),
    PollStart(Option<u64>),
    PollStop,
    Status,
    Help,
    Quit,
}

impl FromStr for BluetoothCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("Empty command");
        };
        let arg = words.next();

        let command = match (verb.to_lowercase().as_str(), arg) {
            ("scan", None) => Self::Scan,
            ("connect", address) => Self::Connect(address.map(str::to_string)),
            ("disconnect", None) => Self::Disconnect,
            ("percent", Some(value)) => Self::Percent(
                value
                    .parse()
                    .map_err(|_| anyhow!("Not a number: {value}"))?,
            ),
            ("switch", Some("on")) => Self::Switch(true),
            ("switch", Some("off")) => Self::Switch(false),
            ("read", uuid) => Self::Read(uuid.map(protocol::parse_uuid).transpose()?),
            ("poll", Some("start")) => Self::PollStart(
                words
                    .next()
                    .map(|ms| ms.parse().map_err(|_| anyhow!("Not an interval: {ms}")))
                    .transpose()?,
            ),
            ("poll", Some("stop")) => Self::PollStop,
            ("status", None) => Self::Status,
            ("help", _) | ("?", _) => Self::Help,
            ("quit", _) | ("exit", _) => Self::Quit,
            _ => bail!("Unknown command: {line}. Type `help` for a list."),
        };
        Ok(command)
    }
}

/// One line of output for an event, if it deserves one
pub fn render_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::ConnectionStatus { state, reason } => Some(match reason {
            Some(reason) => format!("[state] {state} ({reason})"),
            None => format!("[state] {state}"),
        }),
        SessionEvent::ScanOutcome(ScanOutcome::Matched(peripheral)) => {
            Some(format!("[scan] found {peripheral}"))
        }
        SessionEvent::ScanOutcome(ScanOutcome::TimedOut) => Some("[scan] timed out".to_string()),
        SessionEvent::ScanOutcome(ScanOutcome::Failed(reason)) => {
            Some(format!("[scan] failed: {reason}"))
        }
        SessionEvent::ValueUpdated(update) => Some(match (update.percentage, update.switch) {
            (Some(level), _) => format!("[value] {} = {}%", update.characteristic, level),
            (_, Some(is_on)) => format!(
                "[value] {} = {}",
                update.characteristic,
                if is_on { "on" } else { "off" }
            ),
            _ => format!("[value] {} = {:02x?}", update.characteristic, update.raw),
        }),
        SessionEvent::PollerStopped => Some("[poll] stopped".to_string()),
        SessionEvent::LogMessage(message) => match message.severity {
            MessageSeverity::Warning | MessageSeverity::Error => {
                Some(format!("[!] {}", message.message))
            }
            MessageSeverity::Info | MessageSeverity::Success => None,
        },
    }
}

pub struct CommandLine {
    service: BluetoothService,
    settings: Arc<Mutex<SettingsService>>,
}

impl CommandLine {
    pub fn new(service: BluetoothService, settings: Arc<Mutex<SettingsService>>) -> Self {
        Self { service, settings }
    }

    /// Run until `quit`, end of input, or the session closing its event stream
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{HELP}");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<BluetoothCommand>() {
                        Ok(BluetoothCommand::Quit) => break,
                        Ok(command) => {
                            if let Err(e) = self.execute(command).await {
                                println!("[!] {e}");
                            }
                        }
                        Err(e) => println!("[!] {e}"),
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.observe(&event).await;
                    if let Some(text) = render_event(&event) {
                        println!("{text}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn observe(&self, event: &SessionEvent) {
        let SessionEvent::ConnectionStatus { state, .. } = event else {
            return;
        };
        if *state != ConnectionState::Ready {
            return;
        }
        let Ok(snapshot) = self.service.snapshot().await else {
            return;
        };
        let Some(peripheral) = snapshot.peripheral else {
            return;
        };
        match self.settings.lock() {
            Ok(mut settings) => {
                if let Err(e) = settings.remember_address(&peripheral.address) {
                    warn!("Failed to save settings: {}", e);
                }
            }
            Err(_) => error!("Settings lock poisoned"),
        }
    }

    fn last_address(&self) -> Option<String> {
        self.settings
            .lock()
            .ok()
            .and_then(|s| s.get().last_connected_address.clone())
    }

    async fn execute(&self, command: BluetoothCommand) -> Result<()> {
        let service = &self.service;
        match command {
            BluetoothCommand::Scan => {
                let pending = service.scan_and_connect();
                tokio::spawn(async move {
                    if let Err(e) = pending.outcome().await {
                        println!("[!] Scan failed: {e}");
                    }
                });
            }
            BluetoothCommand::Connect(address) => {
                let address = address
                    .or_else(|| self.last_address())
                    .ok_or_else(|| anyhow!("No address given and no previous device known"))?;
                service.request_connect(&address).await?;
            }
            BluetoothCommand::Disconnect => service.request_disconnect().await?,
            BluetoothCommand::Percent(value) => {
                if !(0..=100).contains(&value) {
                    println!("[!] {value} is outside 0-100 and will be truncated to one byte");
                }
                let pending = service.send_percentage(value);
                tokio::spawn(async move {
                    match pending.outcome().await {
                        Ok(_) => println!("[write] percentage {value} acknowledged"),
                        Err(e) => println!("[!] Write failed: {e}"),
                    }
                });
            }
            BluetoothCommand::Switch(is_on) => {
                let pending = service.send_switch(is_on);
                tokio::spawn(async move {
                    match pending.outcome().await {
                        Ok(_) => println!("[write] switch acknowledged"),
                        Err(e) => println!("[!] Write failed: {e}"),
                    }
                });
            }
            BluetoothCommand::Read(uuid) => {
                let characteristic = uuid.unwrap_or(service.config().read_char_uuid);
                let service = service.clone();
                // The value itself is printed from the ValueUpdated event.
                tokio::spawn(async move {
                    if let Err(e) = service.read(characteristic).await {
                        println!("[!] Read failed: {e}");
                    }
                });
            }
            BluetoothCommand::PollStart(interval_ms) => {
                let interval = interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(service.config().poll_interval);
                service
                    .start_polling(service.config().read_char_uuid, interval)
                    .await?;
            }
            BluetoothCommand::PollStop => {
                if !service.stop_polling().await? {
                    println!("Poller is not running");
                }
            }
            BluetoothCommand::Status => {
                let snapshot = service.snapshot().await?;
                println!("State:    {}", snapshot.state);
                if let Some(peripheral) = &snapshot.peripheral {
                    println!("Device:   {peripheral}");
                }
                println!("Scanning: {}", snapshot.scanning);
                println!("Polling:  {}", snapshot.polling);
                println!("Queued:   {}", snapshot.queue_depth);
                for service in &snapshot.services {
                    println!("Service {}", service.uuid);
                    for c in service.characteristics.values() {
                        let value = c
                            .last_value
                            .as_ref()
                            .map(|v| format!("{v:02x?}"))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  {} read={} write={} last={}",
                            c.uuid, c.readable, c.writable, value
                        );
                    }
                }
            }
            BluetoothCommand::Help => println!("{HELP}"),
            BluetoothCommand::Quit => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{StatusMessage, ValueUpdate};

    #[test]
    fn test_parse_commands() {
        assert_eq!("scan".parse::<BluetoothCommand>().unwrap(), BluetoothCommand::Scan);
        assert_eq!(
            "connect AA:BB:CC:DD:EE:FF".parse::<BluetoothCommand>().unwrap(),
            BluetoothCommand::Connect(Some("AA:BB:CC:DD:EE:FF".to_string()))
        );
        assert_eq!(
            "connect".parse::<BluetoothCommand>().unwrap(),
            BluetoothCommand::Connect(None)
        );
        assert_eq!(
            "percent 42".parse::<BluetoothCommand>().unwrap(),
            BluetoothCommand::Percent(42)
        );
        assert_eq!(
            "SWITCH off".parse::<BluetoothCommand>().unwrap(),
            BluetoothCommand::Switch(false)
        );
        assert_eq!(
            "poll start 1500".parse::<BluetoothCommand>().unwrap(),
            BluetoothCommand::PollStart(Some(1500))
        );
        assert_eq!(
            "poll stop".parse::<BluetoothCommand>().unwrap(),
            BluetoothCommand::PollStop
        );
        assert_eq!(
            "read abcdef03-1234-5678-1234-56789abcdef0"
                .parse::<BluetoothCommand>()
                .unwrap(),
            BluetoothCommand::Read(Some(protocol::SWITCH_CHAR_UUID))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<BluetoothCommand>().is_err());
        assert!("percent lots".parse::<BluetoothCommand>().is_err());
        assert!("switch maybe".parse::<BluetoothCommand>().is_err());
        assert!("read nope".parse::<BluetoothCommand>().is_err());
        assert!("launch".parse::<BluetoothCommand>().is_err());
    }

    #[test]
    fn test_render_event() {
        let update = SessionEvent::ValueUpdated(ValueUpdate {
            characteristic: protocol::READ_CHAR_UUID,
            raw: vec![42],
            percentage: Some(42),
            switch: None,
        });
        assert_eq!(
            render_event(&update).unwrap(),
            format!("[value] {} = 42%", protocol::READ_CHAR_UUID)
        );

        let status = SessionEvent::ConnectionStatus {
            state: ConnectionState::Disconnected,
            reason: Some("Connection lost".to_string()),
        };
        assert_eq!(
            render_event(&status).unwrap(),
            "[state] Disconnected (Connection lost)"
        );

        let quiet = SessionEvent::LogMessage(StatusMessage {
            message: "Connected".to_string(),
            severity: MessageSeverity::Success,
        });
        assert_eq!(render_event(&quiet), None);
    }
}
