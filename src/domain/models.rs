use std::fmt;
use uuid::Uuid;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::DiscoveringServices => "DiscoveringServices",
            Self::Ready => "Ready",
            Self::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// A remote device captured from a matching advertisement (or named by address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

impl Peripheral {
    /// Peripheral known only by its address
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            services: Vec::new(),
        }
    }
}

impl fmt::Display for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Terminal outcome of a scan session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Matched(Peripheral),
    TimedOut,
    Failed(String),
}

/// Value observed by a successful read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueUpdate {
    pub characteristic: Uuid,
    pub raw: Vec<u8>,
    pub percentage: Option<i8>,
    pub switch: Option<bool>,
}

/// Notifications produced for the event sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionStatus {
        state: ConnectionState,
        reason: Option<String>,
    },
    ScanOutcome(ScanOutcome),
    ValueUpdated(ValueUpdate),
    PollerStopped,
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
