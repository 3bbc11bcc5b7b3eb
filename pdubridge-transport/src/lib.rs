//! Device transports for the PDU bridge.
//!
//! A [`Transport`] executes reads and writes against one physical PDU. Three
//! variants exist: [`SnmpTransport`] (primary, SNMPv2c), [`SerialConsole`]
//! (RS-232 fallback, also carries the management operation set) and
//! [`MockTransport`] (in-memory simulated PDU, first-class for tests).

pub mod management;
pub mod mib;
pub mod mock;
pub mod serial;
pub mod snmp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pdubridge_common::model::{Identity, Snapshot};

pub use management::Management;
pub use mock::{MockHandle, MockTransport};
pub use serial::SerialConsole;
pub use snmp::SnmpTransport;

/// Transport failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Timeout,
    Unreachable,
    Authentication,
    Parse,
    Refused,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Parse => "parse",
            ErrorKind::Refused => "refused",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Typed transport error. Transports never retry internally beyond their
/// configured retry count; recovery is the poller's job.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Refused, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Which transport implementation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Snmp,
    Serial,
    Mock,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Snmp => "snmp",
            TransportKind::Serial => "serial",
            TransportKind::Mock => "mock",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outlet command accepted by `set_outlet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutletAction {
    On,
    Off,
    Reboot,
    DelayOn,
    DelayOff,
    Cancel,
}

impl OutletAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutletAction::On => "on",
            OutletAction::Off => "off",
            OutletAction::Reboot => "reboot",
            OutletAction::DelayOn => "delayon",
            OutletAction::DelayOff => "delayoff",
            OutletAction::Cancel => "cancel",
        }
    }

    /// Parse the MQTT/HTTP payload form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Some(OutletAction::On),
            "off" => Some(OutletAction::Off),
            "reboot" => Some(OutletAction::Reboot),
            "delayon" => Some(OutletAction::DelayOn),
            "delayoff" => Some(OutletAction::DelayOff),
            "cancel" => Some(OutletAction::Cancel),
            _ => None,
        }
    }

    /// ePDU outlet-control command code written over SNMP.
    pub fn snmp_code(&self) -> i64 {
        match self {
            OutletAction::On => 1,
            OutletAction::Off => 2,
            OutletAction::Reboot => 3,
            OutletAction::DelayOn => 4,
            OutletAction::DelayOff => 5,
            OutletAction::Cancel => 7,
        }
    }

    /// Inverse action used by rule restore.
    pub fn inverse(&self) -> Option<Self> {
        match self {
            OutletAction::On => Some(OutletAction::Off),
            OutletAction::Off => Some(OutletAction::On),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutletAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A device transport: everything the poller needs from one PDU.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which implementation this is (reported on the device info topic).
    fn kind(&self) -> TransportKind;

    /// Read the discovered-once identity block.
    async fn identify(&mut self) -> TransportResult<Identity>;

    /// Read all metrics for one cycle.
    async fn poll(&mut self) -> TransportResult<Snapshot>;

    /// Execute an outlet command.
    async fn set_outlet(&mut self, outlet: u32, action: OutletAction) -> TransportResult<()>;

    /// Management operation set, present on the serial console and the mock.
    fn management(&mut self) -> Option<&mut dyn Management> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlet_action_parse() {
        assert_eq!(OutletAction::parse("on"), Some(OutletAction::On));
        assert_eq!(OutletAction::parse("OFF"), Some(OutletAction::Off));
        assert_eq!(OutletAction::parse("delayon"), Some(OutletAction::DelayOn));
        assert_eq!(OutletAction::parse("bounce"), None);
    }

    #[test]
    fn test_outlet_action_inverse() {
        assert_eq!(OutletAction::On.inverse(), Some(OutletAction::Off));
        assert_eq!(OutletAction::Off.inverse(), Some(OutletAction::On));
        assert_eq!(OutletAction::Reboot.inverse(), None);
    }

    #[test]
    fn test_error_display() {
        let e = TransportError::timeout("no response after 3 retries");
        assert_eq!(e.to_string(), "timeout: no response after 3 retries");
    }
}
