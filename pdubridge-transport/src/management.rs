//! Management operations available over the serial console (and the mock).
//!
//! The SNMP agent exposes none of these; HTTP management endpoints answer 503
//! when the active transport has no [`Management`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::TransportResult;

/// Per-bank overload thresholds in amps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankThresholds {
    pub bank: u32,
    pub low: f64,
    pub near_overload: f64,
    pub overload: f64,
}

/// Network settings of the PDU's management card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub dhcp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// ATS transfer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtsSettings {
    pub sensitivity: String,
    pub transfer_voltage: f64,
    pub voltage_upper_limit: f64,
    pub voltage_lower_limit: f64,
}

/// Per-outlet configuration written through the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletSettings {
    pub outlet: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Power-on delay in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delay: Option<u32>,
    /// Power-off delay in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_delay: Option<u32>,
    /// Reboot off-time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_duration: Option<u32>,
}

/// Trap/e-mail notification targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub trap_receivers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub on_overload: bool,
    #[serde(default)]
    pub on_transfer: bool,
}

/// Cisco EnergyWise endpoint settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyWiseSettings {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// One console user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: String,
    pub role: String,
}

/// One line of the device's internal event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLogEntry {
    pub timestamp: String,
    pub message: String,
}

/// Console management operation set.
#[async_trait]
pub trait Management: Send {
    async fn get_thresholds(&mut self) -> TransportResult<Vec<BankThresholds>>;
    async fn set_thresholds(&mut self, thresholds: &BankThresholds) -> TransportResult<()>;

    async fn get_network(&mut self) -> TransportResult<NetworkSettings>;
    async fn set_network(&mut self, settings: &NetworkSettings) -> TransportResult<()>;

    async fn get_ats_config(&mut self) -> TransportResult<AtsSettings>;
    async fn set_ats_config(&mut self, settings: &AtsSettings) -> TransportResult<()>;

    async fn set_outlet_config(&mut self, settings: &OutletSettings) -> TransportResult<()>;
    async fn set_device_name(&mut self, name: &str) -> TransportResult<()>;
    async fn set_device_location(&mut self, location: &str) -> TransportResult<()>;

    /// True when the console still accepts the factory credentials.
    async fn check_default_credentials(&mut self) -> TransportResult<bool>;
    async fn change_password(
        &mut self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> TransportResult<()>;

    async fn get_event_log(&mut self) -> TransportResult<Vec<DeviceLogEntry>>;

    async fn get_notifications(&mut self) -> TransportResult<NotificationSettings>;
    async fn set_notifications(&mut self, settings: &NotificationSettings) -> TransportResult<()>;

    async fn get_energywise(&mut self) -> TransportResult<EnergyWiseSettings>;
    async fn set_energywise(&mut self, settings: &EnergyWiseSettings) -> TransportResult<()>;

    async fn get_users(&mut self) -> TransportResult<Vec<UserAccount>>;
}
