//! Decoded PDU state model.
//!
//! A [`Snapshot`] is the immutable result of one poll cycle. All fields that
//! depend on optional PDU capabilities (outlet metering, ATS section,
//! environment probe) are `Option` or empty collections; a missing reading is
//! never reported as zero.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outlet relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutletState {
    On,
    Off,
}

impl OutletState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutletState::On => "on",
            OutletState::Off => "off",
        }
    }
}

impl std::fmt::Display for OutletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bank load severity as reported by the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "nearOverload")]
    NearOverload,
    #[serde(rename = "overload")]
    Overload,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Normal => "normal",
            LoadState::Low => "low",
            LoadState::NearOverload => "nearOverload",
            LoadState::Overload => "overload",
        }
    }

    /// Map the raw ePDU load-state integer (1..4).
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(LoadState::Normal),
            2 => Some(LoadState::Low),
            3 => Some(LoadState::NearOverload),
            4 => Some(LoadState::Overload),
            _ => None,
        }
    }
}

/// ATS input designator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtsSource {
    A,
    B,
}

impl AtsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtsSource::A => "A",
            AtsSource::B => "B",
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(AtsSource::A),
            2 => Some(AtsSource::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for AtsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-source voltage qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "overVoltage")]
    OverVoltage,
    #[serde(rename = "underVoltage")]
    UnderVoltage,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Normal => "normal",
            SourceStatus::OverVoltage => "overVoltage",
            SourceStatus::UnderVoltage => "underVoltage",
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(SourceStatus::Normal),
            2 => Some(SourceStatus::OverVoltage),
            3 => Some(SourceStatus::UnderVoltage),
            _ => None,
        }
    }
}

/// ATS redundancy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedundancyStatus {
    Ok,
    Lost,
}

impl RedundancyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedundancyStatus::Ok => "ok",
            RedundancyStatus::Lost => "lost",
        }
    }
}

/// Cold-start outlet recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColdstartState {
    #[serde(rename = "allon")]
    AllOn,
    #[serde(rename = "prevstate")]
    PrevState,
}

impl ColdstartState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColdstartState::AllOn => "allon",
            ColdstartState::PrevState => "prevstate",
        }
    }
}

/// Dry-contact sensor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactState {
    Open,
    Closed,
}

impl ContactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactState::Open => "open",
            ContactState::Closed => "closed",
        }
    }
}

/// Discovered-once device identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Hardware serial number.
    pub serial: String,
    /// Model string (e.g. "PDU44005").
    pub model: String,
    /// Firmware revision.
    pub firmware: String,
    /// Hardware revision, when exposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    /// Number of switched outlets.
    pub outlet_count: u32,
    /// Number of input phases.
    pub phase_count: u32,
    /// Maximum rated input current in amps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_amps: Option<f64>,
}

/// Input feed metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputMetrics {
    pub voltage: f64,
    pub frequency: f64,
}

/// Metrics for one outlet bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankMetrics {
    pub bank: u32,
    pub current: f64,
    pub load_state: LoadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparent_power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

/// Metrics for one outlet. Metering fields are absent on non-metered models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletMetrics {
    pub outlet: u32,
    pub state: OutletState,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

/// Per-source readings within the ATS block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SourceStatus>,
}

/// Automatic transfer switch section, present on ATS models only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtsBlock {
    pub preferred_source: AtsSource,
    pub current_source: AtsSource,
    pub auto_transfer: bool,
    pub redundancy: RedundancyStatus,
    pub source_a: SourceMetrics,
    pub source_b: SourceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_sensitivity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_upper_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_lower_limit: Option<f64>,
}

/// One dry-contact reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactReading {
    pub contact: u32,
    pub state: ContactState,
}

/// Environment probe block, present when a probe is attached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvironmentBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<ContactReading>,
}

/// Device-level aggregate metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

/// Immutable decoded result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unix epoch milliseconds when the poll completed.
    pub ts: i64,
    /// Raw sysUpTime in timeticks, used for reboot detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_ticks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputMetrics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub banks: Vec<BankMetrics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outlets: Vec<OutletMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ats: Option<AtsBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coldstart_delay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coldstart_state: Option<ColdstartState>,
    #[serde(default)]
    pub totals: Totals,
}

impl Snapshot {
    /// Create an empty snapshot stamped with the current time.
    pub fn empty() -> Self {
        Self {
            ts: current_timestamp_millis(),
            uptime_ticks: None,
            identity: None,
            input: None,
            banks: Vec::new(),
            outlets: Vec::new(),
            ats: None,
            environment: None,
            coldstart_delay: None,
            coldstart_state: None,
            totals: Totals::default(),
        }
    }

    pub fn outlet(&self, n: u32) -> Option<&OutletMetrics> {
        self.outlets.iter().find(|o| o.outlet == n)
    }

    pub fn bank(&self, n: u32) -> Option<&BankMetrics> {
        self.banks.iter().find(|b| b.bank == n)
    }

    /// Voltage seen by the given rule input (1 = source A, 2 = source B).
    ///
    /// Non-ATS models fall back to the bank 1 voltage regardless of input.
    pub fn source_voltage(&self, input: u8) -> Option<f64> {
        if let Some(ats) = &self.ats {
            return match input {
                2 => ats.source_b.voltage,
                _ => ats.source_a.voltage,
            };
        }
        self.bank(1).and_then(|b| b.voltage)
    }
}

/// Voltage, current, frequency and energy arrive as tenths.
pub fn scale_tenths(raw: i64) -> f64 {
    raw as f64 / 10.0
}

/// Power factor arrives as hundredths.
pub fn scale_hundredths(raw: i64) -> f64 {
    raw as f64 / 100.0
}

/// Current with the metering floor: raw readings at or below 2 (0.2 A) are
/// idle-noise and report as 0.0.
pub fn scale_current(raw: i64) -> f64 {
    if raw <= 2 { 0.0 } else { scale_tenths(raw) }
}

/// Active/apparent power passes through as watts, floored at raw <= 1.
pub fn scale_power(raw: i64) -> f64 {
    if raw <= 1 { 0.0 } else { raw as f64 }
}

/// Current timestamp in milliseconds since the Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metering_floor_current() {
        assert_eq!(scale_current(0), 0.0);
        assert_eq!(scale_current(2), 0.0);
        assert_eq!(scale_current(3), 0.3);
        assert_eq!(scale_current(52), 5.2);
    }

    #[test]
    fn test_metering_floor_power() {
        assert_eq!(scale_power(1), 0.0);
        assert_eq!(scale_power(2), 2.0);
        assert_eq!(scale_power(480), 480.0);
    }

    #[test]
    fn test_scaling() {
        assert_eq!(scale_tenths(2301), 230.1);
        assert_eq!(scale_hundredths(98), 0.98);
    }

    #[test]
    fn test_enum_payload_strings() {
        assert_eq!(LoadState::NearOverload.as_str(), "nearOverload");
        assert_eq!(SourceStatus::UnderVoltage.as_str(), "underVoltage");
        assert_eq!(ColdstartState::PrevState.as_str(), "prevstate");
        assert_eq!(
            serde_json::to_string(&LoadState::NearOverload).unwrap(),
            "\"nearOverload\""
        );
    }

    #[test]
    fn test_load_state_from_raw() {
        assert_eq!(LoadState::from_raw(1), Some(LoadState::Normal));
        assert_eq!(LoadState::from_raw(4), Some(LoadState::Overload));
        assert_eq!(LoadState::from_raw(9), None);
    }

    #[test]
    fn test_source_voltage_prefers_ats() {
        let mut snap = Snapshot::empty();
        snap.banks.push(BankMetrics {
            bank: 1,
            current: 1.0,
            load_state: LoadState::Normal,
            voltage: Some(228.0),
            power: None,
            apparent_power: None,
            power_factor: None,
            energy: None,
        });
        assert_eq!(snap.source_voltage(1), Some(228.0));

        snap.ats = Some(AtsBlock {
            preferred_source: AtsSource::A,
            current_source: AtsSource::A,
            auto_transfer: true,
            redundancy: RedundancyStatus::Ok,
            source_a: SourceMetrics {
                voltage: Some(230.5),
                frequency: Some(50.0),
                status: Some(SourceStatus::Normal),
            },
            source_b: SourceMetrics {
                voltage: Some(121.0),
                frequency: Some(60.0),
                status: Some(SourceStatus::Normal),
            },
            voltage_sensitivity: None,
            transfer_voltage: None,
            voltage_upper_limit: None,
            voltage_lower_limit: None,
        });
        assert_eq!(snap.source_voltage(1), Some(230.5));
        assert_eq!(snap.source_voltage(2), Some(121.0));
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut snap = Snapshot::empty();
        snap.input = Some(InputMetrics {
            voltage: 230.1,
            frequency: 50.0,
        });
        snap.outlets.push(OutletMetrics {
            outlet: 3,
            state: OutletState::Off,
            name: "rack-switch".to_string(),
            current: Some(0.0),
            power: None,
            energy: None,
        });

        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
        // Unset metering must not appear as zero placeholders.
        assert!(!json.contains("\"power\""));
    }
}
