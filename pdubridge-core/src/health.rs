//! Transport health state machine and bridge-level health aggregation.

use serde::{Deserialize, Serialize};

use pdubridge_common::model::current_timestamp_millis;
use pdubridge_transport::TransportKind;

/// Consecutive failures before a device is considered degraded.
pub const DEGRADED_THRESHOLD: u32 = 10;
/// Consecutive failures before attempting a transport swap (or going lost).
pub const FAILOVER_THRESHOLD: u32 = 30;

/// Per-device transport health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    /// Fallback transport in use.
    Recovering,
    /// Both transports failed; a recovery scan may be scheduled.
    Lost,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Recovering => "recovering",
            HealthState::Lost => "lost",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One transport swap, kept for the device event trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub ts: i64,
    pub from: TransportKind,
    pub to: TransportKind,
}

/// What the poller should do after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Keep polling quietly.
    Continue,
    /// Log at warn (first degradation and every 10th failure after).
    LogWarn,
    /// Failure threshold reached with an unused secondary available.
    AttemptSwap,
}

/// Failure-counting state machine governing transport failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
    pub active: TransportKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub swap_history: Vec<SwapRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TransportHealth {
    pub fn new(active: TransportKind) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_success: None,
            active,
            swap_history: Vec::new(),
            last_error: None,
        }
    }

    /// True while the fallback transport is active.
    pub fn on_secondary(&self) -> bool {
        !self.swap_history.is_empty()
    }

    /// Record a successful cycle. Returns true when the state changed.
    pub fn record_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        self.last_success = Some(current_timestamp_millis());
        self.last_error = None;

        let next = if self.on_secondary() {
            HealthState::Recovering
        } else {
            HealthState::Healthy
        };
        let changed = self.state != next;
        self.state = next;
        changed
    }

    /// Record a failed cycle and decide what the poller does next.
    pub fn record_failure(&mut self, error: &str, has_secondary: bool) -> FailureDecision {
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        let count = self.consecutive_failures;

        if count >= FAILOVER_THRESHOLD {
            // Swap attempts are rate-limited to every 30th failure; a failed
            // attempt parks the device in Lost until the next window.
            if has_secondary && !self.on_secondary() && count % FAILOVER_THRESHOLD == 0 {
                return FailureDecision::AttemptSwap;
            }
            self.state = HealthState::Lost;
            if count % DEGRADED_THRESHOLD == 0 {
                return FailureDecision::LogWarn;
            }
            return FailureDecision::Continue;
        }

        if count >= DEGRADED_THRESHOLD {
            self.state = HealthState::Degraded;
            if count % DEGRADED_THRESHOLD == 0 {
                return FailureDecision::LogWarn;
            }
        }

        FailureDecision::Continue
    }

    /// Record a swap attempt that could not open the fallback.
    pub fn swap_failed(&mut self) {
        self.state = HealthState::Lost;
    }

    /// Record a completed swap to the fallback transport.
    pub fn swapped(&mut self, to: TransportKind) {
        self.swap_history.push(SwapRecord {
            ts: current_timestamp_millis(),
            from: self.active,
            to,
        });
        self.active = to;
        self.consecutive_failures = 0;
        self.state = HealthState::Recovering;
    }

    /// Seconds since the last successful cycle, if any.
    pub fn data_age_seconds(&self) -> Option<i64> {
        self.last_success
            .map(|ts| (current_timestamp_millis() - ts) / 1000)
    }
}

/// Published per-device health detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub state: HealthState,
    pub active_transport: TransportKind,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_age_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Aggregate bridge status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Healthy => "healthy",
            BridgeStatus::Degraded => "degraded",
            BridgeStatus::Unhealthy => "unhealthy",
        }
    }
}

/// `/api/health` body: overall status plus human-readable issues, each
/// prefixed with `[device_id]` when device-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: BridgeStatus,
    pub issues: Vec<String>,
    pub devices: Vec<DeviceHealth>,
    pub mqtt_connected: bool,
    pub mqtt_queued: usize,
    pub mqtt_dropped: u64,
    pub history_write_errors: u64,
    pub uptime_secs: u64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == BridgeStatus::Healthy
    }
}

/// Derive the aggregate status and issue list.
pub fn aggregate(
    devices: Vec<DeviceHealth>,
    mqtt_connected: bool,
    mqtt_queued: usize,
    mqtt_dropped: u64,
    history_write_errors: u64,
    uptime_secs: u64,
    stale_after_secs: i64,
) -> HealthReport {
    let mut issues = Vec::new();

    for device in &devices {
        match device.state {
            HealthState::Healthy => {}
            HealthState::Degraded => issues.push(format!(
                "[{}] Transport degraded ({} consecutive failures)",
                device.device_id, device.consecutive_failures
            )),
            HealthState::Recovering => issues.push(format!(
                "[{}] Running on fallback transport {}",
                device.device_id, device.active_transport
            )),
            HealthState::Lost => issues.push(format!(
                "[{}] Device lost: {}",
                device.device_id,
                device.last_error.as_deref().unwrap_or("no transport responding")
            )),
        }

        if let Some(age) = device.data_age_seconds {
            if age > stale_after_secs && device.state == HealthState::Healthy {
                issues.push(format!("[{}] Data is {}s stale", device.device_id, age));
            }
        }
    }

    if !mqtt_connected {
        issues.push("MQTT disconnected".to_string());
    }
    if mqtt_dropped > 0 {
        issues.push(format!("MQTT offline queue dropped {} publishes", mqtt_dropped));
    }
    if history_write_errors > 0 {
        issues.push(format!("History store reported {} write errors", history_write_errors));
    }

    let any_lost = devices.iter().any(|d| d.state == HealthState::Lost);
    let all_lost = !devices.is_empty() && devices.iter().all(|d| d.state == HealthState::Lost);

    let status = if (all_lost && !devices.is_empty()) || (!mqtt_connected && any_lost) {
        BridgeStatus::Unhealthy
    } else if issues.is_empty() {
        BridgeStatus::Healthy
    } else {
        BridgeStatus::Degraded
    };

    HealthReport {
        status,
        issues,
        devices,
        mqtt_connected,
        mqtt_queued,
        mqtt_dropped,
        history_write_errors,
        uptime_secs,
    }
}
