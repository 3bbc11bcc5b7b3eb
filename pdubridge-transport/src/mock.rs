//! In-memory simulated PDU.
//!
//! The mock is a first-class transport: the bridge runs against it in demo
//! mode and every integration test drives it. A [`MockHandle`] stays usable
//! after the transport is boxed into a poller, so tests can flip outlet
//! states, move source voltages or inject failures mid-run.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pdubridge_common::model::{
    AtsBlock, AtsSource, BankMetrics, EnvironmentBlock, Identity, InputMetrics, LoadState,
    OutletMetrics, OutletState, RedundancyStatus, Snapshot, SourceMetrics, SourceStatus,
    current_timestamp_millis,
};

use crate::management::{
    AtsSettings, BankThresholds, DeviceLogEntry, EnergyWiseSettings, Management,
    NetworkSettings, NotificationSettings, OutletSettings, UserAccount,
};
use crate::{OutletAction, Transport, TransportError, TransportKind, TransportResult};

#[derive(Debug)]
struct MockState {
    identity: Identity,
    outlet_states: Vec<OutletState>,
    outlet_names: Vec<String>,
    input_voltage: f64,
    input_frequency: f64,
    bank_current: f64,
    ats: bool,
    source_a_voltage: f64,
    source_b_voltage: f64,
    current_source: AtsSource,
    preferred_source: AtsSource,
    uptime_ticks: u64,
    /// Remaining operations that fail before the mock recovers; `u32::MAX`
    /// fails until cleared.
    fail_remaining: u32,
    thresholds: Vec<BankThresholds>,
    network: NetworkSettings,
    notifications: NotificationSettings,
    energywise: EnergyWiseSettings,
    default_credentials: bool,
    event_log: Vec<DeviceLogEntry>,
}

impl MockState {
    fn new(outlets: u32, ats: bool) -> Self {
        Self {
            identity: Identity {
                serial: "MOCK0012345".to_string(),
                model: "PDU44005".to_string(),
                firmware: "1.2.0".to_string(),
                hardware: Some("A1".to_string()),
                outlet_count: outlets,
                phase_count: 1,
                max_input_amps: Some(16.0),
            },
            outlet_states: vec![OutletState::On; outlets as usize],
            outlet_names: (1..=outlets).map(|n| format!("Outlet {}", n)).collect(),
            input_voltage: 230.1,
            input_frequency: 50.0,
            bank_current: 5.2,
            ats,
            source_a_voltage: 230.1,
            source_b_voltage: 229.4,
            current_source: AtsSource::A,
            preferred_source: AtsSource::A,
            uptime_ticks: 0,
            fail_remaining: 0,
            thresholds: vec![BankThresholds {
                bank: 1,
                low: 0.5,
                near_overload: 12.0,
                overload: 16.0,
            }],
            network: NetworkSettings {
                dhcp: true,
                ip: Some("192.168.1.50".to_string()),
                netmask: Some("255.255.255.0".to_string()),
                gateway: Some("192.168.1.1".to_string()),
            },
            notifications: NotificationSettings::default(),
            energywise: EnergyWiseSettings::default(),
            default_credentials: true,
            event_log: Vec::new(),
        }
    }

    fn check_failure(&mut self, op: &str) -> TransportResult<()> {
        if self.fail_remaining > 0 {
            if self.fail_remaining != u32::MAX {
                self.fail_remaining -= 1;
            }
            return Err(TransportError::timeout(format!("simulated failure on {}", op)));
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        let mut snap = Snapshot::empty();
        snap.ts = current_timestamp_millis();
        snap.uptime_ticks = Some(self.uptime_ticks);
        snap.identity = Some(self.identity.clone());
        snap.input = Some(InputMetrics {
            voltage: self.input_voltage,
            frequency: self.input_frequency,
        });
        snap.banks.push(BankMetrics {
            bank: 1,
            current: self.bank_current,
            load_state: LoadState::Normal,
            voltage: Some(self.input_voltage),
            power: Some(self.bank_current * self.input_voltage),
            apparent_power: Some(self.bank_current * self.input_voltage / 0.98),
            power_factor: Some(0.98),
            energy: None,
        });
        for (i, state) in self.outlet_states.iter().enumerate() {
            let n = i as u32 + 1;
            snap.outlets.push(OutletMetrics {
                outlet: n,
                state: *state,
                name: self.outlet_names[i].clone(),
                current: Some(if *state == OutletState::On { 0.6 } else { 0.0 }),
                power: Some(if *state == OutletState::On { 138.0 } else { 0.0 }),
                energy: None,
            });
        }
        if self.ats {
            snap.ats = Some(AtsBlock {
                preferred_source: self.preferred_source,
                current_source: self.current_source,
                auto_transfer: true,
                redundancy: if self.current_source == self.preferred_source {
                    RedundancyStatus::Ok
                } else {
                    RedundancyStatus::Lost
                },
                source_a: SourceMetrics {
                    voltage: Some(self.source_a_voltage),
                    frequency: Some(self.input_frequency),
                    status: Some(SourceStatus::Normal),
                },
                source_b: SourceMetrics {
                    voltage: Some(self.source_b_voltage),
                    frequency: Some(self.input_frequency),
                    status: Some(SourceStatus::Normal),
                },
                voltage_sensitivity: Some("normal".to_string()),
                transfer_voltage: Some(208.0),
                voltage_upper_limit: Some(254.0),
                voltage_lower_limit: Some(196.0),
            });
        }
        snap.environment = Some(EnvironmentBlock {
            temperature: Some(24.5),
            humidity: Some(41.0),
            contacts: Vec::new(),
        });
        snap.totals = pdubridge_common::model::Totals {
            load: Some(self.bank_current),
            power: Some(self.bank_current * self.input_voltage),
            energy: None,
        };
        snap
    }
}

/// External control over a running mock.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn outlet_state(&self, outlet: u32) -> Option<OutletState> {
        let state = self.state.lock().unwrap();
        state.outlet_states.get(outlet as usize - 1).copied()
    }

    pub fn set_source_voltage(&self, source: AtsSource, voltage: f64) {
        let mut state = self.state.lock().unwrap();
        match source {
            AtsSource::A => state.source_a_voltage = voltage,
            AtsSource::B => state.source_b_voltage = voltage,
        }
    }

    pub fn set_input_voltage(&self, voltage: f64) {
        self.state.lock().unwrap().input_voltage = voltage;
    }

    pub fn set_current_source(&self, source: AtsSource) {
        self.state.lock().unwrap().current_source = source;
    }

    /// Fail every operation until [`MockHandle::recover`] is called.
    pub fn fail_forever(&self) {
        self.state.lock().unwrap().fail_remaining = u32::MAX;
    }

    /// Fail the next `n` operations, then recover.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().fail_remaining = n;
    }

    pub fn recover(&self) {
        self.state.lock().unwrap().fail_remaining = 0;
    }

    /// Reset uptime to simulate a device reboot.
    pub fn reboot(&self) {
        self.state.lock().unwrap().uptime_ticks = 0;
    }
}

/// Simulated PDU transport.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_outlets(8, false)
    }

    pub fn with_outlets(outlets: u32, ats: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(outlets, ats))),
        }
    }

    pub fn with_ats() -> Self {
        Self::with_outlets(8, true)
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    async fn identify(&mut self) -> TransportResult<Identity> {
        let mut state = self.state.lock().unwrap();
        state.check_failure("identify")?;
        Ok(state.identity.clone())
    }

    async fn poll(&mut self) -> TransportResult<Snapshot> {
        let mut state = self.state.lock().unwrap();
        state.check_failure("poll")?;
        // 1 Hz polling, uptime in centiseconds.
        state.uptime_ticks += 100;
        Ok(state.snapshot())
    }

    async fn set_outlet(&mut self, outlet: u32, action: OutletAction) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_failure("set_outlet")?;

        let index = outlet as usize;
        if index == 0 || index > state.outlet_states.len() {
            return Err(TransportError::refused(format!(
                "outlet {} out of range",
                outlet
            )));
        }

        let new_state = match action {
            OutletAction::On | OutletAction::DelayOn => OutletState::On,
            OutletAction::Off | OutletAction::DelayOff => OutletState::Off,
            // Reboot completes immediately in the mock.
            OutletAction::Reboot => OutletState::On,
            OutletAction::Cancel => state.outlet_states[index - 1],
        };
        state.outlet_states[index - 1] = new_state;
        state.event_log.push(DeviceLogEntry {
            timestamp: chrono::Utc::now().format("%Y/%m/%d %H:%M:%S").to_string(),
            message: format!("Outlet {} command {}", outlet, action),
        });
        Ok(())
    }

    fn management(&mut self) -> Option<&mut dyn Management> {
        Some(self)
    }
}

#[async_trait]
impl Management for MockTransport {
    async fn get_thresholds(&mut self) -> TransportResult<Vec<BankThresholds>> {
        Ok(self.state.lock().unwrap().thresholds.clone())
    }

    async fn set_thresholds(&mut self, thresholds: &BankThresholds) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.thresholds.iter_mut().find(|t| t.bank == thresholds.bank) {
            Some(existing) => *existing = thresholds.clone(),
            None => state.thresholds.push(thresholds.clone()),
        }
        Ok(())
    }

    async fn get_network(&mut self) -> TransportResult<NetworkSettings> {
        Ok(self.state.lock().unwrap().network.clone())
    }

    async fn set_network(&mut self, settings: &NetworkSettings) -> TransportResult<()> {
        self.state.lock().unwrap().network = settings.clone();
        Ok(())
    }

    async fn get_ats_config(&mut self) -> TransportResult<AtsSettings> {
        Ok(AtsSettings {
            sensitivity: "normal".to_string(),
            transfer_voltage: 208.0,
            voltage_upper_limit: 254.0,
            voltage_lower_limit: 196.0,
        })
    }

    async fn set_ats_config(&mut self, _settings: &AtsSettings) -> TransportResult<()> {
        Ok(())
    }

    async fn set_outlet_config(&mut self, settings: &OutletSettings) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        let index = settings.outlet as usize;
        if index == 0 || index > state.outlet_names.len() {
            return Err(TransportError::refused(format!(
                "outlet {} out of range",
                settings.outlet
            )));
        }
        if let Some(name) = &settings.name {
            state.outlet_names[index - 1] = name.clone();
        }
        Ok(())
    }

    async fn set_device_name(&mut self, name: &str) -> TransportResult<()> {
        self.state.lock().unwrap().identity.model = name.to_string();
        Ok(())
    }

    async fn set_device_location(&mut self, _location: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn check_default_credentials(&mut self) -> TransportResult<bool> {
        Ok(self.state.lock().unwrap().default_credentials)
    }

    async fn change_password(
        &mut self,
        _username: &str,
        _old_password: &str,
        _new_password: &str,
    ) -> TransportResult<()> {
        self.state.lock().unwrap().default_credentials = false;
        Ok(())
    }

    async fn get_event_log(&mut self) -> TransportResult<Vec<DeviceLogEntry>> {
        Ok(self.state.lock().unwrap().event_log.clone())
    }

    async fn get_notifications(&mut self) -> TransportResult<NotificationSettings> {
        Ok(self.state.lock().unwrap().notifications.clone())
    }

    async fn set_notifications(&mut self, settings: &NotificationSettings) -> TransportResult<()> {
        self.state.lock().unwrap().notifications = settings.clone();
        Ok(())
    }

    async fn get_energywise(&mut self) -> TransportResult<EnergyWiseSettings> {
        Ok(self.state.lock().unwrap().energywise.clone())
    }

    async fn set_energywise(&mut self, settings: &EnergyWiseSettings) -> TransportResult<()> {
        self.state.lock().unwrap().energywise = settings.clone();
        Ok(())
    }

    async fn get_users(&mut self) -> TransportResult<Vec<UserAccount>> {
        Ok(vec![UserAccount {
            username: "cyber".to_string(),
            role: "admin".to_string(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_poll_and_command() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();

        let identity = transport.identify().await.unwrap();
        assert_eq!(identity.outlet_count, 8);

        let snap = transport.poll().await.unwrap();
        assert_eq!(snap.outlets.len(), 8);
        assert_eq!(snap.outlet(3).unwrap().state, OutletState::On);

        transport.set_outlet(3, OutletAction::Off).await.unwrap();
        assert_eq!(handle.outlet_state(3), Some(OutletState::Off));

        let snap = transport.poll().await.unwrap();
        assert_eq!(snap.outlet(3).unwrap().state, OutletState::Off);
    }

    #[tokio::test]
    async fn test_mock_outlet_out_of_range() {
        let mut transport = MockTransport::new();
        assert!(transport.set_outlet(0, OutletAction::On).await.is_err());
        assert!(transport.set_outlet(9, OutletAction::On).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();

        handle.fail_next(2);
        assert!(transport.poll().await.is_err());
        assert!(transport.poll().await.is_err());
        assert!(transport.poll().await.is_ok());

        handle.fail_forever();
        assert!(transport.poll().await.is_err());
        handle.recover();
        assert!(transport.poll().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_uptime_and_reboot() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();

        let first = transport.poll().await.unwrap().uptime_ticks.unwrap();
        let second = transport.poll().await.unwrap().uptime_ticks.unwrap();
        assert!(second > first);

        handle.reboot();
        let third = transport.poll().await.unwrap().uptime_ticks.unwrap();
        assert!(third < second);
    }

    #[tokio::test]
    async fn test_mock_ats_voltage_control() {
        let mut transport = MockTransport::with_ats();
        let handle = transport.handle();

        handle.set_source_voltage(AtsSource::A, 95.0);
        let snap = transport.poll().await.unwrap();
        assert_eq!(snap.source_voltage(1), Some(95.0));
        assert_eq!(snap.ats.as_ref().unwrap().redundancy, RedundancyStatus::Ok);

        handle.set_current_source(AtsSource::B);
        let snap = transport.poll().await.unwrap();
        assert_eq!(snap.ats.unwrap().redundancy, RedundancyStatus::Lost);
    }
}
