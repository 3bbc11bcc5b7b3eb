//! Bridge manager: supervises one poller per device and owns the shared
//! services (MQTT link, history store, scheduled sweeps).
//!
//! Collaborators are injected, never global: the binary composes the MQTT
//! link, history store and data directory and hands them in; tests hand in
//! fakes the same way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pdubridge_common::error::{Error, Result};
use pdubridge_common::topics::{TopicBuilder, outlet_command_filter, parse_outlet_command};
use pdubridge_common::{BridgeSettings, DeviceConfig};
use pdubridge_transport::OutletAction;

use crate::discovery;
use crate::events::EventRecord;
use crate::health::{self, HealthReport};
use crate::history::HistoryStore;
use crate::mqtt::{MqttLink, QoS};
use crate::persist::DataDir;
use crate::poller::{
    CommandOrigin, CommandRequest, CommandResponse, ControlMsg, ManagementRequest, PollerDeps,
    PollerHandle, RecoveryScanner, spawn_poller, status_payload,
};
use crate::rules::Rule;

/// Pollers are started this far apart to avoid a thundering herd of GETs.
const START_STAGGER: Duration = Duration::from_millis(100);
/// Budget for a forwarded control-channel round trip.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BridgeManager {
    data: DataDir,
    mqtt: MqttLink,
    history: Arc<HistoryStore>,
    settings: RwLock<BridgeSettings>,
    pollers: RwLock<HashMap<String, PollerHandle>>,
    scanner: Option<Arc<dyn RecoveryScanner>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl BridgeManager {
    /// Boot the bridge: resolve the device list, start pollers (staggered),
    /// subscribe to command topics and start the scheduled sweeps.
    ///
    /// Device list priority: a non-empty persisted `pdus.json` beats the
    /// provided (environment/file) list, which beats a single mock device.
    pub async fn start(
        provided_devices: Vec<DeviceConfig>,
        settings: BridgeSettings,
        mqtt: MqttLink,
        history: Arc<HistoryStore>,
        data: DataDir,
        scanner: Option<Arc<dyn RecoveryScanner>>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let persisted: Option<Vec<DeviceConfig>> = data.read(&data.devices_path())?;
        let devices = match persisted {
            Some(devices) if !devices.is_empty() => devices,
            _ if !provided_devices.is_empty() => provided_devices,
            _ => {
                tracing::info!("No devices configured, starting with a single mock PDU");
                vec![DeviceConfig::mock("pdu-01")]
            }
        };

        validate_devices(&devices)?;

        let manager = Arc::new(Self {
            data,
            mqtt,
            history,
            settings: RwLock::new(settings),
            pollers: RwLock::new(HashMap::new()),
            scanner,
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        });

        manager.persist_devices(&devices)?;

        for (i, device) in devices.into_iter().enumerate() {
            if !device.enabled {
                tracing::info!(device = %device.device_id, "Device disabled, not polling");
                continue;
            }
            if i > 0 {
                tokio::time::sleep(START_STAGGER).await;
            }
            manager.start_poller(device).await?;
        }

        manager.subscribe_commands().await?;
        manager.clone().start_scheduled_tasks();

        Ok(manager)
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.settings.read().unwrap().poll_interval_ms)
    }

    async fn start_poller(self: &Arc<Self>, device: DeviceConfig) -> Result<()> {
        let device_id = device.device_id.clone();
        let handle = spawn_poller(PollerDeps {
            device: device.clone(),
            mqtt: self.mqtt.clone(),
            history: self.history.clone(),
            data: self.data.clone(),
            interval: self.interval(),
            scanner: self.scanner.clone(),
        })?;

        self.pollers
            .write()
            .unwrap()
            .insert(device_id.clone(), handle);

        let topics = TopicBuilder::new(&device_id);
        let _ = self
            .mqtt
            .publish(topics.bridge_status(), "online", true, QoS::AtLeastOnce)
            .await;

        // Identity is not known yet at this point; unique IDs fall back to
        // the device id until the first identify completes.
        let outlet_count = device.banks.map(|b| b * 4).unwrap_or(8);
        discovery::publish_discovery(&self.mqtt, &device, None, outlet_count, true).await;

        Ok(())
    }

    async fn subscribe_commands(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.mqtt
            .subscribe(
                outlet_command_filter(),
                QoS::AtLeastOnce,
                Arc::new(move |topic, payload| {
                    if let Some(manager) = weak.upgrade() {
                        manager.route_mqtt_command(topic, payload);
                    }
                }),
            )
            .await
    }

    /// Demultiplex an inbound MQTT command onto the right poller's FIFO.
    fn route_mqtt_command(&self, topic: &str, payload: &[u8]) {
        let Some((device_id, outlet)) = parse_outlet_command(topic) else {
            tracing::debug!(topic = %topic, "Ignoring non-command topic");
            return;
        };

        let payload = String::from_utf8_lossy(payload);
        let Some(action) = OutletAction::parse(&payload) else {
            tracing::warn!(
                device = %device_id,
                outlet,
                payload = %payload,
                "Unknown outlet command payload"
            );
            return;
        };

        let pollers = self.pollers.read().unwrap();
        let Some(handle) = pollers.get(device_id) else {
            tracing::warn!(device = %device_id, "Command for unknown device");
            return;
        };

        let request = CommandRequest {
            outlet,
            action,
            origin: CommandOrigin::Mqtt,
            respond: None,
        };
        if handle
            .control
            .try_send(ControlMsg::Command(request))
            .is_err()
        {
            tracing::warn!(device = %device_id, outlet, "Command queue full, dropping");
        }
    }

    fn start_scheduled_tasks(self: Arc<Self>) {
        let mut tasks = Vec::new();

        // Hourly retention sweep.
        let manager = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let days = manager.settings.read().unwrap().retention_days;
                        manager.history.sweep(days);
                    }
                }
            }
        }));

        // Weekly report generation; idempotent, so checking often is cheap.
        let manager = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let history = manager.history.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            history.generate_weekly_reports(
                                pdubridge_common::model::current_timestamp_millis(),
                            )
                        })
                        .await;
                        match result {
                            Ok(Ok(0)) => {}
                            Ok(Ok(count)) => tracing::info!(count, "Generated weekly reports"),
                            Ok(Err(e)) => tracing::warn!(error = %e, "Report generation failed"),
                            Err(e) => tracing::warn!(error = %e, "Report task panicked"),
                        }
                    }
                }
            }
        }));

        // Device info refresh every 30 s.
        let manager = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let controls: Vec<_> = manager
                            .pollers
                            .read()
                            .unwrap()
                            .values()
                            .map(|h| h.control.clone())
                            .collect();
                        for control in controls {
                            let _ = control.try_send(ControlMsg::PublishDeviceInfo);
                        }
                    }
                }
            }
        }));

        self.tasks.lock().unwrap().extend(tasks);
    }

    // --- Device management ---

    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.data
            .read(&self.data.devices_path())
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pollers.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn poller_for(&self, device_id: &str) -> Result<(tokio::sync::mpsc::Sender<ControlMsg>, Arc<crate::poller::PollerShared>)> {
        let pollers = self.pollers.read().unwrap();
        let handle = pollers
            .get(device_id)
            .ok_or_else(|| Error::not_found(format!("device '{}'", device_id)))?;
        Ok((handle.control.clone(), handle.shared.clone()))
    }

    /// Resolve the target device: explicit id, or the single device when
    /// only one exists.
    pub fn resolve_device(&self, device_id: Option<&str>) -> Result<String> {
        if let Some(id) = device_id {
            let pollers = self.pollers.read().unwrap();
            if !pollers.contains_key(id) {
                return Err(Error::not_found(format!("device '{}'", id)));
            }
            return Ok(id.to_string());
        }

        let pollers = self.pollers.read().unwrap();
        match pollers.len() {
            1 => Ok(pollers.keys().next().unwrap().clone()),
            0 => Err(Error::not_found("no devices configured")),
            _ => Err(Error::config(
                "multiple devices configured, pass ?device_id=",
            )),
        }
    }

    /// Synthesize the next positional device id (`pdu-01`, `pdu-02`, ...).
    pub fn next_device_id(&self) -> String {
        let pollers = self.pollers.read().unwrap();
        let mut n = 1;
        loop {
            let candidate = format!("pdu-{:02}", n);
            if !pollers.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Hot-add a device: persist first, then start polling immediately.
    pub async fn add_device(self: &Arc<Self>, device: DeviceConfig) -> Result<()> {
        device.validate()?;

        let mut devices = self.device_configs();
        if devices.iter().any(|d| d.device_id == device.device_id)
            || self.pollers.read().unwrap().contains_key(&device.device_id)
        {
            return Err(Error::conflict(format!(
                "device '{}' already exists",
                device.device_id
            )));
        }

        devices.push(device.clone());
        self.persist_devices(&devices)?;

        if device.enabled {
            self.start_poller(device.clone()).await?;
        }

        tracing::info!(device = %device.device_id, "Device added");
        Ok(())
    }

    /// Replace a device's config. The device id itself is immutable; the
    /// poller restarts with the new settings.
    pub async fn update_device(self: &Arc<Self>, device: DeviceConfig) -> Result<()> {
        device.validate()?;

        let mut devices = self.device_configs();
        let existing = devices
            .iter_mut()
            .find(|d| d.device_id == device.device_id)
            .ok_or_else(|| Error::not_found(format!("device '{}'", device.device_id)))?;
        *existing = device.clone();
        self.persist_devices(&devices)?;

        self.stop_poller(&device.device_id).await;
        if device.enabled {
            self.start_poller(device.clone()).await?;
        }

        tracing::info!(device = %device.device_id, "Device updated");
        Ok(())
    }

    /// Remove a device: stop its poller, silence its topics, drop its files.
    /// After this returns, nothing publishes on the device's prefix.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let mut devices = self.device_configs();
        let before = devices.len();
        let removed = devices.iter().find(|d| d.device_id == device_id).cloned();
        devices.retain(|d| d.device_id != device_id);
        if devices.len() == before && !self.pollers.read().unwrap().contains_key(device_id) {
            return Err(Error::not_found(format!("device '{}'", device_id)));
        }
        self.persist_devices(&devices)?;

        self.stop_poller(device_id).await;

        let topics = TopicBuilder::new(device_id);
        self.mqtt.unsubscribe_prefix(topics.prefix());
        let _ = self
            .mqtt
            .publish(topics.bridge_status(), "offline", true, QoS::AtLeastOnce)
            .await;
        if let Some(device) = removed {
            let outlet_count = device.banks.map(|b| b * 4).unwrap_or(8);
            discovery::clear_discovery(&self.mqtt, &device, outlet_count).await;
        }

        self.data.remove_device_files(device_id)?;

        tracing::info!(device = %device_id, "Device removed");
        Ok(())
    }

    async fn stop_poller(&self, device_id: &str) {
        let handle = self.pollers.write().unwrap().remove(device_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }

    fn persist_devices(&self, devices: &[DeviceConfig]) -> Result<()> {
        // The device list mutates under the pollers lock's caller; the write
        // itself is atomic (temp + rename).
        self.data.write(&self.data.devices_path(), &devices)
    }

    // --- Commands ---

    /// Execute an outlet command and wait for the response record.
    pub async fn outlet_command(
        &self,
        device_id: &str,
        outlet: u32,
        action: OutletAction,
        origin: CommandOrigin,
    ) -> Result<CommandResponse> {
        let (control, _) = self.poller_for(device_id)?;
        let (tx, rx) = oneshot::channel();

        control
            .send(ControlMsg::Command(CommandRequest {
                outlet,
                action,
                origin,
                respond: Some(tx),
            }))
            .await
            .map_err(|_| Error::internal("poller is gone"))?;

        tokio::time::timeout(FORWARD_TIMEOUT, rx)
            .await
            .map_err(|_| Error::TransportTimeout("command response timed out".into()))?
            .map_err(|_| Error::internal("poller dropped the command"))
    }

    /// Forward a management operation to the device's command gate.
    pub async fn management(
        &self,
        device_id: &str,
        request: ManagementRequest,
    ) -> Result<serde_json::Value> {
        let (control, _) = self.poller_for(device_id)?;
        let (tx, rx) = oneshot::channel();

        control
            .send(ControlMsg::Management {
                request,
                respond: tx,
            })
            .await
            .map_err(|_| Error::internal("poller is gone"))?;

        tokio::time::timeout(FORWARD_TIMEOUT, rx)
            .await
            .map_err(|_| Error::TransportTimeout("management response timed out".into()))?
            .map_err(|_| Error::internal("poller dropped the request"))?
    }

    // --- Rules ---

    pub async fn add_rule(&self, device_id: &str, rule: Rule) -> Result<()> {
        self.forward_rule(device_id, |tx| ControlMsg::RuleAdd { rule, respond: tx })
            .await
    }

    pub async fn update_rule(&self, device_id: &str, rule: Rule) -> Result<()> {
        self.forward_rule(device_id, |tx| ControlMsg::RuleUpdate { rule, respond: tx })
            .await
    }

    pub async fn remove_rule(&self, device_id: &str, name: &str) -> Result<()> {
        let name = name.to_string();
        self.forward_rule(device_id, |tx| ControlMsg::RuleRemove { name, respond: tx })
            .await
    }

    pub async fn toggle_rule(&self, device_id: &str, name: &str) -> Result<bool> {
        let (control, _) = self.poller_for(device_id)?;
        let (tx, rx) = oneshot::channel();
        let name = name.to_string();

        control
            .send(ControlMsg::RuleToggle { name, respond: tx })
            .await
            .map_err(|_| Error::internal("poller is gone"))?;

        tokio::time::timeout(FORWARD_TIMEOUT, rx)
            .await
            .map_err(|_| Error::TransportTimeout("rule toggle timed out".into()))?
            .map_err(|_| Error::internal("poller dropped the request"))?
    }

    async fn forward_rule<F>(&self, device_id: &str, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> ControlMsg,
    {
        let (control, _) = self.poller_for(device_id)?;
        let (tx, rx) = oneshot::channel();

        control
            .send(build(tx))
            .await
            .map_err(|_| Error::internal("poller is gone"))?;

        tokio::time::timeout(FORWARD_TIMEOUT, rx)
            .await
            .map_err(|_| Error::TransportTimeout("rule operation timed out".into()))?
            .map_err(|_| Error::internal("poller dropped the request"))?
    }

    pub fn rules(&self, device_id: &str) -> Result<Vec<Rule>> {
        let (_, shared) = self.poller_for(device_id)?;
        Ok(shared.rules.read().unwrap().clone())
    }

    // --- Reads ---

    pub fn status(&self, device_id: Option<&str>) -> Result<serde_json::Value> {
        if let Some(id) = device_id {
            return self.device_status(id);
        }

        let ids = self.device_ids();
        if ids.len() == 1 {
            return self.device_status(&ids[0]);
        }

        let mut devices = serde_json::Map::new();
        for id in ids {
            devices.insert(id.clone(), self.device_status(&id)?);
        }
        Ok(serde_json::json!({ "devices": devices }))
    }

    fn device_status(&self, device_id: &str) -> Result<serde_json::Value> {
        let pollers = self.pollers.read().unwrap();
        let handle = pollers
            .get(device_id)
            .ok_or_else(|| Error::not_found(format!("device '{}'", device_id)))?;

        let snapshot = handle.shared.last_snapshot.read().unwrap().clone();
        let health = handle.shared.device_health(device_id);

        match snapshot {
            Some(snapshot) => Ok(status_payload(
                &handle.config,
                &snapshot,
                &health,
                self.mqtt.is_connected(),
                self.mqtt.queued_publishes(),
            )),
            None => Ok(serde_json::json!({
                "device": device_id,
                "state": health.state.as_str(),
                "transport": health.active_transport.as_str(),
                "outlets": {},
                "data_age_seconds": serde_json::Value::Null,
            })),
        }
    }

    pub fn health(&self) -> HealthReport {
        let devices = {
            let pollers = self.pollers.read().unwrap();
            pollers
                .iter()
                .map(|(id, handle)| handle.shared.device_health(id))
                .collect()
        };

        let interval_secs = (self.interval().as_secs() as i64).max(1);
        health::aggregate(
            devices,
            self.mqtt.is_connected(),
            self.mqtt.queued_publishes(),
            self.mqtt.dropped_publishes(),
            self.history.write_errors(),
            self.started_at.elapsed().as_secs(),
            (interval_secs * 3).max(10),
        )
    }

    pub fn events(&self, device_id: Option<&str>) -> Vec<EventRecord> {
        let pollers = self.pollers.read().unwrap();
        let mut events: Vec<EventRecord> = pollers
            .iter()
            .filter(|(id, _)| device_id.is_none_or(|want| want == id.as_str()))
            .flat_map(|(_, handle)| handle.shared.events.lock().unwrap().recent())
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        events
    }

    pub fn outlet_names(&self, device_id: &str) -> Result<HashMap<u32, String>> {
        let (_, shared) = self.poller_for(device_id)?;
        Ok(shared.outlet_names.read().unwrap().clone())
    }

    pub async fn set_outlet_name(&self, device_id: &str, outlet: u32, name: String) -> Result<()> {
        let (control, _) = self.poller_for(device_id)?;
        let (tx, rx) = oneshot::channel();

        control
            .send(ControlMsg::SetOutletName {
                outlet,
                name,
                respond: tx,
            })
            .await
            .map_err(|_| Error::internal("poller is gone"))?;

        tokio::time::timeout(FORWARD_TIMEOUT, rx)
            .await
            .map_err(|_| Error::TransportTimeout("rename timed out".into()))?
            .map_err(|_| Error::internal("poller dropped the request"))?
    }

    // --- Settings ---

    pub fn settings(&self) -> BridgeSettings {
        self.settings.read().unwrap().clone()
    }

    pub async fn update_settings(&self, settings: BridgeSettings) -> Result<()> {
        settings.validate()?;
        self.data.write(&self.data.settings_path(), &settings)?;

        let interval = Duration::from_millis(settings.poll_interval_ms);
        *self.settings.write().unwrap() = settings;

        let controls: Vec<_> = self
            .pollers
            .read()
            .unwrap()
            .values()
            .map(|h| h.control.clone())
            .collect();
        for control in controls {
            let _ = control.send(ControlMsg::SetInterval(interval)).await;
        }
        Ok(())
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data
    }

    /// Orderly shutdown: cancel pollers in parallel, publish the offline
    /// markers, close MQTT, then flush the history store.
    pub async fn shutdown(&self) {
        tracing::info!("Bridge shutting down");
        self.shutdown.cancel();

        let handles: Vec<PollerHandle> = {
            let mut pollers = self.pollers.write().unwrap();
            pollers.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }
        let mut status_topics = Vec::new();
        for handle in handles {
            status_topics.push(TopicBuilder::new(&handle.device_id).bridge_status());
            let _ = handle.join.await;
        }

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        self.mqtt.shutdown(&status_topics).await;

        if let Err(e) = self.history.flush() {
            tracing::warn!(error = %e, "History flush on shutdown failed");
        }

        tracing::info!("Bridge stopped");
    }
}

fn validate_devices(devices: &[DeviceConfig]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for device in devices {
        device.validate()?;
        if !seen.insert(device.device_id.as_str()) {
            return Err(Error::config(format!(
                "duplicate device_id '{}'",
                device.device_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::BridgeStatus;
    use crate::mqtt::MqttSettings;

    async fn test_manager(dir: &tempfile::TempDir, devices: Vec<DeviceConfig>) -> Arc<BridgeManager> {
        let data = DataDir::new(dir.path()).unwrap();
        let history = Arc::new(HistoryStore::open(dir.path().join("history.db")).unwrap());
        let mqtt = MqttLink::new(&MqttSettings::default());
        let mut settings = BridgeSettings::default();
        settings.poll_interval_ms = 1000;

        BridgeManager::start(devices, settings, mqtt, history, data, None)
            .await
            .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..300 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_with_mock_fallback_device() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Vec::new()).await;

        assert_eq!(manager.device_ids(), vec!["pdu-01"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_device_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path()).unwrap();
        let history = Arc::new(HistoryStore::open(dir.path().join("history.db")).unwrap());
        let mqtt = MqttLink::new(&MqttSettings::default());

        let devices = vec![DeviceConfig::mock("a"), DeviceConfig::mock("a")];
        let result = BridgeManager::start(
            devices,
            BridgeSettings::default(),
            mqtt,
            history,
            data,
            None,
        )
        .await;
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn test_outlet_command_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, vec![DeviceConfig::mock("pdu44001")]).await;

        {
            let pollers = manager.pollers.read().unwrap();
            let shared = pollers.get("pdu44001").unwrap().shared.clone();
            drop(pollers);
            wait_for(move || shared.last_snapshot.read().unwrap().is_some()).await;
        }

        let response = manager
            .outlet_command("pdu44001", 3, OutletAction::Off, CommandOrigin::Http)
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.outlet, 3);

        // The status payload reflects the new state after one cycle.
        wait_for(|| {
            manager
                .status(Some("pdu44001"))
                .map(|s| s["outlets"]["3"]["state"] == "off")
                .unwrap_or(false)
        })
        .await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_mqtt_command_routing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, vec![DeviceConfig::mock("pdu44001")]).await;

        {
            let pollers = manager.pollers.read().unwrap();
            let shared = pollers.get("pdu44001").unwrap().shared.clone();
            drop(pollers);
            wait_for(move || shared.last_snapshot.read().unwrap().is_some()).await;
        }

        manager.route_mqtt_command("pdu/pdu44001/outlet/2/command", b"off");

        wait_for(|| {
            manager
                .status(Some("pdu44001"))
                .map(|s| s["outlets"]["2"]["state"] == "off")
                .unwrap_or(false)
        })
        .await;

        // Unknown devices and bad payloads are ignored without panicking.
        manager.route_mqtt_command("pdu/nope/outlet/1/command", b"off");
        manager.route_mqtt_command("pdu/pdu44001/outlet/1/command", b"explode");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_hot_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, vec![DeviceConfig::mock("first")]).await;

        manager
            .add_device(DeviceConfig::mock("second"))
            .await
            .unwrap();
        assert_eq!(manager.device_ids(), vec!["first", "second"]);
        assert!(
            manager
                .device_configs()
                .iter()
                .any(|d| d.device_id == "second")
        );

        // Adding the same id again conflicts.
        assert!(matches!(
            manager.add_device(DeviceConfig::mock("second")).await,
            Err(Error::Conflict(_))
        ));

        // Give the new poller a rule file, then remove it.
        {
            let pollers = manager.pollers.read().unwrap();
            let shared = pollers.get("second").unwrap().shared.clone();
            drop(pollers);
            wait_for(move || shared.last_snapshot.read().unwrap().is_some()).await;
        }
        let rule = Rule {
            name: "r".to_string(),
            input: 0,
            condition: "time_after".to_string(),
            threshold: Some(serde_json::json!("22:00")),
            outlet: serde_json::json!(1),
            action: crate::rules::RuleAction::Off,
            restore: false,
            delay: 0.0,
            enabled: false,
            days_of_week: None,
            schedule_type: crate::rules::ScheduleType::Continuous,
            condition_since: None,
            triggered: false,
            fired_at: None,
            fire_count: 0,
        };
        manager.add_rule("second", rule).await.unwrap();
        let rules_path = manager.data.rules_path("second");
        assert!(rules_path.exists());

        manager.remove_device("second").await.unwrap();
        assert_eq!(manager.device_ids(), vec!["first"]);
        assert!(!rules_path.exists());
        assert!(
            !manager
                .device_configs()
                .iter()
                .any(|d| d.device_id == "second")
        );

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_device_implicit_single() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, vec![DeviceConfig::mock("only")]).await;

        assert_eq!(manager.resolve_device(None).unwrap(), "only");
        assert_eq!(manager.resolve_device(Some("only")).unwrap(), "only");
        assert!(manager.resolve_device(Some("nope")).is_err());

        manager.add_device(DeviceConfig::mock("more")).await.unwrap();
        assert!(manager.resolve_device(None).is_err());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, vec![DeviceConfig::mock("pdu44001")]).await;

        {
            let pollers = manager.pollers.read().unwrap();
            let shared = pollers.get("pdu44001").unwrap().shared.clone();
            drop(pollers);
            wait_for(move || shared.last_snapshot.read().unwrap().is_some()).await;
        }

        let report = manager.health();
        // The broker is not running in tests, so MQTT shows disconnected.
        assert_eq!(report.status, BridgeStatus::Degraded);
        assert!(report.issues.contains(&"MQTT disconnected".to_string()));
        assert_eq!(report.devices.len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_settings_update_persists_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, vec![DeviceConfig::mock("d")]).await;

        let mut settings = manager.settings();
        settings.poll_interval_ms = 500;
        assert!(manager.update_settings(settings.clone()).await.is_err());

        settings.poll_interval_ms = 2000;
        manager.update_settings(settings).await.unwrap();
        assert_eq!(manager.settings().poll_interval_ms, 2000);
        assert!(manager.data.settings_path().exists());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_next_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, vec![DeviceConfig::mock("pdu-01")]).await;
        assert_eq!(manager.next_device_id(), "pdu-02");
        manager.shutdown().await;
    }
}
