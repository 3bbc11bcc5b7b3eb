//! Per-device poll loop.
//!
//! One poller task per PDU. The task owns the transport(s), the automation
//! engine and the outlet-name overrides; everything else reaches it through
//! its control channel or reads the shared state it publishes. Commands and
//! polls serialize through the task itself, so a write in flight can never
//! race a poll on the same transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pdubridge_common::error::{Error, Result};
use pdubridge_common::model::{Identity, Snapshot, current_timestamp_millis};
use pdubridge_common::topics::TopicBuilder;
use pdubridge_common::{DeviceConfig, TransportSelector};
use pdubridge_transport::management::{
    AtsSettings, BankThresholds, EnergyWiseSettings, NetworkSettings, NotificationSettings,
    OutletSettings,
};
use pdubridge_transport::{
    MockTransport, OutletAction, SerialConsole, SnmpTransport, Transport, TransportKind,
};

use crate::events::{EventRecord, EventRing, EventType};
use crate::health::{DeviceHealth, FailureDecision, HealthState, TransportHealth};
use crate::history::{HistoryStore, samples_from_snapshot};
use crate::mqtt::{MqttLink, QoS};
use crate::persist::DataDir;
use crate::rules::{AutomationEngine, Rule};

/// Per-command execution budget.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Invoke the recovery scanner after this many consecutive failures in Lost.
const RECOVERY_SCAN_PERIOD: u32 = 60;

/// Where a command came from, for logging and the response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    Mqtt,
    Http,
    Automation,
}

impl std::fmt::Display for CommandOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandOrigin::Mqtt => "mqtt",
            CommandOrigin::Http => "http",
            CommandOrigin::Automation => "automation",
        };
        write!(f, "{}", s)
    }
}

/// Response record published for every executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub command: String,
    pub outlet: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: i64,
}

/// An outlet command heading for the device FIFO.
pub struct CommandRequest {
    pub outlet: u32,
    pub action: OutletAction,
    pub origin: CommandOrigin,
    /// HTTP waits for the outcome; MQTT and automation do not.
    pub respond: Option<oneshot::Sender<CommandResponse>>,
}

/// Console management operations, forwarded through the command gate.
pub enum ManagementRequest {
    GetThresholds,
    SetThresholds(BankThresholds),
    GetNetwork,
    SetNetwork(NetworkSettings),
    GetAtsConfig,
    SetAtsConfig(AtsSettings),
    SetOutletConfig(OutletSettings),
    SetDeviceName(String),
    SetDeviceLocation(String),
    CheckDefaultCredentials,
    ChangePassword {
        username: String,
        old_password: String,
        new_password: String,
    },
    GetEventLog,
    GetNotifications,
    SetNotifications(NotificationSettings),
    GetEnergywise,
    SetEnergywise(EnergyWiseSettings),
    GetUsers,
}

/// Messages the manager (and HTTP facade) send to a poller.
pub enum ControlMsg {
    Command(CommandRequest),
    Management {
        request: ManagementRequest,
        respond: oneshot::Sender<Result<serde_json::Value>>,
    },
    RuleAdd {
        rule: Rule,
        respond: oneshot::Sender<Result<()>>,
    },
    RuleUpdate {
        rule: Rule,
        respond: oneshot::Sender<Result<()>>,
    },
    RuleRemove {
        name: String,
        respond: oneshot::Sender<Result<()>>,
    },
    RuleToggle {
        name: String,
        respond: oneshot::Sender<Result<bool>>,
    },
    SetOutletName {
        outlet: u32,
        name: String,
        respond: oneshot::Sender<Result<()>>,
    },
    SetInterval(Duration),
    /// Refresh the retained device info topic (manager's 30 s schedule).
    PublishDeviceInfo,
}

/// External DHCP-recovery hook. Scans the last-known subnet for a device with
/// the given serial; absent in most deployments, in which case Lost is a
/// stable state.
pub trait RecoveryScanner: Send + Sync {
    fn scan(&self, last_host: &str, serial: Option<&str>) -> Option<String>;
}

/// State a poller exposes to readers.
pub struct PollerShared {
    pub last_snapshot: RwLock<Option<Snapshot>>,
    pub health: RwLock<TransportHealth>,
    pub rules: RwLock<Vec<Rule>>,
    pub events: Mutex<EventRing>,
    pub identity: RwLock<Option<Identity>>,
    pub outlet_names: RwLock<HashMap<u32, String>>,
}

impl PollerShared {
    fn new(active: TransportKind) -> Self {
        Self {
            last_snapshot: RwLock::new(None),
            health: RwLock::new(TransportHealth::new(active)),
            rules: RwLock::new(Vec::new()),
            events: Mutex::new(EventRing::new()),
            identity: RwLock::new(None),
            outlet_names: RwLock::new(HashMap::new()),
        }
    }

    pub fn device_health(&self, device_id: &str) -> DeviceHealth {
        let health = self.health.read().unwrap();
        DeviceHealth {
            device_id: device_id.to_string(),
            state: health.state,
            active_transport: health.active,
            consecutive_failures: health.consecutive_failures,
            data_age_seconds: health.data_age_seconds(),
            last_error: health.last_error.clone(),
        }
    }
}

/// Handle the manager keeps per running poller.
pub struct PollerHandle {
    pub device_id: String,
    pub config: DeviceConfig,
    pub control: mpsc::Sender<ControlMsg>,
    pub shared: Arc<PollerShared>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl PollerHandle {
    /// Enqueue an outlet command; FIFO order per device.
    pub async fn send_command(&self, request: CommandRequest) -> Result<()> {
        self.control
            .send(ControlMsg::Command(request))
            .await
            .map_err(|_| Error::internal("poller is gone"))
    }

    pub async fn send(&self, msg: ControlMsg) -> Result<()> {
        self.control
            .send(msg)
            .await
            .map_err(|_| Error::internal("poller is gone"))
    }
}

/// Everything a poller needs from the outside.
pub struct PollerDeps {
    pub device: DeviceConfig,
    pub mqtt: MqttLink,
    pub history: Arc<HistoryStore>,
    pub data: DataDir,
    pub interval: Duration,
    pub scanner: Option<Arc<dyn RecoveryScanner>>,
}

/// Build the configured primary transport.
pub fn build_transport(device: &DeviceConfig) -> Result<Box<dyn Transport>> {
    match device.transport {
        TransportSelector::Mock => Ok(Box::new(MockTransport::with_ats())),
        TransportSelector::Snmp => {
            let host = device
                .host
                .as_deref()
                .ok_or_else(|| Error::config("SNMP transport requires a host"))?;
            Ok(Box::new(SnmpTransport::new(
                host,
                device.snmp_port,
                &device.read_community,
                &device.write_community,
            )))
        }
        TransportSelector::Serial => {
            let serial = device
                .serial
                .as_ref()
                .ok_or_else(|| Error::config("serial transport requires serial settings"))?;
            Ok(Box::new(SerialConsole::new(
                &serial.port,
                serial.baud,
                serial.username.clone(),
                serial.password.clone(),
            )))
        }
    }
}

/// Build the fallback transport, when the config provides one.
fn build_fallback(device: &DeviceConfig) -> Option<Box<dyn Transport>> {
    if device.transport != TransportSelector::Snmp {
        return None;
    }
    let serial = device.serial.as_ref()?;
    Some(Box::new(SerialConsole::new(
        &serial.port,
        serial.baud,
        serial.username.clone(),
        serial.password.clone(),
    )))
}

/// Start a poller with transports built from the device config.
pub fn spawn_poller(deps: PollerDeps) -> Result<PollerHandle> {
    let primary = build_transport(&deps.device)?;
    let fallback = build_fallback(&deps.device);
    Ok(spawn_poller_with_transports(deps, primary, fallback))
}

/// Start a poller with caller-supplied transports (tests inject mocks here).
pub fn spawn_poller_with_transports(
    deps: PollerDeps,
    primary: Box<dyn Transport>,
    fallback: Option<Box<dyn Transport>>,
) -> PollerHandle {
    let device_id = deps.device.device_id.clone();
    let shared = Arc::new(PollerShared::new(primary.kind()));
    let (control_tx, control_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    // Load persisted rules and name overrides before the first cycle.
    let rules: Vec<Rule> = deps
        .data
        .read(&deps.data.rules_path(&device_id))
        .unwrap_or_default()
        .unwrap_or_default();
    let names: HashMap<u32, String> = deps
        .data
        .read(&deps.data.outlet_names_path(&device_id))
        .unwrap_or_default()
        .unwrap_or_default();
    *shared.outlet_names.write().unwrap() = names.clone();

    let (engine, load_events) = AutomationEngine::load(&device_id, rules);
    *shared.rules.write().unwrap() = engine.rules();
    {
        let mut ring = shared.events.lock().unwrap();
        for event in load_events {
            ring.push(event);
        }
    }

    let config = deps.device.clone();
    let poller = DevicePoller {
        device: deps.device,
        topics: TopicBuilder::new(&device_id),
        mqtt: deps.mqtt,
        history: deps.history,
        data: deps.data,
        interval: deps.interval,
        scanner: deps.scanner,
        shared: shared.clone(),
        transport: primary,
        fallback,
        engine,
        outlet_names: names,
        control: control_rx,
        command_tx: control_tx.clone(),
        cancel: cancel.clone(),
        need_identify: true,
        last_uptime: None,
    };

    let join = tokio::spawn(poller.run());

    PollerHandle {
        device_id,
        config,
        control: control_tx,
        shared,
        cancel,
        join,
    }
}

struct DevicePoller {
    device: DeviceConfig,
    topics: TopicBuilder,
    mqtt: MqttLink,
    history: Arc<HistoryStore>,
    data: DataDir,
    interval: Duration,
    scanner: Option<Arc<dyn RecoveryScanner>>,
    shared: Arc<PollerShared>,
    transport: Box<dyn Transport>,
    fallback: Option<Box<dyn Transport>>,
    engine: AutomationEngine,
    outlet_names: HashMap<u32, String>,
    control: mpsc::Receiver<ControlMsg>,
    /// Clone of the control sender, used to enqueue automation commands into
    /// the same FIFO user commands travel through.
    command_tx: mpsc::Sender<ControlMsg>,
    cancel: CancellationToken,
    need_identify: bool,
    last_uptime: Option<u64>,
}

impl DevicePoller {
    async fn run(mut self) {
        let device_id = self.device.device_id.clone();
        tracing::info!(
            device = %device_id,
            transport = %self.transport.kind(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting poller"
        );

        loop {
            let deadline = tokio::time::Instant::now() + self.interval;

            if self.cancel.is_cancelled() {
                break;
            }

            self.cycle().await;

            // Between cycles: execute queued commands and control messages.
            // An overrun cycle starts the next one immediately; we never run
            // extra cycles to catch up.
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.drain_cancelled().await;
                        tracing::info!(device = %device_id, "Poller stopped");
                        return;
                    }
                    msg = self.control.recv() => {
                        match msg {
                            Some(msg) => self.handle_control(msg).await,
                            None => {
                                tracing::info!(device = %device_id, "Control channel closed");
                                return;
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        self.drain_cancelled().await;
        tracing::info!(device = %device_id, "Poller stopped");
    }

    /// One poll cycle with a total budget of the poll interval.
    async fn cycle(&mut self) {
        if self.need_identify {
            match tokio::time::timeout(self.interval, self.transport.identify()).await {
                Ok(Ok(identity)) => {
                    tracing::info!(
                        device = %self.device.device_id,
                        model = %identity.model,
                        serial = %identity.serial,
                        "Device identified"
                    );
                    *self.shared.identity.write().unwrap() = Some(identity);
                    self.need_identify = false;
                    self.publish_device_info().await;
                }
                Ok(Err(e)) => {
                    self.record_failure(&e.to_string()).await;
                    return;
                }
                Err(_) => {
                    self.record_failure("identify timed out").await;
                    return;
                }
            }
        }

        let result = tokio::time::timeout(self.interval, self.transport.poll()).await;
        match result {
            Ok(Ok(snapshot)) => self.handle_snapshot(snapshot).await,
            Ok(Err(e)) => self.record_failure(&e.to_string()).await,
            Err(_) => {
                self.record_failure(&format!("poll exceeded {:?} budget", self.interval))
                    .await
            }
        }
    }

    async fn handle_snapshot(&mut self, mut snapshot: Snapshot) {
        let device_id = self.device.device_id.clone();

        let state_changed = self.shared.health.write().unwrap().record_success();
        if state_changed {
            tracing::info!(device = %device_id, "Device healthy");
        }

        // Reboot detection: uptime went backwards between successful cycles.
        if let (Some(prev), Some(current)) = (self.last_uptime, snapshot.uptime_ticks) {
            if current < prev {
                tracing::warn!(device = %device_id, "Device rebooted, re-reading identity");
                self.need_identify = true;
                self.push_event(EventRecord::new(
                    &device_id,
                    EventType::DeviceReboot,
                    format!("uptime regressed ({} -> {} ticks)", prev, current),
                ))
                .await;
            }
        }
        self.last_uptime = snapshot.uptime_ticks;

        // Apply outlet-name overrides.
        for outlet in &mut snapshot.outlets {
            if let Some(name) = self.outlet_names.get(&outlet.outlet) {
                outlet.name = name.clone();
            }
        }
        if snapshot.identity.is_none() {
            snapshot.identity = self.shared.identity.read().unwrap().clone();
        }

        self.publish_snapshot(&snapshot).await;
        self.history
            .append(samples_from_snapshot(&device_id, &snapshot));

        // Automation: evaluate, then push intents through the command FIFO.
        let outcome = self.engine.evaluate(&snapshot, Local::now());
        for event in outcome.events {
            self.push_event(event).await;
        }
        if outcome.changed {
            self.publish_rule_states().await;
        }
        let mut commanded = std::collections::HashSet::new();
        for intent in outcome.intents {
            for outlet in intent.outlets {
                // One command per outlet per cycle.
                if !commanded.insert(outlet) {
                    continue;
                }
                let request = CommandRequest {
                    outlet,
                    action: intent.action,
                    origin: CommandOrigin::Automation,
                    respond: None,
                };
                if self
                    .command_tx
                    .try_send(ControlMsg::Command(request))
                    .is_err()
                {
                    tracing::warn!(
                        device = %device_id,
                        outlet,
                        "Command queue full, dropping automation command"
                    );
                }
            }
        }

        *self.shared.last_snapshot.write().unwrap() = Some(snapshot);
    }

    async fn record_failure(&mut self, error: &str) {
        let device_id = self.device.device_id.clone();
        let decision = {
            let mut health = self.shared.health.write().unwrap();
            health.record_failure(error, self.fallback.is_some())
        };

        match decision {
            FailureDecision::Continue => {
                tracing::debug!(device = %device_id, error = %error, "Poll failed");
            }
            FailureDecision::LogWarn => {
                let (count, state) = {
                    let health = self.shared.health.read().unwrap();
                    (health.consecutive_failures, health.state)
                };
                tracing::warn!(
                    device = %device_id,
                    error = %error,
                    consecutive_failures = count,
                    state = %state,
                    "Device not responding"
                );
            }
            FailureDecision::AttemptSwap => {
                self.attempt_swap().await;
            }
        }

        self.maybe_recovery_scan().await;
    }

    /// Swap to the fallback transport. The current cycle has already
    /// completed or failed; the next one uses the fallback.
    async fn attempt_swap(&mut self) {
        let device_id = self.device.device_id.clone();
        let Some(mut fallback) = self.fallback.take() else {
            return;
        };

        tracing::warn!(
            device = %device_id,
            to = %fallback.kind(),
            "Primary transport failed, attempting swap"
        );

        match tokio::time::timeout(self.interval, fallback.identify()).await {
            Ok(Ok(identity)) => {
                let to = fallback.kind();
                let from = self.transport.kind();
                self.transport = fallback;
                *self.shared.identity.write().unwrap() = Some(identity);
                self.need_identify = false;
                self.shared.health.write().unwrap().swapped(to);

                tracing::info!(device = %device_id, from = %from, to = %to, "Transport swapped");
                self.push_event(EventRecord::new(
                    &device_id,
                    EventType::TransportSwap,
                    format!("{} -> {}", from, to),
                ))
                .await;
                self.publish_device_info().await;
            }
            Ok(Err(e)) => {
                // Keep the fallback for the next attempt window.
                self.fallback = Some(fallback);
                self.shared.health.write().unwrap().swap_failed();
                tracing::warn!(device = %device_id, error = %e, "Transport swap failed");
            }
            Err(_) => {
                self.fallback = Some(fallback);
                self.shared.health.write().unwrap().swap_failed();
                tracing::warn!(device = %device_id, "Transport swap timed out");
            }
        }
    }

    /// In Lost with a configured host, periodically ask the external subnet
    /// scanner whether the device moved.
    async fn maybe_recovery_scan(&mut self) {
        let (lost, count) = {
            let health = self.shared.health.read().unwrap();
            (health.state == HealthState::Lost, health.consecutive_failures)
        };
        if !lost || count % RECOVERY_SCAN_PERIOD != 0 {
            return;
        }
        let Some(scanner) = self.scanner.clone() else {
            return;
        };
        let Some(host) = self.device.host.clone() else {
            return;
        };

        let serial = self
            .shared
            .identity
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.serial.clone());

        if let Some(new_host) = scanner.scan(&host, serial.as_deref()) {
            tracing::info!(
                device = %self.device.device_id,
                old_host = %host,
                new_host = %new_host,
                "Recovery scan found device at new address"
            );
            self.device.host = Some(new_host.clone());
            let port = self.device.snmp_port;
            self.transport = Box::new(
                SnmpTransport::new(
                    &new_host,
                    port,
                    &self.device.read_community,
                    &self.device.write_community,
                ),
            );
            self.need_identify = true;
        }
    }

    async fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Command(request) => self.execute_command(request).await,
            ControlMsg::Management { request, respond } => {
                let result = self.execute_management(request).await;
                let _ = respond.send(result);
            }
            ControlMsg::RuleAdd { rule, respond } => {
                let outlet_count = self.outlet_count();
                let result = self.engine.add(rule, outlet_count).map(|event| {
                    tokio::spawn(publish_event(
                        self.mqtt.clone(),
                        self.topics.automation_event(),
                        event.clone(),
                    ));
                    self.shared.events.lock().unwrap().push(event);
                });
                self.after_rule_change().await;
                let _ = respond.send(result);
            }
            ControlMsg::RuleUpdate { rule, respond } => {
                let outlet_count = self.outlet_count();
                let result = self.engine.update(rule, outlet_count).map(|event| {
                    self.shared.events.lock().unwrap().push(event);
                });
                self.after_rule_change().await;
                let _ = respond.send(result);
            }
            ControlMsg::RuleRemove { name, respond } => {
                let result = self.engine.remove(&name).map(|event| {
                    self.shared.events.lock().unwrap().push(event);
                });
                self.after_rule_change().await;
                let _ = respond.send(result);
            }
            ControlMsg::RuleToggle { name, respond } => {
                let result = self.engine.toggle(&name).map(|(enabled, event)| {
                    self.shared.events.lock().unwrap().push(event);
                    enabled
                });
                self.after_rule_change().await;
                let _ = respond.send(result);
            }
            ControlMsg::SetOutletName {
                outlet,
                name,
                respond,
            } => {
                let result = self.set_outlet_name(outlet, name).await;
                let _ = respond.send(result);
            }
            ControlMsg::SetInterval(interval) => {
                tracing::info!(
                    device = %self.device.device_id,
                    interval_ms = interval.as_millis() as u64,
                    "Poll interval updated"
                );
                self.interval = interval;
            }
            ControlMsg::PublishDeviceInfo => self.publish_device_info().await,
        }
    }

    fn outlet_count(&self) -> Option<u32> {
        self.shared
            .identity
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.outlet_count)
    }

    async fn after_rule_change(&mut self) {
        let rules = self.engine.rules();
        if let Err(e) = self
            .data
            .write(&self.data.rules_path(&self.device.device_id), &rules)
        {
            tracing::error!(
                device = %self.device.device_id,
                error = %e,
                "Failed to persist rules"
            );
        }
        *self.shared.rules.write().unwrap() = rules;
        self.publish_rule_states().await;
    }

    async fn set_outlet_name(&mut self, outlet: u32, name: String) -> Result<()> {
        if let Some(count) = self.outlet_count() {
            if outlet == 0 || outlet > count {
                return Err(Error::not_found(format!("outlet {}", outlet)));
            }
        }

        self.outlet_names.insert(outlet, name.clone());
        self.data.write(
            &self.data.outlet_names_path(&self.device.device_id),
            &self.outlet_names,
        )?;
        *self.shared.outlet_names.write().unwrap() = self.outlet_names.clone();

        self.mqtt
            .publish(self.topics.outlet(outlet, "name"), name, true, QoS::AtLeastOnce)
            .await?;
        Ok(())
    }

    /// Execute one queued command against the transport and publish the
    /// response record whatever the outcome.
    async fn execute_command(&mut self, request: CommandRequest) {
        let device_id = self.device.device_id.clone();
        let CommandRequest {
            outlet,
            action,
            origin,
            respond,
        } = request;

        let result = if let Some(count) = self.outlet_count() {
            if outlet == 0 || outlet > count {
                Err(Error::not_found(format!(
                    "outlet {} (device has {})",
                    outlet, count
                )))
            } else {
                self.run_set(outlet, action).await
            }
        } else {
            self.run_set(outlet, action).await
        };

        let response = CommandResponse {
            success: result.is_ok(),
            command: action.as_str().to_string(),
            outlet,
            error: result.as_ref().err().map(|e| e.to_string()),
            ts: current_timestamp_millis(),
        };

        match &result {
            Ok(()) => tracing::info!(
                device = %device_id, outlet, action = %action, origin = %origin,
                "Outlet command executed"
            ),
            Err(e) => tracing::warn!(
                device = %device_id, outlet, action = %action, origin = %origin, error = %e,
                "Outlet command failed"
            ),
        }

        if let Ok(payload) = serde_json::to_vec(&response) {
            let _ = self
                .mqtt
                .publish(
                    self.topics.outlet_command_response(outlet),
                    payload,
                    false,
                    QoS::AtLeastOnce,
                )
                .await;
        }

        if let Some(respond) = respond {
            let _ = respond.send(response);
        }
    }

    async fn run_set(&mut self, outlet: u32, action: OutletAction) -> Result<()> {
        match tokio::time::timeout(COMMAND_TIMEOUT, self.transport.set_outlet(outlet, action)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::SnmpSetRejected(e.to_string())),
            Err(_) => Err(Error::TransportTimeout(format!(
                "set_outlet {} {} exceeded {:?}",
                outlet, action, COMMAND_TIMEOUT
            ))),
        }
    }

    async fn execute_management(&mut self, request: ManagementRequest) -> Result<serde_json::Value> {
        let Some(management) = self.transport.management() else {
            return Err(Error::requires_serial(format!(
                "device '{}' has no management transport",
                self.device.device_id
            )));
        };

        let result = async {
            match request {
                ManagementRequest::GetThresholds => json(management.get_thresholds().await.map_err(transport_err)?),
                ManagementRequest::SetThresholds(t) => {
                    management.set_thresholds(&t).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::GetNetwork => json(management.get_network().await.map_err(transport_err)?),
                ManagementRequest::SetNetwork(s) => {
                    management.set_network(&s).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::GetAtsConfig => json(management.get_ats_config().await.map_err(transport_err)?),
                ManagementRequest::SetAtsConfig(s) => {
                    management.set_ats_config(&s).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::SetOutletConfig(s) => {
                    management.set_outlet_config(&s).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::SetDeviceName(name) => {
                    management.set_device_name(&name).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::SetDeviceLocation(location) => {
                    management.set_device_location(&location).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::CheckDefaultCredentials => {
                    let default = management.check_default_credentials().await.map_err(transport_err)?;
                    Ok(serde_json::json!({ "default_credentials": default }))
                }
                ManagementRequest::ChangePassword {
                    username,
                    old_password,
                    new_password,
                } => {
                    management
                        .change_password(&username, &old_password, &new_password)
                        .await
                        .map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::GetEventLog => json(management.get_event_log().await.map_err(transport_err)?),
                ManagementRequest::GetNotifications => json(management.get_notifications().await.map_err(transport_err)?),
                ManagementRequest::SetNotifications(s) => {
                    management.set_notifications(&s).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::GetEnergywise => json(management.get_energywise().await.map_err(transport_err)?),
                ManagementRequest::SetEnergywise(s) => {
                    management.set_energywise(&s).await.map_err(transport_err)?;
                    ok()
                }
                ManagementRequest::GetUsers => json(management.get_users().await.map_err(transport_err)?),
            }
        }
        .await;

        // Surface a security event when the factory credentials are found.
        if let Ok(value) = &result {
            if value.get("default_credentials") == Some(&serde_json::Value::Bool(true)) {
                self.push_event(EventRecord::new(
                    &self.device.device_id,
                    EventType::SecurityWarning,
                    "device still accepts factory credentials",
                ))
                .await;
            }
        }

        result
    }

    /// Flush remaining queued commands with a cancelled response.
    async fn drain_cancelled(&mut self) {
        self.control.close();
        while let Ok(msg) = self.control.try_recv() {
            match msg {
                ControlMsg::Command(request) => {
                    let response = CommandResponse {
                        success: false,
                        command: request.action.as_str().to_string(),
                        outlet: request.outlet,
                        error: Some("cancelled".to_string()),
                        ts: current_timestamp_millis(),
                    };
                    if let Some(respond) = request.respond {
                        let _ = respond.send(response);
                    }
                }
                ControlMsg::Management { respond, .. } => {
                    let _ = respond.send(Err(Error::Cancelled("poller stopping".into())));
                }
                ControlMsg::RuleAdd { respond, .. } | ControlMsg::RuleUpdate { respond, .. } => {
                    let _ = respond.send(Err(Error::Cancelled("poller stopping".into())));
                }
                ControlMsg::RuleRemove { respond, .. } => {
                    let _ = respond.send(Err(Error::Cancelled("poller stopping".into())));
                }
                ControlMsg::RuleToggle { respond, .. } => {
                    let _ = respond.send(Err(Error::Cancelled("poller stopping".into())));
                }
                ControlMsg::SetOutletName { respond, .. } => {
                    let _ = respond.send(Err(Error::Cancelled("poller stopping".into())));
                }
                ControlMsg::SetInterval(_) | ControlMsg::PublishDeviceInfo => {}
            }
        }
    }

    async fn push_event(&self, event: EventRecord) {
        self.shared.events.lock().unwrap().push(event.clone());
        publish_event(self.mqtt.clone(), self.topics.automation_event(), event).await;
    }

    async fn publish_rule_states(&self) {
        let rules = self.engine.rules();
        *self.shared.rules.write().unwrap() = rules.clone();
        if let Ok(payload) = serde_json::to_vec(&rules) {
            let _ = self
                .mqtt
                .publish(self.topics.automation_status(), payload, true, QoS::AtLeastOnce)
                .await;
        }
    }

    /// Identity + settings, refreshed every 30 s by the manager and
    /// immediately after a transport swap.
    pub(crate) async fn publish_device_info(&self) {
        let payload = device_info_payload(
            &self.device,
            self.shared.identity.read().unwrap().as_ref(),
            self.shared.health.read().unwrap().active,
        );
        if let Ok(payload) = serde_json::to_vec(&payload) {
            let _ = self
                .mqtt
                .publish(self.topics.device_info(), payload, true, QoS::AtLeastOnce)
                .await;
        }
    }

    async fn publish_snapshot(&self, snapshot: &Snapshot) {
        publish_metric_topics(&self.mqtt, &self.topics, snapshot).await;

        let health = self.shared.device_health(&self.device.device_id);
        let payload = status_payload(
            &self.device,
            snapshot,
            &health,
            self.mqtt.is_connected(),
            self.mqtt.queued_publishes(),
        );
        if let Ok(payload) = serde_json::to_vec(&payload) {
            let _ = self
                .mqtt
                .publish(self.topics.status(), payload, true, QoS::AtLeastOnce)
                .await;
        }
    }
}

fn json<T: Serialize>(value: T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(Error::from)
}

fn transport_err(e: pdubridge_transport::TransportError) -> Error {
    use pdubridge_transport::ErrorKind;
    match e.kind {
        ErrorKind::Timeout => Error::TransportTimeout(e.message),
        ErrorKind::Unreachable => Error::TransportUnreachable(e.message),
        ErrorKind::Authentication => Error::TransportAuth(e.message),
        ErrorKind::Parse => Error::TransportParse(e.message),
        ErrorKind::Refused => Error::SnmpSetRejected(e.message),
        ErrorKind::Unknown => Error::Internal(e.message),
    }
}

fn ok() -> Result<serde_json::Value> {
    Ok(serde_json::json!({ "ok": true }))
}

async fn publish_event(mqtt: MqttLink, topic: String, event: EventRecord) {
    if let Ok(payload) = serde_json::to_vec(&event) {
        let _ = mqtt.publish(topic, payload, false, QoS::AtLeastOnce).await;
    }
}

/// Device info topic payload.
pub fn device_info_payload(
    device: &DeviceConfig,
    identity: Option<&Identity>,
    active: TransportKind,
) -> serde_json::Value {
    serde_json::json!({
        "device_id": device.device_id,
        "label": device.label,
        "host": device.host,
        "enabled": device.enabled,
        "transport": active.as_str(),
        "identity": identity,
    })
}

/// The `/status` summary payload, shared with `GET /api/status`.
pub fn status_payload(
    device: &DeviceConfig,
    snapshot: &Snapshot,
    health: &DeviceHealth,
    mqtt_connected: bool,
    mqtt_queued: usize,
) -> serde_json::Value {
    let outlets: serde_json::Map<String, serde_json::Value> = snapshot
        .outlets
        .iter()
        .map(|o| {
            (
                o.outlet.to_string(),
                serde_json::json!({
                    "state": o.state.as_str(),
                    "name": o.name,
                    "current": o.current,
                    "power": o.power,
                    "energy": o.energy,
                }),
            )
        })
        .collect();

    serde_json::json!({
        "device": device.device_id,
        "label": device.label,
        "state": health.state.as_str(),
        "transport": health.active_transport.as_str(),
        "identity": snapshot.identity,
        "inputs": snapshot.input,
        "ats": snapshot.ats,
        "outlets": outlets,
        "summary": {
            "banks": snapshot.banks,
            "totals": snapshot.totals,
            "environment": snapshot.environment,
        },
        "mqtt": {
            "connected": mqtt_connected,
            "queued": mqtt_queued,
        },
        "data_age_seconds": (current_timestamp_millis() - snapshot.ts) as f64 / 1000.0,
        "ts": snapshot.ts,
    })
}

/// Publish every per-metric topic for one snapshot, retained. Conditional
/// topics are skipped when the underlying field is unset.
pub async fn publish_metric_topics(mqtt: &MqttLink, topics: &TopicBuilder, snapshot: &Snapshot) {
    let qos = QoS::AtLeastOnce;

    let mut floats: Vec<(String, f64)> = Vec::new();
    let mut strings: Vec<(String, String)> = Vec::new();

    if let Some(input) = &snapshot.input {
        floats.push((topics.input("voltage"), input.voltage));
        floats.push((topics.input("frequency"), input.frequency));
    }

    for outlet in &snapshot.outlets {
        strings.push((
            topics.outlet(outlet.outlet, "state"),
            outlet.state.as_str().to_string(),
        ));
        strings.push((topics.outlet(outlet.outlet, "name"), outlet.name.clone()));
        if let Some(current) = outlet.current {
            floats.push((topics.outlet(outlet.outlet, "current"), current));
        }
        if let Some(power) = outlet.power {
            floats.push((topics.outlet(outlet.outlet, "power"), power));
        }
        if let Some(energy) = outlet.energy {
            floats.push((topics.outlet(outlet.outlet, "energy"), energy));
        }
    }

    for bank in &snapshot.banks {
        floats.push((topics.bank(bank.bank, "current"), bank.current));
        strings.push((
            topics.bank(bank.bank, "load_state"),
            bank.load_state.as_str().to_string(),
        ));
        if let Some(voltage) = bank.voltage {
            floats.push((topics.bank(bank.bank, "voltage"), voltage));
        }
        if let Some(power) = bank.power {
            floats.push((topics.bank(bank.bank, "power"), power));
        }
        if let Some(apparent) = bank.apparent_power {
            floats.push((topics.bank(bank.bank, "apparent_power"), apparent));
        }
        if let Some(pf) = bank.power_factor {
            floats.push((topics.bank(bank.bank, "power_factor"), pf));
        }
        if let Some(energy) = bank.energy {
            floats.push((topics.bank(bank.bank, "energy"), energy));
        }
    }

    if let Some(ats) = &snapshot.ats {
        strings.push((
            topics.ats("preferred_source"),
            ats.preferred_source.as_str().to_string(),
        ));
        strings.push((
            topics.ats("current_source"),
            ats.current_source.as_str().to_string(),
        ));
        strings.push((
            topics.ats("auto_transfer"),
            if ats.auto_transfer { "on" } else { "off" }.to_string(),
        ));
        strings.push((
            topics.ats("redundancy"),
            ats.redundancy.as_str().to_string(),
        ));
        if let Some(sensitivity) = &ats.voltage_sensitivity {
            strings.push((topics.ats("voltage_sensitivity"), sensitivity.clone()));
        }
        if let Some(v) = ats.transfer_voltage {
            floats.push((topics.ats("transfer_voltage"), v));
        }
        if let Some(v) = ats.voltage_upper_limit {
            floats.push((topics.ats("voltage_upper_limit"), v));
        }
        if let Some(v) = ats.voltage_lower_limit {
            floats.push((topics.ats("voltage_lower_limit"), v));
        }

        for (label, source) in [("a", &ats.source_a), ("b", &ats.source_b)] {
            if let Some(voltage) = source.voltage {
                floats.push((topics.source(label, "voltage"), voltage));
            }
            if let Some(frequency) = source.frequency {
                floats.push((topics.source(label, "frequency"), frequency));
            }
            if let Some(status) = source.status {
                strings.push((
                    topics.source(label, "voltage_status"),
                    status.as_str().to_string(),
                ));
            }
        }
    }

    if let Some(load) = snapshot.totals.load {
        floats.push((topics.total("load"), load));
    }
    if let Some(power) = snapshot.totals.power {
        floats.push((topics.total("power"), power));
    }
    if let Some(energy) = snapshot.totals.energy {
        floats.push((topics.total("energy"), energy));
    }

    if let Some(delay) = snapshot.coldstart_delay {
        strings.push((topics.coldstart("delay"), delay.to_string()));
    }
    if let Some(state) = snapshot.coldstart_state {
        strings.push((topics.coldstart("state"), state.as_str().to_string()));
    }

    if let Some(env) = &snapshot.environment {
        if let Some(temperature) = env.temperature {
            floats.push((topics.environment("temperature"), temperature));
        }
        if let Some(humidity) = env.humidity {
            floats.push((topics.environment("humidity"), humidity));
        }
        for contact in &env.contacts {
            strings.push((
                topics.environment_contact(contact.contact),
                contact.state.as_str().to_string(),
            ));
        }
    }

    for (topic, value) in floats {
        let _ = mqtt.publish(topic, value.to_string(), true, qos).await;
    }
    for (topic, value) in strings {
        let _ = mqtt.publish(topic, value, true, qos).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::MqttSettings;

    fn test_deps(dir: &tempfile::TempDir, device_id: &str) -> PollerDeps {
        let data = DataDir::new(dir.path()).unwrap();
        PollerDeps {
            device: DeviceConfig::mock(device_id),
            mqtt: MqttLink::new(&MqttSettings::default()),
            history: Arc::new(HistoryStore::open(dir.path().join("history.db")).unwrap()),
            data,
            interval: Duration::from_millis(20),
            scanner: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_poller_produces_snapshots_with_increasing_ts() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_poller(test_deps(&dir, "pdu44001")).unwrap();

        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;
        let first = handle.shared.last_snapshot.read().unwrap().clone().unwrap();

        wait_for(|| {
            handle
                .shared
                .last_snapshot
                .read()
                .unwrap()
                .as_ref()
                .is_some_and(|s| s.ts > first.ts)
        })
        .await;

        assert_eq!(
            handle.shared.health.read().unwrap().state,
            HealthState::Healthy
        );
        assert!(handle.shared.identity.read().unwrap().is_some());

        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    #[tokio::test]
    async fn test_command_executes_and_next_poll_reflects_state() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(&dir, "pdu44001");
        let transport = MockTransport::new();
        let mock = transport.handle();
        let handle = spawn_poller_with_transports(deps, Box::new(transport), None);

        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;

        let (tx, rx) = oneshot::channel();
        handle
            .send_command(CommandRequest {
                outlet: 3,
                action: OutletAction::Off,
                origin: CommandOrigin::Http,
                respond: Some(tx),
            })
            .await
            .unwrap();

        let response = rx.await.unwrap();
        assert!(response.success);
        assert_eq!(response.command, "off");
        assert_eq!(response.outlet, 3);
        assert_eq!(
            mock.outlet_state(3),
            Some(pdubridge_common::model::OutletState::Off)
        );

        wait_for(|| {
            handle
                .shared
                .last_snapshot
                .read()
                .unwrap()
                .as_ref()
                .and_then(|s| s.outlet(3).map(|o| o.state))
                == Some(pdubridge_common::model::OutletState::Off)
        })
        .await;

        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    #[tokio::test]
    async fn test_command_out_of_range_responds_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_poller(test_deps(&dir, "pdu44001")).unwrap();

        wait_for(|| handle.shared.identity.read().unwrap().is_some()).await;

        let (tx, rx) = oneshot::channel();
        handle
            .send_command(CommandRequest {
                outlet: 99,
                action: OutletAction::On,
                origin: CommandOrigin::Mqtt,
                respond: Some(tx),
            })
            .await
            .unwrap();

        let response = rx.await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("outlet 99"));

        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    #[tokio::test]
    async fn test_failover_to_secondary_after_thirty_failures() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(&dir, "pdu44001");

        let primary = MockTransport::new();
        let primary_handle = primary.handle();
        let secondary = MockTransport::new();

        let handle = spawn_poller_with_transports(deps, Box::new(primary), Some(Box::new(secondary)));
        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;

        primary_handle.fail_forever();

        wait_for(|| handle.shared.health.read().unwrap().state == HealthState::Recovering).await;
        {
            let health = handle.shared.health.read().unwrap();
            assert_eq!(health.swap_history.len(), 1);
            assert!(health.on_secondary());
        }

        // Metrics resume on the fallback.
        let before = handle
            .shared
            .last_snapshot
            .read()
            .unwrap()
            .as_ref()
            .unwrap()
            .ts;
        wait_for(|| {
            handle
                .shared
                .last_snapshot
                .read()
                .unwrap()
                .as_ref()
                .is_some_and(|s| s.ts > before)
        })
        .await;

        let events = handle.shared.events.lock().unwrap().recent();
        assert!(events.iter().any(|e| e.event_type == EventType::TransportSwap));

        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    #[tokio::test]
    async fn test_lost_without_secondary_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(&dir, "pdu44001");

        let primary = MockTransport::new();
        let primary_handle = primary.handle();
        let handle = spawn_poller_with_transports(deps, Box::new(primary), None);

        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;
        primary_handle.fail_forever();

        wait_for(|| handle.shared.health.read().unwrap().state == HealthState::Lost).await;

        // Recovery: the device answers again.
        primary_handle.recover();
        wait_for(|| handle.shared.health.read().unwrap().state == HealthState::Healthy).await;

        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    #[tokio::test]
    async fn test_reboot_detection_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(&dir, "pdu44001");

        let primary = MockTransport::new();
        let primary_handle = primary.handle();
        let handle = spawn_poller_with_transports(deps, Box::new(primary), None);

        wait_for(|| {
            handle
                .shared
                .last_snapshot
                .read()
                .unwrap()
                .as_ref()
                .is_some_and(|s| s.uptime_ticks.unwrap_or(0) > 200)
        })
        .await;

        primary_handle.reboot();

        wait_for(|| {
            handle
                .shared
                .events
                .lock()
                .unwrap()
                .recent()
                .iter()
                .any(|e| e.event_type == EventType::DeviceReboot)
        })
        .await;

        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    #[tokio::test]
    async fn test_rule_fires_and_restores_through_command_path() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(&dir, "pdu44001");

        let primary = MockTransport::with_ats();
        let primary_handle = primary.handle();
        let handle = spawn_poller_with_transports(deps, Box::new(primary), None);

        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;

        let rule = Rule {
            name: "low".to_string(),
            input: 1,
            condition: "voltage_below".to_string(),
            threshold: Some(serde_json::json!(100.0)),
            outlet: serde_json::json!(5),
            action: crate::rules::RuleAction::Off,
            restore: true,
            delay: 0.0,
            enabled: true,
            days_of_week: None,
            schedule_type: crate::rules::ScheduleType::Continuous,
            condition_since: None,
            triggered: false,
            fired_at: None,
            fire_count: 0,
        };

        let (tx, rx) = oneshot::channel();
        handle
            .send(ControlMsg::RuleAdd { rule, respond: tx })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        // Undervolt source A; the rule must fire and switch outlet 5 off.
        primary_handle.set_source_voltage(pdubridge_common::model::AtsSource::A, 95.0);
        wait_for(|| {
            primary_handle.outlet_state(5) == Some(pdubridge_common::model::OutletState::Off)
        })
        .await;
        assert!(handle
            .shared
            .rules
            .read()
            .unwrap()
            .iter()
            .any(|r| r.name == "low" && r.triggered));

        // Voltage recovers; restore turns the outlet back on.
        primary_handle.set_source_voltage(pdubridge_common::model::AtsSource::A, 230.0);
        wait_for(|| {
            primary_handle.outlet_state(5) == Some(pdubridge_common::model::OutletState::On)
        })
        .await;

        let events = handle.shared.events.lock().unwrap().recent();
        assert!(events.iter().any(|e| e.event_type == EventType::Triggered));
        assert!(events.iter().any(|e| e.event_type == EventType::Restored));

        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    #[tokio::test]
    async fn test_cancelled_poller_drains_fifo_with_cancelled_response() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_poller(test_deps(&dir, "pdu44001")).unwrap();

        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;

        handle.cancel.cancel();
        // The command may land after cancellation; either way a response
        // arrives, either executed or cancelled.
        let (tx, rx) = oneshot::channel();
        let _ = handle
            .send_command(CommandRequest {
                outlet: 1,
                action: OutletAction::Off,
                origin: CommandOrigin::Http,
                respond: Some(tx),
            })
            .await;

        let _ = handle.join.await;
        if let Ok(response) = rx.await {
            assert!(response.success || response.error.as_deref() == Some("cancelled"));
        }
    }

    #[tokio::test]
    async fn test_rules_persist_across_restart() {
        let dir = tempfile::tempdir().unwrap();

        let deps = test_deps(&dir, "pdu44001");
        let data = deps.data.clone();
        let handle = spawn_poller(deps).unwrap();
        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;

        let rule = Rule {
            name: "night".to_string(),
            input: 0,
            condition: "time_between".to_string(),
            threshold: Some(serde_json::json!("22:00-06:00")),
            outlet: serde_json::json!("1-2"),
            action: crate::rules::RuleAction::Off,
            restore: true,
            delay: 0.0,
            enabled: true,
            days_of_week: None,
            schedule_type: crate::rules::ScheduleType::Continuous,
            condition_since: None,
            triggered: false,
            fired_at: None,
            fire_count: 0,
        };
        let (tx, rx) = oneshot::channel();
        handle
            .send(ControlMsg::RuleAdd { rule, respond: tx })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        handle.cancel.cancel();
        let _ = handle.join.await;

        let persisted: Vec<Rule> = data
            .read(&data.rules_path("pdu44001"))
            .unwrap()
            .expect("rules file written");
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].name, "night");
    }

    #[tokio::test]
    async fn test_management_roundtrip_and_security_event() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_poller(test_deps(&dir, "pdu44001")).unwrap();
        wait_for(|| handle.shared.last_snapshot.read().unwrap().is_some()).await;

        let (tx, rx) = oneshot::channel();
        handle
            .send(ControlMsg::Management {
                request: ManagementRequest::CheckDefaultCredentials,
                respond: tx,
            })
            .await
            .unwrap();
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["default_credentials"], true);

        wait_for(|| {
            handle
                .shared
                .events
                .lock()
                .unwrap()
                .recent()
                .iter()
                .any(|e| e.event_type == EventType::SecurityWarning)
        })
        .await;

        handle.cancel.cancel();
        let _ = handle.join.await;
    }
}
