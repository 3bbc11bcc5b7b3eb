//! PDU Bridge Core
//!
//! Services shared by the bridge binary:
//! - [`mqtt`] - broker link with offline queue and topic dispatch
//! - [`history`] - SQLite-backed sample store with downsampled queries
//! - [`rules`] - automation engine
//! - [`poller`] - per-device poll loop with transport failover
//! - [`manager`] - poller supervisor and shared-service owner
//! - [`events`] - bounded per-device event rings
//! - [`health`] - transport health state machine and aggregation
//! - [`persist`] - atomic JSON documents under the data directory
//! - [`discovery`] - Home Assistant discovery payloads

pub mod discovery;
pub mod events;
pub mod health;
pub mod history;
pub mod manager;
pub mod mqtt;
pub mod persist;
pub mod poller;
pub mod rules;

pub use events::{EVENT_RING_CAPACITY, EventRecord, EventRing, EventType};
pub use health::{
    BridgeStatus, DeviceHealth, FailureDecision, HealthReport, HealthState, TransportHealth,
};
pub use history::{
    BankPoint, BankSample, HistoryStore, OutletPoint, OutletSample, Sample, WeeklyReport,
    bucket_seconds, samples_from_snapshot,
};
pub use manager::BridgeManager;
pub use mqtt::{MessageHandler, MqttLink, MqttSettings, QoS};
pub use persist::DataDir;
pub use poller::{
    CommandOrigin, CommandRequest, CommandResponse, ControlMsg, ManagementRequest, PollerDeps,
    PollerHandle, PollerShared, RecoveryScanner, spawn_poller, spawn_poller_with_transports,
    status_payload,
};
pub use rules::{
    AutomationEngine, Condition, EvalOutcome, Rule, RuleAction, RuleIntent, ScheduleType,
    parse_outlet_spec,
};
