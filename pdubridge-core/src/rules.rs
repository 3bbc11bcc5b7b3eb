//! Automation rules: predicates over snapshots bound to outlet actions.
//!
//! Conditions are a closed sum compiled from the rule's `condition` +
//! `threshold` fields when the rule enters the engine; a rule that fails to
//! compile is rejected up front, and a rule whose condition cannot be
//! evaluated against a live snapshot is disabled with an event rather than
//! stopping the engine.

use chrono::{DateTime, Datelike, Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use pdubridge_common::error::{Error, Result};
use pdubridge_common::model::{AtsSource, Snapshot, current_timestamp_millis};
use pdubridge_transport::OutletAction;

use crate::events::{EventRecord, EventType};

/// Rule action: only on/off make sense as automated outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    On,
    Off,
}

impl RuleAction {
    pub fn to_outlet_action(self) -> OutletAction {
        match self {
            RuleAction::On => OutletAction::On,
            RuleAction::Off => OutletAction::Off,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            RuleAction::On => RuleAction::Off,
            RuleAction::Off => RuleAction::On,
        }
    }
}

/// Re-arm behaviour after a fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    #[default]
    Continuous,
    Oneshot,
}

/// A persisted rule. Runtime state lives with the rule so the automation
/// status topic can publish the full picture in one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,

    /// ATS input the condition reads: 1 = A, 2 = B, 0 = not applicable.
    #[serde(default)]
    pub input: u8,

    pub condition: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<serde_json::Value>,

    /// Outlet spec: scalar `5`, list `"1,3,5"`, range `"1-4"`, or an array.
    pub outlet: serde_json::Value,

    pub action: RuleAction,

    #[serde(default)]
    pub restore: bool,

    /// Seconds the condition must hold continuously before firing.
    #[serde(default)]
    pub delay: f64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Days the rule may fire (0 = Monday); `None` means every day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,

    #[serde(default)]
    pub schedule_type: ScheduleType,

    // Runtime state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_since: Option<i64>,
    #[serde(default)]
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<i64>,
    #[serde(default)]
    pub fire_count: u64,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Validate the rule and compile its condition.
    pub fn compile(&self) -> Result<Condition> {
        Condition::compile(&self.condition, self.threshold.as_ref())
    }

    /// Parse and validate the outlet spec against the device's outlet count
    /// when known.
    pub fn outlets(&self, outlet_count: Option<u32>) -> Result<Vec<u32>> {
        parse_outlet_spec(&self.outlet, outlet_count)
    }

    fn admits_day(&self, now: &DateTime<Local>) -> bool {
        match &self.days_of_week {
            None => true,
            Some(days) => {
                let today = now.weekday().num_days_from_monday() as u8;
                days.contains(&today)
            }
        }
    }
}

/// Closed sum of rule conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    VoltageBelow(f64),
    VoltageAbove(f64),
    AtsSourceIs(AtsSource),
    AtsPreferredLost,
    TimeAfter(NaiveTime),
    TimeBefore(NaiveTime),
    TimeBetween(NaiveTime, NaiveTime),
}

impl Condition {
    pub fn compile(condition: &str, threshold: Option<&serde_json::Value>) -> Result<Self> {
        match condition {
            "voltage_below" => Ok(Condition::VoltageBelow(threshold_number(threshold)?)),
            "voltage_above" => Ok(Condition::VoltageAbove(threshold_number(threshold)?)),
            "ats_source_is" => {
                let s = threshold_string(threshold)?;
                match s.as_str() {
                    "A" | "a" => Ok(Condition::AtsSourceIs(AtsSource::A)),
                    "B" | "b" => Ok(Condition::AtsSourceIs(AtsSource::B)),
                    other => Err(Error::rule(format!(
                        "ats_source_is threshold must be 'A' or 'B', got '{}'",
                        other
                    ))),
                }
            }
            "ats_preferred_lost" => Ok(Condition::AtsPreferredLost),
            "time_after" => Ok(Condition::TimeAfter(parse_time(&threshold_string(threshold)?)?)),
            "time_before" => Ok(Condition::TimeBefore(parse_time(&threshold_string(threshold)?)?)),
            "time_between" => {
                let s = threshold_string(threshold)?;
                let (start, end) = s.split_once('-').ok_or_else(|| {
                    Error::rule(format!(
                        "time_between threshold must be 'hh:mm-hh:mm', got '{}'",
                        s
                    ))
                })?;
                Ok(Condition::TimeBetween(parse_time(start)?, parse_time(end)?))
            }
            other => Err(Error::rule(format!("unknown condition '{}'", other))),
        }
    }

    /// Evaluate against a snapshot. `Err` means the snapshot cannot support
    /// this condition (the caller disables the rule).
    pub fn evaluate(&self, snapshot: &Snapshot, input: u8, now: &DateTime<Local>) -> Result<bool> {
        match self {
            Condition::VoltageBelow(threshold) => {
                let voltage = snapshot.source_voltage(input).ok_or_else(|| {
                    Error::rule("no voltage reading available for this input")
                })?;
                Ok(voltage < *threshold)
            }
            Condition::VoltageAbove(threshold) => {
                let voltage = snapshot.source_voltage(input).ok_or_else(|| {
                    Error::rule("no voltage reading available for this input")
                })?;
                Ok(voltage > *threshold)
            }
            Condition::AtsSourceIs(source) => {
                let ats = snapshot
                    .ats
                    .as_ref()
                    .ok_or_else(|| Error::rule("device has no ATS section"))?;
                Ok(ats.current_source == *source)
            }
            Condition::AtsPreferredLost => {
                let ats = snapshot
                    .ats
                    .as_ref()
                    .ok_or_else(|| Error::rule("device has no ATS section"))?;
                Ok(ats.current_source != ats.preferred_source)
            }
            Condition::TimeAfter(time) => Ok(minute_of(now) >= minute_of_time(time)),
            Condition::TimeBefore(time) => Ok(minute_of(now) < minute_of_time(time)),
            Condition::TimeBetween(start, end) => {
                let t = minute_of(now);
                let start = minute_of_time(start);
                let end = minute_of_time(end);
                // Inclusive of start, exclusive of end; wraps across midnight.
                Ok(if start < end {
                    t >= start && t < end
                } else if start > end {
                    t >= start || t < end
                } else {
                    false
                })
            }
        }
    }
}

fn minute_of(now: &DateTime<Local>) -> u32 {
    now.hour() * 60 + now.minute()
}

fn minute_of_time(t: &NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn threshold_number(threshold: Option<&serde_json::Value>) -> Result<f64> {
    threshold
        .and_then(|v| v.as_f64())
        .ok_or_else(|| Error::rule("condition requires a numeric threshold"))
}

fn threshold_string(threshold: Option<&serde_json::Value>) -> Result<String> {
    threshold
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::rule("condition requires a string threshold"))
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| Error::rule(format!("invalid time '{}', expected hh:mm", s)))
}

/// Parse an outlet spec (`5`, `"1-4"`, `"1,3,5"`, `[1,3]`) into unique,
/// ascending outlet numbers.
pub fn parse_outlet_spec(
    spec: &serde_json::Value,
    outlet_count: Option<u32>,
) -> Result<Vec<u32>> {
    let mut outlets: Vec<u32> = match spec {
        serde_json::Value::Number(n) => {
            vec![n
                .as_u64()
                .ok_or_else(|| Error::rule("outlet must be a positive integer"))?
                as u32]
        }
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .map(|n| n as u32)
                    .ok_or_else(|| Error::rule("outlet list must contain integers"))
            })
            .collect::<Result<_>>()?,
        serde_json::Value::String(s) => parse_outlet_string(s)?,
        _ => return Err(Error::rule("outlet must be a number, string or list")),
    };

    outlets.sort_unstable();
    outlets.dedup();

    if outlets.is_empty() {
        return Err(Error::rule("outlet spec selects no outlets"));
    }
    if outlets.iter().any(|&n| n == 0) {
        return Err(Error::rule("outlet numbers start at 1"));
    }
    if let Some(max) = outlet_count {
        if let Some(&n) = outlets.iter().find(|&&n| n > max) {
            return Err(Error::rule(format!(
                "outlet {} exceeds the device's {} outlets",
                n, max
            )));
        }
    }

    Ok(outlets)
}

fn parse_outlet_string(s: &str) -> Result<Vec<u32>> {
    let s = s.trim();
    if let Some((a, b)) = s.split_once('-') {
        let a: u32 = a
            .trim()
            .parse()
            .map_err(|_| Error::rule(format!("invalid outlet range '{}'", s)))?;
        let b: u32 = b
            .trim()
            .parse()
            .map_err(|_| Error::rule(format!("invalid outlet range '{}'", s)))?;
        if a > b {
            return Err(Error::rule(format!("outlet range '{}' is reversed", s)));
        }
        return Ok((a..=b).collect());
    }

    s.split(',')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| Error::rule(format!("invalid outlet '{}'", part.trim())))
        })
        .collect()
}

/// An action the engine wants executed.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleIntent {
    pub rule_name: String,
    pub outlets: Vec<u32>,
    pub action: OutletAction,
    pub restore: bool,
}

/// Result of evaluating one snapshot.
#[derive(Debug, Default)]
pub struct EvalOutcome {
    pub intents: Vec<RuleIntent>,
    pub events: Vec<EventRecord>,
    /// True when any rule's published state changed.
    pub changed: bool,
}

struct CompiledRule {
    rule: Rule,
    /// `None` when the persisted rule no longer compiles; it stays visible
    /// but cannot run until an update or toggle recompiles it.
    condition: Option<Condition>,
}

/// Per-device rule set with delay/restore/oneshot semantics.
pub struct AutomationEngine {
    device_id: String,
    rules: Vec<CompiledRule>,
}

impl AutomationEngine {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            rules: Vec::new(),
        }
    }

    /// Load persisted rules; a rule that no longer compiles is kept but
    /// disabled so the user can fix it over HTTP.
    pub fn load(device_id: impl Into<String>, rules: Vec<Rule>) -> (Self, Vec<EventRecord>) {
        let device_id = device_id.into();
        let mut engine = Self::new(device_id.clone());
        let mut events = Vec::new();

        for mut rule in rules {
            match rule.compile() {
                Ok(condition) => engine.rules.push(CompiledRule {
                    rule,
                    condition: Some(condition),
                }),
                Err(e) => {
                    tracing::warn!(
                        device = %device_id,
                        rule = %rule.name,
                        error = %e,
                        "Disabling rule that failed to compile"
                    );
                    events.push(
                        EventRecord::new(
                            &device_id,
                            EventType::Updated,
                            format!("rule disabled: {}", e),
                        )
                        .with_rule(&rule.name),
                    );
                    rule.enabled = false;
                    // Keep the raw rule visible even though it cannot run.
                    engine.rules.push(CompiledRule {
                        rule,
                        condition: None,
                    });
                }
            }
        }

        (engine, events)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|c| c.rule.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().map(|c| &c.rule).find(|r| r.name == name)
    }

    /// Add a rule. Names are unique per device.
    pub fn add(&mut self, rule: Rule, outlet_count: Option<u32>) -> Result<EventRecord> {
        if self.get(&rule.name).is_some() {
            return Err(Error::conflict(format!("rule '{}' already exists", rule.name)));
        }
        let condition = rule.compile()?;
        rule.outlets(outlet_count)?;

        let event = EventRecord::new(&self.device_id, EventType::Created, "rule created")
            .with_rule(&rule.name);
        self.rules.push(CompiledRule {
            rule,
            condition: Some(condition),
        });
        Ok(event)
    }

    /// Replace a rule, resetting its runtime state.
    pub fn update(&mut self, mut rule: Rule, outlet_count: Option<u32>) -> Result<EventRecord> {
        let condition = rule.compile()?;
        rule.outlets(outlet_count)?;

        let existing = self
            .rules
            .iter_mut()
            .find(|c| c.rule.name == rule.name)
            .ok_or_else(|| Error::not_found(format!("rule '{}'", rule.name)))?;

        rule.condition_since = None;
        rule.triggered = false;
        existing.rule = rule;
        existing.condition = Some(condition);

        Ok(EventRecord::new(&self.device_id, EventType::Updated, "rule updated")
            .with_rule(&existing.rule.name))
    }

    pub fn remove(&mut self, name: &str) -> Result<EventRecord> {
        let before = self.rules.len();
        self.rules.retain(|c| c.rule.name != name);
        if self.rules.len() == before {
            return Err(Error::not_found(format!("rule '{}'", name)));
        }
        Ok(EventRecord::new(&self.device_id, EventType::Deleted, "rule deleted").with_rule(name))
    }

    pub fn toggle(&mut self, name: &str) -> Result<(bool, EventRecord)> {
        let compiled = self
            .rules
            .iter_mut()
            .find(|c| c.rule.name == name)
            .ok_or_else(|| Error::not_found(format!("rule '{}'", name)))?;

        // Re-enabling a rule that failed to compile at load must recompile.
        if !compiled.rule.enabled && compiled.condition.is_none() {
            compiled.condition = Some(compiled.rule.compile()?);
        }

        compiled.rule.enabled = !compiled.rule.enabled;
        if !compiled.rule.enabled {
            compiled.rule.condition_since = None;
        }
        let enabled = compiled.rule.enabled;
        let event = EventRecord::new(
            &self.device_id,
            EventType::Updated,
            if enabled { "rule enabled" } else { "rule disabled" },
        )
        .with_rule(name);
        Ok((enabled, event))
    }

    /// Evaluate every enabled rule against a fresh snapshot.
    pub fn evaluate(&mut self, snapshot: &Snapshot, now: DateTime<Local>) -> EvalOutcome {
        let now_ms = current_timestamp_millis();
        let mut outcome = EvalOutcome::default();

        for compiled in &mut self.rules {
            let rule = &mut compiled.rule;
            if !rule.enabled || !rule.admits_day(&now) {
                continue;
            }
            let Some(condition) = &compiled.condition else {
                continue;
            };

            let holds = match condition.evaluate(snapshot, rule.input, &now) {
                Ok(holds) => holds,
                Err(e) => {
                    rule.enabled = false;
                    rule.condition_since = None;
                    outcome.changed = true;
                    outcome.events.push(
                        EventRecord::new(
                            &self.device_id,
                            EventType::Updated,
                            format!("rule disabled: {}", e),
                        )
                        .with_rule(&rule.name),
                    );
                    continue;
                }
            };

            if holds {
                if rule.condition_since.is_none() {
                    rule.condition_since = Some(now_ms);
                    outcome.changed = true;
                }
                let since = rule.condition_since.unwrap_or(now_ms);
                let held_secs = (now_ms - since) as f64 / 1000.0;

                if !rule.triggered && held_secs >= rule.delay {
                    rule.triggered = true;
                    rule.fired_at = Some(now_ms);
                    rule.fire_count += 1;
                    outcome.changed = true;

                    let outlets = rule.outlets(None).unwrap_or_default();
                    outcome.intents.push(RuleIntent {
                        rule_name: rule.name.clone(),
                        outlets,
                        action: rule.action.to_outlet_action(),
                        restore: false,
                    });
                    outcome.events.push(
                        EventRecord::new(
                            &self.device_id,
                            EventType::Triggered,
                            format!("condition held {:.1}s, outlet {} -> {}",
                                held_secs, rule.outlet, rule.action.to_outlet_action()),
                        )
                        .with_rule(&rule.name),
                    );

                    if rule.schedule_type == ScheduleType::Oneshot {
                        rule.enabled = false;
                    }
                }
            } else {
                if rule.condition_since.take().is_some() {
                    outcome.changed = true;
                }

                if rule.triggered {
                    rule.triggered = false;
                    outcome.changed = true;

                    if rule.restore {
                        let outlets = rule.outlets(None).unwrap_or_default();
                        outcome.intents.push(RuleIntent {
                            rule_name: rule.name.clone(),
                            outlets,
                            action: rule.action.inverse().to_outlet_action(),
                            restore: true,
                        });
                        outcome.events.push(
                            EventRecord::new(
                                &self.device_id,
                                EventType::Restored,
                                format!("condition cleared, outlet {} -> {}",
                                    rule.outlet, rule.action.inverse().to_outlet_action()),
                            )
                            .with_rule(&rule.name),
                        );
                    }
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pdubridge_common::model::{BankMetrics, LoadState};

    fn snapshot_with_voltage(voltage: f64) -> Snapshot {
        let mut snap = Snapshot::empty();
        snap.banks.push(BankMetrics {
            bank: 1,
            current: 1.0,
            load_state: LoadState::Normal,
            voltage: Some(voltage),
            power: None,
            apparent_power: None,
            power_factor: None,
            energy: None,
        });
        snap
    }

    fn low_voltage_rule(delay: f64) -> Rule {
        Rule {
            name: "low".to_string(),
            input: 1,
            condition: "voltage_below".to_string(),
            threshold: Some(serde_json::json!(100.0)),
            outlet: serde_json::json!(5),
            action: RuleAction::Off,
            restore: true,
            delay,
            enabled: true,
            days_of_week: None,
            schedule_type: ScheduleType::Continuous,
            condition_since: None,
            triggered: false,
            fired_at: None,
            fire_count: 0,
        }
    }

    fn local_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 7, 29, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_outlet_spec_grammar() {
        let max = Some(8);
        assert_eq!(
            parse_outlet_spec(&serde_json::json!("1-4"), max).unwrap(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(
            parse_outlet_spec(&serde_json::json!("1,3,5"), max).unwrap(),
            vec![1, 3, 5]
        );
        assert_eq!(parse_outlet_spec(&serde_json::json!(7), max).unwrap(), vec![7]);
        assert_eq!(
            parse_outlet_spec(&serde_json::json!([3, 1, 3]), max).unwrap(),
            vec![1, 3]
        );
        assert!(parse_outlet_spec(&serde_json::json!("0"), max).is_err());
        assert!(parse_outlet_spec(&serde_json::json!(9), max).is_err());
        assert!(parse_outlet_spec(&serde_json::json!("4-1"), max).is_err());
    }

    #[test]
    fn test_time_between_midnight_wrap() {
        let cond = Condition::compile(
            "time_between",
            Some(&serde_json::json!("22:00-06:00")),
        )
        .unwrap();
        let snap = Snapshot::empty();

        let at = |h, m| Local.with_ymd_and_hms(2026, 7, 29, h, m, 0).unwrap();
        assert!(cond.evaluate(&snap, 0, &at(23, 59)).unwrap());
        assert!(cond.evaluate(&snap, 0, &at(5, 59)).unwrap());
        assert!(cond.evaluate(&snap, 0, &at(22, 0)).unwrap());
        assert!(!cond.evaluate(&snap, 0, &at(6, 0)).unwrap());
        assert!(!cond.evaluate(&snap, 0, &at(12, 0)).unwrap());
    }

    #[test]
    fn test_condition_compile_errors() {
        assert!(Condition::compile("voltage_below", None).is_err());
        assert!(Condition::compile("voltage_below", Some(&serde_json::json!("x"))).is_err());
        assert!(Condition::compile("ats_source_is", Some(&serde_json::json!("C"))).is_err());
        assert!(Condition::compile("time_between", Some(&serde_json::json!("22:00"))).is_err());
        assert!(Condition::compile("does_not_exist", None).is_err());
    }

    #[test]
    fn test_rule_fires_without_delay() {
        let mut engine = AutomationEngine::new("d1");
        engine.add(low_voltage_rule(0.0), Some(8)).unwrap();

        let outcome = engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        assert_eq!(outcome.intents.len(), 1);
        assert_eq!(outcome.intents[0].outlets, vec![5]);
        assert_eq!(outcome.intents[0].action, OutletAction::Off);
        assert!(engine.get("low").unwrap().triggered);
        assert_eq!(engine.get("low").unwrap().fire_count, 1);
    }

    #[test]
    fn test_rule_delay_holds_fire() {
        let mut engine = AutomationEngine::new("d1");
        engine.add(low_voltage_rule(5.0), Some(8)).unwrap();

        // First true sample starts the window but must not fire.
        let outcome = engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        assert!(outcome.intents.is_empty());
        assert!(engine.get("low").unwrap().condition_since.is_some());

        // A false sample resets the window.
        engine.evaluate(&snapshot_with_voltage(120.0), local_now());
        assert!(engine.get("low").unwrap().condition_since.is_none());
    }

    #[test]
    fn test_rule_delay_elapsed_fires() {
        let mut engine = AutomationEngine::new("d1");
        engine.add(low_voltage_rule(5.0), Some(8)).unwrap();

        engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        // Backdate the window start to simulate the delay elapsing.
        engine.rules[0].rule.condition_since =
            Some(current_timestamp_millis() - 6000);

        let outcome = engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        assert_eq!(outcome.intents.len(), 1);
        assert!(engine.get("low").unwrap().triggered);
    }

    #[test]
    fn test_rule_restore_emits_inverse() {
        let mut engine = AutomationEngine::new("d1");
        engine.add(low_voltage_rule(0.0), Some(8)).unwrap();

        engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        let outcome = engine.evaluate(&snapshot_with_voltage(120.0), local_now());

        assert_eq!(outcome.intents.len(), 1);
        assert_eq!(outcome.intents[0].action, OutletAction::On);
        assert!(outcome.intents[0].restore);
        assert!(!engine.get("low").unwrap().triggered);
        assert!(outcome
            .events
            .iter()
            .any(|e| e.event_type == EventType::Restored));

        // Continuous rules re-arm.
        let outcome = engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        assert_eq!(outcome.intents.len(), 1);
    }

    #[test]
    fn test_oneshot_disables_after_fire() {
        let mut rule = low_voltage_rule(0.0);
        rule.schedule_type = ScheduleType::Oneshot;
        rule.restore = false;

        let mut engine = AutomationEngine::new("d1");
        engine.add(rule, Some(8)).unwrap();

        let outcome = engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        assert_eq!(outcome.intents.len(), 1);
        assert!(!engine.get("low").unwrap().enabled);

        let outcome = engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        assert!(outcome.intents.is_empty());
    }

    #[test]
    fn test_day_of_week_window() {
        let mut rule = low_voltage_rule(0.0);
        // 2026-07-29 is a Wednesday (day 2).
        rule.days_of_week = Some(vec![5, 6]);

        let mut engine = AutomationEngine::new("d1");
        engine.add(rule, Some(8)).unwrap();

        let outcome = engine.evaluate(&snapshot_with_voltage(95.0), local_now());
        assert!(outcome.intents.is_empty());
    }

    #[test]
    fn test_unsupported_condition_disables_rule() {
        let mut rule = low_voltage_rule(0.0);
        rule.condition = "ats_preferred_lost".to_string();
        rule.threshold = None;

        let mut engine = AutomationEngine::new("d1");
        engine.add(rule, Some(8)).unwrap();

        // Snapshot without an ATS block cannot support the condition.
        let outcome = engine.evaluate(&snapshot_with_voltage(230.0), local_now());
        assert!(outcome.intents.is_empty());
        assert!(!engine.get("low").unwrap().enabled);
        assert_eq!(outcome.events.len(), 1);
    }

    #[test]
    fn test_duplicate_name_conflict() {
        let mut engine = AutomationEngine::new("d1");
        engine.add(low_voltage_rule(0.0), Some(8)).unwrap();
        assert!(matches!(
            engine.add(low_voltage_rule(0.0), Some(8)),
            Err(Error::Conflict(_))
        ));
    }
}
