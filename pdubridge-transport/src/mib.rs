//! CyberPower ePDU MIB object identifiers and the raw-value decoders.
//!
//! The decoders are total functions over a [`RawValues`] map: an OID that is
//! absent (device capability missing, agent variant) leaves the corresponding
//! optional snapshot field unset. Nothing in here performs I/O.

use std::collections::{BTreeMap, HashMap};

use pdubridge_common::model::{
    AtsBlock, AtsSource, BankMetrics, ColdstartState, ContactReading, ContactState,
    EnvironmentBlock, Identity, InputMetrics, LoadState, OutletMetrics, OutletState, Snapshot,
    SourceMetrics, SourceStatus, RedundancyStatus, Totals, current_timestamp_millis,
    scale_current, scale_hundredths, scale_power, scale_tenths,
};

// --- MIB-II system group ---

pub const SYS_DESCR: &str = "1.3.6.1.2.1.1.1.0";
pub const SYS_UPTIME: &str = "1.3.6.1.2.1.1.3.0";
pub const SYS_NAME: &str = "1.3.6.1.2.1.1.5.0";

// --- ePDU identity (1.3.6.1.4.1.3808.1.1.3.1) ---

pub const EPDU_ROOT: &str = "1.3.6.1.4.1.3808.1.1.3";

pub const IDENT_NAME: &str = "1.3.6.1.4.1.3808.1.1.3.1.1.0";
pub const IDENT_HARDWARE_REV: &str = "1.3.6.1.4.1.3808.1.1.3.1.2.0";
pub const IDENT_FIRMWARE_REV: &str = "1.3.6.1.4.1.3808.1.1.3.1.3.0";
pub const IDENT_MODEL: &str = "1.3.6.1.4.1.3808.1.1.3.1.5.0";
pub const IDENT_SERIAL: &str = "1.3.6.1.4.1.3808.1.1.3.1.6.0";
pub const IDENT_NUM_OUTLETS: &str = "1.3.6.1.4.1.3808.1.1.3.1.8.0";
pub const IDENT_NUM_PHASES: &str = "1.3.6.1.4.1.3808.1.1.3.1.9.0";
pub const IDENT_MAX_CURRENT: &str = "1.3.6.1.4.1.3808.1.1.3.1.10.0";

// --- Device-level aggregates and input feed ---

pub const DEVICE_TOTAL_LOAD: &str = "1.3.6.1.4.1.3808.1.1.3.2.1.1.0";
pub const DEVICE_TOTAL_POWER: &str = "1.3.6.1.4.1.3808.1.1.3.2.1.2.0";
pub const DEVICE_TOTAL_ENERGY: &str = "1.3.6.1.4.1.3808.1.1.3.2.1.3.0";
pub const INPUT_VOLTAGE: &str = "1.3.6.1.4.1.3808.1.1.3.2.6.1.0";
pub const INPUT_FREQUENCY: &str = "1.3.6.1.4.1.3808.1.1.3.2.6.2.0";

// --- Cold-start behaviour ---

pub const COLDSTART_DELAY: &str = "1.3.6.1.4.1.3808.1.1.3.3.1.5.0";
pub const COLDSTART_STATE: &str = "1.3.6.1.4.1.3808.1.1.3.3.1.6.0";

// --- Bank (load status) table: {table}.{column}.{index} ---

pub const LOAD_TABLE: &str = "1.3.6.1.4.1.3808.1.1.3.2.3.1.1";
pub const LOAD_COL_CURRENT: u32 = 2;
pub const LOAD_COL_STATE: u32 = 3;
pub const LOAD_COL_BANK: u32 = 5;
pub const LOAD_COL_VOLTAGE: u32 = 6;
pub const LOAD_COL_POWER: u32 = 7;
pub const LOAD_COL_APPARENT: u32 = 8;
pub const LOAD_COL_PF: u32 = 9;
pub const LOAD_COL_ENERGY: u32 = 10;

// --- Outlet status and metering tables ---

pub const OUTLET_STATUS_TABLE: &str = "1.3.6.1.4.1.3808.1.1.3.3.5.1.1";
pub const OUTLET_COL_NAME: u32 = 2;
pub const OUTLET_COL_STATE: u32 = 4;

pub const OUTLET_METER_TABLE: &str = "1.3.6.1.4.1.3808.1.1.3.3.6.1.1";
pub const METER_COL_CURRENT: u32 = 4;
pub const METER_COL_POWER: u32 = 5;
pub const METER_COL_ENERGY: u32 = 6;

/// Outlet control column; append `.{outlet}` and write the command code.
pub const OUTLET_CONTROL_COMMAND: &str = "1.3.6.1.4.1.3808.1.1.3.3.3.1.1.4";

// --- ATS section (1.3.6.1.4.1.3808.1.1.6) ---

pub const ATS_PREFERRED_SOURCE: &str = "1.3.6.1.4.1.3808.1.1.6.2.1.0";
pub const ATS_CURRENT_SOURCE: &str = "1.3.6.1.4.1.3808.1.1.6.2.2.0";
pub const ATS_AUTO_TRANSFER: &str = "1.3.6.1.4.1.3808.1.1.6.2.3.0";
pub const ATS_REDUNDANCY: &str = "1.3.6.1.4.1.3808.1.1.6.2.4.0";
pub const ATS_SENSITIVITY: &str = "1.3.6.1.4.1.3808.1.1.6.5.1.0";
pub const ATS_TRANSFER_VOLTAGE: &str = "1.3.6.1.4.1.3808.1.1.6.5.2.0";
pub const ATS_VOLTAGE_UPPER: &str = "1.3.6.1.4.1.3808.1.1.6.5.3.0";
pub const ATS_VOLTAGE_LOWER: &str = "1.3.6.1.4.1.3808.1.1.6.5.4.0";

/// Per-source ePDU2 table: {table}.{column}.{source index}.
pub const SOURCE_TABLE: &str = "1.3.6.1.4.1.3808.1.1.6.9.4.1";
pub const SOURCE_COL_VOLTAGE: u32 = 2;
pub const SOURCE_COL_FREQUENCY: u32 = 3;
pub const SOURCE_COL_STATUS: u32 = 4;

// --- Environment probe (1.3.6.1.4.1.3808.1.1.4) ---

pub const ENV_TEMPERATURE: &str = "1.3.6.1.4.1.3808.1.1.4.2.1.0";
pub const ENV_HUMIDITY: &str = "1.3.6.1.4.1.3808.1.1.4.2.2.0";
pub const ENV_CONTACT_TABLE: &str = "1.3.6.1.4.1.3808.1.1.4.3.1.1";
pub const CONTACT_COL_STATE: u32 = 2;

/// A raw value read from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Int(i64),
    Str(String),
}

impl RawValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RawValue::Int(n) => Some(*n),
            RawValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::Str(s) => Some(s),
            RawValue::Int(_) => None,
        }
    }
}

/// Everything one poll cycle read, keyed by dotted OID string.
pub type RawValues = HashMap<String, RawValue>;

fn get_int(raw: &RawValues, oid: &str) -> Option<i64> {
    raw.get(oid).and_then(RawValue::as_int)
}

fn get_str(raw: &RawValues, oid: &str) -> Option<String> {
    raw.get(oid).and_then(|v| v.as_str().map(str::to_owned))
}

/// Group table cells `{table}.{column}.{index}` into rows keyed by index.
fn table_rows<'a>(
    raw: &'a RawValues,
    table: &str,
) -> BTreeMap<u32, HashMap<u32, &'a RawValue>> {
    let prefix = format!("{}.", table);
    let mut rows: BTreeMap<u32, HashMap<u32, &RawValue>> = BTreeMap::new();

    for (oid, value) in raw {
        let Some(rest) = oid.strip_prefix(&prefix) else {
            continue;
        };
        let mut parts = rest.splitn(2, '.');
        let (Some(col), Some(index)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(col), Ok(index)) = (col.parse::<u32>(), index.parse::<u32>()) else {
            continue;
        };
        rows.entry(index).or_default().insert(col, value);
    }

    rows
}

fn row_int(row: &HashMap<u32, &RawValue>, col: u32) -> Option<i64> {
    row.get(&col).and_then(|v| v.as_int())
}

fn row_str(row: &HashMap<u32, &RawValue>, col: u32) -> Option<String> {
    row.get(&col).and_then(|v| v.as_str().map(str::to_owned))
}

/// Decode the identity block. Returns `None` when the agent answered none of
/// the identity OIDs (wrong device family).
pub fn decode_identity(raw: &RawValues) -> Option<Identity> {
    let serial = get_str(raw, IDENT_SERIAL)?;
    let model = get_str(raw, IDENT_MODEL).unwrap_or_default();
    let firmware = get_str(raw, IDENT_FIRMWARE_REV).unwrap_or_default();

    Some(Identity {
        serial,
        model,
        firmware,
        hardware: get_str(raw, IDENT_HARDWARE_REV),
        outlet_count: get_int(raw, IDENT_NUM_OUTLETS).unwrap_or(0) as u32,
        phase_count: get_int(raw, IDENT_NUM_PHASES).unwrap_or(1) as u32,
        max_input_amps: get_int(raw, IDENT_MAX_CURRENT).map(scale_tenths),
    })
}

/// Decode one cycle's raw values into a snapshot.
pub fn decode_snapshot(raw: &RawValues, identity: Option<Identity>) -> Snapshot {
    let mut snap = Snapshot::empty();
    snap.ts = current_timestamp_millis();
    snap.identity = identity;
    snap.uptime_ticks = get_int(raw, SYS_UPTIME).map(|n| n.max(0) as u64);

    if let Some(voltage) = get_int(raw, INPUT_VOLTAGE) {
        snap.input = Some(InputMetrics {
            voltage: scale_tenths(voltage),
            frequency: get_int(raw, INPUT_FREQUENCY).map(scale_tenths).unwrap_or(0.0),
        });
    }

    snap.banks = decode_banks(raw);
    snap.outlets = decode_outlets(raw);
    snap.ats = decode_ats(raw);
    snap.environment = decode_environment(raw);

    snap.coldstart_delay = get_int(raw, COLDSTART_DELAY);
    snap.coldstart_state = get_int(raw, COLDSTART_STATE).and_then(|n| match n {
        1 => Some(ColdstartState::AllOn),
        2 => Some(ColdstartState::PrevState),
        _ => None,
    });

    snap.totals = Totals {
        load: get_int(raw, DEVICE_TOTAL_LOAD).map(scale_current),
        power: get_int(raw, DEVICE_TOTAL_POWER).map(scale_power),
        energy: get_int(raw, DEVICE_TOTAL_ENERGY).map(scale_tenths),
    };

    snap
}

fn decode_banks(raw: &RawValues) -> Vec<BankMetrics> {
    let mut banks = Vec::new();

    for (index, row) in table_rows(raw, LOAD_TABLE) {
        let Some(current) = row_int(&row, LOAD_COL_CURRENT) else {
            continue;
        };
        let bank = row_int(&row, LOAD_COL_BANK).unwrap_or(index as i64) as u32;

        banks.push(BankMetrics {
            bank,
            current: scale_current(current),
            load_state: row_int(&row, LOAD_COL_STATE)
                .and_then(LoadState::from_raw)
                .unwrap_or(LoadState::Normal),
            voltage: row_int(&row, LOAD_COL_VOLTAGE).map(scale_tenths),
            power: row_int(&row, LOAD_COL_POWER).map(scale_power),
            apparent_power: row_int(&row, LOAD_COL_APPARENT).map(scale_power),
            power_factor: row_int(&row, LOAD_COL_PF).map(scale_hundredths),
            energy: row_int(&row, LOAD_COL_ENERGY).map(scale_tenths),
        });
    }

    banks
}

fn decode_outlets(raw: &RawValues) -> Vec<OutletMetrics> {
    let meter_rows = table_rows(raw, OUTLET_METER_TABLE);
    let mut outlets = Vec::new();

    for (index, row) in table_rows(raw, OUTLET_STATUS_TABLE) {
        let state = match row_int(&row, OUTLET_COL_STATE) {
            Some(1) => OutletState::On,
            Some(2) => OutletState::Off,
            _ => continue,
        };

        let meter = meter_rows.get(&index);

        outlets.push(OutletMetrics {
            outlet: index,
            state,
            name: row_str(&row, OUTLET_COL_NAME).unwrap_or_else(|| format!("Outlet {}", index)),
            current: meter
                .and_then(|m| row_int(m, METER_COL_CURRENT))
                .map(scale_current),
            power: meter
                .and_then(|m| row_int(m, METER_COL_POWER))
                .map(scale_power),
            energy: meter
                .and_then(|m| row_int(m, METER_COL_ENERGY))
                .map(scale_tenths),
        });
    }

    outlets
}

fn decode_ats(raw: &RawValues) -> Option<AtsBlock> {
    let preferred = get_int(raw, ATS_PREFERRED_SOURCE).and_then(AtsSource::from_raw)?;
    let current = get_int(raw, ATS_CURRENT_SOURCE).and_then(AtsSource::from_raw)?;

    let sources = table_rows(raw, SOURCE_TABLE);
    let source = |idx: u32| -> SourceMetrics {
        let Some(row) = sources.get(&idx) else {
            return SourceMetrics::default();
        };
        SourceMetrics {
            voltage: row_int(row, SOURCE_COL_VOLTAGE).map(scale_tenths),
            frequency: row_int(row, SOURCE_COL_FREQUENCY).map(scale_tenths),
            status: row_int(row, SOURCE_COL_STATUS).and_then(SourceStatus::from_raw),
        }
    };

    Some(AtsBlock {
        preferred_source: preferred,
        current_source: current,
        auto_transfer: get_int(raw, ATS_AUTO_TRANSFER) == Some(1),
        redundancy: if get_int(raw, ATS_REDUNDANCY) == Some(2) {
            RedundancyStatus::Lost
        } else {
            RedundancyStatus::Ok
        },
        source_a: source(1),
        source_b: source(2),
        voltage_sensitivity: get_str(raw, ATS_SENSITIVITY),
        transfer_voltage: get_int(raw, ATS_TRANSFER_VOLTAGE).map(scale_tenths),
        voltage_upper_limit: get_int(raw, ATS_VOLTAGE_UPPER).map(scale_tenths),
        voltage_lower_limit: get_int(raw, ATS_VOLTAGE_LOWER).map(scale_tenths),
    })
}

fn decode_environment(raw: &RawValues) -> Option<EnvironmentBlock> {
    let temperature = get_int(raw, ENV_TEMPERATURE).map(scale_tenths);
    let humidity = get_int(raw, ENV_HUMIDITY).map(scale_tenths);

    let mut contacts = Vec::new();
    for (index, row) in table_rows(raw, ENV_CONTACT_TABLE) {
        let state = match row_int(&row, CONTACT_COL_STATE) {
            Some(1) => ContactState::Open,
            Some(2) => ContactState::Closed,
            _ => continue,
        };
        contacts.push(ContactReading {
            contact: index,
            state,
        });
    }

    if temperature.is_none() && humidity.is_none() && contacts.is_empty() {
        return None;
    }

    Some(EnvironmentBlock {
        temperature,
        humidity,
        contacts,
    })
}

/// Scalar OIDs read on every cycle.
pub fn poll_scalars() -> Vec<&'static str> {
    vec![
        SYS_UPTIME,
        INPUT_VOLTAGE,
        INPUT_FREQUENCY,
        DEVICE_TOTAL_LOAD,
        DEVICE_TOTAL_POWER,
        DEVICE_TOTAL_ENERGY,
        COLDSTART_DELAY,
        COLDSTART_STATE,
        ATS_PREFERRED_SOURCE,
        ATS_CURRENT_SOURCE,
        ATS_AUTO_TRANSFER,
        ATS_REDUNDANCY,
        ATS_SENSITIVITY,
        ATS_TRANSFER_VOLTAGE,
        ATS_VOLTAGE_UPPER,
        ATS_VOLTAGE_LOWER,
        ENV_TEMPERATURE,
        ENV_HUMIDITY,
    ]
}

/// Table subtrees walked on every cycle.
pub fn poll_walks() -> Vec<&'static str> {
    vec![
        LOAD_TABLE,
        OUTLET_STATUS_TABLE,
        OUTLET_METER_TABLE,
        SOURCE_TABLE,
        ENV_CONTACT_TABLE,
    ]
}

/// Scalar OIDs read once to establish identity.
pub fn identify_scalars() -> Vec<&'static str> {
    vec![
        SYS_DESCR,
        SYS_NAME,
        IDENT_NAME,
        IDENT_HARDWARE_REV,
        IDENT_FIRMWARE_REV,
        IDENT_MODEL,
        IDENT_SERIAL,
        IDENT_NUM_OUTLETS,
        IDENT_NUM_PHASES,
        IDENT_MAX_CURRENT,
    ]
}
