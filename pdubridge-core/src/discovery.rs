//! Home Assistant MQTT discovery payloads.
//!
//! Published retained once per device at startup and on hot-add; removal
//! publishes empty retained payloads so Home Assistant forgets the entities.

use serde_json::json;

use pdubridge_common::DeviceConfig;
use pdubridge_common::model::Identity;
use pdubridge_common::topics::TopicBuilder;

use crate::mqtt::{MqttLink, QoS};

const DISCOVERY_PREFIX: &str = "homeassistant";

fn device_block(device: &DeviceConfig, identity: Option<&Identity>) -> serde_json::Value {
    let unique = identity
        .map(|i| i.serial.clone())
        .unwrap_or_else(|| device.device_id.clone());
    json!({
        "identifiers": [format!("pdubridge_{}", unique)],
        "name": device.label.clone().unwrap_or_else(|| device.device_id.clone()),
        "model": identity.map(|i| i.model.clone()).unwrap_or_default(),
        "manufacturer": "CyberPower",
        "sw_version": identity.map(|i| i.firmware.clone()).unwrap_or_default(),
    })
}

fn unique_id(device: &DeviceConfig, identity: Option<&Identity>, suffix: &str) -> String {
    let base = identity
        .map(|i| i.serial.clone())
        .unwrap_or_else(|| device.device_id.clone());
    format!("pdubridge_{}_{}", base, suffix)
}

/// All discovery `(topic, payload)` pairs for one device.
pub fn discovery_payloads(
    device: &DeviceConfig,
    identity: Option<&Identity>,
    outlet_count: u32,
    has_ats: bool,
) -> Vec<(String, serde_json::Value)> {
    let topics = TopicBuilder::new(&device.device_id);
    let availability = topics.bridge_status();
    let dev = device_block(device, identity);
    let mut payloads = Vec::new();

    for outlet in 1..=outlet_count {
        payloads.push((
            format!(
                "{}/switch/{}_outlet_{}/config",
                DISCOVERY_PREFIX, device.device_id, outlet
            ),
            json!({
                "name": format!("Outlet {}", outlet),
                "unique_id": unique_id(device, identity, &format!("outlet_{}", outlet)),
                "state_topic": topics.outlet(outlet, "state"),
                "command_topic": topics.outlet_command(outlet),
                "payload_on": "on",
                "payload_off": "off",
                "availability_topic": availability.clone(),
                "device": dev.clone(),
            }),
        ));
    }

    let sensors = [
        ("input_voltage", "Input Voltage", topics.input("voltage"), "V", "voltage"),
        ("input_frequency", "Input Frequency", topics.input("frequency"), "Hz", "frequency"),
        ("total_power", "Total Power", topics.total("power"), "W", "power"),
        ("total_load", "Total Load", topics.total("load"), "A", "current"),
        ("temperature", "Temperature", topics.environment("temperature"), "°C", "temperature"),
        ("humidity", "Humidity", topics.environment("humidity"), "%", "humidity"),
    ];
    for (suffix, name, state_topic, unit, device_class) in sensors {
        payloads.push((
            format!(
                "{}/sensor/{}_{}/config",
                DISCOVERY_PREFIX, device.device_id, suffix
            ),
            json!({
                "name": name,
                "unique_id": unique_id(device, identity, suffix),
                "state_topic": state_topic,
                "unit_of_measurement": unit,
                "device_class": device_class,
                "availability_topic": availability.clone(),
                "device": dev.clone(),
            }),
        ));
    }

    if has_ats {
        payloads.push((
            format!(
                "{}/binary_sensor/{}_redundancy/config",
                DISCOVERY_PREFIX, device.device_id
            ),
            json!({
                "name": "Source Redundancy",
                "unique_id": unique_id(device, identity, "redundancy"),
                "state_topic": topics.ats("redundancy"),
                "payload_on": "lost",
                "payload_off": "ok",
                "device_class": "problem",
                "availability_topic": availability,
                "device": dev,
            }),
        ));
    }

    payloads
}

/// Publish discovery configs, retained.
pub async fn publish_discovery(
    mqtt: &MqttLink,
    device: &DeviceConfig,
    identity: Option<&Identity>,
    outlet_count: u32,
    has_ats: bool,
) {
    for (topic, payload) in discovery_payloads(device, identity, outlet_count, has_ats) {
        if let Ok(payload) = serde_json::to_vec(&payload) {
            let _ = mqtt.publish(topic, payload, true, QoS::AtLeastOnce).await;
        }
    }
}

/// Clear retained discovery configs after a device is removed.
pub async fn clear_discovery(mqtt: &MqttLink, device: &DeviceConfig, outlet_count: u32) {
    for (topic, _) in discovery_payloads(device, None, outlet_count, true) {
        let _ = mqtt
            .publish(topic, Vec::new(), true, QoS::AtLeastOnce)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_reference_device_topics() {
        let device = DeviceConfig::mock("pdu44001");
        let payloads = discovery_payloads(&device, None, 2, true);

        // 2 switches, 6 sensors, 1 binary sensor.
        assert_eq!(payloads.len(), 9);

        let (topic, payload) = &payloads[0];
        assert_eq!(topic, "homeassistant/switch/pdu44001_outlet_1/config");
        assert_eq!(payload["state_topic"], "pdu/pdu44001/outlet/1/state");
        assert_eq!(payload["command_topic"], "pdu/pdu44001/outlet/1/command");
        assert_eq!(payload["availability_topic"], "pdu/pdu44001/bridge/status");

        assert!(payloads.iter().any(|(t, _)| t.contains("/binary_sensor/")));
    }

    #[test]
    fn test_unique_ids_prefer_serial() {
        let device = DeviceConfig::mock("pdu44001");
        let identity = Identity {
            serial: "ABC123".to_string(),
            model: "PDU44005".to_string(),
            firmware: "1.2.0".to_string(),
            hardware: None,
            outlet_count: 8,
            phase_count: 1,
            max_input_amps: None,
        };

        let payloads = discovery_payloads(&device, Some(&identity), 1, false);
        assert_eq!(payloads[0].1["unique_id"], "pdubridge_ABC123_outlet_1");
    }
}
