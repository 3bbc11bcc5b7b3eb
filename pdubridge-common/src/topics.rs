//! MQTT topic construction and filter matching for the `pdu/{device_id}`
//! namespace.

/// Root of the device topic namespace.
pub const TOPIC_ROOT: &str = "pdu";

/// Bridge-scoped status topic carrying the connection-level last will.
pub const BRIDGE_STATUS_TOPIC: &str = "pdu/bridge/status";

/// Builder for topics under one device prefix.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    pub fn new(device_id: &str) -> Self {
        Self {
            prefix: format!("{}/{}", TOPIC_ROOT, device_id),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Append a suffix to the device prefix.
    pub fn build(&self, suffix: &str) -> String {
        format!("{}/{}", self.prefix, suffix)
    }

    pub fn status(&self) -> String {
        self.build("status")
    }

    pub fn device_info(&self) -> String {
        self.build("device")
    }

    pub fn bridge_status(&self) -> String {
        self.build("bridge/status")
    }

    pub fn input(&self, metric: &str) -> String {
        self.build(&format!("input/{}", metric))
    }

    pub fn outlet(&self, n: u32, metric: &str) -> String {
        self.build(&format!("outlet/{}/{}", n, metric))
    }

    pub fn outlet_command(&self, n: u32) -> String {
        self.build(&format!("outlet/{}/command", n))
    }

    pub fn outlet_command_response(&self, n: u32) -> String {
        self.build(&format!("outlet/{}/command/response", n))
    }

    pub fn bank(&self, n: u32, metric: &str) -> String {
        self.build(&format!("bank/{}/{}", n, metric))
    }

    pub fn ats(&self, metric: &str) -> String {
        self.build(&format!("ats/{}", metric))
    }

    pub fn source(&self, source: &str, metric: &str) -> String {
        self.build(&format!("source/{}/{}", source, metric))
    }

    pub fn total(&self, metric: &str) -> String {
        self.build(&format!("total/{}", metric))
    }

    pub fn coldstart(&self, metric: &str) -> String {
        self.build(&format!("coldstart/{}", metric))
    }

    pub fn environment(&self, metric: &str) -> String {
        self.build(&format!("environment/{}", metric))
    }

    pub fn environment_contact(&self, n: u32) -> String {
        self.build(&format!("environment/contact/{}", n))
    }

    pub fn automation_status(&self) -> String {
        self.build("automation/status")
    }

    pub fn automation_event(&self) -> String {
        self.build("automation/event")
    }

    /// Wildcard filter covering everything under this device.
    pub fn device_wildcard(&self) -> String {
        format!("{}/#", self.prefix)
    }
}

/// Filter the manager subscribes to for outlet commands across all devices.
pub fn outlet_command_filter() -> String {
    format!("{}/+/outlet/+/command", TOPIC_ROOT)
}

/// Parse an outlet command topic into `(device_id, outlet)`.
///
/// Accepts only the exact shape `pdu/{device_id}/outlet/{n}/command`.
pub fn parse_outlet_command(topic: &str) -> Option<(&str, u32)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [root, device_id, "outlet", outlet, "command"] if *root == TOPIC_ROOT => {
            let n: u32 = outlet.parse().ok()?;
            Some((device_id, n))
        }
        _ => None,
    }
}

/// MQTT topic filter match with `+` (single level) and `#` (multi level,
/// final position only) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builder() {
        let t = TopicBuilder::new("rack1-pdu");
        assert_eq!(t.status(), "pdu/rack1-pdu/status");
        assert_eq!(t.outlet(3, "state"), "pdu/rack1-pdu/outlet/3/state");
        assert_eq!(t.bank(1, "power_factor"), "pdu/rack1-pdu/bank/1/power_factor");
        assert_eq!(t.ats("current_source"), "pdu/rack1-pdu/ats/current_source");
        assert_eq!(t.source("a", "voltage"), "pdu/rack1-pdu/source/a/voltage");
        assert_eq!(t.bridge_status(), "pdu/rack1-pdu/bridge/status");
        assert_eq!(
            t.environment_contact(2),
            "pdu/rack1-pdu/environment/contact/2"
        );
        assert_eq!(t.device_wildcard(), "pdu/rack1-pdu/#");
    }

    #[test]
    fn test_parse_outlet_command() {
        assert_eq!(
            parse_outlet_command("pdu/rack1-pdu/outlet/3/command"),
            Some(("rack1-pdu", 3))
        );
        assert_eq!(parse_outlet_command("pdu/rack1-pdu/outlet/3/state"), None);
        assert_eq!(parse_outlet_command("pdu/rack1-pdu/outlet/x/command"), None);
        assert_eq!(parse_outlet_command("other/d/outlet/1/command"), None);
    }

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("pdu/a/status", "pdu/a/status"));
        assert!(!topic_matches("pdu/a/status", "pdu/b/status"));
        assert!(!topic_matches("pdu/a/status", "pdu/a/status/x"));
    }

    #[test]
    fn test_topic_matches_single_level() {
        assert!(topic_matches("pdu/+/outlet/+/command", "pdu/d1/outlet/3/command"));
        assert!(!topic_matches("pdu/+/outlet/+/command", "pdu/d1/outlet/3/state"));
        assert!(!topic_matches("pdu/+/outlet/+/command", "pdu/d1/outlet/command"));
    }

    #[test]
    fn test_topic_matches_multi_level() {
        assert!(topic_matches("pdu/d1/#", "pdu/d1/outlet/3/state"));
        assert!(topic_matches("pdu/#", "pdu/d1"));
        assert!(!topic_matches("pdu/d1/#", "pdu/d2/outlet/3/state"));
    }
}
