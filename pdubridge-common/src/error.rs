use thiserror::Error;

/// Common error type for the PDU bridge.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Transport timeout: {0}")]
    TransportTimeout(String),

    #[error("Device unreachable: {0}")]
    TransportUnreachable(String),

    #[error("Transport authentication failed: {0}")]
    TransportAuth(String),

    #[error("Transport parse error: {0}")]
    TransportParse(String),

    #[error("SNMP SET rejected: {0}")]
    SnmpSetRejected(String),

    #[error("MQTT disconnected: {0}")]
    MqttDisconnected(String),

    #[error("MQTT publish dropped: {0}")]
    MqttPublishDropped(String),

    #[error("History write failed: {0}")]
    HistoryWriteFailed(String),

    #[error("Invalid rule: {0}")]
    RuleInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Operation requires the serial console: {0}")]
    RequiresSerial(String),

    #[error("Command cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn rule(msg: impl Into<String>) -> Self {
        Self::RuleInvalid(msg.into())
    }

    pub fn requires_serial(msg: impl Into<String>) -> Self {
        Self::RequiresSerial(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable kind string, used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "config_invalid",
            Error::TransportTimeout(_) => "transport_timeout",
            Error::TransportUnreachable(_) => "transport_unreachable",
            Error::TransportAuth(_) => "transport_auth",
            Error::TransportParse(_) => "transport_parse",
            Error::SnmpSetRejected(_) => "snmp_set_rejected",
            Error::MqttDisconnected(_) => "mqtt_disconnected",
            Error::MqttPublishDropped(_) => "mqtt_publish_dropped",
            Error::HistoryWriteFailed(_) => "history_write_failed",
            Error::RuleInvalid(_) => "rule_invalid",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Forbidden(_) => "forbidden",
            Error::RequiresSerial(_) => "requires_serial",
            Error::Cancelled(_) => "cancelled",
            Error::Io(_) | Error::Json(_) | Error::Internal(_) => "internal",
        }
    }
}

impl From<json5::Error> for Error {
    fn from(e: json5::Error) -> Self {
        Error::ConfigInvalid(e.to_string())
    }
}


/// Result type alias using the bridge's Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(Error::config("x").kind(), "config_invalid");
        assert_eq!(Error::not_found("x").kind(), "not_found");
        assert_eq!(Error::requires_serial("x").kind(), "requires_serial");
        assert_eq!(Error::TransportTimeout("t".into()).kind(), "transport_timeout");
    }
}
