//! SNMPv2c transport for CyberPower ePDU agents.

use std::time::Duration;

use async_trait::async_trait;
use snmp2::{AsyncSession, Oid, Value};
use tokio::time::timeout;

use pdubridge_common::model::{Identity, Snapshot};

use crate::mib::{self, RawValue, RawValues};
use crate::{ErrorKind, Management, OutletAction, Transport, TransportError, TransportKind, TransportResult};

/// SNMPv2c transport. One UDP session is opened per operation batch; the
/// agent keeps no per-session state in v2c.
pub struct SnmpTransport {
    address: String,
    read_community: String,
    write_community: String,
    request_timeout: Duration,
    retries: u32,
    identity: Option<Identity>,
}

impl SnmpTransport {
    pub fn new(
        host: &str,
        port: u16,
        read_community: impl Into<String>,
        write_community: impl Into<String>,
    ) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            read_community: read_community.into(),
            write_community: write_community.into(),
            request_timeout: Duration::from_millis(1500),
            retries: 1,
            identity: None,
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Point the transport at a new host after a DHCP recovery scan.
    pub fn set_host(&mut self, host: &str, port: u16) {
        self.address = format!("{}:{}", host, port);
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self, community: &str) -> TransportResult<AsyncSession> {
        AsyncSession::new_v2c(&self.address, community.as_bytes(), 0)
            .await
            .map_err(|e| {
                TransportError::unreachable(format!(
                    "failed to open SNMP session to {}: {}",
                    self.address, e
                ))
            })
    }

    /// GET a single OID with the configured retry count. `Ok(None)` means the
    /// agent answered but does not implement the object.
    async fn get(&self, session: &mut AsyncSession, oid_str: &str) -> TransportResult<Option<RawValue>> {
        let oid = parse_oid(oid_str)?;
        let mut last_err = None;

        for _ in 0..=self.retries {
            match timeout(self.request_timeout, session.get(&oid)).await {
                Err(_) => {
                    last_err = Some(TransportError::timeout(format!(
                        "GET {} timed out after {:?}",
                        oid_str, self.request_timeout
                    )));
                }
                Ok(Err(e)) => {
                    last_err = Some(TransportError::new(
                        ErrorKind::Unknown,
                        format!("GET {} failed: {}", oid_str, e),
                    ));
                }
                Ok(Ok(mut response)) => {
                    let Some((_, value)) = response.varbinds.next() else {
                        return Ok(None);
                    };
                    return Ok(raw_value(&value));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TransportError::unknown("GET failed")))
    }

    /// Walk a table subtree with GETNEXT, collecting `(oid, value)` pairs.
    async fn walk(
        &self,
        session: &mut AsyncSession,
        subtree_str: &str,
    ) -> TransportResult<Vec<(String, RawValue)>> {
        let subtree = parse_oid(subtree_str)?;
        let mut current = subtree.clone();
        let mut results = Vec::new();

        loop {
            let response = timeout(self.request_timeout, session.getnext(&current))
                .await
                .map_err(|_| {
                    TransportError::timeout(format!(
                        "GETNEXT under {} timed out after {:?}",
                        subtree_str, self.request_timeout
                    ))
                })?
                .map_err(|e| {
                    TransportError::new(
                        ErrorKind::Unknown,
                        format!("GETNEXT under {} failed: {}", subtree_str, e),
                    )
                })?;

            let mut response = response;
            let Some((resp_oid, value)) = response.varbinds.next() else {
                break;
            };

            if !resp_oid.starts_with(&subtree) {
                break;
            }

            if matches!(value, Value::EndOfMibView) {
                break;
            }

            if let Some(raw) = raw_value(&value) {
                results.push((resp_oid.to_id_string(), raw));
            }

            current = resp_oid.to_owned();
        }

        Ok(results)
    }
}

#[async_trait]
impl Transport for SnmpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Snmp
    }

    async fn identify(&mut self) -> TransportResult<Identity> {
        let mut session = self.open(&self.read_community.clone()).await?;
        let mut raw = RawValues::new();

        for oid in mib::identify_scalars() {
            if let Some(value) = self.get(&mut session, oid).await? {
                raw.insert(oid.to_string(), value);
            }
        }

        let identity = mib::decode_identity(&raw).ok_or_else(|| {
            TransportError::parse(format!(
                "agent at {} did not answer the ePDU identity objects",
                self.address
            ))
        })?;

        self.identity = Some(identity.clone());
        Ok(identity)
    }

    async fn poll(&mut self) -> TransportResult<Snapshot> {
        let mut session = self.open(&self.read_community.clone()).await?;
        let mut raw = RawValues::new();

        for oid in mib::poll_scalars() {
            if let Some(value) = self.get(&mut session, oid).await? {
                raw.insert(oid.to_string(), value);
            }
        }

        for subtree in mib::poll_walks() {
            for (oid, value) in self.walk(&mut session, subtree).await? {
                raw.insert(oid, value);
            }
        }

        if raw.is_empty() {
            return Err(TransportError::parse(format!(
                "agent at {} answered no poll objects",
                self.address
            )));
        }

        Ok(mib::decode_snapshot(&raw, self.identity.clone()))
    }

    async fn set_outlet(&mut self, outlet: u32, action: OutletAction) -> TransportResult<()> {
        let oid_str = format!("{}.{}", mib::OUTLET_CONTROL_COMMAND, outlet);
        let oid = parse_oid(&oid_str)?;
        let code = action.snmp_code();

        let mut session = self.open(&self.write_community.clone()).await?;

        let response = timeout(
            self.request_timeout,
            session.set(&[(&oid, Value::Integer(code))]),
        )
        .await
        .map_err(|_| {
            TransportError::timeout(format!(
                "SET outlet {} {} timed out after {:?}",
                outlet, action, self.request_timeout
            ))
        })?
        .map_err(|e| {
            TransportError::refused(format!("SET outlet {} {} rejected: {}", outlet, action, e))
        })?;

        // An empty response PDU means the agent dropped the varbind.
        let mut response = response;
        if response.varbinds.next().is_none() {
            return Err(TransportError::refused(format!(
                "SET outlet {} {} returned no varbinds",
                outlet, action
            )));
        }

        Ok(())
    }

    fn management(&mut self) -> Option<&mut dyn Management> {
        None
    }
}

fn parse_oid(oid_str: &str) -> TransportResult<Oid<'static>> {
    oid_str
        .parse::<Oid>()
        .map(|oid| oid.to_owned())
        .map_err(|e| TransportError::parse(format!("invalid OID '{}': {:?}", oid_str, e)))
}

/// Convert an SNMP value to a raw value. `None` drops non-data varbinds.
fn raw_value(value: &Value) -> Option<RawValue> {
    match value {
        Value::Integer(n) => Some(RawValue::Int(*n)),
        Value::Counter32(n) | Value::Unsigned32(n) | Value::Timeticks(n) => {
            Some(RawValue::Int(*n as i64))
        }
        Value::Counter64(n) => Some(RawValue::Int(*n as i64)),
        Value::OctetString(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Some(RawValue::Str(text.trim_end_matches('\0').to_string())),
            Err(_) => None,
        },
        Value::Null | Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_oid() {
        assert!(parse_oid("1.3.6.1.2.1.1.3.0").is_ok());
        assert!(parse_oid("not-an-oid").is_err());
    }

    #[test]
    fn test_set_host() {
        let mut t = SnmpTransport::new("192.168.1.50", 161, "public", "private");
        assert_eq!(t.address(), "192.168.1.50:161");
        t.set_host("192.168.1.77", 161);
        assert_eq!(t.address(), "192.168.1.77:161");
    }

    #[test]
    fn test_raw_value_conversion() {
        assert_eq!(raw_value(&Value::Integer(42)), Some(RawValue::Int(42)));
        assert_eq!(raw_value(&Value::Counter32(7)), Some(RawValue::Int(7)));
        assert_eq!(raw_value(&Value::Null), None);
        assert_eq!(raw_value(&Value::NoSuchObject), None);
        assert_eq!(
            raw_value(&Value::OctetString(b"PDU44005")),
            Some(RawValue::Str("PDU44005".to_string()))
        );
    }
}
