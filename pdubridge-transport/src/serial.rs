//! RS-232 console transport.
//!
//! The console is a line-oriented session: log in once, wait for the command
//! prompt, send a textual command, read the fixed-format response until the
//! prompt returns. The session is exclusive per device; the poller's command
//! gate guarantees one operation at a time.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use pdubridge_common::model::{
    BankMetrics, Identity, InputMetrics, LoadState, OutletMetrics, OutletState, Snapshot,
    current_timestamp_millis,
};

use crate::management::{
    AtsSettings, BankThresholds, DeviceLogEntry, EnergyWiseSettings, Management,
    NetworkSettings, NotificationSettings, OutletSettings, UserAccount,
};
use crate::{OutletAction, Transport, TransportError, TransportKind, TransportResult};

const PROMPT: &str = "> ";
const LOGIN_NAME_PROMPT: &str = "Login Name:";
const LOGIN_PASSWORD_PROMPT: &str = "Login Password:";
const FACTORY_USER: &str = "cyber";
const FACTORY_PASSWORD: &str = "cyber";

/// Serial console client for the PDU's RS-232 management port.
pub struct SerialConsole {
    port_path: String,
    baud: u32,
    username: String,
    password: String,
    session: Option<SerialStream>,
    command_timeout: Duration,
    identity: Option<Identity>,
}

impl SerialConsole {
    pub fn new(
        port_path: impl Into<String>,
        baud: u32,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            port_path: port_path.into(),
            baud,
            username: username.unwrap_or_else(|| FACTORY_USER.to_string()),
            password: password.unwrap_or_else(|| FACTORY_PASSWORD.to_string()),
            session: None,
            command_timeout: Duration::from_secs(3),
            identity: None,
        }
    }

    pub fn with_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Open the port and run the login handshake if no session is live.
    async fn ensure_session(&mut self) -> TransportResult<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut stream = tokio_serial::new(&self.port_path, self.baud)
            .open_native_async()
            .map_err(|e| {
                TransportError::unreachable(format!(
                    "failed to open serial port {}: {}",
                    self.port_path, e
                ))
            })?;

        // Wake the console and run the login dialogue. The password field
        // submits with Space on this firmware family.
        write_all(&mut stream, b"\r", self.command_timeout).await?;
        let banner = read_until_any(
            &mut stream,
            &[LOGIN_NAME_PROMPT, PROMPT],
            self.command_timeout,
        )
        .await?;

        if banner.ends_with(LOGIN_NAME_PROMPT) {
            write_all(
                &mut stream,
                format!("{}\r", self.username).as_bytes(),
                self.command_timeout,
            )
            .await?;
            read_until_any(&mut stream, &[LOGIN_PASSWORD_PROMPT], self.command_timeout).await?;
            write_all(
                &mut stream,
                format!("{} ", self.password).as_bytes(),
                self.command_timeout,
            )
            .await?;

            let outcome =
                read_until_any(&mut stream, &[PROMPT, LOGIN_NAME_PROMPT], self.command_timeout)
                    .await?;
            if outcome.ends_with(LOGIN_NAME_PROMPT) {
                return Err(TransportError::authentication(format!(
                    "console login rejected for user '{}'",
                    self.username
                )));
            }
        }

        self.session = Some(stream);
        Ok(())
    }

    /// Send one command and return the response lines (prompt stripped).
    async fn exec(&mut self, command: &str) -> TransportResult<Vec<String>> {
        self.ensure_session().await?;
        let stream = self.session.as_mut().expect("session just ensured");

        let result = async {
            write_all(stream, format!("{}\r", command).as_bytes(), self.command_timeout).await?;
            let response = read_until_any(stream, &[PROMPT], self.command_timeout).await?;
            Ok(parse_response_lines(&response, command))
        }
        .await;

        // Any I/O failure invalidates the session; the next call re-logs-in.
        if result.is_err() {
            self.session = None;
        }
        result
    }

    async fn exec_ok(&mut self, command: &str) -> TransportResult<()> {
        let lines = self.exec(command).await?;
        if lines.iter().any(|l| l.starts_with("E0")) {
            return Err(TransportError::refused(format!(
                "console rejected '{}': {}",
                command,
                lines.join("; ")
            )));
        }
        Ok(())
    }
}

fn parse_response_lines(response: &str, command: &str) -> Vec<String> {
    response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != command && !l.ends_with(PROMPT.trim_end()))
        .map(str::to_owned)
        .collect()
}

async fn write_all(
    stream: &mut SerialStream,
    bytes: &[u8],
    budget: Duration,
) -> TransportResult<()> {
    timeout(budget, stream.write_all(bytes))
        .await
        .map_err(|_| TransportError::timeout("serial write timed out"))?
        .map_err(|e| TransportError::unreachable(format!("serial write failed: {}", e)))
}

/// Read until the buffer ends with one of the given markers.
async fn read_until_any(
    stream: &mut SerialStream,
    markers: &[&str],
    budget: Duration,
) -> TransportResult<String> {
    let deadline = tokio::time::Instant::now() + budget;
    let mut collected = String::new();
    let mut buf = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::timeout(format!(
                "console did not answer with {:?}",
                markers
            )));
        }

        let n = timeout(remaining, stream.read(&mut buf))
            .await
            .map_err(|_| {
                TransportError::timeout(format!("console did not answer with {:?}", markers))
            })?
            .map_err(|e| TransportError::unreachable(format!("serial read failed: {}", e)))?;

        if n == 0 {
            return Err(TransportError::unreachable("serial port closed"));
        }

        collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        let trimmed = collected.trim_end_matches(['\r', '\n']);
        if markers.iter().any(|m| trimmed.ends_with(m) || collected.ends_with(m)) {
            return Ok(collected);
        }
    }
}

/// Split a `Key: Value` console line.
fn key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

fn parse_f64(value: &str) -> Option<f64> {
    value
        .trim_end_matches(|c: char| c.is_alphabetic() || c == '%')
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl Transport for SerialConsole {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn identify(&mut self) -> TransportResult<Identity> {
        let lines = self.exec("sys").await?;

        let mut serial = None;
        let mut model = None;
        let mut firmware = None;
        let mut hardware = None;
        let mut outlet_count = 0u32;
        let mut phase_count = 1u32;

        for line in &lines {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            match key {
                "Serial Number" => serial = Some(value.to_string()),
                "Model Name" => model = Some(value.to_string()),
                "Firmware Version" => firmware = Some(value.to_string()),
                "Hardware Version" => hardware = Some(value.to_string()),
                "Outlets" => outlet_count = value.parse().unwrap_or(0),
                "Phases" => phase_count = value.parse().unwrap_or(1),
                _ => {}
            }
        }

        let identity = Identity {
            serial: serial
                .ok_or_else(|| TransportError::parse("console 'sys' output missing serial"))?,
            model: model.unwrap_or_default(),
            firmware: firmware.unwrap_or_default(),
            hardware,
            outlet_count,
            phase_count,
            max_input_amps: None,
        };

        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Console status output carries less than the SNMP agent: outlet states
    /// and names, bank load, and the input feed. Metering detail stays unset.
    async fn poll(&mut self) -> TransportResult<Snapshot> {
        let lines = self.exec("sts").await?;

        let mut snap = Snapshot::empty();
        snap.ts = current_timestamp_millis();
        snap.identity = self.identity.clone();

        for line in &lines {
            if let Some(rest) = line.strip_prefix("Outlet ") {
                // "Outlet 3: OFF  Rack Switch"
                let Some((index, detail)) = rest.split_once(':') else {
                    continue;
                };
                let Ok(outlet) = index.trim().parse::<u32>() else {
                    continue;
                };
                let detail = detail.trim();
                let (state_str, name) = detail
                    .split_once(char::is_whitespace)
                    .unwrap_or((detail, ""));
                let state = match state_str {
                    "ON" => OutletState::On,
                    "OFF" => OutletState::Off,
                    _ => continue,
                };
                snap.outlets.push(OutletMetrics {
                    outlet,
                    state,
                    name: if name.trim().is_empty() {
                        format!("Outlet {}", outlet)
                    } else {
                        name.trim().to_string()
                    },
                    current: None,
                    power: None,
                    energy: None,
                });
            } else if let Some(rest) = line.strip_prefix("Bank ") {
                // "Bank 1: 5.2A Normal"
                let Some((index, detail)) = rest.split_once(':') else {
                    continue;
                };
                let Ok(bank) = index.trim().parse::<u32>() else {
                    continue;
                };
                let mut fields = detail.split_whitespace();
                let current = fields.next().and_then(parse_f64).unwrap_or(0.0);
                let load_state = match fields.next() {
                    Some("Low") => LoadState::Low,
                    Some("NearOverload") => LoadState::NearOverload,
                    Some("Overload") => LoadState::Overload,
                    _ => LoadState::Normal,
                };
                snap.banks.push(BankMetrics {
                    bank,
                    current,
                    load_state,
                    voltage: None,
                    power: None,
                    apparent_power: None,
                    power_factor: None,
                    energy: None,
                });
            } else if let Some((key, value)) = key_value(line) {
                if key == "Input" {
                    // "Input: 230.1V 50.0Hz"
                    let mut fields = value.split_whitespace();
                    let voltage = fields.next().and_then(parse_f64);
                    let frequency = fields.next().and_then(parse_f64);
                    if let Some(voltage) = voltage {
                        snap.input = Some(InputMetrics {
                            voltage,
                            frequency: frequency.unwrap_or(0.0),
                        });
                    }
                }
            }
        }

        if snap.outlets.is_empty() && snap.banks.is_empty() && snap.input.is_none() {
            return Err(TransportError::parse("console 'sts' output unrecognised"));
        }

        Ok(snap)
    }

    async fn set_outlet(&mut self, outlet: u32, action: OutletAction) -> TransportResult<()> {
        self.exec_ok(&format!("oltctrl index {} act {}", outlet, action.as_str()))
            .await
    }

    fn management(&mut self) -> Option<&mut dyn crate::Management> {
        Some(self)
    }
}

#[async_trait]
impl Management for SerialConsole {
    async fn get_thresholds(&mut self) -> TransportResult<Vec<BankThresholds>> {
        let lines = self.exec("oltthd").await?;
        let mut thresholds = Vec::new();

        for line in &lines {
            // "Bank 1: Low 0.5A Near 12.0A Over 16.0A"
            let Some(rest) = line.strip_prefix("Bank ") else {
                continue;
            };
            let Some((index, detail)) = rest.split_once(':') else {
                continue;
            };
            let Ok(bank) = index.trim().parse::<u32>() else {
                continue;
            };
            let mut fields = detail.split_whitespace();
            let mut low = 0.0;
            let mut near = 0.0;
            let mut over = 0.0;
            while let Some(word) = fields.next() {
                let target = match word {
                    "Low" => &mut low,
                    "Near" => &mut near,
                    "Over" => &mut over,
                    _ => continue,
                };
                if let Some(v) = fields.next().and_then(parse_f64) {
                    *target = v;
                }
            }
            thresholds.push(BankThresholds {
                bank,
                low,
                near_overload: near,
                overload: over,
            });
        }

        Ok(thresholds)
    }

    async fn set_thresholds(&mut self, t: &BankThresholds) -> TransportResult<()> {
        self.exec_ok(&format!(
            "oltthd bank {} low {} near {} over {}",
            t.bank, t.low, t.near_overload, t.overload
        ))
        .await
    }

    async fn get_network(&mut self) -> TransportResult<NetworkSettings> {
        let lines = self.exec("net").await?;
        let mut settings = NetworkSettings {
            dhcp: false,
            ip: None,
            netmask: None,
            gateway: None,
        };

        for line in &lines {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            match key {
                "DHCP" => settings.dhcp = value.eq_ignore_ascii_case("enabled"),
                "IP Address" => settings.ip = Some(value.to_string()),
                "Subnet Mask" => settings.netmask = Some(value.to_string()),
                "Gateway" => settings.gateway = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(settings)
    }

    async fn set_network(&mut self, s: &NetworkSettings) -> TransportResult<()> {
        if s.dhcp {
            return self.exec_ok("net dhcp enable").await;
        }
        let (Some(ip), Some(mask), Some(gw)) = (&s.ip, &s.netmask, &s.gateway) else {
            return Err(TransportError::parse(
                "static network settings require ip, netmask and gateway",
            ));
        };
        self.exec_ok(&format!("net ip {} mask {} gw {}", ip, mask, gw))
            .await
    }

    async fn get_ats_config(&mut self) -> TransportResult<AtsSettings> {
        let lines = self.exec("ats").await?;
        let mut sensitivity = String::from("normal");
        let mut transfer = 0.0;
        let mut upper = 0.0;
        let mut lower = 0.0;

        for line in &lines {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            match key {
                "Sensitivity" => sensitivity = value.to_string(),
                "Transfer Voltage" => transfer = parse_f64(value).unwrap_or(0.0),
                "Upper Limit" => upper = parse_f64(value).unwrap_or(0.0),
                "Lower Limit" => lower = parse_f64(value).unwrap_or(0.0),
                _ => {}
            }
        }

        Ok(AtsSettings {
            sensitivity,
            transfer_voltage: transfer,
            voltage_upper_limit: upper,
            voltage_lower_limit: lower,
        })
    }

    async fn set_ats_config(&mut self, s: &AtsSettings) -> TransportResult<()> {
        self.exec_ok(&format!(
            "ats sens {} xfer {} upper {} lower {}",
            s.sensitivity, s.transfer_voltage, s.voltage_upper_limit, s.voltage_lower_limit
        ))
        .await
    }

    async fn set_outlet_config(&mut self, s: &OutletSettings) -> TransportResult<()> {
        let mut command = format!("oltcfg index {}", s.outlet);
        if let Some(name) = &s.name {
            command.push_str(&format!(" name \"{}\"", name));
        }
        if let Some(on_delay) = s.on_delay {
            command.push_str(&format!(" ondly {}", on_delay));
        }
        if let Some(off_delay) = s.off_delay {
            command.push_str(&format!(" offdly {}", off_delay));
        }
        if let Some(reboot) = s.reboot_duration {
            command.push_str(&format!(" rbtdur {}", reboot));
        }
        self.exec_ok(&command).await
    }

    async fn set_device_name(&mut self, name: &str) -> TransportResult<()> {
        self.exec_ok(&format!("sys name \"{}\"", name)).await
    }

    async fn set_device_location(&mut self, location: &str) -> TransportResult<()> {
        self.exec_ok(&format!("sys location \"{}\"", location)).await
    }

    async fn check_default_credentials(&mut self) -> TransportResult<bool> {
        Ok(self.username == FACTORY_USER && self.password == FACTORY_PASSWORD)
    }

    async fn change_password(
        &mut self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> TransportResult<()> {
        self.exec_ok(&format!(
            "user passwd name {} old {} new {}",
            username, old_password, new_password
        ))
        .await?;
        if username == self.username {
            self.password = new_password.to_string();
            // Force a fresh login with the new credentials.
            self.session = None;
        }
        Ok(())
    }

    async fn get_event_log(&mut self) -> TransportResult<Vec<DeviceLogEntry>> {
        let lines = self.exec("log").await?;
        Ok(lines
            .iter()
            .filter_map(|line| {
                // "2026/07/30 14:02:11 Outlet 3 turned OFF"
                let (date, rest) = line.split_once(' ')?;
                let (time, message) = rest.split_once(' ')?;
                Some(DeviceLogEntry {
                    timestamp: format!("{} {}", date, time),
                    message: message.trim().to_string(),
                })
            })
            .collect())
    }

    async fn get_notifications(&mut self) -> TransportResult<NotificationSettings> {
        let lines = self.exec("ntf").await?;
        let mut settings = NotificationSettings::default();

        for line in &lines {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            match key {
                "Trap Receiver" => settings.trap_receivers.push(value.to_string()),
                "Email" => settings.email = Some(value.to_string()),
                "On Overload" => settings.on_overload = value.eq_ignore_ascii_case("enabled"),
                "On Transfer" => settings.on_transfer = value.eq_ignore_ascii_case("enabled"),
                _ => {}
            }
        }

        Ok(settings)
    }

    async fn set_notifications(&mut self, s: &NotificationSettings) -> TransportResult<()> {
        let mut command = String::from("ntf");
        for receiver in &s.trap_receivers {
            command.push_str(&format!(" trap {}", receiver));
        }
        if let Some(email) = &s.email {
            command.push_str(&format!(" email {}", email));
        }
        command.push_str(if s.on_overload { " overload on" } else { " overload off" });
        command.push_str(if s.on_transfer { " transfer on" } else { " transfer off" });
        self.exec_ok(&command).await
    }

    async fn get_energywise(&mut self) -> TransportResult<EnergyWiseSettings> {
        let lines = self.exec("ew").await?;
        let mut settings = EnergyWiseSettings::default();

        for line in &lines {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            match key {
                "EnergyWise" => settings.enabled = value.eq_ignore_ascii_case("enabled"),
                "Domain" => settings.domain = Some(value.to_string()),
                "Port" => settings.port = value.parse().ok(),
                _ => {}
            }
        }

        Ok(settings)
    }

    async fn set_energywise(&mut self, s: &EnergyWiseSettings) -> TransportResult<()> {
        let mut command = format!("ew {}", if s.enabled { "enable" } else { "disable" });
        if let Some(domain) = &s.domain {
            command.push_str(&format!(" domain {}", domain));
        }
        if let Some(port) = s.port {
            command.push_str(&format!(" port {}", port));
        }
        self.exec_ok(&command).await
    }

    async fn get_users(&mut self) -> TransportResult<Vec<UserAccount>> {
        let lines = self.exec("user list").await?;
        Ok(lines
            .iter()
            .filter_map(|line| {
                // "cyber (admin)"
                let (name, role) = line.split_once('(')?;
                Some(UserAccount {
                    username: name.trim().to_string(),
                    role: role.trim_end_matches(')').trim().to_string(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_lines() {
        let response = "sts\r\nOutlet 1: ON  Router\r\nBank 1: 5.2A Normal\r\nCyberPower > ";
        let lines = parse_response_lines(response, "sts");
        assert_eq!(lines, vec!["Outlet 1: ON  Router", "Bank 1: 5.2A Normal"]);
    }

    #[test]
    fn test_key_value() {
        assert_eq!(
            key_value("Serial Number: ABC123"),
            Some(("Serial Number", "ABC123"))
        );
        assert_eq!(key_value("no separator"), None);
    }

    #[test]
    fn test_parse_f64_with_units() {
        assert_eq!(parse_f64("230.1V"), Some(230.1));
        assert_eq!(parse_f64("5.2A"), Some(5.2));
        assert_eq!(parse_f64("50.0Hz"), Some(50.0));
        assert_eq!(parse_f64("x"), None);
    }
}
