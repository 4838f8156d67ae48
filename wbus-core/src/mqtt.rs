//! MQTT bridge core (spec.md §4 component table, §7 `StaleCommand`): the
//! freshness check on an incoming command and the discovery/status
//! payload bodies. The network client, TLS, and broker connection are
//! out of scope here (spec.md §2 Non-goals) and live in
//! `receiver-firmware` behind the `mqtt` feature; this module only
//! covers what can be unit-tested without a broker.

use core::fmt::Write;

use heapless::String;

use crate::config::MQTT_STALE_COMMAND_THRESHOLD_S;
use crate::error::MqttError;
use crate::packet::{CommandKind, CommandPayload, StatusPayload};

/// Wire layout of an inbound command-topic payload: `kind (1) | minutes
/// (1) | timestamp_s (4, little-endian)`. Distinct from the radio
/// `CommandPayload` encoding because the MQTT side carries a timestamp
/// for the freshness check instead of a `seq`.
const MQTT_COMMAND_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqttCommand {
    pub payload: CommandPayload,
    pub timestamp_s: u32,
}

/// Parse a command-topic message body. Returns `Malformed` for anything
/// that isn't exactly `MQTT_COMMAND_LEN` bytes with a recognized kind.
pub fn decode_command(bytes: &[u8]) -> Result<MqttCommand, MqttError> {
    if bytes.len() != MQTT_COMMAND_LEN {
        return Err(MqttError::Malformed);
    }
    let kind = CommandKind::from_u8(bytes[0]).ok_or(MqttError::Malformed)?;
    let minutes = bytes[1];
    let timestamp_s = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    Ok(MqttCommand {
        payload: CommandPayload { kind, minutes },
        timestamp_s,
    })
}

/// Reject a command whose carried timestamp is older than the staleness
/// threshold (spec.md §7 `StaleCommand`). `now_s` is the receiver's own
/// clock; no attempt is made to correct for broker/network clock skew
/// beyond the threshold itself.
pub fn check_freshness(cmd: &MqttCommand, now_s: u32) -> Result<(), MqttError> {
    if now_s.saturating_sub(cmd.timestamp_s) > MQTT_STALE_COMMAND_THRESHOLD_S {
        return Err(MqttError::StaleCommand);
    }
    Ok(())
}

pub type DiscoveryPayload = String<256>;
pub type StatusJson = String<160>;

/// Home Assistant MQTT discovery payload for the heater's climate/switch
/// entity. `node_id` is the short identifier the broker topic is rooted
/// at (e.g. `"wbus-heater"`).
pub fn build_discovery_payload(node_id: &str) -> Result<DiscoveryPayload, MqttError> {
    let mut out = DiscoveryPayload::new();
    write!(
        out,
        "{{\"name\":\"{node_id} heater\",\"uniq_id\":\"{node_id}\",\"cmd_t\":\"{node_id}/cmd\",\"stat_t\":\"{node_id}/status\"}}"
    )
    .map_err(|_| MqttError::Malformed)?;
    Ok(out)
}

/// Status-topic JSON body, mirroring the fields carried on the radio
/// Status packet so Home Assistant and the radio Sender agree.
pub fn build_status_json(status: &StatusPayload) -> Result<StatusJson, MqttError> {
    let mut out = StatusJson::new();
    write!(
        out,
        "{{\"state\":{},\"minutes_remaining\":{},\"last_cmd_seq\":{},\"last_error\":{}}}",
        status.heater_state as u8, status.minutes_remaining, status.last_cmd_seq, status.last_error
    )
    .map_err(|_| MqttError::Malformed)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HeaterState;

    #[test]
    fn decodes_well_formed_command() {
        let bytes = [2u8, 20, 100, 0, 0, 0]; // RunMinutes, 20min, ts=100
        let cmd = decode_command(&bytes).unwrap();
        assert_eq!(cmd.payload.kind, CommandKind::RunMinutes);
        assert_eq!(cmd.payload.minutes, 20);
        assert_eq!(cmd.timestamp_s, 100);
    }

    #[test]
    fn rejects_wrong_length_and_unknown_kind() {
        assert_eq!(decode_command(&[0u8; 5]), Err(MqttError::Malformed));
        assert_eq!(decode_command(&[9, 0, 0, 0, 0, 0]), Err(MqttError::Malformed));
    }

    #[test]
    fn fresh_command_passes_stale_command_rejected() {
        let cmd = MqttCommand {
            payload: CommandPayload { kind: CommandKind::Stop, minutes: 0 },
            timestamp_s: 1_000,
        };
        assert!(check_freshness(&cmd, 1_000 + MQTT_STALE_COMMAND_THRESHOLD_S).is_ok());
        assert_eq!(
            check_freshness(&cmd, 1_000 + MQTT_STALE_COMMAND_THRESHOLD_S + 1),
            Err(MqttError::StaleCommand)
        );
    }

    #[test]
    fn discovery_payload_includes_node_id() {
        let payload = build_discovery_payload("wbus-heater").unwrap();
        assert!(payload.contains("wbus-heater"));
        assert!(payload.contains("cmd_t"));
    }

    #[test]
    fn status_json_round_trips_fields_textually() {
        let status = StatusPayload {
            heater_state: HeaterState::Running,
            minutes_remaining: 19,
            rssi_dbm: -40,
            snr_db: 8,
            last_opstate: 0xA1,
            last_error: 0,
            last_cmd_seq: 42,
            temp_packed: 72,
            voltage_packed: 129,
            power_packed: 56,
        };
        let json = build_status_json(&status).unwrap();
        assert!(json.contains("\"minutes_remaining\":19"));
        assert!(json.contains("\"last_cmd_seq\":42"));
    }
}
