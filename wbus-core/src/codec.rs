//! Wire contract: serialize/deserialize, CRC-16/CCITT, and the three
//! single-byte sensor quantizers (spec.md §3, §4.1).

use heapless::Vec;

use crate::cipher;
use crate::error::CodecError;
use crate::packet::{
    CommandKind, CommandPayload, HeaterState, Packet, PacketType, Payload, StatusPayload,
    MAGIC_VERSION, MAX_WIRE_LEN, WIRE_CRC_LEN, WIRE_HEADER_LEN,
};

pub type WireBuf = Vec<u8, MAX_WIRE_LEN>;

/// CRC-16/CCITT: polynomial 0x1021, initial value 0xFFFF, no final XOR.
/// This is the catalog's CCITT-FALSE variant.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    use crc::{Crc, CRC_16_CCITT_FALSE};
    const ALG: Crc<u16> = Crc::<u16>::new(&CRC_16_CCITT_FALSE);
    ALG.checksum(data)
}

/// `(°C + 50)`, valid domain -50..=205, saturating at the domain bounds.
pub fn pack_temp(temp_c: i16) -> u8 {
    let clamped = temp_c.clamp(-50, 205);
    (clamped + 50) as u8
}

pub fn unpack_temp(packed: u8) -> i16 {
    packed as i16 - 50
}

/// `(mV - 8000) / 32`, domain 8000..=16160, step 32 mV, rounds toward zero.
pub fn pack_voltage(mv: u32) -> u8 {
    let clamped = mv.clamp(8000, 16160);
    ((clamped - 8000) / 32) as u8
}

pub fn unpack_voltage(packed: u8) -> u32 {
    8000 + packed as u32 * 32
}

/// `W / 16`, domain 0..=4080, step 16 W, rounds toward zero.
pub fn pack_power(watts: u32) -> u8 {
    let clamped = watts.clamp(0, 4080);
    (clamped / 16) as u8
}

pub fn unpack_power(packed: u8) -> u32 {
    packed as u32 * 16
}

fn write_header(buf: &mut WireBuf, ptype: PacketType, packet: &Packet) -> Result<(), CodecError> {
    buf.push(MAGIC_VERSION).map_err(|_| CodecError::Malformed)?;
    buf.push(ptype as u8).map_err(|_| CodecError::Malformed)?;
    buf.push(packet.src).map_err(|_| CodecError::Malformed)?;
    buf.push(packet.dst).map_err(|_| CodecError::Malformed)?;
    let seq_le = packet.seq.to_le_bytes();
    buf.extend_from_slice(&seq_le)
        .map_err(|_| CodecError::Malformed)?;
    Ok(())
}

fn write_payload(buf: &mut WireBuf, payload: &Payload) -> Result<(), CodecError> {
    match payload {
        Payload::Command(c) => {
            buf.push(c.kind as u8).map_err(|_| CodecError::Malformed)?;
            buf.push(c.minutes).map_err(|_| CodecError::Malformed)?;
        }
        Payload::Status(s) => {
            buf.push(s.heater_state as u8)
                .map_err(|_| CodecError::Malformed)?;
            buf.push(s.minutes_remaining)
                .map_err(|_| CodecError::Malformed)?;
            buf.push(s.rssi_dbm as u8)
                .map_err(|_| CodecError::Malformed)?;
            buf.push(s.snr_db as u8).map_err(|_| CodecError::Malformed)?;
            buf.push(s.last_opstate)
                .map_err(|_| CodecError::Malformed)?;
            buf.push(s.last_error).map_err(|_| CodecError::Malformed)?;
            let seq_le = s.last_cmd_seq.to_le_bytes();
            buf.extend_from_slice(&seq_le)
                .map_err(|_| CodecError::Malformed)?;
            buf.push(s.temp_packed)
                .map_err(|_| CodecError::Malformed)?;
            buf.push(s.voltage_packed)
                .map_err(|_| CodecError::Malformed)?;
            buf.push(s.power_packed)
                .map_err(|_| CodecError::Malformed)?;
        }
        Payload::Ack => {}
    }
    Ok(())
}

/// Plaintext serialize: header + payload + CRC-16 over both (little-
/// endian on the wire — spec.md §9 Open Question #1 is resolved in favor
/// of little-endian). This is the operation the round-trip property in
/// spec.md §8 is stated against; encryption is layered on separately by
/// [`encrypt_and_encode`].
pub fn serialize(packet: &Packet) -> Result<WireBuf, CodecError> {
    let ptype = packet.packet_type();
    let mut buf = WireBuf::new();
    write_header(&mut buf, ptype, packet)?;
    write_payload(&mut buf, &packet.payload)?;
    let crc = crc16_ccitt(&buf);
    buf.extend_from_slice(&crc.to_le_bytes())
        .map_err(|_| CodecError::Malformed)?;
    Ok(buf)
}

fn parse_payload(ptype: PacketType, bytes: &[u8]) -> Result<Payload, CodecError> {
    match ptype {
        PacketType::Command => {
            let kind = CommandKind::from_u8(bytes[0]).ok_or(CodecError::Malformed)?;
            Ok(Payload::Command(CommandPayload {
                kind,
                minutes: bytes[1],
            }))
        }
        PacketType::Status => {
            let heater_state = HeaterState::from_u8(bytes[0]).ok_or(CodecError::Malformed)?;
            let last_cmd_seq = u16::from_le_bytes([bytes[6], bytes[7]]);
            Ok(Payload::Status(StatusPayload {
                heater_state,
                minutes_remaining: bytes[1],
                rssi_dbm: bytes[2] as i8,
                snr_db: bytes[3] as i8,
                last_opstate: bytes[4],
                last_error: bytes[5],
                last_cmd_seq,
                temp_packed: bytes[8],
                voltage_packed: bytes[9],
                power_packed: bytes[10],
            }))
        }
        PacketType::Ack => Ok(Payload::Ack),
    }
}

/// Plaintext deserialize: validates total size, recomputes the CRC over
/// the received bytes, checks `magic_version`, and parses the payload
/// named by `type`. Any failure is reported as `CodecError`, which every
/// caller in this workspace treats as a silent drop (spec.md §7).
pub fn deserialize(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.len() < WIRE_HEADER_LEN + WIRE_CRC_LEN {
        return Err(CodecError::Malformed);
    }
    let ptype = PacketType::from_u8(bytes[1]).ok_or(CodecError::UnknownType)?;
    if bytes.len() != ptype.wire_len() {
        return Err(CodecError::Malformed);
    }

    let crc_offset = bytes.len() - WIRE_CRC_LEN;
    let expected_crc = crc16_ccitt(&bytes[..crc_offset]);
    let received_crc = u16::from_le_bytes([bytes[crc_offset], bytes[crc_offset + 1]]);
    if expected_crc != received_crc {
        return Err(CodecError::CrcMismatch);
    }

    if bytes[0] != MAGIC_VERSION {
        return Err(CodecError::WrongMagic);
    }

    let src = bytes[2];
    let dst = bytes[3];
    let seq = u16::from_le_bytes([bytes[4], bytes[5]]);
    let payload = parse_payload(ptype, &bytes[WIRE_HEADER_LEN..crc_offset])?;

    Ok(Packet { src, dst, seq, payload })
}

/// Full send-side pipeline (spec.md §4.1/§4.2): serialize the packet in
/// the clear, encrypt the payload region in place under the implicit
/// nonce derived from `(seq, src, dst)`, then recompute and append the
/// CRC over the resulting ciphertext.
pub fn encrypt_and_encode(key: &[u8; 16], packet: &Packet) -> Result<WireBuf, CodecError> {
    let mut buf = serialize(packet)?;
    let crc_offset = buf.len() - WIRE_CRC_LEN;
    let payload_region = &mut buf[WIRE_HEADER_LEN..crc_offset];
    cipher::apply_keystream(key, packet.seq, packet.src, packet.dst, payload_region);
    let crc = crc16_ccitt(&buf[..crc_offset]);
    buf[crc_offset..].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Full receive-side pipeline: verify the CRC over the ciphertext first,
/// only then decrypt the payload region in place, then verify
/// `magic_version` and parse — exactly the order spec.md §3 mandates.
pub fn decrypt_and_decode(key: &[u8; 16], bytes: &mut [u8]) -> Result<Packet, CodecError> {
    if bytes.len() < WIRE_HEADER_LEN + WIRE_CRC_LEN {
        return Err(CodecError::Malformed);
    }
    let ptype = PacketType::from_u8(bytes[1]).ok_or(CodecError::UnknownType)?;
    if bytes.len() != ptype.wire_len() {
        return Err(CodecError::Malformed);
    }

    let crc_offset = bytes.len() - WIRE_CRC_LEN;
    let expected_crc = crc16_ccitt(&bytes[..crc_offset]);
    let received_crc = u16::from_le_bytes([bytes[crc_offset], bytes[crc_offset + 1]]);
    if expected_crc != received_crc {
        return Err(CodecError::CrcMismatch);
    }

    let src = bytes[2];
    let dst = bytes[3];
    let seq = u16::from_le_bytes([bytes[4], bytes[5]]);

    let payload_region = &mut bytes[WIRE_HEADER_LEN..crc_offset];
    cipher::apply_keystream(key, seq, src, dst, payload_region);

    if bytes[0] != MAGIC_VERSION {
        return Err(CodecError::WrongMagic);
    }

    let payload = parse_payload(ptype, &bytes[WIRE_HEADER_LEN..crc_offset])?;
    Ok(Packet { src, dst, seq, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{receiver_node, sender_node};

    #[test]
    fn round_trips_command() {
        let p = Packet::command(sender_node(), receiver_node(), 42, CommandKind::RunMinutes, 20);
        let bytes = serialize(&p).unwrap();
        assert_eq!(bytes.len(), 10);
        let back = deserialize(&bytes).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn round_trips_status() {
        let status = StatusPayload {
            heater_state: HeaterState::Running,
            minutes_remaining: 19,
            rssi_dbm: -42,
            snr_db: 9,
            last_opstate: 0xA1,
            last_error: 0,
            last_cmd_seq: 42,
            temp_packed: pack_temp(22),
            voltage_packed: pack_voltage(12150),
            power_packed: pack_power(900),
        };
        let p = Packet::status(receiver_node(), sender_node(), 7, status);
        let bytes = serialize(&p).unwrap();
        assert_eq!(bytes.len(), 19);
        let back = deserialize(&bytes).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn round_trips_ack() {
        let p = Packet::ack(sender_node(), receiver_node(), 1);
        let bytes = serialize(&p).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(deserialize(&bytes).unwrap(), p);
    }

    #[test]
    fn rejects_wrong_magic() {
        let p = Packet::ack(sender_node(), receiver_node(), 1);
        let mut bytes = serialize(&p).unwrap();
        bytes[0] = 0x01;
        assert_eq!(deserialize(&bytes), Err(CodecError::WrongMagic));
    }

    #[test]
    fn rejects_crc_mismatch() {
        let p = Packet::ack(sender_node(), receiver_node(), 1);
        let mut bytes = serialize(&p).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(deserialize(&bytes), Err(CodecError::CrcMismatch));
    }

    #[test]
    fn rejects_bad_sizes() {
        // 9, 11, 23 bytes: none of {8, 10, 19} are valid wire sizes here.
        assert_eq!(deserialize(&[0u8; 9]), Err(CodecError::Malformed));
        assert_eq!(deserialize(&[0u8; 11]), Err(CodecError::Malformed));
        assert_eq!(deserialize(&[0u8; 23]), Err(CodecError::Malformed));
    }

    #[test]
    fn encrypt_round_trip_is_transparent_to_typed_value() {
        let key = [0x42u8; 16];
        let p = Packet::command(sender_node(), receiver_node(), 99, CommandKind::Stop, 0);
        let mut bytes = encrypt_and_encode(&key, &p).unwrap();
        let back = decrypt_and_decode(&key, &mut bytes).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn quantizers_round_trip_within_tolerance() {
        for t in -50..=205i16 {
            assert_eq!(unpack_temp(pack_temp(t)), t);
        }
        for v in (8000..=16160u32).step_by(17) {
            let back = unpack_voltage(pack_voltage(v));
            assert!((back as i64 - v as i64).unsigned_abs() <= 31);
        }
        for w in (0..=4080u32).step_by(13) {
            let back = unpack_power(pack_power(w));
            assert!((back as i64 - w as i64).unsigned_abs() <= 15);
        }
    }

    #[test]
    fn quantizers_saturate_at_domain_bounds() {
        assert_eq!(pack_temp(-1000), pack_temp(-50));
        assert_eq!(pack_temp(1000), pack_temp(205));
        assert_eq!(pack_voltage(0), pack_voltage(8000));
        assert_eq!(pack_voltage(u32::MAX), pack_voltage(16160));
        assert_eq!(pack_power(u32::MAX), pack_power(4080));
    }
}
