//! The radio wire unit (spec.md §3, §6): a fixed header, a payload whose
//! size is determined by `type`, and a trailing CRC. Payload variants are
//! a tagged sum rather than the ad-hoc C union the source used (§9) — the
//! discriminant alone determines which fields exist.

use crate::config::{NODE_RECEIVER, NODE_SENDER};

/// Current protocol generation tag. Decoders reject any other value.
pub const MAGIC_VERSION: u8 = 0x02;

/// Header (magic, type, src, dst, seq) is always 6 bytes; CRC is 2 bytes.
pub const WIRE_HEADER_LEN: usize = 6;
pub const WIRE_CRC_LEN: usize = 2;

pub const COMMAND_PAYLOAD_LEN: usize = 2;
pub const STATUS_PAYLOAD_LEN: usize = 11;
pub const ACK_PAYLOAD_LEN: usize = 0;

/// Largest possible frame: 6 (header) + 11 (Status payload) + 2 (crc).
pub const MAX_WIRE_LEN: usize = WIRE_HEADER_LEN + STATUS_PAYLOAD_LEN + WIRE_CRC_LEN;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    Command = 1,
    Status = 2,
    Ack = 3,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Command),
            2 => Some(Self::Status),
            3 => Some(Self::Ack),
            _ => None,
        }
    }

    /// Payload size in bytes for this message kind. `type` alone
    /// determines it; there is no separate length field on the wire.
    pub fn payload_len(self) -> usize {
        match self {
            Self::Command => COMMAND_PAYLOAD_LEN,
            Self::Status => STATUS_PAYLOAD_LEN,
            Self::Ack => ACK_PAYLOAD_LEN,
        }
    }

    pub fn wire_len(self) -> usize {
        WIRE_HEADER_LEN + self.payload_len() + WIRE_CRC_LEN
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandKind {
    Stop = 0,
    Start = 1,
    RunMinutes = 2,
    QueryStatus = 3,
}

impl CommandKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stop),
            1 => Some(Self::Start),
            2 => Some(Self::RunMinutes),
            3 => Some(Self::QueryStatus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandPayload {
    pub kind: CommandKind,
    pub minutes: u8,
}

/// Coarse heater state as reflected on Status; `Error` is cleared by the
/// next successful command (it is not sticky, spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaterState {
    Off = 0,
    Running = 1,
    Error = 2,
}

impl HeaterState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Off),
            1 => Some(Self::Running),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Fixed 11-byte layout (see DESIGN.md for why the "9-14 byte" range in
/// spec.md §3 resolves to a single fixed-size encoding here): heater
/// state, minutes remaining, last RSSI/SNR, last raw opstate byte, last
/// error code, the echoed command seq, and the three quantized sensor
/// fields from §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusPayload {
    pub heater_state: HeaterState,
    pub minutes_remaining: u8,
    pub rssi_dbm: i8,
    pub snr_db: i8,
    pub last_opstate: u8,
    pub last_error: u8,
    pub last_cmd_seq: u16,
    pub temp_packed: u8,
    pub voltage_packed: u8,
    pub power_packed: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    Command(CommandPayload),
    Status(StatusPayload),
    Ack,
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::Command(_) => PacketType::Command,
            Payload::Status(_) => PacketType::Status,
            Payload::Ack => PacketType::Ack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Packet {
    pub src: u8,
    pub dst: u8,
    pub seq: u16,
    pub payload: Payload,
}

impl Packet {
    pub fn command(src: u8, dst: u8, seq: u16, kind: CommandKind, minutes: u8) -> Self {
        Self {
            src,
            dst,
            seq,
            payload: Payload::Command(CommandPayload { kind, minutes }),
        }
    }

    pub fn status(src: u8, dst: u8, seq: u16, status: StatusPayload) -> Self {
        Self {
            src,
            dst,
            seq,
            payload: Payload::Status(status),
        }
    }

    pub fn ack(src: u8, dst: u8, seq: u16) -> Self {
        Self {
            src,
            dst,
            seq,
            payload: Payload::Ack,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }
}

/// `sender=1, receiver=2 by convention` (spec.md §3).
pub const fn sender_node() -> u8 {
    NODE_SENDER
}
pub const fn receiver_node() -> u8 {
    NODE_RECEIVER
}
