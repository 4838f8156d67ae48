//! Receiver control loop (spec.md §4.7): the central state machine that
//! turns a radio Command into a W-BUS exchange and a Status echo, and
//! cycles the duty-cycled idle/sleep loop between commands.

use crate::codec;
use crate::config::{
    NODE_RECEIVER, NODE_SENDER, RECEIVER_EXTENDED_WAKE_MS, RECEIVER_IDLE_LISTEN_WINDOW_MS,
    RECEIVER_IDLE_SLEEP_MS, RECEIVER_POLL_PERIOD_MS, SESSION_KEEPALIVE_PERIOD_MS,
    SESSION_RENEWAL_THRESHOLD_MS, WBUS_COMMAND_RETRIES, WBUS_RESPONSE_TIMEOUT_MS,
};
use crate::error::WBusError;
use crate::packet::{CommandKind, CommandPayload, HeaterState, Packet, Payload, StatusPayload};
use crate::radio::RadioLink;
use crate::wbus::parser::{
    self, read_multi_status, read_simple_page, OpState, CMD_KEEPALIVE, CMD_START_HEAT, CMD_STOP,
    CMD_STATUS_REQUEST,
};
use crate::wbus::transport::{Clock, WBusPort, WBusTransport, HEATER_TO_CONTROLLER};

/// Probed once at boot and cached across sleeps (spec.md §5, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TlvSupport {
    Unknown,
    No,
    Yes,
}

/// The two values that must survive the Receiver's deep-sleep cycle
/// (spec.md §5 "Persistent state across deep sleep"). A concrete
/// implementation lives in `receiver-firmware` (retained RAM or flash);
/// nothing in this crate assumes a storage medium.
pub trait PersistentStore {
    fn load(&self) -> (u16, TlvSupport);
    fn save(&mut self, last_processed_seq: u16, tlv_support: TlvSupport);
}

/// Which input path activated a command; preserved for diagnostics only
/// (spec.md §4.7 "Command source arbitration").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandSource {
    Radio,
    Menu,
    Mqtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Booting,
    Idle,
    Executing,
    Running,
    ExtendedWake,
    DeepSleep,
}

/// Active heat/vent session; `active_cmd == 0` means no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeaterSession {
    pub active_cmd: u8,
    pub expiry_ms: u64,
    pub last_keepalive_ms: u64,
}

impl HeaterSession {
    pub const fn none() -> Self {
        Self {
            active_cmd: 0,
            expiry_ms: 0,
            last_keepalive_ms: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_cmd != 0
    }
}

/// The `ReceiverState`/`gStatus` replacement from spec.md §9: one struct
/// the main loop owns and passes by mutable reference, instead of
/// scattered globals.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverState {
    pub phase: Phase,
    pub last_processed_seq: u16,
    pub tlv_support: TlvSupport,
    pub session: HeaterSession,
    pub heater_state: HeaterState,
    pub minutes_remaining: u8,
    pub last_opstate: u8,
    pub last_error: u8,
    pub temp_packed: u8,
    pub voltage_packed: u8,
    pub power_packed: u8,
    pub last_rssi_dbm: i8,
    pub last_snr_db: i8,
    pub extended_wake_until_ms: u64,
    pub next_poll_ms: u64,
    /// Remembered Start/RunMinutes duration, used when a command arrives
    /// with `minutes == 0` (spec.md §4.7 "use remembered preset").
    pub remembered_minutes: u8,
}

impl ReceiverState {
    fn boot(last_processed_seq: u16, tlv_support: TlvSupport) -> Self {
        Self {
            phase: Phase::Booting,
            last_processed_seq,
            tlv_support,
            session: HeaterSession::none(),
            heater_state: HeaterState::Off,
            minutes_remaining: 0,
            last_opstate: 0,
            last_error: 0,
            temp_packed: 0,
            voltage_packed: 0,
            power_packed: 0,
            last_rssi_dbm: 0,
            last_snr_db: 0,
            extended_wake_until_ms: 0,
            next_poll_ms: 0,
            remembered_minutes: 30,
        }
    }

    fn snapshot_status(&self, last_cmd_seq: u16) -> StatusPayload {
        StatusPayload {
            heater_state: self.heater_state,
            minutes_remaining: self.minutes_remaining,
            rssi_dbm: self.last_rssi_dbm,
            snr_db: self.last_snr_db,
            last_opstate: self.last_opstate,
            last_error: self.last_error,
            last_cmd_seq,
            temp_packed: self.temp_packed,
            voltage_packed: self.voltage_packed,
            power_packed: self.power_packed,
        }
    }
}

/// Retry a W-BUS command up to `WBUS_COMMAND_RETRIES` times, requiring a
/// response frame whose command byte echoes `cmd | 0x80` (spec.md §4.7
/// "Failure semantics").
fn send_and_confirm<P: WBusPort>(
    transport: &mut WBusTransport<P>,
    clock: &mut impl Clock,
    cmd: u8,
    data: &[u8],
) -> Result<(), WBusError> {
    let expected = cmd | 0x80;
    for _ in 0..WBUS_COMMAND_RETRIES {
        if transport.send_command(clock, cmd, data).is_err() {
            continue;
        }
        if let Some(frame) = transport.read_packet(clock, WBUS_RESPONSE_TIMEOUT_MS) {
            if frame.header == HEATER_TO_CONTROLLER
                && frame.payload.first().copied() == Some(expected)
            {
                return Ok(());
            }
        }
    }
    Err(WBusError::CommandFailed)
}

/// Same exchange `parser::read_operating_state` performs, but also
/// returns the raw opstate byte so it can be stored in `StatusPayload`.
fn read_opstate_raw<P: WBusPort>(
    transport: &mut WBusTransport<P>,
    clock: &mut impl Clock,
) -> Result<(OpState, u8), WBusError> {
    transport
        .send_command(clock, CMD_STATUS_REQUEST, &[0x07])
        .map_err(|_| WBusError::CommandFailed)?;
    let frame = transport
        .read_packet(clock, WBUS_RESPONSE_TIMEOUT_MS)
        .ok_or(WBusError::Timeout)?;
    if frame.header != HEATER_TO_CONTROLLER || frame.payload.len() < 3 {
        return Err(WBusError::UnexpectedResponse);
    }
    if frame.payload[0] != (CMD_STATUS_REQUEST | 0x80) || frame.payload[1] != 0x07 {
        return Err(WBusError::UnexpectedResponse);
    }
    let raw = frame.payload[2];
    let state = if raw == 0x04 || raw == 0x00 {
        OpState::Off
    } else {
        OpState::Running
    };
    Ok((state, raw))
}

/// The Receiver control loop (spec.md §4.7). Owns the W-BUS transport;
/// the radio and persisted storage are handed in at each call so the
/// firmware binary keeps ownership of the concrete hardware.
pub struct ReceiverLoop<P: WBusPort> {
    transport: WBusTransport<P>,
    key: [u8; 16],
    pub state: ReceiverState,
}

const TLV_IDS: &[u8] = &[0x01, 0x02, 0x03];

impl<P: WBusPort> ReceiverLoop<P> {
    pub fn new(port: P, controller_addr: u8, heater_addr: u8, key: [u8; 16], store: &impl PersistentStore) -> Self {
        let (seq, tlv) = store.load();
        Self {
            transport: WBusTransport::new(port, controller_addr, heater_addr),
            key,
            state: ReceiverState::boot(seq, tlv),
        }
    }

    /// Probe TLV multi-status support exactly once, then settle into Idle.
    /// Cheap to call every boot: a no-op once `tlv_support` is cached.
    pub fn boot(&mut self, clock: &mut impl Clock) {
        if self.state.tlv_support == TlvSupport::Unknown {
            self.state.tlv_support = match read_multi_status(&mut self.transport, clock, WBUS_RESPONSE_TIMEOUT_MS, TLV_IDS) {
                Ok(snap) if snap.valid => TlvSupport::Yes,
                _ => TlvSupport::No,
            };
        }
        self.state.phase = Phase::Idle;
    }

    fn refresh_from_wbus(&mut self, clock: &mut impl Clock) {
        if let Ok((op, raw)) = read_opstate_raw(&mut self.transport, clock) {
            self.state.last_opstate = raw;
            if op == OpState::Off && self.state.session.is_active() {
                self.state.session = HeaterSession::none();
                self.state.heater_state = HeaterState::Off;
            }
        }

        match self.state.tlv_support {
            TlvSupport::Yes => {
                if let Ok(snap) = read_multi_status(&mut self.transport, clock, WBUS_RESPONSE_TIMEOUT_MS, TLV_IDS) {
                    if let Some(t) = snap.temperature_c {
                        self.state.temp_packed = codec::pack_temp(t);
                    }
                    if let Some(v) = snap.voltage_mv {
                        self.state.voltage_packed = codec::pack_voltage(v as u32);
                    }
                    if let Some(p) = snap.power {
                        self.state.power_packed = codec::pack_power(p as u32);
                    }
                }
            }
            TlvSupport::No => {
                if let Ok(bytes) = read_simple_page(&mut self.transport, clock, WBUS_RESPONSE_TIMEOUT_MS, 0x05) {
                    if let Some(m) = parser::decode_page_05(&bytes) {
                        self.state.temp_packed = codec::pack_temp(m.temp_c);
                        self.state.voltage_packed = codec::pack_voltage(m.voltage_mv as u32);
                        // Simple pages don't carry a watts figure directly;
                        // leave power at 0 rather than stale (spec.md §8
                        // TLV-unsupported-fallback scenario).
                    }
                }
            }
            TlvSupport::Unknown => {}
        }
    }

    /// Clear an active session on expiry, or send `CMD_KEEPALIVE` once
    /// the renewal window (spec.md §3: 30 s before expiry) is reached and
    /// the keep-alive cadence (10 s) permits another send.
    fn service_session_keepalive(&mut self, clock: &mut impl Clock, now_ms: u64) {
        if !self.state.session.is_active() {
            return;
        }
        if now_ms >= self.state.session.expiry_ms {
            self.state.session = HeaterSession::none();
            self.state.heater_state = HeaterState::Off;
            return;
        }
        let renewal_at = self
            .state
            .session
            .expiry_ms
            .saturating_sub(SESSION_RENEWAL_THRESHOLD_MS);
        let next_keepalive_ms = self.state.session.last_keepalive_ms + SESSION_KEEPALIVE_PERIOD_MS;
        if now_ms >= renewal_at && now_ms >= next_keepalive_ms {
            let active_cmd = self.state.session.active_cmd;
            if send_and_confirm(&mut self.transport, clock, CMD_KEEPALIVE, &[active_cmd]).is_ok() {
                self.state.session.last_keepalive_ms = now_ms;
            }
        }
    }

    /// Dispatch a validated, already-decrypted Command addressed to this
    /// node. Handles dedup, executes against W-BUS, and always returns
    /// the Status to ACK with (spec.md §4.7 "Command dispatch").
    pub fn dispatch_command(
        &mut self,
        clock: &mut impl Clock,
        store: &mut impl PersistentStore,
        seq: u16,
        payload: CommandPayload,
        _source: CommandSource,
        now_ms: u64,
    ) -> StatusPayload {
        if seq == self.state.last_processed_seq {
            return self.state.snapshot_status(seq);
        }

        self.state.phase = Phase::Executing;
        match payload.kind {
            CommandKind::Stop => {
                match send_and_confirm(&mut self.transport, clock, CMD_STOP, &[]) {
                    Ok(()) => {
                        self.state.session = HeaterSession::none();
                        self.state.heater_state = HeaterState::Off;
                        self.state.last_error = 0;
                    }
                    Err(_) => {
                        self.state.heater_state = HeaterState::Error;
                        self.state.last_error = 1;
                    }
                }
                self.state.phase = Phase::Idle;
            }
            CommandKind::Start | CommandKind::RunMinutes => {
                let minutes = if payload.minutes == 0 {
                    self.state.remembered_minutes
                } else {
                    payload.minutes
                };
                if payload.kind == CommandKind::RunMinutes {
                    self.state.remembered_minutes = minutes;
                }
                match send_and_confirm(&mut self.transport, clock, CMD_START_HEAT, &[minutes]) {
                    Ok(()) => {
                        self.state.session = HeaterSession {
                            active_cmd: CMD_START_HEAT,
                            expiry_ms: now_ms + minutes as u64 * 60_000,
                            last_keepalive_ms: now_ms,
                        };
                        self.state.heater_state = HeaterState::Running;
                        self.state.minutes_remaining = minutes;
                        self.state.last_error = 0;
                    }
                    Err(_) => {
                        self.state.heater_state = HeaterState::Error;
                        self.state.last_error = 1;
                    }
                }
                self.state.phase = Phase::Running;
                self.state.next_poll_ms = now_ms;
            }
            CommandKind::QueryStatus => {
                self.refresh_from_wbus(clock);
                self.state.phase = Phase::Idle;
            }
        }

        self.state.last_processed_seq = seq;
        store.save(self.state.last_processed_seq, self.state.tlv_support);
        self.state.snapshot_status(seq)
    }

    /// Periodic poll while Running or Extended-Wake (spec.md §4.7
    /// "Periodic polling"): re-read state, service the session's
    /// keep-alive/renewal lifecycle (spec.md §3 "Keep-alive period"),
    /// and note the Off transition so the caller can move into Extended
    /// Wake.
    pub fn poll_tick(&mut self, clock: &mut impl Clock, now_ms: u64) -> StatusPayload {
        self.refresh_from_wbus(clock);
        self.service_session_keepalive(clock, now_ms);
        self.state.next_poll_ms = now_ms + RECEIVER_POLL_PERIOD_MS;
        if !self.state.session.is_active() && self.state.phase == Phase::Running {
            self.state.phase = Phase::ExtendedWake;
            self.state.extended_wake_until_ms = now_ms + RECEIVER_EXTENDED_WAKE_MS;
        }
        if self.state.phase == Phase::ExtendedWake && now_ms >= self.state.extended_wake_until_ms {
            self.state.phase = Phase::Idle;
        }
        self.state.snapshot_status(self.state.last_processed_seq)
    }

    /// One iteration of the outer duty cycle. In `Idle`, listens for a
    /// Command for `RECEIVER_IDLE_LISTEN_WINDOW_MS`; on a hit, dispatches
    /// it and emits Status over the radio. On a miss, puts the radio and
    /// MCU to sleep for the idle period. In `Running`/`ExtendedWake`,
    /// listens continuously and polls W-BUS on the 2 s cadence. Returns
    /// whenever it has something worth the caller observing.
    pub fn run_once<R: RadioLink>(
        &mut self,
        radio: &mut R,
        clock: &mut impl Clock,
        store: &mut impl PersistentStore,
        now_ms: u64,
    ) {
        match self.state.phase {
            Phase::Booting => self.boot(clock),
            Phase::Idle => {
                radio.receive();
                let deadline = now_ms + RECEIVER_IDLE_LISTEN_WINDOW_MS;
                let mut heard = false;
                while clock.now_ms() < deadline {
                    if let Ok(Some(mut rx)) = radio.try_recv() {
                        if let Ok(pkt) = codec::decrypt_and_decode(&self.key, &mut rx.data) {
                            if pkt.dst == NODE_RECEIVER {
                                if let Payload::Command(cmd) = pkt.payload {
                                    self.state.last_rssi_dbm = rx.rssi_dbm as i8;
                                    self.state.last_snr_db = rx.snr_db as i8;
                                    let now = clock.now_ms();
                                    let status = self.dispatch_command(
                                        clock,
                                        store,
                                        pkt.seq,
                                        cmd,
                                        CommandSource::Radio,
                                        now,
                                    );
                                    let reply = Packet::status(NODE_RECEIVER, pkt.src, pkt.seq, status);
                                    if let Ok(frame) = codec::encrypt_and_encode(&self.key, &reply) {
                                        let _ = radio.send(&frame);
                                    }
                                    heard = true;
                                    break;
                                }
                            }
                        }
                    }
                }
                if !heard {
                    self.state.phase = Phase::DeepSleep;
                    radio.sleep();
                    clock.delay_ms(RECEIVER_IDLE_SLEEP_MS as u32);
                    self.state.phase = Phase::Idle;
                }
            }
            Phase::Running | Phase::ExtendedWake => {
                radio.receive();
                if let Ok(Some(mut rx)) = radio.try_recv() {
                    if let Ok(pkt) = codec::decrypt_and_decode(&self.key, &mut rx.data) {
                        if pkt.dst == NODE_RECEIVER {
                            if let Payload::Command(cmd) = pkt.payload {
                                self.state.last_rssi_dbm = rx.rssi_dbm as i8;
                                self.state.last_snr_db = rx.snr_db as i8;
                                let status = self.dispatch_command(
                                    clock, store, pkt.seq, cmd, CommandSource::Radio, now_ms,
                                );
                                let reply = Packet::status(NODE_RECEIVER, pkt.src, pkt.seq, status);
                                if let Ok(frame) = codec::encrypt_and_encode(&self.key, &reply) {
                                    let _ = radio.send(&frame);
                                }
                            }
                        }
                    }
                }
                if now_ms >= self.state.next_poll_ms {
                    let status = self.poll_tick(clock, now_ms);
                    let reply =
                        Packet::status(NODE_RECEIVER, NODE_SENDER, self.state.last_processed_seq, status);
                    if let Ok(frame) = codec::encrypt_and_encode(&self.key, &reply) {
                        let _ = radio.send(&frame);
                    }
                }
            }
            Phase::Executing | Phase::DeepSleep => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wbus::transport::build_frame;
    use core::cell::Cell;
    use heapless::Deque;

    struct MemStore {
        seq: u16,
        tlv: TlvSupport,
    }

    impl PersistentStore for MemStore {
        fn load(&self) -> (u16, TlvSupport) {
            (self.seq, self.tlv)
        }
        fn save(&mut self, seq: u16, tlv: TlvSupport) {
            self.seq = seq;
            self.tlv = tlv;
        }
    }

    /// `now_ms` advances itself by 10ms on every read, standing in for a
    /// free-running timer so `WBusTransport::read_packet`'s bounded poll
    /// (which only calls `now_ms`, never `delay_ms`) actually terminates.
    struct FakeClock {
        now: Cell<u64>,
    }

    impl FakeClock {
        fn at(ms: u64) -> Self {
            Self { now: Cell::new(ms) }
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            let v = self.now.get();
            self.now.set(v + 10);
            v
        }
        fn delay_ms(&mut self, ms: u32) {
            self.now.set(self.now.get() + ms as u64);
        }
    }

    /// A fake W-BUS heater that always answers with a plausible ack for
    /// whatever command byte it was just sent, tracked via a tiny inbox.
    struct FakePort {
        rx_bytes: Deque<u8, 64>,
        tx_log: Vec<u8>,
    }

    impl FakePort {
        fn new() -> Self {
            Self {
                rx_bytes: Deque::new(),
                tx_log: Vec::new(),
            }
        }

        fn queue_response(&mut self, cmd: u8, data: &[u8]) {
            let frame = build_frame(0x4, 0xF, cmd | 0x80, data);
            for b in frame {
                self.rx_bytes.push_back(b).ok();
            }
        }
    }

    impl WBusPort for FakePort {
        type Error = ();
        fn write_byte(&mut self, byte: u8) -> nb::Result<(), ()> {
            self.tx_log.push(byte);
            Ok(())
        }
        fn read_byte(&mut self) -> nb::Result<u8, ()> {
            self.rx_bytes.pop_front().ok_or(nb::Error::WouldBlock)
        }
        fn flush(&mut self) -> Result<(), ()> {
            Ok(())
        }
        fn set_enable(&mut self, _asserted: bool) {}
        fn disable_uart(&mut self) {}
        fn enable_uart(&mut self) {}
        fn set_line_high(&mut self) {}
        fn set_line_low(&mut self) {}
    }

    fn make_loop(port: FakePort) -> (ReceiverLoop<FakePort>, MemStore) {
        let store = MemStore { seq: 0, tlv: TlvSupport::No };
        let engine = ReceiverLoop::new(port, 0xF, 0x4, [0x33u8; 16], &store);
        (engine, store)
    }

    #[test]
    fn duplicate_seq_reaches_without_executing() {
        let (mut engine, mut store) = make_loop(FakePort::new());
        engine.state.phase = Phase::Idle;
        engine.state.last_processed_seq = 7;
        engine.state.heater_state = HeaterState::Running;

        let mut clock = FakeClock::at(0);
        let status = engine.dispatch_command(
            &mut clock,
            &mut store,
            7,
            CommandPayload { kind: CommandKind::Stop, minutes: 0 },
            CommandSource::Radio,
            0,
        );
        assert_eq!(status.last_cmd_seq, 7);
        assert_eq!(status.heater_state, HeaterState::Running);
        // Dedup never touches the session/persisted seq.
        assert_eq!(store.seq, 0);
    }

    #[test]
    fn start_then_stop_round_trip() {
        let mut port = FakePort::new();
        port.queue_response(CMD_START_HEAT, &[]);
        let (mut engine, mut store) = make_loop(port);
        engine.state.phase = Phase::Idle;
        let mut clock = FakeClock::at(0);

        let status = engine.dispatch_command(
            &mut clock,
            &mut store,
            1,
            CommandPayload { kind: CommandKind::RunMinutes, minutes: 20 },
            CommandSource::Radio,
            0,
        );
        assert_eq!(status.heater_state, HeaterState::Running);
        assert_eq!(status.minutes_remaining, 20);
        assert_eq!(engine.state.phase, Phase::Running);
        assert_eq!(store.seq, 1);
    }

    #[test]
    fn wbus_failure_sets_error_state_not_sticky() {
        let (mut engine, mut store) = make_loop(FakePort::new()); // no response queued => retries exhaust
        engine.state.phase = Phase::Idle;
        let mut clock = FakeClock::at(0);

        let status = engine.dispatch_command(
            &mut clock,
            &mut store,
            1,
            CommandPayload { kind: CommandKind::Stop, minutes: 0 },
            CommandSource::Radio,
            0,
        );
        assert_eq!(status.heater_state, HeaterState::Error);

        let mut port2 = FakePort::new();
        port2.queue_response(CMD_STOP, &[]);
        // A later *successful* command clears Error (spec.md §4.7: error
        // is not sticky across subsequent successful commands).
        engine.transport_swap_port_for_test(port2);
        let status2 = engine.dispatch_command(
            &mut clock,
            &mut store,
            2,
            CommandPayload { kind: CommandKind::Stop, minutes: 0 },
            CommandSource::Radio,
            0,
        );
        assert_eq!(status2.heater_state, HeaterState::Off);
    }

    #[test]
    fn running_transitions_to_extended_wake_on_observed_off() {
        let (mut engine, _store) = make_loop(FakePort::new());
        engine.state.phase = Phase::Running;
        // FakePort has no queued opstate response, so read_opstate_raw
        // errors out of refresh_from_wbus; drive the "session ended"
        // condition directly rather than through a W-BUS exchange.
        engine.state.session = HeaterSession::none();
        let mut clock = FakeClock::at(10_000);
        let _ = engine.poll_tick(&mut clock, 10_000);
        assert_eq!(engine.state.phase, Phase::ExtendedWake);
        assert_eq!(engine.state.extended_wake_until_ms, 10_000 + RECEIVER_EXTENDED_WAKE_MS);
    }

    #[test]
    fn extended_wake_times_out_to_idle() {
        let (mut engine, _store) = make_loop(FakePort::new());
        engine.state.phase = Phase::ExtendedWake;
        engine.state.extended_wake_until_ms = 5_000;
        let mut clock = FakeClock::at(5_000);
        let _ = engine.poll_tick(&mut clock, 5_000);
        assert_eq!(engine.state.phase, Phase::Idle);
    }

    #[test]
    fn keepalive_sent_once_renewal_window_and_cadence_are_reached() {
        let mut port = FakePort::new();
        port.queue_response(CMD_KEEPALIVE, &[]);
        let (mut engine, _store) = make_loop(port);
        engine.state.phase = Phase::Running;
        engine.state.session = HeaterSession {
            active_cmd: CMD_START_HEAT,
            expiry_ms: 100_000,
            last_keepalive_ms: 0,
        };
        // 30s within expiry (renewal window) and 10s past last_keepalive_ms.
        let mut clock = FakeClock::at(80_000);
        let _ = engine.poll_tick(&mut clock, 80_000);
        assert!(engine.state.session.is_active());
        assert_eq!(engine.state.session.last_keepalive_ms, 80_000);
    }

    #[test]
    fn keepalive_withheld_before_renewal_window_or_cadence() {
        let (mut engine, _store) = make_loop(FakePort::new()); // no response queued
        engine.state.phase = Phase::Running;
        engine.state.session = HeaterSession {
            active_cmd: CMD_START_HEAT,
            expiry_ms: 100_000,
            last_keepalive_ms: 65_000,
        };
        // Inside the renewal window, but under the keep-alive cadence
        // since the last send -- no attempt should be made (a FakePort
        // with nothing queued would fail send_and_confirm and leave
        // last_keepalive_ms untouched either way, but this also confirms
        // no retry storm runs against the W-BUS transport every tick).
        let mut clock = FakeClock::at(70_000);
        let _ = engine.poll_tick(&mut clock, 70_000);
        assert_eq!(engine.state.session.last_keepalive_ms, 65_000);
    }

    #[test]
    fn session_clears_on_expiry() {
        let (mut engine, _store) = make_loop(FakePort::new());
        engine.state.phase = Phase::Running;
        engine.state.session = HeaterSession {
            active_cmd: CMD_START_HEAT,
            expiry_ms: 50_000,
            last_keepalive_ms: 40_000,
        };
        let mut clock = FakeClock::at(50_000);
        let status = engine.poll_tick(&mut clock, 50_000);
        assert!(!engine.state.session.is_active());
        assert_eq!(engine.state.heater_state, HeaterState::Off);
        assert_eq!(status.heater_state, HeaterState::Off);
    }

    impl ReceiverLoop<FakePort> {
        fn transport_swap_port_for_test(&mut self, port: FakePort) {
            self.transport = WBusTransport::new(port, 0xF, 0x4);
        }
    }
}
