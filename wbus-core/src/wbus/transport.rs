//! Byte-level W-BUS framing (spec.md §4.4): the receive state machine,
//! the transmit framer, and the once-per-power-on break pulse.

use heapless::Vec;

use crate::error::WBusError;

pub const MAX_WBUS_FRAME: usize = 256;

pub const CONTROLLER_TO_HEATER: u8 = 0xF4;
pub const HEATER_TO_CONTROLLER: u8 = 0x4F;

/// A validated W-BUS frame: `header` plus payload (command/response byte
/// followed by any data), checksum already verified and stripped.
#[derive(Debug, Clone)]
pub struct WBusFrame {
    pub header: u8,
    pub payload: Vec<u8, MAX_WBUS_FRAME>,
}

#[derive(Debug, Clone)]
enum RxState {
    FindHeader,
    ReadLength { header: u8 },
    ReadPayload {
        header: u8,
        length: u8,
        buf: Vec<u8, MAX_WBUS_FRAME>,
    },
}

/// The three-state receive machine from spec.md §4.4. Always returns to
/// `FindHeader` after a frame, valid or not.
pub struct WBusReceiver {
    state: RxState,
    queue: Option<WBusFrame>,
}

impl Default for WBusReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl WBusReceiver {
    pub fn new() -> Self {
        Self {
            state: RxState::FindHeader,
            queue: None,
        }
    }

    /// Feed one received byte through the state machine. A newly valid
    /// frame replaces whatever was queued (single-slot, newest wins).
    pub fn push_byte(&mut self, byte: u8) {
        self.state = match core::mem::replace(&mut self.state, RxState::FindHeader) {
            RxState::FindHeader => {
                if byte == CONTROLLER_TO_HEATER || byte == HEATER_TO_CONTROLLER {
                    RxState::ReadLength { header: byte }
                } else {
                    RxState::FindHeader
                }
            }
            RxState::ReadLength { header } => {
                if (2..=254).contains(&byte) {
                    RxState::ReadPayload {
                        header,
                        length: byte,
                        buf: Vec::new(),
                    }
                } else {
                    RxState::FindHeader
                }
            }
            RxState::ReadPayload {
                header,
                length,
                mut buf,
            } => {
                let _ = buf.push(byte);
                if buf.len() as u8 == length {
                    let checksum_byte = buf[buf.len() - 1];
                    let mut computed = header ^ length;
                    for &b in &buf[..buf.len() - 1] {
                        computed ^= b;
                    }
                    if computed == checksum_byte {
                        let mut payload = Vec::new();
                        let _ = payload.extend_from_slice(&buf[..buf.len() - 1]);
                        self.queue = Some(WBusFrame { header, payload });
                    }
                    RxState::FindHeader
                } else {
                    RxState::ReadPayload { header, length, buf }
                }
            }
        };
    }

    pub fn take_frame(&mut self) -> Option<WBusFrame> {
        self.queue.take()
    }
}

/// Build a transmit frame: `header | length | cmd | data | checksum`.
/// `length` counts the command byte, the data bytes, and the checksum
/// byte itself.
pub fn build_frame(
    controller_addr: u8,
    heater_addr: u8,
    cmd: u8,
    data: &[u8],
) -> Vec<u8, MAX_WBUS_FRAME> {
    let header = (controller_addr << 4) | heater_addr;
    let length = (1 + data.len() + 1) as u8;
    let mut checksum = header ^ length ^ cmd;
    for &b in data {
        checksum ^= b;
    }

    let mut out = Vec::new();
    let _ = out.push(header);
    let _ = out.push(length);
    let _ = out.push(cmd);
    let _ = out.extend_from_slice(data);
    let _ = out.push(checksum);
    out
}

/// Non-blocking byte I/O for the single-wire UART, plus the GPIO control
/// the break pulse needs. An optional half-duplex enable/transmit-gate
/// line is driven via `set_enable`; drivers without one may no-op it.
pub trait WBusPort {
    type Error;

    fn write_byte(&mut self, byte: u8) -> nb::Result<(), Self::Error>;
    fn read_byte(&mut self) -> nb::Result<u8, Self::Error>;
    fn flush(&mut self) -> Result<(), Self::Error>;

    fn set_enable(&mut self, asserted: bool);
    fn disable_uart(&mut self);
    fn enable_uart(&mut self);
    fn set_line_high(&mut self);
    fn set_line_low(&mut self);
}

/// Monotonic clock + delay source. `read_packet`'s bounded poll and the
/// break pulse are the only places this crate suspends its caller
/// (spec.md §5).
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u32);
}

/// Frame-level I/O to the heater over W-BUS (spec.md §4.4).
pub struct WBusTransport<P: WBusPort> {
    port: P,
    rx: WBusReceiver,
    break_done: bool,
    controller_addr: u8,
    heater_addr: u8,
}

impl<P: WBusPort> WBusTransport<P> {
    pub fn new(port: P, controller_addr: u8, heater_addr: u8) -> Self {
        Self {
            port,
            rx: WBusReceiver::new(),
            break_done: false,
            controller_addr,
            heater_addr,
        }
    }

    /// Lazily perform, exactly once per power-on: disable UART, line high
    /// ~1 s, line low ~50 ms, line high ~50 ms, re-enable UART.
    pub fn ensure_break(&mut self, clock: &mut impl Clock) {
        if self.break_done {
            return;
        }
        self.port.disable_uart();
        self.port.set_line_high();
        clock.delay_ms(1_000);
        self.port.set_line_low();
        clock.delay_ms(50);
        self.port.set_line_high();
        clock.delay_ms(50);
        self.port.enable_uart();
        self.break_done = true;
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), P::Error> {
        for &b in bytes {
            loop {
                match self.port.write_byte(b) {
                    Ok(()) => break,
                    Err(nb::Error::WouldBlock) => continue,
                    Err(nb::Error::Other(e)) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Send one W-BUS command frame: asserts the break pulse if it hasn't
    /// run yet, then composes, writes, flushes, and drops the enable
    /// line (spec.md §4.4 transmit path).
    pub fn send_command(
        &mut self,
        clock: &mut impl Clock,
        cmd: u8,
        data: &[u8],
    ) -> Result<(), WBusError> {
        self.ensure_break(clock);
        let frame = build_frame(self.controller_addr, self.heater_addr, cmd, data);
        self.port.set_enable(true);
        let result = self.write_all(&frame).and_then(|_| self.port.flush());
        self.port.set_enable(false);
        result.map_err(|_| WBusError::CommandFailed)
    }

    fn service_rx(&mut self) {
        while let Ok(byte) = self.port.read_byte() {
            self.rx.push_byte(byte);
        }
    }

    /// Poll the state machine and the single-slot queue until a valid
    /// frame arrives or `timeout_ms` elapses.
    pub fn read_packet(&mut self, clock: &mut impl Clock, timeout_ms: u32) -> Option<WBusFrame> {
        let deadline = clock.now_ms() + timeout_ms as u64;
        loop {
            self.service_rx();
            if let Some(frame) = self.rx.take_frame() {
                return Some(frame);
            }
            if clock.now_ms() >= deadline {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_frame() {
        let mut rx = WBusReceiver::new();
        let frame = build_frame(0xF, 0x4, 0x10, &[]);
        for b in frame {
            rx.push_byte(b);
        }
        let got = rx.take_frame().expect("frame");
        assert_eq!(got.header, CONTROLLER_TO_HEATER);
        assert_eq!(got.payload.as_slice(), &[0x10]);
    }

    #[test]
    fn discards_bytes_before_header() {
        let mut rx = WBusReceiver::new();
        rx.push_byte(0xAA);
        rx.push_byte(0xBB);
        let frame = build_frame(0x4, 0xF, 0xD0, &[0x07, 0x00]);
        for b in frame {
            rx.push_byte(b);
        }
        assert!(rx.take_frame().is_some());
    }

    #[test]
    fn rejects_length_below_minimum() {
        let mut rx = WBusReceiver::new();
        rx.push_byte(HEATER_TO_CONTROLLER);
        rx.push_byte(1); // length must be >= 2
        // Should be back in FindHeader; feeding a valid frame now works.
        let frame = build_frame(0x4, 0xF, 0x10, &[]);
        for b in frame {
            rx.push_byte(b);
        }
        assert!(rx.take_frame().is_some());
    }

    #[test]
    fn rejects_checksum_mismatch_and_resets() {
        let mut rx = WBusReceiver::new();
        let mut frame = build_frame(0xF, 0x4, 0x10, &[]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        for b in frame {
            rx.push_byte(b);
        }
        assert!(rx.take_frame().is_none());

        // State machine must have returned to FindHeader and accept the
        // next frame cleanly.
        let good = build_frame(0xF, 0x4, 0x21, &[20]);
        for b in good {
            rx.push_byte(b);
        }
        assert!(rx.take_frame().is_some());
    }

    #[test]
    fn newest_valid_frame_wins_single_slot() {
        let mut rx = WBusReceiver::new();
        for b in build_frame(0xF, 0x4, 0x10, &[]) {
            rx.push_byte(b);
        }
        for b in build_frame(0xF, 0x4, 0x21, &[30]) {
            rx.push_byte(b);
        }
        let got = rx.take_frame().unwrap();
        assert_eq!(got.payload.as_slice(), &[0x21, 30]);
    }

    #[test]
    fn build_frame_checksum_matches_spec_formula() {
        let frame = build_frame(0xF, 0x4, 0x21, &[20]);
        // header=0xF4 length=3(cmd+data+csum) cmd=0x21 data=[20]
        assert_eq!(frame[0], 0xF4);
        assert_eq!(frame[1], 3);
        assert_eq!(frame[2], 0x21);
        assert_eq!(frame[3], 20);
        let expected = 0xF4u8 ^ 3 ^ 0x21 ^ 20;
        assert_eq!(frame[4], expected);
    }
}
