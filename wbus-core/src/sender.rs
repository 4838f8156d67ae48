//! Sender command/ACK engine (spec.md §4.6): submit, retry on a fixed
//! cadence, complete when a Status echoes the outstanding sequence, or
//! time out.

use crate::codec;
use crate::config::{NODE_RECEIVER, NODE_SENDER};
use crate::error::SubmitError;
use crate::packet::{CommandKind, Packet, Payload, StatusPayload};
use crate::radio::RadioLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Ok(StatusPayload),
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    seq: u16,
    kind: CommandKind,
    minutes: u8,
    next_send_ms: u64,
    deadline_ms: u64,
}

/// At most one command outstanding at a time (spec.md §4.6 Ordering).
pub struct SenderEngine {
    key: [u8; 16],
    seq_counter: u16,
    pending: Option<PendingCommand>,
    pub last_status: Option<StatusPayload>,
}

impl SenderEngine {
    pub fn new(key: [u8; 16]) -> Self {
        Self {
            key,
            seq_counter: 0,
            pending: None,
            last_status: None,
        }
    }

    fn next_seq(&mut self) -> u16 {
        // Initialized to 1, wrap-permitted (spec.md §3 Lifecycles).
        self.seq_counter = self.seq_counter.wrapping_add(1);
        if self.seq_counter == 0 {
            self.seq_counter = 1;
        }
        self.seq_counter
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Allocate a sequence number and record the outstanding command. A
    /// second `submit` while one is pending is a usage error.
    pub fn submit(
        &mut self,
        kind: CommandKind,
        minutes: u8,
        now_ms: u64,
        ack_deadline_ms: u64,
    ) -> Result<u16, SubmitError> {
        if self.pending.is_some() {
            return Err(SubmitError::RejectedPreFlight);
        }
        let seq = self.next_seq();
        self.pending = Some(PendingCommand {
            seq,
            kind,
            minutes,
            next_send_ms: now_ms,
            deadline_ms: now_ms + ack_deadline_ms,
        });
        Ok(seq)
    }

    /// Drive the outstanding command one step: (re)transmit if the next
    /// send time has arrived, drain one incoming radio frame, and check
    /// the deadline. Returns `Some` once the command finishes, one way
    /// or another; the caller keeps polling (ideally at its own cadence,
    /// e.g. every retry tick) until it does.
    pub fn poll<R: RadioLink>(
        &mut self,
        radio: &mut R,
        now_ms: u64,
        retry_period_ms: u64,
    ) -> Option<SubmitOutcome> {
        let pending = self.pending?;

        if now_ms >= pending.next_send_ms {
            let packet = Packet::command(NODE_SENDER, NODE_RECEIVER, pending.seq, pending.kind, pending.minutes);
            if let Ok(frame) = codec::encrypt_and_encode(&self.key, &packet) {
                let _ = radio.send(&frame);
            }
            if let Some(p) = self.pending.as_mut() {
                p.next_send_ms = now_ms + retry_period_ms;
            }
        }

        if let Ok(Some(mut rx)) = radio.try_recv() {
            if let Ok(pkt) = codec::decrypt_and_decode(&self.key, &mut rx.data) {
                if let Payload::Status(status) = pkt.payload {
                    if pkt.src == NODE_RECEIVER && status.last_cmd_seq == pending.seq {
                        self.pending = None;
                        self.last_status = Some(status);
                        return Some(SubmitOutcome::Ok(status));
                    }
                    // A Status that doesn't correlate updates display-only
                    // state but never completes the command (spec.md §5).
                    self.last_status = Some(status);
                }
            }
        }

        if now_ms >= pending.deadline_ms {
            self.pending = None;
            return Some(SubmitOutcome::TimedOut);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HeaterState;
    use crate::radio::RxFrame;
    use heapless::Deque;

    struct FakeRadio {
        sent: Vec<heapless::Vec<u8, { crate::packet::MAX_WIRE_LEN }>>,
        inbox: Deque<RxFrame, 8>,
    }

    impl FakeRadio {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                inbox: Deque::new(),
            }
        }
    }

    impl RadioLink for FakeRadio {
        type Error = ();
        fn send(&mut self, frame: &[u8]) -> Result<(), ()> {
            let mut v = heapless::Vec::new();
            let _ = v.extend_from_slice(frame);
            self.sent.push(v);
            Ok(())
        }
        fn try_recv(&mut self) -> Result<Option<RxFrame>, ()> {
            Ok(self.inbox.pop_front())
        }
        fn sleep(&mut self) {}
        fn receive(&mut self) {}
        fn idle(&mut self) {}
    }

    fn push_status(radio: &mut FakeRadio, key: &[u8; 16], seq: u16, last_cmd_seq: u16) {
        let status = StatusPayload {
            heater_state: HeaterState::Running,
            minutes_remaining: 19,
            rssi_dbm: -40,
            snr_db: 8,
            last_opstate: 0xA1,
            last_error: 0,
            last_cmd_seq,
            temp_packed: 0,
            voltage_packed: 0,
            power_packed: 0,
        };
        let pkt = Packet::status(NODE_RECEIVER, NODE_SENDER, seq, status);
        let frame = codec::encrypt_and_encode(key, &pkt).unwrap();
        radio.inbox.push_back(RxFrame {
            data: frame,
            rssi_dbm: -40,
            snr_db: 8,
        }).ok();
    }

    #[test]
    fn happy_path_completes_on_correlated_status() {
        let key = [0x55u8; 16];
        let mut sender = SenderEngine::new(key);
        let mut radio = FakeRadio::new();
        let seq = sender.submit(CommandKind::RunMinutes, 20, 0, 10_000).unwrap();

        assert!(sender.poll(&mut radio, 0, 1_000).is_none());
        assert_eq!(radio.sent.len(), 1);

        push_status(&mut radio, &key, 1, seq);
        let outcome = sender.poll(&mut radio, 100, 1_000);
        match outcome {
            Some(SubmitOutcome::Ok(status)) => assert_eq!(status.last_cmd_seq, seq),
            other => panic!("expected Ok, got {other:?}"),
        }
        assert!(!sender.has_pending());
    }

    #[test]
    fn retries_on_fixed_cadence() {
        let key = [0x66u8; 16];
        let mut sender = SenderEngine::new(key);
        let mut radio = FakeRadio::new();
        sender.submit(CommandKind::Stop, 0, 0, 10_000).unwrap();

        sender.poll(&mut radio, 0, 1_000);
        sender.poll(&mut radio, 500, 1_000); // too soon, no resend
        assert_eq!(radio.sent.len(), 1);
        sender.poll(&mut radio, 1_000, 1_000); // retry cadence elapsed
        assert_eq!(radio.sent.len(), 2);
    }

    #[test]
    fn non_correlated_status_does_not_complete() {
        let key = [0x77u8; 16];
        let mut sender = SenderEngine::new(key);
        let mut radio = FakeRadio::new();
        sender.submit(CommandKind::Stop, 0, 0, 10_000).unwrap();
        sender.poll(&mut radio, 0, 1_000);

        push_status(&mut radio, &key, 1, 9999); // wrong seq
        assert!(sender.poll(&mut radio, 100, 1_000).is_none());
        assert!(sender.has_pending());
        assert_eq!(sender.last_status.unwrap().last_cmd_seq, 9999);
    }

    #[test]
    fn times_out_after_deadline() {
        let key = [0x88u8; 16];
        let mut sender = SenderEngine::new(key);
        let mut radio = FakeRadio::new();
        sender.submit(CommandKind::Stop, 0, 0, 10_000).unwrap();

        let outcome = sender.poll(&mut radio, 10_000, 1_000);
        assert_eq!(outcome, Some(SubmitOutcome::TimedOut));
        assert!(!sender.has_pending());
    }

    #[test]
    fn second_submit_while_pending_is_rejected() {
        let mut sender = SenderEngine::new([0x99u8; 16]);
        sender.submit(CommandKind::Stop, 0, 0, 10_000).unwrap();
        let err = sender.submit(CommandKind::Start, 10, 0, 10_000).unwrap_err();
        assert_eq!(err, SubmitError::RejectedPreFlight);
    }
}
