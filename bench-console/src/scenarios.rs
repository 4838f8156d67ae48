//! The end-to-end scenarios spec.md §8 names but never wires up as
//! executable tests: happy-path run-for-20, retry absorbs sleep,
//! duplicate suppression after wake, TLV-unsupported fallback,
//! query-without-starting, and timeout surfaced. Each drives a fresh
//! [`Rig`] the way a real Sender and Receiver would drive each other,
//! and is exercised both by `main`'s demo run and by `#[cfg(test)]`.

use wbus_core::codec;
use wbus_core::config::{NODE_RECEIVER, NODE_SENDER, SENDER_ACK_DEADLINE_MS, SENDER_RETRY_PERIOD_MS};
use wbus_core::packet::{CommandKind, HeaterState, Packet};
use wbus_core::receiver::{Phase, TlvSupport};
use wbus_core::sender::SubmitOutcome;

use crate::sim::Rig;

const KEY: [u8; 16] = [0x24u8; 16];
/// Generous upper bound on outer `Rig::step` calls before a scenario
/// gives up and fails loudly rather than looping forever.
const MAX_TICKS: u32 = 4_000;

#[derive(Debug, Clone, Copy)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub ticks: u32,
    pub elapsed_ms: u64,
    pub frames_sent: u32,
    pub outcome: Option<SubmitOutcome>,
}

fn submit_and_drive(rig: &mut Rig, kind: CommandKind, minutes: u8) -> (u16, ScenarioReport) {
    let now0 = rig.clock.peek_ms();
    let seq = rig
        .sender
        .submit(kind, minutes, now0, SENDER_ACK_DEADLINE_MS)
        .expect("no command already pending on a fresh rig");

    let mut outcome = None;
    let mut ticks = 0u32;
    while outcome.is_none() && ticks < MAX_TICKS {
        outcome = rig.step(SENDER_RETRY_PERIOD_MS);
        ticks += 1;
    }

    let report = ScenarioReport {
        name: "",
        ticks,
        elapsed_ms: rig.clock.peek_ms(),
        frames_sent: rig.sender_tx_count(),
        outcome,
    };
    (seq, report)
}

fn run_to_completion(rig: &mut Rig, kind: CommandKind, minutes: u8) -> ScenarioReport {
    submit_and_drive(rig, kind, minutes).1
}

/// Submit `RunMinutes(20)` against a freshly booted pair and expect it to
/// complete normally, within one or two Receiver wake cycles.
pub fn happy_path_run_for_20() -> ScenarioReport {
    let mut rig = Rig::new(KEY);
    rig.boot_receiver();

    let mut report = run_to_completion(&mut rig, CommandKind::RunMinutes, 20);
    report.name = "happy-path-run-for-20";

    match report.outcome {
        Some(SubmitOutcome::Ok(status)) => {
            assert_eq!(status.heater_state, HeaterState::Running);
            assert_eq!(status.minutes_remaining, 20);
        }
        other => panic!("expected Ok, got {other:?}"),
    }
    report
}

/// The Receiver is asleep when the Sender first starts retransmitting;
/// several retries land while it's down before a later wake catches one.
/// The Sender must still complete the command once that happens.
pub fn sender_retry_absorbs_sleep() -> ScenarioReport {
    let mut rig = Rig::new(KEY);
    rig.boot_receiver();

    let mut report = run_to_completion(&mut rig, CommandKind::Stop, 0);
    report.name = "sender-retry-absorbs-sleep";

    match report.outcome {
        Some(SubmitOutcome::Ok(status)) => assert_eq!(status.heater_state, HeaterState::Off),
        other => panic!("expected Ok, got {other:?}"),
    }
    assert!(
        report.frames_sent >= 2,
        "expected at least one retransmission before the Receiver caught it, got {}",
        report.frames_sent
    );
    report
}

/// After a command has already been dispatched and ACKed once, three
/// more copies of the same (seq-bearing) frame arrive -- as a retrying
/// Sender's earlier transmissions would, landing late. None of them may
/// re-execute against the heater or disturb the persisted sequence.
pub fn duplicate_suppressed_after_wake() -> ScenarioReport {
    let mut rig = Rig::new(KEY);
    rig.boot_receiver();

    let (seq, mut report) = submit_and_drive(&mut rig, CommandKind::Stop, 0);
    report.name = "duplicate-suppression-after-wake";
    assert!(matches!(report.outcome, Some(SubmitOutcome::Ok(_))));

    let seq_before = rig.receiver.state.last_processed_seq;
    let heater_state_before = rig.receiver.state.heater_state;

    let dup = Packet::command(NODE_SENDER, NODE_RECEIVER, seq, CommandKind::Stop, 0);
    for _ in 0..3 {
        let frame = codec::encrypt_and_encode(&KEY, &dup).expect("encode duplicate command");
        rig.inject_into_receiver(&frame);
        rig.step_receiver_only();
    }

    assert_eq!(rig.receiver.state.last_processed_seq, seq_before);
    assert_eq!(rig.receiver.state.heater_state, heater_state_before);
    report
}

/// The simulated heater never answers the TLV multi-status probe, so
/// boot must settle on the simple-page fallback, and a status refresh
/// must leave the wattage field at zero rather than stale or guessed.
pub fn tlv_unsupported_fallback() -> ScenarioReport {
    let mut rig = Rig::new(KEY);
    rig.boot_receiver();
    assert_eq!(rig.receiver.state.tlv_support, TlvSupport::No);

    let mut report = run_to_completion(&mut rig, CommandKind::QueryStatus, 0);
    report.name = "tlv-unsupported-fallback";

    match report.outcome {
        Some(SubmitOutcome::Ok(status)) => {
            assert_ne!(status.temp_packed, 0);
            assert_ne!(status.voltage_packed, 0);
            assert_eq!(status.power_packed, 0);
        }
        other => panic!("expected Ok, got {other:?}"),
    }
    report
}

/// A bare status query against a heater that was never started must not
/// touch the heater's running state at all.
pub fn query_without_starting() -> ScenarioReport {
    let mut rig = Rig::new(KEY);
    rig.boot_receiver();

    let mut report = run_to_completion(&mut rig, CommandKind::QueryStatus, 0);
    report.name = "query-without-starting";

    match report.outcome {
        Some(SubmitOutcome::Ok(status)) => {
            assert_eq!(status.heater_state, HeaterState::Off);
            assert_eq!(status.minutes_remaining, 0);
        }
        other => panic!("expected Ok, got {other:?}"),
    }
    assert_eq!(rig.receiver.state.phase, Phase::Idle);
    report
}

/// The air link is down for the whole exchange (antenna pulled); the
/// Sender must surface `TimedOut` once its ACK deadline elapses rather
/// than hang forever.
pub fn timeout_surfaced() -> ScenarioReport {
    let mut rig = Rig::new(KEY);
    rig.boot_receiver();
    rig.set_link_up(false);

    let mut report = run_to_completion(&mut rig, CommandKind::Stop, 0);
    report.name = "timeout-surfaced";
    assert_eq!(report.outcome, Some(SubmitOutcome::TimedOut));
    report
}

/// All six scenarios, in the order spec.md §8 lists them.
pub fn all() -> Vec<ScenarioReport> {
    vec![
        happy_path_run_for_20(),
        sender_retry_absorbs_sleep(),
        duplicate_suppressed_after_wake(),
        tlv_unsupported_fallback(),
        query_without_starting(),
        timeout_surfaced(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_completes() {
        happy_path_run_for_20();
    }

    #[test]
    fn retry_absorbs_sleep() {
        sender_retry_absorbs_sleep();
    }

    #[test]
    fn duplicates_are_suppressed() {
        duplicate_suppressed_after_wake();
    }

    #[test]
    fn tlv_fallback_leaves_power_unset() {
        tlv_unsupported_fallback();
    }

    #[test]
    fn query_never_touches_heater() {
        query_without_starting();
    }

    #[test]
    fn dead_air_times_out() {
        timeout_surfaced();
    }
}
