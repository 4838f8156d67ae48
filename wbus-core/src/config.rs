//! Compile-time configuration knobs. Grouped as plain `const`s, the way
//! the teacher's firmware binaries keep their pin/timing constants at the
//! top of `main.rs` rather than behind a runtime config struct — these
//! values are contracts, not something either node negotiates at runtime.

/// Sender: how often an unacknowledged command is retransmitted.
pub const SENDER_RETRY_PERIOD_MS: u64 = 1_000;
/// Sender: total time a `submit` is allowed to wait for a correlated Status.
pub const SENDER_ACK_DEADLINE_MS: u64 = 10_000;

/// Receiver: sleep duration between idle listen windows.
///
/// Ignored (loop stays in the listen window forever) when the
/// `disable-sleep` feature is enabled on `receiver-firmware` — see
/// `DISABLE_SLEEP` in spec.md §9.
pub const RECEIVER_IDLE_SLEEP_MS: u64 = 4_000;
/// Receiver: how long the radio is kept in receive mode each idle wake.
pub const RECEIVER_IDLE_LISTEN_WINDOW_MS: u64 = 400;
/// Receiver: how long to stay fully awake after the heater reports Off.
pub const RECEIVER_EXTENDED_WAKE_MS: u64 = 60_000;
/// Receiver: polling/status-emission cadence while Running or in extended wake.
pub const RECEIVER_POLL_PERIOD_MS: u64 = 2_000;

/// W-BUS UART: 2400 baud, 8 data bits, even parity, 1 stop bit.
pub const WBUS_BAUD: u32 = 2_400;
/// W-BUS: time allowed for a single command/response exchange.
pub const WBUS_RESPONSE_TIMEOUT_MS: u32 = 250;
/// W-BUS: command dispatch retries before reporting `WBusCommandFailed`.
pub const WBUS_COMMAND_RETRIES: u8 = 3;

/// Keep-alive period while a heater session (heat/vent) is active.
pub const SESSION_KEEPALIVE_PERIOD_MS: u64 = 10_000;
/// Session renewal threshold: refresh expiry once this close to it.
pub const SESSION_RENEWAL_THRESHOLD_MS: u64 = 30_000;

/// MQTT: a command older than this (its carried timestamp vs. now) is stale.
pub const MQTT_STALE_COMMAND_THRESHOLD_S: u32 = 3_600;

/// Node identifiers, drawn from the small fixed namespace in spec.md §3.
pub const NODE_SENDER: u8 = 1;
pub const NODE_RECEIVER: u8 = 2;
