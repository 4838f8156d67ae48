//! Error taxonomy (spec.md §7). Every variant here is recovered locally by
//! its caller; nothing here is meant to cross the radio link.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// Wire size out of range for the declared `type`, or truncated input.
    Malformed,
    /// CRC-16/CCITT over the received bytes did not match.
    CrcMismatch,
    /// `magic_version` did not match this protocol generation.
    WrongMagic,
    /// `type` byte did not name a known payload kind.
    UnknownType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WBusError {
    /// No valid response frame arrived within the read window.
    Timeout,
    /// A response frame arrived but didn't match the command it answers.
    UnexpectedResponse,
    /// `send_and_confirm` exhausted its retries without a matching echo.
    CommandFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubmitError {
    /// `submit` was rejected before anything was sent: a command is
    /// already outstanding, at most one may be in flight.
    RejectedPreFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError {
    /// Wire layout of the incoming command payload didn't parse.
    Malformed,
    /// Command's carried timestamp is older than the staleness threshold.
    StaleCommand,
}
