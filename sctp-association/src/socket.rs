//! The boundary to an externally implemented SCTP engine (the dcsctp/usrsctp
//! integration pattern): a callback vtable the association drives on one
//! side and feeds events into on the other. This crate does not implement
//! the SCTP protocol itself — `SctpSocket` is a trait a real engine binding
//! satisfies; [`crate::association`] only ever calls into it and reacts to
//! the notifications it reports back through [`SctpSocketEvents`].

use std::time::Duration;

use bytes::Bytes;

/// Opaque handle to a timer registered through [`SctpTimerCallbacks`].
///
/// Allocated and owned by the association (see [`crate::timer`]); the engine
/// only ever echoes ids it was handed back in `timeout_start`/`timeout_stop`.
pub type TimerId = usize;

/// SCTP payload protocol identifier, carried alongside each received/sent
/// message.
pub type Ppid = u32;

/// Outcome of a one-shot operation requested on the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketStatus {
    Ok,
    /// The engine could not accept the call in its current internal state.
    NotReady,
    /// The payload exceeds the negotiated message size.
    MessageTooLarge,
}

/// Coarse classification of engine-reported failures, used to decide whether
/// the association force-closes or merely logs and forwards a diagnostic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SctpErrorKind {
    TooManyRetries,
    PeerReported,
    Other,
}

/// Partial reliability policy for an individual message, as negotiated per
/// RFC 3758.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartialReliability {
    Reliable,
    TimeToLive(u32),
    MaxRetransmissions(u32),
    /// Reserved for a future send-buffer policy; carries no behavior yet.
    Buffer(u32),
}

/// Negotiated options for a freshly allocated socket, built by
/// [`crate::association::Association::connect`].
#[derive(Debug, Clone)]
pub struct Options {
    pub local_port: u16,
    pub remote_port: u16,
    pub max_message_size: usize,
    pub max_timer_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub max_retransmissions: u32,
    /// `None` means unlimited, matching the original's `-1` sentinel without
    /// reusing it as a magic number.
    pub max_init_retransmits: Option<u32>,
}

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;
pub const DEFAULT_MAX_TIMER_BACKOFF: Duration = Duration::from_secs(3);
pub const AGGRESSIVE_HEARTBEAT: Duration = Duration::from_secs(3);
pub const RELAXED_HEARTBEAT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRANSMISSIONS: u32 = 3;

/// A diagnostic surfaced for an error/abort that did not warrant a state
/// change, for an application-level metrics consumer to observe.
#[derive(Debug, Clone)]
pub struct SocketDiagnostic {
    pub kind: SctpErrorKind,
    pub message: String,
}

/// The engine side of the vtable: operations the association drives.
///
/// A real binding owns the actual SCTP stack and reports everything it does
/// back through the [`SctpSocketEvents`]/[`SctpTimerCallbacks`] sinks it was
/// constructed with; this trait only covers the calls made *into* it.
pub trait SctpSocket: Send {
    /// Hand a raw datagram that arrived over the wire to the engine for
    /// decoding, mirroring the usrsctp idiom of "sending" inbound bytes into
    /// the stack's socket representation. Outbound bytes the engine produces
    /// in response come back through
    /// [`SctpSocketEvents::on_outbound_packet`], not as a return value here.
    fn send_packet(&mut self, data: &[u8]) -> SocketStatus;

    /// Queue a message for delivery on `stream_id`.
    fn send_data(
        &mut self,
        stream_id: u16,
        ppid: Ppid,
        payload: Bytes,
        ordered: bool,
        reliability: PartialReliability,
    ) -> SocketStatus;

    /// Begin the outgoing half of a stream reset for `stream_id`.
    fn reset_stream(&mut self, stream_id: u16) -> SocketStatus;

    /// Begin a graceful SCTP shutdown.
    fn shutdown(&mut self);

    /// Tear the engine down immediately; never fails.
    fn close(&mut self);

    /// A timer previously created via [`SctpTimerCallbacks::timeout_create`]
    /// has expired.
    fn handle_timeout(&mut self, id: TimerId);
}

/// The reverse direction of the vtable: notifications the engine reports as
/// it processes packets and timers. Implemented by the association's event
/// loop and handed to the engine at construction.
pub trait SctpSocketEvents: Send {
    /// The engine has framed a packet it wants written to the wire.
    fn on_outbound_packet(&mut self, data: &[u8]);
    fn on_message_received(&mut self, stream_id: u16, ppid: Ppid, payload: Bytes);
    fn on_error(&mut self, kind: SctpErrorKind, msg: &str);
    fn on_aborted(&mut self, kind: SctpErrorKind, msg: &str);
    fn on_connected(&mut self);
    fn on_closed(&mut self);
    fn on_connection_restarted(&mut self);
    fn on_streams_reset_failed(&mut self, stream_ids: &[u16]);
    fn on_streams_reset_performed(&mut self, stream_ids: &[u16]);
    fn on_incoming_streams_reset(&mut self, stream_ids: &[u16]);
    fn on_buffered_amount_low(&mut self, stream_id: u16);
    fn on_total_buffered_amount_low(&mut self);
}

/// Timer service the engine uses instead of owning its own clock/executor.
/// Implemented by the association; ids are allocated by
/// [`timeout_create`](SctpTimerCallbacks::timeout_create) and echoed back
/// unchanged by the engine in subsequent calls.
pub trait SctpTimerCallbacks: Send {
    fn timeout_create(&mut self, id: TimerId, duration: Duration);
    fn timeout_delete(&mut self, id: TimerId);
    fn timeout_start(&mut self, id: TimerId, duration: Duration);
    fn timeout_stop(&mut self, id: TimerId);
}

/// Current wall-clock time in milliseconds, for engines that need it and
/// would otherwise have to depend on a platform clock themselves.
pub fn time_millis(clock_start: std::time::Instant) -> u64 {
    clock_start.elapsed().as_millis() as u64
}

/// A random `u32`, handed to engines that need one (INIT tags, etc.) without
/// pulling `rand` in as a direct dependency of their own.
pub fn get_random_int() -> u32 {
    rand::random()
}
