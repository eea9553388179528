//! A single-event-loop wrapper around an externally supplied SCTP engine
//! (the dcsctp/usrsctp callback-vtable integration pattern): drives the
//! engine through its connection lifecycle, tracks per-stream reset
//! handshakes in both directions, and bridges its callbacks to upstream
//! producers/consumers without ever invoking them while holding the
//! association's internal lock.
//!
//! This crate does not implement the SCTP protocol itself; see
//! [`socket::SctpSocket`] for the boundary it drives.

#![warn(rust_2018_idioms)]

mod association;
mod socket;
mod stream;
mod timer;

pub use association::{AssocState, Association, Callbacks, EngineSink, SocketFactory};
pub use socket::{
    get_random_int, time_millis, Options, PartialReliability, Ppid, SctpErrorKind, SctpSocket,
    SctpSocketEvents, SctpTimerCallbacks, SocketDiagnostic, SocketStatus, TimerId,
    AGGRESSIVE_HEARTBEAT, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_RETRANSMISSIONS,
    DEFAULT_MAX_TIMER_BACKOFF, RELAXED_HEARTBEAT,
};
