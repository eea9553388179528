//! Transport-wide congestion control bookkeeping: stamping outbound RTP
//! packets with transport-wide sequence numbers, encoding/parsing the RTCP
//! TWCC feedback that reports their fate, and deriving windowed statistics
//! and FEC/RTX recovery from it.
//!
//! This crate produces facts for an external congestion controller; it does
//! not estimate bandwidth, pace packets, or retransmit anything itself.

#![warn(rust_2018_idioms)]

pub mod encoder;
pub mod parser;
pub mod redundancy;
pub mod registry;
pub mod ring;
pub mod sent_packet;
pub mod seq;
pub mod stamper;
pub mod stats;

pub use encoder::{Encoder, EncoderConfig, RecvEvent};
pub use parser::{Parser, ParserConfig};
pub use redundancy::RedundancyBookkeeper;
pub use registry::SequenceRegistry;
pub use ring::SentPacketRing;
pub use sent_packet::{PacketState, SentPacket};
pub use seq::TwccSeq;
pub use stamper::Stamper;
pub use stats::{compute as compute_window_stats, PtStats, WindowConfig, WindowStats};
