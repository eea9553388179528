//! The send-side per-packet record (spec §3 `SentPacket`) and its state
//! machine.

use crate::seq::TwccSeq;
use shared::time::MonoNanos;

/// Ordered `Unknown < Lost < Recovered < Received`. The enum's declaration
/// order is left in the more natural "nothing yet, then the two final
/// outcomes" reading order; ordering is driven by `rank`, not by derive, per
/// DESIGN.md's decision on `better_state`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketState {
    Unknown,
    Received,
    Recovered,
    Lost,
}

fn rank(state: PacketState) -> u8 {
    match state {
        PacketState::Unknown => 0,
        PacketState::Lost => 1,
        PacketState::Recovered => 2,
        PacketState::Received => 3,
    }
}

/// Applies the monotone-improvement rule: `new` only takes effect if it
/// outranks `cur`. Returns the resulting state (unchanged if `new` does not
/// improve on `cur`).
pub fn better_state(cur: PacketState, new: PacketState) -> PacketState {
    if rank(new) > rank(cur) {
        new
    } else {
        cur
    }
}

/// DESIGN NOTES §9: rather than mutating `protects_seqnums` from original to
/// twcc sequence numbers in place, the two representations are distinct
/// tagged variants.
#[derive(Debug, Clone)]
pub enum Protects {
    ByOriginal(Vec<u16>),
    ByTwcc(Vec<TwccSeq>),
}

/// Position of a redundancy (RTX/FEC) packet inside its protection block.
#[derive(Debug, Copy, Clone)]
pub struct RedundancyInfo {
    pub protects_ssrc: u32,
    pub redundant_idx: u16,
    pub redundant_num: u16,
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub twcc_seq: TwccSeq,
    pub original_seq: u16,
    pub ssrc: u32,
    pub payload_type: u8,
    pub size_bytes: u32,

    pub local_ts: MonoNanos,
    pub socket_ts: Option<MonoNanos>,
    pub remote_ts: Option<MonoNanos>,

    pub state: PacketState,

    pub redundancy: Option<RedundancyInfo>,
    pub protects: Option<Protects>,

    pub stats_processed: bool,
}

impl SentPacket {
    pub fn new(
        twcc_seq: TwccSeq,
        original_seq: u16,
        ssrc: u32,
        payload_type: u8,
        size_bytes: u32,
        local_ts: MonoNanos,
    ) -> Self {
        Self {
            twcc_seq,
            original_seq,
            ssrc,
            payload_type,
            size_bytes,
            local_ts,
            socket_ts: None,
            remote_ts: None,
            state: PacketState::Unknown,
            redundancy: None,
            protects: None,
            stats_processed: false,
        }
    }

    pub fn is_redundant(&self) -> bool {
        self.redundancy.is_some()
    }

    /// Applies `better_state`; returns `true` if the state actually changed.
    pub fn apply_state(&mut self, new: PacketState, remote_ts: Option<MonoNanos>) -> bool {
        let updated = better_state(self.state, new);
        if updated != self.state {
            self.state = updated;
            if let Some(ts) = remote_ts {
                self.remote_ts = Some(ts);
            }
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn better_state_only_improves() {
        assert_eq!(better_state(PacketState::Unknown, PacketState::Lost), PacketState::Lost);
        assert_eq!(
            better_state(PacketState::Lost, PacketState::Recovered),
            PacketState::Recovered
        );
        assert_eq!(
            better_state(PacketState::Received, PacketState::Lost),
            PacketState::Received
        );
        assert_eq!(
            better_state(PacketState::Recovered, PacketState::Lost),
            PacketState::Recovered
        );
    }

    #[test]
    fn apply_state_reports_whether_it_changed() {
        let mut p = SentPacket::new(TwccSeq(0), 0, 1, 96, 100, 0);
        assert!(p.apply_state(PacketState::Lost, None));
        assert!(!p.apply_state(PacketState::Lost, None));
        assert!(p.apply_state(PacketState::Received, Some(1000)));
        assert_eq!(p.remote_ts, Some(1000));
        assert!(!p.apply_state(PacketState::Lost, Some(2000)));
        assert_eq!(p.remote_ts, Some(1000));
    }
}
