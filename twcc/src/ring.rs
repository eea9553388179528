//! The send-side `SentPacket` history (spec 4.D), a dense ring ordered by
//! `TwccSeq`. Every stamped packet occupies exactly one slot — `Stamper`
//! never skips a sequence number — so no placeholder slots are needed.

use crate::sent_packet::SentPacket;
use crate::seq::TwccSeq;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct SentPacketRing {
    buf: VecDeque<SentPacket>,
    head_seq: TwccSeq,
}

impl SentPacketRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn head_seq(&self) -> TwccSeq {
        self.head_seq
    }

    /// Appends a packet. Callers must stamp strictly in `TwccSeq` order
    /// (guaranteed by `SeqAllocator`).
    pub fn push(&mut self, pkt: SentPacket) {
        if self.buf.is_empty() {
            self.head_seq = pkt.twcc_seq;
        }
        self.buf.push_back(pkt);
    }

    fn index_of(&self, seq: TwccSeq) -> Option<usize> {
        if self.buf.is_empty() {
            return None;
        }
        let diff = seq.diff(self.head_seq);
        if diff < 0 || diff as usize >= self.buf.len() {
            return None;
        }
        Some(diff as usize)
    }

    pub fn get(&self, seq: TwccSeq) -> Option<&SentPacket> {
        self.index_of(seq).and_then(|i| self.buf.get(i))
    }

    pub fn get_mut(&mut self, seq: TwccSeq) -> Option<&mut SentPacket> {
        let i = self.index_of(seq)?;
        self.buf.get_mut(i)
    }

    pub fn front(&self) -> Option<&SentPacket> {
        self.buf.front()
    }

    pub fn back_local_ts(&self) -> Option<shared::time::MonoNanos> {
        self.buf.back().map(|p| p.local_ts)
    }

    pub fn pop_front(&mut self) -> Option<SentPacket> {
        let popped = self.buf.pop_front();
        if popped.is_some() {
            self.head_seq = self.head_seq.wrapping_add(1);
        }
        popped
    }

    pub fn iter(&self) -> impl Iterator<Item = &SentPacket> {
        self.buf.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sent_packet::PacketState;

    fn pkt(seq: u16, local_ts: i64) -> SentPacket {
        SentPacket::new(TwccSeq(seq), seq, 1, 96, 100, local_ts)
    }

    #[test]
    fn push_then_get_by_seq() {
        let mut r = SentPacketRing::new();
        r.push(pkt(10, 0));
        r.push(pkt(11, 1));
        r.push(pkt(12, 2));
        assert_eq!(r.get(TwccSeq(11)).unwrap().twcc_seq, TwccSeq(11));
        assert!(r.get(TwccSeq(9)).is_none());
        assert!(r.get(TwccSeq(13)).is_none());
    }

    #[test]
    fn pop_front_advances_head_and_index() {
        let mut r = SentPacketRing::new();
        r.push(pkt(10, 0));
        r.push(pkt(11, 1));
        let popped = r.pop_front().unwrap();
        assert_eq!(popped.twcc_seq, TwccSeq(10));
        assert_eq!(r.head_seq(), TwccSeq(11));
        assert!(r.get(TwccSeq(10)).is_none());
        assert_eq!(r.get(TwccSeq(11)).unwrap().twcc_seq, TwccSeq(11));
    }

    #[test]
    fn get_mut_allows_state_update() {
        let mut r = SentPacketRing::new();
        r.push(pkt(0, 0));
        r.get_mut(TwccSeq(0)).unwrap().apply_state(PacketState::Received, Some(5));
        assert_eq!(r.get(TwccSeq(0)).unwrap().state, PacketState::Received);
    }
}
