//! 4.A Sequence Registry — maps `(ssrc, original_seq)` to the `TwccSeq` that
//! was assigned when the packet was stamped, so late-arriving redundancy
//! (RTX/FEC) feedback can be matched back to the media packet(s) it protects.

use crate::seq::TwccSeq;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SequenceRegistry {
    map: HashMap<(u32, u16), TwccSeq>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the mapping. Last write wins per `(ssrc, orig_seq)`.
    pub fn register(&mut self, ssrc: u32, orig_seq: u16, twcc_seq: TwccSeq) {
        self.map.insert((ssrc, orig_seq), twcc_seq);
    }

    pub fn lookup(&self, ssrc: u32, orig_seq: u16) -> Option<TwccSeq> {
        self.map.get(&(ssrc, orig_seq)).copied()
    }

    /// Removes a single entry, e.g. when its `SentPacket` is evicted from
    /// the ring. A no-op if the entry is already gone or was overwritten.
    pub fn remove(&mut self, ssrc: u32, orig_seq: u16) {
        self.map.remove(&(ssrc, orig_seq));
    }

    /// Drops every entry for which `keep` returns `false`. Called alongside
    /// `SentPacket` ring eviction so the registry never outlives the packets
    /// it indexes (spec: "trimmed lazily together with the SentPacket ring").
    pub fn retain_live<F: FnMut(u32, u16) -> bool>(&mut self, mut keep: F) {
        self.map.retain(|&(ssrc, orig_seq), _| keep(ssrc, orig_seq));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let mut reg = SequenceRegistry::new();
        reg.register(100, 42, TwccSeq(7));
        assert_eq!(reg.lookup(100, 42), Some(TwccSeq(7)));
        assert_eq!(reg.lookup(100, 43), None);
        assert_eq!(reg.lookup(101, 42), None);
    }

    #[test]
    fn last_write_wins() {
        let mut reg = SequenceRegistry::new();
        reg.register(100, 42, TwccSeq(7));
        reg.register(100, 42, TwccSeq(9));
        assert_eq!(reg.lookup(100, 42), Some(TwccSeq(9)));
    }

    #[test]
    fn retain_live_drops_unreferenced() {
        let mut reg = SequenceRegistry::new();
        reg.register(1, 1, TwccSeq(1));
        reg.register(1, 2, TwccSeq(2));
        reg.retain_live(|_, orig_seq| orig_seq != 1);
        assert_eq!(reg.lookup(1, 1), None);
        assert_eq!(reg.lookup(1, 2), Some(TwccSeq(2)));
    }
}
