//! 4.B Redundancy Bookkeeper — tracks FEC/RTX blocks and derives whether a
//! lost media packet was recovered by redundancy the peer acknowledged.
//!
//! `RedundancyBookkeeper` only tracks *membership* (which `TwccSeq`s belong
//! to which block, and at which fec slot); it never owns `SentPacket` state.
//! The state walk in [`RedundancyBookkeeper::reconsider`] is given read/write
//! access to that state through closures supplied by the caller (the stats
//! engine, which owns the `SentPacket` ring) — this keeps the bookkeeper from
//! needing shared ownership of ring entries, in the spirit of the teacher's
//! preference for handles/indices over shared pointers.

use crate::seq::TwccSeq;
use crate::sent_packet::PacketState;
use std::collections::HashMap;

pub type BlockKey = usize;

#[derive(Debug, Clone)]
pub struct RedBlock {
    /// The protected media sequence numbers (the block's identity).
    pub media: Vec<TwccSeq>,
    /// Redundancy (RTX/FEC) sequence numbers protecting `media`, indexed by
    /// `redundant_idx`; `None` until that slot's packet has been stamped.
    pub fec: Vec<Option<TwccSeq>>,
}

impl RedBlock {
    fn new(media: Vec<TwccSeq>, fec_len: usize) -> Self {
        Self {
            media,
            fec: vec![None; fec_len.max(1)],
        }
    }
}

#[derive(Debug, Default)]
pub struct RedundancyBookkeeper {
    blocks: Vec<Option<RedBlock>>,
    seq_to_block: HashMap<TwccSeq, BlockKey>,
}

impl RedundancyBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes a set of protected media sequence numbers into the block
    /// key (spec: "RedBlock key = sorted protects_seqnums").
    pub fn sort_key(mut media: Vec<TwccSeq>) -> Vec<TwccSeq> {
        media.sort_by_key(|s| s.0);
        media.dedup();
        media
    }

    /// Finds the block a sequence number (media or fec) already belongs to.
    pub fn block_for(&self, seq: TwccSeq) -> Option<BlockKey> {
        self.seq_to_block.get(&seq).copied()
    }

    pub fn block(&self, key: BlockKey) -> Option<&RedBlock> {
        self.blocks.get(key).and_then(|b| b.as_ref())
    }

    /// Looks up (or creates) the block protecting `media` and registers
    /// `fec_seq` at `redundant_idx` within a block sized for `redundant_num`
    /// slots. Returns the block's key.
    pub fn register_redundant(
        &mut self,
        media: Vec<TwccSeq>,
        fec_seq: TwccSeq,
        redundant_idx: u16,
        redundant_num: u16,
    ) -> BlockKey {
        let sorted = Self::sort_key(media);
        debug_assert!(!sorted.is_empty(), "RedBlock.media must have >= 1 entries");

        let existing_key = sorted.iter().find_map(|s| self.seq_to_block.get(s).copied());
        let key = match existing_key {
            Some(k) => k,
            None => {
                self.blocks.push(Some(RedBlock::new(sorted.clone(), redundant_num as usize)));
                self.blocks.len() - 1
            }
        };

        {
            let block = self.blocks[key].as_mut().expect("block just inserted or looked up");
            if (redundant_idx as usize) >= block.fec.len() {
                block.fec.resize(redundant_idx as usize + 1, None);
            }
            block.fec[redundant_idx as usize] = Some(fec_seq);
        }

        for m in &sorted {
            self.seq_to_block.entry(*m).or_insert(key);
        }
        self.seq_to_block.insert(fec_seq, key);

        key
    }

    /// Removes a block entirely (called when its anchor `SentPacket` — any
    /// member seqnum — is evicted from the send-side ring).
    pub fn evict(&mut self, key: BlockKey) {
        if let Some(block) = self.blocks.get_mut(key).and_then(Option::take) {
            for m in &block.media {
                self.seq_to_block.remove(m);
            }
            for f in block.fec.iter().flatten() {
                self.seq_to_block.remove(f);
            }
        }
    }

    /// Walks a block's media+fec slots, applying recovery per spec 4.D step
    /// 3: if every slot is resolved (`Unknown == 0`) and the number of Lost
    /// slots does not exceed the fec capacity, every Lost slot becomes
    /// Recovered. Single-media (pure RTX) blocks take the simplified path:
    /// if the lone media slot is Lost/Unknown and any fec slot is Received,
    /// the media slot becomes Recovered.
    ///
    /// `get_state`/`set_state` read and write the caller's `SentPacket`
    /// ring. Returns the sequence numbers that actually transitioned.
    pub fn reconsider<F, G>(&self, key: BlockKey, mut get_state: F, mut set_state: G) -> Vec<TwccSeq>
    where
        F: FnMut(TwccSeq) -> Option<PacketState>,
        G: FnMut(TwccSeq, PacketState) -> bool,
    {
        let Some(block) = self.block(key) else {
            return Vec::new();
        };
        let mut transitioned = Vec::new();

        if block.media.len() == 1 {
            let media_seq = block.media[0];
            let media_state = get_state(media_seq);
            let any_fec_received = block
                .fec
                .iter()
                .flatten()
                .any(|f| matches!(get_state(*f), Some(PacketState::Received)));
            if matches!(media_state, Some(PacketState::Lost) | Some(PacketState::Unknown))
                && any_fec_received
                && set_state(media_seq, PacketState::Recovered)
            {
                transitioned.push(media_seq);
            }
            self.assert_consistent(block, &mut get_state);
            return transitioned;
        }

        let all_members = block.media.iter().copied().chain(block.fec.iter().flatten().copied());
        let mut unknown = 0usize;
        let mut lost = 0usize;
        let mut member_count = 0usize;
        for seq in all_members.clone() {
            member_count += 1;
            match get_state(seq) {
                Some(PacketState::Unknown) | None => unknown += 1,
                Some(PacketState::Lost) => lost += 1,
                _ => {}
            }
        }
        let _ = member_count;

        if unknown == 0 && lost <= block.fec.iter().flatten().count() {
            for seq in all_members {
                if matches!(get_state(seq), Some(PacketState::Lost))
                    && set_state(seq, PacketState::Recovered)
                {
                    transitioned.push(seq);
                }
            }
        }

        self.assert_consistent(block, &mut get_state);
        transitioned
    }

    /// Checks the §3 invariant after every `reconsider` call: a block must
    /// never be left partially `Recovered` while other slots remain `Lost`.
    /// A release build pays nothing for this (the loop body lives entirely
    /// inside `debug_assert!`'s condition, which isn't compiled in unless
    /// `debug_assertions` is on).
    fn assert_consistent<F>(&self, block: &RedBlock, get_state: &mut F)
    where
        F: FnMut(TwccSeq) -> Option<PacketState>,
    {
        debug_assert!(
            {
                let mut any_recovered = false;
                let mut any_lost = false;
                for seq in block.media.iter().copied().chain(block.fec.iter().flatten().copied()) {
                    match get_state(seq) {
                        Some(PacketState::Recovered) => any_recovered = true,
                        Some(PacketState::Lost) => any_lost = true,
                        _ => {}
                    }
                }
                !(any_recovered && any_lost)
            },
            "RedBlock {:?} is inconsistent: partially Recovered with Lost slots remaining",
            block.media
        );
    }

    pub fn block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_creates_and_reuses_block() {
        let mut rb = RedundancyBookkeeper::new();
        let k1 = rb.register_redundant(vec![TwccSeq(105)], TwccSeq(200), 0, 1);
        let k2 = rb.register_redundant(vec![TwccSeq(105)], TwccSeq(201), 0, 1);
        assert_eq!(k1, k2);
        assert_eq!(rb.block_for(TwccSeq(105)), Some(k1));
        assert_eq!(rb.block_for(TwccSeq(201)), Some(k1));
    }

    #[test]
    fn single_media_rtx_recovery() {
        let mut rb = RedundancyBookkeeper::new();
        let key = rb.register_redundant(vec![TwccSeq(105)], TwccSeq(200), 0, 1);

        let mut states: HashMap<TwccSeq, PacketState> = HashMap::new();
        states.insert(TwccSeq(105), PacketState::Lost);
        states.insert(TwccSeq(200), PacketState::Received);

        let transitioned = rb.reconsider(
            key,
            |seq| states.get(&seq).copied(),
            |seq, new| {
                let changed = states.get(&seq) != Some(&new);
                states.insert(seq, new);
                changed
            },
        );
        assert_eq!(transitioned, vec![TwccSeq(105)]);
        assert_eq!(states[&TwccSeq(105)], PacketState::Recovered);
    }

    #[test]
    fn multi_media_block_recovers_when_fec_covers_losses() {
        let mut rb = RedundancyBookkeeper::new();
        let media: Vec<TwccSeq> = (100..110).map(TwccSeq).collect();
        let key = rb.register_redundant(media.clone(), TwccSeq(200), 0, 2);
        rb.register_redundant(media.clone(), TwccSeq(201), 1, 2);

        let mut states: HashMap<TwccSeq, PacketState> = HashMap::new();
        for m in &media {
            states.insert(*m, PacketState::Received);
        }
        states.insert(TwccSeq(105), PacketState::Lost);
        states.insert(TwccSeq(200), PacketState::Received);
        states.insert(TwccSeq(201), PacketState::Received);

        let transitioned = rb.reconsider(
            key,
            |seq| states.get(&seq).copied(),
            |seq, new| {
                let changed = states.get(&seq) != Some(&new);
                states.insert(seq, new);
                changed
            },
        );
        assert_eq!(transitioned, vec![TwccSeq(105)]);
    }

    #[test]
    fn does_not_recover_when_unknown_present() {
        let mut rb = RedundancyBookkeeper::new();
        let media: Vec<TwccSeq> = (100..110).map(TwccSeq).collect();
        let key = rb.register_redundant(media.clone(), TwccSeq(200), 0, 1);

        let mut states: HashMap<TwccSeq, PacketState> = HashMap::new();
        for m in &media {
            states.insert(*m, PacketState::Unknown);
        }
        states.insert(TwccSeq(105), PacketState::Lost);
        states.insert(TwccSeq(200), PacketState::Received);

        let transitioned = rb.reconsider(
            key,
            |seq| states.get(&seq).copied(),
            |seq, new| {
                let changed = states.get(&seq) != Some(&new);
                states.insert(seq, new);
                changed
            },
        );
        assert!(transitioned.is_empty());
    }
}
