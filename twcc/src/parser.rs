//! 4.D Feedback Parser — send-side consumer of the RTCP TWCC FCI this crate
//! stamped for. Unpacks `TransportLayerCc` back into per-`SentPacket` status
//! updates, infers losses across feedback-packet-count gaps, and feeds the
//! [`crate::redundancy`] recovery walk.
//!
//! [SUPPLEMENT]: the teacher has no send-side TWCC parser (its
//! `TwccReceiverInterceptor`/`encoder` only ever produces feedback, never
//! consumes it). This module is built from scratch: the ring-buffer shape
//! follows the teacher's `VecDeque`-based history idioms, the exact
//! windowed-loss-inference arithmetic follows the matching logic in
//! `rtptwcc.c`'s `_check_for_lost_packets`.

use crate::redundancy::{BlockKey, RedundancyBookkeeper};
use crate::registry::SequenceRegistry;
use crate::ring::SentPacketRing;
use crate::sent_packet::{PacketState, Protects, SentPacket};
use crate::seq::TwccSeq;
use crate::stats::{self, WindowConfig, WindowStats};
use rtcp::transport_feedbacks::transport_layer_cc::{PacketStatusChunk, SymbolTypeTcc, TransportLayerCc};
use shared::serial::serial_diff_u8;
use shared::time::MonoNanos;
use std::collections::VecDeque;
use std::time::Duration;

/// Bound on the `pending_feedback` queue (spec 5): once full, the oldest
/// entry is dropped with a warning rather than blocking or growing
/// unbounded.
const PENDING_FEEDBACK_CAPACITY: usize = 300;

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Eviction trigger: ring length.
    pub max_len: usize,
    /// Eviction trigger: local-time span between the oldest and newest
    /// tracked packet.
    pub max_history_duration: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_len: 30_000,
            max_history_duration: Duration::from_secs(10),
        }
    }
}

/// Send-side TWCC state: the `SentPacket` ring, the original-seqnum ->
/// `TwccSeq` registry, redundancy bookkeeping, and the queue of sequence
/// numbers whose state changed and are awaiting a statistics pass.
pub struct Parser {
    cfg: ParserConfig,
    ring: SentPacketRing,
    registry: SequenceRegistry,
    redundancy: RedundancyBookkeeper,
    pending_feedback: VecDeque<TwccSeq>,

    first_fci_parse: bool,
    expected_parsed_seqnum: TwccSeq,
    expected_parsed_fb_pkt_count: u8,
}

impl Parser {
    pub fn new(cfg: ParserConfig) -> Self {
        Self {
            cfg,
            ring: SentPacketRing::new(),
            registry: SequenceRegistry::new(),
            redundancy: RedundancyBookkeeper::new(),
            pending_feedback: VecDeque::new(),
            first_fci_parse: true,
            expected_parsed_seqnum: TwccSeq::ZERO,
            expected_parsed_fb_pkt_count: 0,
        }
    }

    pub fn ring(&self) -> &SentPacketRing {
        &self.ring
    }

    pub fn pending_len(&self) -> usize {
        self.pending_feedback.len()
    }

    /// Records a packet at the moment it was handed to the transport.
    pub fn stamp(&mut self, pkt: SentPacket) {
        self.registry.register(pkt.ssrc, pkt.original_seq, pkt.twcc_seq);
        self.ring.push(pkt);
        self.evict_ready(None);
    }

    /// Records the socket-level send timestamp for an already-stamped
    /// packet, if the transport reports one (spec 3: `socket_ts` takes
    /// priority over `local_ts` for windowed-stats timing).
    pub fn on_tx(&mut self, seq: TwccSeq, ts: MonoNanos) {
        match self.ring.get_mut(seq) {
            Some(pkt) => pkt.socket_ts = Some(ts),
            None => log::trace!("tx-time callback for unknown/evicted seq {seq}"),
        }
    }

    /// Unpacks one RTCP TWCC feedback packet, applying the monotone state
    /// update to every `SentPacket` it reports on and to any packets
    /// inferred lost by a gap in `fb_pkt_count`. Malformed input (chunk
    /// count doesn't match `packet_status_count`, or deltas run out before
    /// the symbol list does) is dropped silently and never advances the
    /// expected-sequence tracking.
    pub fn parse_fci(&mut self, fb: &TransportLayerCc) {
        let Some(symbols) = unpack_symbols(&fb.packet_chunks, fb.packet_status_count) else {
            log::debug!("dropping malformed TWCC feedback: packet-status-count mismatch");
            return;
        };

        let base = TwccSeq(fb.base_sequence_number);
        let lost_gap = self.check_feedback_count(base, fb.packet_status_count, fb.fb_pkt_count);
        for seq in lost_gap {
            self.apply_update(seq, PacketState::Lost, None);
        }

        let mut running_us: i64 = (fb.reference_time as i64) * 64_000;
        let mut delta_idx = 0usize;
        for (i, symbol) in symbols.iter().enumerate() {
            let seq = base.wrapping_add(i as u16);
            if matches!(symbol, SymbolTypeTcc::PacketNotReceived) {
                self.apply_update(seq, PacketState::Lost, None);
                continue;
            }
            let Some(delta) = fb.recv_deltas.get(delta_idx) else {
                log::debug!("dropping malformed TWCC feedback: recv-delta underrun");
                return;
            };
            delta_idx += 1;
            running_us += delta.delta;
            self.apply_update(seq, PacketState::Received, Some(running_us * 1_000));
        }
    }

    /// RFC-1982-aware tracking of `fb_pkt_count` (spec 4.D): reordered
    /// feedback (`diff < 0`) is parsed but never advances expectations or
    /// infers loss; a forward jump (`diff > 0`) advances expectations
    /// without inferring loss (we can't tell which of the skipped packets
    /// were ever sent vs. simply never fed back); only an in-order `diff ==
    /// 0` feedback infers the gap between `expected_parsed_seqnum` and this
    /// feedback's base as lost.
    fn check_feedback_count(&mut self, base: TwccSeq, packet_count: u16, fb_pkt_count: u8) -> Vec<TwccSeq> {
        if self.first_fci_parse {
            self.first_fci_parse = false;
            self.advance_expectations(base, packet_count, fb_pkt_count);
            return Vec::new();
        }

        let diff = serial_diff_u8(fb_pkt_count, self.expected_parsed_fb_pkt_count);
        if diff < 0 {
            return Vec::new();
        }
        if diff > 0 || base.is_older_than(self.expected_parsed_seqnum) {
            self.advance_expectations(base, packet_count, fb_pkt_count);
            return Vec::new();
        }

        let packets_lost = base.diff(self.expected_parsed_seqnum).max(0) as u16;
        let start = self.expected_parsed_seqnum;
        let gap: Vec<TwccSeq> = (0..packets_lost).map(|i| start.wrapping_add(i)).collect();
        self.advance_expectations(base, packet_count, fb_pkt_count);
        gap
    }

    fn advance_expectations(&mut self, base: TwccSeq, packet_count: u16, fb_pkt_count: u8) {
        self.expected_parsed_seqnum = base.wrapping_add(packet_count);
        self.expected_parsed_fb_pkt_count = fb_pkt_count.wrapping_add(1);
    }

    fn apply_update(&mut self, seq: TwccSeq, new_state: PacketState, remote_ts: Option<MonoNanos>) {
        let Some(pkt) = self.ring.get_mut(seq) else {
            log::trace!("feedback for unknown/evicted seq {seq}");
            return;
        };
        if pkt.apply_state(new_state, remote_ts) {
            self.queue_pending(seq);
        }
    }

    fn queue_pending(&mut self, seq: TwccSeq) {
        if self.pending_feedback.len() >= PENDING_FEEDBACK_CAPACITY {
            log::warn!("TWCC pending-feedback queue full, dropping oldest entry");
            self.pending_feedback.pop_front();
        }
        self.pending_feedback.push_back(seq);
    }

    /// Drains the pending-feedback queue, rewriting `Protects::ByOriginal`
    /// to `Protects::ByTwcc` on first sight and re-running redundancy
    /// recovery for every block the drained sequence touches. Intended to
    /// be called right before a windowed-stats pass.
    pub fn integrate_pending(&mut self) {
        while let Some(seq) = self.pending_feedback.pop_front() {
            self.integrate_one(seq);
        }
    }

    fn integrate_one(&mut self, seq: TwccSeq) {
        let mut block_key = None;

        if let Some(pkt) = self.ring.get_mut(seq) {
            if !pkt.stats_processed {
                pkt.stats_processed = true;
                if let Some(red) = pkt.redundancy {
                    let media = match pkt.protects.take() {
                        Some(Protects::ByOriginal(origs)) => {
                            let rewritten: Vec<TwccSeq> = origs
                                .iter()
                                .map(|&o| self.registry.lookup(red.protects_ssrc, o).unwrap_or(TwccSeq(o)))
                                .collect();
                            pkt.protects = Some(Protects::ByTwcc(rewritten.clone()));
                            rewritten
                        }
                        Some(Protects::ByTwcc(t)) => {
                            pkt.protects = Some(Protects::ByTwcc(t.clone()));
                            t
                        }
                        None => Vec::new(),
                    };
                    if !media.is_empty() {
                        block_key =
                            Some(self.redundancy.register_redundant(media, seq, red.redundant_idx, red.redundant_num));
                    }
                }
            }
        }

        if block_key.is_none() {
            block_key = self.redundancy.block_for(seq);
        }
        if let Some(key) = block_key {
            self.reconsider_block(key);
        }
    }

    fn reconsider_block(&mut self, key: BlockKey) {
        let Parser { ring, redundancy, .. } = self;
        let transitioned = redundancy.reconsider(
            key,
            |s| ring.get(s).map(|p| p.state),
            |s, new_state| ring.get_mut(s).map(|p| p.apply_state(new_state, None)).unwrap_or(false),
        );
        for seq in transitioned {
            log::trace!("twcc seq {seq} recovered via redundancy block");
        }
    }

    /// Ring-buffer eviction (spec 4.D): drops the oldest `SentPacket` once
    /// the ring grows past `max_len`, spans more than `max_history_duration`
    /// of local time, or (when `window_start` is given, during a stats
    /// pass) falls before the reported window's start and isn't the last
    /// Unknown member of a still-unresolved redundancy block.
    pub fn evict_ready(&mut self, window_start: Option<MonoNanos>) {
        loop {
            let should_evict = match self.ring.front() {
                None => false,
                Some(head) => {
                    let too_long = self.ring.len() >= self.cfg.max_len;
                    let too_old = self
                        .ring
                        .back_local_ts()
                        .is_some_and(|last| last - head.local_ts > self.cfg.max_history_duration.as_nanos() as i64);
                    let window_cut = window_start
                        .is_some_and(|ws| head.local_ts < ws && !self.is_unresolved(head.twcc_seq));
                    too_long || too_old || window_cut
                }
            };
            if !should_evict {
                break;
            }
            let Some(pkt) = self.ring.pop_front() else { break };
            self.registry.remove(pkt.ssrc, pkt.original_seq);
            if let Some(key) = self.redundancy.block_for(pkt.twcc_seq) {
                self.redundancy.evict(key);
            }
        }
    }

    /// Integrates any pending feedback, evicts what the window no longer
    /// needs, and computes the windowed statistics (spec 4.D: "external
    /// consumer pulls statistics"). This is the one entry point an external
    /// congestion controller is expected to call periodically.
    pub fn window_stats(&mut self, cfg: &WindowConfig) -> Option<WindowStats> {
        self.integrate_pending();
        let window_start = self
            .ring
            .back_local_ts()
            .map(|last| last - cfg.delay.as_nanos() as i64 - cfg.duration.as_nanos() as i64);
        self.evict_ready(window_start);
        stats::compute(&self.ring, cfg)
    }

    fn is_unresolved(&self, seq: TwccSeq) -> bool {
        let Some(key) = self.redundancy.block_for(seq) else {
            return false;
        };
        let Some(block) = self.redundancy.block(key) else {
            return false;
        };
        block
            .media
            .iter()
            .copied()
            .chain(block.fec.iter().flatten().copied())
            .any(|s| matches!(self.ring.get(s).map(|p| p.state), Some(PacketState::Unknown)))
    }
}

/// Expands `chunks` (run-length and status-vector) into one symbol per
/// packet, in wire order. Returns `None` if the chunks don't produce exactly
/// `expected_count` symbols (malformed FCI).
fn unpack_symbols(chunks: &[PacketStatusChunk], expected_count: u16) -> Option<Vec<SymbolTypeTcc>> {
    let expected_count = expected_count as usize;
    let mut symbols = Vec::with_capacity(expected_count);
    for chunk in chunks {
        match chunk {
            PacketStatusChunk::RunLengthChunk(rl) => {
                for _ in 0..rl.run_length {
                    symbols.push(rl.packet_status_symbol);
                }
            }
            PacketStatusChunk::StatusVectorChunk(sv) => {
                symbols.extend_from_slice(&sv.symbol_list);
            }
        }
        if symbols.len() >= expected_count {
            break;
        }
    }
    if symbols.len() < expected_count {
        return None;
    }
    symbols.truncate(expected_count);
    Some(symbols)
}
