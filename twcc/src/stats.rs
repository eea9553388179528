//! 4.D Windowed statistics — the `StatsCtx` scan over the send-side
//! `SentPacket` history: one global accumulator plus one per payload type,
//! fed from a single filter-and-group pass over the window (spec.md §2
//! SUPPLEMENT: "the send side also maintains a per-payload-type breakdown of
//! the same windowed statistics as the global one").
//!
//! Grounded in `original_source/rtptwccstats.c`'s
//! `twcc_stats_ctx_calculate_windowed_stats`: the loss/recovery counting
//! rules, the delta-of-delta growth ratio (first-half vs. second-half
//! average, floored at 100 µs before the division), and the Welford-style
//! incremental linear regression feeding `queueing_slope` are carried over
//! verbatim. The original's windowed-stats loop sets `prev` to the *same*
//! index it reads `pkt` from rather than the preceding entry -- apparently
//! transcribed incorrectly upstream, since the surrounding code and comments
//! only make sense comparing successive packets; this module uses the actual
//! previous window entry, matching spec.md §4.D's prose ("between successive
//! packets with valid local_ts and remote_ts").

use crate::ring::SentPacketRing;
use crate::sent_packet::{PacketState, SentPacket};
use shared::time::MonoNanos;
use std::collections::HashMap;
use std::time::Duration;

/// Delta-of-delta half-averages are floored at this many nanoseconds before
/// computing the growth ratio, so that two near-zero averages don't produce
/// a wildly noisy ratio (spec.md §4.D: "clamped so each half-average ≥ 100
/// µs before the division").
const MIN_HALF_AVG_NANOS: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PtStats {
    pub packets_sent: u32,
    pub packets_recv: u32,
    pub packets_lost: u32,
    pub packets_recovered: u32,
    pub packets_unknown: u32,
    pub bitrate_sent: u64,
    pub bitrate_recv: u64,
    pub loss_pct: f64,
    /// `-1.0` when no packet in the window was ever lost (spec.md §4.D).
    pub recovery_pct: f64,
    pub avg_delta_of_delta: i64,
    pub delta_of_delta_growth: f64,
    pub queueing_slope: f64,
}

impl Default for PtStats {
    fn default() -> Self {
        Self {
            packets_sent: 0,
            packets_recv: 0,
            packets_lost: 0,
            packets_recovered: 0,
            packets_unknown: 0,
            bitrate_sent: 0,
            bitrate_recv: 0,
            loss_pct: 0.0,
            recovery_pct: -1.0,
            avg_delta_of_delta: 0,
            delta_of_delta_growth: 0.0,
            queueing_slope: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub global: PtStats,
    pub by_payload_type: HashMap<u8, PtStats>,
}

/// How far back, and how recently, the window extends from the newest
/// tracked `local_ts` (spec.md §4.D: "window `[start, end]` relative to the
/// newest received `local_ts` (minus a configurable delay)").
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub duration: Duration,
    pub delay: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
            delay: Duration::ZERO,
        }
    }
}

/// Scans `ring` for the window `WindowConfig` describes and computes the
/// global plus per-payload-type statistics in one pass. Returns `None` if
/// the ring is empty or the window contains fewer than 2 packets (not
/// enough to compute a duration or a delta-of-delta).
pub fn compute(ring: &SentPacketRing, cfg: &WindowConfig) -> Option<WindowStats> {
    let last_ts = ring.back_local_ts()?;
    let window_end = last_ts - cfg.delay.as_nanos() as i64;
    let window_start = window_end - cfg.duration.as_nanos() as i64;

    let window: Vec<&SentPacket> = ring
        .iter()
        .filter(|p| p.local_ts >= window_start && p.local_ts <= window_end)
        .collect();

    if window.len() < 2 {
        return None;
    }

    let global = accumulate(&window);

    let mut grouped: HashMap<u8, Vec<&SentPacket>> = HashMap::new();
    for &pkt in &window {
        grouped.entry(pkt.payload_type).or_default().push(pkt);
    }
    let by_payload_type = grouped
        .into_iter()
        .filter_map(|(pt, pkts)| (pkts.len() >= 2).then(|| (pt, accumulate(&pkts))))
        .collect();

    Some(WindowStats { global, by_payload_type })
}

/// Welford-style incremental simple linear regression, used so
/// `queueing_slope` doesn't need to buffer every `(x, y)` pair (matches
/// `original_source`'s `LinearRegression` helper).
#[derive(Default)]
struct WelfordRegression {
    n: u64,
    mean_x: f64,
    mean_y: f64,
    sxy: f64,
    sxx: f64,
}

impl WelfordRegression {
    fn update(&mut self, x: f64, y: f64) {
        self.n += 1;
        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        self.mean_x += dx / self.n as f64;
        self.mean_y += dy / self.n as f64;
        self.sxx += dx * (x - self.mean_x);
        self.sxy += dx * (y - self.mean_y);
    }

    fn slope(&self) -> f64 {
        if self.n < 2 || self.sxx == 0.0 {
            0.0
        } else {
            self.sxy / self.sxx
        }
    }
}

/// Runs the windowed-stats scan over one ordered packet slice -- either the
/// whole window (global) or a payload-type subgroup of it, preserving the
/// window's relative order.
fn accumulate(window: &[&SentPacket]) -> PtStats {
    let mut stats = PtStats::default();
    if window.len() < 2 {
        return stats;
    }

    let mut packets_sent = 0u32;
    let mut packets_recv = 0u32;
    let mut packets_lost = 0u32;
    let mut packets_recovered = 0u32;
    let mut packets_unknown = 0u32;

    let mut bits_sent: u64 = 0;
    let mut bits_recv: u64 = 0;

    let mut first_local_ts: Option<MonoNanos> = None;
    let mut last_local_ts: Option<MonoNanos> = None;
    let mut first_remote_ts: Option<MonoNanos> = None;
    let mut last_remote_ts: Option<MonoNanos> = None;

    let mut dod_sum: i64 = 0;
    let mut dod_count: u32 = 0;
    let mut first_half_sum: i64 = 0;
    let mut first_half_count: u32 = 0;
    let mut last_half_sum: i64 = 0;
    let mut last_half_count: u32 = 0;
    let mut regression = WelfordRegression::default();

    let half = window.len() / 2;
    let mut prev: Option<&SentPacket> = None;

    for (i, &pkt) in window.iter().enumerate() {
        if pkt.state != PacketState::Unknown {
            // The first packet's bits don't count towards the interval's
            // bitrate -- it's the left endpoint, already "in flight" before
            // the window opened.
            if first_local_ts.is_none() {
                first_local_ts = Some(pkt.local_ts);
            } else {
                bits_sent += pkt.size_bytes as u64 * 8;
            }
            last_local_ts = Some(pkt.local_ts);
        }

        match pkt.state {
            PacketState::Received => {
                if first_remote_ts.is_none() {
                    first_remote_ts = pkt.remote_ts;
                } else if let Some(rt) = pkt.remote_ts {
                    let _ = rt;
                    bits_recv += pkt.size_bytes as u64 * 8;
                }
                last_remote_ts = pkt.remote_ts;
                packets_sent += 1;
                packets_recv += 1;
            }
            PacketState::Recovered => {
                packets_sent += 1;
                packets_lost += 1;
                packets_recovered += 1;
            }
            PacketState::Lost => {
                packets_sent += 1;
                packets_lost += 1;
            }
            PacketState::Unknown => {
                packets_unknown += 1;
            }
        }

        if let Some(origin) = first_local_ts {
            if let Some(p) = prev {
                if p.state != PacketState::Unknown {
                    if let (Some(remote_a), Some(remote_b)) = (p.remote_ts, pkt.remote_ts) {
                        let local_delta = pkt.local_ts - p.local_ts;
                        let remote_delta = remote_b - remote_a;
                        let dod = remote_delta - local_delta;

                        dod_sum += dod;
                        dod_count += 1;
                        regression.update((pkt.local_ts - origin) as f64, dod_sum as f64);

                        if i < half {
                            first_half_sum += dod;
                            first_half_count += 1;
                        } else {
                            last_half_sum += dod;
                            last_half_count += 1;
                        }
                    }
                }
            }
        }
        prev = Some(pkt);
    }

    stats.packets_sent = packets_sent;
    stats.packets_recv = packets_recv;
    stats.packets_lost = packets_lost;
    stats.packets_recovered = packets_recovered;
    stats.packets_unknown = packets_unknown;

    if packets_sent > 0 {
        stats.loss_pct = (packets_lost as f64 * 100.0) / packets_sent as f64;
    }
    if packets_lost > 0 {
        stats.recovery_pct = ((packets_recovered as f64 * 100.0) / packets_lost as f64).min(100.0);
    }
    if dod_count > 0 {
        stats.avg_delta_of_delta = dod_sum / dod_count as i64;
    }
    if first_half_count > 0 && last_half_count > 0 {
        let first_avg = (first_half_sum / first_half_count as i64).max(MIN_HALF_AVG_NANOS);
        let last_avg = (last_half_sum / last_half_count as i64).max(MIN_HALF_AVG_NANOS);
        stats.delta_of_delta_growth = last_avg as f64 / first_avg as f64;
    }

    if let (Some(first), Some(last)) = (first_local_ts, last_local_ts) {
        let local_duration = last - first;
        if local_duration > 0 {
            stats.bitrate_sent = (bits_sent * 1_000_000_000) / local_duration as u64;
        }
    }
    if let (Some(first), Some(last)) = (first_remote_ts, last_remote_ts) {
        let remote_duration = last - first;
        if remote_duration > 0 {
            stats.bitrate_recv = (bits_recv * 1_000_000_000) / remote_duration as u64;
        }
    }

    stats.queueing_slope = regression.slope();

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::TwccSeq;

    fn pkt(
        seq: u16,
        pt: u8,
        local_ts: i64,
        state: PacketState,
        remote_ts: Option<MonoNanos>,
        size: u32,
    ) -> SentPacket {
        let mut p = SentPacket::new(TwccSeq(seq), seq, 1, pt, size, local_ts);
        p.state = state;
        p.remote_ts = remote_ts;
        p
    }

    fn ring_of(packets: Vec<SentPacket>) -> SentPacketRing {
        let mut r = SentPacketRing::new();
        for p in packets {
            r.push(p);
        }
        r
    }

    #[test]
    fn window_conservation_law() {
        let mut packets = Vec::new();
        for i in 0..10u16 {
            let state = if i == 3 {
                PacketState::Lost
            } else if i == 7 {
                PacketState::Recovered
            } else {
                PacketState::Received
            };
            let remote_ts = matches!(state, PacketState::Received).then_some(i as i64 * 20_000_000);
            packets.push(pkt(i, 96, i as i64 * 20_000_000, state, remote_ts, 1000));
        }
        let ring = ring_of(packets);
        let cfg = WindowConfig {
            duration: Duration::from_secs(10),
            delay: Duration::ZERO,
        };
        let stats = compute(&ring, &cfg).unwrap();
        assert_eq!(stats.global.packets_sent, 10);
        assert_eq!(
            stats.global.packets_recv
                + (stats.global.packets_lost - stats.global.packets_recovered)
                + stats.global.packets_recovered,
            stats.global.packets_sent
        );
        assert_eq!(stats.global.packets_lost, 2);
        assert_eq!(stats.global.packets_recovered, 1);
    }

    #[test]
    fn recovery_pct_reports_full_recovery() {
        let packets = vec![
            pkt(0, 96, 0, PacketState::Received, Some(0), 1000),
            pkt(1, 96, 20_000_000, PacketState::Recovered, None, 1000),
            pkt(2, 96, 40_000_000, PacketState::Received, Some(40_000_000), 1000),
        ];
        let ring = ring_of(packets);
        let cfg = WindowConfig {
            duration: Duration::from_secs(10),
            delay: Duration::ZERO,
        };
        let stats = compute(&ring, &cfg).unwrap();
        assert_eq!(stats.global.recovery_pct, 100.0);
    }

    #[test]
    fn no_losses_means_negative_one_recovery_pct() {
        let packets = vec![
            pkt(0, 96, 0, PacketState::Received, Some(0), 1000),
            pkt(1, 96, 20_000_000, PacketState::Received, Some(20_000_000), 1000),
        ];
        let ring = ring_of(packets);
        let cfg = WindowConfig::default();
        let stats = compute(&ring, &cfg).unwrap();
        assert_eq!(stats.global.recovery_pct, -1.0);
    }

    #[test]
    fn bitrate_excludes_first_packet_size() {
        let packets = vec![
            pkt(0, 96, 0, PacketState::Received, Some(0), 1_000_000),
            pkt(1, 96, 1_000_000_000, PacketState::Received, Some(1_000_000_000), 1000),
        ];
        let ring = ring_of(packets);
        let cfg = WindowConfig {
            duration: Duration::from_secs(10),
            delay: Duration::ZERO,
        };
        let stats = compute(&ring, &cfg).unwrap();
        // Only the second packet's 1000 bytes (8000 bits) count, over 1s.
        assert_eq!(stats.global.bitrate_sent, 8000);
    }

    #[test]
    fn per_payload_type_breakdown_is_independent_of_global() {
        let mut packets = Vec::new();
        for i in 0..6u16 {
            let pt = if i % 2 == 0 { 96 } else { 97 };
            packets.push(pkt(
                i,
                pt,
                i as i64 * 20_000_000,
                PacketState::Received,
                Some(i as i64 * 20_000_000),
                500,
            ));
        }
        let ring = ring_of(packets);
        let cfg = WindowConfig {
            duration: Duration::from_secs(10),
            delay: Duration::ZERO,
        };
        let stats = compute(&ring, &cfg).unwrap();
        assert_eq!(stats.by_payload_type[&96].packets_sent, 3);
        assert_eq!(stats.by_payload_type[&97].packets_sent, 3);
        assert_eq!(
            stats.global.packets_sent,
            stats.by_payload_type[&96].packets_sent + stats.by_payload_type[&97].packets_sent
        );
    }

    #[test]
    fn too_few_packets_in_window_yields_none() {
        let ring = ring_of(vec![pkt(0, 96, 0, PacketState::Received, Some(0), 1000)]);
        let cfg = WindowConfig::default();
        assert!(compute(&ring, &cfg).is_none());
    }

    #[test]
    fn queueing_slope_is_zero_with_constant_delta_of_delta() {
        // Remote and local clocks tick in lockstep: delta-of-delta is
        // always 0, so the regression slope must be 0 too.
        let packets: Vec<SentPacket> = (0..5u16)
            .map(|i| {
                let ts = i as i64 * 20_000_000;
                pkt(i, 96, ts, PacketState::Received, Some(ts), 1000)
            })
            .collect();
        let ring = ring_of(packets);
        let cfg = WindowConfig {
            duration: Duration::from_secs(10),
            delay: Duration::ZERO,
        };
        let stats = compute(&ring, &cfg).unwrap();
        assert_eq!(stats.global.queueing_slope, 0.0);
        assert_eq!(stats.global.avg_delta_of_delta, 0);
    }
}
