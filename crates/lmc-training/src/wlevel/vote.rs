//! Bitmask normalization and per-lane voting for hardware write leveling.
//!
//! A round reports, per lane, a 5-bit delay and an 8-bit sample bitmask of
//! the strobe phases that saw DQS high. The bitmask decides the low-order
//! phase; the delay contributes the cycle (bits 4:3).

use lmc_hal::regs::WlevelRank;
use lmc_hal::{DelayVector, LaneMask};

use crate::context::LaneRun;

/// Phase buckets per cycle.
pub const BUCKETS: usize = 4;

const CYCLE_MASK: u8 = 0x18;

/// Low-order phase of a raw bitmask: skip the leading ones, find the next
/// one (wrapping), round an odd position up, modulo 8.
#[allow(clippy::arithmetic_side_effects)] // positions stay below 16
pub fn roundup_bitmask(bitmask: u8) -> u8 {
    let leader = (0u8..8).find(|i| (bitmask >> i) & 1 == 0).unwrap_or(8);
    let leader = (leader..16)
        .find(|i| (bitmask >> (i % 8)) & 1 == 1)
        .unwrap_or(16);
    (leader + (leader & 1)) % 8
}

/// Exactly one 0→1 transition when read as a circular pattern.
pub fn is_perfect(bitmask: u8) -> bool {
    (!bitmask & bitmask.rotate_right(1)).count_ones() == 1
}

/// An all-zero or all-one bitmask carries no edge.
pub fn has_edge(bitmask: u8) -> bool {
    bitmask != 0 && bitmask != u8::MAX
}

/// Phase bucket of a delay.
#[allow(clippy::arithmetic_side_effects)]
pub const fn bucket(delay: u8) -> usize {
    ((delay >> 1) & 3) as usize
}

/// Write-leveling estimate from a read-leveling delay.
#[allow(clippy::arithmetic_side_effects)]
pub fn rlevel_to_wlevel(rlevel: u8) -> u8 {
    rlevel.div_ceil(2) & 0x1e
}

/// Weighted phase histogram of one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BucketVote {
    counts: [u8; BUCKETS],
    cycles: [u8; BUCKETS],
}

impl BucketVote {
    /// Count one round. Perfect bitmasks weigh `1 + bonus`.
    pub fn add(&mut self, delay: u8, perfect: bool, bonus: u8) {
        let weight = if perfect { bonus.saturating_add(1) } else { 1 };
        let b = bucket(delay);
        if let Some(count) = self.counts.get_mut(b) {
            *count = count.saturating_add(weight);
        }
        if let Some(cycle) = self.cycles.get_mut(b) {
            *cycle = delay & CYCLE_MASK;
        }
    }

    /// Weighted count per bucket.
    pub fn counts(&self) -> [u8; BUCKETS] {
        self.counts
    }

    /// No round produced an edge.
    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|c| *c == 0)
    }

    #[allow(clippy::cast_possible_truncation, clippy::arithmetic_side_effects)]
    fn delay_of(&self, b: usize) -> Option<u8> {
        let cycle = self.cycles.get(b)?;
        Some(cycle | ((b as u8) << 1))
    }

    fn leader(&self) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (b, count) in self.counts.iter().enumerate() {
            if *count > 0 && best.map_or(true, |(_, c)| *count > c) {
                best = Some((b, *count));
            }
        }
        best.map(|(b, _)| b)
    }

    /// Majority delay; ties go to the lower bucket.
    pub fn winner(&self) -> Option<u8> {
        self.delay_of(self.leader()?)
    }

    /// Runner-up delay when its count is within `margin` of the winner.
    pub fn alternate(&self, margin: u8) -> Option<u8> {
        let lead = self.leader()?;
        let top = *self.counts.get(lead)?;
        let mut best: Option<(usize, u8)> = None;
        for (b, count) in self.counts.iter().enumerate() {
            if b == lead || *count == 0 {
                continue;
            }
            if best.map_or(true, |(_, c)| *count > c) {
                best = Some((b, *count));
            }
        }
        let (b, count) = best?;
        if top.saturating_sub(count) <= margin {
            self.delay_of(b)
        } else {
            None
        }
    }
}

/// Lanes whose delay jumps more than `max_step` from the previous lane of
/// a routing chain. The later lane of each offending pair is reported;
/// pairs touching `ignore` are skipped.
pub fn chain_violations(
    chains: &[LaneRun],
    delays: &DelayVector,
    max_step: u8,
    ignore: LaneMask,
) -> LaneMask {
    let mut bad = LaneMask::EMPTY;
    for chain in chains {
        for pair in chain.windows(2) {
            let [from, to] = pair else { continue };
            if ignore.contains(*from) || ignore.contains(*to) {
                continue;
            }
            if delays[*from].abs_diff(delays[*to]) > max_step {
                bad = bad.with(*to);
            }
        }
    }
    bad
}

/// ECC delay between its neighbours: the even midpoint, kept within
/// `[min, max]` of the two.
#[allow(clippy::arithmetic_side_effects)] // lo <= hi
pub fn interpolate_ecc(a: u8, b: u8) -> u8 {
    let (lo, hi) = (a.min(b), a.max(b));
    let mid = lo + (hi - lo) / 2;
    mid.saturating_add(mid & 1)
        .clamp(lo, hi)
        .min(WlevelRank::MAX_DELAY)
}

/// Lanes in `a` or `b`.
pub fn union(a: LaneMask, b: LaneMask) -> LaneMask {
    LaneMask::from_bits(a.bits() | b.bits())
}
