//! Per-bit read deskew.
//!
//! The PHY aligns every DQ bit (and DBI on DDR4) of a lane to its strobe
//! when sequence 10 runs in deskew mode. The result is read back bit by bit
//! through the debug port and judged:
//!
//! ```text
//!  Reset ──► Train ──► Validate ──┬──► Accept
//!    ▲                            ├──► RetryLock ─────────┐
//!    │                            └──► RetrySaturation ───┤
//!    └────────────────────────────────────────────────────┘
//! ```
//!
//! Each retry edge draws on its own budget first and borrows from the other
//! once its own is spent. When neither budget has a retry left, lanes that
//! still fail are replaced by their most frequent earlier valid reading
//! (the alternate); if that synthetic result validates it is written back
//! through `DLL_CTL3`, otherwise bring-up restarts.

use embedded_hal::delay::DelayNs;
use heapless::LinearMap;
use lmc_hal::regs::{ExtConfig, PHY_BIT_SEL_DBI};
use lmc_hal::{ByteLane, LaneMask, Lmc, PerLane, RegisterAccess, Sequence};

use crate::context::TrainingContext;
use crate::error::{RestartCause, TrainingError};
use crate::log::{lmc_debug, lmc_info, lmc_warn};
use crate::retry::RetryBudget;

/// Lowest acceptable per-bit setting.
pub const DESKEW_MIN: u8 = 17;
/// Highest acceptable per-bit setting.
pub const DESKEW_MAX: u8 = 110;
/// Largest spread of settings within one nibble.
pub const MAX_NIBBLE_RANGE: u8 = 33;

/// Bits read per lane: 8 DQ plus DBI.
pub const BITS_PER_LANE: usize = 9;

const HISTOGRAM_SLOTS: usize = 8;

/// Settings of every bit of one lane.
pub type LaneSettings = [u8; BITS_PER_LANE];

// ── Debug word ───────────────────────────────────────────────────────────────

/// One bit's deskew state as read from the debug port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitReading {
    /// 7-bit delay setting.
    pub setting: u8,
    /// The bit's state machine locked.
    pub locked: bool,
    /// Saturated at the low end.
    pub saturated_low: bool,
    /// Saturated at the high end.
    pub saturated_high: bool,
}

impl BitReading {
    /// Decode a 10-bit debug word.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_word(word: u16) -> Self {
        Self {
            setting: ((word >> 3) & 0x7f) as u8,
            locked: word & 1 != 0,
            saturated_low: word & 0b010 != 0,
            saturated_high: word & 0b100 != 0,
        }
    }

    /// Either saturation flag.
    pub const fn saturated(self) -> bool {
        self.saturated_low || self.saturated_high
    }

    /// Setting within `[DESKEW_MIN, DESKEW_MAX]`.
    pub const fn in_bounds(self) -> bool {
        self.setting >= DESKEW_MIN && self.setting <= DESKEW_MAX
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Problems found in one training attempt.
///
/// Nibble bitmaps use bit `2 * lane + nibble`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeskewCounts {
    /// Saturated bits.
    pub saturated: u8,
    /// Unlocked bits.
    pub unlocked: u8,
    /// Nibbles whose settings spread more than [`MAX_NIBBLE_RANGE`].
    pub nibble_range: u32,
    /// Nibbles with all four bits unlocked.
    pub nibble_unlocked: u32,
    /// Lanes with a setting outside the bounds.
    pub out_of_bounds: LaneMask,
}

/// Verdict on one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LaneCheck {
    /// Saturated bits.
    pub saturated: u8,
    /// Unlocked bits.
    pub unlocked: u8,
    /// Bit 0/1: low/high nibble spread too wide.
    pub nibble_range: u8,
    /// Bit 0/1: low/high nibble fully unlocked.
    pub nibble_unlocked: u8,
    /// Some setting out of bounds.
    pub out_of_bounds: bool,
}

impl LaneCheck {
    /// No problem at all.
    pub const fn is_valid(&self) -> bool {
        self.saturated == 0
            && self.unlocked == 0
            && self.nibble_range == 0
            && self.nibble_unlocked == 0
            && !self.out_of_bounds
    }
}

/// Spread of the settings of one nibble.
pub fn nibble_range(settings: &[u8]) -> u8 {
    let (lo, hi) = settings
        .iter()
        .fold((u8::MAX, 0u8), |(lo, hi), s| (lo.min(*s), hi.max(*s)));
    hi.saturating_sub(lo)
}

/// Judge one lane from its bit readings; `bits` is 8, or 9 with DBI.
#[allow(clippy::arithmetic_side_effects)] // counts bounded by BITS_PER_LANE
pub fn check_lane(readings: &[BitReading; BITS_PER_LANE], bits: usize) -> LaneCheck {
    let mut check = LaneCheck::default();
    for r in readings.iter().take(bits) {
        if r.saturated() {
            check.saturated += 1;
        }
        if !r.locked {
            check.unlocked += 1;
        }
        if !r.in_bounds() {
            check.out_of_bounds = true;
        }
    }
    for (nibble, chunk) in readings.chunks(4).take(2).enumerate() {
        let flag = 1u8 << nibble;
        if chunk.iter().all(|r| !r.locked) {
            check.nibble_unlocked |= flag;
        }
        let mut settings = [0u8; 4];
        for (slot, r) in settings.iter_mut().zip(chunk) {
            *slot = r.setting;
        }
        if nibble_range(&settings) > MAX_NIBBLE_RANGE {
            check.nibble_range |= flag;
        }
    }
    check
}

#[allow(clippy::arithmetic_side_effects)] // shift below 18
fn tally(checks: &PerLane<LaneCheck>, lanes: LaneMask) -> DeskewCounts {
    let mut counts = DeskewCounts::default();
    for lane in lanes.iter() {
        let c = checks[lane];
        counts.saturated = counts.saturated.saturating_add(c.saturated);
        counts.unlocked = counts.unlocked.saturating_add(c.unlocked);
        let shift = u32::from(lane.get()).saturating_mul(2);
        counts.nibble_range |= u32::from(c.nibble_range) << shift;
        counts.nibble_unlocked |= u32::from(c.nibble_unlocked) << shift;
        if c.out_of_bounds {
            counts.out_of_bounds = counts.out_of_bounds.with(lane);
        }
    }
    counts
}

// ── Histogram ────────────────────────────────────────────────────────────────

/// Valid lane readings seen across attempts.
#[derive(Debug, Clone, Default)]
pub struct DeskewHistogram {
    lanes: PerLane<LinearMap<LaneSettings, u8, HISTOGRAM_SLOTS>>,
}

impl DeskewHistogram {
    /// Count one valid reading; new vectors are dropped once a lane's
    /// table is full.
    pub fn record(&mut self, lane: ByteLane, settings: LaneSettings) {
        let table = &mut self.lanes[lane];
        if let Some(count) = table.get_mut(&settings) {
            *count = count.saturating_add(1);
        } else {
            let _ = table.insert(settings, 1);
        }
    }

    /// Most frequent reading of `lane` other than `excluding`; ties keep the
    /// earliest recorded.
    pub fn alternate(&self, lane: ByteLane, excluding: &LaneSettings) -> Option<LaneSettings> {
        let mut best: Option<(LaneSettings, u8)> = None;
        for (settings, count) in self.lanes[lane].iter() {
            if settings == excluding {
                continue;
            }
            if best.map_or(true, |(_, c)| *count > c) {
                best = Some((*settings, *count));
            }
        }
        best.map(|(settings, _)| settings)
    }
}

// ── Trainer ──────────────────────────────────────────────────────────────────

/// Trainer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeskewState {
    /// Reset the per-bit state machines.
    Reset,
    /// Run the deskew sequence.
    Train,
    /// Read back and judge.
    Validate,
    /// Result accepted.
    Accept,
    /// Unlocked, out-of-bounds or nibble-range failure.
    RetryLock,
    /// Saturation failure.
    RetrySaturation,
}

/// Outcome of deskew training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeskewReport {
    /// Accepted settings per lane; bit 8 is DBI.
    pub settings: PerLane<LaneSettings>,
    /// Lock retries used.
    pub lock_retries: u8,
    /// Saturation retries used.
    pub saturation_retries: u8,
    /// Lanes replaced by their alternate.
    pub alternates: LaneMask,
}

struct Snapshot {
    readings: PerLane<[BitReading; BITS_PER_LANE]>,
    checks: PerLane<LaneCheck>,
    counts: DeskewCounts,
}

impl Snapshot {
    fn settings(&self, lane: ByteLane) -> LaneSettings {
        self.readings[lane].map(|r| r.setting)
    }
}

fn bits_per_lane(ctx: &TrainingContext) -> usize {
    if ctx.config.deskew.dbi {
        BITS_PER_LANE
    } else {
        BITS_PER_LANE.saturating_sub(1)
    }
}

fn read_back<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
) -> Snapshot {
    let bits = bits_per_lane(ctx);
    let mut readings = PerLane::splat([BitReading::default(); BITS_PER_LANE]);
    let mut checks = PerLane::splat(LaneCheck::default());
    for lane in ctx.lanes.iter() {
        let lane_readings = &mut readings[lane];
        for (bit, slot) in (0u8..).zip(lane_readings.iter_mut()).take(bits) {
            match lmc.phy_debug_read(lane, bit) {
                Ok(word) => *slot = BitReading::from_word(word),
                Err(t) => lmc_warn!("LMC{}: deskew read byte {} bit {}: {}", ctx.controller, lane.get(), bit, t),
            }
        }
        checks[lane] = check_lane(lane_readings, bits);
    }
    let counts = tally(&checks, ctx.lanes);
    Snapshot {
        readings,
        checks,
        counts,
    }
}

fn verdict(counts: &DeskewCounts) -> DeskewState {
    if counts.saturated > 0 {
        DeskewState::RetrySaturation
    } else if counts.unlocked > 0
        || counts.nibble_range != 0
        || counts.nibble_unlocked != 0
        || !counts.out_of_bounds.is_empty()
    {
        DeskewState::RetryLock
    } else {
        DeskewState::Accept
    }
}

fn dump(ctx: &TrainingContext, snap: &Snapshot) {
    for lane in ctx.lanes.iter() {
        let s = snap.settings(lane);
        lmc_debug!(
            "LMC{}: byte {} deskew {} {} {} {} {} {} {} {} dbi {}",
            ctx.controller,
            lane.get(),
            s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7], s[8]
        );
    }
}

/// Substitute alternates into failing lanes and write them back when the
/// result validates. Returns the substituted lanes on success.
fn try_alternates<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    snap: &Snapshot,
    histogram: &DeskewHistogram,
) -> Result<Option<(PerLane<LaneSettings>, LaneMask)>, TrainingError> {
    let bits = bits_per_lane(ctx);
    let mut settings = PerLane::from_fn(|lane| snap.settings(lane));
    let mut replaced = LaneMask::EMPTY;
    for lane in ctx.lanes.iter() {
        if snap.checks[lane].is_valid() {
            continue;
        }
        let Some(alt) = histogram.alternate(lane, &settings[lane]) else {
            return Ok(None);
        };
        let readings = alt.map(|setting| BitReading {
            setting,
            locked: true,
            saturated_low: false,
            saturated_high: false,
        });
        if !check_lane(&readings, bits).is_valid() {
            return Ok(None);
        }
        settings[lane] = alt;
        replaced = replaced.with(lane);
    }
    for lane in replaced.iter() {
        // bit selectors 0..=7 are DQ, PHY_BIT_SEL_DBI follows them
        for (bit, setting) in (0u8..=PHY_BIT_SEL_DBI).zip(settings[lane]).take(bits) {
            lmc.load_bit_override(lane, bit, u16::from(setting))?;
        }
    }
    Ok(Some((settings, replaced)))
}

/// Run deskew training over every populated rank.
pub fn train<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<DeskewReport, TrainingError> {
    let settings = ctx.config.deskew;
    let mut lock = RetryBudget::new(settings.lock_retries);
    let mut saturation = RetryBudget::new(settings.saturation_retries);
    let mut histogram = DeskewHistogram::default();
    let mut last: Option<Snapshot> = None;
    let mut state = DeskewState::Reset;

    let exhausted = loop {
        state = match state {
            DeskewState::Reset => {
                lmc.reset_deskew();
                DeskewState::Train
            }
            DeskewState::Train => {
                lmc.update::<ExtConfig>(|c| c.with_vrefint_seq_deskew(true));
                if let Err(t) = lmc.run_sequence(ctx.ranks(), Sequence::DeskewOrVref) {
                    lmc_warn!("LMC{}: deskew: {}", ctx.controller, t);
                }
                DeskewState::Validate
            }
            DeskewState::Validate => {
                let snap = read_back(lmc, ctx);
                for lane in ctx.lanes.iter() {
                    if snap.checks[lane].is_valid() {
                        histogram.record(lane, snap.settings(lane));
                    }
                }
                let next = verdict(&snap.counts);
                if next != DeskewState::Accept {
                    lmc_debug!(
                        "LMC{}: deskew attempt failed: {} saturated, {} unlocked, nibbles {} range {} unlocked, oob lanes {}",
                        ctx.controller,
                        snap.counts.saturated,
                        snap.counts.unlocked,
                        snap.counts.nibble_range,
                        snap.counts.nibble_unlocked,
                        snap.counts.out_of_bounds.bits()
                    );
                }
                last = Some(snap);
                next
            }
            DeskewState::Accept => break false,
            DeskewState::RetryLock => {
                if lock.consume() || saturation.consume() {
                    DeskewState::Reset
                } else {
                    break true;
                }
            }
            DeskewState::RetrySaturation => {
                if saturation.consume() || lock.consume() {
                    DeskewState::Reset
                } else {
                    break true;
                }
            }
        };
    };

    let Some(snap) = last else {
        return Err(RestartCause::DeskewUnstable {
            lock_retries: lock.used(),
            saturation_retries: saturation.used(),
        }
        .into());
    };

    if !exhausted {
        lmc_info!(
            "LMC{}: deskew locked after {} lock / {} saturation retries",
            ctx.controller,
            lock.used(),
            saturation.used()
        );
        return Ok(DeskewReport {
            settings: PerLane::from_fn(|lane| snap.settings(lane)),
            lock_retries: lock.used(),
            saturation_retries: saturation.used(),
            alternates: LaneMask::EMPTY,
        });
    }

    if ctx.config.deskew.verbose_on_failure {
        dump(ctx, &snap);
    }

    match try_alternates(lmc, ctx, &snap, &histogram)? {
        Some((settings, alternates)) => {
            lmc_warn!(
                "LMC{}: deskew budgets spent, alternates loaded on lanes {}",
                ctx.controller,
                alternates.bits()
            );
            Ok(DeskewReport {
                settings,
                lock_retries: lock.used(),
                saturation_retries: saturation.used(),
                alternates,
            })
        }
        None => Err(RestartCause::DeskewUnstable {
            lock_retries: lock.used(),
            saturation_retries: saturation.used(),
        }
        .into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn locked(setting: u8) -> BitReading {
        BitReading {
            setting,
            locked: true,
            ..BitReading::default()
        }
    }

    #[test]
    fn debug_word_layout() {
        let r = BitReading::from_word((64 << 3) | 0b101);
        assert_eq!(r.setting, 64);
        assert!(r.locked);
        assert!(r.saturated_high);
        assert!(!r.saturated_low);
    }

    #[test]
    fn clean_lane_is_valid() {
        let check = check_lane(&[locked(60); BITS_PER_LANE], 9);
        assert!(check.is_valid());
    }

    #[test]
    fn nibble_spread_is_flagged_per_nibble() {
        let mut r = [locked(40); BITS_PER_LANE];
        r[5] = locked(74);
        let check = check_lane(&r, 8);
        assert_eq!(check.nibble_range, 0b10);

        r[5] = locked(73);
        assert!(check_lane(&r, 8).is_valid());
    }

    #[test]
    fn bounds_are_inclusive() {
        let mut r = [locked(DESKEW_MIN); BITS_PER_LANE];
        r[3] = locked(DESKEW_MIN + MAX_NIBBLE_RANGE);
        assert!(check_lane(&r, 8).is_valid());
        r[0] = locked(DESKEW_MIN - 1);
        assert!(check_lane(&r, 8).out_of_bounds);
        let r = [locked(DESKEW_MAX + 1); BITS_PER_LANE];
        assert!(check_lane(&r, 8).out_of_bounds);
    }

    #[test]
    fn dbi_bit_only_counts_when_enabled() {
        let mut r = [locked(60); BITS_PER_LANE];
        r[8] = BitReading::default();
        assert!(check_lane(&r, 8).is_valid());
        assert_eq!(check_lane(&r, 9).unlocked, 1);
    }

    #[test]
    fn exhausted_nibble_needs_all_four_unlocked() {
        let mut r = [locked(60); BITS_PER_LANE];
        for slot in r.iter_mut().take(3) {
            slot.locked = false;
        }
        assert_eq!(check_lane(&r, 8).nibble_unlocked, 0);
        r[3].locked = false;
        assert_eq!(check_lane(&r, 8).nibble_unlocked, 0b01);
    }

    #[test]
    fn saturation_wins_over_lock_failures() {
        let counts = DeskewCounts {
            saturated: 1,
            unlocked: 3,
            ..DeskewCounts::default()
        };
        assert_eq!(verdict(&counts), DeskewState::RetrySaturation);
        let counts = DeskewCounts {
            out_of_bounds: LaneMask::from_bits(1),
            ..DeskewCounts::default()
        };
        assert_eq!(verdict(&counts), DeskewState::RetryLock);
        assert_eq!(verdict(&DeskewCounts::default()), DeskewState::Accept);
    }

    #[test]
    fn alternate_is_most_frequent_other_vector() {
        let lane = ByteLane::new(2).unwrap();
        let mut h = DeskewHistogram::default();
        h.record(lane, [50; 9]);
        h.record(lane, [60; 9]);
        h.record(lane, [60; 9]);
        h.record(lane, [70; 9]);
        assert_eq!(h.alternate(lane, &[0; 9]), Some([60; 9]));
        assert_eq!(h.alternate(lane, &[60; 9]), Some([50; 9]));
        assert_eq!(h.alternate(ByteLane::ECC, &[0; 9]), None);
    }
}
