//! DLL offset tuning and board DLL offsets.
//!
//! The tuner sweeps one DLL (write or read) of every lane at once through
//! a signed offset range. At each offset every pattern runs on every
//! populated rank; per rank and pattern it keeps the longest contiguous run
//! of passing offsets of each lane.
//!
//! ```text
//!   rank 0  pattern p   ····#########·····     run  [-8, 0]
//!   rank 1  pattern p   ······#########···     run  [-6, 2]
//!                              ^^^^^^^          safe [-6, 0]  centre -3
//! ```
//!
//! Each pattern's safe window is the intersection of its runs across ranks.
//! The final offset is the mean of the window centres over all patterns. A
//! lane with any pattern lacking a window of at least `min_window` offsets
//! keeps its previous offset.

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use lmc_hal::regs::{DllCtl3, DllOffsetMode};
use lmc_hal::{
    ByteLane, LaneMask, Lmc, PatternTester, PerLane, PerRank, RegisterAccess, TestPattern,
};

use crate::config::DLL_TUNE_AUTO_ABOVE_HZ;
use crate::context::TrainingContext;
use crate::error::TrainingError;
use crate::log::{lmc_debug, lmc_info, lmc_trace, lmc_warn};

/// First seed of the pseudo-random tuning patterns.
pub const DLL_LCG_SEED: u32 = 0x5eed_d11;
/// Pseudo-random patterns run at most.
pub const MAX_RANDOM_PATTERNS: usize = 4;

const MAX_PATTERNS: usize = TestPattern::FIXED.len() + MAX_RANDOM_PATTERNS;

/// Inclusive range of passing offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OffsetWindow {
    /// Lowest passing offset.
    pub start: i8,
    /// Highest passing offset.
    pub end: i8,
}

impl OffsetWindow {
    /// Offsets covered from `start` through `end`, in DLL offset units.
    /// A sweep with `step > 1` samples fewer points than this; the width
    /// still counts every offset between the outermost passing samples.
    #[allow(clippy::arithmetic_side_effects)] // start <= end
    pub fn width(self) -> u8 {
        (i16::from(self.end) - i16::from(self.start) + 1).clamp(0, 255) as u8
    }

    /// Midpoint, rounded toward negative infinity.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn centre(self) -> i16 {
        (i16::from(self.start) + i16::from(self.end)).div_euclid(2)
    }

    /// Overlap of two windows.
    pub fn intersect(self, other: Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(Self { start, end })
    }
}

/// Longest passing run seen so far in a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunTracker {
    current: Option<OffsetWindow>,
    best: Option<OffsetWindow>,
}

impl RunTracker {
    /// Record the outcome at `offset`. Offsets must arrive in ascending
    /// order.
    pub fn observe(&mut self, offset: i8, pass: bool) {
        if pass {
            let run = match self.current {
                Some(w) => OffsetWindow { end: offset, ..w },
                None => OffsetWindow {
                    start: offset,
                    end: offset,
                },
            };
            self.current = Some(run);
            if self.best.map_or(true, |b| run.width() > b.width()) {
                self.best = Some(run);
            }
        } else {
            self.current = None;
        }
    }

    /// Longest run, earliest on a tie.
    pub fn best(&self) -> Option<OffsetWindow> {
        self.best
    }
}

/// DLL offsets in force after bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DllReport {
    /// Write offset per lane.
    pub write: PerLane<i8>,
    /// Read offset per lane.
    pub read: PerLane<i8>,
    /// Lanes the tuner found no safe write window for.
    pub write_rejected: LaneMask,
    /// Lanes the tuner found no safe read window for.
    pub read_rejected: LaneMask,
}

/// Outcome of one tuning sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TuneOutcome {
    /// Offset programmed per lane.
    pub offsets: PerLane<i8>,
    /// Lanes left at their previous offset.
    pub rejected: LaneMask,
}

fn clamp_offset(offset: i8) -> i8 {
    offset.clamp(-DllCtl3::MAX_OFFSET, DllCtl3::MAX_OFFSET)
}

/// Whether the tuner runs on this bring-up.
pub fn should_tune(ctx: &TrainingContext) -> bool {
    match ctx.config.dll_tune.enabled {
        Some(on) => on,
        None => ctx.ddr_hz > DLL_TUNE_AUTO_ABOVE_HZ && ctx.is_ddr4() && !ctx.ranks().is_empty(),
    }
}

/// Fixed patterns followed by the configured pseudo-random ones.
#[allow(clippy::cast_possible_truncation)] // i < MAX_RANDOM_PATTERNS
pub fn tuning_patterns(random: u8) -> Vec<TestPattern, MAX_PATTERNS> {
    let mut patterns: Vec<TestPattern, MAX_PATTERNS> = TestPattern::FIXED.into_iter().collect();
    for i in 0..usize::from(random).min(MAX_RANDOM_PATTERNS) {
        let seed = DLL_LCG_SEED.wrapping_add(i as u32);
        let _ = patterns.push(TestPattern::Lcg { seed });
    }
    patterns
}

/// Safe window of one lane for one pattern: the intersection of its runs
/// over `ranks` trackers, `None` if any rank never passed or the overlap is
/// narrower than `min_window`.
pub fn safe_window<'a>(
    mut runs: impl Iterator<Item = &'a RunTracker>,
    min_window: u8,
) -> Option<OffsetWindow> {
    let first = runs.next()?.best()?;
    let window = runs.try_fold(first, |acc, t| acc.intersect(t.best()?))?;
    (window.width() >= min_window).then_some(window)
}

/// Mean of the window centres, `None` if any window is missing.
#[allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn combine(windows: impl Iterator<Item = Option<OffsetWindow>>) -> Option<i8> {
    let mut sum = 0i16;
    let mut count = 0i16;
    for w in windows {
        sum += w?.centre();
        count += 1;
    }
    (count > 0).then(|| (sum / count) as i8)
}

type PatternTrackers = PerLane<RunTracker>;

/// Sweep one DLL and program the chosen offsets. Lanes without a safe
/// window are reloaded with `previous`.
pub fn tune<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    mode: DllOffsetMode,
    previous: &PerLane<i8>,
) -> Result<TuneOutcome, TrainingError> {
    let settings = ctx.config.dll_tune;
    let patterns = tuning_patterns(settings.random_patterns);
    let mut trackers: PerRank<Vec<PatternTrackers, MAX_PATTERNS>> =
        PerRank(core::array::from_fn(|_| {
            patterns.iter().map(|_| PerLane::splat(RunTracker::default())).collect()
        }));

    lmc.set_dll_offset_enable(true);
    let (lo, hi) = (clamp_offset(settings.min_offset), clamp_offset(settings.max_offset));
    for offset in (lo..=hi).step_by(usize::from(settings.step.max(1))) {
        lmc.load_dll_offset(mode, None, offset)?;
        for rank in ctx.ranks().iter() {
            for (p, pattern) in patterns.iter().enumerate() {
                let failed = lmc.run_pattern(rank, *pattern);
                lmc_trace!(
                    "LMC{}: {} offset {} rank {} {} failing {}",
                    ctx.controller,
                    mode.name(),
                    offset,
                    rank.get(),
                    pattern.name(),
                    failed.bits()
                );
                let Some(lanes) = trackers[rank].get_mut(p) else { continue };
                for lane in ctx.lanes.iter() {
                    lanes[lane].observe(offset, !failed.contains(lane));
                }
            }
        }
    }

    let mut outcome = TuneOutcome {
        offsets: *previous,
        rejected: LaneMask::EMPTY,
    };
    for lane in ctx.lanes.iter() {
        let windows = (0..patterns.len()).map(|p| {
            safe_window(
                ctx.ranks()
                    .iter()
                    .filter_map(|r| trackers[r].get(p).map(|t| &t[lane])),
                settings.min_window,
            )
        });
        match combine(windows) {
            Some(offset) => {
                lmc_debug!(
                    "LMC{}: byte {} {} offset {}",
                    ctx.controller,
                    lane.get(),
                    mode.name(),
                    offset
                );
                outcome.offsets[lane] = offset;
            }
            None => {
                lmc_warn!(
                    "LMC{}: byte {} has no safe {} window, keeping {}",
                    ctx.controller,
                    lane.get(),
                    mode.name(),
                    previous[lane]
                );
                outcome.rejected = outcome.rejected.with(lane);
            }
        }
    }

    for lane in ctx.lanes.iter() {
        lmc.load_dll_offset(mode, Some(lane), clamp_offset(outcome.offsets[lane]))?;
    }
    Ok(outcome)
}

/// Tune the write then the read DLL, starting from the offsets already in
/// force.
pub fn train<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    let mut report = ctx.results.dll.unwrap_or_default();
    let write = tune(lmc, ctx, DllOffsetMode::Write, &report.write)?;
    report.write = write.offsets;
    report.write_rejected = write.rejected;
    let read = tune(lmc, ctx, DllOffsetMode::Read, &report.read)?;
    report.read = read.offsets;
    report.read_rejected = read.rejected;
    lmc_info!(
        "LMC{}: DLL tuning done, rejected write {} read {}",
        ctx.controller,
        report.write_rejected.bits(),
        report.read_rejected.bits()
    );
    ctx.results.dll = Some(report);
    Ok(())
}

/// Offsets a board asks for: the board table, with per-lane overrides
/// replacing entries when custom offsets are forced on. `None` when
/// nothing is to be applied.
pub fn custom_offsets(ctx: &TrainingContext) -> Option<(PerLane<i8>, PerLane<i8>)> {
    let cfg = ctx.config.custom_dll;
    let board = ctx.board_dll;
    let forced = match cfg.enabled {
        Some(false) => return None,
        Some(true) => true,
        None => false,
    };
    if !forced && ByteLane::ALL.iter().all(|l| board.write[*l] == 0 && board.read[*l] == 0) {
        return None;
    }
    let pick = |value: i8, over: Option<i8>| clamp_offset(if forced { over.unwrap_or(value) } else { value });
    Some((
        PerLane::from_fn(|l| pick(board.write[l], cfg.write_overrides[l])),
        PerLane::from_fn(|l| pick(board.read[l], cfg.read_overrides[l])),
    ))
}

/// Load the board's DLL offsets with the offsets gated off.
pub fn apply_custom<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<bool, TrainingError> {
    let Some((write, read)) = custom_offsets(ctx) else {
        return Ok(false);
    };
    lmc.set_dll_offset_enable(false);
    for lane in ctx.lanes.iter() {
        lmc.load_dll_offset(DllOffsetMode::Write, Some(lane), write[lane])?;
        lmc.load_dll_offset(DllOffsetMode::Read, Some(lane), read[lane])?;
        lmc_debug!(
            "LMC{}: byte {} custom DLL write {} read {}",
            ctx.controller,
            lane.get(),
            write[lane],
            read[lane]
        );
    }
    lmc.set_dll_offset_enable(true);
    ctx.results.dll = Some(DllReport {
        write,
        read,
        ..DllReport::default()
    });
    Ok(true)
}
