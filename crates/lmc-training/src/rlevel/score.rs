//! Read-leveling bitmask and sequence scoring.
//!
//! A read-leveling run yields one 64-bit pass/fail bitmask per lane, bit `n`
//! set when delay `n` read the expected pattern. The ideal mask is one
//! contiguous run of four to six ones. [`fit_bitmask`] finds the widest run
//! of at most six ones and charges everything else; [`sequence_errors`]
//! charges delay vectors that zig-zag or jump along a routing run.

use lmc_hal::{ByteLane, DelayVector, PerLane};

/// Empty bitmask.
pub const BLANK_ERROR: u32 = 100;
/// Each zero between the first set bit and the window, or after it.
pub const BUBBLE_ERROR: u32 = 11;
/// Each one after the window.
pub const TRAILING_ERROR: u32 = 5;
/// Per missing bit below a width of four.
pub const NARROW_ERROR: u32 = 6;
/// Scaled by `2^extras - 1` for ones beyond a six-wide window (DDR4).
pub const TOOLONG_ERROR: u32 = 12;
/// Trend reversal between neighbouring lanes.
pub const NONSEQUENTIAL_ERROR: u32 = 50;
/// Per step beyond the allowed neighbour increment.
pub const ADJACENT_ERROR: u32 = 30;

const MASK_RANGE_BITS: u32 = 6;
const NARROW_BELOW: u32 = 4;

/// Window found in one lane's bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitmaskFit {
    /// Lowest delay of the window.
    pub start: u8,
    /// Window width, 0 for an empty mask.
    pub width: u8,
    /// Ones absorbed below a full-width window.
    pub extras: u8,
    /// Zeros between the first set bit and the window.
    pub leading_bubble: u8,
    /// Ones after the window.
    pub trailing_ones: u8,
    /// Shape error; 0 is a perfect mask.
    pub errors: u32,
}

impl BitmaskFit {
    /// Which way the mask leans: `1` when stray ones trail the window,
    /// `-1` when a bubble precedes it, `0` when balanced.
    pub fn lean(&self) -> i8 {
        match self.trailing_ones.cmp(&self.leading_bubble) {
            core::cmp::Ordering::Greater => 1,
            core::cmp::Ordering::Less => -1,
            core::cmp::Ordering::Equal => 0,
        }
    }
}

/// Score one lane's bitmask. Ones absorbed below a six-wide window count
/// as `extras` only on DDR4.
#[allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)] // bit positions < 64
pub fn fit_bitmask(bitmask: u64, ddr4: bool) -> BitmaskFit {
    if bitmask == 0 {
        return BitmaskFit {
            errors: BLANK_ERROR,
            ..BitmaskFit::default()
        };
    }
    let bit = |i: u32| (bitmask >> i) & 1 == 1;
    let first = bitmask.trailing_zeros();
    let last = 63 - bitmask.leading_zeros();

    let (mut start, width) = (1..=MASK_RANGE_BITS)
        .rev()
        .find_map(|w| {
            let window = (1u64 << w) - 1;
            let top = (last + 1).checked_sub(w)?;
            (first..=top)
                .rev()
                .find(|s| bitmask & (window << s) == window << s)
                .map(|s| (s, w))
        })
        .unwrap_or((last, 1));

    let mut extras = 0u32;
    if width == MASK_RANGE_BITS {
        while start > 0 && bit(start - 1) {
            start -= 1;
            if ddr4 {
                extras += 1;
            }
        }
    }

    let toolong = if extras > 0 {
        TOOLONG_ERROR.saturating_mul((1u32 << extras.min(16)) - 1)
    } else {
        0
    };
    let narrow = if width < NARROW_BELOW {
        (NARROW_BELOW - width) * NARROW_ERROR
    } else {
        0
    };

    let leading_bubble = ((first + 1)..start).filter(|i| !bit(*i)).count() as u32;
    let after = start + width + extras;
    let trailing_ones = (after..=last).filter(|i| bit(*i)).count() as u32;
    let trailing_zeros = (after..=last).count() as u32 - trailing_ones;

    let errors = (leading_bubble + trailing_zeros) * BUBBLE_ERROR
        + trailing_ones * TRAILING_ERROR
        + narrow
        + toolong;

    BitmaskFit {
        start: start as u8,
        width: width as u8,
        extras: extras as u8,
        leading_bubble: leading_bubble as u8,
        trailing_ones: trailing_ones as u8,
        errors,
    }
}

/// Delay chosen inside a window: `offset` steps before its end when offset
/// mode is on (never before the start), else the centre.
#[allow(clippy::arithmetic_side_effects)]
pub fn lane_delay(fit: &BitmaskFit, offset: Option<u8>) -> u8 {
    let end = fit.start.saturating_add(fit.width.saturating_sub(1));
    match offset {
        Some(off) => fit.start.max(end.saturating_sub(off)),
        None => fit.start.saturating_add(fit.width.saturating_sub(1) / 2),
    }
}

/// Sequential-consistency error of `run`: a reversal of the delay trend
/// costs [`NONSEQUENTIAL_ERROR`], a step beyond `max_adjacent` costs
/// [`ADJACENT_ERROR`] per extra step (`0` disables the step check). Each
/// pair's error is charged to its second lane.
#[allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)] // delays are 6-bit
pub fn sequence_errors(run: &[ByteLane], delays: &DelayVector, max_adjacent: u8) -> (u32, PerLane<u32>) {
    let mut per_lane = PerLane::splat(0u32);
    let mut total = 0u32;
    let mut prev_trend = 0i8;
    for pair in run.windows(2) {
        let [cur, next] = pair else { continue };
        let diff = i16::from(delays[*next]) - i16::from(delays[*cur]);
        let trend = diff.signum() as i8;
        let seq = if prev_trend != 0 && trend != 0 && prev_trend != trend {
            NONSEQUENTIAL_ERROR
        } else {
            0
        };
        let step = u32::from(diff.unsigned_abs());
        let max = u32::from(max_adjacent);
        let adj = if max != 0 && step > max {
            (step - max) * ADJACENT_ERROR
        } else {
            0
        };
        per_lane[*next] = seq + adj;
        total += seq + adj;
        if trend != 0 {
            prev_trend = trend;
        }
    }
    (total, per_lane)
}
