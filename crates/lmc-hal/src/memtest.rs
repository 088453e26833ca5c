//! Live data-pattern tests.
//!
//! Software write-leveling and DLL-offset tuning judge a setting by writing
//! a pattern to one rank and reading it back. The platform implements
//! [`PatternTester`]; this module defines the patterns and the helpers an
//! implementation needs to fold mismatches into failing byte lanes.

use crate::lanes::{ByteLane, LaneMask, Rank};

/// Multiplier of the pseudo-random pattern generator.
pub const LCG_MULTIPLIER: u32 = 1_664_525;
/// Increment of the pseudo-random pattern generator.
pub const LCG_INCREMENT: u32 = 1_013_904_223;

/// Data patterns driven during live tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TestPattern {
    /// Every bit set.
    AllOnes,
    /// Every bit clear.
    AllZeros,
    /// A single one walking across the 64-bit word.
    WalkingOnes,
    /// Alternating `0x55`/`0xaa` bytes, inverted every word.
    Checkerboard,
    /// Linear-congruential pseudo-random stream.
    Lcg {
        /// Initial generator state.
        seed: u32,
    },
}

impl TestPattern {
    /// Fixed patterns run before the pseudo-random ones.
    pub const FIXED: [Self; 4] = [
        Self::AllOnes,
        Self::AllZeros,
        Self::WalkingOnes,
        Self::Checkerboard,
    ];

    /// Word stream of this pattern.
    #[must_use]
    pub fn words(self) -> PatternWords {
        let state = match self {
            Self::Lcg { seed } => seed,
            _ => 0,
        };
        PatternWords {
            pattern: self,
            index: 0,
            state,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AllOnes => "ones",
            Self::AllZeros => "zeros",
            Self::WalkingOnes => "walk",
            Self::Checkerboard => "checker",
            Self::Lcg { .. } => "lcg",
        }
    }
}

/// Infinite iterator over the 64-bit words of a [`TestPattern`].
#[derive(Debug, Clone)]
pub struct PatternWords {
    pattern: TestPattern,
    index: u32,
    state: u32,
}

impl PatternWords {
    fn next_lcg(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state
    }
}

impl Iterator for PatternWords {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let index = self.index;
        self.index = self.index.wrapping_add(1);
        let word = match self.pattern {
            TestPattern::AllOnes => u64::MAX,
            TestPattern::AllZeros => 0,
            TestPattern::WalkingOnes => 1u64.rotate_left(index % 64),
            TestPattern::Checkerboard => {
                if index % 2 == 0 {
                    0x5555_5555_5555_5555
                } else {
                    0xaaaa_aaaa_aaaa_aaaa
                }
            }
            TestPattern::Lcg { .. } => {
                let hi = u64::from(self.next_lcg());
                let lo = u64::from(self.next_lcg());
                hi.rotate_left(32) | lo
            }
        };
        Some(word)
    }
}

/// Byte lanes that differ between an expected and an observed data word.
#[must_use]
pub fn failing_lanes(expected: u64, observed: u64) -> LaneMask {
    let diff = (expected ^ observed).to_le_bytes();
    ByteLane::ALL
        .into_iter()
        .zip(diff)
        .filter(|(_, byte)| *byte != 0)
        .fold(LaneMask::EMPTY, |acc, (lane, _)| acc.with(lane))
}

/// ECC lane check bits that differ between expected and observed.
#[must_use]
pub fn failing_ecc(expected: u8, observed: u8) -> LaneMask {
    if expected == observed {
        LaneMask::EMPTY
    } else {
        LaneMask::EMPTY.with(ByteLane::ECC)
    }
}

/// Runs a pattern against one rank of one controller.
pub trait PatternTester {
    /// Write `pattern` to a test region of `rank`, read it back and return
    /// the byte lanes that mismatched.
    fn run_pattern(&mut self, controller: u8, rank: Rank, pattern: TestPattern) -> LaneMask;
}

impl<T: PatternTester + ?Sized> PatternTester for &mut T {
    fn run_pattern(&mut self, controller: u8, rank: Rank, pattern: TestPattern) -> LaneMask {
        T::run_pattern(self, controller, rank, pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcg_matches_reference_recurrence() {
        let mut words = TestPattern::Lcg { seed: 1 }.words();
        let first = words.next().unwrap_or_default();
        let a = 1u32.wrapping_mul(LCG_MULTIPLIER).wrapping_add(LCG_INCREMENT);
        let b = a.wrapping_mul(LCG_MULTIPLIER).wrapping_add(LCG_INCREMENT);
        assert_eq!(first, (u64::from(a) << 32) | u64::from(b));
    }

    #[test]
    fn walking_ones_wraps_after_64_words() {
        let words: Vec<u64> = TestPattern::WalkingOnes.words().take(66).collect();
        assert_eq!(words.first(), Some(&1));
        assert_eq!(words.get(63), Some(&(1 << 63)));
        assert_eq!(words.get(64), Some(&1));
    }

    #[test]
    fn failing_lanes_maps_bytes_to_lanes() {
        let mask = failing_lanes(0, 0x00ff_0000_0000_0100);
        assert_eq!(mask.bits(), 0b0100_0010);
        assert!(failing_lanes(7, 7).is_empty());
    }

    #[test]
    fn ecc_mismatch_flags_lane_eight() {
        assert_eq!(failing_ecc(1, 3).bits(), 0x100);
        assert!(failing_ecc(9, 9).is_empty());
    }
}
