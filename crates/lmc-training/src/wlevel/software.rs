//! Write-leveling search by live pattern tests.
//!
//! Every searched lane walks its own candidate list (the seed's cycle
//! first, then the other cycles, phases 0/2/4/6 within each) while the
//! other lanes hold still. One step programs all candidates at once and
//! runs every pattern; a lane stops at the first candidate that passes.

use embedded_hal::delay::DelayNs;
use lmc_hal::regs::WlevelRank;
use lmc_hal::{DelayVector, LaneMask, Lmc, PatternTester, PerLane, Rank, RegisterAccess, TestPattern};

use crate::context::TrainingContext;
use crate::error::TrainingError;
use crate::log::{lmc_debug, lmc_trace};

/// Seed of the pseudo-random sweep pattern.
pub const SWEEP_LCG_SEED: u32 = 0x0bad_5eed;

/// Patterns a candidate must pass.
pub const SWEEP_PATTERNS: [TestPattern; 5] = [
    TestPattern::AllOnes,
    TestPattern::AllZeros,
    TestPattern::WalkingOnes,
    TestPattern::Checkerboard,
    TestPattern::Lcg { seed: SWEEP_LCG_SEED },
];

const CYCLES: [u8; 4] = [0, 8, 16, 24];
const PHASES: [u8; 4] = [0, 2, 4, 6];

/// Candidates per lane.
pub const CANDIDATES: usize = 16;

/// Search order for a lane seeded at `seed`.
pub fn candidates(seed: u8) -> [u8; CANDIDATES] {
    let first = seed & 0x18;
    let cycles = core::iter::once(first).chain(CYCLES.into_iter().filter(move |c| *c != first));
    let mut out = [0u8; CANDIDATES];
    for (slot, delay) in out
        .iter_mut()
        .zip(cycles.flat_map(|c| PHASES.map(|p| c | p)))
    {
        *slot = delay;
    }
    out
}

/// Lanes failing any of `patterns` on `rank`.
pub fn failing_lanes<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    rank: Rank,
    patterns: &[TestPattern],
) -> LaneMask {
    patterns.iter().fold(LaneMask::EMPTY, |acc, p| {
        LaneMask::from_bits(acc.bits() | lmc.run_pattern(rank, *p).bits())
    })
}

/// Search `lanes` of `rank` starting from `base`, each lane seeded by
/// `seeds`. Returns the passing delay of every lane that found one; the
/// rank's register is left holding the last vector tried.
pub fn sweep<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    rank: Rank,
    lanes: LaneMask,
    base: &DelayVector,
    seeds: &DelayVector,
) -> Result<PerLane<Option<u8>>, TrainingError> {
    let orders = PerLane::from_fn(|lane| candidates(seeds[lane]));
    let mut found = PerLane::splat(None);
    let mut searching = lanes;
    let mut delays = *base;

    for step in 0..CANDIDATES {
        if searching.is_empty() {
            break;
        }
        for lane in searching.iter() {
            if let Some(d) = orders[lane].get(step) {
                delays[lane] = *d;
            }
        }
        lmc.write_rank(rank, WlevelRank::from_delays(&delays)?);
        let failed = failing_lanes(lmc, rank, &SWEEP_PATTERNS);
        lmc_trace!(
            "LMC{}: rank {} sweep step {} failing {}",
            ctx.controller,
            rank.get(),
            step,
            failed.bits()
        );
        for lane in searching.iter() {
            if !failed.contains(lane) {
                lmc_debug!(
                    "LMC{}: rank {} byte {} passes at {}",
                    ctx.controller,
                    rank.get(),
                    lane.get(),
                    delays[lane]
                );
                found[lane] = Some(delays[lane]);
                searching = searching.without(lane);
            }
        }
    }
    Ok(found)
}
