//! Write leveling.
//!
//! Each populated rank is leveled by repeated hardware rounds. Every round
//! is normalized per lane and voted into a phase histogram ([`vote`]); the
//! majority vector must then look plausible along the board's routing
//! chains. A failing vector repeats the whole hardware pass within the
//! validity budget. Lanes still without an edge or out of line afterwards
//! are searched with live pattern tests ([`software`]). A lane the search
//! cannot settle falls back to its vote alternate, or keeps its hardware
//! value and is reported as estimated. A lane with no value at all fails
//! the rank.
//!
//! After read leveling the sequencer runs [`validate`], which pattern-tests
//! every rank and re-searches failing lanes seeded from the read-leveling
//! result.

pub mod software;
pub mod vote;

use embedded_hal::delay::DelayNs;
use lmc_hal::regs::{WlevelCtl, WlevelRank};
use lmc_hal::{
    ByteLane, DelayVector, LaneMask, Lmc, PatternTester, PerLane, Rank, RegisterAccess, Sequence,
};

use crate::config::WlevelFailureAction;
use crate::context::TrainingContext;
use crate::error::{FatalCause, RestartCause, TrainingError};
use crate::log::{lmc_debug, lmc_error, lmc_info, lmc_warn};
use crate::retry::RetryBudget;

pub use software::{candidates, sweep, SWEEP_PATTERNS};
pub use vote::{
    chain_violations, has_edge, interpolate_ecc, is_perfect, rlevel_to_wlevel, roundup_bitmask,
    BucketVote,
};

/// Write-leveling result of one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WlevelOutcome {
    /// Delays programmed into `WLEVEL_RANKn`.
    pub delays: DelayVector,
    /// Close runner-up per lane from the hardware vote.
    pub alternates: PerLane<Option<u8>>,
    /// Lanes settled by the pattern search.
    pub software: LaneMask,
    /// Lanes left at a substituted or unverified value.
    pub estimated: LaneMask,
    /// Hardware passes repeated after a failed plausibility check.
    pub validity_retries: u8,
}

/// Voted result of one hardware pass.
#[derive(Debug, Clone, Copy)]
struct HardwarePass {
    delays: DelayVector,
    alternates: PerLane<Option<u8>>,
    no_edge: LaneMask,
    out_of_line: LaneMask,
}

impl HardwarePass {
    fn failing(&self) -> LaneMask {
        vote::union(self.no_edge, self.out_of_line)
    }
}

fn hardware_pass<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    rank: Rank,
) -> HardwarePass {
    let settings = ctx.config.wlevel;
    let mut votes = PerLane::splat(BucketVote::default());

    for round in 0..settings.rounds {
        if let Err(t) = lmc.run_sequence(rank.mask(), Sequence::WriteLeveling) {
            lmc_error!("LMC{}: rank {} write-leveling round {}: {}", ctx.controller, rank.get(), round, t);
            continue;
        }
        let result = match lmc.wait_wlevel(rank) {
            Ok(r) => r,
            Err(t) => {
                lmc_error!("LMC{}: rank {} write-leveling round {}: {}", ctx.controller, rank.get(), round, t);
                continue;
            }
        };
        for lane in ctx.lanes.iter() {
            let bitmask = lmc.wlevel_bitmask(lane);
            if !has_edge(bitmask) {
                continue;
            }
            let delay = (result.delay(lane) & !7) | roundup_bitmask(bitmask);
            votes[lane].add(delay, is_perfect(bitmask), settings.perfect_bonus);
        }
    }

    let mut pass = HardwarePass {
        delays: PerLane::splat(0),
        alternates: PerLane::splat(None),
        no_edge: LaneMask::EMPTY,
        out_of_line: LaneMask::EMPTY,
    };
    for lane in ctx.lanes.iter() {
        match votes[lane].winner() {
            Some(d) => {
                pass.delays[lane] = d;
                pass.alternates[lane] = votes[lane].alternate(settings.alternate_margin);
            }
            None => pass.no_edge = pass.no_edge.with(lane),
        }
    }
    pass.out_of_line = chain_violations(
        &ctx.wlevel_chains(),
        &pass.delays,
        settings.max_adjacent_step,
        pass.no_edge,
    );
    pass
}

fn failure(ctx: &TrainingContext, rank: Rank, lanes: LaneMask) -> TrainingError {
    lmc_error!(
        "LMC{}: rank {} write leveling failed, lanes {}",
        ctx.controller,
        rank.get(),
        lanes.bits()
    );
    match ctx.config.wlevel.on_failure {
        WlevelFailureAction::Restart => RestartCause::WriteLevelingUnstable {
            rank: rank.get(),
            lanes: lanes.bits(),
        }
        .into(),
        WlevelFailureAction::Reset => FatalCause::WriteLeveling { rank: rank.get() }.into(),
    }
}

/// Interpolated ECC delay when the ECC lane is populated and both
/// neighbours hold trusted values.
fn ecc_estimate(ctx: &TrainingContext, delays: &DelayVector, untrusted: LaneMask) -> Option<u8> {
    let (lo, hi) = ctx.ecc_neighbours()?;
    if !ctx.has_ecc() || untrusted.contains(lo) || untrusted.contains(hi) {
        return None;
    }
    Some(interpolate_ecc(delays[lo], delays[hi]))
}

/// Level one rank and program the result.
pub fn level_rank<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    rank: Rank,
) -> Result<WlevelOutcome, TrainingError> {
    let settings = ctx.config.wlevel;
    lmc.update::<WlevelCtl>(|c| c.with_lanes(ctx.lanes));

    let mut budget = RetryBudget::new(settings.validity_retries);
    let mut pass = hardware_pass(lmc, ctx, rank);
    while !pass.failing().is_empty() && budget.consume() {
        lmc_warn!(
            "LMC{}: rank {} write leveling: no edge {}, out of line {}, retry {}",
            ctx.controller,
            rank.get(),
            pass.no_edge.bits(),
            pass.out_of_line.bits(),
            budget.used()
        );
        pass = hardware_pass(lmc, ctx, rank);
    }

    let mut outcome = WlevelOutcome {
        delays: pass.delays,
        alternates: pass.alternates,
        validity_retries: budget.used(),
        ..WlevelOutcome::default()
    };
    let mut failing = pass.failing();

    if failing.contains(ByteLane::ECC) {
        if let Some(d) = ecc_estimate(ctx, &outcome.delays, failing) {
            lmc_debug!("LMC{}: rank {} ECC interpolated to {}", ctx.controller, rank.get(), d);
            outcome.delays[ByteLane::ECC] = d;
            outcome.estimated = outcome.estimated.with(ByteLane::ECC);
            failing = failing.without(ByteLane::ECC);
        }
    }

    if !failing.is_empty() {
        let found = sweep(lmc, ctx, rank, failing, &outcome.delays, &outcome.delays)?;
        let mut unresolved = LaneMask::EMPTY;
        for lane in failing.iter() {
            if let Some(d) = found[lane] {
                outcome.delays[lane] = d;
                outcome.software = outcome.software.with(lane);
            } else if let Some(alt) = outcome.alternates[lane] {
                outcome.delays[lane] = alt;
                outcome.estimated = outcome.estimated.with(lane);
            } else if !pass.no_edge.contains(lane) {
                outcome.estimated = outcome.estimated.with(lane);
            } else {
                unresolved = unresolved.with(lane);
            }
        }
        let still_out = chain_violations(
            &ctx.wlevel_chains(),
            &outcome.delays,
            settings.max_adjacent_step,
            unresolved,
        )
        .intersect(outcome.estimated);
        let unresolved = vote::union(unresolved, still_out);
        if !unresolved.is_empty() {
            return Err(failure(ctx, rank, unresolved));
        }
    }

    lmc.write_rank(rank, WlevelRank::from_delays(&outcome.delays)?);
    lmc_info!(
        "LMC{}: rank {} write level {} {} {} {} {} {} {} {} {}",
        ctx.controller,
        rank.get(),
        outcome.delays.0[8],
        outcome.delays.0[7],
        outcome.delays.0[6],
        outcome.delays.0[5],
        outcome.delays.0[4],
        outcome.delays.0[3],
        outcome.delays.0[2],
        outcome.delays.0[1],
        outcome.delays.0[0]
    );
    Ok(outcome)
}

/// Level every populated rank, then copy results to unpopulated ranks.
pub fn train<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    for rank in ctx.ranks().iter() {
        let outcome = level_rank(lmc, ctx, rank)?;
        ctx.results.wlevel[rank] = Some(outcome);
    }
    mirror(lmc, ctx);
    Ok(())
}

fn mirror<B: RegisterAccess, D: DelayNs>(lmc: &mut Lmc<B, D>, ctx: &TrainingContext) {
    for rank in Rank::ALL {
        if let Some(source) = ctx.mirror_source(rank) {
            let reg = lmc.read_rank::<WlevelRank>(source);
            lmc.write_rank(rank, reg);
        }
    }
}

/// Replace the ECC delay of every rank by the interpolation of its
/// neighbours.
pub fn force_ecc_interpolation<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    if !ctx.has_ecc() {
        return Ok(());
    }
    let Some((lo, hi)) = ctx.ecc_neighbours() else {
        return Ok(());
    };
    for rank in ctx.ranks().iter() {
        let reg = lmc.read_rank::<WlevelRank>(rank);
        let d = interpolate_ecc(reg.delay(lo), reg.delay(hi));
        lmc_debug!(
            "LMC{}: rank {} ECC write level {} -> {}",
            ctx.controller,
            rank.get(),
            reg.delay(ByteLane::ECC),
            d
        );
        lmc.write_rank(rank, reg.with_delay(ByteLane::ECC, d)?);
        if let Some(outcome) = ctx.results.wlevel[rank].as_mut() {
            outcome.delays[ByteLane::ECC] = d;
            outcome.estimated = outcome.estimated.with(ByteLane::ECC);
        }
    }
    mirror(lmc, ctx);
    Ok(())
}

/// Pattern-test every populated rank at its programmed write delays and
/// re-search lanes that fail, seeded from the read-leveling result.
pub fn validate<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    for rank in ctx.ranks().iter() {
        let current = lmc.read_rank::<WlevelRank>(rank).delays();
        let failed = software::failing_lanes(lmc, rank, &SWEEP_PATTERNS).intersect(ctx.lanes);
        if failed.is_empty() {
            continue;
        }
        lmc_warn!(
            "LMC{}: rank {} write-leveling validation failed on lanes {}",
            ctx.controller,
            rank.get(),
            failed.bits()
        );
        let seeds = match ctx.results.rlevel[rank] {
            Some(choice) => PerLane::from_fn(|lane| rlevel_to_wlevel(choice.delays[lane])),
            None => current,
        };
        let found = sweep(lmc, ctx, rank, failed, &current, &seeds)?;

        let mut outcome = ctx.results.wlevel[rank].unwrap_or_default();
        let mut delays = current;
        for lane in failed.iter() {
            match found[lane] {
                Some(d) => {
                    delays[lane] = d;
                    outcome.software = outcome.software.with(lane);
                    outcome.estimated = outcome.estimated.without(lane);
                }
                None => {
                    lmc_warn!(
                        "LMC{}: rank {} byte {} kept at {} unverified",
                        ctx.controller,
                        rank.get(),
                        lane.get(),
                        delays[lane]
                    );
                    outcome.estimated = outcome.estimated.with(lane);
                }
            }
        }
        lmc.write_rank(rank, WlevelRank::from_delays(&delays)?);
        outcome.delays = delays;
        ctx.results.wlevel[rank] = Some(outcome);
    }
    mirror(lmc, ctx);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use lmc_hal::mocks::{SimLmc, SimProfile, WlevelRound};
    use lmc_hal::BoardConfig;

    const DDR_HZ: u32 = 1_200_000_000;

    fn ctx_with(config: &TrainingConfig) -> TrainingContext {
        TrainingContext::new(0, &BoardConfig::ddr4_rdimm_2r(), config, DDR_HZ).unwrap()
    }

    fn rank0() -> Rank {
        Rank::new(0).unwrap()
    }

    #[test]
    fn clean_rounds_level_to_the_profile() {
        let mut lmc = Lmc::new(SimLmc::default(), NoopDelay::new(), 0);
        let mut ctx = ctx_with(&TrainingConfig::default());
        train(&mut lmc, &mut ctx).unwrap();

        let expected = SimProfile::default().wlevel[rank0()];
        let outcome = ctx.results.wlevel[rank0()].unwrap();
        assert_eq!(outcome.delays, expected);
        assert!(outcome.software.is_empty());
        assert!(outcome.estimated.is_empty());
        assert_eq!(outcome.validity_retries, 0);

        let sim = lmc.bus();
        assert_eq!(sim.peek_rank::<WlevelRank>(0, rank0()).delays(), expected);
        // rank 2 sits in the empty slot and mirrors rank 0
        assert_eq!(sim.peek_rank::<WlevelRank>(0, Rank::new(2).unwrap()).delays(), expected);
        assert_eq!(sim.sequence_count(0, Sequence::WriteLeveling), 14);
    }

    #[test]
    fn lane_without_edge_is_found_by_the_sweep() {
        let dead = ByteLane::new(5).unwrap();
        let profile = SimProfile::default().wlevel[rank0()];
        let sim = SimLmc::default().on_wlevel(move |_| {
            let mut round = WlevelRound::perfect(profile);
            round.bitmasks[dead] = 0;
            round
        });
        let mut lmc = Lmc::new(sim, NoopDelay::new(), 0);
        let ctx = ctx_with(&TrainingConfig::default());
        let outcome = level_rank(&mut lmc, &ctx, rank0()).unwrap();

        assert_eq!(outcome.delays, profile);
        assert_eq!(outcome.software, LaneMask::EMPTY.with(dead));
        assert_eq!(outcome.validity_retries, 3);
    }

    #[test]
    fn unsettled_lane_restarts_by_default() {
        let dead = ByteLane::new(1).unwrap();
        let sim = SimLmc::default()
            .on_wlevel(move |_| {
                let mut round = WlevelRound::perfect(SimProfile::default().wlevel[Rank::ALL[0]]);
                round.bitmasks[dead] = 0xff;
                round
            })
            .on_pattern(move |_| LaneMask::EMPTY.with(dead));
        let mut lmc = Lmc::new(sim, NoopDelay::new(), 0);
        let ctx = ctx_with(&TrainingConfig {
            wlevel_validity_retries: Some(0),
            ..TrainingConfig::default()
        });
        let err = level_rank(&mut lmc, &ctx, rank0()).unwrap_err();
        assert_eq!(
            err,
            TrainingError::Restart(RestartCause::WriteLevelingUnstable { rank: 0, lanes: 0b10 })
        );

        let ctx = ctx_with(&TrainingConfig {
            wlevel_validity_retries: Some(0),
            wlevel_failure: WlevelFailureAction::Reset,
            ..TrainingConfig::default()
        });
        let err = level_rank(&mut lmc, &ctx, rank0()).unwrap_err();
        assert_eq!(err, TrainingError::Fatal(FatalCause::WriteLeveling { rank: 0 }));
    }

    #[test]
    fn ecc_without_edge_is_interpolated() {
        let profile = SimProfile::default().wlevel[rank0()];
        let sim = SimLmc::default().on_wlevel(move |_| {
            let mut round = WlevelRound::perfect(profile);
            round.bitmasks[ByteLane::ECC] = 0;
            round
        });
        let mut lmc = Lmc::new(sim, NoopDelay::new(), 0);
        let ctx = ctx_with(&TrainingConfig::default());
        let outcome = level_rank(&mut lmc, &ctx, rank0()).unwrap();
        // lanes 3 and 4 level to 6 and 8
        assert_eq!(outcome.delays[ByteLane::ECC], 8);
        assert_eq!(outcome.estimated, LaneMask::EMPTY.with(ByteLane::ECC));
        assert!(outcome.software.is_empty());
    }

    #[test]
    fn validation_researches_failing_lanes() {
        let mut lmc = Lmc::new(SimLmc::default(), NoopDelay::new(), 0);
        let mut ctx = ctx_with(&TrainingConfig::default());
        train(&mut lmc, &mut ctx).unwrap();

        // knock lane 7 off its delay
        let lane = ByteLane::new(7).unwrap();
        let reg = lmc.read_rank::<WlevelRank>(rank0());
        lmc.write_rank(rank0(), reg.with_delay(lane, 2).unwrap());

        validate(&mut lmc, &mut ctx).unwrap();
        let outcome = ctx.results.wlevel[rank0()].unwrap();
        assert_eq!(outcome.delays[lane], 10);
        assert!(outcome.software.contains(lane));
        assert_eq!(lmc.read_rank::<WlevelRank>(rank0()).delay(lane), 10);
    }
}
