//! Read-leveling scenarios against the simulated controller.
//!
//! Tests:
//! 1. A single clean (RTT_NOM, RODT) row wins for the rank that sees it
//! 2. Leveling twice on the same controller reproduces the same result
//! 3. Excluding every RODT row is fatal and resets the chip
//! 4. Window scoring: clean windows of four to six are free, narrower ones
//!    cost more the narrower they get, strays never make a mask cheaper
//!
//! Does NOT require physical hardware.
//!
//! Run with: cargo test -p lmc-training --test rlevel_scenarios

// Test file: unwrap/indexing/arithmetic are intentional test mechanisms.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::arithmetic_side_effects,
)]

use embedded_hal_mock::eh1::delay::NoopDelay;
use lmc_hal::mocks::{rlevel_window, SimLmc, SimProfile};
use lmc_hal::regs::{CompCtl2, ModeregParams1, RlevelRank};
use lmc_hal::{BoardConfig, Lmc, PerLane, Rank};
use lmc_training::rlevel::{fit_bitmask, score};
use lmc_training::{rlevel, train, TrainRequest, TrainingConfig, TrainingContext};
use proptest::prelude::*;

const DDR_HZ: u32 = 1_200_000_000;

fn rank(i: u8) -> Rank {
    Rank::new(i).unwrap()
}

fn context(config: &TrainingConfig) -> TrainingContext {
    TrainingContext::new(0, &BoardConfig::ddr4_rdimm_2r(), config, DDR_HZ).unwrap()
}

proptest! {
    /// Contiguous windows of four to six ones score 0 wherever they sit.
    #[test]
    fn full_width_windows_are_free(start in 0u32..=50, width in 4u32..=6, ddr4 in any::<bool>()) {
        let mask = ((1u64 << width) - 1) << start;
        prop_assert_eq!(fit_bitmask(mask, ddr4).errors, 0);
    }

    /// Narrow windows cost NARROW_ERROR per missing bit below four.
    #[test]
    fn narrower_windows_cost_more(start in 0u32..=50, width in 1u32..=3) {
        let mask = ((1u64 << width) - 1) << start;
        prop_assert_eq!(fit_bitmask(mask, true).errors, (4 - width) * score::NARROW_ERROR);
    }

    /// A stray one past a gap after a clean window always adds cost.
    #[test]
    fn stray_bits_never_help(start in 0u32..=40, width in 4u32..=6, gap in 1u32..=8) {
        let clean = ((1u64 << width) - 1) << start;
        let stray = clean | (1u64 << (start + width + gap));
        prop_assert!(fit_bitmask(stray, true).errors > fit_bitmask(clean, true).errors);
    }
}

/// Clean windows on the profile for rank 0 at NOM 3 / RODT 2 only; every
/// other row of rank 0 lands four steps late with a gap and a stray one.
fn single_good_row() -> SimLmc {
    SimLmc::default().on_rlevel(|q| {
        let d = SimProfile::default().rlevel[q.rank];
        let good = q.rank.get() != 0 || (q.rtt_nom == 3 && q.rodt_ctl == 2);
        PerLane::from_fn(|lane| {
            if good {
                rlevel_window(d[lane], 5)
            } else {
                let late = d[lane] + 4;
                rlevel_window(late, 5) | (1u64 << (late + 4))
            }
        })
    })
}

#[test]
fn rank_takes_its_only_clean_row() {
    let mut lmc = Lmc::new(single_good_row(), NoopDelay::new(), 0);
    let mut ctx = context(&TrainingConfig::default());
    rlevel::train(&mut lmc, &mut ctx).unwrap();

    let choice = ctx.results.rlevel[rank(0)].unwrap();
    assert_eq!((choice.rtt_nom, choice.rodt), (3, 2));
    assert_eq!(choice.score, 0);

    let profile = SimProfile::default().rlevel[rank(0)];
    assert_eq!(choice.delays, profile);
    assert_eq!(lmc.read_rank::<RlevelRank>(rank(0)).delays(), profile);

    // both ranks score 0, so the first one sets the controller ODT
    let odt = ctx.results.odt.unwrap();
    assert_eq!(odt.rodt, 2);
    assert_eq!(odt.rtt_nom[rank(0)], 3);
    assert_eq!(lmc.read::<CompCtl2>().rodt_ctl().value(), 2);
    assert_eq!(lmc.read::<ModeregParams1>().rank_rtt_nom(rank(0)), 3);
}

#[test]
fn bad_rows_are_scored_not_ignored() {
    let mut lmc = Lmc::new(single_good_row(), NoopDelay::new(), 0);
    let ctx = context(&TrainingConfig::default());
    rlevel::configure(&mut lmc, &ctx).unwrap();
    let sweeps = rlevel::measure(&mut lmc, &ctx).unwrap();

    for row in sweeps[rank(0)].iter().filter(|r| !r.skipped) {
        let score = row.sample.unwrap().score();
        if (row.rtt_nom, row.rodt) == (3, 2) {
            assert_eq!(score, 0);
        } else {
            assert!(score >= 10, "row ({}, {}) scored {}", row.rtt_nom, row.rodt, score);
        }
    }
}

#[test]
fn leveling_is_repeatable() {
    let mut lmc = Lmc::new(single_good_row(), NoopDelay::new(), 0);

    let mut first = context(&TrainingConfig::default());
    rlevel::train(&mut lmc, &mut first).unwrap();
    let mut second = context(&TrainingConfig::default());
    rlevel::train(&mut lmc, &mut second).unwrap();

    for r in [rank(0), rank(1)] {
        let a = first.results.rlevel[r].unwrap();
        let b = second.results.rlevel[r].unwrap();
        assert_eq!(a.delays, b.delays);
        assert_eq!(a.score, b.score);
    }
    assert_eq!(first.results.odt, second.results.odt);
}

#[test]
#[should_panic(expected = "chip reset requested")]
fn every_row_excluded_resets_the_chip() {
    let mut lmc = Lmc::new(SimLmc::default(), NoopDelay::new(), 0);
    let request = TrainRequest {
        config: TrainingConfig {
            rodt_skip_mask: Some(0xff),
            ..TrainingConfig::default()
        },
        requested_clock_hz: DDR_HZ,
        cpu_clock_hz: 2_000_000_000,
        reference_clock_hz: 100_000_000,
        active_controller_mask: 0b1,
    };
    let _ = train(&mut lmc, &BoardConfig::ddr4_rdimm_2r(), &request);
}
