//! Write-leveling vote behaviour.
//!
//! Tests:
//! 1. Unweighted rounds elect the plain majority
//! 2. The perfect-bitmask bonus lets a clean minority win; the outvoted
//!    majority stays on as the alternate
//! 3. Hardware rounds that split between two phases level to the majority
//! 4. A lane the pattern search never passes falls back to its alternate
//! 5. An alternate that is still out of line with its neighbour fails the rank
//!
//! Does NOT require physical hardware.
//!
//! Run with: cargo test -p lmc-training --test wlevel_vote

// Test file: unwrap/indexing/arithmetic are intentional test mechanisms.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
)]

use embedded_hal_mock::eh1::delay::NoopDelay;
use lmc_hal::mocks::{SimLmc, SimProfile, WlevelRound};
use lmc_hal::regs::WlevelRank;
use lmc_hal::{BoardConfig, ByteLane, LaneMask, Lmc, Rank};
use lmc_training::wlevel::{self, vote::BucketVote};
use lmc_training::{RestartCause, TrainingConfig, TrainingContext, TrainingError};

const ROUNDS: [u8; 7] = [0, 2, 2, 4, 4, 4, 6];

#[test]
fn unweighted_majority() {
    let mut vote = BucketVote::default();
    for d in ROUNDS {
        vote.add(d, false, 0);
    }
    assert_eq!(vote.counts(), [1, 2, 3, 1]);
    assert_eq!(vote.winner(), Some(4));
}

#[test]
fn perfect_bitmask_bonus_outweighs_the_majority() {
    let mut vote = BucketVote::default();
    for d in ROUNDS {
        vote.add(d, d == 6, 3);
    }
    assert_eq!(vote.counts(), [1, 2, 3, 4]);
    assert_eq!(vote.winner(), Some(6));
    assert_eq!(vote.alternate(1), Some(4));
}

#[test]
fn split_rounds_level_to_the_majority() {
    let lane = ByteLane::new(3).unwrap();
    let sim = SimLmc::default().on_wlevel(move |q| {
        let mut delays = SimProfile::default().wlevel[q.rank];
        // four of seven rounds see lane 3 two phases late
        if q.round % 7 < 4 {
            delays[lane] += 2;
        }
        WlevelRound::perfect(delays)
    });
    let mut lmc = Lmc::new(sim, NoopDelay::new(), 0);
    let config = TrainingConfig {
        perfect_bitmask_bonus: Some(0),
        ..TrainingConfig::default()
    };
    let ctx = TrainingContext::new(0, &BoardConfig::ddr4_rdimm_2r(), &config, 1_200_000_000)
        .unwrap();
    let rank = Rank::new(0).unwrap();
    let outcome = wlevel::level_rank(&mut lmc, &ctx, rank).unwrap();

    let profile = SimProfile::default().wlevel[rank];
    assert_eq!(outcome.delays[lane], profile[lane] + 2);
    assert_eq!(outcome.alternates[lane], Some(profile[lane]));
}

/// Lane 7 votes four rounds in seven for `majority` and the rest for
/// `runner_up`, and never passes a pattern test. Every other lane behaves.
fn stuck_lane_sim(majority: u8, runner_up: u8) -> SimLmc {
    let lane = ByteLane::new(7).unwrap();
    SimLmc::default()
        .on_wlevel(move |q| {
            let mut delays = SimProfile::default().wlevel[q.rank];
            delays[lane] = if q.round % 7 < 4 { majority } else { runner_up };
            WlevelRound::perfect(delays)
        })
        .on_pattern(move |q| {
            let expected = SimProfile::default().wlevel[q.rank];
            ByteLane::ALL
                .into_iter()
                .filter(|l| *l == lane || q.wlevel[*l] != expected[*l])
                .fold(LaneMask::EMPTY, LaneMask::with)
        })
}

fn unweighted_context() -> TrainingContext {
    let config = TrainingConfig {
        perfect_bitmask_bonus: Some(0),
        ..TrainingConfig::default()
    };
    TrainingContext::new(0, &BoardConfig::ddr4_rdimm_2r(), &config, 1_200_000_000).unwrap()
}

#[test]
fn unsettled_lane_falls_back_to_its_alternate() {
    // lane 6 levels to 10, so 30 is out of line and 10 is not
    let mut lmc = Lmc::new(stuck_lane_sim(30, 10), NoopDelay::new(), 0);
    let ctx = unweighted_context();
    let rank = Rank::new(0).unwrap();
    let outcome = wlevel::level_rank(&mut lmc, &ctx, rank).unwrap();

    let lane = ByteLane::new(7).unwrap();
    assert_eq!(outcome.alternates[lane], Some(10));
    assert_eq!(outcome.delays[lane], 10);
    assert!(outcome.estimated.contains(lane));
    assert!(!outcome.software.contains(lane));
    assert_eq!(outcome.validity_retries, 3);
    assert_eq!(lmc.read_rank::<WlevelRank>(rank).delay(lane), 10);
}

#[test]
fn alternate_still_out_of_line_fails_the_rank() {
    // runner-up 26 is as far from lane 6 as the winner
    let mut lmc = Lmc::new(stuck_lane_sim(30, 26), NoopDelay::new(), 0);
    let ctx = unweighted_context();
    let err = wlevel::level_rank(&mut lmc, &ctx, Rank::new(0).unwrap()).unwrap_err();

    assert_eq!(
        err,
        TrainingError::Restart(RestartCause::WriteLevelingUnstable {
            rank: 0,
            lanes: 0x80,
        })
    );
}
