//! Receiver offset and VREF training.
//!
//! Three things happen here, in order:
//!
//! 1. receiver offset training (sequence 11) over every populated rank;
//! 2. internal VREF calibration: sequence 10 in VREF mode, DAC codes read
//!    back per lane and loaded as overrides;
//! 3. DDR4 only: the DRAM-side VREF of each rank, computed from the ODT
//!    network (or measured by a pattern sweep on request) and written to
//!    MR6.
//!
//! Nothing in this module fails bring-up: exhausted retries log a warning
//! and keep the best values seen.

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use lmc_hal::regs::{narrow, ExtConfig, ModeregParams2, PHY_BIT_SEL_DAC};
use lmc_hal::{Lmc, PatternTester, PerLane, Rank, RegisterAccess, Sequence, TestPattern};

use crate::context::TrainingContext;
use crate::error::TrainingError;
use crate::log::{lmc_debug, lmc_info, lmc_warn};
use crate::mode_regs::{self, MR6};
use crate::retry::{Attempt, RetryBudget};

/// Most internal VREF samples taken per calibration.
pub const MAX_VREF_SAMPLES: usize = 16;

const VDD_MV: f64 = 1200.0;
const RSER_OHMS: f64 = 15.0;
const OPEN_OHMS: f64 = 1_000_000.0;

const RANGE1_BASE_PCT: f64 = 60.0;
const RANGE2_BASE_PCT: f64 = 45.0;
const STEP_PCT: f64 = 0.65;
const MAX_VREF_VALUE: u8 = 0x3f;

// ── MR6 setting ──────────────────────────────────────────────────────────────

/// DRAM VREF as programmed into MR6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VrefSetting {
    /// Range 2 (base 45 %) instead of range 1 (base 60 %).
    pub range2: bool,
    /// Step above the range base, 0.65 % each.
    pub value: u8,
}

impl VrefSetting {
    /// Nearest setting to a percentage of Vdd.
    #[allow(
        clippy::arithmetic_side_effects,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn from_percent(pct: f64) -> Self {
        let range2 = pct < RANGE1_BASE_PCT;
        let base = if range2 { RANGE2_BASE_PCT } else { RANGE1_BASE_PCT };
        let steps = (pct - base) / STEP_PCT;
        let value = if steps <= 0.0 {
            0
        } else {
            // `as` saturates; the cap below bounds the result
            (steps + 0.5) as u8
        };
        Self {
            range2,
            value: value.min(MAX_VREF_VALUE),
        }
    }

    /// Percentage of Vdd this setting selects.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn percent(self) -> f64 {
        let base = if self.range2 { RANGE2_BASE_PCT } else { RANGE1_BASE_PCT };
        base + f64::from(self.value) * STEP_PCT
    }
}

// ── Computed VREF ────────────────────────────────────────────────────────────

/// Termination seen by the DQ bus during writes to one rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OdtNetwork {
    /// Populated DIMM slots.
    pub dimm_count: u8,
    /// The DIMM has a single rank.
    pub single_rank: bool,
    /// RTT_NOM ohms, 0 = disabled.
    pub rtt_nom: u16,
    /// RTT_WR ohms, 0 = disabled.
    pub rtt_wr: u16,
    /// RTT_PARK ohms, 0 = disabled.
    pub rtt_park: u16,
    /// Controller DQ drive ohms.
    pub rdq: u16,
    /// No series resistor between controller and DRAM.
    pub direct: bool,
}

fn ohms(value: u16) -> f64 {
    if value == 0 {
        OPEN_OHMS
    } else {
        f64::from(value)
    }
}

#[allow(clippy::arithmetic_side_effects)]
fn parallel(a: f64, b: f64) -> f64 {
    a * b / (a + b)
}

impl OdtNetwork {
    /// Termination of `rank` under the context's ODT table.
    pub fn for_rank(ctx: &TrainingContext, rank: Rank) -> Self {
        let imp = ctx.impedance;
        Self {
            dimm_count: ctx.topology.dimm_count,
            single_rank: ctx.topology.ranks_per_dimm == 1,
            rtt_nom: imp.rtt_nom_ohms(ctx.odt.rtt_nom[rank]),
            rtt_wr: imp.rtt_wr_ohms(ctx.odt.rtt_wr[rank]),
            rtt_park: imp.rtt_park_ohms(ctx.odt.rtt_park[rank]),
            rdq: imp.dqx_ohms(ctx.odt.dqx_ctl),
            direct: ctx.direct_dram_connection,
        }
    }

    /// Receiver midpoint as a percentage of Vdd.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn vref_percent(&self) -> f64 {
        let rser = if self.direct { 0.0 } else { RSER_OHMS };
        let rdq = f64::from(self.rdq);
        let vref = if self.dimm_count < 2 {
            let park = if self.single_rank && self.rtt_wr != 0 {
                OPEN_OHMS
            } else {
                ohms(self.rtt_park)
            };
            let reff = parallel(ohms(self.rtt_wr), park);
            ((rser + rdq) * VDD_MV / (reff + rser + rdq) + VDD_MV) / 2.0
        } else {
            let rd0 = parallel(ohms(self.rtt_nom), ohms(self.rtt_wr)) + rser;
            let rd1 = parallel(ohms(self.rtt_park), ohms(self.rtt_park)) + rser;
            let rpullup = parallel(rd0, rd1);
            let vl = rdq * VDD_MV / (rdq + rpullup);
            let vlp = rser * (VDD_MV - vl) / rd0 + vl;
            (vlp + VDD_MV) / 2.0
        };
        vref * 100.0 / VDD_MV
    }
}

// ── Internal VREF ────────────────────────────────────────────────────────────

/// Outlier-trimmed mean: drop the minimum and maximum, average the rest and
/// round up to an even code. One sample is returned as is; two are averaged.
#[allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)]
pub fn trimmed_mean(samples: &[u16]) -> u16 {
    let n = samples.len();
    if n == 0 {
        return 0;
    }
    if n == 1 {
        return samples.iter().copied().next().unwrap_or(0);
    }
    let sum: u32 = samples.iter().map(|s| u32::from(*s)).sum();
    let (sum, count) = if n > 2 {
        let lo = samples.iter().copied().min().unwrap_or(0);
        let hi = samples.iter().copied().max().unwrap_or(0);
        (sum - u32::from(lo) - u32::from(hi), n as u32 - 2)
    } else {
        (sum, n as u32)
    };
    let avg = (sum + count / 2) / count;
    (avg + (avg & 1)) as u16
}

/// Largest difference between the codes of populated lanes.
pub fn code_spread(ctx: &TrainingContext, codes: &PerLane<u16>) -> u16 {
    let (lo, hi) = ctx
        .lanes
        .iter()
        .map(|lane| codes[lane])
        .fold((u16::MAX, 0), |(lo, hi), c| (lo.min(c), hi.max(c)));
    hi.saturating_sub(lo)
}

/// Run one internal VREF calibration of `rank` with `samples` sequence runs
/// and return the per-lane DAC code.
pub fn calibrate<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    rank: Rank,
    samples: u8,
) -> PerLane<u16> {
    let mut taken: Vec<PerLane<u16>, MAX_VREF_SAMPLES> = Vec::new();
    lmc.update::<ExtConfig>(|c| c.with_vrefint_seq_deskew(false));
    for _ in 0..samples {
        if let Err(t) = lmc.run_sequence(rank.mask(), Sequence::DeskewOrVref) {
            lmc_warn!("LMC{}: internal VREF: {}", ctx.controller, t);
            continue;
        }
        let mut codes = PerLane::splat(0u16);
        for lane in ctx.lanes.iter() {
            match lmc.phy_debug_read(lane, PHY_BIT_SEL_DAC) {
                Ok(word) => codes[lane] = word & 0xff,
                Err(t) => lmc_warn!("LMC{}: DAC read of byte {}: {}", ctx.controller, lane.get(), t),
            }
        }
        if taken.push(codes).is_err() {
            break;
        }
    }

    PerLane::from_fn(|lane| {
        let per_lane: Vec<u16, MAX_VREF_SAMPLES> = taken.iter().map(|s| s[lane]).collect();
        trimmed_mean(&per_lane)
    })
}

fn load_dac_codes<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    codes: &PerLane<u16>,
) -> Result<(), TrainingError> {
    for lane in ctx.lanes.iter() {
        lmc.load_bit_override(lane, PHY_BIT_SEL_DAC, codes[lane])?;
    }
    Ok(())
}

/// Calibrate internal VREF on the lowest populated rank, re-sampling while
/// the lanes disagree by more than the configured spread.
pub fn train_internal<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    let Some(rank) = ctx.ranks().lowest() else {
        return Ok(());
    };
    let settings = ctx.config.vref;
    let samples = settings
        .samples
        .min(u8::try_from(MAX_VREF_SAMPLES).unwrap_or(u8::MAX));
    let mut budget = RetryBudget::new(settings.retries);
    let mut best: Option<(u16, PerLane<u16>)> = None;

    let codes = loop {
        let codes = calibrate(lmc, ctx, rank, samples);
        let spread = code_spread(ctx, &codes);
        if best.map_or(true, |(s, _)| spread < s) {
            best = Some((spread, codes));
        }
        let ok = (spread <= settings.spread).then_some(codes);
        match budget.judge(ok) {
            Attempt::Accept(codes) => break codes,
            Attempt::Retry => {
                lmc_debug!("LMC{}: DAC spread {} exceeds {}, resampling", ctx.controller, spread, settings.spread);
            }
            Attempt::Exhausted => {
                let (spread, codes) = best.unwrap_or((spread, codes));
                lmc_warn!("LMC{}: internal VREF spread {} after {} retries, using best effort", ctx.controller, spread, budget.used());
                break codes;
            }
        }
    };

    load_dac_codes(lmc, ctx, &codes)?;
    lmc_info!("LMC{}: internal VREF DAC codes loaded", ctx.controller);
    ctx.results.dac_codes = Some(codes);
    Ok(())
}

// ── DRAM VREF ────────────────────────────────────────────────────────────────

/// Write a DRAM VREF to MR6 with the enter/set/exit sequence and record it
/// in `MODEREG_PARAMS2`.
pub fn program_dram_vref<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    rank: Rank,
    setting: VrefSetting,
) -> Result<(), TrainingError> {
    let VrefSetting { range2, value } = setting;
    mode_regs::write(lmc, rank, MR6, mode_regs::mr6(range2, value, true))?;
    lmc.delay_us(1);
    mode_regs::write(lmc, rank, MR6, mode_regs::mr6(range2, value, true))?;
    lmc.delay_us(1);
    mode_regs::write(lmc, rank, MR6, mode_regs::mr6(range2, value, false))?;
    lmc.try_update::<ModeregParams2>(|m| Ok(m.with_vref(rank, range2, narrow(value)?)))?;
    Ok(())
}

/// Sweep every MR6 value of `computed`'s range and return the centre of the
/// longest passing run; `None` when nothing passed. Only `computed.range2`
/// is used, the value itself does not narrow the sweep.
pub fn measure_dram_vref<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    rank: Rank,
    computed: VrefSetting,
) -> Result<Option<VrefSetting>, TrainingError> {
    let mut run: Option<(u8, u8)> = None;
    let mut best: Option<(u8, u8)> = None;
    for value in 0..=MAX_VREF_VALUE {
        let setting = VrefSetting {
            range2: computed.range2,
            value,
        };
        program_dram_vref(lmc, rank, setting)?;
        let pass = TestPattern::FIXED
            .into_iter()
            .all(|p| lmc.run_pattern(rank, p).intersect(ctx.lanes).is_empty());
        run = match (pass, run) {
            (true, Some((start, _))) => Some((start, value)),
            (true, None) => Some((value, value)),
            (false, _) => None,
        };
        if let Some((start, end)) = run {
            let longer = best.map_or(true, |(s, e)| end.saturating_sub(start) > e.saturating_sub(s));
            if longer {
                best = Some((start, end));
            }
        }
    }
    Ok(best.map(|(start, end)| VrefSetting {
        range2: computed.range2,
        value: start.saturating_add(end.saturating_sub(start) / 2),
    }))
}

/// Program the DRAM-side VREF of every populated DDR4 rank.
pub fn train_dram<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    if !ctx.is_ddr4() {
        return Ok(());
    }
    for rank in ctx.ranks().iter() {
        let network = OdtNetwork::for_rank(ctx, rank);
        let computed = VrefSetting::from_percent(network.vref_percent());
        let setting = if ctx.config.vref.measured {
            match measure_dram_vref(lmc, ctx, rank, computed)? {
                Some(measured) => measured,
                None => {
                    lmc_warn!("LMC{}: rank {} VREF sweep found no passing value, using computed", ctx.controller, rank.get());
                    computed
                }
            }
        } else {
            computed
        };
        program_dram_vref(lmc, rank, setting)?;
        lmc_debug!(
            "LMC{}: rank {} DRAM VREF range {} value {}",
            ctx.controller,
            rank.get(),
            if setting.range2 { 2u8 } else { 1u8 },
            setting.value
        );
        ctx.results.dram_vref[rank] = Some(setting);
    }
    Ok(())
}

/// Offset training, internal VREF and DRAM VREF.
pub fn train<B: RegisterAccess + PatternTester, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    if ctx.config.vref.offset_training {
        if let Err(t) = lmc.run_sequence(ctx.ranks(), Sequence::OffsetTraining) {
            lmc_warn!("LMC{}: offset training: {}", ctx.controller, t);
        }
    }
    if ctx.config.vref.internal {
        train_internal(lmc, ctx)?;
    }
    train_dram(lmc, ctx)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use lmc_hal::mocks::SimLmc;
    use lmc_hal::{BoardConfig, LaneMask};

    #[test]
    fn measured_vref_searches_the_whole_range() {
        // Values 40..=50 pass. A failing value costs one pattern (the
        // check stops at the first failure), a passing one all four.
        let mut value = 0u8;
        let mut calls = 0usize;
        let sim = SimLmc::default().on_pattern(move |_| {
            if (40..=50).contains(&value) {
                calls += 1;
                if calls == TestPattern::FIXED.len() {
                    calls = 0;
                    value += 1;
                }
                LaneMask::EMPTY
            } else {
                value += 1;
                LaneMask::ALL
            }
        });
        let mut lmc = Lmc::new(sim, NoopDelay::new(), 0);
        let ctx = TrainingContext::new(
            0,
            &BoardConfig::ddr4_rdimm_2r(),
            &TrainingConfig::default(),
            1_200_000_000,
        )
        .unwrap();
        let rank = Rank::new(0).unwrap();
        let computed = VrefSetting { range2: false, value: 10 };

        let found = measure_dram_vref(&mut lmc, &ctx, rank, computed).unwrap();
        assert_eq!(found, Some(VrefSetting { range2: false, value: 45 }));
    }

    #[test]
    fn percent_maps_to_the_right_range() {
        let s = VrefSetting::from_percent(69.0);
        assert!(!s.range2);
        assert_eq!(s.value, 14);

        let s = VrefSetting::from_percent(50.0);
        assert!(s.range2);
        assert_eq!(s.value, 8);

        // below the range-2 base clamps to the base
        assert_eq!(VrefSetting::from_percent(30.0), VrefSetting { range2: true, value: 0 });
        // far above range 1 caps at 0x3f
        assert_eq!(VrefSetting::from_percent(150.0).value, 0x3f);
    }

    #[test]
    fn one_slot_network() {
        // RTT_WR 120 ‖ RTT_PARK 240 = 80 Ω, Rdq 34 Ω
        let net = OdtNetwork {
            dimm_count: 1,
            single_rank: false,
            rtt_nom: 0,
            rtt_wr: 120,
            rtt_park: 240,
            rdq: 34,
            direct: false,
        };
        let pct = net.vref_percent();
        assert!((68.9..69.1).contains(&pct), "{pct}");
    }

    #[test]
    fn single_rank_ignores_park_when_writing_terminated() {
        let base = OdtNetwork {
            dimm_count: 1,
            single_rank: true,
            rtt_nom: 0,
            rtt_wr: 120,
            rtt_park: 240,
            rdq: 34,
            direct: false,
        };
        let open_park = OdtNetwork { rtt_park: 0, ..base };
        assert_eq!(base.vref_percent(), open_park.vref_percent());
    }

    #[test]
    fn direct_connection_lowers_the_midpoint() {
        let net = OdtNetwork {
            dimm_count: 2,
            single_rank: true,
            rtt_nom: 60,
            rtt_wr: 120,
            rtt_park: 240,
            rdq: 34,
            direct: false,
        };
        let direct = OdtNetwork { direct: true, ..net };
        assert!(direct.vref_percent() < net.vref_percent());
        assert!(net.vref_percent() > 50.0 && net.vref_percent() < 100.0);
    }

    #[test]
    fn trimmed_mean_drops_outliers_and_rounds_even() {
        assert_eq!(trimmed_mean(&[0x40, 0x40, 0x41, 0x40, 0xff]), 0x40);
        assert_eq!(trimmed_mean(&[0x00, 0x41, 0x41, 0x41, 0x80]), 0x42);
        assert_eq!(trimmed_mean(&[0x33]), 0x33);
        assert_eq!(trimmed_mean(&[]), 0);
    }
}
