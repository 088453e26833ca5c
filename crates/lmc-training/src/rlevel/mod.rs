//! Read leveling.
//!
//! Every populated rank is leveled under every RTT_NOM × RODT pair of the
//! configured sweep. A row is scored from the lanes' bitmask shapes
//! ([`score::fit_bitmask`]) plus the sequential consistency of the
//! resulting delays along each routing run. Each rank then takes its
//! lowest-scoring row; ties go to the higher RODT, then the higher RTT_NOM
//! resistance. Rows in the skip set are measured and logged but never
//! chosen.
//!
//! The chosen row's delays are refined lane by lane against the rank's
//! perfect-bitmask histogram (every delay any row measured with a clean
//! window), smoothed against the routing neighbours and optionally nudged,
//! then programmed. Unpopulated ranks copy a populated rank's vector.

pub mod score;

use core::cmp::Reverse;

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use lmc_hal::regs::{narrow, CompCtl2, LevelStatus, ModeregParams1, RlevelCtl, RlevelRank};
use lmc_hal::{
    DelayVector, LaneMask, Lmc, PerLane, PerRank, Rank, RegisterAccess, Sequence,
};

use crate::context::TrainingContext;
use crate::error::{FatalCause, TrainingError};
use crate::log::{lmc_debug, lmc_info, lmc_trace, lmc_warn};
use crate::mode_regs;

pub use score::{fit_bitmask, lane_delay, sequence_errors, BitmaskFit};

/// Highest RTT_NOM or RODT encoding swept.
pub const MAX_ENCODING: u8 = 7;
/// Sweep rows kept per rank.
pub const MAX_ROWS: usize = 64;

const MAX_RLEVEL_OFFSET: u8 = 15;

/// Delay distance from both neighbours beyond which a lane is pulled back.
const CONTINUITY_LIMIT: u8 = 2;

/// Best sample of one rank under one ODT setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RowSample {
    /// Delay computed from each lane's window.
    pub delays: DelayVector,
    /// Off-centre direction of each lane's bitmask.
    pub lean: PerLane<i8>,
    /// Lanes whose bitmask scored 0.
    pub perfect: LaneMask,
    /// Sum of the lanes' shape errors.
    pub bitmask_errors: u32,
    /// Sequential-consistency error.
    pub sequence_errors: u32,
}

impl RowSample {
    /// Total score, lower is better.
    pub fn score(&self) -> u32 {
        self.bitmask_errors.saturating_add(self.sequence_errors)
    }
}

/// One RTT_NOM × RODT combination of a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SweepRow {
    /// RTT_NOM encoding.
    pub rtt_nom: u8,
    /// RODT encoding.
    pub rodt: u8,
    /// Excluded from selection.
    pub skipped: bool,
    /// Best sample; `None` when every run timed out.
    pub sample: Option<RowSample>,
}

/// Rows measured for one rank.
pub type RankSweep = Vec<SweepRow, MAX_ROWS>;

/// Setting chosen for one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RankChoice {
    /// RTT_NOM encoding of the winning row.
    pub rtt_nom: u8,
    /// RODT encoding of the winning row.
    pub rodt: u8,
    /// Winning row's score.
    pub score: u32,
    /// Final programmed delays.
    pub delays: DelayVector,
}

/// ODT programmed after read leveling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OdtChoice {
    /// RTT_NOM per rank.
    pub rtt_nom: PerRank<u8>,
    /// Controller RODT, taken from the worst-scoring rank.
    pub rodt: u8,
    /// Rank whose best row scored highest.
    pub limiting_rank: u8,
}

// ── Sweep ────────────────────────────────────────────────────────────────────

/// RTT_NOM encodings swept. Populations that run without RTT_NOM sweep
/// only the disabled setting.
pub fn nom_range(ctx: &TrainingContext) -> core::ops::RangeInclusive<u8> {
    if ctx.ranks().iter().all(|r| ctx.odt.rtt_nom[r] == 0) {
        return 0..=0;
    }
    let (lo, hi) = ctx.config.rlevel.rtt_nom;
    lo.min(MAX_ENCODING)..=hi.min(MAX_ENCODING)
}

/// RODT encodings swept.
pub fn rodt_range(ctx: &TrainingContext) -> core::ops::RangeInclusive<u8> {
    let (lo, hi) = ctx.config.rlevel.rodt;
    lo.min(MAX_ENCODING)..=hi.min(MAX_ENCODING)
}

/// Whether a row is excluded from selection: named by `rodt_skip_mask`,
/// or on a two-rank DDR4 population an active RODT weaker than an active
/// RTT_NOM.
#[allow(clippy::arithmetic_side_effects)] // rodt <= 7
pub fn is_skipped(ctx: &TrainingContext, rtt_nom: u8, rodt: u8) -> bool {
    if (ctx.config.rlevel.rodt_skip_mask >> rodt) & 1 == 1 {
        return true;
    }
    if !ctx.is_ddr4() || ctx.ranks().count() != 2 {
        return false;
    }
    let nom_ohms = ctx.impedance.rtt_nom_ohms(rtt_nom);
    let rodt_ohms = ctx.impedance.rodt_ohms(rodt);
    nom_ohms != 0 && rodt_ohms != 0 && rodt_ohms < nom_ohms
}

fn program_odt<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    rtt_nom: &PerRank<u8>,
    rodt: u8,
) -> Result<(), TrainingError> {
    lmc.try_update::<CompCtl2>(|c| Ok(c.with_rodt_ctl(narrow(rodt)?)))?;
    for rank in ctx.ranks().iter() {
        let nom = rtt_nom[rank];
        lmc.try_update::<ModeregParams1>(|m| Ok(m.with_rtt_nom(rank.index(), narrow(nom)?)))?;
        let addr = mode_regs::mr1(ctx.dram(), nom, ctx.odt.dic[rank]);
        mode_regs::write(lmc, rank, mode_regs::MR1, addr)?;
    }
    Ok(())
}

/// Run one hardware read leveling on `rank` and score it.
pub fn sample_rank<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    rank: Rank,
) -> Option<RowSample> {
    if let Err(t) = lmc.run_sequence(rank.mask(), Sequence::ReadLeveling) {
        lmc_warn!("LMC{}: rank {} read leveling: {}", ctx.controller, rank.get(), t);
        return None;
    }
    if let Err(t) = lmc.wait_rlevel(rank) {
        lmc_warn!("LMC{}: rank {} read leveling: {}", ctx.controller, rank.get(), t);
        return None;
    }

    let settings = ctx.config.rlevel;
    let mut sample = RowSample::default();
    for lane in ctx.lanes.iter() {
        let bitmask = lmc.rlevel_bitmask(lane);
        let fit = fit_bitmask(bitmask, ctx.is_ddr4());
        sample.delays[lane] = lane_delay(&fit, settings.offset).min(RlevelRank::MAX_DELAY);
        sample.lean[lane] = fit.lean();
        sample.bitmask_errors = sample.bitmask_errors.saturating_add(fit.errors);
        if fit.errors == 0 {
            sample.perfect = sample.perfect.with(lane);
        }
        lmc_trace!(
            "LMC{}: rank {} byte {} bitmask {} start {} width {} errors {}",
            ctx.controller,
            rank.get(),
            lane.get(),
            bitmask,
            fit.start,
            fit.width,
            fit.errors
        );
    }
    if settings.sequential_check {
        for run in ctx.rlevel_runs() {
            let (errors, _) =
                sequence_errors(&run, &sample.delays, settings.max_adjacent_delay_increment);
            sample.sequence_errors = sample.sequence_errors.saturating_add(errors);
        }
    }
    Some(sample)
}

/// Measure every row for every populated rank.
pub fn measure<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
) -> Result<PerRank<RankSweep>, TrainingError> {
    let mut sweeps: PerRank<RankSweep> = PerRank(core::array::from_fn(|_| Vec::new()));
    for rtt_nom in nom_range(ctx) {
        for rodt in rodt_range(ctx) {
            program_odt(lmc, ctx, &PerRank::splat(rtt_nom), rodt)?;
            let skipped = is_skipped(ctx, rtt_nom, rodt);
            for rank in ctx.ranks().iter() {
                let mut best: Option<RowSample> = None;
                for _ in 0..ctx.config.rlevel.average_loops {
                    if let Some(s) = sample_rank(lmc, ctx, rank) {
                        if best.map_or(true, |b| s.score() < b.score()) {
                            best = Some(s);
                        }
                    }
                }
                let row = SweepRow {
                    rtt_nom,
                    rodt,
                    skipped,
                    sample: best,
                };
                if sweeps[rank].push(row).is_err() {
                    lmc_warn!("LMC{}: rank {} sweep table full", ctx.controller, rank.get());
                }
            }
        }
    }
    Ok(sweeps)
}

// ── Reduction ────────────────────────────────────────────────────────────────

/// Lowest-scoring selectable row; ties favour the higher RODT, then the
/// higher RTT_NOM resistance.
pub fn best_row(ctx: &TrainingContext, rows: &[SweepRow]) -> Option<(SweepRow, RowSample)> {
    rows.iter()
        .filter(|r| !r.skipped)
        .filter_map(|r| r.sample.map(|s| (*r, s)))
        .min_by_key(|(r, s)| {
            (
                s.score(),
                Reverse(ctx.impedance.rodt_ohms(r.rodt)),
                Reverse(ctx.impedance.rtt_nom_ohms(r.rtt_nom)),
            )
        })
}

/// Per lane, every delay at which some selectable row measured a perfect
/// bitmask.
#[allow(clippy::arithmetic_side_effects)] // delays < 64
pub fn perfect_histogram(rows: &[SweepRow]) -> PerLane<u64> {
    let mut hist = PerLane::splat(0u64);
    for row in rows.iter().filter(|r| !r.skipped) {
        let Some(sample) = row.sample else { continue };
        for lane in sample.perfect.iter() {
            hist[lane] |= 1u64 << (sample.delays[lane] & 63);
        }
    }
    hist
}

/// Bounds of `mask` when its ones form one contiguous run.
#[allow(clippy::arithmetic_side_effects)]
fn single_run(mask: u64) -> Option<(u8, u8)> {
    if mask == 0 {
        return None;
    }
    let lo = mask.trailing_zeros();
    let hi = 63 - mask.leading_zeros();
    let span = (u64::MAX >> (63 - (hi - lo))) << lo;
    #[allow(clippy::cast_possible_truncation)]
    (mask == span).then_some((lo as u8, hi as u8))
}

/// Set bit of `mask` nearest to `target`, lower on a tie.
fn nearest_bit(mask: u64, target: u8) -> Option<u8> {
    (0u8..64)
        .filter(|b| (mask >> b) & 1 == 1)
        .min_by_key(|b| b.abs_diff(target))
}

/// Final delays of a rank from its winning row.
///
/// - A lane whose row bitmask was not perfect moves to the middle of the
///   perfect histogram when that histogram is one run reaching to within
///   one step of the row's delay.
/// - An interior lane further than two steps from both routing neighbours
///   is pulled to the histogram delay nearest their mean.
/// - With a nudge configured, off-centre lanes shift by `nudge` in the
///   direction of their lean.
#[allow(clippy::arithmetic_side_effects)] // delays < 64
pub fn refine(ctx: &TrainingContext, row: &RowSample, hist: &PerLane<u64>) -> DelayVector {
    let mut delays = row.delays;

    for lane in ctx.lanes.iter() {
        if row.perfect.contains(lane) {
            continue;
        }
        let d = delays[lane];
        if let Some((lo, hi)) = single_run(hist[lane]) {
            if lo.saturating_sub(1) <= d && d <= hi.saturating_add(1) {
                delays[lane] = lo + (hi - lo) / 2;
            }
        }
    }

    let before = delays;
    for run in ctx.rlevel_runs() {
        for trio in run.windows(3) {
            let [prev, lane, next] = trio else { continue };
            let (p, c, n) = (before[*prev], before[*lane], before[*next]);
            if c.abs_diff(p) > CONTINUITY_LIMIT && c.abs_diff(n) > CONTINUITY_LIMIT {
                let mean = ((u16::from(p) + u16::from(n)) / 2) as u8;
                if let Some(d) = nearest_bit(hist[*lane], mean) {
                    delays[*lane] = d;
                }
            }
        }
    }

    let nudge = ctx.config.rlevel.nudge;
    if nudge != 0 {
        for lane in ctx.lanes.iter() {
            let shift = nudge * row.lean[lane];
            let d = i16::from(delays[lane]) + i16::from(shift);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                delays[lane] = d.clamp(0, i16::from(RlevelRank::MAX_DELAY)) as u8;
            }
        }
    }
    delays
}

fn dump(ctx: &TrainingContext, rank: Rank, rows: &[SweepRow], loud: bool) {
    for row in rows {
        let score = row.sample.map_or(u32::MAX, |s| s.score());
        let nom_ohms = ctx.impedance.rtt_nom_ohms(row.rtt_nom);
        let rodt_ohms = ctx.impedance.rodt_ohms(row.rodt);
        let tag = if row.skipped { " skipped" } else { "" };
        if loud {
            lmc_info!(
                "LMC{}: rank {} NOM {} ({} ohm) RODT {} ({} ohm) score {}{}",
                ctx.controller,
                rank.get(),
                row.rtt_nom,
                nom_ohms,
                row.rodt,
                rodt_ohms,
                score,
                tag
            );
        } else {
            lmc_debug!(
                "LMC{}: rank {} NOM {} ({} ohm) RODT {} ({} ohm) score {}{}",
                ctx.controller,
                rank.get(),
                row.rtt_nom,
                nom_ohms,
                row.rodt,
                rodt_ohms,
                score,
                tag
            );
        }
    }
}

/// Pick a row per rank and the controller-wide ODT. Fatal when a rank has
/// no selectable row with a sample.
pub fn reduce(
    ctx: &TrainingContext,
    sweeps: &PerRank<RankSweep>,
) -> Result<(PerRank<Option<RankChoice>>, OdtChoice), TrainingError> {
    let mut choices = PerRank::splat(None);
    let mut odt = OdtChoice::default();
    let mut worst: Option<u32> = None;

    for rank in ctx.ranks().iter() {
        let rows = &sweeps[rank];
        dump(ctx, rank, rows, false);
        let Some((row, sample)) = best_row(ctx, rows) else {
            if ctx.config.rlevel.verbose_on_failure {
                dump(ctx, rank, rows, true);
            }
            return Err(FatalCause::NoViableReadLevel { rank: rank.get() }.into());
        };
        let delays = refine(ctx, &sample, &perfect_histogram(rows));
        let score = sample.score();
        choices[rank] = Some(RankChoice {
            rtt_nom: row.rtt_nom,
            rodt: row.rodt,
            score,
            delays,
        });
        odt.rtt_nom[rank] = row.rtt_nom;
        if worst.map_or(true, |w| score > w) {
            worst = Some(score);
            odt.rodt = row.rodt;
            odt.limiting_rank = rank.get();
        }
        lmc_info!(
            "LMC{}: rank {} read level NOM {} RODT {} score {}",
            ctx.controller,
            rank.get(),
            row.rtt_nom,
            row.rodt,
            score
        );
    }
    Ok((choices, odt))
}

fn mirror<B: RegisterAccess, D: DelayNs>(lmc: &mut Lmc<B, D>, ctx: &TrainingContext) {
    for rank in Rank::ALL {
        if let Some(source) = ctx.mirror_source(rank) {
            let reg = lmc.read_rank::<RlevelRank>(source);
            lmc.write_rank(rank, reg);
        }
    }
}

/// Program `RLEVEL_CTL` for leveling.
pub fn configure<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
) -> Result<(), TrainingError> {
    let offset = ctx.config.rlevel.offset;
    lmc.try_update::<RlevelCtl>(|c| {
        Ok(c.with_offset_en(offset.is_some())
            .with_offset(narrow(offset.unwrap_or(0).min(MAX_RLEVEL_OFFSET))?)
            .with_bitmask(0xff)
            .with_delay_unload_all(true))
    })?;
    Ok(())
}

/// Sweep, choose and program every populated rank.
pub fn train<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    configure(lmc, ctx)?;
    let sweeps = measure(lmc, ctx)?;
    let (choices, odt) = reduce(ctx, &sweeps)?;

    for rank in ctx.ranks().iter() {
        if let Some(choice) = choices[rank] {
            lmc.write_rank(rank, RlevelRank::from_delays(&choice.delays)?);
        }
    }
    mirror(lmc, ctx);
    program_odt(lmc, ctx, &odt.rtt_nom, odt.rodt)?;

    ctx.results.rlevel = choices;
    ctx.results.odt = Some(odt);
    Ok(())
}

/// Re-level ranks whose read-leveling status is not complete, once, at the
/// programmed ODT.
pub fn relevel_incomplete<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<u8, TrainingError> {
    let mut releveled = 0u8;
    for rank in ctx.ranks().iter() {
        if lmc.read_rank::<RlevelRank>(rank).status() == LevelStatus::Complete {
            continue;
        }
        lmc_warn!("LMC{}: rank {} read leveling incomplete, re-leveling", ctx.controller, rank.get());
        let Some(sample) = sample_rank(lmc, ctx, rank) else { continue };
        let delays = refine(ctx, &sample, &PerLane::splat(0));
        lmc.write_rank(rank, RlevelRank::from_delays(&delays)?);
        if let Some(choice) = ctx.results.rlevel[rank].as_mut() {
            choice.delays = delays;
            choice.score = sample.score();
        }
        releveled = releveled.saturating_add(1);
    }
    if releveled > 0 {
        mirror(lmc, ctx);
    }
    Ok(releveled)
}
