//! Controller bring-up.
//!
//! [`train`] validates the clocks, programs the controller from the board
//! parameters, initializes the DRAM and runs every trainer in order:
//!
//! ```text
//! clocks ─► base config ─► DRAM init ─► offset/VREF ─► deskew ─► write level
//!    ─► read level ─► workarounds ─► write-level validation
//!    ─► DLL offsets ─► scrambling / interrupt clear ─► size
//! ```
//!
//! A restart-class failure reruns the whole bring-up from a fresh
//! [`TrainingContext`]; a fatal one resets the chip.

use embedded_hal::delay::DelayNs;
use lmc_hal::regs::{
    narrow, CompCtl2, Config, Control, Int, ModeregParams0, ModeregParams1, ModeregParams2, RlevelCtl,
    RodtMask, ScrambleCfg0, ScrambleCfg1, TimingParams0, TimingParams1, WlevelCtl, WodtMask,
};
use lmc_hal::{
    Lmc, ParameterProvider, PatternTester, RankMask, RegisterAccess, ResetControl, Sequence,
    INIT_SETTLE_US,
};

use crate::config::{TrainingConfig, DEFAULT_MAX_DDR_CLOCK_HZ, DEFAULT_RESTART_RETRIES};
use crate::context::TrainingContext;
use crate::error::{ClockError, FatalCause, RestartRequested, TrainingError};
use crate::log::{lmc_debug, lmc_error, lmc_info, lmc_warn};
use crate::retry::RetryBudget;
use crate::{deskew, dll_offset, rlevel, vref, wlevel};

/// 50 MHz reference clock.
pub const REF_CLOCK_50MHZ: u32 = 50_000_000;
/// 100 MHz reference clock.
pub const REF_CLOCK_100MHZ: u32 = 100_000_000;
/// Tolerance on a measured reference clock, in percent.
pub const REF_CLOCK_TOLERANCE_PCT: u32 = 5;

/// Inputs of one bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrainRequest {
    /// Overrides.
    pub config: TrainingConfig,
    /// DDR clock asked for, in Hz.
    pub requested_clock_hz: u32,
    /// Core clock, in Hz.
    pub cpu_clock_hz: u32,
    /// Measured or requested reference clock, in Hz.
    pub reference_clock_hz: u32,
    /// Controllers the board uses, bit per controller index.
    pub active_controller_mask: u8,
}

// ── Clocks ───────────────────────────────────────────────────────────────────

#[allow(clippy::arithmetic_side_effects)] // nominal * 5 fits u64
fn within_tolerance(measured: u32, nominal: u32) -> bool {
    let diff = u64::from(measured.abs_diff(nominal)) * 100;
    diff <= u64::from(nominal) * u64::from(REF_CLOCK_TOLERANCE_PCT)
}

/// Reference clock in use: 100 MHz when `measured` is within tolerance of
/// it, otherwise 50 MHz.
pub fn reference_clock(controller: u8, measured: u32) -> u32 {
    if within_tolerance(measured, REF_CLOCK_100MHZ) {
        return REF_CLOCK_100MHZ;
    }
    if !within_tolerance(measured, REF_CLOCK_50MHZ) {
        lmc_warn!(
            "LMC{}: reference clock {} Hz unsupported, assuming 50 MHz",
            controller,
            measured
        );
    }
    REF_CLOCK_50MHZ
}

/// Effective DDR clock: the request capped at `max_hz`, rounded down to a
/// whole multiple of the reference clock.
pub fn ddr_clock(controller: u8, req: &TrainRequest) -> Result<u32, ClockError> {
    if req.requested_clock_hz == 0 {
        return Err(ClockError::Zero { which: "DDR" });
    }
    if req.cpu_clock_hz == 0 {
        return Err(ClockError::Zero { which: "CPU" });
    }
    let max_hz = req.config.max_ddr_clock_hz.unwrap_or(DEFAULT_MAX_DDR_CLOCK_HZ);
    let capped = req.requested_clock_hz.min(max_hz);
    if capped < req.requested_clock_hz {
        lmc_info!("LMC{}: DDR clock capped at {} Hz", controller, capped);
    }
    let reference = reference_clock(controller, req.reference_clock_hz);
    let multiplier = capped.checked_div(reference).unwrap_or(0).max(1);
    let ddr_hz = multiplier.saturating_mul(reference);
    if ddr_hz > req.cpu_clock_hz {
        return Err(ClockError::DdrFasterThanCpu {
            ddr_hz,
            cpu_hz: req.cpu_clock_hz,
        });
    }
    Ok(ddr_hz)
}

/// Read-data FIFO count: `10·cpu/ddr − 1`, at most 255.
#[allow(clippy::cast_possible_truncation)] // clamped to 255
pub fn rdf_cnt(cpu_hz: u32, ddr_hz: u32) -> u8 {
    u64::from(cpu_hz)
        .saturating_mul(10)
        .checked_div(u64::from(ddr_hz))
        .unwrap_or(0)
        .saturating_sub(1)
        .min(255) as u8
}

// ── Steps ────────────────────────────────────────────────────────────────────

/// Program geometry, timing, mode-register shadows, ODT and leveling
/// control from the context.
pub fn program_base<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
    cpu_hz: u32,
) -> Result<(), TrainingError> {
    let topo = ctx.topology;
    let mirrored = if ctx.dimm.address_mirroring {
        RankMask::from_bits(topo.ranks.bits() & 0b1010)
    } else {
        RankMask::EMPTY
    };
    lmc.try_update::<Config>(|c| {
        Ok(c.with_ecc_ena(ctx.has_ecc())
            .with_row_lsb(narrow(topo.row_lsb_encoding)?)
            .with_pbank_lsb(narrow(topo.pbank_lsb_encoding)?)
            .with_rank_ena(topo.ranks_per_dimm > 1)
            .with_mode32b(ctx.dimm.mode32b)
            .with_mirrored_ranks(mirrored))
    })?;
    lmc.update::<Control>(|c| {
        c.with_rdimm_ena(ctx.is_registered())
            .with_rdf_cnt(rdf_cnt(cpu_hz, ctx.ddr_hz))
    });

    let t = ctx.timing;
    lmc.try_update::<TimingParams0>(|p| {
        Ok(p.with_trcd(narrow(t.trcd)?)
            .with_trp(narrow(t.trp)?)
            .with_tras(narrow(t.tras)?)
            .with_trfc(t.trfc_x8))
    })?;
    lmc.try_update::<TimingParams1>(|p| {
        Ok(p.with_trrd(narrow(t.trrd)?)
            .with_tfaw(narrow(t.tfaw)?)
            .with_twtr(narrow(t.twtr)?))
    })?;
    lmc.try_update::<ModeregParams0>(|m| {
        Ok(m.with_cl(narrow(t.cl)?)
            .with_cwl(narrow(t.cwl)?)
            .with_wrp(narrow(t.wr)?))
    })?;

    let odt = ctx.odt;
    let ranks = ctx.ranks();
    lmc.try_update::<ModeregParams1>(|mut m| {
        for rank in ranks.iter() {
            let i = rank.index();
            m = m
                .with_rtt_nom(i, narrow(odt.rtt_nom[rank])?)
                .with_dic(i, narrow(odt.dic[rank])?)
                .with_rtt_wr(i, narrow(odt.rtt_wr[rank])?);
        }
        Ok(m)
    })?;
    if ctx.is_ddr4() {
        lmc.try_update::<ModeregParams2>(|mut m| {
            for rank in ranks.iter() {
                m = m.with_rtt_park(rank.index(), narrow(odt.rtt_park[rank])?);
            }
            Ok(m)
        })?;
    }
    lmc.try_update::<CompCtl2>(|c| {
        Ok(c.with_dqx_ctl(narrow(odt.dqx_ctl)?)
            .with_ck_ctl(narrow(odt.ck_ctl)?)
            .with_cmd_ctl(narrow(odt.cmd_ctl)?)
            .with_control_ctl(narrow(odt.ctl_ctl)?)
            .with_rodt_ctl(narrow(odt.rodt_ctl)?))
    })?;
    lmc.update::<WodtMask>(|w| {
        ranks
            .iter()
            .fold(w, |w, rank| w.with_terminating(rank, odt.wodt_mask[rank]))
    });
    lmc.update::<RodtMask>(|r| {
        ranks
            .iter()
            .fold(r, |r, rank| r.with_terminating(rank, odt.rodt_mask[rank]))
    });

    rlevel::configure(lmc, ctx)?;
    let wl_nom = ranks.lowest().map_or(0, |r| odt.rtt_nom[r]).min(7);
    lmc.try_update::<WlevelCtl>(|w| {
        Ok(w.with_lanes(ctx.lanes)
            .with_bitmask(0xff)
            .with_rtt_nom(narrow(wl_nom)?))
    })?;
    lmc_debug!(
        "LMC{}: base config ranks {} rdf_cnt {}",
        ctx.controller,
        ranks.bits(),
        rdf_cnt(cpu_hz, ctx.ddr_hz)
    );
    Ok(())
}

/// Power-up every populated rank `init_loops` times, then run the extra
/// init sequences.
pub fn init_dram<B: RegisterAccess, D: DelayNs>(lmc: &mut Lmc<B, D>, ctx: &TrainingContext) {
    for _ in 0..ctx.config.init_loops {
        for rank in ctx.ranks().iter() {
            if let Err(t) = lmc.run_sequence(rank.mask(), Sequence::PowerUpInit) {
                lmc_error!("LMC{}: rank {} init: {}", ctx.controller, rank.get(), t);
            }
        }
        lmc.delay_us(INIT_SETTLE_US);
    }
    for seq in ctx.config.init_sequences.into_iter().flatten() {
        for rank in ctx.ranks().iter() {
            if let Err(t) = lmc.run_sequence(rank.mask(), seq) {
                lmc_warn!("LMC{}: rank {} {}: {}", ctx.controller, rank.get(), seq.name(), t);
            }
        }
    }
}

/// Silicon workarounds and the incomplete-read-level recheck.
pub fn workarounds<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &mut TrainingContext,
) -> Result<(), TrainingError> {
    if ctx.silicon.is_early() {
        lmc_debug!("LMC{}: {} workarounds", ctx.controller, ctx.silicon);
        wlevel::force_ecc_interpolation(lmc, ctx)?;
        lmc.update::<RlevelCtl>(|c| c.with_delay_unload_all(true));
    }
    let releveled = rlevel::relevel_incomplete(lmc, ctx)?;
    if releveled > 0 {
        lmc_warn!("LMC{}: re-leveled {} ranks", ctx.controller, releveled);
    }
    Ok(())
}

/// Reported size, clamped by `limit_dram_mbytes`.
pub fn reported_size(ctx: &TrainingContext) -> u32 {
    let size = ctx.topology.size_mb;
    ctx.config.limit_dram_mbytes.map_or(size, |limit| size.min(limit))
}

/// Scrambling, interrupt clear and size.
pub fn finalize<B: RegisterAccess, D: DelayNs>(lmc: &mut Lmc<B, D>, ctx: &TrainingContext) -> u32 {
    if let Some(key) = ctx.config.data_scramble_key {
        lmc.write(ScrambleCfg0::default().with_key(key));
        if let Some(addr_key) = ctx.config.address_scramble_key {
            lmc.write(ScrambleCfg1::default().with_key(addr_key));
        }
        lmc.update::<Control>(|c| c.with_scramble_ena(true));
    }
    let pending = lmc.read::<Int>();
    if pending.any() {
        lmc_debug!("LMC{}: clearing interrupts {}", ctx.controller, pending.bits());
        lmc.write(pending);
    }
    reported_size(ctx)
}

fn previously_initialized<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    ctx: &TrainingContext,
) -> bool {
    let done = lmc.read::<Config>().init_ranks();
    !ctx.ranks().is_empty() && done.bits() & ctx.ranks().bits() == ctx.ranks().bits()
}

/// One bring-up attempt.
pub fn bring_up<B, D, P>(
    lmc: &mut Lmc<B, D>,
    params: &P,
    req: &TrainRequest,
    ddr_hz: u32,
) -> Result<u32, TrainingError>
where
    B: RegisterAccess + PatternTester,
    D: DelayNs,
    P: ParameterProvider + ?Sized,
{
    let mut ctx = TrainingContext::new(lmc.controller(), params, &req.config, ddr_hz)?;
    if ctx.config.preserve_memory && previously_initialized(lmc, &ctx) {
        lmc_info!("LMC{}: memory preserved, skipping training", ctx.controller);
        return Ok(reported_size(&ctx));
    }
    lmc_info!(
        "LMC{}: {} {} ranks {} at {} Hz, {}",
        ctx.controller,
        ctx.dram().name(),
        if ctx.is_registered() { "RDIMM" } else { "UDIMM" },
        ctx.ranks().bits(),
        ddr_hz,
        ctx.silicon
    );

    program_base(lmc, &ctx, req.cpu_clock_hz)?;
    init_dram(lmc, &ctx);

    vref::train(lmc, &mut ctx)?;
    let deskew = deskew::train(lmc, &mut ctx)?;
    ctx.results.deskew = Some(deskew);
    wlevel::train(lmc, &mut ctx)?;
    rlevel::train(lmc, &mut ctx)?;

    workarounds(lmc, &mut ctx)?;
    if ctx.config.wlevel.sw_validation {
        wlevel::validate(lmc, &mut ctx)?;
    }
    dll_offset::apply_custom(lmc, &mut ctx)?;
    if dll_offset::should_tune(&ctx) {
        dll_offset::train(lmc, &mut ctx)?;
    }

    let size = finalize(lmc, &ctx);
    lmc_info!("LMC{}: {} MB ready", ctx.controller, size);
    Ok(size)
}

fn fatal<B: RegisterAccess + ResetControl, D: DelayNs>(lmc: &mut Lmc<B, D>, cause: FatalCause) -> ! {
    lmc_error!("LMC{}: {}, resetting", lmc.controller(), cause);
    lmc.reset()
}

/// Bring up the controller `lmc` addresses.
///
/// Returns the usable size in MB, 0 for a controller outside
/// `active_controller_mask`. A restart-class failure is retried up to
/// `restart_retries` times; once spent the chip is reset, or with a limit
/// of 0 the restart is handed back as [`RestartRequested`]. Fatal failures
/// reset the chip and never return.
pub fn train<B, D, P>(
    lmc: &mut Lmc<B, D>,
    params: &P,
    req: &TrainRequest,
) -> Result<u32, RestartRequested>
where
    B: RegisterAccess + PatternTester + ResetControl,
    D: DelayNs,
    P: ParameterProvider + ?Sized,
{
    let controller = lmc.controller();
    let active = req
        .active_controller_mask
        .checked_shr(u32::from(controller))
        .map_or(false, |m| m & 1 == 1);
    if !active {
        lmc_debug!("LMC{}: inactive", controller);
        return Ok(0);
    }
    let ddr_hz = match ddr_clock(controller, req) {
        Ok(hz) => hz,
        Err(e) => fatal(lmc, FatalCause::Clock(e)),
    };

    let limit = req.config.restart_retries.unwrap_or(DEFAULT_RESTART_RETRIES);
    let mut budget = RetryBudget::new(limit);
    loop {
        match bring_up(lmc, params, req, ddr_hz) {
            Ok(size) => return Ok(size),
            Err(TrainingError::Fatal(cause)) => fatal(lmc, cause),
            Err(TrainingError::Restart(cause)) => {
                if budget.consume() {
                    lmc_warn!(
                        "LMC{}: {}, restart {} of {}",
                        controller,
                        cause,
                        budget.used(),
                        limit
                    );
                    continue;
                }
                if limit > 0 {
                    fatal(lmc, FatalCause::RestartsExhausted(limit));
                }
                lmc_warn!("LMC{}: {}, handing restart to caller", controller, cause);
                return Err(RestartRequested { cause });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use lmc_hal::mocks::SimLmc;
    use lmc_hal::{BoardConfig, RegisterId};

    fn request() -> TrainRequest {
        TrainRequest {
            config: TrainingConfig::default(),
            requested_clock_hz: 1_200_000_000,
            cpu_clock_hz: 2_000_000_000,
            reference_clock_hz: 100_000_000,
            active_controller_mask: 0b1,
        }
    }

    #[test]
    fn reference_clock_tolerance() {
        assert_eq!(reference_clock(0, 100_000_000), REF_CLOCK_100MHZ);
        assert_eq!(reference_clock(0, 104_000_000), REF_CLOCK_100MHZ);
        assert_eq!(reference_clock(0, 90_000_000), REF_CLOCK_50MHZ);
        assert_eq!(reference_clock(0, 50_000_000), REF_CLOCK_50MHZ);
    }

    #[test]
    fn clock_is_capped_and_checked() {
        let mut req = request();
        req.requested_clock_hz = 1_600_000_000;
        assert_eq!(ddr_clock(0, &req), Ok(1_200_000_000));
        req.cpu_clock_hz = 1_000_000_000;
        assert_eq!(
            ddr_clock(0, &req),
            Err(ClockError::DdrFasterThanCpu {
                ddr_hz: 1_200_000_000,
                cpu_hz: 1_000_000_000
            })
        );
        req.cpu_clock_hz = 0;
        assert_eq!(ddr_clock(0, &req), Err(ClockError::Zero { which: "CPU" }));
    }

    #[test]
    fn read_fifo_count() {
        assert_eq!(rdf_cnt(2_000_000_000, 1_200_000_000), 15);
        assert_eq!(rdf_cnt(u32::MAX, 1), 255);
    }

    #[test]
    fn inactive_controller_is_untouched() {
        let mut lmc = Lmc::new(SimLmc::default(), NoopDelay::new(), 1);
        let size = train(&mut lmc, &BoardConfig::ddr4_rdimm_2r(), &request()).unwrap();
        assert_eq!(size, 0);
        assert!(lmc.bus().events.is_empty());
    }

    #[test]
    fn inactive_controller_ignores_bad_clocks() {
        let mut lmc = Lmc::new(SimLmc::default(), NoopDelay::new(), 1);
        let mut req = request();
        req.cpu_clock_hz = 800_000_000;
        let size = train(&mut lmc, &BoardConfig::ddr4_rdimm_2r(), &req).unwrap();
        assert_eq!(size, 0);
        assert!(lmc.bus().events.is_empty());
    }

    #[test]
    fn preserved_memory_skips_training() {
        let mut sim = SimLmc::default();
        sim.preset(0, RegisterId::Config, 0, 0b11 << 12);
        let mut lmc = Lmc::new(sim, NoopDelay::new(), 0);
        let mut req = request();
        req.config.preserve_memory = true;
        req.config.limit_dram_mbytes = Some(4096);
        assert_eq!(train(&mut lmc, &BoardConfig::ddr4_rdimm_2r(), &req), Ok(4096));
        assert!(lmc.bus().events.is_empty());
    }

    #[test]
    #[should_panic(expected = "chip reset requested")]
    fn ddr_faster_than_cpu_resets() {
        let mut lmc = Lmc::new(SimLmc::default(), NoopDelay::new(), 0);
        let mut req = request();
        req.cpu_clock_hz = 800_000_000;
        let _ = train(&mut lmc, &BoardConfig::ddr4_rdimm_2r(), &req);
    }

    #[test]
    fn finalize_scrambles_and_clears_interrupts() {
        let mut sim = SimLmc::default();
        sim.preset(0, RegisterId::Int, 0, 0b110);
        let mut lmc = Lmc::new(sim, NoopDelay::new(), 0);
        let mut req = request();
        req.config.data_scramble_key = Some(0xdead_beef);
        let ctx = TrainingContext::new(0, &BoardConfig::ddr4_rdimm_2r(), &req.config, 1_200_000_000)
            .unwrap();
        assert_eq!(finalize(&mut lmc, &ctx), 16_384);
        assert_eq!(lmc.read::<ScrambleCfg0>().key(), 0xdead_beef);
        assert!(lmc.read::<Control>().scramble_ena());
        assert!(!lmc.read::<Int>().any());
    }
}
