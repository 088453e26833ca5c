//! Training overrides.
//!
//! [`TrainingConfig`] lists every knob a board or a developer may turn.
//! `None` (or `false` for flags) means "use the computed default"; the
//! defaults depend on the DRAM generation and the silicon pass, so the
//! structure is resolved once per bring-up into a [`ResolvedConfig`] that
//! the trainers read.

use lmc_hal::{DramType, PerLane, Sequence, SiliconRevision};

// ── Defaults ─────────────────────────────────────────────────────────────────

/// Highest DDR clock the controller is run at.
pub const DEFAULT_MAX_DDR_CLOCK_HZ: u32 = 1_200_000_000;
/// Restarts before the wrapper gives up.
pub const DEFAULT_RESTART_RETRIES: u8 = 3;
/// Extra weight of a round whose write-leveling bitmask is perfect.
pub const DEFAULT_PERFECT_BITMASK_BONUS: u8 = 3;
/// Vote distance within which the runner-up becomes the alternate.
pub const DEFAULT_ALTERNATE_MARGIN: u8 = 1;
/// Hardware write-leveling retries after a validity failure.
pub const DEFAULT_WLEVEL_VALIDITY_RETRIES: u8 = 3;
/// Largest write-leveling step between routed neighbours.
pub const DEFAULT_MAX_ADJACENT_WLEVEL_STEP: u8 = 8;
/// Internal VREF retries when lanes disagree.
pub const DEFAULT_VREF_RETRIES: u8 = 2;
/// DAC code spread across lanes that triggers a VREF retry.
pub const DEFAULT_VREF_SPREAD: u16 = 16;
/// Narrowest DLL-offset window the tuner accepts.
pub const DEFAULT_DLL_MIN_WINDOW: u8 = 4;
/// DDR clock above which the DLL tuner runs by default.
pub const DLL_TUNE_AUTO_ABOVE_HZ: u32 = 1_000_000_000;

// ── Overrides ────────────────────────────────────────────────────────────────

/// What to do when write leveling cannot settle a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WlevelFailureAction {
    /// Ask for a fresh bring-up.
    #[default]
    Restart,
    /// Reset the chip.
    Reset,
}

/// DLL-offset tuner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DllTuneConfig {
    /// Force the tuner on or off; `None` applies the clock/DRAM gate.
    pub enabled: Option<bool>,
    /// Lowest offset swept (default -63).
    pub min_offset: Option<i8>,
    /// Highest offset swept (default 63).
    pub max_offset: Option<i8>,
    /// Sweep step (default 1).
    pub step: Option<u8>,
    /// Narrowest accepted window in DLL offset units, whatever the step
    /// (default 4).
    pub min_window: Option<u8>,
    /// Pseudo-random patterns run after the fixed ones (default 2).
    pub random_patterns: Option<u8>,
}

/// Board DLL offsets, tri-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CustomDllConfig {
    /// `Some(false)` skips custom offsets, `None` applies them only if any
    /// board value is non-zero, `Some(true)` always applies.
    pub enabled: Option<bool>,
    /// Per-lane write offset overrides, used when enabled.
    pub write_overrides: PerLane<Option<i8>>,
    /// Per-lane read offset overrides, used when enabled.
    pub read_overrides: PerLane<Option<i8>>,
}

/// Every training override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrainingConfig {
    // Clocks and init
    /// Cap on the DDR clock (default 1200 MHz).
    pub max_ddr_clock_hz: Option<u32>,
    /// Power-up/init repetitions (default 1).
    pub init_loops: Option<u8>,
    /// Extra sequence run on each rank after init.
    pub init_sequence1: Option<Sequence>,
    /// Second extra sequence run on each rank after init.
    pub init_sequence2: Option<Sequence>,
    /// Skip training when the controller kept its contents across reset.
    pub preserve_memory: bool,

    // Offset / VREF
    /// Skip receiver offset training.
    pub disable_offset_training: bool,
    /// Skip internal VREF training.
    pub disable_internal_vref: bool,
    /// Use the measured DRAM VREF instead of the computed one (DDR4).
    pub measured_vref: bool,
    /// Internal VREF samples per calibration (default 5 DDR4, 1 DDR3).
    pub vref_samples: Option<u8>,
    /// Internal VREF retries (default 2).
    pub vref_retries: Option<u8>,
    /// DAC spread that triggers a retry (default 16).
    pub vref_spread: Option<u16>,

    // Deskew
    /// Lock retries (default 20, 40 on later silicon).
    pub deskew_lock_retries: Option<u8>,
    /// Saturation retries (default 5, 11 on later silicon).
    pub deskew_saturation_retries: Option<u8>,
    /// Dump per-bit deskew settings when both budgets run out, without
    /// turning on the read-leveling tables.
    pub deskew_verbose: bool,

    // Write leveling
    /// Hardware rounds per rank (default 7 DDR4, 3 DDR3).
    pub wlevel_rounds: Option<u8>,
    /// Perfect-bitmask vote bonus (default 3; 0 = unweighted).
    pub perfect_bitmask_bonus: Option<u8>,
    /// Alternate-candidate margin (default 1).
    pub alternate_margin: Option<u8>,
    /// Validity retries (default 3).
    pub wlevel_validity_retries: Option<u8>,
    /// Largest step between routed neighbours (default 8).
    pub max_adjacent_wlevel_step: Option<u8>,
    /// Response to a rank that never settles.
    pub wlevel_failure: WlevelFailureAction,
    /// Skip the software write-leveling validation pass.
    pub disable_sw_wlevel_validation: bool,

    // Read leveling
    /// Lowest RTT_NOM index swept.
    pub min_rtt_nom_idx: Option<u8>,
    /// Highest RTT_NOM index swept.
    pub max_rtt_nom_idx: Option<u8>,
    /// Lowest controller RODT index swept.
    pub min_rodt_ctl: Option<u8>,
    /// Highest controller RODT index swept.
    pub max_rodt_ctl: Option<u8>,
    /// Extra RODT rows excluded from selection, bit = RODT index.
    pub rodt_skip_mask: Option<u8>,
    /// Samples per sweep row (default 1).
    pub rlevel_average_loops: Option<u8>,
    /// Allowed delay step between routed neighbours (default 1 DDR3,
    /// 2 DDR4; 0 disables the magnitude penalty).
    pub max_adjacent_rlevel_delay_increment: Option<u8>,
    /// Skip the sequential-consistency score.
    pub disable_sequential_delay_check: bool,
    /// Shift applied to off-centre lanes, clamped to -1..=1.
    pub rlevel_nudge: Option<i8>,
    /// Read-leveling offset; `Some(0)` disables offset mode (default 2
    /// on DDR4, off on DDR3).
    pub rlevel_offset: Option<u8>,
    /// Dump bitmasks and score tables when a trainer struggles.
    pub verbose_on_failure: bool,

    // DLL offsets
    /// DLL-offset tuner.
    pub dll_tune: DllTuneConfig,
    /// Board DLL offsets.
    pub custom_dll: CustomDllConfig,

    // Finalization
    /// Data scramble key; enables scrambling when set.
    pub data_scramble_key: Option<u64>,
    /// Address scramble key.
    pub address_scramble_key: Option<u64>,
    /// Report at most this many MB.
    pub limit_dram_mbytes: Option<u32>,
    /// Restarts before escalation (default 3; 0 returns the restart to
    /// the caller instead of resetting).
    pub restart_retries: Option<u8>,
}

// ── Resolved ─────────────────────────────────────────────────────────────────

/// Offset/VREF settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VrefSettings {
    /// Run receiver offset training.
    pub offset_training: bool,
    /// Run internal VREF training.
    pub internal: bool,
    /// Program the measured rather than the computed DRAM VREF.
    pub measured: bool,
    /// Samples per calibration.
    pub samples: u8,
    /// Retries on lane disagreement.
    pub retries: u8,
    /// DAC spread that triggers a retry.
    pub spread: u16,
}

/// Deskew budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeskewSettings {
    /// Lock retries.
    pub lock_retries: u8,
    /// Saturation retries.
    pub saturation_retries: u8,
    /// Deskew the DBI bit as well (DDR4).
    pub dbi: bool,
    /// Dump per-bit settings when the budgets run out.
    pub verbose_on_failure: bool,
}

/// Write-leveling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WlevelSettings {
    /// Hardware rounds per rank.
    pub rounds: u8,
    /// Perfect-bitmask bonus.
    pub perfect_bonus: u8,
    /// Alternate margin.
    pub alternate_margin: u8,
    /// Validity retries.
    pub validity_retries: u8,
    /// Largest adjacent step.
    pub max_adjacent_step: u8,
    /// Failure response.
    pub on_failure: WlevelFailureAction,
    /// Run the post-read-leveling validation pass.
    pub sw_validation: bool,
}

/// Read-leveling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RlevelSettings {
    /// RTT_NOM indices swept, inclusive.
    pub rtt_nom: (u8, u8),
    /// RODT indices swept, inclusive.
    pub rodt: (u8, u8),
    /// Extra skipped RODT rows.
    pub rodt_skip_mask: u8,
    /// Samples per row.
    pub average_loops: u8,
    /// Adjacent delay increment limit.
    pub max_adjacent_delay_increment: u8,
    /// Score sequential consistency.
    pub sequential_check: bool,
    /// Nudge for off-centre lanes.
    pub nudge: i8,
    /// Offset mode: `Some(offset)` when enabled.
    pub offset: Option<u8>,
    /// Dump tables on failure.
    pub verbose_on_failure: bool,
}

/// DLL tuner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DllTuneSettings {
    /// Forced state, `None` = gate decides.
    pub enabled: Option<bool>,
    /// Lowest offset.
    pub min_offset: i8,
    /// Highest offset.
    pub max_offset: i8,
    /// Step.
    pub step: u8,
    /// Narrowest window, in DLL offset units.
    pub min_window: u8,
    /// Pseudo-random patterns.
    pub random_patterns: u8,
}

/// Configuration with every default filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResolvedConfig {
    /// DDR clock cap.
    pub max_ddr_clock_hz: u32,
    /// Init repetitions.
    pub init_loops: u8,
    /// Extra per-rank init sequences.
    pub init_sequences: [Option<Sequence>; 2],
    /// Memory-preserved fast path.
    pub preserve_memory: bool,
    /// Offset/VREF.
    pub vref: VrefSettings,
    /// Deskew.
    pub deskew: DeskewSettings,
    /// Write leveling.
    pub wlevel: WlevelSettings,
    /// Read leveling.
    pub rlevel: RlevelSettings,
    /// DLL tuner.
    pub dll_tune: DllTuneSettings,
    /// Custom DLL offsets.
    pub custom_dll: CustomDllConfig,
    /// Data scramble key.
    pub data_scramble_key: Option<u64>,
    /// Address scramble key.
    pub address_scramble_key: Option<u64>,
    /// Size cap.
    pub limit_dram_mbytes: Option<u32>,
    /// Restart budget.
    pub restart_retries: u8,
}

impl TrainingConfig {
    /// Fill in defaults for a DRAM generation and silicon pass.
    pub fn resolve(&self, dram: DramType, silicon: SiliconRevision) -> ResolvedConfig {
        let ddr4 = dram == DramType::Ddr4;
        let (lock, saturation) = if silicon.is_early() { (20, 5) } else { (40, 11) };
        let (nom_max, rodt_max) = if ddr4 { (5, 5) } else { (3, 3) };
        let rlevel_offset = match self.rlevel_offset {
            Some(0) => None,
            Some(n) => Some(n),
            None if ddr4 => Some(2),
            None => None,
        };

        ResolvedConfig {
            max_ddr_clock_hz: self.max_ddr_clock_hz.unwrap_or(DEFAULT_MAX_DDR_CLOCK_HZ),
            init_loops: self.init_loops.unwrap_or(1).max(1),
            init_sequences: [self.init_sequence1, self.init_sequence2],
            preserve_memory: self.preserve_memory,
            vref: VrefSettings {
                offset_training: !self.disable_offset_training,
                internal: !self.disable_internal_vref,
                measured: self.measured_vref && ddr4,
                samples: self.vref_samples.unwrap_or(if ddr4 { 5 } else { 1 }).max(1),
                retries: self.vref_retries.unwrap_or(DEFAULT_VREF_RETRIES),
                spread: self.vref_spread.unwrap_or(DEFAULT_VREF_SPREAD),
            },
            deskew: DeskewSettings {
                lock_retries: self.deskew_lock_retries.unwrap_or(lock),
                saturation_retries: self.deskew_saturation_retries.unwrap_or(saturation),
                dbi: ddr4,
                verbose_on_failure: self.deskew_verbose || self.verbose_on_failure,
            },
            wlevel: WlevelSettings {
                rounds: self.wlevel_rounds.unwrap_or(if ddr4 { 7 } else { 3 }).max(1),
                perfect_bonus: self.perfect_bitmask_bonus.unwrap_or(DEFAULT_PERFECT_BITMASK_BONUS),
                alternate_margin: self.alternate_margin.unwrap_or(DEFAULT_ALTERNATE_MARGIN),
                validity_retries: self
                    .wlevel_validity_retries
                    .unwrap_or(DEFAULT_WLEVEL_VALIDITY_RETRIES),
                max_adjacent_step: self
                    .max_adjacent_wlevel_step
                    .unwrap_or(DEFAULT_MAX_ADJACENT_WLEVEL_STEP),
                on_failure: self.wlevel_failure,
                sw_validation: !self.disable_sw_wlevel_validation,
            },
            rlevel: RlevelSettings {
                rtt_nom: (
                    self.min_rtt_nom_idx.unwrap_or(1),
                    self.max_rtt_nom_idx.unwrap_or(nom_max),
                ),
                rodt: (
                    self.min_rodt_ctl.unwrap_or(1),
                    self.max_rodt_ctl.unwrap_or(rodt_max),
                ),
                rodt_skip_mask: self.rodt_skip_mask.unwrap_or(0),
                average_loops: self.rlevel_average_loops.unwrap_or(1).max(1),
                max_adjacent_delay_increment: self
                    .max_adjacent_rlevel_delay_increment
                    .unwrap_or(if ddr4 { 2 } else { 1 }),
                sequential_check: !self.disable_sequential_delay_check,
                nudge: self.rlevel_nudge.unwrap_or(0).clamp(-1, 1),
                offset: rlevel_offset,
                verbose_on_failure: self.verbose_on_failure,
            },
            dll_tune: DllTuneSettings {
                enabled: self.dll_tune.enabled,
                min_offset: self.dll_tune.min_offset.unwrap_or(-63).max(-63),
                max_offset: self.dll_tune.max_offset.unwrap_or(63).min(63),
                step: self.dll_tune.step.unwrap_or(1).max(1),
                min_window: self.dll_tune.min_window.unwrap_or(DEFAULT_DLL_MIN_WINDOW),
                random_patterns: self.dll_tune.random_patterns.unwrap_or(2),
            },
            custom_dll: self.custom_dll,
            data_scramble_key: self.data_scramble_key,
            address_scramble_key: self.address_scramble_key,
            limit_dram_mbytes: self.limit_dram_mbytes,
            restart_retries: self.restart_retries.unwrap_or(DEFAULT_RESTART_RETRIES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddr4_defaults() {
        let r = TrainingConfig::default().resolve(DramType::Ddr4, SiliconRevision::PASS2_0);
        assert_eq!(r.max_ddr_clock_hz, 1_200_000_000);
        assert_eq!(r.wlevel.rounds, 7);
        assert_eq!(r.wlevel.perfect_bonus, 3);
        assert_eq!(r.rlevel.rtt_nom, (1, 5));
        assert_eq!(r.rlevel.max_adjacent_delay_increment, 2);
        assert_eq!(r.rlevel.offset, Some(2));
        assert_eq!(r.deskew.lock_retries, 40);
        assert_eq!(r.deskew.saturation_retries, 11);
        assert_eq!(r.vref.samples, 5);
        assert_eq!(r.restart_retries, 3);
    }

    #[test]
    fn ddr3_on_early_silicon() {
        let r = TrainingConfig::default().resolve(DramType::Ddr3, SiliconRevision::PASS1_0);
        assert_eq!(r.wlevel.rounds, 3);
        assert_eq!(r.rlevel.rodt, (1, 3));
        assert_eq!(r.rlevel.max_adjacent_delay_increment, 1);
        assert_eq!(r.rlevel.offset, None);
        assert_eq!(r.deskew.lock_retries, 20);
        assert_eq!(r.deskew.saturation_retries, 5);
        assert!(!r.vref.measured);
        assert_eq!(r.vref.samples, 1);
    }

    #[test]
    fn deskew_dump_follows_its_own_switch_or_the_global_one() {
        let quiet = TrainingConfig::default().resolve(DramType::Ddr4, SiliconRevision::PASS2_0);
        assert!(!quiet.deskew.verbose_on_failure);

        let deskew_only = TrainingConfig {
            deskew_verbose: true,
            ..TrainingConfig::default()
        }
        .resolve(DramType::Ddr4, SiliconRevision::PASS2_0);
        assert!(deskew_only.deskew.verbose_on_failure);
        assert!(!deskew_only.rlevel.verbose_on_failure);

        let global = TrainingConfig {
            verbose_on_failure: true,
            ..TrainingConfig::default()
        }
        .resolve(DramType::Ddr4, SiliconRevision::PASS2_0);
        assert!(global.deskew.verbose_on_failure);
        assert!(global.rlevel.verbose_on_failure);
    }

    #[test]
    fn overrides_win_and_are_clamped() {
        let cfg = TrainingConfig {
            rlevel_nudge: Some(5),
            rlevel_offset: Some(0),
            perfect_bitmask_bonus: Some(0),
            init_loops: Some(0),
            dll_tune: DllTuneConfig {
                min_offset: Some(-100),
                step: Some(0),
                ..DllTuneConfig::default()
            },
            ..TrainingConfig::default()
        };
        let r = cfg.resolve(DramType::Ddr4, SiliconRevision::PASS2_0);
        assert_eq!(r.rlevel.nudge, 1);
        assert_eq!(r.rlevel.offset, None);
        assert_eq!(r.wlevel.perfect_bonus, 0);
        assert_eq!(r.init_loops, 1);
        assert_eq!(r.dll_tune.min_offset, -63);
        assert_eq!(r.dll_tune.step, 1);
    }
}
