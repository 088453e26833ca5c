//! Scratch state of one controller bring-up.
//!
//! A [`TrainingContext`] is built fresh at the start of every bring-up
//! attempt from the parameter provider and the resolved configuration.
//! The board description is read-only afterwards; each trainer records its
//! outcome in [`TrainingResults`] for the trainers that follow it.

use heapless::Vec;
use lmc_hal::{
    ByteLane, CustomDllOffsets, DimmTopology, DramType, ImpedanceTables, LaneMask, ModuleKind,
    OdtConfig, ParameterProvider, PerLane, PerRank, Rank, RankMask, RankTopology,
    SiliconRevision, TimingCycles, LANE_COUNT,
};

use crate::config::{ResolvedConfig, TrainingConfig};
use crate::deskew::DeskewReport;
use crate::dll_offset::DllReport;
use crate::error::TrainingError;
use crate::rlevel::{OdtChoice, RankChoice};
use crate::vref::VrefSetting;
use crate::wlevel::WlevelOutcome;

/// Lanes in routing order.
pub type LaneRun = Vec<ByteLane, LANE_COUNT>;

/// What the trainers found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainingResults {
    /// Internal VREF DAC code per lane.
    pub dac_codes: Option<PerLane<u16>>,
    /// DRAM-side VREF per rank (DDR4).
    pub dram_vref: PerRank<Option<VrefSetting>>,
    /// Deskew outcome.
    pub deskew: Option<DeskewReport>,
    /// Write-leveling outcome per rank.
    pub wlevel: PerRank<Option<WlevelOutcome>>,
    /// Read-leveling choice per rank.
    pub rlevel: PerRank<Option<RankChoice>>,
    /// ODT settings programmed after read leveling.
    pub odt: Option<OdtChoice>,
    /// DLL offsets loaded by the custom table or the tuner.
    pub dll: Option<DllReport>,
}

/// Per-bring-up state owned by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingContext {
    /// Controller index.
    pub controller: u8,
    /// Board DIMM description.
    pub dimm: DimmTopology,
    /// Derived addressing.
    pub topology: RankTopology,
    /// Populated byte lanes.
    pub lanes: LaneMask,
    /// Chip pass.
    pub silicon: SiliconRevision,
    /// ODT configuration of this population.
    pub odt: OdtConfig,
    /// Ohm tables.
    pub impedance: ImpedanceTables,
    /// Timing in clock cycles.
    pub timing: TimingCycles,
    /// DRAM wired without series resistors.
    pub direct_dram_connection: bool,
    /// Board DLL offsets.
    pub board_dll: CustomDllOffsets,
    /// Overrides with defaults filled in.
    pub config: ResolvedConfig,
    /// Effective DDR clock.
    pub ddr_hz: u32,
    /// Trainer outcomes.
    pub results: TrainingResults,
}

impl TrainingContext {
    /// Gather and validate everything one bring-up of `controller` needs.
    pub fn new<P: ParameterProvider + ?Sized>(
        controller: u8,
        params: &P,
        config: &TrainingConfig,
        ddr_hz: u32,
    ) -> Result<Self, TrainingError> {
        let dimm = params.topology(controller);
        let topology = dimm.derive()?;
        let silicon = params.silicon();
        let odt = *params
            .odt_table(controller)
            .select(dimm.dimm_count, dimm.ranks_per_dimm);
        let timing = TimingCycles::new(dimm.dram, &params.timing(controller), ddr_hz)?;
        Ok(Self {
            controller,
            dimm,
            topology,
            lanes: LaneMask::for_bus(dimm.ecc, dimm.mode32b),
            silicon,
            odt,
            impedance: params.impedance(dimm.dram),
            timing,
            direct_dram_connection: params.direct_dram_connection(),
            board_dll: params.dll_offsets(controller),
            config: config.resolve(dimm.dram, silicon),
            ddr_hz,
            results: TrainingResults::default(),
        })
    }

    /// DRAM generation.
    pub fn dram(&self) -> DramType {
        self.dimm.dram
    }

    /// DDR4 parts.
    pub fn is_ddr4(&self) -> bool {
        self.dimm.dram == DramType::Ddr4
    }

    /// Registered DIMMs.
    pub fn is_registered(&self) -> bool {
        self.dimm.module == ModuleKind::Registered
    }

    /// Populated ranks.
    pub fn ranks(&self) -> RankMask {
        self.topology.ranks
    }

    /// ECC lane populated.
    pub fn has_ecc(&self) -> bool {
        self.lanes.contains(ByteLane::ECC)
    }

    fn run(&self, order: &[u8]) -> LaneRun {
        order
            .iter()
            .filter_map(|i| ByteLane::new(*i).ok())
            .filter(|lane| self.lanes.contains(*lane))
            .collect()
    }

    /// Lane runs scored for read-leveling sequential consistency.
    ///
    /// Registered DIMMs route each half from the central register, so the
    /// halves are scored separately with ECC ending the lower half.
    /// Unbuffered DIMMs are one run with ECC between lanes 3 and 4.
    pub fn rlevel_runs(&self) -> Vec<LaneRun, 2> {
        let mut runs = Vec::new();
        if self.is_registered() {
            let _ = runs.push(self.run(&[0, 1, 2, 3, 8]));
            let _ = runs.push(self.run(&[4, 5, 6, 7]));
        } else {
            let _ = runs.push(self.run(&[0, 1, 2, 3, 8, 4, 5, 6, 7]));
        }
        runs
    }

    /// Lane chains checked for write-leveling plausibility.
    ///
    /// Registered DIMMs are walked outward from the centre (ECC, or lane 3
    /// without ECC); unbuffered DIMMs end to end in lane order.
    pub fn wlevel_chains(&self) -> Vec<LaneRun, 2> {
        let mut chains = Vec::new();
        if self.is_registered() {
            if self.has_ecc() {
                let _ = chains.push(self.run(&[8, 3, 2, 1, 0]));
                let _ = chains.push(self.run(&[8, 4, 5, 6, 7]));
            } else {
                let _ = chains.push(self.run(&[3, 2, 1, 0]));
                let _ = chains.push(self.run(&[3, 4, 5, 6, 7]));
            }
        } else {
            let _ = chains.push(self.run(&[0, 1, 2, 3, 4, 5, 6, 7, 8]));
        }
        chains
    }

    /// Neighbours used to interpolate the ECC lane.
    pub fn ecc_neighbours(&self) -> Option<(ByteLane, ByteLane)> {
        let lo = ByteLane::new(3).ok()?;
        let hi = ByteLane::new(4).ok()?;
        if self.lanes.contains(lo) && self.lanes.contains(hi) {
            Some((lo, hi))
        } else {
            None
        }
    }

    /// Rank whose vector an unpopulated `rank` mirrors: the lowest
    /// populated rank of the same DIMM slot, else the lowest populated rank.
    pub fn mirror_source(&self, rank: Rank) -> Option<Rank> {
        let ranks = self.ranks();
        if ranks.contains(rank) {
            return None;
        }
        ranks
            .iter()
            .find(|r| r.dimm() == rank.dimm())
            .or_else(|| ranks.lowest())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lmc_hal::BoardConfig;

    fn lanes(run: &LaneRun) -> std::vec::Vec<u8> {
        run.iter().map(|l| l.get()).collect()
    }

    fn ctx(board: &BoardConfig) -> TrainingContext {
        TrainingContext::new(0, board, &TrainingConfig::default(), 1_200_000_000).unwrap()
    }

    #[test]
    fn registered_runs_split_halves() {
        let c = ctx(&BoardConfig::ddr4_rdimm_2r());
        let runs = c.rlevel_runs();
        assert_eq!(lanes(&runs[0]), [0, 1, 2, 3, 8]);
        assert_eq!(lanes(&runs[1]), [4, 5, 6, 7]);
        let chains = c.wlevel_chains();
        assert_eq!(lanes(&chains[0]), [8, 3, 2, 1, 0]);
    }

    #[test]
    fn unbuffered_without_ecc_is_one_run() {
        let c = ctx(&BoardConfig::ddr3_udimm_1r());
        let runs = c.rlevel_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(lanes(&runs[0]), [0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(!c.has_ecc());
    }

    #[test]
    fn unpopulated_ranks_mirror_their_dimm() {
        let c = ctx(&BoardConfig::ddr4_rdimm_2r());
        assert_eq!(c.mirror_source(Rank::new(0).unwrap()), None);
        // ranks 2 and 3 sit in the empty second slot
        assert_eq!(c.mirror_source(Rank::new(2).unwrap()), Some(Rank::new(0).unwrap()));

        let mut board = BoardConfig::ddr4_rdimm_2r();
        board.topology.dimm_count = 2;
        board.topology.ranks_per_dimm = 1;
        let c = ctx(&board);
        assert_eq!(c.mirror_source(Rank::new(3).unwrap()), Some(Rank::new(2).unwrap()));
        assert_eq!(c.mirror_source(Rank::new(1).unwrap()), Some(Rank::new(0).unwrap()));
    }

    #[test]
    fn geometry_errors_are_fatal() {
        let mut board = BoardConfig::ddr4_rdimm_2r();
        board.topology.row_bits = 40;
        let err = TrainingContext::new(0, &board, &TrainingConfig::default(), 1_200_000_000)
            .unwrap_err();
        assert!(!err.is_restart());
    }
}
