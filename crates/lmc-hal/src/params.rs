//! Board and DIMM parameters consumed by the training engine.
//!
//! SPD decode happens outside this crate. What arrives here is already
//! resolved: DIMM geometry, timing constraints in picoseconds, ODT and drive
//! configuration per rank population, and the ohm tables that give meaning
//! to each impedance encoding. [`ParameterProvider`] is the seam; a plain
//! [`BoardConfig`] implements it for boards with a fixed configuration.

use crate::lanes::{PerLane, PerRank, Rank, RankMask};
use crate::silicon::SiliconRevision;

// ── DRAM / module kind ───────────────────────────────────────────────────────

/// DRAM generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DramType {
    /// DDR3 SDRAM.
    Ddr3,
    /// DDR4 SDRAM.
    Ddr4,
}

impl DramType {
    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ddr3 => "DDR3",
            Self::Ddr4 => "DDR4",
        }
    }
}

/// DIMM buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModuleKind {
    /// Unbuffered (UDIMM/SODIMM): lanes routed end to end.
    Unbuffered,
    /// Registered (RDIMM): lanes routed from a central register outward.
    Registered,
}

// ── Geometry ─────────────────────────────────────────────────────────────────

/// DIMM population and address geometry of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DimmTopology {
    /// DRAM generation.
    pub dram: DramType,
    /// Registered or unbuffered modules.
    pub module: ModuleKind,
    /// Populated DIMM slots (1 or 2).
    pub dimm_count: u8,
    /// Package ranks per DIMM (1, 2 or 4).
    pub ranks_per_dimm: u8,
    /// Logical ranks per package rank for 3D-stacked parts (1, 2, 4 or 8).
    pub logical_ranks: u8,
    /// Row address bits.
    pub row_bits: u8,
    /// Column address bits.
    pub col_bits: u8,
    /// Bank address bits, bank-group bits included.
    pub bank_bits: u8,
    /// ECC byte lane populated.
    pub ecc: bool,
    /// 32-bit data bus.
    pub mode32b: bool,
    /// Odd ranks use mirrored address lines.
    pub address_mirroring: bool,
    /// JEDEC raw card letter, if known.
    pub raw_card: Option<u8>,
}

/// Geometry the controller cannot address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GeometryError {
    /// Only one or two DIMM slots exist.
    #[error("{0} DIMMs populated, expected 1 or 2")]
    DimmCount(u8),
    /// Ranks per DIMM must be 1, 2 or 4.
    #[error("{0} ranks per DIMM, expected 1, 2 or 4")]
    RanksPerDimm(u8),
    /// At most four chip selects.
    #[error("{0} ranks in total, at most 4 supported")]
    TooManyRanks(u8),
    /// Row bits outside 12–18.
    #[error("{0} row bits, expected 12..=18")]
    RowBits(u8),
    /// Column bits outside 9–12.
    #[error("{0} column bits, expected 9..=12")]
    ColBits(u8),
    /// Bank bits outside 2–4.
    #[error("{0} bank bits, expected 2..=4")]
    BankBits(u8),
    /// Stacked logical ranks must be 1, 2, 4 or 8.
    #[error("{0} logical ranks per package rank, expected 1, 2, 4 or 8")]
    LogicalRanks(u8),
    /// `row_lsb` encodes outside the register field.
    #[error("row LSB {0} cannot be encoded")]
    RowLsb(u8),
    /// `pbank_lsb` encodes to a reserved value.
    #[error("physical bank LSB {0} cannot be encoded")]
    PbankLsb(u8),
}

/// Addressing derived once per boot from a [`DimmTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RankTopology {
    /// Populated ranks.
    pub ranks: RankMask,
    /// Populated DIMM slots.
    pub dimm_count: u8,
    /// Package ranks per DIMM.
    pub ranks_per_dimm: u8,
    /// Logical ranks per package rank.
    pub logical_ranks: u8,
    /// Row address bits.
    pub row_bits: u8,
    /// Column address bits.
    pub col_bits: u8,
    /// Bank address bits.
    pub bank_bits: u8,
    /// Address bit where the row address starts.
    pub row_lsb: u8,
    /// Address bit selecting the physical bank (DIMM).
    pub pbank_lsb: u8,
    /// `LMC_CONFIG.row_lsb` encoding.
    pub row_lsb_encoding: u8,
    /// `LMC_CONFIG.pbank_lsb` encoding.
    pub pbank_lsb_encoding: u8,
    /// Total memory behind this controller.
    pub size_mb: u32,
}

const ROW_LSB_BASE: u8 = 14;
const PBANK_LSB_BASE: u8 = 28;
const MAX_LSB_ENCODING: u8 = 7;

impl DimmTopology {
    /// Validate the population and derive addressing.
    #[allow(clippy::arithmetic_side_effects)] // operands bounded by the checks above each use
    pub fn derive(&self) -> Result<RankTopology, GeometryError> {
        if !(1..=2).contains(&self.dimm_count) {
            return Err(GeometryError::DimmCount(self.dimm_count));
        }
        if !matches!(self.ranks_per_dimm, 1 | 2 | 4) {
            return Err(GeometryError::RanksPerDimm(self.ranks_per_dimm));
        }
        let total = self.dimm_count * self.ranks_per_dimm;
        if total > 4 {
            return Err(GeometryError::TooManyRanks(total));
        }
        if !(12..=18).contains(&self.row_bits) {
            return Err(GeometryError::RowBits(self.row_bits));
        }
        if !(9..=12).contains(&self.col_bits) {
            return Err(GeometryError::ColBits(self.col_bits));
        }
        if !(2..=4).contains(&self.bank_bits) {
            return Err(GeometryError::BankBits(self.bank_bits));
        }
        let lranks_bits = match self.logical_ranks {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            other => return Err(GeometryError::LogicalRanks(other)),
        };

        let bus_bits = if self.mode32b { 2 } else { 3 };
        let rank_bits = match self.ranks_per_dimm {
            1 => 0,
            2 => 1,
            _ => 2,
        };
        let row_lsb = bus_bits + self.col_bits + self.bank_bits;
        let pbank_lsb = row_lsb + self.row_bits + rank_bits + lranks_bits;

        let row_lsb_encoding = row_lsb
            .checked_sub(ROW_LSB_BASE)
            .filter(|e| *e <= MAX_LSB_ENCODING)
            .ok_or(GeometryError::RowLsb(row_lsb))?;
        let pbank_lsb_encoding = pbank_lsb
            .checked_sub(PBANK_LSB_BASE)
            .filter(|e| *e <= MAX_LSB_ENCODING)
            .ok_or(GeometryError::PbankLsb(pbank_lsb))?;

        let ranks = match (self.dimm_count, self.ranks_per_dimm) {
            (1, 1) => 0b0001,
            (1, 2) => 0b0011,
            (2, 1) => 0b0101,
            _ => 0b1111,
        };
        // Each DIMM spans 2^pbank_lsb bytes.
        let size_mb = u32::from(self.dimm_count) << (pbank_lsb - 20);

        Ok(RankTopology {
            ranks: RankMask::from_bits(ranks),
            dimm_count: self.dimm_count,
            ranks_per_dimm: self.ranks_per_dimm,
            logical_ranks: self.logical_ranks,
            row_bits: self.row_bits,
            col_bits: self.col_bits,
            bank_bits: self.bank_bits,
            row_lsb,
            pbank_lsb,
            row_lsb_encoding,
            pbank_lsb_encoding,
            size_mb,
        })
    }
}

// ── Timing ───────────────────────────────────────────────────────────────────

/// Timing constraints from SPD, in picoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingParams {
    /// Minimum CAS latency time (tAA).
    pub t_aa_ps: u32,
    /// ACTIVATE to READ/WRITE (tRCD).
    pub t_rcd_ps: u32,
    /// PRECHARGE period (tRP).
    pub t_rp_ps: u32,
    /// ACTIVATE to PRECHARGE (tRAS).
    pub t_ras_ps: u32,
    /// Refresh cycle time (tRFC).
    pub t_rfc_ps: u32,
    /// ACTIVATE to ACTIVATE, different bank (tRRD).
    pub t_rrd_ps: u32,
    /// Four-activate window (tFAW).
    pub t_faw_ps: u32,
    /// Write-to-read turnaround (tWTR).
    pub t_wtr_ps: u32,
    /// Write recovery (tWR).
    pub t_wr_ps: u32,
}

impl TimingParams {
    /// Typical DDR4-2400 x8 constraints.
    pub const DDR4_2400: Self = Self {
        t_aa_ps: 13_320,
        t_rcd_ps: 13_320,
        t_rp_ps: 13_320,
        t_ras_ps: 32_000,
        t_rfc_ps: 350_000,
        t_rrd_ps: 5_300,
        t_faw_ps: 21_000,
        t_wtr_ps: 7_500,
        t_wr_ps: 15_000,
    };

    /// Typical DDR3-1600 x8 constraints.
    pub const DDR3_1600: Self = Self {
        t_aa_ps: 13_750,
        t_rcd_ps: 13_750,
        t_rp_ps: 13_750,
        t_ras_ps: 35_000,
        t_rfc_ps: 260_000,
        t_rrd_ps: 6_000,
        t_faw_ps: 30_000,
        t_wtr_ps: 7_500,
        t_wr_ps: 15_000,
    };
}

/// Timing value that cannot be programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimingError {
    /// A constraint was zero.
    #[error("{field} is zero")]
    Zero {
        /// Offending parameter.
        field: &'static str,
    },
    /// A constraint converts to more cycles than its field holds.
    #[error("{field} needs {cycles} cycles, field holds {max}")]
    TooLarge {
        /// Offending parameter.
        field: &'static str,
        /// Required cycles.
        cycles: u32,
        /// Largest encodable value.
        max: u32,
    },
}

/// Timing converted to DDR clock cycles, ready for the timing registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingCycles {
    /// Clock period in picoseconds.
    pub tck_ps: u32,
    /// CAS latency.
    pub cl: u8,
    /// CAS write latency.
    pub cwl: u8,
    /// Write recovery.
    pub wr: u8,
    /// tRCD.
    pub trcd: u8,
    /// tRP.
    pub trp: u8,
    /// tRAS.
    pub tras: u8,
    /// tRFC in units of 8 cycles.
    pub trfc_x8: u8,
    /// tRRD.
    pub trrd: u8,
    /// tFAW.
    pub tfaw: u8,
    /// tWTR.
    pub twtr: u8,
}

impl TimingCycles {
    /// Clock period of `ddr_hz` in picoseconds, rounded down.
    #[must_use]
    pub fn tck_ps(ddr_hz: u32) -> u32 {
        u32::try_from(1_000_000_000_000u64 / u64::from(ddr_hz.max(1))).unwrap_or(u32::MAX)
    }

    /// Picoseconds to clock cycles, rounded up.
    #[must_use]
    #[allow(clippy::arithmetic_side_effects)] // tck_ps is at least 1
    pub fn ps_to_cycles(ps: u32, tck_ps: u32) -> u32 {
        let tck = tck_ps.max(1);
        ps.div_ceil(tck)
    }

    /// CAS write latency for the clock period.
    #[must_use]
    pub const fn cwl_for(dram: DramType, tck_ps: u32) -> u8 {
        match dram {
            DramType::Ddr3 => match tck_ps {
                2500.. => 5,
                1875.. => 6,
                1500.. => 7,
                1250.. => 8,
                1070.. => 9,
                935.. => 10,
                _ => 11,
            },
            DramType::Ddr4 => match tck_ps {
                1250.. => 9,
                1071.. => 10,
                938.. => 11,
                833.. => 12,
                _ => 14,
            },
        }
    }

    /// Convert picosecond constraints at `ddr_hz`.
    pub fn new(dram: DramType, t: &TimingParams, ddr_hz: u32) -> Result<Self, TimingError> {
        let tck_ps = Self::tck_ps(ddr_hz);
        let cycles = |field: &'static str, ps: u32, max: u32| {
            if ps == 0 {
                return Err(TimingError::Zero { field });
            }
            let cycles = Self::ps_to_cycles(ps, tck_ps);
            u8::try_from(cycles)
                .ok()
                .filter(|c| u32::from(*c) <= max)
                .ok_or(TimingError::TooLarge { field, cycles, max })
        };
        let rfc = cycles("t_rfc", t.t_rfc_ps.div_ceil(8), 0xff)?;
        Ok(Self {
            tck_ps,
            cl: cycles("t_aa", t.t_aa_ps, 0x1f)?,
            cwl: Self::cwl_for(dram, tck_ps),
            wr: cycles("t_wr", t.t_wr_ps, 0x1f)?,
            trcd: cycles("t_rcd", t.t_rcd_ps, 0x1f)?,
            trp: cycles("t_rp", t.t_rp_ps, 0x1f)?,
            tras: cycles("t_ras", t.t_ras_ps, 0x7f)?,
            trfc_x8: rfc,
            trrd: cycles("t_rrd", t.t_rrd_ps, 0x0f)?,
            tfaw: cycles("t_faw", t.t_faw_ps, 0x7f)?,
            twtr: cycles("t_wtr", t.t_wtr_ps, 0x0f)?,
        })
    }
}

// ── ODT / impedance ──────────────────────────────────────────────────────────

/// Termination and drive settings for one rank population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OdtConfig {
    /// Ranks terminating during writes to each rank.
    pub wodt_mask: PerRank<RankMask>,
    /// Ranks terminating during reads from each rank.
    pub rodt_mask: PerRank<RankMask>,
    /// RTT_NOM encoding per rank.
    pub rtt_nom: PerRank<u8>,
    /// RTT_WR encoding per rank.
    pub rtt_wr: PerRank<u8>,
    /// RTT_PARK encoding per rank (DDR4).
    pub rtt_park: PerRank<u8>,
    /// DRAM output drive encoding per rank.
    pub dic: PerRank<u8>,
    /// Controller read ODT encoding.
    pub rodt_ctl: u8,
    /// Controller DQ drive encoding.
    pub dqx_ctl: u8,
    /// Controller clock drive encoding.
    pub ck_ctl: u8,
    /// Controller command drive encoding.
    pub cmd_ctl: u8,
    /// Controller control-signal drive encoding.
    pub ctl_ctl: u8,
}

/// ODT configurations indexed by population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OdtTable {
    /// One DIMM, one rank.
    pub one_slot_one_rank: OdtConfig,
    /// One DIMM, two ranks.
    pub one_slot_two_rank: OdtConfig,
    /// Two DIMMs, one rank each.
    pub two_slot_one_rank: OdtConfig,
    /// Two DIMMs, two ranks each.
    pub two_slot_two_rank: OdtConfig,
    /// One DIMM, four ranks.
    pub one_slot_four_rank: OdtConfig,
}

fn ranks(bits: u8) -> RankMask {
    RankMask::from_bits(bits)
}

impl OdtTable {
    /// Configuration for a population.
    #[must_use]
    pub fn select(&self, dimm_count: u8, ranks_per_dimm: u8) -> &OdtConfig {
        match (dimm_count, ranks_per_dimm) {
            (1, 1) => &self.one_slot_one_rank,
            (1, 2) => &self.one_slot_two_rank,
            (2, 1) => &self.two_slot_one_rank,
            (2, _) => &self.two_slot_two_rank,
            _ => &self.one_slot_four_rank,
        }
    }

    /// Reference DDR4 settings.
    #[must_use]
    pub fn ddr4_default() -> Self {
        let base = OdtConfig {
            dic: PerRank::splat(0),
            rodt_ctl: 3,
            dqx_ctl: 4,
            ck_ctl: 4,
            cmd_ctl: 4,
            ctl_ctl: 4,
            ..OdtConfig::default()
        };
        Self {
            one_slot_one_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0001), ranks(0), ranks(0), ranks(0)]),
                rtt_wr: PerRank([1, 0, 0, 0]),
                rtt_park: PerRank([0, 0, 0, 0]),
                ..base
            },
            one_slot_two_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0011), ranks(0b0011), ranks(0), ranks(0)]),
                rodt_mask: PerRank([ranks(0b0010), ranks(0b0001), ranks(0), ranks(0)]),
                rtt_nom: PerRank([3, 3, 0, 0]),
                rtt_wr: PerRank([1, 1, 0, 0]),
                rtt_park: PerRank([4, 4, 0, 0]),
                ..base
            },
            two_slot_one_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0101), ranks(0), ranks(0b0101), ranks(0)]),
                rodt_mask: PerRank([ranks(0b0100), ranks(0), ranks(0b0001), ranks(0)]),
                rtt_nom: PerRank([3, 0, 3, 0]),
                rtt_wr: PerRank([2, 0, 2, 0]),
                rtt_park: PerRank([1, 0, 1, 0]),
                ..base
            },
            two_slot_two_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0101), ranks(0b1010), ranks(0b0101), ranks(0b1010)]),
                rodt_mask: PerRank([ranks(0b0100), ranks(0b1000), ranks(0b0001), ranks(0b0010)]),
                rtt_nom: PerRank([3, 3, 3, 3]),
                rtt_wr: PerRank([2, 2, 2, 2]),
                rtt_park: PerRank([4, 4, 4, 4]),
                ..base
            },
            one_slot_four_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0011), ranks(0b0011), ranks(0b1100), ranks(0b1100)]),
                rodt_mask: PerRank([ranks(0b0010), ranks(0b0001), ranks(0b1000), ranks(0b0100)]),
                rtt_nom: PerRank([3, 3, 3, 3]),
                rtt_wr: PerRank([1, 1, 1, 1]),
                rtt_park: PerRank([4, 4, 4, 4]),
                ..base
            },
        }
    }

    /// Reference DDR3 settings.
    #[must_use]
    pub fn ddr3_default() -> Self {
        let base = OdtConfig {
            dic: PerRank::splat(1),
            rodt_ctl: 2,
            dqx_ctl: 4,
            ck_ctl: 4,
            cmd_ctl: 4,
            ctl_ctl: 4,
            ..OdtConfig::default()
        };
        Self {
            one_slot_one_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0001), ranks(0), ranks(0), ranks(0)]),
                ..base
            },
            one_slot_two_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0001), ranks(0b0001), ranks(0), ranks(0)]),
                rodt_mask: PerRank([ranks(0b0010), ranks(0b0001), ranks(0), ranks(0)]),
                rtt_nom: PerRank([2, 0, 0, 0]),
                ..base
            },
            two_slot_one_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0100), ranks(0), ranks(0b0001), ranks(0)]),
                rodt_mask: PerRank([ranks(0b0100), ranks(0), ranks(0b0001), ranks(0)]),
                rtt_nom: PerRank([3, 0, 3, 0]),
                rtt_wr: PerRank([2, 0, 2, 0]),
                ..base
            },
            two_slot_two_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0100), ranks(0b1000), ranks(0b0001), ranks(0b0010)]),
                rodt_mask: PerRank([ranks(0b0100), ranks(0b1000), ranks(0b0001), ranks(0b0010)]),
                rtt_nom: PerRank([3, 0, 3, 0]),
                rtt_wr: PerRank([2, 2, 2, 2]),
                ..base
            },
            one_slot_four_rank: OdtConfig {
                wodt_mask: PerRank([ranks(0b0001), ranks(0b0001), ranks(0b0100), ranks(0b0100)]),
                rodt_mask: PerRank([ranks(0b0010), ranks(0b0001), ranks(0b1000), ranks(0b0100)]),
                rtt_nom: PerRank([2, 0, 2, 0]),
                ..base
            },
        }
    }

    /// Reference settings for a DRAM generation.
    #[must_use]
    pub fn default_for(dram: DramType) -> Self {
        match dram {
            DramType::Ddr3 => Self::ddr3_default(),
            DramType::Ddr4 => Self::ddr4_default(),
        }
    }
}

/// Ohm value of every impedance encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImpedanceTables {
    /// RTT_NOM (and DDR4 RTT_PARK) encodings.
    pub rtt_nom: &'static [u16],
    /// RTT_WR encodings.
    pub rtt_wr: &'static [u16],
    /// Controller read ODT encodings.
    pub rodt: &'static [u16],
    /// Controller DQ drive encodings.
    pub dqx: &'static [u16],
}

/// Encodings that disable a termination.
pub const OHMS_DISABLED: u16 = 0;

impl ImpedanceTables {
    /// DDR4 encodings.
    pub const DDR4: Self = Self {
        rtt_nom: &[0, 60, 120, 40, 240, 48, 80, 34],
        rtt_wr: &[0, 120, 240, 99, 80],
        rodt: &[0, 40, 60, 80, 120, 240, 34, 48],
        dqx: &[0, 24, 27, 30, 34, 40, 48, 60],
    };

    /// DDR3 encodings.
    pub const DDR3: Self = Self {
        rtt_nom: &[0, 60, 120, 40, 20, 30],
        rtt_wr: &[0, 60, 120],
        rodt: &[0, 20, 30, 40, 60, 120],
        dqx: &[0, 24, 26, 29, 34, 40, 48, 60],
    };

    /// Tables for a DRAM generation.
    #[must_use]
    pub const fn for_dram(dram: DramType) -> Self {
        match dram {
            DramType::Ddr3 => Self::DDR3,
            DramType::Ddr4 => Self::DDR4,
        }
    }

    fn lookup(table: &[u16], idx: u8) -> u16 {
        table.get(usize::from(idx)).copied().unwrap_or(OHMS_DISABLED)
    }

    /// Ohms of an RTT_NOM encoding; 0 = disabled or unknown.
    #[must_use]
    pub fn rtt_nom_ohms(&self, idx: u8) -> u16 {
        Self::lookup(self.rtt_nom, idx)
    }

    /// Ohms of an RTT_PARK encoding.
    #[must_use]
    pub fn rtt_park_ohms(&self, idx: u8) -> u16 {
        Self::lookup(self.rtt_nom, idx)
    }

    /// Ohms of an RTT_WR encoding.
    #[must_use]
    pub fn rtt_wr_ohms(&self, idx: u8) -> u16 {
        Self::lookup(self.rtt_wr, idx)
    }

    /// Ohms of a read ODT encoding.
    #[must_use]
    pub fn rodt_ohms(&self, idx: u8) -> u16 {
        Self::lookup(self.rodt, idx)
    }

    /// Ohms of a DQ drive encoding.
    #[must_use]
    pub fn dqx_ohms(&self, idx: u8) -> u16 {
        Self::lookup(self.dqx, idx)
    }
}

// ── DLL offsets ──────────────────────────────────────────────────────────────

/// Board-supplied DLL offsets applied at the end of bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CustomDllOffsets {
    /// Write DLL offset per lane.
    pub write: PerLane<i8>,
    /// Read DLL offset per lane.
    pub read: PerLane<i8>,
}

// ── Provider ─────────────────────────────────────────────────────────────────

/// Source of resolved board and DIMM parameters.
pub trait ParameterProvider {
    /// DIMM population of `controller`.
    fn topology(&self, controller: u8) -> DimmTopology;

    /// Timing constraints of `controller`'s DIMMs.
    fn timing(&self, controller: u8) -> TimingParams;

    /// ODT configuration table of `controller`.
    fn odt_table(&self, controller: u8) -> OdtTable;

    /// Impedance ohm tables for a DRAM generation.
    fn impedance(&self, dram: DramType) -> ImpedanceTables {
        ImpedanceTables::for_dram(dram)
    }

    /// Board-supplied DLL offsets of `controller`.
    fn dll_offsets(&self, controller: u8) -> CustomDllOffsets;

    /// DRAM wired without series resistors.
    fn direct_dram_connection(&self) -> bool {
        false
    }

    /// Silicon revision of the chip.
    fn silicon(&self) -> SiliconRevision;
}

/// Fixed board description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BoardConfig {
    /// DIMM population, shared by every controller.
    pub topology: DimmTopology,
    /// Timing constraints.
    pub timing: TimingParams,
    /// ODT table.
    pub odt: OdtTable,
    /// Custom DLL offsets.
    pub dll_offsets: CustomDllOffsets,
    /// DRAM wired without series resistors.
    pub direct_dram_connection: bool,
    /// Silicon revision.
    pub silicon: SiliconRevision,
}

impl BoardConfig {
    /// Board with one dual-rank DDR4 RDIMM at 2400 MT/s and reference ODT.
    #[must_use]
    pub fn ddr4_rdimm_2r() -> Self {
        Self {
            topology: DimmTopology {
                dram: DramType::Ddr4,
                module: ModuleKind::Registered,
                dimm_count: 1,
                ranks_per_dimm: 2,
                logical_ranks: 1,
                row_bits: 16,
                col_bits: 10,
                bank_bits: 4,
                ecc: true,
                mode32b: false,
                address_mirroring: true,
                raw_card: None,
            },
            timing: TimingParams::DDR4_2400,
            odt: OdtTable::ddr4_default(),
            dll_offsets: CustomDllOffsets::default(),
            direct_dram_connection: false,
            silicon: SiliconRevision::PASS2_0,
        }
    }

    /// Board with one single-rank DDR3 UDIMM without ECC.
    #[must_use]
    pub fn ddr3_udimm_1r() -> Self {
        Self {
            topology: DimmTopology {
                dram: DramType::Ddr3,
                module: ModuleKind::Unbuffered,
                dimm_count: 1,
                ranks_per_dimm: 1,
                logical_ranks: 1,
                row_bits: 15,
                col_bits: 10,
                bank_bits: 3,
                ecc: false,
                mode32b: false,
                address_mirroring: false,
                raw_card: None,
            },
            timing: TimingParams::DDR3_1600,
            odt: OdtTable::ddr3_default(),
            dll_offsets: CustomDllOffsets::default(),
            direct_dram_connection: false,
            silicon: SiliconRevision::PASS2_0,
        }
    }

    /// Rank of the first populated slot of `dimm`.
    #[must_use]
    pub fn first_rank_of(dimm: u8) -> Option<Rank> {
        Rank::new(dimm.checked_mul(2)?).ok()
    }
}

impl ParameterProvider for BoardConfig {
    fn topology(&self, _controller: u8) -> DimmTopology {
        self.topology
    }

    fn timing(&self, _controller: u8) -> TimingParams {
        self.timing
    }

    fn odt_table(&self, _controller: u8) -> OdtTable {
        self.odt
    }

    fn dll_offsets(&self, _controller: u8) -> CustomDllOffsets {
        self.dll_offsets
    }

    fn direct_dram_connection(&self) -> bool {
        self.direct_dram_connection
    }

    fn silicon(&self) -> SiliconRevision {
        self.silicon
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ddr4_topology() -> DimmTopology {
        BoardConfig::ddr4_rdimm_2r().topology
    }

    #[test]
    fn derive_dual_rank_rdimm() {
        let t = ddr4_topology().derive().unwrap();
        assert_eq!(t.ranks.bits(), 0b0011);
        // 3 bus + 10 col + 4 bank
        assert_eq!(t.row_lsb, 17);
        assert_eq!(t.row_lsb_encoding, 3);
        // 17 + 16 row + 1 rank
        assert_eq!(t.pbank_lsb, 34);
        assert_eq!(t.pbank_lsb_encoding, 6);
        assert_eq!(t.size_mb, 16 * 1024);
    }

    #[test]
    fn derive_two_single_rank_dimms_use_even_ranks() {
        let mut topo = ddr4_topology();
        topo.dimm_count = 2;
        topo.ranks_per_dimm = 1;
        let t = topo.derive().unwrap();
        assert_eq!(t.ranks.bits(), 0b0101);
        assert_eq!(t.size_mb, 2 * 8 * 1024);
    }

    #[test]
    fn derive_rejects_bad_population() {
        let mut topo = ddr4_topology();
        topo.ranks_per_dimm = 3;
        assert_eq!(topo.derive(), Err(GeometryError::RanksPerDimm(3)));
        topo.ranks_per_dimm = 4;
        topo.dimm_count = 2;
        assert_eq!(topo.derive(), Err(GeometryError::TooManyRanks(8)));
        topo.dimm_count = 0;
        assert_eq!(topo.derive(), Err(GeometryError::DimmCount(0)));
    }

    #[test]
    fn derive_rejects_reserved_pbank_encoding() {
        let mut topo = ddr4_topology();
        topo.row_bits = 18;
        topo.col_bits = 12;
        topo.logical_ranks = 8;
        // 3 + 12 + 4 = 19 row LSB, + 18 + 1 + 3 = 41 pbank LSB
        assert_eq!(topo.derive(), Err(GeometryError::PbankLsb(41)));
    }

    #[test]
    fn derive_rejects_geometry_bounds() {
        let mut topo = ddr4_topology();
        topo.row_bits = 11;
        assert_eq!(topo.derive(), Err(GeometryError::RowBits(11)));
        topo.row_bits = 16;
        topo.col_bits = 13;
        assert_eq!(topo.derive(), Err(GeometryError::ColBits(13)));
        topo.col_bits = 10;
        topo.bank_bits = 5;
        assert_eq!(topo.derive(), Err(GeometryError::BankBits(5)));
        topo.bank_bits = 4;
        topo.logical_ranks = 3;
        assert_eq!(topo.derive(), Err(GeometryError::LogicalRanks(3)));
    }

    #[test]
    fn ps_to_cycles_rounds_up() {
        assert_eq!(TimingCycles::ps_to_cycles(13_320, 833), 16);
        assert_eq!(TimingCycles::ps_to_cycles(833, 833), 1);
        assert_eq!(TimingCycles::tck_ps(1_200_000_000), 833);
    }

    #[test]
    fn ddr4_2400_timing_fits_registers() {
        let c = TimingCycles::new(DramType::Ddr4, &TimingParams::DDR4_2400, 1_200_000_000)
            .unwrap();
        assert_eq!(c.cl, 16);
        assert_eq!(c.cwl, 12);
        assert_eq!(c.trfc_x8, 53);
    }

    #[test]
    fn zero_timing_is_rejected() {
        let mut t = TimingParams::DDR3_1600;
        t.t_rp_ps = 0;
        assert_eq!(
            TimingCycles::new(DramType::Ddr3, &t, 800_000_000),
            Err(TimingError::Zero { field: "t_rp" })
        );
    }

    #[test]
    fn oversized_timing_is_rejected() {
        let mut t = TimingParams::DDR4_2400;
        t.t_ras_ps = 1_000_000;
        assert!(matches!(
            TimingCycles::new(DramType::Ddr4, &t, 1_200_000_000),
            Err(TimingError::TooLarge { field: "t_ras", .. })
        ));
    }

    #[test]
    fn impedance_lookup_out_of_table_is_disabled() {
        let z = ImpedanceTables::DDR4;
        assert_eq!(z.rtt_nom_ohms(3), 40);
        assert_eq!(z.rodt_ohms(2), 60);
        assert_eq!(z.rtt_wr_ohms(9), OHMS_DISABLED);
    }

    #[test]
    fn odt_table_selects_population() {
        let table = OdtTable::ddr4_default();
        let cfg = table.select(1, 2);
        assert_eq!(cfg.rodt_mask[Rank::new(0).unwrap()].bits(), 0b0010);
        assert_eq!(table.select(1, 1).rodt_mask, PerRank::splat(RankMask::EMPTY));
    }
}
