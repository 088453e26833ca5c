//! Controller configuration, timing, mode-register and ODT registers.

use arbitrary_int::{u18, u2, u3, u4, u5, u6, u7};

use super::register;
use crate::lanes::{Rank, RankMask};

// ── LMC_CONFIG ───────────────────────────────────────────────────────────────

/// `LMC_CONFIG`: address geometry and rank enables.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct Config {
    /// ECC generation and checking enabled.
    #[bit(1, rw)]
    ecc_ena: bool,
    /// Row LSB encoding (`row_lsb - 14`).
    #[bits(2..=4, rw)]
    row_lsb: u3,
    /// Physical-bank LSB encoding (`pbank_lsb - 28`).
    #[bits(5..=8, rw)]
    pbank_lsb: u4,
    /// More than one rank per DIMM.
    #[bit(10, rw)]
    rank_ena: bool,
    /// 32-bit data bus.
    #[bit(11, rw)]
    mode32b: bool,
    /// Ranks that completed power-up initialization.
    #[bits(12..=15, rw)]
    init_status: u4,
    /// Ranks targeted by the next internal sequence.
    #[bits(33..=36, rw)]
    rankmask: u4,
    /// Address-mirrored ranks.
    #[bits(37..=40, rw)]
    mirrmask: u4,
}

impl Config {
    /// Ranks that completed power-up initialization.
    #[must_use]
    pub fn init_ranks(&self) -> RankMask {
        RankMask::from_bits(self.init_status().value())
    }

    /// Ranks targeted by the next internal sequence.
    #[must_use]
    pub fn sequence_ranks(&self) -> RankMask {
        RankMask::from_bits(self.rankmask().value())
    }

    /// Address-mirrored ranks.
    #[must_use]
    pub fn mirrored_ranks(&self) -> RankMask {
        RankMask::from_bits(self.mirrmask().value())
    }

    /// Record which ranks completed initialization.
    #[must_use]
    pub fn with_init_ranks(&self, ranks: RankMask) -> Self {
        self.with_init_status(ranks.nibble())
    }

    /// Select the ranks targeted by the next internal sequence.
    #[must_use]
    pub fn with_sequence_ranks(&self, ranks: RankMask) -> Self {
        self.with_rankmask(ranks.nibble())
    }

    /// Set the address-mirrored ranks.
    #[must_use]
    pub fn with_mirrored_ranks(&self, ranks: RankMask) -> Self {
        self.with_mirrmask(ranks.nibble())
    }
}

// ── LMC_CONTROL ──────────────────────────────────────────────────────────────

/// `LMC_CONTROL`: module type, command timing and scrambling.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct Control {
    /// Registered DIMM: register control words and extra cycle.
    #[bit(0, rw)]
    rdimm_ena: bool,
    /// Drive commands for two cycles.
    #[bit(4, rw)]
    ddr2t: bool,
    /// Data scrambling enabled.
    #[bit(8, rw)]
    scramble_ena: bool,
    /// Read-data FIFO count (`10 * cpu / ddr - 1`).
    #[bits(16..=23, rw)]
    rdf_cnt: u8,
}

// ── LMC_SEQ_CTL ──────────────────────────────────────────────────────────────

/// `LMC_SEQ_CTL`: internal sequencer trigger.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct SeqCtl {
    /// Start the selected sequence.
    #[bit(0, rw)]
    init_start: bool,
    /// Sequence selector.
    #[bits(1..=4, rw)]
    seq_sel: u4,
    /// Sequence finished.
    #[bit(5, rw)]
    seq_complete: bool,
}

// ── LMC_EXT_CONFIG ───────────────────────────────────────────────────────────

/// `LMC_EXT_CONFIG`: extended configuration.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct ExtConfig {
    /// Sequence 10 runs deskew training when set, internal VREF training when clear.
    #[bit(0, rw)]
    vrefint_seq_deskew: bool,
}

// ── Timing ───────────────────────────────────────────────────────────────────

/// `LMC_TIMING_PARAMS0`: row timing in clock cycles.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct TimingParams0 {
    /// ACTIVATE to READ/WRITE.
    #[bits(0..=4, rw)]
    trcd: u5,
    /// PRECHARGE period.
    #[bits(5..=9, rw)]
    trp: u5,
    /// ACTIVATE to PRECHARGE.
    #[bits(10..=16, rw)]
    tras: u7,
    /// Refresh cycle time in units of 8 cycles.
    #[bits(17..=24, rw)]
    trfc: u8,
}

/// `LMC_TIMING_PARAMS1`: activation windows and turnarounds in clock cycles.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct TimingParams1 {
    /// ACTIVATE to ACTIVATE, different bank.
    #[bits(0..=3, rw)]
    trrd: u4,
    /// Four-activate window.
    #[bits(4..=10, rw)]
    tfaw: u7,
    /// Write-to-read turnaround.
    #[bits(11..=14, rw)]
    twtr: u4,
}

// ── Mode registers ───────────────────────────────────────────────────────────

/// `LMC_MODEREG_PARAMS0`: latencies in clock cycles.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct ModeregParams0 {
    /// CAS latency.
    #[bits(0..=4, rw)]
    cl: u5,
    /// CAS write latency.
    #[bits(5..=9, rw)]
    cwl: u5,
    /// Write recovery.
    #[bits(10..=14, rw)]
    wrp: u5,
}

/// `LMC_MODEREG_PARAMS1`: per-rank RTT_NOM, output drive and RTT_WR, one
/// byte per rank.
#[bitbybit::bitfield(u64, default = 0x0)]
#[derive(Debug)]
pub struct ModeregParams1 {
    /// RTT_NOM encoding, indexed by rank.
    #[bits(0..=2, rw, stride = 8)]
    rtt_nom: [u3; 4],
    /// Output driver impedance encoding, indexed by rank.
    #[bits(3..=4, rw, stride = 8)]
    dic: [u2; 4],
    /// RTT_WR encoding, indexed by rank.
    #[bits(5..=7, rw, stride = 8)]
    rtt_wr: [u3; 4],
}

impl ModeregParams1 {
    /// RTT_NOM encoding of `rank`.
    #[must_use]
    pub fn rank_rtt_nom(&self, rank: Rank) -> u8 {
        self.rtt_nom(rank.index()).value()
    }
}

/// `LMC_MODEREG_PARAMS2`: per-rank RTT_PARK and DRAM VREF (MR6), ten bits
/// per rank.
#[bitbybit::bitfield(u64, default = 0x0)]
#[derive(Debug)]
pub struct ModeregParams2 {
    /// RTT_PARK encoding, indexed by rank.
    #[bits(0..=2, rw, stride = 10)]
    rtt_park: [u3; 4],
    /// DRAM VREF value (MR6 A5:A0), indexed by rank.
    #[bits(3..=8, rw, stride = 10)]
    vref_value: [u6; 4],
    /// DRAM VREF range (MR6 A6), indexed by rank: `false` = range 1.
    #[bit(9, rw, stride = 10)]
    vref_range: [bool; 4],
}

impl ModeregParams2 {
    /// Record the DRAM VREF of `rank`.
    #[must_use]
    pub fn with_vref(&self, rank: Rank, range2: bool, value: u6) -> Self {
        self.with_vref_value(rank.index(), value)
            .with_vref_range(rank.index(), range2)
    }
}

/// `LMC_MR_MPR_CTL`: target of the mode-register-write sequence.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct MrWrCtl {
    /// Address bits written to the mode register.
    #[bits(0..=17, rw)]
    mr_wr_addr: u18,
    /// Mode register number.
    #[bits(18..=20, rw)]
    mr_wr_sel: u3,
    /// Target rank.
    #[bits(21..=22, rw)]
    mr_wr_rank: u2,
}

// ── Compensation / ODT ───────────────────────────────────────────────────────

/// `LMC_COMP_CTL2`: drive strengths, read ODT, compensation results.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct CompCtl2 {
    /// DQ/DQS drive strength encoding.
    #[bits(0..=3, rw)]
    dqx_ctl: u4,
    /// Clock drive strength encoding.
    #[bits(4..=7, rw)]
    ck_ctl: u4,
    /// Command drive strength encoding.
    #[bits(8..=11, rw)]
    cmd_ctl: u4,
    /// Control drive strength encoding.
    #[bits(12..=15, rw)]
    control_ctl: u4,
    /// Controller-side read ODT encoding.
    #[bits(16..=19, rw)]
    rodt_ctl: u4,
    /// Compensation result, pull-down.
    #[bits(20..=24, r)]
    ntune: u5,
    /// Compensation result, pull-up.
    #[bits(25..=29, r)]
    ptune: u5,
}

/// `LMC_WODT_MASK`: ranks terminating during writes to each rank.
#[bitbybit::bitfield(u64, default = 0x0)]
#[derive(Debug)]
pub struct WodtMask {
    /// Terminating ranks, indexed by the accessed rank.
    #[bits(0..=7, rw, stride = 8)]
    mask: [u8; 4],
}

/// `LMC_RODT_MASK`: ranks terminating during reads from each rank.
#[bitbybit::bitfield(u64, default = 0x0)]
#[derive(Debug)]
pub struct RodtMask {
    /// Terminating ranks, indexed by the accessed rank.
    #[bits(0..=7, rw, stride = 8)]
    mask: [u8; 4],
}

macro_rules! odt_mask_impl {
    ($name:ident) => {
        impl $name {
            /// Ranks that terminate while `rank` is accessed.
            #[must_use]
            pub fn terminating(&self, rank: Rank) -> RankMask {
                RankMask::from_bits(self.mask(rank.index()))
            }

            /// Set the ranks that terminate while `rank` is accessed.
            #[must_use]
            pub fn with_terminating(&self, rank: Rank, ranks: RankMask) -> Self {
                self.with_mask(rank.index(), ranks.bits())
            }

            /// Union of every terminating rank.
            #[must_use]
            pub fn any_termination(&self) -> RankMask {
                let bits = Rank::ALL
                    .iter()
                    .fold(0u8, |acc, r| acc | self.terminating(*r).bits());
                RankMask::from_bits(bits)
            }
        }
    };
}

odt_mask_impl!(WodtMask);
odt_mask_impl!(RodtMask);

// ── Scrambling / interrupts ──────────────────────────────────────────────────

/// `LMC_SCRAMBLE_CFG0`: data scramble key.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct ScrambleCfg0 {
    /// Scramble key.
    #[bits(0..=63, rw)]
    key: u64,
}

/// `LMC_SCRAMBLE_CFG1`: address scramble key.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct ScrambleCfg1 {
    /// Scramble key.
    #[bits(0..=63, rw)]
    key: u64,
}

/// `LMC_INT`: interrupt status, write 1 to clear.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct Int {
    /// Write to non-existent memory.
    #[bit(0, rw)]
    nxm_wr_err: bool,
    /// Single-bit ECC errors, one bit per rank.
    #[bits(1..=4, rw)]
    sec_err: u4,
    /// Double-bit ECC errors, one bit per rank.
    #[bits(5..=8, rw)]
    ded_err: u4,
}

impl Int {
    /// `true` when any status bit is set.
    #[must_use]
    pub fn any(&self) -> bool {
        self.raw_value() != 0
    }

    /// Raw status word; writing it back clears every set bit.
    #[must_use]
    pub fn bits(&self) -> u64 {
        self.raw_value()
    }
}

register!(
    Config,
    Control,
    SeqCtl,
    ExtConfig,
    TimingParams0,
    TimingParams1,
    ModeregParams0,
    ModeregParams1,
    ModeregParams2,
    MrWrCtl,
    CompCtl2,
    WodtMask,
    RodtMask,
    ScrambleCfg0,
    ScrambleCfg1,
    Int,
);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::regs::{narrow, Register};

    #[test]
    fn config_rankmask_and_init_status_are_independent() {
        let cfg = Config::default()
            .with_sequence_ranks(RankMask::from_bits(0b0011))
            .with_init_ranks(RankMask::from_bits(0b0001))
            .with_row_lsb(narrow(3).unwrap());
        assert_eq!(cfg.sequence_ranks().bits(), 0b0011);
        assert_eq!(cfg.init_ranks().bits(), 0b0001);
        assert_eq!(cfg.row_lsb().value(), 3);
        assert_eq!(cfg.raw(), (0b0011 << 33) | (0b0001 << 12) | (3 << 2));
    }

    #[test]
    fn modereg1_fields_per_rank() {
        let r1 = Rank::new(1).unwrap();
        let m = ModeregParams1::default()
            .with_rtt_nom(r1.index(), u3::new(3))
            .with_rtt_wr(r1.index(), u3::new(2));
        assert_eq!(m.rank_rtt_nom(r1), 3);
        assert_eq!(m.rtt_wr(r1.index()).value(), 2);
        assert_eq!(m.rank_rtt_nom(Rank::new(0).unwrap()), 0);
        assert_eq!(m.raw(), (3 << 8) | (2 << 13));
    }

    #[test]
    fn modereg2_vref_per_rank() {
        let r3 = Rank::new(3).unwrap();
        let m = ModeregParams2::default().with_vref(r3, true, u6::new(0x19));
        assert_eq!(m.vref_value(r3.index()).value(), 0x19);
        assert!(m.vref_range(r3.index()));
        assert_eq!(m.raw(), (0x19 << 33) | (1 << 39));
        assert!(narrow::<u6>(0x40).is_err());
    }

    #[test]
    fn seq_ctl_layout() {
        let s = SeqCtl::default()
            .with_seq_sel(u4::new(10))
            .with_init_start(true);
        assert_eq!(s.raw(), (10 << 1) | 1);
        assert!(!s.seq_complete());
    }

    #[test]
    fn odt_mask_union() {
        let m = RodtMask::default()
            .with_terminating(Rank::new(0).unwrap(), RankMask::from_bits(0b10))
            .with_terminating(Rank::new(1).unwrap(), RankMask::from_bits(0b01));
        assert_eq!(m.any_termination().bits(), 0b11);
        assert_eq!(m.raw(), 0x0102);
    }
}
