//! Read- and write-leveling registers.
//!
//! `RLEVEL_RANKn` packs nine 6-bit byte delays (byte 0 at bit 0) with a
//! 2-bit status at bit 54. `WLEVEL_RANKn` packs nine 5-bit delays with the
//! status at bit 45.

use arbitrary_int::{u2, u3, u4, u5, u6, u9};

use super::{narrow, register};
use crate::lanes::{ByteLane, DelayVector, LaneMask, OutOfRangeError, PerLane};

/// Completion code of a leveling status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LevelStatus {
    /// Not started.
    Idle,
    /// Running (codes 1 and 2).
    InProgress,
    /// Results valid.
    Complete,
}

impl LevelStatus {
    /// Decode the 2-bit status code.
    #[must_use]
    pub fn from_code(code: u2) -> Self {
        match code.value() {
            0 => Self::Idle,
            3 => Self::Complete,
            _ => Self::InProgress,
        }
    }

    /// 2-bit status code.
    #[must_use]
    pub fn code(self) -> u2 {
        match self {
            Self::Idle => u2::new(0),
            Self::InProgress => u2::new(1),
            Self::Complete => u2::new(3),
        }
    }
}

// ── Read leveling ────────────────────────────────────────────────────────────

/// `LMC_RLEVEL_CTL`: read-leveling control.
#[bitbybit::bitfield(u64, default = 0x0)]
#[derive(Debug)]
pub struct RlevelCtl {
    /// Byte lane whose bitmask `RLEVEL_DBG` returns.
    #[bits(0..=3, rw)]
    byte: u4,
    /// Offset from the end of the passing window when `offset_en`.
    #[bits(4..=7, rw)]
    offset: u4,
    /// Place the delay `offset` steps from the window end instead of the centre.
    #[bit(8, rw)]
    offset_en: bool,
    /// Disable OR-ing of per-bit results within a byte.
    #[bit(9, rw)]
    or_dis: bool,
    /// Bits of each byte that participate in leveling.
    #[bits(10..=17, rw)]
    bitmask: u8,
    /// Delay unload of read data, indexed by rank.
    #[bit(18, rw)]
    delay_unload: [bool; 4],
    /// Expected MPR read pattern.
    #[bits(24..=31, rw)]
    pattern: u8,
}

impl RlevelCtl {
    /// Select the byte lane read back through `RLEVEL_DBG`.
    #[must_use]
    pub fn with_lane(&self, lane: ByteLane) -> Self {
        self.with_byte(lane.nibble())
    }

    /// Set all four delay-unload flags at once.
    #[must_use]
    pub fn with_delay_unload_all(&self, on: bool) -> Self {
        (0..4).fold(*self, |reg, rank| reg.with_delay_unload(rank, on))
    }
}

/// `LMC_RLEVEL_DBG`: 64-bit pass/fail bitmask of the selected byte.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct RlevelDbg {
    /// Pass/fail bitmask, bit `n` = delay setting `n` passed.
    #[bits(0..=63, r)]
    bitmask: u64,
}

/// `LMC_RLEVEL_RANKn`: per-byte read delays of one rank.
#[bitbybit::bitfield(u64, default = 0x0)]
#[derive(Debug)]
pub struct RlevelRank {
    /// Delay of each byte lane.
    #[bits(0..=5, rw)]
    byte: [u6; 9],
    /// Leveling status code.
    #[bits(54..=55, rw)]
    status_code: u2,
}

impl RlevelRank {
    /// Largest representable delay.
    pub const MAX_DELAY: u8 = 63;

    /// Delay of one byte lane.
    #[must_use]
    pub fn delay(&self, lane: ByteLane) -> u8 {
        self.byte(lane.index()).value()
    }

    /// Set one byte lane's delay.
    pub fn with_delay(&self, lane: ByteLane, delay: u8) -> Result<Self, OutOfRangeError> {
        Ok(self.with_byte(lane.index(), narrow(delay)?))
    }

    /// Leveling status.
    #[must_use]
    pub fn status(&self) -> LevelStatus {
        LevelStatus::from_code(self.status_code())
    }

    /// Set the leveling status.
    #[must_use]
    pub fn with_status(&self, status: LevelStatus) -> Self {
        self.with_status_code(status.code())
    }

    /// All nine delays.
    #[must_use]
    pub fn delays(&self) -> DelayVector {
        PerLane::from_fn(|lane| self.delay(lane))
    }

    /// Build a register from a delay vector, status `Complete`.
    pub fn from_delays(delays: &DelayVector) -> Result<Self, OutOfRangeError> {
        delays
            .iter()
            .try_fold(Self::default(), |reg, (lane, delay)| reg.with_delay(lane, delay))
            .map(|reg| reg.with_status(LevelStatus::Complete))
    }
}

// ── Write leveling ───────────────────────────────────────────────────────────

/// `LMC_WLEVEL_CTL`: write-leveling control.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct WlevelCtl {
    /// Lanes the hardware levels.
    #[bits(0..=8, rw)]
    lanemask: u9,
    /// Sample setting: one DQS edge per step instead of the whole burst.
    #[bit(9, rw)]
    sset: bool,
    /// Disable OR-ing of per-bit results.
    #[bit(10, rw)]
    or_dis: bool,
    /// Bits of each byte that participate.
    #[bits(11..=18, rw)]
    bitmask: u8,
    /// RTT_NOM encoding driven during write leveling.
    #[bits(19..=21, rw)]
    rtt_nom: u3,
}

impl WlevelCtl {
    /// Lanes the hardware levels.
    #[must_use]
    pub fn lanes(&self) -> LaneMask {
        LaneMask::from_bits(self.lanemask().value())
    }

    /// Set the lanes the hardware levels.
    #[must_use]
    pub fn with_lanes(&self, lanes: LaneMask) -> Self {
        self.with_lanemask(lanes.field())
    }
}

/// `LMC_WLEVEL_DBG`: 8-bit bitmask of the selected byte.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct WlevelDbg {
    /// Byte lane selector.
    #[bits(0..=3, rw)]
    byte: u4,
    /// Per-phase sample bitmask of the selected byte.
    #[bits(4..=11, rw)]
    bitmask: u8,
}

impl WlevelDbg {
    /// Select the byte lane read back.
    #[must_use]
    pub fn with_lane(&self, lane: ByteLane) -> Self {
        self.with_byte(lane.nibble())
    }
}

/// `LMC_WLEVEL_RANKn`: per-byte write delays of one rank.
#[bitbybit::bitfield(u64, default = 0x0)]
#[derive(Debug)]
pub struct WlevelRank {
    /// Delay of each byte lane.
    #[bits(0..=4, rw)]
    byte: [u5; 9],
    /// Leveling status code.
    #[bits(45..=46, rw)]
    status_code: u2,
}

impl WlevelRank {
    /// Largest representable delay.
    pub const MAX_DELAY: u8 = 31;

    /// Delay of one byte lane.
    #[must_use]
    pub fn delay(&self, lane: ByteLane) -> u8 {
        self.byte(lane.index()).value()
    }

    /// Set one byte lane's delay.
    pub fn with_delay(&self, lane: ByteLane, delay: u8) -> Result<Self, OutOfRangeError> {
        Ok(self.with_byte(lane.index(), narrow(delay)?))
    }

    /// Leveling status.
    #[must_use]
    pub fn status(&self) -> LevelStatus {
        LevelStatus::from_code(self.status_code())
    }

    /// Set the leveling status.
    #[must_use]
    pub fn with_status(&self, status: LevelStatus) -> Self {
        self.with_status_code(status.code())
    }

    /// All nine delays.
    #[must_use]
    pub fn delays(&self) -> DelayVector {
        PerLane::from_fn(|lane| self.delay(lane))
    }

    /// Build a register from a delay vector, status `Complete`.
    pub fn from_delays(delays: &DelayVector) -> Result<Self, OutOfRangeError> {
        delays
            .iter()
            .try_fold(Self::default(), |reg, (lane, delay)| reg.with_delay(lane, delay))
            .map(|reg| reg.with_status(LevelStatus::Complete))
    }
}

register!(RlevelCtl, RlevelDbg, RlevelRank, WlevelCtl, WlevelDbg, WlevelRank);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::regs::Register;

    #[test]
    fn rlevel_rank_byte_layout() {
        let reg = RlevelRank::default()
            .with_delay(ByteLane::new(1).unwrap(), 0x2a)
            .unwrap();
        assert_eq!(reg.raw(), 0x2a << 6);
        let reg = reg.with_delay(ByteLane::ECC, 63).unwrap();
        assert_eq!(reg.delay(ByteLane::ECC), 63);
        assert!(reg.with_delay(ByteLane::ECC, 64).is_err());
    }

    #[test]
    fn rlevel_status_at_bit_54() {
        let reg = RlevelRank::from_raw(3 << 54);
        assert_eq!(reg.status(), LevelStatus::Complete);
        assert_eq!(RlevelRank::from_raw(2 << 54).status(), LevelStatus::InProgress);
        assert_eq!(RlevelRank::default().status(), LevelStatus::Idle);
    }

    #[test]
    fn wlevel_rank_is_five_bits_per_byte() {
        let lane = ByteLane::new(2).unwrap();
        let reg = WlevelRank::default().with_delay(lane, 31).unwrap();
        assert_eq!(reg.raw(), 31 << 10);
        assert!(reg.with_delay(lane, 32).is_err());
        let reg = reg.with_status(LevelStatus::Complete);
        assert_eq!(reg.raw() >> 45, 3);
    }

    #[test]
    fn rlevel_ctl_fields_do_not_overlap() {
        let ctl = RlevelCtl::default()
            .with_lane(ByteLane::ECC)
            .with_offset(u4::new(2))
            .with_offset_en(true)
            .with_bitmask(0xff)
            .with_delay_unload_all(true);
        assert_eq!(ctl.byte().value(), 8);
        assert_eq!(ctl.offset().value(), 2);
        assert!(ctl.offset_en());
        assert!(!ctl.or_dis());
        assert_eq!(ctl.bitmask(), 0xff);
        assert_eq!((ctl.raw() >> 18) & 0xf, 0xf);
        assert!(narrow::<u4>(16).is_err());
    }

    #[test]
    fn wlevel_ctl_lanemask_round_trips() {
        let ctl = WlevelCtl::default()
            .with_lanes(LaneMask::for_bus(false, false))
            .with_rtt_nom(u3::new(5));
        assert_eq!(ctl.lanes().bits(), 0xff);
        assert_eq!(ctl.rtt_nom().value(), 5);
    }
}
