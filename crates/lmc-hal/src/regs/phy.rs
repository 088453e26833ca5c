//! PHY debug port and DLL control.

use arbitrary_int::{u10, u2, u4, u6};

use super::register;
use crate::lanes::{ByteLane, OutOfRangeError};

/// Debug-port bit selector returning the lane's DBI deskew setting.
pub const PHY_BIT_SEL_DBI: u8 = 8;
/// Debug-port bit selector returning the lane's VREF DAC code.
pub const PHY_BIT_SEL_DAC: u8 = 9;

// ── LMC_PHY_CTL ──────────────────────────────────────────────────────────────

/// `LMC_PHY_CTL`: deskew reset and per-bit debug read port.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct PhyCtl {
    /// Hold the per-bit deskew state machines in reset.
    #[bit(0, rw)]
    phy_dsk_reset: bool,
    /// Bit within the byte (0–7 data, 8 DBI, 9 DAC).
    #[bits(1..=4, rw)]
    dsk_dbg_bit_sel: u4,
    /// Byte lane selector.
    #[bits(5..=8, rw)]
    dsk_dbg_byte_sel: u4,
    /// Start a debug read.
    #[bit(9, rw)]
    dsk_dbg_rd_start: bool,
    /// Debug read finished; `dsk_dbg_rd_data` is valid.
    #[bit(10, rw)]
    dsk_dbg_rd_complete: bool,
    /// 10-bit word returned by the debug read.
    #[bits(11..=20, rw)]
    dsk_dbg_rd_data: u10,
}

impl PhyCtl {
    /// Point the debug port at `bit_sel` of `lane`.
    #[must_use]
    pub fn with_debug_target(&self, lane: ByteLane, bit_sel: u4) -> Self {
        self.with_dsk_dbg_byte_sel(lane.nibble())
            .with_dsk_dbg_bit_sel(bit_sel)
    }
}

// ── LMC_DLL_CTL3 ─────────────────────────────────────────────────────────────

/// Which DLL the offset in `DLL_CTL3` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DllOffsetMode {
    /// Write DQ/DQS DLL.
    Write,
    /// Read DQS DLL.
    Read,
}

impl DllOffsetMode {
    /// `mode_sel` encoding.
    #[must_use]
    pub fn code(self) -> u2 {
        match self {
            Self::Write => u2::new(1),
            Self::Read => u2::new(2),
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

/// `LMC_DLL_CTL3`: DLL offsets and per-bit deskew/DAC overrides.
#[bitbybit::bitfield(u64, default = 0x0, debug)]
pub struct DllCtl3 {
    /// Offset magnitude.
    #[bits(0..=5, rw)]
    offset_magnitude: u6,
    /// Offset sign.
    #[bit(6, rw)]
    offset_negative: bool,
    /// Lane selector: lane + 1, or 10 for all lanes.
    #[bits(7..=10, rw)]
    byte_sel: u4,
    /// DLL selector (1 = write, 2 = read).
    #[bits(11..=12, rw)]
    mode_sel: u2,
    /// Rising edge loads the offset into the selected DLLs.
    #[bit(13, rw)]
    load_offset: bool,
    /// Apply loaded offsets.
    #[bit(14, rw)]
    offset_ena: bool,
    /// Bit selector for deskew/DAC overrides (same encoding as the debug port).
    #[bits(15..=18, rw)]
    bit_select: u4,
    /// Rising edge loads `deskew_data` into the selected bit.
    #[bit(19, rw)]
    wr_deskew_ld: bool,
    /// Override value for the selected bit.
    #[bits(20..=29, rw)]
    deskew_data: u10,
}

impl DllCtl3 {
    /// Largest offset magnitude.
    pub const MAX_OFFSET: i8 = 63;
    /// `byte_sel` value addressing every lane at once.
    pub const BYTE_SEL_ALL: u8 = 10;

    /// Signed offset decoded from the sign-magnitude field.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // six-bit magnitude
    pub fn offset(&self) -> i8 {
        let magnitude = self.offset_magnitude().value() as i8;
        if self.offset_negative() {
            magnitude.wrapping_neg()
        } else {
            magnitude
        }
    }

    /// Encode a signed offset as six-bit magnitude plus sign.
    pub fn with_offset(&self, offset: i8) -> Result<Self, OutOfRangeError> {
        let magnitude = super::narrow::<u6>(offset.unsigned_abs())?;
        Ok(self
            .with_offset_magnitude(magnitude)
            .with_offset_negative(offset < 0))
    }
}

register!(PhyCtl, DllCtl3);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::regs::Register;

    #[test]
    fn dll_offset_sign_magnitude() {
        let ctl = DllCtl3::default().with_offset(-5).unwrap();
        assert_eq!(ctl.raw() & 0x7f, 0x45);
        assert_eq!(ctl.offset(), -5);
        let ctl = ctl.with_offset(63).unwrap();
        assert_eq!(ctl.raw() & 0x7f, 0x3f);
        assert!(ctl.with_offset(-64).is_err());
    }

    #[test]
    fn dll_ctl3_field_positions() {
        let ctl = DllCtl3::default()
            .with_byte_sel(u4::new(DllCtl3::BYTE_SEL_ALL))
            .with_mode_sel(DllOffsetMode::Read.code())
            .with_load_offset(true);
        assert_eq!(ctl.raw(), (10 << 7) | (2 << 11) | (1 << 13));
    }

    #[test]
    fn phy_ctl_debug_port_select() {
        let phy = PhyCtl::default()
            .with_debug_target(ByteLane::new(3).unwrap(), u4::new(PHY_BIT_SEL_DAC))
            .with_dsk_dbg_rd_data(u10::new(0x3ff));
        assert_eq!(phy.dsk_dbg_byte_sel().value(), 3);
        assert_eq!(phy.dsk_dbg_bit_sel().value(), 9);
        assert_eq!(phy.dsk_dbg_rd_data().value(), 0x3ff);
        assert_eq!(phy.raw(), (3 << 5) | (9 << 1) | (0x3ff << 11));
    }
}
