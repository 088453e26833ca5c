//! LMC register surface.
//!
//! Every register is a 64-bit word addressed by `(controller, RegisterId,
//! index)`. `index` is the rank for per-rank registers (`RLEVEL_RANKn`,
//! `WLEVEL_RANKn`) and 0 otherwise.
//!
//! Each named register is a `bitbybit` bitfield over `u64` with
//! `arbitrary-int` field widths, so a field can only hold what fits. Runtime
//! values from board tables go through [`narrow`], which returns
//! [`OutOfRangeError`] instead of truncating. Only the fields the training
//! engine relies on are modelled; the rest of each word is carried through
//! untouched by read-modify-write.

mod control;
mod leveling;
mod phy;

pub use control::{
    CompCtl2, Config, Control, ExtConfig, Int, ModeregParams0, ModeregParams1, ModeregParams2,
    MrWrCtl, RodtMask, ScrambleCfg0, ScrambleCfg1, SeqCtl, TimingParams0, TimingParams1,
    WodtMask,
};
pub use leveling::{LevelStatus, RlevelCtl, RlevelDbg, RlevelRank, WlevelCtl, WlevelDbg, WlevelRank};
pub use phy::{DllCtl3, DllOffsetMode, PhyCtl, PHY_BIT_SEL_DAC, PHY_BIT_SEL_DBI};

use arbitrary_int::{u10, u18, u2, u3, u4, u5, u6, u7, u9, Number};

use crate::lanes::OutOfRangeError;

// ── Register identity ────────────────────────────────────────────────────────

/// Named LMC registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterId {
    /// `LMC_CONFIG`: geometry, rank enables, sequence rank mask.
    Config,
    /// `LMC_CONTROL`: module type, 2T mode, scrambling, read FIFO count.
    Control,
    /// `LMC_SEQ_CTL`: internal sequencer trigger and completion.
    SeqCtl,
    /// `LMC_EXT_CONFIG`: sequence 10 selector.
    ExtConfig,
    /// `LMC_TIMING_PARAMS0`.
    TimingParams0,
    /// `LMC_TIMING_PARAMS1`.
    TimingParams1,
    /// `LMC_MODEREG_PARAMS0`: CAS/CWL/write recovery.
    ModeregParams0,
    /// `LMC_MODEREG_PARAMS1`: per-rank RTT_NOM, RTT_WR, drive.
    ModeregParams1,
    /// `LMC_MODEREG_PARAMS2`: per-rank RTT_PARK and DRAM VREF.
    ModeregParams2,
    /// `LMC_MR_MPR_CTL`: mode register write target.
    MrWrCtl,
    /// `LMC_COMP_CTL2`: drive strengths and read ODT.
    CompCtl2,
    /// `LMC_WODT_MASK`.
    WodtMask,
    /// `LMC_RODT_MASK`.
    RodtMask,
    /// `LMC_RLEVEL_CTL`.
    RlevelCtl,
    /// `LMC_RLEVEL_DBG`: per-byte read-leveling bitmask.
    RlevelDbg,
    /// `LMC_RLEVEL_RANKn`.
    RlevelRank,
    /// `LMC_WLEVEL_CTL`.
    WlevelCtl,
    /// `LMC_WLEVEL_DBG`: per-byte write-leveling bitmask.
    WlevelDbg,
    /// `LMC_WLEVEL_RANKn`.
    WlevelRank,
    /// `LMC_PHY_CTL`: deskew reset and debug read port.
    PhyCtl,
    /// `LMC_DLL_CTL3`: DLL offsets and deskew/DAC overrides.
    DllCtl3,
    /// `LMC_SCRAMBLE_CFG0`.
    ScrambleCfg0,
    /// `LMC_SCRAMBLE_CFG1`.
    ScrambleCfg1,
    /// `LMC_INT`: write-1-to-clear interrupt status.
    Int,
}

impl RegisterId {
    /// Hardware register name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Config => "LMC_CONFIG",
            Self::Control => "LMC_CONTROL",
            Self::SeqCtl => "LMC_SEQ_CTL",
            Self::ExtConfig => "LMC_EXT_CONFIG",
            Self::TimingParams0 => "LMC_TIMING_PARAMS0",
            Self::TimingParams1 => "LMC_TIMING_PARAMS1",
            Self::ModeregParams0 => "LMC_MODEREG_PARAMS0",
            Self::ModeregParams1 => "LMC_MODEREG_PARAMS1",
            Self::ModeregParams2 => "LMC_MODEREG_PARAMS2",
            Self::MrWrCtl => "LMC_MR_MPR_CTL",
            Self::CompCtl2 => "LMC_COMP_CTL2",
            Self::WodtMask => "LMC_WODT_MASK",
            Self::RodtMask => "LMC_RODT_MASK",
            Self::RlevelCtl => "LMC_RLEVEL_CTL",
            Self::RlevelDbg => "LMC_RLEVEL_DBG",
            Self::RlevelRank => "LMC_RLEVEL_RANK",
            Self::WlevelCtl => "LMC_WLEVEL_CTL",
            Self::WlevelDbg => "LMC_WLEVEL_DBG",
            Self::WlevelRank => "LMC_WLEVEL_RANK",
            Self::PhyCtl => "LMC_PHY_CTL",
            Self::DllCtl3 => "LMC_DLL_CTL3",
            Self::ScrambleCfg0 => "LMC_SCRAMBLE_CFG0",
            Self::ScrambleCfg1 => "LMC_SCRAMBLE_CFG1",
            Self::Int => "LMC_INT",
        }
    }
}

// ── Access traits ────────────────────────────────────────────────────────────

/// Raw register read/write primitive supplied by the platform.
pub trait RegisterAccess {
    /// Read one register.
    fn read(&mut self, controller: u8, id: RegisterId, index: u8) -> u64;

    /// Write one register.
    fn write(&mut self, controller: u8, id: RegisterId, index: u8, value: u64);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for &mut T {
    fn read(&mut self, controller: u8, id: RegisterId, index: u8) -> u64 {
        T::read(self, controller, id, index)
    }

    fn write(&mut self, controller: u8, id: RegisterId, index: u8, value: u64) {
        T::write(self, controller, id, index, value);
    }
}

/// A typed view over one named register.
pub trait Register: Copy + Default {
    /// Which register this type describes.
    const ID: RegisterId;

    /// Wrap a raw word.
    fn from_raw(raw: u64) -> Self;

    /// Raw word.
    fn raw(self) -> u64;
}

// ── Field widths ─────────────────────────────────────────────────────────────

/// An `arbitrary-int` field type that runtime values can be narrowed into.
pub trait FieldWidth: Sized {
    /// Primitive the field is stored as.
    type Raw;

    /// Narrow `raw`, rejecting values wider than the field.
    fn narrow(raw: Self::Raw) -> Result<Self, OutOfRangeError>;
}

macro_rules! field_width {
    ($($ty:ident: $raw:ty),* $(,)?) => {
        $(
            impl FieldWidth for $ty {
                type Raw = $raw;

                fn narrow(raw: $raw) -> Result<Self, OutOfRangeError> {
                    OutOfRangeError::check(u64::from(raw), u64::from($ty::MAX.value()))?;
                    Ok($ty::new(raw))
                }
            }
        )*
    };
}

field_width!(u2: u8, u3: u8, u4: u8, u5: u8, u6: u8, u7: u8, u9: u16, u10: u16, u18: u32);

/// Narrow a runtime value into a register field type.
pub fn narrow<T: FieldWidth>(raw: T::Raw) -> Result<T, OutOfRangeError> {
    T::narrow(raw)
}

/// Tie a bitfield struct to its [`RegisterId`].
macro_rules! register {
    ($($name:ident),* $(,)?) => {
        $(
            impl $crate::regs::Register for $name {
                const ID: $crate::regs::RegisterId = $crate::regs::RegisterId::$name;

                fn from_raw(raw: u64) -> Self {
                    Self::new_with_raw_value(raw)
                }

                fn raw(self) -> u64 {
                    self.raw_value()
                }
            }
        )*
    };
}

pub(crate) use register;
