//! Controller driver: typed register access, internal sequences and
//! blocking poll loops.
//!
//! Every hardware operation is a register write followed by a bounded poll
//! of a status field with 1 µs busy-waits between reads. A poll that never
//! sees completion returns [`SequenceTimeout`]; callers log it and carry on,
//! a timeout alone never aborts bring-up.

use core::fmt;

use arbitrary_int::u4;
use embedded_hal::delay::DelayNs;

use crate::lanes::{ByteLane, LaneMask, OutOfRangeError, Rank, RankMask};
use crate::memtest::{PatternTester, TestPattern};
use crate::regs::{
    narrow, Config, DllCtl3, DllOffsetMode, LevelStatus, MrWrCtl, PhyCtl, Register,
    RegisterAccess, RlevelCtl, RlevelDbg, RlevelRank, SeqCtl, WlevelDbg, WlevelRank,
};

/// Poll iterations (1 µs each) before a sequence is declared timed out.
pub const SEQUENCE_POLL_LIMIT: u32 = 10_000;

/// Settle time after the power-up/init sequence.
pub const INIT_SETTLE_US: u32 = 1_000;

// ── Sequences ────────────────────────────────────────────────────────────────

/// Internal sequences the controller can run against a rank mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sequence {
    /// Power-up and DRAM initialization.
    PowerUpInit,
    /// Read leveling.
    ReadLeveling,
    /// Self-refresh entry.
    SelfRefreshEntry,
    /// Self-refresh exit.
    SelfRefreshExit,
    /// Precharge power-down entry.
    PrechargePowerDownEntry,
    /// Precharge power-down exit.
    PrechargePowerDownExit,
    /// Write leveling.
    WriteLeveling,
    /// Registered-DIMM control word initialization.
    InitControlWords,
    /// Mode register write.
    ModeRegisterWrite,
    /// MPR register access.
    MprAccess,
    /// Deskew training or internal VREF training, per `EXT_CONFIG`.
    DeskewOrVref,
    /// Receiver offset training.
    OffsetTraining,
}

impl Sequence {
    /// `seq_sel` encoding.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::PowerUpInit => 0,
            Self::ReadLeveling => 1,
            Self::SelfRefreshEntry => 2,
            Self::SelfRefreshExit => 3,
            Self::PrechargePowerDownEntry => 4,
            Self::PrechargePowerDownExit => 5,
            Self::WriteLeveling => 6,
            Self::InitControlWords => 7,
            Self::ModeRegisterWrite => 8,
            Self::MprAccess => 9,
            Self::DeskewOrVref => 10,
            Self::OffsetTraining => 11,
        }
    }

    /// `SEQ_CTL.seq_sel` field value.
    #[must_use]
    pub fn selector(self) -> u4 {
        u4::new(self.code())
    }

    /// Decode a `seq_sel` value.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::PowerUpInit,
            1 => Self::ReadLeveling,
            2 => Self::SelfRefreshEntry,
            3 => Self::SelfRefreshExit,
            4 => Self::PrechargePowerDownEntry,
            5 => Self::PrechargePowerDownExit,
            6 => Self::WriteLeveling,
            7 => Self::InitControlWords,
            8 => Self::ModeRegisterWrite,
            9 => Self::MprAccess,
            10 => Self::DeskewOrVref,
            11 => Self::OffsetTraining,
            _ => return None,
        })
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PowerUpInit => "power-up/init",
            Self::ReadLeveling => "read-leveling",
            Self::SelfRefreshEntry => "self-refresh entry",
            Self::SelfRefreshExit => "self-refresh exit",
            Self::PrechargePowerDownEntry => "precharge power-down entry",
            Self::PrechargePowerDownExit => "precharge power-down exit",
            Self::WriteLeveling => "write-leveling",
            Self::InitControlWords => "init register control words",
            Self::ModeRegisterWrite => "mode register write",
            Self::MprAccess => "MPR register access",
            Self::DeskewOrVref => "deskew/internal VREF training",
            Self::OffsetTraining => "offset training",
        }
    }
}

impl SeqCtl {
    /// Register value that starts `seq`.
    #[must_use]
    pub fn start(seq: Sequence) -> Self {
        Self::default()
            .with_seq_sel(seq.selector())
            .with_init_start(true)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// What a poll loop was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollTarget {
    /// `SEQ_CTL.seq_complete` after starting a sequence.
    Sequence(Sequence),
    /// `RLEVEL_RANKn.status == 3`.
    ReadLevelStatus(Rank),
    /// `WLEVEL_RANKn.status == 3`.
    WriteLevelStatus(Rank),
    /// `PHY_CTL.dsk_dbg_rd_complete`.
    DebugRead,
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence(seq) => write!(f, "sequence {} ({})", seq.code(), seq.name()),
            Self::ReadLevelStatus(rank) => write!(f, "read-leveling status of rank {}", rank.get()),
            Self::WriteLevelStatus(rank) => {
                write!(f, "write-leveling status of rank {}", rank.get())
            }
            Self::DebugRead => f.write_str("PHY debug read"),
        }
    }
}

/// A poll loop exhausted its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("timed out waiting for {target}")]
pub struct SequenceTimeout {
    /// What was being waited for.
    pub target: PollTarget,
}

/// Failure of a compound driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LmcError {
    /// A poll loop timed out.
    #[error("{0}")]
    Timeout(SequenceTimeout),
    /// A value did not fit its register field.
    #[error("register field: {0}")]
    Field(OutOfRangeError),
}

impl From<SequenceTimeout> for LmcError {
    fn from(e: SequenceTimeout) -> Self {
        Self::Timeout(e)
    }
}

impl From<OutOfRangeError> for LmcError {
    fn from(e: OutOfRangeError) -> Self {
        Self::Field(e)
    }
}

// ── Reset ────────────────────────────────────────────────────────────────────

/// Whole-chip reset, the escalation path for fatal training failures.
pub trait ResetControl {
    /// Reset the chip. Never returns.
    fn reset(&mut self) -> !;
}

impl<T: ResetControl + ?Sized> ResetControl for &mut T {
    fn reset(&mut self) -> ! {
        T::reset(self)
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// One memory controller: register bus, delay source and controller index.
pub struct Lmc<B, D> {
    bus: B,
    delay: D,
    controller: u8,
    poll_limit: u32,
}

impl<B: RegisterAccess, D: DelayNs> Lmc<B, D> {
    /// Wrap a register bus for controller `controller`.
    pub fn new(bus: B, delay: D, controller: u8) -> Self {
        Self {
            bus,
            delay,
            controller,
            poll_limit: SEQUENCE_POLL_LIMIT,
        }
    }

    /// Controller index.
    pub fn controller(&self) -> u8 {
        self.controller
    }

    /// Override the poll budget.
    #[must_use]
    pub fn with_poll_limit(mut self, limit: u32) -> Self {
        self.poll_limit = limit;
        self
    }

    /// Underlying bus.
    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Give back the bus and delay source.
    pub fn release(self) -> (B, D) {
        (self.bus, self.delay)
    }

    /// Read a controller-wide register.
    pub fn read<R: Register>(&mut self) -> R {
        R::from_raw(self.bus.read(self.controller, R::ID, 0))
    }

    /// Write a controller-wide register.
    pub fn write<R: Register>(&mut self, reg: R) {
        self.bus.write(self.controller, R::ID, 0, reg.raw());
    }

    /// Read a per-rank register.
    pub fn read_rank<R: Register>(&mut self, rank: Rank) -> R {
        R::from_raw(self.bus.read(self.controller, R::ID, rank.get()))
    }

    /// Write a per-rank register.
    pub fn write_rank<R: Register>(&mut self, rank: Rank, reg: R) {
        self.bus.write(self.controller, R::ID, rank.get(), reg.raw());
    }

    /// Read-modify-write of a controller-wide register.
    pub fn update<R: Register>(&mut self, f: impl FnOnce(R) -> R) {
        let reg = f(self.read::<R>());
        self.write(reg);
    }

    /// Read-modify-write where a field value may not fit; nothing is
    /// written if `f` fails.
    pub fn try_update<R: Register>(
        &mut self,
        f: impl FnOnce(R) -> Result<R, OutOfRangeError>,
    ) -> Result<(), OutOfRangeError> {
        let reg = f(self.read::<R>())?;
        self.write(reg);
        Ok(())
    }

    /// Busy-wait.
    pub fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }

    fn poll(
        &mut self,
        target: PollTarget,
        mut done: impl FnMut(&mut Self) -> bool,
    ) -> Result<(), SequenceTimeout> {
        for _ in 0..self.poll_limit {
            if done(self) {
                return Ok(());
            }
            self.delay.delay_us(1);
        }
        if done(self) {
            Ok(())
        } else {
            Err(SequenceTimeout { target })
        }
    }

    /// Run one internal sequence against `ranks` and wait for completion.
    pub fn run_sequence(&mut self, ranks: RankMask, seq: Sequence) -> Result<(), SequenceTimeout> {
        self.update::<Config>(|c| c.with_sequence_ranks(ranks));
        self.write(SeqCtl::start(seq));
        self.poll(PollTarget::Sequence(seq), |lmc| {
            lmc.read::<SeqCtl>().seq_complete()
        })
    }

    /// Wait for a rank's read-leveling result.
    pub fn wait_rlevel(&mut self, rank: Rank) -> Result<RlevelRank, SequenceTimeout> {
        self.poll(PollTarget::ReadLevelStatus(rank), |lmc| {
            lmc.read_rank::<RlevelRank>(rank).status() == LevelStatus::Complete
        })?;
        Ok(self.read_rank(rank))
    }

    /// Wait for a rank's write-leveling result.
    pub fn wait_wlevel(&mut self, rank: Rank) -> Result<WlevelRank, SequenceTimeout> {
        self.poll(PollTarget::WriteLevelStatus(rank), |lmc| {
            lmc.read_rank::<WlevelRank>(rank).status() == LevelStatus::Complete
        })?;
        Ok(self.read_rank(rank))
    }

    /// Read-leveling pass/fail bitmask of one lane from the last run.
    pub fn rlevel_bitmask(&mut self, lane: ByteLane) -> u64 {
        self.update::<RlevelCtl>(|c| c.with_lane(lane));
        self.read::<RlevelDbg>().bitmask()
    }

    /// Write-leveling sample bitmask of one lane from the last run.
    pub fn wlevel_bitmask(&mut self, lane: ByteLane) -> u8 {
        self.write(WlevelDbg::default().with_lane(lane));
        self.read::<WlevelDbg>().bitmask()
    }

    /// Read one 10-bit word from the PHY debug port; `bit_sel` is
    /// truncated to its 4-bit field.
    pub fn phy_debug_read(&mut self, lane: ByteLane, bit_sel: u8) -> Result<u16, SequenceTimeout> {
        let phy = self
            .read::<PhyCtl>()
            .with_debug_target(lane, u4::new(bit_sel & 0x0f))
            .with_dsk_dbg_rd_start(false);
        self.write(phy);
        self.write(phy.with_dsk_dbg_rd_start(true));
        self.poll(PollTarget::DebugRead, |lmc| {
            lmc.read::<PhyCtl>().dsk_dbg_rd_complete()
        })?;
        Ok(self.read::<PhyCtl>().dsk_dbg_rd_data().value())
    }

    /// Pulse the per-bit deskew reset.
    pub fn reset_deskew(&mut self) {
        self.update::<PhyCtl>(|p| p.with_phy_dsk_reset(true));
        self.delay.delay_us(1);
        self.update::<PhyCtl>(|p| p.with_phy_dsk_reset(false));
    }

    /// Gate all loaded DLL offsets on or off.
    pub fn set_dll_offset_enable(&mut self, on: bool) {
        self.update::<DllCtl3>(|c| c.with_offset_ena(on));
    }

    /// Load a signed DLL offset into one lane, or every lane when `lane` is
    /// `None`. Returns the offset the register now holds.
    pub fn load_dll_offset(
        &mut self,
        mode: DllOffsetMode,
        lane: Option<ByteLane>,
        offset: i8,
    ) -> Result<i8, OutOfRangeError> {
        self.update::<DllCtl3>(|c| c.with_load_offset(false));
        let byte_sel = lane.map_or(DllCtl3::BYTE_SEL_ALL, ByteLane::byte_sel);
        self.try_update::<DllCtl3>(|c| {
            Ok(c.with_mode_sel(mode.code())
                .with_offset(offset)?
                .with_byte_sel(narrow(byte_sel)?))
        })?;
        self.update::<DllCtl3>(|c| c.with_load_offset(true));
        Ok(self.read::<DllCtl3>().offset())
    }

    /// Override one bit's deskew setting or a lane's DAC code.
    pub fn load_bit_override(
        &mut self,
        lane: ByteLane,
        bit_sel: u8,
        data: u16,
    ) -> Result<(), OutOfRangeError> {
        self.update::<DllCtl3>(|c| c.with_wr_deskew_ld(false));
        self.try_update::<DllCtl3>(|c| {
            Ok(c.with_byte_sel(narrow(lane.byte_sel())?)
                .with_bit_select(narrow(bit_sel)?)
                .with_deskew_data(narrow(data)?))
        })?;
        self.update::<DllCtl3>(|c| c.with_wr_deskew_ld(true));
        Ok(())
    }

    /// Write a DRAM mode register of one rank.
    pub fn mode_register_write(&mut self, rank: Rank, mr: u8, addr: u32) -> Result<(), LmcError> {
        let ctl = MrWrCtl::default()
            .with_mr_wr_sel(narrow(mr)?)
            .with_mr_wr_rank(narrow(rank.get())?)
            .with_mr_wr_addr(narrow(addr)?);
        self.write(ctl);
        self.run_sequence(rank.mask(), Sequence::ModeRegisterWrite)?;
        Ok(())
    }

    /// Run a data pattern against one rank and return the failing lanes.
    pub fn run_pattern(&mut self, rank: Rank, pattern: TestPattern) -> LaneMask
    where
        B: PatternTester,
    {
        let controller = self.controller;
        self.bus.run_pattern(controller, rank, pattern)
    }

    /// Reset the chip through the bus.
    pub fn reset(&mut self) -> !
    where
        B: ResetControl,
    {
        self.bus.reset()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::regs::RegisterId;
    use arbitrary_int::u10;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use std::collections::BTreeMap;

    /// Plain register file: sequences complete immediately.
    #[derive(Default)]
    struct RegFile {
        regs: BTreeMap<(RegisterId, u8), u64>,
        writes: Vec<(RegisterId, u8, u64)>,
    }

    impl RegisterAccess for RegFile {
        fn read(&mut self, _controller: u8, id: RegisterId, index: u8) -> u64 {
            let raw = self.regs.get(&(id, index)).copied().unwrap_or(0);
            match id {
                RegisterId::SeqCtl => raw | (1 << 5),
                RegisterId::PhyCtl => raw | (1 << 10),
                _ => raw,
            }
        }

        fn write(&mut self, _controller: u8, id: RegisterId, index: u8, value: u64) {
            self.writes.push((id, index, value));
            self.regs.insert((id, index), value);
        }
    }

    /// A bus that never reports completion.
    struct Stuck;

    impl RegisterAccess for Stuck {
        fn read(&mut self, _: u8, _: RegisterId, _: u8) -> u64 {
            0
        }
        fn write(&mut self, _: u8, _: RegisterId, _: u8, _: u64) {}
    }

    #[test]
    fn failed_update_writes_nothing() {
        use crate::regs::{narrow, TimingParams0};

        let mut lmc = Lmc::new(RegFile::default(), NoopDelay::new(), 0);
        lmc.try_update::<TimingParams0>(|p| Ok(p.with_trcd(narrow(20)?).with_trfc(0x80)))
            .unwrap();
        let err = lmc
            .try_update::<TimingParams0>(|p| Ok(p.with_trcd(narrow(40)?)))
            .unwrap_err();
        assert_eq!((err.value, err.max), (40, 31));

        let (bus, _) = lmc.release();
        assert_eq!(bus.writes.len(), 1);
        let params = TimingParams0::from_raw(bus.regs[&(RegisterId::TimingParams0, 0)]);
        assert_eq!(params.trcd().value(), 20);
        assert_eq!(params.trfc(), 0x80);
    }

    #[test]
    fn sequence_codes_round_trip() {
        for code in 0..12 {
            assert_eq!(Sequence::from_code(code).unwrap().code(), code);
        }
        assert!(Sequence::from_code(12).is_none());
    }

    #[test]
    fn run_sequence_programs_rank_mask_then_starts() {
        let mut lmc = Lmc::new(RegFile::default(), NoopDelay::new(), 0);
        lmc.run_sequence(RankMask::from_bits(0b10), Sequence::ReadLeveling)
            .unwrap();
        let (bus, _) = lmc.release();
        let seq_writes: Vec<_> = bus
            .writes
            .iter()
            .filter(|(id, _, _)| *id == RegisterId::SeqCtl)
            .collect();
        assert_eq!(seq_writes.len(), 1);
        assert_eq!(seq_writes[0].2, 1 | (1 << 1));
        let cfg = Config::from_raw(bus.regs[&(RegisterId::Config, 0)]);
        assert_eq!(cfg.sequence_ranks().bits(), 0b10);
    }

    #[test]
    fn poll_times_out_without_completion() {
        let mut lmc = Lmc::new(Stuck, NoopDelay::new(), 1).with_poll_limit(5);
        let err = lmc
            .run_sequence(RankMask::from_bits(1), Sequence::WriteLeveling)
            .unwrap_err();
        assert_eq!(err.target, PollTarget::Sequence(Sequence::WriteLeveling));
    }

    #[test]
    fn delay_vector_round_trips_through_rlevel_rank() {
        let mut lmc = Lmc::new(RegFile::default(), NoopDelay::new(), 0);
        let rank = Rank::new(2).unwrap();
        let delays = crate::lanes::PerLane([1, 5, 9, 13, 17, 21, 25, 29, 63]);
        lmc.write_rank(rank, RlevelRank::from_delays(&delays).unwrap());
        assert_eq!(lmc.read_rank::<RlevelRank>(rank).delays(), delays);
        assert_eq!(lmc.wait_rlevel(rank).unwrap().delays(), delays);
    }

    #[test]
    fn dll_offset_load_sequence() {
        let mut lmc = Lmc::new(RegFile::default(), NoopDelay::new(), 0);
        let held = lmc
            .load_dll_offset(DllOffsetMode::Read, Some(ByteLane::new(4).unwrap()), -12)
            .unwrap();
        assert_eq!(held, -12);
        let ctl = lmc.read::<DllCtl3>();
        assert!(ctl.load_offset());
        assert_eq!(ctl.byte_sel().value(), 5);
        assert_eq!(ctl.mode_sel().value(), 2);
    }

    #[test]
    fn mode_register_write_targets_rank() {
        let mut lmc = Lmc::new(RegFile::default(), NoopDelay::new(), 0);
        lmc.mode_register_write(Rank::new(1).unwrap(), 6, 0x99).unwrap();
        let ctl = lmc.read::<MrWrCtl>();
        assert_eq!(ctl.mr_wr_sel().value(), 6);
        assert_eq!(ctl.mr_wr_rank().value(), 1);
        assert_eq!(ctl.mr_wr_addr().value(), 0x99);
    }

    #[test]
    fn phy_debug_read_returns_data_field() {
        let mut bus = RegFile::default();
        let phy = PhyCtl::default().with_dsk_dbg_rd_data(u10::new(0x155));
        bus.regs.insert((RegisterId::PhyCtl, 0), phy.raw());
        let mut lmc = Lmc::new(bus, NoopDelay::new(), 0);
        let word = lmc.phy_debug_read(ByteLane::ECC, 3).unwrap();
        assert_eq!(word, 0x155);
        let phy = lmc.read::<PhyCtl>();
        assert_eq!(phy.dsk_dbg_byte_sel().value(), 8);
        assert_eq!(phy.dsk_dbg_bit_sel().value(), 3);
    }
}
