//! Simulated memory controller for host tests.
//!
//! [`SimLmc`] is a register file that reacts to the writes the training
//! engine makes: starting a sequence runs it immediately and sets
//! `seq_complete`, leveling sequences fill the result registers from
//! user-supplied response closures, the PHY debug port returns deskew words
//! and DAC codes, and DLL-offset loads are tracked per lane. Every
//! side-effecting write is recorded as a [`SimEvent`] so tests can assert on
//! ordering.

#![cfg(any(test, feature = "std"))]
#![allow(clippy::arithmetic_side_effects, clippy::indexing_slicing)]

use std::boxed::Box;
use std::collections::{BTreeMap, BTreeSet};
use std::vec::Vec;

use arbitrary_int::u10;

use crate::controller::{ResetControl, Sequence};
use crate::lanes::{ByteLane, DelayVector, LaneMask, PerLane, PerRank, Rank, RankMask};
use crate::memtest::{PatternTester, TestPattern};
use crate::regs::{
    CompCtl2, Config, DllCtl3, ExtConfig, Int, ModeregParams1, MrWrCtl, PhyCtl, Register,
    RegisterAccess, RegisterId, RlevelCtl, RlevelDbg, RlevelRank, SeqCtl, WlevelCtl, WlevelDbg,
    WlevelRank, PHY_BIT_SEL_DAC,
};

// ── Response shaping ─────────────────────────────────────────────────────────

/// Read-leveling bitmask with a `width`-bit passing window centred on `delay`.
#[must_use]
pub fn rlevel_window(delay: u8, width: u8) -> u64 {
    let width = u32::from(width.clamp(1, 63));
    let start = u32::from(delay).saturating_sub((width - 1) / 2);
    let ones = (1u64 << width) - 1;
    ones.checked_shl(start).unwrap_or(0)
}

/// Write-leveling sample bitmask with a single clean edge at `delay`.
#[must_use]
pub fn perfect_wlevel_bitmask(delay: u8) -> u8 {
    0x0f_u8.rotate_left(u32::from(delay & 7))
}

/// PHY debug word of one deskewed bit.
#[must_use]
pub fn deskew_word(setting: u8, locked: bool) -> u16 {
    (u16::from(setting & 0x7f) << 3) | u16::from(locked)
}

// ── Queries passed to response closures ──────────────────────────────────────

/// One read-leveling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlevelQuery {
    /// Controller index.
    pub controller: u8,
    /// Rank being leveled.
    pub rank: Rank,
    /// RTT_NOM encoding programmed for the rank.
    pub rtt_nom: u8,
    /// Controller read ODT encoding.
    pub rodt_ctl: u8,
    /// Runs on this controller so far.
    pub run: u32,
}

/// One hardware write-leveling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlevelQuery {
    /// Controller index.
    pub controller: u8,
    /// Rank being leveled.
    pub rank: Rank,
    /// Rounds run on this rank so far.
    pub round: u32,
}

/// Result of one hardware write-leveling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlevelRound {
    /// Delay the hardware chose per lane.
    pub delays: DelayVector,
    /// Raw sample bitmask per lane.
    pub bitmasks: PerLane<u8>,
}

impl WlevelRound {
    /// Every lane at its delay with a clean bitmask.
    #[must_use]
    pub fn perfect(delays: DelayVector) -> Self {
        Self {
            delays,
            bitmasks: PerLane::from_fn(|lane| perfect_wlevel_bitmask(delays[lane])),
        }
    }
}

/// One deskew training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeskewQuery {
    /// Controller index.
    pub controller: u8,
    /// Runs on this controller so far.
    pub attempt: u32,
}

/// One internal VREF training run, per lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacQuery {
    /// Controller index.
    pub controller: u8,
    /// Lane whose DAC code is produced.
    pub lane: ByteLane,
    /// VREF runs on this controller so far.
    pub sample: u32,
}

/// One live pattern test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternQuery {
    /// Controller index.
    pub controller: u8,
    /// Rank under test.
    pub rank: Rank,
    /// Pattern driven.
    pub pattern: TestPattern,
    /// Write-leveling delays currently programmed for the rank.
    pub wlevel: DelayVector,
    /// Read-leveling delays currently programmed for the rank.
    pub rlevel: DelayVector,
    /// Effective write DLL offsets.
    pub write_offsets: PerLane<i8>,
    /// Effective read DLL offsets.
    pub read_offsets: PerLane<i8>,
}

type RlevelFn = Box<dyn FnMut(&RlevelQuery) -> PerLane<u64>>;
type WlevelFn = Box<dyn FnMut(&WlevelQuery) -> WlevelRound>;
type DeskewFn = Box<dyn FnMut(&DeskewQuery) -> PerLane<[u16; 9]>>;
type DacFn = Box<dyn FnMut(&DacQuery) -> u16>;
type PatternFn = Box<dyn FnMut(&PatternQuery) -> LaneMask>;

// ── Events ───────────────────────────────────────────────────────────────────

/// Side effect observed by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// An internal sequence ran.
    Sequence {
        /// Controller index.
        controller: u8,
        /// Which sequence.
        seq: Sequence,
        /// Targeted ranks.
        ranks: RankMask,
    },
    /// A mode register was written.
    ModeRegisterWrite {
        /// Controller index.
        controller: u8,
        /// Target rank.
        rank: u8,
        /// Mode register number.
        mr: u8,
        /// Address bits.
        addr: u32,
    },
    /// A DLL offset was loaded.
    DllOffset {
        /// Controller index.
        controller: u8,
        /// 1 = write, 2 = read.
        mode_sel: u8,
        /// Lane + 1, or 10 for all lanes.
        byte_sel: u8,
        /// Signed offset.
        offset: i8,
    },
    /// DLL offsets were gated on or off.
    DllOffsetEnable {
        /// Controller index.
        controller: u8,
        /// New state.
        on: bool,
    },
    /// A per-bit deskew or DAC override was loaded.
    BitOverride {
        /// Controller index.
        controller: u8,
        /// Lane + 1.
        byte_sel: u8,
        /// Bit selector.
        bit_sel: u8,
        /// Value.
        data: u16,
    },
    /// Deskew state machines were reset.
    DeskewReset {
        /// Controller index.
        controller: u8,
    },
    /// A pattern test ran.
    Pattern {
        /// Controller index.
        controller: u8,
        /// Rank under test.
        rank: Rank,
        /// Failing lanes reported.
        failed: LaneMask,
    },
}

// ── Simulator ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ControllerState {
    rlevel_bitmasks: PerLane<u64>,
    wlevel_bitmasks: PerLane<u8>,
    deskew_words: PerLane<[u16; 9]>,
    dac_codes: PerLane<u16>,
    write_offsets: PerLane<i8>,
    read_offsets: PerLane<i8>,
    rlevel_runs: u32,
    wlevel_rounds: PerRank<u32>,
    deskew_runs: u32,
    vref_runs: u32,
}

/// Known-good behaviour used by [`SimLmc::healthy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimProfile {
    /// Read delay each rank levels to.
    pub rlevel: PerRank<DelayVector>,
    /// Passing-window width of every read-leveling bitmask.
    pub rlevel_width: u8,
    /// Write delay each rank levels to.
    pub wlevel: PerRank<DelayVector>,
    /// Deskew setting of every bit.
    pub deskew_setting: u8,
    /// DAC code of every lane.
    pub dac_code: u16,
    /// Passing DLL offsets, inclusive.
    pub dll_window: (i8, i8),
}

impl Default for SimProfile {
    fn default() -> Self {
        let rlevel = PerLane([20, 20, 21, 21, 22, 22, 23, 23, 21]);
        let wlevel = PerLane([4, 4, 6, 6, 8, 8, 10, 10, 6]);
        Self {
            rlevel: PerRank::splat(rlevel),
            rlevel_width: 5,
            wlevel: PerRank::splat(wlevel),
            deskew_setting: 64,
            dac_code: 0x40,
            dll_window: (-20, 20),
        }
    }
}

/// Simulated LMC.
pub struct SimLmc {
    regs: BTreeMap<(u8, RegisterId, u8), u64>,
    state: BTreeMap<u8, ControllerState>,
    stalled: BTreeSet<u8>,
    /// Every side effect, oldest first.
    pub events: Vec<SimEvent>,
    rlevel: RlevelFn,
    wlevel: WlevelFn,
    deskew: DeskewFn,
    dac: DacFn,
    pattern: PatternFn,
}

impl Default for SimLmc {
    fn default() -> Self {
        Self::healthy(SimProfile::default())
    }
}

impl SimLmc {
    /// Simulator that levels cleanly to `profile`.
    #[must_use]
    pub fn healthy(profile: SimProfile) -> Self {
        let rl = profile.rlevel;
        let width = profile.rlevel_width;
        let wl = profile.wlevel;
        let word = deskew_word(profile.deskew_setting, true);
        let dac = profile.dac_code;
        let (lo, hi) = profile.dll_window;
        Self {
            regs: BTreeMap::new(),
            state: BTreeMap::new(),
            stalled: BTreeSet::new(),
            events: Vec::new(),
            rlevel: Box::new(move |q: &RlevelQuery| {
                let delays = rl[q.rank];
                PerLane::from_fn(|lane| rlevel_window(delays[lane], width))
            }),
            wlevel: Box::new(move |q: &WlevelQuery| WlevelRound::perfect(wl[q.rank])),
            deskew: Box::new(move |_: &DeskewQuery| PerLane::splat([word; 9])),
            dac: Box::new(move |_: &DacQuery| dac),
            pattern: Box::new(move |q: &PatternQuery| {
                let expected = wl[q.rank];
                ByteLane::ALL
                    .into_iter()
                    .filter(|lane| {
                        q.wlevel[*lane] != expected[*lane]
                            || !(lo..=hi).contains(&q.write_offsets[*lane])
                            || !(lo..=hi).contains(&q.read_offsets[*lane])
                    })
                    .fold(LaneMask::EMPTY, LaneMask::with)
            }),
        }
    }

    /// Replace the read-leveling response.
    #[must_use]
    pub fn on_rlevel(mut self, f: impl FnMut(&RlevelQuery) -> PerLane<u64> + 'static) -> Self {
        self.rlevel = Box::new(f);
        self
    }

    /// Replace the hardware write-leveling response.
    #[must_use]
    pub fn on_wlevel(mut self, f: impl FnMut(&WlevelQuery) -> WlevelRound + 'static) -> Self {
        self.wlevel = Box::new(f);
        self
    }

    /// Replace the deskew response (8 data bits plus DBI per lane).
    #[must_use]
    pub fn on_deskew(
        mut self,
        f: impl FnMut(&DeskewQuery) -> PerLane<[u16; 9]> + 'static,
    ) -> Self {
        self.deskew = Box::new(f);
        self
    }

    /// Replace the DAC code response.
    #[must_use]
    pub fn on_dac(mut self, f: impl FnMut(&DacQuery) -> u16 + 'static) -> Self {
        self.dac = Box::new(f);
        self
    }

    /// Replace the pattern-test oracle.
    #[must_use]
    pub fn on_pattern(mut self, f: impl FnMut(&PatternQuery) -> LaneMask + 'static) -> Self {
        self.pattern = Box::new(f);
        self
    }

    /// Never complete `seq`.
    #[must_use]
    pub fn stall(mut self, seq: Sequence) -> Self {
        self.stalled.insert(seq.code());
        self
    }

    /// Set a register without side effects.
    pub fn preset(&mut self, controller: u8, id: RegisterId, index: u8, value: u64) {
        self.regs.insert((controller, id, index), value);
    }

    /// Current raw value of a register.
    #[must_use]
    pub fn peek(&self, controller: u8, id: RegisterId, index: u8) -> u64 {
        self.regs.get(&(controller, id, index)).copied().unwrap_or(0)
    }

    /// Current typed value of a per-rank register.
    #[must_use]
    pub fn peek_rank<R: Register>(&self, controller: u8, rank: Rank) -> R {
        R::from_raw(self.peek(controller, R::ID, rank.get()))
    }

    /// Number of sequences of one kind run on `controller`.
    #[must_use]
    pub fn sequence_count(&self, controller: u8, seq: Sequence) -> usize {
        self.events
            .iter()
            .filter(|e| {
                matches!(e, SimEvent::Sequence { controller: c, seq: s, .. }
                    if *c == controller && *s == seq)
            })
            .count()
    }

    /// Effective DLL offsets of `controller`: `(write, read)`.
    #[must_use]
    pub fn dll_offsets(&self, controller: u8) -> (PerLane<i8>, PerLane<i8>) {
        self.state
            .get(&controller)
            .map_or((PerLane::splat(0), PerLane::splat(0)), |s| {
                (s.write_offsets, s.read_offsets)
            })
    }

    fn reg<R: Register>(&self, controller: u8, index: u8) -> R {
        R::from_raw(self.peek(controller, R::ID, index))
    }

    fn store<R: Register>(&mut self, controller: u8, index: u8, reg: R) {
        self.regs.insert((controller, R::ID, index), reg.raw());
    }

    fn run_sequence(&mut self, controller: u8, seq: Sequence) {
        let ranks = self.reg::<Config>(controller, 0).sequence_ranks();
        self.events.push(SimEvent::Sequence {
            controller,
            seq,
            ranks,
        });
        match seq {
            Sequence::PowerUpInit => {
                let cfg = self.reg::<Config>(controller, 0);
                let done = RankMask::from_bits(cfg.init_ranks().bits() | ranks.bits());
                self.store(controller, 0, cfg.with_init_ranks(done));
            }
            Sequence::ReadLeveling => {
                for rank in ranks.iter() {
                    self.read_level(controller, rank);
                }
            }
            Sequence::WriteLeveling => {
                for rank in ranks.iter() {
                    self.write_level(controller, rank);
                }
            }
            Sequence::DeskewOrVref => {
                if self.reg::<ExtConfig>(controller, 0).vrefint_seq_deskew() {
                    self.deskew_train(controller);
                } else {
                    self.vref_train(controller);
                }
            }
            Sequence::ModeRegisterWrite => {
                let ctl = self.reg::<MrWrCtl>(controller, 0);
                self.events.push(SimEvent::ModeRegisterWrite {
                    controller,
                    rank: ctl.mr_wr_rank().value(),
                    mr: ctl.mr_wr_sel().value(),
                    addr: ctl.mr_wr_addr().value(),
                });
            }
            _ => {}
        }
    }

    fn read_level(&mut self, controller: u8, rank: Rank) {
        let rtt_nom = self.reg::<ModeregParams1>(controller, 0).rank_rtt_nom(rank);
        let rodt_ctl = self.reg::<CompCtl2>(controller, 0).rodt_ctl().value();
        let state = self.state.entry(controller).or_default();
        let query = RlevelQuery {
            controller,
            rank,
            rtt_nom,
            rodt_ctl,
            run: state.rlevel_runs,
        };
        state.rlevel_runs += 1;
        let masks = (self.rlevel)(&query);
        let mut result = RlevelRank::default();
        for (lane, mask) in masks.iter() {
            let centre = if mask == 0 {
                0
            } else {
                let first = mask.trailing_zeros();
                let last = 63 - mask.leading_zeros();
                u8::try_from((first + last) / 2).unwrap_or(0)
            };
            result = result
                .with_delay(lane, centre.min(RlevelRank::MAX_DELAY))
                .unwrap_or(result);
        }
        let result = result.with_status(crate::regs::LevelStatus::Complete);
        if let Some(state) = self.state.get_mut(&controller) {
            state.rlevel_bitmasks = masks;
        }
        self.store(controller, rank.get(), result);
    }

    fn write_level(&mut self, controller: u8, rank: Rank) {
        let lanes = self.reg::<WlevelCtl>(controller, 0).lanes();
        let lanes = if lanes.is_empty() { LaneMask::ALL } else { lanes };
        let state = self.state.entry(controller).or_default();
        let query = WlevelQuery {
            controller,
            rank,
            round: state.wlevel_rounds[rank],
        };
        state.wlevel_rounds[rank] += 1;
        let round = (self.wlevel)(&query);
        let mut result = self.reg::<WlevelRank>(controller, rank.get());
        for lane in lanes.iter() {
            result = result
                .with_delay(lane, round.delays[lane].min(WlevelRank::MAX_DELAY))
                .unwrap_or(result);
        }
        let result = result.with_status(crate::regs::LevelStatus::Complete);
        if let Some(state) = self.state.get_mut(&controller) {
            state.wlevel_bitmasks = round.bitmasks;
        }
        self.store(controller, rank.get(), result);
    }

    fn deskew_train(&mut self, controller: u8) {
        let state = self.state.entry(controller).or_default();
        let query = DeskewQuery {
            controller,
            attempt: state.deskew_runs,
        };
        state.deskew_runs += 1;
        let words = (self.deskew)(&query);
        if let Some(state) = self.state.get_mut(&controller) {
            state.deskew_words = words;
        }
    }

    fn vref_train(&mut self, controller: u8) {
        let state = self.state.entry(controller).or_default();
        let sample = state.vref_runs;
        state.vref_runs += 1;
        let codes = PerLane::from_fn(|lane| {
            (self.dac)(&DacQuery {
                controller,
                lane,
                sample,
            })
        });
        if let Some(state) = self.state.get_mut(&controller) {
            state.dac_codes = codes;
        }
    }

    fn debug_read(&mut self, controller: u8, phy: PhyCtl) -> PhyCtl {
        let state = self.state.entry(controller).or_default();
        let data = ByteLane::new(phy.dsk_dbg_byte_sel().value()).map_or(0, |lane| {
            let bit = phy.dsk_dbg_bit_sel().value();
            if bit == PHY_BIT_SEL_DAC {
                state.dac_codes[lane]
            } else {
                state.deskew_words[lane]
                    .get(usize::from(bit))
                    .copied()
                    .unwrap_or(0)
            }
        });
        phy.with_dsk_dbg_rd_data(u10::new(data & 0x3ff))
            .with_dsk_dbg_rd_complete(true)
    }

    fn write_dll_ctl3(&mut self, controller: u8, prev: DllCtl3, next: DllCtl3) {
        let mode_sel = next.mode_sel().value();
        let byte_sel = next.byte_sel().value();
        let bit_sel = next.bit_select().value();
        let data = next.deskew_data().value();
        if next.load_offset() && !prev.load_offset() {
            self.events.push(SimEvent::DllOffset {
                controller,
                mode_sel,
                byte_sel,
                offset: next.offset(),
            });
            let state = self.state.entry(controller).or_default();
            let table = match mode_sel {
                1 => Some(&mut state.write_offsets),
                2 => Some(&mut state.read_offsets),
                _ => None,
            };
            if let Some(table) = table {
                if byte_sel == DllCtl3::BYTE_SEL_ALL {
                    *table = PerLane::splat(next.offset());
                } else if let Some(lane) = byte_sel
                    .checked_sub(1)
                    .and_then(|l| ByteLane::new(l).ok())
                {
                    table[lane] = next.offset();
                }
            }
        }
        if next.offset_ena() != prev.offset_ena() {
            self.events.push(SimEvent::DllOffsetEnable {
                controller,
                on: next.offset_ena(),
            });
        }
        if next.wr_deskew_ld() && !prev.wr_deskew_ld() {
            self.events.push(SimEvent::BitOverride {
                controller,
                byte_sel,
                bit_sel,
                data,
            });
            if bit_sel == PHY_BIT_SEL_DAC {
                if let Some(lane) = byte_sel.checked_sub(1).and_then(|l| ByteLane::new(l).ok()) {
                    self.state.entry(controller).or_default().dac_codes[lane] = data;
                }
            }
        }
    }
}

impl RegisterAccess for SimLmc {
    fn read(&mut self, controller: u8, id: RegisterId, index: u8) -> u64 {
        let raw = self.peek(controller, id, index);
        match id {
            RegisterId::RlevelDbg => {
                let lane = ByteLane::new(self.reg::<RlevelCtl>(controller, 0).byte().value())
                    .unwrap_or(ByteLane::ECC);
                let mask = self
                    .state
                    .get(&controller)
                    .map_or(0, |s| s.rlevel_bitmasks[lane]);
                RlevelDbg::from_raw(mask).raw()
            }
            RegisterId::WlevelDbg => {
                let dbg = WlevelDbg::from_raw(raw);
                match (ByteLane::new(dbg.byte().value()), self.state.get(&controller)) {
                    (Ok(lane), Some(state)) => dbg.with_bitmask(state.wlevel_bitmasks[lane]).raw(),
                    _ => raw,
                }
            }
            _ => raw,
        }
    }

    fn write(&mut self, controller: u8, id: RegisterId, index: u8, value: u64) {
        let prev = self.peek(controller, id, index);
        match id {
            RegisterId::SeqCtl => {
                let mut ctl = SeqCtl::from_raw(value);
                if ctl.init_start() {
                    ctl = ctl.with_init_start(false).with_seq_complete(false);
                    if let Some(seq) = Sequence::from_code(ctl.seq_sel().value()) {
                        if !self.stalled.contains(&seq.code()) {
                            self.run_sequence(controller, seq);
                            ctl = ctl.with_seq_complete(true);
                        }
                    }
                }
                self.store(controller, 0, ctl);
            }
            RegisterId::PhyCtl => {
                let before = PhyCtl::from_raw(prev);
                let mut phy = PhyCtl::from_raw(value);
                if phy.phy_dsk_reset() && !before.phy_dsk_reset() {
                    self.events.push(SimEvent::DeskewReset { controller });
                }
                if phy.dsk_dbg_rd_start() && !before.dsk_dbg_rd_start() {
                    phy = self.debug_read(controller, phy);
                } else if !phy.dsk_dbg_rd_start() {
                    phy = phy.with_dsk_dbg_rd_complete(false);
                }
                self.store(controller, 0, phy);
            }
            RegisterId::DllCtl3 => {
                self.write_dll_ctl3(controller, DllCtl3::from_raw(prev), DllCtl3::from_raw(value));
                self.regs.insert((controller, id, index), value);
            }
            RegisterId::Int => {
                self.store(controller, 0, Int::from_raw(prev & !value));
            }
            _ => {
                self.regs.insert((controller, id, index), value);
            }
        }
    }
}

impl PatternTester for SimLmc {
    fn run_pattern(&mut self, controller: u8, rank: Rank, pattern: TestPattern) -> LaneMask {
        let ena = self.reg::<DllCtl3>(controller, 0).offset_ena();
        let (write_offsets, read_offsets) = if ena {
            self.dll_offsets(controller)
        } else {
            (PerLane::splat(0), PerLane::splat(0))
        };
        let query = PatternQuery {
            controller,
            rank,
            pattern,
            wlevel: self.reg::<WlevelRank>(controller, rank.get()).delays(),
            rlevel: self.reg::<RlevelRank>(controller, rank.get()).delays(),
            write_offsets,
            read_offsets,
        };
        let failed = (self.pattern)(&query);
        self.events.push(SimEvent::Pattern {
            controller,
            rank,
            failed,
        });
        failed
    }
}

impl ResetControl for SimLmc {
    #[allow(clippy::panic)]
    fn reset(&mut self) -> ! {
        panic!("chip reset requested");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::controller::Lmc;
    use crate::regs::DllOffsetMode;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    #[test]
    fn rlevel_window_is_centred() {
        assert_eq!(rlevel_window(4, 5), 0b1_1111 << 2);
        assert_eq!(rlevel_window(1, 5), 0b1_1111);
    }

    #[test]
    fn perfect_bitmask_rotates_with_delay() {
        assert_eq!(perfect_wlevel_bitmask(0), 0x0f);
        assert_eq!(perfect_wlevel_bitmask(2), 0x3c);
        assert_eq!(perfect_wlevel_bitmask(6), 0xc3);
    }

    #[test]
    fn read_leveling_fills_rank_and_debug_bitmasks() {
        let mut sim = SimLmc::default();
        let mut lmc = Lmc::new(&mut sim, NoopDelay::new(), 0);
        let rank = Rank::new(1).unwrap();
        lmc.run_sequence(rank.mask(), Sequence::ReadLeveling).unwrap();
        let result = lmc.wait_rlevel(rank).unwrap();
        assert_eq!(result.delay(ByteLane::new(0).unwrap()), 20);
        assert_eq!(lmc.rlevel_bitmask(ByteLane::ECC), rlevel_window(21, 5));
    }

    #[test]
    fn stalled_sequence_never_completes() {
        let mut sim = SimLmc::default().stall(Sequence::WriteLeveling);
        let mut lmc = Lmc::new(&mut sim, NoopDelay::new(), 0).with_poll_limit(3);
        assert!(lmc
            .run_sequence(RankMask::from_bits(1), Sequence::WriteLeveling)
            .is_err());
    }

    #[test]
    fn dll_offsets_track_loads() {
        let mut sim = SimLmc::default();
        {
            let mut lmc = Lmc::new(&mut sim, NoopDelay::new(), 0);
            lmc.load_dll_offset(DllOffsetMode::Write, None, 3).unwrap();
            lmc.load_dll_offset(DllOffsetMode::Write, Some(ByteLane::ECC), -2)
                .unwrap();
        }
        let (write, read) = sim.dll_offsets(0);
        assert_eq!(write[ByteLane::new(0).unwrap()], 3);
        assert_eq!(write[ByteLane::ECC], -2);
        assert_eq!(read, PerLane::splat(0));
    }

    #[test]
    fn interrupt_status_is_write_one_to_clear() {
        let mut sim = SimLmc::default();
        sim.preset(0, RegisterId::Int, 0, 0b110);
        sim.write(0, RegisterId::Int, 0, 0b010);
        assert_eq!(sim.peek(0, RegisterId::Int, 0), 0b100);
    }

    #[test]
    #[should_panic(expected = "chip reset requested")]
    fn reset_panics() {
        let mut sim = SimLmc::default();
        sim.reset();
    }
}
