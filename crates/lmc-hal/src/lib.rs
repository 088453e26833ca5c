//! Register-level abstraction of a DDR3/DDR4 memory controller (LMC).
//!
//! This crate is the hardware side of DRAM link training. It knows nothing
//! about training algorithms; it offers the surface they run on.
//!
//! # Layers
//!
//! ```text
//! lmc-training (trainers, sequencer, train())
//!         ↓
//! controller::Lmc  (sequences, poll loops, DLL/deskew loads)
//!         ↓
//! regs            (one typed accessor per named register)
//!         ↓
//! RegisterAccess  (platform-supplied raw read/write)
//! ```
//!
//! # Collaborator traits
//!
//! - [`RegisterAccess`]: raw 64-bit register read/write
//! - [`ParameterProvider`]: DIMM topology, timing and ODT tables
//! - [`PatternTester`]: live data-pattern write/read-back per rank
//! - [`ResetControl`]: whole-chip reset
//!
//! # Features
//!
//! - `std`: host builds; enables the simulated controller in [`mocks`]
//! - `defmt`: `defmt::Format` derives on all public types

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(clippy::unreachable)]
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_code)]
#![warn(clippy::print_stdout)]
// Pedantic lints suppressed for this register-level crate:
#![allow(clippy::doc_markdown)] // register names in doc comments
#![allow(clippy::must_use_candidate)] // register accessors, callers decide
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod controller;
pub mod lanes;
pub mod memtest;
pub mod mocks;
pub mod params;
pub mod regs;
pub mod silicon;

pub use controller::{
    Lmc, LmcError, PollTarget, ResetControl, Sequence, SequenceTimeout, INIT_SETTLE_US,
    SEQUENCE_POLL_LIMIT,
};
pub use lanes::{
    ByteLane, DelayVector, LaneMask, OutOfRangeError, PerLane, PerRank, Rank, RankMask,
    LANE_COUNT, MAX_RANKS,
};
pub use memtest::{PatternTester, TestPattern};
pub use params::{
    BoardConfig, CustomDllOffsets, DimmTopology, DramType, GeometryError, ImpedanceTables,
    ModuleKind, OdtConfig, OdtTable, ParameterProvider, RankTopology, TimingCycles, TimingError,
    TimingParams,
};
pub use regs::{Register, RegisterAccess, RegisterId};
pub use silicon::SiliconRevision;
