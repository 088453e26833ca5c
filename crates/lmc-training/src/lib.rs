//! DDR3/DDR4 memory-controller link training.
//!
//! Brings one LMC from reset to a trained, sized memory interface.
//!
//! # Architecture
//!
//! ```text
//! sequencer::train()         (clocks, base config, init, restart wrapper)
//!         ↓
//! vref → deskew → wlevel → rlevel → dll_offset   (trainers, in order)
//!         ↓
//! TrainingContext            (board facts, resolved config, results)
//!         ↓
//! lmc_hal::Lmc               (registers, sequences, pattern tests)
//! ```
//!
//! Every trainer takes the controller handle and the context, and either
//! records its outcome in [`TrainingResults`] or returns a
//! [`TrainingError`]. Restart-class errors rerun the bring-up; fatal ones
//! reset the chip.
//!
//! # Features
//!
//! - `std` - host builds; pulls in the simulated controller for tests
//! - `defmt` - on-target logging and `defmt::Format` derives
//! - `tracing` - host logging
//!
//! # Example
//!
//! ```rust,ignore
//! let mut lmc = Lmc::new(bus, delay, 0);
//! let request = TrainRequest {
//!     requested_clock_hz: 1_200_000_000,
//!     cpu_clock_hz: 2_000_000_000,
//!     reference_clock_hz: 100_000_000,
//!     active_controller_mask: 0b1,
//!     ..TrainRequest::default()
//! };
//! let size_mb = lmc_training::train(&mut lmc, &board, &request)?;
//! ```

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_code)]
// Logging discipline
#![warn(clippy::print_stdout)]
#![warn(clippy::dbg_macro)]
// Intentional allows for this codebase:
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)] // register names in doc comments
#![allow(clippy::similar_names)] // rtt_nom / rodt, lo / hi
#![allow(clippy::cast_lossless)]

mod log;

pub mod config;
pub mod context;
pub mod deskew;
pub mod dll_offset;
pub mod error;
pub mod mode_regs;
pub mod retry;
pub mod rlevel;
pub mod sequencer;
pub mod vref;
pub mod wlevel;

pub use config::{ResolvedConfig, TrainingConfig, WlevelFailureAction};
pub use context::{TrainingContext, TrainingResults};
pub use error::{ClockError, FatalCause, RestartCause, RestartRequested, TrainingError};
pub use retry::{Attempt, RetryBudget};
pub use sequencer::{train, TrainRequest};

