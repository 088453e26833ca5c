//! Error taxonomy of a bring-up.
//!
//! Failures fall in three classes:
//!
//! | Class | Handling |
//! |---|---|
//! | locally recoverable | retried in place by the trainer, never surfaces |
//! | [`RestartCause`] | the whole bring-up is redone by the restart wrapper |
//! | [`FatalCause`] | [`crate::train`] resets the chip |
//!
//! Poll timeouts ([`lmc_hal::SequenceTimeout`]) are logged where they occur
//! and do not appear here.

use lmc_hal::{GeometryError, OutOfRangeError, TimingError};

/// Clock configuration that cannot be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockError {
    /// A clock was reported as 0 Hz.
    #[error("{which} clock is zero")]
    Zero {
        /// Which clock.
        which: &'static str,
    },
    /// The DDR clock is faster than the core clock.
    #[error("DDR clock {ddr_hz} Hz exceeds CPU clock {cpu_hz} Hz")]
    DdrFasterThanCpu {
        /// Effective DDR clock.
        ddr_hz: u32,
        /// Core clock.
        cpu_hz: u32,
    },
}

/// Failure that a fresh bring-up may clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RestartCause {
    /// Deskew never validated within its lock and saturation budgets.
    #[error("deskew unstable after {lock_retries} lock and {saturation_retries} saturation retries")]
    DeskewUnstable {
        /// Lock retries spent.
        lock_retries: u8,
        /// Saturation retries spent.
        saturation_retries: u8,
    },
    /// Write leveling could not produce a consistent vector for a rank.
    #[error("write leveling inconsistent on rank {rank}, lanes {lanes:#x}")]
    WriteLevelingUnstable {
        /// Rank index.
        rank: u8,
        /// Lanes that never settled.
        lanes: u16,
    },
}

/// Failure that requires a chip reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FatalCause {
    /// Clock validation failed.
    #[error("clock: {0}")]
    Clock(ClockError),
    /// DIMM geometry is not addressable.
    #[error("geometry: {0}")]
    Geometry(GeometryError),
    /// Timing constraints do not fit the registers.
    #[error("timing: {0}")]
    Timing(TimingError),
    /// A computed value did not fit its register field.
    #[error("register field: {0}")]
    Register(OutOfRangeError),
    /// Every read-leveling row was skipped or scored infinite for a rank.
    #[error("no viable read-leveling setting on rank {rank}")]
    NoViableReadLevel {
        /// Rank index.
        rank: u8,
    },
    /// Write leveling failed and the configuration asks for a reset.
    #[error("write leveling failed on rank {rank}")]
    WriteLeveling {
        /// Rank index.
        rank: u8,
    },
    /// Restart budget spent.
    #[error("bring-up still failing after {0} restarts")]
    RestartsExhausted(u8),
}

/// Error currency inside a bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrainingError {
    /// Redo the bring-up.
    #[error("restart: {0}")]
    Restart(RestartCause),
    /// Reset the chip.
    #[error("fatal: {0}")]
    Fatal(FatalCause),
}

impl TrainingError {
    /// Whether the restart wrapper may retry.
    pub const fn is_restart(&self) -> bool {
        matches!(self, Self::Restart(_))
    }
}

impl From<RestartCause> for TrainingError {
    fn from(c: RestartCause) -> Self {
        Self::Restart(c)
    }
}

impl From<FatalCause> for TrainingError {
    fn from(c: FatalCause) -> Self {
        Self::Fatal(c)
    }
}

impl From<ClockError> for TrainingError {
    fn from(e: ClockError) -> Self {
        Self::Fatal(FatalCause::Clock(e))
    }
}

impl From<GeometryError> for TrainingError {
    fn from(e: GeometryError) -> Self {
        Self::Fatal(FatalCause::Geometry(e))
    }
}

impl From<TimingError> for TrainingError {
    fn from(e: TimingError) -> Self {
        Self::Fatal(FatalCause::Timing(e))
    }
}

impl From<OutOfRangeError> for TrainingError {
    fn from(e: OutOfRangeError) -> Self {
        Self::Fatal(FatalCause::Register(e))
    }
}

/// Returned by [`crate::train`] when bring-up must be redone by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("restart requested: {cause}")]
pub struct RestartRequested {
    /// Last restart-class failure.
    pub cause: RestartCause,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_pick_the_right_class() {
        let e: TrainingError = GeometryError::RowBits(20).into();
        assert_eq!(e, TrainingError::Fatal(FatalCause::Geometry(GeometryError::RowBits(20))));
        assert!(!e.is_restart());
        let r: TrainingError = RestartCause::WriteLevelingUnstable { rank: 1, lanes: 0x10 }.into();
        assert!(r.is_restart());
    }

    #[test]
    fn display_names_the_rank() {
        let e = FatalCause::NoViableReadLevel { rank: 2 };
        assert_eq!(e.to_string(), "no viable read-leveling setting on rank 2");
    }
}
