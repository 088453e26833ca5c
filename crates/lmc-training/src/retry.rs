//! Bounded retry bookkeeping.
//!
//! Trainers loop explicitly and ask a [`RetryBudget`] what to do with each
//! outcome:
//!
//! ```rust,ignore
//! let mut budget = RetryBudget::new(3);
//! loop {
//!     match budget.judge(run_once()) {
//!         Attempt::Accept(v) => break Ok(v),
//!         Attempt::Retry => continue,
//!         Attempt::Exhausted => break Err(..),
//!     }
//! }
//! ```

/// Verdict on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Attempt<T> {
    /// The attempt succeeded.
    Accept(T),
    /// Failed; budget remains.
    Retry,
    /// Failed; budget spent.
    Exhausted,
}

/// Retries left for one trainer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryBudget {
    limit: u8,
    used: u8,
}

impl RetryBudget {
    /// Budget allowing `limit` retries after the first attempt.
    pub const fn new(limit: u8) -> Self {
        Self { limit, used: 0 }
    }

    /// Retries consumed so far.
    pub const fn used(&self) -> u8 {
        self.used
    }

    /// Retries still available.
    pub const fn remaining(&self) -> u8 {
        self.limit.saturating_sub(self.used)
    }

    /// Whether a failure now would be final.
    pub const fn is_spent(&self) -> bool {
        self.used >= self.limit
    }

    /// Consume one retry if available.
    pub fn consume(&mut self) -> bool {
        if self.is_spent() {
            false
        } else {
            self.used = self.used.saturating_add(1);
            true
        }
    }

    /// Judge an outcome: `Some` is accepted, `None` costs a retry.
    pub fn judge<T>(&mut self, outcome: Option<T>) -> Attempt<T> {
        match outcome {
            Some(v) => Attempt::Accept(v),
            None if self.consume() => Attempt::Retry,
            None => Attempt::Exhausted,
        }
    }
}
