//! Silicon revision.
//!
//! Several training budgets and workarounds depend on the chip pass. Early
//! (pass 1.x) parts need the ECC write-level workaround and have tighter
//! deskew retry budgets.

use core::fmt;

/// Chip pass number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SiliconRevision {
    /// Major pass.
    pub major: u8,
    /// Minor pass.
    pub minor: u8,
}

impl SiliconRevision {
    /// Pass 1.0.
    pub const PASS1_0: Self = Self { major: 1, minor: 0 };
    /// Pass 1.1.
    pub const PASS1_1: Self = Self { major: 1, minor: 1 };
    /// Pass 2.0.
    pub const PASS2_0: Self = Self { major: 2, minor: 0 };

    /// Pass 1.x parts.
    #[must_use]
    pub const fn is_early(self) -> bool {
        self.major < 2
    }
}

impl fmt::Display for SiliconRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass {}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_one_is_early() {
        assert!(SiliconRevision::PASS1_0.is_early());
        assert!(SiliconRevision::PASS1_1.is_early());
        assert!(!SiliconRevision::PASS2_0.is_early());
        assert!(SiliconRevision::PASS1_1 < SiliconRevision::PASS2_0);
    }
}
