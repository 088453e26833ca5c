//! Byte-lane and rank newtypes.
//!
//! These wrappers keep lane and rank indices inside the ranges the
//! controller supports, so per-lane and per-rank tables can be indexed
//! without bounds checks at every call site:
//! - `ByteLane`: 0–8, lane 8 carries ECC
//! - `Rank`: 0–3 (two DIMM slots, two ranks each)
//! - `RankMask` / `LaneMask`: bitsets over the above
//! - `PerLane<T>` / `PerRank<T>`: fixed tables indexed by the newtypes

use core::ops::{Index, IndexMut};

use arbitrary_int::{u4, u9};

/// Number of byte lanes including ECC.
pub const LANE_COUNT: usize = 9;

/// Number of rank slots on one controller.
pub const MAX_RANKS: usize = 4;

// ── Error type ───────────────────────────────────────────────────────────────

/// Error returned when a value is out of the valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("value {value} outside {min}..={max}")]
pub struct OutOfRangeError {
    /// The value that was out of range.
    pub value: u32,
    /// The inclusive minimum allowed value.
    pub min: u32,
    /// The inclusive maximum allowed value.
    pub max: u32,
}

impl OutOfRangeError {
    pub(crate) fn check(value: u64, max: u64) -> Result<(), Self> {
        if value > max {
            Err(Self {
                value: u32::try_from(value).unwrap_or(u32::MAX),
                min: 0,
                max: u32::try_from(max).unwrap_or(u32::MAX),
            })
        } else {
            Ok(())
        }
    }
}

// ── ByteLane ─────────────────────────────────────────────────────────────────

/// One 8-bit slice of the data bus; lane 8 is the ECC byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct ByteLane(u8);

impl ByteLane {
    /// The ECC byte lane.
    pub const ECC: Self = Self(8);

    /// All nine lanes in bus order.
    pub const ALL: [Self; LANE_COUNT] = [
        Self(0),
        Self(1),
        Self(2),
        Self(3),
        Self(4),
        Self(5),
        Self(6),
        Self(7),
        Self(8),
    ];

    /// Create a lane, returning an error if `index > 8`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfRangeError`] if `index > 8`.
    pub fn new(index: u8) -> Result<Self, OutOfRangeError> {
        OutOfRangeError::check(u64::from(index), 8)?;
        Ok(Self(index))
    }

    /// Lane number (0–8).
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Lane number as a table index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The lane number as a 4-bit register selector.
    #[must_use]
    pub fn nibble(self) -> u4 {
        u4::new(self.0 & 0x0f)
    }

    /// `true` for the ECC lane.
    #[must_use]
    pub const fn is_ecc(self) -> bool {
        self.0 == 8
    }

    /// Hardware byte selector used by `DLL_CTL3` (lane + 1).
    #[must_use]
    pub const fn byte_sel(self) -> u8 {
        self.0.wrapping_add(1)
    }
}

// ── Rank ─────────────────────────────────────────────────────────────────────

/// One chip-select rank on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct Rank(u8);

impl Rank {
    /// All rank slots in order.
    pub const ALL: [Self; MAX_RANKS] = [Self(0), Self(1), Self(2), Self(3)];

    /// Create a rank, returning an error if `index > 3`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfRangeError`] if `index > 3`.
    pub fn new(index: u8) -> Result<Self, OutOfRangeError> {
        OutOfRangeError::check(u64::from(index), 3)?;
        Ok(Self(index))
    }

    /// Rank number (0–3).
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Rank number as a table index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// DIMM slot this rank belongs to (two ranks per slot).
    #[must_use]
    pub const fn dimm(self) -> u8 {
        self.0 >> 1
    }

    /// Single-rank mask.
    #[must_use]
    pub const fn mask(self) -> RankMask {
        RankMask(1 << self.0)
    }
}

// ── RankMask ─────────────────────────────────────────────────────────────────

/// Set of ranks, bit `n` = rank `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct RankMask(u8);

impl RankMask {
    /// No ranks.
    pub const EMPTY: Self = Self(0);

    /// Build a mask from raw bits; bits above rank 3 are dropped.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// The mask as a 4-bit register field.
    #[must_use]
    pub fn nibble(self) -> u4 {
        u4::new(self.0 & 0x0f)
    }

    /// `true` if `rank` is in the set.
    #[must_use]
    pub const fn contains(self, rank: Rank) -> bool {
        self.0 & (1 << rank.0) != 0
    }

    /// Number of ranks in the set.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // at most 4
    pub const fn count(self) -> u8 {
        self.0.count_ones() as u8
    }

    /// `true` if no rank is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest populated rank.
    #[must_use]
    pub fn lowest(self) -> Option<Rank> {
        self.iter().next()
    }

    /// Add a rank.
    #[must_use]
    pub const fn with(self, rank: Rank) -> Self {
        Self(self.0 | (1 << rank.0))
    }

    /// Iterate over the ranks in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = Rank> {
        Rank::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

// ── LaneMask ─────────────────────────────────────────────────────────────────

/// Set of byte lanes, bit `n` = lane `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct LaneMask(u16);

impl LaneMask {
    /// No lanes.
    pub const EMPTY: Self = Self(0);
    /// All nine lanes.
    pub const ALL: Self = Self(0x1ff);

    /// Build a mask from raw bits; bits above lane 8 are dropped.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & 0x1ff)
    }

    /// The mask as a 9-bit register field.
    #[must_use]
    pub fn field(self) -> u9 {
        u9::new(self.0 & 0x1ff)
    }

    /// Lanes present on a bus: 8 data lanes (4 in 32-bit mode) plus ECC.
    #[must_use]
    pub const fn for_bus(ecc: bool, mode32b: bool) -> Self {
        let data = if mode32b { 0x00f } else { 0x0ff };
        Self(if ecc { data | 0x100 } else { data })
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// `true` if `lane` is in the set.
    #[must_use]
    pub const fn contains(self, lane: ByteLane) -> bool {
        self.0 & (1 << lane.0) != 0
    }

    /// Add a lane.
    #[must_use]
    pub const fn with(self, lane: ByteLane) -> Self {
        Self(self.0 | (1 << lane.0))
    }

    /// Remove a lane.
    #[must_use]
    pub const fn without(self, lane: ByteLane) -> Self {
        Self(self.0 & !(1 << lane.0))
    }

    /// Lanes in both sets.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// `true` if no lane is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate over the lanes in the set, in bus order.
    pub fn iter(self) -> impl Iterator<Item = ByteLane> {
        ByteLane::ALL.into_iter().filter(move |l| self.contains(*l))
    }
}

// ── Tables ───────────────────────────────────────────────────────────────────

/// One value per byte lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PerLane<T>(pub [T; LANE_COUNT]);

impl<T: Copy> PerLane<T> {
    /// Table with every lane set to `value`.
    #[must_use]
    pub const fn splat(value: T) -> Self {
        Self([value; LANE_COUNT])
    }

    /// Build a table by evaluating `f` for every lane.
    pub fn from_fn(mut f: impl FnMut(ByteLane) -> T) -> Self {
        Self(ByteLane::ALL.map(&mut f))
    }

    /// Iterate `(lane, value)` pairs in bus order.
    pub fn iter(&self) -> impl Iterator<Item = (ByteLane, T)> + '_ {
        ByteLane::ALL.into_iter().zip(self.0.iter().copied())
    }
}

// Lane indices are bounded by construction, the array always has nine slots.
#[allow(clippy::indexing_slicing)]
impl<T> Index<ByteLane> for PerLane<T> {
    type Output = T;

    fn index(&self, lane: ByteLane) -> &T {
        &self.0[lane.index()]
    }
}

#[allow(clippy::indexing_slicing)]
impl<T> IndexMut<ByteLane> for PerLane<T> {
    fn index_mut(&mut self, lane: ByteLane) -> &mut T {
        &mut self.0[lane.index()]
    }
}

/// One value per rank slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PerRank<T>(pub [T; MAX_RANKS]);

impl<T: Copy> PerRank<T> {
    /// Table with every rank set to `value`.
    #[must_use]
    pub const fn splat(value: T) -> Self {
        Self([value; MAX_RANKS])
    }
}

#[allow(clippy::indexing_slicing)]
impl<T> Index<Rank> for PerRank<T> {
    type Output = T;

    fn index(&self, rank: Rank) -> &T {
        &self.0[rank.index()]
    }
}

#[allow(clippy::indexing_slicing)]
impl<T> IndexMut<Rank> for PerRank<T> {
    fn index_mut(&mut self, rank: Rank) -> &mut T {
        &mut self.0[rank.index()]
    }
}

/// Nine per-lane delay settings for one rank.
pub type DelayVector = PerLane<u8>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn byte_lane_rejects_nine() {
        assert!(ByteLane::new(9).is_err());
        assert_eq!(ByteLane::new(8).unwrap(), ByteLane::ECC);
    }

    #[test]
    fn byte_sel_is_lane_plus_one() {
        assert_eq!(ByteLane::new(0).unwrap().byte_sel(), 1);
        assert_eq!(ByteLane::ECC.byte_sel(), 9);
    }

    #[test]
    fn rank_mask_iterates_lowest_first() {
        let mask = RankMask::from_bits(0b1010);
        let ranks: Vec<u8> = mask.iter().map(Rank::get).collect();
        assert_eq!(ranks, vec![1, 3]);
        assert_eq!(mask.lowest(), Some(Rank::new(1).unwrap()));
        assert_eq!(mask.count(), 2);
    }

    #[test]
    fn rank_mask_drops_high_bits() {
        assert_eq!(RankMask::from_bits(0xf3).bits(), 0x03);
    }

    #[test]
    fn lane_mask_for_bus_variants() {
        assert_eq!(LaneMask::for_bus(true, false).bits(), 0x1ff);
        assert_eq!(LaneMask::for_bus(false, false).bits(), 0x0ff);
        assert_eq!(LaneMask::for_bus(true, true).bits(), 0x10f);
    }

    #[test]
    fn per_lane_indexing_by_newtype() {
        let mut v = PerLane::splat(0u8);
        v[ByteLane::ECC] = 7;
        assert_eq!(v.0[8], 7);
        assert_eq!(v.iter().filter(|(_, d)| *d == 7).count(), 1);
    }

    #[test]
    fn rank_dimm_slot() {
        assert_eq!(Rank::new(0).unwrap().dimm(), 0);
        assert_eq!(Rank::new(3).unwrap().dimm(), 1);
    }
}
