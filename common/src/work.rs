//! Cumulative proof-of-work and compact target arithmetic.

use crate::block::Block;
use dashu_int::UBig;
use std::{fmt, iter::Sum, ops::Add};

/// Cumulative proof-of-work over a chain segment.
///
/// Totally ordered; the only operations the organizer relies on are
/// addition and comparison.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Work(UBig);

impl Work {
    pub fn zero() -> Self {
        Self(UBig::ZERO)
    }

    /// Expected number of hashes to meet the compact target `bits`:
    /// `2^256 / (target + 1)`. Invalid targets contribute nothing.
    pub fn from_bits(bits: u32) -> Self {
        match compact_to_target(bits) {
            Some(target) => Self((UBig::ONE << 256) / (target + UBig::ONE)),
            None => Self::zero(),
        }
    }

    /// Sum of the header work of every block in `blocks`.
    pub fn of<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Self {
        blocks.into_iter().map(|b| Self::from_bits(b.header.bits)).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == UBig::ZERO
    }
}

impl Default for Work {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u64> for Work {
    fn from(value: u64) -> Self {
        Self(UBig::from(value))
    }
}

impl Add for Work {
    type Output = Work;

    fn add(self, rhs: Work) -> Work {
        Work(self.0 + rhs.0)
    }
}

impl Sum for Work {
    fn sum<I: Iterator<Item = Work>>(iter: I) -> Self {
        iter.fold(Work::zero(), |acc, w| acc + w)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Work({})", self.0)
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expand a compact target into its 256-bit value.
///
/// Returns `None` for negative, zero or overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<UBig> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let negative = bits & 0x0080_0000 != 0;

    if mantissa == 0 || negative {
        return None;
    }
    let overflow = exponent > 34
        || (mantissa > 0xff && exponent > 33)
        || (mantissa > 0xffff && exponent > 32);
    if overflow {
        return None;
    }

    let target = if exponent <= 3 {
        UBig::from(mantissa >> (8 * (3 - exponent)))
    } else {
        UBig::from(mantissa) << (8 * (exponent - 3))
    };

    if target == UBig::ZERO {
        None
    } else {
        Some(target)
    }
}

/// True when `hash`, read as a little-endian 256-bit integer, does not
/// exceed `target`.
pub fn meets_target(hash: &[u8], target: &UBig) -> bool {
    UBig::from_le_bytes(hash) <= *target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn easiest_regtest_target_is_worth_two_hashes() {
        // target = 0x7fffff << 232, just under 2^255
        assert_eq!(Work::from_bits(0x207fffff), Work::from(2));
    }

    #[test]
    fn bitcoin_genesis_difficulty_work() {
        // 0x1d00ffff is difficulty 1: 2^256 / (0xffff * 2^208 + 1)
        assert_eq!(Work::from_bits(0x1d00ffff), Work::from(0x1_0001_0001));
    }

    #[test]
    fn harder_targets_carry_more_work() {
        assert!(Work::from_bits(0x1f00ffff) > Work::from_bits(0x207fffff));
        assert!(Work::from_bits(0x1d00ffff) > Work::from_bits(0x1f00ffff));
    }

    #[test]
    fn invalid_targets_are_worthless() {
        assert!(Work::from_bits(0).is_zero());
        // sign bit set
        assert!(Work::from_bits(0x04923456).is_zero());
        // overflows 256 bits
        assert!(Work::from_bits(0xff123456).is_zero());
        assert!(compact_to_target(0x01003456).is_none());
    }

    #[test]
    fn small_exponent_shifts_mantissa_down() {
        assert_eq!(compact_to_target(0x01123456), Some(UBig::from(0x12u32)));
        assert_eq!(compact_to_target(0x02123456), Some(UBig::from(0x1234u32)));
    }

    #[test]
    fn work_sums_over_blocks() {
        let blocks = vec![
            Block::genesis(0, 0x207fffff),
            Block::genesis(1, 0x207fffff),
            Block::genesis(2, 0x207fffff),
        ];
        assert_eq!(Work::of(&blocks), Work::from(6));
        assert!(Work::of(&[]).is_zero());
    }

    #[test]
    fn target_comparison_uses_little_endian_hash() {
        let target = UBig::from(0x0100u32);
        let mut hash = [0u8; 32];
        hash[1] = 0x01;
        assert!(meets_target(&hash, &target));
        hash[0] = 0x01;
        assert!(!meets_target(&hash, &target));
    }
}
