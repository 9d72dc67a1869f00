use std::cmp::Reverse;

use serde::{Deserialize, Serialize};

use crate::rational::Ratio;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    /// Whole units of the group total go to the largest fractional remainders.
    #[default]
    LargestRemainder,
    Floor,
}

impl RoundingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundingPolicy::LargestRemainder => "largest_remainder",
            RoundingPolicy::Floor => "floor",
        }
    }
}

/// Rounds the exact draws of one (depot, asset type) group to whole units.
///
/// With [`RoundingPolicy::LargestRemainder`] the result sums to
/// `floor(sum(exact))`; ties between equal remainders go to the earlier entry.
/// The result never exceeds the group's exact total.
pub fn round_group(policy: RoundingPolicy, exact: &[Ratio]) -> Vec<u64> {
    let mut rounded: Vec<u64> = exact.iter().map(Ratio::whole_units).collect();
    if policy == RoundingPolicy::Floor {
        return rounded;
    }

    let total = exact.iter().sum::<Ratio>().whole_units();
    let floored: u64 = rounded.iter().sum();
    let leftover = total.saturating_sub(floored) as usize;
    if leftover == 0 {
        return rounded;
    }

    let mut order: Vec<usize> = (0..exact.len()).collect();
    order.sort_by_key(|&index| (Reverse(exact[index].fract()), index));
    for &index in order.iter().take(leftover) {
        rounded[index] += 1;
    }
    rounded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(num: i128, den: i128) -> Ratio {
        Ratio::new(num, den).unwrap()
    }

    #[test]
    fn largest_remainder_preserves_group_total() {
        let exact = [r(27, 2), r(27, 2)];
        assert_eq!(round_group(RoundingPolicy::LargestRemainder, &exact), vec![14, 13]);
        assert_eq!(round_group(RoundingPolicy::Floor, &exact), vec![13, 13]);
    }

    #[test]
    fn leftover_goes_to_largest_fraction_first() {
        let exact = [r(1, 3), r(5, 6), r(5, 6)];
        // total 2, floors 0 -> two units to the 5/6 entries.
        assert_eq!(round_group(RoundingPolicy::LargestRemainder, &exact), vec![0, 1, 1]);
    }

    #[test]
    fn integral_groups_are_untouched() {
        let exact = [Ratio::from_integer(4), Ratio::from_integer(0)];
        assert_eq!(round_group(RoundingPolicy::LargestRemainder, &exact), vec![4, 0]);
    }
}
