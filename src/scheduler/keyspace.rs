//! Keyspace splitting.
//!
//! A wordlist of `total` words is cut into contiguous half-open ranges whose
//! sizes follow the given weights. Shares are computed in integer
//! arithmetic; whatever integer division leaves over goes to the first
//! range, so the ranges always tile `[0, total)` exactly.

use crate::scheduler::KeyspaceRange;

/// Weights are scaled to integers relative to the largest one.
const WEIGHT_SCALE: f64 = 1_000_000.0;

fn sanitize(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        1.0
    }
}

/// Split `[0, total)` into one range per weight, in order.
///
/// Non-positive or non-finite weights count as 1. When `total` is zero or no
/// weights are given the result is a single range covering everything.
/// When there are more weights than words only the first `total` weights
/// get a range, so no range is ever empty.
pub fn split(total: u64, weights: &[f64]) -> Vec<KeyspaceRange> {
    if total == 0 || weights.len() <= 1 {
        return vec![KeyspaceRange::new(0, total)];
    }

    let n = weights.len().min(usize::try_from(total).unwrap_or(usize::MAX));
    let weights: Vec<f64> = weights[..n].iter().copied().map(sanitize).collect();
    let max = weights.iter().copied().fold(f64::MIN, f64::max);

    let scaled: Vec<u128> = weights
        .iter()
        .map(|w| ((w / max) * WEIGHT_SCALE).round().max(1.0) as u128)
        .collect();
    let sum: u128 = scaled.iter().sum();

    let mut shares: Vec<u64> = scaled
        .iter()
        .map(|s| (total as u128 * s / sum) as u64)
        .collect();

    let assigned: u64 = shares.iter().sum();
    shares[0] += total - assigned;

    // Every range gets at least one word, taken from the largest share.
    for i in 0..n {
        if shares[i] == 0 {
            if let Some(donor) = (0..n).filter(|&j| shares[j] > 1).max_by_key(|&j| shares[j]) {
                shares[donor] -= 1;
                shares[i] = 1;
            }
        }
    }

    let mut start = 0;
    shares
        .into_iter()
        .map(|len| {
            let range = KeyspaceRange::new(start, start + len);
            start += len;
            range
        })
        .collect()
}

/// Equal-weight split into `parts` ranges.
pub fn split_even(total: u64, parts: usize) -> Vec<KeyspaceRange> {
    split(total, &vec![1.0; parts.max(1)])
}
