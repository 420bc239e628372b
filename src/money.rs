//! Integer-cent money helpers.
//!
//! Amounts are persisted as REAL (two decimals) but every allocation is done
//! in cents so that split amounts always add back up to the original total.

/// Largest quantity one line or stock change may carry.
pub const MAX_QUANTITY: i64 = 1_000_000;

pub const OUT_OF_RANGE: &str = "amount out of range";

/// Convert a decimal amount to integer cents (half away from zero).
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Convert integer cents back to a decimal amount.
pub fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Round a decimal amount to two places.
pub fn round2(amount: f64) -> f64 {
    from_cents(to_cents(amount))
}

/// `unit_cents * quantity`, failing instead of overflowing.
pub fn line_cents(unit_cents: i64, quantity: i64) -> Result<i64, String> {
    unit_cents.checked_mul(quantity).ok_or_else(|| OUT_OF_RANGE.to_string())
}

/// Sum of cent amounts, failing instead of overflowing.
pub fn sum_cents<I: IntoIterator<Item = i64>>(amounts: I) -> Result<i64, String> {
    amounts
        .into_iter()
        .try_fold(0i64, |acc, c| acc.checked_add(c))
        .ok_or_else(|| OUT_OF_RANGE.to_string())
}

/// `round(a * b / c)` on non-negative integers without going through floats.
fn mul_div_round(a: i64, b: i64, c: i64) -> i64 {
    if c == 0 {
        return 0;
    }
    let num = a as i128 * b as i128;
    ((num + (c as i128) / 2) / c as i128) as i64
}

/// Split `total_cents` across `weights` proportionally (largest remainder).
///
/// The returned shares always sum to `total_cents`. Zero total weight yields
/// all-zero shares. Ties on the remainder go to the earliest index.
pub fn allocate_proportional(total_cents: i64, weights: &[i64]) -> Vec<i64> {
    let weight_sum: i64 = weights.iter().copied().filter(|w| *w > 0).sum();
    if weight_sum == 0 || total_cents == 0 {
        return vec![0; weights.len()];
    }

    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    let mut allocated = 0i64;
    for (idx, w) in weights.iter().enumerate() {
        let w = (*w).max(0) as i128;
        let num = total_cents as i128 * w;
        let share = (num / weight_sum as i128) as i64;
        let rem = (num % weight_sum as i128) as i64;
        shares.push(share);
        remainders.push((idx, rem));
        allocated += share;
    }

    let mut leftover = total_cents - allocated;
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (idx, _) in remainders {
        if leftover <= 0 {
            break;
        }
        shares[idx] += 1;
        leftover -= 1;
    }
    shares
}

/// Refund owed for returning `quantity` more units of a line.
///
/// `net_cents` is the line net (after discount allocation) for `sold` units,
/// `prev_quantity` the units already claimed by earlier returns, and
/// `prev_refund_cents` what those returns already claimed. The cumulative
/// target is re-rounded each time, so returning the last unit settles the
/// line to exactly `net_cents`.
pub fn prorated_refund(
    net_cents: i64,
    sold: i64,
    prev_quantity: i64,
    quantity: i64,
    prev_refund_cents: i64,
) -> i64 {
    if sold <= 0 || quantity <= 0 {
        return 0;
    }
    let claimed = (prev_quantity + quantity).min(sold);
    let target = if claimed == sold {
        net_cents
    } else {
        mul_div_round(net_cents, claimed, sold)
    };
    (target - prev_refund_cents).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_conversion() {
        assert_eq!(to_cents(19.99), 1999);
        assert_eq!(to_cents(0.1 + 0.2), 30);
        assert_eq!(from_cents(1050), 10.5);
        assert_eq!(round2(3.14159), 3.14);
    }

    #[test]
    fn test_checked_line_and_sum() {
        assert_eq!(line_cents(5_000, 3), Ok(15_000));
        assert_eq!(line_cents(5_000, 9_000_000_000_000_000).unwrap_err(), OUT_OF_RANGE);
        assert_eq!(sum_cents([1, 2, 3]), Ok(6));
        assert_eq!(sum_cents([i64::MAX, 1]).unwrap_err(), OUT_OF_RANGE);
        assert_eq!(to_cents(1e20), i64::MAX);
    }

    #[test]
    fn test_allocate_sums_to_total() {
        let shares = allocate_proportional(1000, &[3333, 3333, 3334]);
        assert_eq!(shares.iter().sum::<i64>(), 1000);
        assert_eq!(shares, vec![333, 333, 334]);
    }

    #[test]
    fn test_allocate_largest_remainder_ties_go_first() {
        let shares = allocate_proportional(100, &[1, 1, 1]);
        assert_eq!(shares, vec![34, 33, 33]);
    }

    #[test]
    fn test_allocate_zero_weights() {
        assert_eq!(allocate_proportional(500, &[0, 0]), vec![0, 0]);
        assert_eq!(allocate_proportional(0, &[10, 20]), vec![0, 0]);
    }

    #[test]
    fn test_prorated_refund_partial_then_rest_is_exact() {
        // 3 units, net 100.00 -> 33.33 + 33.34 + 33.33 style split
        let net = 10_000;
        let first = prorated_refund(net, 3, 0, 1, 0);
        assert_eq!(first, 3333);
        let second = prorated_refund(net, 3, 1, 1, first);
        assert_eq!(second, 3334);
        let third = prorated_refund(net, 3, 2, 1, first + second);
        assert_eq!(first + second + third, net);
    }

    #[test]
    fn test_prorated_refund_full_line_at_once() {
        assert_eq!(prorated_refund(4_599, 2, 0, 2, 0), 4_599);
    }

    #[test]
    fn test_prorated_refund_never_negative() {
        assert_eq!(prorated_refund(1_000, 2, 1, 1, 2_000), 0);
        assert_eq!(prorated_refund(1_000, 0, 0, 1, 0), 0);
    }
}
