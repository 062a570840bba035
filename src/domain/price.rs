use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest observed pool state for one trading pair, with the precomputed
/// moving-average ladder (one bucket per configured duration)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRow {
    pub pair: String,
    pub price: Decimal,
    /// Raw pool liquidity
    pub liquidity: String,
    pub smas: Vec<Decimal>,
    pub updated_on: Option<DateTime<Utc>>,
}

/// Append-only price observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistoryRow {
    pub pair: String,
    pub price: Decimal,
    pub liquidity: String,
}

/// Advance the exponential moving-average ladder by one observation.
///
/// One bucket per duration in `from..=to` step `step`. Each bucket moves by
/// `(price - prior) / duration`. A missing or wrong-length prior ladder
/// seeds every bucket to the current price.
pub fn compute_moving_averages(
    price: Decimal,
    from: u32,
    to: u32,
    step: u32,
    prior: &[Decimal],
) -> Vec<Decimal> {
    let count = ((to - from) / step) as usize + 1;

    let prior: Option<&[Decimal]> = if prior.len() == count {
        Some(prior)
    } else {
        if !prior.is_empty() {
            tracing::warn!(
                "Prior ladder length {} does not match bucket count {}",
                prior.len(),
                count
            );
        }
        None
    };

    let mut updated = Vec::with_capacity(count);
    let mut duration = from;
    for i in 0..count {
        let prior_ma = prior.map(|p| p[i]).unwrap_or(price);
        let ma = prior_ma + (price - prior_ma) / Decimal::from(duration);
        updated.push(ma.round_dp(2));
        duration += step;
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cold_start_seeds_every_bucket_to_price() {
        let ladder = compute_moving_averages(dec!(1813.4), 15, 180, 15, &[]);
        assert_eq!(ladder.len(), 12);
        assert!(ladder.iter().all(|ma| *ma == dec!(1813.4)));
    }

    #[test]
    fn test_update_nudges_each_bucket_by_duration() {
        let prior = vec![dec!(100); 4];
        let ladder = compute_moving_averages(dec!(110), 10, 40, 10, &prior);
        // (110 - 100) / duration, per bucket
        assert_eq!(ladder, vec![dec!(101), dec!(100.5), dec!(100.33), dec!(100.25)]);
    }

    #[test]
    fn test_mismatched_prior_is_reseeded() {
        let prior = vec![dec!(100); 3];
        let ladder = compute_moving_averages(dec!(110), 10, 40, 10, &prior);
        assert!(ladder.iter().all(|ma| *ma == dec!(110)));
    }
}
