use statrs::statistics::Statistics;

/// Largest population variance a set of values in [0, 1] can have (half at 0, half at 1).
pub const MAX_UNIT_VARIANCE: f64 = 0.25;

/// Weights divided by the largest one, so sums stay finite for any finite weights.
///
/// `None` when a weight is negative or non-finite, or when every weight is zero.
fn rescaled_weights(weights: &[f64]) -> Option<Vec<f64>> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return None;
    }
    let largest = weights.iter().copied().fold(0.0_f64, f64::max);
    if largest <= 0.0 {
        return None;
    }
    Some(weights.iter().map(|w| w / largest).collect())
}

/// Weighted arithmetic mean
///
/// Returns `None` when the inputs are empty, of different lengths, or the weights sum to zero.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.is_empty() || values.len() != weights.len() {
        return None;
    }

    let weights = rescaled_weights(weights)?;
    if let [value] = values {
        return Some(*value);
    }

    let total_weight: f64 = weights.iter().sum();
    let weighted_sum: f64 = values.iter().zip(&weights).map(|(v, w)| v * w).sum();
    Some(weighted_sum / total_weight)
}

/// Weighted population variance around the weighted mean
pub fn weighted_variance(values: &[f64], weights: &[f64]) -> Option<f64> {
    let mean = weighted_mean(values, weights)?;
    let weights = rescaled_weights(weights)?;
    let total_weight: f64 = weights.iter().sum();

    let spread: f64 = values
        .iter()
        .zip(&weights)
        .map(|(v, w)| w * (v - mean).powi(2))
        .sum();

    Some(spread / total_weight)
}

/// Variance of unit-interval values rescaled to [0, 1]
///
/// 0.0 means every value agrees, 1.0 means the values are split evenly between 0 and 1.
pub fn normalized_variance(values: &[f64], weights: &[f64]) -> Option<f64> {
    weighted_variance(values, weights).map(|v| (v / MAX_UNIT_VARIANCE).clamp(0.0, 1.0))
}

/// Unweighted population variance, 0.0 for fewer than two values
pub fn population_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.population_variance()
}

/// Logistic sigmoid saturating at the extremes
pub fn sigmoid(x: f64) -> f64 {
    if x > 40.0 {
        1.0
    } else if x < -40.0 {
        0.0
    } else {
        1.0 / (1.0 + (-x).exp())
    }
}
