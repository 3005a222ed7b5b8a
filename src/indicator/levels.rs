use error_stack::Report;

use crate::error::IndicatorError;
use crate::model::Candle;

/// Support and resistance levels found by clustering recent swing highs
/// and lows, rather than a single `Indicator` value series — callers use
/// [`support_levels`] and [`resistance_levels`] directly.
const CLUSTER_TOLERANCE_PCT: f64 = 0.5;

/// Local extrema detected over a `window`-candle neighborhood on each side.
fn pivot_highs(candles: &[Candle], window: usize) -> Vec<f64> {
    let mut highs = Vec::new();
    for i in window..candles.len().saturating_sub(window) {
        let center = candles[i].high;
        let is_pivot = (i.saturating_sub(window)..i)
            .chain((i + 1)..(i + window + 1).min(candles.len()))
            .all(|j| candles[j].high <= center);
        if is_pivot {
            highs.push(center);
        }
    }
    highs
}

fn pivot_lows(candles: &[Candle], window: usize) -> Vec<f64> {
    let mut lows = Vec::new();
    for i in window..candles.len().saturating_sub(window) {
        let center = candles[i].low;
        let is_pivot = (i.saturating_sub(window)..i)
            .chain((i + 1)..(i + window + 1).min(candles.len()))
            .all(|j| candles[j].low >= center);
        if is_pivot {
            lows.push(center);
        }
    }
    lows
}

/// Cluster price points within `CLUSTER_TOLERANCE_PCT` of each other,
/// collapsing each cluster to its mean, sorted ascending by price.
fn cluster(mut points: Vec<f64>) -> Vec<f64> {
    points.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mut clusters: Vec<Vec<f64>> = Vec::new();
    for p in points {
        match clusters.last_mut() {
            Some(last) if (p - last[0]).abs() / last[0] * 100.0 <= CLUSTER_TOLERANCE_PCT => {
                last.push(p);
            }
            _ => clusters.push(vec![p]),
        }
    }
    let mut means: Vec<f64> = clusters
        .into_iter()
        .map(|c| c.iter().sum::<f64>() / c.len() as f64)
        .collect();
    means.sort_by(|a, b| a.partial_cmp(b).unwrap());
    means
}

/// Resistance levels above the most recent close, sorted ascending. Returns
/// an empty vec (never an error) when there isn't enough history to form a
/// pivot window — callers always get a usable, if empty, result.
pub fn resistance_levels(
    candles: &[Candle],
    window: usize,
    max_levels: usize,
) -> Result<Vec<f64>, Report<IndicatorError>> {
    if candles.len() < window * 2 + 1 {
        return Ok(Vec::new());
    }
    let current = candles.last().unwrap().close;
    let levels = cluster(pivot_highs(candles, window))
        .into_iter()
        .filter(|&level| level > current)
        .take(max_levels)
        .collect();
    Ok(levels)
}

/// Support levels below the most recent close, sorted ascending. Returns an
/// empty vec (never an error) when there isn't enough history to form a
/// pivot window.
pub fn support_levels(
    candles: &[Candle],
    window: usize,
    max_levels: usize,
) -> Result<Vec<f64>, Report<IndicatorError>> {
    if candles.len() < window * 2 + 1 {
        return Ok(Vec::new());
    }
    let current = candles.last().unwrap().close;
    let levels = cluster(pivot_lows(candles, window))
        .into_iter()
        .filter(|&level| level < current)
        .take(max_levels)
        .collect();
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExchangeKind, TimeFrame};
    use chrono::Utc;

    fn candle(i: i64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            exchange: ExchangeKind::Binance,
            symbol: "TEST".into(),
            timeframe: TimeFrame::Min1,
            open_time: Utc::now() + chrono::Duration::minutes(i),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn sample_series() -> Vec<Candle> {
        // Oscillates so pivots form at known bands.
        let pattern = [
            100.0, 101.0, 105.0, 101.0, 100.0, 99.0, 95.0, 99.0, 100.0, 101.0, 105.2, 101.0,
            100.0, 99.0, 94.8, 99.0, 100.0,
        ];
        pattern
            .iter()
            .enumerate()
            .map(|(i, &c)| candle(i as i64, c + 0.5, c - 0.5, c))
            .collect()
    }

    #[test]
    fn resistance_levels_found_above_current_price() {
        let candles = sample_series();
        let levels = resistance_levels(&candles, 2, 5).unwrap();
        assert!(levels.iter().all(|&l| l > candles.last().unwrap().close));
    }

    #[test]
    fn support_levels_found_below_current_price() {
        let candles = sample_series();
        let levels = support_levels(&candles, 2, 5).unwrap();
        assert!(levels.iter().all(|&l| l < candles.last().unwrap().close));
    }

    #[test]
    fn insufficient_candles_returns_empty_not_error() {
        let candles = sample_series();
        assert_eq!(resistance_levels(&candles[..3], 2, 5).unwrap(), Vec::<f64>::new());
        assert_eq!(support_levels(&candles[..3], 2, 5).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn levels_are_sorted_ascending() {
        let candles = sample_series();
        let resistance = resistance_levels(&candles, 2, 5).unwrap();
        let mut sorted = resistance.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(resistance, sorted);

        let support = support_levels(&candles, 2, 5).unwrap();
        let mut sorted = support.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(support, sorted);
    }
}
