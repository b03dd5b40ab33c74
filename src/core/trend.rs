use crate::types::{RegionTimeSeries, TraceError, TraceResult, TrendResult};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::Serialize;

/// Offset-log transform applied before fitting: log10(value + 1).
/// Missing values and values at or below -1 have no transform.
#[inline]
pub fn log_offset(value: f64) -> Option<f64> {
    if value.is_finite() && value > -1.0 {
        Some((value + 1.0).log10())
    } else {
        None
    }
}

/// Least-squares slope of log10(value + 1) against period.
///
/// Points without a usable value are dropped first; fewer than two
/// remaining points is `InsufficientData`, never a zero slope.
pub fn fit_trend(series: &RegionTimeSeries) -> TraceResult<TrendResult> {
    let points: Vec<(f64, f64)> = series
        .points()
        .iter()
        .filter_map(|(period, value)| log_offset(*value).map(|y| (period.as_x(), y)))
        .collect();

    let n = points.len();
    if n < 2 {
        return Err(TraceError::InsufficientData {
            region: series.region_id().to_string(),
            count: n,
        });
    }

    // x is centered on its mean; the slope is invariant under the shift.
    let nf = n as f64;
    let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / nf;
    let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
    for &(x, y) in &points {
        let x = x - x_mean;
        sx += x;
        sy += y;
        sxy += x * y;
        sxx += x * x;
    }

    let denominator = nf * sxx - sx * sx;
    if denominator == 0.0 || !denominator.is_finite() {
        return Err(TraceError::DegenerateRegression {
            region: series.region_id().to_string(),
        });
    }
    let slope = (nf * sxy - sx * sy) / denominator;

    Ok(TrendResult {
        region_id: series.region_id().to_string(),
        slope,
        sample_count: n,
    })
}

/// Trends for many regions; failures are kept per region
#[derive(Debug, Default)]
pub struct TrendBatch {
    pub fitted: Vec<TrendResult>,
    pub undefined: Vec<(String, TraceError)>,
}

/// Fit every series in parallel, ordered by region id
pub fn fit_trends(series: &[RegionTimeSeries]) -> TrendBatch {
    log::info!("Fitting trends for {} regions", series.len());

    let fit = |s: &RegionTimeSeries| (s.region_id().to_string(), fit_trend(s));

    #[cfg(feature = "parallel")]
    let results: Vec<(String, TraceResult<TrendResult>)> = series.par_iter().map(fit).collect();

    #[cfg(not(feature = "parallel"))]
    let results: Vec<(String, TraceResult<TrendResult>)> = series.iter().map(fit).collect();

    let mut batch = TrendBatch::default();
    for (region, result) in results {
        match result {
            Ok(trend) => batch.fitted.push(trend),
            Err(e) => {
                log::warn!("No trend for region {}: {}", region, e);
                batch.undefined.push((region, e));
            }
        }
    }
    batch.fitted.sort_by(|a, b| a.region_id.cmp(&b.region_id));
    batch.undefined.sort_by(|a, b| a.0.cmp(&b.0));
    batch
}

/// Direction counts and mean slope over fitted trends
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub positive: usize,
    pub negative: usize,
    pub mean_slope: Option<f64>,
}

impl TrendSummary {
    pub fn from_results(results: &[TrendResult]) -> Self {
        let positive = results.iter().filter(|t| t.slope > 0.0).count();
        let negative = results.iter().filter(|t| t.slope < 0.0).count();
        let mean_slope = if results.is_empty() {
            None
        } else {
            Some(results.iter().map(|t| t.slope).sum::<f64>() / results.len() as f64)
        };
        Self {
            positive,
            negative,
            mean_slope,
        }
    }
}
