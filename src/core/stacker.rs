use crate::core::reducer::{GridAccumulator, ReducerParams};
use crate::types::{ScalarGrid, TraceError, TraceResult};

/// Temporal Stacker: combines period means (e.g. 12 months) into one
/// coarser mean (e.g. a year) with the reducer's missing-data rules.
pub struct TemporalStacker {
    params: ReducerParams,
}

impl TemporalStacker {
    /// Any valid period contributes
    pub fn new() -> Self {
        Self {
            params: ReducerParams::default(),
        }
    }

    pub fn with_params(params: ReducerParams) -> Self {
        Self { params }
    }

    pub fn stack(&self, period_grids: &[ScalarGrid]) -> TraceResult<ScalarGrid> {
        let first = period_grids.first().ok_or(TraceError::EmptyStack)?;
        log::debug!(
            "Stacking {} period grids of shape {:?}",
            period_grids.len(),
            first.shape()
        );

        let mut acc = GridAccumulator::new(first.coords().clone());
        for grid in period_grids {
            acc.add(grid, &self.params)?;
        }
        Ok(acc.finish(self.params.min_valid_count))
    }
}

impl Default for TemporalStacker {
    fn default() -> Self {
        Self::new()
    }
}

/// Stack with default parameters
pub fn stack(period_grids: &[ScalarGrid]) -> TraceResult<ScalarGrid> {
    TemporalStacker::new().stack(period_grids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GridCoords, MISSING};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    #[test]
    fn test_empty_stack_fails() {
        assert!(matches!(stack(&[]), Err(TraceError::EmptyStack)));
    }

    #[test]
    fn test_twelve_months_with_gap() {
        let coords = Arc::new(GridCoords::global(4, 8).unwrap());
        let months: Vec<ScalarGrid> = (1..=12)
            .map(|m| {
                let mut grid = ScalarGrid::filled(coords.clone(), m as f64).into_values();
                if m == 6 {
                    grid[[0, 0]] = MISSING;
                }
                ScalarGrid::new(coords.clone(), grid).unwrap()
            })
            .collect();

        let annual = stack(&months).unwrap();
        let expected_gap = (78.0 - 6.0) / 11.0;
        assert_relative_eq!(annual.values()[[0, 0]], expected_gap, epsilon = 1e-12);
        assert_relative_eq!(annual.values()[[3, 7]], 6.5, epsilon = 1e-12);
    }

    #[test]
    fn test_non_positive_masking() {
        let coords = Arc::new(GridCoords::global(1, 2).unwrap());
        let a = ScalarGrid::filled(coords.clone(), 0.0);
        let b = ScalarGrid::filled(coords, 4.0);

        let stacker = TemporalStacker::with_params(ReducerParams {
            mask_non_positive: true,
            ..Default::default()
        });
        let annual = stacker.stack(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(annual.values()[[0, 1]], 4.0);

        let annual = stack(&[a, b]).unwrap();
        assert_eq!(annual.values()[[0, 1]], 2.0);
    }
}
