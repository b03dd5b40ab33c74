use crate::io::GridSource;
use crate::types::{GridCoords, ScalarGrid, TraceError, TraceResult, MISSING};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cell validity and coverage policy shared by the reducer and the stacker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReducerParams {
    /// Minimum number of valid contributions a cell needs to be kept
    pub min_valid_count: usize,
    /// Values below this are fill values
    pub fill_threshold: f64,
    /// Also treat zero and negative values as missing
    pub mask_non_positive: bool,
}

impl Default for ReducerParams {
    fn default() -> Self {
        Self {
            min_valid_count: 1,         // Any valid contribution keeps a cell
            fill_threshold: -1e20,      // Fill values sit far below this
            mask_non_positive: false,   // Keep negative columns
        }
    }
}

impl ReducerParams {
    #[inline]
    pub fn is_valid(&self, value: f64) -> bool {
        value.is_finite()
            && value >= self.fill_threshold
            && (!self.mask_non_positive || value > 0.0)
    }
}

/// Running per-cell sum and count of valid contributions.
///
/// Accumulators are owned by one worker; partial accumulators over the
/// same grid are combined with [`GridAccumulator::merge`].
#[derive(Debug, Clone)]
pub struct GridAccumulator {
    coords: Arc<GridCoords>,
    sum: Array2<f64>,
    count: Array2<u32>,
    grids_added: usize,
}

impl GridAccumulator {
    pub fn new(coords: Arc<GridCoords>) -> Self {
        let shape = coords.shape();
        Self {
            coords,
            sum: Array2::zeros(shape),
            count: Array2::zeros(shape),
            grids_added: 0,
        }
    }

    pub fn coords(&self) -> &Arc<GridCoords> {
        &self.coords
    }

    pub fn grids_added(&self) -> usize {
        self.grids_added
    }

    fn check_coords(&self, other: &Arc<GridCoords>) -> TraceResult<()> {
        if Arc::ptr_eq(&self.coords, other) || *self.coords == **other {
            Ok(())
        } else {
            Err(TraceError::GridMismatch(format!(
                "cannot combine {:?} grid into {:?} accumulator",
                other.shape(),
                self.coords.shape()
            )))
        }
    }

    /// Add every valid cell of `grid`
    pub fn add(&mut self, grid: &ScalarGrid, params: &ReducerParams) -> TraceResult<()> {
        self.check_coords(grid.coords())?;
        Zip::from(&mut self.sum)
            .and(&mut self.count)
            .and(grid.values())
            .for_each(|sum, count, &value| {
                if params.is_valid(value) {
                    *sum += value;
                    *count += 1;
                }
            });
        self.grids_added += 1;
        Ok(())
    }

    /// Fold another partial accumulation over the same grid into this one
    pub fn merge(&mut self, other: GridAccumulator) -> TraceResult<()> {
        self.check_coords(&other.coords)?;
        self.sum += &other.sum;
        self.count += &other.count;
        self.grids_added += other.grids_added;
        Ok(())
    }

    /// Mean grid; cells with fewer than `min_valid_count` contributions
    /// (and always cells with none) are missing.
    pub fn finish(self, min_valid_count: usize) -> ScalarGrid {
        let threshold = u32::try_from(min_valid_count.max(1)).unwrap_or(u32::MAX);
        let mut mean = Array2::from_elem(self.coords.shape(), MISSING);
        Zip::from(&mut mean)
            .and(&self.sum)
            .and(&self.count)
            .for_each(|out, &sum, &count| {
                if count >= threshold {
                    *out = sum / count as f64;
                }
            });
        ScalarGrid::from_parts(self.coords, mean)
    }
}

/// A source file that was left out of its group
#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub error: TraceError,
}

/// Mean grid of one group plus the files it had to skip
#[derive(Debug)]
pub struct GroupReduction {
    pub group: String,
    pub grid: ScalarGrid,
    pub files_used: usize,
    pub skipped: Vec<SkippedFile>,
}

/// A named set of source files covering the same period
#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub label: String,
    pub files: Vec<PathBuf>,
}

impl SourceGroup {
    pub fn new(label: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            label: label.into(),
            files,
        }
    }
}

/// Outcome of reducing many groups: successes and whole-group failures
#[derive(Debug, Default)]
pub struct GroupsReduction {
    pub reductions: Vec<GroupReduction>,
    pub failures: Vec<(String, TraceError)>,
}

#[derive(Debug, Default)]
struct PartialReduction {
    acc: Option<GridAccumulator>,
    skipped: Vec<SkippedFile>,
}

impl PartialReduction {
    fn absorb(mut self, other: PartialReduction) -> TraceResult<Self> {
        self.skipped.extend(other.skipped);
        self.acc = match (self.acc, other.acc) {
            (Some(mut a), Some(b)) => {
                a.merge(b)?;
                Some(a)
            }
            (a, b) => a.or(b),
        };
        Ok(self)
    }
}

/// Grid Reducer: streaming per-cell mean over a batch of grids
pub struct GridReducer {
    params: ReducerParams,
}

impl GridReducer {
    /// Create a reducer with default parameters
    pub fn new() -> Self {
        Self {
            params: ReducerParams::default(),
        }
    }

    /// Create a reducer with custom parameters
    pub fn with_params(params: ReducerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ReducerParams {
        &self.params
    }

    /// Mean of in-memory grids that share one coordinate grid
    pub fn reduce(&self, grids: &[ScalarGrid]) -> TraceResult<ScalarGrid> {
        let first = grids.first().ok_or_else(|| TraceError::NoValidSource {
            group: "in-memory".to_string(),
        })?;
        let mut acc = GridAccumulator::new(first.coords().clone());
        for grid in grids {
            acc.add(grid, &self.params)?;
        }
        Ok(acc.finish(self.params.min_valid_count))
    }

    fn read_one(
        &self,
        source: &dyn GridSource,
        path: &Path,
        field: &str,
        mut part: PartialReduction,
    ) -> TraceResult<PartialReduction> {
        match source.read_grid(path, field) {
            Ok(grid) => {
                let acc = part
                    .acc
                    .get_or_insert_with(|| GridAccumulator::new(grid.coords().clone()));
                acc.add(&grid, &self.params)?;
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("Skipping source file {}: {}", path.display(), e);
                part.skipped.push(SkippedFile {
                    path: path.to_path_buf(),
                    error: e,
                });
            }
            Err(e) => return Err(e),
        }
        Ok(part)
    }

    /// Reduce one group of source files into its mean grid.
    ///
    /// Unreadable files are skipped; the group fails with `NoValidSource`
    /// only when none of its files could be read. A file on a different
    /// grid is a structural error and aborts the group.
    pub fn reduce_files(
        &self,
        source: &dyn GridSource,
        group: &SourceGroup,
        field: &str,
    ) -> TraceResult<GroupReduction> {
        log::info!("Reducing group {} ({} files)", group.label, group.files.len());

        #[cfg(feature = "parallel")]
        let part = {
            use rayon::prelude::*;
            group
                .files
                .par_iter()
                .try_fold(PartialReduction::default, |part, path| {
                    self.read_one(source, path, field, part)
                })
                .try_reduce(PartialReduction::default, |a, b| a.absorb(b))?
        };

        #[cfg(not(feature = "parallel"))]
        let part = {
            let mut part = PartialReduction::default();
            for path in &group.files {
                part = self.read_one(source, path, field, part)?;
            }
            part
        };

        let PartialReduction { acc, mut skipped } = part;
        skipped.sort_by(|a, b| a.path.cmp(&b.path));

        let acc = acc.ok_or_else(|| TraceError::NoValidSource {
            group: group.label.clone(),
        })?;
        let files_used = acc.grids_added();
        log::debug!(
            "Group {}: {} files used, {} skipped",
            group.label,
            files_used,
            skipped.len()
        );

        Ok(GroupReduction {
            group: group.label.clone(),
            grid: acc.finish(self.params.min_valid_count),
            files_used,
            skipped,
        })
    }

    /// Reduce independent groups in parallel, collecting per-group failures
    pub fn reduce_groups(
        &self,
        source: &dyn GridSource,
        groups: &[SourceGroup],
        field: &str,
    ) -> TraceResult<GroupsReduction> {
        let reduce = |group: &SourceGroup| (group.label.clone(), self.reduce_files(source, group, field));

        #[cfg(feature = "parallel")]
        let results: Vec<(String, TraceResult<GroupReduction>)> = {
            use rayon::prelude::*;
            groups.par_iter().map(reduce).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let results: Vec<(String, TraceResult<GroupReduction>)> = groups.iter().map(reduce).collect();

        let mut out = GroupsReduction::default();
        for (label, result) in results {
            match result {
                Ok(reduction) => out.reductions.push(reduction),
                Err(e) if e.is_recoverable() => {
                    log::warn!("Group {} produced no grid: {}", label, e);
                    out.failures.push((label, e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

impl Default for GridReducer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::is_missing;
    use std::collections::HashMap;

    fn coords(rows: usize, cols: usize) -> Arc<GridCoords> {
        Arc::new(
            GridCoords::new(
                (0..rows).map(|i| i as f64).collect(),
                (0..cols).map(|j| j as f64).collect(),
            )
            .unwrap(),
        )
    }

    struct MapSource {
        grids: HashMap<PathBuf, ScalarGrid>,
    }

    impl GridSource for MapSource {
        fn read_grid(&self, path: &Path, field: &str) -> TraceResult<ScalarGrid> {
            self.grids
                .get(path)
                .cloned()
                .ok_or_else(|| TraceError::FieldNotFound {
                    path: path.to_path_buf(),
                    field: field.to_string(),
                })
        }
    }

    #[test]
    fn test_constant_input_is_idempotent() {
        let c = coords(3, 4);
        let grids = vec![ScalarGrid::filled(c.clone(), 2.5); 5];
        let mean = GridReducer::new().reduce(&grids).unwrap();
        assert!(mean.values().iter().all(|v| *v == 2.5));
    }

    #[test]
    fn test_cell_missing_everywhere_stays_missing() {
        let c = coords(2, 2);
        let mut values = Array2::from_elem((2, 2), 1.0);
        values[[1, 1]] = -1e30;
        let grid = ScalarGrid::new(c, values).unwrap();

        for min_valid in [0, 1, 3] {
            let reducer = GridReducer::with_params(ReducerParams {
                min_valid_count: min_valid,
                ..Default::default()
            });
            let mean = reducer.reduce(&[grid.clone(), grid.clone()]).unwrap();
            assert!(is_missing(mean.values()[[1, 1]]));
        }
    }

    #[test]
    fn test_partial_coverage_and_min_valid_count() {
        let c = coords(1, 2);
        let a = ScalarGrid::new(c.clone(), Array2::from_shape_vec((1, 2), vec![1.0, 4.0]).unwrap()).unwrap();
        let b = ScalarGrid::new(c.clone(), Array2::from_shape_vec((1, 2), vec![3.0, MISSING]).unwrap()).unwrap();

        let mean = GridReducer::new().reduce(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(mean.values()[[0, 0]], 2.0);
        assert_eq!(mean.values()[[0, 1]], 4.0);

        let strict = GridReducer::with_params(ReducerParams {
            min_valid_count: 2,
            ..Default::default()
        });
        let mean = strict.reduce(&[a, b]).unwrap();
        assert_eq!(mean.values()[[0, 0]], 2.0);
        assert!(is_missing(mean.values()[[0, 1]]));
    }

    #[test]
    fn test_huge_min_valid_count_masks_everything() {
        let c = coords(2, 2);
        let mut acc = GridAccumulator::new(c.clone());
        for _ in 0..3 {
            acc.add(&ScalarGrid::filled(c.clone(), 1.0), &ReducerParams::default()).unwrap();
        }
        let mean = acc.finish(u32::MAX as usize + 1);
        assert_eq!(mean.valid_count(), 0);
    }

    #[test]
    fn test_mismatched_grids_fail() {
        let a = ScalarGrid::filled(coords(2, 2), 1.0);
        let b = ScalarGrid::filled(coords(2, 3), 1.0);
        let result = GridReducer::new().reduce(&[a, b]);
        assert!(matches!(result, Err(TraceError::GridMismatch(_))));
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let c = coords(2, 2);
        let params = ReducerParams::default();
        let grids: Vec<ScalarGrid> = (1..=4).map(|v| ScalarGrid::filled(c.clone(), v as f64)).collect();

        let mut left = GridAccumulator::new(c.clone());
        let mut right = GridAccumulator::new(c.clone());
        for g in &grids[..2] {
            left.add(g, &params).unwrap();
        }
        for g in &grids[2..] {
            right.add(g, &params).unwrap();
        }
        left.merge(right).unwrap();
        assert_eq!(left.grids_added(), 4);
        assert_eq!(left.finish(1).values()[[0, 0]], 2.5);
    }

    #[test]
    fn test_unreadable_files_are_skipped() {
        let c = coords(2, 2);
        let mut grids = HashMap::new();
        grids.insert(PathBuf::from("a.he5"), ScalarGrid::filled(c.clone(), 1.0));
        grids.insert(PathBuf::from("c.he5"), ScalarGrid::filled(c.clone(), 3.0));
        let source = MapSource { grids };

        let group = SourceGroup::new(
            "2005-01",
            vec!["a.he5".into(), "b.he5".into(), "c.he5".into()],
        );
        let reduction = GridReducer::new()
            .reduce_files(&source, &group, "no2")
            .unwrap();
        assert_eq!(reduction.files_used, 2);
        assert_eq!(reduction.skipped.len(), 1);
        assert_eq!(reduction.skipped[0].path, PathBuf::from("b.he5"));
        assert_eq!(reduction.grid.values()[[1, 1]], 2.0);
    }

    #[test]
    fn test_group_without_readable_files_fails() {
        let source = MapSource {
            grids: HashMap::new(),
        };
        let groups = vec![
            SourceGroup::new("2005-01", vec!["x.he5".into()]),
            SourceGroup::new("2005-02", vec![]),
        ];
        let out = GridReducer::new()
            .reduce_groups(&source, &groups, "no2")
            .unwrap();
        assert!(out.reductions.is_empty());
        assert_eq!(out.failures.len(), 2);
        assert!(out
            .failures
            .iter()
            .all(|(_, e)| matches!(e, TraceError::NoValidSource { .. })));
    }
}
