use crate::io::boundaries::{RegionFilter, RegionSource};
use crate::types::{
    is_missing, GridCoords, Period, Provenance, RegionObservation, RegionPolygon, ScalarGrid,
    TraceError, TraceResult,
};
use geo::{BoundingRect, Centroid, Contains, Intersects, Point};
use ndarray::Array2;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// Region index of every grid cell, derived once per (grid, region set).
///
/// A cell belongs to a region when its center lies inside the region or on
/// its boundary. A center inside one region and on the edge of another
/// goes to the region whose interior holds it; a center on a border shared
/// only by edges goes to the first region in rasterization order.
#[derive(Debug, Clone)]
pub struct ZoneAssignment {
    coords: Arc<GridCoords>,
    cells: Array2<Option<usize>>,
    members: Vec<Vec<(usize, usize)>>,
}

/// Cell center found inside or on the edge of one region
#[derive(Debug, Clone, Copy)]
struct CellClaim {
    row: usize,
    col: usize,
    interior: bool,
}

impl ZoneAssignment {
    /// Assign every cell center to the region that covers it.
    ///
    /// Each region only tests the cells inside its bounding box. Regions are
    /// rasterized in parallel and merged in region order; a cell center in
    /// the interior of two regions fails with `RegionOverlap`.
    pub fn rasterize(coords: &Arc<GridCoords>, regions: &[&RegionPolygon]) -> TraceResult<Self> {
        log::info!(
            "Rasterizing {} regions onto {:?} grid",
            regions.len(),
            coords.shape()
        );

        #[cfg(feature = "parallel")]
        let claims: Vec<Vec<CellClaim>> = regions
            .par_iter()
            .map(|region| cells_covered(coords, region))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let claims: Vec<Vec<CellClaim>> = regions
            .iter()
            .map(|region| cells_covered(coords, region))
            .collect();

        let mut cells: Array2<Option<(usize, bool)>> = Array2::from_elem(coords.shape(), None);
        for (idx, region_claims) in claims.iter().enumerate() {
            for claim in region_claims {
                let slot = &mut cells[[claim.row, claim.col]];
                match *slot {
                    None => *slot = Some((idx, claim.interior)),
                    Some((prev, true)) if claim.interior => {
                        return Err(TraceError::RegionOverlap {
                            lat: coords.lat()[claim.row],
                            lon: coords.lon()[claim.col],
                            first: regions[prev].id.clone(),
                            second: regions[idx].id.clone(),
                        });
                    }
                    Some((_, false)) if claim.interior => *slot = Some((idx, true)),
                    Some(_) => {}
                }
            }
        }

        let cells = cells.mapv(|slot| slot.map(|(idx, _)| idx));
        let mut members = vec![Vec::new(); regions.len()];
        for ((row, col), slot) in cells.indexed_iter() {
            if let Some(idx) = *slot {
                members[idx].push((row, col));
            }
        }

        let assigned: usize = members.iter().map(Vec::len).sum();
        log::debug!("{} of {} cells assigned to a region", assigned, cells.len());

        Ok(Self {
            coords: coords.clone(),
            cells,
            members,
        })
    }

    pub fn coords(&self) -> &Arc<GridCoords> {
        &self.coords
    }

    /// Index (into the rasterized region list) of the region owning a cell
    pub fn region_at(&self, row: usize, col: usize) -> Option<usize> {
        self.cells.get((row, col)).copied().flatten()
    }

    /// Cells assigned to region `idx`, in row-major order
    pub fn cells_of(&self, idx: usize) -> &[(usize, usize)] {
        self.members.get(idx).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn region_count(&self) -> usize {
        self.members.len()
    }

    /// True when this assignment was built for `grid`'s coordinates
    pub fn matches(&self, grid: &ScalarGrid) -> bool {
        Arc::ptr_eq(&self.coords, grid.coords()) || *self.coords == **grid.coords()
    }
}

fn cells_covered(coords: &GridCoords, region: &RegionPolygon) -> Vec<CellClaim> {
    let Some(bbox) = region.geometry.bounding_rect() else {
        return Vec::new();
    };
    let rows = axis_range(coords.lat(), bbox.min().y, bbox.max().y);
    let cols = axis_range(coords.lon(), bbox.min().x, bbox.max().x);

    let mut covered = Vec::new();
    for row in rows {
        let lat = coords.lat()[row];
        for col in cols.clone() {
            let center = Point::new(coords.lon()[col], lat);
            if region.geometry.0.iter().any(|polygon| polygon.intersects(&center)) {
                covered.push(CellClaim {
                    row,
                    col,
                    interior: region.geometry.contains(&center),
                });
            }
        }
    }
    covered
}

/// Index range of a strictly monotonic axis whose values fall in [min, max]
fn axis_range(axis: &[f64], min: f64, max: f64) -> Range<usize> {
    let ascending = axis.len() < 2 || axis[1] > axis[0];
    if ascending {
        axis.partition_point(|&v| v < min)..axis.partition_point(|&v| v <= max)
    } else {
        axis.partition_point(|&v| v > max)..axis.partition_point(|&v| v >= min)
    }
}

/// Region that produced no observation for a period
#[derive(Debug)]
pub struct RegionFailure {
    pub region_id: String,
    pub error: TraceError,
}

/// Per-region observations for one period plus the regions that failed
#[derive(Debug, Default)]
pub struct ZonalReport {
    pub period: Option<Period>,
    pub observations: BTreeMap<String, RegionObservation>,
    pub failures: Vec<RegionFailure>,
}

impl ZonalReport {
    pub fn count_by(&self, provenance: Provenance) -> usize {
        self.observations
            .values()
            .filter(|o| o.provenance == provenance)
            .count()
    }
}

/// Zonal Statistics Engine over an injected, read-only region source
pub struct ZonalEngine<'a> {
    regions: Vec<&'a RegionPolygon>,
    unknown: Vec<String>,
}

impl<'a> ZonalEngine<'a> {
    /// Evaluate every region the source provides
    pub fn new(source: &'a dyn RegionSource) -> Self {
        Self::with_filter(source, &RegionFilter::default())
    }

    /// Evaluate the regions selected by `filter`; requested identifiers
    /// the source does not know are remembered and reported.
    pub fn with_filter(source: &'a dyn RegionSource, filter: &RegionFilter) -> Self {
        let (regions, unknown) = filter.select(source);
        for id in &unknown {
            log::warn!("Region {} not found in boundary source", id);
        }
        Self { regions, unknown }
    }

    pub fn regions(&self) -> &[&'a RegionPolygon] {
        &self.regions
    }

    pub fn unknown(&self) -> &[String] {
        &self.unknown
    }

    pub fn rasterize(&self, coords: &Arc<GridCoords>) -> TraceResult<ZoneAssignment> {
        ZoneAssignment::rasterize(coords, &self.regions)
    }

    /// Rasterize and evaluate in one call
    pub fn compute_zone_stats(&self, grid: &ScalarGrid, period: Period) -> TraceResult<ZonalReport> {
        let assignment = self.rasterize(grid.coords())?;
        self.compute_with(grid, &assignment, period)
    }

    /// Evaluate every region against a precomputed assignment.
    ///
    /// Regions with at least one valid assigned cell get the mean of those
    /// cells. The rest fall back to the valid cell nearest to their centroid.
    pub fn compute_with(
        &self,
        grid: &ScalarGrid,
        assignment: &ZoneAssignment,
        period: Period,
    ) -> TraceResult<ZonalReport> {
        if !assignment.matches(grid) || assignment.region_count() != self.regions.len() {
            return Err(TraceError::GridMismatch(
                "zone assignment was built for a different grid or region set".to_string(),
            ));
        }
        log::info!("Computing zonal statistics for {} regions ({})", self.regions.len(), period);

        // Row-major order fixes the nearest-cell tie-break.
        let valid_cells: Vec<(usize, usize)> = grid
            .values()
            .indexed_iter()
            .filter(|(_, v)| !is_missing(**v))
            .map(|(idx, _)| idx)
            .collect();

        let evaluate = |(idx, region): (usize, &&RegionPolygon)| {
            let result = region_observation(
                grid,
                region,
                assignment.cells_of(idx),
                &valid_cells,
                period,
            );
            (region.id.clone(), result)
        };

        #[cfg(feature = "parallel")]
        let results: Vec<(String, TraceResult<RegionObservation>)> =
            self.regions.par_iter().enumerate().map(evaluate).collect();

        #[cfg(not(feature = "parallel"))]
        let results: Vec<(String, TraceResult<RegionObservation>)> =
            self.regions.iter().enumerate().map(evaluate).collect();

        let mut report = ZonalReport {
            period: Some(period),
            ..Default::default()
        };
        for id in &self.unknown {
            report.failures.push(RegionFailure {
                region_id: id.clone(),
                error: TraceError::UnknownRegion(id.clone()),
            });
        }
        for (region_id, result) in results {
            match result {
                Ok(obs) => {
                    report.observations.insert(region_id, obs);
                }
                Err(e) if e.is_recoverable() => {
                    log::warn!("No value for region {} in {}: {}", region_id, period, e);
                    report.failures.push(RegionFailure { region_id, error: e });
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Zonal statistics done: {} area means, {} nearest-grid fallbacks, {} failures",
            report.count_by(Provenance::AreaMean),
            report.count_by(Provenance::NearestGrid),
            report.failures.len()
        );
        Ok(report)
    }
}

fn region_observation(
    grid: &ScalarGrid,
    region: &RegionPolygon,
    cells: &[(usize, usize)],
    valid_cells: &[(usize, usize)],
    period: Period,
) -> TraceResult<RegionObservation> {
    let values = grid.values();
    let (sum, count) = cells
        .iter()
        .map(|&(r, c)| values[[r, c]])
        .filter(|v| !is_missing(*v))
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));

    if count > 0 {
        return Ok(RegionObservation {
            region_id: region.id.clone(),
            region_name: region.name.clone(),
            period,
            value: sum / count as f64,
            provenance: Provenance::AreaMean,
            cell_count: count,
        });
    }

    let centroid = region
        .geometry
        .centroid()
        .ok_or_else(|| TraceError::EmptyGeometry(region.id.clone()))?;
    let (row, col) = nearest_valid_cell(grid.coords(), valid_cells, centroid).ok_or_else(|| {
        TraceError::NoValidData {
            region: region.id.clone(),
            period: period.to_string(),
        }
    })?;
    log::debug!(
        "Region {} has no valid cell inside; using nearest cell ({}, {}) to centroid ({:.3}, {:.3})",
        region.id,
        row,
        col,
        centroid.x(),
        centroid.y()
    );

    Ok(RegionObservation {
        region_id: region.id.clone(),
        region_name: region.name.clone(),
        period,
        value: values[[row, col]],
        provenance: Provenance::NearestGrid,
        cell_count: 1,
    })
}

/// Valid cell whose center minimizes squared lat/lon distance to `target`.
/// `valid_cells` must be in row-major order; the first minimum wins.
fn nearest_valid_cell(
    coords: &GridCoords,
    valid_cells: &[(usize, usize)],
    target: Point<f64>,
) -> Option<(usize, usize)> {
    let mut best: Option<((usize, usize), f64)> = None;
    for &(row, col) in valid_cells {
        let dlat = coords.lat()[row] - target.y();
        let dlon = coords.lon()[col] - target.x();
        let dist2 = dlat * dlat + dlon * dlon;
        match best {
            Some((_, d)) if dist2 >= d => {}
            _ => best = Some(((row, col), dist2)),
        }
    }
    best.map(|(cell, _)| cell)
}
