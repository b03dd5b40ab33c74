use crate::core::reducer::{GridReducer, ReducerParams, SkippedFile, SourceGroup};
use crate::core::stacker::TemporalStacker;
use crate::core::trend::{fit_trends, TrendSummary};
use crate::core::zonal::{RegionFailure, ZonalEngine, ZonalReport, ZoneAssignment};
use crate::io::boundaries::{RegionFilter, RegionSource};
use crate::io::grid_store::write_grid;
use crate::io::source::{GdalGridSource, GridSource, SourceParams};
use crate::io::table::{write_trends_csv, RegionPeriodTable};
use crate::types::{Period, Provenance, ScalarGrid, TraceError, TraceResult, TrendResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: SourceParams,
    /// Policy for reducing source files into monthly means
    pub reducer: ReducerParams,
    /// Policy for stacking monthly means into annual means
    pub stacker: ReducerParams,
    pub region_filter: RegionFilter,
    /// Name of the data variable in persisted grids
    pub variable: String,
    /// Where monthly and annual mean grids are written, if anywhere
    pub persist_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceParams::default(),
            reducer: ReducerParams::default(),
            stacker: ReducerParams::default(),
            region_filter: RegionFilter::default(),
            variable: "no2".to_string(),
            persist_dir: None,  // Keep grids in memory only
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> TraceResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> TraceResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> TraceResult<()> {
        if self.variable.trim().is_empty() {
            return Err(TraceError::Config("variable name must not be empty".to_string()));
        }
        if self.source.field_path.trim().is_empty() {
            return Err(TraceError::Config("source field path must not be empty".to_string()));
        }
        if self.source.read_attempts == 0 {
            return Err(TraceError::Config("read_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Source files of one year, grouped by month
#[derive(Debug, Clone)]
pub struct YearGroup {
    pub year: i32,
    pub months: Vec<SourceGroup>,
}

/// Counts and details of everything the run had to leave out
#[derive(Debug, Default)]
pub struct RunSummary {
    pub files_read: usize,
    pub skipped_files: Vec<SkippedFile>,
    pub failed_groups: Vec<(String, TraceError)>,
    pub years_processed: usize,
    pub years_skipped: Vec<i32>,
    pub regions_evaluated: usize,
    pub unknown_regions: Vec<String>,
    pub region_failures: Vec<(Period, RegionFailure)>,
    pub nearest_grid_fallbacks: usize,
    pub trends_fitted: usize,
    pub undefined_trends: Vec<(String, TraceError)>,
}

impl RunSummary {
    fn absorb_report(&mut self, period: Period, report: &mut ZonalReport) {
        self.nearest_grid_fallbacks += report.count_by(Provenance::NearestGrid);
        for failure in report.failures.drain(..) {
            // Unknown regions are counted once, not once per period.
            if !matches!(failure.error, TraceError::UnknownRegion(_)) {
                self.region_failures.push((period, failure));
            }
        }
    }

    pub fn log(&self) {
        log::info!("Run summary:");
        log::info!("  source files read: {}", self.files_read);
        log::info!("  source files skipped: {}", self.skipped_files.len());
        log::info!("  period groups without data: {}", self.failed_groups.len());
        log::info!("  years processed: {}", self.years_processed);
        log::info!("  years skipped: {}", self.years_skipped.len());
        log::info!("  regions evaluated: {}", self.regions_evaluated);
        log::info!("  unknown regions: {}", self.unknown_regions.len());
        log::info!("  region-period failures: {}", self.region_failures.len());
        log::info!("  nearest-grid fallbacks: {}", self.nearest_grid_fallbacks);
        log::info!("  trends fitted: {}", self.trends_fitted);
        log::info!("  trends undefined: {}", self.undefined_trends.len());
    }
}

/// Everything a run produces
#[derive(Debug)]
pub struct PipelineOutput {
    pub table: RegionPeriodTable,
    pub trends: Vec<TrendResult>,
    pub trend_summary: TrendSummary,
    pub summary: RunSummary,
}

impl PipelineOutput {
    /// Write `region_period_stats.csv` and `trends.csv` into `dir`
    pub fn write_tables<P: AsRef<Path>>(&self, dir: P) -> TraceResult<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.table.write_csv(dir.join("region_period_stats.csv"))?;
        write_trends_csv(dir.join("trends.csv"), &self.trends)
    }
}

// Either an injected reader or the GDAL reader built from `config.source`.
enum SourceHandle<'a> {
    Injected(&'a dyn GridSource),
    Gdal(GdalGridSource),
}

impl SourceHandle<'_> {
    fn get(&self) -> &dyn GridSource {
        match self {
            SourceHandle::Injected(source) => *source,
            SourceHandle::Gdal(source) => source,
        }
    }
}

/// Raw grids → monthly means → annual means → region table → trends
pub struct Pipeline<'a> {
    config: PipelineConfig,
    source: SourceHandle<'a>,
    engine: ZonalEngine<'a>,
}

impl<'a> Pipeline<'a> {
    /// Pipeline reading through an injected source; `config.source` only
    /// contributes the field path.
    pub fn new(
        config: PipelineConfig,
        source: &'a dyn GridSource,
        regions: &'a dyn RegionSource,
    ) -> Self {
        let engine = ZonalEngine::with_filter(regions, &config.region_filter);
        Self {
            config,
            source: SourceHandle::Injected(source),
            engine,
        }
    }

    /// Pipeline reading HDF5 / netCDF files with a [`GdalGridSource`]
    /// configured from `config.source`
    pub fn with_gdal_source(config: PipelineConfig, regions: &'a dyn RegionSource) -> Self {
        let engine = ZonalEngine::with_filter(regions, &config.region_filter);
        log::debug!(
            "Reading field {} with up to {} attempts per file",
            config.source.field_path,
            config.source.read_attempts
        );
        Self {
            source: SourceHandle::Gdal(GdalGridSource::with_params(config.source.clone())),
            config,
            engine,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &ZonalEngine<'a> {
        &self.engine
    }

    /// Reduce each month's source files to a mean grid, in parallel.
    /// Returns (label, grid) for every month that had readable data.
    pub fn monthly_means(
        &self,
        months: &[SourceGroup],
        summary: &mut RunSummary,
    ) -> TraceResult<Vec<(String, ScalarGrid)>> {
        let reducer = GridReducer::with_params(self.config.reducer.clone());
        let out = reducer.reduce_groups(self.source.get(), months, &self.config.source.field_path)?;

        summary.failed_groups.extend(out.failures);
        let mut grids = Vec::with_capacity(out.reductions.len());
        for reduction in out.reductions {
            summary.files_read += reduction.files_used;
            summary.skipped_files.extend(reduction.skipped);
            grids.push((reduction.group, reduction.grid));
        }
        grids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(grids)
    }

    /// Stack monthly means into the annual mean and evaluate every region.
    /// `assignment` is reused when it matches the grid and rebuilt otherwise.
    pub fn annual_statistics(
        &self,
        year: i32,
        monthly: &[ScalarGrid],
        assignment: &mut Option<ZoneAssignment>,
    ) -> TraceResult<(ScalarGrid, ZonalReport)> {
        let annual = TemporalStacker::with_params(self.config.stacker.clone()).stack(monthly)?;

        if !assignment.as_ref().is_some_and(|a| a.matches(&annual)) {
            *assignment = Some(self.engine.rasterize(annual.coords())?);
        }
        let zones = assignment
            .as_ref()
            .ok_or_else(|| TraceError::InvalidGrid("zone assignment unavailable".to_string()))?;

        let report = self.engine.compute_with(&annual, zones, Period::year(year))?;
        Ok((annual, report))
    }

    fn persist(&self, name: &str, grid: &ScalarGrid) -> TraceResult<()> {
        if let Some(dir) = &self.config.persist_dir {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}_{}.nc", self.config.variable, name));
            write_grid(path, grid, &self.config.variable)?;
        }
        Ok(())
    }

    /// Run every year, then fit one trend per region across years
    pub fn run(&self, years: &[YearGroup]) -> TraceResult<PipelineOutput> {
        log::info!("Running pipeline over {} years", years.len());

        let mut summary = RunSummary {
            regions_evaluated: self.engine.regions().len(),
            unknown_regions: self.engine.unknown().to_vec(),
            ..Default::default()
        };
        let mut table = RegionPeriodTable::new();
        let mut assignment = None;

        for group in years {
            let monthly = self.monthly_means(&group.months, &mut summary)?;
            if monthly.is_empty() {
                log::warn!("Year {}: no monthly mean could be produced, skipping", group.year);
                summary.years_skipped.push(group.year);
                continue;
            }

            for (label, grid) in &monthly {
                self.persist(&format!("monthly_mean_{}", label), grid)?;
            }
            let grids: Vec<ScalarGrid> = monthly.into_iter().map(|(_, g)| g).collect();

            let (annual, mut report) = self.annual_statistics(group.year, &grids, &mut assignment)?;
            self.persist(&format!("annual_mean_{}", group.year), &annual)?;

            table.extend(std::mem::take(&mut report.observations).into_values());
            summary.absorb_report(Period::year(group.year), &mut report);
            summary.years_processed += 1;
        }

        let batch = fit_trends(&table.to_series()?);
        summary.trends_fitted = batch.fitted.len();
        summary.undefined_trends = batch.undefined;
        let trend_summary = TrendSummary::from_results(&batch.fitted);

        summary.log();
        Ok(PipelineOutput {
            table,
            trends: batch.fitted,
            trend_summary,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::boundaries::RegionCatalog;

    #[test]
    fn test_config_defaults_and_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            variable = "no2"
            persist_dir = "monthly_means"

            [reducer]
            min_valid_count = 3

            [region_filter]
            ids = ["CHN"]
            "#,
        )
        .unwrap();
        assert_eq!(config.reducer.min_valid_count, 3);
        assert_eq!(config.reducer.fill_threshold, -1e20);
        assert_eq!(config.stacker.min_valid_count, 1);
        assert_eq!(config.source.read_attempts, 2);
        assert_eq!(config.region_filter.ids.as_deref(), Some(&["CHN".to_string()][..]));
        assert_eq!(config.persist_dir, Some(PathBuf::from("monthly_means")));
    }

    #[test]
    fn test_gdal_source_takes_source_params() {
        let config = PipelineConfig::from_toml_str(
            "[source]\nread_attempts = 4\nfill_threshold = -1e30\n",
        )
        .unwrap();
        let regions = RegionCatalog::default();
        let pipeline = Pipeline::with_gdal_source(config, &regions);

        let SourceHandle::Gdal(source) = &pipeline.source else {
            panic!("expected a GDAL source");
        };
        assert_eq!(source.params().read_attempts, 4);
        assert_eq!(source.params().fill_threshold, -1e30);
        assert_eq!(source.params().field_path, pipeline.config().source.field_path);
        assert!(pipeline.engine().regions().is_empty());
    }

    #[test]
    fn test_unreadable_gdal_inputs_skip_the_year() {
        let regions = RegionCatalog::default();
        let pipeline = Pipeline::with_gdal_source(PipelineConfig::default(), &regions);
        let years = vec![YearGroup {
            year: 2005,
            months: vec![SourceGroup::new(
                "2005-01",
                vec![PathBuf::from("missing/OMI-Aura_L3-OMNO2d_2005m0101.he5")],
            )],
        }];

        let output = pipeline.run(&years).unwrap();
        assert!(output.table.is_empty());
        assert_eq!(output.summary.years_skipped, [2005]);
        assert!(matches!(
            output.summary.failed_groups[0].1,
            TraceError::NoValidSource { .. }
        ));
    }

    #[test]
    fn test_config_rejects_zero_attempts() {
        let result = PipelineConfig::from_toml_str("[source]\nread_attempts = 0\n");
        assert!(matches!(result, Err(TraceError::Config(_))));
    }

    #[test]
    fn test_config_rejects_malformed_toml() {
        let result = PipelineConfig::from_toml_str("variable = ");
        assert!(matches!(result, Err(TraceError::Toml(_))));
    }
}
