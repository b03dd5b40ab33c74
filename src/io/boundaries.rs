use crate::types::{RegionPolygon, TraceError, TraceResult};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::{Geometry, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Read-only provider of region polygons keyed by identifier
pub trait RegionSource: Send + Sync {
    fn regions(&self) -> &[RegionPolygon];

    fn get(&self, id: &str) -> Option<&RegionPolygon>;
}

/// Attribute names used when loading boundaries from a vector file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryFields {
    pub id: String,
    pub name: String,
    pub continent: String,
}

impl Default for BoundaryFields {
    fn default() -> Self {
        Self {
            id: "ISO_A3".to_string(),
            name: "NAME".to_string(),
            continent: "CONTINENT".to_string(),
        }
    }
}

/// Which regions to evaluate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionFilter {
    /// Explicit identifiers, in output order; `None` selects every region
    pub ids: Option<Vec<String>>,
    /// Keep only regions of this continent/group
    pub continent: Option<String>,
}

impl RegionFilter {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            continent: None,
        }
    }

    pub fn continent(continent: impl Into<String>) -> Self {
        Self {
            ids: None,
            continent: Some(continent.into()),
        }
    }

    /// Selected regions plus the requested identifiers the source lacks
    pub fn select<'a>(&self, source: &'a dyn RegionSource) -> (Vec<&'a RegionPolygon>, Vec<String>) {
        let in_group = |r: &RegionPolygon| {
            self.continent
                .as_deref()
                .map_or(true, |c| r.continent.eq_ignore_ascii_case(c))
        };

        match &self.ids {
            None => (source.regions().iter().filter(|r| in_group(*r)).collect(), Vec::new()),
            Some(ids) => {
                let mut seen = HashSet::new();
                let mut selected = Vec::new();
                let mut unknown = Vec::new();
                for id in ids.iter().filter(|id| seen.insert(id.as_str())) {
                    match source.get(id) {
                        Some(region) if in_group(region) => selected.push(region),
                        Some(region) => log::debug!(
                            "Region {} excluded: continent {} not selected",
                            id,
                            region.continent
                        ),
                        None => unknown.push(id.clone()),
                    }
                }
                (selected, unknown)
            }
        }
    }
}

/// In-memory boundary collection indexed by identifier
#[derive(Debug, Clone, Default)]
pub struct RegionCatalog {
    regions: Vec<RegionPolygon>,
    index: HashMap<String, usize>,
}

impl RegionCatalog {
    /// Build a catalog; when an identifier repeats the first region wins
    pub fn new(regions: Vec<RegionPolygon>) -> Self {
        let mut kept = Vec::with_capacity(regions.len());
        let mut index = HashMap::new();
        for region in regions {
            if index.contains_key(&region.id) {
                log::warn!("Duplicate region identifier {} ignored", region.id);
                continue;
            }
            index.insert(region.id.clone(), kept.len());
            kept.push(region);
        }
        Self {
            regions: kept,
            index,
        }
    }

    /// Load polygons from the first layer of an OGR-readable file
    pub fn from_vector_file<P: AsRef<Path>>(path: P, fields: &BoundaryFields) -> TraceResult<Self> {
        let path = path.as_ref();
        log::info!("Loading region boundaries from {}", path.display());

        let dataset = Dataset::open(path)?;
        let mut layer = dataset.layer(0)?;
        let mut regions = Vec::new();
        let mut skipped = 0usize;

        for feature in layer.features() {
            let id = match feature.field_as_string_by_name(&fields.id)? {
                Some(id) if !id.trim().is_empty() => id.trim().to_string(),
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            let name = feature
                .field_as_string_by_name(&fields.name)?
                .unwrap_or_else(|| id.clone());
            let continent = feature
                .field_as_string_by_name(&fields.continent)?
                .unwrap_or_default();

            let geometry = match feature.geometry() {
                Some(geometry) => polygons_of(geometry.to_geo()?),
                None => None,
            };
            let Some(geometry) = geometry else {
                log::warn!("Region {} has no polygonal geometry, skipping", id);
                skipped += 1;
                continue;
            };

            regions.push(RegionPolygon {
                id,
                name,
                continent,
                geometry,
            });
        }

        log::info!("Loaded {} regions ({} features skipped)", regions.len(), skipped);
        if regions.is_empty() {
            return Err(TraceError::Config(format!(
                "no usable region polygons in {}",
                path.display()
            )));
        }
        Ok(Self::new(regions))
    }

    /// Copy of the regions `filter` selects, plus requested ids not found
    pub fn filtered(&self, filter: &RegionFilter) -> (RegionCatalog, Vec<TraceError>) {
        let (selected, unknown) = filter.select(self);
        let catalog = Self::new(selected.into_iter().cloned().collect());
        (catalog, unknown.into_iter().map(TraceError::UnknownRegion).collect())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl RegionSource for RegionCatalog {
    fn regions(&self) -> &[RegionPolygon] {
        &self.regions
    }

    fn get(&self, id: &str) -> Option<&RegionPolygon> {
        self.index.get(id).map(|&i| &self.regions[i])
    }
}

fn polygons_of(geometry: Geometry<f64>) -> Option<MultiPolygon<f64>> {
    let polygons: Vec<Polygon<f64>> = match geometry {
        Geometry::Polygon(p) => vec![p],
        Geometry::MultiPolygon(mp) => mp.0,
        Geometry::GeometryCollection(gc) => gc
            .0
            .into_iter()
            .filter_map(polygons_of)
            .flat_map(|mp| mp.0)
            .collect(),
        _ => Vec::new(),
    };
    (!polygons.is_empty()).then(|| MultiPolygon(polygons))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};

    fn region(id: &str, continent: &str) -> RegionPolygon {
        RegionPolygon {
            id: id.to_string(),
            name: id.to_lowercase(),
            continent: continent.to_string(),
            geometry: MultiPolygon(vec![polygon![
                (x: 0.0, y: 0.0),
                (x: 1.0, y: 0.0),
                (x: 1.0, y: 1.0),
                (x: 0.0, y: 0.0),
            ]]),
        }
    }

    fn catalog() -> RegionCatalog {
        RegionCatalog::new(vec![
            region("NGA", "Africa"),
            region("CHN", "Asia"),
            region("KEN", "Africa"),
            region("NGA", "Asia"),
        ])
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("NGA").unwrap().continent, "Africa");
    }

    #[test]
    fn test_filter_by_continent() {
        let catalog = catalog();
        let (selected, unknown) = RegionFilter::continent("africa").select(&catalog);
        let ids: Vec<&str> = selected.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["NGA", "KEN"]);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_filter_by_ids_reports_unknown() {
        let catalog = catalog();
        let (selected, unknown) = RegionFilter::ids(["KEN", "XXX", "KEN", "CHN"]).select(&catalog);
        let ids: Vec<&str> = selected.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["KEN", "CHN"]);
        assert_eq!(unknown, ["XXX"]);
    }

    #[test]
    fn test_filtered_catalog() {
        let (subset, unknown) = catalog().filtered(&RegionFilter::ids(["CHN", "ZZZ"]));
        assert_eq!(subset.len(), 1);
        assert!(subset.get("CHN").is_some());
        assert!(matches!(unknown.as_slice(), [TraceError::UnknownRegion(id)] if id == "ZZZ"));
    }

    #[test]
    fn test_non_polygonal_geometry_rejected() {
        assert!(polygons_of(Geometry::Point(point!(x: 1.0, y: 2.0))).is_none());
        let poly = region("AAA", "Africa").geometry;
        assert_eq!(polygons_of(Geometry::MultiPolygon(poly)).unwrap().0.len(), 1);
    }
}
