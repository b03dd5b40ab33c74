use crate::types::{
    Period, Provenance, RegionObservation, RegionTimeSeries, TraceError, TraceResult, TrendResult,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const REGION_HEADER: [&str; 6] = [
    "period",
    "region_id",
    "region_name",
    "value",
    "provenance",
    "cell_count",
];
const TREND_HEADER: [&str; 3] = ["region_id", "slope", "sample_count"];

/// Flat per-period region statistics, one row per (period, region)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionPeriodTable {
    rows: Vec<RegionObservation>,
}

impl RegionPeriodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_observations<I: IntoIterator<Item = RegionObservation>>(rows: I) -> Self {
        Self {
            rows: rows.into_iter().collect(),
        }
    }

    pub fn rows(&self) -> &[RegionObservation] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn extend<I: IntoIterator<Item = RegionObservation>>(&mut self, rows: I) {
        self.rows.extend(rows);
    }

    /// Concatenate per-period tables
    pub fn concat<I: IntoIterator<Item = RegionPeriodTable>>(tables: I) -> Self {
        let mut out = Self::new();
        for table in tables {
            out.rows.extend(table.rows);
        }
        out
    }

    /// Group rows into one period-sorted series per region (ordered by id)
    pub fn to_series(&self) -> TraceResult<Vec<RegionTimeSeries>> {
        let mut by_region: BTreeMap<&str, Vec<(Period, f64)>> = BTreeMap::new();
        for row in &self.rows {
            by_region
                .entry(row.region_id.as_str())
                .or_default()
                .push((row.period, row.value));
        }
        by_region
            .into_iter()
            .map(|(id, points)| RegionTimeSeries::new(id, points))
            .collect()
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> TraceResult<()> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        write_record(&mut out, &REGION_HEADER)?;
        for row in &self.rows {
            let period = row.period.to_string();
            let value = row.value.to_string();
            let cell_count = row.cell_count.to_string();
            write_record(
                &mut out,
                &[
                    period.as_str(),
                    row.region_id.as_str(),
                    row.region_name.as_str(),
                    value.as_str(),
                    row.provenance.as_str(),
                    cell_count.as_str(),
                ],
            )?;
        }
        out.flush()?;
        log::info!("Wrote {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> TraceResult<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines().enumerate();

        match lines.next() {
            Some((_, header)) => check_header(&split_record(&header?)?, &REGION_HEADER)?,
            None => return Ok(Self::new()),
        }

        let mut rows = Vec::new();
        for (n, line) in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_record(&line)?;
            let [period, id, name, value, provenance, cell_count] = fields.as_slice() else {
                return Err(TraceError::Table(format!(
                    "{} line {}: expected {} fields, found {}",
                    path.display(),
                    n + 1,
                    REGION_HEADER.len(),
                    fields.len()
                )));
            };
            let value = value.trim().parse::<f64>().map_err(|e| {
                TraceError::Table(format!("{} line {}: bad value: {}", path.display(), n + 1, e))
            })?;
            let cell_count = cell_count.trim().parse::<usize>().map_err(|e| {
                TraceError::Table(format!("{} line {}: bad cell count: {}", path.display(), n + 1, e))
            })?;
            let period = Period::parse(period)?;
            rows.push(RegionObservation {
                region_id: id.clone(),
                region_name: name.clone(),
                period,
                value,
                provenance: Provenance::parse(provenance)?,
                cell_count,
            });
        }
        Ok(Self { rows })
    }
}

/// Write the trend table: region id, slope, sample count
pub fn write_trends_csv<P: AsRef<Path>>(path: P, trends: &[TrendResult]) -> TraceResult<()> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    write_record(&mut out, &TREND_HEADER)?;
    for trend in trends {
        let slope = trend.slope.to_string();
        let count = trend.sample_count.to_string();
        write_record(&mut out, &[trend.region_id.as_str(), slope.as_str(), count.as_str()])?;
    }
    out.flush()?;
    log::info!("Wrote {} trends to {}", trends.len(), path.display());
    Ok(())
}

fn check_header(found: &[String], expected: &[&str]) -> TraceResult<()> {
    if found.len() == expected.len() && found.iter().zip(expected).all(|(f, e)| f.trim() == *e) {
        Ok(())
    } else {
        Err(TraceError::Table(format!(
            "unexpected header {:?}, expected {:?}",
            found, expected
        )))
    }
}

fn write_record<W: Write, S: AsRef<str>>(out: &mut W, fields: &[S]) -> std::io::Result<()> {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.write_all(b",")?;
        }
        let field = field.as_ref();
        if field.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
            write!(out, "\"{}\"", field.replace('"', "\"\""))?;
        } else {
            out.write_all(field.as_bytes())?;
        }
    }
    out.write_all(b"\n")
}

fn split_record(line: &str) -> TraceResult<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            (c, _) => field.push(c),
        }
    }
    if quoted {
        return Err(TraceError::Table(format!("unterminated quote in '{}'", line)));
    }
    fields.push(field);
    Ok(fields)
}
