use std::io::Write;
use tracegas::core::PipelineConfig;
use tracegas::types::TraceError;

#[test]
fn test_config_loaded_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
variable = "so2"

[source]
field_path = "HDFEOS/GRIDS/OMI Total Column Amount SO2/Data Fields/ColumnAmountSO2"
read_attempts = 4

[stacker]
min_valid_count = 10

[region_filter]
continent = "Africa"
"#
    )
    .unwrap();

    let config = PipelineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.variable, "so2");
    assert_eq!(config.source.read_attempts, 4);
    assert!(config.source.field_path.ends_with("ColumnAmountSO2"));
    assert_eq!(config.stacker.min_valid_count, 10);
    assert_eq!(config.reducer.min_valid_count, 1);
    assert_eq!(config.region_filter.continent.as_deref(), Some("Africa"));
    assert!(config.region_filter.ids.is_none());
    assert!(config.persist_dir.is_none());
}

#[test]
fn test_missing_config_file_is_io_error() {
    let result = PipelineConfig::from_file("/nonexistent/tracegas.toml");
    assert!(matches!(result, Err(TraceError::Io(_))));
}

#[test]
fn test_empty_variable_rejected() {
    let result = PipelineConfig::from_toml_str("variable = \"  \"\n");
    assert!(matches!(result, Err(TraceError::Config(_))));
}
