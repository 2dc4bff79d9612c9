//! Parquet export of weekly median tables.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use hrva_core::WeeklyMedian;
use parquet::arrow::ArrowWriter;

fn weekly_median_batch(rows: &[WeeklyMedian]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("client_id", DataType::Int64, true),
        ArrowField::new("origin", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("profile", DataType::Utf8, true),
        ArrowField::new("median_options", DataType::Float64, true),
        ArrowField::new("median_options_2", DataType::Float64, true),
        ArrowField::new("median_options_3", DataType::Float64, true),
    ]));

    let client_ids = Int64Array::from(rows.iter().map(|r| r.client_id).collect::<Vec<_>>());
    let origins = StringArray::from(
        rows.iter()
            .map(|r| Some(r.origin.as_str()))
            .collect::<Vec<_>>(),
    );
    let cities = StringArray::from(rows.iter().map(|r| r.city.as_deref()).collect::<Vec<_>>());
    let profiles = StringArray::from(rows.iter().map(|r| r.profile.as_deref()).collect::<Vec<_>>());
    let medians = Float64Array::from(rows.iter().map(|r| r.median_options).collect::<Vec<_>>());
    let medians_2 = Float64Array::from(rows.iter().map(|r| r.median_options_2).collect::<Vec<_>>());
    let medians_3 = Float64Array::from(rows.iter().map(|r| r.median_options_3).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(client_ids),
            Arc::new(origins),
            Arc::new(cities),
            Arc::new(profiles),
            Arc::new(medians),
            Arc::new(medians_2),
            Arc::new(medians_3),
        ],
    )
    .context("building weekly median record batch")
}

pub fn export_weekly_median_parquet(path: &Path, rows: &[WeeklyMedian]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let batch = weekly_median_batch(rows)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrva_core::Origin;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tempfile::tempdir;

    #[test]
    fn writes_one_row_per_group() {
        let rows = vec![
            WeeklyMedian {
                client_id: Some(132),
                origin: Origin::Hv,
                city: Some("Москва".into()),
                profile: Some("Cashier".into()),
                median_options: Some(4.5),
                median_options_2: Some(1.0),
                median_options_3: None,
            },
            WeeklyMedian {
                client_id: Some(132),
                origin: Origin::Hv,
                city: None,
                profile: Some("Picker".into()),
                median_options: Some(2.0),
                median_options_2: None,
                median_options_3: None,
            },
        ];
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out/weekly_median.parquet");
        export_weekly_median_parquet(&path, &rows).expect("export");

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        let meta = reader.metadata().file_metadata();
        assert_eq!(meta.num_rows(), 2);
        assert_eq!(meta.schema_descr().num_columns(), 7);
    }
}
