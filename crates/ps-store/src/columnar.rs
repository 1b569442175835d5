//! Arrow/Parquet encoding of the three tables in a sweep container.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Float64Builder, ListArray, ListBuilder, StringArray, UInt64Array};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use ps_types::{OutputDef, OutputKind, OutputValue, RunRecord, RunStatus, StoreError, TerminationCondition};

pub(crate) const INDEX_COLUMN: &str = "index";

fn arrow_err(e: arrow::error::ArrowError) -> StoreError {
    StoreError::Arrow(e.to_string())
}

fn parquet_err(e: parquet::errors::ParquetError) -> StoreError {
    StoreError::Parquet(e.to_string())
}

fn corrupt(message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        message: message.into(),
    }
}

fn build_batch(columns: Vec<(String, ArrayRef, bool)>, rows: usize) -> Result<RecordBatch, StoreError> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array, nullable)| Field::new(name, array.data_type().clone(), *nullable))
        .collect();
    let arrays = columns.into_iter().map(|(_, array, _)| array).collect();
    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options).map_err(arrow_err)
}

fn index_column(records: &[RunRecord]) -> (String, ArrayRef, bool) {
    let index: Vec<u64> = records.iter().map(|r| r.index as u64).collect();
    (INDEX_COLUMN.to_string(), Arc::new(UInt64Array::from(index)) as ArrayRef, false)
}

fn output_of<'a>(record: &'a RunRecord, col: usize, def: &OutputDef) -> Result<&'a OutputValue, StoreError> {
    record
        .outputs
        .get(col)
        .ok_or_else(|| corrupt(format!("run {} lacks output {}", record.index, def.name)))
}

/// One Float64 column per parameter key.
pub(crate) fn parameters_batch(keys: &[String], records: &[RunRecord]) -> Result<RecordBatch, StoreError> {
    let mut columns = vec![index_column(records)];
    for (col, key) in keys.iter().enumerate() {
        let values: Vec<f64> = records
            .iter()
            .map(|r| r.inputs.get(col).copied().ok_or_else(|| corrupt(format!("run {} lacks input {key}", r.index))))
            .collect::<Result<_, _>>()?;
        columns.push((key.clone(), Arc::new(Float64Array::from(values)) as ArrayRef, false));
    }
    build_batch(columns, records.len())
}

/// Float64 columns for scalar outputs, List<Float64> for array outputs.
pub(crate) fn outputs_batch(defs: &[OutputDef], records: &[RunRecord]) -> Result<RecordBatch, StoreError> {
    let mut columns = vec![index_column(records)];
    for (col, def) in defs.iter().enumerate() {
        let array: ArrayRef = match def.kind {
            OutputKind::Scalar => {
                let values: Vec<f64> = records
                    .iter()
                    .map(|r| {
                        output_of(r, col, def)?
                            .as_scalar()
                            .ok_or_else(|| corrupt(format!("output {} of run {} is not scalar", def.name, r.index)))
                    })
                    .collect::<Result<_, _>>()?;
                Arc::new(Float64Array::from(values))
            }
            OutputKind::Array { len } => {
                let mut builder = ListBuilder::new(Float64Builder::new());
                for r in records {
                    let values = output_of(r, col, def)?.as_slice();
                    if values.len() != len {
                        return Err(corrupt(format!(
                            "output {} of run {} has {} elements, expected {len}",
                            def.name,
                            r.index,
                            values.len()
                        )));
                    }
                    builder.values().append_slice(values);
                    builder.append(true);
                }
                Arc::new(builder.finish())
            }
        };
        columns.push((def.name.clone(), array, false));
    }
    build_batch(columns, records.len())
}

/// Status, pass, differential linkage and solver diagnostics per run.
pub(crate) fn status_batch(records: &[RunRecord]) -> Result<RecordBatch, StoreError> {
    let status: Vec<&str> = records.iter().map(|r| r.status.as_str()).collect();
    let pass: Vec<u64> = records.iter().map(|r| r.pass as u64).collect();
    let nominal: Vec<Option<u64>> = records.iter().map(|r| r.nominal_index.map(|i| i as u64)).collect();
    let perturbed: Vec<Option<String>> = records.iter().map(|r| r.perturbed.clone()).collect();
    let termination: Vec<Option<String>> = records
        .iter()
        .map(|r| r.termination.as_ref().map(ToString::to_string))
        .collect();
    let diagnostic: Vec<Option<String>> = records.iter().map(|r| r.diagnostic.clone()).collect();

    let columns = vec![
        index_column(records),
        ("status".to_string(), Arc::new(StringArray::from(status)) as ArrayRef, false),
        ("pass".to_string(), Arc::new(UInt64Array::from(pass)) as ArrayRef, false),
        ("nominal_index".to_string(), Arc::new(UInt64Array::from(nominal)) as ArrayRef, true),
        ("perturbed".to_string(), Arc::new(StringArray::from(perturbed)) as ArrayRef, true),
        ("termination".to_string(), Arc::new(StringArray::from(termination)) as ArrayRef, true),
        ("diagnostic".to_string(), Arc::new(StringArray::from(diagnostic)) as ArrayRef, true),
    ];
    build_batch(columns, records.len())
}

pub(crate) fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<(), StoreError> {
    let file = File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(parquet_err)?;
    writer.write(batch).map_err(parquet_err)?;
    writer.close().map_err(parquet_err)?;
    Ok(())
}

pub(crate) fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>, StoreError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| corrupt(format!("cannot open {}: {e}", path.display())))?
        .build()
        .map_err(parquet_err)?;
    reader.map(|batch| batch.map_err(arrow_err)).collect()
}

fn column<'a, A: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a A, StoreError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| corrupt(format!("missing column {name}")))?
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| corrupt(format!("column {name} has unexpected type")))
}

fn opt_string(array: &StringArray, i: usize) -> Option<String> {
    (!array.is_null(i)).then(|| array.value(i).to_string())
}

/// Rebuild records from the three tables, ordered by the index column.
pub(crate) fn decode_records(
    keys: &[String],
    defs: &[OutputDef],
    parameters: &[RecordBatch],
    outputs: &[RecordBatch],
    status: &[RecordBatch],
) -> Result<Vec<RunRecord>, StoreError> {
    let mut records = Vec::new();
    for batch in status {
        let index = column::<UInt64Array>(batch, INDEX_COLUMN)?;
        let state = column::<StringArray>(batch, "status")?;
        let pass = column::<UInt64Array>(batch, "pass")?;
        let nominal = column::<UInt64Array>(batch, "nominal_index")?;
        let perturbed = column::<StringArray>(batch, "perturbed")?;
        let termination = column::<StringArray>(batch, "termination")?;
        let diagnostic = column::<StringArray>(batch, "diagnostic")?;

        for i in 0..batch.num_rows() {
            let status = RunStatus::parse(state.value(i))
                .ok_or_else(|| corrupt(format!("unknown run status {}", state.value(i))))?;
            let mut record = RunRecord::new(Vec::with_capacity(keys.len()), Vec::with_capacity(defs.len()), status);
            record.index = index.value(i) as usize;
            record.pass = pass.value(i) as usize;
            record.nominal_index = (!nominal.is_null(i)).then(|| nominal.value(i) as usize);
            record.perturbed = opt_string(perturbed, i);
            record.termination = opt_string(termination, i).map(|t| TerminationCondition::parse(&t));
            record.diagnostic = opt_string(diagnostic, i);
            records.push(record);
        }
    }

    let mut row = 0;
    for batch in parameters {
        let index = column::<UInt64Array>(batch, INDEX_COLUMN)?;
        let cols = keys
            .iter()
            .map(|k| column::<Float64Array>(batch, k))
            .collect::<Result<Vec<_>, _>>()?;
        for i in 0..batch.num_rows() {
            let record = records
                .get_mut(row)
                .filter(|r| r.index as u64 == index.value(i))
                .ok_or_else(|| corrupt("parameter table misaligned with status table"))?;
            record.inputs = cols.iter().map(|c| c.value(i)).collect();
            row += 1;
        }
    }

    let mut row = 0;
    for batch in outputs {
        let index = column::<UInt64Array>(batch, INDEX_COLUMN)?;
        for i in 0..batch.num_rows() {
            let mut values = Vec::with_capacity(defs.len());
            for def in defs {
                let value = match def.kind {
                    OutputKind::Scalar => OutputValue::Scalar(column::<Float64Array>(batch, &def.name)?.value(i)),
                    OutputKind::Array { .. } => {
                        let list = column::<ListArray>(batch, &def.name)?.value(i);
                        let items = list
                            .as_any()
                            .downcast_ref::<Float64Array>()
                            .ok_or_else(|| corrupt(format!("column {} has unexpected item type", def.name)))?;
                        OutputValue::Array(items.values().to_vec())
                    }
                };
                values.push(value);
            }
            let record = records
                .get_mut(row)
                .filter(|r| r.index as u64 == index.value(i))
                .ok_or_else(|| corrupt("output table misaligned with status table"))?;
            record.outputs = values;
            row += 1;
        }
    }

    if records.iter().any(|r| r.inputs.len() != keys.len() || r.outputs.len() != defs.len()) {
        return Err(corrupt("tables have different row counts"));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_is_rejected() {
        let defs = vec![OutputDef::array("profile", 3)];
        let records = vec![RunRecord::new(vec![1.0], vec![OutputValue::Array(vec![1.0, 2.0])], RunStatus::Success)];
        assert!(matches!(outputs_batch(&defs, &records), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn empty_tables_still_carry_schema() {
        let keys = vec!["a".to_string()];
        let batch = parameters_batch(&keys, &[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 2);
        assert!(batch.column_by_name("a").is_some());
    }
}
