//! Flat CSV view of a sweep table.
//!
//! Column layout: `index, status, pass, nominal_index, perturbed`, then one
//! column per parameter key, then the output columns with array outputs
//! expanded as `name[0]`, `name[1]`, .... NaN values are written as `NaN`.

use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::info;

use ps_types::{OutputDef, OutputKind, OutputValue, RunRecord, RunStatus, StoreError, SweepResult};

const LEADING: [&str; 5] = ["index", "status", "pass", "nominal_index", "perturbed"];

fn csv_err(e: csv::Error) -> StoreError {
    StoreError::Csv(e.to_string())
}

fn bad_row(line: usize, message: impl std::fmt::Display) -> StoreError {
    StoreError::Csv(format!("line {line}: {message}"))
}

/// Header names of the output columns.
pub fn output_columns(defs: &[OutputDef]) -> Vec<String> {
    defs.iter()
        .flat_map(|def| match def.kind {
            OutputKind::Scalar => vec![def.name.clone()],
            OutputKind::Array { len } => (0..len).map(|i| format!("{}[{i}]", def.name)).collect(),
        })
        .collect()
}

/// Records and parameter keys read back from a CSV export.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    pub parameter_keys: Vec<String>,
    pub records: Vec<RunRecord>,
}

/// Write `result` as a flat CSV table.
pub fn export_csv(result: &SweepResult, path: impl AsRef<Path>) -> Result<(), StoreError> {
    write_records(&result.parameter_keys, &result.outputs, &result.records, path)
}

/// Write arbitrary records with the sweep CSV layout.
pub fn write_records(
    keys: &[String],
    defs: &[OutputDef],
    records: &[RunRecord],
    path: impl AsRef<Path>,
) -> Result<(), StoreError> {
    let path = path.as_ref();
    let mut writer = WriterBuilder::new().from_path(path).map_err(csv_err)?;

    let header: Vec<String> = LEADING
        .iter()
        .map(|s| s.to_string())
        .chain(keys.iter().cloned())
        .chain(output_columns(defs))
        .collect();
    writer.write_record(&header).map_err(csv_err)?;

    for record in records {
        let mut row = vec![
            record.index.to_string(),
            record.status.as_str().to_string(),
            record.pass.to_string(),
            record.nominal_index.map(|i| i.to_string()).unwrap_or_default(),
            record.perturbed.clone().unwrap_or_default(),
        ];
        row.extend(record.inputs.iter().map(f64::to_string));
        row.extend(
            record
                .outputs
                .iter()
                .flat_map(|value| value.as_slice().iter().map(f64::to_string)),
        );
        if row.len() != header.len() {
            return Err(StoreError::Corrupt {
                message: format!("run {} does not match the table width", record.index),
            });
        }
        writer.write_record(&row).map_err(csv_err)?;
    }
    writer.flush()?;

    info!("Exported {} runs to {}", records.len(), path.display());
    Ok(())
}

fn parse_f64(field: &str, line: usize) -> Result<f64, StoreError> {
    field
        .trim()
        .parse::<f64>()
        .map_err(|e| bad_row(line, format!("invalid number {field:?}: {e}")))
}

fn parse_usize(field: &str, line: usize) -> Result<usize, StoreError> {
    field
        .trim()
        .parse::<usize>()
        .map_err(|e| bad_row(line, format!("invalid integer {field:?}: {e}")))
}

/// Read a CSV export back. `defs` gives the output shapes, which occupy the
/// trailing columns; everything between the leading columns and the outputs
/// is a parameter.
pub fn read_csv(path: impl AsRef<Path>, defs: &[OutputDef]) -> Result<CsvTable, StoreError> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path).map_err(csv_err)?;
    let headers: StringRecord = reader.headers().map_err(csv_err)?.clone();

    let out_cols = output_columns(defs);
    if headers.len() < LEADING.len() + out_cols.len() {
        return Err(StoreError::Csv(format!("{} has too few columns", path.display())));
    }
    if headers.iter().take(LEADING.len()).ne(LEADING.iter().copied()) {
        return Err(StoreError::Csv(format!("{} is not a sweep export", path.display())));
    }
    let param_end = headers.len() - out_cols.len();
    if headers.iter().skip(param_end).ne(out_cols.iter().map(String::as_str)) {
        return Err(StoreError::Csv("output columns do not match the declared outputs".to_string()));
    }
    let parameter_keys: Vec<String> = headers
        .iter()
        .take(param_end)
        .skip(LEADING.len())
        .map(str::to_string)
        .collect();

    let mut records = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let line = row + 2;
        let fields = result.map_err(csv_err)?;
        let status = RunStatus::parse(&fields[1]).ok_or_else(|| bad_row(line, format!("unknown status {}", &fields[1])))?;

        let inputs = (LEADING.len()..param_end)
            .map(|c| parse_f64(&fields[c], line))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cursor = param_end;
        let mut outputs = Vec::with_capacity(defs.len());
        for def in defs {
            let value = match def.kind {
                OutputKind::Scalar => OutputValue::Scalar(parse_f64(&fields[cursor], line)?),
                OutputKind::Array { len } => OutputValue::Array(
                    (cursor..cursor + len)
                        .map(|c| parse_f64(&fields[c], line))
                        .collect::<Result<_, _>>()?,
                ),
            };
            cursor += def.width();
            outputs.push(value);
        }

        let mut record = RunRecord::new(inputs, outputs, status);
        record.index = parse_usize(&fields[0], line)?;
        record.pass = parse_usize(&fields[2], line)?;
        record.nominal_index = match fields[3].trim() {
            "" => None,
            v => Some(parse_usize(v, line)?),
        };
        record.perturbed = Some(fields[4].to_string()).filter(|s| !s.is_empty());
        records.push(record);
    }

    info!("Read {} runs from {}", records.len(), path.display());
    Ok(CsvTable {
        parameter_keys,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_types::{BackendKind, StrategyKind, SweepMetadata};
    use tempfile::tempdir;

    fn table() -> SweepResult {
        let mut result = SweepResult::new(
            SweepMetadata::new("csv", StrategyKind::Simple, BackendKind::Serial),
            vec!["flow".into(), "temp".into()],
            vec![OutputDef::scalar("cost"), OutputDef::array("profile", 2)],
        );
        result.records = vec![
            RunRecord::new(
                vec![0.1, 300.0],
                vec![OutputValue::Scalar(1.0 / 3.0), OutputValue::Array(vec![1e-12, -2.5])],
                RunStatus::Success,
            ),
            RunRecord::new(
                vec![0.2, 310.0],
                vec![OutputValue::Scalar(f64::NAN), OutputValue::Array(vec![f64::NAN, f64::NAN])],
                RunStatus::Infeasible,
            ),
        ];
        result.reindex();
        result
    }

    #[test]
    fn header_expands_arrays() {
        let defs = vec![OutputDef::scalar("a"), OutputDef::array("b", 3)];
        assert_eq!(output_columns(&defs), vec!["a", "b[0]", "b[1]", "b[2]"]);
    }

    #[test]
    fn nan_is_written_as_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        export_csv(&table(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("index,status,pass,nominal_index,perturbed,flow,temp,cost,profile[0],profile[1]"));
        assert!(text.contains("infeasible,0,,,0.2,310,NaN,NaN,NaN"));
    }

    #[test]
    fn csv_round_trip_is_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let original = table();
        export_csv(&original, &path).unwrap();

        let back = read_csv(&path, &original.outputs).unwrap();
        assert_eq!(back.parameter_keys, original.parameter_keys);
        assert_eq!(back.records.len(), 2);
        for (a, b) in back.records.iter().zip(&original.records) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.status, b.status);
            assert_eq!(a.inputs, b.inputs);
            assert!(a.outputs.iter().zip(&b.outputs).all(|(x, y)| x.bit_eq(y)));
        }
    }

    #[test]
    fn mismatched_outputs_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        export_csv(&table(), &path).unwrap();
        let wrong = vec![OutputDef::scalar("cost"), OutputDef::array("profile", 3)];
        assert!(matches!(read_csv(&path, &wrong), Err(StoreError::Csv(_))));
    }
}
