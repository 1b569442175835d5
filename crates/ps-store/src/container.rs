use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ps_types::{DifferentialSweepResult, OutputDef, StoreError, SweepMetadata, SweepResult, SweepWarning};

use crate::columnar::{self, INDEX_COLUMN};

const FORMAT_VERSION: u32 = 1;
const METADATA_FILE: &str = "metadata.json";
const PARAMETERS_FILE: &str = "parameters.parquet";
const OUTPUTS_FILE: &str = "outputs.parquet";
const STATUS_FILE: &str = "status.parquet";
const NOMINAL_GROUP: &str = "nominal";
const DIFFERENTIAL_GROUP: &str = "differential";
const STAGING_SUFFIX: &str = ".partial";

/// Everything in a sweep group that is not a table.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    metadata: SweepMetadata,
    parameter_keys: Vec<String>,
    outputs: Vec<OutputDef>,
    warnings: Vec<SweepWarning>,
}

/// Hierarchical directory container for sweep results.
///
/// A group path such as `"campaign/flow_sweep"` maps to nested directories
/// under the store root. Each sweep group holds `parameters.parquet`,
/// `outputs.parquet`, `status.parquet` and `metadata.json`; a differential
/// group holds `nominal/` and `differential/` sweep groups instead.
#[derive(Debug, Clone)]
pub struct SweepStore {
    root: PathBuf,
}

impl SweepStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a `/`-separated group path below the root.
    fn group_path(&self, group: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        for segment in group.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(StoreError::InvalidGroup {
                    path: group.to_string(),
                });
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Publish a new group. `write` fills a hidden staging directory next to
    /// the target, which is renamed into place only once every file is
    /// written; on failure the staging directory is removed and the group
    /// does not exist. Parents are created as needed and siblings are left
    /// alone.
    fn commit_group<F>(&self, group: &str, write: F) -> Result<PathBuf, StoreError>
    where
        F: FnOnce(&Path) -> Result<(), StoreError>,
    {
        let dir = self.group_path(group)?;
        if dir.exists() {
            return Err(StoreError::GroupExists {
                path: group.to_string(),
            });
        }
        let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) else {
            return Err(StoreError::InvalidGroup {
                path: group.to_string(),
            });
        };
        std::fs::create_dir_all(parent)?;

        let staging = parent.join(format!(".{}{STAGING_SUFFIX}", name.to_string_lossy()));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir(&staging)?;

        let committed = write(&staging).and_then(|()| std::fs::rename(&staging, &dir).map_err(StoreError::from));
        if let Err(e) = committed {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(group, error = %cleanup, "failed to remove staging directory");
            }
            return Err(e);
        }
        Ok(dir)
    }

    fn existing_group(&self, group: &str) -> Result<PathBuf, StoreError> {
        let dir = self.group_path(group)?;
        if !dir.is_dir() {
            return Err(StoreError::GroupNotFound {
                path: group.to_string(),
            });
        }
        Ok(dir)
    }

    /// Persist one sweep table as a new group. Nothing is left on disk when
    /// this fails.
    pub fn persist(&self, result: &SweepResult, group: &str) -> Result<PathBuf, StoreError> {
        let tables = EncodedTables::encode(result)?;
        let dir = self.commit_group(group, |staging| tables.write(staging))?;
        info!(
            group,
            runs = result.len(),
            successes = result.success_count(),
            "Persisted sweep to {}",
            dir.display()
        );
        Ok(dir)
    }

    /// Read a sweep table back from `group`.
    pub fn load(&self, group: &str) -> Result<SweepResult, StoreError> {
        let dir = self.existing_group(group)?;
        let result = read_tables(&dir)?;
        debug!(group, runs = result.len(), "Loaded sweep");
        Ok(result)
    }

    /// Persist the nominal and differential tables under one group. Either
    /// both tables are published or neither is.
    pub fn persist_differential(&self, result: &DifferentialSweepResult, group: &str) -> Result<PathBuf, StoreError> {
        let nominal = EncodedTables::encode(&result.nominal)?;
        let differential = EncodedTables::encode(&result.differential)?;
        let dir = self.commit_group(group, |staging| {
            for (name, tables) in [(NOMINAL_GROUP, &nominal), (DIFFERENTIAL_GROUP, &differential)] {
                let child = staging.join(name);
                std::fs::create_dir(&child)?;
                tables.write(&child)?;
            }
            Ok(())
        })?;

        info!(
            group,
            nominal = result.nominal.len(),
            differential = result.differential.len(),
            "Persisted differential sweep to {}",
            dir.display()
        );
        Ok(dir)
    }

    pub fn load_differential(&self, group: &str) -> Result<DifferentialSweepResult, StoreError> {
        let dir = self.existing_group(group)?;
        Ok(DifferentialSweepResult {
            nominal: read_tables(&dir.join(NOMINAL_GROUP))?,
            differential: read_tables(&dir.join(DIFFERENTIAL_GROUP))?,
        })
    }

    /// Names of the sweep groups directly below `parent` (or the root),
    /// sorted. Plain and differential sweeps are both listed.
    pub fn list_sweeps(&self, parent: Option<&str>) -> Result<Vec<String>, StoreError> {
        let dir = match parent {
            Some(group) => self.existing_group(group)?,
            None => self.root.clone(),
        };

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let is_sweep =
                path.join(METADATA_FILE).is_file() || path.join(NOMINAL_GROUP).join(METADATA_FILE).is_file();
            if is_sweep {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// The index column shares the table namespace with keys and outputs.
fn check_column_names(result: &SweepResult) -> Result<(), StoreError> {
    let reserved = result
        .parameter_keys
        .iter()
        .chain(result.outputs.iter().map(|o| &o.name))
        .find(|name| name.as_str() == INDEX_COLUMN);
    match reserved {
        Some(name) => Err(StoreError::Corrupt {
            message: format!("column name {name:?} is reserved"),
        }),
        None => Ok(()),
    }
}

/// A sweep table fully converted to its on-disk form, so that every shape
/// or naming error surfaces before anything is written.
struct EncodedTables {
    parameters: RecordBatch,
    outputs: RecordBatch,
    status: RecordBatch,
    manifest: String,
}

impl EncodedTables {
    fn encode(result: &SweepResult) -> Result<Self, StoreError> {
        check_column_names(result)?;
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            metadata: result.metadata.clone(),
            parameter_keys: result.parameter_keys.clone(),
            outputs: result.outputs.clone(),
            warnings: result.warnings.clone(),
        };
        Ok(Self {
            parameters: columnar::parameters_batch(&result.parameter_keys, &result.records)?,
            outputs: columnar::outputs_batch(&result.outputs, &result.records)?,
            status: columnar::status_batch(&result.records)?,
            manifest: serde_json::to_string_pretty(&manifest)?,
        })
    }

    fn write(&self, dir: &Path) -> Result<(), StoreError> {
        columnar::write_parquet(&dir.join(PARAMETERS_FILE), &self.parameters)?;
        columnar::write_parquet(&dir.join(OUTPUTS_FILE), &self.outputs)?;
        columnar::write_parquet(&dir.join(STATUS_FILE), &self.status)?;
        std::fs::write(dir.join(METADATA_FILE), &self.manifest)?;
        Ok(())
    }
}

fn read_tables(dir: &Path) -> Result<SweepResult, StoreError> {
    let manifest_path = dir.join(METADATA_FILE);
    if !manifest_path.is_file() {
        return Err(StoreError::Corrupt {
            message: format!("{} has no {METADATA_FILE}", dir.display()),
        });
    }
    let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(StoreError::Corrupt {
            message: format!("unsupported container version {}", manifest.format_version),
        });
    }

    let parameters = columnar::read_parquet(&dir.join(PARAMETERS_FILE))?;
    let outputs = columnar::read_parquet(&dir.join(OUTPUTS_FILE))?;
    let status = columnar::read_parquet(&dir.join(STATUS_FILE))?;
    let records = columnar::decode_records(
        &manifest.parameter_keys,
        &manifest.outputs,
        &parameters,
        &outputs,
        &status,
    )?;

    Ok(SweepResult {
        metadata: manifest.metadata,
        parameter_keys: manifest.parameter_keys,
        outputs: manifest.outputs,
        records,
        warnings: manifest.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_types::{
        BackendKind, OutputValue, RunRecord, RunStatus, StrategyKind, TerminationCondition,
    };
    use tempfile::tempdir;

    fn sample_result(name: &str) -> SweepResult {
        let mut metadata = SweepMetadata::new(name, StrategyKind::Recursive, BackendKind::ProcessPool);
        metadata.requested = 3;
        metadata.achieved = 2;
        metadata.passes = 2;
        metadata.elapsed_seconds = 0.25;
        let mut result = SweepResult::new(
            metadata,
            vec!["flow".into(), "temp".into()],
            vec![
                OutputDef::scalar("cost").with_units("USD").with_bounds(Some(0.0), None),
                OutputDef::array("profile", 3),
            ],
        );

        let mut ok = RunRecord::new(
            vec![0.1, 300.0],
            vec![OutputValue::Scalar(12.5), OutputValue::Array(vec![1.0, 2.0, 3.0])],
            RunStatus::Success,
        );
        ok.termination = Some(TerminationCondition::Optimal);

        let mut bad = RunRecord::new(
            vec![0.9, 350.0],
            vec![OutputValue::Scalar(f64::NAN), OutputValue::Array(vec![f64::NAN; 3])],
            RunStatus::Infeasible,
        );
        bad.termination = Some(TerminationCondition::Infeasible);
        bad.diagnostic = Some("no feasible point".into());

        let mut retry = RunRecord::new(
            vec![0.2, 310.0],
            vec![OutputValue::Scalar(13.0), OutputValue::Array(vec![0.5, 0.25, 0.125])],
            RunStatus::Success,
        );
        retry.pass = 1;
        retry.termination = Some(TerminationCondition::Other("locally_optimal".into()));

        result.records = vec![ok, bad, retry];
        result.reindex();
        result.warnings.push(SweepWarning::ResamplingExhausted {
            requested: 3,
            achieved: 2,
            passes: 2,
        });
        result
    }

    fn assert_same(a: &SweepResult, b: &SweepResult) {
        assert_eq!(a.metadata, b.metadata);
        assert_eq!(a.parameter_keys, b.parameter_keys);
        assert_eq!(a.outputs, b.outputs);
        assert_eq!(a.warnings, b.warnings);
        assert_eq!(a.records.len(), b.records.len());
        for (x, y) in a.records.iter().zip(&b.records) {
            assert_eq!(x.index, y.index);
            assert_eq!(x.pass, y.pass);
            assert_eq!(x.status, y.status);
            assert_eq!(x.termination, y.termination);
            assert_eq!(x.diagnostic, y.diagnostic);
            assert_eq!(x.nominal_index, y.nominal_index);
            assert_eq!(x.perturbed, y.perturbed);
            assert_eq!(x.inputs, y.inputs);
            assert!(x.outputs.iter().zip(&y.outputs).all(|(p, q)| p.bit_eq(q)));
        }
    }

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        let result = sample_result("flow_sweep");

        let path = store.persist(&result, "campaign/flow_sweep").unwrap();
        for file in [PARAMETERS_FILE, OUTPUTS_FILE, STATUS_FILE, METADATA_FILE] {
            assert!(path.join(file).is_file(), "missing {file}");
        }

        let loaded = store.load("campaign/flow_sweep").unwrap();
        assert_same(&loaded, &result);
    }

    #[test]
    fn existing_group_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        let result = sample_result("dup");
        store.persist(&result, "dup").unwrap();
        assert!(matches!(
            store.persist(&result, "dup"),
            Err(StoreError::GroupExists { .. })
        ));
    }

    #[test]
    fn sibling_groups_coexist() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        store.persist(&sample_result("b"), "study/b").unwrap();
        store.persist(&sample_result("a"), "study/a").unwrap();

        assert_eq!(store.list_sweeps(Some("study")).unwrap(), vec!["a", "b"]);
        assert!(store.list_sweeps(None).unwrap().is_empty());
        assert_eq!(store.load("study/a").unwrap().metadata.name, "a");
    }

    #[test]
    fn invalid_and_missing_groups() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.persist(&sample_result("x"), "../escape"),
            Err(StoreError::InvalidGroup { .. })
        ));
        assert!(matches!(store.load("a//b"), Err(StoreError::InvalidGroup { .. })));
        assert!(matches!(store.load("absent"), Err(StoreError::GroupNotFound { .. })));
    }

    #[test]
    fn reserved_index_name_is_rejected() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        let mut result = sample_result("reserved");
        result.parameter_keys[0] = "index".into();
        assert!(matches!(
            store.persist(&result, "reserved"),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(!dir.path().join("reserved").exists());
    }

    #[test]
    fn failed_persist_leaves_no_group() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        let mut result = sample_result("short");
        result.records[0].outputs[1] = OutputValue::Array(vec![1.0]);

        assert!(matches!(
            store.persist(&result, "study/short"),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(!dir.path().join("study").exists());

        let fixed = sample_result("short");
        store.persist(&fixed, "study/short").unwrap();
        assert_same(&store.load("study/short").unwrap(), &fixed);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("study"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("short")]);
    }

    #[test]
    fn failed_differential_persist_writes_neither_table() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        let nominal = sample_result("pair");
        let mut differential = sample_result("pair");
        differential.records[2].outputs[1] = OutputValue::Array(vec![0.5; 5]);
        let result = DifferentialSweepResult { nominal, differential };

        assert!(store.persist_differential(&result, "pair").is_err());
        assert!(!dir.path().join("pair").exists());

        let result = DifferentialSweepResult {
            nominal: sample_result("pair"),
            differential: sample_result("pair"),
        };
        store.persist_differential(&result, "pair").unwrap();
        assert_eq!(store.list_sweeps(None).unwrap(), vec!["pair"]);
    }

    #[test]
    fn stale_staging_directory_is_replaced() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();
        let stale = dir.path().join(format!(".stale{STAGING_SUFFIX}"));
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join(METADATA_FILE), "{}").unwrap();
        assert!(store.list_sweeps(None).unwrap().is_empty());

        store.persist(&sample_result("stale"), "stale").unwrap();
        assert!(!stale.exists());
        assert_eq!(store.list_sweeps(None).unwrap(), vec!["stale"]);
    }

    #[test]
    fn differential_round_trip() {
        let dir = tempdir().unwrap();
        let store = SweepStore::new(dir.path()).unwrap();

        let nominal = sample_result("diff");
        let mut differential = sample_result("diff");
        for record in &mut differential.records {
            record.nominal_index = Some(0);
            record.perturbed = Some("flow".into());
        }
        let result = DifferentialSweepResult { nominal, differential };

        store.persist_differential(&result, "diff").unwrap();
        assert_eq!(store.list_sweeps(None).unwrap(), vec!["diff"]);

        let loaded = store.load_differential("diff").unwrap();
        assert_same(&loaded.nominal, &result.nominal);
        assert_same(&loaded.differential, &result.differential);
        assert_eq!(loaded.perturbations_of(0).count(), 3);
    }
}
