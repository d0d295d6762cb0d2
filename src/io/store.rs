/*!
# Persisted store

A [`Store`] is a directory holding the samples, proposal snapshots, modes and
parameter descriptions of a sampler run, laid out by group path:

```text
<root>/prerun/chain #0/samples/part-000000.arrow
<root>/prerun/chain #0/samples/part-000001.arrow
<root>/prerun/chain #0/proposal/meta/part-000000.arrow
<root>/descriptions/prerun/chain #0/parameters/part-000000.arrow
```

Every dataset is a directory of Arrow IPC files. An append writes one new part
to a temporary file and renames it into place, so a failed write never leaves
a partial part behind. A proposal snapshot spans several datasets and only
counts once its `meta` part is written. All writes go through one lock; chains
may flush from several worker threads.

```rust
use mcmc_sampler::core::State;
use mcmc_sampler::distributions::ParameterDescription;
use mcmc_sampler::io::store::Store;

let dir = tempfile::tempdir().unwrap();
let store = Store::create(dir.path().join("run")).unwrap();
let parameters = vec![ParameterDescription::new("x", -1.0, 1.0)];

store
    .append_samples("/main run/chain #0/samples", &parameters, &[State::new(vec![0.5], -0.1)])
    .unwrap();
let samples = store.read_samples("/main run/chain #0/samples").unwrap();
assert_eq!(samples[0].point, vec![0.5]);
```
*/

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, ListArray, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Float64Type, Schema};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use log::debug;

use crate::config::ProposalKind;
use crate::core::State;
use crate::distributions::ParameterDescription;
use crate::error::{Error, Result};
use crate::global_local::{ComponentState, GlobalLocalState};
use crate::proposal::{MultivariateState, ProposalState};

const PART_PREFIX: &str = "part-";
const PART_SUFFIX: &str = ".arrow";
const GLOBAL_LOCAL_TYPE: &str = "GlobalLocal";

/// Group path of chain `chain` in `phase`, e.g. `/prerun/chain #0`.
pub fn chain_group(phase: &str, chain: usize) -> String {
    format!("/{phase}/chain #{chain}")
}

/// Group path of the descriptions of chain `chain` in `phase`.
pub fn description_group(phase: &str, chain: usize) -> String {
    format!("/descriptions/{phase}/chain #{chain}")
}

#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl Store {
    /// Creates a new store. An existing directory is only accepted if empty.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() {
            if !root.is_dir() {
                return Err(Error::Store(format!("{} is not a directory", root.display())));
            }
            if fs::read_dir(&root)?.next().is_some() {
                return Err(Error::Store(format!(
                    "refusing to overwrite non-empty directory {}",
                    root.display()
                )));
            }
        }
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Opens an existing store.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Store(format!("no store at {}", root.display())));
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, group: &str) -> PathBuf {
        group
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |path, s| path.join(s))
    }

    /// Whether a group or dataset exists.
    pub fn exists(&self, group: &str) -> bool {
        self.path_of(group).is_dir()
    }

    /// Number of consecutive `chain #k` groups below `/<phase>`.
    pub fn chain_count(&self, phase: &str) -> usize {
        (0..)
            .take_while(|&k| self.exists(&chain_group(phase, k)))
            .count()
    }

    fn parts(&self, dataset: &str) -> Result<Vec<PathBuf>> {
        let dir = self.path_of(dataset);
        if !dir.is_dir() {
            return Err(Error::Store(format!("missing dataset {dataset}")));
        }
        let mut parts: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(PART_PREFIX) && n.ends_with(PART_SUFFIX))
            })
            .collect();
        parts.sort();
        Ok(parts)
    }

    /// Appends one record batch to `dataset` as a new part.
    pub fn append(&self, dataset: &str, batch: &RecordBatch) -> Result<()> {
        let _guard = self.lock()?;
        let index = self.part_count(dataset)?;
        self.write_part(dataset, index, batch)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Store("store lock poisoned".to_string()))
    }

    fn part_count(&self, dataset: &str) -> Result<usize> {
        if self.path_of(dataset).is_dir() {
            Ok(self.parts(dataset)?.len())
        } else {
            Ok(0)
        }
    }

    fn part_path(&self, dataset: &str, index: usize) -> PathBuf {
        self.path_of(dataset)
            .join(format!("{PART_PREFIX}{index:06}{PART_SUFFIX}"))
    }

    // callers hold the write lock
    fn write_part(&self, dataset: &str, index: usize, batch: &RecordBatch) -> Result<()> {
        let dir = self.path_of(dataset);
        fs::create_dir_all(&dir)?;
        let name = format!("{PART_PREFIX}{index:06}{PART_SUFFIX}");
        let tmp = dir.join(format!(".{name}.tmp"));

        let mut writer = FileWriter::try_new(File::create(&tmp)?, &batch.schema())?;
        writer.write(batch)?;
        writer.finish()?;
        fs::rename(&tmp, dir.join(&name))?;
        debug!(target: "store", "{dataset}: wrote {name} with {} rows", batch.num_rows());
        Ok(())
    }

    fn read_part(&self, dataset: &str, index: usize) -> Result<Vec<RecordBatch>> {
        let path = self.part_path(dataset, index);
        if !path.is_file() {
            return Err(Error::Store(format!("missing part {index} of {dataset}")));
        }
        FileReader::try_new(File::open(&path)?, None)?
            .map(|b| b.map_err(Error::from))
            .collect()
    }

    /// All batches of `dataset`, in append order.
    pub fn read(&self, dataset: &str) -> Result<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        for part in self.parts(dataset)? {
            let reader = FileReader::try_new(File::open(&part)?, None)?;
            for batch in reader {
                batches.push(batch?);
            }
        }
        Ok(batches)
    }

    /// The batches of the most recent append.
    pub fn read_last(&self, dataset: &str) -> Result<Vec<RecordBatch>> {
        let part = self
            .parts(dataset)?
            .pop()
            .ok_or_else(|| Error::Store(format!("empty dataset {dataset}")))?;
        FileReader::try_new(File::open(&part)?, None)?
            .map(|b| b.map_err(Error::from))
            .collect()
    }

    /// Appends states as rows of one column per parameter plus `log_density`.
    pub fn append_samples(
        &self,
        dataset: &str,
        parameters: &[ParameterDescription],
        states: &[State],
    ) -> Result<()> {
        let mut fields: Vec<Field> = parameters
            .iter()
            .map(|p| Field::new(p.name.as_str(), DataType::Float64, false))
            .collect();
        fields.push(Field::new("log_density", DataType::Float64, false));

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(parameters.len() + 1);
        for i in 0..parameters.len() {
            let values = states
                .iter()
                .map(|s| {
                    s.point.get(i).copied().ok_or(Error::Dimension {
                        expected: parameters.len(),
                        found: s.point.len(),
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            columns.push(Arc::new(Float64Array::from(values)));
        }
        columns.push(Arc::new(Float64Array::from_iter_values(
            states.iter().map(|s| s.log_density),
        )));

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        self.append(dataset, &batch)
    }

    pub fn read_samples(&self, dataset: &str) -> Result<Vec<State>> {
        let mut states = Vec::new();
        for batch in self.read(dataset)? {
            states.extend(samples_from_batch(&batch)?);
        }
        Ok(states)
    }

    /// The most recently appended sample.
    pub fn read_last_sample(&self, dataset: &str) -> Result<State> {
        let batches = self.read_last(dataset)?;
        batches
            .last()
            .map(samples_from_batch)
            .transpose()?
            .and_then(|mut states| states.pop())
            .ok_or_else(|| Error::Store(format!("no samples in {dataset}")))
    }

    /// Column names of a samples dataset, parameters first.
    pub fn sample_columns(&self, dataset: &str) -> Result<Vec<String>> {
        let part = self
            .parts(dataset)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Store(format!("empty dataset {dataset}")))?;
        let reader = FileReader::try_new(File::open(&part)?, None)?;
        Ok(reader
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect())
    }

    /// Writes `parameters` and `constraints` below `group`.
    pub fn write_descriptions(
        &self,
        group: &str,
        parameters: &[ParameterDescription],
        priors: &[String],
        constraints: &[String],
    ) -> Result<()> {
        let schema = Schema::new(vec![
            Field::new("name", DataType::Utf8, false),
            Field::new("min", DataType::Float64, false),
            Field::new("max", DataType::Float64, false),
            Field::new("nuisance", DataType::Boolean, false),
            Field::new("prior", DataType::Utf8, false),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(parameters.iter().map(|p| &p.name))),
            Arc::new(Float64Array::from_iter_values(parameters.iter().map(|p| p.min))),
            Arc::new(Float64Array::from_iter_values(parameters.iter().map(|p| p.max))),
            Arc::new(BooleanArray::from(
                parameters.iter().map(|p| p.nuisance).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from_iter_values(priors)),
        ];
        self.append(
            &format!("{group}/parameters"),
            &RecordBatch::try_new(Arc::new(schema), columns)?,
        )?;

        let schema = Schema::new(vec![Field::new("name", DataType::Utf8, false)]);
        let columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from_iter_values(constraints))];
        self.append(
            &format!("{group}/constraints"),
            &RecordBatch::try_new(Arc::new(schema), columns)?,
        )
    }

    pub fn read_parameters(&self, group: &str) -> Result<Vec<ParameterDescription>> {
        let mut parameters = Vec::new();
        for batch in self.read_last(&format!("{group}/parameters"))? {
            let names = column::<StringArray>(&batch, "name")?;
            let min = column::<Float64Array>(&batch, "min")?;
            let max = column::<Float64Array>(&batch, "max")?;
            let nuisance = column::<BooleanArray>(&batch, "nuisance")?;
            for i in 0..batch.num_rows() {
                parameters.push(
                    ParameterDescription::new(names.value(i), min.value(i), max.value(i))
                        .nuisance(nuisance.value(i)),
                );
            }
        }
        Ok(parameters)
    }

    /// Prior descriptions stored alongside the parameters of `group`.
    pub fn read_priors(&self, group: &str) -> Result<Vec<String>> {
        let mut priors = Vec::new();
        for batch in self.read_last(&format!("{group}/parameters"))? {
            let prior = column::<StringArray>(&batch, "prior")?;
            priors.extend((0..batch.num_rows()).map(|i| prior.value(i).to_string()));
        }
        Ok(priors)
    }

    pub fn read_constraints(&self, group: &str) -> Result<Vec<String>> {
        let mut constraints = Vec::new();
        for batch in self.read_last(&format!("{group}/constraints"))? {
            let names = column::<StringArray>(&batch, "name")?;
            constraints.extend((0..batch.num_rows()).map(|i| names.value(i).to_string()));
        }
        Ok(constraints)
    }

    /**
    Appends a snapshot of a proposal below `group`.

    A snapshot spans several datasets (`meta`, `covariance`, `scalars`, ...),
    all written at the same part index. `meta` is written last and marks the
    snapshot as complete; readers never look past the last `meta` part, and
    the next snapshot overwrites whatever an interrupted one left behind.
    */
    pub fn append_proposal(&self, group: &str, state: &ProposalState) -> Result<()> {
        let _guard = self.lock()?;
        let index = self.part_count(&format!("{group}/meta"))?;
        self.write_proposal(group, state, index)
    }

    fn write_proposal(&self, group: &str, state: &ProposalState, index: usize) -> Result<()> {
        match state {
            ProposalState::Multivariate(s) => self.write_multivariate(group, s, index),
            ProposalState::GlobalLocal(s) => self.write_global_local(group, s, index),
        }
    }

    fn write_meta(&self, group: &str, kind: &str, dimension: usize, index: usize) -> Result<()> {
        let schema = Schema::new(vec![
            Field::new("type", DataType::Utf8, false),
            Field::new("dimension", DataType::UInt32, false),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![kind])),
            Arc::new(UInt32Array::from(vec![dimension as u32])),
        ];
        self.write_part(
            &format!("{group}/meta"),
            index,
            &RecordBatch::try_new(Arc::new(schema), columns)?,
        )
    }

    fn write_multivariate(&self, group: &str, s: &MultivariateState, index: usize) -> Result<()> {
        let covariance = ListArray::from_iter_primitive::<Float64Type, _, _>(vec![Some(
            s.covariance.iter().copied().map(Some).collect::<Vec<_>>(),
        )]);
        let schema = Schema::new(vec![Field::new(
            "covariance",
            covariance.data_type().clone(),
            false,
        )]);
        self.write_part(
            &format!("{group}/covariance"),
            index,
            &RecordBatch::try_new(Arc::new(schema), vec![Arc::new(covariance) as ArrayRef])?,
        )?;

        let schema = Schema::new(vec![
            Field::new("covariance_scale", DataType::Float64, false),
            Field::new("cooling_power", DataType::Float64, false),
            Field::new("adaptations", DataType::UInt32, false),
            Field::new("degrees_of_freedom", DataType::Float64, true),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Float64Array::from(vec![s.covariance_scale])),
            Arc::new(Float64Array::from(vec![s.cooling_power])),
            Arc::new(UInt32Array::from(vec![s.adaptations])),
            Arc::new(Float64Array::from(vec![s.degrees_of_freedom])),
        ];
        self.write_part(
            &format!("{group}/scalars"),
            index,
            &RecordBatch::try_new(Arc::new(schema), columns)?,
        )?;

        self.write_meta(group, s.kind.name(), s.dimension, index)
    }

    fn write_global_local(&self, group: &str, s: &GlobalLocalState, index: usize) -> Result<()> {
        let dimension = s.components.first().map_or(0, |c| c.mode.dimension());

        let mut fields = vec![Field::new("probability", DataType::Float64, false)];
        fields.extend((0..dimension).map(|i| Field::new(format!("mode_{i}"), DataType::Float64, false)));
        fields.push(Field::new("log_density", DataType::Float64, false));
        let mut columns: Vec<ArrayRef> = vec![Arc::new(Float64Array::from_iter_values(
            s.components.iter().map(|c| c.probability),
        ))];
        for i in 0..dimension {
            columns.push(Arc::new(Float64Array::from_iter_values(
                s.components.iter().map(|c| c.mode.point[i]),
            )));
        }
        columns.push(Arc::new(Float64Array::from_iter_values(
            s.components.iter().map(|c| c.mode.log_density),
        )));
        self.write_part(
            &format!("{group}/components"),
            index,
            &RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?,
        )?;

        let schema = Schema::new(vec![
            Field::new("adaptations", DataType::UInt32, false),
            Field::new("local_jump_probability", DataType::Float64, false),
            Field::new("cooling_power", DataType::Float64, false),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt32Array::from(vec![s.adaptations])),
            Arc::new(Float64Array::from(vec![s.local_jump_probability])),
            Arc::new(Float64Array::from(vec![s.cooling_power])),
        ];
        self.write_part(
            &format!("{group}/scalars"),
            index,
            &RecordBatch::try_new(Arc::new(schema), columns)?,
        )?;

        for (c, component) in s.components.iter().enumerate() {
            self.write_proposal(
                &format!("{group}/component #{c}/proposal"),
                &component.proposal,
                index,
            )?;
        }
        self.write_meta(group, GLOBAL_LOCAL_TYPE, dimension, index)
    }

    /// The most recent complete proposal snapshot below `group`.
    pub fn read_last_proposal(&self, group: &str) -> Result<ProposalState> {
        let snapshots = self.parts(&format!("{group}/meta"))?.len();
        if snapshots == 0 {
            return Err(Error::Store(format!("no proposal snapshots below {group}")));
        }
        self.read_proposal(group, snapshots - 1)
    }

    fn read_proposal(&self, group: &str, index: usize) -> Result<ProposalState> {
        let meta = last_row(&self.read_part(&format!("{group}/meta"), index)?, group)?;
        let kind = column::<StringArray>(&meta.0, "type")?.value(meta.1).to_string();
        let dimension = column::<UInt32Array>(&meta.0, "dimension")?.value(meta.1) as usize;

        if kind == GLOBAL_LOCAL_TYPE {
            return self.read_global_local(group, dimension, index);
        }
        let kind: ProposalKind = kind.parse().map_err(Error::Store)?;

        let (batch, row) = last_row(&self.read_part(&format!("{group}/covariance"), index)?, group)?;
        let list = column::<ListArray>(&batch, "covariance")?.value(row);
        let covariance = list
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| Error::Store(format!("{group}/covariance: expected Float64 values")))?
            .values()
            .to_vec();

        let (batch, row) = last_row(&self.read_part(&format!("{group}/scalars"), index)?, group)?;
        let dof = column::<Float64Array>(&batch, "degrees_of_freedom")?;
        Ok(ProposalState::Multivariate(MultivariateState {
            kind,
            dimension,
            covariance,
            covariance_scale: column::<Float64Array>(&batch, "covariance_scale")?.value(row),
            cooling_power: column::<Float64Array>(&batch, "cooling_power")?.value(row),
            adaptations: column::<UInt32Array>(&batch, "adaptations")?.value(row),
            degrees_of_freedom: (!dof.is_null(row)).then(|| dof.value(row)),
        }))
    }

    fn read_global_local(&self, group: &str, dimension: usize, index: usize) -> Result<ProposalState> {
        let mut components = Vec::new();
        for batch in self.read_part(&format!("{group}/components"), index)? {
            let probability = column::<Float64Array>(&batch, "probability")?;
            let modes = (0..dimension)
                .map(|i| column::<Float64Array>(&batch, &format!("mode_{i}")))
                .collect::<Result<Vec<_>>>()?;
            let log_density = column::<Float64Array>(&batch, "log_density")?;
            for row in 0..batch.num_rows() {
                let c = components.len();
                components.push(ComponentState {
                    probability: probability.value(row),
                    mode: State {
                        point: modes.iter().map(|m| m.value(row)).collect(),
                        log_density: log_density.value(row),
                        component: c,
                    },
                    proposal: self.read_proposal(&format!("{group}/component #{c}/proposal"), index)?,
                });
            }
        }

        let (batch, row) = last_row(&self.read_part(&format!("{group}/scalars"), index)?, group)?;
        Ok(ProposalState::GlobalLocal(GlobalLocalState {
            components,
            local_jump_probability: column::<Float64Array>(&batch, "local_jump_probability")?
                .value(row),
            cooling_power: column::<Float64Array>(&batch, "cooling_power")?.value(row),
            adaptations: column::<UInt32Array>(&batch, "adaptations")?.value(row),
        }))
    }
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| Error::Store(format!("missing or mistyped column '{name}'")))
}

fn last_row(batches: &[RecordBatch], group: &str) -> Result<(RecordBatch, usize)> {
    batches
        .iter()
        .rev()
        .find(|b| b.num_rows() > 0)
        .map(|b| (b.clone(), b.num_rows() - 1))
        .ok_or_else(|| Error::Store(format!("no records below {group}")))
}

fn samples_from_batch(batch: &RecordBatch) -> Result<Vec<State>> {
    let n_columns = batch.num_columns();
    if n_columns == 0 {
        return Err(Error::Store("samples without columns".to_string()));
    }
    let columns = batch
        .columns()
        .iter()
        .map(|c| {
            c.as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| Error::Store("sample columns must be Float64".to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    let (log_density, point_columns) = columns
        .split_last()
        .ok_or_else(|| Error::Store("samples without columns".to_string()))?;
    Ok((0..batch.num_rows())
        .map(|row| State::new(point_columns.iter().map(|c| c.value(row)).collect(), log_density.value(row)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{Proposal, ProposalFunction};
    use tempfile::tempdir;

    fn parameters() -> Vec<ParameterDescription> {
        vec![
            ParameterDescription::new("a", -1.0, 1.0),
            ParameterDescription::new("b", 0.0, 5.0).nuisance(true),
        ]
    }

    #[test]
    fn create_refuses_non_empty_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("something"), b"x").unwrap();
        assert!(matches!(Store::create(dir.path()), Err(Error::Store(_))));
        assert!(Store::create(dir.path().join("fresh")).is_ok());
        assert!(Store::open(dir.path().join("missing")).is_err());
    }

    #[test]
    fn samples_accumulate_over_appends() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("s")).unwrap();
        let dataset = "/main run/chain #0/samples";
        for chunk in 0..3 {
            let states: Vec<State> = (0..4)
                .map(|i| State::new(vec![0.1 * i as f64, chunk as f64], -(i as f64)))
                .collect();
            store.append_samples(dataset, &parameters(), &states).unwrap();
        }
        let samples = store.read_samples(dataset).unwrap();
        assert_eq!(samples.len(), 12);
        assert_eq!(samples[11].point, vec![0.30000000000000004, 2.0]);
        assert_eq!(store.read_last_sample(dataset).unwrap(), samples[11]);
        assert_eq!(
            store.sample_columns(dataset).unwrap(),
            vec!["a", "b", "log_density"]
        );
        assert_eq!(store.chain_count("main run"), 1);
        assert_eq!(store.chain_count("prerun"), 0);
    }

    #[test]
    fn descriptions_round_trip() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("d")).unwrap();
        let group = description_group("prerun", 0);
        let priors = vec!["flat".to_string(), "flat".to_string()];
        store
            .write_descriptions(&group, &parameters(), &priors, &["c1".to_string()])
            .unwrap();
        assert_eq!(store.read_parameters(&group).unwrap(), parameters());
        assert_eq!(store.read_priors(&group).unwrap(), priors);
        assert_eq!(store.read_constraints(&group).unwrap(), vec!["c1"]);
    }

    #[test]
    fn last_proposal_snapshot_is_restored() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("p")).unwrap();
        let group = "/prerun/chain #0/proposal";
        let first = Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 2.0], true)
            .unwrap()
            .dump_state();
        let second = Proposal::initial(ProposalKind::MultivariateStudentT, 3.0, &[4.0, 0.5], false)
            .unwrap()
            .dump_state();
        store.append_proposal(group, &first).unwrap();
        store.append_proposal(group, &second).unwrap();
        assert_eq!(store.read_last_proposal(group).unwrap(), second);
    }

    #[test]
    fn interrupted_snapshot_is_ignored_and_overwritten() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("i")).unwrap();
        let group = "/prerun/chain #0/proposal";
        let first = Proposal::initial(ProposalKind::MultivariateGaussian, 1.0, &[1.0, 2.0], true)
            .unwrap()
            .dump_state();
        store.append_proposal(group, &first).unwrap();

        // scalars of a second snapshot whose meta never made it to disk
        let schema = Schema::new(vec![
            Field::new("covariance_scale", DataType::Float64, false),
            Field::new("cooling_power", DataType::Float64, false),
            Field::new("adaptations", DataType::UInt32, false),
            Field::new("degrees_of_freedom", DataType::Float64, true),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Float64Array::from(vec![99.0])),
            Arc::new(Float64Array::from(vec![0.5])),
            Arc::new(UInt32Array::from(vec![7])),
            Arc::new(Float64Array::from(vec![None::<f64>])),
        ];
        let stray = RecordBatch::try_new(Arc::new(schema), columns).unwrap();
        store.append(&format!("{group}/scalars"), &stray).unwrap();
        assert_eq!(store.read_last_proposal(group).unwrap(), first);

        let second = Proposal::initial(ProposalKind::MultivariateStudentT, 3.0, &[4.0, 0.5], false)
            .unwrap()
            .dump_state();
        store.append_proposal(group, &second).unwrap();
        assert_eq!(store.read_last_proposal(group).unwrap(), second);
        assert_eq!(store.parts(&format!("{group}/scalars")).unwrap().len(), 2);
    }

    #[test]
    fn missing_datasets_are_errors() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("m")).unwrap();
        assert!(matches!(
            store.read_samples("/prerun/chain #0/samples"),
            Err(Error::Store(_))
        ));
        assert!(store.read_last_proposal("/prerun/chain #0/proposal").is_err());
    }
}
