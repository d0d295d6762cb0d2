/*!
# Parquet export

Writes the stored samples of one phase to a Parquet file. Enable via the
`parquet` feature.
*/

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder, UInt32Builder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::{arrow::ArrowWriter, file::properties::WriterProperties};

use super::collect_phase;
use super::store::Store;
use crate::error::Result;

/// Saves all chains of `phase` as Parquet with the columns `chain`, `sample`
/// (`UInt32`), one `Float64` column per parameter and `log_density`.
pub fn save_parquet(store: &Store, phase: &str, filename: impl AsRef<Path>) -> Result<()> {
    let (columns, chains) = collect_phase(store, phase)?;

    let mut fields = vec![
        Field::new("chain", DataType::UInt32, false),
        Field::new("sample", DataType::UInt32, false),
    ];
    fields.extend(
        columns
            .iter()
            .map(|name| Field::new(name.as_str(), DataType::Float64, false)),
    );
    let schema = Arc::new(Schema::new(fields));

    let mut chain_builder = UInt32Builder::new();
    let mut sample_builder = UInt32Builder::new();
    let mut value_builders: Vec<Float64Builder> =
        columns.iter().map(|_| Float64Builder::new()).collect();
    let n_params = columns.len().saturating_sub(1);

    for (chain_idx, chain) in chains.iter().enumerate() {
        for (sample_idx, state) in chain.iter().enumerate() {
            chain_builder.append_value(chain_idx as u32);
            sample_builder.append_value(sample_idx as u32);
            for (builder, value) in value_builders.iter_mut().zip(&state.point).take(n_params) {
                builder.append_value(*value);
            }
            if let Some(builder) = value_builders.last_mut() {
                builder.append_value(state.log_density);
            }
        }
    }

    let mut arrays = vec![
        Arc::new(chain_builder.finish()) as ArrayRef,
        Arc::new(sample_builder.finish()) as ArrayRef,
    ];
    arrays.extend(
        value_builders
            .iter_mut()
            .map(|b| Arc::new(b.finish()) as ArrayRef),
    );
    let record_batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let file = File::create(filename)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&record_batch)?;
    // metadata is only written on close
    writer.close()?;
    Ok(())
}
