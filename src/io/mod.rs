//! Persistence of sampler runs and export of their samples.

pub mod store;

#[cfg(feature = "csv")]
pub mod csv;

#[cfg(feature = "parquet")]
pub mod parquet;

use crate::core::State;
use crate::error::Result;
use store::{chain_group, Store};

/// Column names and samples of every stored chain of `phase`.
#[cfg_attr(not(any(feature = "csv", feature = "parquet")), allow(dead_code))]
pub(crate) fn collect_phase(store: &Store, phase: &str) -> Result<(Vec<String>, Vec<Vec<State>>)> {
    let n_chains = store.chain_count(phase);
    let mut columns = Vec::new();
    let mut chains = Vec::with_capacity(n_chains);
    for k in 0..n_chains {
        let dataset = format!("{}/samples", chain_group(phase, k));
        if columns.is_empty() {
            columns = store.sample_columns(&dataset)?;
        }
        chains.push(store.read_samples(&dataset)?);
    }
    Ok((columns, chains))
}
