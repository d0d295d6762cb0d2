/*!
# CSV export

Writes the stored samples of one phase to a single CSV file. Enable via the
`csv` feature.
*/

use std::fs::File;
use std::path::Path;

use csv::Writer;

use super::collect_phase;
use super::store::Store;
use crate::error::Result;

/**
Saves all chains of `phase` (`"prerun"` or `"main run"`) as CSV.

The header row is `chain`, `sample`, one column per parameter and
`log_density`. Each following row is one sample of one chain. A phase without
chains yields a file with the header `chain,sample` only.
*/
pub fn save_csv(store: &Store, phase: &str, filename: impl AsRef<Path>) -> Result<()> {
    let (columns, chains) = collect_phase(store, phase)?;
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header: Vec<String> = vec!["chain".to_string(), "sample".to_string()];
    header.extend(columns);
    wtr.write_record(&header)?;

    for (chain_idx, chain) in chains.iter().enumerate() {
        for (sample_idx, state) in chain.iter().enumerate() {
            let mut row = vec![chain_idx.to_string(), sample_idx.to_string()];
            row.extend(state.point.iter().map(|v| v.to_string()));
            row.push(state.log_density.to_string());
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}
