//! Writers for [`Samples`].
//!
//! Every tabular format uses the same layout: one row per sample, one column per parameter,
//! followed by whichever of `log_likelihood`, `log_prior`, `log_q` and `log_w` are present.
//! Samples without any rows still produce a valid file containing only the header / schema.

use std::fs::File;
use std::path::Path;

#[cfg(feature = "arrow")]
use std::sync::Arc;

#[cfg(feature = "csv")]
use csv::Writer;

#[cfg(feature = "parquet")]
use parquet::{arrow::ArrowWriter, file::properties::WriterProperties};

#[cfg(feature = "arrow")]
use arrow::{
    array::{ArrayRef, Float64Array},
    datatypes::{DataType, Field, Schema, SchemaRef},
    ipc::writer::FileWriter,
    record_batch::RecordBatch,
};

use serde::Serialize;

use crate::error::Result;
use crate::samples::{Samples, Summary};

#[cfg(feature = "csv")]
/// Saves samples as a CSV file with a header row.
///
/// # Examples
///
/// ```rust
/// # use poppy::io::save_csv;
/// # use poppy::samples::Samples;
/// let samples = Samples::new(ndarray::arr2(&[[1.0, 2.0]]));
/// let path = std::env::temp_dir().join("poppy_doc.csv");
/// save_csv(&samples, &path)?;
/// # Ok::<(), poppy::error::PoppyError>(())
/// ```
pub fn save_csv<P: AsRef<Path>>(samples: &Samples, path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    let columns = samples.columns();

    let header: Vec<&str> = columns.iter().map(|(name, _)| name.as_str()).collect();
    wtr.write_record(&header)?;

    for i in 0..samples.len() {
        let row: Vec<String> = columns.iter().map(|(_, col)| col[i].to_string()).collect();
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(feature = "arrow")]
/// Column schema and a single record batch (possibly with zero rows) for `samples`.
fn record_batch(samples: &Samples) -> Result<(SchemaRef, RecordBatch)> {
    let columns = samples.columns();
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, _)| Field::new(name.as_str(), DataType::Float64, false))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    if columns.is_empty() {
        return Ok((schema.clone(), RecordBatch::new_empty(schema)));
    }
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, col)| Arc::new(Float64Array::from(col.to_vec())) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    Ok((schema, batch))
}

#[cfg(feature = "arrow")]
/// Saves samples as an Apache Arrow IPC file.
pub fn save_arrow<P: AsRef<Path>>(samples: &Samples, path: P) -> Result<()> {
    let (schema, batch) = record_batch(samples)?;
    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(file, &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(())
}

#[cfg(feature = "parquet")]
/// Saves samples as a Parquet file.
pub fn save_parquet<P: AsRef<Path>>(samples: &Samples, path: P) -> Result<()> {
    let (schema, batch) = record_batch(samples)?;
    let file = File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    // Closing writes the footer metadata.
    writer.close()?;
    Ok(())
}

/// Everything [`save_json`] writes: the summary plus the nested sample dictionary.
#[derive(Debug, Serialize)]
struct JsonDump {
    summary: Summary,
    samples: serde_json::Value,
}

/// Saves the summary and all per-sample quantities as pretty-printed JSON.
pub fn save_json<P: AsRef<Path>>(samples: &Samples, path: P) -> Result<()> {
    let dump = JsonDump {
        summary: samples.summary(),
        samples: samples.to_json(false),
    };
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &dump)?;
    Ok(())
}
