//! A growing list of results kept on disk between runs.
//!
//! The list is stored as gzip-compressed JSON. Each save reads the existing
//! list, appends one entry and writes the whole list back.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use mltb_types::MltbResult;

const COMPRESSION_LEVEL: u32 = 3;

/// Append `data` to the list stored at `path`, creating it when missing.
///
/// Returns the length of the list after the append.
pub fn save_data_list<T>(data: T, path: impl AsRef<Path>) -> MltbResult<usize>
where
    T: Serialize + DeserializeOwned,
{
    let path = path.as_ref();
    let mut data_list: Vec<T> = match load_data_list(path) {
        Ok(list) => list,
        Err(mltb_types::MltbError::Io(e)) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };
    data_list.push(data);
    info!(path = %path.display(), len = data_list.len(), "Saving data list");

    let tmp = path.with_extension("tmp");
    {
        let mut encoder = GzEncoder::new(
            BufWriter::new(File::create(&tmp)?),
            Compression::new(COMPRESSION_LEVEL),
        );
        serde_json::to_writer(&mut encoder, &data_list)?;
        encoder.finish()?.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(data_list.len())
}

/// Read the list written by [`save_data_list`].
pub fn load_data_list<T: DeserializeOwned>(path: impl AsRef<Path>) -> MltbResult<Vec<T>> {
    let decoder = GzDecoder::new(BufReader::new(File::open(path.as_ref())?));
    Ok(serde_json::from_reader(decoder)?)
}
