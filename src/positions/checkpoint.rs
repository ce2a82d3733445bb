//! Generational, gzip-compressed snapshots of the position state.
//!
//! Checkpoints are the recovery layer of last resort behind the primary
//! file and its rotated backups: `checkpoints/gen_<n>.json.gz`, with the
//! newest `max_checkpoints` generations retained.

use std::{
    fs, io,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

const CHECKPOINT_PREFIX: &str = "gen_";
const CHECKPOINT_SUFFIX: &str = ".json.gz";

pub(crate) fn checkpoint_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{CHECKPOINT_PREFIX}{generation}{CHECKPOINT_SUFFIX}"))
}

/// Lists checkpoint generations in the directory, newest first.
pub(crate) fn list(dir: &Path) -> Vec<(u64, PathBuf)> {
    let pattern = dir
        .join(format!("{CHECKPOINT_PREFIX}*{CHECKPOINT_SUFFIX}"))
        .to_string_lossy()
        .into_owned();
    let mut found: Vec<(u64, PathBuf)> = glob::glob(&pattern)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let generation = name
                .strip_prefix(CHECKPOINT_PREFIX)?
                .strip_suffix(CHECKPOINT_SUFFIX)?
                .parse()
                .ok()?;
            Some((generation, path))
        })
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0));
    found
}

/// Writes a new generation and prunes old ones down to `max_keep`.
///
/// The write goes through a temp file and an atomic rename, same as the
/// primary position file.
pub(crate) fn write(dir: &Path, payload: &[u8], max_keep: usize) -> io::Result<u64> {
    let existing = list(dir);
    let generation = existing.first().map(|(g, _)| g + 1).unwrap_or(0);

    let tmp_path = dir.join("checkpoint.new");
    let mut encoder = GzEncoder::new(fs::File::create(&tmp_path)?, Compression::default());
    encoder.write_all(payload)?;
    let file = encoder.finish()?;
    file.sync_all()?;
    fs::rename(&tmp_path, checkpoint_path(dir, generation))?;

    // Prune beyond the retention count; the generation just written is not
    // in `existing`, hence the minus one.
    if max_keep > 0 {
        for (_, path) in existing.iter().skip(max_keep.saturating_sub(1)) {
            fs::remove_file(path).ok();
        }
    }
    Ok(generation)
}

/// Reads and decompresses one checkpoint.
pub(crate) fn read(path: &Path) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(fs::File::open(path)?);
    let mut payload = Vec::new();
    decoder.read_to_end(&mut payload)?;
    Ok(payload)
}
