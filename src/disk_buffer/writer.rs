//! Segment writer: length-prefixed frames with a per-entry SHA-256
//! trailer, optionally wrapped in a gzip stream.

use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};

/// Frame layout: `[u32 BE payload length][payload][32-byte SHA-256]`.
pub(super) const ENTRY_OVERHEAD: u64 = 4 + 32;

enum Output {
    Plain(BufWriter<fs::File>),
    Gzip(GzEncoder<BufWriter<fs::File>>),
}

pub(super) struct SegmentWriter {
    path: PathBuf,
    output: Option<Output>,
    /// Uncompressed bytes appended to this segment.
    written: u64,
    entries: u64,
}

impl SegmentWriter {
    pub(super) fn create(path: &Path, compressed: bool) -> io::Result<SegmentWriter> {
        let file = BufWriter::new(
            fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(path)?,
        );
        let output = if compressed {
            Output::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Output::Plain(file)
        };
        Ok(SegmentWriter {
            path: path.to_path_buf(),
            output: Some(output),
            written: 0,
            entries: 0,
        })
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry too large"))?;
        let digest: [u8; 32] = Sha256::digest(payload).into();

        let writer: &mut dyn Write = match self.output.as_mut() {
            Some(Output::Plain(w)) => w,
            Some(Output::Gzip(w)) => w,
            None => return Err(io::Error::new(io::ErrorKind::Other, "segment closed")),
        };
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(payload)?;
        writer.write_all(&digest)?;

        self.written += ENTRY_OVERHEAD + payload.len() as u64;
        self.entries += 1;
        Ok(())
    }

    /// Logical (uncompressed) size of the segment.
    pub(super) fn written(&self) -> u64 {
        self.written
    }

    pub(super) fn entries(&self) -> u64 {
        self.entries
    }

    /// Flushes buffered frames and fsyncs the file.
    pub(super) fn sync(&mut self) -> io::Result<()> {
        match self.output.as_mut() {
            Some(Output::Plain(w)) => {
                w.flush()?;
                w.get_ref().sync_all()
            }
            Some(Output::Gzip(w)) => {
                // Emits a sync block so everything appended so far is
                // decodable even if the process dies before finish.
                w.flush()?;
                w.get_mut().flush()?;
                w.get_mut().get_ref().sync_all()
            }
            None => Ok(()),
        }
    }

    /// Finishes the stream (writing the gzip trailer if any) and syncs.
    pub(super) fn finish(mut self) -> io::Result<()> {
        match self.output.take() {
            Some(Output::Plain(mut w)) => {
                w.flush()?;
                w.get_ref().sync_all()
            }
            Some(Output::Gzip(w)) => {
                let mut inner = w.finish()?;
                inner.flush()?;
                inner.get_ref().sync_all()
            }
            None => Ok(()),
        }
    }
}
