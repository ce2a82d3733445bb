//! Segment reader with per-entry integrity verification.
//!
//! A checksum mismatch skips that entry and keeps reading; a truncated
//! tail (EOF mid-frame, the normal result of a crash between syncs) stops
//! the segment without failing the whole buffer.

use std::{
    fs,
    io::{self, BufReader, Read},
    path::Path,
};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use crate::{event::Record, internal_events::DiskBufferEntryCorrupted};

/// Outcome of scanning one segment.
#[derive(Debug, Default)]
pub(super) struct SegmentScan {
    pub records: Vec<Record>,
    pub corrupted: u64,
    pub truncated: bool,
}

pub(super) fn read_segment(path: &Path, compressed: bool) -> io::Result<SegmentScan> {
    let file = BufReader::new(fs::File::open(path)?);
    if compressed {
        scan(path, GzDecoder::new(file))
    } else {
        scan(path, file)
    }
}

fn scan(path: &Path, mut reader: impl Read) -> io::Result<SegmentScan> {
    let mut out = SegmentScan::default();
    loop {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut reader, &mut len_buf) {
            ReadResult::Full => {}
            ReadResult::Eof => break,
            ReadResult::Partial => {
                out.truncated = true;
                break;
            }
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        if !matches!(read_exact_or_eof(&mut reader, &mut payload), ReadResult::Full) {
            out.truncated = true;
            break;
        }
        let mut digest = [0u8; 32];
        if !matches!(read_exact_or_eof(&mut reader, &mut digest), ReadResult::Full) {
            out.truncated = true;
            break;
        }

        let calculated: [u8; 32] = Sha256::digest(&payload).into();
        if calculated != digest {
            out.corrupted += 1;
            DiskBufferEntryCorrupted {
                path,
                reason: "checksum mismatch",
            }
            .emit();
            continue;
        }

        match serde_json::from_slice::<Record>(&payload) {
            Ok(record) => out.records.push(record),
            Err(error) => {
                out.corrupted += 1;
                DiskBufferEntryCorrupted {
                    path,
                    reason: &error.to_string(),
                }
                .emit();
            }
        }
    }
    Ok(out)
}

enum ReadResult {
    Full,
    Eof,
    Partial,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> ReadResult {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadResult::Eof
                } else {
                    ReadResult::Partial
                };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            // Decoder errors on a torn gzip tail surface as read errors;
            // treat them like truncation.
            Err(_) => return ReadResult::Partial,
        }
    }
    ReadResult::Full
}
