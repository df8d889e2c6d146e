//! Producer side of the ingestion pipeline.
//!
//! The radio subscription delivers events on its own thread, outside the
//! async runtime. This reader stands in for that callback thread: it reads one
//! JSON event per line from stdin or a file and hands each one to the
//! runtime through [`IngestHandle::submit`], which never blocks.

use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::thread::JoinHandle;

use super::RawEvent;
use crate::bridge::ingest::{IngestHandle, SubmitError, Submitted};
use crate::logutil::preview;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub lines: u64,
    pub submitted: u64,
    pub unparsable: u64,
    /// Older queued events evicted to make room for newer ones
    pub dropped: u64,
}

/// `-` is stdin, anything else a file path.
pub fn open_source(source: &str) -> io::Result<Box<dyn BufRead + Send>> {
    if source == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(source)?)))
    }
}

/// Read events until EOF or until the ingest side closes.
pub fn read_events<R: BufRead>(input: R, handle: &IngestHandle) -> ReaderStats {
    let mut stats = ReaderStats::default();
    for line in input.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("Radio event source read error: {}", e);
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        stats.lines += 1;
        let payload = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                stats.unparsable += 1;
                handle.record_malformed();
                debug!("Dropping unparsable radio event ({}): {}", e, preview(trimmed, 120));
                continue;
            }
        };
        match handle.submit(RawEvent::new(payload)) {
            Ok(Submitted::Queued) => stats.submitted += 1,
            Ok(Submitted::EvictedOldest) => {
                stats.submitted += 1;
                stats.dropped += 1;
            }
            Err(SubmitError::Closed) => {
                debug!("Ingest closed, radio reader stopping");
                break;
            }
        }
    }
    stats
}

/// Run [`read_events`] on a dedicated thread. The handle is closed when the
/// source is exhausted, which lets the bridge drain and stop.
pub fn spawn(
    input: Box<dyn BufRead + Send>,
    handle: IngestHandle,
) -> io::Result<JoinHandle<ReaderStats>> {
    std::thread::Builder::new()
        .name("radio-reader".to_string())
        .spawn(move || {
            let stats = read_events(input, &handle);
            handle.close();
            info!(
                "Radio reader finished: {} lines, {} submitted, {} unparsable, {} dropped",
                stats.lines, stats.submitted, stats.unparsable, stats.dropped
            );
            stats
        })
}
