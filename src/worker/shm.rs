//! A shared-memory segment used to marshal one worker's result back to the
//! parent, with a temp-file spill for oversized payloads.
//!
//! `memmap2::MmapMut::map_anon` creates a `MAP_SHARED | MAP_ANONYMOUS`
//! mapping: the mapping (not just its contents) survives `fork()`, so a
//! forked child writing into its copy of the mapping is writing into the
//! same physical pages the parent reads from afterwards — no separate IPC
//! channel needed for the fork strategy. `tempfile` backs the overflow
//! path per §4.F ("fall back to a temporary file").

use std::io::Write;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::worker::wire::{self, Status};

pub(crate) struct Segment {
    mmap: MmapMut,
}

impl Segment {
    pub(crate) fn new(size: usize) -> Result<Self> {
        let mmap = MmapMut::map_anon(size).map_err(Error::from)?;
        Ok(Self { mmap })
    }

    /// Writes `body` into the segment if it fits alongside the header;
    /// otherwise spills it to a temp file and writes a `Spilled` header
    /// naming that file's path instead.
    pub(crate) fn write_result(&mut self, status: Status, body: &[u8]) -> Result<()> {
        let needed = wire::HEADER_LEN + body.len();
        if needed <= self.mmap.len() {
            let header = wire::encode_header(status, body.len() as u64);
            self.mmap[..wire::HEADER_LEN].copy_from_slice(&header);
            self.mmap[wire::HEADER_LEN..needed].copy_from_slice(body);
            Ok(())
        } else {
            let mut file = tempfile::NamedTempFile::new().map_err(Error::from)?;
            file.write_all(body).map_err(Error::from)?;
            let (_, path) = file.keep().map_err(|e| Error::WorkerFailure(e.to_string()))?;
            let path_bytes = path.to_string_lossy().into_owned().into_bytes();
            let header = wire::encode_header(Status::Spilled, path_bytes.len() as u64);
            let needed = wire::HEADER_LEN + path_bytes.len();
            if needed > self.mmap.len() {
                return Err(Error::WorkerFailure(
                    "spilled result path does not fit in the shared segment".into(),
                ));
            }
            self.mmap[..wire::HEADER_LEN].copy_from_slice(&header);
            self.mmap[wire::HEADER_LEN..needed].copy_from_slice(&path_bytes);
            Ok(())
        }
    }

    /// Reads back whatever `write_result` wrote, resolving a `Spilled`
    /// header transparently by reading the named temp file (and removing
    /// it afterwards).
    pub(crate) fn read_result(&self) -> Result<(Status, Vec<u8>)> {
        let (status, len) = wire::decode_header(&self.mmap)?;
        let len = len as usize;
        let body = &self.mmap[wire::HEADER_LEN..wire::HEADER_LEN + len];
        match status {
            Status::Spilled => {
                let path = String::from_utf8_lossy(body).into_owned();
                let data = std::fs::read(&path).map_err(Error::from)?;
                let _ = std::fs::remove_file(&path);
                Ok((Status::Ok, data))
            }
            other => Ok((other, body.to_vec())),
        }
    }
}
