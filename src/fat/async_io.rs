//! Asynchronous & Streaming Engine (spec §4.6): continuation objects that
//! drive a `BlockDevice`'s optional async/multi-sector-write primitives
//! without holding a borrow across the callback boundary (the callback
//! re-enters through a plain function pointer plus an owned continuation,
//! never a closure capturing a reference into the caller's stack frame).
//!
//! `fat::file::OpenFile::write_async`/`write_stream` are the file-aware
//! drivers built on top of the vocabulary here: they walk/extend the
//! file's own cluster chain sector by sector, reusing `StreamSignal` and
//! `AsyncWrite` so a caller sees the same two shapes whether they're
//! streaming into a file or (via `StreamWrite` below) writing a raw,
//! already-known sector range such as the formatter's FAT mirrors.

use core::fmt::Debug;

use generic_array::GenericArray;

use crate::fat::error::Error;
use crate::storage::{BlockDevice, WriteError};

#[cfg(not(feature = "no_std"))]
use alloc::boxed::Box;

/// Drives a single asynchronous sector write through to completion,
/// invoking a user callback exactly once. Exists mostly to give
/// `OpenFile::write_async` a named return type; on devices that don't
/// support true async (`BlockDevice::supports_async() == false`) the
/// callback fires before this value is ever returned.
pub struct AsyncWrite<E: Debug> {
    pub result: Option<Result<(), Error<E>>>,
}

impl<E: Debug> AsyncWrite<E> {
    pub fn completed(result: Result<(), Error<E>>) -> Self {
        Self { result: Some(result) }
    }

    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }

    pub fn take_result(&mut self) -> Option<Result<(), Error<E>>> {
        self.result.take()
    }
}

/// The three outcomes a streaming-write callback can hand back after being
/// offered the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    /// Supply the next chunk (the callback has consumed/queued the current
    /// one and is ready for more).
    Ready,
    /// Skip this chunk's sector range (leave it untouched on disk) and
    /// move on to the next.
    Skip,
    /// Stop the stream entirely; no further sectors are written.
    Stop,
}

/// Drives `BlockDevice::write_sector` (or, when available, a genuine
/// multi-sector command) across a run of consecutive sectors, asking a
/// per-chunk callback for `StreamSignal` direction between chunks. This is
/// the engine behind large sequential writes (e.g. `format_volume` laying
/// down a FAT mirror, or a file write that spans many sectors) on devices
/// that expose `supports_multi_sector_write()`.
pub struct StreamWrite<'a, D: BlockDevice> {
    device: &'a mut D,
    start_sector: u64,
    sector_count: u64,
    cursor: u64,
}

impl<'a, D: BlockDevice> StreamWrite<'a, D> {
    pub fn new(device: &'a mut D, start_sector: u64, sector_count: u64) -> Self {
        Self { device, start_sector, sector_count, cursor: 0 }
    }

    /// Runs the stream to completion (or until `Stop`/error), calling
    /// `next_chunk` before each sector to obtain its contents and
    /// `on_signal` isn't needed — `next_chunk` itself returns the
    /// `StreamSignal` alongside the buffer to fill, since in practice the
    /// two are decided together (no more data == `Stop`, don't care about
    /// this one == `Skip`).
    pub fn run(
        &mut self,
        mut next_chunk: impl FnMut(u64, &mut GenericArray<u8, D::SectorSize>) -> StreamSignal,
    ) -> Result<u64, WriteError<D::Error>> {
        let mut buffer = GenericArray::<u8, D::SectorSize>::default();
        let mut written = 0u64;

        while self.cursor < self.sector_count {
            let absolute = self.start_sector + self.cursor;
            match next_chunk(absolute, &mut buffer) {
                StreamSignal::Ready => {
                    self.device.write_sector(absolute, &buffer)?;
                    written += 1;
                }
                StreamSignal::Skip => {}
                StreamSignal::Stop => break,
            }
            self.cursor += 1;
        }

        Ok(written)
    }
}

/// An owned, heap-boxed completion callback for true async writes on
/// devices that support pipelining (`supports_async() == true`). Only
/// available with `alloc` (i.e. outside the strict `no_std` + no-`alloc`
/// configuration); callers targeting the tightest footprint should poll
/// `AsyncWrite` directly instead of registering a boxed callback.
#[cfg(not(feature = "no_std"))]
pub struct PendingWrite<E> {
    callback: Box<dyn FnMut(Result<(), WriteError<E>>)>,
}

#[cfg(not(feature = "no_std"))]
impl<E> PendingWrite<E> {
    pub fn new(callback: impl FnMut(Result<(), WriteError<E>>) + 'static) -> Self {
        Self { callback: Box::new(callback) }
    }

    pub fn complete(&mut self, result: Result<(), WriteError<E>>) {
        (self.callback)(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamDisk;
    use typenum::consts::U512;

    #[test]
    fn stream_write_fills_every_sector() {
        let mut disk = RamDisk::<U512>::new(4);
        let mut stream = StreamWrite::new(&mut disk, 0, 4);

        let written = stream
            .run(|sector, buf| {
                buf[0] = sector as u8;
                StreamSignal::Ready
            })
            .unwrap();
        assert_eq!(written, 4);

        let mut buf = GenericArray::<u8, U512>::default();
        disk.read_sector(2, &mut buf).unwrap();
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn stream_write_stops_early() {
        let mut disk = RamDisk::<U512>::new(4);
        let mut stream = StreamWrite::new(&mut disk, 0, 4);

        let written = stream
            .run(|sector, _buf| if sector < 2 { StreamSignal::Ready } else { StreamSignal::Stop })
            .unwrap();
        assert_eq!(written, 2);
    }

    #[test]
    fn stream_write_can_skip_chunks() {
        let mut disk = RamDisk::<U512>::new(4);
        disk.write_sector(1, &{
            let mut b = GenericArray::<u8, U512>::default();
            b[0] = 0xAA;
            b
        }).unwrap();

        let mut stream = StreamWrite::new(&mut disk, 0, 4);
        stream
            .run(|sector, buf| {
                if sector == 1 {
                    StreamSignal::Skip
                } else {
                    buf[0] = 1;
                    StreamSignal::Ready
                }
            })
            .unwrap();

        let mut buf = GenericArray::<u8, U512>::default();
        disk.read_sector(1, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAA, "skipped sector must be untouched");
    }
}
