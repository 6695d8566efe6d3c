//! The File Object: an open file's cursor state (current cluster, byte
//! offset, size) plus buffered read/write/seek built on top of the sector
//! cache and FAT table.

use generic_array::{ArrayLength, GenericArray};

use crate::fat::async_io::{AsyncWrite, StreamSignal};
use crate::fat::cache::{EvictionPolicy, SectorCache};
use crate::fat::dir::{DirLocation, ShortDirEntry, SlotAddr};
use crate::fat::error::{Error, LogicalError};
use crate::fat::geometry::Geometry;
use crate::fat::path::{self, Resolved};
use crate::fat::table;
use crate::fat::types::OpenMode;
use crate::storage::BlockDevice;

/// A handle to an open file: its directory entry (for size/attributes),
/// the slot addresses backing that entry (for rewriting size/cluster on
/// close), and a cursor used by `read`/`write`/`seek`.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub entry: ShortDirEntry,
    pub dir_slots: [Option<SlotAddr>; 21],
    pub dir_slot_count: usize,

    /// Byte offset of the next read/write.
    pub position: u32,
    /// Cluster containing `position`, if the file is non-empty and
    /// `position` is within an allocated cluster.
    current_cluster: Option<u32>,
    /// Which cluster index (0-based) `current_cluster` is, so seeking
    /// forward doesn't need to re-walk from the start every time.
    current_cluster_index: u32,

    mode: OpenMode,
    dirty: bool,
}

impl OpenFile {
    fn first_cluster_index_of(&self, byte_offset: u32, bytes_per_cluster: u32) -> u32 {
        byte_offset / bytes_per_cluster
    }

    /// Opens `path` beneath `root` per `mode`: looks the entry up, and (if
    /// missing and `mode.create`) allocates a fresh zero-length file.
    pub fn open<D, N, Ev>(
        geo: &Geometry,
        root: DirLocation,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
        hint: &mut u32,
        path: &str,
        mode: OpenMode,
    ) -> Result<Self, Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        match path::resolve(geo, root, cache, device, path, mode)? {
            Resolved::Found(item) => {
                if item.short.is_dir() {
                    return Err(LogicalError::IsADirectory.into());
                }
                if mode.create && !mode.overwrite && !mode.append {
                    return Err(LogicalError::FilenameAlreadyExists.into());
                }

                let mut entry = item.short;
                let position;

                if mode.overwrite {
                    if entry.first_cluster() != 0 {
                        table::free_chain(geo, cache, device, active_fat, entry.first_cluster())?;
                    }
                    entry.set_first_cluster(0);
                    entry.file_size = 0;
                    position = 0;
                } else if mode.append {
                    position = entry.file_size;
                } else {
                    position = 0;
                }

                let mut file = Self {
                    entry,
                    dir_slots: item.slots,
                    dir_slot_count: item.slot_count,
                    position: 0,
                    current_cluster: None,
                    current_cluster_index: 0,
                    mode,
                    dirty: mode.overwrite,
                };
                file.seek(geo, cache, device, position)?;
                Ok(file)
            }
            Resolved::NotFound { parent } => {
                if !mode.create {
                    return Err(LogicalError::FileNotFound.into());
                }

                let last_component = path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path);
                let short = path::create_entry(geo, parent, cache, device, active_fat, hint, last_component, false, 0)?;

                Ok(Self {
                    entry: short,
                    dir_slots: [None; 21],
                    dir_slot_count: 0,
                    position: 0,
                    current_cluster: None,
                    current_cluster_index: 0,
                    mode,
                    dirty: false,
                })
            }
        }
    }

    pub fn len(&self) -> u32 {
        self.entry.file_size
    }

    /// Advances the cursor's cluster-tracking state to `new_position`,
    /// without allocating new clusters (reads past EOF just stop short;
    /// writes past EOF allocate via `write`, not `seek`).
    pub fn seek<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        new_position: u32,
    ) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        let bpc = geo.bytes_per_cluster();
        self.position = new_position;

        if self.entry.first_cluster() == 0 {
            self.current_cluster = None;
            return Ok(());
        }

        let target_index = self.first_cluster_index_of(new_position, bpc);
        let (mut cluster, mut index) = if self.current_cluster.is_some() && target_index >= self.current_cluster_index {
            (self.current_cluster.unwrap(), self.current_cluster_index)
        } else {
            (self.entry.first_cluster(), 0)
        };

        while index < target_index {
            let next = table::get_entry(geo, cache, device, cluster)?;
            if geo.fat_type.is_eoc(next) {
                // Position is past allocated storage; leave cursor at the
                // last real cluster so `write` knows where to extend from.
                break;
            }
            cluster = next;
            index += 1;
        }

        self.current_cluster = Some(cluster);
        self.current_cluster_index = index;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at the cursor, stopping at
    /// EOF. Returns the number of bytes actually read.
    pub fn read<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        buf: &mut [u8],
    ) -> Result<usize, Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        let bpc = geo.bytes_per_cluster();
        let bps = geo.bytes_per_sector as u32;
        let mut read = 0usize;

        while read < buf.len() && self.position < self.entry.file_size {
            let cluster = match self.current_cluster {
                Some(c) => c,
                None => break,
            };

            let offset_in_cluster = self.position % bpc;
            let sector_in_cluster = offset_in_cluster / bps;
            let offset_in_sector = (offset_in_cluster % bps) as usize;

            let sector = (geo.cluster_to_sector(cluster) + sector_in_cluster) as u64;
            let remaining_in_file = (self.entry.file_size - self.position) as usize;
            let remaining_in_sector = bps as usize - offset_in_sector;
            let n = (buf.len() - read).min(remaining_in_file).min(remaining_in_sector);
            if n == 0 {
                break;
            }

            let sector_data = cache.read(device, sector)?;
            buf[read..read + n].copy_from_slice(&sector_data[offset_in_sector..offset_in_sector + n]);

            read += n;
            let new_position = self.position + n as u32;
            self.seek(geo, cache, device, new_position)?;
        }

        Ok(read)
    }

    /// Ensures the cursor has a cluster to write into at its current
    /// position, allocating the first cluster or extending the chain as
    /// needed, and returns it. Shared by `write`, `write_async` and
    /// `write_stream` so the three paths extend a chain identically.
    fn ensure_current_cluster<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
        hint: &mut u32,
    ) -> Result<u32, Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        if self.entry.first_cluster() == 0 {
            let first = table::allocate_chain(geo, cache, device, active_fat, hint, 1)?;
            self.entry.set_first_cluster(first);
            self.current_cluster = Some(first);
            self.current_cluster_index = 0;
        } else if self.current_cluster.is_none() {
            // Cursor ran off the end of the allocated chain; extend it.
            let mut tail = self.entry.first_cluster();
            let mut idx = 0u32;
            loop {
                let next = table::get_entry(geo, cache, device, tail)?;
                if geo.fat_type.is_eoc(next) {
                    break;
                }
                tail = next;
                idx += 1;
            }
            let new_cluster = table::extend_chain(geo, cache, device, active_fat, hint, tail)?;
            self.current_cluster = Some(new_cluster);
            self.current_cluster_index = idx + 1;
        }

        Ok(self.current_cluster.unwrap())
    }

    /// Moves the cursor to `new_position` after a sector write to `cluster`,
    /// following the FAT onward (without extending) if that crossed a
    /// cluster boundary. Leaves `current_cluster` at `None` if the write
    /// landed exactly on the chain's current end, so the next write through
    /// `ensure_current_cluster` extends it.
    fn advance_after_write<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        new_position: u32,
        bpc: u32,
        cluster: u32,
    ) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        self.position = new_position;
        if new_position % bpc == 0 {
            let next = table::get_entry(geo, cache, device, cluster)?;
            if geo.fat_type.is_eoc(next) {
                self.current_cluster = None;
            } else {
                self.current_cluster = Some(next);
                self.current_cluster_index += 1;
            }
        }
        Ok(())
    }

    /// Writes `buf` at the cursor, allocating new clusters as needed, and
    /// extends `file_size` if the write runs past the current end. Does
    /// not itself persist the directory entry — call `close` (or
    /// `Volume::dismount`) to flush the updated size/first-cluster.
    pub fn write<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
        hint: &mut u32,
        buf: &[u8],
    ) -> Result<usize, Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        let bpc = geo.bytes_per_cluster();
        let bps = geo.bytes_per_sector as u32;
        let mut written = 0usize;

        while written < buf.len() {
            let cluster = self.ensure_current_cluster(geo, cache, device, active_fat, hint)?;
            let offset_in_cluster = self.position % bpc;
            let sector_in_cluster = offset_in_cluster / bps;
            let offset_in_sector = (offset_in_cluster % bps) as usize;

            let sector = (geo.cluster_to_sector(cluster) + sector_in_cluster) as u64;
            let remaining_in_sector = bps as usize - offset_in_sector;
            let n = (buf.len() - written).min(remaining_in_sector);

            let sector_data = cache.write(device, sector)?;
            sector_data[offset_in_sector..offset_in_sector + n].copy_from_slice(&buf[written..written + n]);

            written += n;
            let new_position = self.position + n as u32;
            if new_position > self.entry.file_size {
                self.entry.file_size = new_position;
            }
            self.dirty = true;

            self.advance_after_write(geo, cache, device, new_position, bpc, cluster)?;
        }

        Ok(written)
    }

    /// Queues one sector of asynchronous write at the cursor (spec's
    /// `write_async`): extends the cluster chain exactly like `write`, but
    /// hands the sector straight to `BlockDevice::write_sector_async`
    /// instead of going through the cache, and reports completion through
    /// `AsyncWrite` rather than a plain `Result`. `buf` must hold exactly
    /// one sector — the no-buffering contract (spec §4.5) this path
    /// implements uses caller-owned, potentially DMA-addressable memory
    /// directly.
    ///
    /// The crate's own block devices (`RamDisk`, `FileBackedDevice`) all
    /// use the trait's default `write_sector_async`, which completes
    /// before this call returns — so the bookkeeping below always runs
    /// inline. A device that truly defers completion to interrupt context
    /// would need to drive this same bookkeeping from its own completion
    /// callback instead; that is the one piece of the spec's ISR-reentrant
    /// design this software-only reference engine does not attempt to
    /// simulate.
    pub fn write_async<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
        hint: &mut u32,
        buf: &GenericArray<u8, D::SectorSize>,
    ) -> AsyncWrite<D::Error>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        let cluster = match self.ensure_current_cluster(geo, cache, device, active_fat, hint) {
            Ok(c) => c,
            Err(e) => return AsyncWrite::completed(Err(e)),
        };

        let bpc = geo.bytes_per_cluster();
        let bps = geo.bytes_per_sector as u32;
        let offset_in_cluster = self.position % bpc;
        let sector_in_cluster = offset_in_cluster / bps;
        let sector = (geo.cluster_to_sector(cluster) + sector_in_cluster) as u64;

        let mut outcome = None;
        device.write_sector_async(sector, buf, &mut |result| outcome = Some(result));

        let result = match outcome {
            Some(Ok(())) => {
                let new_position = self.position + bps;
                if new_position > self.entry.file_size {
                    self.entry.file_size = new_position;
                }
                self.dirty = true;
                self.advance_after_write(geo, cache, device, new_position, bpc, cluster)
            }
            Some(Err(e)) => Err(super::write_err(e)),
            None => Err(LogicalError::SeekPastEof.into()),
        };

        AsyncWrite::completed(result)
    }

    /// Drives a multi-sector streaming write at the cursor (spec's
    /// `write_stream`): repeatedly offers `stream_callback` the next
    /// sector-sized buffer to fill, writing it on [`StreamSignal::Ready`],
    /// busy-polling again on [`StreamSignal::Skip`] (preserving cursor and
    /// cluster state exactly so the retry resumes mid-cluster without
    /// losing sector alignment), and stopping on [`StreamSignal::Stop`].
    /// Returns the number of bytes actually streamed. Every cluster this
    /// touches is terminated with EOC the moment it's allocated (the same
    /// write-ahead invariant `write` relies on), so there's no separate
    /// "flush the last cluster's FAT entry" step to perform after `Stop` —
    /// the chain is already consistent; only `close` needs to trim any
    /// still-preallocated tail beyond the final size.
    pub fn write_stream<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
        hint: &mut u32,
        mut stream_callback: impl FnMut(&mut GenericArray<u8, D::SectorSize>) -> StreamSignal,
    ) -> Result<u32, Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        let bpc = geo.bytes_per_cluster();
        let bps = geo.bytes_per_sector as u32;
        let mut streamed = 0u32;

        'sectors: loop {
            let cluster = self.ensure_current_cluster(geo, cache, device, active_fat, hint)?;
            let offset_in_cluster = self.position % bpc;
            let sector_in_cluster = offset_in_cluster / bps;
            let sector = (geo.cluster_to_sector(cluster) + sector_in_cluster) as u64;

            let mut chunk = GenericArray::<u8, D::SectorSize>::default();
            loop {
                match stream_callback(&mut chunk) {
                    StreamSignal::Ready => break,
                    StreamSignal::Skip => continue,
                    StreamSignal::Stop => break 'sectors,
                }
            }

            device.write_sector(sector, &chunk).map_err(super::write_err)?;

            streamed += bps;
            let new_position = self.position + bps;
            if new_position > self.entry.file_size {
                self.entry.file_size = new_position;
            }
            self.dirty = true;
            self.advance_after_write(geo, cache, device, new_position, bpc, cluster)?;
        }

        Ok(streamed)
    }

    /// Flushes the directory entry's current size/first-cluster back to
    /// its slot(s) if either changed since open, and frees any cluster
    /// chain tail that `preallocate`/`write_stream` left allocated but
    /// unused beyond the final `file_size` (spec §4.5).
    pub fn close<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
    ) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        if self.entry.first_cluster() != 0 {
            self.truncate_unused_tail(geo, cache, device, active_fat)?;
        }

        if !self.dirty {
            return Ok(());
        }
        if self.dir_slot_count == 0 {
            return Err(LogicalError::InvalidFilename.into());
        }

        let short_slot = self.dir_slots[self.dir_slot_count - 1].ok_or(Error::from(LogicalError::InvalidFilename))?;
        let buf = cache.write(device, short_slot.sector)?;
        buf[short_slot.offset..short_slot.offset + 32].copy_from_slice(&self.entry.to_bytes());
        self.dirty = false;
        Ok(())
    }

    /// Frees the part of the cluster chain beyond what `file_size` needs:
    /// a zero-length file frees its whole (preallocated) chain, otherwise
    /// the chain is walked to the last cluster the data actually occupies
    /// and anything past it is freed and that cluster re-terminated with
    /// EOC.
    fn truncate_unused_tail<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
    ) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        let bpc = geo.bytes_per_cluster();

        if self.entry.file_size == 0 {
            table::free_chain(geo, cache, device, active_fat, self.entry.first_cluster())?;
            self.entry.set_first_cluster(0);
            self.current_cluster = None;
            self.dirty = true;
            return Ok(());
        }

        let last_needed_index = (self.entry.file_size - 1) / bpc;
        let mut cluster = self.entry.first_cluster();
        let mut index = 0u32;
        while index < last_needed_index {
            let next = table::get_entry(geo, cache, device, cluster)?;
            if geo.fat_type.is_eoc(next) {
                return Ok(());
            }
            cluster = next;
            index += 1;
        }

        let next = table::get_entry(geo, cache, device, cluster)?;
        if geo.fat_type.is_eoc(next) {
            return Ok(());
        }

        table::free_chain(geo, cache, device, active_fat, next)?;
        table::set_entry(geo, cache, device, active_fat, cluster, geo.fat_type.eoc())
    }

    /// Deletes every 32-byte slot (LFN entries plus the short entry) that
    /// this file's directory item occupies, and frees its cluster chain.
    pub fn delete<D, N, Ev>(
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
        entry: &ShortDirEntry,
        slots: &[Option<SlotAddr>],
    ) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        if entry.first_cluster() != 0 {
            table::free_chain(geo, cache, device, active_fat, entry.first_cluster())?;
        }
        for slot in slots.iter().flatten() {
            let buf = cache.write(device, slot.sector)?;
            buf[slot.offset] = 0xE5;
        }
        Ok(())
    }

    /// Pre-allocates `total_size` bytes' worth of clusters up front (spec's
    /// file-alloc hint), without moving the cursor or touching file_size.
    pub fn preallocate<D, N, Ev>(
        &mut self,
        geo: &Geometry,
        cache: &mut SectorCache<D, N, Ev>,
        device: &mut D,
        active_fat: Option<u8>,
        hint: &mut u32,
        total_size: u32,
    ) -> Result<(), Error<D::Error>>
    where
        D: BlockDevice,
        N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
        Ev: EvictionPolicy,
    {
        let bpc = geo.bytes_per_cluster();
        let wanted_clusters = ((total_size + bpc - 1) / bpc).max(1) as usize;

        if self.entry.first_cluster() == 0 {
            let first = table::allocate_chain(geo, cache, device, active_fat, hint, wanted_clusters)?;
            self.entry.set_first_cluster(first);
            self.dirty = true;
            return Ok(());
        }

        let mut have = 1usize;
        let mut tail = self.entry.first_cluster();
        loop {
            let next = table::get_entry(geo, cache, device, tail)?;
            if geo.fat_type.is_eoc(next) {
                break;
            }
            tail = next;
            have += 1;
        }

        while have < wanted_clusters {
            tail = table::extend_chain(geo, cache, device, active_fat, hint, tail)?;
            have += 1;
        }

        Ok(())
    }
}

/// Renames/moves a file or directory from `src_entry` (with its known
/// slots) into `dest_dir` under `new_long_name`. Cross-volume rename is
/// impossible by construction (there is only ever one volume in scope), so
/// that error exists purely as a defined failure mode for API callers that
/// might otherwise assume it's reachable.
pub fn rename<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    active_fat: Option<u8>,
    hint: &mut u32,
    dest_dir: DirLocation,
    new_long_name: &str,
    src_entry: &ShortDirEntry,
    src_slots: &[Option<SlotAddr>],
) -> Result<ShortDirEntry, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    if path::find_in_dir(geo, dest_dir, cache, device, new_long_name)?.is_some() {
        return Err(LogicalError::FilenameAlreadyExists.into());
    }

    let new_entry = path::create_entry(
        geo, dest_dir, cache, device, active_fat, hint,
        new_long_name, src_entry.is_dir(), src_entry.first_cluster(),
    )?;

    for slot in src_slots.iter().flatten() {
        let buf = cache.write(device, slot.sector)?;
        buf[slot.offset] = 0xE5;
    }

    Ok(new_entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::boot_sector::{BiosParameterBlock, BootSector, ExtendedBootSignature, FatExtension};
    use crate::fat::cache::LeastRecentlyAccessed;
    use crate::storage::RamDisk;
    use typenum::consts::{U16, U512};

    type TestCache = SectorCache<RamDisk<U512>, U16, LeastRecentlyAccessed>;

    fn fat16_geometry() -> Geometry {
        let bs = BootSector {
            oem_name: *b"SDFAT   ",
            bpb: BiosParameterBlock {
                bytes_per_sector: 512,
                sectors_per_cluster: 1,
                reserved_sector_count: 1,
                num_fats: 2,
                root_entry_count: 16,
                total_sectors_16: 200,
                media_descriptor: 0xF8,
                sectors_per_fat_16: 2,
                sectors_per_track: 0,
                num_heads: 0,
                hidden_sectors: 0,
                total_sectors_32: 0,
            },
            extension: FatExtension::Fat12Or16(ExtendedBootSignature {
                physical_drive_number: 0x80,
                volume_id: 1,
                volume_label: *b"NO NAME    ",
                file_system_type: *b"FAT16   ",
            }),
        };
        Geometry::from_boot_sector(&bs).unwrap()
    }

    fn new_empty_file(geo: &Geometry) -> OpenFile {
        let mut dir_slots = [None; 21];
        dir_slots[0] = Some(SlotAddr { sector: geo.root_dir_start_sector as u64, offset: 0 });

        OpenFile {
            entry: ShortDirEntry::new_file(*b"HELLO   ", *b"TXT", 0),
            dir_slots,
            dir_slot_count: 1,
            position: 0,
            current_cluster: None,
            current_cluster_index: 0,
            mode: OpenMode::create(),
            dirty: false,
        }
    }

    #[test]
    fn write_stream_spans_multiple_clusters_and_stops_on_signal() {
        let geo = fat16_geometry();
        let mut disk = RamDisk::<U512>::new(200);
        let mut cache = TestCache::new();
        let mut hint = 2;
        let mut file = new_empty_file(&geo);

        // Two clusters' worth (one sector each, since sectors_per_cluster
        // == 1 in this fixture) plus a Stop before a third sector.
        let mut sectors_offered = 0u32;
        let streamed = file
            .write_stream(&geo, &mut cache, &mut disk, None, &mut hint, |buf| {
                if sectors_offered >= 2 {
                    return StreamSignal::Stop;
                }
                buf[0] = sectors_offered as u8;
                sectors_offered += 1;
                StreamSignal::Ready
            })
            .unwrap();

        assert_eq!(streamed, 2 * geo.bytes_per_sector as u32);
        assert_eq!(file.entry.file_size, streamed);

        let first = file.entry.first_cluster();
        let chain: Vec<u32> = table::ChainIter::new(geo, &mut cache, &mut disk, first).map(|r| r.unwrap()).collect();
        assert_eq!(chain.len(), 2, "stream should have allocated exactly two clusters");
    }

    #[test]
    fn write_async_writes_one_sector_and_extends_the_chain() {
        let geo = fat16_geometry();
        let mut disk = RamDisk::<U512>::new(200);
        let mut cache = TestCache::new();
        let mut hint = 2;
        let mut file = new_empty_file(&geo);

        let mut buf = GenericArray::<u8, U512>::default();
        buf[0] = 0x42;
        let mut result = file.write_async(&geo, &mut cache, &mut disk, None, &mut hint, &buf);
        assert!(result.is_done());
        result.take_result().unwrap().unwrap();

        assert_eq!(file.entry.file_size, geo.bytes_per_sector as u32);
        assert_ne!(file.entry.first_cluster(), 0);
    }

    #[test]
    fn close_frees_unused_preallocated_tail() {
        let geo = fat16_geometry();
        let mut disk = RamDisk::<U512>::new(200);
        let mut cache = TestCache::new();
        let mut hint = 2;
        let mut file = new_empty_file(&geo);

        file.preallocate(&geo, &mut cache, &mut disk, None, &mut hint, 4 * geo.bytes_per_cluster()).unwrap();
        let written = file.write(&geo, &mut cache, &mut disk, None, &mut hint, b"x").unwrap();
        assert_eq!(written, 1);

        let first = file.entry.first_cluster();
        let before: Vec<u32> = table::ChainIter::new(geo, &mut cache, &mut disk, first).map(|r| r.unwrap()).collect();
        assert_eq!(before.len(), 4, "preallocate should have reserved all four clusters");

        file.close(&geo, &mut cache, &mut disk, None).unwrap();

        let after: Vec<u32> = table::ChainIter::new(geo, &mut cache, &mut disk, first).map(|r| r.unwrap()).collect();
        assert_eq!(after.len(), 1, "close should free every cluster beyond what file_size needs");
    }
}
