//! The FAT12/16/32 engine. `Volume` is the single entry point: mount a
//! `BlockDevice`, get back a handle that owns the sector cache and knows how
//! to open, read, write, rename and delete through the directory tree.
//!
//! The submodules below are organized the way the spec's components are
//! laid out: on-disk structures (`boot_sector`, `geometry`, `table`, `dir`),
//! then the engines built on top of them (`cache`, `path`, `file`,
//! `async_io`, `format`), then the shared vocabulary (`error`, `types`).

use generic_array::{ArrayLength, GenericArray};

use crate::fat::boot_sector::{BootSector, FatExtension, FsInfo};
use crate::fat::cache::{CacheEntry, EvictionPolicy, LeastRecentlyAccessed, SectorCache};
use crate::fat::dir::{DirIter, DirLocation, ShortDirEntry};
use crate::fat::error::{Error, FormatError, LogicalError};
use crate::fat::file::OpenFile;
use crate::fat::geometry::Geometry;
use crate::fat::path::Resolved;
use crate::fat::types::{FatType, OpenMode};
use crate::storage::{BlockDevice, ReadError, WriteError};

pub mod async_io;
pub mod boot_sector;
pub mod cache;
pub mod dir;
pub mod error;
pub mod file;
pub mod format;
pub mod geometry;
pub mod path;
pub mod table;
pub mod types;

fn read_err<E>(e: ReadError<E>) -> Error<E> {
    match e {
        ReadError::Other(e) => Error::Io(e),
        ReadError::OutOfRange { .. } => Error::Format(FormatError::CorruptedVolume),
    }
}

fn write_err<E>(e: WriteError<E>) -> Error<E> {
    match e {
        WriteError::Other(e) => Error::Io(e),
        WriteError::OutOfRange { .. } => Error::Format(FormatError::CorruptedVolume),
    }
}

/// Mount-time configuration (spec §9: "configuration instead of extra
/// positional booleans"). The sector-cache eviction policy is a compile-time
/// choice (the `Ev` type parameter below); this struct only covers the
/// run-time knobs.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Ignore `FsInfo`'s free-cluster hint entirely and walk the whole FAT
    /// once at mount time instead. Off by default: a trustworthy `FsInfo` is
    /// the common case and a full scan costs one read per cluster.
    pub force_fat_scan: bool,
    /// Hint consulted by the streaming write path (`fat::async_io`) when
    /// deciding whether to align writes to erase-block boundaries.
    pub optimize_for_flash: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { force_fat_scan: false, optimize_for_flash: false }
    }
}

/// A mounted FAT volume. Owns the block device, the sector cache, and the
/// free-cluster bookkeeping that `FsInfo` is just an on-disk cache of.
///
/// `N` is the cache's capacity (a `typenum` constant, same as the rest of
/// the crate); `Ev` selects its eviction policy and defaults to
/// `LeastRecentlyAccessed`.
pub struct Volume<D: BlockDevice, N, Ev = LeastRecentlyAccessed>
where
    N: ArrayLength<CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    geo: Geometry,
    device: D,
    cache: SectorCache<D, N, Ev>,
    /// Next cluster to try when allocating (spec's `FSI_Nxt_Free`).
    hint: u32,
    /// `Some(n)` if the FAT32 extension flags mark only FAT copy `n` as
    /// live; `None` means every copy is kept in sync (the FAT12/16 case,
    /// and the common FAT32 case).
    active_fat: Option<u8>,
    /// Advisory free-cluster count; `None` until known (FAT12/16 don't
    /// carry one at all) or after a write invalidates it mid-session.
    free_cluster_count: Option<u32>,
    volume_label: [u8; 11],
    options: MountOptions,
    open_files: u32,
    mutated: bool,
}

fn scan_free_clusters<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
) -> Result<(u32, u32), Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let mut count = 0u32;
    let mut first_free = None;

    for cluster in 2..(geo.cluster_count + 2) {
        if geo.fat_type.is_free(table::get_entry(geo, cache, device, cluster)?) {
            count += 1;
            if first_free.is_none() {
                first_free = Some(cluster);
            }
        }
    }

    Ok((count, first_free.unwrap_or(2)))
}

impl<D, N, Ev> Volume<D, N, Ev>
where
    D: BlockDevice,
    N: ArrayLength<CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    /// Mounts `device`: reads and validates the boot sector, derives the
    /// `Geometry`, and (FAT32 only) either trusts `FsInfo`'s free-cluster
    /// hint or, if it's missing/inconsistent (or `force_fat_scan` is set),
    /// rebuilds it with a one-time linear FAT scan.
    pub fn mount(mut device: D, options: MountOptions) -> Result<Self, Error<D::Error>> {
        let mut sector = GenericArray::<u8, D::SectorSize>::default();
        device.read_sector(0, &mut sector).map_err(read_err)?;

        if !BootSector::has_valid_boot_signature(&sector) {
            return Err(Error::Format(FormatError::CorruptedVolume));
        }

        let boot_sector = BootSector::read(&sector);
        let geo = Geometry::from_boot_sector(&boot_sector)?;
        let volume_label = *boot_sector.volume_label();

        let active_fat = match &boot_sector.extension {
            FatExtension::Fat32 { ext, .. } => ext.single_active_fat(),
            FatExtension::Fat12Or16(_) => None,
        };

        let mut cache = SectorCache::new();

        let (free_cluster_count, hint) = if geo.fat_type != FatType::Fat32 {
            (None, 2)
        } else if options.force_fat_scan {
            log::info!("mount: forcing a full FAT scan to rebuild the free-cluster count");
            let (count, hint) = scan_free_clusters(&geo, &mut cache, &mut device)?;
            (Some(count), hint)
        } else {
            let mut fsinfo_sector = GenericArray::<u8, D::SectorSize>::default();
            device.read_sector(geo.fs_info_sector as u64, &mut fsinfo_sector).map_err(read_err)?;

            match FsInfo::read(&fsinfo_sector) {
                Some(fsinfo)
                    if fsinfo.free_cluster_count != boot_sector::UNKNOWN
                        && fsinfo.next_free_cluster != boot_sector::UNKNOWN
                        && geo.is_valid_data_cluster(fsinfo.next_free_cluster) =>
                {
                    (Some(fsinfo.free_cluster_count), fsinfo.next_free_cluster)
                }
                _ => {
                    log::warn!("mount: FsInfo missing or inconsistent, rescanning the FAT");
                    let (count, hint) = scan_free_clusters(&geo, &mut cache, &mut device)?;
                    (Some(count), hint)
                }
            }
        };

        Ok(Self {
            geo,
            device,
            cache,
            hint,
            active_fat,
            free_cluster_count,
            volume_label,
            options,
            open_files: 0,
            mutated: false,
        })
    }

    /// Flushes the cache and, for FAT32, writes back `FsInfo` (rescanning
    /// the FAT first if anything was written this session, since we don't
    /// track the count incrementally). Returns the device so the caller can
    /// reuse it.
    pub fn dismount(mut self) -> Result<D, Error<D::Error>> {
        if self.open_files > 0 {
            log::warn!("dismount: {} file handle(s) still open", self.open_files);
        }

        if self.geo.fat_type == FatType::Fat32 {
            if self.mutated {
                let (count, hint) = scan_free_clusters(&self.geo, &mut self.cache, &mut self.device)?;
                self.free_cluster_count = Some(count);
                self.hint = hint;
            }
            self.flush_fs_info()?;
        }

        self.cache.flush(&mut self.device)?;
        Ok(self.device)
    }

    fn flush_fs_info(&mut self) -> Result<(), Error<D::Error>> {
        let fsinfo = FsInfo {
            free_cluster_count: self.free_cluster_count.unwrap_or(boot_sector::UNKNOWN),
            next_free_cluster: self.hint,
        };
        let mut sector = GenericArray::<u8, D::SectorSize>::default();
        fsinfo.write(&mut sector);
        self.device.write_sector(self.geo.fs_info_sector as u64, &sector).map_err(write_err)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn volume_label(&self) -> &[u8; 11] {
        &self.volume_label
    }

    /// The free-cluster count last known to this mount, if any (FAT12/16
    /// volumes never carry one; use [`Self::count_free_clusters`] instead).
    pub fn free_cluster_count(&self) -> Option<u32> {
        self.free_cluster_count
    }

    /// Walks the whole FAT and counts free clusters directly; always
    /// correct, but `O(cluster_count)`. `free_cluster_count` is the cheap
    /// advisory alternative on FAT32.
    pub fn count_free_clusters(&mut self) -> Result<u32, Error<D::Error>> {
        let (count, _) = scan_free_clusters(&self.geo, &mut self.cache, &mut self.device)?;
        Ok(count)
    }

    pub fn root(&self) -> DirLocation {
        match self.geo.fat_type {
            FatType::Fat32 => DirLocation::Chain { start_cluster: self.geo.root_cluster },
            _ => DirLocation::FixedRoot {
                start_sector: self.geo.root_dir_start_sector,
                sector_count: self.geo.root_dir_sector_count,
            },
        }
    }

    /// Resolves `path` to the directory it names (the root, if `path` is
    /// just a run of separators).
    fn dir_location(&mut self, path: &str) -> Result<DirLocation, Error<D::Error>> {
        let trimmed = path.trim_matches(|c| c == '/' || c == '\\');
        if trimmed.is_empty() {
            return Ok(self.root());
        }

        match path::resolve(&self.geo, self.root(), &mut self.cache, &mut self.device, path, OpenMode::read_only())? {
            Resolved::Found(item) => {
                if !item.short.is_dir() {
                    return Err(LogicalError::NotADirectory.into());
                }
                Ok(DirLocation::Chain { start_cluster: item.short.first_cluster() })
            }
            Resolved::NotFound { .. } => Err(LogicalError::FileNotFound.into()),
        }
    }

    /// Opens (and, per `mode`, creates) `path`.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<OpenFile, Error<D::Error>> {
        self.mutated = self.mutated || mode.write;
        let root = self.root();
        let file = OpenFile::open(&self.geo, root, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint, path, mode)?;
        self.open_files += 1;
        Ok(file)
    }

    pub fn seek(&mut self, file: &mut OpenFile, position: u32) -> Result<(), Error<D::Error>> {
        file.seek(&self.geo, &mut self.cache, &mut self.device, position)
    }

    pub fn read(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize, Error<D::Error>> {
        file.read(&self.geo, &mut self.cache, &mut self.device, buf)
    }

    pub fn write(&mut self, file: &mut OpenFile, buf: &[u8]) -> Result<usize, Error<D::Error>> {
        self.mutated = true;
        file.write(&self.geo, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint, buf)
    }

    pub fn preallocate(&mut self, file: &mut OpenFile, total_size: u32) -> Result<(), Error<D::Error>> {
        self.mutated = true;
        file.preallocate(&self.geo, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint, total_size)
    }

    pub fn close(&mut self, mut file: OpenFile) -> Result<(), Error<D::Error>> {
        let result = file.close(&self.geo, &mut self.cache, &mut self.device, self.active_fat);
        self.open_files = self.open_files.saturating_sub(1);
        result
    }

    /// Queues one sector of async write at `file`'s cursor (spec's
    /// `write_async`). See [`file::OpenFile::write_async`].
    pub fn write_async(
        &mut self,
        file: &mut OpenFile,
        buf: &GenericArray<u8, D::SectorSize>,
    ) -> async_io::AsyncWrite<D::Error> {
        self.mutated = true;
        file.write_async(&self.geo, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint, buf)
    }

    /// Drives a streaming multi-sector write at `file`'s cursor (spec's
    /// `write_stream`). See [`file::OpenFile::write_stream`].
    pub fn write_stream(
        &mut self,
        file: &mut OpenFile,
        stream_callback: impl FnMut(&mut GenericArray<u8, D::SectorSize>) -> async_io::StreamSignal,
    ) -> Result<u32, Error<D::Error>> {
        self.mutated = true;
        file.write_stream(&self.geo, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint, stream_callback)
    }

    /// Iterates the entries of the directory named by `path` (`"/"` for the
    /// root). Skips nothing — callers filter out `.`/`..` themselves, same
    /// as the underlying [`dir::DirIter`].
    pub fn read_dir<'v>(&'v mut self, path: &str) -> Result<DirIter<'v, 'v, D, N, Ev>, Error<D::Error>> {
        let location = self.dir_location(path)?;
        Ok(DirIter::new(self.geo, location, &mut self.cache, &mut self.device))
    }

    /// Creates a directory at `path`, seeding it with `.` and `..` entries.
    /// `..` points at cluster 0 when the parent is the root, matching the
    /// convention every FAT driver uses regardless of whether the root
    /// itself is a fixed region (FAT12/16) or cluster 2+ (FAT32).
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error<D::Error>> {
        let root = self.root();
        match path::resolve(&self.geo, root, &mut self.cache, &mut self.device, path, OpenMode::create())? {
            Resolved::Found(_) => Err(LogicalError::FilenameAlreadyExists.into()),
            Resolved::NotFound { parent } => {
                let name = path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path);

                let new_cluster = table::allocate_chain(&self.geo, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint, 1)?;
                self.zero_cluster(new_cluster)?;

                let dot_dot_cluster = match parent {
                    DirLocation::FixedRoot { .. } => 0,
                    DirLocation::Chain { start_cluster } => start_cluster,
                };
                self.write_dot_entries(new_cluster, dot_dot_cluster)?;

                self.mutated = true;
                path::create_entry(&self.geo, parent, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint, name, true, new_cluster)?;
                Ok(())
            }
        }
    }

    fn zero_cluster(&mut self, cluster: u32) -> Result<(), Error<D::Error>> {
        let first_sector = self.geo.cluster_to_sector(cluster) as u64;
        for i in 0..self.geo.sectors_per_cluster as u64 {
            let buf = self.cache.write(&mut self.device, first_sector + i)?;
            for b in buf.iter_mut() {
                *b = 0;
            }
        }
        Ok(())
    }

    fn write_dot_entries(&mut self, cluster: u32, dot_dot_cluster: u32) -> Result<(), Error<D::Error>> {
        let dot = ShortDirEntry::new_dir(*b".       ", *b"   ", cluster);
        let dot_dot = ShortDirEntry::new_dir(*b"..      ", *b"   ", dot_dot_cluster);

        let sector = self.geo.cluster_to_sector(cluster) as u64;
        let buf = self.cache.write(&mut self.device, sector)?;
        buf[0..32].copy_from_slice(&dot.to_bytes());
        buf[32..64].copy_from_slice(&dot_dot.to_bytes());
        Ok(())
    }

    /// Deletes the file or (empty) directory named by `path`.
    pub fn delete(&mut self, path: &str) -> Result<(), Error<D::Error>> {
        let root = self.root();
        match path::resolve(&self.geo, root, &mut self.cache, &mut self.device, path, OpenMode::read_only())? {
            Resolved::Found(item) => {
                if item.short.is_dir() {
                    let location = DirLocation::Chain { start_cluster: item.short.first_cluster() };
                    let mut iter = DirIter::new(self.geo, location, &mut self.cache, &mut self.device);
                    let has_children = iter.any(|entry| match entry {
                        Ok(entry) => entry.short.name != *b".       " && entry.short.name != *b"..      ",
                        Err(_) => true,
                    });
                    if has_children {
                        return Err(LogicalError::AccessDenied.into());
                    }
                }

                self.mutated = true;
                OpenFile::delete(&self.geo, &mut self.cache, &mut self.device, self.active_fat, &item.short, &item.slots[..item.slot_count])
            }
            Resolved::NotFound { .. } => Err(LogicalError::FileNotFound.into()),
        }
    }

    /// Moves/renames `src_path` to `dest_path`. Both must resolve under this
    /// same volume (there's no other volume in scope to move to or from).
    pub fn rename(&mut self, src_path: &str, dest_path: &str) -> Result<(), Error<D::Error>> {
        let root = self.root();
        let src_item = match path::resolve(&self.geo, root, &mut self.cache, &mut self.device, src_path, OpenMode::read_only())? {
            Resolved::Found(item) => item,
            Resolved::NotFound { .. } => return Err(LogicalError::FileNotFound.into()),
        };

        if !(dest_path.starts_with('/') || dest_path.starts_with('\\')) {
            return Err(LogicalError::PathNotAbsolute.into());
        }
        let trimmed = dest_path.trim_end_matches(|c| c == '/' || c == '\\');
        let trimmed = if trimmed.is_empty() { dest_path } else { trimmed };
        let split_at = trimmed.rfind(|c| c == '/' || c == '\\').unwrap_or(0);
        let dest_parent_path = &trimmed[..=split_at];
        let dest_name = &trimmed[split_at + 1..];

        let dest_dir = self.dir_location(dest_parent_path)?;

        self.mutated = true;
        file::rename(
            &self.geo, &mut self.cache, &mut self.device, self.active_fat, &mut self.hint,
            dest_dir, dest_name, &src_item.short, &src_item.slots[..src_item.slot_count],
        )?;
        Ok(())
    }
}
