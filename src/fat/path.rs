//! The Path Resolver: splits a `/`- or `\`-separated absolute path into
//! components and walks directories to find (or create) the entry it
//! names, doing case-insensitive matching against both the long and short
//! names of each candidate.

use generic_array::{ArrayLength, GenericArray};

use crate::fat::cache::{EvictionPolicy, SectorCache};
use crate::fat::dir::{derive_short_name, DirIter, DirItem, DirLocation, LfnEntry, ShortDirEntry};
use crate::fat::error::{Error, LogicalError};
use crate::fat::geometry::Geometry;
use crate::fat::table;
use crate::fat::types::OpenMode;
use crate::storage::BlockDevice;

/// An iterator over the `/`-or-`\`-separated, non-empty components of a
/// path. A path must start with a separator (absolute); this is checked by
/// `split` before any component is yielded.
pub struct Components<'p> {
    rest: &'p str,
}

pub fn split(path: &str) -> Result<Components<'_>, LogicalError> {
    if !(path.starts_with('/') || path.starts_with('\\')) {
        return Err(LogicalError::PathNotAbsolute);
    }
    Ok(Components { rest: path })
}

impl<'p> Iterator for Components<'p> {
    type Item = &'p str;

    fn next(&mut self) -> Option<&'p str> {
        loop {
            self.rest = self.rest.trim_start_matches(|c| c == '/' || c == '\\');
            if self.rest.is_empty() {
                return None;
            }
            let end = self.rest.find(|c| c == '/' || c == '\\').unwrap_or(self.rest.len());
            let (component, rest) = self.rest.split_at(end);
            self.rest = rest;
            return Some(component);
        }
    }
}

fn short_name_matches(entry: &ShortDirEntry, component: &str) -> bool {
    let mut combined = [0u8; 12];
    let mut n = 0;
    for &b in entry.name.iter() {
        if b == b' ' {
            break;
        }
        combined[n] = b;
        n += 1;
    }
    let ext_len = entry.ext.iter().take_while(|&&b| b != b' ').count();
    if ext_len > 0 {
        combined[n] = b'.';
        n += 1;
        for &b in entry.ext[..ext_len].iter() {
            combined[n] = b;
            n += 1;
        }
    }

    let short_str = core::str::from_utf8(&combined[..n]).unwrap_or("");
    component.eq_ignore_ascii_case(short_str)
}

fn item_matches(item: &DirItem, component: &str) -> bool {
    if let Some(long) = &item.long_name {
        if long.eq_ignore_case_str(component) {
            return true;
        }
    }
    short_name_matches(&item.short, component)
}

/// Searches one directory's entries for a component, case-insensitively
/// against both names. Returns the matching `DirItem`, if any.
pub fn find_in_dir<D, N, Ev>(
    geo: &Geometry,
    location: DirLocation,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    component: &str,
) -> Result<Option<DirItem>, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let iter = DirIter::new(*geo, location, cache, device);
    for item in iter {
        let item = item?;
        if item.short.is_volume_label() {
            continue;
        }
        if item_matches(&item, component) {
            return Ok(Some(item));
        }
    }
    Ok(None)
}

/// The outcome of resolving a path down to its final component.
pub enum Resolved {
    Found(DirItem),
    /// The parent directory exists but the final component doesn't — valid
    /// for `OpenMode::create`/`create_overwrite`.
    NotFound { parent: DirLocation },
}

/// Resolves `path` against `root`, walking each intermediate directory
/// component by component. Fails with `LogicalError::NotADirectory` if a
/// non-terminal component names a file, and `LogicalError::FileNotFound`
/// if an intermediate directory component is itself missing.
pub fn resolve<D, N, Ev>(
    geo: &Geometry,
    root: DirLocation,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    path: &str,
    mode: OpenMode,
) -> Result<Resolved, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let mut components = split(path)?.peekable();
    let mut current_dir = root;

    loop {
        let component = match components.next() {
            Some(c) => c,
            None => return Err(LogicalError::InvalidFilename.into()),
        };
        let is_last = components.peek().is_none();

        match find_in_dir(geo, current_dir, cache, device, component)? {
            Some(item) if is_last => return Ok(Resolved::Found(item)),
            Some(item) => {
                if !item.short.is_dir() {
                    return Err(LogicalError::NotADirectory.into());
                }
                current_dir = DirLocation::Chain { start_cluster: item.short.first_cluster() };
            }
            None if is_last => {
                if mode.create {
                    return Ok(Resolved::NotFound { parent: current_dir });
                }
                return Err(LogicalError::FileNotFound.into());
            }
            None => return Err(LogicalError::FileNotFound.into()),
        }
    }
}

/// Appends a new short entry (plus the LFN entries needed to represent
/// `long_name` losslessly, if it doesn't already fit losslessly in 8.3) to
/// the end of `dir`, growing the directory by one cluster if it's full.
/// Returns the finished `ShortDirEntry`.
pub fn create_entry<D, N, Ev>(
    geo: &Geometry,
    dir: DirLocation,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    active_fat: Option<u8>,
    hint: &mut u32,
    long_name: &str,
    is_dir: bool,
    first_cluster: u32,
) -> Result<ShortDirEntry, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    // Collect existing short names to drive collision numbering.
    let (name, ext) = {
        let mut taken = |n: &[u8; 8], e: &[u8; 3]| -> bool {
            let iter = DirIter::new(*geo, dir, &mut *cache, &mut *device);
            for item in iter {
                if let Ok(item) = item {
                    if &item.short.name == n && &item.short.ext == e {
                        return true;
                    }
                }
            }
            false
        };
        derive_short_name(long_name, &mut taken)
    };

    let short = if is_dir {
        ShortDirEntry::new_dir(name, ext, first_cluster)
    } else {
        ShortDirEntry::new_file(name, ext, first_cluster)
    };

    let needs_lfn = {
        let mut buf = [0u8; 12];
        let mut n = 0;
        for &c in name.iter().take_while(|&&c| c != b' ') {
            buf[n] = c;
            n += 1;
        }
        if ext[0] != b' ' {
            buf[n] = b'.';
            n += 1;
            for &c in ext.iter().take_while(|&&c| c != b' ') {
                buf[n] = c;
                n += 1;
            }
        }
        let chosen_str = core::str::from_utf8(&buf[..n]).unwrap_or("");
        !long_name.eq_ignore_ascii_case(chosen_str)
    };

    let mut lfn_units = [0u16; 255];
    let mut lfn_len = 0;
    if needs_lfn {
        for c in long_name.encode_utf16() {
            if lfn_len < lfn_units.len() {
                lfn_units[lfn_len] = c;
                lfn_len += 1;
            }
        }
    }

    let mut lfn_entries = [LfnEntry { ordinal: 0, name1: [0; 5], name2: [0; 6], name3: [0; 2], checksum: 0 }; 20];
    let lfn_count = if needs_lfn {
        LfnEntry::encode(&lfn_units[..lfn_len], short.checksum(), &mut lfn_entries)
    } else {
        0
    };

    let total_slots = lfn_count + 1;
    let mut raw_slots: [[u8; 32]; 21] = [[0u8; 32]; 21];
    for i in 0..lfn_count {
        // On-disk order is highest ordinal first.
        raw_slots[i] = lfn_entries[lfn_count - 1 - i].to_bytes();
    }
    raw_slots[lfn_count] = short.to_bytes();

    write_slots(geo, dir, cache, device, active_fat, hint, &raw_slots[..total_slots])?;

    Ok(short)
}

/// Finds `total` consecutive free (End-or-Deleted) 32-byte slots starting
/// from the beginning of `dir` and writes `raw_slots` into them,
/// terminating with a fresh End marker if the previous end moved. Grows
/// the directory by one cluster if no run of free slots is long enough.
fn write_slots<D, N, Ev>(
    geo: &Geometry,
    dir: DirLocation,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    active_fat: Option<u8>,
    hint: &mut u32,
    raw_slots: &[[u8; 32]],
) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    // Walk the directory's raw slots, looking for `raw_slots.len()`
    // consecutive Deleted/End slots. Track sector+offset of the run start.
    let bps = geo.bytes_per_sector as usize;
    let mut run_start: Option<(u64, usize)> = None;
    let mut run_len = 0usize;
    let mut hit_end_at: Option<(u64, usize)> = None;

    let mut cursor = DirIter::new(*geo, dir, cache, device);
    'scan: loop {
        let raw = match cursor.next_raw() {
            Some(Ok((raw, addr))) => (raw, addr),
            Some(Err(e)) => return Err(e),
            None => break,
        };
        let (bytes, addr) = raw;
        let entry = crate::fat::dir::ShortDirEntry::from_bytes(&bytes);
        use crate::fat::dir::EntryState::*;
        match entry.state() {
            End => {
                hit_end_at = Some((addr.sector, addr.offset));
                break 'scan;
            }
            Deleted => {
                if run_start.is_none() {
                    run_start = Some((addr.sector, addr.offset));
                    run_len = 1;
                } else {
                    run_len += 1;
                }
                if run_len >= raw_slots.len() {
                    break 'scan;
                }
            }
            Exists => {
                run_start = None;
                run_len = 0;
            }
        }
    }

    let start = if run_len >= raw_slots.len() {
        run_start.unwrap()
    } else if let Some(end_addr) = hit_end_at {
        end_addr
    } else {
        // Directory is completely full up to its current extent; grow it
        // by one cluster (only possible for cluster-chain directories —
        // a fixed-size FAT12/16 root is simply full).
        match dir {
            DirLocation::Chain { start_cluster } => {
                // Walk to the tail cluster.
                let mut tail = start_cluster;
                loop {
                    let next = table::get_entry(geo, cache, device, tail)?;
                    if geo.fat_type.is_eoc(next) {
                        break;
                    }
                    tail = next;
                }
                let new_cluster = table::extend_chain(geo, cache, device, active_fat, hint, tail)?;
                let sector = geo.cluster_to_sector(new_cluster) as u64;
                let zero = crate::fat::dir::ShortDirEntry::free_slot().to_bytes();
                for s in 0..geo.sectors_per_cluster as u64 {
                    let buf = cache.write(device, sector + s)?;
                    for chunk in buf.chunks_mut(32) {
                        chunk.copy_from_slice(&zero);
                    }
                }
                (sector, 0)
            }
            DirLocation::FixedRoot { .. } => return Err(crate::fat::error::CapacityError::DirectoryFull.into()),
        }
    };

    let (mut sector, mut offset) = start;

    // For a cluster-chain directory, figure out which cluster `sector`
    // belongs to and how far into it, so a run of slots that crosses a
    // sector boundary mid-cluster (or spills into the next cluster, which
    // need not be numbered contiguously on disk) advances correctly instead
    // of assuming `sector + 1` is always the next sector of the directory.
    let spc = geo.sectors_per_cluster as u64;
    let mut cluster_cursor: Option<(u32, u64)> = match dir {
        DirLocation::Chain { start_cluster } => {
            let mut cluster = start_cluster;
            loop {
                let first = geo.cluster_to_sector(cluster) as u64;
                if sector < first + spc {
                    break Some((cluster, sector - first));
                }
                let next = table::get_entry(geo, cache, device, cluster)?;
                if geo.fat_type.is_eoc(next) {
                    break Some((cluster, spc - 1));
                }
                cluster = next;
            }
        }
        DirLocation::FixedRoot { .. } => None,
    };

    for slot in raw_slots {
        if offset + 32 > bps {
            offset = 0;
            match (dir, &mut cluster_cursor) {
                (DirLocation::FixedRoot { .. }, _) => sector += 1,
                (DirLocation::Chain { .. }, Some((cluster, sector_in_cluster))) => {
                    if *sector_in_cluster + 1 < spc {
                        *sector_in_cluster += 1;
                        sector += 1;
                    } else {
                        let next = table::get_entry(geo, cache, device, *cluster)?;
                        let extended = geo.fat_type.is_eoc(next);
                        let next_cluster = if extended {
                            table::extend_chain(geo, cache, device, active_fat, hint, *cluster)?
                        } else {
                            next
                        };
                        *cluster = next_cluster;
                        *sector_in_cluster = 0;
                        sector = geo.cluster_to_sector(next_cluster) as u64;

                        if extended {
                            // Freshly allocated cluster: zero it like the
                            // directory-grow branch above, so the old
                            // end-of-directory marker doesn't get replaced
                            // by stale on-disk bytes that `DirIter` would
                            // then read as live entries.
                            let zero = crate::fat::dir::ShortDirEntry::free_slot().to_bytes();
                            for s in 0..spc {
                                let buf = cache.write(device, sector + s)?;
                                for chunk in buf.chunks_mut(32) {
                                    chunk.copy_from_slice(&zero);
                                }
                            }
                        }
                    }
                }
                (DirLocation::Chain { .. }, None) => unreachable!("chain directory always has a cluster cursor"),
            }
        }
        let buf = cache.write(device, sector)?;
        buf[offset..offset + 32].copy_from_slice(slot);
        offset += 32;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_paths() {
        let parts: Vec<&str> = split("/foo/bar.txt").unwrap().collect();
        assert_eq!(parts, vec!["foo", "bar.txt"]);
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(matches!(split("foo/bar.txt"), Err(LogicalError::PathNotAbsolute)));
    }

    #[test]
    fn collapses_repeated_separators() {
        let parts: Vec<&str> = split("//foo\\\\bar//").unwrap().collect();
        assert_eq!(parts, vec!["foo", "bar"]);
    }
}
