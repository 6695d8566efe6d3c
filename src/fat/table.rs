//! The FAT Table itself: per-cluster entry get/set, chain allocation,
//! extension, freeing, and enumeration. FAT12's nibble-packed entries are
//! the one place this module has to straddle sector boundaries; FAT16/32
//! entries always fit within a single sector since sector sizes are
//! multiples of 2 and 4 respectively.

use crate::fat::cache::{EvictionPolicy, SectorCache};
use crate::fat::error::{CapacityError, Error};
use crate::fat::geometry::Geometry;
use crate::fat::types::FatType;
use crate::storage::BlockDevice;

use generic_array::{ArrayLength, GenericArray};

fn entry_byte_offset(fat_type: FatType, cluster: u32) -> u64 {
    match fat_type {
        FatType::Fat12 => cluster as u64 + cluster as u64 / 2,
        FatType::Fat16 => cluster as u64 * 2,
        FatType::Fat32 => cluster as u64 * 4,
    }
}

fn read_byte<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    which_fat: u8,
    byte_offset: u64,
) -> Result<u8, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let bps = geo.bytes_per_sector as u64;
    let sector = geo.fat_sector(which_fat) as u64 + byte_offset / bps;
    let offset = (byte_offset % bps) as usize;
    let s = cache.read(device, sector)?;
    Ok(s[offset])
}

fn write_byte<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    which_fat: u8,
    byte_offset: u64,
    value: u8,
) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let bps = geo.bytes_per_sector as u64;
    let sector = geo.fat_sector(which_fat) as u64 + byte_offset / bps;
    let offset = (byte_offset % bps) as usize;
    let s = cache.write(device, sector)?;
    s[offset] = value;
    Ok(())
}

fn get_entry_in_fat<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    which_fat: u8,
    cluster: u32,
) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let offset = entry_byte_offset(geo.fat_type, cluster);

    let raw = match geo.fat_type {
        FatType::Fat12 => {
            let b0 = read_byte(geo, cache, device, which_fat, offset)?;
            let b1 = read_byte(geo, cache, device, which_fat, offset + 1)?;
            let word = (b0 as u16) | ((b1 as u16) << 8);
            if cluster & 1 == 0 { (word & 0x0FFF) as u32 } else { (word >> 4) as u32 }
        }
        FatType::Fat16 => {
            let b0 = read_byte(geo, cache, device, which_fat, offset)?;
            let b1 = read_byte(geo, cache, device, which_fat, offset + 1)?;
            ((b0 as u16) | ((b1 as u16) << 8)) as u32
        }
        FatType::Fat32 => {
            let b0 = read_byte(geo, cache, device, which_fat, offset)?;
            let b1 = read_byte(geo, cache, device, which_fat, offset + 1)?;
            let b2 = read_byte(geo, cache, device, which_fat, offset + 2)?;
            let b3 = read_byte(geo, cache, device, which_fat, offset + 3)?;
            u32::from_le_bytes([b0, b1, b2, b3])
        }
    };

    Ok(geo.fat_type.mask(raw))
}

fn set_entry_in_fat<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    which_fat: u8,
    cluster: u32,
    value: u32,
) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let offset = entry_byte_offset(geo.fat_type, cluster);

    match geo.fat_type {
        FatType::Fat12 => {
            let b0 = read_byte(geo, cache, device, which_fat, offset)?;
            let b1 = read_byte(geo, cache, device, which_fat, offset + 1)?;
            let mut word = (b0 as u16) | ((b1 as u16) << 8);

            if cluster & 1 == 0 {
                word = (word & 0xF000) | (value as u16 & 0x0FFF);
            } else {
                word = (word & 0x000F) | ((value as u16 & 0x0FFF) << 4);
            }

            write_byte(geo, cache, device, which_fat, offset, (word & 0xFF) as u8)?;
            write_byte(geo, cache, device, which_fat, offset + 1, (word >> 8) as u8)?;
        }
        FatType::Fat16 => {
            let bytes = (value as u16).to_le_bytes();
            write_byte(geo, cache, device, which_fat, offset, bytes[0])?;
            write_byte(geo, cache, device, which_fat, offset + 1, bytes[1])?;
        }
        FatType::Fat32 => {
            // Preserve the reserved top 4 bits of whatever was already there.
            let existing = {
                let b0 = read_byte(geo, cache, device, which_fat, offset)?;
                let b1 = read_byte(geo, cache, device, which_fat, offset + 1)?;
                let b2 = read_byte(geo, cache, device, which_fat, offset + 2)?;
                let b3 = read_byte(geo, cache, device, which_fat, offset + 3)?;
                u32::from_le_bytes([b0, b1, b2, b3])
            };
            let new = (existing & 0xF000_0000) | (value & 0x0FFF_FFFF);
            let bytes = new.to_le_bytes();
            write_byte(geo, cache, device, which_fat, offset, bytes[0])?;
            write_byte(geo, cache, device, which_fat, offset + 1, bytes[1])?;
            write_byte(geo, cache, device, which_fat, offset + 2, bytes[2])?;
            write_byte(geo, cache, device, which_fat, offset + 3, bytes[3])?;
        }
    }

    Ok(())
}

/// Reads a cluster's entry from the first (primary) FAT copy.
pub fn get_entry<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    cluster: u32,
) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    get_entry_in_fat(geo, cache, device, 0, cluster)
}

/// Sets a cluster's entry, mirroring the write to every active FAT copy
/// (all of them, unless the FAT32 extension flags mark only one as active).
pub fn set_entry<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    active_fat: Option<u8>,
    cluster: u32,
    value: u32,
) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    match active_fat {
        Some(which) => set_entry_in_fat(geo, cache, device, which, cluster, value),
        None => {
            for which in 0..geo.num_fats {
                set_entry_in_fat(geo, cache, device, which, cluster, value)?;
            }
            Ok(())
        }
    }
}

/// Walks a cluster chain starting at `start`, yielding each cluster number
/// in order. Stops (returns `None`) once an end-of-chain marker is hit.
pub struct ChainIter<'c, 'd, D, N, Ev>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    geo: Geometry,
    cache: &'c mut SectorCache<D, N, Ev>,
    device: &'d mut D,
    current: Option<u32>,
}

impl<'c, 'd, D, N, Ev> ChainIter<'c, 'd, D, N, Ev>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    pub fn new(geo: Geometry, cache: &'c mut SectorCache<D, N, Ev>, device: &'d mut D, start: u32) -> Self {
        Self { geo, cache, device, current: Some(start) }
    }
}

impl<'c, 'd, D, N, Ev> Iterator for ChainIter<'c, 'd, D, N, Ev>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    type Item = Result<u32, Error<D::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        let cluster = self.current?;

        if self.geo.fat_type.is_bad(cluster) || !self.geo.is_valid_data_cluster(cluster) {
            self.current = None;
            return None;
        }

        match get_entry(&self.geo, self.cache, self.device, cluster) {
            Ok(next) => {
                self.current = if self.geo.fat_type.is_eoc(next) { None } else { Some(next) };
                Some(Ok(cluster))
            }
            Err(e) => {
                self.current = None;
                Some(Err(e))
            }
        }
    }
}

/// Finds and returns the next free cluster at or after `hint`, wrapping
/// around to cluster 2 once if necessary. `hint` is advanced past whatever
/// is returned so repeated calls sweep the whole table rather than
/// rescanning from the start each time.
fn find_free_cluster<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    hint: &mut u32,
) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let last_cluster = geo.cluster_count + 2;
    let start = if *hint < 2 || *hint >= last_cluster { 2 } else { *hint };

    let mut cluster = start;
    loop {
        if geo.fat_type.is_free(get_entry(geo, cache, device, cluster)?) {
            *hint = cluster + 1;
            return Ok(cluster);
        }

        cluster += 1;
        if cluster >= last_cluster {
            cluster = 2;
        }
        if cluster == start {
            return Err(CapacityError::InsufficientDiskSpace.into());
        }
    }
}

/// Allocates a fresh `count`-cluster chain (`count >= 1`), chaining each
/// cluster to the next and terminating the last with EOC. Returns the
/// first cluster. On running out of space partway through, already-claimed
/// clusters are freed before the error is returned.
pub fn allocate_chain<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    active_fat: Option<u8>,
    hint: &mut u32,
    count: usize,
) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    debug_assert!(count >= 1);

    let first = find_free_cluster(geo, cache, device, hint)?;
    set_entry(geo, cache, device, active_fat, first, geo.fat_type.eoc())?;

    let mut prev = first;
    for _ in 1..count {
        match find_free_cluster(geo, cache, device, hint) {
            Ok(next) => {
                set_entry(geo, cache, device, active_fat, prev, next)?;
                set_entry(geo, cache, device, active_fat, next, geo.fat_type.eoc())?;
                prev = next;
            }
            Err(e) => {
                free_chain(geo, cache, device, active_fat, first)?;
                return Err(e);
            }
        }
    }

    Ok(first)
}

/// Appends one new cluster to the end of the chain whose tail is
/// `last_cluster`, returning the newly allocated cluster number.
pub fn extend_chain<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    active_fat: Option<u8>,
    hint: &mut u32,
    last_cluster: u32,
) -> Result<u32, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let new = find_free_cluster(geo, cache, device, hint)?;
    set_entry(geo, cache, device, active_fat, new, geo.fat_type.eoc())?;
    set_entry(geo, cache, device, active_fat, last_cluster, new)?;
    Ok(new)
}

/// Frees every cluster in the chain starting at `start`.
pub fn free_chain<D, N, Ev>(
    geo: &Geometry,
    cache: &mut SectorCache<D, N, Ev>,
    device: &mut D,
    active_fat: Option<u8>,
    start: u32,
) -> Result<(), Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    let mut current = Some(start);
    while let Some(cluster) = current {
        let next = get_entry(geo, cache, device, cluster)?;
        set_entry(geo, cache, device, active_fat, cluster, FatType::FREE)?;
        current = if geo.fat_type.is_eoc(next) { None } else { Some(next) };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::boot_sector::{BiosParameterBlock, BootSector, ExtendedBootSignature, FatExtension};
    use crate::fat::cache::LeastRecentlyAccessed;
    use crate::storage::RamDisk;
    use typenum::consts::{U16, U512};

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

    type TestCache = crate::fat::cache::SectorCache<RamDisk<U512>, U16, LeastRecentlyAccessed>;

    #[test]
    fn allocate_extend_and_free_a_chain() {
        let geo = fat16_geometry();
        let mut disk = RamDisk::<U512>::new(200);
        let mut cache = TestCache::new();
        let mut hint = 2;

        let first = allocate_chain(&geo, &mut cache, &mut disk, None, &mut hint, 3).unwrap();
        let collected: Vec<u32> = ChainIter::new(geo, &mut cache, &mut disk, first).map(|r| r.unwrap()).collect();
        assert_eq!(collected.len(), 3);

        let tail = *collected.last().unwrap();
        let extended = extend_chain(&geo, &mut cache, &mut disk, None, &mut hint, tail).unwrap();
        let collected2: Vec<u32> = ChainIter::new(geo, &mut cache, &mut disk, first).map(|r| r.unwrap()).collect();
        assert_eq!(collected2.len(), 4);
        assert_eq!(*collected2.last().unwrap(), extended);

        free_chain(&geo, &mut cache, &mut disk, None, first).unwrap();
        for c in collected2 {
            assert_eq!(get_entry(&geo, &mut cache, &mut disk, c).unwrap(), FatType::FREE);
        }
    }

    #[test]
    fn out_of_space_rolls_back_partial_allocation() {
        let geo = fat16_geometry();
        let mut disk = RamDisk::<U512>::new(200);
        let mut cache = TestCache::new();
        let mut hint = 2;

        // This geometry's cluster_count is small; ask for way more than exist.
        let huge = (geo.cluster_count + 10) as usize;
        let err = allocate_chain(&geo, &mut cache, &mut disk, None, &mut hint, huge);
        assert!(err.is_err());

        // Every cluster should be free again after the rollback.
        for c in 2..(geo.cluster_count + 2) {
            assert_eq!(get_entry(&geo, &mut cache, &mut disk, c).unwrap(), FatType::FREE);
        }
    }
}
