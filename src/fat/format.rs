//! The Formatter (spec §4.7): lays down a fresh boot sector, FSInfo (FAT32
//! only), zeroed FAT copies with their reserved entries, and an empty root
//! directory, for a caller-chosen FAT type and cluster size.
//!
//! Grounded on `original_source/fat32lib/fat_format.h`'s
//! `fat_format_volume(fs_type, volume_label, sectors_per_cluster, device)`
//! entry point; its body isn't in the retrieval pack (only the header is),
//! so the cluster-size defaulting table below follows the well-known
//! Microsoft recommendation the spec names directly (§4.7: "prefer the
//! canonical Microsoft table when sectors_per_cluster = 0").

use generic_array::{ArrayLength, GenericArray};
use typenum::marker_traits::Unsigned;

use crate::fat::boot_sector::{
    BiosParameterBlock, BootSector, ExtendedBootSignature, Fat32Extension, FatExtension, FsInfo,
};
use crate::fat::cache::{LeastRecentlyAccessed, SectorCache};
use crate::fat::error::{Error, FormatError};
use crate::fat::geometry::Geometry;
use crate::fat::table;
use crate::fat::types::FatType;
use crate::storage::{BlockDevice, WriteError};

/// Which FAT variant to format as. `Auto` picks the variant Microsoft's own
/// formatter would choose for a volume of this size (the same thresholds
/// `FatType::classify` uses to *read* an existing volume).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedFatType {
    Fat12,
    Fat16,
    Fat32,
    Auto,
}

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub fs_type: RequestedFatType,
    /// Space-padded, uppercased, 11 bytes (the formatter accepts up to 12
    /// characters as the spec's §6.2 allows and truncates/pads here).
    pub label: [u8; 11],
    /// 0 means "pick the canonical default for this device's size".
    pub sectors_per_cluster: u8,
    pub volume_id: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fs_type: RequestedFatType::Auto,
            label: *b"NO NAME    ",
            sectors_per_cluster: 0,
            volume_id: 0,
        }
    }
}

fn write_err<E>(e: WriteError<E>) -> Error<E> {
    match e {
        WriteError::Other(e) => Error::Io(e),
        WriteError::OutOfRange { .. } => Error::Format(FormatError::InvalidFormat),
    }
}

/// Microsoft's canonical default cluster size by volume size, expressed in
/// sectors (the table is usually quoted in KB; this assumes the common
/// 512-byte sector). Used only when the caller leaves
/// `sectors_per_cluster == 0`.
fn default_sectors_per_cluster(total_sectors: u32, bytes_per_sector: u16, fat32: bool) -> u8 {
    let total_bytes = total_sectors as u64 * bytes_per_sector as u64;
    let mb = total_bytes / (1024 * 1024);

    if fat32 {
        match mb {
            0..=8_192 => 8, // up to 8 GiB -> 4 KiB clusters
            8_193..=16_384 => 16,
            16_385..=32_768 => 32,
            _ => 64,
        }
    } else {
        match mb {
            0..=32 => 1, // up to 32 MiB -> 512 B clusters
            33..=64 => 2,
            65..=128 => 4,
            129..=256 => 8,
            257..=512 => 16,
            513..=1_024 => 32,
            1_025..=2_048 => 64,
            _ => 128,
        }
    }
}

fn choose_fat_type(requested: RequestedFatType, total_sectors: u32, sectors_per_cluster: u8) -> FatType {
    match requested {
        RequestedFatType::Fat12 => FatType::Fat12,
        RequestedFatType::Fat16 => FatType::Fat16,
        RequestedFatType::Fat32 => FatType::Fat32,
        RequestedFatType::Auto => {
            // Rough cluster-count estimate (reserved + FAT overhead is tiny
            // relative to the data region for any volume worth auto-picking
            // a type for) used only to classify; the real derived value is
            // recomputed from the actual laid-out geometry afterward.
            let approx_clusters = total_sectors / sectors_per_cluster.max(1) as u32;
            FatType::classify(approx_clusters)
        }
    }
}

/// Formats `device` as a fresh FAT volume per `options`, returning the
/// `Geometry` of the volume that was just written (ready to hand straight
/// to `Volume::mount`, which will re-derive and validate the same thing
/// from what was just written to sector 0).
pub fn format_volume<D, N>(
    device: &mut D,
    cache: &mut SectorCache<D, N, LeastRecentlyAccessed>,
    options: FormatOptions,
) -> Result<Geometry, Error<D::Error>>
where
    D: BlockDevice,
    N: ArrayLength<crate::fat::cache::CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
{
    let bytes_per_sector = D::SectorSize::to_u16();
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(FormatError::InvalidFormat.into());
    }

    let total_sectors = device.sector_count();
    if total_sectors > u32::MAX as u64 {
        return Err(FormatError::InvalidFormat.into());
    }
    let total_sectors = total_sectors as u32;

    let sectors_per_cluster_guess = if options.sectors_per_cluster == 0 {
        // We don't yet know if this will end up FAT32 when guessing the
        // default cluster size; use the non-FAT32 table first and let
        // `choose_fat_type` correct the guess below once the real type is
        // known.
        default_sectors_per_cluster(total_sectors, bytes_per_sector, false)
    } else {
        options.sectors_per_cluster
    };
    if sectors_per_cluster_guess == 0 || !sectors_per_cluster_guess.is_power_of_two() {
        return Err(FormatError::InvalidFormat.into());
    }

    let fat_type = choose_fat_type(options.fs_type, total_sectors, sectors_per_cluster_guess);

    let sectors_per_cluster = if options.sectors_per_cluster != 0 {
        options.sectors_per_cluster
    } else {
        default_sectors_per_cluster(total_sectors, bytes_per_sector, fat_type == FatType::Fat32)
    };

    let reserved_sector_count: u16 = if fat_type == FatType::Fat32 { 32 } else { 1 };
    let num_fats: u8 = 2;

    // Root directory sizing: fixed 512-entry region for FAT12/16 (the
    // traditional default), a single cluster for FAT32.
    let root_entry_count: u16 = if fat_type == FatType::Fat32 { 0 } else { 512 };
    let root_dir_sectors =
        (root_entry_count as u32 * 32 + bytes_per_sector as u32 - 1) / bytes_per_sector as u32;

    // Solve for sectors-per-FAT: entries must cover every data cluster plus
    // the two reserved entries, and entry width depends on `fat_type`, which
    // itself depends on the cluster count this FAT size produces. Iterate to
    // a fixed point rather than inverting the formula in closed form, the
    // way real-world formatters do.
    let mut sectors_per_fat: u32 = 1;
    for _ in 0..32 {
        let fat_region = sectors_per_fat * num_fats as u32;
        let data_sectors = total_sectors
            .saturating_sub(reserved_sector_count as u32)
            .saturating_sub(fat_region)
            .saturating_sub(root_dir_sectors);
        let cluster_count = data_sectors / sectors_per_cluster as u32;

        let bits_per_entry: u64 = match fat_type {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        };
        let entries = cluster_count as u64 + 2;
        let bytes_needed = (entries * bits_per_entry + 7) / 8;
        let needed =
            ((bytes_needed + bytes_per_sector as u64 - 1) / bytes_per_sector as u64).max(1) as u32;

        if needed == sectors_per_fat {
            break;
        }
        sectors_per_fat = needed;
    }

    if total_sectors
        <= reserved_sector_count as u32 + sectors_per_fat * num_fats as u32 + root_dir_sectors
    {
        return Err(FormatError::InvalidFormat.into());
    }

    let root_cluster: u32 = if fat_type == FatType::Fat32 { 2 } else { 0 };
    let fs_info_sector: u16 = if fat_type == FatType::Fat32 { 1 } else { 0 };

    let bpb = BiosParameterBlock {
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sector_count,
        num_fats,
        root_entry_count,
        total_sectors_16: if total_sectors <= u16::MAX as u32 && fat_type != FatType::Fat32 {
            total_sectors as u16
        } else {
            0
        },
        media_descriptor: 0xF8,
        sectors_per_fat_16: if fat_type == FatType::Fat32 { 0 } else { sectors_per_fat as u16 },
        sectors_per_track: 63,
        num_heads: 255,
        hidden_sectors: 0,
        total_sectors_32: if total_sectors > u16::MAX as u32 || fat_type == FatType::Fat32 {
            total_sectors
        } else {
            0
        },
    };

    let sig = ExtendedBootSignature {
        physical_drive_number: 0x80,
        volume_id: options.volume_id,
        volume_label: options.label,
        file_system_type: match fat_type {
            FatType::Fat12 => *b"FAT12   ",
            FatType::Fat16 => *b"FAT16   ",
            FatType::Fat32 => *b"FAT32   ",
        },
    };

    let extension = if fat_type == FatType::Fat32 {
        FatExtension::Fat32 {
            ext: Fat32Extension {
                sectors_per_fat_32: sectors_per_fat,
                mirroring_flags: 0,
                version: 0,
                root_cluster,
                fs_info_sector,
                backup_boot_sector: 6,
            },
            sig,
        }
    } else {
        FatExtension::Fat12Or16(sig)
    };

    let boot_sector = BootSector { oem_name: *b"SDFAT   ", bpb, extension };

    let mut sector0 = GenericArray::<u8, D::SectorSize>::default();
    boot_sector.write(&mut sector0);
    device.write_sector(0, &sector0).map_err(write_err)?;

    if fat_type == FatType::Fat32 {
        let fsinfo = FsInfo { free_cluster_count: crate::fat::boot_sector::UNKNOWN, next_free_cluster: 3 };
        let mut fsinfo_sector = GenericArray::<u8, D::SectorSize>::default();
        fsinfo.write(&mut fsinfo_sector);
        device.write_sector(1, &fsinfo_sector).map_err(write_err)?;

        // Mirror the boot sector + FSInfo at the backup location.
        device.write_sector(6, &sector0).map_err(write_err)?;
        device.write_sector(7, &fsinfo_sector).map_err(write_err)?;
    }

    let geo = Geometry::from_boot_sector(&boot_sector)?;

    // Zero out every FAT sector first, then stamp the two reserved entries.
    let zero = GenericArray::<u8, D::SectorSize>::default();
    for which in 0..geo.num_fats {
        let base = geo.fat_sector(which) as u64;
        for s in 0..geo.sectors_per_fat as u64 {
            device.write_sector(base + s, &zero).map_err(write_err)?;
        }
    }

    // Entry 0 carries the media descriptor in its low byte with the
    // remaining bits set; entry 1 is initialized to EOC (the top bits there
    // double as the "clean unmount" / "no I/O error" flags on a real FAT
    // volume, which this formatter always starts out set).
    let entry0 = match geo.fat_type {
        FatType::Fat12 => 0x0F00 | 0xF8u32,
        FatType::Fat16 => 0xFF00 | 0xF8u32,
        FatType::Fat32 => 0x0FFF_FF00 | 0xF8u32,
    };
    table::set_entry(&geo, cache, device, None, 0, entry0)?;
    table::set_entry(&geo, cache, device, None, 1, geo.fat_type.eoc())?;

    if fat_type == FatType::Fat32 {
        // The root directory occupies cluster 2, terminated immediately.
        table::set_entry(&geo, cache, device, None, root_cluster, geo.fat_type.eoc())?;
    }
    cache.flush(device)?;

    // Zero the root directory region: the fixed FAT12/16 region, or the
    // single cluster allocated above for FAT32.
    if fat_type == FatType::Fat32 {
        let sector = geo.cluster_to_sector(root_cluster) as u64;
        for s in 0..geo.sectors_per_cluster as u64 {
            device.write_sector(sector + s, &zero).map_err(write_err)?;
        }
    } else {
        for s in 0..geo.root_dir_sector_count as u64 {
            device
                .write_sector(geo.root_dir_start_sector as u64 + s, &zero)
                .map_err(write_err)?;
        }
    }

    Ok(geo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::dir::{DirIter, DirLocation};
    use crate::storage::RamDisk;
    use typenum::consts::{U16, U512};

    #[test]
    fn formats_a_small_fat16_volume() {
        let mut disk = RamDisk::<U512>::new(8192); // 4 MiB
        let mut cache: SectorCache<RamDisk<U512>, U16, LeastRecentlyAccessed> = SectorCache::new();

        let geo = format_volume(
            &mut disk,
            &mut cache,
            FormatOptions { fs_type: RequestedFatType::Fat16, ..Default::default() },
        )
        .unwrap();

        assert_eq!(geo.fat_type, FatType::Fat16);
        assert!(geo.cluster_count > 0);

        let root = DirLocation::FixedRoot {
            start_sector: geo.root_dir_start_sector,
            sector_count: geo.root_dir_sector_count,
        };
        let mut iter = DirIter::new(geo, root, &mut cache, &mut disk);
        assert!(iter.next().is_none());
    }

    #[test]
    fn formats_a_fat32_volume_with_valid_fsinfo() {
        let mut disk = RamDisk::<U512>::new(200_000); // ~100 MiB
        let mut cache: SectorCache<RamDisk<U512>, U16, LeastRecentlyAccessed> = SectorCache::new();

        let geo = format_volume(
            &mut disk,
            &mut cache,
            FormatOptions { fs_type: RequestedFatType::Fat32, ..Default::default() },
        )
        .unwrap();

        assert_eq!(geo.fat_type, FatType::Fat32);

        let mut fsinfo_sector = GenericArray::<u8, U512>::default();
        disk.read_sector(1, &mut fsinfo_sector).unwrap();
        assert!(FsInfo::read(&fsinfo_sector).is_some());

        let mut boot = GenericArray::<u8, U512>::default();
        disk.read_sector(0, &mut boot).unwrap();
        assert!(BootSector::has_valid_boot_signature(&boot));
    }

    #[test]
    fn auto_picks_fat32_for_a_large_volume() {
        let mut disk = RamDisk::<U512>::new(20_000_000); // ~10 GiB
        let mut cache: SectorCache<RamDisk<U512>, U16, LeastRecentlyAccessed> = SectorCache::new();

        let geo = format_volume(&mut disk, &mut cache, FormatOptions::default()).unwrap();
        assert_eq!(geo.fat_type, FatType::Fat32);
    }
}
