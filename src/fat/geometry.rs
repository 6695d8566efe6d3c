//! Geometry & Layout: validating a parsed BPB and deriving the sector
//! ranges (reserved region, FAT region, root directory region, data region)
//! that the rest of the crate addresses by cluster number.

use crate::fat::boot_sector::{BootSector, FatExtension};
use crate::fat::error::FormatError;
use crate::fat::types::FatType;

/// The fully validated, derived layout of a mounted volume. Everything here
/// is computed once at mount time from the boot sector and never changes
/// for the lifetime of the mount (resizing a volume is out of scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub fat_type: FatType,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub num_fats: u8,
    pub sectors_per_fat: u32,
    /// First sector of the first FAT.
    pub fat_start_sector: u32,
    /// First sector of the (fixed-size) root directory. Zero for FAT32,
    /// where the root directory is just another cluster chain.
    pub root_dir_start_sector: u32,
    /// Number of sectors occupied by the fixed-size root directory.
    /// Zero for FAT32.
    pub root_dir_sector_count: u32,
    /// First sector of cluster #2, the start of the data region.
    pub first_data_sector: u32,
    pub cluster_count: u32,
    /// Only meaningful for FAT32.
    pub root_cluster: u32,
    pub fs_info_sector: u16,
}

impl Geometry {
    /// Validates and derives a `Geometry` from a parsed boot sector. Mirrors
    /// the checks a conservative FAT driver performs before trusting a
    /// volume: sector size must be one of the four values the format
    /// permits, cluster size and FAT/root-dir extents must leave room for a
    /// non-empty data region, and the cluster-count-derived `FatType` must
    /// agree with which BPB layout was actually present on disk.
    pub fn from_boot_sector(bs: &BootSector) -> Result<Self, FormatError> {
        let bpb = &bs.bpb;

        if !matches!(bpb.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FormatError::CorruptedVolume);
        }
        if bpb.sectors_per_cluster == 0 || !bpb.sectors_per_cluster.is_power_of_two() {
            return Err(FormatError::CorruptedVolume);
        }
        if bpb.num_fats == 0 {
            return Err(FormatError::CorruptedVolume);
        }
        if bpb.reserved_sector_count == 0 {
            return Err(FormatError::CorruptedVolume);
        }

        let (sectors_per_fat, root_cluster, fs_info_sector) = match &bs.extension {
            FatExtension::Fat12Or16(_) => (bpb.sectors_per_fat_16 as u32, 0, 0),
            FatExtension::Fat32 { ext, .. } => (ext.sectors_per_fat_32, ext.root_cluster, ext.fs_info_sector),
        };
        if sectors_per_fat == 0 {
            return Err(FormatError::CorruptedVolume);
        }

        let fat_start_sector = bpb.reserved_sector_count as u32;
        let fat_region_sectors = sectors_per_fat * bpb.num_fats as u32;

        let root_dir_start_sector = fat_start_sector + fat_region_sectors;
        let root_dir_bytes = bpb.root_entry_count as u32 * 32;
        let root_dir_sector_count = (root_dir_bytes + bpb.bytes_per_sector as u32 - 1) / bpb.bytes_per_sector.max(1) as u32;

        let first_data_sector = root_dir_start_sector + root_dir_sector_count;

        let total_sectors = bpb.total_sectors();
        if total_sectors <= first_data_sector {
            return Err(FormatError::CorruptedVolume);
        }

        let data_sectors = total_sectors - first_data_sector;
        let cluster_count = data_sectors / bpb.sectors_per_cluster as u32;

        let fat_type = FatType::classify(cluster_count);

        // The on-disk layout tag (root_entry_count == 0 and
        // sectors_per_fat_16 == 0 means "this is the FAT32 layout") must
        // agree with the classification we just derived from cluster count,
        // or this isn't a volume we can trust.
        let layout_is_fat32 = matches!(bs.extension, FatExtension::Fat32 { .. });
        if layout_is_fat32 != matches!(fat_type, FatType::Fat32) {
            return Err(FormatError::CorruptedVolume);
        }

        Ok(Self {
            fat_type,
            bytes_per_sector: bpb.bytes_per_sector,
            sectors_per_cluster: bpb.sectors_per_cluster,
            reserved_sector_count: bpb.reserved_sector_count,
            num_fats: bpb.num_fats,
            sectors_per_fat,
            fat_start_sector,
            root_dir_start_sector: if layout_is_fat32 { 0 } else { root_dir_start_sector },
            root_dir_sector_count: if layout_is_fat32 { 0 } else { root_dir_sector_count },
            first_data_sector,
            cluster_count,
            root_cluster,
            fs_info_sector,
        })
    }

    /// Sector number of a given FAT's first sector (`which` is 0-indexed).
    pub fn fat_sector(&self, which: u8) -> u32 {
        self.fat_start_sector + which as u32 * self.sectors_per_fat
    }

    /// First sector of the data region that belongs to `cluster` (cluster
    /// numbers start at 2; clusters 0 and 1 are reserved).
    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.first_data_sector + (cluster - 2) * self.sectors_per_cluster as u32
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// Whether a raw cluster number refers to in-range data (2..=max).
    pub fn is_valid_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.cluster_count + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::boot_sector::{BiosParameterBlock, ExtendedBootSignature, Fat32Extension};

    fn fat32_boot_sector() -> BootSector {
        BootSector {
            oem_name: *b"SDFAT   ",
            bpb: BiosParameterBlock {
                bytes_per_sector: 512,
                sectors_per_cluster: 8,
                reserved_sector_count: 32,
                num_fats: 2,
                root_entry_count: 0,
                total_sectors_16: 0,
                media_descriptor: 0xF8,
                sectors_per_fat_16: 0,
                sectors_per_track: 63,
                num_heads: 255,
                hidden_sectors: 0,
                total_sectors_32: 1_000_000,
            },
            extension: FatExtension::Fat32 {
                ext: Fat32Extension {
                    sectors_per_fat_32: 974,
                    mirroring_flags: 0,
                    version: 0,
                    root_cluster: 2,
                    fs_info_sector: 1,
                    backup_boot_sector: 6,
                },
                sig: ExtendedBootSignature {
                    physical_drive_number: 0x80,
                    volume_id: 0xDEAD_BEEF,
                    volume_label: *b"NO NAME    ",
                    file_system_type: *b"FAT32   ",
                },
            },
        }
    }

    #[test]
    fn derives_fat32_geometry() {
        let geo = Geometry::from_boot_sector(&fat32_boot_sector()).unwrap();
        assert_eq!(geo.fat_type, FatType::Fat32);
        assert_eq!(geo.fat_start_sector, 32);
        assert_eq!(geo.root_dir_start_sector, 0);
        assert_eq!(geo.first_data_sector, 32 + 974 * 2);
        assert_eq!(geo.cluster_to_sector(2), geo.first_data_sector);
        assert_eq!(geo.cluster_to_sector(3), geo.first_data_sector + 8);
    }

    #[test]
    fn rejects_bad_sector_size() {
        let mut bs = fat32_boot_sector();
        bs.bpb.bytes_per_sector = 300;
        assert_eq!(Geometry::from_boot_sector(&bs), Err(FormatError::CorruptedVolume));
    }

    #[test]
    fn rejects_layout_mismatch() {
        // A FAT32-looking layout (sectors_per_fat_16 == 0) whose derived
        // cluster count is too small to actually be FAT32.
        let mut bs = fat32_boot_sector();
        bs.bpb.total_sectors_32 = 40_000; // too small for fat32 with this cluster size
        if let FatExtension::Fat32 { ext, .. } = &mut bs.extension {
            ext.sectors_per_fat_32 = 1;
        }
        assert_eq!(Geometry::from_boot_sector(&bs), Err(FormatError::CorruptedVolume));
    }

    #[test]
    fn valid_data_cluster_bounds() {
        let geo = Geometry::from_boot_sector(&fat32_boot_sector()).unwrap();
        assert!(!geo.is_valid_data_cluster(0));
        assert!(!geo.is_valid_data_cluster(1));
        assert!(geo.is_valid_data_cluster(2));
        assert!(!geo.is_valid_data_cluster(geo.cluster_count + 2));
    }
}
