//! End-to-end exercise against a real `std::fs::File`-backed device: format,
//! mount, create a directory, write and read back a file, rename it, delete
//! it, and dismount.
//!
//! Requires the `no_std` feature to be disabled so that `FileBackedDevice`
//! exists. Run with `--no-default-features --features bindings,external_mutex`
//! (or just `--no-default-features` if the bindings aren't needed).

use sdfat::fat::format::{self, FormatOptions, RequestedFatType};
use sdfat::fat::cache::{LeastRecentlyAccessed, SectorCache};
use sdfat::fat::types::OpenMode;
use sdfat::fat::{MountOptions, Volume};
use sdfat::storage::FileBackedDevice;

use generic_array::GenericArray;
use typenum::consts::{U16, U512};

type Disk = FileBackedDevice<U512>;

/// Creates a zeroed scratch file of `sector_count` 512-byte sectors and
/// returns its path. Each test gets its own file (named after the test) so
/// they can run concurrently without clobbering one another.
fn scratch_disk(name: &str, sector_count: u64) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("sdfat-test-{}-{}.img", name, std::process::id()));

    let file = std::fs::File::create(&path).unwrap();
    file.set_len(sector_count * 512).unwrap();

    path
}

fn format_and_mount(path: &std::path::Path, fs_type: RequestedFatType) -> Volume<Disk, U16> {
    let mut device = Disk::open(path.to_str().unwrap()).unwrap();
    let mut format_cache: SectorCache<Disk, U16, LeastRecentlyAccessed> = SectorCache::new();
    format::format_volume(&mut device, &mut format_cache, FormatOptions { fs_type, ..Default::default() }).unwrap();

    Volume::mount(device, MountOptions::default()).unwrap()
}

#[test]
fn round_trips_a_file_through_a_fat16_volume() {
    let path = scratch_disk("fat16-roundtrip", 8192); // 4 MiB
    let mut volume = format_and_mount(&path, RequestedFatType::Fat16);

    volume.mkdir("/docs").unwrap();

    let contents = b"the quick brown fox jumps over the lazy dog";
    let mut file = volume.open("/docs/hello.txt", OpenMode::create()).unwrap();
    let written = volume.write(&mut file, contents).unwrap();
    assert_eq!(written, contents.len());
    volume.close(file).unwrap();

    let mut file = volume.open("/docs/hello.txt", OpenMode::read_only()).unwrap();
    let mut buf = [0u8; 64];
    let read = volume.read(&mut file, &mut buf).unwrap();
    assert_eq!(&buf[..read], contents);
    volume.close(file).unwrap();

    volume.dismount().unwrap();
    std::fs::remove_file(&path).ok();
}

#[test]
fn renames_and_deletes_across_a_dismount() {
    let path = scratch_disk("rename-delete", 8192);

    {
        let mut volume = format_and_mount(&path, RequestedFatType::Fat16);
        let mut file = volume.open("/a.txt", OpenMode::create()).unwrap();
        volume.write(&mut file, b"payload").unwrap();
        volume.close(file).unwrap();
        volume.rename("/a.txt", "/b.txt").unwrap();
        volume.dismount().unwrap();
    }

    let device = Disk::open(path.to_str().unwrap()).unwrap();
    let mut volume: Volume<Disk, U16> = Volume::mount(device, MountOptions::default()).unwrap();

    assert!(volume.open("/a.txt", OpenMode::read_only()).is_err());
    let mut file = volume.open("/b.txt", OpenMode::read_only()).unwrap();
    let mut buf = [0u8; 16];
    let read = volume.read(&mut file, &mut buf).unwrap();
    assert_eq!(&buf[..read], b"payload");
    volume.close(file).unwrap();

    volume.delete("/b.txt").unwrap();
    assert!(volume.open("/b.txt", OpenMode::read_only()).is_err());

    volume.dismount().unwrap();
    std::fs::remove_file(&path).ok();
}

#[test]
fn writes_a_file_spanning_many_clusters_on_fat32() {
    let path = scratch_disk("fat32-multicluster", 200_000); // ~100 MiB
    let mut volume = format_and_mount(&path, RequestedFatType::Fat32);

    let mut pattern = [0u8; 4096];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let mut file = volume.open("/big.bin", OpenMode::create()).unwrap();
    for _ in 0..16 {
        volume.write(&mut file, &pattern).unwrap();
    }
    volume.close(file).unwrap();

    let mut file = volume.open("/big.bin", OpenMode::read_only()).unwrap();
    assert_eq!(file.len(), pattern.len() as u32 * 16);

    let mut buf = GenericArray::<u8, U512>::default();
    let mut total = 0usize;
    loop {
        let read = volume.read(&mut file, &mut buf).unwrap();
        if read == 0 {
            break;
        }
        for (i, &b) in buf[..read].iter().enumerate() {
            assert_eq!(b, pattern[(total + i) % pattern.len()]);
        }
        total += read;
    }
    assert_eq!(total, pattern.len() * 16);
    volume.close(file).unwrap();

    volume.dismount().unwrap();
    std::fs::remove_file(&path).ok();
}
