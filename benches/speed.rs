//! A read-speed benchmark: formats a RAM disk, writes files of a few
//! representative sizes, and measures how fast each reads back byte-by-byte.

extern crate criterion;

use criterion::{
    criterion_group, criterion_main, AxisScale, BenchmarkId, Criterion, PlotConfiguration,
    Throughput,
};

use sdfat::fat::cache::{LeastRecentlyAccessed, SectorCache};
use sdfat::fat::format::{self, FormatOptions, RequestedFatType};
use sdfat::fat::types::OpenMode;
use sdfat::fat::{MountOptions, Volume};
use sdfat::storage::RamDisk;

use typenum::consts::{U16384, U512};

type Disk = RamDisk<U512>;

const FILES: &[(&str, usize)] = &[("/1k", 1024), ("/100k", 100 * 1024), ("/5M", 5 * 1024 * 1024)];

fn build_volume() -> Volume<Disk, U16384> {
    let mut disk = Disk::new(600_000); // ~300 MiB, comfortably past the FAT32 cluster-count threshold
    let mut format_cache: SectorCache<Disk, U16384, LeastRecentlyAccessed> = SectorCache::new();
    format::format_volume(&mut disk, &mut format_cache, FormatOptions { fs_type: RequestedFatType::Fat32, ..Default::default() })
        .unwrap();

    let mut volume = Volume::mount(disk, MountOptions::default()).unwrap();

    let mut pattern = [0u8; 4096];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }

    for &(path, size) in FILES {
        let mut file = volume.open(path, OpenMode::create()).unwrap();
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(pattern.len());
            volume.write(&mut file, &pattern[..n]).unwrap();
            remaining -= n;
        }
        volume.close(file).unwrap();
    }

    volume
}

fn bench_read_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("read speed");
    group.plot_config(PlotConfiguration::default().summary_scale(AxisScale::Logarithmic));

    let mut volume = build_volume();

    for &(path, size) in FILES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("file read speed", size), &size, |b, _| {
            b.iter(|| {
                let mut file = volume.open(path, OpenMode::read_only()).unwrap();
                let mut buf = [0u8; 512];
                let mut checksum: u64 = 0;
                loop {
                    let read = volume.read(&mut file, &mut buf).unwrap();
                    if read == 0 {
                        break;
                    }
                    for &byte in &buf[..read] {
                        checksum = checksum.wrapping_add(byte as u64);
                    }
                }
                volume.close(file).unwrap();
                criterion::black_box(checksum);
            })
        });
    }
}

criterion_group!(benches, bench_read_speed);
criterion_main!(benches);
