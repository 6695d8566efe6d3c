//! Home of `SectorCache`: every FAT-table and directory sector access in
//! this crate flows through one of these rather than talking to the
//! `BlockDevice` directly. Capacity is fixed at compile time via a
//! `typenum` length, the same way sector buffers are.

use core::marker::PhantomData;

use generic_array::{ArrayLength, GenericArray};

use crate::fat::error::{Error, FormatError};
use crate::storage::{BlockDevice, ReadError, WriteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Status {
    Free,
    Resident,
    Dirty,
}

/// Bookkeeping for one cache slot. `age` records insertion order (for
/// diagnostics); `last_accessed` is what eviction policies actually compare.
#[derive(Debug, Clone, Copy, Hash)]
pub struct CacheEntry {
    status: Status,
    sector: u64,
    age: u64,
    last_accessed: u64,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self { status: Status::Free, sector: 0, age: 0, last_accessed: 0 }
    }
}

impl CacheEntry {
    pub fn is_dirty(&self) -> bool {
        self.status == Status::Dirty
    }

    pub fn is_free(&self) -> bool {
        self.status == Status::Free
    }

    pub fn sector_idx(&self) -> Option<u64> {
        match self.status {
            Status::Free => None,
            _ => Some(self.sector),
        }
    }
}

/// Chooses which slot to reclaim when the cache is full and a new sector
/// needs to be brought in. Implementations see the whole entry table and
/// return an index into it; the cache writes that slot back first if it's
/// dirty.
pub trait EvictionPolicy {
    fn choose_victim(entries: &[CacheEntry]) -> usize;
}

/// Evicts whichever resident sector was least recently touched (by either a
/// read or a write), regardless of dirty state.
pub struct LeastRecentlyAccessed;

impl EvictionPolicy for LeastRecentlyAccessed {
    fn choose_victim(entries: &[CacheEntry]) -> usize {
        entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Prefers to evict a free or clean (non-dirty) slot over a dirty one, so
/// eviction never triggers a write-back unless every slot is dirty. Falls
/// back to `Inner` to break ties among dirty slots once that happens.
pub struct UnmodifiedFirst<Inner>(PhantomData<Inner>);

impl<Inner: EvictionPolicy> EvictionPolicy for UnmodifiedFirst<Inner> {
    fn choose_victim(entries: &[CacheEntry]) -> usize {
        let clean = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_dirty())
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(i, _)| i);

        clean.unwrap_or_else(|| Inner::choose_victim(entries))
    }
}

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

/// A fixed-capacity write-back cache of `N` sectors for a `BlockDevice` `D`,
/// evicting under policy `Ev`.
pub struct SectorCache<D: BlockDevice, N, Ev>
where
    N: ArrayLength<CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    entries: GenericArray<CacheEntry, N>,
    slots: GenericArray<GenericArray<u8, D::SectorSize>, N>,
    counter: u64,
    _ev: PhantomData<Ev>,
}

impl<D: BlockDevice, N, Ev> SectorCache<D, N, Ev>
where
    N: ArrayLength<CacheEntry> + ArrayLength<GenericArray<u8, D::SectorSize>>,
    Ev: EvictionPolicy,
{
    pub fn new() -> Self {
        Self {
            entries: GenericArray::default(),
            slots: GenericArray::default(),
            counter: 0,
            _ev: PhantomData,
        }
    }

    fn tick(&mut self) -> u64 {
        let t = self.counter;
        self.counter = self.counter.wrapping_add(1);
        if self.counter == 0 {
            log::warn!("sector cache access counter wrapped; LRU ordering may briefly misbehave");
        }
        t
    }

    /// Finds or loads the slot containing `sector`, returning its index.
    /// Evicts (writing back if dirty) when the cache is full and the sector
    /// isn't already resident.
    fn slot_for(&mut self, device: &mut D, sector: u64) -> Result<usize, Error<D::Error>> {
        if let Some(idx) = self.entries.iter().position(|e| e.sector_idx() == Some(sector)) {
            return Ok(idx);
        }

        let idx = Ev::choose_victim(&self.entries);
        if self.entries[idx].is_dirty() {
            device.write_sector(self.entries[idx].sector, &self.slots[idx]).map_err(write_err)?;
        }

        device.read_sector(sector, &mut self.slots[idx]).map_err(read_err)?;

        let last_accessed = self.tick();
        self.entries[idx] = CacheEntry { status: Status::Resident, sector, age: last_accessed, last_accessed };

        Ok(idx)
    }

    /// Read-only access to a sector's contents.
    pub fn read(&mut self, device: &mut D, sector: u64) -> Result<&GenericArray<u8, D::SectorSize>, Error<D::Error>> {
        let idx = self.slot_for(device, sector)?;
        self.entries[idx].last_accessed = self.tick();
        Ok(&self.slots[idx])
    }

    /// Mutable access to a sector's contents; marks the slot dirty — the
    /// caller is assumed to be about to write through the returned
    /// reference. The write only reaches the device on eviction or
    /// `flush`/`flush_sector`.
    pub fn write(&mut self, device: &mut D, sector: u64) -> Result<&mut GenericArray<u8, D::SectorSize>, Error<D::Error>> {
        let idx = self.slot_for(device, sector)?;
        self.entries[idx].status = Status::Dirty;
        self.entries[idx].last_accessed = self.tick();
        Ok(&mut self.slots[idx])
    }

    /// Writes back one resident dirty sector immediately, if present.
    pub fn flush_sector(&mut self, device: &mut D, sector: u64) -> Result<(), Error<D::Error>> {
        if let Some(idx) = self.entries.iter().position(|e| e.sector_idx() == Some(sector) && e.is_dirty()) {
            device.write_sector(sector, &self.slots[idx]).map_err(write_err)?;
            self.entries[idx].status = Status::Resident;
        }
        Ok(())
    }

    /// Writes back every dirty sector. Called on `dismount` and may also be
    /// called by callers wanting a durability checkpoint mid-session.
    pub fn flush(&mut self, device: &mut D) -> Result<(), Error<D::Error>> {
        for idx in 0..self.entries.len() {
            if self.entries[idx].is_dirty() {
                device.write_sector(self.entries[idx].sector, &self.slots[idx]).map_err(write_err)?;
                self.entries[idx].status = Status::Resident;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamDisk;
    use typenum::consts::{U4, U512};

    type TestCache = SectorCache<RamDisk<U512>, U4, LeastRecentlyAccessed>;

    #[test]
    fn reads_miss_then_hit_without_reloading() {
        let mut disk = RamDisk::<U512>::new(8);
        let mut cache = TestCache::new();

        cache.write(&mut disk, 0).unwrap()[0] = 0xAB;
        assert_eq!(cache.read(&mut disk, 0).unwrap()[0], 0xAB);
    }

    #[test]
    fn eviction_writes_back_dirty_slots() {
        let mut disk = RamDisk::<U512>::new(8);
        let mut cache: SectorCache<RamDisk<U512>, U4, LeastRecentlyAccessed> = SectorCache::new();

        for s in 0..4u64 {
            cache.write(&mut disk, s).unwrap()[0] = s as u8 + 1;
        }
        // Fifth distinct sector forces an eviction of sector 0 (LRU).
        cache.write(&mut disk, 4).unwrap()[0] = 99;

        let mut buf = GenericArray::<u8, U512>::default();
        disk.read_sector(0, &mut buf).unwrap();
        assert_eq!(buf[0], 1, "evicted dirty sector must have been written back");
    }

    #[test]
    fn unmodified_first_prefers_clean_victims() {
        let mut disk = RamDisk::<U512>::new(8);
        let mut cache: SectorCache<RamDisk<U512>, U4, UnmodifiedFirst<LeastRecentlyAccessed>> = SectorCache::new();

        cache.write(&mut disk, 0).unwrap();
        cache.read(&mut disk, 1).unwrap(); // resident, clean
        cache.write(&mut disk, 2).unwrap();
        cache.read(&mut disk, 3).unwrap(); // resident, clean

        // New sector should evict slot 1 or 3 (clean), not 0 or 2 (dirty).
        cache.write(&mut disk, 4).unwrap();

        let still_cached = |c: &SectorCache<RamDisk<U512>, U4, UnmodifiedFirst<LeastRecentlyAccessed>>, s: u64| {
            c.entries.iter().any(|e| e.sector_idx() == Some(s))
        };
        assert!(still_cached(&cache, 0));
        assert!(still_cached(&cache, 2));
    }
}
