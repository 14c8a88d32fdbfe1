//! Disk-space arbitration shared by the caches living on one mount point.
//!
//! All allocators pointing at the same partition share one record in a
//! process-wide registry. Eviction is LRU by item timestamp and runs either
//! against a single allocator's items (own size limit exceeded) or across the
//! whole partition (mount point out of space).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const MAX_OUTDATED_ITEMS: usize = 128;
const MAX_PARTITION_LIMIT: u32 = 100;

/// Removes the on-disk data behind an evicted item.
#[async_trait]
pub trait ItemRemover: Send + Sync {
    async fn remove_item(&self, id: &str) -> Result<()>;
}

/// Platform filesystem queries; injectable for tests.
pub trait FsPlatform: Send + Sync {
    fn mount_point(&self, path: &Path) -> Result<PathBuf>;
    fn total_size(&self, mount_point: &Path) -> Result<u64>;
    fn available_size(&self, mount_point: &Path) -> Result<u64>;
    fn dir_size(&self, path: &Path) -> Result<u64>;
}

/// Host implementation backed by statvfs.
pub struct HostFs;

impl FsPlatform for HostFs {
    fn mount_point(&self, path: &Path) -> Result<PathBuf> {
        // Walk up until the device id changes; the last path on the same
        // device is the mount point.
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(path)?;
        let device = metadata.dev();
        let mut current = path.canonicalize()?;

        while let Some(parent) = current.parent() {
            let parent_metadata = std::fs::metadata(parent)?;
            if parent_metadata.dev() != device {
                break;
            }

            current = parent.to_path_buf();
        }

        Ok(current)
    }

    fn total_size(&self, mount_point: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(mount_point)
            .map_err(|err| Error::runtime(format!("statvfs {}: {err}", mount_point.display())))?;

        Ok(stat.blocks() * stat.fragment_size())
    }

    fn available_size(&self, mount_point: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(mount_point)
            .map_err(|err| Error::runtime(format!("statvfs {}: {err}", mount_point.display())))?;

        Ok(stat.blocks_available() * stat.fragment_size())
    }

    fn dir_size(&self, path: &Path) -> Result<u64> {
        crate::tools::fs::dir_size(path)
    }
}

type AllocatorId = u64;

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

static PARTITIONS: Lazy<parking_lot::Mutex<HashMap<PathBuf, Arc<PartitionShared>>>> =
    Lazy::new(|| parking_lot::Mutex::new(HashMap::new()));

struct OutdatedItem {
    id: String,
    size: u64,
    timestamp: DateTime<Utc>,
    owner: AllocatorId,
    remover: Arc<dyn ItemRemover>,
}

#[derive(Default)]
struct AllocatorCounters {
    allocation_count: usize,
    allocated_size: u64,
}

struct AllocatorShared {
    id: AllocatorId,
    size_limit: u64,
    counters: parking_lot::Mutex<AllocatorCounters>,
}

impl AllocatorShared {
    fn free(&self, size: u64) {
        let mut counters = self.counters.lock();

        if counters.allocation_count > 0 {
            counters.allocated_size = counters.allocated_size.saturating_sub(size);
        }
    }
}

#[derive(Default)]
struct PartitionState {
    limit: u32,
    allocator_count: usize,
    allocation_count: usize,
    available_size: u64,
    outdated: Vec<OutdatedItem>,
    allocators: HashMap<AllocatorId, Weak<AllocatorShared>>,
}

struct PartitionShared {
    mount_point: PathBuf,
    total_size: u64,
    state: Mutex<PartitionState>,
}

impl PartitionState {
    fn free(&mut self, size: u64) {
        if self.allocation_count > 0 {
            self.available_size = self.available_size.saturating_add(size);
        }
    }

    fn sort_outdated(&mut self) {
        self.outdated.sort_by_key(|item| item.timestamp);
    }

    fn free_owner(&self, owner: AllocatorId, size: u64) {
        if let Some(allocator) = self.allocators.get(&owner).and_then(Weak::upgrade) {
            allocator.free(size);
        }
    }
}

/// A pending allocation returned by [`SpaceAllocator::allocate`].
///
/// Call [`Space::accept`] once the data is in place or [`Space::release`] to
/// roll the reservation back.
pub struct Space {
    size: u64,
    allocator: Arc<AllocatorShared>,
    partition: Arc<PartitionShared>,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space").field("size", &self.size).finish()
    }
}

impl Space {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Keeps the allocation and closes the accounting burst.
    pub async fn accept(self) -> Result<()> {
        allocate_done(&self.allocator, &self.partition).await
    }

    /// Returns the reserved size to the pools and closes the burst.
    pub async fn release(self) -> Result<()> {
        self.allocator.free(self.size);

        {
            let mut state = self.partition.state.lock().await;
            state.free(self.size);
        }

        allocate_done(&self.allocator, &self.partition).await
    }
}

async fn allocate_done(allocator: &Arc<AllocatorShared>, partition: &Arc<PartitionShared>) -> Result<()> {
    if allocator.size_limit > 0 {
        let mut counters = allocator.counters.lock();

        if counters.allocation_count == 0 {
            return Err(Error::not_found("no allocation in progress"));
        }

        counters.allocation_count -= 1;
    }

    let mut state = partition.state.lock().await;

    if state.allocation_count == 0 {
        return Err(Error::not_found("no allocation in progress"));
    }

    state.allocation_count -= 1;

    Ok(())
}

/// Space allocator bound to one directory on one partition.
pub struct SpaceAllocator {
    path: PathBuf,
    fs: Arc<dyn FsPlatform>,
    remover: Option<Arc<dyn ItemRemover>>,
    limit_percent: u32,
    shared: Arc<AllocatorShared>,
    partition: Arc<PartitionShared>,
}

impl SpaceAllocator {
    /// Creates an allocator for `path`, registering with (or creating) the
    /// partition record of the underlying mount point. `limit_percent` caps
    /// this allocator's share of the partition; 0 disables the own limit.
    pub async fn new(
        path: impl Into<PathBuf>,
        fs: Arc<dyn FsPlatform>,
        limit_percent: u32,
        remover: Option<Arc<dyn ItemRemover>>,
    ) -> Result<Self> {
        let path = path.into();

        std::fs::create_dir_all(&path)?;

        let mount_point = fs.mount_point(&path)?;

        let partition = {
            let mut partitions = PARTITIONS.lock();

            if let Some(existing) = partitions.get(&mount_point) {
                Arc::clone(existing)
            } else {
                let total_size = fs.total_size(&mount_point)?;
                let partition = Arc::new(PartitionShared {
                    mount_point: mount_point.clone(),
                    total_size,
                    state: Mutex::new(PartitionState::default()),
                });

                partitions.insert(mount_point.clone(), Arc::clone(&partition));

                partition
            }
        };

        let id = NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed);

        let size_limit = {
            let mut state = partition.state.lock().await;

            if limit_percent > 0 {
                if state.limit + limit_percent > MAX_PARTITION_LIMIT {
                    return Err(Error::no_memory(format!(
                        "partition {} limit exceeded",
                        partition.mount_point.display()
                    )));
                }

                state.limit += limit_percent;
            }

            state.allocator_count += 1;

            if limit_percent > 0 {
                partition.total_size * u64::from(limit_percent) / 100
            } else {
                0
            }
        };

        let shared = Arc::new(AllocatorShared {
            id,
            size_limit,
            counters: parking_lot::Mutex::new(AllocatorCounters::default()),
        });

        {
            let mut state = partition.state.lock().await;
            state.allocators.insert(id, Arc::downgrade(&shared));
        }

        tracing::debug!(
            path = %path.display(),
            mount_point = %partition.mount_point.display(),
            size_limit,
            "space allocator created"
        );

        Ok(Self { path, fs, remover, limit_percent, shared, partition })
    }

    /// Reserves `size` bytes, evicting outdated items if needed. The returned
    /// [`Space`] must be accepted or released by the caller.
    pub async fn allocate(&self, size: u64) -> Result<Space> {
        let mut state = self.partition.state.lock().await;

        self.allocate_own(&mut state, size).await?;

        if let Err(err) = self.allocate_partition(&mut state, size).await {
            // Unwind the allocator-level reservation.
            self.shared.free(size);
            if self.shared.size_limit > 0 {
                let mut counters = self.shared.counters.lock();
                counters.allocation_count = counters.allocation_count.saturating_sub(1);
            }

            return Err(err);
        }

        Ok(Space {
            size,
            allocator: Arc::clone(&self.shared),
            partition: Arc::clone(&self.partition),
        })
    }

    /// Returns `size` bytes to the bookkeeping without closing a burst.
    pub async fn free(&self, size: u64) {
        self.shared.free(size);

        let mut state = self.partition.state.lock().await;
        state.free(size);
    }

    /// Registers a cached item as a candidate for eviction.
    pub async fn add_outdated_item(&self, id: &str, size: u64, timestamp: DateTime<Utc>) -> Result<()> {
        let remover = self
            .remover
            .as_ref()
            .ok_or_else(|| Error::not_found("no item remover configured"))?;

        if size > self.partition.total_size {
            return Err(Error::no_memory(format!("item {id} larger than partition")));
        }

        let mut state = self.partition.state.lock().await;

        if let Some(existing) = state.outdated.iter_mut().find(|item| item.id == id) {
            existing.size = size;
            existing.timestamp = timestamp;
            existing.owner = self.shared.id;
            existing.remover = Arc::clone(remover);

            return Ok(());
        }

        if state.outdated.len() >= MAX_OUTDATED_ITEMS {
            state.sort_outdated();

            let mut freed = 0;

            while state.outdated.len() >= MAX_OUTDATED_ITEMS || freed < size {
                let Some(oldest) = state.outdated.first() else {
                    return Err(Error::no_memory(format!("can't make room for item {id}")));
                };

                oldest.remover.remove_item(&oldest.id).await?;

                let oldest = state.outdated.remove(0);
                state.free_owner(oldest.owner, oldest.size);
                state.available_size = state.available_size.saturating_add(oldest.size);
                freed += oldest.size;
            }
        }

        state.outdated.push(OutdatedItem {
            id: id.to_string(),
            size,
            timestamp,
            owner: self.shared.id,
            remover: Arc::clone(remover),
        });

        Ok(())
    }

    /// Takes an item out of the eviction set because it is in use again.
    pub async fn restore_outdated_item(&self, id: &str) -> Result<()> {
        let mut state = self.partition.state.lock().await;
        state.outdated.retain(|item| item.id != id);

        Ok(())
    }

    /// Releases this allocator's stake in the partition; the partition record
    /// is dropped from the registry when the last allocator closes.
    pub async fn close(&self) -> Result<()> {
        let remove_partition = {
            let mut state = self.partition.state.lock().await;

            state.limit = state.limit.saturating_sub(self.limit_percent);

            state.allocators.remove(&self.shared.id);
            state.outdated.retain(|item| item.owner != self.shared.id);
            state.allocator_count = state.allocator_count.saturating_sub(1);

            state.allocator_count == 0
        };

        if remove_partition {
            PARTITIONS.lock().remove(&self.partition.mount_point);
        }

        Ok(())
    }

    async fn allocate_own(&self, state: &mut PartitionState, size: u64) -> Result<()> {
        if self.shared.size_limit == 0 {
            return Ok(());
        }

        let (first_in_burst, allocated) = {
            let counters = self.shared.counters.lock();
            (counters.allocation_count == 0, counters.allocated_size)
        };

        let mut allocated = if first_in_burst {
            // Re-read the real directory size at the start of a burst; the
            // running counter drifts across accept/release cycles.
            self.fs.dir_size(&self.path)?
        } else {
            allocated
        };

        if allocated + size > self.shared.size_limit {
            let needed = allocated + size - self.shared.size_limit;
            let freed = self.evict(state, needed, Some(self.shared.id)).await?;

            allocated = allocated.saturating_sub(freed);
        }

        let mut counters = self.shared.counters.lock();
        counters.allocated_size = allocated + size;
        counters.allocation_count += 1;

        Ok(())
    }

    async fn allocate_partition(&self, state: &mut PartitionState, size: u64) -> Result<()> {
        if state.allocation_count == 0 {
            state.available_size = self.fs.available_size(&self.partition.mount_point)?;
        }

        if size > state.available_size {
            let needed = size - state.available_size;
            let freed = self.evict(state, needed, None).await?;

            state.available_size = state.available_size.saturating_add(freed);
        }

        state.available_size -= size;
        state.allocation_count += 1;

        Ok(())
    }

    /// Evicts outdated items oldest-first until `needed` bytes are freed.
    /// With `owner` set only that allocator's items are considered; the
    /// candidate total is verified up front so nothing is removed when the
    /// request cannot be satisfied.
    async fn evict(&self, state: &mut PartitionState, needed: u64, owner: Option<AllocatorId>) -> Result<u64> {
        let candidate_total: u64 = state
            .outdated
            .iter()
            .filter(|item| owner.map_or(true, |id| item.owner == id))
            .map(|item| item.size)
            .sum();

        if needed > candidate_total {
            return Err(Error::no_memory(format!(
                "can't free {needed} bytes on {}",
                self.partition.mount_point.display()
            )));
        }

        state.sort_outdated();

        let mut freed = 0;
        let mut index = 0;

        while freed < needed && index < state.outdated.len() {
            if owner.is_some_and(|id| state.outdated[index].owner != id) {
                index += 1;
                continue;
            }

            let item = &state.outdated[index];

            item.remover.remove_item(&item.id).await?;

            tracing::info!(id = %item.id, size = item.size, "outdated item evicted");

            let item = state.outdated.remove(index);

            match owner {
                // Own-limit eviction frees partition-level accounting; the
                // caller reduces the allocator counter by the freed total.
                Some(_) => state.free(item.size),
                // Partition eviction frees the owning allocator's counter.
                None => state.free_owner(item.owner, item.size),
            }

            freed += item.size;
        }

        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct StubFs {
        mount_point: PathBuf,
        total: u64,
        available: AtomicU64,
        dir_size: AtomicU64,
    }

    impl FsPlatform for StubFs {
        fn mount_point(&self, _path: &Path) -> Result<PathBuf> {
            Ok(self.mount_point.clone())
        }

        fn total_size(&self, _mount_point: &Path) -> Result<u64> {
            Ok(self.total)
        }

        fn available_size(&self, _mount_point: &Path) -> Result<u64> {
            Ok(self.available.load(Ordering::SeqCst))
        }

        fn dir_size(&self, _path: &Path) -> Result<u64> {
            Ok(self.dir_size.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct RecordingRemover {
        removed: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ItemRemover for RecordingRemover {
        async fn remove_item(&self, id: &str) -> Result<()> {
            self.removed.lock().push(id.to_string());

            Ok(())
        }
    }

    const KIB: u64 = 1024;

    fn stub_fs(tag: &str, total: u64, available: u64, dir_size: u64) -> Arc<StubFs> {
        Arc::new(StubFs {
            mount_point: PathBuf::from(format!("/mnt/{tag}")),
            total,
            available: AtomicU64::new(available),
            dir_size: AtomicU64::new(dir_size),
        })
    }

    #[tokio::test]
    async fn eviction_on_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let fs = stub_fs("evict", 1024 * KIB, 10 * 1024 * KIB, 672 * KIB);
        let remover = Arc::new(RecordingRemover::default());

        let allocator = SpaceAllocator::new(dir.path(), fs, 50, Some(remover.clone() as Arc<dyn ItemRemover>))
            .await
            .unwrap();

        let base = Utc::now();
        allocator.add_outdated_item("a", 288 * KIB, base).await.unwrap();
        allocator
            .add_outdated_item("b", 288 * KIB, base + chrono::Duration::seconds(1))
            .await
            .unwrap();
        allocator
            .add_outdated_item("c", 96 * KIB, base + chrono::Duration::seconds(2))
            .await
            .unwrap();

        // 672 KiB on disk + 256 KiB > 512 KiB limit: the two oldest items
        // cover the excess and are removed oldest-first.
        let space = allocator.allocate(256 * KIB).await.unwrap();
        space.accept().await.unwrap();

        assert_eq!(*remover.removed.lock(), vec!["a".to_string(), "b".to_string()]);

        // A 1 MiB request can never fit in the remaining budget; nothing else
        // is evicted.
        let err = allocator.allocate(1024 * KIB).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoMemory);
        assert_eq!(remover.removed.lock().len(), 2);

        allocator.close().await.unwrap();
    }

    #[tokio::test]
    async fn partition_shared_between_allocators() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let fs = stub_fs("shared", 1024 * KIB, 1024 * KIB, 0);

        let first = SpaceAllocator::new(dir_a.path(), fs.clone(), 30, None).await.unwrap();
        let second = SpaceAllocator::new(dir_b.path(), fs, 30, None).await.unwrap();

        assert!(Arc::ptr_eq(&first.partition, &second.partition));

        {
            let state = first.partition.state.lock().await;
            assert_eq!(state.allocator_count, 2);
            assert_eq!(state.limit, 60);
        }

        first.close().await.unwrap();
        second.close().await.unwrap();

        assert!(!PARTITIONS.lock().contains_key(Path::new("/mnt/shared")));
    }

    #[tokio::test]
    async fn release_returns_reserved_size() {
        let dir = tempfile::tempdir().unwrap();
        let fs = stub_fs("release", 1024 * KIB, 512 * KIB, 0);

        let allocator = SpaceAllocator::new(dir.path(), fs, 50, None).await.unwrap();

        let space = allocator.allocate(128 * KIB).await.unwrap();
        space.release().await.unwrap();

        {
            let counters = allocator.shared.counters.lock();
            assert_eq!(counters.allocation_count, 0);
            assert_eq!(counters.allocated_size, 0);
        }

        allocator.close().await.unwrap();
    }

    #[tokio::test]
    async fn restore_removes_from_eviction_set() {
        let dir = tempfile::tempdir().unwrap();
        let fs = stub_fs("restore", 1024 * KIB, 1024 * KIB, 0);
        let remover = Arc::new(RecordingRemover::default());

        let allocator = SpaceAllocator::new(dir.path(), fs, 0, Some(remover as Arc<dyn ItemRemover>))
            .await
            .unwrap();

        allocator.add_outdated_item("layer", 10 * KIB, Utc::now()).await.unwrap();
        allocator.restore_outdated_item("layer").await.unwrap();

        let state = allocator.partition.state.lock().await;
        assert!(state.outdated.is_empty());
        drop(state);

        allocator.close().await.unwrap();
    }
}
