use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use lodesync_storage::retry::FETCH_BACKOFF;
use lodesync_storage::{BlobBackend, WriteOutcome};
use lodesync_types::{BlockHash, ChunkHash, HashIdentifier, LodeError, Result};

use crate::block::{self, StoredBlock};
use crate::compress::CompressionRegistry;
use crate::config::StoreConfig;
use crate::store_index::{BlockIndexEntry, StoreIndex};

/// Key of the consolidated store index, relative to the store prefix.
pub const STORE_INDEX_KEY: &str = "store.lsi";
/// Key prefix of block objects, relative to the store prefix.
pub const CHUNKS_PREFIX: &str = "chunks/";

/// Bound on the read-merge-write loop when racing other writers.
const MAX_CAS_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Fail if the store index is missing; mutation is refused.
    ReadOnly,
    /// Rebuild a missing store index from block objects.
    ReadWrite,
    /// Create an empty store index if none exists.
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The block was uploaded and queued for the next index flush.
    Stored,
    /// The block is already known; no I/O was performed.
    AlreadyPresent,
}

/// Blocks uploaded since the last flush, plus reservations for uploads that
/// are still in flight. `hashes` makes the already-present check
/// linearizable with respect to insertion.
#[derive(Default)]
struct PendingBlocks {
    entries: Vec<BlockIndexEntry>,
    hashes: HashSet<BlockHash>,
    hash_identifier: Option<HashIdentifier>,
}

/// Content-addressed block store over a blob backend.
///
/// Owns the in-memory view of the consolidated store index. Mutations
/// accumulate in a pending set and reach the remote index on [`flush`],
/// which reconciles against concurrent writers: with version preconditions
/// when the backend supports them, last-writer-wins otherwise (safe because
/// blocks are immutable and a lost index update only delays visibility;
/// the blocks themselves stay in object storage for the next flush or
/// recovery scan to pick up).
///
/// All public methods are synchronous; batch operations fan out across an
/// internal worker pool and return once every job finished or the first
/// error was observed.
///
/// [`flush`]: RemoteBlockStore::flush
pub struct RemoteBlockStore {
    backend: Arc<dyn BlobBackend>,
    prefix: String,
    mode: AccessMode,
    config: StoreConfig,
    registry: CompressionRegistry,
    index: RwLock<StoreIndex>,
    pending: Mutex<PendingBlocks>,
}

impl std::fmt::Debug for RemoteBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBlockStore")
            .field("prefix", &self.prefix)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl RemoteBlockStore {
    /// Open a store under `prefix` on the given backend.
    ///
    /// - `Init` writes an empty store index if none exists.
    /// - `ReadOnly` fails with `StoreUninitialized` if the index is missing.
    /// - `ReadWrite` rebuilds a missing index by scanning block objects
    ///   (orphans from interrupted flushes are preserved and re-indexed).
    ///
    /// A present-but-malformed index is `IndexCorrupt` in every mode.
    pub fn open(
        backend: Box<dyn BlobBackend>,
        prefix: &str,
        config: StoreConfig,
        mode: AccessMode,
    ) -> Result<Self> {
        config.validate()?;
        let store = RemoteBlockStore {
            backend: Arc::from(backend),
            prefix: prefix.trim_matches('/').to_string(),
            mode,
            config,
            registry: CompressionRegistry::full(),
            index: RwLock::new(StoreIndex::empty()),
            pending: Mutex::new(PendingBlocks::default()),
        };

        let index_key = store.key(STORE_INDEX_KEY);
        let loaded = match store.with_retry("readStoreIndex", &index_key, || {
            store.backend.read(&index_key)
        })? {
            Some(bytes) => StoreIndex::parse(&bytes)?,
            None => match mode {
                AccessMode::Init => {
                    let empty = StoreIndex::empty();
                    store.backend.write(&index_key, &empty.serialize())?;
                    debug!("initialized empty store index at {index_key}");
                    empty
                }
                AccessMode::ReadOnly => return Err(LodeError::StoreUninitialized),
                AccessMode::ReadWrite => store.recover_store_index()?,
            },
        };
        *store.index.write().unwrap() = loaded;
        Ok(store)
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of blocks in the in-memory view of the store index.
    pub fn indexed_block_count(&self) -> usize {
        self.index.read().unwrap().block_count()
    }

    /// Upload a block unless it is already known.
    ///
    /// Returns `AlreadyPresent` without I/O when the block is in the index
    /// or pending set. A successful upload is recorded in the pending set
    /// and becomes visible to other writers at the next [`flush`].
    ///
    /// [`flush`]: RemoteBlockStore::flush
    pub fn put_block(&self, stored_block: &StoredBlock) -> Result<PutOutcome> {
        self.ensure_writable("put_block")?;
        let block_hash = stored_block.block_hash;

        {
            let index = self.index.read().unwrap();
            if index.contains_block(block_hash) {
                return Ok(PutOutcome::AlreadyPresent);
            }
            if !index.is_empty() && index.hash_identifier() != stored_block.hash_identifier {
                return Err(LodeError::InvalidFormat(format!(
                    "block {} uses hash identifier {} but the store was written with {}",
                    block_hash,
                    stored_block.hash_identifier,
                    index.hash_identifier()
                )));
            }
        }

        // Reserve the hash so concurrent callers see the block as present
        // while the upload is in flight.
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.hashes.contains(&block_hash) {
                return Ok(PutOutcome::AlreadyPresent);
            }
            match pending.hash_identifier {
                Some(id) if id != stored_block.hash_identifier => {
                    return Err(LodeError::InvalidFormat(format!(
                        "block {} uses hash identifier {} but pending blocks use {}",
                        block_hash, stored_block.hash_identifier, id
                    )));
                }
                _ => pending.hash_identifier = Some(stored_block.hash_identifier),
            }
            pending.hashes.insert(block_hash);
        }

        let result = (|| {
            let encoded = block::encode(stored_block, self.config.compression)?;
            let key = self.key(&block::block_path(block_hash));
            self.with_retry("putBlock", &key, || self.backend.write(&key, &encoded))
        })();

        match result {
            Ok(()) => {
                let mut pending = self.pending.lock().unwrap();
                // Re-assert the identifier: a concurrent flush may have
                // drained the pending set while this upload was in flight.
                pending.hash_identifier.get_or_insert(stored_block.hash_identifier);
                pending.entries.push(stored_block.index_entry());
                debug!("stored block {block_hash}");
                Ok(PutOutcome::Stored)
            }
            Err(e) => {
                self.pending.lock().unwrap().hashes.remove(&block_hash);
                Err(e)
            }
        }
    }

    /// Upload many blocks across the worker pool.
    pub fn put_blocks(&self, blocks: &[StoredBlock]) -> Result<Vec<PutOutcome>> {
        self.ensure_writable("put_blocks")?;
        self.fan_out(blocks.iter().collect(), |b| self.put_block(b))
    }

    /// Fetch and decode one block.
    pub fn get_block(&self, block_hash: BlockHash) -> Result<StoredBlock> {
        let key = self.key(&block::block_path(block_hash));
        let bytes = self
            .with_retry("getBlock", &key, || self.backend.read(&key))?
            .ok_or(LodeError::BlockMissing(block_hash))?;
        let decoded = block::decode(&bytes, &self.registry)?;
        if decoded.block_hash != block_hash {
            // The object decodes cleanly but lives under the wrong address.
            return Err(LodeError::BadBlock(block_hash));
        }
        Ok(decoded)
    }

    /// Fetch many blocks across the worker pool.
    pub fn get_blocks(&self, block_hashes: &[BlockHash]) -> Result<Vec<StoredBlock>> {
        self.fan_out(block_hashes.to_vec(), |h| self.get_block(h))
    }

    /// Select the known blocks worth fetching for the requested chunks,
    /// including blocks uploaded but not yet flushed.
    pub fn get_existing_content(
        &self,
        chunk_hashes: &[ChunkHash],
        min_block_usage_percent: u32,
    ) -> Result<StoreIndex> {
        if min_block_usage_percent > 100 {
            return Err(LodeError::Config(format!(
                "min_block_usage_percent must be within 0..=100, got {min_block_usage_percent}"
            )));
        }

        let index = self.index.read().unwrap();
        let pending = self.pending.lock().unwrap();
        if pending.entries.is_empty() {
            return Ok(index.project(chunk_hashes, min_block_usage_percent));
        }
        let pending_index = StoreIndex::from_entries(
            pending
                .hash_identifier
                .unwrap_or_else(|| index.hash_identifier()),
            pending.entries.clone(),
        );
        Ok(index
            .merge(&pending_index)?
            .project(chunk_hashes, min_block_usage_percent))
    }

    /// Publish pending blocks into the remote store index.
    ///
    /// Reconciles with concurrent writers in a bounded read-merge-write
    /// loop. On version-locking backends a race restarts the loop; without
    /// locking the merged index is written last-writer-wins. If the loop
    /// exhausts its retries the pending set is restored and
    /// `FlushContention` returned, so the caller can flush again.
    pub fn flush(&self) -> Result<()> {
        let mut index = self.index.write().unwrap();

        let (drained, drained_id) = {
            let mut pending = self.pending.lock().unwrap();
            if pending.entries.is_empty() {
                return Ok(());
            }
            let drained = std::mem::take(&mut pending.entries);
            for entry in &drained {
                pending.hashes.remove(&entry.block_hash);
            }
            let id = pending
                .hash_identifier
                .take()
                .unwrap_or_else(|| index.hash_identifier());
            (drained, id)
        };

        match self.reconcile_added(&mut index, &drained, drained_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Put the drained blocks back so a later flush retries them.
                let mut pending = self.pending.lock().unwrap();
                for entry in &drained {
                    pending.hashes.insert(entry.block_hash);
                }
                let newer = std::mem::take(&mut pending.entries);
                let mut restored = drained;
                restored.extend(newer);
                pending.entries = restored;
                pending.hash_identifier.get_or_insert(drained_id);
                Err(e)
            }
        }
    }

    /// Delete every block not in `keep_block_hashes` and publish the
    /// shrunken index. Returns the number of blocks removed.
    ///
    /// The only destructive operation: callers must quiesce concurrent
    /// writers first. Holds the index write lock for the duration, which
    /// serializes it against flush and resolve.
    pub fn prune_blocks(&self, keep_block_hashes: &[BlockHash]) -> Result<u32> {
        self.ensure_writable("prune_blocks")?;
        self.flush()?;

        let mut index = self.index.write().unwrap();
        let keep: HashSet<BlockHash> = keep_block_hashes.iter().copied().collect();
        let to_remove: Vec<BlockHash> = index
            .block_hashes()
            .iter()
            .copied()
            .filter(|h| !keep.contains(h))
            .collect();
        if to_remove.is_empty() {
            return Ok(0);
        }

        // Missing objects are fine: a block deleted by an earlier
        // interrupted prune is already gone.
        self.fan_out(to_remove.clone(), |h| {
            let key = self.key(&block::block_path(h));
            self.with_retry("deleteBlock", &key, || self.backend.delete(&key))
        })?;

        let removed: HashSet<BlockHash> = to_remove.iter().copied().collect();
        self.reconcile_removed(&mut index, &removed)?;
        debug!("pruned {} blocks", to_remove.len());
        Ok(to_remove.len() as u32)
    }

    fn ensure_writable(&self, operation: &str) -> Result<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(LodeError::PermissionDenied(format!(
                "{operation} on a store opened read-only"
            )));
        }
        Ok(())
    }

    fn key(&self, rel: &str) -> String {
        if self.prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{}", self.prefix, rel)
        }
    }

    /// Store-relative view of a full backend key.
    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.prefix.as_str())
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }

    /// Retry transient failures on the fixed fetch schedule.
    fn with_retry<R>(&self, op_name: &str, key: &str, f: impl Fn() -> Result<R>) -> Result<R> {
        let mut result = f();
        for delay in FETCH_BACKOFF {
            match &result {
                Err(e) if e.is_transient() => {
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    warn!("retrying {op_name} {key}");
                    result = f();
                }
                _ => break,
            }
        }
        result
    }

    /// Rebuild the store index from the block objects under `chunks/`.
    ///
    /// Objects outside the fan-out layout, objects whose header does not
    /// match their address, and undecodable objects are skipped. Orphan
    /// blocks from interrupted flushes are re-indexed.
    fn recover_store_index(&self) -> Result<StoreIndex> {
        warn!("store index missing; rebuilding from block objects");

        let listed = self.backend.list(&self.key(CHUNKS_PREFIX))?;
        let mut candidates: Vec<(BlockHash, String)> = Vec::new();
        for blob in listed {
            let rel = self.relative_key(&blob.key);
            let Some(block_hash) = block::block_hash_from_key(rel) else {
                debug!("ignoring non-block object {}", blob.key);
                continue;
            };
            if rel != block::block_path(block_hash) {
                warn!("ignoring block object outside the fan-out layout: {}", blob.key);
                continue;
            }
            candidates.push((block_hash, blob.key));
        }

        let headers = self.fan_out(candidates, |(block_hash, key)| {
            let Some(bytes) = self.with_retry("readBlock", &key, || self.backend.read(&key))?
            else {
                // Deleted between list and read.
                return Ok(None);
            };
            match block::decode_header(&bytes) {
                Ok(header) if header.block_hash == block_hash => Ok(Some(header)),
                Ok(header) => {
                    warn!(
                        "skipping block object {key}: header names {} instead of {block_hash}",
                        header.block_hash
                    );
                    Ok(None)
                }
                Err(e) => {
                    warn!("skipping undecodable block object {key}: {e}");
                    Ok(None)
                }
            }
        })?;

        let mut hash_identifier = HashIdentifier(0);
        let mut entries = Vec::new();
        for header in headers.into_iter().flatten() {
            if entries.is_empty() {
                hash_identifier = header.hash_identifier;
            } else if header.hash_identifier != hash_identifier {
                warn!(
                    "skipping block {} with foreign hash identifier {}",
                    header.block_hash, header.hash_identifier
                );
                continue;
            }
            entries.push(header.index_entry());
        }

        let index = StoreIndex::from_entries(hash_identifier, entries);
        self.backend
            .write(&self.key(STORE_INDEX_KEY), &index.serialize())?;
        debug!(
            "recovered store index with {} blocks / {} chunks",
            index.block_count(),
            index.chunk_count()
        );
        Ok(index)
    }

    /// Read-merge-write loop publishing `added` into the remote index.
    fn reconcile_added(
        &self,
        index: &mut StoreIndex,
        added: &[BlockIndexEntry],
        added_id: HashIdentifier,
    ) -> Result<()> {
        let added_index = StoreIndex::from_entries(added_id, added.to_vec());
        self.reconcile(index, |remote| remote.merge(&added_index))
    }

    /// Read-merge-write loop removing `removed` from the remote index.
    fn reconcile_removed(
        &self,
        index: &mut StoreIndex,
        removed: &HashSet<BlockHash>,
    ) -> Result<()> {
        self.reconcile(index, |remote| Ok(remote.subtract(removed)))
    }

    fn reconcile(
        &self,
        index: &mut StoreIndex,
        apply: impl Fn(&StoreIndex) -> Result<StoreIndex>,
    ) -> Result<()> {
        let index_key = self.key(STORE_INDEX_KEY);
        let locking = self.backend.supports_locking();

        for attempt in 1..=MAX_CAS_RETRIES {
            let token = if locking {
                Some(self.backend.lock_write_version(&index_key)?)
            } else {
                None
            };

            let remote = match self.with_retry("readStoreIndex", &index_key, || {
                self.backend.read(&index_key)
            })? {
                Some(bytes) => StoreIndex::parse(&bytes)?,
                None => StoreIndex::empty(),
            };
            let updated = apply(&remote)?;
            let serialized = updated.serialize();

            match token {
                Some(token) => {
                    match self
                        .backend
                        .write_if_unchanged(&index_key, &serialized, &token)?
                    {
                        WriteOutcome::Committed => {
                            *index = updated;
                            return Ok(());
                        }
                        WriteOutcome::Conflict => {
                            debug!(
                                "store index version race (attempt {attempt}/{MAX_CAS_RETRIES})"
                            );
                            continue;
                        }
                    }
                }
                None => {
                    self.with_retry("writeStoreIndex", &index_key, || {
                        self.backend.write(&index_key, &serialized)
                    })?;
                    *index = updated;
                    return Ok(());
                }
            }
        }
        Err(LodeError::FlushContention(MAX_CAS_RETRIES))
    }

    /// Run `op` over `items` on the worker pool. Item order is preserved in
    /// the result; the first error wins and cancels unstarted work.
    fn fan_out<T, R>(
        &self,
        items: Vec<T>,
        op: impl Fn(T) -> Result<R> + Sync,
    ) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.config.workers.min(items.len());
        if workers <= 1 {
            return items.into_iter().map(op).collect();
        }

        let total = items.len();
        let stop = AtomicBool::new(false);
        let stop_ref = &stop;
        let op_ref = &op;

        std::thread::scope(|s| {
            let (work_tx, work_rx) = crossbeam_channel::bounded::<(usize, T)>(workers * 2);
            let (result_tx, result_rx) =
                crossbeam_channel::bounded::<(usize, Result<R>)>(workers * 2);

            s.spawn(move || {
                for item in items.into_iter().enumerate() {
                    if stop_ref.load(Ordering::Relaxed) {
                        break;
                    }
                    if work_tx.send(item).is_err() {
                        break;
                    }
                }
            });

            for _ in 0..workers {
                let rx = work_rx.clone();
                let tx = result_tx.clone();
                s.spawn(move || {
                    for (idx, item) in rx {
                        if stop_ref.load(Ordering::Relaxed) {
                            return;
                        }
                        let result = op_ref(item);
                        if result.is_err() {
                            stop_ref.store(true, Ordering::Relaxed);
                        }
                        if tx.send((idx, result)).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(result_tx);

            let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
            let mut first_err: Option<LodeError> = None;
            for (idx, result) in result_rx {
                match result {
                    Ok(value) => slots[idx] = Some(value),
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }

            let mut out = Vec::with_capacity(total);
            for slot in slots {
                out.push(slot.ok_or_else(|| {
                    LodeError::Other("worker exited before completing its batch".into())
                })?);
            }
            Ok(out)
        })
    }
}

impl Drop for RemoteBlockStore {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap();
        if !pending.entries.is_empty() {
            warn!(
                "dropping store with {} unflushed blocks; they stay uploaded but unindexed \
                 until the next flush or recovery scan",
                pending.entries.len()
            );
        }
    }
}

/// Create (or re-open) a store in `Init` mode and make sure its index
/// object exists.
pub fn init_remote_store(
    backend: Box<dyn BlobBackend>,
    prefix: &str,
    config: StoreConfig,
) -> Result<RemoteBlockStore> {
    let store = RemoteBlockStore::open(backend, prefix, config, AccessMode::Init)?;
    store.flush()?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{block_from_seed, shared_memory_backend};

    #[test]
    fn key_joins_prefix() {
        let (backend, _) = shared_memory_backend();
        let store = RemoteBlockStore::open(
            backend,
            "the_path",
            StoreConfig::default(),
            AccessMode::Init,
        )
        .unwrap();
        assert_eq!(store.key(STORE_INDEX_KEY), "the_path/store.lsi");
    }

    #[test]
    fn key_without_prefix() {
        let (backend, _) = shared_memory_backend();
        let store =
            RemoteBlockStore::open(backend, "", StoreConfig::default(), AccessMode::Init).unwrap();
        assert_eq!(store.key(STORE_INDEX_KEY), "store.lsi");
    }

    #[test]
    fn relative_key_strips_prefix() {
        let (backend, _) = shared_memory_backend();
        let store = RemoteBlockStore::open(
            backend,
            "the_path",
            StoreConfig::default(),
            AccessMode::Init,
        )
        .unwrap();
        assert_eq!(
            store.relative_key("the_path/chunks/dead/x.lsb"),
            "chunks/dead/x.lsb"
        );
    }

    #[test]
    fn read_only_refuses_mutation() {
        let (backend, shared) = shared_memory_backend();
        // Initialize first so a read-only open succeeds.
        init_remote_store(backend, "", StoreConfig::default()).unwrap();

        let store = RemoteBlockStore::open(
            Box::new(shared),
            "",
            StoreConfig::default(),
            AccessMode::ReadOnly,
        )
        .unwrap();
        let block = block_from_seed(0);
        let err = store.put_block(&block).unwrap_err();
        assert!(matches!(err, LodeError::PermissionDenied(_)));
        let err = store.prune_blocks(&[]).unwrap_err();
        assert!(matches!(err, LodeError::PermissionDenied(_)));
    }

    #[test]
    fn read_only_requires_initialized_store() {
        let (backend, _) = shared_memory_backend();
        let err = RemoteBlockStore::open(
            backend,
            "",
            StoreConfig::default(),
            AccessMode::ReadOnly,
        )
        .unwrap_err();
        assert!(matches!(err, LodeError::StoreUninitialized));
    }

    #[test]
    fn put_block_is_idempotent() {
        let (backend, shared) = shared_memory_backend();
        let store = RemoteBlockStore::open(
            backend,
            "",
            StoreConfig::default(),
            AccessMode::Init,
        )
        .unwrap();

        let block = block_from_seed(0);
        assert_eq!(store.put_block(&block).unwrap(), PutOutcome::Stored);
        assert_eq!(store.put_block(&block).unwrap(), PutOutcome::AlreadyPresent);
        store.flush().unwrap();
        // Still present after the index absorbed it.
        assert_eq!(store.put_block(&block).unwrap(), PutOutcome::AlreadyPresent);

        // Exactly one block object and one index object exist.
        let objects = shared.list("").unwrap();
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn flush_with_nothing_pending_is_a_no_op() {
        let (backend, shared) = shared_memory_backend();
        let store =
            RemoteBlockStore::open(backend, "", StoreConfig::default(), AccessMode::Init).unwrap();
        let before = shared.read("store.lsi").unwrap();
        store.flush().unwrap();
        assert_eq!(shared.read("store.lsi").unwrap(), before);
    }

    #[test]
    fn mismatched_hash_identifier_rejected() {
        let (backend, _) = shared_memory_backend();
        let store =
            RemoteBlockStore::open(backend, "", StoreConfig::default(), AccessMode::Init).unwrap();

        let block = block_from_seed(0);
        store.put_block(&block).unwrap();

        let foreign =
            StoredBlock::build(HashIdentifier(0xfeed), 0, block_from_seed(10).chunks).unwrap();
        let err = store.put_block(&foreign).unwrap_err();
        assert!(matches!(err, LodeError::InvalidFormat(_)));
    }

    #[test]
    fn fan_out_preserves_order() {
        let (backend, _) = shared_memory_backend();
        let store =
            RemoteBlockStore::open(backend, "", StoreConfig::default(), AccessMode::Init).unwrap();
        let items: Vec<u64> = (0..100).collect();
        let doubled = store.fan_out(items, |n| Ok(n * 2)).unwrap();
        assert_eq!(doubled, (0..100).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn fan_out_surfaces_the_first_error() {
        let (backend, _) = shared_memory_backend();
        let store =
            RemoteBlockStore::open(backend, "", StoreConfig::default(), AccessMode::Init).unwrap();
        let items: Vec<u64> = (0..100).collect();
        let result = store.fan_out(items, |n| {
            if n == 17 {
                Err(LodeError::Other("boom".into()))
            } else {
                Ok(n)
            }
        });
        assert!(result.is_err());
    }
}
