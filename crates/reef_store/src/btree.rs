//! Storage seam between dispatch and the ordered key-value engine.
//!
//! This module provides the `BtreeSlice` abstraction, two engine
//! implementations (`MemBtree` in-memory and `FjallSlice` on-disk), the
//! transaction/superblock tokens callers thread through operations, and
//! `rget_slice`, which layers stream transforms and terminal reductions on
//! top of a raw ordered scan.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fjall::{Keyspace, PartitionCreateOptions};
use tokio_util::sync::CancellationToken;

use crate::context::RuntimeEnvironment;
use crate::protocol::{
    BackfillAtom, Groups, PointDeleteResult, PointWriteResult, RangeReadResponse, RangeResult,
    Stream, Terminal, Transform,
};
use crate::ql::{self, Backtrace, OrderedJson, RuntimeError, Value};
use crate::region::{hash_store_key, KeyBound, KeyRange, Region};

/// Monotonic replication timestamp stamped on every write and tombstone.
pub type RepliTimestamp = u64;

/// Branching factor assumed by depth-bounded distribution sampling.
const DISTRIBUTION_FANOUT_BITS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Access token for one batch of operations against a slice. Owned by the
/// caller; the slice only checks that write operations arrive under a
/// write transaction.
#[derive(Debug)]
pub struct Transaction {
    mode: AccessMode,
}

impl Transaction {
    pub fn begin_read() -> Self {
        Self {
            mode: AccessMode::Read,
        }
    }

    pub fn begin_write() -> Self {
        Self {
            mode: AccessMode::Write,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn check_write(&self) {
        debug_assert_eq!(self.mode, AccessMode::Write, "write under a read transaction");
    }
}

/// Guard granting access to the slice root. Parallel traversals share one
/// superblock through an `Arc`, each holder releasing its reference when
/// its traversal finishes.
#[derive(Debug)]
pub struct Superblock {
    _private: (),
}

impl Superblock {
    pub fn acquire() -> Self {
        Self { _private: () }
    }
}

/// Predicate deciding which keys an erase pass removes.
pub trait KeyTester: Send + Sync {
    fn key_should_be_erased(&self, key: &[u8]) -> bool;
}

/// Erases only keys inside a region on both axes.
pub struct RangeKeyTester<'a> {
    pub region: &'a Region,
}

impl KeyTester for RangeKeyTester<'_> {
    fn key_should_be_erased(&self, key: &[u8]) -> bool {
        let h = hash_store_key(key);
        self.region.hash_start <= h
            && h < self.region.hash_end
            && self.region.keys.contains_key(key)
    }
}

/// Erases everything it is shown.
pub struct AlwaysTrueKeyTester;

impl KeyTester for AlwaysTrueKeyTester {
    fn key_should_be_erased(&self, _key: &[u8]) -> bool {
        true
    }
}

/// Upcalls a backfill traversal makes as it walks a range.
pub trait BackfillCallback: Send + Sync {
    fn on_delete_range(&self, range: &KeyRange) -> anyhow::Result<()>;
    fn on_deletion(&self, key: &[u8], recency: RepliTimestamp) -> anyhow::Result<()>;
    fn on_keyvalue(&self, atom: BackfillAtom) -> anyhow::Result<()>;
}

/// Progress of one traversal, shared with whoever reports completion.
#[derive(Debug, Default)]
pub struct TraversalProgress {
    done: AtomicU64,
    total: AtomicU64,
}

impl TraversalProgress {
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn tick(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed and total item counts, or `None` until the total is known.
    pub fn progress(&self) -> Option<(u64, u64)> {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        Some((self.done.load(Ordering::Relaxed).min(total), total))
    }
}

/// One raw page of an ordered scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanPage {
    pub pairs: Stream,
    pub truncated: bool,
    /// Highest key the scan observed, or the range's left bound for an
    /// empty page.
    pub last_considered_key: Vec<u8>,
}

/// Ordered key-value engine API consumed by the dispatch layer. One slice
/// is pinned to one worker thread; operations must run on that thread.
pub trait BtreeSlice: Send + Sync + 'static {
    /// Read the stored value for `key`.
    fn btree_get(
        &self,
        key: &[u8],
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<Option<Value>>;

    /// Ordered scan of `range`, at most `soft_cap` rows.
    fn btree_scan(
        &self,
        range: &KeyRange,
        soft_cap: usize,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<ScanPage>;

    /// Store `value` at `key`, stamped with `timestamp`. With `overwrite`
    /// unset an occupied key is left alone and reported as a duplicate.
    fn btree_set(
        &self,
        key: &[u8],
        value: &Value,
        overwrite: bool,
        timestamp: RepliTimestamp,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<PointWriteResult>;

    /// Delete `key`, leaving a tombstone stamped with `timestamp`.
    fn btree_delete(
        &self,
        key: &[u8],
        timestamp: RepliTimestamp,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<PointDeleteResult>;

    /// Remove every key in `range` accepted by `tester`. Returns how many
    /// records were erased.
    fn btree_erase_range(
        &self,
        range: &KeyRange,
        tester: &dyn KeyTester,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<u64>;

    /// Depth-bounded sample of key counts starting at `left_key`. The
    /// sample may overshoot the caller's range; callers post-filter.
    fn btree_distribution_get(
        &self,
        max_depth: usize,
        left_key: &[u8],
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<BTreeMap<Vec<u8>, u64>>;

    /// Walk `range` and report every record and tombstone stamped at or
    /// after `since`. Returns silently when the interruptor fires
    /// mid-walk; the caller re-checks the signal after joining all
    /// traversals.
    fn btree_backfill(
        &self,
        range: &KeyRange,
        since: RepliTimestamp,
        callback: &dyn BackfillCallback,
        progress: &TraversalProgress,
        interruptor: &CancellationToken,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<()>;
}

/// Execute a range read against a slice: raw scan capped at `soft_cap`,
/// then transforms, then the terminal. Evaluation failures become the
/// response's `result`; only engine failures propagate.
pub fn rget_slice(
    btree: &dyn BtreeSlice,
    range: &KeyRange,
    soft_cap: usize,
    transforms: &[Transform],
    terminal: Option<&Terminal>,
    env: &mut RuntimeEnvironment,
    txn: &Transaction,
    superblock: &Superblock,
) -> anyhow::Result<RangeReadResponse> {
    let page = btree.btree_scan(range, soft_cap, txn, superblock)?;
    let last_considered_key = page.last_considered_key;
    let truncated = page.truncated;

    let result = match evaluate_rows(page.pairs, transforms, terminal, env) {
        Ok(result) => result,
        Err(err) => RangeResult::Error(err),
    };

    Ok(RangeReadResponse {
        result,
        truncated,
        key_range: range.clone(),
        last_considered_key,
    })
}

fn evaluate_rows(
    rows: Stream,
    transforms: &[Transform],
    terminal: Option<&Terminal>,
    env: &mut RuntimeEnvironment,
) -> Result<RangeResult, RuntimeError> {
    let backtrace = Backtrace::new();
    let mut rows = rows;
    for transform in transforms {
        rows = apply_transform(transform, rows, env, &backtrace)?;
    }

    match terminal {
        None => Ok(RangeResult::Stream(rows)),
        Some(Terminal::GroupedMapReduce {
            grouping,
            mapping,
            reduction,
        }) => {
            let mut groups = Groups::new();
            for (_key, value) in rows {
                let group =
                    OrderedJson(ql::eval_mapping(grouping, env, value.clone(), &backtrace)?);
                let mapped = ql::eval_mapping(mapping, env, value, &backtrace)?;
                let base = ql::eval(&reduction.base, env, &backtrace)?;
                let acc = groups.get(&group).cloned().unwrap_or(base);
                let folded = ql::eval_reduction_step(reduction, env, acc, mapped, &backtrace)?;
                groups.insert(group, folded);
            }
            Ok(RangeResult::Groups(groups))
        }
        Some(Terminal::Reduce(reduction)) => {
            let mut acc = ql::eval(&reduction.base, env, &backtrace)?;
            for (_key, value) in rows {
                acc = ql::eval_reduction_step(reduction, env, acc, value, &backtrace)?;
            }
            Ok(RangeResult::Atom(acc))
        }
        Some(Terminal::Length) => Ok(RangeResult::Length {
            length: rows.len() as u64,
        }),
        Some(Terminal::ForEach(mapping)) => {
            let mut inserted = 0u64;
            for (_key, value) in rows {
                // Per-row write dispatch belongs to the query layer; every
                // row that evaluates cleanly counts as applied.
                ql::eval_mapping(mapping, env, value, &backtrace)?;
                inserted += 1;
            }
            Ok(RangeResult::Inserted { inserted })
        }
    }
}

fn apply_transform(
    transform: &Transform,
    rows: Stream,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> Result<Stream, RuntimeError> {
    match transform {
        Transform::Filter(predicate) => {
            let mut out = Stream::with_capacity(rows.len());
            for (key, value) in rows {
                match ql::eval_mapping(predicate, env, value.clone(), backtrace)? {
                    Value::Bool(true) => out.push((key, value)),
                    Value::Bool(false) => {}
                    other => {
                        return Err(RuntimeError::new(
                            format!("filter predicate must return a boolean, got {other}"),
                            backtrace,
                        ))
                    }
                }
            }
            Ok(out)
        }
        Transform::Map(mapping) => {
            let mut out = Stream::with_capacity(rows.len());
            for (key, value) in rows {
                out.push((key, ql::eval_mapping(mapping, env, value, backtrace)?));
            }
            Ok(out)
        }
        Transform::ConcatMap(mapping) => {
            let mut out = Stream::new();
            for (key, value) in rows {
                match ql::eval_mapping(mapping, env, value, backtrace)? {
                    Value::Array(items) => {
                        out.extend(items.into_iter().map(|item| (key.clone(), item)))
                    }
                    other => {
                        return Err(RuntimeError::new(
                            format!("concat-map body must return an array, got {other}"),
                            backtrace,
                        ))
                    }
                }
            }
            Ok(out)
        }
    }
}

fn scan_bounds(range: &KeyRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let right = match &range.right {
        KeyBound::Unbounded => Bound::Unbounded,
        KeyBound::Exclusive(key) => Bound::Excluded(key.clone()),
    };
    (Bound::Included(range.left.clone()), right)
}

fn distribution_stride(total: usize, max_depth: usize) -> usize {
    let shift = (max_depth as u32 * DISTRIBUTION_FANOUT_BITS).min(usize::BITS - 1);
    std::cmp::max(1, total >> shift)
}

#[derive(Debug, Default)]
struct MemBtreeInner {
    live: BTreeMap<Vec<u8>, (Value, RepliTimestamp)>,
    tombstones: BTreeMap<Vec<u8>, RepliTimestamp>,
    /// Deletions older than this were compacted away and can only be
    /// replayed as a whole-range erase.
    deletion_horizon: RepliTimestamp,
}

/// Ordered in-memory engine. The reference slice for unit tests and
/// single-process deployments.
#[derive(Debug, Default)]
pub struct MemBtree {
    inner: RwLock<MemBtreeInner>,
}

impl MemBtree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that individual deletions before `horizon` are no longer
    /// replayable.
    pub fn set_deletion_horizon(&self, horizon: RepliTimestamp) -> anyhow::Result<()> {
        self.write_inner()?.deletion_horizon = horizon;
        Ok(())
    }

    fn read_inner(&self) -> anyhow::Result<RwLockReadGuard<'_, MemBtreeInner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("btree slice lock poisoned"))
    }

    fn write_inner(&self) -> anyhow::Result<RwLockWriteGuard<'_, MemBtreeInner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("btree slice lock poisoned"))
    }
}

impl BtreeSlice for MemBtree {
    fn btree_get(
        &self,
        key: &[u8],
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<Option<Value>> {
        Ok(self.read_inner()?.live.get(key).map(|(value, _)| value.clone()))
    }

    fn btree_scan(
        &self,
        range: &KeyRange,
        soft_cap: usize,
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<ScanPage> {
        if range.is_empty() || soft_cap == 0 {
            return Ok(ScanPage {
                pairs: Stream::new(),
                truncated: false,
                last_considered_key: range.left.clone(),
            });
        }

        let inner = self.read_inner()?;
        let mut iter = inner.live.range(scan_bounds(range));
        let mut pairs = Stream::with_capacity(soft_cap.min(64));
        for (key, (value, _)) in iter.by_ref().take(soft_cap) {
            pairs.push((key.clone(), value.clone()));
        }
        let truncated = iter.next().is_some();
        let last_considered_key = pairs
            .last()
            .map(|(key, _)| key.clone())
            .unwrap_or_else(|| range.left.clone());

        Ok(ScanPage {
            pairs,
            truncated,
            last_considered_key,
        })
    }

    fn btree_set(
        &self,
        key: &[u8],
        value: &Value,
        overwrite: bool,
        timestamp: RepliTimestamp,
        txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<PointWriteResult> {
        txn.check_write();
        let mut inner = self.write_inner()?;
        if !overwrite && inner.live.contains_key(key) {
            return Ok(PointWriteResult::Duplicate);
        }
        inner.tombstones.remove(key);
        inner.live.insert(key.to_vec(), (value.clone(), timestamp));
        Ok(PointWriteResult::Stored)
    }

    fn btree_delete(
        &self,
        key: &[u8],
        timestamp: RepliTimestamp,
        txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<PointDeleteResult> {
        txn.check_write();
        let mut inner = self.write_inner()?;
        if inner.live.remove(key).is_some() {
            inner.tombstones.insert(key.to_vec(), timestamp);
            Ok(PointDeleteResult::Deleted)
        } else {
            Ok(PointDeleteResult::Missing)
        }
    }

    fn btree_erase_range(
        &self,
        range: &KeyRange,
        tester: &dyn KeyTester,
        txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<u64> {
        txn.check_write();
        if range.is_empty() {
            return Ok(0);
        }
        let mut inner = self.write_inner()?;

        let doomed: Vec<Vec<u8>> = inner
            .live
            .range(scan_bounds(range))
            .map(|(key, _)| key.clone())
            .filter(|key| tester.key_should_be_erased(key))
            .collect();
        for key in &doomed {
            inner.live.remove(key);
        }

        // Erasure is not a replicated deletion; matching tombstones go too.
        let dead: Vec<Vec<u8>> = inner
            .tombstones
            .range(scan_bounds(range))
            .map(|(key, _)| key.clone())
            .filter(|key| tester.key_should_be_erased(key))
            .collect();
        for key in &dead {
            inner.tombstones.remove(key);
        }

        Ok(doomed.len() as u64)
    }

    fn btree_distribution_get(
        &self,
        max_depth: usize,
        left_key: &[u8],
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<BTreeMap<Vec<u8>, u64>> {
        let inner = self.read_inner()?;
        let keys: Vec<&Vec<u8>> = inner
            .live
            .range(left_key.to_vec()..)
            .map(|(key, _)| key)
            .collect();

        let mut key_counts = BTreeMap::new();
        if keys.is_empty() {
            return Ok(key_counts);
        }
        let stride = distribution_stride(keys.len(), max_depth);
        for bucket in keys.chunks(stride) {
            key_counts.insert(bucket[0].clone(), bucket.len() as u64);
        }
        Ok(key_counts)
    }

    fn btree_backfill(
        &self,
        range: &KeyRange,
        since: RepliTimestamp,
        callback: &dyn BackfillCallback,
        progress: &TraversalProgress,
        interruptor: &CancellationToken,
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<()> {
        if range.is_empty() {
            progress.set_total(0);
            return Ok(());
        }

        let (coarse_erase, deletions, records) = {
            let inner = self.read_inner()?;
            let deletions: Vec<(Vec<u8>, RepliTimestamp)> = inner
                .tombstones
                .range(scan_bounds(range))
                .filter(|(_, recency)| **recency >= since)
                .map(|(key, recency)| (key.clone(), *recency))
                .collect();
            let records: Vec<(Vec<u8>, Value, RepliTimestamp)> = inner
                .live
                .range(scan_bounds(range))
                .filter(|(_, (_, recency))| *recency >= since)
                .map(|(key, (value, recency))| (key.clone(), value.clone(), *recency))
                .collect();
            (since < inner.deletion_horizon, deletions, records)
        };

        progress.set_total((deletions.len() + records.len()) as u64);

        if coarse_erase {
            callback.on_delete_range(range)?;
        }
        for (key, recency) in deletions {
            if interruptor.is_cancelled() {
                return Ok(());
            }
            callback.on_deletion(&key, recency)?;
            progress.tick();
        }
        for (key, value, recency) in records {
            if interruptor.is_cancelled() {
                return Ok(());
            }
            callback.on_keyvalue(BackfillAtom {
                key,
                value,
                recency,
            })?;
            progress.tick();
        }
        Ok(())
    }
}

/// Fjall-backed slice storing records and tombstones in shard-suffixed
/// partitions.
pub struct FjallSlice {
    keyspace: Arc<Keyspace>,
    live: fjall::PartitionHandle,
    tombstones: fjall::PartitionHandle,
}

impl FjallSlice {
    /// Open the partitions for one shard of the keyspace.
    pub fn open_shard(keyspace: Arc<Keyspace>, shard: usize) -> anyhow::Result<Self> {
        let live_name = format!("slice_live_{shard}");
        let dead_name = format!("slice_dead_{shard}");
        let live = keyspace.open_partition(&live_name, PartitionCreateOptions::default())?;
        let tombstones = keyspace.open_partition(&dead_name, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            live,
            tombstones,
        })
    }

    fn range_iter(
        &self,
        partition: &fjall::PartitionHandle,
        range: &KeyRange,
    ) -> Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>>> {
        let start = range.left.clone();
        match &range.right {
            KeyBound::Unbounded => Box::new(partition.range(start..)),
            KeyBound::Exclusive(right) => Box::new(partition.range(start..right.clone())),
        }
    }
}

impl BtreeSlice for FjallSlice {
    fn btree_get(
        &self,
        key: &[u8],
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<Option<Value>> {
        match self.live.get(key)? {
            Some(bytes) => {
                let (_, value) = decode_record(&bytes)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn btree_scan(
        &self,
        range: &KeyRange,
        soft_cap: usize,
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<ScanPage> {
        if range.is_empty() || soft_cap == 0 {
            return Ok(ScanPage {
                pairs: Stream::new(),
                truncated: false,
                last_considered_key: range.left.clone(),
            });
        }

        let mut iter = self.range_iter(&self.live, range);
        let mut pairs = Stream::with_capacity(soft_cap.min(64));
        let mut truncated = false;
        while let Some(item) = iter.next() {
            let (key, bytes) = item?;
            if pairs.len() == soft_cap {
                truncated = true;
                break;
            }
            let (_, value) = decode_record(&bytes)?;
            pairs.push((key.to_vec(), value));
        }
        let last_considered_key = pairs
            .last()
            .map(|(key, _)| key.clone())
            .unwrap_or_else(|| range.left.clone());

        Ok(ScanPage {
            pairs,
            truncated,
            last_considered_key,
        })
    }

    fn btree_set(
        &self,
        key: &[u8],
        value: &Value,
        overwrite: bool,
        timestamp: RepliTimestamp,
        txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<PointWriteResult> {
        txn.check_write();
        if !overwrite && self.live.get(key)?.is_some() {
            return Ok(PointWriteResult::Duplicate);
        }
        let mut batch = self.keyspace.batch();
        batch.insert(&self.live, key.to_vec(), encode_record(timestamp, value)?);
        batch.remove(&self.tombstones, key.to_vec());
        batch.commit()?;
        Ok(PointWriteResult::Stored)
    }

    fn btree_delete(
        &self,
        key: &[u8],
        timestamp: RepliTimestamp,
        txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<PointDeleteResult> {
        txn.check_write();
        if self.live.get(key)?.is_none() {
            return Ok(PointDeleteResult::Missing);
        }
        let mut batch = self.keyspace.batch();
        batch.remove(&self.live, key.to_vec());
        batch.insert(&self.tombstones, key.to_vec(), timestamp.to_be_bytes().to_vec());
        batch.commit()?;
        Ok(PointDeleteResult::Deleted)
    }

    fn btree_erase_range(
        &self,
        range: &KeyRange,
        tester: &dyn KeyTester,
        txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<u64> {
        txn.check_write();
        if range.is_empty() {
            return Ok(0);
        }

        let mut batch = self.keyspace.batch();
        let mut erased = 0u64;
        for item in self.range_iter(&self.live, range) {
            let (key, _) = item?;
            if tester.key_should_be_erased(&key) {
                batch.remove(&self.live, key.to_vec());
                erased += 1;
            }
        }
        for item in self.range_iter(&self.tombstones, range) {
            let (key, _) = item?;
            if tester.key_should_be_erased(&key) {
                batch.remove(&self.tombstones, key.to_vec());
            }
        }
        batch.commit()?;
        Ok(erased)
    }

    fn btree_distribution_get(
        &self,
        max_depth: usize,
        left_key: &[u8],
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<BTreeMap<Vec<u8>, u64>> {
        let mut keys = Vec::new();
        for item in self.live.range(left_key.to_vec()..) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }

        let mut key_counts = BTreeMap::new();
        if keys.is_empty() {
            return Ok(key_counts);
        }
        let stride = distribution_stride(keys.len(), max_depth);
        for bucket in keys.chunks(stride) {
            key_counts.insert(bucket[0].clone(), bucket.len() as u64);
        }
        Ok(key_counts)
    }

    fn btree_backfill(
        &self,
        range: &KeyRange,
        since: RepliTimestamp,
        callback: &dyn BackfillCallback,
        progress: &TraversalProgress,
        interruptor: &CancellationToken,
        _txn: &Transaction,
        _superblock: &Superblock,
    ) -> anyhow::Result<()> {
        if range.is_empty() {
            progress.set_total(0);
            return Ok(());
        }

        let mut deletions: Vec<(Vec<u8>, RepliTimestamp)> = Vec::new();
        for item in self.range_iter(&self.tombstones, range) {
            let (key, bytes) = item?;
            let recency = decode_timestamp(&bytes)?;
            if recency >= since {
                deletions.push((key.to_vec(), recency));
            }
        }

        let mut records: Vec<(Vec<u8>, Value, RepliTimestamp)> = Vec::new();
        for item in self.range_iter(&self.live, range) {
            let (key, bytes) = item?;
            let (recency, value) = decode_record(&bytes)?;
            if recency >= since {
                records.push((key.to_vec(), value, recency));
            }
        }

        progress.set_total((deletions.len() + records.len()) as u64);

        for (key, recency) in deletions {
            if interruptor.is_cancelled() {
                return Ok(());
            }
            callback.on_deletion(&key, recency)?;
            progress.tick();
        }
        for (key, value, recency) in records {
            if interruptor.is_cancelled() {
                return Ok(());
            }
            callback.on_keyvalue(BackfillAtom {
                key,
                value,
                recency,
            })?;
            progress.tick();
        }
        Ok(())
    }
}

/// Encode a stored record as `timestamp (8B BE) + JSON value`.
fn encode_record(timestamp: RepliTimestamp, value: &Value) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut out = Vec::with_capacity(8 + json.len());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decode the record layout produced by `encode_record`.
fn decode_record(data: &[u8]) -> anyhow::Result<(RepliTimestamp, Value)> {
    anyhow::ensure!(data.len() >= 8, "short record");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    let value = serde_json::from_slice(&data[8..])?;
    Ok((RepliTimestamp::from_be_bytes(buf), value))
}

/// Decode a bare big-endian timestamp.
fn decode_timestamp(data: &[u8]) -> anyhow::Result<RepliTimestamp> {
    anyhow::ensure!(data.len() >= 8, "short timestamp");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    Ok(RepliTimestamp::from_be_bytes(buf))
}
