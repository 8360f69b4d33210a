//! The per-shard store: executes operations against a slice and runs the
//! backfill send/receive paths.
//!
//! Reads and writes run synchronously on the thread that owns the slice.
//! Backfill sending fans out one traversal per start-point region, joins
//! them, and only then surfaces interruption so every sub-traversal has
//! unwound first.

use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::btree::{
    rget_slice, AlwaysTrueKeyTester, BackfillCallback, BtreeSlice, RangeKeyTester,
    RepliTimestamp, Superblock, Transaction, TraversalProgress,
};
use crate::context::{Context, Interrupted};
use crate::protocol::{
    BackfillAtom, BackfillChunk, DistributionReadResponse, ModifyOp, PointModify,
    PointModifyResult, PointReadResponse, Read, ReadResponse, Write, WriteResponse,
};
use crate::ql::{self, Backtrace, RuntimeError, Value};
use crate::region::{KeyRange, Region};

/// Page size requested from the engine for every range scan. The read's
/// own `maximum` only matters when hash-shard responses are merged.
pub const RGET_SOFT_CAP: usize = 1000;

/// Destination for the chunk stream produced by a backfill send.
pub trait ChunkSink: Send + Sync {
    fn send_chunk(&self, chunk: BackfillChunk) -> anyhow::Result<()>;
}

impl ChunkSink for tokio::sync::mpsc::UnboundedSender<BackfillChunk> {
    fn send_chunk(&self, chunk: BackfillChunk) -> anyhow::Result<()> {
        self.send(chunk)
            .map_err(|_| anyhow::anyhow!("backfill chunk receiver dropped"))
    }
}

/// Aggregated progress across the parallel traversals of one backfill.
#[derive(Debug, Default)]
pub struct BackfillProgress {
    constituents: Mutex<Vec<Arc<TraversalProgress>>>,
}

impl BackfillProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one traversal's progress tracker.
    pub fn add_constituent(&self) -> Arc<TraversalProgress> {
        let constituent = Arc::new(TraversalProgress::default());
        self.constituents
            .lock()
            .expect("progress lock poisoned")
            .push(Arc::clone(&constituent));
        constituent
    }

    /// Fraction complete over every constituent with a known total.
    pub fn fraction(&self) -> Option<f64> {
        let constituents = self.constituents.lock().expect("progress lock poisoned");
        let mut done = 0u64;
        let mut total = 0u64;
        for constituent in constituents.iter() {
            if let Some((d, t)) = constituent.progress() {
                done += d;
                total += t;
            }
        }
        if total == 0 {
            return None;
        }
        Some(done as f64 / total as f64)
    }
}

/// Adapts the traversal upcalls into chunks on a sink.
struct SinkCallback {
    sink: Arc<dyn ChunkSink>,
}

impl BackfillCallback for SinkCallback {
    fn on_delete_range(&self, range: &KeyRange) -> anyhow::Result<()> {
        self.sink
            .send_chunk(BackfillChunk::delete_range(Region::from_key_range(
                range.clone(),
            )))
    }

    fn on_deletion(&self, key: &[u8], recency: RepliTimestamp) -> anyhow::Result<()> {
        self.sink
            .send_chunk(BackfillChunk::delete_key(key.to_vec(), recency))
    }

    fn on_keyvalue(&self, atom: BackfillAtom) -> anyhow::Result<()> {
        self.sink.send_chunk(BackfillChunk::set_key(atom))
    }
}

/// One shard's store: a slice plus the node context.
pub struct Store {
    btree: Arc<dyn BtreeSlice>,
    ctx: Arc<Context>,
}

impl Store {
    pub fn new(btree: Arc<dyn BtreeSlice>, ctx: Arc<Context>) -> Self {
        Self { btree, ctx }
    }

    pub fn btree(&self) -> &Arc<dyn BtreeSlice> {
        &self.btree
    }

    /// Execute a read against the local slice.
    pub fn protocol_read(
        &self,
        read: &Read,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<ReadResponse> {
        match read {
            Read::Point(pr) => Ok(ReadResponse::Point(PointReadResponse {
                value: self.btree.btree_get(&pr.key, txn, superblock)?,
            })),
            Read::Range(rg) => {
                let mut env = self.ctx.runtime_environment();
                env.scopes = rg.scopes.clone();
                let response = rget_slice(
                    self.btree.as_ref(),
                    &rg.key_range,
                    RGET_SOFT_CAP,
                    &rg.transforms,
                    rg.terminal.as_ref(),
                    &mut env,
                    txn,
                    superblock,
                )?;
                Ok(ReadResponse::Range(response))
            }
            Read::Distribution(dg) => {
                let mut key_counts = self.btree.btree_distribution_get(
                    dg.max_depth,
                    &dg.range.left,
                    txn,
                    superblock,
                )?;
                // The sample starts at the left bound and may overshoot the
                // range; trim before responding.
                key_counts.retain(|key, _| dg.range.contains_key(key));
                Ok(ReadResponse::Distribution(DistributionReadResponse {
                    key_counts,
                }))
            }
        }
    }

    /// Execute a write against the local slice at `timestamp`.
    pub fn protocol_write(
        &self,
        write: &Write,
        timestamp: RepliTimestamp,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<WriteResponse> {
        match write {
            Write::Point(pw) => Ok(WriteResponse::Point {
                result: self
                    .btree
                    .btree_set(&pw.key, &pw.value, pw.overwrite, timestamp, txn, superblock)?,
            }),
            Write::Modify(pm) => Ok(WriteResponse::Modify {
                result: self.execute_modify(pm, timestamp, txn, superblock)?,
            }),
            Write::Delete(pd) => Ok(WriteResponse::Delete {
                result: self.btree.btree_delete(&pd.key, timestamp, txn, superblock)?,
            }),
        }
    }

    /// Read-modify-write of one document. Runs on the slice's owning
    /// thread, which serializes it against other writes to the key.
    fn execute_modify(
        &self,
        modify: &PointModify,
        timestamp: RepliTimestamp,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<PointModifyResult> {
        let mut env = self.ctx.runtime_environment();
        env.scopes = modify.scopes.clone();
        let backtrace = Backtrace::new();

        let stored = self.btree.btree_get(&modify.key, txn, superblock)?;
        let argument = stored.clone().unwrap_or(Value::Null);
        let mapped = match ql::eval_mapping(&modify.mapping, &mut env, argument, &backtrace) {
            Ok(mapped) => mapped,
            Err(err) => return Ok(PointModifyResult::Error(err)),
        };

        let next = match (modify.op, &stored) {
            (ModifyOp::Mutate, _) => mapped,
            (ModifyOp::Update, Some(Value::Object(old))) => match mapped {
                Value::Object(patch) => {
                    let mut merged = old.clone();
                    for (field, value) in patch {
                        merged.insert(field, value);
                    }
                    Value::Object(merged)
                }
                Value::Null => return Ok(PointModifyResult::Skipped),
                other => {
                    return Ok(PointModifyResult::Error(RuntimeError::new(
                        format!("update mapping must return an object, got {other}"),
                        &backtrace,
                    )))
                }
            },
            (ModifyOp::Update, _) => mapped,
        };

        if next == Value::Null {
            return Ok(PointModifyResult::Skipped);
        }
        if let (Some(Value::Object(old)), Value::Object(new)) = (&stored, &next) {
            if old.get(&modify.primary_key) != new.get(&modify.primary_key) {
                return Ok(PointModifyResult::Error(RuntimeError::new(
                    format!("modify changed the primary key `{}`", modify.primary_key),
                    &backtrace,
                )));
            }
        }
        if stored.as_ref() == Some(&next) {
            return Ok(PointModifyResult::Skipped);
        }

        self.btree
            .btree_set(&modify.key, &next, true, timestamp, txn, superblock)?;
        Ok(PointModifyResult::Modified)
    }

    /// Stream the contents of every start-point region into `sink`, one
    /// traversal per region, joined before returning. A pulsed interruptor
    /// fails the whole send with `Interrupted` only after every traversal
    /// has unwound.
    pub async fn protocol_send_backfill(
        &self,
        start_point: Vec<(Region, RepliTimestamp)>,
        sink: Arc<dyn ChunkSink>,
        txn: Arc<Transaction>,
        superblock: Arc<Superblock>,
        progress: &BackfillProgress,
        interruptor: CancellationToken,
    ) -> anyhow::Result<()> {
        debug!(regions = start_point.len(), "starting backfill send");
        let callback = Arc::new(SinkCallback { sink });

        let mut tasks = Vec::with_capacity(start_point.len());
        for (region, since) in start_point {
            let btree = Arc::clone(&self.btree);
            let callback = Arc::clone(&callback);
            let txn = Arc::clone(&txn);
            // One superblock reference per traversal, released when the
            // traversal finishes.
            let superblock = Arc::clone(&superblock);
            let constituent = progress.add_constituent();
            let interruptor = interruptor.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                btree.btree_backfill(
                    &region.keys,
                    since,
                    callback.as_ref(),
                    &constituent,
                    &interruptor,
                    &txn,
                    &superblock,
                )
            }));
        }

        let mut first_error = None;
        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => first_error = first_error.or(Some(err)),
                Err(err) => {
                    first_error = first_error
                        .or_else(|| Some(anyhow::anyhow!("backfill traversal panicked: {err}")))
                }
            }
        }

        // Interrupted traversals return silently; the signal is checked
        // here, after all of them have finished, and wins over any other
        // failure.
        if interruptor.is_cancelled() {
            return Err(anyhow::Error::new(Interrupted));
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply one received backfill chunk to the local slice.
    pub fn protocol_receive_backfill(
        &self,
        chunk: &BackfillChunk,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<()> {
        match chunk {
            BackfillChunk::DeleteKey { key, recency } => {
                self.btree.btree_delete(key, *recency, txn, superblock)?;
            }
            BackfillChunk::DeleteRange { region } => {
                self.btree.btree_erase_range(
                    &region.keys,
                    &RangeKeyTester { region },
                    txn,
                    superblock,
                )?;
            }
            BackfillChunk::KeyValuePair { atom } => {
                self.btree
                    .btree_set(&atom.key, &atom.value, true, atom.recency, txn, superblock)?;
            }
        }
        Ok(())
    }

    /// Erase everything in `region`'s key range, regardless of hash.
    pub fn protocol_reset_data(
        &self,
        region: &Region,
        txn: &Transaction,
        superblock: &Superblock,
    ) -> anyhow::Result<()> {
        self.btree
            .btree_erase_range(&region.keys, &AlwaysTrueKeyTester, txn, superblock)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::MemBtree;
    use crate::protocol::{
        DistributionRead, PointDelete, PointDeleteResult, PointRead, PointWrite, PointWriteResult,
        RangeRead, RangeResult,
    };
    use crate::ql::{Mapping, Scopes, Term};
    use serde_json::json;

    fn store() -> Store {
        Store::new(Arc::new(MemBtree::new()), Arc::new(Context::new(1)))
    }

    fn write_txn() -> Transaction {
        Transaction::begin_write()
    }

    fn read_txn() -> Transaction {
        Transaction::begin_read()
    }

    #[test]
    fn point_write_then_point_read() {
        let store = store();
        let superblock = Superblock::acquire();

        let write = Write::Point(PointWrite {
            key: b"doc".to_vec(),
            value: json!({"id": "doc", "n": 1}),
            overwrite: true,
        });
        let response = store
            .protocol_write(&write, 1, &write_txn(), &superblock)
            .expect("write");
        assert_eq!(
            response,
            WriteResponse::Point {
                result: PointWriteResult::Stored
            }
        );

        let read = Read::Point(PointRead { key: b"doc".to_vec() });
        let response = store
            .protocol_read(&read, &read_txn(), &superblock)
            .expect("read");
        assert_eq!(
            response,
            ReadResponse::Point(PointReadResponse {
                value: Some(json!({"id": "doc", "n": 1}))
            })
        );

        let write = Write::Delete(PointDelete { key: b"doc".to_vec() });
        let response = store
            .protocol_write(&write, 2, &write_txn(), &superblock)
            .expect("delete");
        assert_eq!(
            response,
            WriteResponse::Delete {
                result: PointDeleteResult::Deleted
            }
        );
    }

    #[test]
    fn point_write_without_overwrite_reports_a_duplicate() {
        let store = store();
        let superblock = Superblock::acquire();

        let first = Write::Point(PointWrite {
            key: b"doc".to_vec(),
            value: json!(1),
            overwrite: false,
        });
        let response = store
            .protocol_write(&first, 1, &write_txn(), &superblock)
            .expect("write");
        assert_eq!(
            response,
            WriteResponse::Point {
                result: PointWriteResult::Stored
            }
        );

        let second = Write::Point(PointWrite {
            key: b"doc".to_vec(),
            value: json!(2),
            overwrite: false,
        });
        let response = store
            .protocol_write(&second, 2, &write_txn(), &superblock)
            .expect("write");
        assert_eq!(
            response,
            WriteResponse::Point {
                result: PointWriteResult::Duplicate
            }
        );

        // The duplicate write did not clobber the stored document.
        let read = Read::Point(PointRead { key: b"doc".to_vec() });
        assert_eq!(
            store.protocol_read(&read, &read_txn(), &superblock).expect("read"),
            ReadResponse::Point(PointReadResponse {
                value: Some(json!(1))
            })
        );
    }

    #[test]
    fn modify_with_no_effect_is_skipped() {
        let store = store();
        let superblock = Superblock::acquire();
        store
            .protocol_write(
                &Write::Point(PointWrite {
                    key: b"doc".to_vec(),
                    value: json!({"id": "doc", "n": 1}),
                    overwrite: true,
                }),
                1,
                &write_txn(),
                &superblock,
            )
            .expect("seed");

        // The identity mapping reproduces the stored document exactly.
        let modify = Write::Modify(PointModify {
            key: b"doc".to_vec(),
            primary_key: "id".to_string(),
            op: ModifyOp::Mutate,
            mapping: Mapping::identity(),
            scopes: Scopes::new(),
        });
        let response = store
            .protocol_write(&modify, 2, &write_txn(), &superblock)
            .expect("modify");
        assert_eq!(
            response,
            WriteResponse::Modify {
                result: PointModifyResult::Skipped
            }
        );

        // A null update patch is also a no-op.
        let modify = Write::Modify(PointModify {
            key: b"doc".to_vec(),
            primary_key: "id".to_string(),
            op: ModifyOp::Update,
            mapping: Mapping::new("row", Term::Datum(serde_json::Value::Null)),
            scopes: Scopes::new(),
        });
        let response = store
            .protocol_write(&modify, 3, &write_txn(), &superblock)
            .expect("modify");
        assert_eq!(
            response,
            WriteResponse::Modify {
                result: PointModifyResult::Skipped
            }
        );

        let read = Read::Point(PointRead { key: b"doc".to_vec() });
        assert_eq!(
            store.protocol_read(&read, &read_txn(), &superblock).expect("read"),
            ReadResponse::Point(PointReadResponse {
                value: Some(json!({"id": "doc", "n": 1}))
            })
        );
    }

    #[test]
    fn modify_update_merges_fields() {
        let store = store();
        let superblock = Superblock::acquire();
        store
            .protocol_write(
                &Write::Point(PointWrite {
                    key: b"doc".to_vec(),
                    value: json!({"id": "doc", "n": 1}),
                    overwrite: true,
                }),
                1,
                &write_txn(),
                &superblock,
            )
            .expect("seed");

        let modify = Write::Modify(PointModify {
            key: b"doc".to_vec(),
            primary_key: "id".to_string(),
            op: ModifyOp::Update,
            mapping: Mapping::new("row", Term::Datum(json!({"n": 2, "extra": true}))),
            scopes: Scopes::new(),
        });
        let response = store
            .protocol_write(&modify, 2, &write_txn(), &superblock)
            .expect("modify");
        assert_eq!(
            response,
            WriteResponse::Modify {
                result: PointModifyResult::Modified
            }
        );

        let read = Read::Point(PointRead { key: b"doc".to_vec() });
        let response = store
            .protocol_read(&read, &read_txn(), &superblock)
            .expect("read");
        assert_eq!(
            response,
            ReadResponse::Point(PointReadResponse {
                value: Some(json!({"id": "doc", "n": 2, "extra": true}))
            })
        );
    }

    #[test]
    fn modify_that_changes_the_primary_key_reports_an_error() {
        let store = store();
        let superblock = Superblock::acquire();
        store
            .protocol_write(
                &Write::Point(PointWrite {
                    key: b"doc".to_vec(),
                    value: json!({"id": "doc"}),
                    overwrite: true,
                }),
                1,
                &write_txn(),
                &superblock,
            )
            .expect("seed");

        let modify = Write::Modify(PointModify {
            key: b"doc".to_vec(),
            primary_key: "id".to_string(),
            op: ModifyOp::Mutate,
            mapping: Mapping::new("row", Term::Datum(json!({"id": "other"}))),
            scopes: Scopes::new(),
        });
        let response = store
            .protocol_write(&modify, 2, &write_txn(), &superblock)
            .expect("modify");
        match response {
            WriteResponse::Modify {
                result: PointModifyResult::Error(err),
            } => assert!(err.message.contains("primary key")),
            other => panic!("expected a modify error, got {other:?}"),
        }
    }

    #[test]
    fn modify_mapping_errors_are_captured_in_the_status() {
        let store = store();
        let superblock = Superblock::acquire();

        let modify = Write::Modify(PointModify {
            key: b"doc".to_vec(),
            primary_key: "id".to_string(),
            op: ModifyOp::Mutate,
            mapping: Mapping::new("row", Term::var("unbound")),
            scopes: Scopes::new(),
        });
        let response = store
            .protocol_write(&modify, 1, &write_txn(), &superblock)
            .expect("modify");
        match response {
            WriteResponse::Modify {
                result: PointModifyResult::Error(err),
            } => assert!(err.message.contains("unbound")),
            other => panic!("expected a modify error, got {other:?}"),
        }
    }

    #[test]
    fn distribution_read_trims_the_sample_to_the_range() {
        let store = store();
        let superblock = Superblock::acquire();
        for i in 0..16 {
            let key = format!("k{i:02}");
            store
                .protocol_write(
                    &Write::Point(PointWrite {
                        key: key.into_bytes(),
                        value: json!(i),
                        overwrite: true,
                    }),
                    i as RepliTimestamp + 1,
                    &write_txn(),
                    &superblock,
                )
                .expect("write");
        }

        let read = Read::Distribution(DistributionRead {
            range: KeyRange::half_open(b"k04".to_vec(), b"k08".to_vec()),
            max_depth: 4,
        });
        let response = store
            .protocol_read(&read, &read_txn(), &superblock)
            .expect("read");
        match response {
            ReadResponse::Distribution(dstr) => {
                assert!(!dstr.key_counts.is_empty());
                for key in dstr.key_counts.keys() {
                    assert!(key.as_slice() >= b"k04".as_slice());
                    assert!(key.as_slice() < b"k08".as_slice());
                }
            }
            other => panic!("expected a distribution response, got {other:?}"),
        }
    }

    #[test]
    fn range_read_executes_with_the_request_scopes() {
        let store = store();
        let superblock = Superblock::acquire();
        store
            .protocol_write(
                &Write::Point(PointWrite {
                    key: b"a".to_vec(),
                    value: json!(5),
                    overwrite: true,
                }),
                1,
                &write_txn(),
                &superblock,
            )
            .expect("write");

        let mut rg = RangeRead::new(KeyRange::universe(), 10);
        rg.transforms = vec![crate::protocol::Transform::Map(Mapping::new(
            "row",
            Term::add(Term::var("row"), Term::var("offset")),
        ))];
        rg.scopes.put_in_scope("offset", json!(100));
        let response = store
            .protocol_read(&Read::Range(rg), &read_txn(), &superblock)
            .expect("read");
        match response {
            ReadResponse::Range(rg) => {
                assert_eq!(
                    rg.result,
                    RangeResult::Stream(vec![(b"a".to_vec(), json!(105.0))])
                );
            }
            other => panic!("expected a range response, got {other:?}"),
        }
    }

    #[test]
    fn receive_backfill_applies_chunks_and_reset_clears() {
        let store = store();
        let superblock = Superblock::acquire();
        let txn = write_txn();

        store
            .protocol_receive_backfill(
                &BackfillChunk::set_key(BackfillAtom {
                    key: b"doc".to_vec(),
                    value: json!(1),
                    recency: 3,
                }),
                &txn,
                &superblock,
            )
            .expect("apply kv");
        store
            .protocol_receive_backfill(
                &BackfillChunk::set_key(BackfillAtom {
                    key: b"other".to_vec(),
                    value: json!(2),
                    recency: 4,
                }),
                &txn,
                &superblock,
            )
            .expect("apply kv");
        store
            .protocol_receive_backfill(
                &BackfillChunk::delete_key(b"doc".to_vec(), 5),
                &txn,
                &superblock,
            )
            .expect("apply delete");

        let read = Read::Point(PointRead { key: b"doc".to_vec() });
        assert_eq!(
            store.protocol_read(&read, &read_txn(), &superblock).expect("read"),
            ReadResponse::Point(PointReadResponse { value: None })
        );

        store
            .protocol_reset_data(&Region::universe(), &txn, &superblock)
            .expect("reset");
        let read = Read::Range(RangeRead::new(KeyRange::universe(), 10));
        match store.protocol_read(&read, &read_txn(), &superblock).expect("read") {
            ReadResponse::Range(rg) => assert_eq!(rg.result, RangeResult::Stream(vec![])),
            other => panic!("expected a range response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_backfill_streams_every_region() {
        let store = store();
        let superblock = Superblock::acquire();
        let txn = write_txn();
        for (key, recency) in [(b"a".as_slice(), 1u64), (b"m", 2), (b"z", 3)] {
            store
                .btree()
                .btree_set(key, &json!(recency), true, recency, &txn, &superblock)
                .expect("seed");
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let progress = BackfillProgress::new();
        let start_point = vec![
            (
                Region::from_key_range(KeyRange::half_open(b"a".to_vec(), b"n".to_vec())),
                0,
            ),
            (
                Region::from_key_range(KeyRange::half_open(b"n".to_vec(), b"~".to_vec())),
                0,
            ),
        ];
        store
            .protocol_send_backfill(
                start_point,
                Arc::new(tx),
                Arc::new(Transaction::begin_read()),
                Arc::new(Superblock::acquire()),
                &progress,
                CancellationToken::new(),
            )
            .await
            .expect("send backfill");

        let mut keys = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            match chunk {
                BackfillChunk::KeyValuePair { atom } => keys.push(atom.key),
                other => panic!("expected key-value chunks, got {other:?}"),
            }
        }
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
        assert_eq!(progress.fraction(), Some(1.0));
    }

    struct CancellingSink {
        inner: tokio::sync::mpsc::UnboundedSender<BackfillChunk>,
        interruptor: CancellationToken,
    }

    impl ChunkSink for CancellingSink {
        fn send_chunk(&self, chunk: BackfillChunk) -> anyhow::Result<()> {
            self.inner
                .send(chunk)
                .map_err(|_| anyhow::anyhow!("receiver dropped"))?;
            // Pulse the interruptor as soon as the first chunk lands.
            self.interruptor.cancel();
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_backfill_surfaces_interruption_after_traversals_unwind() {
        let store = store();
        let superblock = Superblock::acquire();
        let txn = write_txn();
        for key in [b"a".as_slice(), b"b", b"c"] {
            store
                .btree()
                .btree_set(key, &json!(1), true, 1, &txn, &superblock)
                .expect("seed");
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let interruptor = CancellationToken::new();
        let sink = Arc::new(CancellingSink {
            inner: tx,
            interruptor: interruptor.clone(),
        });

        let err = store
            .protocol_send_backfill(
                vec![(Region::universe(), 0)],
                sink,
                Arc::new(Transaction::begin_read()),
                Arc::new(Superblock::acquire()),
                &BackfillProgress::new(),
                interruptor,
            )
            .await
            .expect_err("interrupted backfill must fail");
        assert!(err.downcast_ref::<Interrupted>().is_some());

        // The traversal stopped at the first interrupt check.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 1);
    }
}
