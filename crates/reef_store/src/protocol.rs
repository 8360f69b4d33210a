//! Operation variants, responses, shard projection, and response merging.
//!
//! Reads, writes, and backfill chunks are tagged unions dispatched by
//! exhaustive match. Every variant declares the region it touches;
//! `shard` narrows an operation to a sub-region, and `unshard` /
//! `multistore_unshard` merge per-shard responses back into one logical
//! response. Merging a range read with a terminal re-enters the query
//! language through `ql::eval`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::btree::RepliTimestamp;
use crate::context::Context;
use crate::ql::{self, Backtrace, Mapping, OrderedJson, Reduction, RuntimeError, Scopes, Value};
use crate::region::{monokey_region, KeyRange, Region};

/// Wire name of this protocol.
pub const PROTOCOL_NAME: &str = "rdb";

/// Lookup of a single key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointRead {
    pub key: Vec<u8>,
}

/// Ordered scan of a key range with optional per-row transforms and an
/// optional terminal reduction. `maximum` is the page size the router
/// asked for; it participates in multistore merging, not in local
/// execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeRead {
    pub key_range: KeyRange,
    pub maximum: usize,
    pub transforms: Vec<Transform>,
    pub terminal: Option<Terminal>,
    pub scopes: Scopes,
}

impl RangeRead {
    pub fn new(key_range: KeyRange, maximum: usize) -> Self {
        Self {
            key_range,
            maximum,
            transforms: Vec::new(),
            terminal: None,
            scopes: Scopes::new(),
        }
    }
}

/// Depth-bounded sample of key density over a range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributionRead {
    pub range: KeyRange,
    pub max_depth: usize,
}

/// Read operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Read {
    Point(PointRead),
    Range(RangeRead),
    Distribution(DistributionRead),
}

/// Per-row stream transforms applied during a range scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    Filter(Mapping),
    Map(Mapping),
    ConcatMap(Mapping),
}

/// Reduction applied at the end of a range scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Terminal {
    GroupedMapReduce {
        grouping: Mapping,
        mapping: Mapping,
        reduction: Reduction,
    },
    Reduce(Reduction),
    Length,
    ForEach(Mapping),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointReadResponse {
    pub value: Option<Value>,
}

/// Ordered `(key, value)` rows produced by a plain range scan.
pub type Stream = Vec<(Vec<u8>, Value)>;

/// Aggregated value per grouping key.
pub type Groups = BTreeMap<OrderedJson, Value>;

/// Result payload of a range read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RangeResult {
    Stream(Stream),
    Groups(Groups),
    Atom(Value),
    Length { length: u64 },
    Inserted { inserted: u64 },
    Error(RuntimeError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeReadResponse {
    pub result: RangeResult,
    pub truncated: bool,
    /// The key range this response was executed against.
    pub key_range: KeyRange,
    /// Highest key up to which the scan has fully observed results.
    pub last_considered_key: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributionReadResponse {
    pub key_counts: BTreeMap<Vec<u8>, u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReadResponse {
    Point(PointReadResponse),
    Range(RangeReadResponse),
    Distribution(DistributionReadResponse),
}

/// Store a document at a key. With `overwrite` unset the write only
/// lands on a vacant key and reports `Duplicate` otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointWrite {
    pub key: Vec<u8>,
    pub value: Value,
    pub overwrite: bool,
}

/// How a modify mapping's output is applied to the stored document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyOp {
    /// Merge the mapping's object fields into the stored document.
    Update,
    /// Replace the stored document with the mapping's output.
    Mutate,
}

/// Atomic read-modify-write of a single document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointModify {
    pub key: Vec<u8>,
    pub primary_key: String,
    pub op: ModifyOp,
    pub mapping: Mapping,
    pub scopes: Scopes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointDelete {
    pub key: Vec<u8>,
}

/// Write operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Write {
    Point(PointWrite),
    Modify(PointModify),
    Delete(PointDelete),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointWriteResult {
    Stored,
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PointModifyResult {
    Modified,
    Skipped,
    Error(RuntimeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointDeleteResult {
    Deleted,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteResponse {
    Point { result: PointWriteResult },
    Modify { result: PointModifyResult },
    Delete { result: PointDeleteResult },
}

/// One replicated key/value record with its replication timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackfillAtom {
    pub key: Vec<u8>,
    pub value: Value,
    pub recency: RepliTimestamp,
}

/// One element of a backfill stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BackfillChunk {
    DeleteKey {
        key: Vec<u8>,
        recency: RepliTimestamp,
    },
    DeleteRange {
        region: Region,
    },
    KeyValuePair {
        atom: BackfillAtom,
    },
}

impl Read {
    /// The region this read touches. Range and distribution reads span the
    /// full hash axis over their key range; hash restriction happens during
    /// sharding.
    pub fn get_region(&self) -> Region {
        match self {
            Read::Point(pr) => monokey_region(&pr.key),
            Read::Range(rg) => Region::from_key_range(rg.key_range.clone()),
            Read::Distribution(dg) => Region::from_key_range(dg.range.clone()),
        }
    }

    /// Narrow this read to `region`. Point reads must already match the
    /// region exactly; range and distribution reads take the region's key
    /// range.
    pub fn shard(&self, region: &Region) -> Read {
        match self {
            Read::Point(pr) => {
                debug_assert_eq!(monokey_region(&pr.key), *region);
                Read::Point(pr.clone())
            }
            Read::Range(rg) => {
                debug_assert!(self.get_region().is_superset(region));
                let mut out = rg.clone();
                out.key_range = region.keys.clone();
                Read::Range(out)
            }
            Read::Distribution(dg) => {
                debug_assert!(self.get_region().is_superset(region));
                let mut out = dg.clone();
                out.range = region.keys.clone();
                Read::Distribution(out)
            }
        }
    }

    /// Merge responses coming from different key-range shards.
    pub fn unshard(&self, responses: &[ReadResponse], ctx: &Context) -> ReadResponse {
        match self {
            Read::Point(_) => unshard_point(responses),
            Read::Range(rg) => {
                ReadResponse::Range(unshard_range(rg, &self.get_region(), responses, ctx, false))
            }
            Read::Distribution(_) => {
                assert!(!responses.is_empty());
                let mut merged = BTreeMap::new();
                for response in responses {
                    let piece = distribution_response(response);
                    for (key, count) in &piece.key_counts {
                        let previous = merged.insert(key.clone(), *count);
                        debug_assert!(
                            previous.is_none(),
                            "key-range distribution pieces must be disjoint"
                        );
                    }
                }
                ReadResponse::Distribution(DistributionReadResponse { key_counts: merged })
            }
        }
    }

    /// Merge responses coming from different hash shards of the same key
    /// range.
    pub fn multistore_unshard(&self, responses: &[ReadResponse], ctx: &Context) -> ReadResponse {
        match self {
            Read::Point(_) => unshard_point(responses),
            Read::Range(rg) => {
                ReadResponse::Range(unshard_range(rg, &self.get_region(), responses, ctx, true))
            }
            Read::Distribution(_) => {
                ReadResponse::Distribution(multistore_unshard_distribution(responses))
            }
        }
    }
}

impl Write {
    pub fn get_region(&self) -> Region {
        match self {
            Write::Point(pw) => monokey_region(&pw.key),
            Write::Modify(pm) => monokey_region(&pm.key),
            Write::Delete(pd) => monokey_region(&pd.key),
        }
    }

    /// Point writes only ever cover one key, so sharding is an identity
    /// check.
    pub fn shard(&self, region: &Region) -> Write {
        debug_assert_eq!(self.get_region(), *region);
        self.clone()
    }

    pub fn unshard(&self, responses: &[WriteResponse], _ctx: &Context) -> WriteResponse {
        assert_eq!(responses.len(), 1, "point writes execute on exactly one shard");
        responses[0].clone()
    }

    pub fn multistore_unshard(&self, responses: &[WriteResponse], ctx: &Context) -> WriteResponse {
        self.unshard(responses, ctx)
    }
}

impl BackfillChunk {
    pub fn delete_key(key: Vec<u8>, recency: RepliTimestamp) -> Self {
        BackfillChunk::DeleteKey { key, recency }
    }

    pub fn delete_range(region: Region) -> Self {
        BackfillChunk::DeleteRange { region }
    }

    pub fn set_key(atom: BackfillAtom) -> Self {
        BackfillChunk::KeyValuePair { atom }
    }

    pub fn get_region(&self) -> Region {
        match self {
            BackfillChunk::DeleteKey { key, .. } => monokey_region(key),
            BackfillChunk::DeleteRange { region } => region.clone(),
            BackfillChunk::KeyValuePair { atom } => monokey_region(&atom.key),
        }
    }

    /// Replication timestamp carried by the chunk; delete-range chunks have
    /// none.
    pub fn recency(&self) -> Option<RepliTimestamp> {
        match self {
            BackfillChunk::DeleteKey { recency, .. } => Some(*recency),
            BackfillChunk::DeleteRange { .. } => None,
            BackfillChunk::KeyValuePair { atom } => Some(atom.recency),
        }
    }

    /// Narrow this chunk to `region`. Single-key chunks must already be
    /// covered; delete-range chunks intersect.
    pub fn shard(&self, region: &Region) -> BackfillChunk {
        match self {
            BackfillChunk::DeleteKey { .. } | BackfillChunk::KeyValuePair { .. } => {
                debug_assert!(region.is_superset(&self.get_region()));
                self.clone()
            }
            BackfillChunk::DeleteRange { region: chunk_region } => {
                let narrowed = chunk_region.intersection(region);
                debug_assert!(!narrowed.is_empty());
                BackfillChunk::DeleteRange { region: narrowed }
            }
        }
    }
}

fn unshard_point(responses: &[ReadResponse]) -> ReadResponse {
    assert_eq!(responses.len(), 1, "point reads execute on exactly one shard");
    match &responses[0] {
        point @ ReadResponse::Point(_) => point.clone(),
        other => panic!("expected a point read response, got {other:?}"),
    }
}

fn range_response(response: &ReadResponse) -> &RangeReadResponse {
    match response {
        ReadResponse::Range(rg) => rg,
        other => panic!("expected a range read response, got {other:?}"),
    }
}

fn distribution_response(response: &ReadResponse) -> &DistributionReadResponse {
    match response {
        ReadResponse::Distribution(dstr) => dstr,
        other => panic!("expected a distribution read response, got {other:?}"),
    }
}

fn piece_stream(piece: &RangeReadResponse) -> &Stream {
    match &piece.result {
        RangeResult::Stream(stream) => stream,
        other => panic!("expected a stream piece, got {other:?}"),
    }
}

fn piece_groups(piece: &RangeReadResponse) -> &Groups {
    match &piece.result {
        RangeResult::Groups(groups) => groups,
        other => panic!("expected a grouped piece, got {other:?}"),
    }
}

fn piece_atom(piece: &RangeReadResponse) -> &Value {
    match &piece.result {
        RangeResult::Atom(atom) => atom,
        other => panic!("expected an atom piece, got {other:?}"),
    }
}

fn unshard_range(
    rg: &RangeRead,
    declared: &Region,
    responses: &[ReadResponse],
    ctx: &Context,
    multistore: bool,
) -> RangeReadResponse {
    let mut env = ctx.runtime_environment();
    env.scopes = rg.scopes.clone();
    let pieces: Vec<&RangeReadResponse> = responses.iter().map(range_response).collect();

    let merged = merge_range(rg, &declared.keys, &pieces, multistore, &mut env);
    let (result, truncated, last_considered_key) = match merged {
        Ok(ok) => ok,
        Err(err) => (RangeResult::Error(err), false, declared.keys.left.clone()),
    };

    RangeReadResponse {
        result,
        truncated,
        key_range: declared.keys.clone(),
        last_considered_key,
    }
}

fn merge_range(
    rg: &RangeRead,
    declared: &KeyRange,
    pieces: &[&RangeReadResponse],
    multistore: bool,
    env: &mut crate::context::RuntimeEnvironment,
) -> Result<(RangeResult, bool, Vec<u8>), RuntimeError> {
    // A piece that already failed poisons the merge before anything else.
    for piece in pieces {
        if let RangeResult::Error(err) = &piece.result {
            return Err(err.clone());
        }
    }

    match &rg.terminal {
        None if multistore => Ok(merge_stream_multistore(rg, declared, pieces)),
        None => Ok(merge_stream_ordered(declared, pieces)),
        Some(terminal) => {
            let result = merge_terminal(terminal, pieces, env)?;
            Ok((result, false, declared.left.clone()))
        }
    }
}

/// Key-range pieces arrive in range order; concatenation preserves it. The
/// request's `maximum` is not reapplied when recombining; upstream layers
/// clip the merged stream if they need to.
fn merge_stream_ordered(
    declared: &KeyRange,
    pieces: &[&RangeReadResponse],
) -> (RangeResult, bool, Vec<u8>) {
    let mut stream = Stream::new();
    let mut truncated = false;
    let mut last_considered_key = declared.left.clone();

    for piece in pieces {
        stream.extend(piece_stream(piece).iter().cloned());
        truncated = truncated || piece.truncated;
        if last_considered_key < piece.last_considered_key {
            last_considered_key = piece.last_considered_key.clone();
        }
    }

    (RangeResult::Stream(stream), truncated, last_considered_key)
}

/// Hash shards each return the densest prefix of the keys they hold, so
/// the merged watermark must be the earliest last-considered key among the
/// shards that filled a whole page. Taking anything later would let the
/// next page skip keys held by a sparser shard. Shards that returned fewer
/// than `maximum` rows drained their slice of the range and do not lower
/// the watermark.
fn merge_stream_multistore(
    rg: &RangeRead,
    declared: &KeyRange,
    pieces: &[&RangeReadResponse],
) -> (RangeResult, bool, Vec<u8>) {
    let mut last_considered_key = declared.last_key_in_range();
    for piece in pieces {
        let stream = piece_stream(piece);
        if rg.maximum != 0
            && stream.len() == rg.maximum
            && piece.last_considered_key < last_considered_key
        {
            last_considered_key = piece.last_considered_key.clone();
        }
    }

    let mut stream = Stream::new();
    let mut truncated = false;
    for piece in pieces {
        for (key, value) in piece_stream(piece) {
            // Rows past the merged watermark belong to the next page.
            if *key <= last_considered_key {
                stream.push((key.clone(), value.clone()));
            }
        }
        truncated = truncated || piece.truncated;
    }

    (RangeResult::Stream(stream), truncated, last_considered_key)
}

fn merge_terminal(
    terminal: &Terminal,
    pieces: &[&RangeReadResponse],
    env: &mut crate::context::RuntimeEnvironment,
) -> Result<RangeResult, RuntimeError> {
    let backtrace = Backtrace::new();
    match terminal {
        Terminal::GroupedMapReduce { reduction, .. } => {
            let mut merged = Groups::new();
            for piece in pieces {
                for (group, value) in piece_groups(piece) {
                    let base = ql::eval(&reduction.base, env, &backtrace)?;
                    let acc = merged.get(group).cloned().unwrap_or(base);
                    let folded =
                        ql::eval_reduction_step(reduction, env, acc, value.clone(), &backtrace)?;
                    merged.insert(group.clone(), folded);
                }
            }
            Ok(RangeResult::Groups(merged))
        }
        Terminal::Reduce(reduction) => {
            let mut acc = ql::eval(&reduction.base, env, &backtrace)?;
            for piece in pieces {
                let atom = piece_atom(piece).clone();
                acc = ql::eval_reduction_step(reduction, env, acc, atom, &backtrace)?;
            }
            Ok(RangeResult::Atom(acc))
        }
        Terminal::Length => {
            let mut total = 0u64;
            for piece in pieces {
                match &piece.result {
                    RangeResult::Length { length } => total += length,
                    other => panic!("expected a length piece, got {other:?}"),
                }
            }
            Ok(RangeResult::Length { length: total })
        }
        Terminal::ForEach(_) => {
            let mut total = 0u64;
            for piece in pieces {
                match &piece.result {
                    RangeResult::Inserted { inserted } => total += inserted,
                    other => panic!("expected an inserted piece, got {other:?}"),
                }
            }
            Ok(RangeResult::Inserted { inserted: total })
        }
    }
}

/// Hash pieces sample the same key-range slice, so their key sets overlap
/// heavily. The piece with the fewest sampled keys is kept and its counts
/// are scaled by the ratio of all keys seen to the keys it holds; the
/// ratio is always at least one.
fn multistore_unshard_distribution(responses: &[ReadResponse]) -> DistributionReadResponse {
    assert!(
        responses.len() > 1,
        "hash-shard distribution merges need at least two pieces"
    );
    let pieces: Vec<&DistributionReadResponse> =
        responses.iter().map(distribution_response).collect();

    if let (Some(first), Some(second)) = (
        pieces[0].key_counts.keys().next(),
        pieces[1].key_counts.keys().next(),
    ) {
        debug_assert_eq!(first, second, "hash pieces must share a first key");
    }

    let mut total_num_keys = 0u64;
    let mut selected = 0usize;
    let mut total_keys_in_selected = 0u64;
    for (index, piece) in pieces.iter().enumerate() {
        let piece_total: u64 = piece.key_counts.values().sum();
        total_num_keys += piece_total;
        if index == 0 || piece.key_counts.len() < pieces[selected].key_counts.len() {
            selected = index;
            total_keys_in_selected = piece_total;
        }
    }

    let mut merged = pieces[selected].clone();
    if total_keys_in_selected == 0 {
        return merged;
    }

    let scale_factor = total_num_keys as f64 / total_keys_in_selected as f64;
    debug_assert!(scale_factor >= 1.0);
    for count in merged.key_counts.values_mut() {
        *count = (*count as f64 * scale_factor) as u64;
    }
    merged
}
