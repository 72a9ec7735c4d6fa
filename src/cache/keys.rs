//! Cache key fingerprints.
//!
//! A key is the serialized `(shard id, normalized search source)` pair. The
//! shard id sits in a fixed binary header so the sweeper can recover the
//! scope from the bytes alone; the body is canonical JSON.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

use super::error::CacheError;
use super::request::{SearchType, ShardId, ShardSearchRequest};

const KEY_FORMAT_VERSION: u8 = 1;
const DEFAULT_FROM: u32 = 0;
const DEFAULT_SIZE: u32 = 10;

/// Bookkeeping bytes charged to every key on top of its serialized length.
pub const KEY_OVERHEAD_BYTES: usize = std::mem::size_of::<Bytes>() + std::mem::size_of::<u64>();

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Immutable request fingerprint. Equality and hashing follow the bytes.
#[derive(Clone)]
pub struct CacheKey {
    bytes: Bytes,
    hash: u64,
}

impl CacheKey {
    pub fn from_bytes(bytes: Bytes) -> Self {
        let hash = hash_value(bytes.as_ref());
        Self { bytes, hash }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Approximate heap footprint of this key.
    pub fn ram_bytes_used(&self) -> usize {
        KEY_OVERHEAD_BYTES + self.bytes.len()
    }

    pub(crate) fn hash_code(&self) -> u64 {
        self.hash
    }

    /// Recover the shard id from the key header.
    ///
    /// Returns `None` for keys that were not written by [`build_key`] or are
    /// truncated; callers treat those as belonging to an unknown scope.
    pub fn shard_id(&self) -> Option<ShardId> {
        let mut buf = self.bytes.as_ref();
        if buf.remaining() < 1 || buf.get_u8() != KEY_FORMAT_VERSION {
            return None;
        }
        if buf.remaining() < 2 {
            return None;
        }
        let index_len = usize::from(buf.get_u16());
        if buf.remaining() < index_len + 4 {
            return None;
        }
        let index = std::str::from_utf8(&buf[..index_len]).ok()?.to_string();
        buf.advance(index_len);
        let shard = buf.get_u32();
        Some(ShardId { index, shard })
    }

    /// The search body portion of the key, for diagnostics.
    pub fn source_json(&self) -> Option<&str> {
        let header = 1 + 2 + usize::from(u16::from_be_bytes(
            self.bytes.get(1..3)?.try_into().ok()?,
        ));
        std::str::from_utf8(self.bytes.get(header + 4..)?).ok()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("shard", &self.shard_id())
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Result-relevant view of a search source.
///
/// `timeout` and routing `preference` are left out, and paging defaults are
/// filled in, so logically identical requests serialize identically.
#[derive(Serialize)]
struct NormalizedSource<'a> {
    search_type: SearchType,
    query: Option<&'a Value>,
    post_filter: Option<&'a Value>,
    from: u32,
    size: u32,
    sort: &'a [Value],
    search_after: &'a [Value],
    aggregations: Option<&'a Value>,
    source_filter: Option<&'a Value>,
    min_score: Option<f32>,
    track_total_hits: Option<bool>,
}

impl<'a> NormalizedSource<'a> {
    fn from_request(request: &'a ShardSearchRequest) -> Self {
        let source = &request.source;
        Self {
            search_type: request.search_type,
            query: source.query.as_ref(),
            post_filter: source.post_filter.as_ref(),
            from: source.from.unwrap_or(DEFAULT_FROM),
            size: source.size.unwrap_or(DEFAULT_SIZE),
            sort: &source.sort,
            search_after: &source.search_after,
            aggregations: source.aggregations.as_ref(),
            source_filter: source.source_filter.as_ref(),
            min_score: source.min_score,
            track_total_hits: source.track_total_hits,
        }
    }
}

/// Build the cache key for a shard request.
pub fn build_key(request: &ShardSearchRequest) -> Result<CacheKey, CacheError> {
    let index = request.shard.index.as_bytes();
    let index_len = u16::try_from(index.len()).map_err(|_| {
        CacheError::serialization(
            "cache key",
            format!("index name is {} bytes, limit is {}", index.len(), u16::MAX),
        )
    })?;

    let body = serde_json::to_vec(&NormalizedSource::from_request(request))
        .map_err(|err| CacheError::serialization("cache key", err.to_string()))?;

    let mut buf = BytesMut::with_capacity(1 + 2 + index.len() + 4 + body.len());
    buf.put_u8(KEY_FORMAT_VERSION);
    buf.put_u16(index_len);
    buf.put_slice(index);
    buf.put_u32(request.shard.shard);
    buf.put_slice(&body);

    Ok(CacheKey::from_bytes(buf.freeze()))
}
