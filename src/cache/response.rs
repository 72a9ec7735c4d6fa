//! Serialized shard responses.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CacheError;
use super::request::ShardId;

/// A response type the interceptor can keep in the cache.
///
/// Encoding must round-trip: `decode(encode(r)) == r`.
pub trait CacheableResponse: Sized {
    fn encode(&self) -> Result<Bytes, CacheError>;

    fn decode(bytes: &[u8]) -> Result<Self, CacheError>;

    /// Partial results are never cached.
    fn timed_out(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDoc {
    pub doc: u32,
    /// NaN when the query sorts by field and scores are not tracked.
    #[serde(with = "score_format")]
    pub score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_values: Vec<Value>,
}

/// Query-phase result of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardQueryResult {
    pub shard: ShardId,
    pub request_id: u64,
    pub total_hits: u64,
    #[serde(default, with = "score_format::option")]
    pub max_score: Option<f32>,
    pub hits: Vec<ScoreDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Value>,
    #[serde(default)]
    pub timed_out: bool,
}

/// JSON has no NaN or infinities, so non-finite scores are written as
/// strings and read back exactly.
mod score_format {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum ScoreRepr {
        Finite(f32),
        Special(String),
    }

    impl From<f32> for ScoreRepr {
        fn from(score: f32) -> Self {
            if score.is_finite() {
                Self::Finite(score)
            } else if score.is_nan() {
                Self::Special(NAN.to_string())
            } else if score > 0.0 {
                Self::Special(INFINITY.to_string())
            } else {
                Self::Special(NEG_INFINITY.to_string())
            }
        }
    }

    impl ScoreRepr {
        fn into_score(self) -> Result<f32, String> {
            match self {
                Self::Finite(score) => Ok(score),
                Self::Special(text) => match text.as_str() {
                    NAN => Ok(f32::NAN),
                    INFINITY => Ok(f32::INFINITY),
                    NEG_INFINITY => Ok(f32::NEG_INFINITY),
                    other => Err(format!("invalid score `{other}`")),
                },
            }
        }
    }

    pub fn serialize<S: Serializer>(score: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        ScoreRepr::from(*score).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        ScoreRepr::deserialize(deserializer)?
            .into_score()
            .map_err(D::Error::custom)
    }

    pub mod option {
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        use super::ScoreRepr;

        pub fn serialize<S: Serializer>(
            score: &Option<f32>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            score.map(ScoreRepr::from).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f32>, D::Error> {
            Option::<ScoreRepr>::deserialize(deserializer)?
                .map(ScoreRepr::into_score)
                .transpose()
                .map_err(D::Error::custom)
        }
    }
}

impl ShardQueryResult {
    pub fn empty(shard: ShardId, request_id: u64) -> Self {
        Self {
            shard,
            request_id,
            total_hits: 0,
            max_score: None,
            hits: Vec::new(),
            aggregations: None,
            timed_out: false,
        }
    }
}

impl CacheableResponse for ShardQueryResult {
    fn encode(&self) -> Result<Bytes, CacheError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| CacheError::serialization("shard query result", err.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(bytes)
            .map_err(|err| CacheError::serialization("shard query result", err.to_string()))
    }

    fn timed_out(&self) -> bool {
        self.timed_out
    }
}
