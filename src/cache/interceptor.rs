//! Cache-aware dispatch of shard query requests.
//!
//! The interceptor sits between the caller and the real shard execution.
//! A hit returns the decoded cached response without running the query; a
//! miss runs it and stores a successful result on the way back. Every cache
//! fault degrades to running the query uncached.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::engine::QueryResultCache;
use super::keys::build_key;
use super::request::{SearchType, ShardSearchRequest};
use super::response::CacheableResponse;
use super::scope::ScopeSettings;

#[derive(Clone)]
pub struct QueryCacheInterceptor {
    cache: Arc<QueryResultCache>,
    scopes: Arc<dyn ScopeSettings>,
}

impl QueryCacheInterceptor {
    pub fn new(cache: Arc<QueryResultCache>, scopes: Arc<dyn ScopeSettings>) -> Self {
        Self { cache, scopes }
    }

    pub fn cache(&self) -> &Arc<QueryResultCache> {
        &self.cache
    }

    /// Whether `request` may be served from or stored into the cache.
    ///
    /// Scroll and DFS requests are excluded: scroll contexts are stateful and
    /// DFS scores depend on statistics gathered from other shards.
    pub fn can_cache(&self, request: &ShardSearchRequest) -> bool {
        if request.context.is_intercepted() || self.cache.is_closed() {
            return false;
        }

        let index = request.shard.index.as_str();
        if !self.scopes.exists(index) || !self.scopes.is_enabled_for(index) {
            return false;
        }

        request.scroll.is_none()
            && request.search_type != SearchType::DfsQueryThenFetch
            && request.request_cache != Some(false)
    }

    /// Dispatch `request`, going through the cache when it is cacheable.
    #[instrument(skip_all, fields(shard = %request.shard))]
    pub async fn send<R, E, F, Fut>(
        &self,
        request: ShardSearchRequest,
        downstream: F,
    ) -> Result<R, E>
    where
        R: CacheableResponse,
        F: FnOnce(ShardSearchRequest) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if !self.can_cache(&request) {
            return downstream(request).await;
        }
        self.intercept(request, downstream).await
    }

    /// Serve `request` from the cache, or run `downstream` and capture its
    /// result.
    ///
    /// The request handed to `downstream` is marked as intercepted, so a
    /// nested dispatch of the same request passes straight through. A
    /// downstream error is returned unchanged and nothing is cached.
    pub async fn intercept<R, E, F, Fut>(
        &self,
        mut request: ShardSearchRequest,
        downstream: F,
    ) -> Result<R, E>
    where
        R: CacheableResponse,
        F: FnOnce(ShardSearchRequest) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if request.context.is_intercepted() {
            return downstream(request).await;
        }

        let key = match build_key(&request) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "Failed to build cache key, executing uncached");
                return downstream(request).await;
            }
        };
        request.context.mark_intercepted();

        if let Some(bytes) = self.cache.fetch(&key) {
            match R::decode(&bytes) {
                Ok(response) => {
                    self.cache.record_hit();
                    debug!(bytes = bytes.len(), "Served from query result cache");
                    return Ok(response);
                }
                Err(err) => {
                    warn!(error = %err, "Dropping undecodable cache entry");
                    self.cache.invalidate(&key);
                }
            }
        }
        self.cache.record_miss();

        let response = downstream(request).await?;

        if response.timed_out() {
            debug!("Partial result not cached");
            return Ok(response);
        }
        match response.encode() {
            Ok(bytes) => {
                let stored = self.cache.insert(key, bytes);
                debug!(stored, "Captured downstream result");
            }
            Err(err) => warn!(error = %err, "Failed to encode response, not cached"),
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::error::CacheError;
    use crate::cache::reaper::{BackgroundExecutor, Job};
    use crate::cache::request::{SearchSource, ShardId};
    use crate::cache::response::{ScoreDoc, ShardQueryResult};
    use crate::cache::scope::IndexSettingsRegistry;

    struct InlineExecutor;

    impl BackgroundExecutor for InlineExecutor {
        fn execute(&self, job: Job) -> Result<(), CacheError> {
            job();
            Ok(())
        }
    }

    fn interceptor() -> QueryCacheInterceptor {
        let cache = Arc::new(QueryResultCache::new(
            CacheConfig::default(),
            Arc::new(InlineExecutor),
        ));
        let registry = IndexSettingsRegistry::with_enabled(["books"]);
        registry.register("drafts", false);
        QueryCacheInterceptor::new(cache, Arc::new(registry))
    }

    fn request(index: &str) -> ShardSearchRequest {
        ShardSearchRequest::new(
            ShardId::new(index, 0),
            SearchSource {
                query: Some(json!({"term": {"author": "le guin"}})),
                ..Default::default()
            },
        )
    }

    fn result(request: &ShardSearchRequest) -> ShardQueryResult {
        ShardQueryResult {
            total_hits: 1,
            max_score: Some(2.5),
            hits: vec![ScoreDoc {
                doc: 7,
                score: 2.5,
                sort_values: Vec::new(),
            }],
            ..ShardQueryResult::empty(request.shard.clone(), 1)
        }
    }

    #[test]
    fn cacheability_rules() {
        let interceptor = interceptor();

        assert!(interceptor.can_cache(&request("books")));
        assert!(!interceptor.can_cache(&request("drafts")));
        assert!(!interceptor.can_cache(&request("missing")));
        assert!(!interceptor.can_cache(&request("books").with_scroll(Duration::from_secs(60))));
        assert!(
            !interceptor
                .can_cache(&request("books").with_search_type(SearchType::DfsQueryThenFetch))
        );
        assert!(!interceptor.can_cache(&request("books").with_request_cache(false)));
        assert!(interceptor.can_cache(&request("books").with_request_cache(true)));

        let mut nested = request("books");
        nested.context.mark_intercepted();
        assert!(!interceptor.can_cache(&nested));
    }

    #[tokio::test]
    async fn second_identical_request_skips_downstream() {
        let interceptor = interceptor();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let response = interceptor
                .send(request("books"), |req| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    assert!(req.context.is_intercepted());
                    Ok::<_, String>(result(&req))
                })
                .await
                .expect("response");
            assert_eq!(response.total_hits, 1);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = interceptor.cache().stats_snapshot();
        assert_eq!((stats.total, stats.hits, stats.size), (2, 1, 1));
    }

    #[tokio::test]
    async fn downstream_errors_propagate_and_are_not_cached() {
        let interceptor = interceptor();

        let err = interceptor
            .send(request("books"), |_| async {
                Err::<ShardQueryResult, _>("shard failure".to_string())
            })
            .await
            .unwrap_err();

        assert_eq!(err, "shard failure");
        assert!(interceptor.cache().is_empty());
    }

    #[tokio::test]
    async fn timed_out_results_are_not_cached() {
        let interceptor = interceptor();

        let response = interceptor
            .send(request("books"), |req| async move {
                Ok::<_, String>(ShardQueryResult {
                    timed_out: true,
                    ..result(&req)
                })
            })
            .await
            .expect("response");

        assert!(response.timed_out);
        assert!(interceptor.cache().is_empty());
    }

    #[tokio::test]
    async fn undecodable_entry_falls_back_to_downstream() {
        let interceptor = interceptor();
        let key = build_key(&request("books")).expect("key");
        interceptor
            .cache()
            .insert(key.clone(), Bytes::from_static(b"\xffnot a result"));

        let response = interceptor
            .send(request("books"), |req| async move { Ok::<_, String>(result(&req)) })
            .await
            .expect("response");

        assert_eq!(response.hits.len(), 1);
        let stats = interceptor.cache().stats_snapshot();
        assert_eq!((stats.total, stats.hits), (1, 0));

        let cached = interceptor.cache().fetch(&key).expect("re-populated");
        assert_eq!(ShardQueryResult::decode(&cached).expect("decode"), response);
    }

    #[tokio::test]
    async fn field_sorted_results_are_served_from_cache() {
        let interceptor = interceptor();
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let sorted = || {
            let mut req = request("books");
            req.source.sort = vec![json!({"year": "desc"})];
            req
        };

        for _ in 0..3 {
            let response = interceptor
                .send(sorted(), |req| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(ShardQueryResult {
                        max_score: Some(f32::NAN),
                        hits: vec![ScoreDoc {
                            doc: 7,
                            score: f32::NAN,
                            sort_values: vec![json!(2024)],
                        }],
                        ..result(&req)
                    })
                })
                .await
                .expect("response");
            assert!(response.hits[0].score.is_nan());
            assert_eq!(response.hits[0].sort_values, vec![json!(2024)]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = interceptor.cache().stats_snapshot();
        assert_eq!((stats.total, stats.hits, stats.size), (3, 2, 1));
    }

    #[tokio::test]
    async fn intercepted_requests_pass_through() {
        let interceptor = interceptor();
        let mut nested = request("books");
        nested.context.mark_intercepted();

        interceptor
            .intercept(nested, |req| async move { Ok::<_, String>(result(&req)) })
            .await
            .expect("response");

        assert!(interceptor.cache().is_empty());
        assert_eq!(interceptor.cache().stats_snapshot().total, 0);
    }

    #[tokio::test]
    async fn uncacheable_requests_go_straight_downstream() {
        let interceptor = interceptor();

        interceptor
            .send(request("drafts"), |req| async move {
                assert!(!req.context.is_intercepted());
                Ok::<_, String>(result(&req))
            })
            .await
            .expect("response");

        assert!(interceptor.cache().is_empty());
        assert_eq!(interceptor.cache().stats_snapshot().total, 0);
    }
}
