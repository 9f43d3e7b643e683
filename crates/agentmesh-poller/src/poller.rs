//! Rate-limited request queue in front of the log's read path.
//!
//! One FIFO queue and one backoff delay per topic. At most one request per
//! topic is in flight; topics drain independently on their own tasks.
//! Rate-limit rejections are re-queued at the tail after a backoff pause and
//! never reach the caller. Any other error fails the request immediately.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentmesh_core::types::TopicId;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::cache::TtlCache;
use crate::transport::TransportError;

// ─── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub backoff: BackoffPolicy,
    /// How long a successful result is served from cache (default 5s).
    pub cache_ttl: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cache_ttl: Duration::from_secs(5),
        }
    }
}

// ─── Internals ───────────────────────────────────────────────────────

type RequestFn<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<T, TransportError>> + Send>;

struct Job<T> {
    key: String,
    request: RequestFn<T>,
    reply: oneshot::Sender<Result<T, TransportError>>,
    attempts: u32,
}

struct Lane<T> {
    queue: VecDeque<Job<T>>,
    backoff: Backoff,
    /// A drain task currently owns this lane.
    draining: bool,
}

struct Shared<T> {
    config: PollerConfig,
    lanes: Mutex<HashMap<TopicId, Lane<T>>>,
    cache: Mutex<TtlCache<(TopicId, String), T>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Poller ──────────────────────────────────────────────────────────

/// Cloneable handle; clones share queues, backoff state, and cache.
pub struct RateLimitedPoller<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RateLimitedPoller<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> RateLimitedPoller<T> {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                lanes: Mutex::new(HashMap::new()),
                cache: Mutex::new(TtlCache::new(config.cache_ttl)),
            }),
        }
    }

    /// Run `request` on `topic`'s queue and wait for its result.
    ///
    /// `key` identifies the request payload for caching: a fresh cached
    /// result under `(topic, key)` is returned without issuing a request.
    /// `request` may be invoked more than once if the log rate-limits it.
    pub async fn enqueue<F, Fut>(
        &self,
        topic: TopicId,
        key: impl Into<String>,
        mut request: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let key = key.into();
        if let Some(hit) = self.cached(&topic, &key) {
            debug!(%topic, key = %key, "poller cache hit");
            return Ok(hit);
        }

        let (reply, rx) = oneshot::channel();
        let job = Job {
            key,
            request: Box::new(move || -> BoxFuture<'static, Result<T, TransportError>> {
                Box::pin(request())
            }),
            reply,
            attempts: 0,
        };

        let start_drain = {
            let mut lanes = lock(&self.shared.lanes);
            let lane = lanes.entry(topic.clone()).or_insert_with(|| Lane {
                queue: VecDeque::new(),
                backoff: Backoff::new(self.shared.config.backoff),
                draining: false,
            });
            lane.queue.push_back(job);
            !std::mem::replace(&mut lane.draining, true)
        };

        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.shared), topic.clone()));
        }

        rx.await.unwrap_or_else(|_| {
            Err(TransportError::Unavailable(format!(
                "request on {topic} dropped by poller"
            )))
        })
    }

    fn cached(&self, topic: &TopicId, key: &str) -> Option<T> {
        let cache = lock(&self.shared.cache);
        cache
            .get(&(topic.clone(), key.to_owned()), Instant::now())
            .cloned()
    }

    /// Evict expired cache entries. Returns the number evicted.
    pub fn sweep_cache(&self) -> usize {
        lock(&self.shared.cache).sweep(Instant::now())
    }

    /// Current backoff delay for `topic` (base delay if never used).
    pub fn backoff_delay(&self, topic: &TopicId) -> Duration {
        lock(&self.shared.lanes)
            .get(topic)
            .map_or(self.shared.config.backoff.base_delay, |lane| {
                lane.backoff.current()
            })
    }

    /// Requests waiting on `topic`, excluding one in flight.
    pub fn queued(&self, topic: &TopicId) -> usize {
        lock(&self.shared.lanes)
            .get(topic)
            .map_or(0, |lane| lane.queue.len())
    }

    /// Periodically sweep the cache until `cancel` fires.
    pub fn spawn_cache_sweeper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = poller.sweep_cache();
                        if evicted > 0 {
                            debug!(evicted, "poller cache sweep");
                        }
                    }
                }
            }
        })
    }
}

/// Drain one topic's queue. Exactly one drain task exists per non-empty lane.
async fn drain<T: Clone + Send + 'static>(shared: Arc<Shared<T>>, topic: TopicId) {
    loop {
        let mut job = {
            let mut lanes = lock(&shared.lanes);
            let Some(lane) = lanes.get_mut(&topic) else {
                return;
            };
            match lane.queue.pop_front() {
                Some(job) => job,
                None => {
                    lane.draining = false;
                    return;
                }
            }
        };

        if job.reply.is_closed() {
            continue;
        }

        // An identical request may have completed while this one waited.
        let cache_key = (topic.clone(), job.key.clone());
        if let Some(hit) = lock(&shared.cache).get(&cache_key, Instant::now()).cloned() {
            let _ = job.reply.send(Ok(hit));
            continue;
        }

        job.attempts += 1;
        let result = (job.request)().await;

        match result {
            Ok(value) => {
                if let Some(lane) = lock(&shared.lanes).get_mut(&topic) {
                    lane.backoff.on_success();
                }
                lock(&shared.cache).insert(cache_key, value.clone(), Instant::now());
                let _ = job.reply.send(Ok(value));
            }
            Err(TransportError::RateLimited(_)) => {
                let delay = {
                    let mut lanes = lock(&shared.lanes);
                    let Some(lane) = lanes.get_mut(&topic) else {
                        return;
                    };
                    let delay = lane.backoff.on_rate_limited();
                    lane.queue.push_back(job);
                    delay
                };
                warn!(%topic, delay_ms = delay.as_millis() as u64, "log rate limit hit, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                debug!(%topic, attempts = job.attempts, error = %err, "log request failed");
                let _ = job.reply.send(Err(err));
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
