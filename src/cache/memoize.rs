//! Async function-result memoization.
//!
//! [`Memoizer::compute`] wraps an argument-less async worker behind a cache
//! key. On a hit the stored value is returned (optionally overridden by an
//! `on_cached` hook) without running the worker. On a miss the worker runs
//! inside [`retry_with_backoff`]; its result is written back with the
//! configured expiry and tags.
//!
//! Failure handling, in order:
//!
//! 1. `reject_as` configured: the fallback value is cached and returned on the
//!    first failure, no retries.
//! 2. Retries left: `on_retry` may resolve with a value (not cached), abort
//!    with an error, or let the next attempt run after the retry delay.
//! 3. Exhausted: the last error is returned.
//!
//! A failed store write after a successful worker run counts as a failed
//! attempt, exactly like a worker error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use super::config::{CacheConfig, ConfigLoadError};
use super::key::CacheKey;
use super::registry::StoreRegistry;
use super::retry::{Backoff, retry_with_backoff};
use super::store::{CacheStore, StoreError};

/// Delay before the first retry when none is configured.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Invalid memoization settings. Never retried.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("memoized computation requires a non-empty id")]
    MissingId,

    #[error("retry delay for attempt {attempt} is not a finite, non-negative number of milliseconds: {millis}")]
    InvalidDelay { attempt: u32, millis: f64 },
}

/// Errors surfaced by [`Memoizer::compute`].
#[derive(Debug, Error)]
pub enum MemoError<E> {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker failed: {0}")]
    Worker(#[source] E),

    #[error("retry aborted: {0}")]
    Aborted(#[source] E),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cached value codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Outcome of an `on_retry` hook.
#[derive(Debug)]
pub enum RetryDecision<T, E> {
    /// Run the next attempt after the retry delay.
    Continue,
    /// Stop retrying and resolve with this value. The value is not cached.
    Resolve(T),
    /// Stop retrying and fail with [`MemoError::Aborted`].
    Abort(E),
}

pub type OnCached<T, E> = Arc<dyn Fn(&MemoSettings<T, E>, &T) -> Option<T> + Send + Sync>;
pub type OnRetry<T, E> = Arc<dyn Fn(&MemoError<E>, u32) -> RetryDecision<T, E> + Send + Sync>;
pub type DelayFn<T, E> = Arc<dyn Fn(u32, &MemoSettings<T, E>) -> f64 + Send + Sync>;

/// How long to wait before retry number `attempt` (1-based).
pub enum RetryDelay<T, E> {
    Fixed(Duration),
    /// `base * attempt`
    Linear(Duration),
    /// `initial * 2^(attempt - 1)`, capped at `max`
    Exponential { initial: Duration, max: Duration },
    /// Milliseconds computed per attempt; must be finite and non-negative.
    Dynamic(DelayFn<T, E>),
}

impl<T, E> RetryDelay<T, E> {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(u32, &MemoSettings<T, E>) -> f64 + Send + Sync + 'static,
    {
        RetryDelay::Dynamic(Arc::new(f))
    }

    fn delay_for(&self, attempt: u32, settings: &MemoSettings<T, E>) -> Result<Duration, ConfigError> {
        match self {
            RetryDelay::Fixed(delay) => Ok(*delay),
            RetryDelay::Linear(base) => Ok(base.saturating_mul(attempt)),
            RetryDelay::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                Ok(initial.saturating_mul(factor).min(*max))
            }
            RetryDelay::Dynamic(f) => {
                let millis = f(attempt, settings);
                Duration::try_from_secs_f64(millis / 1_000.0)
                    .map_err(|_| ConfigError::InvalidDelay { attempt, millis })
            }
        }
    }
}

impl<T, E> fmt::Debug for RetryDelay<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::Linear(d) => f.debug_tuple("Linear").field(d).finish(),
            RetryDelay::Exponential { initial, max } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max", max)
                .finish(),
            RetryDelay::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Per-call memoization settings.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttp_cache::cache::{MemoSettings, RetryDelay};
///
/// let settings: MemoSettings<String, std::io::Error> = MemoSettings::new("report:daily")
///     .expiry(Duration::from_secs(600))
///     .retry(3)
///     .retry_delay(RetryDelay::Exponential {
///         initial: Duration::from_millis(200),
///         max: Duration::from_secs(5),
///     })
///     .tag("reports");
/// assert_eq!(settings.id(), "report:daily");
/// ```
pub struct MemoSettings<T, E> {
    id: String,
    enabled: bool,
    expiry: Option<Duration>,
    reject_as: Option<T>,
    retry: u32,
    retry_delay: RetryDelay<T, E>,
    tags: Vec<String>,
    on_cached: Option<OnCached<T, E>>,
    on_retry: Option<OnRetry<T, E>>,
}

impl<T, E> MemoSettings<T, E> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            expiry: None,
            reject_as: None,
            retry: 0,
            retry_delay: RetryDelay::Fixed(DEFAULT_RETRY_DELAY),
            tags: Vec::new(),
            on_cached: None,
            on_retry: None,
        }
    }

    /// When disabled the worker runs once and the store is never touched.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Expiry for the stored value; defaults to the memoizer's TTL.
    #[must_use]
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Value to cache and resolve with on the first failure.
    ///
    /// Presence is what counts: for `T = Option<_>`, `reject_as(None)` caches
    /// `None`.
    #[must_use]
    pub fn reject_as(mut self, value: T) -> Self {
        self.reject_as = Some(value);
        self
    }

    /// Number of retries after the first failed attempt.
    #[must_use]
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: RetryDelay<T, E>) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Labels the stored value for [`CacheStore::invalidate`].
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Called on every hit; a `Some` return supersedes the cached value.
    #[must_use]
    pub fn on_cached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MemoSettings<T, E>, &T) -> Option<T> + Send + Sync + 'static,
    {
        self.on_cached = Some(Arc::new(hook));
        self
    }

    /// Called before each retry with the failure and the 1-based retry number.
    #[must_use]
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MemoError<E>, u32) -> RetryDecision<T, E> + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn retries(&self) -> u32 {
        self.retry
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    fn decide(&self, err: MemoError<E>, attempt: u32) -> Backoff<T, MemoError<E>>
    where
        E: fmt::Display,
    {
        let decision = match &self.on_retry {
            Some(hook) => hook(&err, attempt),
            None => RetryDecision::Continue,
        };

        match decision {
            RetryDecision::Continue => match self.retry_delay.delay_for(attempt, self) {
                Ok(delay) => {
                    warn!(key = %self.id, attempt, max_retries = self.retry, ?delay, error = %err, "memoized worker failed: retrying");
                    Backoff::Retry(delay)
                }
                Err(config) => Backoff::Fail(config.into()),
            },
            RetryDecision::Resolve(value) => {
                debug!(key = %self.id, attempt, error = %err, "retry hook resolved a value");
                Backoff::Resolve(value)
            }
            RetryDecision::Abort(abort) => {
                warn!(key = %self.id, attempt, error = %err, "retry hook aborted memoized worker");
                Backoff::Fail(MemoError::Aborted(abort))
            }
        }
    }
}

/// Memoization input: a bare id with default settings, or full settings.
pub enum MemoInput<T, E> {
    BareId(String),
    Config(MemoSettings<T, E>),
}

impl<T, E> MemoInput<T, E> {
    fn into_settings(self) -> MemoSettings<T, E> {
        match self {
            MemoInput::BareId(id) => MemoSettings::new(id),
            MemoInput::Config(settings) => settings,
        }
    }
}

impl<T, E> From<&str> for MemoInput<T, E> {
    fn from(id: &str) -> Self {
        MemoInput::BareId(id.to_owned())
    }
}

impl<T, E> From<String> for MemoInput<T, E> {
    fn from(id: String) -> Self {
        MemoInput::BareId(id)
    }
}

impl<T, E> From<CacheKey> for MemoInput<T, E> {
    fn from(key: CacheKey) -> Self {
        MemoInput::BareId(key.into_string())
    }
}

impl<T, E> From<MemoSettings<T, E>> for MemoInput<T, E> {
    fn from(settings: MemoSettings<T, E>) -> Self {
        MemoInput::Config(settings)
    }
}

/// Memoizes async computations in a shared [`CacheStore`].
///
/// Concurrent misses on one id are not coalesced: each caller runs the worker
/// and the last write wins.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_cache::cache::{MemoryStore, Memoizer};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let memo = Memoizer::new(Arc::new(MemoryStore::new()));
///
/// let first: u32 = memo
///     .compute("answer", || async { Ok::<_, std::io::Error>(42) })
///     .await
///     .unwrap();
/// let second: u32 = memo
///     .compute("answer", || async { Ok::<_, std::io::Error>(0) })
///     .await
///     .unwrap();
/// assert_eq!((first, second), (42, 42));
/// # }
/// ```
#[derive(Clone)]
pub struct Memoizer {
    store: Arc<dyn CacheStore>,
    default_expiry: Option<Duration>,
}

impl Memoizer {
    /// Creates a memoizer whose values never expire unless a call sets an expiry.
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            default_expiry: None,
        }
    }

    /// Sets the expiry used when a call does not configure one.
    #[must_use]
    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = Some(expiry);
        self
    }

    /// Memoizes into the registry's active store, expiring after the configured
    /// default TTL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigLoadError::InvalidTtl`] if `default_ttl` does not parse.
    pub fn from_registry(registry: &StoreRegistry, config: &CacheConfig) -> Result<Self, ConfigLoadError> {
        Ok(Self::new(registry.active()).with_default_expiry(config.default_ttl()?))
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Returns the cached value for the input's id, or runs `worker` to produce it.
    ///
    /// `worker` is a factory: it is invoked afresh for every attempt.
    ///
    /// # Errors
    ///
    /// - [`MemoError::Config`] for an empty id or an invalid computed delay.
    /// - [`MemoError::Worker`] / [`MemoError::Store`] with the last failure once
    ///   retries are exhausted (or immediately when disabled).
    /// - [`MemoError::Aborted`] when `on_retry` aborts.
    /// - [`MemoError::Store`] / [`MemoError::Codec`] when reading the cached
    ///   value fails.
    pub async fn compute<T, E, W, Fut>(
        &self,
        input: impl Into<MemoInput<T, E>>,
        worker: W,
    ) -> Result<T, MemoError<E>>
    where
        T: Serialize + DeserializeOwned + Clone,
        E: fmt::Display,
        W: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let settings = input.into().into_settings();
        if settings.id.is_empty() {
            return Err(ConfigError::MissingId.into());
        }

        if !settings.enabled {
            debug!(key = %settings.id, "memoization disabled: running worker directly");
            return worker().await.map_err(MemoError::Worker);
        }

        if let Some(stored) = self.store.get(&settings.id).await? {
            let value: T = serde_json::from_value(stored)?;
            debug!(key = %settings.id, outcome = "hit", "memoized value");
            return Ok(match &settings.on_cached {
                Some(hook) => hook(&settings, &value).unwrap_or(value),
                None => value,
            });
        }

        debug!(key = %settings.id, outcome = "miss", "memoized value");
        let expiry = settings.expiry.or(self.default_expiry);
        let max_retries = if settings.reject_as.is_some() {
            0
        } else {
            settings.retry
        };

        let settings = &settings;
        let worker = &worker;
        let outcome = retry_with_backoff(
            max_retries,
            move |attempt| async move {
                debug!(key = %settings.id, attempt, "running memoized worker");
                let value = worker().await.map_err(MemoError::Worker)?;
                self.store
                    .set_tagged(&settings.id, serde_json::to_value(&value)?, expiry, &settings.tags)
                    .await?;
                Ok::<T, MemoError<E>>(value)
            },
            |err, attempt| settings.decide(err, attempt),
        )
        .await;

        match (outcome, &settings.reject_as) {
            (Err(err), Some(fallback)) => {
                warn!(key = %settings.id, error = %err, "memoized worker failed: caching fallback value");
                self.store
                    .set_tagged(&settings.id, serde_json::to_value(fallback)?, expiry, &settings.tags)
                    .await?;
                Ok(fallback.clone())
            }
            (outcome, _) => outcome,
        }
    }
}
