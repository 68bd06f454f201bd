//! Per-instance cache and background refresh

use super::info::ConnectionInfo;
use super::rate_limiter::RateLimiter;
use super::refresh::{refresh_delay, retry_backoff, Refresher};
use crate::client::InstanceName;
use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<ConnectionInfo>>>>;

/// Refresh state of an instance cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// No refresh running
    Idle,
    /// A refresh is in flight
    Refreshing,
    /// The cache was closed
    Closed,
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Refreshing => write!(f, "refreshing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Default)]
struct Inner {
    current: Option<Arc<ConnectionInfo>>,
    in_flight: Option<RefreshFuture>,
    in_flight_abort: Option<AbortHandle>,
    scheduled: Option<CancellationToken>,
    failures: u32,
    closed: bool,
}

/// Keeps a valid [`ConnectionInfo`] for one instance and IAM setting
///
/// At most one refresh runs at a time; every caller arriving while it runs
/// waits on the same result. After a successful refresh the next one is
/// scheduled ahead of expiry.
pub struct InstanceCache {
    instance: InstanceName,
    iam_authn: bool,
    refresher: Arc<Refresher>,
    limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
    inner: Mutex<Inner>,
}

impl InstanceCache {
    /// Create an empty cache; nothing is fetched until first use
    pub fn new(instance: InstanceName, iam_authn: bool, refresher: Arc<Refresher>) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter::new(refresher.rate_limit()));
        Arc::new(Self {
            instance,
            iam_authn,
            refresher,
            limiter,
            shutdown: CancellationToken::new(),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Instance this cache serves
    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    /// Whether bundles are issued for IAM database authentication
    pub fn iam_authn(&self) -> bool {
        self.iam_authn
    }

    /// Current refresh state
    pub fn state(&self) -> RefreshState {
        let inner = self.lock();
        if inner.closed {
            RefreshState::Closed
        } else if inner.in_flight.is_some() {
            RefreshState::Refreshing
        } else {
            RefreshState::Idle
        }
    }

    /// Currently cached bundle, expired or not, without triggering a refresh
    pub fn cached(&self) -> Option<Arc<ConnectionInfo>> {
        self.lock().current.clone()
    }

    /// Consecutive failed refreshes since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().failures
    }

    /// Return a usable bundle, waiting for a refresh if there is none.
    ///
    /// # Errors
    ///
    /// The refresh error if the refresh this call waited on failed,
    /// [`Error::Cancelled`] if `cancel` fired first, [`Error::Closed`] if the
    /// cache is or gets closed.
    pub async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<Arc<ConnectionInfo>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let refresh = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
            if let Some(info) = &inner.current {
                if !info.is_expired() {
                    return Ok(info.clone());
                }
                tracing::debug!(instance = %self.instance, "cached connection info expired");
            }
            self.start_refresh(&mut inner)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.shutdown.cancelled() => Err(Error::Closed),
            result = refresh => result,
        }
    }

    /// Drop the current bundle and refresh immediately.
    ///
    /// Joins the running refresh instead of starting another one.
    pub fn force_refresh(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        tracing::debug!(instance = %self.instance, "forcing refresh");
        inner.current = None;
        self.start_refresh(&mut inner);
    }

    /// Start populating the cache without waiting for it
    pub fn warmup(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.closed || inner.in_flight.is_some() {
            return;
        }
        if inner.current.as_ref().is_some_and(|info| !info.is_expired()) {
            return;
        }
        self.start_refresh(&mut inner);
    }

    /// Stop all refresh activity and release the cached bundle.
    ///
    /// Waiters receive [`Error::Closed`]. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.current = None;
            inner.in_flight = None;
            if let Some(abort) = inner.in_flight_abort.take() {
                abort.abort();
            }
            if let Some(token) = inner.scheduled.take() {
                token.cancel();
            }
        }
        self.shutdown.cancel();
        tracing::debug!(instance = %self.instance, iam_authn = self.iam_authn, "instance cache closed");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Join the in-flight refresh or spawn a new one
    fn start_refresh(self: &Arc<Self>, inner: &mut Inner) -> RefreshFuture {
        if let Some(refresh) = &inner.in_flight {
            return refresh.clone();
        }
        if let Some(token) = inner.scheduled.take() {
            token.cancel();
        }

        let weak = Arc::downgrade(self);
        let refresher = self.refresher.clone();
        let limiter = self.limiter.clone();
        let instance = self.instance.clone();
        let iam_authn = self.iam_authn;
        let span = tracing::info_span!("refresh", instance = %instance, iam_authn);

        let handle = tokio::spawn(
            async move {
                tracing::debug!("refresh started");
                let result = refresher
                    .refresh(&instance, iam_authn, &limiter)
                    .await
                    .map(Arc::new);
                match weak.upgrade() {
                    Some(cache) => cache.complete_refresh(result),
                    None => result,
                }
            }
            .instrument(span),
        );
        inner.in_flight_abort = Some(handle.abort_handle());

        let instance = self.instance.clone();
        let refresh = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(Error::Closed),
                Err(e) => Err(Error::refresh(instance, "refresh task failed", e)),
            }
        }
        .boxed()
        .shared();

        inner.in_flight = Some(refresh.clone());
        refresh
    }

    fn complete_refresh(self: &Arc<Self>, result: Result<Arc<ConnectionInfo>>) -> Result<Arc<ConnectionInfo>> {
        let mut inner = self.lock();
        inner.in_flight = None;
        inner.in_flight_abort = None;
        if inner.closed {
            return Err(Error::Closed);
        }

        let now = SystemTime::now();
        match &result {
            Ok(info) => {
                inner.current = Some(info.clone());
                inner.failures = 0;
                let delay = refresh_delay(now, info.expiration());
                tracing::info!(
                    fingerprint = %info.fingerprint(),
                    next_refresh_secs = delay.as_secs(),
                    "refresh succeeded"
                );
                self.schedule(&mut inner, delay);
            }
            Err(err) => {
                inner.failures += 1;
                let remaining = inner
                    .current
                    .as_ref()
                    .and_then(|info| info.expiration().duration_since(now).ok())
                    .filter(|remaining| !remaining.is_zero());
                match remaining {
                    Some(remaining) => {
                        let delay = retry_backoff(inner.failures, remaining);
                        tracing::warn!(
                            error = %err,
                            failures = inner.failures,
                            retry_secs = delay.as_secs(),
                            "refresh failed, serving cached connection info"
                        );
                        self.schedule(&mut inner, delay);
                    }
                    None => {
                        tracing::debug!(error = %err, failures = inner.failures, "refresh failed");
                    }
                }
            }
        }
        result
    }

    fn schedule(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        if let Some(previous) = inner.scheduled.take() {
            previous.cancel();
        }
        let token = self.shutdown.child_token();
        inner.scheduled = Some(token.clone());

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(cache) = weak.upgrade() {
                        cache.scheduled_refresh(&token);
                    }
                }
            }
        });
    }

    fn scheduled_refresh(self: &Arc<Self>, token: &CancellationToken) {
        let mut inner = self.lock();
        if inner.closed || token.is_cancelled() {
            return;
        }
        inner.scheduled = None;
        self.start_refresh(&mut inner);
    }
}

impl fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCache")
            .field("instance", &self.instance)
            .field("iam_authn", &self.iam_authn)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for InstanceCache {
    fn drop(&mut self) {
        self.close();
    }
}
