//! Dialer: the entry point tying names, caches and TLS dialing together

use super::instance_name::InstanceName;
use super::options::{DialConfig, DialOption};
use crate::admin::ControlPlane;
use crate::auth::{ServiceAccountKey, ServiceAccountTokenSource, TokenSource, ADMIN_SCOPE, LOGIN_SCOPE};
use crate::cache::{InstanceCache, RateLimit, Refresher, DEFAULT_REFRESH_TIMEOUT};
use crate::connection::{
    self, FnDialer, InstanceStream, Stream, TcpDialer, TransportDialer, DEFAULT_DIAL_TIMEOUT,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Environment variable naming a service account key file
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

type CacheKey = (InstanceName, bool);

enum Credentials {
    Json(Vec<u8>),
    File(PathBuf),
}

impl Credentials {
    fn load(&self) -> Result<ServiceAccountKey> {
        let key = match self {
            Credentials::Json(json) => ServiceAccountKey::from_json(json),
            Credentials::File(path) => ServiceAccountKey::from_file(path),
        };
        key.map_err(|e| Error::config("", e.to_string()))
    }
}

// Where refresh tokens come from once the builder settles credentials
enum Auth {
    Source(Arc<dyn TokenSource>),
    Key(ServiceAccountKey),
}

/// Builder for [`Dialer`]
///
/// # Examples
///
/// ```no_run
/// # fn example(control_plane: impl cloudsql_connector::ControlPlane) -> cloudsql_connector::Result<()> {
/// use cloudsql_connector::{DialOption, Dialer};
/// use std::time::Duration;
///
/// let dialer = Dialer::builder(control_plane)
///     .credentials_file("/etc/keys/service-account.json")
///     .default_dial_options([DialOption::PrivateIp])
///     .refresh_timeout(Duration::from_secs(30))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct DialerBuilder {
    control_plane: Arc<dyn ControlPlane>,
    token_source: Option<Arc<dyn TokenSource>>,
    credentials: Option<Credentials>,
    iam_authn: bool,
    default_options: Vec<DialOption>,
    refresh_timeout: Duration,
    dial_timeout: Duration,
    rate_limit: RateLimit,
    transport: Option<Arc<dyn TransportDialer>>,
    user_agent: Option<String>,
}

impl DialerBuilder {
    fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            control_plane,
            token_source: None,
            credentials: None,
            iam_authn: false,
            default_options: Vec::new(),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            rate_limit: RateLimit::default(),
            transport: None,
            user_agent: None,
        }
    }

    /// Authorize control-plane calls with tokens from `source`
    pub fn token_source(mut self, source: impl TokenSource) -> Self {
        self.token_source = Some(Arc::new(source));
        self
    }

    /// Authorize control-plane calls with a service account key given as JSON
    pub fn credentials_json(mut self, json: impl Into<Vec<u8>>) -> Self {
        self.credentials = Some(Credentials::Json(json.into()));
        self
    }

    /// Authorize control-plane calls with a service account key file
    pub fn credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = Some(Credentials::File(path.into()));
        self
    }

    /// Use IAM database authentication unless a dial says otherwise
    pub fn iam_authn(mut self, enabled: bool) -> Self {
        self.iam_authn = enabled;
        self
    }

    /// Options applied to every dial before its own options
    pub fn default_dial_options<I>(mut self, opts: I) -> Self
    where
        I: IntoIterator<Item = DialOption>,
    {
        self.default_options.extend(opts);
        self
    }

    /// Bound on one refresh
    ///
    /// Default: 60 seconds
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Bound on transport connect plus TLS handshake
    ///
    /// Default: 30 seconds
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Allow `burst` back-to-back refreshes per instance, then one per `interval`
    ///
    /// Default: 2, then one every 30 seconds
    pub fn refresh_rate_limit(mut self, burst: u32, interval: Duration) -> Self {
        self.rate_limit = RateLimit::new(burst, interval);
        self
    }

    /// Open raw connections with `f` instead of plain TCP
    ///
    /// `f` receives the `host:port` of the instance.
    pub fn dial_func<F, Fut, S>(self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<S>> + Send + 'static,
        S: Stream,
    {
        self.transport(FnDialer::new(f))
    }

    /// Open raw connections with a custom transport
    pub fn transport(mut self, transport: impl TransportDialer) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Append `agent` to the user agent reported to the control-plane
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Build the dialer
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if no credentials are available, if both a token
    /// source and a service account key are given, or if the key is invalid.
    pub fn build(self) -> Result<Dialer> {
        let auth = match (self.token_source, self.credentials) {
            (Some(_), Some(_)) => {
                return Err(Error::config(
                    "",
                    "a token source and service account credentials cannot be used together",
                ))
            }
            (Some(source), None) => Auth::Source(source),
            (None, Some(credentials)) => Auth::Key(credentials.load()?),
            (None, None) => match std::env::var_os(CREDENTIALS_ENV) {
                Some(path) => Auth::Key(Credentials::File(PathBuf::from(path)).load()?),
                None => {
                    return Err(Error::config(
                        "",
                        format!(
                            "no credentials configured: set a token source, a service account key, or {}",
                            CREDENTIALS_ENV
                        ),
                    ))
                }
            },
        };

        let user_agent = match self.user_agent {
            Some(extra) => format!("{} {}", crate::USER_AGENT, extra),
            None => crate::USER_AGENT.to_string(),
        };
        let refresher = match auth {
            Auth::Source(source) => Refresher::new(self.control_plane, source),
            Auth::Key(key) => {
                // IAM certificates embed the token, which then needs the login
                // scope even if only some dials ask for IAM authentication
                let iam_source = service_account_source(key.clone(), true);
                Refresher::new(self.control_plane, service_account_source(key, self.iam_authn))
                    .with_iam_token_source(iam_source)
            }
        };
        let refresher = refresher
            .with_user_agent(user_agent)
            .with_timeout(self.refresh_timeout)
            .with_rate_limit(self.rate_limit);

        let default_config = DialConfig {
            iam_authn: self.iam_authn,
            ..DialConfig::default()
        }
        .merged(self.default_options);

        tracing::debug!(
            ip_type = %default_config.ip_type,
            iam_authn = default_config.iam_authn,
            "dialer initialized"
        );

        Ok(Dialer {
            refresher: Arc::new(refresher),
            transport: self.transport.unwrap_or_else(|| Arc::new(TcpDialer)),
            default_config,
            dial_timeout: self.dial_timeout,
            caches: Mutex::new(Some(HashMap::new())),
        })
    }
}

impl fmt::Debug for DialerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialerBuilder")
            .field("iam_authn", &self.iam_authn)
            .field("default_options", &self.default_options)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("rate_limit", &self.rate_limit)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn service_account_source(key: ServiceAccountKey, iam_authn: bool) -> Arc<dyn TokenSource> {
    let mut scopes = vec![ADMIN_SCOPE];
    if iam_authn {
        scopes.push(LOGIN_SCOPE);
    }
    Arc::new(ServiceAccountTokenSource::new(key, scopes))
}

/// Opens authenticated, encrypted connections to instances
///
/// One connection info cache is kept per instance and IAM setting, created
/// on first use and refreshed in the background until the dialer is closed.
pub struct Dialer {
    refresher: Arc<Refresher>,
    transport: Arc<dyn TransportDialer>,
    default_config: DialConfig,
    dial_timeout: Duration,
    // None once closed
    caches: Mutex<Option<HashMap<CacheKey, Arc<InstanceCache>>>>,
}

impl Dialer {
    /// Start building a dialer talking to `control_plane`
    pub fn builder(control_plane: impl ControlPlane) -> DialerBuilder {
        DialerBuilder::new(Arc::new(control_plane))
    }

    /// Settings used when a dial passes no options
    pub fn default_dial_config(&self) -> DialConfig {
        self.default_config
    }

    /// Connect to `instance` (`project:region:instance`)
    ///
    /// # Errors
    ///
    /// See [`Dialer::dial_with_cancel`].
    pub async fn dial<I>(&self, instance: &str, opts: I) -> Result<InstanceStream>
    where
        I: IntoIterator<Item = DialOption>,
    {
        self.dial_with_cancel(&CancellationToken::new(), instance, opts)
            .await
    }

    /// Connect to `instance`, giving up when `cancel` fires.
    ///
    /// A handshake failure refreshes the instance's connection info once and
    /// retries; transport failures are returned as they are.
    ///
    /// # Errors
    ///
    /// * [`Error::Config`] for a malformed name, a missing IP type or an
    ///   unsupported IAM setting
    /// * [`Error::Refresh`] if no connection info could be fetched
    /// * [`Error::Dial`] if connecting or the handshake failed
    /// * [`Error::Cancelled`] / [`Error::Closed`]
    pub async fn dial_with_cancel<I>(
        &self,
        cancel: &CancellationToken,
        instance: &str,
        opts: I,
    ) -> Result<InstanceStream>
    where
        I: IntoIterator<Item = DialOption>,
    {
        let name = InstanceName::parse(instance)?;
        let config = self.default_config.merged(opts);
        let cache = self.cache(&name, config.iam_authn)?;

        let info = cache.connect(cancel).await?;
        let result = connection::connect(
            self.transport.as_ref(),
            &info,
            config.ip_type,
            self.dial_timeout,
            cancel,
        )
        .await;

        match result {
            Err(err) if err.is_handshake_failure() => {
                tracing::warn!(
                    instance = %name,
                    error = %err,
                    "handshake failed, refreshing connection info and retrying"
                );
                cache.force_refresh();
                let info = cache.connect(cancel).await?;
                connection::connect(
                    self.transport.as_ref(),
                    &info,
                    config.ip_type,
                    self.dial_timeout,
                    cancel,
                )
                .await
            }
            other => other,
        }
    }

    /// Start fetching connection info for `instance` without connecting
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a malformed name, [`Error::Closed`] after close.
    pub async fn warmup<I>(&self, instance: &str, opts: I) -> Result<()>
    where
        I: IntoIterator<Item = DialOption>,
    {
        let name = InstanceName::parse(instance)?;
        let config = self.default_config.merged(opts);
        self.cache(&name, config.iam_authn)?.warmup();
        Ok(())
    }

    /// Database version of `instance`, e.g. `POSTGRES_14`
    ///
    /// # Errors
    ///
    /// See [`Dialer::engine_version_with_cancel`].
    pub async fn engine_version(&self, instance: &str) -> Result<String> {
        self.engine_version_with_cancel(&CancellationToken::new(), instance)
            .await
    }

    /// Database version of `instance`, giving up when `cancel` fires.
    ///
    /// Any cache already holding the instance is reused, so this does not
    /// trigger an extra refresh after a dial or warmup.
    ///
    /// # Errors
    ///
    /// Same as [`Dialer::dial_with_cancel`], minus dial errors.
    pub async fn engine_version_with_cancel(
        &self,
        cancel: &CancellationToken,
        instance: &str,
    ) -> Result<String> {
        let name = InstanceName::parse(instance)?;
        let default_iam = self.default_config.iam_authn;

        let existing = {
            let caches = self.lock_caches();
            let caches = caches.as_ref().ok_or(Error::Closed)?;
            caches
                .get(&(name.clone(), default_iam))
                .or_else(|| caches.get(&(name.clone(), !default_iam)))
                .cloned()
        };
        let cache = match existing {
            Some(cache) => cache,
            None => self.cache(&name, default_iam)?,
        };

        let info = cache.connect(cancel).await?;
        Ok(info.database_version().to_string())
    }

    /// Stop all background refreshes and release every cached credential.
    ///
    /// Later calls fail with [`Error::Closed`]. Idempotent.
    pub fn close(&self) {
        let caches = self.lock_caches().take();
        if let Some(caches) = caches {
            tracing::debug!(caches = caches.len(), "closing dialer");
            for cache in caches.values() {
                cache.close();
            }
        }
    }

    fn lock_caches(&self) -> MutexGuard<'_, Option<HashMap<CacheKey, Arc<InstanceCache>>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self, name: &InstanceName, iam_authn: bool) -> Result<Arc<InstanceCache>> {
        let mut caches = self.lock_caches();
        let caches = caches.as_mut().ok_or(Error::Closed)?;
        let cache = caches
            .entry((name.clone(), iam_authn))
            .or_insert_with(|| {
                tracing::debug!(instance = %name, iam_authn, "creating instance cache");
                InstanceCache::new(name.clone(), iam_authn, self.refresher.clone())
            });
        Ok(cache.clone())
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("default_config", &self.default_config)
            .field("dial_timeout", &self.dial_timeout)
            .field("refresher", &self.refresher)
            .finish()
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.close();
    }
}
