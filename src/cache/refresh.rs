//! A single refresh: token, key pair, metadata and ephemeral certificate

use super::info::{ConnectionInfo, DatabaseEngine};
use super::rate_limiter::{RateLimit, RateLimiter};
use crate::admin::{ControlPlane, ControlPlaneError, EphemeralCertRequest, RequestContext};
use crate::auth::TokenSource;
use crate::client::InstanceName;
use crate::connection::tls::{client_config, parse_pem_certificates};
use crate::error::{Error, Result};
use rand::Rng;
use rcgen::KeyPair;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Default bound on one refresh, rate-limit wait included
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

// Refresh this long before a short-lived certificate expires
const REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60);
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(30);
const MAX_REFRESH_DELAY: Duration = Duration::from_secs(60 * 60);

const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(60);
const RETRY_JITTER: f64 = 0.2;

/// Delay before the next refresh of a bundle expiring at `expiry`.
///
/// * already expired: refresh now
/// * less than an hour left: four minutes before expiry, but no sooner than
///   30 seconds from now and never past expiry
/// * otherwise: halfway to expiry, at most an hour away
pub fn refresh_delay(now: SystemTime, expiry: SystemTime) -> Duration {
    let remaining = match expiry.duration_since(now) {
        Ok(d) if !d.is_zero() => d,
        _ => return Duration::ZERO,
    };

    if remaining < MAX_REFRESH_DELAY {
        remaining
            .saturating_sub(REFRESH_BUFFER)
            .max(MIN_REFRESH_DELAY)
            .min(remaining)
    } else {
        (remaining / 2).min(MAX_REFRESH_DELAY)
    }
}

/// Backoff before retrying after the `failures`-th consecutive failure,
/// without jitter
pub(crate) fn retry_backoff_base(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    RETRY_BASE.saturating_mul(1 << exp).min(RETRY_MAX)
}

/// Jittered backoff, never later than `remaining`
pub(crate) fn retry_backoff(failures: u32, remaining: Duration) -> Duration {
    let base = retry_backoff_base(failures);
    let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..=RETRY_JITTER));
    (base + jitter).min(remaining)
}

/// Performs refreshes against the control-plane
///
/// Shared by every instance cache of a dialer.
pub struct Refresher {
    control_plane: Arc<dyn ControlPlane>,
    token_source: Arc<dyn TokenSource>,
    iam_token_source: Option<Arc<dyn TokenSource>>,
    user_agent: String,
    timeout: Duration,
    rate_limit: RateLimit,
}

impl Refresher {
    /// Create a refresher with default timeout and rate limit
    pub fn new(control_plane: Arc<dyn ControlPlane>, token_source: Arc<dyn TokenSource>) -> Self {
        Self {
            control_plane,
            token_source,
            iam_token_source: None,
            user_agent: crate::USER_AGENT.to_string(),
            timeout: DEFAULT_REFRESH_TIMEOUT,
            rate_limit: RateLimit::default(),
        }
    }

    /// Set the user agent reported to the control-plane
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Use `source` for refreshes issuing IAM-enabled certificates.
    ///
    /// Its tokens end up inside the certificate, so they must carry the
    /// database login scope. Without one, every refresh uses the default source.
    pub fn with_iam_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.iam_token_source = Some(source);
        self
    }

    /// Set the refresh timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-instance rate limit
    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Refresh timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Rate limit applied to each instance cache
    pub fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    /// User agent reported to the control-plane
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Run one refresh, bounded by the refresh timeout
    pub(crate) async fn refresh(
        &self,
        instance: &InstanceName,
        iam_authn: bool,
        limiter: &RateLimiter,
    ) -> Result<ConnectionInfo> {
        let started = Instant::now();
        let name = instance.to_string();

        let attempt = async {
            limiter.acquire().await;
            self.perform(instance, iam_authn).await
        };
        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::refresh(
                instance,
                format!("refresh did not complete within {:?}", self.timeout),
                Error::timed_out("refresh"),
            )),
        };

        crate::metrics::histograms::refresh_duration(&name, started.elapsed());
        match &result {
            Ok(_) => crate::metrics::counters::refresh_succeeded(&name),
            Err(e) => crate::metrics::counters::refresh_failed(&name, e.kind()),
        }
        result
    }

    async fn perform(&self, instance: &InstanceName, iam_authn: bool) -> Result<ConnectionInfo> {
        let source = match &self.iam_token_source {
            Some(iam_source) if iam_authn => iam_source,
            _ => &self.token_source,
        };
        let token = source
            .token()
            .await
            .map_err(|e| Error::refresh(instance, "failed to get access token", e))?;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::refresh(instance, "failed to generate key pair", e))?;

        let ctx = RequestContext {
            access_token: token.clone(),
            user_agent: self.user_agent.clone(),
        };
        let request = EphemeralCertRequest {
            public_key_pem: key_pair.public_key_pem(),
            use_iam_authn: iam_authn,
            access_token: iam_authn.then(|| token.clone()),
        };

        let metadata = async {
            self.control_plane
                .instance_metadata(&ctx, instance)
                .await
                .map_err(|e| control_plane_error(instance, "failed to get instance metadata", e))
        };
        let cert = async {
            self.control_plane
                .ephemeral_cert(&ctx, instance, request)
                .await
                .map_err(|e| control_plane_error(instance, "failed to get ephemeral certificate", e))
        };
        let (metadata, cert) = tokio::try_join!(metadata, cert)?;

        if metadata.region != instance.region() {
            return Err(Error::config(
                instance,
                format!(
                    "provided region was mismatched: got {}, want {}",
                    instance.region(),
                    metadata.region
                ),
            ));
        }
        if metadata.ip_addresses.is_empty() {
            return Err(Error::config(instance, "instance does not have any IP addresses"));
        }
        let engine = DatabaseEngine::from_version(&metadata.database_version);
        if iam_authn && !(metadata.iam_authn_supported && engine.supports_iam_authn()) {
            return Err(Error::config(
                instance,
                format!(
                    "IAM authentication is not supported for {}",
                    metadata.database_version
                ),
            ));
        }

        let server_ca = parse_pem_certificates(&metadata.server_ca_pem).map_err(|e| {
            Error::refresh(
                instance,
                "invalid server CA certificate",
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;
        let client_chain = parse_pem_certificates(&cert.cert_pem).map_err(|e| {
            Error::refresh(
                instance,
                "invalid ephemeral certificate",
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let tls_config = client_config(
            &server_ca,
            &metadata.instance_uid,
            client_chain.clone(),
            key,
        )
        .map_err(|e| Error::refresh(instance, "failed to build TLS configuration", e))?;

        // A login token inside the certificate bounds its usefulness
        let expiration = match (iam_authn, token.expiry) {
            (true, Some(token_expiry)) => cert.not_after.min(token_expiry),
            _ => cert.not_after,
        };

        Ok(ConnectionInfo::new(
            instance.clone(),
            metadata.ip_addresses,
            server_ca,
            metadata.instance_uid,
            client_chain,
            tls_config,
            expiration,
            metadata.database_version,
            iam_authn,
        ))
    }
}

impl fmt::Debug for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refresher")
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

fn control_plane_error(instance: &InstanceName, message: &str, err: ControlPlaneError) -> Error {
    match err {
        ControlPlaneError::NotFound(_) | ControlPlaneError::Unsupported(_) => {
            Error::config(instance, format!("{}: {}", message, err))
        }
        ControlPlaneError::PermissionDenied(_) | ControlPlaneError::Transient(_) => {
            Error::refresh(instance, message, err)
        }
    }
}
