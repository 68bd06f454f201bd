//! Connection info bundles

use crate::admin::IpType;
use crate::client::InstanceName;
use rustls::ClientConfig;
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Database engine family, derived from the version string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseEngine {
    /// PostgreSQL
    Postgres,
    /// MySQL
    MySql,
    /// SQL Server
    SqlServer,
    /// A version string this crate does not recognise
    Unknown,
}

impl DatabaseEngine {
    /// Classify a version string such as `POSTGRES_14` or `MYSQL_8_0_18`
    pub fn from_version(version: &str) -> Self {
        let upper = version.to_ascii_uppercase();
        if upper.starts_with("POSTGRES") {
            Self::Postgres
        } else if upper.starts_with("MYSQL") {
            Self::MySql
        } else if upper.starts_with("SQLSERVER") {
            Self::SqlServer
        } else {
            Self::Unknown
        }
    }

    /// Whether the engine accepts IAM database authentication
    pub fn supports_iam_authn(&self) -> bool {
        matches!(self, Self::Postgres | Self::MySql)
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::MySql => write!(f, "mysql"),
            Self::SqlServer => write!(f, "sqlserver"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Everything needed to open connections to one instance, produced by a
/// single refresh
///
/// Immutable: a refresh builds a new bundle and the cache swaps the pointer.
/// The private key lives only inside the TLS configuration and is released
/// with the bundle.
#[derive(Clone)]
pub struct ConnectionInfo {
    instance: InstanceName,
    addresses: HashMap<IpType, String>,
    server_ca: Vec<CertificateDer<'static>>,
    server_name: String,
    client_cert_chain: Vec<CertificateDer<'static>>,
    tls_config: Arc<ClientConfig>,
    expiration: SystemTime,
    database_version: String,
    iam_authn: bool,
    fingerprint: String,
}

impl ConnectionInfo {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instance: InstanceName,
        addresses: HashMap<IpType, String>,
        server_ca: Vec<CertificateDer<'static>>,
        server_name: String,
        client_cert_chain: Vec<CertificateDer<'static>>,
        tls_config: Arc<ClientConfig>,
        expiration: SystemTime,
        database_version: String,
        iam_authn: bool,
    ) -> Self {
        let fingerprint = client_cert_chain
            .first()
            .map(|cert| fingerprint(cert.as_ref()))
            .unwrap_or_default();

        Self {
            instance,
            addresses,
            server_ca,
            server_name,
            client_cert_chain,
            tls_config,
            expiration,
            database_version,
            iam_authn,
            fingerprint,
        }
    }

    /// Instance this bundle belongs to
    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    /// Address for an IP type, if the instance exposes one
    pub fn address(&self, ip_type: IpType) -> Option<&str> {
        self.addresses.get(&ip_type).map(String::as_str)
    }

    /// All known addresses
    pub fn addresses(&self) -> &HashMap<IpType, String> {
        &self.addresses
    }

    /// Trust anchors for the server certificate
    pub fn server_ca(&self) -> &[CertificateDer<'static>] {
        &self.server_ca
    }

    /// Identity the server certificate must carry (the instance UID)
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Ephemeral client certificate chain
    pub fn client_cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.client_cert_chain
    }

    /// Ready-to-use client TLS configuration
    pub fn tls_config(&self) -> &Arc<ClientConfig> {
        &self.tls_config
    }

    /// When the bundle stops being usable
    pub fn expiration(&self) -> SystemTime {
        self.expiration
    }

    /// Whether the bundle has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Whether the bundle is expired at `now`
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expiration
    }

    /// Database version reported by the control-plane, e.g. `POSTGRES_14`
    pub fn database_version(&self) -> &str {
        &self.database_version
    }

    /// Engine family of the instance
    pub fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::from_version(&self.database_version)
    }

    /// Whether the certificate was issued for IAM database authentication
    pub fn iam_authn(&self) -> bool {
        self.iam_authn
    }

    /// SHA-256 fingerprint of the client certificate, hex encoded
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("instance", &self.instance)
            .field("addresses", &self.addresses)
            .field("server_name", &self.server_name)
            .field("expiration", &self.expiration)
            .field("database_version", &self.database_version)
            .field("iam_authn", &self.iam_authn)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
