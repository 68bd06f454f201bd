//! Control-plane contract
//!
//! The control-plane is the remote API that knows about instances: where they
//! listen, which CA signs their server certificates, and how to issue a
//! short-lived client certificate for a public key. This crate only consumes
//! it; implementations live with the embedding application (a REST client, a
//! gRPC client, or a fake in tests).

use crate::auth::AccessToken;
use crate::client::InstanceName;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Network surface an instance can be reached on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IpType {
    /// Public address
    #[serde(alias = "PRIMARY")]
    Public,
    /// Private (VPC-internal) address
    Private,
    /// Private Service Connect address
    Psc,
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "PUBLIC"),
            Self::Private => write!(f, "PRIVATE"),
            Self::Psc => write!(f, "PSC"),
        }
    }
}

impl FromStr for IpType {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUBLIC" | "PRIMARY" => Ok(Self::Public),
            "PRIVATE" => Ok(Self::Private),
            "PSC" => Ok(Self::Psc),
            _ => Err(crate::Error::config(
                s,
                "invalid IP type: expected PUBLIC, PRIVATE, or PSC",
            )),
        }
    }
}

/// Per-request information handed to the control-plane
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Bearer credential authorizing the call
    pub access_token: AccessToken,
    /// User agent to report
    pub user_agent: String,
}

/// Instance metadata returned by the control-plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// Address per IP type; missing types are not exposed by the instance
    pub ip_addresses: HashMap<IpType, String>,
    /// PEM-encoded CA certificate(s) that sign the server certificate
    pub server_ca_pem: String,
    /// Instance UID, the identity the server certificate carries
    pub instance_uid: String,
    /// Region the instance lives in
    pub region: String,
    /// Database version, e.g. `POSTGRES_14`
    pub database_version: String,
    /// Whether the engine supports IAM database authentication
    pub iam_authn_supported: bool,
}

/// Request for an ephemeral client certificate
#[derive(Debug, Clone)]
pub struct EphemeralCertRequest {
    /// PEM-encoded public key the certificate must be bound to
    pub public_key_pem: String,
    /// Request a certificate usable for IAM database authentication
    pub use_iam_authn: bool,
    /// Login token embedded into the certificate when IAM authentication is used
    pub access_token: Option<AccessToken>,
}

/// Ephemeral client certificate issued by the control-plane
#[derive(Debug, Clone)]
pub struct EphemeralCert {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// Not-after of the certificate
    pub not_after: SystemTime,
}

/// Failure of a control-plane call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlPlaneError {
    /// The instance does not exist, or the caller may not see it
    #[error("not found: {0}")]
    NotFound(String),
    /// The caller is not allowed to perform the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The operation is not supported for this instance
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Network failure, quota exhaustion or server error
    #[error("transient failure: {0}")]
    Transient(String),
}

/// The remote control-plane
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Fetch the connection metadata of an instance
    async fn instance_metadata(
        &self,
        ctx: &RequestContext,
        instance: &InstanceName,
    ) -> std::result::Result<InstanceMetadata, ControlPlaneError>;

    /// Issue a short-lived client certificate for `request.public_key_pem`
    async fn ephemeral_cert(
        &self,
        ctx: &RequestContext,
        instance: &InstanceName,
        request: EphemeralCertRequest,
    ) -> std::result::Result<EphemeralCert, ControlPlaneError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_type_from_str() {
        assert_eq!("PUBLIC".parse::<IpType>().unwrap(), IpType::Public);
        assert_eq!("primary".parse::<IpType>().unwrap(), IpType::Public);
        assert_eq!("PRIVATE".parse::<IpType>().unwrap(), IpType::Private);
        assert_eq!("psc".parse::<IpType>().unwrap(), IpType::Psc);
    }

    #[test]
    fn test_ip_type_from_str_invalid() {
        let err = "OUTGOING".parse::<IpType>().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_ip_type_display() {
        assert_eq!(IpType::Public.to_string(), "PUBLIC");
        assert_eq!(IpType::Private.to_string(), "PRIVATE");
        assert_eq!(IpType::Psc.to_string(), "PSC");
    }

    #[test]
    fn test_metadata_deserializes_control_plane_names() {
        let json = r#"{
            "ip_addresses": {"PRIMARY": "10.0.0.1", "PRIVATE": "192.168.0.2"},
            "server_ca_pem": "",
            "instance_uid": "uid",
            "region": "us-central1",
            "database_version": "POSTGRES_14",
            "iam_authn_supported": true
        }"#;
        let md: InstanceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(md.ip_addresses.get(&IpType::Public).unwrap(), "10.0.0.1");
        assert_eq!(md.ip_addresses.get(&IpType::Private).unwrap(), "192.168.0.2");
        assert!(md.ip_addresses.get(&IpType::Psc).is_none());
    }
}
