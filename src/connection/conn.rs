//! Dialing an instance: transport connect plus TLS handshake

use super::state::DialState;
use super::transport::{InstanceStream, TransportDialer};
use crate::admin::IpType;
use crate::cache::ConnectionInfo;
use crate::error::{DialFailure, Error, Result};
use rustls_pki_types::ServerName;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Port the instance's server-side proxy listens on
pub const SERVER_PROXY_PORT: u16 = 3307;

/// Default bound on transport connect plus handshake
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a mutually authenticated TLS stream to the instance described by `info`.
///
/// # Errors
///
/// * [`Error::Config`] if the instance has no address of `ip_type`
/// * [`Error::Dial`] if the transport connect, the handshake, or the whole
///   dial within `dial_timeout` fails
/// * [`Error::Cancelled`] if `cancel` fires first
pub async fn connect(
    transport: &dyn TransportDialer,
    info: &ConnectionInfo,
    ip_type: IpType,
    dial_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<InstanceStream> {
    let instance = info.instance().to_string();
    let host = info.address(ip_type).ok_or_else(|| {
        Error::config(
            &instance,
            format!("instance does not have IP of type {}", ip_type),
        )
    })?;
    let addr = socket_addr(host, SERVER_PROXY_PORT);
    let started = Instant::now();

    let result = async {
        let mut state = DialState::Connecting;
        let attempt = establish(transport, info, host, &addr, &mut state);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(dial_timeout, attempt) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::dial(
                    &instance,
                    DialFailure::Timeout,
                    format!("dial did not complete within {:?}", dial_timeout),
                    Error::timed_out("dial"),
                )),
            },
        };

        match &result {
            Ok(_) => tracing::info!("connection established"),
            Err(e) => {
                advance(&mut state, DialState::Failed);
                tracing::debug!(error = %e, "dial failed");
            }
        }
        result
    }
    .instrument(tracing::info_span!(
        "dial",
        instance = %instance,
        ip_type = %ip_type,
        addr = %addr
    ))
    .await;

    match &result {
        Ok(_) => {
            crate::metrics::counters::dial_completed(&instance, crate::metrics::labels::STATUS_OK);
            crate::metrics::histograms::dial_latency(&instance, started.elapsed());
        }
        Err(_) => {
            crate::metrics::counters::dial_completed(&instance, crate::metrics::labels::STATUS_ERROR)
        }
    }
    result
}

async fn establish(
    transport: &dyn TransportDialer,
    info: &ConnectionInfo,
    host: &str,
    addr: &str,
    state: &mut DialState,
) -> Result<InstanceStream> {
    let instance = info.instance().to_string();

    let raw = transport
        .dial(addr)
        .await
        .map_err(|e| Error::dial(&instance, DialFailure::Connect, format!("failed to dial {}", addr), e))?;

    advance(state, DialState::Handshaking);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::config(&instance, format!("invalid server address {:?}: {}", host, e)))?;
    let connector = TlsConnector::from(info.tls_config().clone());
    let tls = connector
        .connect(server_name, raw)
        .await
        .map_err(|e| Error::dial(&instance, DialFailure::Handshake, "handshake failed", e))?;

    advance(state, DialState::Established);
    Ok(InstanceStream::new(tls, instance))
}

// Transitions here are fixed by the code path; a rejection is a bug, not a dial failure
fn advance(state: &mut DialState, next: DialState) {
    if let Err(err) = state.transition(next) {
        tracing::error!(error = %err, "dial state machine violated");
    }
}

/// `host:port`, bracketing IPv6 literals
pub(crate) fn socket_addr(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, port),
        _ => format!("{}:{}", host, port),
    }
}
