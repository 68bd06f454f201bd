#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Test doubles: a fake control-plane issuing real certificates and a TLS
//! server proxy that speaks for the fake instance.

use async_trait::async_trait;
use cloudsql_connector::admin::{
    ControlPlane, ControlPlaneError, EphemeralCert, EphemeralCertRequest, InstanceMetadata, IpType,
    RequestContext,
};
use cloudsql_connector::auth::{AccessToken, AuthError, TokenSource};
use cloudsql_connector::InstanceName;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, SubjectPublicKeyInfo,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Install a tracing subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Token source returning an empty token
pub struct EmptyTokenSource;

#[async_trait]
impl TokenSource for EmptyTokenSource {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        Ok(AccessToken::new(""))
    }
}

/// Token source that always fails
pub struct FailingTokenSource;

#[async_trait]
impl TokenSource for FailingTokenSource {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        Err(AuthError::Source("token endpoint unavailable".into()))
    }
}

fn offset(t: SystemTime) -> OffsetDateTime {
    OffsetDateTime::from(t)
}

/// A fake instance with its own CA
pub struct FakeInstance {
    pub project: String,
    pub region: String,
    pub name: String,
    pub database_version: String,
    pub ip_addresses: HashMap<IpType, String>,
    pub cert_expiry: SystemTime,
    pub iam_authn_supported: bool,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl FakeInstance {
    /// Postgres instance with a public IP and certificates valid for an hour
    pub fn new(project: &str, region: &str, name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Fake Instance Server CA");
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let mut ip_addresses = HashMap::new();
        ip_addresses.insert(IpType::Public, "127.0.0.1".to_string());

        Self {
            project: project.to_string(),
            region: region.to_string(),
            name: name.to_string(),
            database_version: "POSTGRES_14".to_string(),
            ip_addresses,
            cert_expiry: SystemTime::now() + Duration::from_secs(3600),
            iam_authn_supported: true,
            ca_cert,
            ca_key,
        }
    }

    pub fn with_engine_version(mut self, version: &str) -> Self {
        self.database_version = version.to_string();
        self
    }

    pub fn with_cert_expiry(mut self, expiry: SystemTime) -> Self {
        self.cert_expiry = expiry;
        self
    }

    pub fn with_ip(mut self, ip_type: IpType, addr: &str) -> Self {
        self.ip_addresses.insert(ip_type, addr.to_string());
        self
    }

    pub fn without_ips(mut self) -> Self {
        self.ip_addresses.clear();
        self
    }

    pub fn connection_name(&self) -> String {
        format!("{}:{}:{}", self.project, self.region, self.name)
    }

    /// Identity carried by the server certificate
    pub fn uid(&self) -> String {
        format!("{}:{}", self.project, self.name)
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    fn validity(&self) -> (OffsetDateTime, OffsetDateTime) {
        let not_before = self.cert_expiry.min(SystemTime::now()) - Duration::from_secs(3600);
        (offset(not_before), offset(self.cert_expiry))
    }

    /// Sign an ephemeral client certificate for `public_key_pem`
    pub fn sign_client_cert(&self, public_key_pem: &str) -> String {
        let spki = SubjectPublicKeyInfo::from_pem(public_key_pem).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "ephemeral-client");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        (params.not_before, params.not_after) = self.validity();
        params
            .signed_by(&spki, &self.ca_cert, &self.ca_key)
            .unwrap()
            .pem()
    }

    /// TLS configuration of the instance's server-side proxy
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, self.uid());
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        (params.not_before, params.not_after) = self.validity();
        let server_cert = params
            .signed_by(&server_key, &self.ca_cert, &self.ca_key)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.der().clone()).unwrap();
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .unwrap();

        let chain: Vec<CertificateDer<'static>> = vec![server_cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(server_key.serialize_der().into());
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain, key)
            .unwrap();
        Arc::new(config)
    }
}

fn unrelated_ca_pem() -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, "Unrelated CA");
    params.self_signed(&key).unwrap().pem()
}

struct FakeState {
    instance: FakeInstance,
    metadata_calls: AtomicUsize,
    cert_calls: AtomicUsize,
    metadata_budget: Option<usize>,
    cert_budget: Option<usize>,
    delay: Option<Duration>,
    failure: Mutex<Option<ControlPlaneError>>,
    wrong_ca_responses: AtomicUsize,
    user_agents: Mutex<Vec<String>>,
    access_tokens: Mutex<Vec<String>>,
    cert_requests: Mutex<Vec<EphemeralCertRequest>>,
}

/// In-memory control-plane for one fake instance
#[derive(Clone)]
pub struct FakeControlPlane {
    state: Arc<FakeState>,
}

impl FakeControlPlane {
    pub fn new(instance: FakeInstance) -> Self {
        Self::build(instance, None, None, None, 0)
    }

    /// Fail every call beyond the given number of metadata and certificate calls
    pub fn with_budget(instance: FakeInstance, metadata: usize, cert: usize) -> Self {
        Self::build(instance, Some(metadata), Some(cert), None, 0)
    }

    /// Delay every call by `delay`
    pub fn with_delay(instance: FakeInstance, delay: Duration) -> Self {
        Self::build(instance, None, None, Some(delay), 0)
    }

    /// Return an unrelated server CA for the first `n` metadata calls
    pub fn with_wrong_ca(instance: FakeInstance, n: usize) -> Self {
        Self::build(instance, None, None, None, n)
    }

    fn build(
        instance: FakeInstance,
        metadata_budget: Option<usize>,
        cert_budget: Option<usize>,
        delay: Option<Duration>,
        wrong_ca: usize,
    ) -> Self {
        Self {
            state: Arc::new(FakeState {
                instance,
                metadata_calls: AtomicUsize::new(0),
                cert_calls: AtomicUsize::new(0),
                metadata_budget,
                cert_budget,
                delay,
                failure: Mutex::new(None),
                wrong_ca_responses: AtomicUsize::new(wrong_ca),
                user_agents: Mutex::new(Vec::new()),
                access_tokens: Mutex::new(Vec::new()),
                cert_requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn instance(&self) -> &FakeInstance {
        &self.state.instance
    }

    /// Make every following call fail with `err`
    pub fn fail_with(&self, err: ControlPlaneError) {
        *self.state.failure.lock().unwrap() = Some(err);
    }

    pub fn clear_failure(&self) {
        *self.state.failure.lock().unwrap() = None;
    }

    pub fn metadata_calls(&self) -> usize {
        self.state.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn cert_calls(&self) -> usize {
        self.state.cert_calls.load(Ordering::SeqCst)
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.state.user_agents.lock().unwrap().clone()
    }

    /// Bearer tokens that authorized each call, in call order
    pub fn access_tokens(&self) -> Vec<String> {
        self.state.access_tokens.lock().unwrap().clone()
    }

    pub fn cert_requests(&self) -> Vec<EphemeralCertRequest> {
        self.state.cert_requests.lock().unwrap().clone()
    }

    async fn before_call(
        &self,
        counter: &AtomicUsize,
        budget: Option<usize>,
        ctx: &RequestContext,
        instance: &InstanceName,
    ) -> Result<(), ControlPlaneError> {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .user_agents
            .lock()
            .unwrap()
            .push(ctx.user_agent.clone());
        self.state
            .access_tokens
            .lock()
            .unwrap()
            .push(ctx.access_token.value.clone());

        if let Some(delay) = self.state.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.state.failure.lock().unwrap().clone() {
            return Err(err);
        }
        if budget.is_some_and(|budget| call > budget) {
            return Err(ControlPlaneError::Transient(format!(
                "unexpected call #{}",
                call
            )));
        }

        let fake = &self.state.instance;
        if instance.project() != fake.project || instance.name() != fake.name {
            return Err(ControlPlaneError::NotFound(format!(
                "instance {} does not exist",
                instance
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn instance_metadata(
        &self,
        ctx: &RequestContext,
        instance: &InstanceName,
    ) -> Result<InstanceMetadata, ControlPlaneError> {
        self.before_call(
            &self.state.metadata_calls,
            self.state.metadata_budget,
            ctx,
            instance,
        )
        .await?;

        let fake = &self.state.instance;
        let wrong_ca = self
            .state
            .wrong_ca_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let server_ca_pem = if wrong_ca {
            unrelated_ca_pem()
        } else {
            fake.ca_pem()
        };

        Ok(InstanceMetadata {
            ip_addresses: fake.ip_addresses.clone(),
            server_ca_pem,
            instance_uid: fake.uid(),
            region: fake.region.clone(),
            database_version: fake.database_version.clone(),
            iam_authn_supported: fake.iam_authn_supported,
        })
    }

    async fn ephemeral_cert(
        &self,
        ctx: &RequestContext,
        instance: &InstanceName,
        request: EphemeralCertRequest,
    ) -> Result<EphemeralCert, ControlPlaneError> {
        self.before_call(&self.state.cert_calls, self.state.cert_budget, ctx, instance)
            .await?;

        let fake = &self.state.instance;
        let cert_pem = fake.sign_client_cert(&request.public_key_pem);
        self.state.cert_requests.lock().unwrap().push(request);
        Ok(EphemeralCert {
            cert_pem,
            not_after: fake.cert_expiry,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ProxyMode {
    Greet,
    Echo,
}

/// TLS server standing in for the instance
pub struct ServerProxy {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl ServerProxy {
    /// Writes the instance name to every client that completes the
    /// handshake, then closes
    pub async fn start(instance: &FakeInstance) -> Self {
        Self::spawn(instance, ProxyMode::Greet).await
    }

    /// Echoes everything a client writes until the client closes
    pub async fn echo(instance: &FakeInstance) -> Self {
        Self::spawn(instance, ProxyMode::Echo).await
    }

    async fn spawn(instance: &FakeInstance, mode: ProxyMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(instance.server_config());
        let reply = instance.name.clone();
        let accepted = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let (accepted_count, finished_count) = (accepted.clone(), finished.clone());
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let reply = reply.clone();
                let accepted = accepted_count.clone();
                let finished = finished_count.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(socket).await else {
                        return;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let (mut reader, mut writer) = tokio::io::split(tls);
                    match mode {
                        ProxyMode::Greet => {
                            let _ = writer.write_all(reply.as_bytes()).await;
                        }
                        // Ends when the client closes, cleanly or not
                        ProxyMode::Echo => {
                            let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        }
                    }
                    let _ = writer.shutdown().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            accepted,
            finished,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Completed server-side handshakes
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections the server is done with; for echo, ones the client closed
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for ServerProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Address nothing listens on
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
