//! Cluster identity: the cluster's name/ID, its private key, and the
//! self-signed certificate active nodes present on the cluster port.
//!
//! The key is generated once, the first time any node becomes active, and
//! persisted behind the barrier at [`CLUSTER_KEY_PATH`]. Every later active
//! node reads the same record, so the identity is stable across restarts
//! and across whichever physical node currently leads.
//!
//! Each transition to active issues a fresh certificate for that key. The
//! certificate pool holds exactly that one certificate, and both sides of a
//! cluster connection pin it: a peer presenting anything else fails the TLS
//! handshake.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::OsRng;
use p384::SecretKey;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::pkcs8::{EncodePrivateKey, LineEnding};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::barrier::Barrier;
use crate::error::ClusterError;

/// Barrier path of the cluster name/ID record.
pub const CLUSTER_INFO_PATH: &str = "core/cluster/local/info";

/// Barrier path of the cluster private key parameters.
pub const CLUSTER_KEY_PATH: &str = "core/cluster/local/key";

/// ALPN identifier negotiated on cluster connections.
pub const ALPN_H2: &[u8] = b"h2";

/// Name and ID of the cluster, shared by every node of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub id: String,
}

impl ClusterInfo {
    /// Host name bound into the cluster certificate.
    #[must_use]
    pub fn cert_host(&self) -> String {
        format!("fw-{}", self.id)
    }
}

/// Persisted cluster private key, keyed by curve.
///
/// Coordinates and scalar are lower-case hex, big-endian.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ClusterKeyParams {
    #[serde(rename = "p384")]
    P384 {
        #[serde(rename = "X")]
        x: String,
        #[serde(rename = "Y")]
        y: String,
        #[serde(rename = "D")]
        d: String,
    },
}

impl ClusterKeyParams {
    /// Curve identifier used by every cluster. P-384 rather than P-521:
    /// rustls's `ring` provider cannot verify P-521 signatures.
    pub const CURVE: &'static str = "p384";

    /// Generate a fresh key.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::KeyEncoding`] if the public point cannot be
    /// encoded.
    pub fn generate() -> Result<Self, ClusterError> {
        let secret = SecretKey::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(ClusterError::KeyEncoding {
                reason: "generated public key is the identity point".to_owned(),
            });
        };
        Ok(Self::P384 {
            x: hex::encode(x),
            y: hex::encode(y),
            d: hex::encode(secret.to_bytes()),
        })
    }

    /// Curve identifier of this record.
    #[must_use]
    pub fn curve(&self) -> &'static str {
        match self {
            Self::P384 { .. } => Self::CURVE,
        }
    }

    /// Decode the private scalar and check it against the stored public point.
    fn secret_key(&self) -> Result<SecretKey, ClusterError> {
        let Self::P384 { x, y, d } = self;
        let d_bytes = Zeroizing::new(hex::decode(d).map_err(|e| invalid(format!("D: {e}")))?);
        let secret = SecretKey::from_slice(&d_bytes).map_err(|e| invalid(format!("D: {e}")))?;

        let point = secret.public_key().to_encoded_point(false);
        let x_bytes = hex::decode(x).map_err(|e| invalid(format!("X: {e}")))?;
        let y_bytes = hex::decode(y).map_err(|e| invalid(format!("Y: {e}")))?;
        if point.x().map(|v| v.as_slice()) != Some(x_bytes.as_slice())
            || point.y().map(|v| v.as_slice()) != Some(y_bytes.as_slice())
        {
            return Err(invalid("public point does not match private scalar".to_owned()));
        }
        Ok(secret)
    }

    fn key_pair(&self) -> Result<KeyPair, ClusterError> {
        let secret = self.secret_key()?;
        let pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ClusterError::KeyEncoding {
                reason: e.to_string(),
            })?;
        KeyPair::from_pem(&pem).map_err(|e| ClusterError::KeyEncoding {
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for ClusterKeyParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self::P384 { x, y, .. } = self;
        f.debug_struct("ClusterKeyParams")
            .field("type", &self.curve())
            .field("x", x)
            .field("y", y)
            .field("d", &"[REDACTED]")
            .finish()
    }
}

fn invalid(reason: String) -> ClusterError {
    ClusterError::InvalidKeyParams { reason }
}

fn tls_err(e: impl fmt::Display) -> ClusterError {
    ClusterError::Tls {
        reason: e.to_string(),
    }
}

/// Cluster record as reported to the host.
#[derive(Clone)]
pub struct Cluster {
    pub name: String,
    pub id: String,
    /// DER certificate; empty until this node has been active or has
    /// inherited the active node's certificate.
    pub certificate: Vec<u8>,
    /// Trust anchors for inbound cluster connections: exactly the
    /// certificate above, or empty.
    pub cert_pool: Arc<RootCertStore>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("certificate_len", &self.certificate.len())
            .field("cert_pool_len", &self.cert_pool.len())
            .finish()
    }
}

/// Key material and certificate a node uses on the cluster port.
#[derive(Clone)]
pub struct ClusterIdentity {
    info: ClusterInfo,
    key: Arc<PrivatePkcs8KeyDer<'static>>,
    certificate: CertificateDer<'static>,
    pool: Arc<RootCertStore>,
}

impl ClusterIdentity {
    /// Issue a new self-signed certificate for the cluster key.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::InvalidKeyParams`] if the key record is inconsistent.
    /// - [`ClusterError::CertGeneration`] if rcgen rejects the parameters.
    pub fn issue(info: &ClusterInfo, params: &ClusterKeyParams) -> Result<Self, ClusterError> {
        let key_pair = params.key_pair()?;
        let host = info.cert_host();

        let cert_err = |e: rcgen::Error| ClusterError::CertGeneration {
            reason: e.to_string(),
        };
        let mut cert_params = CertificateParams::new(vec![host.clone()]).map_err(cert_err)?;
        cert_params.distinguished_name.push(DnType::CommonName, host);
        cert_params.is_ca = IsCa::NoCa;
        cert_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyAgreement,
        ];
        cert_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        cert_params.serial_number = Some(SerialNumber::from_slice(
            uuid::Uuid::new_v4().as_bytes(),
        ));

        let cert = cert_params.self_signed(&key_pair).map_err(cert_err)?;
        debug!(cluster_id = %info.id, "cluster certificate issued");

        Self::from_parts(
            info.clone(),
            PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
            cert.der().clone(),
        )
    }

    /// Rebuild an identity around an existing certificate for the cluster key.
    ///
    /// Standby nodes use this to present the active node's certificate.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::InvalidKeyParams`] if the key record is inconsistent.
    /// - [`ClusterError::Tls`] if the certificate cannot be parsed as a trust anchor.
    pub fn inherit(
        info: ClusterInfo,
        params: &ClusterKeyParams,
        certificate: CertificateDer<'static>,
    ) -> Result<Self, ClusterError> {
        let key_pair = params.key_pair()?;
        Self::from_parts(
            info,
            PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
            certificate,
        )
    }

    fn from_parts(
        info: ClusterInfo,
        key: PrivatePkcs8KeyDer<'static>,
        certificate: CertificateDer<'static>,
    ) -> Result<Self, ClusterError> {
        let mut pool = RootCertStore::empty();
        pool.add(certificate.clone()).map_err(tls_err)?;
        Ok(Self {
            info,
            key: Arc::new(key),
            certificate,
            pool: Arc::new(pool),
        })
    }

    #[must_use]
    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    /// The DER certificate presented on cluster connections.
    #[must_use]
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Trust anchors for this identity: exactly one certificate.
    #[must_use]
    pub fn cert_pool(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.pool)
    }

    /// SNI name used when dialing a cluster peer.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Tls`] if the cluster ID does not form a valid
    /// DNS name.
    pub fn server_name(&self) -> Result<ServerName<'static>, ClusterError> {
        ServerName::try_from(self.info.cert_host()).map_err(tls_err)
    }

    /// Snapshot for the host.
    #[must_use]
    pub fn cluster(&self) -> Cluster {
        Cluster {
            name: self.info.name.clone(),
            id: self.info.id.clone(),
            certificate: self.certificate.to_vec(),
            cert_pool: self.cert_pool(),
        }
    }

    /// TLS server configuration for cluster listeners.
    ///
    /// TLS 1.2 only, ALPN `h2`, and a client certificate identical to this
    /// identity's certificate is mandatory.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Tls`] if rustls rejects the key or versions.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, ClusterError> {
        let provider = crypto_provider();
        let verifier = Arc::new(PinnedCertVerifier::new(
            self.certificate.clone(),
            &self.pool,
            provider.signature_verification_algorithms,
        ));
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12])
            .map_err(tls_err)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                vec![self.certificate.clone()],
                PrivateKeyDer::Pkcs8(self.key.clone_key()),
            )
            .map_err(tls_err)?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(Arc::new(config))
    }

    /// TLS client configuration for dialing the active node.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Tls`] if rustls rejects the key or versions.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, ClusterError> {
        let provider = crypto_provider();
        let verifier = Arc::new(PinnedCertVerifier::new(
            self.certificate.clone(),
            &self.pool,
            provider.signature_verification_algorithms,
        ));
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12])
            .map_err(tls_err)?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(
                vec![self.certificate.clone()],
                PrivateKeyDer::Pkcs8(self.key.clone_key()),
            )
            .map_err(tls_err)?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterIdentity")
            .field("info", &self.info)
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts exactly one certificate, byte for byte, on either side of a
/// connection. Handshake signatures are still verified against it.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    subjects: Vec<DistinguishedName>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    fn new(
        pinned: CertificateDer<'static>,
        pool: &RootCertStore,
        algorithms: WebPkiSupportedAlgorithms,
    ) -> Self {
        Self {
            pinned,
            subjects: pool.subjects(),
            algorithms,
        }
    }

    fn check(&self, presented: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        if presented.as_ref() == self.pinned.as_ref() {
            Ok(())
        } else {
            debug!("rejected cluster peer presenting an unknown certificate");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PinnedCertVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.subjects
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Read the cluster name/ID, if set up.
///
/// # Errors
///
/// Returns [`ClusterError::Barrier`] if the barrier is sealed or storage
/// fails, or [`ClusterError::Serialization`] for a corrupt record.
pub async fn load_info(barrier: &Barrier) -> Result<Option<ClusterInfo>, ClusterError> {
    read_record(barrier, CLUSTER_INFO_PATH).await
}

/// Read the cluster name/ID, creating them on first use.
///
/// `name` overrides the generated `vault-cluster-<hex>` name.
///
/// # Errors
///
/// See [`load_info`].
pub async fn ensure_info(
    barrier: &Barrier,
    name: Option<&str>,
) -> Result<ClusterInfo, ClusterError> {
    if let Some(info) = load_info(barrier).await? {
        return Ok(info);
    }

    let id = uuid::Uuid::new_v4();
    let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_owned(),
        None => {
            let simple = id.simple().to_string();
            format!("vault-cluster-{}", &simple[..8])
        }
    };
    let info = ClusterInfo {
        name,
        id: id.to_string(),
    };
    write_record(barrier, CLUSTER_INFO_PATH, &info).await?;
    info!(cluster_name = %info.name, cluster_id = %info.id, "cluster information created");
    Ok(info)
}

/// Read the persisted cluster key, if one has been generated.
///
/// # Errors
///
/// See [`load_info`]. A record whose fields are missing fails to decode.
pub async fn load_key(barrier: &Barrier) -> Result<Option<ClusterKeyParams>, ClusterError> {
    read_record(barrier, CLUSTER_KEY_PATH).await
}

/// Read the cluster key, generating and persisting it if none exists.
///
/// Only an active node calls this, so at most one node ever generates.
///
/// # Errors
///
/// See [`load_info`] and [`ClusterKeyParams::generate`].
pub async fn ensure_key(barrier: &Barrier) -> Result<ClusterKeyParams, ClusterError> {
    if let Some(params) = load_key(barrier).await? {
        return Ok(params);
    }
    let params = ClusterKeyParams::generate()?;
    write_record(barrier, CLUSTER_KEY_PATH, &params).await?;
    info!(curve = params.curve(), "cluster private key generated");
    Ok(params)
}

async fn read_record<T: serde::de::DeserializeOwned>(
    barrier: &Barrier,
    path: &str,
) -> Result<Option<T>, ClusterError> {
    let Some(bytes) = barrier.get(path).await? else {
        return Ok(None);
    };
    let bytes = Zeroizing::new(bytes);
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ClusterError::Serialization {
            reason: format!("{path}: {e}"),
        })
}

async fn write_record<T: Serialize>(
    barrier: &Barrier,
    path: &str,
    value: &T,
) -> Result<(), ClusterError> {
    let bytes = Zeroizing::new(serde_json::to_vec(value).map_err(|e| {
        ClusterError::Serialization {
            reason: format!("{path}: {e}"),
        }
    })?);
    barrier.put(path, &bytes).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use zvault_storage::MemoryBackend;

    use super::*;
    use crate::crypto::EncryptionKey;

    async fn unsealed_barrier() -> Barrier {
        let barrier = Barrier::new(Arc::new(MemoryBackend::new()));
        let master = EncryptionKey::generate();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        barrier
    }

    fn info() -> ClusterInfo {
        ClusterInfo {
            name: "vault-cluster-test".to_owned(),
            id: "1f0f3c4e-5a4e-4c1d-9a3b-0d6f1a2b3c4d".to_owned(),
        }
    }

    #[test]
    fn key_params_serialize_with_type_tag_and_all_fields() {
        let params = ClusterKeyParams::generate().unwrap();
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["Type"], ClusterKeyParams::CURVE);
        for field in ["X", "Y", "D"] {
            assert!(!json[field].as_str().unwrap().is_empty(), "{field} empty");
        }
    }

    #[test]
    fn key_params_missing_field_fail_to_decode() {
        let json = r#"{"Type":"p384","X":"00","Y":"00"}"#;
        assert!(serde_json::from_str::<ClusterKeyParams>(json).is_err());
        let json = r#"{"Type":"p521","X":"00","Y":"00","D":"00"}"#;
        assert!(serde_json::from_str::<ClusterKeyParams>(json).is_err());
    }

    #[test]
    fn mismatched_public_point_is_rejected() {
        let ClusterKeyParams::P384 { d, .. } = ClusterKeyParams::generate().unwrap();
        let ClusterKeyParams::P384 { x, y, .. } = ClusterKeyParams::generate().unwrap();
        let franken = ClusterKeyParams::P384 { x, y, d };
        let err = ClusterIdentity::issue(&info(), &franken).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidKeyParams { .. }));
    }

    #[test]
    fn cert_pool_holds_exactly_the_issued_certificate() {
        let params = ClusterKeyParams::generate().unwrap();
        let identity = ClusterIdentity::issue(&info(), &params).unwrap();

        let pool = identity.cert_pool();
        let subjects = pool.subjects();
        assert_eq!(subjects.len(), 1);

        let host = info().cert_host();
        let subject = subjects[0].as_ref();
        assert!(subject.windows(host.len()).any(|w| w == host.as_bytes()));

        let cluster = identity.cluster();
        assert_eq!(cluster.certificate, identity.certificate().to_vec());
        assert_eq!(cluster.cert_pool.len(), 1);
    }

    #[test]
    fn each_issue_produces_a_new_certificate_for_the_same_key() {
        let params = ClusterKeyParams::generate().unwrap();
        let first = ClusterIdentity::issue(&info(), &params).unwrap();
        let second = ClusterIdentity::issue(&info(), &params).unwrap();
        assert_ne!(first.certificate(), second.certificate());
    }

    #[test]
    fn tls_configs_pin_tls12_and_h2() {
        let params = ClusterKeyParams::generate().unwrap();
        let identity = ClusterIdentity::issue(&info(), &params).unwrap();
        let server = identity.server_config().unwrap();
        let client = identity.client_config().unwrap();
        assert_eq!(server.alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(client.alpn_protocols, vec![b"h2".to_vec()]);
        assert!(identity.server_name().is_ok());
    }

    #[test]
    fn inherited_identity_presents_the_same_certificate() {
        let params = ClusterKeyParams::generate().unwrap();
        let active = ClusterIdentity::issue(&info(), &params).unwrap();
        let standby =
            ClusterIdentity::inherit(info(), &params, active.certificate().clone()).unwrap();
        assert_eq!(standby.certificate(), active.certificate());
    }

    #[tokio::test]
    async fn info_and_key_are_created_once() {
        let barrier = unsealed_barrier().await;
        assert!(load_info(&barrier).await.unwrap().is_none());

        let first = ensure_info(&barrier, None).await.unwrap();
        assert!(first.name.starts_with("vault-cluster-"));
        assert!(!first.id.is_empty());
        let again = ensure_info(&barrier, Some("ignored-later")).await.unwrap();
        assert_eq!(first, again);

        let key = ensure_key(&barrier).await.unwrap();
        let reread = ensure_key(&barrier).await.unwrap();
        assert_eq!(key, reread);
        assert_eq!(load_key(&barrier).await.unwrap(), Some(key));
    }

    #[tokio::test]
    async fn configured_cluster_name_is_used() {
        let barrier = unsealed_barrier().await;
        let info = ensure_info(&barrier, Some("prod-east")).await.unwrap();
        assert_eq!(info.name, "prod-east");
    }
}
