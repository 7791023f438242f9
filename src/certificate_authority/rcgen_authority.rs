use crate::{
    Error,
    certificate_authority::{
        CertificateAuthority, IssuedCertificate, NOT_BEFORE_OFFSET, TTL_SECS,
    },
};
use moka::future::Cache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::{net::IpAddr, sync::Arc, time::SystemTime};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::{
    ServerConfig,
    crypto::CryptoProvider,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
};
use tracing::debug;

const ROOT_COMMON_NAME: &str = "interpose CA";

/// Issues certificates for use when communicating with clients.
///
/// Issues certificates for communicating with clients over TLS. Certificates are cached in memory
/// up to a max size that is provided when creating the authority and are kept for the lifetime of
/// the authority. Certificates are generated using the `rcgen` crate.
///
/// # Examples
///
/// ```rust
/// use interpose::{certificate_authority::RcgenAuthority, rustls::crypto::aws_lc_rs};
///
/// let ca = RcgenAuthority::generate(1_000, aws_lc_rs::default_provider()).unwrap();
/// assert!(ca.ca_cert_pem().unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
/// ```
pub struct RcgenAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_pem: Option<String>,
    provider: Arc<CryptoProvider>,
    cache: Cache<String, Arc<IssuedCertificate>>,
}

impl RcgenAuthority {
    /// Creates an authority signing with an existing root, for example one loaded with
    /// [`Issuer::from_ca_cert_pem`].
    pub fn new(issuer: Issuer<'static, KeyPair>, cache_size: u64, provider: CryptoProvider) -> Self {
        Self {
            issuer,
            ca_cert_pem: None,
            provider: Arc::new(provider),
            cache: Cache::builder().max_capacity(cache_size).build(),
        }
    }

    /// Creates an authority with a freshly generated, in-memory root key and certificate.
    ///
    /// # Errors
    ///
    /// This will return an error if the root key or certificate cannot be generated.
    pub fn generate(cache_size: u64, provider: CryptoProvider) -> Result<Self, Error> {
        let key_pair = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, ROOT_COMMON_NAME);
        distinguished_name.push(DnType::OrganizationName, "interpose");
        params.distinguished_name = distinguished_name;

        let not_before = OffsetDateTime::now_utc() - Duration::seconds(NOT_BEFORE_OFFSET);
        params.not_before = not_before;
        params.not_after = not_before + Duration::seconds(TTL_SECS * 10);

        let ca_cert = params.self_signed(&key_pair)?;

        let mut ca = Self::new(Issuer::new(params, key_pair), cache_size, provider);
        ca.ca_cert_pem = Some(ca_cert.pem());
        Ok(ca)
    }

    /// PEM encoded root certificate, available when the root was generated by this authority.
    pub fn ca_cert_pem(&self) -> Option<&str> {
        self.ca_cert_pem.as_deref()
    }

    fn gen_cert(&self, host: &str) -> Result<IssuedCertificate, Error> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(rand::random::<u64>().into());

        let not_before = OffsetDateTime::now_utc() - Duration::seconds(NOT_BEFORE_OFFSET);
        params.not_before = not_before;
        params.not_after = not_before + Duration::seconds(TTL_SECS);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host);
        params.distinguished_name = distinguished_name;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        match host.parse::<IpAddr>() {
            Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
            Err(_) => params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into()?)),
        }

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut server_cfg = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], private_key.clone_key())?;
        server_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(IssuedCertificate {
            host: host.to_owned(),
            certificate: cert.der().clone(),
            private_key,
            issued_at: SystemTime::now(),
            server_config: Arc::new(server_cfg),
        })
    }
}

impl CertificateAuthority for RcgenAuthority {
    async fn issue_for(&self, host: &str) -> Result<Arc<IssuedCertificate>, Error> {
        let key = host.to_ascii_lowercase();

        let entry = self
            .cache
            .entry(key.clone())
            .or_try_insert_with(async { self.gen_cert(&key).map(Arc::new) })
            .await
            .map_err(|err| Error::Issuance {
                host: key.clone(),
                reason: err.to_string(),
            })?;

        if entry.is_fresh() {
            debug!(host = %key, "Generated certificate");
        } else {
            debug!(host = %key, "Using cached certificate");
        }

        Ok(entry.into_value())
    }
}
