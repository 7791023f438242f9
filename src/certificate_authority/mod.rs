mod rcgen_authority;

use crate::Error;
use std::{future::Future, sync::Arc, time::SystemTime};
use tokio_rustls::rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};

pub use rcgen_authority::*;

const TTL_SECS: i64 = 365 * 24 * 60 * 60;
const NOT_BEFORE_OFFSET: i64 = 60;

/// A leaf certificate minted for one host, together with the TLS configuration presenting it.
#[derive(Debug)]
pub struct IssuedCertificate {
    host: String,
    certificate: CertificateDer<'static>,
    private_key: PrivateKeyDer<'static>,
    issued_at: SystemTime,
    server_config: Arc<ServerConfig>,
}

impl IssuedCertificate {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

/// Issues certificates for use when communicating with clients.
///
/// Clients should be configured to either trust the provided root certificate, or to ignore
/// certificate errors.
pub trait CertificateAuthority: Send + Sync + 'static {
    /// Returns the certificate for `host`, issuing it on first use. Concurrent calls for the same
    /// host must resolve to a single issuance.
    fn issue_for(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Arc<IssuedCertificate>, Error>> + Send;

    /// Generate ServerConfig for use with rustls.
    fn gen_server_config(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Arc<ServerConfig>, Error>> + Send {
        async move { Ok(self.issue_for(host).await?.server_config()) }
    }
}
