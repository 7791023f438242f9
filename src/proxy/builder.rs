use crate::{
    certificate_authority::CertificateAuthority,
    events::{DEFAULT_TIMEOUT, EventBus},
    proxy::{Core, Proxy},
    route::Router,
    upstream::Dispatcher,
};
use hyper::server::conn::http1;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};

/// A builder for creating a [`Proxy`].
///
/// # Examples
///
/// ```rust
/// use interpose::{Proxy, certificate_authority::RcgenAuthority, rustls::crypto::aws_lc_rs};
/// use std::time::Duration;
///
/// let ca = RcgenAuthority::generate(1_000, aws_lc_rs::default_provider())
///     .expect("Failed to create Certificate Authority");
///
/// let proxy = Proxy::builder()
///     .with_addr(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
///     .with_ca(ca)
///     .with_insecure_upstream()
///     .with_default_timeout(Duration::from_secs(5))
///     .build();
/// # let _ = proxy;
/// ```
#[derive(Debug)]
pub struct ProxyBuilder<T>(T);

/// Builder state that needs either an address or a TCP listener.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WantsAddr(());

#[derive(Debug)]
pub(crate) enum AddrOrListener {
    Addr(SocketAddr),
    Listener(TcpListener),
}

impl ProxyBuilder<WantsAddr> {
    /// Create a new ProxyBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to listen on.
    pub fn with_addr(self, addr: SocketAddr) -> ProxyBuilder<WantsCa> {
        ProxyBuilder(WantsCa {
            al: AddrOrListener::Addr(addr),
        })
    }

    /// Set a listener to use for the proxy server.
    pub fn with_listener(self, listener: TcpListener) -> ProxyBuilder<WantsCa> {
        ProxyBuilder(WantsCa {
            al: AddrOrListener::Listener(listener),
        })
    }
}

impl Default for ProxyBuilder<WantsAddr> {
    fn default() -> Self {
        ProxyBuilder(WantsAddr(()))
    }
}

/// Builder state that needs a certificate authority.
#[derive(Debug)]
pub struct WantsCa {
    al: AddrOrListener,
}

impl ProxyBuilder<WantsCa> {
    /// Set the certificate authority used to intercept HTTPS.
    pub fn with_ca<CA: CertificateAuthority>(self, ca: CA) -> ProxyBuilder<WantsUpstream<CA>> {
        ProxyBuilder(WantsUpstream { al: self.0.al, ca })
    }
}

/// Builder state that needs to know which upstream certificates to trust.
#[derive(Debug)]
pub struct WantsUpstream<CA> {
    al: AddrOrListener,
    ca: CA,
}

impl<CA: CertificateAuthority> ProxyBuilder<WantsUpstream<CA>> {
    /// Trust the Mozilla root certificates bundled by `webpki-roots`.
    #[cfg(feature = "webpki-roots")]
    #[cfg_attr(docsrs, doc(cfg(feature = "webpki-roots")))]
    pub fn with_webpki_roots(self) -> ProxyBuilder<CanBuild<CA>> {
        self.with_root_certificates(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
    }

    /// Trust the certificates in `roots`.
    pub fn with_root_certificates(self, roots: RootCertStore) -> ProxyBuilder<CanBuild<CA>> {
        let client_config = client_config_builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        self.with_client_config(client_config)
    }

    /// Accept any upstream certificate.
    pub fn with_insecure_upstream(self) -> ProxyBuilder<CanBuild<CA>> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let client_config = client_config_builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
            .with_no_client_auth();

        self.with_client_config(client_config)
    }

    /// Use a custom TLS configuration for upstream connections. Only HTTP/1.1 is spoken upstream,
    /// so the ALPN protocols are replaced.
    pub fn with_client_config(self, mut client_config: ClientConfig) -> ProxyBuilder<CanBuild<CA>> {
        client_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        ProxyBuilder(CanBuild {
            al: self.0.al,
            ca: self.0.ca,
            client_config,
            default_timeout: DEFAULT_TIMEOUT,
            server: None,
        })
    }
}

/// Builder state that can take optional settings and build the proxy.
#[derive(Debug)]
pub struct CanBuild<CA> {
    al: AddrOrListener,
    ca: CA,
    client_config: ClientConfig,
    default_timeout: Duration,
    server: Option<http1::Builder>,
}

impl<CA: CertificateAuthority> ProxyBuilder<CanBuild<CA>> {
    /// Set the timeout used by waiters that don't specify one. A zero duration waits forever.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.0.default_timeout = timeout;
        self
    }

    /// Set the HTTP/1 server configuration used for client connections.
    pub fn with_http1_server(mut self, server: http1::Builder) -> Self {
        self.0.server = Some(server);
        self
    }

    /// Build the proxy.
    pub fn build(self) -> Proxy<CA> {
        let server = self.0.server.unwrap_or_else(|| {
            let mut server = http1::Builder::new();
            server.preserve_header_case(true).title_case_headers(true);
            server
        });

        Proxy {
            al: self.0.al,
            ca: Arc::new(self.0.ca),
            core: Arc::new(Core {
                router: Router::default(),
                bus: EventBus::new(self.0.default_timeout),
                dispatcher: Arc::new(Dispatcher::new(self.0.client_config)),
            }),
            server,
        }
    }
}

fn client_config_builder()
-> tokio_rustls::rustls::ConfigBuilder<ClientConfig, tokio_rustls::rustls::WantsVerifier> {
    ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("Failed to set protocol versions")
}

#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
