use crate::{
    Body, Error,
    exchange::RequestData,
    headers::Headers,
    network::{SecurityDetails, ServerAddr, Timing},
    route::{FetchResponse, status_text},
};
use bstr::ByteSlice;
use http::{
    HeaderMap, HeaderValue, Version,
    header::{self, Entry},
};
use http_body_util::BodyExt;
use hyper::{body::Incoming, client::conn::http1::SendRequest, ext::ReasonPhrase};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::{
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, ProtocolVersion, client::ClientConnection, pki_types::ServerName},
};
use tracing::{Instrument, debug, info_span, instrument};

const HEAD_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

#[derive(Debug, Default)]
struct Scan {
    total: u64,
    head_len: Option<u64>,
    matched: usize,
}

/// Counts bytes flowing in one direction and locates the end of the message head.
#[derive(Debug, Default)]
pub(crate) struct WireCounter {
    scan: Mutex<Scan>,
}

impl WireCounter {
    fn record(&self, bytes: &[u8]) {
        let mut scan = self.scan.lock();

        if scan.head_len.is_none() {
            for (i, byte) in bytes.iter().enumerate() {
                if *byte == HEAD_TERMINATOR[scan.matched] {
                    scan.matched += 1;
                    if scan.matched == HEAD_TERMINATOR.len() {
                        scan.head_len = Some(scan.total + i as u64 + 1);
                        break;
                    }
                } else {
                    scan.matched = usize::from(*byte == b'\r');
                }
            }
        }

        scan.total += bytes.len() as u64;
    }

    /// Bytes of the head including the blank line that ends it.
    pub(crate) fn head_len(&self) -> u64 {
        let scan = self.scan.lock();
        scan.head_len.unwrap_or(scan.total)
    }

    /// Bytes after the head, framing included.
    pub(crate) fn body_len(&self) -> u64 {
        let scan = self.scan.lock();
        scan.head_len.map_or(0, |head_len| scan.total - head_len)
    }
}

#[derive(Debug, Default)]
pub(crate) struct WireCounters {
    pub(crate) sent: WireCounter,
    pub(crate) received: WireCounter,
}

/// Wraps the upstream stream and feeds every plaintext byte through the counters.
struct Recorded<S> {
    inner: S,
    counters: Arc<WireCounters>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Recorded<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.counters.received.record(&buf.filled()[before..]);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Recorded<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = poll {
            self.counters.sent.record(&buf[..written]);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// The response head of a dispatched request, with its body still streaming.
pub(crate) struct Upstream {
    pub(crate) response: hyper::Response<Incoming>,
    pub(crate) counters: Arc<WireCounters>,
    pub(crate) security_details: Option<SecurityDetails>,
    pub(crate) server_addr: ServerAddr,
    pub(crate) timing: Timing,
}

/// Sends requests to their origin over a fresh connection each.
pub(crate) struct Dispatcher {
    connector: TlsConnector,
}

impl Dispatcher {
    pub(crate) fn new(client_config: ClientConfig) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(client_config)),
        }
    }

    /// Resolves, connects and sends `request`, returning once the response head has arrived.
    ///
    /// Timing fields are measured relative to `started`.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub(crate) async fn send(
        &self,
        request: &RequestData,
        started: Instant,
        mut timing: Timing,
    ) -> Result<Upstream, Error> {
        let elapsed = || started.elapsed().as_secs_f64() * 1000.0;

        let secure = match request.url.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => return Err(Error::UnsupportedScheme(other.unwrap_or_default().to_owned())),
        };
        let host = request
            .url
            .host()
            .ok_or_else(|| Error::InvalidUrl(request.url.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = request
            .url
            .port_u16()
            .unwrap_or(if secure { 443 } else { 80 });

        let addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => {
                timing.domain_lookup_start = elapsed();
                let addrs = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .map_err(|source| Error::Resolve {
                        host: host.clone(),
                        source,
                    })?
                    .collect();
                timing.domain_lookup_end = elapsed();
                addrs
            }
        };

        timing.connect_start = elapsed();
        let (tcp, addr) = connect(&host, &addrs).await?;
        let _ = tcp.set_nodelay(true);
        let server_addr = ServerAddr {
            ip_address: addr.ip().to_string(),
            port: addr.port(),
        };

        let counters = Arc::new(WireCounters::default());
        let (mut sender, security_details) = if secure {
            timing.secure_connection_start = elapsed();
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| Error::InvalidUrl(request.url.to_string()))?;
            let tls = self
                .connector
                .connect(server_name, tcp)
                .instrument(info_span!("upstream_tls"))
                .await
                .map_err(|source| Error::UpstreamTls {
                    host: host.clone(),
                    source,
                })?;
            let security_details = security_details(tls.get_ref().1);
            let sender = handshake(Recorded {
                inner: tls,
                counters: Arc::clone(&counters),
            })
            .await?;
            (sender, Some(security_details))
        } else {
            let sender = handshake(Recorded {
                inner: tcp,
                counters: Arc::clone(&counters),
            })
            .await?;
            (sender, None)
        };
        timing.connect_end = elapsed();

        let req = build_request(request)?;

        timing.request_start = elapsed();
        let response = sender.send_request(req).await?;
        timing.response_start = elapsed();

        debug!(status = %response.status(), "Received response head");

        Ok(Upstream {
            response,
            counters,
            security_details,
            server_addr,
            timing,
        })
    }

    /// Sends `request` and reads the whole response.
    pub(crate) async fn fetch(&self, request: &RequestData) -> Result<FetchResponse, Error> {
        let started = Instant::now();
        let upstream = self.send(request, started, Timing::new(0.0)).await?;
        let (parts, body) = upstream.response.into_parts();
        let body = body.collect().await?.to_bytes();

        let mut headers = Headers::from(&parts.headers);
        headers.remove(header::TRANSFER_ENCODING.as_str());
        headers.set(header::CONTENT_LENGTH.as_str(), body.len().to_string());

        Ok(FetchResponse {
            url: request.url.to_string(),
            status: parts.status.as_u16(),
            status_text: reason_phrase(&parts),
            headers,
            body,
        })
    }
}

/// The reason phrase sent by the origin, or the canonical one for the status code.
pub(crate) fn reason_phrase(parts: &http::response::Parts) -> String {
    match parts.extensions.get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => status_text(parts.status.as_u16()),
    }
}

async fn connect(host: &str, addrs: &[SocketAddr]) -> Result<(TcpStream, SocketAddr), Error> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");

    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(tcp) => return Ok((tcp, *addr)),
            Err(err) => {
                debug!(%addr, "Failed to connect: {}", err);
                last_err = err;
            }
        }
    }

    Err(Error::Connect {
        addr: host.to_owned(),
        source: last_err,
    })
}

async fn handshake<S>(io: S) -> Result<SendRequest<Body>, Error>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(io))
        .await?;

    tokio::spawn(
        async move {
            if let Err(err) = conn.with_upgrades().await {
                debug!("Upstream connection closed: {}", err);
            }
        }
        .in_current_span(),
    );

    Ok(sender)
}

fn build_request(request: &RequestData) -> Result<hyper::Request<Body>, Error> {
    let mut headers = request.headers.to_header_map()?;
    normalize_headers(&mut headers, request)?;

    let body = match &request.post_data {
        Some(post_data) => Body::from(post_data.clone()),
        None => Body::empty(),
    };

    let mut req = hyper::Request::builder()
        .method(request.method.clone())
        .uri(request.target())
        .version(Version::HTTP_11)
        .body(body)
        .map_err(|_| Error::InvalidUrl(request.url.to_string()))?;
    *req.headers_mut() = headers;

    Ok(req)
}

/// Prepares client headers for an HTTP/1.1 origin.
fn normalize_headers(headers: &mut HeaderMap, request: &RequestData) -> Result<(), Error> {
    headers.remove("proxy-connection");
    headers.remove(header::PROXY_AUTHORIZATION);

    let authority = request
        .url
        .authority()
        .ok_or_else(|| Error::InvalidUrl(request.url.to_string()))?;
    let host = HeaderValue::from_str(authority.as_str())
        .map_err(|_| Error::InvalidHeader(authority.to_string()))?;
    headers.insert(header::HOST, host);

    // HTTP/2 supports multiple cookie headers, but HTTP/1.x only supports one.
    if let Entry::Occupied(mut cookies) = headers.entry(header::COOKIE) {
        let joined_cookies = bstr::join(b"; ", cookies.iter().map(|cookie| cookie.as_bytes()));
        let joined_cookies = HeaderValue::from_bytes(&joined_cookies)
            .map_err(|_| Error::InvalidHeader(joined_cookies.to_str_lossy().into_owned()))?;
        cookies.insert(joined_cookies);
    }

    if let Some(post_data) = &request.post_data {
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(post_data.len()));
    } else if headers.contains_key(header::TRANSFER_ENCODING) {
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
    }

    Ok(())
}

fn security_details(conn: &ClientConnection) -> SecurityDetails {
    let protocol = conn.protocol_version().map(|version| match version {
        ProtocolVersion::TLSv1_3 => "TLS 1.3".to_owned(),
        ProtocolVersion::TLSv1_2 => "TLS 1.2".to_owned(),
        other => format!("{other:?}"),
    });

    let mut details = SecurityDetails {
        protocol,
        ..SecurityDetails::default()
    };

    let Some(leaf) = conn.peer_certificates().and_then(|certs| certs.first()) else {
        return details;
    };
    if let Ok((_, cert)) = x509_parser::parse_x509_certificate(leaf) {
        let common_name = |name: &x509_parser::x509::X509Name<'_>| {
            name.iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_owned)
        };

        details.issuer = common_name(cert.issuer());
        details.subject_name = common_name(cert.subject());
        details.valid_from = Some(cert.validity().not_before.timestamp());
        details.valid_to = Some(cert.validity().not_after.timestamp());
    }

    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn request(headers: &[(&str, &str)], post_data: Option<&'static str>) -> RequestData {
        RequestData {
            method: Method::POST,
            url: "http://example.com:8080/submit?x=1".parse().unwrap(),
            headers: headers.iter().copied().collect(),
            post_data: post_data.map(|s| hyper::body::Bytes::from_static(s.as_bytes())),
        }
    }

    mod wire_counter {
        use super::*;

        #[test]
        fn splits_head_from_body() {
            let counter = WireCounter::default();
            counter.record(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello");

            assert_eq!(counter.head_len(), 38);
            assert_eq!(counter.body_len(), 5);
        }

        #[test]
        fn terminator_split_across_writes() {
            let counter = WireCounter::default();
            counter.record(b"GET / HTTP/1.1\r\nhost: a\r");
            counter.record(b"\n\r");
            counter.record(b"\nbody");

            assert_eq!(counter.head_len(), 27);
            assert_eq!(counter.body_len(), 4);
        }

        #[test]
        fn partial_terminators_reset() {
            let counter = WireCounter::default();
            counter.record(b"a\r\nb\r\r\n\r\nc");

            assert_eq!(counter.head_len(), 9);
            assert_eq!(counter.body_len(), 1);
        }

        #[test]
        fn unterminated_head_counts_everything() {
            let counter = WireCounter::default();
            counter.record(b"HTTP/1.1 200 OK\r\n");

            assert_eq!(counter.head_len(), 17);
            assert_eq!(counter.body_len(), 0);
        }
    }

    mod normalize_headers {
        use super::*;

        #[test]
        fn sets_host_from_url() {
            let request = request(&[("host", "stale.example.com")], None);
            let mut headers = request.headers.to_header_map().unwrap();

            normalize_headers(&mut headers, &request).unwrap();

            assert_eq!(headers.get(header::HOST).unwrap(), "example.com:8080");
        }

        #[test]
        fn joins_cookies() {
            let request = request(&[("cookie", "foo=bar"), ("cookie", "baz=qux")], None);
            let mut headers = request.headers.to_header_map().unwrap();

            normalize_headers(&mut headers, &request).unwrap();

            assert_eq!(headers.get_all(header::COOKIE).iter().count(), 1);
            assert_eq!(headers.get(header::COOKIE).unwrap(), "foo=bar; baz=qux");
        }

        #[test]
        fn strips_proxy_headers() {
            let request = request(
                &[
                    ("proxy-connection", "keep-alive"),
                    ("proxy-authorization", "Basic Zm9vOmJhcg=="),
                ],
                None,
            );
            let mut headers = request.headers.to_header_map().unwrap();

            normalize_headers(&mut headers, &request).unwrap();

            assert!(!headers.contains_key("proxy-connection"));
            assert!(!headers.contains_key(header::PROXY_AUTHORIZATION));
        }

        #[test]
        fn buffered_bodies_get_content_length() {
            let request = request(&[("transfer-encoding", "chunked")], Some("hello"));
            let mut headers = request.headers.to_header_map().unwrap();

            normalize_headers(&mut headers, &request).unwrap();

            assert!(!headers.contains_key(header::TRANSFER_ENCODING));
            assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "5");
        }
    }

    #[test]
    fn requests_use_origin_form() {
        let req = build_request(&request(&[], Some("hello"))).unwrap();

        assert_eq!(req.uri(), "/submit?x=1");
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.version(), Version::HTTP_11);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let dispatcher = Dispatcher::new(
            ClientConfig::builder_with_provider(Arc::new(
                tokio_rustls::rustls::crypto::aws_lc_rs::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(tokio_rustls::rustls::RootCertStore::empty())
            .with_no_client_auth(),
        );
        let mut request = request(&[], None);
        request.url = "ftp://example.com/file".parse().unwrap();

        let err = dispatcher
            .send(&request, Instant::now(), Timing::new(0.0))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::UnsupportedScheme(scheme) if scheme == "ftp"));
    }
}
