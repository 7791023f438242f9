use crate::{
    Body, Error,
    body::BodySender,
    certificate_authority::CertificateAuthority,
    exchange::{Exchange, RequestData, ResponseData},
    headers::{self, Headers},
    network::Timing,
    proxy::Core,
    rewind::Rewind,
    route::{Fulfillment, Outcome},
    upstream::{Upstream, WireCounters, reason_phrase},
};
use futures::SinkExt;
use http::uri::{Authority, Scheme};
use http_body_util::BodyExt;
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::{Bytes, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpStream,
    task::JoinHandle,
};
use tokio_rustls::{LazyConfigAcceptor, rustls::server::Acceptor};
use tracing::{Instrument, Span, debug, error, info_span, instrument, warn};

fn bad_request() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::empty())
        .expect("Failed to build response")
}

fn bad_gateway() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::empty())
        .expect("Failed to build response")
}

fn spawn_with_trace<T: Send + Sync + 'static>(
    fut: impl Future<Output = T> + Send + 'static,
    span: Span,
) -> JoinHandle<T> {
    tokio::spawn(fut.instrument(span))
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(header::UPGRADE)
        && req
            .headers()
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Settles an exchange silently if the request future is dropped before the exchange is handed
/// off, which happens when the client connection goes away.
struct AbandonOnDrop(Option<Arc<Exchange>>);

impl AbandonOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if let Some(exchange) = self.0.take() {
            exchange.abandon();
        }
    }
}

pub(crate) struct InternalProxy<CA> {
    pub ca: Arc<CA>,
    pub core: Arc<Core>,
    pub server: http1::Builder,
    pub client_addr: SocketAddr,
}

impl<CA> Clone for InternalProxy<CA> {
    fn clone(&self) -> Self {
        InternalProxy {
            ca: Arc::clone(&self.ca),
            core: Arc::clone(&self.core),
            server: self.server.clone(),
            client_addr: self.client_addr,
        }
    }
}

impl<CA: CertificateAuthority> InternalProxy<CA> {
    #[instrument(
        skip_all,
        fields(
            version = ?req.version(),
            method = %req.method(),
            uri = %req.uri(),
            client_addr = %self.client_addr,
        )
    )]
    pub(crate) async fn proxy(self, req: Request<Incoming>) -> Result<Response<Body>, Error> {
        if req.method() == Method::CONNECT {
            Ok(self.process_connect(req))
        } else if req.uri().scheme().is_none() || req.uri().authority().is_none() {
            Ok(bad_request())
        } else if is_upgrade_request(&req) {
            self.upgrade(req).instrument(info_span!("upgrade")).await
        } else {
            self.intercept(req).await
        }
    }

    async fn intercept(self, req: Request<Incoming>) -> Result<Response<Body>, Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();

        let exchange = Exchange::new(RequestData {
            method: parts.method,
            url: parts.uri,
            headers: Headers::from(&parts.headers),
            post_data: (!body.is_empty()).then_some(body),
        });
        let guard = AbandonOnDrop(Some(Arc::clone(&exchange)));

        exchange.announce(&self.core.bus);

        let outcome = self
            .core
            .router
            .run(&exchange, &self.core.dispatcher)
            .instrument(info_span!("route", id = exchange.id()))
            .await;

        let res = match outcome {
            Outcome::Abort(error_text) => {
                debug!(id = exchange.id(), %error_text, "Aborting request");
                exchange.fail(&self.core.bus, error_text.as_str());
                Err(Error::Aborted(error_text))
            }
            Outcome::Fulfill(fulfillment) => self.fulfill(&exchange, fulfillment),
            Outcome::Dispatch => Ok(self
                .forward(&exchange)
                .instrument(info_span!("proxy_request", id = exchange.id()))
                .await),
        };

        guard.disarm();
        res
    }

    fn fulfill(
        &self,
        exchange: &Arc<Exchange>,
        fulfillment: Fulfillment,
    ) -> Result<Response<Body>, Error> {
        let Fulfillment {
            status,
            status_text,
            headers,
            body,
        } = fulfillment;

        let res = StatusCode::from_u16(status)
            .map_err(|_| Error::InvalidHeader(format!("status {status}")))
            .and_then(|status| {
                let mut res = Response::new(Body::from(body.clone()));
                *res.status_mut() = status;
                *res.headers_mut() = headers.to_header_map()?;
                Ok(res)
            });
        let res = match res {
            Ok(res) => res,
            Err(err) => {
                exchange.fail(&self.core.bus, err.to_string());
                return Err(err);
            }
        };

        let request = exchange.request();
        let response_end = exchange.elapsed_ms();
        exchange.record(|timing, sizes| {
            timing.response_end = response_end;
            sizes.request_headers_size = request.head_len() as u64;
            sizes.request_body_size = request.post_data.as_ref().map_or(0, |b| b.len() as u64);
            sizes.response_headers_size = headers::response_head_len(&status_text, &headers) as u64;
            sizes.response_body_size = body.len() as u64;
        });

        exchange.respond(
            &self.core.bus,
            ResponseData {
                url: request.url.to_string(),
                status,
                status_text,
                headers,
                security_details: None,
                server_addr: None,
            },
        );
        exchange.finish(&self.core.bus, body);

        Ok(res)
    }

    async fn forward(&self, exchange: &Arc<Exchange>) -> Response<Body> {
        let request = exchange.request();

        let upstream = match self
            .core
            .dispatcher
            .send(&request, exchange.started(), exchange.timing())
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                error!("Failed to forward request: {}", err);
                exchange.fail(&self.core.bus, err.to_string());
                return bad_gateway();
            }
        };

        let Upstream {
            response,
            counters,
            security_details,
            server_addr,
            timing,
        } = upstream;
        let (parts, body) = response.into_parts();

        exchange.record(|t, sizes| {
            *t = timing;
            sizes.request_headers_size = counters.sent.head_len();
            sizes.request_body_size = counters.sent.body_len();
            sizes.response_headers_size = counters.received.head_len();
        });

        exchange.respond(
            &self.core.bus,
            ResponseData {
                url: request.url.to_string(),
                status: parts.status.as_u16(),
                status_text: reason_phrase(&parts),
                headers: Headers::from(&parts.headers),
                security_details,
                server_addr: Some(server_addr),
            },
        );

        let (tx, client_body) = Body::channel(16);
        spawn_with_trace(
            relay(Arc::clone(exchange), Arc::clone(&self.core), body, counters, tx),
            info_span!("relay_body", id = exchange.id()),
        );

        Response::from_parts(parts, client_body)
    }

    /// Forwards an upgrade request and splices both connections once the origin switches
    /// protocols. Upgrades bypass the route handlers.
    async fn upgrade(self, mut req: Request<Incoming>) -> Result<Response<Body>, Error> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _) = req.into_parts();
        let request = RequestData {
            method: parts.method,
            url: parts.uri,
            headers: Headers::from(&parts.headers),
            post_data: None,
        };

        let upstream = match self
            .core
            .dispatcher
            .send(&request, Instant::now(), Timing::new(0.0))
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                error!("Failed to forward upgrade request: {}", err);
                return Ok(bad_gateway());
            }
        };

        let mut response = upstream.response;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            return Ok(Response::from_parts(parts, Body::from(body)));
        }

        let server_upgrade = hyper::upgrade::on(&mut response);
        let authority = request.url.authority().cloned();
        let fut = async move {
            match tokio::try_join!(client_upgrade, server_upgrade) {
                Ok((client, server)) => {
                    let mut client = TokioIo::new(client);
                    let mut server = TokioIo::new(server);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut server).await {
                        debug!("Upgraded connection closed: {}", e);
                    }
                }
                Err(e) => error!("Upgrade error: {}", e),
            }
        };
        spawn_with_trace(fut, info_span!("upgraded", authority = ?authority));

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, Body::empty()))
    }

    fn process_connect(self, mut req: Request<Incoming>) -> Response<Body> {
        match req.uri().authority().cloned() {
            Some(authority) => {
                let span = info_span!("process_connect");
                let fut = async move {
                    match hyper::upgrade::on(&mut req).await {
                        Ok(upgraded) => {
                            let mut upgraded = TokioIo::new(upgraded);
                            let mut buffer = [0; 4];
                            let bytes_read = match peek(&mut upgraded, &mut buffer).await {
                                Ok(bytes_read) => bytes_read,
                                Err(e) => {
                                    error!("Failed to read from upgraded connection: {}", e);
                                    return;
                                }
                            };

                            let mut upgraded = Rewind::new_buffered(
                                upgraded,
                                Bytes::copy_from_slice(&buffer[..bytes_read]),
                            );

                            if bytes_read >= 2 && buffer[..2] == *b"\x16\x03" {
                                self.serve_tls(upgraded, authority).await;
                                return;
                            } else if looks_like_http(&buffer[..bytes_read]) {
                                if let Err(e) =
                                    self.serve_stream(upgraded, Scheme::HTTP, authority).await
                                {
                                    error!("HTTP connect error: {}", e);
                                }
                                return;
                            } else {
                                warn!(
                                    "Unknown protocol, read '{:02X?}' from upgraded connection",
                                    &buffer[..bytes_read]
                                );
                            }

                            let mut server = match TcpStream::connect(authority.as_str()).await {
                                Ok(server) => server,
                                Err(e) => {
                                    error!("Failed to connect to {}: {}", authority, e);
                                    return;
                                }
                            };

                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut upgraded, &mut server).await
                            {
                                error!("Failed to tunnel to {}: {}", authority, e);
                            }
                        }
                        Err(e) => error!("Upgrade error: {}", e),
                    };
                };

                spawn_with_trace(fut, span);
                Response::new(Body::empty())
            }
            None => bad_request(),
        }
    }

    /// Terminates TLS with a certificate issued for the SNI host, falling back to the CONNECT
    /// host when the client sent no SNI.
    async fn serve_tls<I>(self, stream: I, authority: Authority)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let start = match LazyConfigAcceptor::new(Acceptor::default(), stream).await {
            Ok(start) => start,
            Err(e) => {
                error!("Failed to read TLS ClientHello: {}", e);
                return;
            }
        };

        let host = start
            .client_hello()
            .server_name()
            .map(str::to_owned)
            .unwrap_or_else(|| {
                authority
                    .host()
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_owned()
            });

        let server_config = match self
            .ca
            .gen_server_config(&host)
            .instrument(info_span!("gen_server_config", %host))
            .await
        {
            Ok(server_config) => server_config,
            Err(e) => {
                error!("Failed to issue certificate for {}: {}", host, e);
                return;
            }
        };

        let stream = match start.into_stream(server_config).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to establish TLS connection: {}", e);
                return;
            }
        };

        if let Err(e) = self.serve_stream(stream, Scheme::HTTPS, authority).await {
            if !e.to_string().starts_with("error shutting down connection") {
                error!("HTTPS connect error: {}", e);
            }
        }
    }

    #[instrument(skip_all)]
    async fn serve_stream<I>(
        self,
        stream: I,
        scheme: Scheme,
        authority: Authority,
    ) -> Result<(), hyper::Error>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.server.clone();
        let service = service_fn(move |mut req: Request<Incoming>| {
            if req.version() == hyper::Version::HTTP_10 || req.version() == hyper::Version::HTTP_11
            {
                if let Ok(uri) = with_origin(req.uri(), &scheme, &authority) {
                    *req.uri_mut() = uri;
                }
            }

            self.clone().proxy(req)
        });

        server
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
    }
}

/// Streams the upstream body to the client while buffering it for the exchange.
async fn relay(
    exchange: Arc<Exchange>,
    core: Arc<Core>,
    mut body: Incoming,
    counters: Arc<WireCounters>,
    mut tx: BodySender,
) {
    let mut buffer = Vec::new();

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buffer.extend_from_slice(&data);
                if tx.send(Ok(data)).await.is_err() {
                    exchange.abandon();
                    return;
                }
            }
            Err(err) => {
                error!("Failed to read response body: {}", err);
                exchange.fail(&core.bus, err.to_string());
                let _ = tx.send(Err(Error::Network(err))).await;
                return;
            }
        }
    }

    let response_end = exchange.elapsed_ms();
    exchange.record(|timing, sizes| {
        timing.response_end = response_end;
        sizes.response_body_size = counters.received.body_len();
    });
    exchange.finish(&core.bus, Bytes::from(buffer));
}

/// Reads up to `buffer.len()` bytes, stopping early only at end of stream.
async fn peek<I: AsyncRead + Unpin>(stream: &mut I, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match stream.read(&mut buffer[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// A request line starts with an upper-case method token.
fn looks_like_http(prefix: &[u8]) -> bool {
    prefix.len() == 4
        && prefix[0].is_ascii_uppercase()
        && prefix
            .iter()
            .all(|b| b.is_ascii_uppercase() || *b == b' ')
}

/// Turns an origin-form target received inside a tunnel into an absolute URI. The default port of
/// the scheme is dropped.
fn with_origin(uri: &Uri, scheme: &Scheme, authority: &Authority) -> Result<Uri, http::Error> {
    let default_port = if *scheme == Scheme::HTTPS { 443 } else { 80 };
    let authority = match authority.port_u16() {
        Some(port) if port == default_port => authority.host().parse()?,
        _ => authority.clone(),
    };

    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(scheme.clone());
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse()?);
    }
    Ok(Uri::from_parts(parts)?)
}
