#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use interpose::{
    Proxy, ProxyHandle,
    certificate_authority::{CertificateAuthority, RcgenAuthority},
    hyper::{
        Method, Request, Response, StatusCode,
        body::{Bytes, Incoming},
        server::conn::http1,
        service::service_fn,
    },
    hyper_util::rt::TokioIo,
    rustls::{
        RootCertStore,
        crypto::aws_lc_rs,
        pki_types::{CertificateDer, pem::PemObject},
    },
};
use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::{mpsc, oneshot::Sender},
};
use tokio_rustls::TlsAcceptor;

pub const HELLO_WORLD: &str = "Hello, World!";
pub const GOLDEN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello";

async fn test_server(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let res = match (req.method(), req.uri().path()) {
        (&Method::GET, "/hello") => Response::new(Full::from(HELLO_WORLD)),
        (&Method::POST, "/echo") => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::new(Full::new(body))
        }
        (_, "/headers") => {
            let headers: BTreeMap<_, _> = req
                .headers()
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_str().unwrap().to_owned()))
                .collect();
            Response::builder()
                .header("content-type", "application/json")
                .body(Full::from(serde_json::to_string(&headers).unwrap()))
                .unwrap()
        }
        (_, "/missing") => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::from("not here"))
            .unwrap(),
        _ => {
            let target = req.uri().path_and_query().unwrap().to_string();
            Response::new(Full::from(format!("{} {}", req.method(), target)))
        }
    };

    Ok(res)
}

fn serve<F>(listener: TcpListener, accept: F) -> Sender<()>
where
    F: Fn(tokio::net::TcpStream) + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                res = listener.accept() => {
                    if let Ok((tcp, _)) = res {
                        accept(tcp);
                    }
                }
                _ = &mut rx => break,
            }
        }
    });

    tx
}

pub async fn start_http_server() -> Result<(SocketAddr, Sender<()>), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;

    let tx = serve(listener, |tcp| {
        tokio::spawn(
            http1::Builder::new().serve_connection(TokioIo::new(tcp), service_fn(test_server)),
        );
    });

    Ok((addr, tx))
}

/// Serves HTTPS for `localhost` with a certificate issued by `upstream_ca`.
pub async fn start_https_server(
    upstream_ca: &RcgenAuthority,
) -> Result<(SocketAddr, Sender<()>), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    let acceptor = TlsAcceptor::from(upstream_ca.gen_server_config("localhost").await?);

    let tx = serve(listener, move |tcp| {
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let Ok(tls) = acceptor.accept(tcp).await else {
                return;
            };
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service_fn(test_server))
                .await;
        });
    });

    Ok((addr, tx))
}

/// A server that answers every request with [`GOLDEN_RESPONSE`] and reports the exact bytes it
/// received.
pub async fn start_raw_server()
-> Result<(SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>, Sender<()>), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();

    let tx = serve(listener, move |mut tcp| {
        let requests_tx = requests_tx.clone();
        tokio::spawn(async move {
            let request = read_request(&mut tcp).await;
            tcp.write_all(GOLDEN_RESPONSE).await.unwrap();
            let _ = requests_tx.send(request);
        });
    });

    Ok((addr, requests_rx, tx))
}

/// A server that promises a 100 byte body, sends 5 bytes of it and hangs up.
pub async fn start_truncating_server() -> Result<(SocketAddr, Sender<()>), Box<dyn std::error::Error>>
{
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;

    let tx = serve(listener, |mut tcp| {
        tokio::spawn(async move {
            read_request(&mut tcp).await;
            tcp.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nhello")
                .await
                .unwrap();
            tcp.shutdown().await.unwrap();
        });
    });

    Ok((addr, tx))
}

async fn read_request(tcp: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut buffer = [0; 1024];

    let head_len = loop {
        let n = tcp.read(&mut buffer).await.unwrap();
        request.extend_from_slice(&buffer[..n]);
        if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if n == 0 {
            return request;
        }
    };

    let head = String::from_utf8_lossy(&request[..head_len]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map_or(0, |value| value.trim().parse::<usize>().unwrap());

    while request.len() < head_len + content_length {
        let n = tcp.read(&mut buffer).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..n]);
    }

    request
}

pub fn build_ca() -> RcgenAuthority {
    RcgenAuthority::generate(1_000, aws_lc_rs::default_provider())
        .expect("Failed to create Certificate Authority")
}

pub fn roots_for(ca: &RcgenAuthority) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let cert = CertificateDer::from_pem_slice(ca.ca_cert_pem().unwrap().as_bytes()).unwrap();
    roots.add(cert).unwrap();
    roots
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub handle: ProxyHandle,
    pub ca_cert_pem: String,
    stop: Option<Sender<()>>,
}

impl TestProxy {
    pub fn client(&self) -> reqwest::Client {
        build_client(&self.addr.to_string(), &self.ca_cert_pem)
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Starts a proxy that trusts `upstream_roots` for upstream TLS.
pub async fn start_proxy(
    upstream_roots: RootCertStore,
) -> Result<TestProxy, Box<dyn std::error::Error>> {
    start_proxy_with_timeout(upstream_roots, Duration::from_secs(5)).await
}

pub async fn start_proxy_with_timeout(
    upstream_roots: RootCertStore,
    default_timeout: Duration,
) -> Result<TestProxy, Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = tokio::sync::oneshot::channel();

    let ca = build_ca();
    let ca_cert_pem = ca.ca_cert_pem().unwrap().to_owned();

    let proxy = Proxy::builder()
        .with_listener(listener)
        .with_ca(ca)
        .with_root_certificates(upstream_roots)
        .with_default_timeout(default_timeout)
        .build();
    let handle = proxy.handle();

    tokio::spawn(proxy.start(async {
        rx.await.unwrap_or_default();
    }));

    Ok(TestProxy {
        addr,
        handle,
        ca_cert_pem,
        stop: Some(tx),
    })
}

pub fn build_client(proxy: &str, ca_cert_pem: &str) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{proxy}")).unwrap();
    let ca_cert = reqwest::Certificate::from_pem(ca_cert_pem.as_bytes()).unwrap();

    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_cert)
        .build()
        .unwrap()
}
