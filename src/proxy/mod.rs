mod internal;

pub mod builder;

use crate::{
    Error,
    certificate_authority::CertificateAuthority,
    events::{EventBus, EventKind, ListenerId, ProxyEvent},
    network::{Request, Response},
    route::{HandlerError, Route, Router, UrlMatcher},
    upstream::Dispatcher,
};
use builder::{AddrOrListener, WantsAddr};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use internal::InternalProxy;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_graceful::Shutdown;
use tracing::error;

pub use builder::ProxyBuilder;

/// State shared by every connection of a proxy and its handles.
pub(crate) struct Core {
    pub(crate) router: Router,
    pub(crate) bus: EventBus,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

/// A proxy server. This must be constructed with a [`ProxyBuilder`].
///
/// # Examples
///
/// ```rust,no_run
/// use interpose::{
///     FulfillOptions, Proxy,
///     certificate_authority::RcgenAuthority,
///     rustls::crypto::aws_lc_rs,
/// };
///
/// # #[tokio::main]
/// # async fn main() {
/// let ca = RcgenAuthority::generate(1_000, aws_lc_rs::default_provider())
///     .expect("Failed to create Certificate Authority");
///
/// let proxy = Proxy::builder()
///     .with_addr(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
///     .with_ca(ca)
///     .with_webpki_roots()
///     .build();
///
/// proxy.handle().route("**/*.png", |route| async move {
///     route.fulfill(FulfillOptions::new().status(404))?;
///     Ok(())
/// });
///
/// let (stop, done) = tokio::sync::oneshot::channel();
///
/// tokio::spawn(proxy.start(async {
///     done.await.unwrap_or_default();
/// }));
///
/// // Do something else...
///
/// stop.send(()).unwrap();
/// # }
/// ```
pub struct Proxy<CA> {
    al: AddrOrListener,
    ca: Arc<CA>,
    core: Arc<Core>,
    server: hyper::server::conn::http1::Builder,
}

impl Proxy<()> {
    /// Create a new [`ProxyBuilder`].
    pub fn builder() -> ProxyBuilder<WantsAddr> {
        ProxyBuilder::new()
    }
}

impl<CA: CertificateAuthority> Proxy<CA> {
    /// Returns a handle for registering routes and observing traffic. Handles stay usable while
    /// the proxy runs.
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Attempts to start the proxy server.
    ///
    /// The proxy stops accepting connections once `shutdown_signal` resolves and returns after
    /// in-flight connections have drained. Pending waiters fail with [`Error::Closed`].
    ///
    /// # Errors
    ///
    /// This will return an error if the proxy server is unable to be started.
    pub async fn start<F: Future<Output = ()> + Send + 'static>(
        self,
        shutdown_signal: F,
    ) -> Result<(), Error> {
        let listener = match self.al {
            AddrOrListener::Addr(addr) => TcpListener::bind(addr).await?,
            AddrOrListener::Listener(listener) => listener,
        };

        let shutdown = Shutdown::new(shutdown_signal);
        let guard = shutdown.guard_weak();

        loop {
            tokio::select! {
                res = listener.accept() => {
                    let (tcp, client_addr) = match res {
                        Ok((tcp, client_addr)) => (tcp, client_addr),
                        Err(e) => {
                            error!("Failed to accept incoming connection: {}", e);
                            continue;
                        }
                    };

                    let server = self.server.clone();
                    let ca = Arc::clone(&self.ca);
                    let core = Arc::clone(&self.core);

                    shutdown.spawn_task_fn(move |guard| async move {
                        let proxy = InternalProxy {
                            ca,
                            core,
                            server: server.clone(),
                            client_addr,
                        };

                        let conn = server
                            .serve_connection(
                                TokioIo::new(tcp),
                                service_fn(move |req| proxy.clone().proxy(req)),
                            )
                            .with_upgrades();

                        let mut conn = std::pin::pin!(conn);

                        if let Err(err) = tokio::select! {
                            conn = conn.as_mut() => conn,
                            _ = guard.cancelled() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        } {
                            error!("Error serving connection: {}", err);
                        }
                    });
                }
                _ = guard.cancelled() => {
                    break;
                }
            }
        }

        self.core.bus.close();
        shutdown.shutdown().await;

        Ok(())
    }
}

/// Registers route handlers, subscribes to events and waits for traffic on a running proxy.
#[derive(Clone)]
pub struct ProxyHandle {
    core: Arc<Core>,
}

impl ProxyHandle {
    /// Routes requests matching `matcher` to `handler`.
    ///
    /// The newest matching handler runs first; it decides the request's fate by calling one of
    /// [`Route::continue_`], [`Route::fallback`], [`Route::fulfill`] or [`Route::abort`]. Returning
    /// an error, or panicking, aborts the request.
    pub fn route<M, F, Fut>(&self, matcher: M, handler: F)
    where
        M: Into<UrlMatcher>,
        F: Fn(Route) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.core.router.route(matcher.into(), None, handler);
    }

    /// Like [`ProxyHandle::route`], but the handler is removed after it has been invoked `times`
    /// times.
    pub fn route_times<M, F, Fut>(&self, matcher: M, times: usize, handler: F)
    where
        M: Into<UrlMatcher>,
        F: Fn(Route) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.core.router.route(matcher.into(), Some(times), handler);
    }

    /// Removes the handlers registered with an equal matcher, returning how many were removed.
    /// Requests already being routed are unaffected.
    pub fn unroute(&self, matcher: impl Into<UrlMatcher>) -> usize {
        self.core.router.unroute(&matcher.into())
    }

    pub fn unroute_all(&self) {
        self.core.router.unroute_all();
    }

    /// Calls `listener` for every event of `kind`, on the task that produced it.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ProxyEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.core.bus.on(kind, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.bus.remove_listener(id)
    }

    /// Waits for the next event of `kind` accepted by `predicate`.
    ///
    /// `timeout` defaults to the proxy's default timeout; a zero timeout waits forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the timeout elapses first, [`Error::Closed`] when the
    /// proxy shuts down and [`Error::Handler`] when `predicate` panics.
    pub async fn wait_for_event(
        &self,
        kind: EventKind,
        predicate: impl Fn(&ProxyEvent) -> bool + Send + Sync + 'static,
        timeout: Option<Duration>,
    ) -> Result<ProxyEvent, Error> {
        self.core.bus.wait_for_event(kind, predicate, timeout).await
    }

    /// Waits for a request whose URL matches `matcher`.
    pub async fn wait_for_request(
        &self,
        matcher: impl Into<UrlMatcher>,
        timeout: Option<Duration>,
    ) -> Result<Request, Error> {
        self.core.bus.wait_for_request(matcher.into(), timeout).await
    }

    /// Waits for a response whose URL matches `matcher`.
    pub async fn wait_for_response(
        &self,
        matcher: impl Into<UrlMatcher>,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        self.core.bus.wait_for_response(matcher.into(), timeout).await
    }
}
