#![cfg_attr(docsrs, feature(doc_cfg))]

//! Interpose is a programmable intercepting HTTP/S proxy that allows you to:
//!
//! - Observe every request and response passing through it
//! - Route requests to handlers that continue, modify, fulfill or abort them
//! - Wait for specific requests or responses, with timeouts
//!
//! HTTPS is intercepted by terminating TLS with certificates issued on the fly by a
//! [`certificate_authority::CertificateAuthority`]; clients must trust its root.
//!
//! ## Features
//!
//! - `webpki-roots`: Enables [`builder::ProxyBuilder::with_webpki_roots`] (enabled by default).
//!
//! # Examples
//!
//! ```rust,no_run
//! use interpose::{
//!     EventKind, FulfillOptions, Overrides, Proxy,
//!     certificate_authority::RcgenAuthority,
//!     rustls::crypto::aws_lc_rs,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), interpose::Error> {
//! let ca = RcgenAuthority::generate(1_000, aws_lc_rs::default_provider())?;
//!
//! let proxy = Proxy::builder()
//!     .with_addr(std::net::SocketAddr::from(([127, 0, 0, 1], 3000)))
//!     .with_ca(ca)
//!     .with_webpki_roots()
//!     .build();
//! let handle = proxy.handle();
//!
//! handle.route("**/api/**", |route| async move {
//!     let overrides = Overrides::new().header("x-intercepted", "true");
//!     route.continue_(overrides)?;
//!     Ok(())
//! });
//!
//! handle.route("**/*.png", |route| async move {
//!     route.fulfill(FulfillOptions::new().status(404))?;
//!     Ok(())
//! });
//!
//! handle.on(EventKind::RequestFinished, |event| {
//!     println!("{} finished", event.request().url());
//! });
//!
//! proxy.start(std::future::pending()).await
//! # }
//! ```

mod body;
mod error;
mod events;
mod exchange;
mod headers;
mod network;
mod proxy;
mod rewind;
mod route;
mod upstream;

pub mod certificate_authority;

pub use futures;
pub use hyper;
pub use hyper_util;
pub use rcgen;
pub use tokio_rustls::rustls;

pub use body::Body;
pub use error::Error;
pub use events::{EventKind, ListenerId, ProxyEvent};
pub use headers::{Header, Headers};
pub use network::{
    Failure, Request, Response, SecurityDetails, ServerAddr, ServiceWorker, Sizes, Timing,
};
pub use proxy::*;
pub use route::{FetchResponse, FulfillOptions, HandlerError, Overrides, Route, UrlMatcher};
