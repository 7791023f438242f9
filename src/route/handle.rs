use crate::{
    Error,
    exchange::RequestData,
    headers::Headers,
    network::Request,
    upstream::Dispatcher,
};
use http::{HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use hyper::body::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Changes applied to a request before it is sent upstream.
///
/// Header overrides are merged by name into the existing headers: a value replaces every existing
/// value of that header, a header that was not present is added, and [`Overrides::remove_header`]
/// drops it. Later overrides win over earlier ones.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    url: Option<String>,
    method: Option<String>,
    headers: Vec<(String, Option<String>)>,
    post_data: Option<Bytes>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// The new URL must keep the scheme of the URL it replaces.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), Some(value.into())));
        self
    }

    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.headers.push((name.into(), None));
        self
    }

    /// Replaces the body. `content-length` is recomputed to match.
    pub fn post_data(mut self, post_data: impl Into<Bytes>) -> Self {
        self.post_data = Some(post_data.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.headers.is_empty()
            && self.post_data.is_none()
    }

    pub(crate) fn apply(&self, base: &RequestData) -> Result<RequestData, Error> {
        let mut next = base.clone();

        if let Some(url) = &self.url {
            let url: Uri = url.parse().map_err(|_| Error::InvalidUrl(url.clone()))?;
            if url.scheme().is_none() || url.authority().is_none() {
                return Err(Error::InvalidUrl(url.to_string()));
            }
            if url.scheme() != base.url.scheme() {
                return Err(Error::ProtocolChanged);
            }
            next.url = url;
        }

        if let Some(method) = &self.method {
            next.method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|_| Error::InvalidMethod(method.clone()))?;
        }

        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            match value {
                Some(value) => {
                    HeaderValue::from_str(value)
                        .map_err(|_| Error::InvalidHeader(format!("{name}: {value}")))?;
                    next.headers.set(name, value.as_str());
                }
                None => next.headers.remove(name),
            }
        }

        if let Some(post_data) = &self.post_data {
            next.headers.remove(header::TRANSFER_ENCODING.as_str());
            next.headers
                .set(header::CONTENT_LENGTH.as_str(), post_data.len().to_string());
            next.post_data = Some(post_data.clone());
        }

        Ok(next)
    }
}

/// A response obtained with [`Route::fetch`].
#[derive(Clone, Debug)]
pub struct FetchResponse {
    pub(crate) url: String,
    pub(crate) status: u16,
    pub(crate) status_text: String,
    pub(crate) headers: Headers,
    pub(crate) body: Bytes,
}

impl FetchResponse {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn ok(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header_value(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Describes a synthetic response for [`Route::fulfill`].
#[derive(Clone, Debug, Default)]
pub struct FulfillOptions {
    status: Option<u16>,
    headers: Option<Headers>,
    content_type: Option<String>,
    body: Option<Bytes>,
    response: Option<FetchResponse>,
}

impl FulfillOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .append(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Takes status, headers and body from a fetched response wherever they are not set
    /// explicitly.
    pub fn response(mut self, response: FetchResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub(crate) fn build(self, request: &RequestData) -> Fulfillment {
        let Self {
            status,
            headers,
            content_type,
            body,
            response,
        } = self;

        let status = status
            .or(response.as_ref().map(|response| response.status))
            .unwrap_or(200);
        let source = headers.or(response.as_ref().map(|response| response.headers.clone()));
        let body = body
            .or(response.map(|response| response.body))
            .unwrap_or_default();

        let mut headers = Headers::new();
        for header in source.iter().flatten() {
            let name = header.name.to_ascii_lowercase();
            if name == header::SET_COOKIE.as_str() {
                headers.append(name, header.value.as_str());
            } else {
                headers.set(&name, header.value.as_str());
            }
        }
        if let Some(content_type) = content_type {
            headers.set(header::CONTENT_TYPE.as_str(), content_type);
        }
        // Framing always describes the body actually written.
        headers.remove(header::TRANSFER_ENCODING.as_str());
        if !body.is_empty() || headers.contains(header::CONTENT_LENGTH.as_str()) {
            headers.set(header::CONTENT_LENGTH.as_str(), body.len().to_string());
        }
        add_cors_headers(request, &mut headers);

        Fulfillment {
            status,
            status_text: status_text(status),
            headers,
            body,
        }
    }
}

/// A cross-origin request answered by a handler gets the CORS headers the browser would need.
fn add_cors_headers(request: &RequestData, headers: &mut Headers) {
    let Some(origin) = request.headers.get(header::ORIGIN.as_str()) else {
        return;
    };
    if !matches!(request.url.scheme_str(), Some("http" | "https")) {
        return;
    }
    if url_origin(&request.url).as_deref() == Some(origin.trim()) {
        return;
    }
    if headers.contains(header::ACCESS_CONTROL_ALLOW_ORIGIN.as_str()) {
        return;
    }

    headers.append(header::ACCESS_CONTROL_ALLOW_ORIGIN.as_str(), origin);
    headers.append(header::ACCESS_CONTROL_ALLOW_CREDENTIALS.as_str(), "true");
    headers.append(header::VARY.as_str(), "Origin");
}

fn url_origin(url: &Uri) -> Option<String> {
    let scheme = url.scheme_str()?;
    let host = url.host()?;
    let default_port = match scheme {
        "https" => 443,
        _ => 80,
    };

    Some(match url.port_u16() {
        Some(port) if port != default_port => format!("{scheme}://{host}:{port}"),
        _ => format!("{scheme}://{host}"),
    })
}

pub(crate) fn status_text(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or_default()
        .to_owned()
}

/// A response produced by a route handler instead of the network.
#[derive(Debug)]
pub(crate) struct Fulfillment {
    pub(crate) status: u16,
    pub(crate) status_text: String,
    pub(crate) headers: Headers,
    pub(crate) body: Bytes,
}

#[derive(Debug)]
pub(crate) enum Resolution {
    Continue(RequestData),
    Fallback(RequestData),
    Fulfill(Fulfillment),
    Abort(String),
}

pub(crate) type ResolutionSlot = Arc<Mutex<Option<oneshot::Sender<Resolution>>>>;

/// Maps an abort reason to the error text reported on the failed request.
pub(crate) fn error_text(error_code: Option<&str>) -> String {
    let text = match error_code.unwrap_or("failed") {
        "aborted" => "net::ERR_ABORTED",
        "accessdenied" => "net::ERR_ACCESS_DENIED",
        "addressunreachable" => "net::ERR_ADDRESS_UNREACHABLE",
        "blockedbyclient" => "net::ERR_BLOCKED_BY_CLIENT",
        "blockedbyresponse" => "net::ERR_BLOCKED_BY_RESPONSE",
        "connectionaborted" => "net::ERR_CONNECTION_ABORTED",
        "connectionclosed" => "net::ERR_CONNECTION_CLOSED",
        "connectionfailed" => "net::ERR_CONNECTION_FAILED",
        "connectionrefused" => "net::ERR_CONNECTION_REFUSED",
        "connectionreset" => "net::ERR_CONNECTION_RESET",
        "internetdisconnected" => "net::ERR_INTERNET_DISCONNECTED",
        "namenotresolved" => "net::ERR_NAME_NOT_RESOLVED",
        "timedout" => "net::ERR_TIMED_OUT",
        "failed" => "net::ERR_FAILED",
        other => other,
    };
    text.to_owned()
}

/// Control object handed to a route handler.
///
/// Exactly one of [`continue_`](Self::continue_), [`fallback`](Self::fallback),
/// [`fulfill`](Self::fulfill) or [`abort`](Self::abort) resolves the route; calling a second one
/// fails with [`Error::AlreadyHandled`]. [`fetch`](Self::fetch) can be called any number of times
/// before that. A handler that returns without resolving its route leaves the request pending.
pub struct Route {
    request: Request,
    dispatcher: Arc<Dispatcher>,
    slot: ResolutionSlot,
}

impl Route {
    pub(crate) fn new(request: Request, dispatcher: Arc<Dispatcher>, slot: ResolutionSlot) -> Self {
        Self {
            request,
            dispatcher,
            slot,
        }
    }

    pub fn request(&self) -> Request {
        self.request.clone()
    }

    /// Sends the request to the network with `overrides` applied. No other handler runs.
    pub fn continue_(&self, overrides: Overrides) -> Result<(), Error> {
        self.ensure_unhandled()?;
        let next = overrides.apply(&self.request.exchange().request())?;
        self.resolve(Resolution::Continue(next))
    }

    /// Applies `overrides` and passes the request to the next matching handler registered before
    /// this one, or to the network when there is none.
    pub fn fallback(&self, overrides: Overrides) -> Result<(), Error> {
        self.ensure_unhandled()?;
        let next = overrides.apply(&self.request.exchange().request())?;
        self.resolve(Resolution::Fallback(next))
    }

    /// Answers the request without contacting the network.
    pub fn fulfill(&self, options: FulfillOptions) -> Result<(), Error> {
        self.ensure_unhandled()?;
        let fulfillment = options.build(&self.request.exchange().request());
        if http::StatusCode::from_u16(fulfillment.status).is_err() {
            return Err(Error::InvalidHeader(format!("status {}", fulfillment.status)));
        }
        fulfillment.headers.to_header_map()?;
        self.resolve(Resolution::Fulfill(fulfillment))
    }

    /// Fails the request. `error_code` is one of the standard network error codes such as
    /// `"connectionrefused"`; it defaults to `"failed"`.
    pub fn abort(&self, error_code: Option<&str>) -> Result<(), Error> {
        self.resolve(Resolution::Abort(error_text(error_code)))
    }

    /// Performs the request against the network with `overrides` applied and returns the full
    /// response, leaving the route unresolved.
    pub async fn fetch(&self, overrides: Overrides) -> Result<FetchResponse, Error> {
        let request = overrides.apply(&self.request.exchange().request())?;
        self.dispatcher.fetch(&request).await
    }

    fn ensure_unhandled(&self) -> Result<(), Error> {
        match self.slot.lock().as_ref() {
            Some(_) => Ok(()),
            None => Err(Error::AlreadyHandled),
        }
    }

    fn resolve(&self, resolution: Resolution) -> Result<(), Error> {
        let tx = self.slot.lock().take().ok_or(Error::AlreadyHandled)?;
        // The chain stops listening once the client connection is gone.
        let _ = tx.send(resolution);
        Ok(())
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
