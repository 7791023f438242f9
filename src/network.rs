use crate::{
    Error,
    exchange::{Exchange, ResponseData, Stage},
    headers::Header,
};
use http::Method;
use hyper::body::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Timestamps of one exchange, in milliseconds.
///
/// `start_time` is wall-clock time since the Unix epoch. Every other field is relative to
/// `start_time` and measured on a monotonic clock, or `-1` when the phase did not happen.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub start_time: f64,
    pub domain_lookup_start: f64,
    pub domain_lookup_end: f64,
    pub connect_start: f64,
    pub secure_connection_start: f64,
    pub connect_end: f64,
    pub request_start: f64,
    pub response_start: f64,
    pub response_end: f64,
}

impl Timing {
    pub(crate) fn new(start_time: f64) -> Self {
        Self {
            start_time,
            domain_lookup_start: -1.0,
            domain_lookup_end: -1.0,
            connect_start: -1.0,
            secure_connection_start: -1.0,
            connect_end: -1.0,
            request_start: -1.0,
            response_start: -1.0,
            response_end: -1.0,
        }
    }

    /// The relative fields in the order the phases happen.
    pub fn phases(&self) -> [f64; 8] {
        [
            self.domain_lookup_start,
            self.domain_lookup_end,
            self.connect_start,
            self.secure_connection_start,
            self.connect_end,
            self.request_start,
            self.response_start,
            self.response_end,
        ]
    }
}

/// Byte counts of an exchange as seen on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sizes {
    pub request_body_size: u64,
    pub request_headers_size: u64,
    pub response_body_size: u64,
    pub response_headers_size: u64,
}

/// TLS details of the upstream connection.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDetails {
    pub issuer: Option<String>,
    pub protocol: Option<String>,
    pub subject_name: Option<String>,
    /// Seconds since the Unix epoch.
    pub valid_from: Option<i64>,
    /// Seconds since the Unix epoch.
    pub valid_to: Option<i64>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAddr {
    pub ip_address: String,
    pub port: u16,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub error_text: String,
}

/// Service workers never take part in proxied traffic, so this type has no values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceWorker {}

/// A request that passed through the proxy.
///
/// Accessors reflect the request as it is (or was) sent upstream, with every override applied by
/// route handlers so far.
#[derive(Clone)]
pub struct Request {
    exchange: Arc<Exchange>,
}

impl Request {
    pub(crate) fn new(exchange: Arc<Exchange>) -> Self {
        Self { exchange }
    }

    pub(crate) fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// Identifier unique to this exchange within the process.
    pub fn id(&self) -> u64 {
        self.exchange.id()
    }

    pub fn url(&self) -> String {
        self.exchange.request().url.to_string()
    }

    pub fn method(&self) -> Method {
        self.exchange.request().method
    }

    /// Headers with lower-cased names. Repeated headers are joined with `", "`, except
    /// `set-cookie` which is joined with newlines.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.exchange.request().headers.to_map()
    }

    pub fn all_headers(&self) -> BTreeMap<String, String> {
        self.headers()
    }

    pub fn headers_array(&self) -> Vec<Header> {
        self.exchange.request().headers.as_slice().to_vec()
    }

    pub fn header_value(&self, name: &str) -> Option<String> {
        self.exchange.request().headers.get(name)
    }

    pub fn post_data(&self) -> Option<String> {
        self.post_data_buffer()
            .map(|body| String::from_utf8_lossy(&body).into_owned())
    }

    pub fn post_data_buffer(&self) -> Option<Bytes> {
        self.exchange.request().post_data
    }

    /// Parses the body as JSON. Returns `Ok(None)` when the request has no body.
    pub fn post_data_json<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        match self.post_data_buffer() {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    /// Derived from the `sec-fetch-dest` header; `"other"` when the client gave no hint.
    pub fn resource_type(&self) -> &'static str {
        match self.header_value("sec-fetch-dest").as_deref() {
            Some("document" | "iframe" | "frame") => "document",
            Some("script" | "worker" | "sharedworker" | "serviceworker") => "script",
            Some("style") => "stylesheet",
            Some("image") => "image",
            Some("font") => "font",
            Some("audio" | "video" | "track") => "media",
            Some("manifest") => "manifest",
            Some("websocket") => "websocket",
            Some("empty") => "fetch",
            _ => "other",
        }
    }

    pub fn failure(&self) -> Option<Failure> {
        self.exchange
            .failure()
            .map(|error_text| Failure { error_text })
    }

    pub fn redirected_from(&self) -> Option<Request> {
        None
    }

    pub fn redirected_to(&self) -> Option<Request> {
        None
    }

    pub fn service_worker(&self) -> Option<ServiceWorker> {
        None
    }

    pub fn is_navigation_request(&self) -> bool {
        false
    }

    pub fn timing(&self) -> Timing {
        self.exchange.timing()
    }

    /// Waits for the exchange to settle and returns its wire sizes.
    ///
    /// # Errors
    ///
    /// Fails when the request never received a response.
    pub async fn sizes(&self) -> Result<Sizes, Error> {
        self.exchange.settled().await;
        match self.exchange.response() {
            Some(_) => Ok(self.exchange.sizes()),
            None => Err(Error::RequestFailed(
                "Unable to fetch sizes for failed request".to_owned(),
            )),
        }
    }

    /// Waits for the response headers. Returns `None` if the request failed first.
    pub async fn response(&self) -> Option<Response> {
        self.exchange.responded().await;
        self.exchange
            .response()
            .map(|data| Response::new(Arc::clone(&self.exchange), data))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let request = self.exchange.request();
        f.debug_struct("Request")
            .field("id", &self.exchange.id())
            .field("method", &request.method)
            .field("url", &request.url)
            .finish()
    }
}

/// The response of a request, either received from upstream or fulfilled by a route handler.
#[derive(Clone)]
pub struct Response {
    exchange: Arc<Exchange>,
    data: Arc<ResponseData>,
}

impl Response {
    pub(crate) fn new(exchange: Arc<Exchange>, data: Arc<ResponseData>) -> Self {
        Self { exchange, data }
    }

    pub fn url(&self) -> &str {
        &self.data.url
    }

    pub fn status(&self) -> u16 {
        self.data.status
    }

    pub fn status_text(&self) -> &str {
        &self.data.status_text
    }

    pub fn ok(&self) -> bool {
        self.data.status == 0 || (200..=299).contains(&self.data.status)
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        self.data.headers.to_map()
    }

    pub fn all_headers(&self) -> BTreeMap<String, String> {
        self.headers()
    }

    pub fn headers_array(&self) -> Vec<Header> {
        self.data.headers.as_slice().to_vec()
    }

    pub fn header_value(&self, name: &str) -> Option<String> {
        self.data.headers.get(name)
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.data
            .headers
            .get_all(name)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Waits for the body to be fully received.
    ///
    /// # Errors
    ///
    /// Fails with the request's error text if the body could not be read to completion.
    pub async fn body(&self) -> Result<Bytes, Error> {
        match self.exchange.settled().await {
            Stage::Failed => Err(Error::RequestFailed(
                self.exchange.failure().unwrap_or_default(),
            )),
            _ => Ok(self.exchange.body().unwrap_or_default()),
        }
    }

    pub async fn text(&self) -> Result<String, Error> {
        let body = self.body().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let body = self.body().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// `None` for plain HTTP and fulfilled responses.
    pub fn security_details(&self) -> Option<SecurityDetails> {
        self.data.security_details.clone()
    }

    pub fn server_addr(&self) -> Option<ServerAddr> {
        self.data.server_addr.clone()
    }

    /// Waits for the exchange to settle. Returns `None` on success.
    pub async fn finished(&self) -> Option<Failure> {
        self.exchange.settled().await;
        self.exchange
            .failure()
            .map(|error_text| Failure { error_text })
    }

    pub fn request(&self) -> Request {
        Request::new(Arc::clone(&self.exchange))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("id", &self.exchange.id())
            .field("url", &self.data.url)
            .field("status", &self.data.status)
            .finish()
    }
}
