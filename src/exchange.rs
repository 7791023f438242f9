use crate::{
    events::{EventBus, ProxyEvent},
    headers::{self, Headers},
    network::{Request, Response, SecurityDetails, ServerAddr, Sizes, Timing},
};
use http::{Method, Uri};
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::watch;
use tracing::debug;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A request as it will be sent upstream.
#[derive(Clone, Debug)]
pub(crate) struct RequestData {
    pub(crate) method: Method,
    pub(crate) url: Uri,
    pub(crate) headers: Headers,
    pub(crate) post_data: Option<Bytes>,
}

impl RequestData {
    /// The origin-form request target.
    pub(crate) fn target(&self) -> &str {
        self.url
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub(crate) fn head_len(&self) -> usize {
        headers::request_head_len(self.method.as_str(), self.target(), &self.headers)
    }
}

#[derive(Debug)]
pub(crate) struct ResponseData {
    pub(crate) url: String,
    pub(crate) status: u16,
    pub(crate) status_text: String,
    pub(crate) headers: Headers,
    pub(crate) security_details: Option<SecurityDetails>,
    pub(crate) server_addr: Option<ServerAddr>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Stage {
    Pending,
    Responded,
    Finished,
    Failed,
}

impl Stage {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

#[derive(Debug)]
struct State {
    request: RequestData,
    response: Option<Arc<ResponseData>>,
    failure: Option<String>,
    body: Option<Bytes>,
    timing: Timing,
    sizes: Sizes,
    settled: bool,
}

/// One request/response cycle.
///
/// The response and the failure are each written at most once, and the exchange settles exactly
/// once, either finished or failed. Events are published from the transition methods so that
/// `request`, `response` and the terminal event always go out in that order.
#[derive(Debug)]
pub(crate) struct Exchange {
    id: u64,
    started: Instant,
    state: Mutex<State>,
    stage: watch::Sender<Stage>,
}

impl Exchange {
    pub(crate) fn new(request: RequestData) -> Arc<Self> {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs_f64() * 1000.0)
            .unwrap_or_default();

        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            started: Instant::now(),
            state: Mutex::new(State {
                request,
                response: None,
                failure: None,
                body: None,
                timing: Timing::new(start_time),
                sizes: Sizes::default(),
                settled: false,
            }),
            stage: watch::Sender::new(Stage::Pending),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    /// Milliseconds since the exchange was created.
    pub(crate) fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    pub(crate) fn request(&self) -> RequestData {
        self.state.lock().request.clone()
    }

    pub(crate) fn set_request(&self, request: RequestData) {
        self.state.lock().request = request;
    }

    pub(crate) fn response(&self) -> Option<Arc<ResponseData>> {
        self.state.lock().response.clone()
    }

    pub(crate) fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    pub(crate) fn body(&self) -> Option<Bytes> {
        self.state.lock().body.clone()
    }

    pub(crate) fn timing(&self) -> Timing {
        self.state.lock().timing
    }

    pub(crate) fn sizes(&self) -> Sizes {
        self.state.lock().sizes
    }

    pub(crate) fn record(&self, f: impl FnOnce(&mut Timing, &mut Sizes)) {
        let mut state = self.state.lock();
        let State { timing, sizes, .. } = &mut *state;
        f(timing, sizes);
    }

    /// Announces the exchange on the bus.
    pub(crate) fn announce(self: &Arc<Self>, bus: &EventBus) {
        bus.publish(ProxyEvent::Request(Request::new(Arc::clone(self))));
    }

    /// Stores the response head and publishes the `response` event. Returns `None` if the exchange
    /// already has a response or has settled.
    pub(crate) fn respond(self: &Arc<Self>, bus: &EventBus, data: ResponseData) -> Option<Response> {
        let data = Arc::new(data);
        {
            let mut state = self.state.lock();
            if state.settled || state.response.is_some() {
                return None;
            }
            state.response = Some(Arc::clone(&data));
        }

        self.stage.send_replace(Stage::Responded);
        let response = Response::new(Arc::clone(self), data);
        bus.publish(ProxyEvent::Response(response.clone()));
        Some(response)
    }

    /// Settles the exchange successfully with the full response body.
    pub(crate) fn finish(self: &Arc<Self>, bus: &EventBus, body: Bytes) {
        {
            let mut state = self.state.lock();
            if state.settled {
                return;
            }
            state.settled = true;
            state.body = Some(body);
        }

        self.stage.send_replace(Stage::Finished);
        bus.publish(ProxyEvent::RequestFinished(Request::new(Arc::clone(self))));
    }

    /// Settles the exchange as failed and publishes `requestfailed`.
    pub(crate) fn fail(self: &Arc<Self>, bus: &EventBus, error_text: impl Into<String>) {
        if self.settle_failed(error_text.into()) {
            bus.publish(ProxyEvent::RequestFailed(Request::new(Arc::clone(self))));
        }
    }

    /// Settles the exchange as failed without publishing anything. Used once the client
    /// connection is gone.
    pub(crate) fn abandon(&self) {
        if self.settle_failed("net::ERR_ABORTED".to_owned()) {
            debug!(id = self.id, "Abandoned exchange");
        }
    }

    fn settle_failed(&self, error_text: String) -> bool {
        {
            let mut state = self.state.lock();
            if state.settled {
                return false;
            }
            state.settled = true;
            state.failure = Some(error_text);
        }

        self.stage.send_replace(Stage::Failed);
        true
    }

    /// Waits until the exchange has a response or has settled.
    pub(crate) async fn responded(&self) {
        let mut rx = self.stage.subscribe();
        let _ = rx.wait_for(|stage| *stage != Stage::Pending).await;
    }

    /// Waits until the exchange has settled.
    pub(crate) async fn settled(&self) -> Stage {
        let mut rx = self.stage.subscribe();
        match rx.wait_for(|stage| stage.is_terminal()).await {
            Ok(stage) => *stage,
            Err(_) => *self.stage.borrow(),
        }
    }
}
