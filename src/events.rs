use crate::{
    Error,
    network::{Request, Response},
    route::UrlMatcher,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::error;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle events published for every exchange.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    Request,
    Response,
    RequestFinished,
    RequestFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::RequestFinished => "requestfinished",
            Self::RequestFailed => "requestfailed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub enum ProxyEvent {
    Request(Request),
    Response(Response),
    RequestFinished(Request),
    RequestFailed(Request),
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Request(_) => EventKind::Request,
            Self::Response(_) => EventKind::Response,
            Self::RequestFinished(_) => EventKind::RequestFinished,
            Self::RequestFailed(_) => EventKind::RequestFailed,
        }
    }

    pub fn request(&self) -> Request {
        match self {
            Self::Request(request)
            | Self::RequestFinished(request)
            | Self::RequestFailed(request) => request.clone(),
            Self::Response(response) => response.request(),
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }
}

/// Identifies a listener registered with [`ProxyHandle::on`](crate::ProxyHandle::on).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ProxyEvent) + Send + Sync>;
type Predicate = Box<dyn Fn(&ProxyEvent) -> bool + Send + Sync>;

struct Waiter {
    id: u64,
    kind: EventKind,
    predicate: Predicate,
    tx: oneshot::Sender<Result<ProxyEvent, Error>>,
}

/// Fans events out to listeners and resolves one-shot waiters.
///
/// Waiters are matched and removed under a single lock, so each waiter is resolved by at most one
/// event even when several exchanges publish concurrently.
pub(crate) struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, EventKind, Listener)>>,
    waiters: Mutex<Vec<Waiter>>,
    default_timeout: Duration,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl EventBus {
    pub(crate) fn new(default_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            default_timeout,
        }
    }

    pub(crate) fn publish(&self, event: ProxyEvent) {
        let kind = event.kind();

        let mut resolved = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            let mut pending = Vec::with_capacity(waiters.len());
            for waiter in waiters.drain(..) {
                if waiter.kind != kind {
                    pending.push(waiter);
                    continue;
                }

                match catch_unwind(AssertUnwindSafe(|| (waiter.predicate)(&event))) {
                    Ok(true) => resolved.push((waiter.tx, Ok(event.clone()))),
                    Ok(false) => pending.push(waiter),
                    Err(_) => {
                        error!(event = %kind, "Waiter predicate panicked");
                        let err = Error::Handler(format!(
                            "predicate panicked while waiting for event \"{kind}\""
                        ));
                        resolved.push((waiter.tx, Err(err)));
                    }
                }
            }
            *waiters = pending;
        }

        for (tx, result) in resolved {
            let _ = tx.send(result);
        }

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, listener_kind, _)| *listener_kind == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(event = %kind, "Event listener panicked");
            }
        }
    }

    pub(crate) fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ProxyEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, kind, Arc::new(listener)));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Waits for the next event of `kind` accepted by `predicate`.
    ///
    /// `timeout` falls back to the bus default; a zero duration waits forever.
    pub(crate) async fn wait_for_event(
        &self,
        kind: EventKind,
        predicate: impl Fn(&ProxyEvent) -> bool + Send + Sync + 'static,
        timeout: Option<Duration>,
    ) -> Result<ProxyEvent, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.waiters.lock().push(Waiter {
            id,
            kind,
            predicate: Box::new(predicate),
            tx,
        });

        let timeout = timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return rx.await.map_err(|_| Error::Closed(kind.as_str()))?;
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.map_err(|_| Error::Closed(kind.as_str()))?,
            Err(_) => {
                let removed = {
                    let mut waiters = self.waiters.lock();
                    let before = waiters.len();
                    waiters.retain(|waiter| waiter.id != id);
                    waiters.len() != before
                };

                let timed_out = Error::Timeout {
                    event: kind.as_str(),
                    timeout,
                };

                // A publisher claimed the waiter between the deadline and the lock.
                if removed {
                    Err(timed_out)
                } else {
                    rx.await.map_err(|_| timed_out)?
                }
            }
        }
    }

    pub(crate) async fn wait_for_request(
        &self,
        matcher: UrlMatcher,
        timeout: Option<Duration>,
    ) -> Result<Request, Error> {
        let event = self
            .wait_for_event(
                EventKind::Request,
                move |event| {
                    let request = event.request();
                    matcher.matches_str(&request.url())
                },
                timeout,
            )
            .await?;
        Ok(event.request())
    }

    pub(crate) async fn wait_for_response(
        &self,
        matcher: UrlMatcher,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let event = self
            .wait_for_event(
                EventKind::Response,
                move |event| {
                    event
                        .response()
                        .is_some_and(|response| matcher.matches_str(response.url()))
                },
                timeout,
            )
            .await?;

        match event {
            ProxyEvent::Response(response) => Ok(response),
            _ => Err(Error::Closed(EventKind::Response.as_str())),
        }
    }

    /// Rejects every pending waiter.
    pub(crate) fn close(&self) {
        self.waiters.lock().clear();
    }
}
