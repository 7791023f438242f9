mod handle;
mod matcher;

use crate::{exchange::Exchange, network::Request, upstream::Dispatcher};
use futures::{FutureExt, future::BoxFuture};
use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info_span, warn};

pub(crate) use handle::{Fulfillment, Resolution, status_text};
pub use handle::{FetchResponse, FulfillOptions, Overrides, Route};
pub use matcher::UrlMatcher;

/// Error type route handlers may return. Returning an error aborts the request with the error's
/// message as its error text.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type BoxedHandler = Arc<dyn Fn(Route) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

struct RouteEntry {
    id: u64,
    matcher: UrlMatcher,
    handler: BoxedHandler,
    times: Option<usize>,
    handled: AtomicUsize,
}

impl RouteEntry {
    /// Claims one invocation, respecting `times`.
    fn try_claim(&self) -> bool {
        match self.times {
            None => {
                self.handled.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(times) => self
                .handled
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |handled| {
                    (handled < times).then_some(handled + 1)
                })
                .is_ok(),
        }
    }

    fn exhausted(&self) -> bool {
        self.times
            .is_some_and(|times| self.handled.load(Ordering::Acquire) >= times)
    }
}

/// How the chain resolved an exchange.
#[derive(Debug)]
pub(crate) enum Outcome {
    Dispatch,
    Fulfill(Fulfillment),
    Abort(String),
}

/// The registry of route handlers.
///
/// Registrations replace the entry list instead of mutating it, so a chain walk keeps using the
/// snapshot it started with.
#[derive(Default)]
pub(crate) struct Router {
    next_id: AtomicU64,
    entries: RwLock<Arc<Vec<Arc<RouteEntry>>>>,
}

impl Router {
    pub(crate) fn route<F, Fut>(&self, matcher: UrlMatcher, times: Option<usize>, handler: F)
    where
        F: Fn(Route) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let entry = Arc::new(RouteEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            matcher,
            handler: Arc::new(move |route| handler(route).boxed()),
            times,
            handled: AtomicUsize::new(0),
        });

        self.update(|entries| entries.push(entry));
    }

    /// Removes every handler registered with an equal matcher. Returns how many were removed.
    pub(crate) fn unroute(&self, matcher: &UrlMatcher) -> usize {
        let mut removed = 0;
        self.update(|entries| {
            let before = entries.len();
            entries.retain(|entry| entry.matcher != *matcher);
            removed = before - entries.len();
        });
        removed
    }

    pub(crate) fn unroute_all(&self) {
        *self.entries.write() = Arc::new(Vec::new());
    }

    fn remove(&self, id: u64) {
        self.update(|entries| entries.retain(|entry| entry.id != id));
    }

    fn update(&self, f: impl FnOnce(&mut Vec<Arc<RouteEntry>>)) {
        let mut entries = self.entries.write();
        let mut next = Vec::clone(&entries);
        f(&mut next);
        *entries = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<Vec<Arc<RouteEntry>>> {
        Arc::clone(&self.entries.read())
    }

    /// Walks the handlers matching the exchange, newest registration first, until one of them
    /// resolves it.
    ///
    /// Each candidate is matched against the exchange's current URL, so a `fallback` that
    /// rewrites the URL decides which older handlers still apply. A handler that never resolves
    /// its route leaves this future pending.
    pub(crate) async fn run(&self, exchange: &Arc<Exchange>, dispatcher: &Arc<Dispatcher>) -> Outcome {
        let snapshot = self.snapshot();

        for entry in snapshot.iter().rev() {
            if !entry.matcher.matches(&exchange.request().url) || !entry.try_claim() {
                continue;
            }
            if entry.exhausted() {
                self.remove(entry.id);
            }

            debug!(route = entry.id, matcher = ?entry.matcher, "Invoking route handler");

            let (tx, rx) = oneshot::channel();
            let slot = Arc::new(Mutex::new(Some(tx)));
            let route = Route::new(
                Request::new(Arc::clone(exchange)),
                Arc::clone(dispatcher),
                Arc::clone(&slot),
            );
            spawn_handler(Arc::clone(&entry.handler), route, slot);

            let Ok(resolution) = rx.await else {
                warn!(route = entry.id, "Route handler returned without resolving the route");
                return std::future::pending().await;
            };

            match resolution {
                Resolution::Continue(request) => {
                    exchange.set_request(request);
                    return Outcome::Dispatch;
                }
                Resolution::Fallback(request) => {
                    debug!(route = entry.id, "Falling back");
                    exchange.set_request(request);
                }
                Resolution::Fulfill(fulfillment) => return Outcome::Fulfill(fulfillment),
                Resolution::Abort(error_text) => return Outcome::Abort(error_text),
            }
        }

        Outcome::Dispatch
    }
}

fn spawn_handler(handler: BoxedHandler, route: Route, slot: handle::ResolutionSlot) {
    let fut = async move {
        let reason = match AssertUnwindSafe(handler(route)).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        warn!("Route handler failed: {}", reason);
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(Resolution::Abort(reason));
        }
    };

    tokio::spawn(fut.instrument(info_span!("route_handler")));
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Route handler panicked".to_owned()
    }
}
