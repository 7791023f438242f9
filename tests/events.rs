use interpose::{Error, EventKind, ProxyEvent, rustls::RootCertStore};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

mod common;

#[tokio::test]
async fn lifecycle_events_in_order() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();
    let (server_addr, stop_server) = common::start_http_server().await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for kind in [
        EventKind::Request,
        EventKind::Response,
        EventKind::RequestFinished,
        EventKind::RequestFailed,
    ] {
        let seen = Arc::clone(&seen);
        proxy.handle.on(kind, move |event: &ProxyEvent| {
            seen.lock().push((event.kind(), event.request().id()));
        });
    }

    let (finished, res) = tokio::join!(
        proxy
            .handle
            .wait_for_event(EventKind::RequestFinished, |_| true, None),
        proxy
            .client()
            .get(format!("http://{server_addr}/hello"))
            .send(),
    );
    assert_eq!(res.unwrap().text().await.unwrap(), common::HELLO_WORLD);
    let id = finished.unwrap().request().id();

    assert_eq!(
        *seen.lock(),
        [
            (EventKind::Request, id),
            (EventKind::Response, id),
            (EventKind::RequestFinished, id),
        ]
    );

    stop_server.send(()).unwrap();
}

#[tokio::test]
async fn wait_for_request_and_response() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();
    let (server_addr, stop_server) = common::start_http_server().await.unwrap();
    let client = proxy.client();

    let (request, response, res) = tokio::join!(
        proxy.handle.wait_for_request("**/echo", None),
        proxy.handle.wait_for_response("**/echo", None),
        client
            .post(format!("http://{server_addr}/echo"))
            .header("content-type", "application/json")
            .body(r#"{"hello":"world"}"#)
            .send(),
    );
    res.unwrap();
    let request = request.unwrap();
    let response = response.unwrap();

    assert_eq!(request.method(), "POST");
    assert_eq!(request.url(), format!("http://{server_addr}/echo"));
    assert_eq!(request.post_data().unwrap(), r#"{"hello":"world"}"#);
    let json: serde_json::Value = request.post_data_json().unwrap().unwrap();
    assert_eq!(json["hello"], "world");
    assert_eq!(
        request.header_value("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(request.resource_type(), "other");

    assert_eq!(response.status(), 200);
    assert_eq!(response.status_text(), "OK");
    assert!(response.ok());
    assert_eq!(response.request().id(), request.id());
    assert_eq!(response.text().await.unwrap(), r#"{"hello":"world"}"#);
    assert_eq!(
        response.server_addr().unwrap().ip_address,
        server_addr.ip().to_string()
    );
    assert_eq!(response.server_addr().unwrap().port, server_addr.port());
    assert!(response.security_details().is_none());

    stop_server.send(()).unwrap();
}

#[tokio::test]
async fn truncated_body_fails_after_response() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();
    let (server_addr, stop_server) = common::start_truncating_server().await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for kind in [
        EventKind::Request,
        EventKind::Response,
        EventKind::RequestFinished,
        EventKind::RequestFailed,
    ] {
        let seen = Arc::clone(&seen);
        proxy.handle.on(kind, move |event: &ProxyEvent| {
            seen.lock().push(event.kind());
        });
    }

    let (failed, res) = tokio::join!(
        proxy
            .handle
            .wait_for_event(EventKind::RequestFailed, |_| true, None),
        async {
            let res = proxy
                .client()
                .get(format!("http://{server_addr}/partial"))
                .send()
                .await?;
            res.text().await
        },
    );
    assert!(res.is_err());

    let request = failed.unwrap().request();
    assert!(request.failure().is_some());
    assert_eq!(
        *seen.lock(),
        [
            EventKind::Request,
            EventKind::Response,
            EventKind::RequestFailed,
        ]
    );

    stop_server.send(()).unwrap();
}

#[tokio::test]
async fn panicking_predicate_leaves_other_waiters() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();
    let (server_addr, stop_server) = common::start_http_server().await.unwrap();

    let (faulty, finished, res) = tokio::join!(
        proxy
            .handle
            .wait_for_event(EventKind::Request, |_| panic!("bad predicate"), None),
        proxy
            .handle
            .wait_for_event(EventKind::RequestFinished, |_| true, None),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            proxy
                .client()
                .get(format!("http://{server_addr}/hello"))
                .send()
                .await
        },
    );

    assert_eq!(res.unwrap().text().await.unwrap(), common::HELLO_WORLD);
    assert!(matches!(faulty.unwrap_err(), Error::Handler(_)));
    assert_eq!(finished.unwrap().kind(), EventKind::RequestFinished);

    stop_server.send(()).unwrap();
}

#[tokio::test]
async fn predicate_filters_events() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();
    let (server_addr, stop_server) = common::start_http_server().await.unwrap();
    let client = proxy.client();

    let (response, first, second) = tokio::join!(
        proxy.handle.wait_for_event(
            EventKind::Response,
            |event| event.response().is_some_and(|res| res.status() == 404),
            None,
        ),
        client.get(format!("http://{server_addr}/hello")).send(),
        client.get(format!("http://{server_addr}/missing")).send(),
    );
    first.unwrap();
    second.unwrap();

    let response = response.unwrap();
    assert!(response.response().unwrap().url().ends_with("/missing"));
    assert!(!response.response().unwrap().ok());

    stop_server.send(()).unwrap();
}

#[tokio::test]
async fn waiters_time_out() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();

    let err = proxy
        .handle
        .wait_for_request("**/never", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(
        err.to_string(),
        r#"Timeout 50ms exceeded while waiting for event "request""#
    );
}

#[tokio::test]
async fn default_timeout_applies() {
    let proxy =
        common::start_proxy_with_timeout(RootCertStore::empty(), Duration::from_millis(20))
            .await
            .unwrap();

    let err = proxy
        .handle
        .wait_for_response("**/never", None)
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        r#"Timeout 20ms exceeded while waiting for event "response""#
    );
}

#[tokio::test]
async fn shutdown_rejects_pending_waiters() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();
    let handle = proxy.handle.clone();

    let waiter = tokio::spawn(async move { handle.wait_for_request("**/never", Some(Duration::ZERO)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    proxy.stop();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
}

#[tokio::test]
async fn removed_listeners_stop_receiving() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();
    let (server_addr, stop_server) = common::start_http_server().await.unwrap();
    let count = Arc::new(Mutex::new(0));

    let counter = Arc::clone(&count);
    let id = proxy.handle.on(EventKind::Request, move |_| *counter.lock() += 1);
    assert!(proxy.handle.remove_listener(id));
    assert!(!proxy.handle.remove_listener(id));

    proxy
        .client()
        .get(format!("http://{server_addr}/hello"))
        .send()
        .await
        .unwrap();

    assert_eq!(*count.lock(), 0);

    stop_server.send(()).unwrap();
}
