use interpose::{EventKind, FulfillOptions, rustls::RootCertStore};

mod common;

#[tokio::test]
async fn intercepts_https() {
    let upstream_ca = common::build_ca();
    let (server_addr, stop_server) = common::start_https_server(&upstream_ca).await.unwrap();
    let proxy = common::start_proxy(common::roots_for(&upstream_ca))
        .await
        .unwrap();
    let url = format!("https://localhost:{}/hello", server_addr.port());

    let (response, res) = tokio::join!(
        proxy.handle.wait_for_response("**/hello", None),
        proxy.client().get(&url).send(),
    );
    let res = res.unwrap();
    let response = response.unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), common::HELLO_WORLD);

    assert_eq!(response.url(), url);
    let details = response.security_details().unwrap();
    assert_eq!(details.issuer.as_deref(), Some("interpose CA"));
    assert_eq!(details.subject_name.as_deref(), Some("localhost"));
    assert!(details.protocol.unwrap().starts_with("TLS 1."));
    assert!(details.valid_from.unwrap() < details.valid_to.unwrap());

    let timing = response.request().timing();
    assert!(timing.secure_connection_start >= timing.connect_start);
    assert!(timing.connect_end >= timing.secure_connection_start);

    stop_server.send(()).unwrap();
}

#[tokio::test]
async fn untrusted_upstream_fails() {
    let upstream_ca = common::build_ca();
    let (server_addr, stop_server) = common::start_https_server(&upstream_ca).await.unwrap();
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();

    let (event, res) = tokio::join!(
        proxy
            .handle
            .wait_for_event(EventKind::RequestFailed, |_| true, None),
        proxy
            .client()
            .get(format!("https://localhost:{}/hello", server_addr.port()))
            .send(),
    );

    assert_eq!(res.unwrap().status(), 502);
    let failure = event.unwrap().request().failure().unwrap();
    assert!(failure.error_text.contains("TLS handshake"));

    stop_server.send(()).unwrap();
}

#[tokio::test]
async fn fulfills_https_without_upstream() {
    let proxy = common::start_proxy(RootCertStore::empty()).await.unwrap();

    proxy.handle.route("https://secure.invalid/**", |route| async move {
        route.fulfill(
            FulfillOptions::new()
                .content_type("application/json")
                .body(r#"{"mocked":true}"#),
        )?;
        Ok(())
    });

    let res = proxy
        .client()
        .get("https://secure.invalid/data.json")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "application/json");
    assert_eq!(res.text().await.unwrap(), r#"{"mocked":true}"#);
}
