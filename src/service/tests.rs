// src/service/tests.rs

use std::collections::HashMap;
use std::time::Duration;

use hyper::Client;
use hyperlocal::{UnixClientExt, Uri as UnixUri};
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::channel::{CHANNEL_TAG, MIGRATION_TAG};
use crate::platform::ObjectRef;
use crate::readiness::poll_until;
use crate::testing::{self, FakeControl, FakeStore, RecordingSwitch};

const PREFIX: &str = "/services/plugin/xscim";
const DOMID: i64 = 4;

struct Harness {
    control: Arc<FakeControl>,
    service: Arc<ControlService>,
    vm: ObjectRef,
    _sysfs: tempfile::TempDir,
}

/// A guest named `guest-1` whose channel is up and talking to `daemon_ip`
fn harness(daemon_ip: &str) -> Harness {
    let sysfs = testing::sysfs_with_bridge();
    let control = Arc::new(FakeControl::new());
    let store = Arc::new(FakeStore::new(daemon_ip));
    let vm = control.add_vm("guest-1", DOMID);
    control.set_tag(&vm, CHANNEL_TAG);
    store.publish(&testing::store_root(DOMID));

    let ctx = testing::context(
        control.clone(),
        store,
        Arc::new(RecordingSwitch::new(HashMap::new())),
        sysfs.path(),
    );

    Harness {
        control,
        service: Arc::new(ControlService::new(ctx, PREFIX)),
        vm,
        _sysfs: sysfs,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

fn post_value(uri: &str, value: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_LENGTH, value.len())
        .body(Body::from(value.to_string()))
        .unwrap()
}

async fn body_of(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn malformed_requests_are_404() {
    let h = harness("10.0.0.2");

    for uri in [
        "/services/plugin/xscim/vm/guest-1/key",
        "/services/plugin/xscim/key/color",
        "/services/plugin/xscim/vm/guest-1/cmd/reboot",
        "/services/plugin/xscim/vm/no-such-guest/cmd/setup",
        "/services/plugin/xscim/vm/guest-1",
    ] {
        let response = h.service.handle(post(uri)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body_of(response).await, "");
    }

    let response = h
        .service
        .handle(Request::builder().method("PUT").uri("/vm/guest-1/key/a").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn setup_command_returns_empty_200() {
    let h = harness("10.0.0.2");

    let response = h.service.handle(post("/services/plugin/xscim/vm/guest-1?cmd=setup")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_LENGTH], "0");
    assert_eq!(response.headers()[CONNECTION], "close");
    assert_eq!(h.control.management_vifs(&h.vm).len(), 1);
}

#[tokio::test]
async fn get_returns_guest_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kvp/color"))
        .respond_with(ResponseTemplate::new(200).set_body_string("blue"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/kvp/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let response = h.service.handle(get("/services/plugin/xscim/vm/guest-1/key/color")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    assert_eq!(body_of(response).await, "blue");

    // An empty collection is reported as a failure
    let response = h.service.handle(get("/services/plugin/xscim/vm/guest-1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn path_and_query_keys_reach_the_same_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("blue"))
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    for uri in [
        "/services/plugin/xscim/vm/guest-1/key/my%20key",
        "/services/plugin/xscim/vm/guest-1?key=my%20key",
    ] {
        let response = h.service.handle(get(uri)).await;
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
    }

    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|req| req.url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/kvp/my%20key", "/kvp/my%20key"]);
}

#[tokio::test]
async fn put_requires_content_length() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/kvp/color"))
        .and(body_string("blue"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let without_length = Request::builder()
        .method("POST")
        .uri("/vm/guest-1/key/color")
        .body(Body::from("blue"))
        .unwrap();
    assert_eq!(h.service.handle(without_length).await.status(), StatusCode::NOT_FOUND);

    let binary = Request::builder()
        .method("POST")
        .uri("/vm/guest-1/key/color")
        .header(CONTENT_LENGTH, 2)
        .body(Body::from(vec![0xffu8, 0xfe]))
        .unwrap();
    assert_eq!(h.service.handle(binary).await.status(), StatusCode::NOT_FOUND);

    let response = h.service.handle(post_value("/vm/guest-1/key/color", "blue")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn put_is_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let response = h.service.handle(post_value("/vm/guest-1/key/color", "blue")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_delete_of_absent_record_is_200() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/kvp/color"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let response = h.service.handle(post("/vm/guest-1/key/color/cmd/delete")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_delete_of_present_record_is_404() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("blue"))
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let response = h.service.handle(post("/vm/guest-1/cmd/delete?key=color")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = h.service.handle(post("/vm/guest-1/cmd/delete")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn migration_commands() {
    let h = harness("10.0.0.2");

    let response = h.service.handle(post("/vm/guest-1/cmd/finishmigration")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = h.service.handle(post("/vm/guest-1/cmd/preparemigration")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.control.has_tag(&h.vm, MIGRATION_TAG));

    let response = h.service.handle(post("/vm/guest-1/cmd/finishmigration")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!h.control.has_tag(&h.vm, MIGRATION_TAG));
    assert!(h.control.has_tag(&h.vm, CHANNEL_TAG));
}

#[test_log::test(tokio::test)]
async fn serves_plugin_socket_until_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kvp/color"))
        .respond_with(ResponseTemplate::new(200).set_body_string("blue"))
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("plugin").join("xscim");
    std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
    std::fs::write(&socket, "stale").unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(h.service.clone().serve(Transport::Unix(socket.clone()), shutdown_rx));

    let client = Client::unix();
    let uri: hyper::Uri = UnixUri::new(&socket, "/services/plugin/xscim/vm/guest-1/key/color").into();
    let bound = poll_until(Duration::from_secs(5), Duration::from_millis(20), || async {
        client.get(uri.clone()).await.is_ok()
    })
    .await;
    assert!(bound.is_ready());

    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, "blue");

    shutdown_tx.send(true).unwrap();
    serving.await.unwrap().unwrap();
    assert!(!socket.exists());
}
