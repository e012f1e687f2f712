//! End-to-end tests over a full deployment: one persistence worker, three
//! front-tier instances behind one shared port.

use std::collections::HashMap;
use std::net::SocketAddr;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use wikibus::{Bus, Config, Deployment, SERVED_BY_HEADER};

struct Harness {
    _dir: TempDir,
    deployment: Deployment,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}/wiki.db?mode=rwc", dir.path().display());
        let config = Config::test_config(&url);
        let bus = Bus::new();
        let deployment = Deployment::start(&config, &bus)
            .await
            .expect("deployment start");
        Self {
            _dir: dir,
            deployment,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.deployment.addr()
    }

    async fn stop(self) {
        self.deployment.shutdown().await;
    }
}

struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

/// Minimal one-shot HTTP/1.1 client: each call is its own connection, so the
/// acceptor's hand-off is observable per request.
async fn raw_request(addr: SocketAddr, request: String) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    let text = String::from_utf8(raw).expect("utf8 response");

    let (head, body) = text.split_once("\r\n\r\n").expect("header terminator");
    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect();

    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

async fn get(addr: SocketAddr, path: &str) -> HttpResponse {
    raw_request(
        addr,
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
    )
    .await
}

async fn send_json(addr: SocketAddr, method: &str, path: &str, body: &str) -> HttpResponse {
    raw_request(
        addr,
        format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ),
    )
    .await
}

#[tokio::test]
async fn deployment_is_ready_before_the_first_connection() {
    let harness = Harness::start().await;
    // Immediately after start the persistence consumer must already be live:
    // anything but a success here would be the request-before-ready race.
    let response = get(harness.addr(), "/api/pages").await;
    assert_eq!(response.status, 200, "body: {}", response.body);
    harness.stop().await;
}

#[tokio::test]
async fn save_then_get_round_trips_markdown() {
    let harness = Harness::start().await;
    let addr = harness.addr();

    let saved = send_json(addr, "PUT", "/api/pages/Foo", r##"{"markdown":"# Foo"}"##).await;
    assert_eq!(saved.status, 200, "body: {}", saved.body);

    let page = get(addr, "/api/pages/Foo").await;
    assert_eq!(page.status, 200);
    assert!(page.body.contains(r##""markdown":"# Foo""##), "body: {}", page.body);
    assert!(page.body.contains(r#""found":true"#));

    harness.stop().await;
}

#[tokio::test]
async fn missing_page_is_a_404() {
    let harness = Harness::start().await;
    let response = get(harness.addr(), "/api/pages/Nowhere").await;
    assert_eq!(response.status, 404);
    assert!(response.body.contains("page not found"));
    harness.stop().await;
}

#[tokio::test]
async fn duplicate_create_is_a_server_error_with_one_row() {
    let harness = Harness::start().await;
    let addr = harness.addr();

    let body = r##"{"name":"Home","markdown":"# Home"}"##;
    let first = send_json(addr, "POST", "/api/pages", body).await;
    assert_eq!(first.status, 201, "body: {}", first.body);

    let second = send_json(addr, "POST", "/api/pages", body).await;
    assert_eq!(second.status, 500);
    assert!(second.body.contains("already exists"), "body: {}", second.body);

    let pages = get(addr, "/api/pages").await;
    assert!(pages.body.contains(r#""pages":["Home"]"#), "body: {}", pages.body);

    harness.stop().await;
}

#[tokio::test]
async fn crud_flow_across_instances() {
    let harness = Harness::start().await;
    let addr = harness.addr();

    for name in ["Alpha", "Beta", "Gamma"] {
        let body = format!(r##"{{"name":"{name}","markdown":"# {name}"}}"##);
        let created = send_json(addr, "POST", "/api/pages", &body).await;
        assert_eq!(created.status, 201, "name: {name}");
    }

    let pages = get(addr, "/api/pages").await;
    assert!(
        pages.body.contains(r#""pages":["Alpha","Beta","Gamma"]"#),
        "body: {}",
        pages.body
    );

    // Delete by id, looked up through the read path.
    let alpha = get(addr, "/api/pages/Alpha").await;
    let id_start = alpha.body.find(r#""id":"#).expect("id field") + 5;
    let id: String = alpha.body[id_start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let deleted = send_json(addr, "DELETE", &format!("/api/pages/{id}"), "").await;
    assert_eq!(deleted.status, 200);
    assert!(deleted.body.contains(r#""deleted":1"#), "body: {}", deleted.body);

    let gone = get(addr, "/api/pages/Alpha").await;
    assert_eq!(gone.status, 404);

    harness.stop().await;
}

#[tokio::test]
async fn connections_are_distributed_round_robin() {
    let harness = Harness::start().await;
    let addr = harness.addr();

    // Config::test_config deploys 3 instances; issue 30 one-shot connections.
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..30 {
        let response = get(addr, "/healthz").await;
        assert_eq!(response.status, 200);
        let instance = response
            .headers
            .get(SERVED_BY_HEADER)
            .expect("served-by header")
            .clone();
        *counts.entry(instance).or_default() += 1;
    }

    assert_eq!(counts.len(), 3, "counts: {counts:?}");
    for (instance, count) in &counts {
        // Strict cyclic hand-off: every instance serves its even share.
        assert!(
            count.abs_diff(10) <= 1,
            "instance {instance} served {count} of 30: {counts:?}"
        );
    }

    harness.stop().await;
}
