use std::time::Duration;

use dashboard_notify::{
    ApiClient, Error, FileTokenStore, Notification, NotificationCenter, Settings, TokenStore,
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

/// Serves `responses` in order, one connection each, and reports every
/// request it saw.
async fn serve(responses: Vec<(u16, String)>) -> (String, mpsc::UnboundedReceiver<Recorded>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/api", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let recorded = read_request(&mut socket).await;
            let _ = tx.send(recorded);
            let reply = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                if status < 300 { "OK" } else { "Error" },
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (base_url, rx)
}

async fn read_request(socket: &mut TcpStream) -> Recorded {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
        let read = socket.read(&mut chunk).await.unwrap();
        assert!(read > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap().split_whitespace();
    let method = request_line.next().unwrap().to_string();
    let path = request_line.next().unwrap().to_string();

    let mut content_length = 0;
    let mut authorization = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.trim().parse().unwrap(),
            "authorization" => authorization = Some(value.trim().to_string()),
            _ => {}
        }
    }

    while buf.len() < header_end + content_length {
        let read = socket.read(&mut chunk).await.unwrap();
        assert!(read > 0, "client closed before sending body");
        buf.extend_from_slice(&chunk[..read]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..header_end + content_length]).to_string();

    Recorded {
        method,
        path,
        authorization,
        body,
    }
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
    timeout(WAIT, rx.recv())
        .await
        .expect("server saw no request")
        .expect("server task ended")
}

fn page(next: Option<&str>, results: Value) -> (u16, String) {
    (200, json!({"count": 3, "next": next, "results": results}).to_string())
}

fn unread(id: i64) -> Notification {
    Notification {
        id,
        kind: "object_added".to_string(),
        title: format!("Object #{id} added"),
        message: String::new(),
        created_at: None,
        is_read: false,
    }
}

fn center_for(base_url: &str, dir: &tempfile::TempDir, refresh_pages: u32) -> NotificationCenter {
    let store = FileTokenStore::new(dir.path().join("storage.json"), "access_token");
    store.save("rest-tok").unwrap();
    let settings = Settings {
        local_host: "127.0.0.1:9".to_string(),
        api_base_url: base_url.to_string(),
        refresh_pages,
        ..Settings::default()
    };
    NotificationCenter::new(settings, Box::new(store)).unwrap()
}

#[tokio::test]
async fn fetch_all_walks_pages_until_next_is_null() {
    let (base_url, mut requests) = serve(vec![
        page(
            Some("http://server/api/notifications/?page=2"),
            json!([
                {"id": 1, "title": "Customer registered"},
                {"id": 2, "title": "Invoice issued", "message": null}
            ]),
        ),
        page(None, json!([{"id": 3, "title": "Object added"}, {"id": "4", "title": "bad"}])),
    ])
    .await;
    let client = ApiClient::new(&base_url, "tok").unwrap();

    let all = client.fetch_all(5).await.unwrap();
    assert_eq!(all.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2, 3]);

    let first = next_request(&mut requests).await;
    assert_eq!(first.method, "GET");
    assert_eq!(first.path, "/api/notifications/?page=1");
    assert_eq!(first.authorization.as_deref(), Some("Bearer tok"));
    assert_eq!(next_request(&mut requests).await.path, "/api/notifications/?page=2");
}

#[tokio::test]
async fn fetch_all_stops_at_page_cap() {
    let next = Some("http://server/api/notifications/?page=next");
    let (base_url, mut requests) = serve(vec![
        page(next, json!([{"id": 1, "title": "a"}])),
        page(next, json!([{"id": 2, "title": "b"}])),
        page(next, json!([{"id": 3, "title": "c"}])),
    ])
    .await;
    let client = ApiClient::new(&base_url, "tok").unwrap();

    let all = client.fetch_all(2).await.unwrap();
    assert_eq!(all.len(), 2);
    next_request(&mut requests).await;
    next_request(&mut requests).await;
    assert!(
        timeout(Duration::from_millis(300), requests.recv()).await.is_err(),
        "third page requested past the cap"
    );
}

#[tokio::test]
async fn plain_array_listing_decodes_as_single_page() {
    let (base_url, _requests) =
        serve(vec![(200, json!([{"id": 4, "title": "t"}]).to_string())]).await;
    let client = ApiClient::new(&base_url, "tok").unwrap();

    let listing = client.list_notifications(1).await.unwrap();
    assert_eq!(listing.count, Some(1));
    assert!(!listing.has_next);
    assert_eq!(listing.results[0].id, 4);
}

#[tokio::test]
async fn error_status_maps_to_http_error_with_truncated_body() {
    let (base_url, _requests) = serve(vec![(500, "x".repeat(500))]).await;
    let client = ApiClient::new(&base_url, "tok").unwrap();

    match client.mark_all_read().await {
        Err(Error::Http { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body.chars().count(), 203);
            assert!(body.ends_with("..."));
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn unread_count_accepts_both_field_names() {
    let (base_url, mut requests) = serve(vec![
        (200, json!({"unread_count": 3}).to_string()),
        (200, json!({"count": 7}).to_string()),
    ])
    .await;
    let client = ApiClient::new(&base_url, "tok").unwrap();

    assert_eq!(client.unread_count().await.unwrap(), 3);
    assert_eq!(client.unread_count().await.unwrap(), 7);
    assert_eq!(
        next_request(&mut requests).await.path,
        "/api/notifications/unread_count/"
    );
}

#[tokio::test]
async fn patch_sends_fields_and_returns_server_view() {
    let (base_url, mut requests) = serve(vec![(
        200,
        json!({"id": 5, "title": "Invoice issued", "is_read": true}).to_string(),
    )])
    .await;
    let client = ApiClient::new(&base_url, "tok").unwrap();

    let updated = client
        .patch_notification(5, &json!({"is_read": true}))
        .await
        .unwrap();
    assert_eq!(updated.id, 5);
    assert!(updated.is_read);

    let request = next_request(&mut requests).await;
    assert_eq!(request.method, "PATCH");
    assert_eq!(request.path, "/api/notifications/5/");
    assert_eq!(
        serde_json::from_str::<Value>(&request.body).unwrap(),
        json!({"is_read": true})
    );
}

#[tokio::test]
async fn center_refresh_merges_configured_pages() {
    let (base_url, _requests) = serve(vec![
        page(
            Some("http://server/api/notifications/?page=2"),
            json!([
                {"id": 1, "title": "a", "created_at": "2024-01-01T00:00:00Z"},
                {"id": 2, "title": "b", "created_at": "2024-01-02T00:00:00Z"}
            ]),
        ),
        page(
            None,
            json!([{"id": 3, "title": "c", "created_at": "2024-01-03T00:00:00Z", "is_read": true}]),
        ),
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let center = center_for(&base_url, &dir, 2);

    assert_eq!(center.refresh().await.unwrap(), 3);
    let ids: Vec<i64> = center.recent(10).unwrap().iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert_eq!(center.unread_count().unwrap(), 2);
}

#[tokio::test]
async fn server_error_on_mark_read_rolls_back() {
    let (base_url, mut requests) = serve(vec![
        (500, json!({"detail": "database unavailable"}).to_string()),
        (200, String::new()),
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let center = center_for(&base_url, &dir, 1);
    center.cache().lock().unwrap().upsert_one(unread(7));

    assert!(matches!(
        center.mark_read(7).await,
        Err(Error::Http { status: 500, .. })
    ));
    assert_eq!(center.unread_count().unwrap(), 1);
    let request = next_request(&mut requests).await;
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/api/notifications/7/mark_as_read/");
    assert_eq!(request.authorization.as_deref(), Some("Bearer rest-tok"));

    center.mark_read(7).await.unwrap();
    assert_eq!(center.unread_count().unwrap(), 0);
}
