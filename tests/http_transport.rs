//! Integration tests for the HTTP chat transport
//!
//! A throwaway HTTP/1.1 responder on a loopback port plays the chat backend,
//! so no network access or API key is needed.
//!
//! ```bash
//! cargo test --test http_transport
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use lingo_voice::settings::TransportSettings;
use lingo_voice::transport::{ChatTransport, HttpChatTransport, TransportError};

/// Raw requests received by the responder
type Requests = Arc<Mutex<Vec<String>>>;

/// Serve `responses` in order, one connection each. Returns the endpoint URL.
async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Requests) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    tokio::spawn(async move {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            seen.lock().push(request);

            let response = format!(
                "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{}/api/chat", addr), requests)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    String::from_utf8_lossy(&buf).into_owned()
}

fn transport(endpoint: &str, max_attempts: u32) -> HttpChatTransport {
    HttpChatTransport::new(&TransportSettings {
        endpoint: endpoint.to_string(),
        request_timeout_secs: 5,
        max_attempts,
        retry_base_delay_ms: 10,
    })
}

#[tokio::test]
async fn reply_is_returned_and_request_is_shaped() {
    let (endpoint, requests) = serve(vec![(200, r#"{"reply":"Hola, ¿qué tal?"}"#)]).await;
    let transport = transport(&endpoint, 3).with_api_key(Some("test-key".to_string()));

    let reply = transport.send("hola", Some("roleplay")).await.unwrap();
    assert_eq!(reply, "Hola, ¿qué tal?");

    let requests = requests.lock();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.starts_with("POST /api/chat"));
    assert!(request
        .to_ascii_lowercase()
        .contains("authorization: bearer test-key"));
    assert!(request.contains(r#""message":"hola""#));
    assert!(request.contains(r#""mode":"roleplay""#));
}

#[tokio::test]
async fn rate_limit_is_classified_without_retry() {
    let (endpoint, requests) = serve(vec![(
        429,
        r#"{"error":{"message":"Too many messages"}}"#,
    )])
    .await;

    let err = transport(&endpoint, 3).send("hi", None).await.unwrap_err();
    assert_eq!(err, TransportError::RateLimited("Too many messages".to_string()));
    assert_eq!(requests.lock().len(), 1);
}

#[tokio::test]
async fn quota_exhaustion_is_classified() {
    let (endpoint, _) = serve(vec![(402, r#"{"error":{"message":"Daily limit reached"}}"#)]).await;

    let err = transport(&endpoint, 3).send("hi", None).await.unwrap_err();
    assert!(matches!(err, TransportError::QuotaExceeded(ref m) if m == "Daily limit reached"));
    assert!(err.should_roll_back());
}

#[tokio::test]
async fn server_error_is_retried_until_success() {
    let (endpoint, requests) = serve(vec![
        (503, r#"{"error":{"message":"overloaded"}}"#),
        (500, "internal"),
        (200, r#"{"reply":"Finally"}"#),
    ])
    .await;

    let reply = transport(&endpoint, 3).send("hi", None).await.unwrap();
    assert_eq!(reply, "Finally");
    assert_eq!(requests.lock().len(), 3);
}

#[tokio::test]
async fn server_error_gives_up_after_max_attempts() {
    let (endpoint, requests) = serve(vec![(500, "boom"), (500, "boom")]).await;

    let err = transport(&endpoint, 2).send("hi", None).await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Generic {
            status: Some(500),
            message: "boom".to_string()
        }
    );
    assert_eq!(requests.lock().len(), 2);
}

#[tokio::test]
async fn empty_reply_is_an_error() {
    let (endpoint, _) = serve(vec![(200, r#"{"reply":"   "}"#)]).await;

    let err = transport(&endpoint, 1).send("hi", None).await.unwrap_err();
    assert!(matches!(err, TransportError::Generic { status: Some(200), .. }));
}

#[tokio::test]
async fn closed_port_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = transport(&format!("http://{}/api/chat", addr), 2)
        .send("hi", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
    assert!(!err.should_roll_back());
}
