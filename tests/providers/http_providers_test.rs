//! Collaborator implementations against a one-shot local HTTP server.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use jotter::providers::analyzer::OllamaAnalyzer;
use jotter::providers::diagnostic::OllamaDiagnosticModel;
use jotter::providers::embedder::OllamaEmbedder;
use jotter::providers::fetcher::HttpFetcher;
use jotter::providers::{
    check_http_response, Analyzer, DiagnosticModel, Embedder, Fetcher, ProviderError,
};

/// Serve one response, then hand back the raw request that was received.
async fn serve_once(
    status_line: &str,
    content_type: &str,
    body: &str,
) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr");

    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let request = read_request(&mut socket).await;
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
        let _ = tx.send(request);
    });

    (format!("http://{addr}"), rx)
}

/// Read headers plus a `Content-Length` body so the socket closes cleanly.
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0_u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut buf).await else {
            break;
        };
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if raw.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}

fn chat_body(content: &serde_json::Value) -> String {
    json!({
        "model": "test",
        "message": { "role": "assistant", "content": content.to_string() },
        "done": true
    })
    .to_string()
}

#[tokio::test]
async fn fetcher_extracts_title_and_text() {
    let html = "<html><head><title>Trail report</title></head>\
                <body><p>Muddy but   fine.</p></body></html>";
    let (base, request) = serve_once("200 OK", "text/html", html).await;

    let page = HttpFetcher::new(Duration::from_secs(5))
        .fetch(&format!("{base}/trail"))
        .await
        .expect("fetch");
    assert_eq!(page.title, "Trail report");
    assert_eq!(page.content, "Muddy but fine.");

    let request = request.await.expect("request seen");
    assert!(request.starts_with("GET /trail "));
    assert!(request.to_ascii_lowercase().contains("user-agent: jotter/"));
}

#[tokio::test]
async fn fetcher_reports_status_failures() {
    let (base, _request) = serve_once("404 Not Found", "text/plain", "gone").await;
    match HttpFetcher::new(Duration::from_secs(5)).fetch(&base).await {
        Err(ProviderError::HttpStatus { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "gone");
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn fetcher_rejects_unsupported_urls_without_a_request() {
    let fetcher = HttpFetcher::new(Duration::from_secs(5));
    for url in ["file:///etc/passwd", "mailto:a@b.c", "nonsense"] {
        assert!(matches!(
            fetcher.fetch(url).await,
            Err(ProviderError::InvalidInput(_))
        ));
    }
}

#[tokio::test]
async fn analyzer_parses_model_json() {
    let answer = json!({
        "summary": "A walk by the river",
        "entities": ["Thames"],
        "topics": ["walking"],
        "sentiment": "calm",
        "links": ["https://river.example"]
    });
    let (base, request) = serve_once("200 OK", "application/json", &chat_body(&answer)).await;

    let data = OllamaAnalyzer::new("llama3", &base)
        .analyze("walked by the river, photos at https://photos.example/1.")
        .await
        .expect("analysis");
    assert_eq!(data.summary, "A walk by the river");
    assert_eq!(data.entities, vec!["Thames"]);
    let urls: Vec<&str> = data.links.iter().map(|l| l.url.as_str()).collect();
    assert_eq!(urls, vec!["https://photos.example/1", "https://river.example"]);

    let request = request.await.expect("request seen");
    assert!(request.starts_with("POST /api/chat "));
    assert!(request.contains("\"format\":\"json\""));
    assert!(request.contains("\"model\":\"llama3\""));
}

#[tokio::test]
async fn diagnostic_model_parses_causes() {
    let answer = json!({
        "causes": [
            { "cause": "Ollama not running", "solution": "start it", "probability": 0.7 },
            { "cause": "wrong model name", "solution": "pull it", "probability": 0.2 }
        ]
    });
    let (base, _request) = serve_once("200 OK", "application/json", &chat_body(&answer)).await;

    let causes = OllamaDiagnosticModel::new("llama3", &base)
        .diagnose("## Processing logs\n[..] error failed: processing failed")
        .await
        .expect("diagnosis");
    assert_eq!(causes.len(), 2);
    assert_eq!(causes[0].cause, "Ollama not running");
}

#[tokio::test]
async fn embedder_checks_dimensions() {
    let body = json!({ "embeddings": [[0.1, 0.2, 0.3]] }).to_string();

    let (base, request) = serve_once("200 OK", "application/json", &body).await;
    let vector = OllamaEmbedder::with_base_url("nomic-embed-text", &base, 3)
        .embed("hello")
        .await
        .expect("embedding");
    assert_eq!(vector.len(), 3);
    let request = request.await.expect("request seen");
    assert!(request.starts_with("POST /api/embed "));
    assert!(request.contains("\"input\":\"hello\""));

    let (base, _request) = serve_once("200 OK", "application/json", &body).await;
    assert!(matches!(
        OllamaEmbedder::with_base_url("nomic-embed-text", &base, 768)
            .embed("hello")
            .await,
        Err(ProviderError::Parse(reason)) if reason.contains("expected 768")
    ));
}

#[tokio::test]
async fn error_bodies_are_redacted() {
    let token = format!("sk-{}", "a".repeat(32));
    let (base, _request) = serve_once(
        "500 Internal Server Error",
        "text/plain",
        &format!("bad key {token}"),
    )
    .await;

    let response = reqwest::get(base).await.expect("request should complete");
    match check_http_response(response).await {
        Err(ProviderError::HttpStatus { status, body }) => {
            assert_eq!(status, 500);
            assert!(!body.contains(&token));
            assert!(body.contains("[REDACTED]"));
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_a_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let result = OllamaEmbedder::with_base_url("m", &format!("http://{addr}"), 3)
        .embed("x")
        .await;
    assert!(matches!(result, Err(ProviderError::Request(_))));
}
