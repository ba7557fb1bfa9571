//! Shared helpers for integration tests: a minimal HTTP stub standing in for
//! the remote compute session service, and a fully wired job context.

use metaharvest_orchestration::{
    ComputeSessionClient, Config, JobContext, MetadataStore, SearchIndexClient, SessionRegistry,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        }
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.headers
            .push(("Location".to_string(), location.to_string()));
        self
    }

    pub fn not_found() -> Self {
        Self::json(404, "{}")
    }
}

/// Spawn a one-request-per-connection HTTP responder. The handler maps
/// `(method, path)` to a canned response.
pub async fn spawn_stub(
    handler: impl Fn(&str, &str) -> StubResponse + Send + Sync + 'static,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };

            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = header_end(&buf) {
                    let head = String::from_utf8_lossy(&buf[..end]).to_string();
                    let expected = content_length(&head);
                    if buf.len() - (end + 4) >= expected {
                        break;
                    }
                }
            }

            let head = String::from_utf8_lossy(&buf).to_string();
            let mut request_line = head.lines().next().unwrap_or("").split_whitespace();
            let method = request_line.next().unwrap_or("").to_string();
            let path = request_line.next().unwrap_or("").to_string();

            let response = handler(&method, &path);
            let mut out = format!("HTTP/1.1 {} Stub\r\n", response.status);
            for (name, value) in &response.headers {
                out.push_str(&format!("{name}: {value}\r\n"));
            }
            out.push_str(&format!(
                "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                response.body.len(),
                response.body
            ));

            let _ = socket.write_all(out.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    format!("http://{addr}")
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

/// A context whose compute client points at `compute_url` and whose search
/// client points nowhere reachable.
pub async fn context_with_compute(compute_url: &str, config: Config) -> JobContext {
    let config = Arc::new(config);
    let store = Arc::new(MetadataStore::in_memory().await.unwrap());
    let client = Arc::new(
        ComputeSessionClient::from_parts(
            compute_url.to_string(),
            config.compute.session_config.clone(),
        )
        .unwrap(),
    );
    let sessions = Arc::new(SessionRegistry::new(store.clone(), client.clone()));
    JobContext::new(store, client, sessions, config)
}

#[allow(dead_code)]
pub fn unreachable_search_client() -> Arc<SearchIndexClient> {
    // nothing listens on port 1
    Arc::new(SearchIndexClient::from_base_url("http://127.0.0.1:1".to_string()).unwrap())
}
