use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use websift_core::{Error, FetchRequest, FetchedPage, PageFetcher, Result};

pub mod config;
pub mod extract;
pub mod gemini;
pub mod openai_compat;
pub mod research;
pub mod search;

pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; websift/0.1)";

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    env(key).map(|s| {
        matches!(
            s.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env(key).and_then(|s| s.parse::<T>().ok())
}

/// Shared HTTP client for search, fetch and generation backends.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        // Avoid “hang forever” on DNS/TLS stalls; per-request timeouts are tighter.
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| Error::NotConfigured(format!("http client: {e}")))
}

enum DownloadError {
    Timeout(String),
    Transport(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownloadError::Timeout(e.to_string())
        } else {
            DownloadError::Transport(e.to_string())
        }
    }
}

struct Downloaded {
    status: u16,
    content_type: Option<String>,
    bytes: Vec<u8>,
    truncated: bool,
}

fn is_textual(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return true;
    };
    let ct = ct.to_ascii_lowercase();
    ct.starts_with("text/") || ct.contains("html") || ct.contains("xml")
}

fn is_plain_text(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/plain"))
        .unwrap_or(false)
}

/// The fetch tool: GET one URL, extract readable text, bound it.
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    client: reqwest::Client,
    text_width: usize,
}

impl LocalFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self::with_client(build_client()?))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            text_width: extract::DEFAULT_TEXT_WIDTH,
        }
    }

    pub fn with_text_width(mut self, width: usize) -> Self {
        self.text_width = width;
        self
    }

    async fn download(
        &self,
        url: url::Url,
        max_bytes: Option<u64>,
    ) -> std::result::Result<Downloaded, DownloadError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if status != 200 {
            return Ok(Downloaded {
                status,
                content_type,
                bytes: Vec::new(),
                truncated: false,
            });
        }

        let max_bytes = max_bytes.unwrap_or(u64::MAX) as usize;
        let mut truncated = false;
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if bytes.len().saturating_add(chunk.len()) > max_bytes {
                let can_take = max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(Downloaded {
            status,
            content_type,
            bytes,
            truncated,
        })
    }
}

#[async_trait::async_trait]
impl PageFetcher for LocalFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchedPage> {
        let url = req.validate()?;
        let mut timings_ms: BTreeMap<&'static str, u128> = BTreeMap::new();
        let t_req = Instant::now();

        let downloaded = match tokio::time::timeout(
            req.timeout(),
            self.download(url, req.max_bytes),
        )
        .await
        {
            Err(_elapsed) => {
                tracing::warn!(url = %req.url, timeout_ms = req.timeout_ms, "fetch timed out");
                return Ok(FetchedPage::timed_out(
                    &req.url,
                    format!(
                        "could not download page within {} ms; try fetching another page",
                        req.timeout_ms
                    ),
                ));
            }
            Ok(Err(DownloadError::Timeout(msg))) => {
                tracing::warn!(url = %req.url, error = %msg, "fetch timed out");
                return Ok(FetchedPage::timed_out(&req.url, msg));
            }
            Ok(Err(DownloadError::Transport(msg))) => {
                tracing::warn!(url = %req.url, error = %msg, "fetch transport failure");
                return Ok(FetchedPage::failed(&req.url, 500, msg));
            }
            Ok(Ok(d)) => d,
        };
        timings_ms.insert("network_fetch", t_req.elapsed().as_millis());

        if downloaded.status != 200 {
            tracing::info!(url = %req.url, status = downloaded.status, "fetch non-200");
            return Ok(FetchedPage::failed(
                &req.url,
                downloaded.status,
                format!(
                    "could not download page (HTTP {}); try fetching another page",
                    downloaded.status
                ),
            ));
        }
        let content_type = downloaded.content_type.as_deref();
        if !is_textual(content_type) {
            return Ok(FetchedPage::failed(
                &req.url,
                500,
                format!("unsupported content type: {}", content_type.unwrap_or("")),
            ));
        }
        if downloaded.truncated {
            tracing::debug!(url = %req.url, "body cut at max_bytes before extraction");
        }

        let plain = is_plain_text(content_type);
        let body = String::from_utf8_lossy(&downloaded.bytes).into_owned();
        let max_chars = req.max_content_chars;
        let width = self.text_width;
        let t_extract = Instant::now();
        // Extraction can be CPU-heavy on big pages; a panic in it must not escape this call.
        let extracted = tokio::task::spawn_blocking(move || {
            if plain {
                let (content, text_chars, truncated) =
                    extract::truncate_to_chars(body.trim(), max_chars);
                Ok(extract::ExtractedPage {
                    title: String::new(),
                    content,
                    text_chars,
                    truncated,
                })
            } else {
                extract::extract_page(&body, max_chars, width)
            }
        })
        .await;
        timings_ms.insert("extract", t_extract.elapsed().as_millis());

        let page = match extracted {
            Ok(Ok(p)) => FetchedPage::success(&req.url, p.title, p.content),
            Ok(Err(e)) => {
                tracing::warn!(url = %req.url, error = %e, "extraction failed");
                FetchedPage::failed(&req.url, 500, e.to_string())
            }
            Err(join) => {
                tracing::error!(url = %req.url, error = %join, "extraction panicked");
                FetchedPage::failed(&req.url, 500, format!("extraction aborted: {join}"))
            }
        };
        tracing::debug!(
            url = %req.url,
            status = page.status,
            chars = page.content.chars().count(),
            ?timings_ms,
            "fetch done"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;
    use websift_core::FetchFailure;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fetcher() -> LocalFetcher {
        LocalFetcher::with_client(reqwest::Client::new())
    }

    #[tokio::test]
    async fn fetch_extracts_title_and_bounded_content() {
        let para = "Tokyo is the capital of Japan. ".repeat(300);
        let body = format!(
            "<html><head><title>Tokyo</title></head><body><nav><a href='/'>MenuEntry</a></nav>\
             <article><p>{para}</p></article></body></html>"
        );
        let app = Router::new().route(
            "/doc",
            get(move || {
                let b = body.clone();
                async move { ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], b) }
            }),
        );
        let addr = serve(app).await;
        let req = FetchRequest::new(format!("http://{addr}/doc"))
            .unwrap()
            .with_max_content_chars(500);
        let page = fetcher().fetch(&req).await.unwrap();
        assert_eq!(page.status, 200);
        assert!(page.is_success());
        assert_eq!(page.title, "Tokyo");
        assert!(!page.has_next);
        assert_eq!(page.content.chars().count(), 500);
        assert!(!page.content.contains("MenuEntry"));
    }

    #[tokio::test]
    async fn text_width_controls_line_wrapping() {
        let para = "Tokyo is the capital of Japan and its most populous city. ".repeat(10);
        let body = format!("<html><body><article><p>{para}</p></article></body></html>");
        let app = Router::new().route(
            "/doc",
            get(move || {
                let b = body.clone();
                async move { ([(header::CONTENT_TYPE, "text/html")], b) }
            }),
        );
        let addr = serve(app).await;
        let req = FetchRequest::new(format!("http://{addr}/doc")).unwrap();
        let page = fetcher().with_text_width(40).fetch(&req).await.unwrap();
        assert!(page.content.lines().count() > 5);
        assert!(page.content.lines().all(|l| l.chars().count() <= 40));
    }

    #[tokio::test]
    async fn fetch_404_returns_status_and_empty_content() {
        let app = Router::new().route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, "<html><body>not here</body></html>") }),
        );
        let addr = serve(app).await;
        let req = FetchRequest::new(format!("http://{addr}/missing")).unwrap();
        let page = fetcher().fetch(&req).await.unwrap();
        assert_eq!(page.status, 404);
        assert_eq!(page.content, "");
        assert_eq!(page.title, "");
        assert!(matches!(page.failure, Some(FetchFailure::Failed { .. })));
    }

    #[tokio::test]
    async fn fetch_timeout_returns_500_without_error() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "<html><body>late</body></html>"
            }),
        );
        let addr = serve(app).await;
        let req = FetchRequest::new(format!("http://{addr}/slow"))
            .unwrap()
            .with_timeout_ms(200);
        let t0 = Instant::now();
        let page = fetcher().fetch(&req).await.unwrap();
        assert!(t0.elapsed() < Duration::from_secs(3));
        assert_eq!(page.status, 500);
        assert_eq!(page.content, "");
        assert!(matches!(page.failure, Some(FetchFailure::Timeout { .. })));
    }

    #[tokio::test]
    async fn fetch_empty_page_is_success_with_empty_content() {
        let app = Router::new().route(
            "/empty",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "") }),
        );
        let addr = serve(app).await;
        let req = FetchRequest::new(format!("http://{addr}/empty")).unwrap();
        let page = fetcher().fetch(&req).await.unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.content, "");
        assert!(page.failure.is_none());
    }

    #[tokio::test]
    async fn fetch_plain_text_skips_readability() {
        let app = Router::new().route(
            "/t.txt",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "  hello plain world  ") }),
        );
        let addr = serve(app).await;
        let req = FetchRequest::new(format!("http://{addr}/t.txt")).unwrap();
        let page = fetcher().fetch(&req).await.unwrap();
        assert_eq!(page.content, "hello plain world");
    }

    #[tokio::test]
    async fn fetch_binary_content_is_failed_page() {
        let app = Router::new().route(
            "/img.png",
            get(|| async {
                let png = vec![0x89u8, b'P', b'N', b'G'];
                ([(header::CONTENT_TYPE, "image/png")], png)
            }),
        );
        let addr = serve(app).await;
        let req = FetchRequest::new(format!("http://{addr}/img.png")).unwrap();
        let page = fetcher().fetch(&req).await.unwrap();
        assert_eq!(page.status, 500);
        assert!(page.content.is_empty());
        assert!(matches!(page.failure, Some(FetchFailure::Failed { .. })));
    }

    #[tokio::test]
    async fn fetch_connection_refused_is_failed_page() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let req = FetchRequest::new(format!("http://{addr}/")).unwrap();
        let page = fetcher().fetch(&req).await.unwrap();
        assert_eq!(page.status, 500);
        assert!(page.failure.is_some());
    }

    #[tokio::test]
    async fn malformed_url_is_rejected_before_io() {
        let req = FetchRequest {
            url: "not a url".to_string(),
            timeout_ms: 1_000,
            max_content_chars: 100,
            max_bytes: None,
        };
        assert!(matches!(
            fetcher().fetch(&req).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
