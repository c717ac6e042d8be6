use axum::{http::StatusCode, routing::post, Form, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn ddg_html(results: &[(&str, &str, &str)]) -> String {
    let mut out = String::from("<html><body><div id=\"links\">");
    for (title, url, snippet) in results {
        out.push_str(&format!(
            "<div class=\"result results_links web-result\">\
             <h2 class=\"result__title\"><a class=\"result__a\" href=\"{url}\">{title}</a></h2>\
             <a class=\"result__snippet\">{snippet}</a></div>"
        ));
    }
    out.push_str("</div></body></html>");
    out
}

async fn search(
    endpoint: &str,
    args: &[&str],
    envs: &[(&str, &str)],
) -> (std::process::Output, serde_json::Value) {
    let mut cmd = tokio::process::Command::new(assert_cmd::cargo::cargo_bin!("websift"));
    cmd.arg("search")
        .args(args)
        .env_remove("WEBSIFT_ENV_FILE")
        .env_remove("WEBSIFT_MAX_RESULTS")
        .env_remove("WEBSIFT_SEARCH_REGION")
        .env("WEBSIFT_SEARCH_PROVIDER", "duckduckgo")
        .env("WEBSIFT_DDG_ENDPOINT", endpoint)
        .env("RUST_LOG", "off");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let out = cmd.output().await.expect("run websift search");
    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("search prints one json document");
    (out, v)
}

#[tokio::test]
async fn search_returns_ranked_results_and_sends_backend_params() {
    let forms: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::default();
    let seen = forms.clone();
    let body = ddg_html(&[
        (
            "Tokyo - Wikipedia",
            "https://en.wikipedia.org/wiki/Tokyo",
            "Tokyo is the capital of Japan.",
        ),
        ("Japan", "https://en.wikipedia.org/wiki/Japan", "Island country in East Asia."),
        ("Third", "https://example.org/3", "three"),
    ]);
    let app = Router::new().route(
        "/html/",
        post(move |Form(form): Form<HashMap<String, String>>| {
            let seen = seen.clone();
            let body = body.clone();
            async move {
                seen.lock().unwrap().push(form);
                axum::response::Html(body)
            }
        }),
    );
    let addr = serve(app).await;
    let endpoint = format!("http://{addr}/html/");

    let (out, v) = search(
        &endpoint,
        &["capital of Japan", "--max-results", "2"],
        &[("WEBSIFT_SEARCH_REGION", "jp-jp")],
    )
    .await;

    assert!(out.status.success());
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["provider"].as_str(), Some("duckduckgo"));
    let results = v["results"].as_array().expect("results array");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["url"].as_str(), Some("https://en.wikipedia.org/wiki/Tokyo"));
    assert_eq!(results[0]["snippet"].as_str(), Some("Tokyo is the capital of Japan."));
    assert_eq!(results[1]["title"].as_str(), Some("Japan"));

    let forms = forms.lock().unwrap();
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0].get("q").map(String::as_str), Some("capital of Japan"));
    assert_eq!(forms[0].get("kl").map(String::as_str), Some("jp-jp"));
    assert_eq!(forms[0].get("kp").map(String::as_str), Some("-2"));
}

#[tokio::test]
async fn zero_max_results_is_empty_without_contacting_the_backend() {
    // Nothing listens on the discard port; any request would fail.
    let (out, v) =
        search("http://127.0.0.1:9/html/", &["anything", "--max-results", "0"], &[]).await;
    assert!(out.status.success());
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["results"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn backend_outage_is_search_unavailable() {
    let app = Router::new().route(
        "/html/",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
    );
    let addr = serve(app).await;
    let (out, v) = search(&format!("http://{addr}/html/"), &["capital of Japan"], &[]).await;

    assert_eq!(out.status.code(), Some(1));
    assert_eq!(v["ok"].as_bool(), Some(false));
    assert_eq!(v["kind"].as_str(), Some("search"));
    assert_eq!(v["error"]["code"].as_str(), Some("search_unavailable"));
}

#[tokio::test]
async fn blank_query_is_invalid_input() {
    let (out, v) = search("http://127.0.0.1:9/html/", &["   "], &[]).await;
    assert_eq!(out.status.code(), Some(2));
    assert_eq!(v["error"]["code"].as_str(), Some("invalid_input"));
}
