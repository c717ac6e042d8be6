use axum::{http::header, routing::get, routing::post, Json, Router};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn chat_keeps_previous_turns_in_the_prompt() {
    let prompts: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = prompts.clone();
    // Results point back at this server; the port is only known after binding.
    let port: Arc<Mutex<u16>> = Arc::default();
    let port_for_search = port.clone();

    let app = Router::new()
        .route(
            "/html/",
            post(move || {
                let port = *port_for_search.lock().unwrap();
                async move {
                    axum::response::Html(format!(
                        "<div class=\"result results_links web-result\">\
                         <a class=\"result__a\" href=\"http://127.0.0.1:{port}/tokyo\">Tokyo</a>\
                         <a class=\"result__snippet\">capital</a></div>"
                    ))
                }
            }),
        )
        .route(
            "/tokyo",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html")],
                    "<html><body><article><p>Tokyo is the capital of Japan. \
                     About 14 million people live in Tokyo.</p></article></body></html>",
                )
            }),
        )
        .route(
            "/v1/chat/completions",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = seen.clone();
                async move {
                    let user = body["messages"][1]["content"].as_str().unwrap_or("").to_string();
                    let n = {
                        let mut p = seen.lock().unwrap();
                        p.push(user);
                        p.len()
                    };
                    Json(serde_json::json!({
                        "choices": [{"message": {"content": format!("answer {n}")}}]
                    }))
                }
            }),
        );
    let addr = serve(app).await;
    *port.lock().unwrap() = addr.port();

    let mut child = tokio::process::Command::new(assert_cmd::cargo::cargo_bin!("websift"))
        .args(["chat", "--window", "3"])
        .env_remove("WEBSIFT_ENV_FILE")
        .env_remove("WEBSIFT_PLAN_QUERIES")
        .env("WEBSIFT_SEARCH_PROVIDER", "duckduckgo")
        .env("WEBSIFT_DDG_ENDPOINT", format!("http://{addr}/html/"))
        .env("WEBSIFT_LLM_PROVIDER", "openai")
        .env("WEBSIFT_OPENAI_BASE_URL", format!("http://{addr}"))
        .env("WEBSIFT_OPENAI_API_KEY", "sk-test")
        .env("RUST_LOG", "off")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn websift chat");

    let mut stdin = child.stdin.take().expect("stdin");
    stdin
        .write_all(b"capital of Japan\n\nhow many people live there?\n")
        .await
        .unwrap();
    drop(stdin);
    let out = child.wait_with_output().await.expect("wait websift chat");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let lines: Vec<serde_json::Value> = String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("one json document per line"))
        .collect();
    assert_eq!(lines.len(), 2, "blank input lines are skipped");
    assert_eq!(lines[0]["answer"].as_str(), Some("answer 1"));
    assert_eq!(lines[1]["question"].as_str(), Some("how many people live there?"));
    assert_eq!(lines[1]["answer"].as_str(), Some("answer 2"));

    let prompts = prompts.lock().unwrap();
    assert!(!prompts[0].contains("Previous conversation"));
    assert!(prompts[1].contains("Q: capital of Japan\nA: answer 1"));
}
