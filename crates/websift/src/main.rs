use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::time::Instant;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use websift_core::{
    Answer, Error, FetchRequest, PageFetcher, ResearchEvent, ResearchSession, SearchQuery,
    DEFAULT_SESSION_WINDOW,
};
use websift_local::config::{self, ResearchConfig};
use websift_local::research::ResearchLoop;
use websift_local::search::search_provider_from_env;
use websift_local::{build_client, LocalFetcher};

const SCHEMA_VERSION: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "websift")]
#[command(about = "Web search, page fetch and source-grounded answers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search the web; prints ranked results (json).
    Search(SearchCmd),
    /// Fetch one URL and extract its readable text (json).
    Fetch(FetchCmd),
    /// Search, read the top pages, and answer from them (json).
    Answer(AnswerCmd),
    /// Answer questions read line by line from stdin, keeping conversation memory (jsonl).
    Chat(ChatCmd),
    /// Report configuration without network calls (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

impl Commands {
    fn kind(&self) -> &'static str {
        match self {
            Commands::Search(_) => "search",
            Commands::Fetch(_) => "fetch",
            Commands::Answer(_) | Commands::Chat(_) => "answer",
            Commands::Doctor(_) => "doctor",
            Commands::Version(_) => "version",
        }
    }
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    query: String,
    /// Number of results (default: WEBSIFT_MAX_RESULTS or 5). Zero returns an empty list.
    #[arg(long)]
    max_results: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct FetchCmd {
    url: String,
    /// Deadline for the whole request (default: WEBSIFT_FETCH_TIMEOUT_MS or 10000).
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Cap on extracted characters (default: WEBSIFT_MAX_CONTENT_CHARS or 3000).
    #[arg(long)]
    max_chars: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct ResearchArgs {
    /// Pages read per question (default: WEBSIFT_FETCH_TOP_K or 2).
    #[arg(long)]
    top_k: Option<usize>,
    /// Let the model rewrite the question into a search query first.
    #[arg(long)]
    plan_queries: bool,
    /// Print each research step to stderr as a JSON line.
    #[arg(long)]
    events: bool,
    /// Override the model name of the configured LLM provider.
    #[arg(long)]
    model: Option<String>,
}

#[derive(clap::Args, Debug)]
struct AnswerCmd {
    question: String,
    #[command(flatten)]
    research: ResearchArgs,
}

#[derive(clap::Args, Debug)]
struct ChatCmd {
    /// Previous turns included in each prompt.
    #[arg(long, default_value_t = DEFAULT_SESSION_WINDOW)]
    window: usize,
    #[command(flatten)]
    research: ResearchArgs,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Opt-in `KEY=VALUE` file (`WEBSIFT_ENV_FILE`). Never overrides the process environment.
fn load_env_file() -> Result<()> {
    let Some(path) = std::env::var("WEBSIFT_ENV_FILE")
        .ok()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
    else {
        return Ok(());
    };
    let txt = std::fs::read_to_string(&path)
        .with_context(|| format!("reading WEBSIFT_ENV_FILE {path}"))?;
    for line in txt.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if !k.is_empty() && std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    // stdout carries the JSON result; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn error_envelope(kind: &str, e: &Error) -> serde_json::Value {
    serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "kind": kind,
        "ok": false,
        "error": {
            "code": e.code(),
            "message": e.to_string(),
        },
    })
}

fn exit_status(e: &Error) -> u8 {
    match e {
        Error::InvalidInput(_) => 2,
        Error::NotConfigured(_) => 3,
        Error::Cancelled => 130,
        _ => 1,
    }
}

fn answer_json(question: &str, a: &Answer) -> serde_json::Value {
    serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "kind": "answer",
        "ok": true,
        "question": question,
        "answer": a.text,
        "sources": a.sources,
        "warnings": a.warnings,
    })
}

fn research_config(args: &ResearchArgs) -> ResearchConfig {
    let mut c = ResearchConfig::from_env();
    if let Some(k) = args.top_k {
        c.top_k = k;
    }
    c.plan_queries |= args.plan_queries;
    c
}

fn research_loop(args: &ResearchArgs) -> websift_core::Result<ResearchLoop> {
    let client = build_client()?;
    let search = search_provider_from_env(client.clone())?;
    let generator = config::generator_from_env(client.clone(), args.model.clone())?;
    let fetcher = std::sync::Arc::new(LocalFetcher::with_client(client));
    Ok(ResearchLoop::new(search, fetcher, generator).with_config(research_config(args)))
}

fn attach_event_printer(rl: ResearchLoop, enabled: bool) -> (ResearchLoop, Option<JoinHandle<()>>) {
    if !enabled {
        return (rl, None);
    }
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ResearchEvent>();
    let printer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&ev) {
                eprintln!("{line}");
            }
        }
    });
    (rl.with_events(tx), Some(printer))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling in-flight requests");
            t.cancel();
        }
    });
    token
}

async fn cmd_search(args: SearchCmd) -> Result<()> {
    let cfg = ResearchConfig::from_env();
    let q = SearchQuery::new(args.query, args.max_results.unwrap_or(cfg.max_results))?
        .with_region(cfg.region);
    let provider = search_provider_from_env(build_client()?)?;
    let resp = provider.search(&q).await?;
    println!(
        "{}",
        serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "kind": "search",
            "ok": true,
            "query": q.query,
            "provider": resp.provider,
            "results": resp.results,
            "timings_ms": resp.timings_ms,
        })
    );
    Ok(())
}

async fn cmd_fetch(args: FetchCmd) -> Result<()> {
    let cfg = ResearchConfig::from_env();
    let req = FetchRequest::new(args.url)?
        .with_timeout_ms(args.timeout_ms.unwrap_or(cfg.fetch_timeout_ms))
        .with_max_content_chars(args.max_chars.unwrap_or(cfg.max_content_chars));
    let fetcher = LocalFetcher::with_client(build_client()?);
    let t0 = Instant::now();
    let page = fetcher.fetch(&req).await?;
    // A failed page is still a well-formed tool result; `ok` mirrors its status.
    println!(
        "{}",
        serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "kind": "fetch",
            "ok": page.is_success(),
            "elapsed_ms": t0.elapsed().as_millis(),
            "page": page,
        })
    );
    Ok(())
}

async fn cmd_answer(args: AnswerCmd) -> Result<()> {
    let rl = research_loop(&args.research)?;
    let (rl, printer) = attach_event_printer(rl, args.research.events);
    let cancel = cancel_on_ctrl_c();
    let mut session = ResearchSession::with_window(0);
    let outcome = rl
        .answer_with_cancel(&mut session, &args.question, &cancel)
        .await;
    // Dropping the loop closes the event channel so the printer drains and exits.
    drop(rl);
    if let Some(p) = printer {
        let _ = p.await;
    }
    let answer = outcome?;
    println!("{}", answer_json(args.question.trim(), &answer));
    Ok(())
}

async fn cmd_chat(args: ChatCmd) -> Result<()> {
    let rl = research_loop(&args.research)?;
    let (rl, printer) = attach_event_printer(rl, args.research.events);
    let cancel = cancel_on_ctrl_c();
    let mut session = ResearchSession::with_window(args.window);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        match rl.answer_with_cancel(&mut session, question, &cancel).await {
            Ok(a) => println!("{}", answer_json(question, &a)),
            Err(Error::Cancelled) => break,
            // One failed turn does not end the conversation.
            Err(e) => println!("{}", error_envelope("answer", &e)),
        }
    }

    drop(rl);
    if let Some(p) = printer {
        let _ = p.await;
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    Ok(())
}

fn cmd_doctor(args: DoctorCmd) {
    fn has_env(k: &str) -> bool {
        std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
    }
    fn check(name: &str, r: websift_core::Result<String>) -> serde_json::Value {
        match r {
            Ok(message) => serde_json::json!({"name": name, "ok": true, "message": message}),
            Err(e) => serde_json::json!({
                "name": name,
                "ok": false,
                "message": e.to_string(),
                "code": e.code(),
            }),
        }
    }

    let t0 = Instant::now();
    let cfg = ResearchConfig::from_env();
    let client = build_client();

    // Constructing providers reads configuration only; nothing here touches the network.
    let mut checks = vec![check(
        "http_client",
        match &client {
            Ok(_) => Ok("ok".to_string()),
            Err(e) => Err(e.clone()),
        },
    )];
    if let Ok(client) = &client {
        checks.push(check(
            "search_provider",
            search_provider_from_env(client.clone()).map(|p| p.name().to_string()),
        ));
        checks.push(check(
            "generator",
            config::generator_from_env(client.clone(), None)
                .map(|g| format!("{} ({})", g.name(), g.model())),
        ));
    }
    let ok = checks.iter().all(|c| c["ok"].as_bool() == Some(true));

    let v = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "kind": "doctor",
        "ok": ok,
        "name": "websift",
        "version": env!("CARGO_PKG_VERSION"),
        "elapsed_ms": t0.elapsed().as_millis(),
        "configured": {
            "env_file": has_env("WEBSIFT_ENV_FILE"),
            "search": {
                "provider": std::env::var("WEBSIFT_SEARCH_PROVIDER")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "duckduckgo".to_string()),
                "ddg_endpoint": has_env("WEBSIFT_DDG_ENDPOINT"),
                "searxng_endpoint": has_env("WEBSIFT_SEARXNG_ENDPOINT"),
            },
            "llm": {
                "provider": config::llm_provider_from_env(),
                "openai_api_key": has_env("WEBSIFT_OPENAI_API_KEY") || has_env("OPENAI_API_KEY"),
                "openai_base_url": has_env("WEBSIFT_OPENAI_BASE_URL") || has_env("OPENAI_BASE_URL"),
                "gemini_api_key": has_env("WEBSIFT_GEMINI_API_KEY")
                    || has_env("GEMINI_API_KEY")
                    || has_env("GOOGLE_API_KEY"),
                "timeout_ms": config::llm_timeout_from_env().as_millis(),
            },
            "research": cfg,
        },
        "checks": checks,
    });

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            for c in &checks {
                let mark = if c["ok"].as_bool() == Some(true) { "ok" } else { "FAIL" };
                println!(
                    "{mark:4} {}: {}",
                    c["name"].as_str().unwrap_or(""),
                    c["message"].as_str().unwrap_or("")
                );
            }
        }
        _ => println!("{v}"),
    }
}

fn cmd_version(args: VersionCmd) {
    let v = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "kind": "version",
        "ok": true,
        "name": "websift",
        "version": env!("CARGO_PKG_VERSION"),
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => println!("websift {}", env!("CARGO_PKG_VERSION")),
        _ => println!("{v}"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    load_env_file()?;
    init_tracing();

    let cli = Cli::parse();
    let kind = cli.command.kind();
    let outcome = match cli.command {
        Commands::Search(args) => cmd_search(args).await,
        Commands::Fetch(args) => cmd_fetch(args).await,
        Commands::Answer(args) => cmd_answer(args).await,
        Commands::Chat(args) => cmd_chat(args).await,
        Commands::Doctor(args) => {
            cmd_doctor(args);
            Ok(())
        }
        Commands::Version(args) => {
            cmd_version(args);
            Ok(())
        }
    };

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => match e.downcast_ref::<Error>() {
            Some(err) => {
                tracing::debug!(code = err.code(), "command failed");
                println!("{}", error_envelope(kind, err));
                Ok(ExitCode::from(exit_status(err)))
            }
            None => Err(e),
        },
    }
}
