use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use frontier_transitions::{
    BrowsingContext, DocumentId, IncomingDocument, LoadEvent, NavigationReason,
    ScriptTransitionListener, TransitionConfig,
};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;
use url::Url;

const START_URL: &str = "https://example.com/";
const DEFAULT_TARGET: &str = "https://example.com/next";
const FETCH_LATENCY: Duration = Duration::from_millis(120);

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(script_path) = args.next().map(PathBuf::from) else {
        eprintln!("usage: frontier-transitions <script.js> [reason] [target-url] [redirect-url...]");
        std::process::exit(2);
    };
    let reason = args.next().unwrap_or_else(|| String::from("normal"));
    let target = args.next().unwrap_or_else(|| String::from(DEFAULT_TARGET));
    let redirects: Vec<String> = args.collect();

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        });

    let local = LocalSet::new();
    if let Err(err) = local.block_on(&rt, run(script_path, reason, target, redirects)) {
        eprintln!("Navigation failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(
    script_path: PathBuf,
    reason: String,
    target: String,
    redirects: Vec<String>,
) -> Result<()> {
    let config = TransitionConfig::from_env().context("failed to load transition config")?;
    let reason: NavigationReason = reason.parse()?;
    let target =
        Url::parse(&target).with_context(|| format!("invalid target URL: {target}"))?;
    let redirects = redirects
        .iter()
        .map(|raw| Url::parse(raw).with_context(|| format!("invalid redirect URL: {raw}")))
        .collect::<Result<Vec<_>>>()?;
    let source = tokio::fs::read_to_string(&script_path)
        .await
        .with_context(|| format!("failed to read {}", script_path.display()))?;

    let mut context = BrowsingContext::new(
        &config,
        IncomingDocument {
            id: DocumentId(1),
            url: Url::parse(START_URL)?,
        },
    );
    let listener = ScriptTransitionListener::new(context.queue())?;
    context.controller().add_listener(listener.clone());
    listener.eval(&source, &script_path.display().to_string())?;

    // Stand-in for the network: every hop and the final response arrive a
    // little later, while the transition is already open.
    let (tx, rx) = mpsc::unbounded_channel();
    let final_url = redirects.last().cloned().unwrap_or_else(|| target.clone());
    tokio::task::spawn_local(async move {
        for hop in redirects {
            tokio::time::sleep(FETCH_LATENCY).await;
            if tx.send(LoadEvent::Redirect(hop)).is_err() {
                return;
            }
        }
        tokio::time::sleep(FETCH_LATENCY).await;
        let _ = tx.send(LoadEvent::Response(IncomingDocument {
            id: DocumentId(2),
            url: final_url,
        }));
    });

    let summary = context.navigate(target, reason, rx).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let frames = context.compositor().borrow_mut().take_paint_log();
    println!("{}", serde_json::to_string_pretty(&frames)?);
    Ok(())
}
