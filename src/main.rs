// Ollatap - tracing reverse proxy for a local Ollama backend
//
// Sits between a caller and an Ollama-style inference backend, forwards every
// request transparently, and attaches the interesting facts (prompt, system
// text, assembled completion, token usage) to one OpenTelemetry span per
// request.
//
// Architecture:
// - Proxy server (axum): one structured chat-completions route + catch-all
// - Extract: best-effort parsing of single-document and streamed JSON blobs
// - Client: structured chat-completion client for the special route
// - Telemetry: span capability backed by an OTLP exporter

mod client;
mod config;
mod extract;
mod proxy;
mod telemetry;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use client::{ChatCompletions, HttpChatClient};
use config::Config;
use telemetry::TraceSink;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "ollatap",
    version,
    about = "Tracing reverse proxy for a local Ollama backend"
)]
struct Args {
    /// Address to bind the proxy server to
    #[arg(long, default_value = "127.0.0.1:11435")]
    bind: std::net::SocketAddr,

    /// Backend base URL (overrides OLLAMA_URL)
    #[arg(long)]
    backend: Option<String>,

    /// OTLP collector endpoint for span export (overrides OTLP_ENDPOINT)
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::resolve(args.bind, args.backend, args.otlp_endpoint);

    telemetry::otel::init_logging();

    // A broken exporter setup downgrades to no-op tracing rather than
    // refusing to proxy; telemetry is strictly best-effort.
    let _otel_guard = match telemetry::otel::init_tracer(config.otlp_endpoint.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            tracing::warn!("telemetry disabled: {err:#}");
            None
        }
    };

    let sink: Arc<dyn TraceSink> = Arc::new(telemetry::otel::OtelSink::new());
    let chat: Arc<dyn ChatCompletions> = Arc::new(HttpChatClient::new(&config.backend_url)?);

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
    };

    proxy::start_proxy(config, sink, chat, shutdown).await
}
