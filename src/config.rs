// Configuration for the proxy server
//
// Precedence, highest first: CLI flags, environment variables, built-in
// defaults. The backend URL is normalized once here - the generic proxy path
// works against the bare backend root, while the structured chat client
// re-adds the /v1 API suffix internally.

use std::env;
use std::net::SocketAddr;

/// Environment variable naming the backend base URL.
pub const BACKEND_URL_ENV: &str = "OLLAMA_URL";

/// Environment variable naming the OTLP collector endpoint.
pub const OTLP_ENDPOINT_ENV: &str = "OTLP_ENDPOINT";

/// Default backend address: a locally running Ollama instance.
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:11434";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub bind_addr: SocketAddr,

    /// Normalized backend base URL (no trailing slash, no /v1 suffix)
    pub backend_url: String,

    /// OTLP collector endpoint for span export, if configured
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Resolve configuration from CLI overrides and the environment.
    pub fn resolve(
        bind_addr: SocketAddr,
        backend: Option<String>,
        otlp_endpoint: Option<String>,
    ) -> Self {
        let backend = backend
            .or_else(|| env::var(BACKEND_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());

        let otlp_endpoint = otlp_endpoint.or_else(|| env::var(OTLP_ENDPOINT_ENV).ok());

        Self {
            bind_addr,
            backend_url: normalize_backend_url(&backend),
            otlp_endpoint,
        }
    }
}

/// Strip trailing slashes and a trailing "/v1" API suffix from the configured
/// backend URL. Callers sometimes hand us the OpenAI-compatible endpoint root;
/// the generic proxy must forward against the bare backend instead.
pub fn normalize_backend_url(raw: &str) -> String {
    let mut url = raw.trim().trim_end_matches('/');
    if let Some(stripped) = url.strip_suffix("/v1") {
        url = stripped.trim_end_matches('/');
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain_url() {
        assert_eq!(
            normalize_backend_url("http://127.0.0.1:11434"),
            "http://127.0.0.1:11434"
        );
    }

    #[test]
    fn test_normalize_strips_trailing_slash() {
        assert_eq!(
            normalize_backend_url("http://ollama:11434/"),
            "http://ollama:11434"
        );
    }

    #[test]
    fn test_normalize_strips_v1_suffix() {
        assert_eq!(
            normalize_backend_url("http://ollama:11434/v1"),
            "http://ollama:11434"
        );
        assert_eq!(
            normalize_backend_url("http://ollama:11434/v1/"),
            "http://ollama:11434"
        );
    }

    #[test]
    fn test_normalize_keeps_non_version_paths() {
        assert_eq!(
            normalize_backend_url("http://ollama:11434/api/"),
            "http://ollama:11434/api"
        );
    }
}
