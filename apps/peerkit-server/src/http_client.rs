use std::time::Duration;

use peerkit_core::FetcherConfig;

fn keepalive() -> Duration {
    Duration::from_secs(60)
}

fn pool_idle() -> Duration {
    Duration::from_secs(90)
}

fn user_agent() -> String {
    format!("peerkit-server/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with harmonized defaults.
pub(crate) fn builder(cfg: &FetcherConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(cfg.connect_timeout())
        .tcp_keepalive(keepalive())
        .pool_idle_timeout(pool_idle())
        // Redirects could leave the allow-listed origin.
        .redirect(reqwest::redirect::Policy::none())
}

/// Client used by the chunk fetcher; the timeout bounds a whole download.
pub(crate) fn fetch_client(cfg: &FetcherConfig) -> reqwest::Result<reqwest::Client> {
    builder(cfg).timeout(cfg.request_timeout()).build()
}
