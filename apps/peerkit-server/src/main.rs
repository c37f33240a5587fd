use std::time::Duration;
use tracing::{error, info, warn};

mod api;
mod app_state;
mod bootstrap;
mod config;
mod diagnostics;
mod directory;
mod fetcher;
mod http_client;
mod hub;
mod ids;
mod offers;
mod registry;
mod router;
mod selector;
mod singleflight;
mod tasks;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    let loaded = match config::load_effective() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let cfg = loaded.config;

    peerkit_otel::init(cfg.server.debug);
    match &loaded.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }
    if cfg.fetcher.allowed_hosts.is_empty() {
        warn!("no allowed origin hosts configured; every REPORT will be rejected");
    }

    let http_cfg = match bootstrap::http_config(&cfg.server) {
        Ok(http_cfg) => http_cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let bootstrap::BootstrapOutput {
        router,
        background_tasks,
    } = match bootstrap::build(&cfg) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let listener = match tokio::net::TcpListener::bind(http_cfg.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: failed to bind {}: {err}", http_cfg.addr);
            std::process::exit(2);
        }
    };
    info!(addr = %http_cfg.addr, "peerkit server listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable; waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use futures_util::{SinkExt, StreamExt};
    use httpmock::prelude::*;
    use peerkit_core::Config;
    use serde_json::{json, Value};
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
    use tower::util::ServiceExt;

    type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.fetcher.allowed_hosts = vec!["127.0.0.1".into()];
        cfg
    }

    async fn get(router: axum::Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_reports_counts() {
        let out = bootstrap::build(&test_config()).unwrap();
        let (status, _, body) = get(out.router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value, json!({ "ok": true, "clients": 0, "resources": 0 }));
    }

    #[tokio::test]
    async fn poll_requires_urls() {
        let out = bootstrap::build(&test_config()).unwrap();
        let (status, _, body) = get(out.router, "/requestResource?callback=cb").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "need array");
    }

    #[tokio::test]
    async fn poll_returns_placeholders_as_json_or_jsonp() {
        let out = bootstrap::build(&test_config()).unwrap();
        let (status, _, body) = get(
            out.router.clone(),
            "/requestResource?urls=https%3A%2F%2Fcdn.example%2Fa.js&urls%5B%5D=",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "https://cdn.example/a.js": {
                    "file": { "url": "https://cdn.example/a.js" },
                    "peers": []
                }
            })
        );

        let (status, content_type, body) =
            get(out.router.clone(), "/requestResource?urls=x&callback=peerkit.cb").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/javascript"));
        assert_eq!(
            body,
            r#"peerkit.cb({"x":{"file":{"url":"x"},"peers":[]}});"#
        );

        let (status, _, _) = get(out.router, "/requestResource?urls=x&callback=alert(1)").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn next_json(socket: &mut Socket) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("frame within timeout")
                .expect("socket open")
                .expect("frame");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send_json(socket: &mut Socket, value: Value) {
        socket.send(Message::text(value.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn websocket_session_end_to_end() {
        let origin = MockServer::start_async().await;
        let body: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
        origin
            .mock_async(|when, then| {
                when.method(GET).path("/lib.js");
                then.status(200).body(body.clone());
            })
            .await;
        let resource = origin.url("/lib.js");

        let out = bootstrap::build(&test_config()).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, out.router).await;
        });
        let ws_url = format!("ws://{addr}/ws");

        let (mut a, _) = connect_async(ws_url.as_str()).await.unwrap();
        let (mut b, _) = connect_async(ws_url.as_str()).await.unwrap();

        send_json(&mut a, json!({ "type": "CONN", "conn": { "sdp": "offer-a" } })).await;
        send_json(&mut a, json!({ "type": "REPORT", "url": resource })).await;

        // Verification runs in the background; poll until the manifest shows up.
        let mut view = Value::Null;
        for _ in 0..100 {
            send_json(&mut b, json!({ "type": "REQUEST", "url": resource })).await;
            view = next_json(&mut b).await;
            assert_eq!(view["type"], "RESOURCE");
            if view["file"]["size"] == 5_000 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(view["file"]["chunks"].as_array().map(Vec::len), Some(10));
        let peers = view["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["data"], json!({ "sdp": "offer-a" }));
        let a_id = peers[0]["id"].as_str().unwrap().to_string();

        assert_eq!(next_json(&mut a).await, json!({ "type": "REPLENISH", "count": 1 }));

        send_json(
            &mut b,
            json!({ "type": "RESPONSE", "id": a_id, "data": { "sdp": "answer-b" } }),
        )
        .await;
        assert_eq!(
            next_json(&mut a).await,
            json!({ "type": "RESPONSE", "data": { "sdp": "answer-b" } })
        );

        a.close(None).await.unwrap();
        let mut holders_gone = false;
        for _ in 0..100 {
            let response = reqwest::get(format!("http://{addr}/healthz"))
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap();
            if response["clients"] == 1 {
                holders_gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(holders_gone);
        send_json(&mut b, json!({ "type": "REQUEST", "url": resource })).await;
        let view = next_json(&mut b).await;
        assert_eq!(view["peers"], json!([]));
        assert_eq!(view["file"]["size"], 5_000);
    }
}
