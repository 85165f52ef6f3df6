#![allow(dead_code)]

use request_router::test_utils::ScriptedSession;
use request_router::{Request, Router};
use router_config::{RetryConfig, RouterConfig};
use std::time::{Duration, Instant};

/// Short timings so tests settle quickly
pub fn fast_config() -> RouterConfig {
    let mut config = RouterConfig::default();
    config.session.poll_interval_ms = 5;
    config.session.connect_timeout_ms = 2_000;
    config.session.service_timeout_ms = 2_000;
    config.session.shutdown_timeout_ms = 2_000;
    config.retry = RetryConfig {
        max_attempts: 3,
        base_backoff_ms: 5,
        jitter_ms: 0,
    };
    config
}

pub async fn start(session: &ScriptedSession) -> Router {
    start_with(session, fast_config()).await
}

pub async fn start_with(session: &ScriptedSession, config: RouterConfig) -> Router {
    Router::start(session.clone(), config)
        .await
        .expect("router should start")
}

/// Securities carried by a reference-data request
pub fn requested_securities(request: &Request) -> Vec<String> {
    request
        .element
        .child("securities")
        .and_then(|s| s.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().ok().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
