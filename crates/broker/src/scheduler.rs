use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine::Engine;
use crate::transport::{Transport, FETCH_MAX_BATCHES};

/// Floor for the member-expiry interval.
const MIN_EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// The three background tickers: pending-fetch completion, retention, and
/// member expiry.  Each runs until the shutdown signal flips; `join` waits
/// them out.
pub struct Schedulers {
    handles: Vec<JoinHandle<()>>,
}

impl Schedulers {
    pub fn start(
        engine: Arc<Engine>,
        transport: Arc<Transport>,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(fetch_ticker(
            Arc::clone(&engine),
            transport,
            config.scheduler.tick_interval,
            shutdown.clone(),
        )));

        if config.retention.enabled {
            handles.push(tokio::spawn(retention_ticker(
                Arc::clone(&engine),
                config.retention.max_age,
                config.retention.check_interval,
                shutdown.clone(),
            )));
        }

        handles.push(tokio::spawn(expiry_ticker(
            engine,
            config.groups.session_timeout,
            shutdown,
        )));

        Self { handles }
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Walks the pending-fetch queue every tick: expired entries complete empty,
/// entries whose offset gained data complete with it.
async fn fetch_ticker(
    engine: Arc<Engine>,
    transport: Arc<Transport>,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        if engine.pending().is_empty() {
            continue;
        }
        let engine = Arc::clone(&engine);
        let transport = Arc::clone(&transport);
        let completed = tokio::task::spawn_blocking(move || {
            let completed =
                engine
                    .pending()
                    .take_actionable(engine.topics(), FETCH_MAX_BATCHES, Instant::now());
            let mut delivered = 0;
            for completion in completed {
                match transport.encode_parked_fetch(&completion.fetch, completion.batches) {
                    Ok(bytes) => {
                        let seq = completion.fetch.response_seq;
                        if completion.fetch.completion.blocking_send((seq, bytes)).is_ok() {
                            delivered += 1;
                        }
                    }
                    Err(err) => {
                        error!(topic = %completion.fetch.topic, error = %err, "encode parked fetch failed");
                    }
                }
            }
            delivered
        })
        .await
        .unwrap_or(0);
        if completed > 0 {
            debug!(completed, "completed parked fetches");
        }
    }
}

/// Periodically deletes records older than the retention window.
async fn retention_ticker(
    engine: Arc<Engine>,
    max_age: Duration,
    check_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    let mut ticker = tokio::time::interval(check_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        let engine = Arc::clone(&engine);
        let deleted = tokio::task::spawn_blocking(move || {
            let cutoff = crate::now_ms() - max_age_ms;
            engine.retention_sweep(cutoff)
        })
        .await
        .unwrap_or(0);
        if deleted > 0 {
            info!(deleted, "retention sweep removed records");
        }
    }
}

/// Drops group members whose heartbeat went stale, every third of the
/// session timeout.
async fn expiry_ticker(
    engine: Arc<Engine>,
    session_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let session_timeout_ms = i64::try_from(session_timeout.as_millis()).unwrap_or(i64::MAX);
    let interval = (session_timeout / 3).max(MIN_EXPIRY_INTERVAL);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        let engine = Arc::clone(&engine);
        let result = tokio::task::spawn_blocking(move || {
            engine.expire_members(session_timeout_ms, crate::now_ms())
        })
        .await;
        match result {
            Ok(Ok(0)) | Err(_) => {}
            Ok(Ok(expired)) => debug!(expired, "expired group members"),
            Ok(Err(err)) => error!(error = %err, "member expiry sweep failed"),
        }
    }
}
