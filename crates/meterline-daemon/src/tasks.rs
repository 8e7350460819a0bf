//! Background tasks and their shutdown
//!
//! Every counter and every rules device gets its own task. Each task awaits
//! its own work before the next tick, so passes of one task never overlap.

use chrono::Utc;
use meterline_core::shutdown::{Shutdown, ShutdownTrigger};
use meterline_core::{counter, CachedValue, RuleEngine};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Keys whose value or time differs between two cache snapshots
pub fn changed_keys(
    previous: &HashMap<String, CachedValue>,
    current: &HashMap<String, CachedValue>,
) -> Vec<String> {
    current
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Re-evaluate the rules of one device whenever their inputs change
async fn run_rules(state: Arc<AppState>, device: String, mut shutdown: Shutdown) {
    let engine = RuleEngine::new(
        std::slice::from_ref(&device),
        &state.config.outputs,
        state.config.types.clone(),
    );
    let every = Duration::from_secs(state.config.rules.interval_secs.max(1));
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = HashMap::new();

    info!(device = %device, outputs = engine.outputs().len(), "Rules started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = state.cache.snapshot();
                let changed = changed_keys(&previous, &current);
                previous = current;
                if changed.is_empty() {
                    continue;
                }

                let derived = engine.on_update(&changed, &state.cache, Utc::now());
                if derived.is_empty() {
                    continue;
                }
                debug!(device = %device, derived = derived.len(), "Rules produced values");
                let index = state.index.read().await;
                if let Err(e) = state.recorder.record_derived(&index, &derived).await {
                    warn!(device = %device, error = %e, "Failed to record derived values");
                }
                previous = state.cache.snapshot();
            }
            _ = shutdown.triggered() => break,
        }
    }
    info!(device = %device, "Rules stopped");
}

/// Re-ingest the probe whenever it changes
async fn run_probe_refresh(state: Arc<AppState>, every: Duration, mut shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.ingest().await {
                    Ok(Some(report)) => info!(created = report.created, "Probe re-ingested"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Probe refresh failed"),
                }
            }
            _ = shutdown.triggered() => break,
        }
    }
}

/// Spawn every background task
pub fn spawn_all(state: &Arc<AppState>, shutdown: &Shutdown) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    let retry_delay = state.config.store.retry_delay();

    for spec in &state.config.counters {
        tasks.spawn(counter::run(
            spec.clone(),
            state.store.clone(),
            retry_delay,
            shutdown.clone(),
        ));
    }

    if !state.config.outputs.is_empty() {
        for device in &state.config.rules.devices {
            tasks.spawn(run_rules(state.clone(), device.clone(), shutdown.clone()));
        }
    }

    if state.config.probe.refresh_secs > 0 {
        let every = Duration::from_secs(state.config.probe.refresh_secs);
        tasks.spawn(run_probe_refresh(state.clone(), every, shutdown.clone()));
    }

    info!(tasks = tasks.len(), "Background tasks started");
    tasks
}

/// Resolve on ctrl-c or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Trigger shutdown on the first signal
pub fn listen_for_signals(trigger: ShutdownTrigger) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        trigger.trigger();
    })
}

/// Give tasks `grace` to finish after shutdown, then abort them
pub async fn drain(mut tasks: JoinSet<()>, grace: Duration) {
    info!(tasks = tasks.len(), grace_secs = grace.as_secs(), "Shutting down");

    let drained = tokio::time::timeout(grace, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Task ended abnormally");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = tasks.len(), "Grace period elapsed, aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StoreKind};
    use meterline_core::{CacheView, InMemoryStore, OutputSpec, Scalar, Store};

    fn cached(value: &str, secs: i64) -> CachedValue {
        CachedValue {
            value: Scalar::from(value),
            time: chrono::DateTime::from_timestamp(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_changed_keys() {
        let mut previous = HashMap::new();
        previous.insert("a".to_string(), cached("1", 0));
        previous.insert("b".to_string(), cached("1", 0));
        let mut current = previous.clone();
        current.insert("b".to_string(), cached("1", 1));
        current.insert("c".to_string(), cached("1", 0));

        let mut changed = changed_keys(&previous, &current);
        changed.sort();
        assert_eq!(changed, vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_tasks() {
        let (trigger, shutdown) = meterline_core::shutdown::channel();
        let mut tasks = JoinSet::new();
        let mut rx = shutdown.clone();
        tasks.spawn(async move { rx.triggered().await });
        trigger.trigger();
        drain(tasks, Duration::from_secs(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_stuck_tasks() {
        let (trigger, _shutdown) = meterline_core::shutdown::channel();
        let mut tasks = JoinSet::new();
        tasks.spawn(std::future::pending::<()>());
        trigger.trigger();
        drain(tasks, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rules_task_derives_values() {
        let mut config = Config::default();
        config.store.kind = StoreKind::Memory;
        config.rules.devices = vec!["d1".to_string()];
        config.outputs = vec![OutputSpec {
            depends_on: vec!["${deviceId}-state".to_string()],
            key: "${deviceId}-execution".to_string(),
            value: "<state>".to_string(),
        }];
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let state = AppState::new(config, store).unwrap();
        state.cache.set("d1-state", Scalar::from("ACTIVE"), Utc::now());

        let (trigger, shutdown) = meterline_core::shutdown::channel();
        let tasks = spawn_all(&state, &shutdown);
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.trigger();
        drain(tasks, Duration::from_secs(1)).await;

        assert_eq!(
            state.cache.get("d1-execution").map(|v| v.value),
            Some(Scalar::from("ACTIVE"))
        );
    }
}
