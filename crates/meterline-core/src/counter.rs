//! Lifetime counter reconciliation
//!
//! Machines report a part counter that resets (power cycle, shift change,
//! operator action). This module derives a lifetime counter from it that only
//! ever grows: every positive step of the raw counter is added, everything
//! else is ignored.
//!
//! An engine runs in two phases. [`Phase::Backfilling`] replays the raw
//! counter from the last written lifetime value (or from the first raw sample
//! when there is none) up to now. [`Phase::SteadyPolling`] then handles
//! consecutive windows `[window_start, now]`, each starting where the previous
//! one ended. Lifetime values are written with `upsert_samples`, so replaying
//! a window rewrites the same points instead of duplicating them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::node::{NodeId, SampleRecord, Series, TimedValue};
use crate::path::SEPARATOR;
use crate::shutdown::Shutdown;
use crate::store::{Store, StoreError};

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

fn default_interval_secs() -> u64 {
    5
}

/// A lifetime counter derived from a delta counter of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSpec {
    /// Canonical path of the device
    pub device: String,
    /// Raw counter DataItem path, relative to the device
    pub delta: String,
    /// Lifetime counter DataItem path, relative to the device
    pub lifetime: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl CounterSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    fn item_path(&self, relative: &str) -> String {
        format!("{}{}{}", self.device, SEPARATOR, relative)
    }

    pub fn delta_path(&self) -> String {
        self.item_path(&self.delta)
    }

    pub fn lifetime_path(&self) -> String {
        self.item_path(&self.lifetime)
    }
}

/// Node ids a counter reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterIds {
    pub device_id: NodeId,
    pub delta_id: NodeId,
    pub lifetime_id: NodeId,
}

impl CounterIds {
    pub fn delta(&self) -> Series {
        Series::new(self.device_id, self.delta_id)
    }

    pub fn lifetime(&self) -> Series {
        Series::new(self.device_id, self.lifetime_id)
    }
}

/// Add up the positive steps of a raw counter.
///
/// `rows[0]` is the baseline. Rows at or before `after` are already part of
/// `lifetime` and only move the baseline. Rows without a numeric value are
/// ignored. Returns the final lifetime and one point per accepted step.
pub fn accumulate(
    mut lifetime: f64,
    rows: &[TimedValue],
    after: Option<DateTime<Utc>>,
) -> (f64, Vec<TimedValue>) {
    let mut written = Vec::new();
    let mut previous: Option<f64> = None;

    for row in rows {
        let Some(current) = row.value.as_f64() else {
            continue;
        };
        if let Some(previous) = previous {
            let delta = current - previous;
            let counted = after.is_some_and(|after| row.time <= after);
            if delta > 0.0 && !counted {
                lifetime += delta;
                written.push(TimedValue::new(row.time, lifetime));
            }
        }
        previous = Some(current);
    }
    (lifetime, written)
}

/// Where an engine is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Backfilling,
    SteadyPolling { window_start: DateTime<Utc> },
}

/// Result of one backfill or poll
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    pub lifetime: f64,
    pub written: Vec<TimedValue>,
}

/// Lifetime counter state machine for one device metric
pub struct CounterEngine {
    store: Arc<dyn Store>,
    ids: CounterIds,
    phase: Phase,
}

impl CounterEngine {
    pub fn new(store: Arc<dyn Store>, ids: CounterIds) -> Self {
        Self {
            store,
            ids,
            phase: Phase::Backfilling,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Backfill first, then poll on every later call
    pub async fn step(&mut self, now: DateTime<Utc>) -> Result<Pass, CounterError> {
        match self.phase {
            Phase::Backfilling => self.backfill(now).await,
            Phase::SteadyPolling { window_start } => self.poll(window_start, now).await,
        }
    }

    /// Replay the raw counter from the last lifetime value up to `now`
    pub async fn backfill(&mut self, now: DateTime<Utc>) -> Result<Pass, CounterError> {
        let start = match self.store.latest_before(self.ids.lifetime(), now).await? {
            Some(record) => Some(record),
            None => self
                .store
                .earliest(self.ids.delta())
                .await?
                .map(|first| TimedValue::new(first.time, 0.0)),
        };

        let pass = match start {
            Some(start) => {
                let lifetime = start.value.as_f64().unwrap_or(0.0);
                let rows = self.store.range(self.ids.delta(), start.time, now).await?;
                self.write(lifetime, &rows, Some(start.time)).await?
            }
            None => {
                debug!(series = %self.ids.delta(), "No raw counter samples to backfill");
                Pass {
                    lifetime: 0.0,
                    written: Vec::new(),
                }
            }
        };

        info!(
            series = %self.ids.lifetime(),
            written = pass.written.len(),
            lifetime = pass.lifetime,
            "Backfill done"
        );
        self.phase = Phase::SteadyPolling { window_start: now };
        Ok(pass)
    }

    /// Fold the raw samples of `[start, end]` into the lifetime counter
    pub async fn poll(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Pass, CounterError> {
        let (lifetime, after) = match self.store.latest_before(self.ids.lifetime(), start).await? {
            Some(record) => (record.value.as_f64().unwrap_or(0.0), Some(record.time)),
            None => (0.0, None),
        };
        let rows = self.store.range(self.ids.delta(), start, end).await?;
        let pass = self.write(lifetime, &rows, after).await?;

        debug!(
            series = %self.ids.lifetime(),
            rows = rows.len(),
            written = pass.written.len(),
            lifetime = pass.lifetime,
            "Polled counter"
        );
        self.phase = Phase::SteadyPolling { window_start: end };
        Ok(pass)
    }

    async fn write(
        &self,
        lifetime: f64,
        rows: &[TimedValue],
        after: Option<DateTime<Utc>>,
    ) -> Result<Pass, CounterError> {
        let (lifetime, written) = accumulate(lifetime, rows, after);
        if !written.is_empty() {
            let records: Vec<SampleRecord> = written
                .iter()
                .map(|point| SampleRecord::new(self.ids.lifetime(), point.time, point.value.clone()))
                .collect();
            self.store.upsert_samples(&records).await?;
        }
        Ok(Pass { lifetime, written })
    }
}

/// Look up a node id by path until it exists; `None` on shutdown
pub async fn wait_for_node(
    store: &dyn Store,
    path: &str,
    retry_delay: Duration,
    shutdown: &mut Shutdown,
) -> Option<NodeId> {
    loop {
        match store.lookup_node(path).await {
            Ok(Some(id)) => return Some(id),
            Ok(None) => debug!(path = %path, "Waiting for node"),
            Err(e) => warn!(path = %path, error = %e, "Node lookup failed"),
        }
        if !shutdown.sleep(retry_delay).await {
            return None;
        }
    }
}

/// Resolve every node a counter needs; `None` on shutdown
pub async fn resolve_ids(
    store: &dyn Store,
    spec: &CounterSpec,
    retry_delay: Duration,
    shutdown: &mut Shutdown,
) -> Option<CounterIds> {
    let device_id = wait_for_node(store, &spec.device, retry_delay, shutdown).await?;
    let delta_id = wait_for_node(store, &spec.delta_path(), retry_delay, shutdown).await?;
    let lifetime_id = wait_for_node(store, &spec.lifetime_path(), retry_delay, shutdown).await?;
    Some(CounterIds {
        device_id,
        delta_id,
        lifetime_id,
    })
}

/// Counter task: resolve ids, backfill, then poll every interval until shutdown.
///
/// A failed pass keeps its window, so the next tick covers the gap.
pub async fn run(spec: CounterSpec, store: Arc<dyn Store>, retry_delay: Duration, mut shutdown: Shutdown) {
    let Some(ids) = resolve_ids(store.as_ref(), &spec, retry_delay, &mut shutdown).await else {
        return;
    };
    info!(device = %spec.device, lifetime = %spec.lifetime, "Counter started");

    let mut engine = CounterEngine::new(store, ids);
    let mut ticker = tokio::time::interval(spec.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.step(Utc::now()).await {
                    warn!(device = %spec.device, lifetime = %spec.lifetime, error = %e, "Counter pass failed");
                }
            }
            _ = shutdown.triggered() => break,
        }
    }
    info!(device = %spec.device, lifetime = %spec.lifetime, "Counter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Scalar;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn rows(values: &[f64]) -> Vec<TimedValue> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TimedValue::new(at(i as i64), *v))
            .collect()
    }

    fn ids() -> CounterIds {
        CounterIds {
            device_id: NodeId(1),
            delta_id: NodeId(2),
            lifetime_id: NodeId(3),
        }
    }

    async fn store_with(values: &[f64]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let records: Vec<SampleRecord> = rows(values)
            .into_iter()
            .map(|r| SampleRecord::new(ids().delta(), r.time, r.value))
            .collect();
        store.append_samples(&records).await.unwrap();
        store
    }

    fn lifetimes(points: &[TimedValue]) -> Vec<f64> {
        points.iter().filter_map(|p| p.value.as_f64()).collect()
    }

    #[test]
    fn test_reset_is_skipped() {
        let (lifetime, written) = accumulate(0.0, &rows(&[0.0, 100.0, 101.0, 102.0, 0.0, 1.0, 2.0]), None);
        assert_eq!(lifetime, 104.0);
        assert_eq!(lifetimes(&written), vec![100.0, 101.0, 102.0, 103.0, 104.0]);
        assert_eq!(written[3].time, at(5));
    }

    #[test]
    fn test_already_counted_rows_move_baseline_only() {
        let (lifetime, written) = accumulate(7.0, &rows(&[1.0, 2.0, 3.0, 5.0]), Some(at(2)));
        assert_eq!(lifetime, 9.0);
        assert_eq!(written, vec![TimedValue::new(at(3), 9.0)]);
    }

    #[test]
    fn test_non_numeric_rows_are_ignored() {
        let mut raw = rows(&[1.0, 2.0, 0.0, 3.0]);
        raw[2].value = Scalar::from("UNAVAILABLE");
        let (lifetime, _) = accumulate(0.0, &raw, None);
        assert_eq!(lifetime, 2.0);
    }

    #[test]
    fn test_empty_and_single_rows() {
        assert_eq!(accumulate(5.0, &[], None), (5.0, vec![]));
        assert_eq!(accumulate(5.0, &rows(&[9.0]), None), (5.0, vec![]));
    }

    #[tokio::test]
    async fn test_backfill_seeds_from_first_sample() {
        let store = store_with(&[100.0, 101.0, 102.0, 0.0, 1.0, 2.0]).await;
        let mut engine = CounterEngine::new(store.clone(), ids());
        assert_eq!(engine.phase(), Phase::Backfilling);

        let pass = engine.step(at(10)).await.unwrap();
        assert_eq!(pass.lifetime, 4.0);
        assert_eq!(lifetimes(&store.samples(ids().lifetime())), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(engine.phase(), Phase::SteadyPolling { window_start: at(10) });
    }

    #[tokio::test]
    async fn test_backfill_without_samples() {
        let store = Arc::new(InMemoryStore::new());
        let mut engine = CounterEngine::new(store.clone(), ids());
        let pass = engine.backfill(at(10)).await.unwrap();
        assert!(pass.written.is_empty());
        assert!(matches!(engine.phase(), Phase::SteadyPolling { .. }));
    }

    #[tokio::test]
    async fn test_backfill_resumes_after_last_lifetime() {
        let store = store_with(&[0.0, 100.0, 101.0, 102.0, 0.0, 1.0, 2.0]).await;
        store
            .upsert_samples(&[SampleRecord::new(ids().lifetime(), at(3), 502.0)])
            .await
            .unwrap();

        let mut engine = CounterEngine::new(store.clone(), ids());
        let pass = engine.backfill(at(10)).await.unwrap();
        assert_eq!(pass.lifetime, 504.0);
        assert_eq!(lifetimes(&pass.written), vec![503.0, 504.0]);
    }

    #[tokio::test]
    async fn test_rerun_backfill_does_not_duplicate() {
        let store = store_with(&[0.0, 1.0, 2.0, 3.0]).await;
        CounterEngine::new(store.clone(), ids()).backfill(at(2)).await.unwrap();
        let first = store.samples(ids().lifetime());

        let mut again = CounterEngine::new(store.clone(), ids());
        again.poll(at(1), at(2)).await.unwrap();
        assert_eq!(store.samples(ids().lifetime()), first);

        again.backfill(at(10)).await.unwrap();
        assert_eq!(lifetimes(&store.samples(ids().lifetime())), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_backfill_and_poll_match_full_replay() {
        let raw = [0.0, 100.0, 101.0, 102.0, 0.0, 1.0, 2.0, 2.0, 5.0];
        let (expected, _) = accumulate(0.0, &rows(&raw), None);

        for split in 0..raw.len() as i64 {
            let store = store_with(&raw).await;
            let mut engine = CounterEngine::new(store.clone(), ids());
            engine.step(at(split)).await.unwrap();
            let pass = engine.step(at(raw.len() as i64 + 1)).await.unwrap();
            assert_eq!(pass.lifetime, expected, "split at {}", split);

            let written = lifetimes(&store.samples(ids().lifetime()));
            assert_eq!(written.last().copied().unwrap_or(0.0), expected);
        }
    }

    #[tokio::test]
    async fn test_poll_across_gap_uses_last_lifetime() {
        let store = store_with(&[0.0, 3.0]).await;
        let mut engine = CounterEngine::new(store.clone(), ids());
        engine.backfill(at(5)).await.unwrap();

        let late = [SampleRecord::new(ids().delta(), at(20), 4.0)];
        store.append_samples(&late).await.unwrap();

        let idle = engine.poll(at(5), at(10)).await.unwrap();
        assert!(idle.written.is_empty());
        let pass = engine.poll(at(10), at(25)).await.unwrap();
        assert_eq!(pass.lifetime, 4.0);
    }

    #[tokio::test]
    async fn test_wait_for_node_until_created() {
        use crate::node::{NewNode, NodeKind};
        let store = Arc::new(InMemoryStore::new());
        let (_trigger, mut shutdown) = crate::shutdown::channel();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer
                .insert_node(&NewNode {
                    kind: NodeKind::Device,
                    path: "Device(m1, u1)".into(),
                    properties: serde_json::Map::new(),
                })
                .await
                .unwrap();
        });

        let id = wait_for_node(store.as_ref(), "Device(m1, u1)", Duration::from_millis(10), &mut shutdown).await;
        assert!(id.is_some());
    }

    #[tokio::test]
    async fn test_wait_for_node_stops_on_shutdown() {
        let store = InMemoryStore::new();
        let (trigger, mut shutdown) = crate::shutdown::channel();
        trigger.trigger();
        let id = wait_for_node(&store, "missing", Duration::from_secs(3600), &mut shutdown).await;
        assert_eq!(id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_backfills_then_polls_until_shutdown() {
        use crate::node::{NewNode, NodeKind};
        let store = Arc::new(InMemoryStore::new());
        let spec = CounterSpec {
            device: "Device(m1, u1)".to_string(),
            delta: "part_count".to_string(),
            lifetime: "part_count-all".to_string(),
            interval_secs: 5,
        };
        let mut node_ids = Vec::new();
        for (kind, path) in [
            (NodeKind::Device, spec.device.clone()),
            (NodeKind::DataItem, spec.delta_path()),
            (NodeKind::DataItem, spec.lifetime_path()),
        ] {
            let node = NewNode {
                kind,
                path,
                properties: serde_json::Map::new(),
            };
            node_ids.push(store.insert_node(&node).await.unwrap());
        }
        let delta = Series::new(node_ids[0], node_ids[1]);
        let lifetime = Series::new(node_ids[0], node_ids[2]);

        let now = Utc::now();
        let past: Vec<SampleRecord> = [(30, 0.0), (20, 3.0), (10, 5.0)]
            .iter()
            .map(|(ago, v)| SampleRecord::new(delta, now - chrono::Duration::seconds(*ago), *v))
            .collect();
        store.append_samples(&past).await.unwrap();

        let (trigger, shutdown) = crate::shutdown::channel();
        let task = tokio::spawn(run(spec, store.clone(), Duration::from_millis(10), shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lifetimes(&store.samples(lifetime)), vec![3.0, 5.0]);

        store
            .append_samples(&[SampleRecord::new(delta, Utc::now(), 9.0)])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(lifetimes(&store.samples(lifetime)), vec![3.0, 5.0, 9.0]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lifetimes(&store.samples(lifetime)), vec![3.0, 5.0, 9.0]);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    proptest! {
        #[test]
        fn test_lifetime_never_decreases(raw in prop::collection::vec(0u32..1000, 2..60), start in 0u32..500) {
            let values: Vec<f64> = raw.iter().map(|v| *v as f64).collect();
            let (lifetime, written) = accumulate(start as f64, &rows(&values), None);
            let series = lifetimes(&written);
            prop_assert!(series.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(series.iter().all(|v| *v >= start as f64));
            prop_assert!(lifetime >= start as f64);
        }

        #[test]
        fn test_split_replay_total(raw in prop::collection::vec(0u32..1000, 2..40), split in 1usize..39) {
            let values: Vec<f64> = raw.iter().map(|v| *v as f64).collect();
            let all = rows(&values);
            let split = split.min(all.len() - 1);
            let (full, _) = accumulate(0.0, &all, None);
            let (head, _) = accumulate(0.0, &all[..=split], None);
            let (total, _) = accumulate(head, &all[split..], None);
            prop_assert_eq!(full, total);
        }
    }
}
