//! Fakes shared by the scheduler integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use auditq::alert::AlertHook;
use auditq::backend::{AnalyzeError, Analyzer, DiscoverySource};
use auditq::config::secrets::Credential;
use auditq::engine::{ControlPlane, SchedulerConfig, SchedulerContext};
use auditq::model::{Finding, ItemId, PayloadRef, Verdict, WorkItem};
use auditq::pool::ResourcePool;
use auditq::store::{DEFAULT_SHARD_MAX_BYTES, DedupStore};
use tokio::time::Instant;

pub fn finding(category: &str) -> Finding {
    Finding {
        title: format!("{category} issue"),
        category: category.to_string(),
        affected_location: "Vault.withdraw".to_string(),
        narrative: "state is written after the external call".to_string(),
    }
}

pub fn credentials(n: usize) -> Vec<Credential> {
    (0..n)
        .map(|i| Credential::new(format!("cred-{i}"), format!("key-{i}")))
        .collect()
}

pub fn item(id: &str) -> WorkItem {
    WorkItem::new(id, PayloadRef::Handle(id.to_string()))
}

// ---------------------------------------------------------------------------
// Discovery source
// ---------------------------------------------------------------------------

/// Fixed candidate list. Records cleanups.
#[derive(Default)]
pub struct VecSource {
    items: Mutex<Vec<WorkItem>>,
    cleaned: Mutex<Vec<ItemId>>,
}

impl VecSource {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            items: Mutex::new(ids.iter().map(|id| item(id)).collect()),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    pub fn cleaned(&self) -> Vec<ItemId> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiscoverySource for VecSource {
    async fn list_candidates(&self) -> auditq::error::Result<Vec<WorkItem>> {
        Ok(self.items.lock().unwrap().clone())
    }

    async fn cleanup(&self, item: &WorkItem) -> auditq::error::Result<()> {
        self.cleaned.lock().unwrap().push(item.id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Step {
    Verdict(Verdict),
    Fail(AnalyzeError),
    Panic,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub id: ItemId,
    pub credential: String,
    pub at: Instant,
}

/// Analyzer that plays back a per-item script, then succeeds with no
/// findings. Each call takes `delay`.
#[derive(Default)]
pub struct ScriptedAnalyzer {
    delay: Duration,
    script: Mutex<HashMap<ItemId, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
    running: Mutex<HashMap<ItemId, usize>>,
    overlaps: Mutex<Vec<ItemId>>,
}

impl ScriptedAnalyzer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(ItemId::new(id), steps.into());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: &str) -> Vec<Call> {
        let id = ItemId::new(id);
        self.calls().into_iter().filter(|c| c.id == id).collect()
    }

    /// Ids that were ever analyzed twice at the same time.
    pub fn overlaps(&self) -> Vec<ItemId> {
        self.overlaps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        item: &WorkItem,
        credential: &Credential,
    ) -> Result<Verdict, AnalyzeError> {
        self.calls.lock().unwrap().push(Call {
            id: item.id.clone(),
            credential: credential.name.clone(),
            at: Instant::now(),
        });
        {
            let mut running = self.running.lock().unwrap();
            let count = running.entry(item.id.clone()).or_default();
            *count += 1;
            if *count > 1 {
                self.overlaps.lock().unwrap().push(item.id.clone());
            }
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *self.running.lock().unwrap().get_mut(&item.id).unwrap() -= 1;

        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Verdict(verdict)) => Ok(verdict),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Panic) => panic!("analyzer blew up on {}", item.id),
            None => Ok(Verdict::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert hook
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingHook {
    pub alerts: Mutex<Vec<(ItemId, Vec<String>)>>,
}

#[async_trait]
impl AlertHook for RecordingHook {
    async fn alert(&self, id: &ItemId, categories: &[String]) -> auditq::error::Result<()> {
        self.alerts
            .lock()
            .unwrap()
            .push((id.clone(), categories.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        discovery_interval: Duration::from_millis(100),
        launch_stagger: Duration::ZERO,
        rate_limit_cooldown: Duration::from_secs(2),
        transient_cooldown: Duration::from_millis(100),
        max_attempts: 3,
    }
}

pub async fn open_store(path: &Path) -> DedupStore {
    DedupStore::open(path, DEFAULT_SHARD_MAX_BYTES).await.unwrap()
}

pub struct Harness {
    pub control: ControlPlane,
    pub source: Arc<VecSource>,
    pub analyzer: Arc<ScriptedAnalyzer>,
}

impl Harness {
    pub async fn new(
        store_path: &Path,
        slots: usize,
        min_delay: Duration,
        source: VecSource,
        analyzer: ScriptedAnalyzer,
        config: SchedulerConfig,
    ) -> Self {
        let store = open_store(store_path).await;
        let pool = ResourcePool::new(credentials(slots), min_delay).unwrap();
        let source = Arc::new(source);
        let analyzer = Arc::new(analyzer);
        let control = ControlPlane::new(
            SchedulerContext::new(store, pool),
            source.clone(),
            analyzer.clone(),
            config,
        );
        Self {
            control,
            source,
            analyzer,
        }
    }

    pub fn ctx(&self) -> &SchedulerContext {
        self.control.context()
    }

    pub fn spawn(&self) -> tokio::task::JoinHandle<auditq::error::Result<()>> {
        let control = self.control.clone();
        tokio::spawn(async move { control.run().await })
    }

    /// Wait (in virtual time) until every id has a terminal record.
    pub async fn wait_terminal(&self, ids: &[&str]) {
        let store = self.ctx().store.clone();
        let ids: Vec<ItemId> = ids.iter().map(|id| ItemId::new(id)).collect();
        wait_until(|| {
            ids.iter()
                .all(|id| store.get(id).is_some_and(|r| r.is_terminal()))
        })
        .await;
    }
}

/// Poll `cond` every 10ms of virtual time, failing after 10 minutes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
