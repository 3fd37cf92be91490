#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use geoflip_core::error::CoreError;
use geoflip_core::ledger::JobLedger;
use geoflip_core::store::{KeyValueStore, MemoryStore};
use geoflip_core::types::TaskId;
use geoflip_events::{EventBus, TrackerEvent};
use geoflip_transform::api::{ApiError, JobStatus};
use geoflip_transform::backoff::PollConfig;
use geoflip_transform::request::{PipelineConfig, TransformRequest};
use geoflip_transform::service::TransformService;
use geoflip_transform::tracker::ExportTracker;
use tokio::sync::{broadcast, Notify};

/// In-process stand-in for the Geoflip API.
///
/// Submissions hand out queued task ids, status requests replay a per-job
/// script (and report `PROCESSING` once it runs out), and downloads succeed
/// only for URLs registered with [`ScriptedService::serve`].
#[derive(Default)]
pub struct ScriptedService {
    submissions: Mutex<VecDeque<Result<TaskId, ApiError>>>,
    statuses: Mutex<HashMap<TaskId, VecDeque<Result<JobStatus, ApiError>>>>,
    outputs: Mutex<HashMap<String, Vec<u8>>>,
    held: Mutex<HashMap<TaskId, Arc<Notify>>>,
    submit_delay: Mutex<Duration>,
    status_calls: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accept(&self, task_id: &str) {
        self.submissions
            .lock()
            .unwrap()
            .push_back(Ok(task_id.to_string()));
    }

    pub fn reject(&self, error: ApiError) {
        self.submissions.lock().unwrap().push_back(Err(error));
    }

    pub fn script(&self, task_id: &str, steps: Vec<Result<JobStatus, ApiError>>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn serve(&self, url: &str, body: &[u8]) {
        self.outputs
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_vec());
    }

    /// Make status requests for `task_id` wait until [`Self::release`].
    pub fn hold(&self, task_id: &str) {
        self.held
            .lock()
            .unwrap()
            .insert(task_id.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, task_id: &str) {
        if let Some(gate) = self.held.lock().unwrap().remove(task_id) {
            gate.notify_waiters();
        }
    }

    /// Answer every submission only after `delay`.
    pub fn delay_submissions(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformService for ScriptedService {
    async fn submit(&self, _request: &TransformRequest) -> Result<TaskId, ApiError> {
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.submissions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::InvalidResponse("no submission scripted".into())))
    }

    async fn status(&self, task_id: &str) -> Result<JobStatus, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.held.lock().unwrap().get(task_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.statuses
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(JobStatus::processing(None)))
    }

    async fn fetch_output(&self, output_url: &str) -> Result<Vec<u8>, ApiError> {
        self.outputs
            .lock()
            .unwrap()
            .get(output_url)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 403,
                body: "Request has expired".into(),
            })
    }
}

/// Store whose first `failures` writes of a `SUCCESS` record fail.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicUsize::new(failures),
        })
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoreError> {
        if value.contains(r#""SUCCESS""#)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(CoreError::Storage("disk full".into()));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<bool, CoreError> {
        self.inner.remove(key)
    }
}

/// A transient server error for status scripts.
pub fn server_error() -> Result<JobStatus, ApiError> {
    Err(ApiError::Status {
        status: 500,
        body: "Internal Server Error".into(),
    })
}

/// A small shapefile-to-shapefile request.
pub fn shp_request() -> TransformRequest {
    let config = PipelineConfig::new("shp", "shp", 4326, None).unwrap();
    TransformRequest::versioned("shp", "parcels.zip", vec![0x50, 0x4b, 0x03, 0x04], config)
}

pub struct Harness {
    pub service: Arc<ScriptedService>,
    pub store: Arc<MemoryStore>,
    pub ledger: JobLedger,
    pub events: EventBus,
    pub tracker: ExportTracker,
}

pub fn harness(config: PollConfig) -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()), config)
}

pub fn harness_with_store(store: Arc<MemoryStore>, config: PollConfig) -> Harness {
    build_harness(store.clone(), store, config)
}

/// Harness whose ledger fails the first `failures` SUCCESS writes.
/// `Harness::store` still exposes what actually got stored.
pub fn harness_with_flaky_store(failures: usize, config: PollConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    build_harness(FlakyStore::new(store.clone(), failures), store, config)
}

fn build_harness(
    backing: Arc<dyn KeyValueStore>,
    store: Arc<MemoryStore>,
    config: PollConfig,
) -> Harness {
    let service = ScriptedService::new();
    let ledger = JobLedger::new(backing);
    let events = EventBus::default();
    let tracker = ExportTracker::new(service.clone(), ledger.clone(), events.clone(), config);
    Harness {
        service,
        store,
        ledger,
        events,
        tracker,
    }
}

/// Receive events until `pred` matches, returning everything seen.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<TrackerEvent>,
    pred: impl Fn(&TrackerEvent) -> bool,
) -> Vec<TrackerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3600), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Yield until the tracker has no live poller for `task_id`.
pub async fn wait_until_idle(tracker: &ExportTracker, task_id: &str) {
    for _ in 0..1000 {
        if !tracker.is_polling(task_id).await {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("poller for {task_id} never stopped");
}
