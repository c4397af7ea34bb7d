//! Dispatch loop and end-to-end controller behaviour.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reconq::cache::{EventStream, Informer, Lister, MemoryCache};
use reconq::controller::{Controller, ControllerConfig, Processed, Reconciler};
use reconq::error::{Error, Result};
use reconq::model::{DynamicObject, OwnerReference, Resource, WorkKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Cache = MemoryCache<DynamicObject>;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<WorkKey>>,
    failing: AtomicBool,
    panic_once: AtomicBool,
}

impl Recorder {
    fn calls(&self) -> Vec<WorkKey> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reconciler<DynamicObject> for Recorder {
    async fn sync(
        &self,
        _cancel: &CancellationToken,
        parent: Arc<DynamicObject>,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(parent.key());
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("reconciler bug");
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("dependent write rejected");
        }
        Ok(())
    }
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        name: "gateway-shim-test".to_string(),
        workers: 2,
        sync_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        ..ControllerConfig::default()
    }
}

struct Harness {
    parents: Arc<Cache>,
    dependents: Arc<Cache>,
    recorder: Arc<Recorder>,
    controller: Controller<DynamicObject, DynamicObject>,
}

fn harness(config: ControllerConfig) -> Harness {
    let parents = Arc::new(Cache::new("Gateway"));
    let dependents = Arc::new(Cache::new("Certificate"));
    let recorder = Arc::new(Recorder::default());
    let controller = Controller::<DynamicObject, DynamicObject>::new(
        config,
        parents.clone(),
        dependents.clone(),
        recorder.clone(),
    );
    Harness {
        parents,
        dependents,
        recorder,
        controller,
    }
}

fn gateway(name: &str) -> DynamicObject {
    DynamicObject::new("Gateway", "ns", name)
}

fn certificate(name: &str, owner: &str) -> DynamicObject {
    DynamicObject::new("Certificate", "ns", name)
        .owned_by(OwnerReference::controller("Gateway", owner))
}

async fn wait_for_calls(recorder: &Recorder, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.calls().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {n} reconcile calls, got {:?}", recorder.calls()));
}

// ---------------------------------------------------------------------------
// Parent resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn absent_parent_completes_without_reconciling() {
    let h = harness(test_config());
    let cancel = CancellationToken::new();
    let key = WorkKey::new("ns", "A");

    let processed = h.controller.process_item(&cancel, &key).await.unwrap();
    assert_eq!(processed, Processed::NotFound);

    h.controller.queue().add(key.clone());
    assert!(h.controller.process_next(&cancel).await);

    assert!(h.recorder.calls().is_empty());
    assert_eq!(h.controller.queue().num_requeues(&key), 0);
    assert!(h.controller.queue().is_idle());
}

#[tokio::test]
async fn terminating_parent_completes_without_reconciling() {
    let h = harness(test_config());
    let cancel = CancellationToken::new();
    h.parents
        .upsert(gateway("A").terminating(Utc::now()))
        .unwrap();

    let key = WorkKey::new("ns", "A");
    let processed = h.controller.process_item(&cancel, &key).await.unwrap();
    assert_eq!(processed, Processed::Terminating);

    h.controller.queue().add(key.clone());
    assert!(h.controller.process_next(&cancel).await);

    assert!(h.recorder.calls().is_empty());
    assert!(h.controller.queue().is_idle());
}

#[tokio::test]
async fn live_parent_is_reconciled() {
    let h = harness(test_config());
    let cancel = CancellationToken::new();
    h.parents.upsert(gateway("A")).unwrap();

    let processed = h
        .controller
        .process_item(&cancel, &WorkKey::new("ns", "A"))
        .await
        .unwrap();

    assert_eq!(processed, Processed::Synced);
    assert_eq!(h.recorder.calls(), vec![WorkKey::new("ns", "A")]);
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconcile_error_requeues_with_backoff_and_success_resets_it() {
    let h = harness(test_config());
    let cancel = CancellationToken::new();
    let queue = h.controller.queue();
    let key = WorkKey::new("ns", "A");
    h.parents.upsert(gateway("A")).unwrap();
    h.recorder.failing.store(true, Ordering::SeqCst);

    queue.add(key.clone());
    assert!(h.controller.process_next(&cancel).await);
    assert_eq!(queue.num_requeues(&key), 1);
    assert_eq!(queue.waiting_len(), 1);
    assert!(!queue.is_processing(&key));

    assert!(h.controller.process_next(&cancel).await);
    assert_eq!(queue.num_requeues(&key), 2);

    h.recorder.failing.store(false, Ordering::SeqCst);
    assert!(h.controller.process_next(&cancel).await);
    assert_eq!(queue.num_requeues(&key), 0);
    assert!(queue.is_idle());
    assert_eq!(h.recorder.calls().len(), 3);
}

struct BrokenParents;

impl Lister<DynamicObject> for BrokenParents {
    fn get(&self, _namespace: &str, _name: &str) -> Result<Option<Arc<DynamicObject>>> {
        Err(Error::Lister("connection refused".to_string()))
    }
}

impl Informer<DynamicObject> for BrokenParents {
    fn subscribe(&self) -> Result<EventStream> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }

    fn has_synced(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn lister_error_is_retried_without_reconciling() {
    let recorder = Arc::new(Recorder::default());
    let controller = Controller::<DynamicObject, DynamicObject>::new(
        test_config(),
        Arc::new(BrokenParents),
        Arc::new(Cache::new("Certificate")),
        recorder.clone(),
    );
    let cancel = CancellationToken::new();
    let key = WorkKey::new("ns", "A");

    let err = controller.process_item(&cancel, &key).await.unwrap_err();
    assert!(matches!(err, Error::Lister(_)));

    controller.queue().add(key.clone());
    assert!(controller.process_next(&cancel).await);
    assert_eq!(controller.queue().num_requeues(&key), 1);
    assert!(recorder.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconciler_panic_is_retried_like_an_error() {
    let h = harness(test_config());
    let cancel = CancellationToken::new();
    let queue = h.controller.queue();
    let key = WorkKey::new("ns", "A");
    h.parents.upsert(gateway("A")).unwrap();
    h.recorder.panic_once.store(true, Ordering::SeqCst);

    queue.add(key.clone());
    assert!(h.controller.process_next(&cancel).await);
    assert!(!queue.is_processing(&key));
    assert_eq!(queue.num_requeues(&key), 1);
    assert_eq!(queue.waiting_len(), 1);

    assert!(h.controller.process_next(&cancel).await);
    assert_eq!(h.recorder.calls().len(), 2);
    assert_eq!(queue.num_requeues(&key), 0);
    assert!(queue.is_idle());
}

#[tokio::test]
async fn worker_survives_reconciler_panic() {
    let h = harness(ControllerConfig {
        workers: 1,
        ..test_config()
    });
    h.parents.mark_synced();
    h.dependents.mark_synced();
    h.recorder.panic_once.store(true, Ordering::SeqCst);
    let cancel = CancellationToken::new();
    let run = {
        let ctrl = h.controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ctrl.run(cancel).await })
    };

    h.parents.upsert(gateway("A")).unwrap();
    wait_for_calls(&h.recorder, 2).await;

    h.parents.upsert(gateway("B")).unwrap();
    wait_for_calls(&h.recorder, 3).await;
    assert!(h.recorder.calls().contains(&WorkKey::new("ns", "B")));
    assert!(!h.controller.queue().is_processing(&WorkKey::new("ns", "A")));

    cancel.cancel();
    run.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unsynced_caches_time_out_startup() {
    let h = harness(ControllerConfig {
        sync_timeout: Duration::from_millis(200),
        ..test_config()
    });
    h.parents.mark_synced();

    let err = h.controller.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::CacheSync));
    assert!(h.controller.queue().is_shutting_down());
}

#[tokio::test]
async fn unbounded_sync_timeout_starts_normally() {
    let h = harness(ControllerConfig {
        sync_timeout: Duration::from_secs(u64::MAX),
        ..test_config()
    });
    h.parents.mark_synced();
    h.dependents.mark_synced();
    let cancel = CancellationToken::new();
    let run = {
        let ctrl = h.controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ctrl.run(cancel).await })
    };

    h.parents.upsert(gateway("A")).unwrap();
    wait_for_calls(&h.recorder, 1).await;

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_during_sync_wait_fails_startup() {
    let h = harness(test_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.controller.run(cancel).await.unwrap_err();
    assert!(matches!(err, Error::CacheSync));
}

#[tokio::test]
async fn subscription_failure_fails_registration() {
    let h = harness(test_config());
    h.dependents.close();

    assert!(matches!(h.controller.register(), Err(Error::Subscribe(_))));
    let err = h.controller.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Subscribe(_)));
}

#[tokio::test]
async fn registration_exposes_queue_and_sync_checks() {
    let h = harness(test_config());
    let registration = h.controller.register().unwrap();

    assert_eq!(registration.must_sync.len(), 2);
    assert!(registration.must_sync.iter().all(|synced| !synced()));
    h.parents.mark_synced();
    h.dependents.mark_synced();
    assert!(registration.must_sync.iter().all(|synced| synced()));
    assert_eq!(registration.queue.name(), "gateway-shim-test");

    registration.abort();
}

#[tokio::test]
async fn nothing_is_dispatched_before_caches_sync() {
    let h = harness(test_config());
    let cancel = CancellationToken::new();
    let run = {
        let ctrl = h.controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ctrl.run(cancel).await })
    };

    h.parents.upsert(gateway("A")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.recorder.calls().is_empty());
    assert_eq!(h.controller.queue().len(), 1);

    h.parents.mark_synced();
    h.dependents.mark_synced();
    wait_for_calls(&h.recorder, 1).await;

    cancel.cancel();
    run.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parent_and_owned_dependent_both_reconcile_the_parent() {
    let h = harness(test_config());
    h.parents.mark_synced();
    h.dependents.mark_synced();
    let cancel = CancellationToken::new();
    let run = {
        let ctrl = h.controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ctrl.run(cancel).await })
    };

    h.parents.upsert(gateway("A")).unwrap();
    wait_for_calls(&h.recorder, 1).await;
    assert_eq!(h.recorder.calls(), vec![WorkKey::new("ns", "A")]);

    h.dependents.upsert(certificate("d1", "A")).unwrap();
    wait_for_calls(&h.recorder, 2).await;

    // An orphan and a certificate owned by someone else trigger nothing.
    h.dependents
        .upsert(DynamicObject::new("Certificate", "ns", "orphan"))
        .unwrap();
    let mut foreign = DynamicObject::new("Certificate", "ns", "d2");
    foreign
        .metadata
        .owner_references
        .push(OwnerReference::controller("Ingress", "A"));
    h.dependents.upsert(foreign).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let calls = h.recorder.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|k| *k == WorkKey::new("ns", "A")));

    cancel.cancel();
    run.await.unwrap().unwrap();
    assert!(h.controller.queue().is_shutting_down());
}

#[tokio::test]
async fn deleted_parent_is_not_reconciled() {
    let h = harness(test_config());
    h.parents.mark_synced();
    h.dependents.mark_synced();
    let cancel = CancellationToken::new();
    let run = {
        let ctrl = h.controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ctrl.run(cancel).await })
    };

    h.parents.upsert(gateway("A")).unwrap();
    wait_for_calls(&h.recorder, 1).await;

    assert!(h.parents.delete("ns", "A").unwrap());
    h.dependents.upsert(certificate("d1", "A")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.recorder.calls().len(), 1);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

struct WaitsForCancel {
    started: tokio::sync::Notify,
    finished: AtomicBool,
}

#[async_trait]
impl Reconciler<DynamicObject> for WaitsForCancel {
    async fn sync(
        &self,
        cancel: &CancellationToken,
        _parent: Arc<DynamicObject>,
    ) -> anyhow::Result<()> {
        self.started.notify_one();
        cancel.cancelled().await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn cancellation_reaches_in_flight_reconcile_and_run_waits_for_it() {
    let parents = Arc::new(Cache::new("Gateway"));
    let dependents = Arc::new(Cache::new("Certificate"));
    parents.mark_synced();
    dependents.mark_synced();
    let reconciler = Arc::new(WaitsForCancel {
        started: tokio::sync::Notify::new(),
        finished: AtomicBool::new(false),
    });
    let controller = Controller::<DynamicObject, DynamicObject>::new(
        test_config(),
        parents.clone(),
        dependents,
        reconciler.clone(),
    );

    let cancel = CancellationToken::new();
    let run = {
        let ctrl = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ctrl.run(cancel).await })
    };

    parents.upsert(gateway("A")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), reconciler.started.notified())
        .await
        .unwrap();

    cancel.cancel();
    run.await.unwrap().unwrap();
    assert!(reconciler.finished.load(Ordering::SeqCst));
}
