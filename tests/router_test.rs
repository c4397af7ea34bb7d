//! Event routing from parent and dependent streams into the queue.

use std::sync::Arc;
use std::time::Duration;

use reconq::controller::EventRouter;
use reconq::event::{EventType, RawEvent};
use reconq::model::{DynamicObject, OwnerReference, WorkKey};
use reconq::queue::WorkQueue;
use tokio::sync::mpsc;

fn setup() -> (Arc<WorkQueue>, EventRouter) {
    let queue = Arc::new(WorkQueue::new("router-test"));
    let router = EventRouter::new("router-test", Arc::clone(&queue), "Gateway", "Certificate");
    (queue, router)
}

fn raw(event_type: EventType, obj: &DynamicObject) -> RawEvent {
    RawEvent::new(event_type, serde_json::to_value(obj).unwrap())
}

fn gateway(name: &str) -> DynamicObject {
    DynamicObject::new("Gateway", "ns", name)
}

fn certificate(name: &str) -> DynamicObject {
    DynamicObject::new("Certificate", "ns", name)
}

// ---------------------------------------------------------------------------
// Parent stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_parent_event_type_enqueues_the_parent() {
    for event_type in [EventType::Added, EventType::Modified, EventType::Deleted] {
        let (queue, router) = setup();
        let key = router.handle_parent::<DynamicObject>(raw(event_type, &gateway("A")));

        assert_eq!(key, Some(WorkKey::new("ns", "A")), "{event_type:?}");
        assert_eq!(queue.get().await, Some(WorkKey::new("ns", "A")));
    }
}

#[tokio::test]
async fn parent_tombstone_enqueues_its_key() {
    let (queue, router) = setup();
    router.handle_parent::<DynamicObject>(RawEvent::tombstone(&WorkKey::new("ns", "A")));
    assert_eq!(queue.get().await, Some(WorkKey::new("ns", "A")));
}

#[test]
fn repeated_parent_events_merge_into_one_entry() {
    let (queue, router) = setup();
    router.handle_parent::<DynamicObject>(raw(EventType::Added, &gateway("A")));
    router.handle_parent::<DynamicObject>(raw(EventType::Modified, &gateway("A")));
    assert_eq!(queue.len(), 1);
}

#[test]
fn malformed_parent_event_is_dropped() {
    let (queue, router) = setup();
    let key = router.handle_parent::<DynamicObject>(raw(EventType::Added, &certificate("d1")));

    assert_eq!(key, None);
    assert!(queue.is_empty());
}

// ---------------------------------------------------------------------------
// Dependent stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn owned_dependent_enqueues_its_parent_for_every_event_type() {
    let cert = certificate("d1").owned_by(OwnerReference::controller("Gateway", "A"));
    for event_type in [EventType::Added, EventType::Modified, EventType::Deleted] {
        let (queue, router) = setup();
        let key = router.handle_dependent::<DynamicObject>(raw(event_type, &cert));

        assert_eq!(key, Some(WorkKey::new("ns", "A")), "{event_type:?}");
        assert_eq!(queue.get().await, Some(WorkKey::new("ns", "A")));
    }
}

#[test]
fn dependent_with_non_controller_owner_is_dropped() {
    let (queue, router) = setup();
    let mut owner = OwnerReference::controller("Gateway", "A");
    owner.controller = Some(false);
    let cert = certificate("d1").owned_by(owner);

    assert_eq!(
        router.handle_dependent::<DynamicObject>(raw(EventType::Added, &cert)),
        None
    );
    assert!(queue.is_empty());
}

#[test]
fn dependent_controlled_by_another_kind_is_dropped() {
    let (queue, router) = setup();
    let cert = certificate("d1").owned_by(OwnerReference::controller("Ingress", "A"));

    assert_eq!(
        router.handle_dependent::<DynamicObject>(raw(EventType::Added, &cert)),
        None
    );
    assert!(queue.is_empty());
}

#[test]
fn orphan_dependent_is_dropped() {
    let (queue, router) = setup();
    router.handle_dependent::<DynamicObject>(raw(EventType::Deleted, &certificate("d1")));
    assert!(queue.is_empty());
}

#[test]
fn dependent_tombstone_without_state_is_dropped() {
    let (queue, router) = setup();
    router.handle_dependent::<DynamicObject>(RawEvent::tombstone(&WorkKey::new("ns", "d1")));
    assert!(queue.is_empty());
}

#[test]
fn malformed_dependent_event_is_dropped() {
    let (queue, router) = setup();
    let key = router.handle_dependent::<DynamicObject>(raw(EventType::Added, &gateway("A")));

    assert_eq!(key, None);
    assert!(queue.is_empty());
}

// ---------------------------------------------------------------------------
// Stream tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn router_tasks_drain_streams_and_stop_when_they_close() {
    let (queue, router) = setup();
    let (parent_tx, parent_rx) = mpsc::unbounded_channel();
    let (dependent_tx, dependent_rx) = mpsc::unbounded_channel();

    let parents = tokio::spawn(router.clone().run_parents::<DynamicObject>(parent_rx));
    let dependents = tokio::spawn(router.run_dependents::<DynamicObject>(dependent_rx));

    parent_tx.send(raw(EventType::Added, &gateway("A"))).unwrap();
    let cert = certificate("d1").owned_by(OwnerReference::controller("Gateway", "B"));
    dependent_tx.send(raw(EventType::Added, &cert)).unwrap();
    drop(parent_tx);
    drop(dependent_tx);

    tokio::time::timeout(Duration::from_secs(1), async {
        parents.await.unwrap();
        dependents.await.unwrap();
    })
    .await
    .unwrap();

    let mut keys = vec![queue.get().await.unwrap(), queue.get().await.unwrap()];
    keys.sort();
    assert_eq!(keys, vec![WorkKey::new("ns", "A"), WorkKey::new("ns", "B")]);
}
