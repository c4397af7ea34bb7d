//! Event routing: turn parent and dependent change events into parent work
//! keys.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, error};

use crate::cache::EventStream;
use crate::error::Error;
use crate::event::{EventType, RawEvent, WatchEvent};
use crate::matcher::OwnerMatcher;
use crate::model::{Resource, WorkKey};
use crate::queue::WorkQueue;
use crate::telemetry::metrics;

const PARENT: &str = "parent";
const DEPENDENT: &str = "dependent";

#[derive(Clone)]
pub struct EventRouter {
    controller: String,
    queue: Arc<WorkQueue>,
    matcher: OwnerMatcher,
    dependent_kind: String,
}

impl EventRouter {
    pub fn new(
        controller: impl Into<String>,
        queue: Arc<WorkQueue>,
        parent_kind: impl Into<String>,
        dependent_kind: impl Into<String>,
    ) -> Self {
        Self {
            controller: controller.into(),
            queue,
            matcher: OwnerMatcher::new(parent_kind),
            dependent_kind: dependent_kind.into(),
        }
    }

    pub fn matcher(&self) -> &OwnerMatcher {
        &self.matcher
    }

    /// Every parent event requeues the parent itself, deletes included.
    ///
    /// Deletes could be skipped, since dispatch treats a missing parent as
    /// nothing to do, but all three event types go through the same path.
    pub fn route_parent<P: Resource>(&self, event: &WatchEvent<P>) -> WorkKey {
        let key = event.key();
        self.queue.add(key.clone());
        key
    }

    /// Dependent events requeue the controlling parent.
    ///
    /// Adds, updates and deletes are all handled alike: each one asks the
    /// same question of the parent, whether its dependents still match what
    /// it wants. Orphans and dependents controlled by another kind are
    /// dropped.
    pub fn route_dependent<D: Resource>(&self, event: &WatchEvent<D>) -> Option<WorkKey> {
        let Some(dependent) = event.object() else {
            debug!(controller = %self.controller, key = %event.key(), "dependent deleted without last known state");
            self.dropped(DEPENDENT, "unowned");
            return None;
        };
        match self.matcher.matches(dependent.meta()) {
            Some(key) => {
                self.queue.add(key.clone());
                Some(key)
            }
            None => {
                self.dropped(DEPENDENT, "unowned");
                None
            }
        }
    }

    /// Validate and route one raw parent event.
    pub fn handle_parent<P: Resource>(&self, raw: RawEvent) -> Option<WorkKey> {
        self.received(PARENT, raw.event_type);
        match WatchEvent::<P>::decode(raw, self.matcher.parent_kind()) {
            Ok(event) => Some(self.route_parent(&event)),
            Err(e) => {
                self.report_malformed(PARENT, &e);
                None
            }
        }
    }

    /// Validate and route one raw dependent event.
    pub fn handle_dependent<D: Resource>(&self, raw: RawEvent) -> Option<WorkKey> {
        self.received(DEPENDENT, raw.event_type);
        match WatchEvent::<D>::decode(raw, &self.dependent_kind) {
            Ok(event) => self.route_dependent(&event),
            Err(e) => {
                self.report_malformed(DEPENDENT, &e);
                None
            }
        }
    }

    /// Route parent events until the stream closes.
    pub async fn run_parents<P: Resource>(self, mut events: EventStream) {
        while let Some(raw) = events.recv().await {
            self.handle_parent::<P>(raw);
        }
        debug!(controller = %self.controller, "parent event stream closed");
    }

    /// Route dependent events until the stream closes.
    pub async fn run_dependents<D: Resource>(self, mut events: EventStream) {
        while let Some(raw) = events.recv().await {
            self.handle_dependent::<D>(raw);
        }
        debug!(controller = %self.controller, "dependent event stream closed");
    }

    fn received(&self, stream: &'static str, event_type: EventType) {
        metrics::events_received().add(
            1,
            &[
                KeyValue::new("controller", self.controller.clone()),
                KeyValue::new("stream", stream),
                KeyValue::new("event", event_type.as_str()),
            ],
        );
    }

    fn dropped(&self, stream: &'static str, reason: &'static str) {
        metrics::events_dropped().add(
            1,
            &[
                KeyValue::new("controller", self.controller.clone()),
                KeyValue::new("stream", stream),
                KeyValue::new("reason", reason),
            ],
        );
    }

    fn report_malformed(&self, stream: &'static str, err: &Error) {
        error!(controller = %self.controller, stream, error = %err, "dropping malformed event");
        self.dropped(stream, "malformed");
    }
}
