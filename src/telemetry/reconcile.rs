//! Reconcile span helpers.

use tracing::Span;

use crate::model::WorkKey;

/// Start a span covering the processing of one work key.
///
/// The `reconcile.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_reconcile_span(controller: &str, key: &WorkKey) -> Span {
    tracing::info_span!(
        "reconcile",
        "controller" = controller,
        "key" = %key,
        "reconcile.outcome" = tracing::field::Empty,
    )
}

/// Record how processing ended on the given span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("reconcile.outcome", outcome);
}
