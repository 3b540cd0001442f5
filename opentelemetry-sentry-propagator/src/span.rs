//! Sentry spans as seen by the propagator.
//!
//! Sentry instrumentation owns the lifecycle of its spans. When it records a
//! span for the same operation an OpenTelemetry span describes, it registers a
//! [`SentrySpan`] snapshot under the OpenTelemetry span id so the propagator can
//! emit Sentry headers derived from it. The propagator itself only reads.
use crate::dsc::DynamicSamplingContext;
use crate::trace_header::SentryTrace;
use opentelemetry::otel_warn;
use opentelemetry::trace::{SpanId, TraceId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, OnceLock, RwLock};

static GLOBAL_SPAN_MAP: OnceLock<Arc<SentrySpanMap>> = OnceLock::new();

/// Returns the process-wide span map used by [`SentryPropagator::new`].
///
/// [`SentryPropagator::new`]: crate::SentryPropagator::new
pub fn global_span_map() -> Arc<SentrySpanMap> {
    GLOBAL_SPAN_MAP
        .get_or_init(|| Arc::new(SentrySpanMap::new()))
        .clone()
}

/// The parts of a Sentry span needed to propagate it.
#[derive(Clone, Debug, PartialEq)]
pub struct SentrySpan {
    trace_id: TraceId,
    span_id: SpanId,
    sampled: Option<bool>,
    dsc: DynamicSamplingContext,
}

impl SentrySpan {
    /// Create a span snapshot with an empty dynamic sampling context.
    pub fn new(trace_id: TraceId, span_id: SpanId, sampled: Option<bool>) -> Self {
        SentrySpan {
            trace_id,
            span_id,
            sampled,
            dsc: DynamicSamplingContext::new(),
        }
    }

    /// Returns the span with its dynamic sampling context replaced.
    pub fn with_dynamic_sampling_context(mut self, dsc: DynamicSamplingContext) -> Self {
        self.dsc = dsc;
        self
    }

    /// The trace id, [`TraceId::INVALID`] when the span carries no trace.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The Sentry span id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The sampling decision, `None` while it is deferred.
    pub fn sampled(&self) -> Option<bool> {
        self.sampled
    }

    /// The dynamic sampling context of the span's trace.
    pub fn dynamic_sampling_context(&self) -> &DynamicSamplingContext {
        &self.dsc
    }

    /// Serializes the span as a `sentry-trace` header value.
    pub fn to_sentry_trace(&self) -> String {
        SentryTrace::new(self.trace_id, self.span_id, self.sampled).to_string()
    }
}

/// Looks up the live Sentry span registered for an OpenTelemetry span id.
///
/// Lookups race with registrations, so `None` is always a legal answer: the
/// span may have ended, never existed, or live in another process.
pub trait SpanRegistry: Debug + Send + Sync {
    /// Returns the span registered under `span_id`.
    fn get(&self, span_id: SpanId) -> Option<Arc<SentrySpan>>;
}

impl<S> SpanRegistry for HashMap<SpanId, Arc<SentrySpan>, S>
where
    S: std::hash::BuildHasher + Send + Sync,
{
    fn get(&self, span_id: SpanId) -> Option<Arc<SentrySpan>> {
        HashMap::get(self, &span_id).cloned()
    }
}

impl<R: SpanRegistry + ?Sized> SpanRegistry for Arc<R> {
    fn get(&self, span_id: SpanId) -> Option<Arc<SentrySpan>> {
        (**self).get(span_id)
    }
}

/// A concurrent [`SpanRegistry`] maintained by the span lifecycle hooks.
///
/// Spans are inserted when they start and removed when they end.
#[derive(Debug, Default)]
pub struct SentrySpanMap {
    spans: RwLock<HashMap<SpanId, Arc<SentrySpan>>>,
}

impl SentrySpanMap {
    /// Create an empty map.
    pub fn new() -> Self {
        SentrySpanMap::default()
    }

    /// Registers `span` under `span_id`, returning the span it replaced.
    pub fn insert(&self, span_id: SpanId, span: SentrySpan) -> Option<Arc<SentrySpan>> {
        match self.spans.write() {
            Ok(mut spans) => spans.insert(span_id, Arc::new(span)),
            Err(_) => {
                otel_warn!(
                    name: "SentrySpanMap.Lock.Poisoned",
                    operation = "insert",
                );
                None
            }
        }
    }

    /// Removes the span registered under `span_id`.
    pub fn remove(&self, span_id: SpanId) -> Option<Arc<SentrySpan>> {
        match self.spans.write() {
            Ok(mut spans) => spans.remove(&span_id),
            Err(_) => {
                otel_warn!(
                    name: "SentrySpanMap.Lock.Poisoned",
                    operation = "remove",
                );
                None
            }
        }
    }

    /// Returns the number of registered spans.
    pub fn len(&self) -> usize {
        self.spans.read().map(|spans| spans.len()).unwrap_or(0)
    }

    /// Returns `true` if no span is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpanRegistry for SentrySpanMap {
    fn get(&self, span_id: SpanId) -> Option<Arc<SentrySpan>> {
        match self.spans.read() {
            Ok(spans) => spans.get(&span_id).cloned(),
            Err(_) => {
                otel_warn!(
                    name: "SentrySpanMap.Lock.Poisoned",
                    operation = "get",
                );
                None
            }
        }
    }
}
