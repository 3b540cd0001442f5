use crate::baggage::{merge, BaggageSet};
use crate::context::SentryContextExt;
use crate::dsc::{self, DynamicSamplingContext};
use crate::span::{global_span_map, SpanRegistry};
use crate::trace_header::{SentryTrace, BAGGAGE_HEADER, SENTRY_TRACE_HEADER};
use opentelemetry::{
    baggage::{BaggageExt, KeyValueMetadata},
    otel_debug, otel_warn,
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};
use std::sync::{Arc, OnceLock};

static SENTRY_PROPAGATOR_FIELDS: OnceLock<[String; 2]> = OnceLock::new();

fn sentry_propagator_fields() -> &'static [String; 2] {
    SENTRY_PROPAGATOR_FIELDS
        .get_or_init(|| [SENTRY_TRACE_HEADER.to_owned(), BAGGAGE_HEADER.to_owned()])
}

/// Propagates context between OpenTelemetry and Sentry using the
/// `sentry-trace` and `baggage` headers.
///
/// On extraction the incoming `sentry-trace` becomes the remote parent
/// [`SpanContext`], the `baggage` header replaces the context baggage, and the
/// Sentry dynamic sampling context found in it is stored for Sentry
/// instrumentation (see [`SentryContextExt`]).
///
/// On injection a Sentry span registered for the active span wins: its trace
/// header and dynamic sampling context are written. Without one, the
/// `sentry-trace` value received by this service is forwarded unchanged.
#[derive(Clone, Debug)]
pub struct SentryPropagator {
    registry: Arc<dyn SpanRegistry>,
}

impl Default for SentryPropagator {
    fn default() -> Self {
        SentryPropagator::new()
    }
}

impl SentryPropagator {
    /// Create a propagator that looks spans up in the process-wide
    /// [`SentrySpanMap`](crate::span::SentrySpanMap).
    pub fn new() -> Self {
        Self::with_registry(global_span_map())
    }

    /// Create a propagator that looks spans up in `registry`.
    pub fn with_registry<R: SpanRegistry + 'static>(registry: R) -> Self {
        SentryPropagator {
            registry: Arc::new(registry),
        }
    }

    /// Decode a `sentry-trace` value into a remote span context.
    ///
    /// The span is sampled unless the header carries an explicit `0`.
    fn extract_span_context(&self, header_value: &str) -> Option<SpanContext> {
        let sentry_trace = match header_value.parse::<SentryTrace>() {
            Ok(sentry_trace) => sentry_trace,
            Err(err) => {
                otel_debug!(
                    name: "SentryPropagator.Extract.InvalidSentryTrace",
                    sentry_trace = header_value.to_owned(),
                    error = format!("{err}"),
                );
                return None;
            }
        };

        let trace_flags = match sentry_trace.sampled() {
            Some(false) => TraceFlags::default(),
            Some(true) | None => TraceFlags::SAMPLED,
        };
        let span_context = SpanContext::new(
            sentry_trace.trace_id(),
            sentry_trace.span_id(),
            trace_flags,
            true,
            TraceState::default(),
        );

        span_context.is_valid().then_some(span_context)
    }

    /// Merges the Sentry baggage into the context baggage.
    fn outgoing_baggage(&self, cx: &Context, sentry_baggage: &str) -> BaggageSet {
        let sentry_baggage = BaggageSet::parse(sentry_baggage).unwrap_or_else(|err| {
            otel_debug!(
                name: "SentryPropagator.Inject.InvalidSentryBaggage",
                error = format!("{err}"),
            );
            BaggageSet::new()
        });

        merge(BaggageSet::from_context_baggage(cx.baggage()), &sentry_baggage)
    }
}

impl TextMapPropagator for SentryPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let span_context = span.span_context();
        let sentry_span = if span_context.is_valid() {
            self.registry.get(span_context.span_id())
        } else {
            None
        };

        match (&sentry_span, cx.sentry_trace_header()) {
            (Some(sentry_span), _) => {
                injector.set(SENTRY_TRACE_HEADER, sentry_span.to_sentry_trace());
            }
            (None, Some(header_value)) if !header_value.is_empty() => {
                injector.set(SENTRY_TRACE_HEADER, header_value.to_owned());
            }
            _ => {}
        }

        let sentry_baggage = sentry_span
            .as_deref()
            .filter(|sentry_span| sentry_span.trace_id() != TraceId::INVALID)
            .map(dsc::encode)
            .unwrap_or_default();

        let baggage = self.outgoing_baggage(cx, &sentry_baggage);
        if !baggage.is_empty() {
            injector.set(BAGGAGE_HEADER, baggage.to_string());
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let mut cx = cx.clone();

        let sentry_trace = extractor
            .get(SENTRY_TRACE_HEADER)
            .map(|value| value.to_string())
            .unwrap_or_default();
        if !sentry_trace.is_empty() {
            cx = cx.with_sentry_trace_header(sentry_trace.as_str());
            if let Some(span_context) = self.extract_span_context(&sentry_trace) {
                cx = cx.with_remote_span_context(span_context);
            }
        }

        let baggage_header = extractor
            .get(BAGGAGE_HEADER)
            .map(|value| value.to_string())
            .unwrap_or_default();
        if !baggage_header.is_empty() {
            match BaggageSet::parse(&baggage_header) {
                Ok(baggage) => {
                    cx = cx.with_baggage(baggage.iter().map(KeyValueMetadata::from));
                }
                Err(err) => {
                    otel_warn!(
                        name: "SentryPropagator.Extract.InvalidBaggage",
                        baggage_header = baggage_header.clone(),
                        error = format!("{err}"),
                    );
                }
            }
        }

        let dsc = DynamicSamplingContext::decode(&baggage_header).unwrap_or_else(|err| {
            otel_debug!(
                name: "SentryPropagator.Extract.InvalidDynamicSamplingContext",
                error = format!("{err}"),
            );
            DynamicSamplingContext::new()
        });

        cx.with_dynamic_sampling_context(dsc)
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(sentry_propagator_fields())
    }
}
