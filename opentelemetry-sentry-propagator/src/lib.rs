//! An OpenTelemetry [`TextMapPropagator`] bridging OpenTelemetry and Sentry
//! tracing.
//!
//! Services instrumented with both OpenTelemetry and a Sentry SDK have two
//! views of every request. [`SentryPropagator`] keeps them consistent across
//! process boundaries using Sentry's wire headers:
//!
//! * `sentry-trace` carries the trace id, parent span id and sampling decision.
//!   Extraction turns it into the remote parent [`SpanContext`]; injection
//!   writes it from the Sentry span registered for the active OpenTelemetry
//!   span, or forwards the incoming value when there is none.
//! * `baggage` carries W3C baggage, including the Sentry
//!   [`DynamicSamplingContext`] as `sentry-` prefixed members. Extraction
//!   stores both the baggage and the decoded context; injection merges the
//!   Sentry members into the context baggage.
//!
//! Propagation is best effort: malformed headers are dropped (and reported
//! through OpenTelemetry's internal logs when the `internal-logs` feature is
//! on), never surfaced to the instrumented call.
//!
//! # Examples
//!
//! ```
//! use opentelemetry::{global, propagation::TextMapPropagator};
//! use opentelemetry_sentry_propagator::{SentryContextExt, SentryPropagator};
//! use std::collections::HashMap;
//!
//! global::set_text_map_propagator(SentryPropagator::new());
//!
//! // headers of an incoming request
//! let mut headers = HashMap::new();
//! headers.insert(
//!     "sentry-trace".to_string(),
//!     "771a43a4192642f0b136d5159a501700-b7ad6b7169203331-1".to_string(),
//! );
//! headers.insert("baggage".to_string(), "sentry-sample_rate=0.5".to_string());
//!
//! let cx = global::get_text_map_propagator(|propagator| propagator.extract(&headers));
//! let dsc = cx.dynamic_sampling_context().expect("always set by extraction");
//! assert!(dsc.is_frozen());
//!
//! // headers of an outgoing request
//! let mut outgoing: HashMap<String, String> = HashMap::new();
//! global::get_text_map_propagator(|propagator| propagator.inject_context(&cx, &mut outgoing));
//! assert_eq!(outgoing.get("sentry-trace"), headers.get("sentry-trace"));
//! ```
//!
//! Sentry instrumentation makes its spans visible to the propagator through
//! the [`SentrySpanMap`] returned by [`span::global_span_map`], or any other
//! [`SpanRegistry`] passed to [`SentryPropagator::with_registry`].
//!
//! [`TextMapPropagator`]: opentelemetry::propagation::TextMapPropagator
//! [`SpanContext`]: opentelemetry::trace::SpanContext
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod baggage;
pub mod context;
pub mod dsc;
mod propagator;
pub mod span;
pub mod trace_header;

pub use context::SentryContextExt;
pub use dsc::DynamicSamplingContext;
pub use propagator::SentryPropagator;
pub use span::{SentrySpan, SentrySpanMap, SpanRegistry};
pub use trace_header::{SentryTrace, BAGGAGE_HEADER, SENTRY_TRACE_HEADER};
