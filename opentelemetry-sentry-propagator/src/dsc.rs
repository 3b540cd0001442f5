//! # Dynamic Sampling Context
//!
//! Sentry propagates the inputs of its sampling decision as `sentry-` prefixed
//! members of the W3C `baggage` header:
//!
//! `baggage: sentry-trace_id=771a43a4192642f0b136d5159a501700,sentry-sample_rate=0.5,other=1`
//!
//! Once a service has received such members the context is frozen: every
//! downstream hop forwards it unchanged instead of computing its own.
use crate::baggage::{BaggageError, BaggageMember, BaggageSet};
use crate::span::SentrySpan;
use opentelemetry::trace::TraceId;
use std::collections::BTreeMap;

/// Key prefix reserved for dynamic sampling context members in `baggage`.
pub const SENTRY_BAGGAGE_PREFIX: &str = "sentry-";

/// Well-known dynamic sampling context entry names.
pub mod keys {
    /// Trace id the sampling decision applies to.
    pub const TRACE_ID: &str = "trace_id";
    /// Public key of the project that started the trace.
    pub const PUBLIC_KEY: &str = "public_key";
    /// Sample rate used by the head of the trace.
    pub const SAMPLE_RATE: &str = "sample_rate";
    /// The head sampling decision.
    pub const SAMPLED: &str = "sampled";
    /// Release of the service that started the trace.
    pub const RELEASE: &str = "release";
    /// Environment of the service that started the trace.
    pub const ENVIRONMENT: &str = "environment";
    /// Name of the root transaction.
    pub const TRANSACTION: &str = "transaction";
}

/// Sampling inputs shared by all services taking part in a trace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicSamplingContext {
    entries: BTreeMap<String, String>,
    frozen: bool,
}

impl DynamicSamplingContext {
    /// Creates an empty context that has not been frozen yet.
    pub fn new() -> Self {
        DynamicSamplingContext::default()
    }

    /// Creates a frozen context holding `entries`.
    ///
    /// Entry names are given without the [`SENTRY_BAGGAGE_PREFIX`].
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        DynamicSamplingContext {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            frozen: true,
        }
    }

    /// Decodes the dynamic sampling context from a `baggage` header value.
    ///
    /// Members without the `sentry-` prefix are ignored. The result is frozen
    /// when at least one Sentry member was found, and an empty header decodes to
    /// an empty, unfrozen context.
    ///
    /// # Examples
    ///
    /// ```
    /// use opentelemetry_sentry_propagator::dsc::DynamicSamplingContext;
    ///
    /// let dsc = DynamicSamplingContext::decode("other=1,sentry-sample_rate=0.25").unwrap();
    /// assert!(dsc.is_frozen());
    /// assert_eq!(dsc.sample_rate(), Some(0.25));
    ///
    /// assert_eq!(DynamicSamplingContext::decode(""), Ok(DynamicSamplingContext::new()));
    /// ```
    pub fn decode(header_value: &str) -> Result<Self, BaggageError> {
        BaggageSet::parse(header_value).map(|baggage| Self::from_baggage(&baggage))
    }

    /// Collects the `sentry-` members of already parsed baggage.
    pub fn from_baggage(baggage: &BaggageSet) -> Self {
        let entries = baggage
            .iter()
            .filter_map(|member| {
                member
                    .key()
                    .strip_prefix(SENTRY_BAGGAGE_PREFIX)
                    .map(|name| (name.to_owned(), member.value().to_owned()))
            })
            .collect::<BTreeMap<_, _>>();
        let frozen = !entries.is_empty();
        DynamicSamplingContext { entries, frozen }
    }

    /// Encodes the entries as `sentry-` prefixed baggage members, in name order.
    ///
    /// Entries whose prefixed name is not a valid baggage key are left out.
    pub fn to_baggage(&self) -> BaggageSet {
        let mut baggage = BaggageSet::new();
        for (name, value) in &self.entries {
            let member = BaggageMember::new(format!("{SENTRY_BAGGAGE_PREFIX}{name}"), value.as_str());
            if let Ok(member) = member {
                let _ = baggage.insert(member);
            }
        }
        baggage
    }

    /// Whether the sampling decision is locked for the rest of the trace.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns the entry stored under `name`, without the `sentry-` prefix.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// All entries, keyed by name without the `sentry-` prefix.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Returns `true` if the context holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The trace id the context was created for.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.get(keys::TRACE_ID)
            .and_then(|id| TraceId::from_hex(id).ok())
    }

    /// The public key of the project that started the trace.
    pub fn public_key(&self) -> Option<&str> {
        self.get(keys::PUBLIC_KEY)
    }

    /// The head sample rate.
    pub fn sample_rate(&self) -> Option<f64> {
        self.get(keys::SAMPLE_RATE)
            .and_then(|rate| rate.parse().ok())
    }

    /// The head sampling decision.
    pub fn sampled(&self) -> Option<bool> {
        self.get(keys::SAMPLED).and_then(|sampled| sampled.parse().ok())
    }

    /// The release of the service that started the trace.
    pub fn release(&self) -> Option<&str> {
        self.get(keys::RELEASE)
    }

    /// The environment of the service that started the trace.
    pub fn environment(&self) -> Option<&str> {
        self.get(keys::ENVIRONMENT)
    }

    /// The root transaction name.
    pub fn transaction(&self) -> Option<&str> {
        self.get(keys::TRANSACTION)
    }
}

/// Serializes the dynamic sampling context of `span` as a `baggage` value.
///
/// Spans without a trace id carry no trace data and encode to an empty string.
pub fn encode(span: &SentrySpan) -> String {
    if span.trace_id() == TraceId::INVALID {
        return String::new();
    }
    span.dynamic_sampling_context().to_baggage().to_string()
}
