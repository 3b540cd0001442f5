//! Sentry values carried in a [`Context`].
use crate::dsc::DynamicSamplingContext;
use opentelemetry::Context;

/// Solely used to store the incoming `sentry-trace` value in the `Context`
#[derive(Debug)]
struct SentryTraceHeaderValue(String);

/// Solely used to store the `DynamicSamplingContext` in the `Context`
#[derive(Debug)]
struct DynamicSamplingContextValue(DynamicSamplingContext);

/// Methods for storing and retrieving Sentry propagation state in a context.
pub trait SentryContextExt {
    /// Returns a clone of this context holding the raw `sentry-trace` value
    /// that arrived with the request.
    fn with_sentry_trace_header<T: Into<String>>(&self, header_value: T) -> Self;

    /// Returns the raw `sentry-trace` value stored by extraction, if any.
    fn sentry_trace_header(&self) -> Option<&str>;

    /// Returns a clone of this context holding `dsc`.
    ///
    /// # Examples
    ///
    /// ```
    /// use opentelemetry::Context;
    /// use opentelemetry_sentry_propagator::{DynamicSamplingContext, SentryContextExt};
    ///
    /// let dsc = DynamicSamplingContext::from_entries([("sample_rate", "1")]);
    /// let cx = Context::new().with_dynamic_sampling_context(dsc.clone());
    ///
    /// assert_eq!(cx.dynamic_sampling_context(), Some(&dsc));
    /// ```
    fn with_dynamic_sampling_context(&self, dsc: DynamicSamplingContext) -> Self;

    /// Returns the dynamic sampling context stored by extraction, if any.
    fn dynamic_sampling_context(&self) -> Option<&DynamicSamplingContext>;
}

impl SentryContextExt for Context {
    fn with_sentry_trace_header<T: Into<String>>(&self, header_value: T) -> Self {
        self.with_value(SentryTraceHeaderValue(header_value.into()))
    }

    fn sentry_trace_header(&self) -> Option<&str> {
        self.get::<SentryTraceHeaderValue>()
            .map(|header| header.0.as_str())
    }

    fn with_dynamic_sampling_context(&self, dsc: DynamicSamplingContext) -> Self {
        self.with_value(DynamicSamplingContextValue(dsc))
    }

    fn dynamic_sampling_context(&self) -> Option<&DynamicSamplingContext> {
        self.get::<DynamicSamplingContextValue>().map(|dsc| &dsc.0)
    }
}
