//! # Sentry Trace Header
//!
//! Sentry carries its trace identity in a single `sentry-trace` header:
//!
//! `sentry-trace: 771a43a4192642f0b136d5159a501700-b7ad6b7169203331-1`
//!
//! The value has three `-` separated fields:
//!
//!    - trace-id, 32 hex characters
//!    - span-id, 16 hex characters
//!    - sampled, optional, `1` or `0`
//!
//! An absent sampled field means the upstream service deferred the sampling
//! decision.
use opentelemetry::trace::{SpanId, TraceId};
use std::fmt;
use std::str::FromStr;

/// Header name of the Sentry trace header.
pub const SENTRY_TRACE_HEADER: &str = "sentry-trace";

/// Header name of the W3C baggage header, which also carries the Sentry
/// dynamic sampling context.
pub const BAGGAGE_HEADER: &str = "baggage";

const TRACE_ID_HEX_LEN: usize = 32;
const SPAN_ID_HEX_LEN: usize = 16;

/// Errors returned when a `sentry-trace` header cannot be decoded.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceHeaderError {
    /// The header value was empty.
    #[error("sentry-trace header is empty")]
    Empty,

    /// The header did not have two or three `-` separated fields.
    #[error("expected 2 or 3 fields in sentry-trace header, found {0}")]
    FieldCount(usize),

    /// The trace id field was not 32 hex characters.
    #[error("invalid trace id {0:?}")]
    InvalidTraceId(String),

    /// The span id field was not 16 hex characters.
    #[error("invalid span id {0:?}")]
    InvalidSpanId(String),

    /// The sampled field was neither `0` nor `1`.
    #[error("invalid sampled flag {0:?}")]
    InvalidSampled(String),
}

/// A decoded `sentry-trace` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SentryTrace {
    trace_id: TraceId,
    span_id: SpanId,
    sampled: Option<bool>,
}

impl SentryTrace {
    /// Create a new `SentryTrace`.
    ///
    /// `span_id` is the id of the span that sent the request, which becomes the
    /// parent of whatever the receiver creates.
    pub fn new(trace_id: TraceId, span_id: SpanId, sampled: Option<bool>) -> Self {
        SentryTrace {
            trace_id,
            span_id,
            sampled,
        }
    }

    /// The trace id.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The parent span id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The upstream sampling decision, `None` when it was deferred.
    pub fn sampled(&self) -> Option<bool> {
        self.sampled
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FromStr for SentryTrace {
    type Err = TraceHeaderError;

    fn from_str(header_value: &str) -> Result<Self, Self::Err> {
        if header_value.is_empty() {
            return Err(TraceHeaderError::Empty);
        }

        let parts = header_value.split('-').collect::<Vec<&str>>();
        if !(2..=3).contains(&parts.len()) {
            return Err(TraceHeaderError::FieldCount(parts.len()));
        }

        // from_hex alone would accept a leading `+` and short values
        if !is_hex_of_len(parts[0], TRACE_ID_HEX_LEN) {
            return Err(TraceHeaderError::InvalidTraceId(parts[0].to_owned()));
        }
        let trace_id = TraceId::from_hex(parts[0])
            .map_err(|_| TraceHeaderError::InvalidTraceId(parts[0].to_owned()))?;

        if !is_hex_of_len(parts[1], SPAN_ID_HEX_LEN) {
            return Err(TraceHeaderError::InvalidSpanId(parts[1].to_owned()));
        }
        let span_id = SpanId::from_hex(parts[1])
            .map_err(|_| TraceHeaderError::InvalidSpanId(parts[1].to_owned()))?;

        let sampled = match parts.get(2) {
            None => None,
            Some(&"1") => Some(true),
            Some(&"0") => Some(false),
            Some(other) => return Err(TraceHeaderError::InvalidSampled((*other).to_owned())),
        };

        Ok(SentryTrace::new(trace_id, span_id, sampled))
    }
}

impl fmt::Display for SentryTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.trace_id, self.span_id)?;
        match self.sampled {
            Some(true) => write!(f, "-1"),
            Some(false) => write!(f, "-0"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TRACE_ID: u128 = 0x771a_43a4_1926_42f0_b136_d515_9a50_1700;
    const SPAN_ID: u64 = 0xb7ad_6b71_6920_3331;

    #[rstest]
    #[case("771a43a4192642f0b136d5159a501700-b7ad6b7169203331-1", Some(true))]
    #[case("771a43a4192642f0b136d5159a501700-b7ad6b7169203331-0", Some(false))]
    #[case("771a43a4192642f0b136d5159a501700-b7ad6b7169203331", None)]
    #[case("771A43A4192642F0B136D5159A501700-B7AD6B7169203331-1", Some(true))]
    fn parse_valid_header(#[case] header: &str, #[case] sampled: Option<bool>) {
        let parsed = header.parse::<SentryTrace>().expect("valid header");

        assert_eq!(parsed.trace_id(), TraceId::from(TRACE_ID));
        assert_eq!(parsed.span_id(), SpanId::from(SPAN_ID));
        assert_eq!(parsed.sampled(), sampled);
    }

    #[rustfmt::skip]
    fn invalid_headers() -> Vec<(&'static str, TraceHeaderError)> {
        vec![
            ("", TraceHeaderError::Empty),
            ("771a43a4192642f0b136d5159a501700", TraceHeaderError::FieldCount(1)),
            ("771a43a4192642f0b136d5159a501700-b7ad6b7169203331-1-1", TraceHeaderError::FieldCount(4)),
            ("771a43a4192642f0b136d5159a5017-b7ad6b7169203331-1", TraceHeaderError::InvalidTraceId("771a43a4192642f0b136d5159a5017".into())),
            ("+71a43a4192642f0b136d5159a501700-b7ad6b7169203331", TraceHeaderError::InvalidTraceId("+71a43a4192642f0b136d5159a501700".into())),
            ("771a43a4192642f0b136d5159a50170g-b7ad6b7169203331", TraceHeaderError::InvalidTraceId("771a43a4192642f0b136d5159a50170g".into())),
            ("771a43a4192642f0b136d5159a501700-b7ad6b716920333", TraceHeaderError::InvalidSpanId("b7ad6b716920333".into())),
            ("771a43a4192642f0b136d5159a501700-b7ad6b71692033zz-1", TraceHeaderError::InvalidSpanId("b7ad6b71692033zz".into())),
            ("771a43a4192642f0b136d5159a501700-b7ad6b7169203331-", TraceHeaderError::InvalidSampled("".into())),
            ("771a43a4192642f0b136d5159a501700-b7ad6b7169203331-2", TraceHeaderError::InvalidSampled("2".into())),
            (" 771a43a4192642f0b136d5159a501700-b7ad6b7169203331", TraceHeaderError::InvalidTraceId(" 771a43a4192642f0b136d5159a501700".into())),
        ]
    }

    #[test]
    fn reject_invalid_header() {
        for (header, expected) in invalid_headers() {
            assert_eq!(header.parse::<SentryTrace>(), Err(expected), "{header:?}");
        }
    }

    #[test]
    fn serialize_lowercase() {
        let header = "771A43A4192642F0B136D5159A501700-B7AD6B7169203331-0";
        let parsed: SentryTrace = header.parse().unwrap();

        assert_eq!(parsed.to_string(), header.to_lowercase());
    }

    #[test]
    fn reparse_serialized_header() {
        for header in [
            "771a43a4192642f0b136d5159a501700-b7ad6b7169203331-1",
            "771a43a4192642f0b136d5159a501700-b7ad6b7169203331-0",
            "00000000000000000000000000000001-0000000000000001",
        ] {
            let parsed: SentryTrace = header.parse().unwrap();
            let reparsed: SentryTrace = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed);
            assert_eq!(reparsed.to_string(), header);
        }
    }
}
