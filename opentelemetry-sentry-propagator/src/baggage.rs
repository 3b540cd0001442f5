//! Ordered W3C baggage.
//!
//! [`opentelemetry::baggage::Baggage`] is unordered and cannot report why an
//! insert was refused, so the propagator works on a [`BaggageSet`] while it
//! combines the context baggage with the Sentry baggage, and converts back at
//! the [`Context`] boundary.
//!
//! [`Context`]: opentelemetry::Context
use opentelemetry::baggage::{Baggage, KeyValueMetadata};
use opentelemetry::otel_debug;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::str::FromStr;

/// Maximum number of members in a [`BaggageSet`].
pub const MAX_MEMBERS: usize = 64;
/// Maximum total length of keys, values and serialized properties in a
/// [`BaggageSet`].
pub const MAX_BYTES: usize = 8192;

// https://datatracker.ietf.org/doc/html/rfc7230#section-3.2.6
const INVALID_ASCII_KEY_CHARS: [u8; 17] = [
    b'(', b')', b',', b'/', b':', b';', b'<', b'=', b'>', b'?', b'@', b'[', b'\\', b']', b'{',
    b'}', b'"',
];

const VALUE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b',')
    .add(b';')
    .add(b'=')
    .add(b'\\');

/// Errors returned while parsing or building baggage.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BaggageError {
    /// A list member was not of the form `key=value[;properties]`.
    #[error("invalid baggage member {0:?}")]
    InvalidMember(String),

    /// A member or property key was not a valid token.
    #[error("invalid baggage key {0:?}")]
    InvalidKey(String),

    /// A property was empty.
    #[error("invalid baggage property in {0:?}")]
    InvalidProperty(String),

    /// A value was not valid percent-encoded UTF-8.
    #[error("invalid percent-encoding in {0:?}")]
    InvalidEncoding(String),

    /// Adding the member would exceed [`MAX_MEMBERS`].
    #[error("baggage member limit of {} reached", MAX_MEMBERS)]
    TooManyMembers,

    /// Adding the member would exceed [`MAX_BYTES`].
    #[error("baggage size limit of {} bytes reached", MAX_BYTES)]
    TooLarge,
}

fn is_key_valid(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_graphic() && !INVALID_ASCII_KEY_CHARS.contains(&b))
}

fn decode(s: &str) -> Result<String, BaggageError> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| BaggageError::InvalidEncoding(s.to_owned()))
}

/// A `key[=value]` property attached to a [`BaggageMember`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaggageProperty {
    key: String,
    value: Option<String>,
}

impl BaggageProperty {
    /// Create a property, validating its key.
    pub fn new<K: Into<String>>(key: K, value: Option<String>) -> Result<Self, BaggageError> {
        let key = key.into();
        if !is_key_valid(&key) {
            return Err(BaggageError::InvalidKey(key));
        }
        Ok(BaggageProperty { key, value })
    }

    /// The property key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The decoded property value, if any.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn parse(property: &str) -> Result<Self, BaggageError> {
        let property = property.trim();
        if property.is_empty() {
            return Err(BaggageError::InvalidProperty(property.to_owned()));
        }
        match property.split_once('=') {
            Some((key, value)) => BaggageProperty::new(key.trim(), Some(decode(value.trim())?)),
            None => BaggageProperty::new(property, None),
        }
    }
}

impl fmt::Display for BaggageProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(
                f,
                "{}={}",
                self.key,
                utf8_percent_encode(value, VALUE_ENCODE_SET)
            ),
            None => write!(f, "{}", self.key),
        }
    }
}

/// A single baggage list member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaggageMember {
    key: String,
    value: String,
    properties: Vec<BaggageProperty>,
}

impl BaggageMember {
    /// Create a member without properties, validating its key.
    ///
    /// The value is stored decoded and percent-encoded on serialization.
    pub fn new<K, V>(key: K, value: V) -> Result<Self, BaggageError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        if !is_key_valid(&key) {
            return Err(BaggageError::InvalidKey(key));
        }
        Ok(BaggageMember {
            key,
            value: value.into(),
            properties: Vec::new(),
        })
    }

    /// Returns the member with `property` appended.
    pub fn with_property(mut self, property: BaggageProperty) -> Self {
        self.properties.push(property);
        self
    }

    /// The member key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The decoded member value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The member properties, in header order.
    pub fn properties(&self) -> &[BaggageProperty] {
        &self.properties
    }

    // counted like `opentelemetry::baggage::Baggage` counts the converted entry
    fn byte_len(&self) -> usize {
        self.key.len() + self.value.len() + self.metadata().len()
    }

    // property list in header form, so `BaggageProperty::parse` reverses it
    fn metadata(&self) -> String {
        self.properties
            .iter()
            .map(BaggageProperty::to_string)
            .collect::<Vec<String>>()
            .join(";")
    }

    fn parse(member: &str) -> Result<Self, BaggageError> {
        let mut parts = member.split(';');
        let key_value = parts.next().unwrap_or_default();
        let (key, value) = key_value
            .split_once('=')
            .ok_or_else(|| BaggageError::InvalidMember(member.to_owned()))?;

        let mut parsed = BaggageMember::new(key.trim(), decode(value.trim())?)?;
        for property in parts {
            parsed.properties.push(BaggageProperty::parse(property)?);
        }
        Ok(parsed)
    }
}

impl fmt::Display for BaggageMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}",
            self.key,
            utf8_percent_encode(&self.value, VALUE_ENCODE_SET)
        )?;
        for property in &self.properties {
            write!(f, ";{property}")?;
        }
        Ok(())
    }
}

impl From<&BaggageMember> for KeyValueMetadata {
    fn from(member: &BaggageMember) -> Self {
        KeyValueMetadata::new(member.key.clone(), member.value.clone(), member.metadata())
    }
}

/// An ordered set of [`BaggageMember`]s, unique by key.
///
/// Re-inserting an existing key replaces the member in place, so the set keeps
/// the position the key was first seen at.
///
/// ### Limits
///
/// * Maximum number of members: [`MAX_MEMBERS`].
/// * Maximum total length of keys, values and serialized properties:
///   [`MAX_BYTES`], counted the same way as [`Baggage`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BaggageSet {
    members: Vec<BaggageMember>,
    byte_len: usize,
}

impl BaggageSet {
    /// Creates an empty `BaggageSet`.
    pub fn new() -> Self {
        BaggageSet::default()
    }

    /// Parses a W3C `baggage` header value.
    ///
    /// An empty (or blank) value yields an empty set. Any malformed member fails
    /// the whole parse.
    ///
    /// # Examples
    ///
    /// ```
    /// use opentelemetry_sentry_propagator::baggage::BaggageSet;
    ///
    /// let baggage = BaggageSet::parse("userId=alice,serverNode=DF%2028;zone=eu").unwrap();
    ///
    /// assert_eq!(baggage.len(), 2);
    /// assert_eq!(baggage.get("serverNode").map(|m| m.value()), Some("DF 28"));
    /// ```
    pub fn parse(header_value: &str) -> Result<Self, BaggageError> {
        let header_value = header_value.trim();
        let mut baggage = BaggageSet::new();
        if header_value.is_empty() {
            return Ok(baggage);
        }
        for member in header_value.split(',') {
            baggage.insert(BaggageMember::parse(member.trim())?)?;
        }
        Ok(baggage)
    }

    /// Builds a set from the unordered context baggage, in key order.
    ///
    /// Entries whose metadata is not a valid property list keep their value and
    /// drop the metadata.
    pub fn from_context_baggage(baggage: &Baggage) -> Self {
        let mut entries = baggage.iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        let mut set = BaggageSet::new();
        for (key, (value, metadata)) in entries {
            let Ok(mut member) = BaggageMember::new(key.as_str(), value.as_str()) else {
                continue;
            };
            let properties = metadata
                .as_str()
                .split(';')
                .filter(|p| !p.trim().is_empty())
                .map(BaggageProperty::parse)
                .collect::<Result<Vec<_>, _>>();
            if let Ok(properties) = properties {
                member.properties = properties;
            }
            // re-encoding foreign metadata can make an entry longer than the
            // context baggage counted it
            if let Err(err) = set.insert(member) {
                otel_debug!(
                    name: "SentryPropagator.Inject.BaggageMemberRejected",
                    key = key.as_str().to_owned(),
                    error = format!("{err}"),
                );
            }
        }
        set
    }

    /// Returns the member stored under `key`.
    pub fn get<K: AsRef<str>>(&self, key: K) -> Option<&BaggageMember> {
        self.members.iter().find(|m| m.key == key.as_ref())
    }

    /// Inserts a member, replacing any member with the same key in place.
    ///
    /// Returns the replaced member, or an error if the set limits would be
    /// exceeded, in which case the set is unchanged.
    pub fn insert(&mut self, member: BaggageMember) -> Result<Option<BaggageMember>, BaggageError> {
        let member_len = member.byte_len();
        match self.members.iter().position(|m| m.key == member.key) {
            Some(idx) => {
                let new_len = self.byte_len - self.members[idx].byte_len() + member_len;
                if new_len > MAX_BYTES {
                    return Err(BaggageError::TooLarge);
                }
                self.byte_len = new_len;
                Ok(Some(std::mem::replace(&mut self.members[idx], member)))
            }
            None => {
                if self.members.len() == MAX_MEMBERS {
                    return Err(BaggageError::TooManyMembers);
                }
                if self.byte_len + member_len > MAX_BYTES {
                    return Err(BaggageError::TooLarge);
                }
                self.byte_len += member_len;
                self.members.push(member);
                Ok(None)
            }
        }
    }

    /// Removes the member stored under `key`.
    pub fn remove<K: AsRef<str>>(&mut self, key: K) -> Option<BaggageMember> {
        let idx = self.members.iter().position(|m| m.key == key.as_ref())?;
        let removed = self.members.remove(idx);
        self.byte_len -= removed.byte_len();
        Some(removed)
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterates the members in order.
    pub fn iter(&self) -> std::slice::Iter<'_, BaggageMember> {
        self.members.iter()
    }
}

impl<'a> IntoIterator for &'a BaggageSet {
    type Item = &'a BaggageMember;
    type IntoIter = std::slice::Iter<'a, BaggageMember>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

impl FromStr for BaggageSet {
    type Err = BaggageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BaggageSet::parse(s)
    }
}

impl fmt::Display for BaggageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{member}")?;
        }
        Ok(())
    }
}

/// Inserts every member of `source` into `target`, in order.
///
/// A member that `target` refuses is skipped and the rest are still merged, so
/// `source` wins every key collision it is allowed to.
///
/// # Examples
///
/// ```
/// use opentelemetry_sentry_propagator::baggage::{merge, BaggageSet};
///
/// let target = BaggageSet::parse("a=1,b=2").unwrap();
/// let source = BaggageSet::parse("b=3,c=4").unwrap();
///
/// assert_eq!(merge(target, &source).to_string(), "a=1,b=3,c=4");
/// ```
pub fn merge(target: BaggageSet, source: &BaggageSet) -> BaggageSet {
    source.iter().fold(target, |mut merged, member| {
        if let Err(err) = merged.insert(member.clone()) {
            otel_debug!(
                name: "SentryPropagator.Inject.BaggageMemberRejected",
                key = member.key().to_owned(),
                error = format!("{err}"),
            );
        }
        merged
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{baggage::BaggageMetadata, KeyValue};

    #[rustfmt::skip]
    fn valid_headers() -> Vec<(&'static str, Vec<(&'static str, &'static str)>)> {
        vec![
            ("", vec![]),
            ("   ", vec![]),
            ("key1=val1,key2=val2", vec![("key1", "val1"), ("key2", "val2")]),
            ("key1 =   val1,  key2 =val2   ", vec![("key1", "val1"), ("key2", "val2")]),
            ("key1=val1,key2=val2%2Cval3", vec![("key1", "val1"), ("key2", "val2,val3")]),
            ("key1=,key2=val2", vec![("key1", ""), ("key2", "val2")]),
            ("key1=a=b", vec![("key1", "a=b")]),
            ("key1=1,key1=2", vec![("key1", "2")]),
        ]
    }

    #[rustfmt::skip]
    fn invalid_headers() -> Vec<(&'static str, BaggageError)> {
        vec![
            ("key1=val1,a,val3", BaggageError::InvalidMember("a".into())),
            ("key1=val1,,key2=val2", BaggageError::InvalidMember("".into())),
            ("=val1", BaggageError::InvalidKey("".into())),
            ("(key)=val1", BaggageError::InvalidKey("(key)".into())),
            ("Grüße=1", BaggageError::InvalidKey("Grüße".into())),
            ("key1=%FF", BaggageError::InvalidEncoding("%FF".into())),
            ("key1=val1;", BaggageError::InvalidProperty("".into())),
            ("key1=val1;(p)=1", BaggageError::InvalidKey("(p)".into())),
        ]
    }

    #[test]
    fn parse_valid_baggage() {
        for (header, expected) in valid_headers() {
            let baggage = BaggageSet::parse(header).expect(header);
            let members = baggage
                .iter()
                .map(|m| (m.key(), m.value()))
                .collect::<Vec<_>>();
            assert_eq!(members, expected, "{header:?}");
        }
    }

    #[test]
    fn reject_invalid_baggage() {
        for (header, expected) in invalid_headers() {
            assert_eq!(BaggageSet::parse(header), Err(expected), "{header:?}");
        }
    }

    #[test]
    fn parse_properties() {
        let baggage =
            BaggageSet::parse("key1=value1;property1;property2, key3=value3; propertyKey=property%20Value")
                .unwrap();

        let key1 = baggage.get("key1").unwrap();
        assert_eq!(
            key1.properties(),
            &[
                BaggageProperty::new("property1", None).unwrap(),
                BaggageProperty::new("property2", None).unwrap(),
            ]
        );
        let key3 = baggage.get("key3").unwrap();
        assert_eq!(key3.properties()[0].key(), "propertyKey");
        assert_eq!(key3.properties()[0].value(), Some("property Value"));
    }

    #[rustfmt::skip]
    fn serialize_data() -> Vec<(BaggageSet, &'static str)> {
        let mut single = BaggageSet::new();
        single.insert(BaggageMember::new("foo", "1=1").unwrap()).unwrap();

        let mut with_properties = BaggageSet::new();
        with_properties.insert(
            BaggageMember::new("foo", "")
                .unwrap()
                .with_property(BaggageProperty::new("red", None).unwrap())
                .with_property(BaggageProperty::new("state", Some("on".into())).unwrap()),
        ).unwrap();
        with_properties.insert(BaggageMember::new("bar", "a b%").unwrap()).unwrap();

        vec![
            (BaggageSet::new(), ""),
            (single, "foo=1%3D1"),
            (with_properties, "foo=;red;state=on,bar=a%20b%25"),
        ]
    }

    #[test]
    fn serialize_baggage() {
        for (baggage, expected) in serialize_data() {
            assert_eq!(baggage.to_string(), expected);
            assert_eq!(BaggageSet::parse(expected).unwrap(), baggage);
        }
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut baggage = BaggageSet::parse("a=1,b=2,c=3").unwrap();

        let replaced = baggage.insert(BaggageMember::new("b", "x").unwrap()).unwrap();

        assert_eq!(replaced.map(|m| m.value().to_owned()), Some("2".to_owned()));
        assert_eq!(baggage.to_string(), "a=1,b=x,c=3");
    }

    #[test]
    fn insert_too_many_members() {
        let mut baggage = BaggageSet::new();
        for i in 0..MAX_MEMBERS {
            baggage.insert(BaggageMember::new(format!("key{i}"), "v").unwrap()).unwrap();
        }

        assert_eq!(
            baggage.insert(BaggageMember::new("one-more", "v").unwrap()),
            Err(BaggageError::TooManyMembers)
        );
        // replacing an existing key is still allowed
        assert!(baggage.insert(BaggageMember::new("key0", "w").unwrap()).is_ok());
        assert_eq!(baggage.len(), MAX_MEMBERS);
    }

    #[test]
    fn insert_too_large() {
        let half: String = "x".repeat(MAX_BYTES / 2 - 2);
        let mut baggage = BaggageSet::new();
        baggage.insert(BaggageMember::new("a", half.clone()).unwrap()).unwrap();
        baggage.insert(BaggageMember::new("b", half).unwrap()).unwrap();
        baggage.insert(BaggageMember::new("c", ".").unwrap()).unwrap();

        assert_eq!(
            baggage.insert(BaggageMember::new("c", "..").unwrap()),
            Err(BaggageError::TooLarge)
        );
        assert_eq!(baggage.get("c").map(|m| m.value()), Some("."));

        baggage.remove("a");
        assert!(baggage.insert(BaggageMember::new("c", "..").unwrap()).is_ok());
    }

    #[test]
    fn size_limit_counts_serialized_properties() {
        let properties = ";p".repeat(150);
        let at_limit = format!("a={}{properties}", "x".repeat(7892));
        let over_limit = format!("a={}{properties}", "x".repeat(7893));

        let baggage = BaggageSet::parse(&at_limit).unwrap();
        let converted: Baggage = baggage.iter().map(KeyValueMetadata::from).collect();
        assert_eq!(converted.len(), 1);

        assert_eq!(BaggageSet::parse(&over_limit), Err(BaggageError::TooLarge));
    }

    #[test]
    fn merge_source_wins_collisions() {
        let target = BaggageSet::parse("shared=context,own=1").unwrap();
        let source = BaggageSet::parse("shared=derived,extra=2").unwrap();

        let merged = merge(target, &source);

        assert_eq!(merged.to_string(), "shared=derived,own=1,extra=2");
        assert_eq!(merged.iter().filter(|m| m.key() == "shared").count(), 1);
    }

    #[test]
    fn merge_with_itself() {
        let baggage = BaggageSet::parse("a=1;p,b=2,c=%2C").unwrap();

        assert_eq!(merge(baggage.clone(), &baggage), baggage);
    }

    #[test]
    fn merge_skips_rejected_members() {
        let mut target = BaggageSet::new();
        for i in 0..MAX_MEMBERS {
            target.insert(BaggageMember::new(format!("key{i}"), "v").unwrap()).unwrap();
        }
        let source = BaggageSet::parse("new=1,key3=updated").unwrap();

        let merged = merge(target, &source);

        assert_eq!(merged.len(), MAX_MEMBERS);
        assert!(merged.get("new").is_none());
        assert_eq!(merged.get("key3").map(|m| m.value()), Some("updated"));
    }

    #[test]
    fn convert_context_baggage() {
        let baggage = Baggage::from([
            KeyValueMetadata::new("b", "2", "prop=x"),
            KeyValue::new("a", "1 1").into(),
            KeyValueMetadata::new("c", "3", "flag"),
        ]);

        let set = BaggageSet::from_context_baggage(&baggage);
        assert_eq!(set.to_string(), "a=1%201,b=2;prop=x,c=3;flag");

        let back: Baggage = set.iter().map(KeyValueMetadata::from).collect();
        assert_eq!(back.len(), 3);
        assert_eq!(
            back.get_with_metadata("b"),
            Some(&("2".into(), BaggageMetadata::from("prop=x")))
        );
    }

    #[test]
    fn context_baggage_keeps_escaped_properties() {
        let set = BaggageSet::parse("k=v;p=a%2520b;q=x%3By;flag").unwrap();

        let baggage: Baggage = set.iter().map(KeyValueMetadata::from).collect();
        assert_eq!(
            baggage.get_with_metadata("k").map(|(_, metadata)| metadata.as_str()),
            Some("p=a%2520b;q=x%3By;flag")
        );

        let back = BaggageSet::from_context_baggage(&baggage);
        assert_eq!(back, set);
        assert_eq!(back.get("k").unwrap().properties()[1].value(), Some("x;y"));
    }
}
