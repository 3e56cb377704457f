//! Ordered key/value vectors and their flat wire encoding.
//!
//! A payload is `record || PAIR_SEP || record || ...` where each record is
//! `key || KEY_SEP || value`. Decoding splits each record on the *first*
//! key separator, so values may contain the key separator but never the
//! pair separator.
//!
//! Whether decoded pairs own their bytes or borrow them from the payload is
//! chosen by the caller with [`Ownership`]; it is never inferred.

use std::borrow::Cow;
use std::fmt;

use crate::error::{MuxError, Result};
use crate::iocache::find_subsequence;

/// How decoded pairs relate to the payload they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Pairs hold independent copies and may outlive the source buffer.
    Copy,
    /// Pairs reference the source buffer and are bounded by its lifetime.
    Borrow,
}

/// One key/value pair. Both halves are raw bytes with explicit length.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyValue<'a> {
    key: Cow<'a, [u8]>,
    value: Cow<'a, [u8]>,
}

impl<'a> KeyValue<'a> {
    pub fn new(key: impl Into<Cow<'a, [u8]>>, value: impl Into<Cow<'a, [u8]>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// True if neither half references a source buffer.
    pub fn is_owned(&self) -> bool {
        matches!(
            (&self.key, &self.value),
            (Cow::Owned(_), Cow::Owned(_))
        )
    }

    pub fn into_owned(self) -> KeyValue<'static> {
        KeyValue {
            key: Cow::Owned(self.key.into_owned()),
            value: Cow::Owned(self.value.into_owned()),
        }
    }
}

impl fmt::Debug for KeyValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// Ordered sequence of key/value pairs. Order is the order on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvVec<'a> {
    pairs: Vec<KeyValue<'a>>,
}

impl<'a> KvVec<'a> {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, key: impl Into<Cow<'a, [u8]>>, value: impl Into<Cow<'a, [u8]>>) {
        self.pairs.push(KeyValue::new(key, value));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, key: impl Into<Cow<'a, [u8]>>, value: impl Into<Cow<'a, [u8]>>) -> Self {
        self.push(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyValue<'a>> {
        self.pairs.iter()
    }

    /// Value of the first pair with this key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|kv| kv.key() == key.as_bytes())
            .map(KeyValue::value)
    }

    /// Value of the first pair with this key, as UTF-8 (lossy).
    pub fn get_str(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key).map(String::from_utf8_lossy)
    }

    pub fn into_owned(self) -> KvVec<'static> {
        KvVec {
            pairs: self.pairs.into_iter().map(KeyValue::into_owned).collect(),
        }
    }
}

impl<'a> IntoIterator for KvVec<'a> {
    type Item = KeyValue<'a>;
    type IntoIter = std::vec::IntoIter<KeyValue<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.into_iter()
    }
}

impl<'v, 'a> IntoIterator for &'v KvVec<'a> {
    type Item = &'v KeyValue<'a>;
    type IntoIter = std::slice::Iter<'v, KeyValue<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

impl<'a> FromIterator<KeyValue<'a>> for KvVec<'a> {
    fn from_iter<I: IntoIterator<Item = KeyValue<'a>>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// Iterator over the records of a payload, split on `sep`.
struct Records<'p, 's> {
    rest: Option<&'p [u8]>,
    sep: &'s [u8],
}

impl<'p> Iterator for Records<'p, '_> {
    type Item = &'p [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest?;
        match find_subsequence(rest, self.sep) {
            Some(at) => {
                self.rest = Some(&rest[at + self.sep.len()..]);
                Some(&rest[..at])
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }
}

/// Decode a flat payload into an ordered key/value vector.
///
/// Fails with [`MuxError::MalformedRecord`] if any record lacks `key_sep`;
/// callers drop that payload and carry on with the next one. An empty
/// payload decodes to an empty vector, and one trailing empty record (a
/// peer that terminates every pair) is ignored.
pub fn decode<'a>(
    payload: &'a [u8],
    key_sep: &[u8],
    pair_sep: &[u8],
    ownership: Ownership,
) -> Result<KvVec<'a>> {
    let mut kvv = KvVec::new();
    if payload.is_empty() {
        return Ok(kvv);
    }

    let mut records = Records {
        rest: Some(payload),
        sep: pair_sep,
    }
    .enumerate()
    .peekable();

    while let Some((index, record)) = records.next() {
        if record.is_empty() && records.peek().is_none() && index > 0 {
            break;
        }
        let at = find_subsequence(record, key_sep).ok_or(MuxError::MalformedRecord { index })?;
        let (key, value) = (&record[..at], &record[at + key_sep.len()..]);
        match ownership {
            Ownership::Borrow => kvv.push(key, value),
            Ownership::Copy => kvv.push(key.to_vec(), value.to_vec()),
        }
    }

    Ok(kvv)
}

/// Encode a vector as `key<key_sep>value` records joined by `pair_sep`.
pub fn encode(kvv: &KvVec<'_>, key_sep: &[u8], pair_sep: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded_len(kvv, key_sep, pair_sep));
    encode_into(kvv, key_sep, pair_sep, &mut out)?;
    Ok(out)
}

/// Like [`encode`], appending to an existing buffer.
///
/// Keys may contain neither separator; values may not contain `pair_sep`.
/// On error nothing is appended.
pub fn encode_into(
    kvv: &KvVec<'_>,
    key_sep: &[u8],
    pair_sep: &[u8],
    out: &mut Vec<u8>,
) -> Result<()> {
    validate(kvv, key_sep, pair_sep)?;
    out.reserve(encoded_len(kvv, key_sep, pair_sep));
    for (index, kv) in kvv.iter().enumerate() {
        if index > 0 {
            out.extend_from_slice(pair_sep);
        }
        out.extend_from_slice(kv.key());
        out.extend_from_slice(key_sep);
        out.extend_from_slice(kv.value());
    }
    Ok(())
}

fn validate(kvv: &KvVec<'_>, key_sep: &[u8], pair_sep: &[u8]) -> Result<()> {
    for (index, kv) in kvv.iter().enumerate() {
        if find_subsequence(kv.key(), key_sep).is_some()
            || find_subsequence(kv.key(), pair_sep).is_some()
        {
            return Err(MuxError::ReservedSequence {
                index,
                field: "key",
            });
        }
        if find_subsequence(kv.value(), pair_sep).is_some() {
            return Err(MuxError::ReservedSequence {
                index,
                field: "value",
            });
        }
    }
    Ok(())
}

fn encoded_len(kvv: &KvVec<'_>, key_sep: &[u8], pair_sep: &[u8]) -> usize {
    let body: usize = kvv
        .iter()
        .map(|kv| kv.key().len() + key_sep.len() + kv.value().len())
        .sum();
    body + kvv.len().saturating_sub(1) * pair_sep.len()
}
