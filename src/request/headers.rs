//! An ordered, case-sensitive header mapping.

use std::fmt;

/// Request headers.
///
/// Keys are unique and compared exactly as given, so `accept` and `Accept`
/// are distinct keys. Iteration follows insertion order; replacing the value
/// of an existing key keeps its position.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// An empty header mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, returning the previous value if there was one.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// The value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Merge `overrides` into these headers. Values from `overrides` win.
    pub fn merge(&mut self, overrides: &Headers) {
        for (key, value) in overrides.iter() {
            self.insert(key, value);
        }
    }

    /// A copy of these headers with `overrides` merged in.
    pub fn merged(&self, overrides: &Headers) -> Headers {
        let mut merged = self.clone();
        merged.merge(overrides);
        merged
    }

    /// Iterate over `(key, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first key or value which cannot be written on a header line.
    pub(crate) fn find_invalid(&self) -> Option<&str> {
        self.entries.iter().find_map(|(key, value)| {
            if key.is_empty() || key.contains(':') || breaks_line(key) {
                Some(key.as_str())
            } else if breaks_line(value) {
                Some(value.as_str())
            } else {
                None
            }
        })
    }
}

fn breaks_line(text: &str) -> bool {
    text.contains(['\r', '\n'])
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

impl<K, V> Extend<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}
