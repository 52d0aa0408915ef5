//! Ordered header and trailer maps.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

use http::header::{HeaderMap, HeaderName, HeaderValue};

use super::HeaderError;

/// Connection-control headers that guests may never set.
static FORBIDDEN_HEADERS: LazyLock<[HeaderName; 10]> = LazyLock::new(|| {
    [
        http::header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        http::header::PROXY_AUTHENTICATE,
        http::header::PROXY_AUTHORIZATION,
        HeaderName::from_static("proxy-connection"),
        http::header::TE,
        http::header::TRANSFER_ENCODING,
        http::header::UPGRADE,
        http::header::HOST,
        HeaderName::from_static("http2-settings"),
    ]
});

/// The names a [`Fields`] refuses: the fixed connection-control set plus
/// whatever the context added.
#[derive(Debug, Clone, Default)]
pub(crate) struct ForbiddenHeaders {
    extra: Arc<HashSet<HeaderName>>,
}

impl ForbiddenHeaders {
    pub(crate) fn new(extra: HashSet<HeaderName>) -> Self {
        Self {
            extra: Arc::new(extra),
        }
    }

    pub(crate) fn contains(&self, name: &HeaderName) -> bool {
        FORBIDDEN_HEADERS.contains(name) || self.extra.contains(name)
    }

    /// Removes forbidden headers from `headers`.
    pub(crate) fn strip(&self, headers: &mut HeaderMap) {
        let forbidden_keys = Vec::from_iter(headers.keys().filter_map(|name| {
            if self.contains(name) {
                Some(name.clone())
            } else {
                None
            }
        }));

        for name in forbidden_keys {
            headers.remove(name);
        }
    }
}

/// An ordered multimap of header names to values.
///
/// Names keep the case they were given in, and lookups are case-insensitive.
/// Once a `Fields` is attached to a request or response it becomes immutable;
/// [`Clone`] always produces a mutable copy.
pub struct Fields {
    /// Insertion-ordered entries, used for serialization.
    entries: Vec<(String, HeaderValue)>,
    /// Lowercased name to positions in `entries`.
    index: HashMap<HeaderName, Vec<usize>>,
    immutable: bool,
    forbidden: ForbiddenHeaders,
}

impl Fields {
    /// An empty, mutable set of fields.
    pub fn new() -> Self {
        Self::with_forbidden(ForbiddenHeaders::default())
    }

    pub(crate) fn with_forbidden(forbidden: ForbiddenHeaders) -> Self {
        Fields {
            entries: Vec::new(),
            index: HashMap::new(),
            immutable: false,
            forbidden,
        }
    }

    /// Builds fields from `(name, value)` pairs, validating every one.
    pub fn from_list<N, V>(entries: &[(N, V)]) -> Result<Self, HeaderError>
    where
        N: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let mut fields = Fields::new();
        for (name, value) in entries {
            fields.append(name.as_ref(), value.as_ref())?;
        }
        Ok(fields)
    }

    /// Copies an incoming header map, dropping forbidden headers.
    pub(crate) fn from_header_map(mut map: HeaderMap, forbidden: &ForbiddenHeaders) -> Self {
        forbidden.strip(&mut map);
        let mut fields = Fields::with_forbidden(forbidden.clone());
        let mut last = None;
        for (name, value) in map {
            // Repeated values of one name come with `None` names.
            if let Some(name) = name {
                last = Some(name);
            }
            if let Some(name) = &last {
                fields.push(name.clone(), name.as_str().to_string(), value);
            }
        }
        fields
    }

    pub(crate) fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            // Names were validated on the way in.
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                map.append(name, value.clone());
            }
        }
        map
    }

    pub(crate) fn lock(&mut self) {
        self.immutable = true;
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    fn check_mutable(&self) -> Result<(), HeaderError> {
        if self.immutable {
            Err(HeaderError::Immutable)
        } else {
            Ok(())
        }
    }

    fn parse_name(&self, name: &str) -> Result<HeaderName, HeaderError> {
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| HeaderError::InvalidSyntax)?;
        if self.forbidden.contains(&header) {
            return Err(HeaderError::Forbidden);
        }
        Ok(header)
    }

    fn push(&mut self, key: HeaderName, name: String, value: HeaderValue) {
        self.index.entry(key).or_default().push(self.entries.len());
        self.entries.push((name, value));
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, (name, _)) in self.entries.iter().enumerate() {
            if let Ok(key) = HeaderName::from_bytes(name.as_bytes()) {
                self.index.entry(key).or_default().push(i);
            }
        }
    }

    /// All values of `name`, in insertion order.
    pub fn get(&self, name: &str) -> Vec<Vec<u8>> {
        let Ok(key) = HeaderName::from_bytes(name.as_bytes()) else {
            return Vec::new();
        };
        self.index
            .get(&key)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&i| self.entries[i].1.as_bytes().to_vec())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        HeaderName::from_bytes(name.as_bytes())
            .is_ok_and(|key| self.index.contains_key(&key))
    }

    /// Replaces every value of `name`.
    ///
    /// The new values take the position of the first old value; other
    /// names keep their positions.
    pub fn set<V: AsRef<[u8]>>(&mut self, name: &str, values: &[V]) -> Result<(), HeaderError> {
        self.check_mutable()?;
        let key = self.parse_name(name)?;
        let values = values
            .iter()
            .map(|v| HeaderValue::from_bytes(v.as_ref()).map_err(|_| HeaderError::InvalidSyntax))
            .collect::<Result<Vec<_>, _>>()?;
        let at = self
            .index
            .get(&key)
            .and_then(|positions| positions.first().copied())
            .unwrap_or(self.entries.len());
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(key.as_str()));
        let at = at.min(self.entries.len());
        let new = values.into_iter().map(|v| (name.to_string(), v));
        self.entries.splice(at..at, new);
        self.reindex();
        Ok(())
    }

    /// Removes every value of `name`.
    pub fn delete(&mut self, name: &str) -> Result<(), HeaderError> {
        self.get_and_delete(name).map(drop)
    }

    /// Removes every value of `name` and returns them.
    pub fn get_and_delete(&mut self, name: &str) -> Result<Vec<Vec<u8>>, HeaderError> {
        self.check_mutable()?;
        let key = self.parse_name(name)?;
        let values = self.get(name);
        if !values.is_empty() {
            self.entries
                .retain(|(n, _)| !n.eq_ignore_ascii_case(key.as_str()));
            self.reindex();
        }
        Ok(values)
    }

    /// Adds a value for `name` after any existing ones.
    pub fn append(&mut self, name: &str, value: impl AsRef<[u8]>) -> Result<(), HeaderError> {
        self.check_mutable()?;
        let key = self.parse_name(name)?;
        let value = HeaderValue::from_bytes(value.as_ref()).map_err(|_| HeaderError::InvalidSyntax)?;
        self.push(key, name.to_string(), value);
        Ok(())
    }

    /// Every `(name, value)` pair in insertion order, names in their
    /// original case.
    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.clone(), value.as_bytes().to_vec()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Fields {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Fields {
    fn clone(&self) -> Self {
        Fields {
            entries: self.entries.clone(),
            index: self.index.clone(),
            immutable: false,
            forbidden: self.forbidden.clone(),
        }
    }
}

impl fmt::Debug for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(n, v)| (n, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_names_are_always_rejected() {
        let mut fields = Fields::new();
        for name in ["Connection", "host", "Transfer-Encoding", "TE"] {
            assert_eq!(fields.append(name, "x"), Err(HeaderError::Forbidden));
            assert_eq!(fields.set(name, &["x"]), Err(HeaderError::Forbidden));
        }
        assert_eq!(
            Fields::from_list(&[("upgrade", "websocket")]).unwrap_err(),
            HeaderError::Forbidden
        );
    }

    #[test]
    fn syntax_is_checked_separately() {
        let mut fields = Fields::new();
        assert_eq!(fields.append("bad name", "x"), Err(HeaderError::InvalidSyntax));
        assert_eq!(fields.append("x-ok", "a\r\nb"), Err(HeaderError::InvalidSyntax));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut fields =
            Fields::from_list(&[("A", "1"), ("B", "2"), ("a", "3"), ("C", "4")]).unwrap();
        fields.set("a", &["x", "y"]).unwrap();
        assert_eq!(
            fields.entries(),
            vec![
                ("a".to_string(), b"x".to_vec()),
                ("a".to_string(), b"y".to_vec()),
                ("B".to_string(), b"2".to_vec()),
                ("C".to_string(), b"4".to_vec()),
            ]
        );
        assert_eq!(fields.get("A"), vec![b"x".to_vec(), b"y".to_vec()]);
        assert_eq!(fields.get("c"), vec![b"4".to_vec()]);
    }

    #[test]
    fn lookups_ignore_case_but_entries_keep_it() {
        let mut fields = Fields::new();
        fields.append("Content-Type", "text/plain").unwrap();
        fields.append("X-Trace", "1").unwrap();
        fields.append("x-trace", "2").unwrap();
        assert!(fields.has("content-type"));
        assert_eq!(fields.get("X-TRACE"), vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(fields.entries()[0].0, "Content-Type");
        assert_eq!(
            fields.get_and_delete("x-trace").unwrap(),
            vec![b"1".to_vec(), b"2".to_vec()]
        );
        assert!(!fields.has("x-trace"));
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn clone_of_locked_fields_is_mutable() {
        let mut original = Fields::from_list(&[("x-a", "1")]).unwrap();
        original.lock();
        assert_eq!(original.append("x-b", "2"), Err(HeaderError::Immutable));
        assert_eq!(original.delete("x-a"), Err(HeaderError::Immutable));

        let mut copy = original.clone();
        assert!(!copy.is_immutable());
        copy.append("x-b", "2").unwrap();
        copy.delete("x-a").unwrap();
        assert_eq!(original.entries(), vec![("x-a".to_string(), b"1".to_vec())]);
        assert_eq!(copy.entries(), vec![("x-b".to_string(), b"2".to_vec())]);
    }

    #[test]
    fn incoming_maps_lose_forbidden_headers() {
        let mut map = HeaderMap::new();
        map.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        map.append("x-a", HeaderValue::from_static("1"));
        map.append("x-a", HeaderValue::from_static("2"));
        let fields = Fields::from_header_map(map, &ForbiddenHeaders::default());
        assert_eq!(fields.len(), 2);
        assert!(!fields.has("connection"));
        assert_eq!(fields.to_header_map().get_all("x-a").iter().count(), 2);
    }

    #[test]
    fn extra_forbidden_names() {
        let extra = HashSet::from([HeaderName::from_static("x-secret")]);
        let mut fields = Fields::with_forbidden(ForbiddenHeaders::new(extra));
        assert_eq!(fields.append("X-Secret", "1"), Err(HeaderError::Forbidden));
        assert_eq!(fields.clone().append("x-secret", "1"), Err(HeaderError::Forbidden));
    }
}
