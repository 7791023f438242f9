use crate::Error;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// A single header as it appeared on the wire.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An order-preserving header multimap with case-insensitive lookups.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all values for `name` joined the way browsers expose them: `set-cookie` values are
    /// separated by newlines, everything else by `", "`.
    pub fn get(&self, name: &str) -> Option<String> {
        let values = self.get_all(name);
        if values.is_empty() {
            return None;
        }

        let separator = if name.eq_ignore_ascii_case("set-cookie") {
            "\n"
        } else {
            ", "
        };
        Some(values.join(separator))
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0
            .iter()
            .any(|header| header.name.eq_ignore_ascii_case(name))
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Replaces every value of `name` with `value`. The header keeps the position of its first
    /// occurrence; a header that was not present is appended.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .0
            .iter()
            .position(|header| header.name.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.0[first].value = value;
                let mut index = 0;
                self.0.retain(|header| {
                    let keep = index <= first || !header.name.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Header] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lower-cased names mapped to their joined values.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for header in &self.0 {
            let name = header.name.to_ascii_lowercase();
            if !map.contains_key(&name) {
                if let Some(value) = self.get(&name) {
                    map.insert(name, value);
                }
            }
        }
        map
    }

    /// Bytes taken by the header lines on the wire: `name: value\r\n` for each header.
    pub(crate) fn wire_len(&self) -> usize {
        self.0
            .iter()
            .map(|header| header.name.len() + header.value.len() + 4)
            .sum()
    }

    pub(crate) fn to_header_map(&self) -> Result<HeaderMap, Error> {
        let mut map = HeaderMap::with_capacity(self.0.len());
        for header in &self.0 {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| Error::InvalidHeader(header.name.clone()))?;
            let value = HeaderValue::from_str(&header.value)
                .map_err(|_| Error::InvalidHeader(format!("{}: {}", header.name, header.value)))?;
            map.append(name, value);
        }
        Ok(map)
    }
}

/// Names come out lower-cased and grouped: each name sits at its first occurrence with all of its
/// values, in the order they were received.
impl From<&HeaderMap> for Headers {
    fn from(map: &HeaderMap) -> Self {
        map.iter()
            .map(|(name, value)| {
                Header::new(
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect()
    }
}

impl FromIterator<Header> for Headers {
    fn from_iter<T: IntoIterator<Item = Header>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| Header::new(name, value))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Length of `METHOD SP target SP HTTP/1.1 CRLF`, the header lines and the terminating CRLF.
pub(crate) fn request_head_len(method: &str, target: &str, headers: &Headers) -> usize {
    method.len() + 1 + target.len() + 1 + "HTTP/1.1".len() + 2 + headers.wire_len() + 2
}

/// Length of `HTTP/1.1 SP status SP reason CRLF`, the header lines and the terminating CRLF.
pub(crate) fn response_head_len(reason: &str, headers: &Headers) -> usize {
    "HTTP/1.1".len() + 1 + 3 + 1 + reason.len() + 2 + headers.wire_len() + 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Headers {
        [
            ("Accept", "*/*"),
            ("X-Multi", "a"),
            ("Set-Cookie", "a=1"),
            ("x-multi", "b"),
            ("Set-Cookie", "b=2"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn lookups_ignore_case() {
        let headers = sample();

        assert_eq!(headers.get("accept").as_deref(), Some("*/*"));
        assert_eq!(headers.get("X-MULTI").as_deref(), Some("a, b"));
        assert_eq!(headers.get("set-cookie").as_deref(), Some("a=1\nb=2"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn set_keeps_first_position() {
        let mut headers = sample();
        headers.set("x-multi", "c");

        let names: Vec<_> = headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["Accept", "X-Multi", "Set-Cookie", "Set-Cookie"]);
        assert_eq!(headers.get("x-multi").as_deref(), Some("c"));
    }

    #[test]
    fn set_appends_missing_header() {
        let mut headers = sample();
        headers.set("x-new", "1");

        assert_eq!(headers.as_slice().last(), Some(&Header::new("x-new", "1")));
    }

    #[test]
    fn header_map_values_group_under_first_occurrence() {
        let mut map = HeaderMap::new();
        map.append("X-A", HeaderValue::from_static("1"));
        map.append("X-B", HeaderValue::from_static("2"));
        map.append("X-A", HeaderValue::from_static("3"));

        let lines: Vec<_> = Headers::from(&map)
            .iter()
            .map(|h| format!("{}: {}", h.name, h.value))
            .collect();
        assert_eq!(lines, ["x-a: 1", "x-a: 3", "x-b: 2"]);
    }

    #[test]
    fn to_map_lowercases_names() {
        let map = sample().to_map();

        assert_eq!(map.get("x-multi").map(String::as_str), Some("a, b"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn head_lengths_follow_wire_format() {
        let headers: Headers = [("host", "example.com")].into_iter().collect();

        // "GET / HTTP/1.1\r\n" + "host: example.com\r\n" + "\r\n"
        assert_eq!(request_head_len("GET", "/", &headers), 16 + 19 + 2);
        // "HTTP/1.1 204 No Content\r\n" + "\r\n"
        assert_eq!(response_head_len("No Content", &Headers::new()), 25 + 2);
    }
}
