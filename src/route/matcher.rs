use http::Uri;
use regex::Regex;
use std::{fmt, sync::Arc};
use tracing::warn;

type UrlPredicate = Arc<dyn Fn(&Uri) -> bool + Send + Sync>;

#[derive(Clone)]
enum Inner {
    Glob { pattern: String, regex: Regex },
    Regex(Regex),
    Predicate(UrlPredicate),
}

/// Selects the URLs a route handler or waiter applies to.
///
/// Glob patterns follow the usual URL glob rules: `*` matches any characters except `/`, `**`
/// matches across path segments, `?` matches one character, `{a,b}` matches either alternative
/// and `[...]` matches a character class. The empty glob matches every URL.
///
/// # Examples
///
/// ```rust
/// use interpose::UrlMatcher;
///
/// let matcher = UrlMatcher::from("**/api/*.json");
/// assert!(matcher.matches_str("https://example.com/v1/api/users.json"));
/// assert!(!matcher.matches_str("https://example.com/api/v1/users.json"));
/// ```
#[derive(Clone)]
pub struct UrlMatcher(Inner);

impl UrlMatcher {
    pub fn glob(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let regex = match Regex::new(&glob_to_regex(&pattern)) {
            Ok(regex) => regex,
            Err(err) => {
                warn!(%pattern, "Invalid glob, matching it literally: {}", err);
                Regex::new(&format!("^{}$", regex::escape(&pattern)))
                    .expect("Failed to build literal pattern")
            }
        };
        Self(Inner::Glob { pattern, regex })
    }

    pub fn predicate(predicate: impl Fn(&Uri) -> bool + Send + Sync + 'static) -> Self {
        Self(Inner::Predicate(Arc::new(predicate)))
    }

    pub fn matches(&self, url: &Uri) -> bool {
        match &self.0 {
            Inner::Predicate(predicate) => predicate(url),
            _ => self.matches_str(&url.to_string()),
        }
    }

    pub fn matches_str(&self, url: &str) -> bool {
        match &self.0 {
            Inner::Glob { pattern, .. } if pattern.is_empty() => true,
            Inner::Glob { regex, .. } | Inner::Regex(regex) => regex.is_match(url),
            Inner::Predicate(predicate) => url.parse().is_ok_and(|url| predicate(&url)),
        }
    }
}

impl PartialEq for UrlMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Inner::Glob { pattern: a, .. }, Inner::Glob { pattern: b, .. }) => a == b,
            (Inner::Regex(a), Inner::Regex(b)) => a.as_str() == b.as_str(),
            (Inner::Predicate(a), Inner::Predicate(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for UrlMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Inner::Glob { pattern, .. } => f.debug_tuple("Glob").field(pattern).finish(),
            Inner::Regex(regex) => f.debug_tuple("Regex").field(&regex.as_str()).finish(),
            Inner::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl From<&str> for UrlMatcher {
    fn from(pattern: &str) -> Self {
        Self::glob(pattern)
    }
}

impl From<String> for UrlMatcher {
    fn from(pattern: String) -> Self {
        Self::glob(pattern)
    }
}

impl From<&String> for UrlMatcher {
    fn from(pattern: &String) -> Self {
        Self::glob(pattern.as_str())
    }
}

impl From<Regex> for UrlMatcher {
    fn from(regex: Regex) -> Self {
        Self(Inner::Regex(regex))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut in_group = false;
    let mut in_class = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_class {
            if c == ']' {
                in_class = false;
            }
            if c == '\\' {
                out.push('\\');
            }
            out.push(c);
            i += 1;
            continue;
        }

        match c {
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&regex::escape(&chars[i].to_string()));
            }
            '*' => {
                let before = i.checked_sub(1).map(|j| chars[j]);
                let mut stars = 1;
                while chars.get(i + 1) == Some(&'*') {
                    stars += 1;
                    i += 1;
                }
                let after = chars.get(i + 1).copied();

                let deep = stars > 1
                    && matches!(before, None | Some('/'))
                    && matches!(after, None | Some('/'));
                if deep {
                    out.push_str("((?:[^/]*(?:/|$))*)");
                    // The separator is part of the segment pattern.
                    i += 1;
                } else if stars > 1 {
                    out.push_str("(.*)");
                } else {
                    out.push_str("([^/]*)");
                }
            }
            '?' => out.push('.'),
            '[' if chars[i + 1..].contains(&']') => {
                in_class = true;
                out.push('[');
            }
            '{' => {
                in_group = true;
                out.push('(');
            }
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }

        i += 1;
    }

    out.push('$');
    out
}
