//! Shell-style glob matching and the span predicate built on top of it.
//!
//! Hand-rolled rather than pulled in from a crate: case-sensitive glob
//! matching over short strings doesn't need one, and a small struct plus a
//! couple of free functions keeps this dependency-free.

use std::collections::HashMap;

/// Matches `text` against a shell-style glob pattern where `*` matches any
/// run of characters (including none) and `?` matches exactly one character.
/// All other characters match literally. Case-sensitive.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    backtrack(&p, 0, &t, 0)
}

fn backtrack(p: &[char], pi: usize, t: &[char], ti: usize) -> bool {
    if pi == p.len() {
        return ti == t.len();
    }
    match p[pi] {
        '*' => {
            // Try matching zero characters, then progressively more.
            for skip in 0..=(t.len() - ti) {
                if backtrack(p, pi + 1, t, ti + skip) {
                    return true;
                }
            }
            false
        }
        '?' => ti < t.len() && backtrack(p, pi + 1, t, ti + 1),
        c => ti < t.len() && t[ti] == c && backtrack(p, pi + 1, t, ti + 1),
    }
}

/// A single glob pattern, pre-parsed so repeated matches don't re-split the
/// string. An empty pattern is equivalent to `*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Glob(String);

impl Glob {
    pub fn new<S: Into<String>>(pattern: S) -> Self {
        let pattern = pattern.into();
        Glob(if pattern.is_empty() {
            "*".to_string()
        } else {
            pattern
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        glob_match(&self.0, text)
    }

    pub fn pattern(&self) -> &str {
        &self.0
    }
}

/// Conjunctive predicate over span fields, used by sampling rules. Any
/// field left unset matches everything (equivalent to an empty/`*` glob).
#[derive(Clone, Debug, Default)]
pub struct SpanMatcher {
    service: Option<Glob>,
    name: Option<Glob>,
    resource: Option<Glob>,
    tags: Vec<(Glob, Glob)>,
}

impl SpanMatcher {
    pub fn new() -> Self {
        SpanMatcher::default()
    }

    pub fn with_service<S: Into<String>>(mut self, pattern: S) -> Self {
        self.service = Some(Glob::new(pattern));
        self
    }

    pub fn with_name<S: Into<String>>(mut self, pattern: S) -> Self {
        self.name = Some(Glob::new(pattern));
        self
    }

    pub fn with_resource<S: Into<String>>(mut self, pattern: S) -> Self {
        self.resource = Some(Glob::new(pattern));
        self
    }

    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value_pattern: V) -> Self {
        self.tags.push((Glob::new(key), Glob::new(value_pattern)));
        self
    }

    /// Evaluates the matcher against the given field values. Every
    /// configured field must match (conjunctive); tag patterns match if any
    /// tag key matching the key-glob has a value matching the value-glob.
    pub fn matches(&self, service: &str, name: &str, resource: &str, tags: &HashMap<String, String>) -> bool {
        if let Some(g) = &self.service {
            if !g.matches(service) {
                return false;
            }
        }
        if let Some(g) = &self.name {
            if !g.matches(name) {
                return false;
            }
        }
        if let Some(g) = &self.resource {
            if !g.matches(resource) {
                return false;
            }
        }
        for (key_glob, value_glob) in &self.tags {
            let found = tags
                .iter()
                .any(|(k, v)| key_glob.matches(k) && value_glob.matches(v));
            if !found {
                return false;
            }
        }
        true
    }
}
