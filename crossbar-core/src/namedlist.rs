// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Ordered name/value multimap. Parameter order is insertion order and
//! is observable on the wire, so the list never reorders behind the
//! caller's back. Lookups match the first occurrence.

use regex::Regex;

use crate::escape::{sql_escape, str_bool, str_int};

/// One name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedString {
    pub name: String,
    pub value: String,
}

impl NamedString {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        NamedString {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Placeholder substitution failed on an unterminated `${`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unterminated parameter reference at offset {0}")]
pub struct UnterminatedParam(pub usize);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NamedList {
    name: String,
    params: Vec<NamedString>,
}

impl NamedList {
    pub fn new(name: impl Into<String>) -> Self {
        NamedList {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedString> {
        self.params.iter()
    }

    pub fn get(&self, index: usize) -> Option<&NamedString> {
        self.params.get(index)
    }

    /// Append without touching existing occurrences of the name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.push(NamedString::new(name, value));
    }

    /// Replace the first occurrence (or append); with `clear_other`,
    /// drop any further duplicates of the name.
    pub fn set_param(&mut self, name: &str, value: impl Into<String>, clear_other: bool) {
        let value = value.into();
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(p) => p.value = value,
            None => {
                self.params.push(NamedString::new(name, value));
                return;
            }
        }
        if clear_other {
            let mut seen = false;
            self.params.retain(|p| {
                if p.name != name {
                    return true;
                }
                let keep = !seen;
                seen = true;
                keep
            });
        }
    }

    /// Remove every occurrence of `name`; reports whether any existed.
    pub fn clear_param(&mut self, name: &str) -> bool {
        let before = self.params.len();
        self.params.retain(|p| p.name != name);
        before != self.params.len()
    }

    /// Remove every parameter whose name matches `re`.
    pub fn clear_param_matching(&mut self, re: &Regex) -> bool {
        let before = self.params.len();
        self.params.retain(|p| !re.is_match(&p.name));
        before != self.params.len()
    }

    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn get_value<'a>(&'a self, name: &str, def: &'a str) -> &'a str {
        self.get_param(name).unwrap_or(def)
    }

    pub fn get_int_value(&self, name: &str, def: i64) -> i64 {
        self.get_param(name).and_then(str_int).unwrap_or(def)
    }

    pub fn get_int_value_clamped(&self, name: &str, def: i64, min: i64, max: i64) -> i64 {
        self.get_int_value(name, def).clamp(min, max)
    }

    pub fn get_bool_value(&self, name: &str, def: bool) -> bool {
        self.get_param(name).and_then(str_bool).unwrap_or(def)
    }

    pub fn get_double_value(&self, name: &str, def: f64) -> f64 {
        self.get_param(name)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(def)
    }

    /// Copy `name` from `src`; with `child_sep` also copy every
    /// `name<sep>...` subparameter, preserving their order.
    pub fn copy_param(&mut self, src: &NamedList, name: &str, child_sep: Option<char>) {
        self.clear_param(name);
        if let Some(sep) = child_sep {
            let prefix = format!("{name}{sep}");
            self.params.retain(|p| !p.name.starts_with(&prefix));
            for p in &src.params {
                if p.name == name || p.name.starts_with(&prefix) {
                    self.params.push(p.clone());
                }
            }
        } else if let Some(v) = src.get_param(name) {
            self.append(name, v);
        }
    }

    /// Copy every parameter starting with `prefix`, stripping it.
    pub fn copy_sub_params(&mut self, src: &NamedList, prefix: &str) {
        for p in &src.params {
            if let Some(rest) = p.name.strip_prefix(prefix) {
                if !rest.is_empty() {
                    self.append(rest, p.value.clone());
                }
            }
        }
    }

    /// Substitute every `${name}` occurrence in `text` with the current
    /// value (missing names become empty). Nesting is not supported.
    /// Returns the replaced string and the substitution count.
    pub fn replace_params(
        &self,
        text: &str,
        sql: bool,
    ) -> Result<(String, usize), UnterminatedParam> {
        let mut out = String::with_capacity(text.len());
        let mut count = 0usize;
        let mut rest = text;
        let mut offset = 0usize;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(UnterminatedParam(offset + start));
            };
            let name = after[..end].trim();
            let value = self.get_param(name).unwrap_or("");
            if sql {
                out.push_str(&sql_escape(value, None));
            } else {
                out.push_str(value);
            }
            count += 1;
            offset += start + 2 + end + 1;
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok((out, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NamedList {
        let mut l = NamedList::new("test");
        l.append("caller", "alice");
        l.append("called", "bob");
        l.append("caller", "mallory");
        l
    }

    #[test]
    fn first_match_wins() {
        let l = sample();
        assert_eq!(l.get_param("caller"), Some("alice"));
        assert_eq!(l.len(), 3);
    }

    #[test]
    fn set_param_replaces_first_and_clears_duplicates() {
        let mut l = sample();
        l.set_param("caller", "carol", false);
        assert_eq!(l.get_param("caller"), Some("carol"));
        assert_eq!(l.len(), 3);
        l.set_param("caller", "dave", true);
        assert_eq!(l.len(), 2);
        assert_eq!(l.get_param("caller"), Some("dave"));
    }

    #[test]
    fn clear_by_name_and_regex() {
        let mut l = sample();
        assert!(l.clear_param("caller"));
        assert!(!l.clear_param("caller"));
        assert_eq!(l.len(), 1);
        let mut l = sample();
        assert!(l.clear_param_matching(&Regex::new("^call").unwrap()));
        assert!(l.is_empty());
    }

    #[test]
    fn typed_getters_clamp() {
        let mut l = NamedList::new("g");
        l.append("n", "500");
        l.append("b", "yes");
        l.append("junk", "zebra");
        assert_eq!(l.get_int_value("n", 0), 500);
        assert_eq!(l.get_int_value_clamped("n", 0, 0, 100), 100);
        assert_eq!(l.get_int_value("junk", 7), 7);
        assert!(l.get_bool_value("b", false));
        assert!(l.get_bool_value("junk", true));
        assert_eq!(l.get_value("missing", "d"), "d");
    }

    #[test]
    fn replace_params_substitutes() {
        let mut l = NamedList::new("r");
        l.append("user", "alice");
        l.append("dom", "example.org");
        let (s, n) = l.replace_params("sip:${user}@${dom};x=${missing}", false).unwrap();
        assert_eq!(s, "sip:alice@example.org;x=");
        assert_eq!(n, 3);
    }

    #[test]
    fn replace_params_sql_escapes() {
        let mut l = NamedList::new("r");
        l.append("v", "o'hare");
        let (s, _) = l.replace_params("'${v}'", true).unwrap();
        assert_eq!(s, "'o\\'hare'");
    }

    #[test]
    fn replace_params_unterminated() {
        let l = NamedList::new("r");
        assert_eq!(
            l.replace_params("ab${oops", false),
            Err(UnterminatedParam(2))
        );
    }

    #[test]
    fn copy_param_with_children() {
        let mut src = NamedList::new("src");
        src.append("rtp", "yes");
        src.append("rtp.port", "2000");
        src.append("rtp.addr", "10.0.0.1");
        src.append("other", "x");
        let mut dst = NamedList::new("dst");
        dst.copy_param(&src, "rtp", Some('.'));
        assert_eq!(dst.len(), 3);
        assert_eq!(dst.get_param("rtp.port"), Some("2000"));
        let mut sub = NamedList::new("sub");
        sub.copy_sub_params(&src, "rtp.");
        assert_eq!(sub.get_param("port"), Some("2000"));
        assert_eq!(sub.len(), 2);
    }
}
