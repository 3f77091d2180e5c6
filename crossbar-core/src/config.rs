// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory configuration: an ordered collection of named sections,
//! each an ordered name/value list. Loading from disk is a collaborator
//! concern; this type only holds and queries the values.

use crate::namedlist::NamedList;

#[derive(Debug, Default, Clone)]
pub struct Configuration {
    sections: Vec<NamedList>,
}

impl Configuration {
    pub fn new() -> Self {
        Configuration::default()
    }

    pub fn sections(&self) -> impl Iterator<Item = &NamedList> {
        self.sections.iter()
    }

    pub fn section(&self, name: &str) -> Option<&NamedList> {
        self.sections.iter().find(|s| s.name() == name)
    }

    /// Get or create a section, keeping creation order.
    pub fn create_section(&mut self, name: &str) -> &mut NamedList {
        if let Some(idx) = self.sections.iter().position(|s| s.name() == name) {
            return &mut self.sections[idx];
        }
        self.sections.push(NamedList::new(name));
        #[allow(clippy::unwrap_used)]
        self.sections.last_mut().unwrap()
    }

    pub fn get_value<'a>(&'a self, sect: &str, key: &str, def: &'a str) -> &'a str {
        self.section(sect)
            .and_then(|s| s.get_param(key))
            .unwrap_or(def)
    }

    pub fn get_int_value(&self, sect: &str, key: &str, def: i64) -> i64 {
        self.section(sect)
            .map(|s| s.get_int_value(key, def))
            .unwrap_or(def)
    }

    pub fn get_int_value_clamped(&self, sect: &str, key: &str, def: i64, min: i64, max: i64) -> i64 {
        self.get_int_value(sect, key, def).clamp(min, max)
    }

    pub fn get_bool_value(&self, sect: &str, key: &str, def: bool) -> bool {
        self.section(sect)
            .map(|s| s.get_bool_value(key, def))
            .unwrap_or(def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_keep_order_and_values() {
        let mut cfg = Configuration::new();
        cfg.create_section("general").append("timeout", "2500");
        cfg.create_section("listener sock").append("type", "unix");
        cfg.create_section("general").append("timebomb", "yes");

        let names: Vec<_> = cfg.sections().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["general", "listener sock"]);
        assert_eq!(cfg.get_int_value("general", "timeout", 10000), 2500);
        assert!(cfg.get_bool_value("general", "timebomb", false));
        assert_eq!(cfg.get_int_value_clamped("general", "timeout", 0, 0, 1000), 1000);
        assert_eq!(cfg.get_value("missing", "k", "d"), "d");
    }
}
