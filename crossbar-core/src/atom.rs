// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-global interned strings. Interning a name returns a stable
//! `&'static str`, so later equality checks can compare pointers. The
//! table only ever grows; it is bounded by the set of distinct names the
//! process uses.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

static ATOMS: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();

/// Intern `text`, returning the canonical instance.
pub fn atom(text: &str) -> &'static str {
    let table = ATOMS.get_or_init(|| Mutex::new(HashSet::new()));
    let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(found) = table.get(text) {
        return found;
    }
    let leaked: &'static str = Box::leak(text.to_owned().into_boxed_str());
    table.insert(leaked);
    leaked
}

/// Pointer equality of two interned strings.
pub fn same(a: &'static str, b: &'static str) -> bool {
    std::ptr::eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = atom("engine.timer");
        let b = atom("engine.timer");
        let c = atom("call.route");
        assert!(same(a, b));
        assert!(!same(a, c));
        assert_eq!(a, "engine.timer");
    }
}
