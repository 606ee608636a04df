//! # Context: the merged key/value environment behind every process.
//!
//! A [`Context`] is an ordered string→string mapping assembled in layers
//! (environment snapshot, `defaults`, role defaults, `defines`, role
//! defines, per-slot `Task_*` injections) and then used two ways: as the
//! substitution source for `{tag}` templates in the configuration, and as
//! the literal environment of the spawned child.
//!
//! ## Layer rules
//! - `defines` layers **override** existing values.
//! - `defaults` layers apply **only if the key is absent**.
//! - Role layers are applied in role declaration order; for a key set by
//!   two active roles at the same layer, the later role wins. This is
//!   deterministic within one reload.
//!
//! ## Substitution
//! `{identifier}` occurrences are replaced from the context, repeatedly,
//! until a fixpoint is reached or the round limit trips. When a tag is
//! missing, the partial result from the last successful round is retained
//! and a warning is logged; one missing key must not cascade into a task
//! failure. Substitution is idempotent on a fully-resolved string.
//!
//! ## Conditional list expansion
//! Inside an argv template an element may be a single-entry (or
//! multi-entry) mapping `{KEY: V}`: if `KEY` is present in the context,
//! `V` is spliced in place, recursively; otherwise the element is elided.
//! Presence alone is tested; the value of `KEY` is not interpreted.

use std::collections::BTreeMap;

use tracing::warn;

use crate::config::ConfValue;

/// Keys injected by the supervisor carry this prefix to isolate the
/// namespace from the inherited environment.
pub const CONTEXT_PREFIX: &str = "Task_";

/// Substitution gives up after this many rounds to stop direct or
/// indirect self-reference from looping.
const MAX_SUBST_ROUNDS: usize = 10;

/// Ordered string mapping with the layering rules above.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Context {
    map: BTreeMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the process environment with any `Task_*` keys from a
    /// parent supervisor stripped.
    pub fn from_env() -> Self {
        let mut map = BTreeMap::new();
        for (k, v) in std::env::vars() {
            if !k.starts_with(CONTEXT_PREFIX) {
                map.insert(k, v);
            }
        }
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Unconditional set (a `defines`-style write).
    pub fn define(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Set only when the key is absent (a `defaults`-style write).
    pub fn put_default(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Applies a `defines` map followed by the `role_defines` of each
    /// active role, in the declaration order of `active_roles`.
    pub fn apply_defines(
        &mut self,
        defines: &BTreeMap<String, String>,
        role_defines: &BTreeMap<String, BTreeMap<String, String>>,
        active_roles: &[String],
    ) {
        for (k, v) in defines {
            self.define(k.clone(), v.clone());
        }
        for role in active_roles {
            if let Some(map) = role_defines.get(role) {
                for (k, v) in map {
                    self.define(k.clone(), v.clone());
                }
            }
        }
    }

    /// Applies a `defaults` map followed by the `role_defaults` of each
    /// active role; keys already present are left untouched.
    pub fn apply_defaults(
        &mut self,
        defaults: &BTreeMap<String, String>,
        role_defaults: &BTreeMap<String, BTreeMap<String, String>>,
        active_roles: &[String],
    ) {
        for (k, v) in defaults {
            self.put_default(k.clone(), v.clone());
        }
        for role in active_roles {
            if let Some(map) = role_defaults.get(role) {
                for (k, v) in map {
                    self.put_default(k.clone(), v.clone());
                }
            }
        }
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Substitutes `{tag}` occurrences to a fixpoint.
    ///
    /// On a missing tag the partial result of the last successful round is
    /// returned and a warning logged.
    pub fn subst(&self, template: &str) -> String {
        let mut current = template.to_string();
        for _ in 0..MAX_SUBST_ROUNDS {
            match self.subst_round(&current) {
                Ok(next) => {
                    if next == current {
                        return current;
                    }
                    current = next;
                }
                Err(missing) => {
                    warn!(
                        tag = %missing,
                        template,
                        "substitution tag not in context, keeping partial result"
                    );
                    return current;
                }
            }
        }
        current
    }

    /// One all-or-nothing replacement pass. `Err` carries the first
    /// missing tag.
    fn subst_round(&self, input: &str) -> Result<String, String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let tag = &after[..close];
                    if !tag.is_empty()
                        && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        match self.map.get(tag) {
                            Some(val) => out.push_str(val),
                            None => return Err(tag.to_string()),
                        }
                    } else {
                        // Not a tag; emit the braces literally.
                        out.push('{');
                        out.push_str(tag);
                        out.push('}');
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Expands a configuration value into a flat list of raw strings,
    /// eliding conditional entries whose key is absent from the context.
    pub fn expand_list(&self, value: &ConfValue) -> Vec<String> {
        let mut out = Vec::new();
        self.expand_into(value, &mut out);
        out
    }

    fn expand_into(&self, value: &ConfValue, out: &mut Vec<String>) {
        match value {
            ConfValue::Str(s) => out.push(s.clone()),
            ConfValue::Int(n) => out.push(n.to_string()),
            ConfValue::Float(n) => out.push(n.to_string()),
            ConfValue::Bool(b) => out.push(b.to_string()),
            ConfValue::List(items) => {
                for item in items {
                    self.expand_into(item, out);
                }
            }
            ConfValue::Cond(map) => {
                for (key, v) in map {
                    if self.contains(key) {
                        self.expand_into(v, out);
                    }
                }
            }
        }
    }

    /// Expands a value and substitutes each element.
    pub fn resolve_list(&self, value: &ConfValue) -> Vec<String> {
        self.expand_list(value)
            .iter()
            .map(|s| self.subst(s))
            .collect()
    }

    /// The child environment: every entry, values substituted.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), self.subst(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> Context {
        let mut c = Context::new();
        for (k, v) in pairs {
            c.define(*k, *v);
        }
        c
    }

    #[test]
    fn subst_simple_and_idempotent() {
        let c = ctx(&[("name", "sshd"), ("dir", "/run")]);
        let once = c.subst("{dir}/{name}.pid");
        assert_eq!(once, "/run/sshd.pid");
        // Idempotent on a fully-resolved string.
        assert_eq!(c.subst(&once), once);
    }

    #[test]
    fn subst_is_recursive_to_fixpoint() {
        let c = ctx(&[("a", "{b}/x"), ("b", "/top")]);
        assert_eq!(c.subst("{a}"), "/top/x");
    }

    #[test]
    fn subst_missing_tag_keeps_partial() {
        let c = ctx(&[("known", "ok")]);
        // First round fails: the partial result is the input itself.
        assert_eq!(c.subst("{known}-{unknown}"), "{known}-{unknown}");
        // A later round failing keeps the last successful expansion.
        let c2 = ctx(&[("a", "{missing}")]);
        assert_eq!(c2.subst("{a}"), "{missing}");
    }

    #[test]
    fn subst_self_reference_terminates() {
        let c = ctx(&[("loop", "{loop}x")]);
        let out = c.subst("{loop}");
        assert!(out.ends_with('x'));
    }

    #[test]
    fn subst_leaves_non_tags_alone() {
        let c = ctx(&[("a", "1")]);
        assert_eq!(c.subst("json: {\"k\": 1} and {a}"), "json: {\"k\": 1} and 1");
        assert_eq!(c.subst("dangling {brace"), "dangling {brace");
    }

    #[test]
    fn defaults_only_fill_absent_keys() {
        let mut c = ctx(&[("have", "orig")]);
        let mut defaults = BTreeMap::new();
        defaults.insert("have".to_string(), "new".to_string());
        defaults.insert("missing".to_string(), "filled".to_string());
        c.apply_defaults(&defaults, &BTreeMap::new(), &[]);
        assert_eq!(c.get("have"), Some("orig"));
        assert_eq!(c.get("missing"), Some("filled"));
    }

    #[test]
    fn role_defines_apply_in_declaration_order() {
        let mut c = Context::new();
        let mut role_defines = BTreeMap::new();
        let mut frontend = BTreeMap::new();
        frontend.insert("PORT".to_string(), "80".to_string());
        let mut backend = BTreeMap::new();
        backend.insert("PORT".to_string(), "5432".to_string());
        role_defines.insert("frontend".to_string(), frontend);
        role_defines.insert("backend".to_string(), backend);

        let roles = vec!["frontend".to_string(), "backend".to_string()];
        c.apply_defines(&BTreeMap::new(), &role_defines, &roles);
        // Later active role wins at the same layer.
        assert_eq!(c.get("PORT"), Some("5432"));

        let mut c2 = Context::new();
        let roles_rev = vec!["backend".to_string(), "frontend".to_string()];
        c2.apply_defines(&BTreeMap::new(), &role_defines, &roles_rev);
        assert_eq!(c2.get("PORT"), Some("80"));
    }

    #[test]
    fn conditional_expansion_tests_presence_only() {
        let c = ctx(&[("VERBOSE", "false")]);
        let mut cond = BTreeMap::new();
        cond.insert("VERBOSE".to_string(), ConfValue::Str("-v".to_string()));
        let argv = ConfValue::List(vec![
            ConfValue::Str("daemon".to_string()),
            ConfValue::Cond(cond),
        ]);
        // "false" still counts as present.
        assert_eq!(c.expand_list(&argv), vec!["daemon", "-v"]);

        let empty = Context::new();
        assert_eq!(empty.expand_list(&argv), vec!["daemon"]);
    }

    #[test]
    fn conditional_expansion_recurses() {
        let mut inner = BTreeMap::new();
        inner.insert(
            "DEBUG".to_string(),
            ConfValue::List(vec![
                ConfValue::Str("-d".to_string()),
                ConfValue::Str("{level}".to_string()),
            ]),
        );
        let mut outer = BTreeMap::new();
        outer.insert("TRACE".to_string(), ConfValue::Cond(inner));
        let argv = ConfValue::List(vec![
            ConfValue::Str("prog".to_string()),
            ConfValue::Cond(outer),
        ]);

        let c = ctx(&[("TRACE", "1"), ("DEBUG", "1"), ("level", "9")]);
        assert_eq!(c.resolve_list(&argv), vec!["prog", "-d", "9"]);

        let partial = ctx(&[("TRACE", "1")]);
        assert_eq!(partial.resolve_list(&argv), vec!["prog"]);
    }

    #[test]
    fn numbers_expand_to_strings() {
        let c = Context::new();
        let argv = ConfValue::List(vec![
            ConfValue::Str("nice".to_string()),
            ConfValue::Int(-5),
        ]);
        assert_eq!(c.expand_list(&argv), vec!["nice", "-5"]);
    }
}
