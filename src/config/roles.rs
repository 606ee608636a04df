//! # Roles file: one role per line, gating task scope.
//!
//! Blank lines and `#` comments are ignored. A line may carry a value
//! (`role = value`); the value is injected into the context as
//! `Task_role_<name>` but is otherwise unused. Declaration order matters:
//! it fixes the precedence of role-layer collisions within one reload.
//!
//! A missing or unreadable roles file inhibits role processing entirely
//! (all tasks are in scope); an existing but empty file scopes in only
//! tasks that declare no roles.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

/// The parsed roles file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleMap {
    order: Vec<String>,
    values: BTreeMap<String, Option<String>>,
}

impl RoleMap {
    /// Parses roles file text.
    pub fn parse(text: &str) -> Self {
        let mut map = RoleMap::default();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, value) = match line.split_once('=') {
                Some((n, v)) => (n.trim().to_string(), Some(v.to_string())),
                None => (line.to_string(), None),
            };
            if name.is_empty() {
                continue;
            }
            if !map.values.contains_key(&name) {
                map.order.push(name.clone());
            }
            map.values.insert(name, value);
        }
        map
    }

    /// Reads and parses the roles file. `None` means role processing is
    /// inhibited (no file, or unreadable).
    pub fn load(path: &Path) -> Option<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Some(Self::parse(&text)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "open failed on roles file");
                None
            }
        }
    }

    pub fn contains(&self, role: &str) -> bool {
        self.values.contains_key(role)
    }

    /// Active role names in declaration order.
    pub fn active(&self) -> &[String] {
        &self.order
    }

    /// Roles that carry a value.
    pub fn valued(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().filter_map(|name| {
            self.values
                .get(name)
                .and_then(|v| v.as_deref())
                .map(|v| (name.as_str(), v))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_comments_and_values() {
        let map = RoleMap::parse("frontend\n\n# comment\n  backend = db:5432\n");
        assert!(map.contains("frontend"));
        assert!(map.contains("backend"));
        assert!(!map.contains("comment"));
        assert_eq!(map.active(), ["frontend", "backend"]);
        let valued: Vec<_> = map.valued().collect();
        assert_eq!(valued, vec![("backend", " db:5432")]);
    }

    #[test]
    fn empty_value_is_kept_as_empty_string() {
        let map = RoleMap::parse("edge =\n");
        let valued: Vec<_> = map.valued().collect();
        assert_eq!(valued, vec![("edge", "")]);
    }

    #[test]
    fn duplicate_declaration_keeps_first_position() {
        let map = RoleMap::parse("a\nb\na = 1\n");
        assert_eq!(map.active(), ["a", "b"]);
        assert_eq!(map.valued().collect::<Vec<_>>(), vec![("a", " 1")]);
    }
}
