//! # ModuleWatcher: watch the import closure of managed scripts.
//!
//! Given a script path and an ordered module search path, computes the
//! set of source files the script statically imports (transitive
//! closure) and registers them with an owned [`FileWatcher`]. System
//! library locations are excluded by construction: only files found under
//! the configured search path are followed.
//!
//! The analyzer is a line scanner, not an interpreter: it recognizes
//! `import a.b [as x]`, `import a, b`, and `from a.b import c` at any
//! indentation, resolving `a` to `a.py` or `a/__init__.py` (and `a.b` to
//! `a/b.py`) under each search-path directory. A script that cannot be
//! read as UTF-8 text, or whose extension/shebang does not identify
//! Python, yields [`WatchError::NotPython`] — distinguishable from I/O
//! errors so `python` events can be rejected at config-load time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::WatchError;
use crate::poller::Stimulus;

use super::files::{FileWatcher, WakeKind, WatchMode, WatchOptions};

/// A change report: the registered name, its script, and the changed
/// source files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleChange {
    pub name: String,
    pub script: PathBuf,
    pub paths: Vec<PathBuf>,
}

/// Watches registered scripts and their import closures.
pub struct ModuleWatcher {
    watcher: FileWatcher,
    search_path: Vec<PathBuf>,
    /// Registered name → script path.
    names: BTreeMap<String, PathBuf>,
    /// Inverted index: source file → names that depend on it.
    modules: BTreeMap<PathBuf, Vec<String>>,
}

impl ModuleWatcher {
    /// `search_path` is the ordered module search path; empty means only
    /// the scripts themselves are watched.
    pub fn new(
        wake: mpsc::UnboundedSender<Stimulus>,
        search_path: Vec<PathBuf>,
        opts: WatchOptions,
    ) -> Self {
        Self {
            watcher: FileWatcher::new(wake, WakeKind::Module, opts),
            search_path,
            names: BTreeMap::new(),
            modules: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> WatchMode {
        self.watcher.mode()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Checks that a script is analyzable without registering anything.
    pub fn probe(script: &Path) -> Result<(), WatchError> {
        read_python(script).map(|_| ())
    }

    /// Registers `name` with the closure of `script`. Re-adding a name
    /// replaces its previous registration.
    pub fn add(&mut self, name: &str, script: &Path) -> Result<(), WatchError> {
        let closure = self.closure_of(script)?;
        if self.names.contains_key(name) {
            self.remove(name)?;
        }
        self.names.insert(name.to_string(), script.to_path_buf());
        for path in closure {
            let entry = self.modules.entry(path.clone()).or_default();
            if !entry.iter().any(|n| n == name) {
                entry.push(name.to_string());
            }
            if entry.len() == 1 {
                self.watcher.add([path], true)?;
            }
        }
        Ok(())
    }

    /// Deregisters `name`, releasing source files nothing else needs.
    pub fn remove(&mut self, name: &str) -> Result<(), WatchError> {
        if self.names.remove(name).is_none() {
            return Err(WatchError::CommandNotFound {
                command: name.to_string(),
            });
        }
        let mut orphaned = Vec::new();
        self.modules.retain(|path, users| {
            users.retain(|n| n != name);
            if users.is_empty() {
                orphaned.push(path.clone());
                false
            } else {
                true
            }
        });
        for path in orphaned {
            let _ = self.watcher.remove([path]);
        }
        Ok(())
    }

    /// Recomputes every registered closure; call after a script itself
    /// changes so newly imported modules get watched.
    pub fn rescan(&mut self) -> Result<(), WatchError> {
        let names: Vec<(String, PathBuf)> = self
            .names
            .iter()
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect();
        for (name, script) in names {
            self.add(&name, &script)?;
        }
        Ok(())
    }

    /// Polling sweep / pending-appearance promotion, forwarded to the
    /// owned watcher.
    pub fn scan(&mut self) {
        self.watcher.scan();
    }

    /// Consumes pending changes and de-inverts them into per-name
    /// reports, name order.
    pub async fn drain(&mut self) -> Vec<ModuleChange> {
        let changed = self.watcher.drain().await;
        let mut by_name: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in changed {
            match self.modules.get(&path) {
                Some(users) => {
                    for name in users {
                        by_name.entry(name.clone()).or_default().push(path.clone());
                    }
                }
                None => debug!(path = %path.display(), "change on unindexed path ignored"),
            }
        }
        by_name
            .into_iter()
            .filter_map(|(name, paths)| {
                self.names.get(&name).map(|script| ModuleChange {
                    name,
                    script: script.clone(),
                    paths,
                })
            })
            .collect()
    }

    /// The transitive import closure of `script`, script included.
    fn closure_of(&self, script: &Path) -> Result<BTreeSet<PathBuf>, WatchError> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        let script = script
            .canonicalize()
            .map_err(|e| WatchError::Watch {
                path: script.to_path_buf(),
                reason: e.to_string(),
            })?;
        let text = read_python(&script)?;
        seen.insert(script.clone());
        for module in imports_in(&text) {
            for path in self.resolve(&module) {
                if seen.insert(path.clone()) {
                    queue.push_back(path);
                }
            }
        }
        while let Some(path) = queue.pop_front() {
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            for module in imports_in(&text) {
                for resolved in self.resolve(&module) {
                    if seen.insert(resolved.clone()) {
                        queue.push_back(resolved);
                    }
                }
            }
        }
        Ok(seen)
    }

    /// Resolves a dotted module name against the search path. Each
    /// package level contributes its `__init__.py` so package changes are
    /// seen too.
    fn resolve(&self, module: &str) -> Vec<PathBuf> {
        let parts: Vec<&str> = module.split('.').collect();
        for dir in &self.search_path {
            let mut found = Vec::new();
            let mut base = dir.clone();
            for (i, part) in parts.iter().enumerate() {
                let leaf = i == parts.len() - 1;
                let as_file = base.join(format!("{part}.py"));
                let as_pkg = base.join(part).join("__init__.py");
                if leaf && as_file.is_file() {
                    found.push(as_file);
                    return found;
                }
                if as_pkg.is_file() {
                    found.push(as_pkg);
                    base = base.join(part);
                    if leaf {
                        return found;
                    }
                } else {
                    break;
                }
            }
        }
        Vec::new()
    }
}

/// Reads a script, insisting it look like Python.
fn read_python(path: &Path) -> Result<String, WatchError> {
    let text = std::fs::read_to_string(path).map_err(|_| WatchError::NotPython {
        path: path.to_path_buf(),
    })?;
    let by_extension = path.extension().is_some_and(|e| e == "py");
    let by_shebang = text
        .lines()
        .next()
        .is_some_and(|l| l.starts_with("#!") && l.contains("python"));
    if by_extension || by_shebang {
        Ok(text)
    } else {
        Err(WatchError::NotPython {
            path: path.to_path_buf(),
        })
    }
}

/// Extracts statically imported module names from source text.
fn imports_in(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let line = raw.trim_start();
        if let Some(rest) = line.strip_prefix("import ") {
            for item in rest.split(',') {
                let name = item.split_whitespace().next().unwrap_or("");
                if is_module_name(name) {
                    out.push(name.to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            if let Some(module) = rest.split_whitespace().next() {
                if is_module_name(module) {
                    out.push(module.to_string());
                }
            }
        }
    }
    out
}

fn is_module_name(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn options() -> WatchOptions {
        WatchOptions {
            polling: true,
            timeout: std::time::Duration::ZERO,
            limit: None,
        }
    }

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn imports_are_extracted() {
        let text = "#!/usr/bin/env python\nimport os, mylib\nfrom pkg.sub import thing\n    import indented_mod\nx = 1\n";
        let got = imports_in(text);
        assert_eq!(got, vec!["os", "mylib", "pkg.sub", "indented_mod"]);
    }

    #[test]
    fn probe_distinguishes_not_python() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tool.py");
        write(&script, "import os\n");
        assert!(ModuleWatcher::probe(&script).is_ok());

        let sh = dir.path().join("tool.sh");
        write(&sh, "#!/bin/sh\necho hi\n");
        assert!(matches!(
            ModuleWatcher::probe(&sh),
            Err(WatchError::NotPython { .. })
        ));

        let shebang = dir.path().join("tool");
        write(&shebang, "#!/usr/bin/python3\nimport os\n");
        assert!(ModuleWatcher::probe(&shebang).is_ok());
    }

    #[tokio::test]
    async fn closure_follows_local_imports_only() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        let script = dir.path().join("main.py");
        write(&script, "import helper\nimport os\n");
        write(&lib.join("helper.py"), "from pkg import deep\n");
        write(&lib.join("pkg/__init__.py"), "");
        write(&lib.join("pkg/deep.py"), "x = 1\n");

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mw = ModuleWatcher::new(tx, vec![lib.clone()], options());
        mw.add("main", &script).unwrap();

        // script + helper.py + pkg/__init__.py + pkg/deep.py; os is not
        // on the search path and is excluded.
        assert_eq!(mw.watcher.len(), 4);

        // A change to a deep module maps back to the registered name.
        write(&lib.join("pkg/deep.py"), "x = 2\n");
        mw.scan();
        let changes = mw.drain().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "main");
        assert!(changes[0]
            .paths
            .iter()
            .any(|p| p.ends_with("pkg/deep.py")));
    }

    #[tokio::test]
    async fn remove_releases_unshared_modules() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        let a = dir.path().join("a.py");
        let b = dir.path().join("b.py");
        write(&a, "import shared\nimport only_a\n");
        write(&b, "import shared\n");
        write(&lib.join("shared.py"), "");
        write(&lib.join("only_a.py"), "");

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mw = ModuleWatcher::new(tx, vec![lib], options());
        mw.add("a", &a).unwrap();
        mw.add("b", &b).unwrap();
        let before = mw.watcher.len();

        mw.remove("a").unwrap();
        // a.py and only_a.py released; shared.py retained for b.
        assert_eq!(mw.watcher.len(), before - 2);
        assert!(mw.is_registered("b"));
        assert!(!mw.is_registered("a"));
    }

    #[tokio::test]
    async fn rescan_picks_up_new_imports() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        let script = dir.path().join("main.py");
        write(&script, "x = 1\n");
        write(&lib.join("late.py"), "");

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mw = ModuleWatcher::new(tx, vec![lib], options());
        mw.add("main", &script).unwrap();
        assert_eq!(mw.watcher.len(), 1);

        write(&script, "import late\n");
        mw.rescan().unwrap();
        assert_eq!(mw.watcher.len(), 2);
    }
}
