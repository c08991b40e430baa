//! gitignore-flavored ignore patterns (spec §6).
//!
//! Three pattern shapes, evaluated against path segments:
//! - suffix `/` → directory match (any occurrence of that segment).
//! - prefix `*.` → extension match.
//! - otherwise → exact filename match anywhere in the path.
//!
//! Built-ins are always active regardless of user-supplied patterns.

use std::path::Path;

pub const BUILTIN_IGNORES: &[&str] = &[".DS_Store", ".git/", "node_modules/", ".build/", ".swiftpm/"];

#[derive(Debug, Clone)]
enum Pattern {
    Dir(String),
    Ext(String),
    Name(String),
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        let mut s = Self::default();
        for p in BUILTIN_IGNORES {
            s.add(p);
        }
        s
    }

    /// Load built-ins plus user patterns from `<root>/.leafsyncignore`, one
    /// pattern per line, `#`-prefixed lines and blanks ignored.
    pub fn load(root: &Path) -> Self {
        let mut s = Self::new();
        let file = root.join(".leafsyncignore");
        if let Ok(text) = std::fs::read_to_string(file) {
            for line in text.lines() {
                let pat = line.trim();
                if pat.is_empty() || pat.starts_with('#') {
                    continue;
                }
                s.add(pat);
            }
        }
        s
    }

    pub fn add(&mut self, pat: &str) {
        if let Some(dir) = pat.strip_suffix('/') {
            self.patterns.push(Pattern::Dir(dir.to_string()));
        } else if let Some(ext) = pat.strip_prefix("*.") {
            self.patterns.push(Pattern::Ext(ext.to_string()));
        } else {
            self.patterns.push(Pattern::Name(pat.to_string()));
        }
    }

    /// `rel` must be `/`-separated, relative to the folder root.
    pub fn is_ignored(&self, rel: &str) -> bool {
        let segments: Vec<&str> = rel.split('/').collect();
        let filename = segments.last().copied().unwrap_or("");
        let ext = filename.rsplit_once('.').map(|(_, e)| e);

        for p in &self.patterns {
            match p {
                Pattern::Dir(name) => {
                    if segments.iter().any(|seg| *seg == name) {
                        return true;
                    }
                }
                Pattern::Ext(e) => {
                    if ext == Some(e.as_str()) {
                        return true;
                    }
                }
                Pattern::Name(n) => {
                    if segments.iter().any(|seg| seg == n) {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn is_hidden(rel: &str) -> bool {
        rel.split('/').any(|seg| seg.starts_with('.') && seg != "." && seg != "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_git_dir_is_ignored() {
        let s = IgnoreSet::new();
        assert!(s.is_ignored("sub/.git/HEAD"));
    }

    #[test]
    fn extension_pattern_matches_anywhere() {
        let mut s = IgnoreSet::default();
        s.add("*.tmp");
        assert!(s.is_ignored("a/b/c.tmp"));
        assert!(!s.is_ignored("a/b/c.txt"));
    }

    #[test]
    fn exact_name_pattern_matches_any_segment() {
        let mut s = IgnoreSet::default();
        s.add("Thumbs.db");
        assert!(s.is_ignored("x/y/Thumbs.db"));
    }

    #[test]
    fn dotfiles_are_hidden() {
        assert!(IgnoreSet::is_hidden(".hidden"));
        assert!(IgnoreSet::is_hidden("dir/.hidden/file.txt"));
        assert!(!IgnoreSet::is_hidden("dir/file.txt"));
    }
}
