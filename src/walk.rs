//! Directory walker — depth-first, alpha-slash sorted, physical traversal.
//!
//! Symlinks are recorded but never followed, and the walk never crosses a
//! filesystem boundary (tracked via `st_dev`). Ordering must agree exactly
//! with the catalog's own sort order, since the incremental engine (§4.F)
//! aligns a base catalog against the live walk by advancing through both in
//! lockstep.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::hook::{Hook, HookContext, HookParams};
use crate::record::{FileRecord, Kind, NameCache};

/// Byte comparison except that `/` sorts before every other non-NUL byte.
pub fn alpha_slash_cmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&x), Some(&y)) => {
                if x != y {
                    return key(x).cmp(&key(y));
                }
            }
        }
        i += 1;
    }
}

fn key(b: u8) -> u16 {
    if b == b'/' {
        0
    } else {
        b as u16 + 1
    }
}

/// A shell-glob exclusion pattern, matched against the filename with
/// leading-directory semantics (a pattern with no `/` matches the basename
/// of any path; a pattern containing `/` matches from the walk root).
#[derive(Debug, Clone)]
pub struct ExcludePattern {
    pattern: String,
}

impl ExcludePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self { pattern: pattern.into() }
    }

    pub fn matches(&self, filename: &str) -> bool {
        if self.pattern.contains('/') {
            glob_match(&self.pattern, filename)
        } else {
            let leaf = filename.rsplit('/').next().unwrap_or(filename);
            glob_match(&self.pattern, leaf)
        }
    }
}

/// Minimal shell-glob matcher: `*` (any run, no `/` required to stop at),
/// `?` (one byte), and literal bytes. No bracket-class support.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    glob_match_bytes(p, t)
}

fn glob_match_bytes(p: &[u8], t: &[u8]) -> bool {
    match (p.first(), t.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match_bytes(&p[1..], t) || (!t.is_empty() && glob_match_bytes(p, &t[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match_bytes(&p[1..], &t[1..]),
        (Some(&pc), Some(&tc)) if pc == tc => glob_match_bytes(&p[1..], &t[1..]),
        _ => p == [b'*'] && t.is_empty(),
    }
}

/// A `start`/`end` bracketing hook registered for a path prefix — e.g. to
/// snapshot a database before copying its files.
pub struct BackupHook {
    pub prefix: String,
    pub hook: Hook,
}

pub struct Walker {
    excludes: Vec<ExcludePattern>,
    backup_hooks: Vec<BackupHook>,
    names: NameCache,
    root_dev: Option<u64>,
    /// Inode -> first-seen filename, for hardlink detection (§4.F).
    hardlinks: HashMap<u64, String>,
}

impl Walker {
    pub fn new() -> Self {
        Self {
            excludes: Vec::new(),
            backup_hooks: Vec::new(),
            names: NameCache::new(),
            root_dev: None,
            hardlinks: HashMap::new(),
        }
    }

    pub fn add_exclude(&mut self, pattern: ExcludePattern) {
        self.excludes.push(pattern);
    }

    pub fn add_backup_hook(&mut self, hook: BackupHook) {
        self.backup_hooks.push(hook);
    }

    fn excluded(&self, filename: &str) -> bool {
        self.excludes.iter().any(|p| p.matches(filename))
    }

    /// Walk `root`, yielding one [`FileRecord`] per entry in catalog order
    /// (root itself is not yielded; its immediate children and their
    /// descendants are).
    pub fn walk(&mut self, root: &Path) -> Result<Vec<FileRecord>> {
        let meta = fs::symlink_metadata(root).map_err(|e| Error::filesystem(root, e))?;
        self.root_dev = Some(meta.dev());
        let mut out = Vec::new();
        self.walk_dir(root, "", &mut out)?;
        out.sort_by(|a, b| alpha_slash_cmp(&a.filename, &b.filename));
        Ok(out)
    }

    fn walk_dir(&mut self, abs_dir: &Path, rel_prefix: &str, out: &mut Vec<FileRecord>) -> Result<()> {
        let mut names: Vec<std::ffi::OsString> = fs::read_dir(abs_dir)
            .map_err(|e| Error::filesystem(abs_dir, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        names.sort_by(|a, b| alpha_slash_cmp(&a.to_string_lossy(), &b.to_string_lossy()));

        for name in names {
            let leaf = name.to_string_lossy().into_owned();
            let rel = if rel_prefix.is_empty() { leaf.clone() } else { format!("{rel_prefix}/{leaf}") };
            if self.excluded(&rel) {
                continue;
            }

            let abs_path = abs_dir.join(&name);
            let meta = match fs::symlink_metadata(&abs_path) {
                Ok(m) => m,
                Err(_) => continue,
            };

            self.run_start_hooks(&rel, abs_dir, &leaf)?;

            let mut rec = FileRecord::from_metadata(rel.clone(), &meta, &mut self.names)?;
            if rec.kind == Kind::Symlink {
                rec.linkname = fs::read_link(&abs_path)
                    .map_err(|e| Error::filesystem(&abs_path, e))?
                    .to_string_lossy()
                    .into_owned();
            } else if rec.kind == Kind::File && meta.nlink() > 1 {
                match self.hardlinks.get(&meta.ino()) {
                    Some(first) => {
                        rec.kind = Kind::HardLink;
                        rec.linkname = first.clone();
                    }
                    None => {
                        self.hardlinks.insert(meta.ino(), rel.clone());
                    }
                }
            }
            let is_dir = meta.is_dir();
            let same_fs = self.root_dev.map(|d| d == meta.dev()).unwrap_or(true);
            out.push(rec);

            if is_dir && same_fs {
                self.walk_dir(&abs_path, &rel, out)?;
            }

            self.run_end_hooks(&rel, abs_dir, &leaf)?;
        }
        Ok(())
    }

    fn run_start_hooks(&self, rel: &str, parent: &Path, leaf: &str) -> Result<()> {
        for bh in &self.backup_hooks {
            if rel == bh.prefix || rel.starts_with(&format!("{}/", bh.prefix)) {
                if rel == bh.prefix {
                    bh.hook.run(&HookParams::for_path(parent, Path::new(leaf), 0), HookContext::Start)?;
                }
            }
        }
        Ok(())
    }

    fn run_end_hooks(&self, rel: &str, parent: &Path, leaf: &str) -> Result<()> {
        for bh in &self.backup_hooks {
            if rel == bh.prefix {
                bh.hook.run(&HookParams::for_path(parent, Path::new(leaf), 0), HookContext::End)?;
            }
        }
        Ok(())
    }
}

impl Default for Walker {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sort_records(records: &mut [FileRecord]) {
    records.sort_by(|a, b| alpha_slash_cmp(&a.filename, &b.filename));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_sorts_before_other_bytes() {
        assert_eq!(alpha_slash_cmp("a/b", "ab"), Ordering::Less);
        assert_eq!(alpha_slash_cmp("a.txt", "a/txt"), Ordering::Greater);
        assert_eq!(alpha_slash_cmp("abc", "abc"), Ordering::Equal);
    }

    #[test]
    fn glob_matches_star_and_question() {
        let p = ExcludePattern::new("*.tmp");
        assert!(p.matches("foo.tmp"));
        assert!(p.matches("dir/foo.tmp"));
        assert!(!p.matches("foo.tmpx"));

        let p2 = ExcludePattern::new("cache/*");
        assert!(p2.matches("cache/anything"));
        assert!(!p2.matches("other/anything"));
    }

    #[test]
    fn walk_orders_entries_alpha_slash() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b.txt"), b"x").unwrap();
        fs::write(dir.path().join("b/inner"), b"y").unwrap();

        let mut w = Walker::new();
        let records = w.walk(dir.path()).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.filename.as_str()).collect();
        // "b/inner" sorts before "b.txt" because '/' < '.'
        assert_eq!(names, vec!["b", "b/inner", "b.txt"]);
    }

    #[test]
    fn excluded_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        fs::write(dir.path().join("skip.tmp"), b"x").unwrap();

        let mut w = Walker::new();
        w.add_exclude(ExcludePattern::new("*.tmp"));
        let records = w.walk(dir.path()).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["keep.txt"]);
    }
}
