//! File metadata record — the catalog's unit of storage and the wire form
//! shared by the client/server split.
//!
//! A record is produced either from `lstat` during a directory walk or by
//! parsing a catalog line, and consumed either by the `Sender` (to decide
//! whether to store or reference payload) or by [`FileRecord::materialize`]
//! during extraction.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const LONGLINK_NAME: &str = "././@LongLink";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    #[default]
    File,
    HardLink,
    Symlink,
    Char,
    Block,
    Dir,
    Fifo,
    /// GNU long-name continuation entry (`@LongLink`, typeflag `L`).
    LongLinkName,
    /// GNU long-link continuation entry (`@LongLink`, typeflag `K`).
    LongLinkTarget,
    Unknown,
}

impl Kind {
    pub fn typeflag(self) -> u8 {
        match self {
            Kind::File | Kind::Unknown => b'0',
            Kind::HardLink => b'1',
            Kind::Symlink => b'2',
            Kind::Char => b'3',
            Kind::Block => b'4',
            Kind::Dir => b'5',
            Kind::Fifo => b'6',
            Kind::LongLinkTarget => b'K',
            Kind::LongLinkName => b'L',
        }
    }
}

/// Per-walk uid/gid → name cache. Record-local rather than process-global:
/// a long-lived cache accumulates names as it sees them, but two
/// independent walks never share one.
#[derive(Debug, Default)]
pub struct NameCache {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_name(&mut self, uid: u32) -> String {
        if let Some(name) = self.users.get(&uid) {
            return name.clone();
        }
        let name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_default();
        self.users.insert(uid, name.clone());
        name
    }

    pub fn group_name(&mut self, gid: u32) -> String {
        if let Some(name) = self.groups.get(&gid) {
            return name.clone();
        }
        let name = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_default();
        self.groups.insert(gid, name.clone());
        name
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileRecord {
    pub filename: String,
    pub linkname: String,
    pub user: String,
    pub group: String,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub kind: Kind,
    pub uid: u32,
    pub gid: u32,
    pub devmajor: u32,
    pub devminor: u32,
}

impl FileRecord {
    /// Build a record from `lstat`-style metadata (must not follow
    /// symlinks: use [`std::fs::symlink_metadata`]).
    pub fn from_metadata(filename: String, meta: &fs::Metadata, cache: &mut NameCache) -> Result<Self> {
        let uid = meta.uid();
        let gid = meta.gid();
        let mut rec = FileRecord {
            filename,
            user: cache.user_name(uid),
            group: cache.group_name(gid),
            mode: meta.mode() & 0o7777,
            uid,
            gid,
            mtime: meta.mtime(),
            ..Default::default()
        };

        let ft = meta.file_type();
        if ft.is_dir() {
            rec.kind = Kind::Dir;
        } else if ft.is_symlink() {
            rec.kind = Kind::Symlink;
        } else if ft.is_char_device() {
            rec.kind = Kind::Char;
            rec.devmajor = major(meta.rdev());
            rec.devminor = minor(meta.rdev());
        } else if ft.is_block_device() {
            rec.kind = Kind::Block;
            rec.devmajor = major(meta.rdev());
            rec.devminor = minor(meta.rdev());
        } else if ft.is_fifo() {
            rec.kind = Kind::Fifo;
        } else if ft.is_file() {
            rec.kind = Kind::File;
            rec.size = meta.size();
        } else {
            rec.kind = Kind::Unknown;
        }
        Ok(rec)
    }

    /// Encode to the tab-separated catalog line, without a trailing newline
    /// and without the payload locator (the `Sender` appends that).
    pub fn to_line(&self) -> String {
        let mut res = String::new();
        res.push_str(&encode_name(&self.filename));
        res.push('\t');
        res.push_str(&self.user);
        res.push('#');
        res.push_str(&self.uid.to_string());
        res.push('\t');
        res.push_str(&self.group);
        res.push('#');
        res.push_str(&self.gid.to_string());
        res.push('\t');
        res.push_str(&format!("{:o}", self.mode));
        res.push('\t');
        match self.kind {
            Kind::File | Kind::Unknown => {
                res.push_str("file\t");
                res.push_str(&self.mtime.to_string());
                res.push('\t');
                res.push_str(&self.size.to_string());
            }
            Kind::HardLink => {
                res.push_str("hard\t");
                res.push_str(&encode_name(&self.linkname));
            }
            Kind::Symlink => {
                res.push_str("link\t");
                res.push_str(&encode_name(&self.linkname));
            }
            Kind::Char => {
                res.push_str("char\t");
                res.push_str(&self.devmajor.to_string());
                res.push('\t');
                res.push_str(&self.devminor.to_string());
            }
            Kind::Block => {
                res.push_str("block\t");
                res.push_str(&self.devmajor.to_string());
                res.push('\t');
                res.push_str(&self.devminor.to_string());
            }
            Kind::Dir => res.push_str("dir"),
            Kind::Fifo => res.push_str("fifo"),
            Kind::LongLinkName | Kind::LongLinkTarget => {}
        }
        res
    }

    /// Parse a catalog line (without its trailing newline) into a record
    /// plus whatever text followed the recognized fields — for `file`
    /// entries that is the optional payload locator.
    pub fn parse(line: &str) -> Result<(Self, String)> {
        let mut w = Words::new(line);
        let filename = decode_name(w.next())?;
        let user_field = w.next();
        let (user, uid) = split_name_id(user_field)?;
        let group_field = w.next();
        let (group, gid) = split_name_id(group_field)?;
        let mode = u32::from_str_radix(w.next(), 8)
            .map_err(|_| Error::format(format!("bad mode in catalog line: `{line}`")))?;

        let mut rec = FileRecord {
            filename,
            user,
            group,
            mode,
            uid,
            gid,
            ..Default::default()
        };

        let stype = w.next();
        match stype {
            "file" => {
                rec.kind = Kind::File;
                rec.mtime = w
                    .next()
                    .parse()
                    .map_err(|_| Error::format("bad mtime in catalog line"))?;
                rec.size = w
                    .next()
                    .parse()
                    .map_err(|_| Error::format("bad size in catalog line"))?;
            }
            "dir" => rec.kind = Kind::Dir,
            "link" => {
                rec.kind = Kind::Symlink;
                rec.linkname = decode_name(w.next())?;
            }
            "hard" => {
                rec.kind = Kind::HardLink;
                rec.linkname = decode_name(w.next())?;
            }
            "char" => {
                rec.kind = Kind::Char;
                rec.devmajor = w.next().parse().unwrap_or(0);
                rec.devminor = w.next().parse().unwrap_or(0);
            }
            "block" => {
                rec.kind = Kind::Block;
                rec.devmajor = w.next().parse().unwrap_or(0);
                rec.devminor = w.next().parse().unwrap_or(0);
            }
            "fifo" => rec.kind = Kind::Fifo,
            other => {
                return Err(Error::format(format!("unknown catalog entry kind `{other}`")));
            }
        }
        Ok((rec, w.rest.to_string()))
    }
}

/// Diffing equality (§4.D): mode is deliberately excluded.
impl PartialEq for FileRecord {
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename
            && self.kind == other.kind
            && self.uid == other.uid
            && self.gid == other.gid
            && (self.kind != Kind::File || (self.mtime == other.mtime && self.size == other.size))
            && self.devmajor == other.devmajor
            && self.devminor == other.devminor
            && self.linkname == other.linkname
    }
}

fn split_name_id(field: &str) -> Result<(String, u32)> {
    match field.rsplit_once('#') {
        Some((name, id)) => {
            let id = id
                .parse()
                .map_err(|_| Error::format(format!("bad id in `{field}`")))?;
            Ok((name.to_string(), id))
        }
        None => Err(Error::format(format!("malformed owner field `{field}`"))),
    }
}

pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

pub fn decode_name(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            _ => return Err(Error::format(format!("bad escape in encoded filename `{name}`"))),
        }
    }
    Ok(out)
}

struct Words<'a> {
    rest: &'a str,
}

impl<'a> Words<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }

    fn next(&mut self) -> &'a str {
        match self.rest.find('\t') {
            Some(i) => {
                let word = &self.rest[..i];
                self.rest = &self.rest[i + 1..];
                word
            }
            None => std::mem::take(&mut self.rest),
        }
    }
}

fn major(dev: u64) -> u32 {
    (((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)) as u32
}

fn minor(dev: u64) -> u32 {
    ((dev & 0xff) | ((dev >> 12) & !0xff)) as u32
}

/// Stack of open directory descriptors used to materialize a filename's
/// path components without repeatedly reopening shared ancestors.
pub struct DirStack {
    root_fd: std::os::unix::io::OwnedFd,
    /// `(component joined so far, fd, original mode to restore on drop)`.
    entries: Vec<(String, std::os::unix::io::OwnedFd, Option<u32>)>,
}

impl DirStack {
    pub fn open_root(root: &Path) -> Result<Self> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;
        let fd = open(root, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(|e| Error::filesystem(root, std::io::Error::from(e)))?;
        Ok(Self { root_fd: fd, entries: Vec::new() })
    }

    fn current_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.entries
            .last()
            .map(|(_, fd, _)| fd.as_raw_fd())
            .unwrap_or_else(|| self.root_fd.as_raw_fd())
    }

    /// Descend to the parent directory of `filename`, reusing the longest
    /// shared prefix with the stack's current path and popping the rest.
    fn descend(&mut self, filename: &str) -> Result<()> {
        use nix::fcntl::{open, openat, OFlag};
        use nix::sys::stat::{fchmod, fstat, Mode};
        use std::os::unix::io::AsRawFd;

        let components: Vec<&str> = filename.split('/').collect();
        let dir_components = &components[..components.len().saturating_sub(1)];

        let mut keep = 0;
        for (i, (name, _, _)) in self.entries.iter().enumerate() {
            if dir_components.get(i) == Some(&name.as_str()) {
                keep = i + 1;
            } else {
                break;
            }
        }
        while self.entries.len() > keep {
            let (_, fd, orig_mode) = self.entries.pop().unwrap();
            if let Some(mode) = orig_mode {
                let _ = fchmod(fd.as_raw_fd(), Mode::from_bits_truncate(mode));
            }
        }

        for name in &dir_components[keep..] {
            let parent_fd = self.current_fd();
            let child = match openat(parent_fd, *name, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()) {
                Ok(fd) => fd,
                Err(nix::Error::ENOENT) => {
                    nix::unistd::mkdirat(parent_fd, *name, Mode::from_bits_truncate(0o777))
                        .map_err(|e| Error::filesystem(*name, std::io::Error::from(e)))?;
                    openat(parent_fd, *name, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
                        .map_err(|e| Error::filesystem(*name, std::io::Error::from(e)))?
                }
                Err(e) => return Err(Error::filesystem(*name, std::io::Error::from(e))),
            };

            let st = fstat(child.as_raw_fd()).map_err(|e| Error::filesystem(*name, std::io::Error::from(e)))?;
            let mut orig_mode = None;
            if st.st_mode & 0o700 != 0o700 {
                orig_mode = Some((st.st_mode & 0o7777) as u32);
                let _ = fchmod(
                    child.as_raw_fd(),
                    Mode::from_bits_truncate(0o7777 & (st.st_mode as u32 | 0o700)),
                );
            }
            self.entries.push((name.to_string(), child, orig_mode));
        }
        let _ = open; // silence unused import when target dir is root
        Ok(())
    }
}

impl Drop for DirStack {
    fn drop(&mut self) {
        use nix::sys::stat::{fchmod, Mode};
        use std::os::unix::io::AsRawFd;
        while let Some((_, fd, orig_mode)) = self.entries.pop() {
            if let Some(mode) = orig_mode {
                let _ = fchmod(fd.as_raw_fd(), Mode::from_bits_truncate(mode));
            }
        }
    }
}

impl FileRecord {
    /// Materialize this record under `root`, creating intermediate
    /// directories as needed and removing any existing path first (unless
    /// the target is itself a directory, which is reused).
    ///
    /// `dirs` should be reused across successive calls from the same
    /// catalog so that sibling entries under a common parent share one
    /// open directory descriptor.
    pub fn materialize(&self, root: &Path, dirs: &mut Option<DirStack>) -> Result<Option<std::os::unix::io::OwnedFd>> {
        let _su = crate::privilege::ElevateGuard::new()?;

        if dirs.is_none() {
            *dirs = Some(DirStack::open_root(root)?);
        }
        let stack = dirs.as_mut().unwrap();
        stack.descend(&self.filename)?;

        let leaf = self
            .filename
            .rsplit('/')
            .next()
            .ok_or_else(|| Error::format("empty filename in catalog entry"))?;
        let parent_fd = stack.current_fd();
        self.create_at(parent_fd, leaf)
    }

    fn create_at(&self, parent_fd: std::os::unix::io::RawFd, name: &str) -> Result<Option<std::os::unix::io::OwnedFd>> {
        use nix::fcntl::{openat, OFlag};
        use nix::sys::stat::{fchmodat, fstatat, mkdirat, mknodat, FchmodatFlags, Mode, SFlag};
        use nix::unistd::{fchownat, linkat, symlinkat, FchownatFlags, LinkatFlags};

        let exists = fstatat(parent_fd, name, nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW).ok();
        if self.kind == Kind::Dir {
            let is_dir = exists.map(|s| s.st_mode & libc::S_IFMT == libc::S_IFDIR).unwrap_or(false);
            if exists.is_some() && !is_dir {
                let _ = nix::unistd::unlinkat(Some(parent_fd), name, nix::unistd::UnlinkatFlags::NoRemoveDir);
            }
            if exists.is_none() || !is_dir {
                mkdirat(parent_fd, name, Mode::from_bits_truncate(self.mode))
                    .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
            }
            let fd = openat(parent_fd, name, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
                .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
            self.set_owner_mode(&fd, name)?;
            return Ok(Some(fd));
        }

        if exists.is_some() {
            self.remove_at(parent_fd, name)?;
        }

        match self.kind {
            Kind::File | Kind::Unknown => {
                let fd = openat(
                    parent_fd,
                    name,
                    OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_WRONLY,
                    Mode::from_bits_truncate(self.mode),
                )
                .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
                self.set_owner_mode(&fd, name)?;
                Ok(Some(fd))
            }
            Kind::Symlink => {
                symlinkat(self.linkname.as_str(), Some(parent_fd), name)
                    .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
                let _ = fchmodat(
                    Some(parent_fd),
                    name,
                    Mode::from_bits_truncate(self.mode),
                    FchmodatFlags::NoFollowSymlink,
                );
                if nix::unistd::geteuid().is_root() {
                    let _ = fchownat(
                        Some(parent_fd),
                        name,
                        Some(nix::unistd::Uid::from_raw(self.uid)),
                        Some(nix::unistd::Gid::from_raw(self.gid)),
                        FchownatFlags::NoFollowSymlink,
                    );
                }
                Ok(None)
            }
            Kind::HardLink => {
                linkat(
                    None,
                    self.linkname.as_str(),
                    Some(parent_fd),
                    name,
                    LinkatFlags::NoSymlinkFollow,
                )
                .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
                Ok(None)
            }
            Kind::Char | Kind::Block => {
                let sflag = if self.kind == Kind::Char { SFlag::S_IFCHR } else { SFlag::S_IFBLK };
                let dev = makedev(self.devmajor, self.devminor);
                mknodat(parent_fd, name, sflag, Mode::from_bits_truncate(self.mode), dev)
                    .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
                let fd = openat(parent_fd, name, OFlag::O_RDONLY, Mode::empty())
                    .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
                self.set_owner_mode(&fd, name)?;
                Ok(None)
            }
            Kind::Fifo => {
                nix::unistd::mkfifoat(Some(parent_fd), name, Mode::from_bits_truncate(self.mode))
                    .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
                let fd = openat(parent_fd, name, OFlag::O_RDONLY, Mode::empty())
                    .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
                self.set_owner_mode(&fd, name)?;
                Ok(None)
            }
            Kind::LongLinkName | Kind::LongLinkTarget => Ok(None),
        }
    }

    fn set_owner_mode(&self, fd: &impl std::os::unix::io::AsFd, name: &str) -> Result<()> {
        use nix::sys::stat::{fchmod, Mode};
        use nix::unistd::fchown;
        use std::os::unix::io::AsRawFd;
        let raw = fd.as_fd().as_raw_fd();
        fchmod(raw, Mode::from_bits_truncate(self.mode)).map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
        if nix::unistd::geteuid().is_root() {
            fchown(
                raw,
                Some(nix::unistd::Uid::from_raw(self.uid)),
                Some(nix::unistd::Gid::from_raw(self.gid)),
            )
            .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
        }
        Ok(())
    }

    fn remove_at(&self, parent_fd: std::os::unix::io::RawFd, name: &str) -> Result<()> {
        use nix::fcntl::{openat, AtFlags, OFlag};
        use nix::sys::stat::{fstatat, Mode};
        use nix::unistd::{unlinkat, UnlinkatFlags};

        let st = match fstatat(parent_fd, name, AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(st) => st,
            Err(_) => return Ok(()),
        };
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            let _ = unlinkat(Some(parent_fd), name, UnlinkatFlags::NoRemoveDir);
            return Ok(());
        }
        let dir_fd = openat(parent_fd, name, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
        let entries: Vec<String> = {
            use std::os::unix::io::AsRawFd;
            let mut dir = nix::dir::Dir::from_fd(std::os::unix::io::IntoRawFd::into_raw_fd(dir_fd))
                .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
            dir.iter()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n != "." && n != "..")
                .collect()
        };
        let child_fd = openat(parent_fd, name, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(|e| Error::filesystem(name, std::io::Error::from(e)))?;
        use std::os::unix::io::AsRawFd;
        for entry in entries {
            self.remove_at(child_fd.as_raw_fd(), &entry)?;
        }
        drop(child_fd);
        let _ = nix::unistd::unlinkat(Some(parent_fd), name, UnlinkatFlags::RemoveDir);
        Ok(())
    }
}

fn makedev(major: u32, minor: u32) -> libc::dev_t {
    let major = major as u64;
    let minor = minor as u64;
    ((major & 0xfff) << 8 | (minor & 0xff) | ((major & !0xfff) << 32) | ((minor & !0xff) << 12)) as libc::dev_t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let name = "a\\b\tc\nd";
        let encoded = encode_name(name);
        assert_eq!(encoded, "a\\\\b\\tc\\nd");
        assert_eq!(decode_name(&encoded).unwrap(), name);
    }

    #[test]
    fn file_line_roundtrip() {
        let rec = FileRecord {
            filename: "dir/file.txt".into(),
            user: "alice".into(),
            group: "staff".into(),
            uid: 501,
            gid: 20,
            mode: 0o644,
            kind: Kind::File,
            mtime: 1_700_000_000,
            size: 1234,
            ..Default::default()
        };
        let line = rec.to_line();
        assert_eq!(line, "dir/file.txt\talice#501\tstaff#20\t644\tfile\t1700000000\t1234");
        let (parsed, rest) = FileRecord::parse(&line).unwrap();
        assert_eq!(parsed, rec);
        assert!(rest.is_empty());
    }

    #[test]
    fn file_line_with_locator_leaves_rest() {
        let line = "f\tu#1\tg#1\t644\tfile\t100\t5\t0:1:20:0";
        let (rec, rest) = FileRecord::parse(line).unwrap();
        assert_eq!(rec.kind, Kind::File);
        assert_eq!(rest, "0:1:20:0");
    }

    #[test]
    fn symlink_line_roundtrip() {
        let rec = FileRecord {
            filename: "link".into(),
            linkname: "target".into(),
            user: "u".into(),
            group: "g".into(),
            uid: 1,
            gid: 1,
            mode: 0o777,
            kind: Kind::Symlink,
            ..Default::default()
        };
        let (parsed, _) = FileRecord::parse(&rec.to_line()).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn equality_ignores_mode() {
        let mut a = FileRecord {
            filename: "f".into(),
            kind: Kind::File,
            size: 10,
            mtime: 5,
            mode: 0o644,
            ..Default::default()
        };
        let mut b = a.clone();
        b.mode = 0o600;
        assert_eq!(a, b);
        a.size = 11;
        assert_ne!(a, b);
    }

    #[test]
    fn major_minor_roundtrip() {
        let dev = makedev(8, 1);
        assert_eq!(major(dev as u64), 8);
        assert_eq!(minor(dev as u64), 1);
    }
}
