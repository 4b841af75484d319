//! Sliced byte stream — fixed-size write slicing and transparent
//! cross-slice reads for a multi-file archive.
//!
//! An archive named `N` starts life as a single file `N`. The first time a
//! write would overflow the configured slice size, `N` is renamed to
//! `N.part1` and a new `N.part2` is opened; from then on every slice is
//! named `N.partK`. A reader discovers whichever layout is on disk by
//! scanning the directory for the highest-numbered `N.partK` sibling,
//! falling back to the bare `N` file when no sibling exists.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::hook::{Hook, HookContext, HookParams};
use crate::privilege::ElevateGuard;

fn part_path(base_name: &Path, id: u32) -> PathBuf {
    let mut s = base_name.as_os_str().to_os_string();
    s.push(format!(".part{id}"));
    PathBuf::from(s)
}

/// Writer side of a sliced archive. Starts a new slice whenever a write
/// would exceed `slice_size`, invoking the upload hook on the slice just
/// closed.
pub struct SliceWriter {
    base_name: PathBuf,
    slice_size: u64,
    slice_id: u32,
    current: File,
    current_path: PathBuf,
    current_offset: u64,
    hook: Option<Hook>,
}

impl SliceWriter {
    pub fn create(base_name: impl Into<PathBuf>, slice_size: u64, hook: Option<Hook>) -> Result<Self> {
        let base_name = base_name.into();
        let _su = ElevateGuard::new()?;
        let current = File::create(&base_name)?;
        Ok(Self {
            current_path: base_name.clone(),
            base_name,
            slice_size,
            slice_id: 1,
            current,
            current_offset: 0,
            hook,
        })
    }

    fn push(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let room = (self.slice_size - self.current_offset) as usize;
            if (buf.len() as u64) <= room as u64 {
                self.current.write_all(buf)?;
                self.current_offset += buf.len() as u64;
                return Ok(());
            }
            if room > 0 {
                self.current.write_all(&buf[..room])?;
                self.current_offset += room as u64;
                buf = &buf[room..];
            }
            self.advance()?;
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        self.current.flush()?;
        if let Some(hook) = &self.hook {
            hook.run(
                &HookParams::for_path(&self.base_name, &self.current_path, self.slice_id),
                HookContext::Operation,
            )?;
        }
        let _su = ElevateGuard::new()?;
        if self.slice_id == 1 {
            let part1 = part_path(&self.base_name, 1);
            std::fs::rename(&self.base_name, &part1)?;
        }
        self.slice_id += 1;
        let new_path = part_path(&self.base_name, self.slice_id);
        self.current = File::create(&new_path)?;
        self.current_path = new_path;
        self.current_offset = 0;
        Ok(())
    }

    /// Current `(slice_id, byte_offset)` position.
    pub fn offset(&self) -> (u32, u64) {
        (self.slice_id, self.current_offset)
    }

    /// Invoke the upload hook on the final slice. Called once, after all
    /// data (including the listing and trailer) has been written.
    pub fn finish(&mut self) -> Result<()> {
        self.current.flush()?;
        if let Some(hook) = &self.hook {
            hook.run(
                &HookParams::for_path(&self.base_name, &self.current_path, self.slice_id),
                HookContext::LastSlice,
            )?;
        }
        Ok(())
    }
}

impl Write for SliceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.flush()
    }
}

/// Reader side of a sliced archive. Transparently advances across slice
/// boundaries on `Read`, and supports seeking relative to the end of the
/// whole slice set (needed only for trailer tail-discovery).
pub struct SliceReader {
    base_name: PathBuf,
    slice_id: u32,
    current: File,
    hook: Option<Hook>,
    downloaded_via_hook: Option<PathBuf>,
}

impl SliceReader {
    pub fn open(base_name: impl Into<PathBuf>, hook: Option<Hook>) -> Result<Self> {
        let base_name = base_name.into();
        let (slice_id, current) = Self::open_last_slice(&base_name, &hook)?;
        Ok(Self {
            base_name,
            slice_id,
            current,
            hook,
            downloaded_via_hook: None,
        })
    }

    fn open_last_slice(base_name: &Path, hook: &Option<Hook>) -> Result<(u32, File)> {
        if let Some((id, path)) = Self::find_last(base_name)? {
            return Ok((id, File::open(path)?));
        }
        if let Some(hook) = hook {
            hook.run(&HookParams::for_path(base_name, base_name, 0), HookContext::Init)?;
            if let Some((id, path)) = Self::find_last(base_name)? {
                return Ok((id, File::open(path)?));
            }
        }
        Err(Error::slice(format!(
            "no slice found for archive `{}`",
            base_name.display()
        )))
    }

    /// Scan the directory for `basename.partN` siblings and the plain
    /// `basename` file; returns the highest-numbered slice, or the plain
    /// file if no `.partN` sibling exists, or `None` if nothing is present.
    fn find_last(base_name: &Path) -> Result<Option<(u32, PathBuf)>> {
        let dir = base_name
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let stem = base_name
            .file_name()
            .ok_or_else(|| Error::slice("empty archive name"))?
            .to_string_lossy()
            .into_owned();
        let prefix = format!("{stem}.part");

        let mut max_id = 0u32;
        if dir.is_dir() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(suffix) = name.strip_prefix(prefix.as_str()) {
                    if let Ok(id) = suffix.parse::<u32>() {
                        max_id = max_id.max(id);
                    }
                }
            }
        }
        if max_id > 0 {
            return Ok(Some((max_id, part_path(base_name, max_id))));
        }
        if base_name.is_file() {
            return Ok(Some((1, base_name.to_path_buf())));
        }
        Ok(None)
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if !self.open_next()? {
                return Ok(0);
            }
        }
    }

    fn open_next(&mut self) -> Result<bool> {
        let next_id = self.slice_id + 1;
        let mut next_path = part_path(&self.base_name, next_id);
        if !next_path.is_file() {
            if let Some(hook) = &self.hook {
                hook.run(
                    &HookParams::for_path(&self.base_name, &next_path, next_id),
                    HookContext::Operation,
                )?;
            }
            if !next_path.is_file() {
                return Ok(false);
            }
        }
        self.current = File::open(&next_path)?;
        if let Some(prev) = self.downloaded_via_hook.take() {
            let _ = std::fs::remove_file(prev);
        }
        if self.hook.is_some() {
            self.downloaded_via_hook = Some(std::mem::take(&mut next_path));
        }
        self.slice_id = next_id;
        Ok(true)
    }

    /// Seek to `offset` bytes (must be `<= 0`) from the end of the whole
    /// slice set, walking backward across earlier slices as needed.
    pub fn seek_from_end(&mut self, offset: i64) -> Result<()> {
        debug_assert!(offset <= 0);
        let mut remaining = (-offset) as u64;
        loop {
            let len = self.current.metadata()?.len();
            if remaining <= len {
                self.current.seek(SeekFrom::Start(len - remaining))?;
                return Ok(());
            }
            remaining -= len;
            if self.slice_id <= 1 {
                return Err(Error::slice("seek before start of slice set"));
            }
            let prev_id = self.slice_id - 1;
            let candidate = part_path(&self.base_name, prev_id);
            let prev_path = if candidate.is_file() {
                candidate
            } else {
                self.base_name.clone()
            };
            self.current = File::open(&prev_path)?;
            self.slice_id = prev_id;
        }
    }

    /// Open a specific `(slice_id, byte_offset)` position directly.
    pub fn seek_to(&mut self, slice_id: u32, byte_offset: u64) -> Result<()> {
        let path = if slice_id == 1 && !part_path(&self.base_name, 1).is_file() {
            self.base_name.clone()
        } else {
            part_path(&self.base_name, slice_id)
        };
        self.current = File::open(&path)?;
        self.current.seek(SeekFrom::Start(byte_offset))?;
        self.slice_id = slice_id;
        Ok(())
    }

    pub fn slice_id(&self) -> u32 {
        self.slice_id
    }
}

impl Read for SliceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn single_slice_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arc");
        {
            let mut w = SliceWriter::create(&base, 1024, None).unwrap();
            w.write_all(b"hello slices").unwrap();
            w.finish().unwrap();
        }
        assert!(base.is_file());
        let mut r = SliceReader::open(&base, None).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello slices");
    }

    #[test]
    fn overflow_creates_part_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arc");
        {
            let mut w = SliceWriter::create(&base, 4, None).unwrap();
            w.write_all(b"abcdefghij").unwrap();
            w.finish().unwrap();
        }
        assert!(!base.is_file());
        assert!(dir.path().join("arc.part1").is_file());
        assert!(dir.path().join("arc.part2").is_file());
        assert!(dir.path().join("arc.part3").is_file());

        let mut r = SliceReader::open(&base, None).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdefghij");
    }

    #[test]
    fn seek_from_end_within_last_slice() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arc");
        {
            let mut w = SliceWriter::create(&base, 4, None).unwrap();
            w.write_all(b"abcdefghij").unwrap();
            w.finish().unwrap();
        }
        let mut r = SliceReader::open(&base, None).unwrap();
        r.seek_from_end(-2).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ij");
    }

    #[test]
    fn seek_from_end_crosses_slice_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arc");
        {
            let mut w = SliceWriter::create(&base, 4, None).unwrap();
            w.write_all(b"abcdefghij").unwrap();
            w.finish().unwrap();
        }
        let mut r = SliceReader::open(&base, None).unwrap();
        // Last slice ("arc.part3") holds "ij" (2 bytes); asking for the
        // last 5 bytes must walk back into "arc.part2" ("ef", "gh").
        r.seek_from_end(-5).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"fghij");
    }
}
