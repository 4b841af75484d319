//! Writer/Sender — the incremental backup engine.
//!
//! Consumes a stream of [`FileRecord`]s (from a live directory walk or from
//! the client side of a client/server split) and decides, per entry,
//! whether to store a fresh payload or emit a reference into a base
//! archive. Also implements `Merge`/`Split` over already-written archives.

use std::cmp::Ordering;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::{Catalog, CatalogEntry, Locator};
use crate::error::{Error, Result};
use crate::gzip::{pack_once, GzipWriter};
use crate::hook::Hook;
use crate::record::{FileRecord, Kind, NameCache};
use crate::slice::SliceWriter;
use crate::tar::TarWriter;
use crate::walk::alpha_slash_cmp;

pub const DEFAULT_BACKUP_SLICE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MERGE_SLICE_SIZE: u64 = 1024 * 1024 * 1024 * 1024;

/// Prefix for the synthetic symlink entries `Merge` inserts between source
/// archives, and that `Split` uses to find its own boundaries (§4.F).
pub const PART_NAME_PREFIX: &str = "@partname.";

/// Relative path `Sender::new` loads its no-compress blacklist from; a
/// missing file is not an error (§6, §9.1).
pub const COMPRESSED_LIST_CONFIG: &str = "etc/isptar.conf";

/// Filename-suffix blacklist for which stored payload compression is
/// dropped to level 0 (stored-only) rather than level 9.
#[derive(Debug, Clone, Default)]
pub struct CompressionBlacklist {
    suffixes: Vec<String>,
}

impl CompressionBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, suffix: impl Into<String>) {
        self.suffixes.push(suffix.into());
    }

    /// Case-sensitive trailing-bytes match; not a glob (§9).
    pub fn matches(&self, filename: &str) -> bool {
        self.suffixes.iter().any(|s| filename.ends_with(s.as_str()))
    }
}

/// Sends live file data (read from the filesystem) for entries the sender
/// decides must be stored.
pub trait PayloadSource {
    fn open(&mut self, record: &FileRecord) -> Result<Box<dyn Read + '_>>;
}

/// Reads payloads directly off disk under a root prefix — the normal case
/// for a local `create`.
pub struct FsPayloadSource {
    root: PathBuf,
}

impl FsPayloadSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PayloadSource for FsPayloadSource {
    fn open(&mut self, record: &FileRecord) -> Result<Box<dyn Read + '_>> {
        let path = self.root.join(&record.filename);
        let f = fs::File::open(&path).map_err(|e| Error::filesystem(&path, e))?;
        Ok(Box::new(f))
    }
}

/// What the base catalog (if any) says about an incoming record.
struct PrevInfo {
    found: bool,
    /// A reference locator to forward, in `reference=true` mode.
    file_offs: Option<Locator>,
    /// An already-open reader over the base's stored payload, in copy mode.
    base_payload: Option<crate::gzip::GzipReader<crate::slice::SliceReader>>,
}

impl Default for PrevInfo {
    fn default() -> Self {
        Self { found: false, file_offs: None, base_payload: None }
    }
}

/// Writer/Sender: the incremental backup engine described in §4.F.
pub struct Sender<W: Write> {
    data: TarWriter<GzipWriter<W>>,
    listing: GzipWriter<fs::File>,
    listing_path: PathBuf,
    /// Optional copy of the catalog the operator asked to keep (`--save-listing`).
    listing_save_path: Option<PathBuf>,
    blacklist: CompressionBlacklist,
    base: Option<Catalog>,
    base_current: Option<CatalogEntry>,
    reference: bool,
    /// Tracks the data stream's current compression level so level changes
    /// (and the member boundary they force) only happen when it actually
    /// toggles, mirroring the teacher's `SetCompress`.
    compress: bool,
    names: NameCache,
}

impl<W: Write> Sender<W> {
    /// Build a sender around an already-open output stream. `out` is
    /// typically a [`SliceWriter`], but tests substitute an in-memory sink.
    pub fn new(out: W, base: Option<Catalog>, reference: bool) -> Result<Self> {
        let data = TarWriter::new(GzipWriter::new(out, 9));

        let listing_path = std::env::temp_dir().join(format!("isptar-listing-{}", std::process::id()));
        let listing_file = fs::File::create(&listing_path).map_err(|e| Error::filesystem(&listing_path, e))?;
        let listing = GzipWriter::new(listing_file, 9);

        let mut base_current = None;
        let mut base = base;
        if let Some(b) = base.as_mut() {
            base_current = b.next_entry()?;
        }

        let mut blacklist = CompressionBlacklist::new();
        let config = crate::config::ExcludeCompression::load(COMPRESSED_LIST_CONFIG)?;
        for suffix in config.suffixes {
            blacklist.add(suffix);
        }

        Ok(Self {
            data,
            listing,
            listing_path,
            listing_save_path: None,
            blacklist,
            base,
            base_current,
            reference,
            compress: true,
            names: NameCache::new(),
        })
    }

    pub fn add_blacklist_suffix(&mut self, suffix: impl Into<String>) {
        self.blacklist.add(suffix);
    }

    pub fn set_listing_save_path(&mut self, path: impl Into<PathBuf>) {
        self.listing_save_path = Some(path.into());
    }

    fn set_compress(&mut self, want: bool) -> Result<()> {
        if want != self.compress {
            self.compress = want;
            self.data.get_mut().set_level(if want { 9 } else { 0 })?;
        }
        Ok(())
    }

    /// Advance the base catalog in lockstep with `filename` (§4.F step 2)
    /// and report what it knows about this entry.
    fn prev_info(&mut self, record: &FileRecord) -> Result<PrevInfo> {
        let mut res = PrevInfo::default();
        let Some(base) = self.base.as_mut() else {
            return Ok(res);
        };

        loop {
            match &self.base_current {
                Some(entry) if alpha_slash_cmp(&entry.record.filename, &record.filename) == Ordering::Less => {
                    self.base_current = base.next_entry()?;
                }
                _ => break,
            }
        }

        let matches = matches!(&self.base_current, Some(e) if &e.record == record);
        if !matches {
            return Ok(res);
        }

        // Copy mode has no reference locator to forward for a zero-size file,
        // and there is no payload to copy either, so treat it as unmatched:
        // this re-fires the header-write gate instead of silently dropping
        // the entry from the new archive.
        if record.kind == Kind::File && record.size == 0 && !self.reference {
            return Ok(res);
        }
        res.found = true;

        if record.kind == Kind::File && record.size > 0 {
            let entry = self.base_current.as_ref().unwrap();
            let locator = entry
                .locator
                .ok_or_else(|| Error::format(format!("catalog entry `{}` has no payload locator", record.filename)))?;
            if self.reference {
                res.file_offs = Some(locator.deeper());
            } else {
                res.base_payload = Some(base.open_payload(&locator)?);
            }
        }
        Ok(res)
    }

    /// Process one incoming record: append its catalog line, decide whether
    /// payload must be stored, and if so write the TAR header (and, in copy
    /// mode, relay the payload from the base archive). Returns `true` when
    /// the caller must still supply fresh payload bytes via
    /// [`Sender::write_payload`].
    pub fn begin_entry(&mut self, record: &FileRecord) -> Result<bool> {
        let prev = self.prev_info(record)?;
        let mut line = record.to_line();

        let write_header = !prev.found || prev.base_payload.is_some();
        if write_header {
            self.set_compress(true)?;
            self.data.add(record)?;
        }

        let mut need_fresh_data = false;
        if record.kind == Kind::File {
            let mut save_data = write_header && record.size > 0;
            if save_data {
                self.set_compress(!self.blacklist.matches(&record.filename))?;
                self.data.get_mut().finish_and_reset()?;
                let (slice, offset) = self.data.get_mut().get_mut().offset();
                let compressed_offset = self.data.get_mut().offset()?;
                line.push_str(&format!("\t{}", Locator { depth: 0, slice, offset, compressed_offset }.to_line()));

                if let Some(mut base_payload) = prev.base_payload {
                    self.copy_payload(&mut base_payload, record.size)?;
                    save_data = false;
                }
            } else if let Some(locator) = prev.file_offs {
                line.push('\t');
                line.push_str(&locator.to_line());
            }
            need_fresh_data = save_data;
        }

        line.push('\n');
        self.listing.write_all(line.as_bytes())?;
        Ok(need_fresh_data)
    }

    /// Relay `size` bytes of payload already decoded from the base archive
    /// into the new data stream.
    fn copy_payload(&mut self, source: &mut crate::gzip::GzipReader<crate::slice::SliceReader>, size: u64) -> Result<()> {
        let mut remaining = size;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = (remaining as usize).min(buf.len());
            source
                .read_exact(&mut buf[..want])
                .map_err(|e| Error::format(format!("failed to copy base payload: {e}")))?;
            let mut off = 0;
            while off < want {
                off += self.data.write_data(&buf[off..want])?;
            }
            remaining -= want as u64;
        }
        self.data.write_tail(false)?;
        Ok(())
    }

    /// Write fresh payload bytes for the entry [`Sender::begin_entry`] just
    /// reported as needing data.
    pub fn write_payload(&mut self, reader: &mut dyn Read, size: u64) -> Result<()> {
        let mut remaining = size;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = (remaining as usize).min(buf.len());
            reader.read_exact(&mut buf[..want])?;
            let mut off = 0;
            while off < want {
                off += self.data.write_data(&buf[off..want])?;
            }
            remaining -= want as u64;
        }
        self.data.write_tail(false)?;
        Ok(())
    }

    /// Convenience combining [`Sender::begin_entry`] and
    /// [`Sender::write_payload`] for the common local-filesystem case.
    pub fn send(&mut self, record: FileRecord, source: &mut dyn PayloadSource) -> Result<()> {
        let need = self.begin_entry(&record)?;
        if need {
            let mut r = source.open(&record)?;
            self.write_payload(&mut *r, record.size)?;
        }
        Ok(())
    }

    /// Append a `Merge` entry: the record's catalog line, with any existing
    /// payload locator pushed one level deeper (§4.F, Merge). No data is
    /// read or re-stored — merge never touches payload bytes, it only
    /// threads locators through an added level of indirection.
    pub fn merge_entry(&mut self, record: &FileRecord, locator: Option<Locator>) -> Result<()> {
        let mut line = record.to_line();
        if let Some(locator) = locator {
            line.push('\t');
            line.push_str(&locator.deeper().to_line());
        }
        line.push('\n');
        self.listing.write_all(line.as_bytes())?;
        Ok(())
    }

    fn trailer_record(&mut self, size: u64) -> FileRecord {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let mtime = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        FileRecord {
            filename: ".backup.info".to_string(),
            user: self.names.user_name(uid),
            group: self.names.group_name(gid),
            uid,
            gid,
            mode: 0o400,
            kind: Kind::File,
            mtime,
            size,
            ..Default::default()
        }
    }

    /// Finish the archive: close the data and listing gzip streams, relay
    /// the compressed listing and a freshly built trailer directly to the
    /// output (bypassing the data stream's own compressor), and return the
    /// inner writer so the caller can finalize it (e.g. invoke the upload
    /// hook on the last slice).
    pub fn write_footer(mut self, parts: Vec<String>) -> Result<W> {
        self.data.get_mut().finish_and_reset()?;

        self.listing.write_all(b"\n")?;
        self.listing.finish_and_reset()?;
        let listing_real_size = self.listing.total_in();
        let listing_size = fs::metadata(&self.listing_path)
            .map_err(|e| Error::filesystem(&self.listing_path, e))?
            .len();

        let mut header = String::new();
        header.push_str("listing_header=512\n");
        header.push_str(&format!("listing_real_size={listing_real_size}\n"));
        header.push_str(&format!("listing_size={listing_size}\n"));
        if !parts.is_empty() {
            header.push_str(&format!("parts={}\n", parts.join(" ")));
        }
        header.push_str("header_size=");

        let packed_header = pack_once(header.as_bytes())?;
        let header_size = packed_header.len() as u64;
        let digits = header_size.to_string();

        let trailer_size = listing_real_size + header.len() as u64 + digits.len() as u64;
        let info = self.trailer_record(trailer_size);
        self.data.add(&info)?;
        self.data.get_mut().finish_and_reset()?;

        self.relay_listing(listing_size)?;
        self.data.add_done((listing_real_size + header.len() as u64) as i64);

        self.data.get_mut().get_mut().write_all(&packed_header)?;
        self.data.write_data(digits.as_bytes())?;
        self.data.write_tail(true)?;
        self.data.get_mut().finish_and_reset()?;

        let _ = fs::remove_file(&self.listing_path);

        let data_gz = self.data.into_inner();
        Ok(data_gz.into_inner())
    }

    fn relay_listing(&mut self, listing_size: u64) -> Result<()> {
        let mut src = fs::File::open(&self.listing_path).map_err(|e| Error::filesystem(&self.listing_path, e))?;
        let mut save = match &self.listing_save_path {
            Some(p) => Some(fs::File::create(p).map_err(|e| Error::filesystem(p, e))?),
            None => None,
        };
        let mut remaining = listing_size;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = (remaining as usize).min(buf.len());
            src.read_exact(&mut buf[..want])?;
            self.data.get_mut().get_mut().write_all(&buf[..want])?;
            if let Some(save) = save.as_mut() {
                save.write_all(&buf[..want])?;
            }
            remaining -= want as u64;
        }
        Ok(())
    }
}

/// Built once the archive's final gzip-wrapped data stream is in place;
/// the production path always instantiates `Sender<SliceWriter>`.
impl Sender<SliceWriter> {
    pub fn create(
        base_name: impl Into<PathBuf>,
        slice_size: u64,
        upload_hook: Option<Hook>,
        base: Option<Catalog>,
        reference: bool,
    ) -> Result<Self> {
        let out = SliceWriter::create(base_name, slice_size, upload_hook)?;
        Self::new(out, base, reference)
    }

    /// Finish the archive and invoke the upload hook on the final slice.
    pub fn finish(self, parts: Vec<String>) -> Result<()> {
        let mut out = self.write_footer(parts)?;
        out.finish()
    }
}

/// Fuse several already-written archives into one, threading every existing
/// payload locator one level deeper rather than recompressing data (§4.F).
pub fn merge(
    out_name: impl Into<PathBuf>,
    slice_size: u64,
    upload_hook: Option<Hook>,
    sources: Vec<(Catalog, String)>,
) -> Result<()> {
    let mut sender = Sender::create(out_name, slice_size, upload_hook, None, true)?;
    let mut parts = Vec::new();

    for (index, (mut catalog, logical_name)) in sources.into_iter().enumerate() {
        if index > 0 {
            let boundary = boundary_record(index, &logical_name);
            sender.merge_entry(&boundary, None)?;
            parts.push(logical_name);
        }
        while let Some(entry) = catalog.next_entry()? {
            sender.merge_entry(&entry.record, entry.locator)?;
        }
    }

    sender.finish(parts)
}

fn boundary_record(index: usize, logical_name: &str) -> FileRecord {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let mtime = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    FileRecord {
        filename: format!("{PART_NAME_PREFIX}{index}"),
        linkname: logical_name.to_string(),
        uid,
        gid,
        mode: 0o600,
        kind: Kind::Symlink,
        mtime,
        ..Default::default()
    }
}

/// Reverse a `Merge`: read one merged archive's catalog and re-split it
/// into independent archives along the `@partname.K` boundaries recorded in
/// its `parts` trailer field.
pub fn split(
    mut source: Catalog,
    name_for_part: impl Fn(usize, &str) -> PathBuf,
    slice_size: u64,
    upload_hook: Option<Hook>,
    single_part: bool,
) -> Result<()> {
    let parts = source.trailer().parts.clone();
    if parts.is_empty() {
        return Err(Error::format("archive has no `parts` trailer field to split"));
    }

    let mut part_index = 0usize;
    let mut current = Some(Sender::create(
        name_for_part(part_index, &parts[part_index]),
        slice_size,
        upload_hook.clone(),
        None,
        true,
    )?);

    while let Some(entry) = source.next_entry()? {
        if entry.record.filename.starts_with(PART_NAME_PREFIX) {
            if entry.record.linkname != parts[part_index] {
                tracing::warn!(
                    expected = %parts[part_index],
                    got = %entry.record.linkname,
                    "unexpected part boundary name"
                );
            }
            if single_part {
                part_index += 1;
                continue;
            }
            if let Some(sender) = current.take() {
                sender.finish(Vec::new())?;
            }
            part_index += 1;
            if part_index >= parts.len() {
                break;
            }
            current = Some(Sender::create(
                name_for_part(part_index, &parts[part_index]),
                slice_size,
                upload_hook.clone(),
                None,
                true,
            )?);
            continue;
        }

        let locator = entry.locator.map(|l| l.shallower()).transpose()?;
        current
            .as_mut()
            .expect("a sender is always active between boundaries")
            .merge_entry(&entry.record, locator)?;
    }

    if let Some(sender) = current.take() {
        sender.finish(Vec::new())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_matches_suffix_case_sensitively() {
        let mut bl = CompressionBlacklist::new();
        bl.add(".gz");
        assert!(bl.matches("foo.gz"));
        assert!(!bl.matches("foo.GZ"));
        assert!(!bl.matches("foogz"));
    }

    #[test]
    fn fresh_entry_without_base_stores_data() {
        let dir = tempfile::tempdir().unwrap();
        let out = Vec::new();
        let mut sender = Sender::new(out, None, true).unwrap();
        let rec = FileRecord {
            filename: "hello.txt".into(),
            user: "u".into(),
            group: "g".into(),
            uid: 1,
            gid: 1,
            mode: 0o644,
            kind: Kind::File,
            size: 5,
            mtime: 1_700_000_000,
            ..Default::default()
        };
        let need = sender.begin_entry(&rec).unwrap();
        assert!(need);
        sender.write_payload(&mut &b"hello"[..], 5).unwrap();
        let data = sender.write_footer(Vec::new()).unwrap();
        assert!(!data.is_empty());
        drop(dir);
    }

    #[test]
    fn copy_mode_zero_size_match_resets_found_so_header_refires() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base");

        let rec = FileRecord {
            filename: "empty.txt".into(),
            user: "u".into(),
            group: "g".into(),
            uid: 1,
            gid: 1,
            mode: 0o644,
            kind: Kind::File,
            size: 0,
            mtime: 1_700_000_000,
            ..Default::default()
        };

        let mut base_sender = Sender::create(&base_path, 100 * 1024 * 1024, None, None, false).unwrap();
        let need = base_sender.begin_entry(&rec).unwrap();
        assert!(!need, "a zero-size file never needs fresh payload bytes");
        base_sender.finish(Vec::new()).unwrap();

        let base_catalog = Catalog::open(&base_path, None, None).unwrap();
        let mut incr = Sender::new(Vec::new(), Some(base_catalog), false).unwrap();
        let prev = incr.prev_info(&rec).unwrap();
        assert!(!prev.found, "copy mode must reset `found` for a matched zero-size file");
    }

    #[test]
    fn reference_mode_zero_size_match_keeps_found() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base");

        let rec = FileRecord {
            filename: "empty.txt".into(),
            user: "u".into(),
            group: "g".into(),
            uid: 1,
            gid: 1,
            mode: 0o644,
            kind: Kind::File,
            size: 0,
            mtime: 1_700_000_000,
            ..Default::default()
        };

        let mut base_sender = Sender::create(&base_path, 100 * 1024 * 1024, None, None, true).unwrap();
        base_sender.begin_entry(&rec).unwrap();
        base_sender.finish(Vec::new()).unwrap();

        let base_catalog = Catalog::open(&base_path, None, None).unwrap();
        let mut incr = Sender::new(Vec::new(), Some(base_catalog), true).unwrap();
        let prev = incr.prev_info(&rec).unwrap();
        assert!(prev.found, "reference mode has no header-refire reset for zero-size files");
    }

    #[test]
    fn directory_entry_needs_no_payload() {
        let out = Vec::new();
        let mut sender = Sender::new(out, None, false).unwrap();
        let rec = FileRecord {
            filename: "adir".into(),
            user: "u".into(),
            group: "g".into(),
            uid: 0,
            gid: 0,
            mode: 0o755,
            kind: Kind::Dir,
            ..Default::default()
        };
        let need = sender.begin_entry(&rec).unwrap();
        assert!(!need);
    }
}
