//! Catalog reader — trailer tail-discovery and listing iteration.
//!
//! The trailer is the very last gzip member of a slice set and is not
//! addressed by any stored offset; it is found by brute-force reverse scan,
//! matching `isptar`'s original `GetHeader()` algorithm byte for byte.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::gzip::GzipReader;
use crate::hook::Hook;
use crate::slice::SliceReader;

const MIN_TAILSIZE: usize = 20;
const MAX_TAILSIZE: usize = 39;
/// `tar` always pads with at least a kilobyte of trailing zeros; the
/// trailer text itself is always far smaller than this.
const HEADER_SCRATCH: usize = 512 * 4;

/// Reverse-scan the slice set's tail for the `header_size=<digits>` sentinel
/// and return the parsed key/value header plus the discovered real size of
/// the trailer's compressed member.
pub fn get_header(reader: &mut SliceReader) -> Result<(HashMap<String, String>, u64)> {
    reader.seek_from_end(-(MAX_TAILSIZE as i64))?;
    let mut inbuf = [0u8; MAX_TAILSIZE];
    let size = read_fill(reader, &mut inbuf)?;
    if size < MIN_TAILSIZE {
        return Err(Error::format("slice set too small to hold a trailer"));
    }

    for i in (0..=size - MIN_TAILSIZE).rev() {
        let mut decompress = Decompress::new(true);
        let mut outbuf = [0u8; HEADER_SCRATCH];
        let status = decompress
            .decompress(&inbuf[i..size], &mut outbuf, FlushDecompress::Finish)
            .unwrap_or(Status::BufError);
        if !matches!(status, Status::StreamEnd | Status::BufError) {
            continue;
        }
        if decompress.total_out() == 0 {
            continue;
        }

        let header_size = parse_leading_int(&outbuf) as u64;
        let real_header_size = (size - i) as u64 + header_size;

        reader.seek_from_end(-(real_header_size as i64))?;
        let header_text = read_member(reader, header_size)?;
        match parse_header_text(&header_text, real_header_size) {
            Some(map) => return Ok((map, real_header_size)),
            None => continue,
        }
    }
    Err(Error::format("no valid trailer found in slice set tail"))
}

fn read_fill(reader: &mut SliceReader, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    loop {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|e| Error::format(format!("failed to read archive tail: {e}")))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_member(reader: &mut SliceReader, size: u64) -> Result<String> {
    let mut decompress = Decompress::new(true);
    let mut inbuf = [0u8; 4096];
    let mut out = Vec::new();
    let mut remaining = size;
    while remaining > 0 {
        let want = (remaining as usize).min(inbuf.len());
        let n = reader
            .read(&mut inbuf[..want])
            .map_err(|e| Error::format(format!("failed to read trailer header: {e}")))?;
        if n != want {
            return Err(Error::format("short read while decoding trailer header"));
        }
        remaining -= n as u64;
        let mut scratch = [0u8; HEADER_SCRATCH];
        let flush = if remaining == 0 { FlushDecompress::Finish } else { FlushDecompress::None };
        let before_out = decompress.total_out();
        decompress
            .decompress(&inbuf[..n], &mut scratch, flush)
            .map_err(|e| Error::format(format!("bad trailer gzip member: {e}")))?;
        let produced = (decompress.total_out() - before_out) as usize;
        out.extend_from_slice(&scratch[..produced]);
    }
    String::from_utf8(out).map_err(|_| Error::format("trailer header is not valid utf-8"))
}

fn parse_leading_int(buf: &[u8]) -> u64 {
    let mut n = 0u64;
    for &b in buf {
        if b.is_ascii_digit() {
            n = n * 10 + (b - b'0') as u64;
        } else {
            break;
        }
    }
    n
}

/// Parse `key=value\n` lines; the last line (no trailing newline) must be
/// `header_size=...` and its stored digits are discarded in favor of the
/// caller-supplied `real_header_size`.
fn parse_header_text(text: &str, real_header_size: u64) -> Option<HashMap<String, String>> {
    let mut result = HashMap::new();
    let mut start = 0;
    loop {
        let eq = text[start..].find('=')? + start;
        let name = &text[start..eq];
        let value_start = eq + 1;
        match text[value_start..].find('\n') {
            Some(nl_rel) => {
                let nl = value_start + nl_rel;
                result.insert(name.to_string(), text[value_start..nl].to_string());
                start = nl + 1;
            }
            None => {
                if name == "header_size" {
                    result.insert(name.to_string(), real_header_size.to_string());
                    return Some(result);
                }
                return None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Locator {
    pub depth: u32,
    pub slice: u32,
    pub offset: u64,
    pub compressed_offset: u64,
}

impl Locator {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let mut next = || parts.next().ok_or_else(|| Error::format(format!("malformed locator `{s}`")));
        let depth = next()?.parse().map_err(|_| Error::format(format!("bad locator `{s}`")))?;
        let slice = next()?.parse().map_err(|_| Error::format(format!("bad locator `{s}`")))?;
        let offset = next()?.parse().map_err(|_| Error::format(format!("bad locator `{s}`")))?;
        let compressed_offset = next()?.parse().map_err(|_| Error::format(format!("bad locator `{s}`")))?;
        Ok(Self { depth, slice, offset, compressed_offset })
    }

    pub fn to_line(self) -> String {
        format!("{}:{}:{}:{}", self.depth, self.slice, self.offset, self.compressed_offset)
    }

    /// A locator re-emitted one level deeper, used when forwarding a
    /// reference found in a base archive's own catalog.
    pub fn deeper(self) -> Self {
        Self { depth: self.depth + 1, ..self }
    }

    /// Inverse of [`Locator::deeper`], used by `Split` to remove the one
    /// level of indirection a prior `Merge` added.
    pub fn shallower(self) -> Result<Self> {
        self.depth
            .checked_sub(1)
            .map(|depth| Self { depth, ..self })
            .ok_or_else(|| Error::format("locator depth underflow during split"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Trailer {
    pub listing_header: u64,
    pub listing_size: u64,
    pub listing_real_size: u64,
    pub parts: Vec<String>,
    pub header_size: u64,
}

impl Trailer {
    pub fn from_map(map: &HashMap<String, String>, header_size: u64) -> Result<Self> {
        let get = |k: &str| -> Result<u64> {
            map.get(k)
                .ok_or_else(|| Error::format(format!("trailer missing `{k}`")))?
                .parse()
                .map_err(|_| Error::format(format!("trailer field `{k}` is not numeric")))
        };
        Ok(Self {
            listing_header: map.get("listing_header").and_then(|v| v.parse().ok()).unwrap_or(512),
            listing_size: get("listing_size")?,
            listing_real_size: get("listing_real_size")?,
            parts: map
                .get("parts")
                .map(|s| s.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
            header_size,
        })
    }
}

/// One open archive's catalog, optionally chained to a base archive whose
/// own catalog resolves locators at `depth > 0`.
pub struct Catalog {
    base_name: PathBuf,
    hook: Option<Hook>,
    trailer: Trailer,
    listing: GzipReader<SliceReader>,
    base: Option<Box<Catalog>>,
}

pub struct CatalogEntry {
    pub raw_line: String,
    pub record: crate::record::FileRecord,
    pub locator: Option<Locator>,
}

impl Catalog {
    pub fn open(base_name: impl Into<PathBuf>, hook: Option<Hook>, base: Option<Box<Catalog>>) -> Result<Self> {
        let base_name = base_name.into();
        let mut reader = SliceReader::open(&base_name, hook.clone())?;
        let (map, header_size) = get_header(&mut reader)?;
        let trailer = Trailer::from_map(&map, header_size)?;

        let listing_offset = trailer.listing_size + trailer.header_size;
        reader.seek_from_end(-(listing_offset as i64))?;
        let listing = GzipReader::new(reader, Some(trailer.listing_size));

        Ok(Self { base_name, hook, trailer, listing, base })
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    pub fn base(&self) -> Option<&Catalog> {
        self.base.as_deref()
    }

    pub fn base_name(&self) -> &std::path::Path {
        &self.base_name
    }

    fn next_raw_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let mut byte = [0u8];
        loop {
            let n = self
                .listing
                .read(&mut byte)
                .map_err(|e| Error::format(format!("failed to read catalog line: {e}")))?;
            if n == 0 {
                return Ok(if buf.is_empty() { None } else { Some(String::from_utf8(buf).map_err(|_| Error::format("catalog line is not utf-8"))?) });
            }
            if byte[0] == b'\n' {
                return Ok(Some(String::from_utf8(buf).map_err(|_| Error::format("catalog line is not utf-8"))?));
            }
            buf.push(byte[0]);
        }
    }

    /// Read and parse the next catalog entry, or `None` at end of listing.
    pub fn next_entry(&mut self) -> Result<Option<CatalogEntry>> {
        let Some(raw_line) = self.next_raw_line()? else {
            return Ok(None);
        };
        let (record, rest) = crate::record::FileRecord::parse(&raw_line)?;
        let locator = if rest.is_empty() { None } else { Some(Locator::parse(&rest)?) };
        Ok(Some(CatalogEntry { raw_line, record, locator }))
    }

    /// Open the payload addressed by `locator`, walking `locator.depth`
    /// bases and returning a gzip reader over the payload's own gzip
    /// member. The member's `Z_FINISH` boundary (`Status::StreamEnd`), not
    /// a byte count, ends the read — `GzipReader`'s `limit` bounds
    /// *compressed* input, and gzip framing overhead can make the
    /// compressed size exceed the uncompressed size for small or
    /// incompressible payloads, so passing `uncompressed_size` as that
    /// limit would truncate the read.
    pub fn open_payload(&self, locator: &Locator) -> Result<GzipReader<SliceReader>> {
        let mut target = self;
        for _ in 0..locator.depth {
            target = target
                .base
                .as_deref()
                .ok_or_else(|| Error::format("locator depth exceeds base chain length"))?;
        }
        let mut reader = SliceReader::open(&target.base_name, target.hook.clone())?;
        reader.seek_to(locator.slice, locator.offset)?;
        Ok(GzipReader::new(reader, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gzip::{pack_once, GzipWriter};
    use std::io::Write as _;

    /// `header_size` names its own compressed length, so the trailer text
    /// is found by iterating to a fixed point.
    fn pack_trailer(prefix: &str) -> Vec<u8> {
        let mut guess = 1u64;
        for _ in 0..10 {
            let candidate = format!("{prefix}header_size={guess}");
            let packed = pack_once(candidate.as_bytes()).unwrap();
            if packed.len() as u64 == guess {
                return packed;
            }
            guess = packed.len() as u64;
        }
        panic!("header_size fixed point did not converge");
    }

    fn build_trivial_archive(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("arc");
        let mut w = crate::slice::SliceWriter::create(&path, 1 << 30, None).unwrap();

        // catalog member: a single directory entry.
        let mut listing = Vec::new();
        {
            let mut gz = GzipWriter::new(&mut listing, 9);
            gz.write(b"d\troot#0\troot#0\t755\tdir\n").unwrap();
            gz.finish_and_reset().unwrap();
        }
        w.write_all(&listing).unwrap();

        let header = format!(
            "listing_header=512\nlisting_size={}\nlisting_real_size={}\n",
            listing.len(),
            "d\troot#0\troot#0\t755\tdir\n".len()
        );
        let packed = pack_trailer(&header);
        w.write_all(&packed).unwrap();
        w.finish().unwrap();
        path
    }

    #[test]
    fn get_header_finds_trailer_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_trivial_archive(dir.path());
        let mut reader = SliceReader::open(&path, None).unwrap();
        let (map, _real_size) = get_header(&mut reader).unwrap();
        assert!(map.contains_key("listing_size"));
        assert!(map.contains_key("header_size"));
    }

    #[test]
    fn catalog_open_reads_trailer_and_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_trivial_archive(dir.path());
        let mut catalog = Catalog::open(&path, None, None).unwrap();
        let entry = catalog.next_entry().unwrap().unwrap();
        assert_eq!(entry.record.kind, crate::record::Kind::Dir);
        assert!(catalog.next_entry().unwrap().is_none());
    }

    #[test]
    fn locator_roundtrip() {
        let loc = Locator { depth: 1, slice: 3, offset: 4096, compressed_offset: 0 };
        let line = loc.to_line();
        assert_eq!(line, "1:3:4096:0");
        let parsed = Locator::parse(&line).unwrap();
        assert_eq!(parsed.slice, 3);
        assert_eq!(parsed.deeper().depth, 2);
    }
}
