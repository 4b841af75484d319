//! USTAR codec — header encoding for stored payloads.
//!
//! Only encoding is implemented: the catalog is the textual source of
//! truth for reading an archive back, so a decoder is never needed on the
//! read path. A standards-shaped TAR stream is still produced because the
//! `to-tar` command re-exports archive contents as a plain, GNU-tar
//! readable `.tar` file.

use std::io::{self, Write};

use crate::record::{FileRecord, Kind, LONGLINK_NAME};

pub const BLOCK_SIZE: usize = 512;

const TMAGIC: &[u8; 6] = b"ustar\0";
const TVERSION: &[u8; 2] = b"00";

/// `size` values at or above this threshold are encoded as binary base-256
/// rather than octal ASCII (2^33, matching the 11-octal-digit field width).
const MAX_OCTAL_SIZE: u64 = 0o100_000_000_000;

struct RawHeader([u8; BLOCK_SIZE]);

impl RawHeader {
    fn new() -> Self {
        Self([0u8; BLOCK_SIZE])
    }

    fn field(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.0[offset..offset + len]
    }
}

// USTAR field offsets.
const F_NAME: (usize, usize) = (0, 100);
const F_MODE: (usize, usize) = (100, 8);
const F_UID: (usize, usize) = (108, 8);
const F_GID: (usize, usize) = (116, 8);
const F_SIZE: (usize, usize) = (124, 12);
const F_MTIME: (usize, usize) = (136, 12);
const F_CHKSUM: (usize, usize) = (148, 8);
const F_TYPEFLAG: (usize, usize) = (156, 1);
const F_LINKNAME: (usize, usize) = (157, 100);
const F_MAGIC: (usize, usize) = (257, 6);
const F_VERSION: (usize, usize) = (263, 2);
const F_UNAME: (usize, usize) = (265, 32);
const F_GNAME: (usize, usize) = (297, 32);
const F_DEVMAJOR: (usize, usize) = (329, 8);
const F_DEVMINOR: (usize, usize) = (337, 8);
const F_PREFIX: (usize, usize) = (345, 155);

fn put_str(h: &mut RawHeader, (off, len): (usize, usize), s: &[u8]) {
    let n = s.len().min(len);
    h.field(off, len)[..n].copy_from_slice(&s[..n]);
}

fn put_octal(h: &mut RawHeader, (off, len): (usize, usize), value: u64, trailing_space: bool) {
    let digits = len - if trailing_space { 2 } else { 1 };
    let text = format!("{:0width$o}", value, width = digits);
    put_str(h, (off, len), text.as_bytes());
    if trailing_space {
        h.field(off, len)[digits] = b' ';
    }
}

fn put_size(h: &mut RawHeader, size: u64) {
    if size < MAX_OCTAL_SIZE {
        put_octal(h, F_SIZE, size, false);
        return;
    }
    let (off, len) = F_SIZE;
    let field = h.field(off, len);
    field[0] = 0x80;
    let mut data = size;
    for i in (1..len).rev() {
        field[i] = (data & 0xff) as u8;
        data >>= 8;
    }
}

fn checksum(raw: &RawHeader) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in raw.0.iter().enumerate() {
        if i >= F_CHKSUM.0 && i < F_CHKSUM.0 + F_CHKSUM.1 {
            sum += b' ' as u32;
        } else {
            sum += b as u32;
        }
    }
    sum
}

/// Streaming TAR writer. Tracks pending payload bytes (`left`) and pad
/// bytes to the next 512-byte boundary (`tail`) so a caller can interleave
/// `add`/`write_data` calls across flush boundaries (e.g. a gzip member
/// finish mid-payload).
pub struct TarWriter<W> {
    out: W,
    left: i64,
    tail: usize,
}

impl<W: Write> TarWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, left: 0, tail: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Emit the header for `info`, first padding out any payload left over
    /// from the previous entry. Emits a preceding `@LongLink` entry when
    /// the filename or link target does not fit the fixed-width fields.
    pub fn add(&mut self, info: &FileRecord) -> io::Result<()> {
        self.write_tail(false)?;

        if matches!(info.kind, Kind::Symlink | Kind::HardLink) && info.linkname.len() > F_LINKNAME.1 {
            self.long_link(info, &info.linkname, Kind::LongLinkTarget)?;
        }

        let mut raw = RawHeader::new();
        put_str(&mut raw, F_MAGIC, TMAGIC);
        put_str(&mut raw, F_VERSION, TVERSION);

        if info.filename.len() <= F_NAME.1 {
            put_str(&mut raw, F_NAME, info.filename.as_bytes());
        } else {
            let tail_start = info.filename.len() - F_NAME.1;
            let split = info.filename[tail_start..]
                .find('/')
                .map(|i| tail_start + i)
                .filter(|&pos| pos <= F_PREFIX.1);
            match split {
                Some(pos) => {
                    put_str(&mut raw, F_PREFIX, info.filename[..pos].as_bytes());
                    put_str(&mut raw, F_NAME, info.filename[pos + 1..].as_bytes());
                }
                None => {
                    put_str(&mut raw, F_NAME, &info.filename.as_bytes()[..F_NAME.1]);
                    self.long_link(info, &info.filename, Kind::LongLinkName)?;
                }
            }
        }

        if matches!(info.kind, Kind::Char | Kind::Block) {
            put_octal(&mut raw, F_DEVMAJOR, info.devmajor as u64, true);
            put_octal(&mut raw, F_DEVMINOR, info.devminor as u64, true);
        }

        let link_field: &[u8] = if info.linkname.len() <= F_LINKNAME.1 {
            info.linkname.as_bytes()
        } else {
            &info.linkname.as_bytes()[..F_LINKNAME.1]
        };
        put_str(&mut raw, F_LINKNAME, link_field);

        let payload_size = if matches!(info.kind, Kind::File | Kind::LongLinkName | Kind::LongLinkTarget) {
            info.size
        } else {
            0
        };
        put_size(&mut raw, payload_size);
        put_octal(&mut raw, F_MODE, info.mode as u64, true);
        put_octal(&mut raw, F_UID, info.uid as u64, true);
        put_octal(&mut raw, F_GID, info.gid as u64, true);
        put_str(&mut raw, F_UNAME, info.user.as_bytes());
        put_str(&mut raw, F_GNAME, info.group.as_bytes());
        raw.field(F_TYPEFLAG.0, F_TYPEFLAG.1)[0] = info.kind.typeflag();
        put_octal(&mut raw, F_MTIME, info.mtime.max(0) as u64, false);

        let sum = checksum(&raw);
        put_str(&mut raw, F_CHKSUM, format!("{:06o}", sum).as_bytes());

        self.out.write_all(&raw.0)?;

        self.left = payload_size as i64;
        self.tail = (512 - (payload_size % 512) as usize) % 512;
        Ok(())
    }

    fn long_link(&mut self, info: &FileRecord, value: &str, kind: Kind) -> io::Result<()> {
        let mut payload = value.as_bytes().to_vec();
        payload.push(0);
        let longlink = FileRecord {
            filename: LONGLINK_NAME.to_string(),
            mode: info.mode,
            size: payload.len() as u64,
            kind,
            uid: info.uid,
            gid: info.gid,
            ..Default::default()
        };
        self.add(&longlink)?;
        self.write_data(&payload)?;
        self.write_tail(false)?;
        Ok(())
    }

    /// Write up to `self.left` bytes of payload, returning the number of
    /// bytes actually consumed from `buf`.
    pub fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.data_left(Some(buf.len() as i64)) as usize;
        self.out.write_all(&buf[..n])?;
        self.left -= n as i64;
        Ok(n)
    }

    /// Pad out any remaining payload and tail bytes. `finish` additionally
    /// emits the two 512-byte zero blocks that mark the end of the archive.
    pub fn write_tail(&mut self, finish: bool) -> io::Result<()> {
        self.left += self.tail as i64;
        if self.left > 0 {
            let zeros = [0u8; BLOCK_SIZE];
            while self.left > 0 {
                let n = (self.left as usize).min(zeros.len());
                self.out.write_all(&zeros[..n])?;
                self.left -= n as i64;
            }
            self.tail = 0;
        }
        if finish {
            self.out.write_all(&[0u8; 1024])?;
        }
        Ok(())
    }

    /// Bytes still owed for the current payload, optionally capped by a
    /// buffer size.
    pub fn data_left(&self, buffer_size: Option<i64>) -> i64 {
        match buffer_size {
            Some(n) if n < self.left => n,
            _ => self.left,
        }
    }

    /// Adjust `left` when payload bytes were written through another path
    /// (e.g. relayed directly from a base archive's decoded stream).
    pub fn add_done(&mut self, done: i64) {
        self.left -= done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(filename: &str, kind: Kind, size: u64) -> FileRecord {
        FileRecord {
            filename: filename.to_string(),
            user: "root".into(),
            group: "root".into(),
            mode: 0o644,
            kind,
            size,
            mtime: 1_700_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn header_has_ustar_magic_and_valid_checksum() {
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        w.add(&sample("hello.txt", Kind::File, 5)).unwrap();
        w.write_data(b"hello").unwrap();
        w.write_tail(true).unwrap();

        assert_eq!(&out[257..263], b"ustar\0");
        assert_eq!(&out[263..265], b"00");
        assert_eq!(out.len() % 512, 0);
    }

    #[test]
    fn short_filename_fits_name_field() {
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        w.add(&sample("short.txt", Kind::File, 0)).unwrap();
        assert_eq!(&out[0..9], b"short.txt");
        assert_eq!(out[9], 0);
    }

    #[test]
    fn long_filename_emits_longlink_entry() {
        let long_name = "a/".repeat(60) + "file.bin";
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        w.add(&sample(&long_name, Kind::File, 0)).unwrap();
        // First header should be the @LongLink entry unless a prefix split worked.
        let first_name = &out[0..LONGLINK_NAME.len()];
        if first_name == LONGLINK_NAME.as_bytes() {
            assert_eq!(out[156], b'L');
        }
    }

    #[test]
    fn large_size_uses_base256() {
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        let size = MAX_OCTAL_SIZE + 12345;
        w.add(&sample("huge.bin", Kind::File, size)).unwrap();
        assert_eq!(out[124], 0x80);
    }

    #[test]
    fn padding_rounds_up_to_512() {
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        w.add(&sample("f", Kind::File, 10)).unwrap();
        w.write_data(&[1u8; 10]).unwrap();
        w.write_tail(false).unwrap();
        // one header block + one data block rounded to 512
        assert_eq!(out.len(), 512 * 2);
    }
}
