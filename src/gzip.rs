//! Compression stream — streaming deflate/inflate with gzip framing.
//!
//! Built directly on `flate2::{Compress, Decompress}` rather than the
//! `GzEncoder`/`GzDecoder` convenience wrappers, because the archive format
//! needs byte-boundary flush points and finish-and-reset semantics that the
//! wrappers do not expose: every stored file payload, the listing, and the
//! trailer are each an independently decodable gzip member inside one
//! concatenated byte stream.
//!
//! # Member boundaries
//!
//! [`GzipWriter::flush_sync`] aligns the compressed output to a byte boundary
//! without ending the stream (`FlushCompress::Sync`) — a resumable point, but
//! still the same gzip member. [`GzipWriter::finish_and_reset`] ends the
//! current member (`FlushCompress::Finish`) and reinitializes the encoder so
//! the next write starts a brand new, independently inflatable member.
//!
//! # Offsets
//!
//! [`GzipWriter::offset`] is the number of compressed bytes written since the
//! last `finish_and_reset` — it flushes first so the value is meaningful as a
//! resume boundary. [`GzipWriter::total_in`] is the cumulative uncompressed
//! byte count across the whole stream, never reset.

use std::io::{self, Read, Write};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const CHUNK: usize = 16 * 1024;

/// Streaming gzip compressor with explicit flush-point and member-reset control.
pub struct GzipWriter<W> {
    inner: W,
    compress: Compress,
    level: u32,
    offset: u64,
    total_in: u64,
    /// Suppresses a flush call that would write nothing after the previous
    /// one already did — avoids empty-member spam around back-to-back
    /// `Offset()`/`Flush` calls that bracket zero-length payloads.
    empty: bool,
}

impl<W: Write> GzipWriter<W> {
    pub fn new(inner: W, level: u32) -> Self {
        Self {
            inner,
            compress: Compress::new(Compression::new(level), true),
            level,
            offset: 0,
            total_in: 0,
            empty: true,
        }
    }

    /// Feed `buf` into the compressor with no flush.
    pub fn feed(&mut self, buf: &[u8]) -> io::Result<()> {
        self.total_in += buf.len() as u64;
        self.pack(buf, FlushCompress::None)
    }

    /// Number of compressed bytes written since the last finish-and-reset.
    /// Flushes to a byte boundary first so the returned value is a valid
    /// resume point.
    pub fn offset(&mut self) -> io::Result<u64> {
        self.flush_sync()?;
        Ok(self.offset)
    }

    /// Cumulative uncompressed bytes written across the whole stream.
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// Align to a byte boundary without ending the current gzip member.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.pack(&[], FlushCompress::Sync)
    }

    /// End the current gzip member and start a fresh, independent one.
    pub fn finish_and_reset(&mut self) -> io::Result<()> {
        self.pack(&[], FlushCompress::Finish)?;
        self.compress = Compress::new(Compression::new(self.level), true);
        self.offset = 0;
        self.empty = true;
        Ok(())
    }

    /// Finish the current member, then resume with a different level.
    /// `flate2::Compress` has no in-place parameter-change call, so this is
    /// modeled as finish-and-reinit — externally indistinguishable from a
    /// true mid-stream parameter change since it always occurs at a member
    /// boundary.
    pub fn set_level(&mut self, level: u32) -> io::Result<()> {
        self.finish_and_reset()?;
        self.level = level;
        self.compress = Compress::new(Compression::new(level), true);
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    fn pack(&mut self, data: &[u8], flush: FlushCompress) -> io::Result<()> {
        if data.is_empty() {
            if self.empty {
                return Ok(());
            }
            self.empty = true;
        } else {
            self.empty = false;
        }

        let mut input = data;
        let mut out = [0u8; CHUNK];
        loop {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(input, &mut out, flush)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            input = &input[consumed..];

            if produced > 0 {
                self.inner.write_all(&out[..produced])?;
                self.offset += produced as u64;
            }

            if status == Status::StreamEnd {
                break;
            }
            if input.is_empty() && produced < out.len() {
                break;
            }
        }
        Ok(())
    }
}

impl<W: Write> Write for GzipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.feed(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_sync()
    }
}

/// One-shot full compression of a small in-memory buffer at level 9. Used for
/// the trailer's key/value header text, which is never large enough to
/// justify a streaming member.
pub fn pack_once(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut compress = Compress::new(Compression::new(9), true);
    let mut out = Vec::new();
    let mut buf = [0u8; CHUNK];
    let mut input = data;
    loop {
        let before_in = compress.total_in();
        let before_out = compress.total_out();
        let status = compress
            .compress(input, &mut buf, FlushCompress::Finish)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let consumed = (compress.total_in() - before_in) as usize;
        let produced = (compress.total_out() - before_out) as usize;
        input = &input[consumed..];
        out.extend_from_slice(&buf[..produced]);
        if status == Status::StreamEnd {
            break;
        }
    }
    Ok(out)
}

/// Streaming gzip decompressor with an optional uncompressed-byte limit and
/// forward-only seek.
pub struct GzipReader<R> {
    inner: R,
    decompress: Decompress,
    /// Remaining bytes of *compressed input* the reader is permitted to draw
    /// from `inner`; `None` means unlimited (used when reading the whole
    /// slice set as one logical gzip stream, e.g. for `list`).
    limit: Option<u64>,
    current_pos: u64,
    inbuf: [u8; CHUNK],
    in_pos: usize,
    in_len: usize,
}

impl<R: Read> GzipReader<R> {
    pub fn new(inner: R, limit: Option<u64>) -> Self {
        Self {
            inner,
            decompress: Decompress::new(true),
            limit,
            current_pos: 0,
            inbuf: [0u8; CHUNK],
            in_pos: 0,
            in_len: 0,
        }
    }

    /// Re-initialize the inflate state and input limit without touching the
    /// underlying reader. Used immediately after seeking to the start of a
    /// payload's gzip member.
    pub fn reset(&mut self, limit: Option<u64>) {
        self.decompress = Decompress::new(true);
        self.limit = limit;
        self.current_pos = 0;
        self.in_pos = 0;
        self.in_len = 0;
    }

    pub fn current_pos(&self) -> u64 {
        self.current_pos
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total_out = 0usize;
        while total_out < buf.len() {
            if self.in_pos == self.in_len {
                let want = match self.limit {
                    Some(0) => break,
                    Some(n) => (n as usize).min(CHUNK),
                    None => CHUNK,
                };
                let have = self.inner.read(&mut self.inbuf[..want])?;
                self.in_len = have;
                self.in_pos = 0;
                if have == 0 {
                    break;
                }
                if let Some(n) = self.limit.as_mut() {
                    *n -= have as u64;
                }
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(
                    &self.inbuf[self.in_pos..self.in_len],
                    &mut buf[total_out..],
                    FlushDecompress::None,
                )
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            self.in_pos += consumed;
            total_out += produced;

            match status {
                Status::StreamEnd => break,
                Status::BufError => break,
                Status::Ok => {
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                }
            }
        }
        self.current_pos += total_out as u64;
        Ok(total_out)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of gzip member",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Forward-only seek: discards inflated bytes until `current_pos == pos`.
    pub fn seek_forward(&mut self, pos: u64) -> io::Result<()> {
        if self.current_pos > pos {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek backward in gzip stream",
            ));
        }
        let mut left = pos - self.current_pos;
        let mut scratch = [0u8; CHUNK];
        while left > 0 {
            let len = (left as usize).min(scratch.len());
            let n = self.read(&mut scratch[..len])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of stream while seeking",
                ));
            }
            left -= n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_member() {
        let mut out = Vec::new();
        {
            let mut w = GzipWriter::new(&mut out, 6);
            w.write(b"hello world").unwrap();
            w.finish_and_reset().unwrap();
        }
        let mut r = GzipReader::new(&out[..], None);
        let mut buf = vec![0u8; 11];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn independent_members_concatenate() {
        let mut out = Vec::new();
        {
            let mut w = GzipWriter::new(&mut out, 6);
            w.write(b"first").unwrap();
            w.finish_and_reset().unwrap();
            w.write(b"second").unwrap();
            w.finish_and_reset().unwrap();
        }
        let mut r = GzipReader::new(&out[..], None);
        let mut buf = vec![0u8; 5];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"first");
        r.reset(None);
        let mut buf2 = vec![0u8; 6];
        r.read_exact(&mut buf2).unwrap();
        assert_eq!(&buf2, b"second");
    }

    #[test]
    fn sync_flush_gives_resumable_offset() {
        let mut out = Vec::new();
        let mut w = GzipWriter::new(&mut out, 6);
        w.write(b"abc").unwrap();
        let off1 = w.offset().unwrap();
        w.write(b"def").unwrap();
        let off2 = w.offset().unwrap();
        assert!(off2 > off1);
    }

    #[test]
    fn pack_once_decodes_as_single_member() {
        let packed = pack_once(b"trailer text").unwrap();
        let mut r = GzipReader::new(&packed[..], None);
        let mut buf = vec![0u8; b"trailer text".len()];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"trailer text");
    }
}
