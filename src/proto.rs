//! Client/server wire framing (§4.H).
//!
//! The client walks a directory tree and streams metadata records to the
//! server over a pipe (typically an SSH session); the server runs the
//! normal [`crate::sender::Sender`] and asks the client for payload bytes
//! only for entries it actually needs to store. Every frame is a 16-bit
//! little-endian length prefix — explicit, never negotiated — followed by
//! that many bytes.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::record::FileRecord;
use crate::sender::{PayloadSource, Sender};
use crate::walk::Walker;

const CHUNK: usize = 64 * 1024;

/// Write one catalog line. An empty `line` signals end of stream.
pub fn write_line(w: &mut impl Write, line: &str) -> Result<()> {
    let bytes = line.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(Error::format("catalog line too long for client/server framing"));
    }
    w.write_u16::<LittleEndian>(bytes.len() as u16)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read one catalog line, or `None` at the `line_len == 0` EOF marker.
pub fn read_line(r: &mut impl Read) -> Result<Option<String>> {
    let len = r.read_u16::<LittleEndian>()?;
    if len == 0 {
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map(Some).map_err(|_| Error::format("catalog line is not utf-8"))
}

/// The server's need/no-need reply that follows each client line.
pub fn write_need_data(w: &mut impl Write, need: bool) -> Result<()> {
    w.write_u16::<LittleEndian>(if need { 1 } else { 0 })?;
    Ok(())
}

pub fn read_need_data(r: &mut impl Read) -> Result<bool> {
    Ok(r.read_u16::<LittleEndian>()? != 0)
}

/// Stream `size` bytes of payload as a sequence of length-prefixed chunks,
/// ending with a zero-length chunk.
pub fn write_payload(w: &mut impl Write, reader: &mut impl Read, mut size: u64) -> Result<()> {
    let mut buf = [0u8; CHUNK];
    while size > 0 {
        let want = (size as usize).min(buf.len());
        reader.read_exact(&mut buf[..want])?;
        w.write_u16::<LittleEndian>(want as u16)?;
        w.write_all(&buf[..want])?;
        size -= want as u64;
    }
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

/// Receive a chunked payload into `writer`.
pub fn read_payload(r: &mut impl Read, writer: &mut impl Write) -> Result<()> {
    loop {
        let len = r.read_u16::<LittleEndian>()?;
        if len == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)?;
        writer.write_all(&buf)?;
    }
}

/// Client side: walk `root` and stream every entry to `out`, answering the
/// server's need/no-need replies by sending (or skipping) payload bytes.
pub fn run_client(walker: &mut Walker, root: &std::path::Path, input: &mut impl Read, out: &mut impl Write) -> Result<()> {
    let records = walker.walk(root)?;
    let mut source = crate::sender::FsPayloadSource::new(root);
    for record in &records {
        write_line(out, &record.to_line())?;
        out.flush()?;
        if record.size == 0 || !read_need_data(input)? {
            continue;
        }
        let mut reader = source_reader(&mut source, record)?;
        write_payload(out, &mut reader, record.size)?;
        out.flush()?;
    }
    write_line(out, "")?;
    out.flush()?;
    Ok(())
}

fn source_reader<'a>(source: &'a mut crate::sender::FsPayloadSource, record: &FileRecord) -> Result<Box<dyn Read + 'a>> {
    source.open(record)
}

/// Server side: receive a stream of records from `input` and feed them to
/// `sender`, pulling payload bytes over `reply`/`input` only when the
/// sender actually needs fresh data.
pub fn run_server<W: Write>(sender: &mut Sender<W>, input: &mut impl Read, reply: &mut impl Write) -> Result<()> {
    loop {
        let Some(line) = read_line(input)? else { break };
        if line.is_empty() {
            break;
        }
        let (record, _rest) = FileRecord::parse(&line)?;
        let need = sender.begin_entry(&record)?;
        write_need_data(reply, need)?;
        reply.flush()?;
        if need {
            let mut buf = Vec::new();
            read_payload(input, &mut buf)?;
            sender.write_payload(&mut &buf[..], record.size)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_roundtrip_including_eof_marker() {
        let mut buf = Vec::new();
        write_line(&mut buf, "hello").unwrap();
        write_line(&mut buf, "").unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_line(&mut cursor).unwrap(), None);
    }

    #[test]
    fn need_data_roundtrip() {
        let mut buf = Vec::new();
        write_need_data(&mut buf, true).unwrap();
        write_need_data(&mut buf, false).unwrap();
        let mut cursor = &buf[..];
        assert!(read_need_data(&mut cursor).unwrap());
        assert!(!read_need_data(&mut cursor).unwrap());
    }

    #[test]
    fn payload_chunks_roundtrip() {
        let data = vec![7u8; 200_000];
        let mut buf = Vec::new();
        write_payload(&mut buf, &mut &data[..], data.len() as u64).unwrap();
        let mut out = Vec::new();
        let mut cursor = &buf[..];
        read_payload(&mut cursor, &mut out).unwrap();
        assert_eq!(out, data);
    }
}
