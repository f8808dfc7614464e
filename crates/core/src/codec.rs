//! Small binary helpers shared by the on-disk formats.
//!
//! Integers are LEB128 varints; strings are a varint byte length followed
//! by UTF-8 bytes.

use std::io::{self, Read, Write};

use crate::{InfinityError, Result};

pub(crate) fn write_varint<W: Write>(out: &mut W, mut value: u64) -> io::Result<()> {
    let mut buf = [0u8; 10];
    let mut len = 0;
    while value >= 0x80 {
        buf[len] = (value as u8) | 0x80;
        value >>= 7;
        len += 1;
    }
    buf[len] = value as u8;
    out.write_all(&buf[..=len])
}

/// Reads one varint. `Ok(None)` means the stream ended cleanly before the
/// first byte.
pub(crate) fn read_varint<R: Read>(input: &mut R) -> Result<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match input.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if first && e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(InfinityError::Corrupted("truncated varint".into()))
            }
            Err(e) => return Err(e.into()),
        }
        first = false;
        result |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(result));
        }
        shift += 7;
        if shift >= 64 {
            return Err(InfinityError::Corrupted("varint too long".into()));
        }
    }
}

/// Like [`read_varint`] but a clean end of stream is also corruption.
pub(crate) fn require_varint<R: Read>(input: &mut R) -> Result<u64> {
    read_varint(input)?.ok_or_else(|| InfinityError::Corrupted("unexpected end of data".into()))
}

pub(crate) fn write_str<W: Write>(out: &mut W, value: &str) -> io::Result<()> {
    write_varint(out, value.len() as u64)?;
    out.write_all(value.as_bytes())
}

pub(crate) fn read_str<R: Read>(input: &mut R) -> Result<String> {
    let len = require_varint(input)?;
    if len > u32::MAX as u64 {
        return Err(InfinityError::Corrupted(format!("string of {len} bytes")));
    }
    let mut bytes = vec![0u8; len as usize];
    input.read_exact(&mut bytes).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => InfinityError::Corrupted("truncated string".into()),
        _ => InfinityError::Io(e),
    })?;
    String::from_utf8(bytes).map_err(|e| InfinityError::Corrupted(e.to_string()))
}

/// Reads and checks a four-byte format tag.
pub(crate) fn expect_magic<R: Read>(input: &mut R, magic: &[u8; 4]) -> Result<()> {
    let mut found = [0u8; 4];
    input.read_exact(&mut found).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => InfinityError::Corrupted("missing header".into()),
        _ => InfinityError::Io(e),
    })?;
    if &found != magic {
        return Err(InfinityError::Corrupted(format!(
            "bad header {:?}, expected {:?}",
            String::from_utf8_lossy(&found),
            String::from_utf8_lossy(magic)
        )));
    }
    Ok(())
}
