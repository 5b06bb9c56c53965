//! Wire schema for metadata log records and the varint length framing
//! (spec §4.3, §6; Open Question 1 resolved in favor of varint).

use std::io;
use std::io::Read;
use std::io::Write;

use serde::Deserialize;
use serde::Serialize;

/// One `{start, end, base}` interval as persisted in a `contents` list.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentEntry {
    pub start: u64,
    pub end: u64,
    /// Physical data-log offset of logical byte 0 of this interval. May
    /// be negative relative to `start` when the interval's base offset
    /// predates a later, larger logical offset.
    pub base: i64,
}

/// One xattr name/value pair as persisted in an `xattr` list.
///
/// Not part of spec.md's node snapshot schema (§6); supplemented so
/// that extended attributes survive a remount the same way attributes
/// and content do (see SPEC_FULL.md).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct XattrEntry {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// A single metadata log record: a (possibly partial) snapshot update
/// for one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: u64,
    pub parent_id: u64,
    pub name: Vec<u8>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: (i64, u32),
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
    pub size: u64,
    pub symlink: Vec<u8>,
    pub valid: bool,
    /// `None` means "leave the running snapshot's contents untouched";
    /// `Some` replaces it wholesale (spec §4.3).
    pub contents: Option<Vec<ContentEntry>>,
    /// Same replace-on-present discipline as `contents` (SPEC_FULL.md
    /// supplement).
    pub xattr: Option<Vec<XattrEntry>>,
}

/// Write an unsigned LEB128 varint, at most 10 bytes.
pub fn write_varint<W: Write>(w: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        w.write_all(&[byte])?;
        if value == 0 {
            break;
        }
    }
    Ok(())
}

/// Read an unsigned LEB128 varint. Returns `Ok(None)` if the stream is
/// at a clean EOF before any byte of the varint was read (a fully
/// written log ends here); returns `Err` if EOF occurs mid-varint (a
/// torn write).
pub fn read_varint<R: Read>(r: &mut R) -> io::Result<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];
    for i in 0..10 {
        match r.read(&mut byte)? {
            0 if i == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated varint length prefix",
                ));
            }
            _ => {}
        }
        result |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(result));
        }
        shift += 7;
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint longer than 10 bytes",
    ))
}

/// Serialize and append-frame a record: `varint(len) || body`.
pub fn encode_record(record: &NodeRecord) -> io::Result<Vec<u8>> {
    let body = bincode::serialize(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut framed = Vec::with_capacity(body.len() + 10);
    write_varint(&mut framed, body.len() as u64)?;
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Read one framed record from `r`. Returns `Ok(None)` on clean EOF
/// between records; a short/truncated body is reported the same as a
/// truncated length prefix (both mean "stop replay here", spec §4.3).
pub fn decode_record<R: Read>(r: &mut R) -> io::Result<Option<NodeRecord>> {
    let len = match read_varint(r)? {
        Some(len) => len as usize,
        None => return Ok(None),
    };
    let mut body = vec![0u8; len];
    match r.read_exact(&mut body) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let record = bincode::deserialize(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips_small_and_large_values() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            assert!(buf.len() <= 10);
            let mut cursor = &buf[..];
            assert_eq!(read_varint(&mut cursor).unwrap(), Some(value));
        }
    }

    #[test]
    fn record_round_trips_through_encode_decode() {
        let record = NodeRecord {
            node_id: 5,
            parent_id: 1,
            name: b"f".to_vec(),
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            nlink: 1,
            atime: (10, 0),
            mtime: (10, 0),
            ctime: (10, 0),
            size: 5,
            symlink: Vec::new(),
            valid: true,
            contents: Some(vec![ContentEntry {
                start: 0,
                end: 4,
                base: 0,
            }]),
            xattr: None,
        };
        let framed = encode_record(&record).unwrap();
        let mut cursor = &framed[..];
        let decoded = decode_record(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.node_id, record.node_id);
        assert_eq!(decoded.contents, record.contents);
    }

    #[test]
    fn truncated_length_prefix_is_clean_eof() {
        let mut cursor: &[u8] = &[];
        assert!(decode_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_body_is_reported_as_eof_not_error() {
        let record = NodeRecord {
            node_id: 1,
            parent_id: 0,
            name: Vec::new(),
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
            atime: (0, 0),
            mtime: (0, 0),
            ctime: (0, 0),
            size: 0,
            symlink: Vec::new(),
            valid: true,
            contents: None,
            xattr: None,
        };
        let framed = encode_record(&record).unwrap();
        let torn = &framed[..framed.len() - 1];
        let mut cursor = torn;
        assert!(decode_record(&mut cursor).unwrap().is_none());
    }
}
