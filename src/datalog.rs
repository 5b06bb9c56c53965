//! Append-only byte stream holding raw file-content bytes (spec §4.2).

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

/// The data log: one append-only writer, one positioned-read handle.
///
/// The write side is guarded by a single lock over `(append_offset,
/// write)`, per spec §5. The read side uses `pread`-style positioned
/// reads on an independent, lock-free handle (spec §4.2, Open Question
/// 4: the per-filesystem handle is pooled rather than reopened per
/// call, since positioned reads on a shared `File` are safe to run
/// concurrently with each other and with the writer).
pub struct DataLog {
    writer: Mutex<WriteState>,
    reader: File,
}

struct WriteState {
    file: File,
    offset: u64,
}

impl DataLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let write_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let offset = write_file.metadata()?.len();
        let reader = File::open(path)?;
        Ok(DataLog {
            writer: Mutex::new(WriteState {
                file: write_file,
                offset,
            }),
            reader,
        })
    }

    /// Append `buf`, returning the physical offset at which it landed.
    ///
    /// A short write is a hard I/O error; no retry happens here (spec
    /// §4.2).
    pub fn append(&self, buf: &[u8]) -> io::Result<u64> {
        let mut state = self.writer.lock();
        let offset = state.offset;
        let written = state.file.write_at(buf, offset)?;
        if written != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to data log",
            ));
        }
        state.offset += written as u64;
        Ok(offset)
    }

    /// Read exactly `dest.len()` bytes starting at physical `offset`.
    pub fn read_at(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        self.reader.read_exact_at(dest, offset)
    }

    /// Current append offset (end of the log).
    pub fn len(&self) -> u64 {
        self.writer.lock().offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_returns_sequential_offsets_and_round_trips() {
        let dir = tempdir().unwrap();
        let log = DataLog::open(&dir.path().join("data")).unwrap();

        let a = log.append(b"hello").unwrap();
        let b = log.append(b"world").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 5);
        assert_eq!(log.len(), 10);

        let mut buf = [0u8; 5];
        log.read_at(a, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        log.read_at(b, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn reopen_resumes_append_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let log = DataLog::open(&path).unwrap();
            log.append(b"abc").unwrap();
        }
        let log = DataLog::open(&path).unwrap();
        assert_eq!(log.len(), 3);
        let offset = log.append(b"de").unwrap();
        assert_eq!(offset, 3);
    }
}
