//! Buffered streams over positioned I/O.
//!
//! PDLFS only offers unbuffered `pread`/`pwrite`, so stream semantics are
//! rebuilt here: one contiguous pending write region, a logical offset, and
//! a known size that tracks the high-water mark of everything written.

use std::io::SeekFrom;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::error::{PreloadError, PreloadResult};
use crate::ops::FileOps;
use crate::types::{OpenFlags, StreamState};

/// Pending bytes at which a write triggers a flush.
pub const CAPACITY: usize = 4096;

/// Permission bits for files created by a stream open.
pub const FILE_MODE: u32 = 0o666;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Ready,
    /// Sticky until cleared or seeked past.
    Eof,
    /// Sticky until cleared; holds the error that caused it.
    Failed(PreloadError),
    Closed,
}

/// A buffered stream on one backend descriptor.
pub struct BufferedFile {
    backend: Arc<dyn FileOps>,
    fd: RawFd,
    append: bool,
    status: Status,
    pending: Vec<u8>,
    pending_start: u64,
    offset: u64,
    size: u64,
}

impl std::fmt::Debug for BufferedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedFile")
            .field("backend", &self.backend.name())
            .field("fd", &self.fd)
            .field("append", &self.append)
            .field("status", &self.status)
            .field("pending", &self.pending.len())
            .field("pending_start", &self.pending_start)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl BufferedFile {
    /// Open `path` on `backend` with a stream mode (`r`, `w+`, `a`, ...).
    ///
    /// The known size starts at the size the backend reports. In append
    /// modes every write lands at the end of the file; the backend itself
    /// is opened without an append flag.
    pub fn open(backend: Arc<dyn FileOps>, path: &str, mode: &str) -> PreloadResult<Self> {
        let flags = OpenFlags::from_mode(mode)
            .ok_or_else(|| PreloadError::invalid_argument(format!("bad stream mode {mode:?}")))?;
        let (fd, stat) = backend.open_with_stat(path, flags.without_append(), FILE_MODE)?;
        Ok(Self::new(backend, fd, stat.size, flags.append))
    }

    /// Wrap an already-open backend descriptor.
    pub fn new(backend: Arc<dyn FileOps>, fd: RawFd, size: u64, append: bool) -> Self {
        Self {
            backend,
            fd,
            append,
            status: Status::Ready,
            pending: Vec::with_capacity(CAPACITY),
            pending_start: if append { size } else { 0 },
            offset: 0,
            size,
        }
    }

    /// Sticky state check shared by every I/O entry point.
    fn usable(&self) -> PreloadResult<()> {
        match &self.status {
            Status::Failed(e) => Err(e.clone()),
            Status::Closed => Err(PreloadError::Closed),
            Status::Ready | Status::Eof => Ok(()),
        }
    }

    fn fail(&mut self, err: PreloadError) -> PreloadError {
        self.status = Status::Failed(err.clone());
        err
    }

    fn grow(&mut self, end: u64) {
        self.size = self.size.max(end);
    }

    fn pending_end(&self) -> u64 {
        self.pending_start + self.pending.len() as u64
    }

    /// Read into `buf` at the logical offset.
    ///
    /// Pending writes are flushed first. A short count sets end-of-file but
    /// still returns the bytes obtained; once end-of-file is set, reads
    /// return 0 until [`clear_error`](Self::clear_error) or a seek.
    pub fn read(&mut self, buf: &mut [u8]) -> PreloadResult<usize> {
        self.usable()?;
        if self.status == Status::Eof {
            return Ok(0);
        }
        self.flush(true)?;

        match self.backend.pread(self.fd, buf, self.offset) {
            Ok(n) => {
                self.offset += n as u64;
                if n < buf.len() {
                    self.status = Status::Eof;
                }
                self.grow(self.offset);
                Ok(n)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Write `buf`, returning the number of bytes accepted.
    ///
    /// Contiguous writes accumulate in the pending region and reach the
    /// backend once it holds [`CAPACITY`] bytes. A write elsewhere flushes
    /// the region and goes straight to the backend. In append mode a new
    /// region always starts at the backend's current end-of-file.
    ///
    /// Once bytes are buffered the write succeeds. If the threshold flush
    /// then fails, the stream enters the error state and the failure is
    /// reported by [`is_error`](Self::is_error), the next flush or close.
    pub fn write(&mut self, buf: &[u8]) -> PreloadResult<usize> {
        self.usable()?;
        if self.append {
            return self.append(buf);
        }

        if self.pending.is_empty() {
            self.pending_start = self.offset;
        }
        if self.offset == self.pending_end() {
            self.pending.extend_from_slice(buf);
            self.offset += buf.len() as u64;
            self.grow(self.offset);
            self.flush_threshold();
            return Ok(buf.len());
        }

        self.flush(true)?;
        match self.backend.pwrite(self.fd, buf, self.offset) {
            Ok(n) if n == buf.len() => {
                self.offset += n as u64;
                self.grow(self.offset);
                Ok(n)
            }
            Ok(n) => Err(self.fail(PreloadError::ShortWrite {
                expected: buf.len(),
                written: n,
            })),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn append(&mut self, buf: &[u8]) -> PreloadResult<usize> {
        if self.pending.is_empty() {
            // Other handles may have grown the file since we last looked.
            match self.backend.fstat(self.fd) {
                Ok(stat) => self.grow(stat.size),
                Err(e) => return Err(self.fail(e)),
            }
            self.pending_start = self.size;
        }
        self.pending.extend_from_slice(buf);
        self.offset = self.pending_end();
        self.grow(self.offset);
        self.flush_threshold();
        Ok(buf.len())
    }

    // The bytes already count as written, so a failure here only leaves the
    // sticky error behind.
    fn flush_threshold(&mut self) {
        if let Err(e) = self.flush(false) {
            tracing::debug!(
                fd = self.fd,
                pending = self.pending.len(),
                "deferred flush failed: {e}"
            );
        }
    }

    /// Write out the pending region.
    ///
    /// Unless `force` is set, only a region of at least [`CAPACITY`] bytes
    /// is written. A failed or partial write sets the error state and keeps
    /// the region intact.
    pub fn flush(&mut self, force: bool) -> PreloadResult<()> {
        self.usable()?;
        if self.pending.is_empty() || (!force && self.pending.len() < CAPACITY) {
            return Ok(());
        }

        match self.backend.pwrite(self.fd, &self.pending, self.pending_start) {
            Ok(n) if n == self.pending.len() => {
                self.pending_start += n as u64;
                self.pending.clear();
                Ok(())
            }
            Ok(n) => {
                let expected = self.pending.len();
                Err(self.fail(PreloadError::ShortWrite {
                    expected,
                    written: n,
                }))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Move the logical offset and clear end-of-file.
    ///
    /// `End` is relative to the known size. Nothing is flushed. A target
    /// before the start of the file or past `i64::MAX` is rejected and
    /// leaves the stream as it was.
    pub fn seek(&mut self, pos: SeekFrom) -> PreloadResult<u64> {
        if self.status == Status::Closed {
            return Err(PreloadError::Closed);
        }
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        }
        .filter(|target| i64::try_from(*target).is_ok())
        .ok_or_else(|| PreloadError::invalid_argument(format!("seek out of range: {pos:?}")))?;

        self.offset = target;
        if self.status == Status::Eof {
            self.status = Status::Ready;
        }
        Ok(target)
    }

    /// The logical offset.
    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// Flush and release the backend descriptor.
    ///
    /// The descriptor is closed even if the flush fails, and the flush error
    /// is the one reported. The stream is unusable afterwards.
    pub fn close(&mut self) -> PreloadResult<()> {
        if self.status == Status::Closed {
            return Err(PreloadError::Closed);
        }
        let flushed = self.flush(true);
        let closed = self.backend.close(self.fd);
        self.status = Status::Closed;
        self.pending.clear();
        flushed.and(closed)
    }

    /// Clear the sticky error and end-of-file conditions.
    pub fn clear_error(&mut self) {
        if matches!(self.status, Status::Eof | Status::Failed(_)) {
            self.status = Status::Ready;
        }
    }

    /// Returns true if an error is pending.
    pub fn is_error(&self) -> bool {
        matches!(self.status, Status::Failed(_))
    }

    /// Returns true if a read reached end-of-file.
    pub fn is_eof(&self) -> bool {
        self.status == Status::Eof
    }

    /// The error that put the stream in the error state.
    pub fn error(&self) -> Option<&PreloadError> {
        match &self.status {
            Status::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Observable state.
    pub fn state(&self) -> StreamState {
        match self.status {
            Status::Closed => StreamState::Closed,
            Status::Failed(_) => StreamState::Error,
            Status::Eof => StreamState::Eof,
            Status::Ready if self.pending.is_empty() => StreamState::Clean,
            Status::Ready => StreamState::Dirty,
        }
    }

    /// Known file size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes waiting in the pending region.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if the stream was opened in an append mode.
    pub fn is_append(&self) -> bool {
        self.append
    }

    /// Name of the backend serving this stream.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

impl Drop for BufferedFile {
    fn drop(&mut self) {
        if self.status != Status::Closed {
            if let Err(e) = self.close() {
                tracing::warn!(
                    fd = self.fd,
                    backend = self.backend.name(),
                    "stream dropped with error: {e}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use rustix::io::Errno;

    fn setup() -> (Arc<MemoryBackend>, Arc<dyn FileOps>) {
        let mem = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn FileOps> = mem.clone();
        (mem, backend)
    }

    fn seed(mem: &MemoryBackend, path: &str, data: &[u8]) {
        let fd = mem.open(path, OpenFlags::create(), 0o644).unwrap();
        mem.pwrite(fd, data, 0).unwrap();
        mem.close(fd).unwrap();
    }

    #[test]
    fn test_write_seek_read() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w+").unwrap();

        assert_eq!(file.write(b"xxx").unwrap(), 3);
        assert_eq!(file.state(), StreamState::Dirty);
        assert_eq!(mem.write_calls(), 0);

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"xxx");
        assert_eq!(mem.write_calls(), 1);

        file.close().unwrap();
        assert_eq!(mem.contents("/f").unwrap(), b"xxx");
        assert_eq!(file.size(), 3);
        assert_eq!(mem.open_count(), 0);
    }

    #[test]
    fn test_round_trip_across_auto_flush() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/big", "w+").unwrap();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(1000) {
            file.write(chunk).unwrap();
        }
        // The fifth chunk pushed the region past capacity.
        assert_eq!(mem.write_calls(), 1);
        assert_eq!(file.pending_len(), 0);

        file.seek(SeekFrom::Start(100)).unwrap();
        let mut buf = vec![0u8; 3000];
        assert_eq!(file.read(&mut buf).unwrap(), 3000);
        assert_eq!(&buf[..], &data[100..3100]);
    }

    #[test]
    fn test_flush_twice_is_noop() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w").unwrap();
        file.write(b"abc").unwrap();

        file.flush(true).unwrap();
        file.flush(true).unwrap();
        assert_eq!(mem.write_calls(), 1);
        assert_eq!(file.state(), StreamState::Clean);
    }

    #[test]
    fn test_unforced_flush_below_capacity() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w").unwrap();
        file.write(b"abc").unwrap();
        file.flush(false).unwrap();
        assert_eq!(mem.write_calls(), 0);
        assert_eq!(file.pending_len(), 3);
    }

    #[test]
    fn test_short_read_sets_eof() {
        let (mem, backend) = setup();
        seed(&mem, "/f", b"abcde");
        let mut file = BufferedFile::open(backend, "/f", "r").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"abcde");
        assert!(file.is_eof());
        assert!(!file.is_error());
        assert_eq!(file.tell(), 5);

        // Sticky until cleared.
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_at_eof_then_extend() {
        let (mem, backend) = setup();
        seed(&mem, "/f", b"abc");
        let mut file = BufferedFile::open(backend, "/f", "r").unwrap();

        file.seek(SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 0);
        assert!(file.is_eof());
        assert!(!file.is_error());

        let fd = mem.open("/f", OpenFlags::read_write(), 0).unwrap();
        mem.pwrite(fd, b"defg", 3).unwrap();

        assert_eq!(file.read(&mut buf).unwrap(), 0);
        file.clear_error();
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"defg");
    }

    #[test]
    fn test_seek_clears_eof() {
        let (mem, backend) = setup();
        seed(&mem, "/f", b"abc");
        let mut file = BufferedFile::open(backend, "/f", "r").unwrap();

        let mut buf = [0u8; 8];
        file.read(&mut buf).unwrap();
        assert!(file.is_eof());

        assert_eq!(file.seek(SeekFrom::Current(-2)).unwrap(), 1);
        assert!(!file.is_eof());
        assert_eq!(file.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn test_seek_out_of_range() {
        let (_mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w+").unwrap();
        file.write(b"abc").unwrap();

        let err = file.seek(SeekFrom::Current(-4)).unwrap_err();
        assert_eq!(err.errno(), Errno::INVAL);
        assert_eq!(file.tell(), 3);
        assert!(!file.is_error());

        for pos in [SeekFrom::Start(i64::MAX as u64 + 1), SeekFrom::Start(u64::MAX)] {
            let err = file.seek(pos).unwrap_err();
            assert_eq!(err.errno(), Errno::INVAL);
            assert_eq!(file.tell(), 3);
        }
        assert_eq!(file.seek(SeekFrom::Start(i64::MAX as u64)).unwrap(), i64::MAX as u64);
        assert_eq!(file.seek(SeekFrom::Current(1)).unwrap_err().errno(), Errno::INVAL);
        assert_eq!(file.tell(), i64::MAX as u64);

        assert_eq!(file.seek(SeekFrom::End(-1)).unwrap(), 2);
    }

    #[test]
    fn test_non_contiguous_write() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w").unwrap();

        file.write(b"aaaa").unwrap();
        file.seek(SeekFrom::Start(1)).unwrap();
        file.write(b"b").unwrap();

        // Pending region flushed, then a direct write.
        assert_eq!(mem.write_calls(), 2);
        assert_eq!(file.pending_len(), 0);
        assert_eq!(file.tell(), 2);
        assert_eq!(mem.contents("/f").unwrap(), b"abaa");

        // Continuing from here buffers again.
        file.write(b"c").unwrap();
        assert_eq!(file.pending_len(), 1);
        file.close().unwrap();
        assert_eq!(mem.contents("/f").unwrap(), b"abca");
        assert_eq!(file.size(), 4);
    }

    #[test]
    fn test_append_ignores_seek() {
        let (mem, backend) = setup();
        seed(&mem, "/log", b"abc");
        let mut file = BufferedFile::open(backend, "/log", "a").unwrap();
        assert!(file.is_append());

        file.seek(SeekFrom::Start(0)).unwrap();
        file.write(b"de").unwrap();
        assert_eq!(file.tell(), 5);
        file.seek(SeekFrom::Start(1)).unwrap();
        file.write(b"fg").unwrap();
        file.close().unwrap();

        assert_eq!(mem.contents("/log").unwrap(), b"abcdefg");
    }

    #[test]
    fn test_append_after_flush_and_read() {
        let (mem, backend) = setup();
        seed(&mem, "/log", b"abc");
        let mut file = BufferedFile::open(backend, "/log", "a+").unwrap();

        file.write(b"12").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"abc12");

        file.seek(SeekFrom::Start(0)).unwrap();
        file.write(b"34").unwrap();
        file.close().unwrap();
        assert_eq!(mem.contents("/log").unwrap(), b"abc1234");
    }

    #[test]
    fn test_appenders_share_end_of_file() {
        let (mem, backend) = setup();
        let mut first = BufferedFile::open(backend.clone(), "/log", "a").unwrap();
        let mut second = BufferedFile::open(backend, "/log", "a").unwrap();

        first.write(b"one;").unwrap();
        first.close().unwrap();
        second.write(b"two;").unwrap();
        second.close().unwrap();

        assert_eq!(mem.contents("/log").unwrap(), b"one;two;");
    }

    #[test]
    fn test_short_write_is_sticky() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w+").unwrap();
        file.write(b"xyz").unwrap();

        mem.set_write_limit(Some(1));
        let err = file.flush(true).unwrap_err();
        assert_eq!(err, PreloadError::ShortWrite { expected: 3, written: 1 });
        assert!(file.is_error());
        assert_eq!(file.state(), StreamState::Error);
        assert_eq!(file.pending_len(), 3);

        // Nothing reaches the backend while the error is set.
        let calls = mem.write_calls();
        assert!(file.write(b"more").is_err());
        let mut buf = [0u8; 1];
        assert!(file.read(&mut buf).is_err());
        assert!(file.flush(true).is_err());
        assert_eq!(mem.write_calls(), calls);
        assert_eq!(mem.read_calls(), 0);
        assert_eq!(file.error(), Some(&err));
    }

    #[test]
    fn test_failed_threshold_flush_keeps_write() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w").unwrap();
        file.write(&[b'a'; 4000]).unwrap();

        mem.set_write_error(Some(Errno::NOSPC));
        assert_eq!(file.write(&[b'b'; 100]).unwrap(), 100);
        assert!(file.is_error());
        assert_eq!(file.tell(), 4100);
        assert_eq!(file.pending_len(), 4100);
        assert_eq!(file.flush(true).unwrap_err().errno(), Errno::NOSPC);

        // The caller saw success, so there is nothing to retry.
        mem.set_write_error(None);
        file.clear_error();
        file.close().unwrap();
        let data = mem.contents("/f").unwrap();
        assert_eq!(data.len(), 4100);
        assert!(data[4000..].iter().all(|b| *b == b'b'));
    }

    #[test]
    fn test_failed_append_flush_keeps_write() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "a").unwrap();
        file.write(&[b'a'; 4000]).unwrap();

        mem.set_write_error(Some(Errno::IO));
        assert_eq!(file.write(&[b'b'; 200]).unwrap(), 200);
        assert_eq!(file.error().map(|e| e.errno()), Some(Errno::IO));

        mem.set_write_error(None);
        file.clear_error();
        file.close().unwrap();
        assert_eq!(mem.contents("/f").unwrap().len(), 4200);
    }

    #[test]
    fn test_close_reports_flush_error() {
        let (mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w").unwrap();
        file.write(b"data").unwrap();

        mem.set_write_error(Some(Errno::NOSPC));
        let err = file.close().unwrap_err();
        assert_eq!(err.errno(), Errno::NOSPC);
        assert_eq!(mem.open_count(), 0);
        assert_eq!(file.state(), StreamState::Closed);
    }

    #[test]
    fn test_use_after_close() {
        let (_mem, backend) = setup();
        let mut file = BufferedFile::open(backend, "/f", "w+").unwrap();
        file.close().unwrap();

        assert_eq!(file.write(b"x").unwrap_err(), PreloadError::Closed);
        assert_eq!(file.seek(SeekFrom::Start(0)).unwrap_err(), PreloadError::Closed);
        assert_eq!(file.close().unwrap_err(), PreloadError::Closed);
        file.clear_error();
        assert_eq!(file.state(), StreamState::Closed);
    }

    #[test]
    fn test_open_errors() {
        let (_mem, backend) = setup();
        let err = BufferedFile::open(backend.clone(), "/f", "rw").unwrap_err();
        assert_eq!(err.errno(), Errno::INVAL);

        let err = BufferedFile::open(backend, "/missing", "r").unwrap_err();
        assert_eq!(err.errno(), Errno::NOENT);
    }

    #[test]
    fn test_known_size_from_backend() {
        let (mem, backend) = setup();
        seed(&mem, "/f", b"0123456789");

        let file = BufferedFile::open(backend.clone(), "/f", "r+").unwrap();
        assert_eq!(file.size(), 10);
        drop(file);

        let file = BufferedFile::open(backend, "/f", "w").unwrap();
        assert_eq!(file.size(), 0);
    }

    #[test]
    fn test_drop_flushes() {
        let (mem, backend) = setup();
        {
            let mut file = BufferedFile::open(backend, "/f", "w").unwrap();
            file.write(b"unflushed").unwrap();
        }
        assert_eq!(mem.contents("/f").unwrap(), b"unflushed");
        assert_eq!(mem.open_count(), 0);
    }
}
