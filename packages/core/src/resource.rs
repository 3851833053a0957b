//! Primitive resources a request reads from and writes to.
//!
//! A [`Resource`] turns a locator into raw byte streams. The request layer
//! wraps whatever it returns in its own abort-aware streams, so
//! implementations only need to do plain blocking I/O.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use url::Url;

use crate::sync::lock;
use crate::types::AccessMode;

/// Writable side of a resource.
pub trait ResourceWriter: Write + Send {
    /// Flush and commit everything written so far.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Readable side of a resource, with its length when known up front.
pub struct ResourceReader {
    pub reader: Box<dyn Read + Send>,
    pub length: Option<u64>,
}

impl ResourceReader {
    pub fn new(reader: impl Read + Send + 'static, length: Option<u64>) -> Self {
        Self {
            reader: Box::new(reader),
            length,
        }
    }
}

impl fmt::Debug for ResourceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceReader")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Opens byte streams for a locator.
pub trait Resource: Send + Sync {
    fn open_write(&self, locator: &Url, access: AccessMode) -> io::Result<Box<dyn ResourceWriter>>;

    fn open_read(&self, locator: &Url) -> io::Result<ResourceReader>;
}

/// `file:` URLs on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileResource;

impl FileResource {
    fn path_of(locator: &Url) -> io::Result<PathBuf> {
        if locator.scheme() != "file" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported scheme '{}'", locator.scheme()),
            ));
        }
        locator.to_file_path().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' does not name a local file", locator),
            )
        })
    }
}

/// Buffered file writer. Dropping it without [`finish`](ResourceWriter::finish)
/// discards whatever is still buffered; bytes the buffer already spilled to
/// the file stay there.
struct FileWriter {
    inner: Option<BufWriter<File>>,
}

impl FileWriter {
    fn buffer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "file writer finished"))
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer()?.flush()
    }
}

impl ResourceWriter for FileWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let inner = self.buffer()?;
        inner.flush()?;
        inner.get_ref().sync_data()?;
        self.inner = None;
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.inner.take() {
            let (_file, unflushed) = writer.into_parts();
            if let Ok(pending) = unflushed {
                if !pending.is_empty() {
                    tracing::debug!(bytes = pending.len(), "discarding unfinished file write");
                }
            }
        }
    }
}

impl Resource for FileResource {
    fn open_write(&self, locator: &Url, access: AccessMode) -> io::Result<Box<dyn ResourceWriter>> {
        let path = Self::path_of(locator)?;
        let mut options = OpenOptions::new();
        match access {
            AccessMode::Read => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "resource opened for read access",
                ))
            }
            AccessMode::Write => options.write(true).create(true).truncate(true),
            AccessMode::ReadWrite => options.read(true).write(true).create(true).truncate(false),
        };
        let file = options.open(&path)?;
        tracing::trace!(path = %path.display(), ?access, "opened file for writing");
        Ok(Box::new(FileWriter {
            inner: Some(BufWriter::new(file)),
        }))
    }

    fn open_read(&self, locator: &Url) -> io::Result<ResourceReader> {
        let path = Self::path_of(locator)?;
        let file = File::open(&path)?;
        let length = fs::metadata(&path).map(|m| m.len()).ok();
        tracing::trace!(path = %path.display(), ?length, "opened file for reading");
        Ok(ResourceReader::new(file, length))
    }
}

#[derive(Default)]
struct MemoryShared {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
}

/// In-process resource keyed by locator.
///
/// Counts every stream it opens and closes, which makes it the natural
/// double for checking that requests never leak a stream. Clones share the
/// same contents and counters.
#[derive(Clone, Default)]
pub struct MemoryResource {
    shared: Arc<MemoryShared>,
}

impl MemoryResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every open, on the opening thread.
    pub fn with_open_delay(self, delay: Duration) -> Self {
        *lock(&self.shared.open_delay) = Some(delay);
        self
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *lock(&self.shared.open_delay) = delay;
    }

    pub fn insert(&self, locator: &Url, contents: impl Into<Vec<u8>>) {
        lock(&self.shared.entries).insert(locator.to_string(), contents.into());
    }

    pub fn contents(&self, locator: &Url) -> Option<Vec<u8>> {
        lock(&self.shared.entries).get(locator.as_str()).cloned()
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Streams opened and not yet released.
    pub fn open_streams(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    fn before_open(&self) {
        let delay = *lock(&self.shared.open_delay);
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemoryResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryResource")
            .field("entries", &lock(&self.shared.entries).len())
            .field("opened", &self.opened())
            .field("closed", &self.closed())
            .finish()
    }
}

struct MemoryWriter {
    shared: Arc<MemoryShared>,
    key: String,
    access: AccessMode,
    buffer: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResourceWriter for MemoryWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let written = std::mem::take(&mut self.buffer);
        let mut entries = lock(&self.shared.entries);
        match self.access {
            AccessMode::ReadWrite => {
                let entry = entries.entry(self.key.clone()).or_default();
                if entry.len() < written.len() {
                    entry.resize(written.len(), 0);
                }
                entry[..written.len()].copy_from_slice(&written);
            }
            _ => {
                entries.insert(self.key.clone(), written);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryReader {
    shared: Arc<MemoryShared>,
    cursor: Cursor<Vec<u8>>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Resource for MemoryResource {
    fn open_write(&self, locator: &Url, access: AccessMode) -> io::Result<Box<dyn ResourceWriter>> {
        if !access.allows_write() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "resource opened for read access",
            ));
        }
        self.before_open();
        Ok(Box::new(MemoryWriter {
            shared: Arc::clone(&self.shared),
            key: locator.to_string(),
            access,
            buffer: Vec::new(),
        }))
    }

    fn open_read(&self, locator: &Url) -> io::Result<ResourceReader> {
        let contents = lock(&self.shared.entries)
            .get(locator.as_str())
            .cloned()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no entry for {}", locator))
            })?;
        self.before_open();
        let length = contents.len() as u64;
        Ok(ResourceReader::new(
            MemoryReader {
                shared: Arc::clone(&self.shared),
                cursor: Cursor::new(contents),
            },
            Some(length),
        ))
    }
}

#[cfg(test)]
pub mod mock {
    //! Resource doubles with scripted failures.

    use super::*;

    /// Wraps a [`MemoryResource`] and fails the opens it is told to fail.
    #[derive(Clone, Default)]
    pub struct FlakyResource {
        pub memory: MemoryResource,
        fail_writes: Arc<Mutex<Option<io::ErrorKind>>>,
        fail_reads: Arc<Mutex<Option<io::ErrorKind>>>,
    }

    impl FlakyResource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_writes(&self, kind: io::ErrorKind) {
            *lock(&self.fail_writes) = Some(kind);
        }

        pub fn fail_reads(&self, kind: io::ErrorKind) {
            *lock(&self.fail_reads) = Some(kind);
        }
    }

    impl Resource for FlakyResource {
        fn open_write(
            &self,
            locator: &Url,
            access: AccessMode,
        ) -> io::Result<Box<dyn ResourceWriter>> {
            if let Some(kind) = *lock(&self.fail_writes) {
                return Err(io::Error::new(kind, "scripted write failure"));
            }
            self.memory.open_write(locator, access)
        }

        fn open_read(&self, locator: &Url) -> io::Result<ResourceReader> {
            if let Some(kind) = *lock(&self.fail_reads) {
                return Err(io::Error::new(kind, "scripted read failure"));
            }
            self.memory.open_read(locator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mem_url(name: &str) -> Url {
        Url::parse(&format!("mem://test/{}", name)).unwrap()
    }

    #[test]
    fn file_write_then_read() {
        let dir = tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("data.bin")).unwrap();

        let mut writer = FileResource.open_write(&url, AccessMode::Write).unwrap();
        writer.write_all(b"hello file").unwrap();
        writer.finish().unwrap();

        let mut reader = FileResource.open_read(&url).unwrap();
        assert_eq!(reader.length, Some(10));
        let mut contents = String::new();
        reader.reader.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello file");
    }

    #[test]
    fn file_read_write_keeps_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"0123456789").unwrap();
        let url = Url::from_file_path(&path).unwrap();

        let mut writer = FileResource.open_write(&url, AccessMode::ReadWrite).unwrap();
        writer.write_all(b"abc").unwrap();
        writer.finish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abc3456789");

        let mut writer = FileResource.open_write(&url, AccessMode::Write).unwrap();
        writer.write_all(b"xy").unwrap();
        writer.finish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"xy");
    }

    #[test]
    fn file_unfinished_writer_discards_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aborted.bin");
        let url = Url::from_file_path(&path).unwrap();

        let mut writer = FileResource.open_write(&url, AccessMode::Write).unwrap();
        writer.write_all(b"never committed").unwrap();
        drop(writer);
        assert_eq!(fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn file_rejects_other_schemes() {
        let url = Url::parse("https://example.com/x").unwrap();
        let err = FileResource.open_read(&url).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn file_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent")).unwrap();
        let err = FileResource.open_read(&url).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn memory_counts_opens_and_closes() {
        let memory = MemoryResource::new();
        let url = mem_url("a");

        let mut writer = memory.open_write(&url, AccessMode::Write).unwrap();
        writer.write_all(b"abc").unwrap();
        assert_eq!(memory.open_streams(), 1);
        writer.finish().unwrap();
        assert_eq!(memory.open_streams(), 0);

        let reader = memory.open_read(&url).unwrap();
        assert_eq!(reader.length, Some(3));
        assert_eq!(memory.opened(), 2);
        drop(reader);
        assert_eq!(memory.closed(), 2);
        assert_eq!(memory.contents(&url).unwrap(), b"abc");
    }

    #[test]
    fn memory_unfinished_writer_commits_nothing() {
        let memory = MemoryResource::new();
        let url = mem_url("b");
        let mut writer = memory.open_write(&url, AccessMode::Write).unwrap();
        writer.write_all(b"lost").unwrap();
        drop(writer);
        assert!(memory.contents(&url).is_none());
        assert_eq!(memory.open_streams(), 0);
    }

    #[test]
    fn memory_read_write_overlays() {
        let memory = MemoryResource::new();
        let url = mem_url("c");
        memory.insert(&url, b"abcdef".to_vec());
        let mut writer = memory.open_write(&url, AccessMode::ReadWrite).unwrap();
        writer.write_all(b"XY").unwrap();
        writer.finish().unwrap();
        assert_eq!(memory.contents(&url).unwrap(), b"XYcdef");
    }

    #[test]
    fn memory_missing_entry_does_not_count() {
        let memory = MemoryResource::new();
        let err = memory.open_read(&mem_url("none")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(memory.opened(), 0);
    }
}
