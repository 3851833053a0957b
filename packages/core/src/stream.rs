//! Abort-aware wrappers around primitive resource streams.
//!
//! Both wrappers consult the owning request's abort latch before and after
//! every call. Closing releases the primitive exactly once and tells the
//! owner, which is how the request learns that the write phase is over.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::resource::ResourceWriter;
use crate::sync::lock;

/// Which side of the exchange a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Writer,
    Reader,
}

/// The request a stream reports to.
pub(crate) trait StreamOwner: Send + Sync {
    fn is_aborted(&self) -> bool;

    fn on_stream_closed(&self, role: StreamRole);
}

/// A primitive that can be released.
pub(crate) trait Primitive: Send {
    fn release(self) -> io::Result<()>;
}

impl Primitive for Box<dyn ResourceWriter> {
    fn release(self) -> io::Result<()> {
        self.finish()
    }
}

impl Primitive for Box<dyn Read + Send> {
    fn release(self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) type WriterCore = StreamCore<Box<dyn ResourceWriter>>;
pub(crate) type ReaderCore = StreamCore<Box<dyn Read + Send>>;

/// State shared between a stream and the request that may tear it down.
pub(crate) struct StreamCore<P> {
    request: u64,
    role: StreamRole,
    primitive: Mutex<Option<P>>,
    closed: AtomicBool,
    owner: Arc<dyn StreamOwner>,
}

impl<P: Primitive> StreamCore<P> {
    pub(crate) fn new(
        request: u64,
        role: StreamRole,
        primitive: P,
        owner: Arc<dyn StreamOwner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request,
            role,
            primitive: Mutex::new(Some(primitive)),
            closed: AtomicBool::new(false),
            owner,
        })
    }

    fn check_aborted(&self) -> io::Result<()> {
        if self.owner.is_aborted() {
            Err(Error::Cancelled.into())
        } else {
            Ok(())
        }
    }

    /// Run `op` against the primitive, with abort checks on both sides.
    fn with_primitive<R>(
        &self,
        action: &'static str,
        op: impl FnOnce(&mut P) -> io::Result<R>,
    ) -> io::Result<R> {
        self.check_aborted()?;
        let result = {
            let mut primitive = lock(&self.primitive);
            let primitive = primitive
                .as_mut()
                .ok_or_else(|| io::Error::from(Error::invalid_state("stream is closed")))?;
            op(primitive).map_err(|e| io::Error::from(Error::transport(action, e)))
        };
        self.check_aborted()?;
        result
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the primitive and notify the owner. Only the first call does
    /// anything.
    ///
    /// With `commit` unset the primitive is dropped without being finished.
    pub(crate) fn release(&self, commit: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let primitive = lock(&self.primitive).take();
        let result = match primitive {
            Some(p) if commit => p
                .release()
                .map_err(|e| Error::transport("close stream", e)),
            _ => Ok(()),
        };
        tracing::debug!(request = self.request, role = ?self.role, commit, "stream released");
        self.owner.on_stream_closed(self.role);
        result
    }

    fn close(&self) -> Result<()> {
        let aborted = self.owner.is_aborted();
        let result = self.release(!aborted);
        if aborted || self.owner.is_aborted() {
            return Err(Error::Cancelled);
        }
        result
    }
}

/// Writable stream handed out by [`Request::begin_open_write_stream`].
///
/// Closing it ends the write phase and lets a pending response proceed.
///
/// [`Request::begin_open_write_stream`]: crate::Request::begin_open_write_stream
pub struct RequestStream {
    core: Arc<WriterCore>,
}

impl RequestStream {
    pub(crate) fn new(core: Arc<WriterCore>) -> Self {
        Self { core }
    }

    /// Commit the written bytes and end the write phase.
    ///
    /// Idempotent. Fails with [`Error::Cancelled`] once the request is
    /// aborted, but the primitive is released either way.
    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl Write for RequestStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.core.with_primitive("write", |w| w.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.core.with_primitive("flush", |w| w.flush())
    }
}

impl fmt::Debug for RequestStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStream")
            .field("request", &self.core.request)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        if let Err(e) = self.core.release(!self.core.owner.is_aborted()) {
            tracing::warn!(request = self.core.request, error = %e, "request stream failed to close on drop");
        }
    }
}

/// Readable stream carried by a [`Response`](crate::Response).
pub struct ResponseStream {
    core: Arc<ReaderCore>,
}

impl ResponseStream {
    pub(crate) fn new(core: Arc<ReaderCore>) -> Self {
        Self { core }
    }

    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl Read for ResponseStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.with_primitive("read", |r| r.read(buf))
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("request", &self.core.request)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        let _ = self.core.release(false);
    }
}
