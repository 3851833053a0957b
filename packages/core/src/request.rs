//! The request lifecycle.
//!
//! A [`Request`] moves through a write phase (open a stream, write, close it)
//! and a read phase (open the response). Both phases run on a worker pool and
//! are observed through [`AsyncHandle`]s. A response requested while the write
//! phase is still running is parked on the request and only dispatched once
//! the writer closes, so no pool worker sits waiting for the caller.
//!
//! ```ignore
//! let request = Request::builder(url)
//!     .with_method(Method::PUT)
//!     .with_access(AccessMode::Write)
//!     .build()?;
//!
//! let mut body = request.request_stream()?;
//! let pending = request.begin_get_response(None)?;
//! body.write_all(b"0123456789")?;
//! body.close()?;
//!
//! let response = request.end_get_response(&pending)?;
//! assert_eq!(response.content_length()?, Some(10));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::handle::{AsyncHandle, Callback, Completion, WeakHandle};
use crate::resource::{FileResource, Resource};
use crate::response::Response;
use crate::stream::{
    ReaderCore, RequestStream, ResponseStream, StreamCore, StreamOwner, StreamRole, WriterCore,
};
use crate::sync::{lock, Latch};
use crate::types::{AccessMode, Method, Timeout};
use crate::worker::{default_pool, Dispatch};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    WriteStreamRequested,
    WriteStreamOpen,
    WriteClosed,
    ResponseRequested,
    ResponseReady,
    /// Terminal.
    Aborted,
}

struct LifecycleState {
    phase: Phase,
    write_pending: bool,
    writing: bool,
    write_produced: bool,
    read_pending: bool,
    response_requested: bool,
    writer: Option<Weak<WriterCore>>,
    reader: Option<Weak<ReaderCore>>,
    write_handle: Option<WeakHandle<RequestStream>>,
    response_handle: Option<WeakHandle<Response>>,
    /// Response requested during the write phase, not yet dispatched.
    parked_response: Option<AsyncHandle<Response>>,
}

impl LifecycleState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            write_pending: false,
            writing: false,
            write_produced: false,
            read_pending: false,
            response_requested: false,
            writer: None,
            reader: None,
            write_handle: None,
            response_handle: None,
            parked_response: None,
        }
    }

    fn advance(&mut self, id: u64, phase: Phase) {
        if self.phase != Phase::Aborted && self.phase != phase {
            debug!(request = id, from = ?self.phase, to = ?phase, "request phase");
            self.phase = phase;
        }
    }
}

struct RequestInner {
    id: u64,
    locator: Url,
    method: Method,
    access: AccessMode,
    headers: HeaderMap,
    content_length: Option<u64>,
    timeout: Timeout,
    resource: Arc<dyn Resource>,
    dispatcher: Arc<dyn Dispatch>,
    aborted: Latch,
    state: Mutex<LifecycleState>,
    this: Weak<RequestInner>,
}

impl StreamOwner for RequestInner {
    fn is_aborted(&self) -> bool {
        self.aborted.is_set()
    }

    fn on_stream_closed(&self, role: StreamRole) {
        let mut state = lock(&self.state);
        match role {
            StreamRole::Writer => {
                state.write_pending = false;
                state.writing = false;
                state.writer = None;
                if state.phase == Phase::WriteStreamOpen {
                    state.advance(self.id, Phase::WriteClosed);
                }
                drop(state);
                self.resume_parked_response();
            }
            StreamRole::Reader => {
                state.reader = None;
            }
        }
    }
}

impl RequestInner {
    fn open_write_stream(self: Arc<Self>, handle: AsyncHandle<RequestStream>) {
        {
            let mut state = lock(&self.state);
            if self.aborted.is_set() {
                return;
            }
            if handle.is_completed() {
                // expired before a worker picked it up
                state.write_pending = false;
                drop(state);
                self.resume_parked_response();
                return;
            }
            state.writing = true;
        }

        let opened = self.resource.open_write(&self.locator, self.access);
        let stream = match opened {
            Ok(primitive) => {
                let owner: Arc<dyn StreamOwner> = self.clone();
                let core = StreamCore::new(self.id, StreamRole::Writer, primitive, owner);
                let mut state = lock(&self.state);
                state.write_pending = false;
                state.write_produced = true;
                state.writer = Some(Arc::downgrade(&core));
                state.advance(self.id, Phase::WriteStreamOpen);
                drop(state);
                if self.aborted.is_set() {
                    let _ = core.release(false);
                    Err(Error::Cancelled)
                } else {
                    Ok(RequestStream::new(core))
                }
            }
            Err(e) => {
                let error = Error::transport(format!("open {} for writing", self.locator), e);
                let mut state = lock(&self.state);
                state.write_pending = false;
                state.writing = false;
                if state.phase == Phase::WriteStreamRequested {
                    state.advance(self.id, Phase::Idle);
                }
                drop(state);
                self.resume_parked_response();
                Err(error)
            }
        };

        if let Completion::Rejected(Ok(mut stream)) = handle.complete(stream) {
            warn!(request = self.id, "write stream opened after its handle resolved; closing it");
            let _ = stream.close();
        }
    }

    fn dispatch_response(&self, handle: AsyncHandle<Response>) -> Result<()> {
        let inner = self
            .this
            .upgrade()
            .ok_or_else(|| Error::invalid_state("request was dropped"))?;
        self.dispatcher
            .dispatch(Box::new(move || inner.produce_response(handle)))
    }

    /// Dispatch the parked response once neither an open nor a writer is
    /// outstanding.
    fn resume_parked_response(&self) {
        let parked = {
            let mut state = lock(&self.state);
            if state.write_pending || state.writing {
                return;
            }
            state.parked_response.take()
        };
        let Some(handle) = parked else {
            return;
        };
        debug!(request = self.id, "write phase over; dispatching response");
        if let Err(e) = self.dispatch_response(handle.clone()) {
            lock(&self.state).read_pending = false;
            let _ = handle.complete(Err(e));
        }
    }

    fn produce_response(self: Arc<Self>, handle: AsyncHandle<Response>) {
        {
            let mut state = lock(&self.state);
            if self.aborted.is_set() || handle.is_completed() {
                state.read_pending = false;
                return;
            }
        }

        let response = match self.resource.open_read(&self.locator) {
            Ok(opened) => {
                let owner: Arc<dyn StreamOwner> = self.clone();
                let core = StreamCore::new(self.id, StreamRole::Reader, opened.reader, owner);
                lock(&self.state).reader = Some(Arc::downgrade(&core));
                Ok(Response::new(
                    self.locator.clone(),
                    opened.length,
                    ResponseStream::new(core),
                ))
            }
            Err(e) => {
                let error = Error::transport(format!("open {} for reading", self.locator), e);
                if self.access == AccessMode::Write {
                    debug!(request = self.id, error = %error, "read-back failed; capturing it in the response");
                    Ok(Response::failed(self.locator.clone(), error))
                } else {
                    Err(error)
                }
            }
        };

        {
            let mut state = lock(&self.state);
            state.read_pending = false;
            if response.is_ok() {
                state.advance(self.id, Phase::ResponseReady);
            }
        }

        let response = if self.aborted.is_set() {
            if let Ok(mut response) = response {
                let _ = response.close();
            }
            Err(Error::Cancelled)
        } else {
            response
        };

        if let Completion::Rejected(Ok(mut response)) = handle.complete(response) {
            warn!(request = self.id, "response produced after its handle resolved; closing it");
            let _ = response.close();
        }
    }

    /// Wait for `handle` honouring the request timeout. On timeout the handle is
    /// resolved with [`Error::Timeout`] so that a late result gets discarded.
    fn wait_or_expire<T>(&self, handle: &AsyncHandle<T>, operation: &'static str) -> Result<()> {
        match handle.wait(self.timeout.as_duration()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_timeout() => {
                if handle.complete(Err(Error::Timeout { operation })).is_accepted() {
                    info!(request = self.id, operation, "request timed out");
                    Err(Error::Timeout { operation })
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// A single exchange with a resource: an optional write phase followed by
/// a response.
///
/// Cloning yields another reference to the same request, which is how a
/// request is aborted from another thread.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub fn builder(locator: Url) -> RequestBuilder {
        RequestBuilder::new(locator)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn url(&self) -> &Url {
        &self.inner.locator
    }

    pub fn method(&self) -> Method {
        self.inner.method
    }

    pub fn access(&self) -> AccessMode {
        self.inner.access
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length
    }

    pub fn timeout(&self) -> Timeout {
        self.inner.timeout
    }

    pub fn phase(&self) -> Phase {
        lock(&self.inner.state).phase
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.is_set()
    }

    /// Start opening the write stream on the request pool.
    pub fn begin_open_write_stream(
        &self,
        callback: Option<Callback<RequestStream>>,
    ) -> Result<AsyncHandle<RequestStream>> {
        let inner = &self.inner;
        if !inner.method.allows_body() {
            return Err(Error::protocol_violation(format!(
                "cannot send a body with {}",
                inner.method
            )));
        }
        if !inner.access.allows_write() {
            return Err(Error::protocol_violation(
                "cannot send a body on a read-only request",
            ));
        }

        let handle = AsyncHandle::with_optional_callback(callback);
        {
            let mut state = lock(&inner.state);
            if inner.aborted.is_set() {
                return Err(Error::Cancelled);
            }
            if state.response_requested {
                return Err(Error::invalid_state("response was already requested"));
            }
            if state.write_pending {
                return Err(Error::invalid_state("a write stream request is outstanding"));
            }
            if state.write_produced {
                return Err(Error::invalid_state("write stream was already opened"));
            }
            state.write_pending = true;
            state.write_handle = Some(handle.downgrade());
            state.advance(inner.id, Phase::WriteStreamRequested);
        }

        let job_inner = Arc::clone(inner);
        let job_handle = handle.clone();
        let dispatched = inner
            .dispatcher
            .dispatch(Box::new(move || job_inner.open_write_stream(job_handle)));
        if let Err(e) = dispatched {
            let mut state = lock(&inner.state);
            state.write_pending = false;
            state.write_handle = None;
            state.advance(inner.id, Phase::Idle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Wait for the write stream.
    ///
    /// On timeout any partially opened writer is closed and
    /// [`Error::Timeout`] is returned.
    pub fn end_open_write_stream(&self, handle: &AsyncHandle<RequestStream>) -> Result<RequestStream> {
        let inner = &self.inner;
        let owned = lock(&inner.state)
            .write_handle
            .as_ref()
            .is_some_and(|h| h.refers_to(handle));
        if !owned {
            return Err(Error::invalid_state("handle does not belong to this request"));
        }

        if let Err(e) = inner.wait_or_expire(handle, "request stream") {
            let writer = lock(&inner.state).writer.as_ref().and_then(Weak::upgrade);
            if let Some(writer) = writer {
                let _ = writer.release(false);
            }
            return Err(e);
        }
        handle.take()
    }

    /// Start producing the response on the request pool.
    ///
    /// While a write stream is outstanding or open the request is parked and
    /// dispatched when that stream closes.
    pub fn begin_get_response(
        &self,
        callback: Option<Callback<Response>>,
    ) -> Result<AsyncHandle<Response>> {
        let inner = &self.inner;
        let handle = AsyncHandle::with_optional_callback(callback);
        {
            let mut state = lock(&inner.state);
            if inner.aborted.is_set() {
                return Err(Error::Cancelled);
            }
            if state.read_pending {
                return Err(Error::invalid_state("a response request is outstanding"));
            }
            if state.response_requested {
                return Err(Error::invalid_state("response was already requested"));
            }
            state.read_pending = true;
            state.response_requested = true;
            state.response_handle = Some(handle.downgrade());
            state.advance(inner.id, Phase::ResponseRequested);
            if state.write_pending || state.writing {
                debug!(request = inner.id, "response parked behind the write phase");
                state.parked_response = Some(handle.clone());
                return Ok(handle);
            }
        }

        if let Err(e) = inner.dispatch_response(handle.clone()) {
            let mut state = lock(&inner.state);
            state.read_pending = false;
            state.response_requested = false;
            state.response_handle = None;
            return Err(e);
        }
        Ok(handle)
    }

    /// Wait for the response.
    ///
    /// On timeout a partially constructed response is closed and
    /// [`Error::Timeout`] is returned.
    pub fn end_get_response(&self, handle: &AsyncHandle<Response>) -> Result<Response> {
        let inner = &self.inner;
        let owned = lock(&inner.state)
            .response_handle
            .as_ref()
            .is_some_and(|h| h.refers_to(handle));
        if !owned {
            return Err(Error::invalid_state("handle does not belong to this request"));
        }

        if let Err(e) = inner.wait_or_expire(handle, "response") {
            let reader = {
                let mut state = lock(&inner.state);
                if state.parked_response.take().is_some() {
                    state.read_pending = false;
                }
                state.reader.as_ref().and_then(Weak::upgrade)
            };
            if let Some(reader) = reader {
                let _ = reader.release(false);
            }
            return Err(e);
        }
        handle.take()
    }

    /// Open the write stream and wait for it.
    pub fn request_stream(&self) -> Result<RequestStream> {
        let handle = self.begin_open_write_stream(None)?;
        self.end_open_write_stream(&handle)
    }

    /// Request the response and wait for it.
    pub fn response(&self) -> Result<Response> {
        let handle = self.begin_get_response(None)?;
        self.end_get_response(&handle)
    }

    /// Abort the request.
    ///
    /// Only the first call does anything and returns `true`. Outstanding
    /// handles resolve with [`Error::Cancelled`], blocked workers wake up and
    /// any open stream is released without committing.
    pub fn abort(&self) -> bool {
        let inner = &self.inner;
        if !inner.aborted.trigger() {
            return false;
        }
        info!(request = inner.id, url = %inner.locator, "request aborted");

        let (write_handle, response_handle, writer, reader) = {
            let mut state = lock(&inner.state);
            state.advance(inner.id, Phase::Aborted);
            state.parked_response = None;
            (
                state.write_handle.as_ref().and_then(WeakHandle::upgrade),
                state.response_handle.as_ref().and_then(WeakHandle::upgrade),
                state.writer.take().and_then(|w| w.upgrade()),
                state.reader.take().and_then(|r| r.upgrade()),
            )
        };

        // an already resolved handle keeps its result; its stream is
        // released below through the weak references
        if let Some(handle) = write_handle {
            let _ = handle.complete(Err(Error::Cancelled));
        }
        if let Some(handle) = response_handle {
            let _ = handle.complete(Err(Error::Cancelled));
        }
        if let Some(writer) = writer {
            let _ = writer.release(false);
        }
        if let Some(reader) = reader {
            let _ = reader.release(false);
        }
        true
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("url", &self.inner.locator.as_str())
            .field("method", &self.inner.method)
            .field("access", &self.inner.access)
            .field("phase", &self.phase())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Builder for [`Request`].
pub struct RequestBuilder {
    locator: Url,
    method: Method,
    access: AccessMode,
    timeout: Timeout,
    headers: HeaderMap,
    content_length: Option<u64>,
    resource: Option<Arc<dyn Resource>>,
    dispatcher: Option<Arc<dyn Dispatch>>,
    error: Option<Error>,
}

impl RequestBuilder {
    fn new(locator: Url) -> Self {
        Self {
            locator,
            method: Method::GET,
            access: AccessMode::Read,
            timeout: Timeout::DEFAULT,
            headers: HeaderMap::new(),
            content_length: None,
            resource: None,
            dispatcher: None,
            error: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Add a header. An invalid name or value fails [`build`](Self::build).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .map_err(Error::from)
            .and_then(|name| Ok((name, HeaderValue::from_str(value)?)));
        match parsed {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.append(name.clone(), value.clone());
        }
        self
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    /// Resource to open. Defaults to [`FileResource`].
    pub fn with_resource(mut self, resource: Arc<dyn Resource>) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Pool the phases run on. Defaults to the shared request pool.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatch>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> Result<Request> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => default_pool()?,
        };
        let resource = self
            .resource
            .unwrap_or_else(|| Arc::new(FileResource));
        let id = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        debug!(request = id, url = %self.locator, method = %self.method, access = ?self.access, "request created");

        Ok(Request {
            inner: Arc::new_cyclic(|this| RequestInner {
                id,
                locator: self.locator,
                method: self.method,
                access: self.access,
                headers: self.headers,
                content_length: self.content_length,
                timeout: self.timeout,
                resource,
                dispatcher,
                aborted: Latch::new(),
                state: Mutex::new(LifecycleState::new()),
                this: this.clone(),
            }),
        })
    }
}
