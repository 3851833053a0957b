//! # filewire-core
//!
//! A request engine that writes to a resource and then reads the response back
//! from it, with the two phases running on worker threads.
//!
//! ## Pieces
//!
//! - [`AsyncHandle`]: one-shot completion handle with wait, callback and a
//!   compare-and-set completion.
//! - [`Request`]: the lifecycle. `begin_*` schedules a phase and returns a
//!   handle, `end_*` waits for it honouring the request timeout, and
//!   [`Request::abort`] tears everything down once.
//! - [`RequestStream`] / [`ResponseStream`]: `Write` / `Read` wrappers that
//!   fail with [`Error::Cancelled`] once their request is aborted.
//! - [`Response`]: content length, content type, headers and the body stream.
//! - [`Resource`]: where bytes actually go. [`FileResource`] handles `file:`
//!   URLs; [`MemoryResource`] keeps everything in process.
//!
//! ## Write then read
//!
//! ```ignore
//! use filewire_core::{AccessMode, Method, Request};
//! use std::io::{Read, Write};
//!
//! let request = Request::builder(url)
//!     .with_method(Method::PUT)
//!     .with_access(AccessMode::Write)
//!     .build()?;
//!
//! let mut body = request.request_stream()?;
//! body.write_all(b"hello")?;
//! body.close()?;
//!
//! let mut response = request.response()?;
//! let mut text = String::new();
//! response.stream()?.read_to_string(&mut text)?;
//! ```

pub mod error;
pub mod handle;
pub mod request;
pub mod resource;
pub mod response;
pub mod stream;
pub mod sync;
pub mod types;
pub mod worker;

pub use error::{Error, ErrorKind, Result};
pub use handle::{AsyncHandle, Callback, Completion, HandleState};
pub use request::{Phase, Request, RequestBuilder};
pub use resource::{FileResource, MemoryResource, Resource, ResourceReader, ResourceWriter};
pub use response::{Response, CONTENT_TYPE_OCTET_STREAM};
pub use stream::{RequestStream, ResponseStream, StreamRole};
pub use sync::{lock, Latch};
pub use types::{AccessMode, Method, Timeout};
pub use worker::{default_pool, Dispatch, Job, WorkerPool};
