use std::fmt;

use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use url::Url;

use crate::error::{Error, Result};
use crate::stream::ResponseStream;

/// Content type every response reports.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

enum Body {
    Stream(ResponseStream),
    Failed(Error),
}

/// The readable result of a request.
///
/// Owns its stream. Every accessor fails with [`Error::InvalidState`] once the
/// response is closed.
pub struct Response {
    locator: Url,
    content_length: Option<u64>,
    headers: HeaderMap,
    body: Option<Body>,
    closed: bool,
}

impl Response {
    pub(crate) fn new(locator: Url, content_length: Option<u64>, stream: ResponseStream) -> Self {
        Self::build(locator, content_length, Body::Stream(stream))
    }

    /// A response whose body could not be opened.
    pub(crate) fn failed(locator: Url, error: Error) -> Self {
        Self::build(locator, Some(0), Body::Failed(error))
    }

    fn build(locator: Url, content_length: Option<u64>, body: Body) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(CONTENT_TYPE_OCTET_STREAM),
        );
        if let Some(length) = content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        Self {
            locator,
            content_length,
            headers,
            body: Some(body),
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::invalid_state("response is closed"))
        } else {
            Ok(())
        }
    }

    pub fn url(&self) -> Result<&Url> {
        self.check_open()?;
        Ok(&self.locator)
    }

    /// Length of the body, when the resource reported one.
    pub fn content_length(&self) -> Result<Option<u64>> {
        self.check_open()?;
        Ok(self.content_length)
    }

    pub fn content_type(&self) -> Result<&'static str> {
        self.check_open()?;
        Ok(CONTENT_TYPE_OCTET_STREAM)
    }

    pub fn headers(&self) -> Result<&HeaderMap> {
        self.check_open()?;
        Ok(&self.headers)
    }

    /// The body failure captured while the response was produced, if any.
    pub fn failure(&self) -> Option<&Error> {
        match &self.body {
            Some(Body::Failed(error)) => Some(error),
            _ => None,
        }
    }

    /// Borrow the body stream. A captured failure is returned here.
    pub fn stream(&mut self) -> Result<&mut ResponseStream> {
        self.check_open()?;
        match &mut self.body {
            Some(Body::Stream(stream)) => Ok(stream),
            Some(Body::Failed(error)) => Err(error.clone()),
            None => Err(Error::invalid_state("response stream was taken")),
        }
    }

    /// Take ownership of the body stream.
    pub fn into_stream(mut self) -> Result<ResponseStream> {
        self.check_open()?;
        match self.body.take() {
            Some(Body::Stream(stream)) => Ok(stream),
            Some(Body::Failed(error)) => Err(error),
            None => Err(Error::invalid_state("response stream was taken")),
        }
    }

    /// Close the response and its stream. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.body.take() {
            Some(Body::Stream(mut stream)) => stream.close(),
            _ => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.locator.as_str())
            .field("content_length", &self.content_length)
            .field("failed", &self.failure().is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
