//! High-level download and upload operations over the request engine.

use std::env;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use http::header::HeaderMap;
use tracing::{debug, warn};
use url::Url;

use filewire_core::{
    lock, AccessMode, Dispatch, Error, FileResource, Method, Request, RequestStream, Resource,
    Response, ResponseStream, Result, WorkerPool,
};

use crate::config::ClientConfig;
use crate::facade::{AsyncOperationFacade, Handlers, OperationContext};
use crate::progress::UserToken;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// State shared between the client and the operations it runs on workers.
struct ClientShared {
    config: ClientConfig,
    headers: HeaderMap,
    resource: Arc<dyn Resource>,
    request_pool: Arc<dyn Dispatch>,
    last_headers: Mutex<Option<HeaderMap>>,
}

impl ClientShared {
    fn request(
        &self,
        url: &Url,
        method: Method,
        access: AccessMode,
        content_length: Option<u64>,
        ctx: Option<&OperationContext>,
    ) -> Result<Request> {
        let mut builder = Request::builder(url.clone())
            .with_method(method)
            .with_access(access)
            .with_timeout(self.config.timeout)
            .with_headers(&self.headers)
            .with_resource(Arc::clone(&self.resource))
            .with_dispatcher(Arc::clone(&self.request_pool));
        if let Some(length) = content_length {
            builder = builder.with_content_length(length);
        }
        let request = builder.build()?;
        if let Some(ctx) = ctx {
            ctx.register_request(&request);
        }
        Ok(request)
    }

    fn record_headers(&self, response: &Response) -> Result<()> {
        let headers = response.headers()?.clone();
        *lock(&self.last_headers) = Some(headers);
        Ok(())
    }

    fn open_read(&self, url: &Url, ctx: &OperationContext) -> Result<ResponseStream> {
        let request = self.request(url, Method::GET, AccessMode::Read, None, Some(ctx))?;
        let response = request.response()?;
        self.record_headers(&response)?;
        response.into_stream()
    }

    fn open_write(&self, url: &Url, method: Method, ctx: &OperationContext) -> Result<RequestStream> {
        let request = self.request(url, method, AccessMode::Write, None, Some(ctx))?;
        request.request_stream()
    }

    /// Copy the response body into `sink`, reporting progress per buffer.
    fn read_response(
        &self,
        mut response: Response,
        sink: &mut dyn Write,
        ctx: Option<&OperationContext>,
    ) -> Result<u64> {
        self.record_headers(&response)?;
        let total = response.content_length()?;
        let mut buffer = vec![0u8; self.config.buffer_size];
        let mut received = 0u64;
        {
            let stream = response.stream()?;
            loop {
                checkpoint(ctx)?;
                let n = stream
                    .read(&mut buffer)
                    .map_err(|e| Error::from_io("read response", e))?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buffer[..n])
                    .map_err(|e| Error::transport("write download sink", e))?;
                received += n as u64;
                if let Some(ctx) = ctx {
                    ctx.report_progress(received, total);
                }
            }
        }
        response.close()?;

        if let Some(total) = total {
            if received < total {
                return Err(Error::transport(
                    format!("download aborted prematurely after {} of {} bytes", received, total),
                    io::Error::new(io::ErrorKind::UnexpectedEof, "response ended early"),
                ));
            }
        }
        Ok(received)
    }

    fn download(&self, url: &Url, sink: &mut dyn Write, ctx: Option<&OperationContext>) -> Result<u64> {
        let request = self.request(url, Method::GET, AccessMode::Read, None, ctx)?;
        let response = request.response()?;
        self.read_response(response, sink, ctx)
    }

    fn download_data(&self, url: &Url, ctx: Option<&OperationContext>) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.download(url, &mut body, ctx)?;
        Ok(body)
    }

    fn download_file(&self, url: &Url, path: &Path, ctx: Option<&OperationContext>) -> Result<u64> {
        let mut file = File::create(path)
            .map_err(|e| Error::transport(format!("create {}", path.display()), e))?;
        let result = self
            .download(url, &mut file, ctx)
            .and_then(|received| {
                file.sync_all()
                    .map_err(|e| Error::transport(format!("sync {}", path.display()), e))?;
                Ok(received)
            });
        if result.is_err() {
            drop(file);
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove partial download");
            }
        }
        result
    }

    /// Write `source` in chunks, then read the resource back.
    fn upload(
        &self,
        url: &Url,
        method: Method,
        source: &mut dyn Read,
        length: Option<u64>,
        ctx: Option<&OperationContext>,
    ) -> Result<Vec<u8>> {
        let request = self.request(url, method, AccessMode::Write, length, ctx)?;
        let mut stream = request.request_stream()?;
        let mut chunk = vec![0u8; self.config.upload_chunk_size];
        let mut sent = 0u64;
        loop {
            checkpoint(ctx)?;
            let n = source
                .read(&mut chunk)
                .map_err(|e| Error::transport("read upload source", e))?;
            if n == 0 {
                break;
            }
            stream
                .write_all(&chunk[..n])
                .map_err(|e| Error::from_io("write request", e))?;
            sent += n as u64;
            if let Some(ctx) = ctx {
                ctx.report_progress(sent, length);
            }
        }
        stream.close()?;
        debug!(request = request.id(), sent, "upload written");

        let response = request.response()?;
        if let Some(failure) = response.failure() {
            warn!(request = request.id(), error = %failure, "upload written but the resource could not be read back");
            return Ok(Vec::new());
        }
        let mut body = Vec::new();
        self.read_response(response, &mut body, None)?;
        Ok(body)
    }

    fn upload_file(
        &self,
        url: &Url,
        method: Method,
        path: &Path,
        ctx: Option<&OperationContext>,
    ) -> Result<Vec<u8>> {
        let mut file = File::open(path)
            .map_err(|e| Error::transport(format!("open {}", path.display()), e))?;
        let length = file.metadata().map(|m| m.len()).ok();
        self.upload(url, method, &mut file, length, ctx)
    }
}

fn checkpoint(ctx: Option<&OperationContext>) -> Result<()> {
    match ctx {
        Some(ctx) => ctx.check_cancelled(),
        None => Ok(()),
    }
}

fn decode_text(bytes: Vec<u8>) -> Result<String> {
    let bytes = match bytes.strip_prefix(UTF8_BOM) {
        Some(rest) => rest.to_vec(),
        None => bytes,
    };
    String::from_utf8(bytes).map_err(|e| Error::Decode {
        message: e.to_string(),
    })
}

/// Client for moving bytes to and from resources.
///
/// Runs one operation at a time: blocking calls and `*_async` calls share the
/// same busy latch, and starting a second one fails with
/// [`Error::InvalidState`].
pub struct ResourceClient {
    shared: Arc<ClientShared>,
    facade: AsyncOperationFacade,
}

impl ResourceClient {
    /// A client over local files.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_resource(config, Arc::new(FileResource))
    }

    pub fn with_resource(config: ClientConfig, resource: Arc<dyn Resource>) -> Result<Self> {
        config.validate()?;
        let headers = config.header_map()?;
        let request_pool = Arc::new(WorkerPool::new("filewire-request", config.request_workers)?);
        let operation_pool =
            Arc::new(WorkerPool::new("filewire-operation", config.operation_workers)?);
        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                headers,
                resource,
                request_pool,
                last_headers: Mutex::new(None),
            }),
            facade: AsyncOperationFacade::new(operation_pool),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Turn an address into a locator.
    ///
    /// Absolute URLs are used as they are. Anything else is joined to
    /// `base_address` when one is configured, and otherwise read as a local
    /// path relative to the working directory.
    pub fn resolve(&self, address: &str) -> Result<Url> {
        if address.trim().is_empty() {
            return Err(Error::InvalidLocator {
                message: "address is empty".to_string(),
            });
        }
        if let Ok(url) = Url::parse(address) {
            return Ok(url);
        }
        if let Some(base) = &self.shared.config.base_address {
            return Ok(base.join(address)?);
        }

        let mut path = PathBuf::from(address);
        if path.is_relative() {
            let cwd = env::current_dir().map_err(|e| Error::InvalidLocator {
                message: format!("cannot resolve '{}': {}", address, e),
            })?;
            path = cwd.join(path);
        }
        Url::from_file_path(&path).map_err(|()| Error::InvalidLocator {
            message: format!("'{}' is not a valid path", path.display()),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.facade.is_busy()
    }

    /// Cancel the running `*_async` operation, if any.
    pub fn cancel_async(&self) -> bool {
        self.facade.cancel()
    }

    /// Headers of the most recent response.
    pub fn response_headers(&self) -> Option<HeaderMap> {
        lock(&self.shared.last_headers).clone()
    }

    pub fn download_data(&self, address: &str) -> Result<Vec<u8>> {
        let url = self.resolve(address)?;
        let guard = self.facade.busy_guard()?;
        self.shared.download_data(&url, Some(&guard.context()))
    }

    /// Download and decode as UTF-8. A leading byte-order mark is dropped.
    pub fn download_string(&self, address: &str) -> Result<String> {
        decode_text(self.download_data(address)?)
    }

    /// Download into `path`. A partial file is removed on failure.
    pub fn download_file(&self, address: &str, path: impl AsRef<Path>) -> Result<u64> {
        let url = self.resolve(address)?;
        let guard = self.facade.busy_guard()?;
        self.shared
            .download_file(&url, path.as_ref(), Some(&guard.context()))
    }

    /// Open the resource for reading and hand back the body stream.
    pub fn open_read(&self, address: &str) -> Result<ResponseStream> {
        let url = self.resolve(address)?;
        let guard = self.facade.busy_guard()?;
        self.shared.open_read(&url, &guard.context())
    }

    /// Open the resource for writing. `method` defaults to `POST`.
    pub fn open_write(&self, address: &str, method: Option<Method>) -> Result<RequestStream> {
        let url = self.resolve(address)?;
        let guard = self.facade.busy_guard()?;
        self.shared
            .open_write(&url, method.unwrap_or(Method::POST), &guard.context())
    }

    /// Upload `data` and return the resource as read back afterwards.
    pub fn upload_data(&self, address: &str, method: Option<Method>, data: &[u8]) -> Result<Vec<u8>> {
        let url = self.resolve(address)?;
        let guard = self.facade.busy_guard()?;
        let mut source = data;
        self.shared.upload(
            &url,
            method.unwrap_or(Method::POST),
            &mut source,
            Some(data.len() as u64),
            Some(&guard.context()),
        )
    }

    pub fn upload_string(&self, address: &str, method: Option<Method>, data: &str) -> Result<String> {
        decode_text(self.upload_data(address, method, data.as_bytes())?)
    }

    pub fn upload_file(
        &self,
        address: &str,
        method: Option<Method>,
        path: impl AsRef<Path>,
    ) -> Result<Vec<u8>> {
        let url = self.resolve(address)?;
        let guard = self.facade.busy_guard()?;
        self.shared.upload_file(
            &url,
            method.unwrap_or(Method::POST),
            path.as_ref(),
            Some(&guard.context()),
        )
    }

    pub fn download_data_async(
        &self,
        address: &str,
        token: UserToken,
        handlers: Handlers<Vec<u8>>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let shared = Arc::clone(&self.shared);
        self.facade.run(
            token,
            move |ctx| shared.download_data(&url, Some(ctx)),
            handlers,
        )
    }

    pub fn download_string_async(
        &self,
        address: &str,
        token: UserToken,
        handlers: Handlers<String>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let shared = Arc::clone(&self.shared);
        self.facade.run(
            token,
            move |ctx| decode_text(shared.download_data(&url, Some(ctx))?),
            handlers,
        )
    }

    /// Completes with the number of bytes written to `path`.
    pub fn download_file_async(
        &self,
        address: &str,
        path: impl AsRef<Path>,
        token: UserToken,
        handlers: Handlers<u64>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let path = path.as_ref().to_path_buf();
        let shared = Arc::clone(&self.shared);
        self.facade.run(
            token,
            move |ctx| shared.download_file(&url, &path, Some(ctx)),
            handlers,
        )
    }

    /// Completes with the body stream of the resource.
    pub fn open_read_async(
        &self,
        address: &str,
        token: UserToken,
        handlers: Handlers<ResponseStream>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let shared = Arc::clone(&self.shared);
        self.facade
            .run(token, move |ctx| shared.open_read(&url, ctx), handlers)
    }

    /// Completes with an open write stream. `method` defaults to `POST`.
    pub fn open_write_async(
        &self,
        address: &str,
        method: Option<Method>,
        token: UserToken,
        handlers: Handlers<RequestStream>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let method = method.unwrap_or(Method::POST);
        let shared = Arc::clone(&self.shared);
        self.facade
            .run(token, move |ctx| shared.open_write(&url, method, ctx), handlers)
    }

    pub fn upload_data_async(
        &self,
        address: &str,
        method: Option<Method>,
        data: Vec<u8>,
        token: UserToken,
        handlers: Handlers<Vec<u8>>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let method = method.unwrap_or(Method::POST);
        let shared = Arc::clone(&self.shared);
        self.facade.run(
            token,
            move |ctx| {
                let length = data.len() as u64;
                shared.upload(&url, method, &mut data.as_slice(), Some(length), Some(ctx))
            },
            handlers,
        )
    }

    pub fn upload_string_async(
        &self,
        address: &str,
        method: Option<Method>,
        data: String,
        token: UserToken,
        handlers: Handlers<String>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let method = method.unwrap_or(Method::POST);
        let shared = Arc::clone(&self.shared);
        self.facade.run(
            token,
            move |ctx| {
                let bytes = data.into_bytes();
                let length = bytes.len() as u64;
                let body = shared.upload(&url, method, &mut bytes.as_slice(), Some(length), Some(ctx))?;
                decode_text(body)
            },
            handlers,
        )
    }

    pub fn upload_file_async(
        &self,
        address: &str,
        method: Option<Method>,
        path: impl AsRef<Path>,
        token: UserToken,
        handlers: Handlers<Vec<u8>>,
    ) -> Result<()> {
        let url = self.resolve(address)?;
        let method = method.unwrap_or(Method::POST);
        let path = path.as_ref().to_path_buf();
        let shared = Arc::clone(&self.shared);
        self.facade.run(
            token,
            move |ctx| shared.upload_file(&url, method, &path, Some(ctx)),
            handlers,
        )
    }
}

impl std::fmt::Debug for ResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClient")
            .field("config", &self.shared.config)
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filewire_core::MemoryResource;

    fn client() -> ResourceClient {
        ResourceClient::new(ClientConfig::default()).unwrap()
    }

    #[test]
    fn absolute_urls_pass_through() {
        let url = client().resolve("mem://host/a/b").unwrap();
        assert_eq!(url.as_str(), "mem://host/a/b");
    }

    #[test]
    fn relative_addresses_join_base() {
        let config = ClientConfig {
            base_address: Some(Url::parse("file:///srv/data/").unwrap()),
            ..ClientConfig::default()
        };
        let client = ResourceClient::new(config).unwrap();
        assert_eq!(
            client.resolve("reports/q1.csv").unwrap().as_str(),
            "file:///srv/data/reports/q1.csv"
        );
    }

    #[test]
    fn bare_paths_become_file_urls() {
        let url = client().resolve("some/relative.txt").unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/some/relative.txt"));
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!(matches!(
            client().resolve("  "),
            Err(Error::InvalidLocator { .. })
        ));
    }

    #[test]
    fn bom_is_stripped() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("héllo".as_bytes());
        assert_eq!(decode_text(bytes).unwrap(), "héllo");
    }

    #[test]
    fn invalid_utf8_is_decode_error() {
        assert!(matches!(
            decode_text(vec![0xff, 0xfe]),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn short_body_fails_download() {
        struct ShortResource(MemoryResource);

        impl Resource for ShortResource {
            fn open_write(
                &self,
                locator: &Url,
                access: AccessMode,
            ) -> io::Result<Box<dyn filewire_core::ResourceWriter>> {
                self.0.open_write(locator, access)
            }

            fn open_read(&self, locator: &Url) -> io::Result<filewire_core::ResourceReader> {
                let mut reader = self.0.open_read(locator)?;
                reader.length = reader.length.map(|len| len + 5);
                Ok(reader)
            }
        }

        let memory = MemoryResource::new();
        let url = Url::parse("mem://short/file").unwrap();
        memory.insert(&url, b"abc".to_vec());
        let client =
            ResourceClient::with_resource(ClientConfig::default(), Arc::new(ShortResource(memory)))
                .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let err = client.download_file(url.as_str(), &target).unwrap_err();
        assert!(err.to_string().contains("prematurely"));
        assert!(!target.exists());
    }
}
