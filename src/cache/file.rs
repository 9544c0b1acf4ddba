//! Filesystem response cache middleware.
//!
//! [`FileCacheMiddleware`] maps each request to a file path. When the file
//! exists it is served without running the rest of the chain. Otherwise the
//! path is staged in the request [`Context`] and downstream handlers produce
//! the content through a [`CacheSender`], which writes it to disk as it
//! answers the request.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_cache::cache::{CacheContent, FileCacheMiddleware, FileCacheSettings, SendOptions};
//! use rttp_cache::context::Context;
//! use rttp_cache::middleware::Pipeline;
//! use rttp_cache::server::Server;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::new()
//!     .layer(Arc::new(FileCacheMiddleware::new(FileCacheSettings::under_root("cache"))))
//!     .handler(|ctx: Context| async move {
//!         let Some(sender) = ctx.cache_sender() else {
//!             return rttp_cache::Response::default();
//!         };
//!         let page = format!("<h1>{}</h1>", ctx.request().path());
//!         sender
//!             .send(CacheContent::Text(page), SendOptions::default().content_type("text/html"))
//!             .await
//!             .unwrap_or_else(|e| e.into_response())
//!     });
//!
//! Server::bind("127.0.0.1:8080").await?.serve(pipeline).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, warn};

use super::config::CacheConfig;
use super::key::CacheKey;
use crate::context::Context;
use crate::http::{BodyStream, Response, StatusCode};
use crate::middleware::{Middleware, Next};

/// Error type returned by dynamic setting resolvers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed `Send` future, as produced by dynamic resolvers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Resolver<T> = Arc<dyn Fn(&Context) -> BoxFuture<Result<T, BoxError>> + Send + Sync>;

/// Suffix of the sibling files content is written to before it is renamed
/// into place.
const PARTIAL_SUFFIX: &str = ".partial";

/// Hex digits of the query digest appended to a cached file name.
const QUERY_TAG_LEN: usize = 16;

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum FileCacheError {
    #[error("file cache I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("cannot cache content of type {kind}; expected a stream, text or bytes")]
    UnsupportedContent { kind: &'static str },

    #[error("a response was already sent for this request")]
    AlreadySent,

    #[error("failed to resolve file cache setting: {0}")]
    Resolve(String),

    #[error("file cache hook failed: {0}")]
    Hook(String),
}

impl FileCacheError {
    /// Wraps a hook failure, leaving errors already raised by the cache as they are.
    fn from_hook(err: FileCacheError) -> Self {
        match err {
            err @ FileCacheError::Hook(_) => err,
            other => FileCacheError::Hook(other.to_string()),
        }
    }

    /// Logs the error and converts it into a `500 Internal Server Error` response.
    pub fn into_response(self) -> Response {
        error!(error = %self, "file cache request failed");
        Response::new(StatusCode::InternalServerError).body("Internal Server Error")
    }
}

/// A per-request setting: a fixed value or one computed from the request.
pub enum Setting<T> {
    Static(T),
    Dynamic(Resolver<T>),
}

impl<T> Setting<T>
where
    T: Clone + Send + 'static,
{
    /// Builds a setting resolved from each request's context.
    ///
    /// The returned future must own what it needs from the context.
    pub fn dynamic<F, Fut>(resolver: F) -> Self
    where
        F: Fn(&Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Setting::Dynamic(Arc::new(move |ctx: &Context| -> BoxFuture<Result<T, BoxError>> {
            Box::pin(resolver(ctx))
        }))
    }

    async fn resolve(&self, ctx: &Context) -> Result<T, FileCacheError> {
        match self {
            Setting::Static(value) => Ok(value.clone()),
            Setting::Dynamic(resolver) => resolver(ctx)
                .await
                .map_err(|e| FileCacheError::Resolve(e.to_string())),
        }
    }
}

impl<T: Clone> Clone for Setting<T> {
    fn clone(&self) -> Self {
        match self {
            Setting::Static(value) => Setting::Static(value.clone()),
            Setting::Dynamic(resolver) => Setting::Dynamic(Arc::clone(resolver)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Setting::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<bool> for Setting<bool> {
    fn from(value: bool) -> Self {
        Setting::Static(value)
    }
}

impl From<PathBuf> for Setting<PathBuf> {
    fn from(value: PathBuf) -> Self {
        Setting::Static(value)
    }
}

impl From<&str> for Setting<PathBuf> {
    fn from(value: &str) -> Self {
        Setting::Static(PathBuf::from(value))
    }
}

/// Extension points around the cache probe.
#[async_trait]
pub trait FileHooks: Send + Sync {
    /// Builds the response for a cache hit. Serves the file by default.
    async fn on_cached_file(&self, _ctx: &Context, path: &Path) -> Result<Response, FileCacheError> {
        Ok(Response::file(path).await?)
    }

    /// Runs on a miss after the parent directory exists, before the handler.
    async fn on_create_file(&self, _ctx: &Context, _path: &Path) -> Result<(), FileCacheError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFileHooks;

impl FileHooks for DefaultFileHooks {}

/// The staged cache file for the current request.
///
/// Empty unless the probe missed and downstream is expected to fill the file.
#[derive(Debug, Default, Clone)]
pub struct CachePath(Arc<OnceLock<PathBuf>>);

impl CachePath {
    pub fn get(&self) -> Option<&Path> {
        self.0.get().map(PathBuf::as_path)
    }

    fn stage(&self, path: PathBuf) {
        if let Err(rejected) = self.0.set(path) {
            warn!(path = %rejected.display(), "cache path already staged for this request");
        }
    }
}

/// Content handed to [`CacheSender::send`].
pub enum CacheContent {
    Stream(BodyStream),
    Text(String),
    Bytes(Bytes),
    /// A value with no file representation; always rejected.
    Other { kind: &'static str },
}

impl CacheContent {
    pub fn stream(reader: impl AsyncRead + Send + 'static) -> Self {
        CacheContent::Stream(Box::pin(reader))
    }
}

impl fmt::Debug for CacheContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheContent::Stream(_) => f.write_str("Stream(..)"),
            CacheContent::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            CacheContent::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            CacheContent::Other { kind } => f.debug_struct("Other").field("kind", kind).finish(),
        }
    }
}

impl From<String> for CacheContent {
    fn from(text: String) -> Self {
        CacheContent::Text(text)
    }
}

impl From<&str> for CacheContent {
    fn from(text: &str) -> Self {
        CacheContent::Text(text.to_owned())
    }
}

impl From<Bytes> for CacheContent {
    fn from(bytes: Bytes) -> Self {
        CacheContent::Bytes(bytes)
    }
}

impl From<Vec<u8>> for CacheContent {
    fn from(bytes: Vec<u8>) -> Self {
        CacheContent::Bytes(Bytes::from(bytes))
    }
}

impl From<Value> for CacheContent {
    fn from(value: Value) -> Self {
        let kind = match value {
            Value::String(text) => return CacheContent::Text(text),
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        };
        CacheContent::Other { kind }
    }
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Persist the content to the staged cache path, if any.
    pub write_through: bool,
    /// Explicit `Content-Type`; guessed from the staged path when absent.
    pub content_type: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            write_through: true,
            content_type: None,
        }
    }
}

impl SendOptions {
    /// Options that answer the request without touching the cache file.
    pub fn pass_through() -> Self {
        Self {
            write_through: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Answers the request and writes the content through to the staged cache file.
///
/// One terminal action per request: a second successful claim fails with
/// [`FileCacheError::AlreadySent`].
#[derive(Debug, Clone)]
pub struct CacheSender {
    path: CachePath,
    sent: Arc<AtomicBool>,
}

impl CacheSender {
    fn new(path: CachePath) -> Self {
        Self {
            path,
            sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The staged cache path, when the probe missed.
    pub fn path(&self) -> Option<&Path> {
        self.path.get()
    }

    /// Builds the response for `content`, persisting it when `options.write_through`
    /// is set and a cache path is staged.
    ///
    /// A written-through stream is copied to disk in full and then served from
    /// the file. Without write-through a stream is relayed as the response body.
    ///
    /// # Errors
    ///
    /// - [`FileCacheError::UnsupportedContent`] for [`CacheContent::Other`].
    /// - [`FileCacheError::AlreadySent`] if this request was already answered.
    /// - [`FileCacheError::Io`] if persisting fails. Nothing is left at the
    ///   cache path and the sender stays usable, so the handler can answer
    ///   with [`SendOptions::pass_through`] instead.
    pub async fn send(
        &self,
        content: impl Into<CacheContent>,
        options: SendOptions,
    ) -> Result<Response, FileCacheError> {
        let content = content.into();
        if let CacheContent::Other { kind } = &content {
            return Err(FileCacheError::UnsupportedContent { kind: *kind });
        }
        if self.sent.swap(true, Ordering::AcqRel) {
            return Err(FileCacheError::AlreadySent);
        }

        let result = self.respond(content, options).await;
        if let Err(FileCacheError::Io(_)) = &result {
            self.sent.store(false, Ordering::Release);
        }
        result
    }

    async fn respond(&self, content: CacheContent, options: SendOptions) -> Result<Response, FileCacheError> {
        let staged = if options.write_through {
            self.path.get()
        } else {
            None
        };
        let content_type = options
            .content_type
            .clone()
            .or_else(|| staged.and_then(guess_content_type));

        let response = match (content, staged) {
            (CacheContent::Stream(mut reader), Some(path)) => {
                let file = write_stream(path, &mut reader).await?;
                debug!(path = %path.display(), "cached streamed response");
                Response::file_stream(file, path)
            }
            (CacheContent::Stream(reader), None) => Response::new(StatusCode::Ok)
                .content_type(content_type.as_deref().unwrap_or("application/octet-stream"))
                .stream(reader),
            (CacheContent::Text(text), staged) => {
                let bytes = Bytes::from(text);
                persist(staged, &bytes).await?;
                Response::new(StatusCode::Ok)
                    .content_type(content_type.as_deref().unwrap_or("text/plain; charset=utf-8"))
                    .body_bytes(bytes)
            }
            (CacheContent::Bytes(bytes), staged) => {
                persist(staged, &bytes).await?;
                Response::new(StatusCode::Ok)
                    .content_type(content_type.as_deref().unwrap_or("application/octet-stream"))
                    .body_bytes(bytes)
            }
            (CacheContent::Other { kind }, _) => {
                return Err(FileCacheError::UnsupportedContent { kind });
            }
        };

        Ok(match options.content_type {
            Some(content_type) => response.content_type(content_type),
            None => response,
        })
    }
}

fn guess_content_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_owned())
}

/// A fresh sibling of `path` for content that is still being written.
///
/// The probe only ever sees `path` once the content is complete.
fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{seq}{PARTIAL_SUFFIX}", std::process::id()))
}

async fn discard_partial(partial: &Path, err: &io::Error) {
    warn!(path = %partial.display(), error = %err, "cache write failed, removing partial file");
    if let Err(remove) = tokio::fs::remove_file(partial).await {
        debug!(path = %partial.display(), error = %remove, "partial cache file not removed");
    }
}

async fn persist(staged: Option<&Path>, bytes: &Bytes) -> Result<(), FileCacheError> {
    let Some(path) = staged else {
        return Ok(());
    };
    let partial = partial_path(path);
    let written = async {
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, path).await
    }
    .await;

    if let Err(e) = written {
        discard_partial(&partial, &e).await;
        return Err(e.into());
    }
    debug!(path = %path.display(), len = bytes.len(), "cached response");
    Ok(())
}

/// Copies `reader` to `path` and returns the written file rewound to its start.
async fn write_stream(path: &Path, reader: &mut BodyStream) -> Result<tokio::fs::File, FileCacheError> {
    let partial = partial_path(path);
    let written = async {
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&partial)
            .await?;
        tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        tokio::fs::rename(&partial, path).await?;
        Ok::<_, io::Error>(file)
    }
    .await;

    match written {
        Ok(file) => Ok(file),
        Err(e) => {
            discard_partial(&partial, &e).await;
            Err(e.into())
        }
    }
}

/// Where requests are cached and how hits and misses are handled.
#[derive(Clone)]
pub struct FileCacheSettings {
    path: Setting<PathBuf>,
    enabled: Setting<bool>,
    hooks: Arc<dyn FileHooks>,
}

impl FileCacheSettings {
    pub fn new(path: impl Into<Setting<PathBuf>>) -> Self {
        Self {
            path: path.into(),
            enabled: Setting::Static(true),
            hooks: Arc::new(DefaultFileHooks),
        }
    }

    /// Caches each request at its path below `root`.
    ///
    /// Paths ending in `/` map to `index.html`. A non-empty query string adds
    /// a digest of the query to the file name, so `/search?q=a` and
    /// `/search?q=b` are cached apart. Requests containing `..` segments fail
    /// to resolve.
    pub fn under_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::new(Setting::dynamic(move |ctx: &Context| {
            let request = ctx.request();
            let resolved = path_for_request(&root, request.path(), request.query_string());
            async move { resolved }
        }))
    }

    /// [`under_root`](Self::under_root) at the configured `file_root`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::under_root(config.file_root.clone())
    }

    #[must_use]
    pub fn enabled(mut self, enabled: impl Into<Setting<bool>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: impl FileHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    async fn probe(&self, ctx: &Context, slot: &CachePath) -> Result<Probe, FileCacheError> {
        let method = ctx.request().method();
        if !method.is_cacheable() {
            debug!(%method, path = ctx.request().path(), "file cache skipped for method");
            return Ok(Probe::Skip);
        }

        let (enabled, path) = tokio::join!(self.enabled.resolve(ctx), self.path.resolve(ctx));
        if !enabled? {
            debug!(path = ctx.request().path(), "file cache disabled for request");
            return Ok(Probe::Skip);
        }
        let path = path?;

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                debug!(path = %path.display(), outcome = "hit", "file cache");
                return self
                    .hooks
                    .on_cached_file(ctx, &path)
                    .await
                    .map(Probe::Hit)
                    .map_err(FileCacheError::from_hook);
            }
            Ok(_) => debug!(path = %path.display(), "cache path is not a regular file"),
            Err(e) => debug!(path = %path.display(), error = %e, "cache probe"),
        }

        debug!(path = %path.display(), outcome = "miss", "file cache");
        slot.stage(path.clone());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.hooks
            .on_create_file(ctx, &path)
            .await
            .map_err(FileCacheError::from_hook)?;
        Ok(Probe::Miss)
    }
}

impl fmt::Debug for FileCacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCacheSettings")
            .field("path", &self.path)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

fn path_for_request(root: &Path, request_path: &str, query: Option<&str>) -> Result<PathBuf, BoxError> {
    let mut path = root.to_path_buf();
    for segment in request_path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if segment == ".." || segment.contains('\\') {
            return Err(format!("request path escapes the cache root: {request_path}").into());
        }
        if segment.starts_with('.') && segment.ends_with(PARTIAL_SUFFIX) {
            return Err(format!("request path names an unfinished cache file: {request_path}").into());
        }
        path.push(segment);
    }
    if request_path.is_empty() || request_path.ends_with('/') {
        path.push("index.html");
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        let digest = CacheKey::hashed("", &query)?;
        let tag = digest.as_str().get(..QUERY_TAG_LEN).unwrap_or(digest.as_str());
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{stem}~{tag}.{}", ext.to_string_lossy()),
            None => format!("{stem}~{tag}"),
        };
        path.set_file_name(name);
    }
    Ok(path)
}

enum Probe {
    Skip,
    Hit(Response),
    Miss,
}

/// Serves cached files and stages misses for downstream handlers.
pub struct FileCacheMiddleware {
    settings: Arc<FileCacheSettings>,
}

impl FileCacheMiddleware {
    pub fn new(settings: FileCacheSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl Middleware for FileCacheMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let settings = Arc::clone(&self.settings);
        Box::pin(async move {
            let slot = CachePath::default();
            ctx.extensions_mut().insert(slot.clone());
            ctx.extensions_mut().insert(CacheSender::new(slot.clone()));

            match settings.probe(&ctx, &slot).await {
                Ok(Probe::Hit(response)) => response,
                Ok(Probe::Skip | Probe::Miss) => next.run(ctx).await,
                Err(e) => e.into_response(),
            }
        })
    }
}

impl Context {
    /// The staged cache file, when [`FileCacheMiddleware`] missed.
    pub fn cache_path(&self) -> Option<&Path> {
        self.extensions().get::<CachePath>().and_then(CachePath::get)
    }

    /// The request's [`CacheSender`], when [`FileCacheMiddleware`] ran.
    pub fn cache_sender(&self) -> Option<CacheSender> {
        self.extensions().get::<CacheSender>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context as TaskContext, Poll};
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    use super::*;
    use crate::Request;
    use crate::middleware::Pipeline;

    fn make_request(path: &str) -> Request {
        request_with_method("GET", path)
    }

    fn request_with_method(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    fn partial_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .collect()
    }

    async fn read_body(res: Response) -> Bytes {
        res.into_body().collect().await.unwrap()
    }

    /// Pipeline whose handler counts calls and sends `content()` with `options`.
    fn pipeline<F>(settings: FileCacheSettings, calls: Arc<AtomicUsize>, content: F, options: SendOptions) -> Pipeline
    where
        F: Fn() -> CacheContent + Send + Sync + 'static,
    {
        Pipeline::new()
            .layer(Arc::new(FileCacheMiddleware::new(settings)))
            .handler(move |ctx: Context| {
                calls.fetch_add(1, Ordering::SeqCst);
                let payload = content();
                let options = options.clone();
                async move {
                    let Some(sender) = ctx.cache_sender() else {
                        return Response::new(StatusCode::NotFound);
                    };
                    sender
                        .send(payload, options)
                        .await
                        .unwrap_or_else(FileCacheError::into_response)
                }
            })
    }

    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(io::Error::other("upstream reset")));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn miss_stages_path_and_writes_through() {
        let root = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            calls.clone(),
            || CacheContent::from("<p>hi</p>"),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(make_request("/posts/hello.html")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.headers().get("content-type"), Some("text/html"));
        assert_eq!(read_body(res).await, "<p>hi</p>");

        let cached = root.path().join("posts/hello.html");
        assert_eq!(std::fs::read(&cached).unwrap(), b"<p>hi</p>");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hit_serves_file_without_running_handler() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("style.css"), "body{}").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            calls.clone(),
            || CacheContent::from("fresh"),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(make_request("/style.css")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.headers().get("content-type"), Some("text/css"));
        assert_eq!(read_body(res).await, "body{}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_request_hits_what_the_first_wrote() {
        let root = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            calls.clone(),
            || CacheContent::from("rendered"),
            SendOptions::default(),
        );

        pipeline.dispatch(make_request("/docs/")).await;
        let res = pipeline.dispatch(make_request("/docs/")).await;
        assert_eq!(read_body(res).await, "rendered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(root.path().join("docs/index.html").is_file());
    }

    #[tokio::test]
    async fn disabled_skips_probe_and_staging() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("page.txt"), "stale").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()).enabled(false),
            calls.clone(),
            || CacheContent::from("live"),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(make_request("/page.txt")).await;
        assert_eq!(read_body(res).await, "live");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_to_string(root.path().join("page.txt")).unwrap(), "stale");
    }

    #[tokio::test]
    async fn dynamic_enabled_reads_request() {
        let root = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let enabled: Setting<bool> = Setting::dynamic(|ctx: &Context| {
            let cacheable = ctx.request().query_param("nocache").is_none();
            async move { Ok(cacheable) }
        });
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()).enabled(enabled),
            calls.clone(),
            || CacheContent::from("x"),
            SendOptions::default(),
        );

        pipeline.dispatch(make_request("/a.txt?nocache=1")).await;
        assert!(!root.path().join("a.txt").exists());
        pipeline.dispatch(make_request("/a.txt")).await;
        assert!(root.path().join("a.txt").is_file());
    }

    #[tokio::test]
    async fn stream_write_through_serves_from_disk() {
        let root = TempDir::new().unwrap();
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            Arc::new(AtomicUsize::new(0)),
            || CacheContent::stream(std::io::Cursor::new(b"streamed bytes".to_vec())),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(make_request("/feed.json")).await;
        assert!(res.body_ref().is_stream());
        assert_eq!(res.headers().get("content-type"), Some("application/json"));
        assert_eq!(read_body(res).await, "streamed bytes");
        assert_eq!(std::fs::read(root.path().join("feed.json")).unwrap(), b"streamed bytes");
    }

    #[tokio::test]
    async fn stream_pass_through_relays_without_writing() {
        let root = TempDir::new().unwrap();
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            Arc::new(AtomicUsize::new(0)),
            || CacheContent::stream(std::io::Cursor::new(b"relayed".to_vec())),
            SendOptions::pass_through(),
        );

        let res = pipeline.dispatch(make_request("/live.txt")).await;
        assert!(res.body_ref().is_stream());
        assert!(!root.path().join("live.txt").exists());

        let mut wire = Vec::new();
        res.write_to(&mut wire).await.unwrap();
        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.contains("Transfer-Encoding: chunked\r\n"));
        assert!(wire.ends_with("7\r\nrelayed\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn failed_write_through_stream_removes_partial_file() {
        let root = TempDir::new().unwrap();
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            Arc::new(AtomicUsize::new(0)),
            || CacheContent::stream(FailingReader { sent: false }),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(make_request("/broken.bin")).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
        assert!(!root.path().join("broken.bin").exists());
        assert!(partial_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn unfinished_stream_is_invisible_to_concurrent_requests() {
        let root = TempDir::new().unwrap();
        let (mut upstream, reader) = tokio::io::duplex(64);
        let first = Mutex::new(Some(reader));
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            calls.clone(),
            move || match first.lock().unwrap().take() {
                Some(reader) => CacheContent::stream(reader),
                None => CacheContent::from("second"),
            },
            SendOptions::default(),
        );

        let slow = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.dispatch(make_request("/report.txt")).await }
        });
        upstream.write_all(b"PARTIAL-").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while partial_files(root.path()).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!root.path().join("report.txt").exists());

        let res = pipeline.dispatch(make_request("/report.txt")).await;
        assert_eq!(read_body(res).await, "second");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        upstream.write_all(b"REST").await.unwrap();
        drop(upstream);
        let res = slow.await.unwrap();
        assert_eq!(read_body(res).await, "PARTIAL-REST");
        assert_eq!(
            std::fs::read_to_string(root.path().join("report.txt")).unwrap(),
            "PARTIAL-REST"
        );
        assert!(partial_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_write_through_can_fall_back_to_pass_through() {
        let root = TempDir::new().unwrap();
        let slot = CachePath::default();
        slot.stage(root.path().join("feed.xml"));
        let sender = CacheSender::new(slot);

        let err = sender
            .send(CacheContent::stream(FailingReader { sent: false }), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FileCacheError::Io(_)));

        let res = sender
            .send("<feed/>", SendOptions::pass_through().content_type("application/xml"))
            .await
            .unwrap();
        assert_eq!(res.headers().get("content-type"), Some("application/xml"));
        assert_eq!(read_body(res).await, "<feed/>");
        assert!(!root.path().join("feed.xml").exists());

        let err = sender.send("again", SendOptions::pass_through()).await.unwrap_err();
        assert!(matches!(err, FileCacheError::AlreadySent));
    }

    #[tokio::test]
    async fn query_variants_are_cached_apart() {
        let root = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pipeline = Pipeline::new()
            .layer(Arc::new(FileCacheMiddleware::new(FileCacheSettings::under_root(root.path()))))
            .handler(move |ctx: Context| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let q = ctx.request().query_param("q").unwrap_or_default().to_owned();
                    let sender = ctx.cache_sender().unwrap();
                    sender
                        .send(format!("results for {q}"), SendOptions::default())
                        .await
                        .unwrap_or_else(FileCacheError::into_response)
                }
            });

        let a = pipeline.dispatch(make_request("/search?q=a")).await;
        let b = pipeline.dispatch(make_request("/search?q=b")).await;
        assert_eq!(read_body(a).await, "results for a");
        assert_eq!(read_body(b).await, "results for b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let again = pipeline.dispatch(make_request("/search?q=a")).await;
        assert_eq!(read_body(again).await, "results for a");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!root.path().join("search").exists());
    }

    #[tokio::test]
    async fn non_get_requests_bypass_the_cache() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("form.html"), "cached").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            calls.clone(),
            || CacheContent::from("submitted"),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(request_with_method("POST", "/form.html")).await;
        assert_eq!(read_body(res).await, "submitted");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_to_string(root.path().join("form.html")).unwrap(), "cached");

        let res = pipeline.dispatch(request_with_method("HEAD", "/other.html")).await;
        assert_eq!(read_body(res).await, "submitted");
        assert!(!root.path().join("other.html").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn enabled_and_path_resolve_concurrently() {
        let root = TempDir::new().unwrap();
        let dir = root.path().to_path_buf();
        let path = Setting::dynamic(move |_ctx: &Context| {
            let file = dir.join("slow.txt");
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, BoxError>(file)
            }
        });
        let enabled: Setting<bool> = Setting::dynamic(|_ctx: &Context| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(true)
        });
        let pipeline = pipeline(
            FileCacheSettings::new(path).enabled(enabled),
            Arc::new(AtomicUsize::new(0)),
            || CacheContent::from("slow"),
            SendOptions::default(),
        );

        let start = tokio::time::Instant::now();
        let res = pipeline.dispatch(make_request("/slow.txt")).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(read_body(res).await, "slow");
        assert!(root.path().join("slow.txt").is_file());
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_handler() {
        let root = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()),
            calls.clone(),
            || CacheContent::from("x"),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(make_request("/../secret.txt")).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolver_error_becomes_500() {
        let calls = Arc::new(AtomicUsize::new(0));
        let path = Setting::dynamic(|_ctx: &Context| async { Err::<PathBuf, BoxError>("no route".into()) });
        let pipeline = pipeline(
            FileCacheSettings::new(path),
            calls.clone(),
            || CacheContent::from("x"),
            SendOptions::default(),
        );

        let res = pipeline.dispatch(make_request("/")).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[derive(Default)]
    struct RecordingHooks {
        created: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl FileHooks for Arc<RecordingHooks> {
        async fn on_cached_file(&self, _ctx: &Context, _path: &Path) -> Result<Response, FileCacheError> {
            Ok(Response::new(StatusCode::NotModified))
        }

        async fn on_create_file(&self, _ctx: &Context, path: &Path) -> Result<(), FileCacheError> {
            assert!(path.parent().is_some_and(Path::is_dir));
            self.created.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    struct FailingHooks;

    #[async_trait]
    impl FileHooks for FailingHooks {
        async fn on_create_file(&self, _ctx: &Context, _path: &Path) -> Result<(), FileCacheError> {
            Err(io::Error::other("quota exceeded").into())
        }
    }

    #[tokio::test]
    async fn hook_failures_surface_as_hook_errors() {
        let root = TempDir::new().unwrap();
        let settings = FileCacheSettings::under_root(root.path()).hooks(FailingHooks);
        let ctx = Context::new(make_request("/page.txt"));

        let err = match settings.probe(&ctx, &CachePath::default()).await {
            Err(err) => err,
            Ok(_) => panic!("probe should fail when on_create_file fails"),
        };
        assert!(matches!(&err, FileCacheError::Hook(msg) if msg.contains("quota exceeded")));
        assert_eq!(err.into_response().status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn hooks_run_on_create_and_hit() {
        let root = TempDir::new().unwrap();
        let hooks = Arc::new(RecordingHooks::default());
        let pipeline = pipeline(
            FileCacheSettings::under_root(root.path()).hooks(Arc::clone(&hooks)),
            Arc::new(AtomicUsize::new(0)),
            || CacheContent::from("body"),
            SendOptions::default(),
        );

        pipeline.dispatch(make_request("/deep/nested/page.txt")).await;
        assert_eq!(
            *hooks.created.lock().unwrap(),
            vec![root.path().join("deep/nested/page.txt")]
        );

        let res = pipeline.dispatch(make_request("/deep/nested/page.txt")).await;
        assert_eq!(res.status(), StatusCode::NotModified);
    }

    #[tokio::test]
    async fn sender_is_one_shot_but_rejects_bad_shape_first() {
        let root = TempDir::new().unwrap();
        let slot = CachePath::default();
        slot.stage(root.path().join("one.txt"));
        let sender = CacheSender::new(slot);

        let err = sender
            .send(serde_json::json!(42), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FileCacheError::UnsupportedContent { kind: "number" }));

        let res = sender.send("first", SendOptions::default()).await.unwrap();
        assert_eq!(read_body(res).await, "first");
        let err = sender.send("second", SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, FileCacheError::AlreadySent));
        assert_eq!(std::fs::read_to_string(root.path().join("one.txt")).unwrap(), "first");
    }

    #[tokio::test]
    async fn explicit_content_type_wins() {
        let sender = CacheSender::new(CachePath::default());
        let res = sender
            .send(b"{}".to_vec(), SendOptions::default().content_type("application/json"))
            .await
            .unwrap();
        assert_eq!(res.headers().get("content-type"), Some("application/json"));
        assert_eq!(sender.path(), None);
    }

    #[test]
    fn json_values_map_to_content() {
        assert!(matches!(CacheContent::from(serde_json::json!("s")), CacheContent::Text(t) if t == "s"));
        assert!(matches!(
            CacheContent::from(serde_json::json!({"a": 1})),
            CacheContent::Other { kind: "object" }
        ));
        assert!(matches!(CacheContent::from(Value::Null), CacheContent::Other { kind: "null" }));
    }

    #[test]
    fn request_paths_map_below_root() {
        let root = Path::new("/srv/cache");
        assert_eq!(path_for_request(root, "/", None).unwrap(), root.join("index.html"));
        assert_eq!(path_for_request(root, "/a/b/", None).unwrap(), root.join("a/b/index.html"));
        assert_eq!(path_for_request(root, "/a//./b.txt", Some("")).unwrap(), root.join("a/b.txt"));
        assert!(path_for_request(root, "/a/../../etc/passwd", None).is_err());
        assert!(path_for_request(root, "/.page.html.7.0.partial", None).is_err());
    }

    #[test]
    fn query_is_folded_into_the_file_name() {
        let root = Path::new("/srv/cache");
        let a = path_for_request(root, "/search.html", Some("q=a")).unwrap();
        let b = path_for_request(root, "/search.html", Some("q=b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, path_for_request(root, "/search.html", Some("q=a")).unwrap());
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("html"));

        let name = a.file_name().and_then(|n| n.to_str()).unwrap();
        let tag = name.strip_prefix("search~").and_then(|n| n.strip_suffix(".html")).unwrap();
        assert_eq!(tag.len(), QUERY_TAG_LEN);

        let index = path_for_request(root, "/docs/", Some("page=2")).unwrap();
        assert_eq!(index.parent(), Some(root.join("docs").as_path()));
        assert!(index.to_str().unwrap().ends_with(".html"));
    }
}
