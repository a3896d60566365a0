//! HTTP client abstraction and the interceptor chain.
//!
//! The engine never talks to a socket itself: implementations of
//! [`HttpClient`] provide the transport (reqwest, ureq, a loopback for
//! tests) and the engine layers headers, interceptors, and replay on top.
//!
//! Request bodies are produced by a restartable factory rather than a
//! one-shot stream, so an interceptor-driven replay re-streams the body
//! from the start. Response interceptors run on status and headers before
//! the body is consumed; the replay decision never depends on the body.

use crate::error::{SyncError, SyncResult};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// A single HTTP request.
pub struct HttpRequest {
    /// HTTP method.
    pub method: &'static str,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs; later entries override earlier ones.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<HttpBody>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET",
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a POST request with a body.
    pub fn post(url: impl Into<String>, body: HttpBody) -> Self {
        Self {
            method: "POST",
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// Creates a PUT request with a body.
    pub fn put(url: impl Into<String>, body: HttpBody) -> Self {
        Self {
            method: "PUT",
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a header, replacing any existing value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A restartable request body.
///
/// `open()` may be called once per transmission attempt; each call yields
/// a fresh stream over the same bytes.
#[derive(Clone)]
pub struct HttpBody {
    /// MIME type of the body.
    pub content_type: String,
    /// Body length in bytes, when known. Clients send
    /// `Expect: 100-continue` for large known-length bodies.
    pub length: Option<u64>,
    factory: Arc<dyn Fn() -> Box<dyn Read + Send> + Send + Sync>,
}

impl HttpBody {
    /// Creates a body from an owned byte buffer.
    pub fn from_bytes(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let bytes = Arc::new(bytes);
        let length = Some(bytes.len() as u64);
        Self {
            content_type: content_type.into(),
            length,
            factory: Arc::new(move || {
                let bytes = Arc::clone(&bytes);
                Box::new(CursorOverArc { bytes, pos: 0 })
            }),
        }
    }

    /// Creates a JSON body.
    pub fn json(bytes: Vec<u8>) -> Self {
        Self::from_bytes("application/json", bytes)
    }

    /// Creates a body from a restartable stream factory.
    pub fn from_factory(
        content_type: impl Into<String>,
        length: Option<u64>,
        factory: impl Fn() -> Box<dyn Read + Send> + Send + Sync + 'static,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            length,
            factory: Arc::new(factory),
        }
    }

    /// Opens a fresh stream over the body bytes.
    pub fn open(&self) -> Box<dyn Read + Send> {
        (self.factory)()
    }
}

struct CursorOverArc {
    bytes: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for CursorOverArc {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.bytes[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// An HTTP response with its body still unconsumed.
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body stream.
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Reads the whole body into memory.
    pub fn read_body(mut self) -> SyncResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.body
            .read_to_end(&mut bytes)
            .map_err(|e| SyncError::transport_retryable(format!("reading response body: {e}")))?;
        Ok(bytes)
    }
}

/// The transport seam: executes one HTTP exchange.
///
/// Implementations own connection pooling and must honor the configured
/// connect/read timeouts, surfacing expiry as [`SyncError::Timeout`].
pub trait HttpClient: Send + Sync {
    /// Executes the request and returns the response with its body
    /// unconsumed.
    fn execute(&self, request: &HttpRequest) -> SyncResult<HttpResponse>;
}

/// A hook pair around each HTTP exchange.
///
/// Both hooks default to pass-through, so an interceptor implements only
/// the side it cares about.
pub trait HttpInterceptor: Send + Sync {
    /// Runs before the request is sent; may mutate the request.
    fn intercept_request(&self, ctx: &mut RequestContext<'_>) -> SyncResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Runs after status and headers arrive, before the body is consumed;
    /// may request a replay of the whole exchange.
    fn intercept_response(&self, ctx: &mut ResponseContext<'_>) -> SyncResult<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Mutable view of an outgoing request.
pub struct RequestContext<'a> {
    /// The request about to be sent.
    pub request: &'a mut HttpRequest,
}

/// View of a completed exchange: the request remains mutable for replay
/// adjustments, the response is read-only, and the body is not exposed.
pub struct ResponseContext<'a> {
    /// The request that produced this response.
    pub request: &'a mut HttpRequest,
    /// Response status code.
    pub status: u16,
    /// Response headers.
    pub headers: &'a [(String, String)],
    /// Set to reissue the entire exchange (bounded by the retry budget).
    pub replay_request: bool,
}

/// Adds a `Basic` Authorization header to every request.
pub struct BasicAuthInterceptor {
    header: String,
}

impl BasicAuthInterceptor {
    /// Creates the interceptor from a username and password.
    pub fn new(username: &str, password: &str) -> Self {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        Self {
            header: format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))),
        }
    }
}

impl HttpInterceptor for BasicAuthInterceptor {
    fn intercept_request(&self, ctx: &mut RequestContext<'_>) -> SyncResult<()> {
        ctx.request.set_header("Authorization", self.header.clone());
        Ok(())
    }
}

/// Wraps an [`HttpClient`] with the default headers, the interceptor
/// chain, and replay handling.
pub struct InterceptedClient {
    client: Arc<dyn HttpClient>,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    user_agent: String,
    max_replays: u32,
}

impl InterceptedClient {
    /// Creates a wrapper around `client`.
    pub fn new(
        client: Arc<dyn HttpClient>,
        interceptors: Vec<Arc<dyn HttpInterceptor>>,
        user_agent: impl Into<String>,
        max_replays: u32,
    ) -> Self {
        Self {
            client,
            interceptors,
            user_agent: user_agent.into(),
            max_replays: max_replays.max(1),
        }
    }

    /// Executes the exchange, running interceptors on both sides and
    /// reissuing the request while an interceptor asks for a replay.
    pub fn execute(&self, mut request: HttpRequest) -> SyncResult<HttpResponse> {
        let mut attempts = self.max_replays;
        loop {
            attempts -= 1;

            request.set_header("User-Agent", self.user_agent.clone());
            let body_headers = request
                .body
                .as_ref()
                .map(|body| (body.content_type.clone(), body.length));
            if let Some((content_type, length)) = body_headers {
                request.set_header("Content-Type", content_type);
                // Avoids streaming large bodies at a server that is about
                // to reject the request.
                if length.is_some_and(|l| l > 8 * 1024) {
                    request.set_header("Expect", "100-continue");
                }
            }

            for interceptor in &self.interceptors {
                interceptor.intercept_request(&mut RequestContext {
                    request: &mut request,
                })?;
            }

            let response = self.client.execute(&request)?;

            let mut ctx = ResponseContext {
                request: &mut request,
                status: response.status,
                headers: &response.headers,
                replay_request: false,
            };
            let mut replay = false;
            for interceptor in &self.interceptors {
                interceptor.intercept_response(&mut ctx)?;
                replay = ctx.replay_request;
            }

            if replay && attempts > 0 {
                debug!(url = %request.url, "interceptor requested replay");
                continue;
            }
            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves canned (status, body) pairs in order.
    struct ScriptedClient {
        responses: Mutex<Vec<(u16, Vec<u8>)>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(responses: Vec<(u16, Vec<u8>)>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl HttpClient for ScriptedClient {
        fn execute(&self, _request: &HttpRequest) -> SyncResult<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            let (status, body) = if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            };
            Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body: Box::new(std::io::Cursor::new(body)),
            })
        }
    }

    struct CountingInterceptor {
        requests: AtomicU32,
        responses: AtomicU32,
    }

    impl CountingInterceptor {
        fn new() -> Self {
            Self {
                requests: AtomicU32::new(0),
                responses: AtomicU32::new(0),
            }
        }
    }

    impl HttpInterceptor for CountingInterceptor {
        fn intercept_request(&self, _ctx: &mut RequestContext<'_>) -> SyncResult<()> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn intercept_response(&self, _ctx: &mut ResponseContext<'_>) -> SyncResult<()> {
            self.responses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Replays once on a 401, the cookie-refresh pattern.
    struct ReplayOn401;

    impl HttpInterceptor for ReplayOn401 {
        fn intercept_response(&self, ctx: &mut ResponseContext<'_>) -> SyncResult<()> {
            if ctx.status == 401 {
                ctx.replay_request = true;
            }
            Ok(())
        }
    }

    #[test]
    fn body_factory_is_restartable() {
        let body = HttpBody::json(b"{\"a\":1}".to_vec());
        for _ in 0..2 {
            let mut data = Vec::new();
            body.open().read_to_end(&mut data).unwrap();
            assert_eq!(data, b"{\"a\":1}");
        }
        assert_eq!(body.length, Some(7));
    }

    #[test]
    fn default_headers_applied() {
        struct HeaderCheck;
        impl HttpClient for HeaderCheck {
            fn execute(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
                assert!(request.header("User-Agent").unwrap().contains("test-agent"));
                assert_eq!(request.header("Content-Type"), Some("application/json"));
                Ok(HttpResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: Box::new(std::io::empty()),
                })
            }
        }
        let client = InterceptedClient::new(Arc::new(HeaderCheck), Vec::new(), "test-agent", 3);
        let request = HttpRequest::post("http://remote/db", HttpBody::json(b"{}".to_vec()));
        assert_eq!(client.execute(request).unwrap().status, 200);
    }

    #[test]
    fn interceptors_run_once_per_exchange_including_replays() {
        let scripted = Arc::new(ScriptedClient::new(vec![
            (401, Vec::new()),
            (200, b"ok".to_vec()),
        ]));
        let counter = Arc::new(CountingInterceptor::new());
        let client = InterceptedClient::new(
            Arc::clone(&scripted) as Arc<dyn HttpClient>,
            vec![counter.clone() as Arc<dyn HttpInterceptor>, Arc::new(ReplayOn401)],
            "agent",
            10,
        );

        let response = client.execute(HttpRequest::get("http://remote/db")).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
        assert_eq!(counter.requests.load(Ordering::SeqCst), 2);
        assert_eq!(counter.responses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn replay_budget_is_bounded() {
        let scripted = Arc::new(ScriptedClient::new(vec![(401, Vec::new())]));
        let client = InterceptedClient::new(
            Arc::clone(&scripted) as Arc<dyn HttpClient>,
            vec![Arc::new(ReplayOn401)],
            "agent",
            3,
        );
        let response = client.execute(HttpRequest::get("http://remote/db")).unwrap();
        // Budget exhausted: the last response is returned as-is.
        assert_eq!(response.status, 401);
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn basic_auth_header_shape() {
        struct Capture;
        impl HttpClient for Capture {
            fn execute(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
                assert_eq!(
                    request.header("Authorization"),
                    // "user:pass" in base64.
                    Some("Basic dXNlcjpwYXNz")
                );
                Ok(HttpResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: Box::new(std::io::empty()),
                })
            }
        }
        let client = InterceptedClient::new(
            Arc::new(Capture),
            vec![Arc::new(BasicAuthInterceptor::new("user", "pass"))],
            "agent",
            1,
        );
        client.execute(HttpRequest::get("http://remote/db")).unwrap();
    }
}
