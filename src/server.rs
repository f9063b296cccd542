//! The mock server: accepts connections, decodes requests off the wire,
//! dispatches them to autoresponders or the test-facing queue, and exposes
//! the `receives`/`got`/`autoresponds` API a test drives.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::message::{self, BoxedStream, ClientHandle, ReplySpec, Request, RequestSpec};
use crate::protocol;
use crate::queue::RequestQueue;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered autoresponder: fully handles a matched request (typically
/// by calling `request.reply(..)`, but it may also `hangup()` or do
/// nothing and let the test observe it via `subscribe`).
pub type Responder = Arc<dyn Fn(Request) -> BoxFuture<Result<()>> + Send + Sync>;

/// A passive observer invoked for every request the server decodes,
/// before autoresponder dispatch. Useful for funneling requests into a
/// test-local queue via `server.subscribe(q.put)`.
pub type Subscriber = Arc<dyn Fn(&Request) + Send + Sync>;

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A running mock server. Cheaply cloneable (it's an `Arc` internally via
/// `run`/`spawn`'s return type) and safe to share across test helper
/// threads.
pub struct MockServer {
    config: ServerConfig,
    local_addr: String,
    queue: RequestQueue,
    autoresponders: Mutex<Vec<(Matcher, Responder)>>,
    subscribers: Mutex<Vec<Subscriber>>,
    requests_count: AtomicU64,
    stopped: AtomicBool,
    reply_timeout_exceeded: AtomicBool,
    stop_notify: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    /// Bind and start accepting connections in the background. Returns
    /// once the listener is bound; connections are handled on spawned
    /// tasks.
    pub async fn run(config: ServerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (listener, local_addr) = if let Some(path) = &config.uds_path {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            (Listener::Unix(listener), path.clone())
        } else {
            let addr = format!("{}:{}", config.host, config.port);
            let listener = TcpListener::bind(&addr).await?;
            let actual = listener.local_addr()?;
            (Listener::Tcp(listener), actual.to_string())
        };

        let server = Arc::new(Self {
            config,
            local_addr,
            queue: RequestQueue::new(),
            autoresponders: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            requests_count: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            reply_timeout_exceeded: AtomicBool::new(false),
            stop_notify: Notify::new(),
            accept_task: Mutex::new(None),
            sweep_task: Mutex::new(None),
        });

        tracing::info!(local_addr = %server.local_addr, "mock server listening");

        if server.config.auto_ismaster {
            server.register_auto_ismaster().await;
        }

        let accept_server = server.clone();
        let accept_handle = tokio::spawn(async move { accept_server.accept_loop(listener).await });
        *server.accept_task.lock().await = Some(accept_handle);

        let sweep_server = server.clone();
        let sweep_handle = tokio::spawn(async move { sweep_server.reply_timeout_sweep().await });
        *server.sweep_task.lock().await = Some(sweep_handle);

        Ok(server)
    }

    /// Alias for `run`, for callers who find "spawn a mock server" clearer
    /// than "run" at a call site that doesn't block.
    pub async fn spawn(config: ServerConfig) -> Result<Arc<Self>> {
        Self::run(config).await
    }

    /// The `mongodb://` URI a driver under test should connect with.
    pub fn uri(&self) -> String {
        let port = self
            .local_addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(self.config.port);
        self.config.uri(port)
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn requests_count(&self) -> u64 {
        self.requests_count.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Block until a request matching `spec` is received, popping it off
    /// the queue. Errors with `Error::UnexpectedRequest` if the next
    /// request in line doesn't match, folding the matching assertion into
    /// the call itself.
    pub async fn receives(&self, spec: impl Into<RequestSpec>) -> Result<Request> {
        self.check_liveness().await?;
        let matcher = Matcher::new(spec);
        let request = self.wait_for_request(self.config.request_timeout).await?;
        if matcher.matches(&request) {
            Ok(request)
        } else {
            Err(Error::UnexpectedRequest {
                expected: Box::new(matcher),
                actual: Box::new(request),
            })
        }
    }

    /// Block until any request is received, popping it off the queue.
    pub async fn got(&self) -> Result<Request> {
        self.check_liveness().await?;
        self.wait_for_request(self.config.request_timeout).await
    }

    /// Convenience alias for `got`, read as a property-style accessor for
    /// the next request.
    pub async fn request(&self) -> Result<Request> {
        self.got().await
    }

    /// Block until a request is visible at the head of the queue, without
    /// removing it.
    pub async fn peek(&self) -> Result<Request> {
        self.check_liveness().await?;
        tokio::select! {
            _ = self.stop_notify.notified() => Err(Error::ServerStopped),
            result = self.queue.peek(self.config.request_timeout) => result,
        }
    }

    /// Errors with `Error::ServerStopped` if the server has already
    /// stopped, or `Error::Timeout` once (consuming the flag) if the
    /// `reply_timeout` sweep found the queue head went unanswered too long.
    async fn check_liveness(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ServerStopped);
        }
        if self.reply_timeout_exceeded.swap(false, Ordering::SeqCst) {
            return Err(Error::Timeout(format!(
                "a queued request went unanswered past reply_timeout ({:?})",
                self.config.reply_timeout
            )));
        }
        Ok(())
    }

    /// Pop the queue head, racing the wait against the server being
    /// stopped so a blocked call doesn't hang past `stop()`.
    async fn wait_for_request(&self, timeout: Duration) -> Result<Request> {
        tokio::select! {
            _ = self.stop_notify.notified() => Err(Error::ServerStopped),
            result = self.queue.get(timeout) => result,
        }
    }

    /// Register a passive observer called for every decoded request,
    /// before autoresponder dispatch.
    pub async fn subscribe(&self, f: impl Fn(&Request) + Send + Sync + 'static) {
        self.subscribers.lock().await.push(Arc::new(f));
    }

    /// Auto-reply `reply` to every future request matching `spec`.
    /// Responders are tried most-recently-registered first, so a later
    /// `autoresponds` call can narrow or override an earlier one.
    pub async fn autoresponds(
        &self,
        spec: impl Into<RequestSpec>,
        reply: impl Into<ReplySpec> + Send + Sync + Clone + 'static,
    ) {
        let responder: Responder = Arc::new(move |request: Request| {
            let reply = reply.clone();
            Box::pin(async move { request.reply(reply).await })
        });
        self.register_autoresponder(Matcher::new(spec), responder).await;
    }

    /// Auto-handle every future request matching `spec` with a custom
    /// async handler, which receives ownership of the request and is
    /// responsible for replying (or hanging up, or deliberately doing
    /// neither).
    pub async fn autoresponds_with<F, Fut>(&self, spec: impl Into<RequestSpec>, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let responder: Responder = Arc::new(move |request: Request| {
            let handler = handler.clone();
            Box::pin(async move { handler(request).await })
        });
        self.register_autoresponder(Matcher::new(spec), responder).await;
    }

    /// Auto-reply to `ismaster`/`isMaster` with `{ok: 1}` plus the
    /// configured wire-version range, so a driver's handshake completes
    /// without the test having to script it.
    async fn register_auto_ismaster(&self) {
        let min_wire_version = self.config.min_wire_version;
        let max_wire_version = self.config.max_wire_version;
        let reply = bson::doc! {
            "ismaster": true,
            "minWireVersion": min_wire_version,
            "maxWireVersion": max_wire_version,
        };
        for name in ["ismaster", "isMaster"] {
            let responder: Responder = {
                let reply = reply.clone();
                Arc::new(move |request: Request| {
                    let reply = reply.clone();
                    Box::pin(async move { request.reply(reply).await })
                })
            };
            self.register_autoresponder(Matcher::new(Request::command(name)), responder)
                .await;
        }
    }

    async fn register_autoresponder(&self, matcher: Matcher, responder: Responder) {
        // If the current head of the queue already matches, dequeue and
        // reply to it now, so a test that calls `autoresponds` right after
        // a request was sent doesn't race the connection loop. Scoped to
        // the head only — requests behind it are still owed to whatever
        // `receives`/`got` call is waiting for them.
        let already_queued = self.queue.take_if_head_matches(|r| matcher.matches(r)).await;

        self.autoresponders
            .lock()
            .await
            .push((matcher, responder.clone()));

        if let Some(request) = already_queued {
            if let Err(e) = responder(request).await {
                tracing::warn!(error = %e, "autoresponder failed for an already-queued request");
            }
        }
    }

    /// Stop accepting new connections and close every open one.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.sweep_task.lock().await.take() {
            handle.abort();
        }
        tracing::info!(local_addr = %self.local_addr, "mock server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            let accepted = tokio::select! {
                _ = self.stop_notify.notified() => break,
                result = Self::accept_one(&listener) => result,
            };
            match accepted {
                Ok((stream, peer_label)) => {
                    tracing::debug!(peer = %peer_label, "accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(stream, peer_label).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    async fn accept_one(listener: &Listener) -> std::io::Result<(BoxedStream, String)> {
        match listener {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                Ok((Box::new(stream), addr.to_string()))
            }
            Listener::Unix(l) => {
                let (stream, _addr) = l.accept().await?;
                Ok((Box::new(stream), "uds-peer".to_string()))
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: BoxedStream, peer_label: String) {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let conn_stop = Arc::new(Notify::new());
        let client = ClientHandle::new(write_half, conn_stop.clone(), peer_label.clone());

        loop {
            let read_result = tokio::select! {
                _ = conn_stop.notified() => break,
                _ = self.stop_notify.notified() => break,
                result = protocol::read_message(&mut read_half) => result,
            };

            let raw = match read_result {
                Ok(raw) => raw,
                Err(Error::Io(e)) => {
                    tracing::debug!(peer = %peer_label, error = %e, "connection closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_label, error = %e, "malformed request; closing connection");
                    break;
                }
            };

            let request = match message::from_raw(raw, client.clone()) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(peer = %peer_label, error = %e, "dropping unrecognized request");
                    continue;
                }
            };

            self.requests_count.fetch_add(1, Ordering::SeqCst);
            if self.config.verbose {
                tracing::debug!(peer = %peer_label, ?request, "received request");
            }

            self.dispatch(request).await;
        }

        client.hangup().await;
        tracing::debug!(peer = %peer_label, "connection task exiting");
    }

    async fn dispatch(&self, request: Request) {
        {
            let subscribers = self.subscribers.lock().await;
            for subscriber in subscribers.iter() {
                subscriber(&request);
            }
        }

        let responder = {
            let responders = self.autoresponders.lock().await;
            responders
                .iter()
                .rev()
                .find(|(matcher, _)| matcher.matches(&request))
                .map(|(_, responder)| responder.clone())
        };

        match responder {
            Some(responder) => {
                if self.config.verbose {
                    tracing::debug!(?request, "autoresponding");
                }
                if let Err(e) = responder(request).await {
                    tracing::warn!(error = %e, "autoresponder raised an error");
                }
            }
            None => self.queue.put(request).await,
        }
    }

    async fn reply_timeout_sweep(&self) {
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => break,
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            if let Some(age) = self.queue.head_age().await {
                if age > self.config.reply_timeout {
                    tracing::warn!(
                        ?age,
                        reply_timeout = ?self.config.reply_timeout,
                        "a queued request went unanswered past reply_timeout"
                    );
                    self.reply_timeout_exceeded.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> ServerConfig {
        ServerConfig::default()
            .with_port(0)
            .with_request_timeout(Duration::from_millis(500))
            .with_reply_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn accepts_and_replies_over_op_msg() {
        let server = MockServer::run(test_config()).await.unwrap();
        let addr = server.local_addr().to_string();

        let client_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
            let bytes =
                protocol::encode_op_msg(&bson::doc! {"ismaster": 1, "$db": "admin"}, 1, 0)
                    .unwrap();
            stream.write_all(&bytes).await.unwrap();

            let mut header_buf = [0u8; 16];
            stream.read_exact(&mut header_buf).await.unwrap();
            let header = protocol::MessageHeader::parse(&header_buf);
            let mut body = vec![0u8; header.message_length as usize - 16];
            stream.read_exact(&mut body).await.unwrap();
            body
        });

        let request = server.receives(Request::command("ismaster")).await.unwrap();
        request.reply(bson::doc! {"ismaster": true}).await.unwrap();

        let body = client_task.await.unwrap();
        assert!(!body.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn autoresponds_catches_already_queued_requests() {
        let server = MockServer::run(test_config()).await.unwrap();
        let addr = server.local_addr().to_string();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
            let bytes =
                protocol::encode_op_msg(&bson::doc! {"ismaster": 1, "$db": "admin"}, 1, 0)
                    .unwrap();
            stream.write_all(&bytes).await.unwrap();
            // Keep the socket open so a reply can be observed if needed.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        // Give the request time to land in the queue before registering.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server
            .autoresponds(Request::command("ismaster"), bson::doc! {"ismaster": true})
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.queue.len().await, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn registering_an_autoresponder_does_not_consume_past_the_head() {
        let server = MockServer::run(test_config()).await.unwrap();
        let addr = server.local_addr().to_string();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
            let bytes = protocol::encode_op_msg(&bson::doc! {"find": "coll", "$db": "test"}, 1, 0)
                .unwrap();
            stream.write_all(&bytes).await.unwrap();
            let bytes =
                protocol::encode_op_msg(&bson::doc! {"ismaster": 1, "$db": "admin"}, 2, 0)
                    .unwrap();
            stream.write_all(&bytes).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // The queue head is the "find" command, not "ismaster"; registering
        // an ismaster responder shouldn't reach past it.
        server
            .autoresponds(Request::command("ismaster"), bson::doc! {"ismaster": true})
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.queue.len().await, 2);

        let head = server.got().await.unwrap();
        assert!(head.doc().unwrap().contains_key("find"));
        server.stop().await;
    }

    #[tokio::test]
    async fn got_errors_once_reply_timeout_is_exceeded() {
        let cfg = ServerConfig::default()
            .with_port(0)
            .with_request_timeout(Duration::from_millis(500))
            .with_reply_timeout(Duration::from_millis(50));
        let server = MockServer::run(cfg).await.unwrap();
        let addr = server.local_addr().to_string();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
            let bytes = protocol::encode_op_msg(&bson::doc! {"ping": 1, "$db": "admin"}, 1, 0)
                .unwrap();
            stream.write_all(&bytes).await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        });

        // Let the request sit unanswered past reply_timeout; the sweep
        // should flag it before we ask for the next one.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = server.got().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        server.stop().await;
    }

    #[tokio::test]
    async fn blocking_calls_error_with_server_stopped_after_stop() {
        let server = MockServer::run(test_config()).await.unwrap();
        server.stop().await;

        let err = server.got().await.unwrap_err();
        assert!(matches!(err, Error::ServerStopped));
        let err = server.peek().await.unwrap_err();
        assert!(matches!(err, Error::ServerStopped));
    }
}
