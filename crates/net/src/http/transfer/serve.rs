use http::StatusCode;
use std::collections::hash_map::Entry;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use tracing::{debug, error, info, warn};

use crate::buffer::{SESSION_SIZE_CLASSES, SharedAllocator};
use crate::handler::{RequestContext, RequestHandler};
use crate::http::transfer::{HttpTransferManager, read};
use crate::http::{ConnectionDirective, HttpRequest, HttpResponse};
use crate::protocol::{MAX_CONN_NUM, SessionError, TransferError};
use crate::registry::{ConnState, ConnectionRegistry, IdleEviction, RegistryConfig, StrategyTrigger};
use crate::session::{Acceptor, Session, SessionConfig, SessionId, SessionIdPool};

/// Name the server registers its idle eviction under, for both triggers.
pub const IDLE_STRATEGY: &str = "IdleConn";

impl HttpTransferManager {
    /// Registers `handler` for requests whose `"METHOD /path"` equals `route`.
    /// The first handler registered for a route stays; returns whether this one was taken.
    pub fn on_request<H>(&self, route: &str, handler: H) -> bool
    where
        H: RequestHandler + 'static,
    {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.entry(route.to_owned()) {
            Entry::Occupied(_) => {
                warn!(route, "handler already registered");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(handler));
                debug!(route, "registered handler");
                true
            }
        }
    }

    /// Reads the next request, chunked body and trailer included.
    pub async fn receive_request(&self, session: &Session) -> Result<HttpRequest, TransferError> {
        self.read_message(session, &self.requests, &self.request_parsers).await
    }

    /// Produces the response to `request`: the registered handler's answer,
    /// a stock 400 for unknown routes, a stock 500 when the handler fails.
    /// The request's `Connection` header is echoed unless the handler set one.
    pub async fn respond(&self, id: SessionId, request: HttpRequest) -> HttpResponse {
        let route = request.route();
        let connection = request.headers().connection();
        let integrity = request.integrity();
        if integrity == Some(false) {
            warn!(id, route, "chunked body does not match its content-md5");
        }

        let handler = read(&self.routes).get(&route).cloned();
        let mut response = match handler {
            Some(handler) => match handler.call(RequestContext::new(request, id, integrity)).await {
                Ok(response) => response,
                Err(e) => {
                    error!(id, route, cause = %e, "handler failed");
                    HttpResponse::default_for(StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
            None => {
                debug!(id, route, "no handler for route");
                HttpResponse::default_for(StatusCode::BAD_REQUEST)
            }
        };

        if let Some(directive) = connection
            && response.headers().connection().is_none()
        {
            response.headers_mut().set_connection(directive);
        }
        response
    }

    /// Answers requests on `session` until the peer closes it, a side asks
    /// for `Connection: close`, or something fails. A malformed request gets
    /// a 400 and closes the session.
    pub async fn serve(&self, session: &Session) -> Result<(), TransferError> {
        let id = session.id();
        let result = self.serve_requests(session).await;
        self.forget(id);
        self.mark(id, ConnState::Closed);
        result
    }

    async fn serve_requests(&self, session: &Session) -> Result<(), TransferError> {
        let id = session.id();
        loop {
            let request = match self.receive_request(session).await {
                Ok(request) => request,
                Err(TransferError::Session { source }) if source.is_eof() => {
                    debug!(id, "peer closed the connection");
                    return Ok(());
                }
                Err(TransferError::Malformed(outcome)) => {
                    let mut response = HttpResponse::default_for(StatusCode::BAD_REQUEST);
                    response.headers_mut().set_connection(ConnectionDirective::Close);
                    let sent = session.send(&response.to_bytes()).await;
                    session.close().await;
                    sent?;
                    return Err(TransferError::Malformed(outcome));
                }
                Err(e) => return Err(e),
            };

            let close_requested = request.headers().connection() == Some(ConnectionDirective::Close);
            let response = self.respond(id, request).await;
            session.send(&response.to_bytes()).await?;

            if close_requested || response.headers().connection() == Some(ConnectionDirective::Close) {
                debug!(id, "closing after response");
                session.close().await;
                return Ok(());
            }
            self.mark(id, ConnState::Idle);
        }
    }
}

/// Accepts tcp connections, registers them with a [`ConnectionRegistry`] and
/// serves each on its own task.
///
/// Idle keep-alive connections are evicted both when the registry reaches
/// its high-water mark and on every registry timer tick.
#[derive(Debug)]
pub struct HttpServer {
    acceptor: Acceptor,
    manager: Arc<HttpTransferManager>,
    registry: ConnectionRegistry,
}

impl HttpServer {
    pub async fn bind(
        addr: SocketAddr,
        config: SessionConfig,
        registry_config: RegistryConfig,
    ) -> Result<Self, SessionError> {
        let ids = SessionIdPool::new(MAX_CONN_NUM);
        let allocator = SharedAllocator::new(&SESSION_SIZE_CLASSES);
        let acceptor = Acceptor::bind(addr, config, ids, allocator).await?;

        let registry = ConnectionRegistry::new(registry_config);
        registry.add_strategy(IDLE_STRATEGY, StrategyTrigger::OnPressure, IdleEviction);
        registry.add_strategy(IDLE_STRATEGY, StrategyTrigger::OnTimer, IdleEviction);

        let manager = Arc::new(HttpTransferManager::server().with_registry(registry.clone()));
        Ok(Self { acceptor, manager, registry })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn manager(&self) -> &Arc<HttpTransferManager> {
        &self.manager
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn on_request<H>(&self, route: &str, handler: H) -> bool
    where
        H: RequestHandler + 'static,
    {
        self.manager.on_request(route, handler)
    }

    /// Starts the registry timer and accepts connections until the task is dropped.
    pub async fn run(&self) {
        self.registry.run();
        loop {
            let session = match self.acceptor.accept().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            let id = self.registry.register(session.clone());
            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                match manager.serve(&session).await {
                    Ok(()) => info!(id, "finished serving, connection shutdown"),
                    Err(e) => warn!(id, cause = %e, "connection shutdown with error"),
                }
            });
        }
    }

    /// Stops the registry timer and closes every tracked session.
    pub async fn stop(&self) {
        self.registry.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::md5_hex;
    use crate::handler::make_handler;
    use crate::http::transfer::testing::session_pair;
    use crate::session::{SessionState, TransportKind};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn echo_handler() -> impl RequestHandler {
        make_handler(|ctx: RequestContext| async move {
            let body = format!("{} {} {:?}", ctx.request.route(), ctx.request.body().len(), ctx.integrity);
            Ok::<_, io::Error>(HttpResponse::text(StatusCode::OK, body))
        })
    }

    #[tokio::test]
    async fn test_serve_keep_alive_round_trips() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let server_manager = Arc::new(HttpTransferManager::server());
        assert!(server_manager.on_request("GET /ping", echo_handler()));
        assert!(!server_manager.on_request("GET /ping", echo_handler()));

        let serving = tokio::spawn({
            let manager = Arc::clone(&server_manager);
            async move { manager.serve(&server).await }
        });

        let client_manager = HttpTransferManager::client();
        for _ in 0..3 {
            let response = client_manager.round_trip(&client, "GET /ping", true).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.body(), b"GET /ping 0 None");
            assert_eq!(response.headers().connection(), Some(ConnectionDirective::KeepAlive));
        }

        let response = client_manager.round_trip(&client, "GET /missing", false).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.body().starts_with(b"<html>"));
        assert_eq!(response.headers().connection(), Some(ConnectionDirective::Close));
        assert_eq!(client.state(), SessionState::Closed);

        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_chunked_upload_reaches_handler() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let server_manager = Arc::new(HttpTransferManager::server());
        let (tx, mut rx) = mpsc::unbounded_channel();
        server_manager.on_request(
            "PUT /upload",
            make_handler(move |ctx: RequestContext| {
                let tx = tx.clone();
                async move {
                    let digest = md5_hex(ctx.request.body());
                    tx.send((ctx.request.into_body(), ctx.integrity)).unwrap();
                    Ok::<_, io::Error>(HttpResponse::text(StatusCode::CREATED, digest))
                }
            }),
        );
        tokio::spawn({
            let manager = Arc::clone(&server_manager);
            async move { manager.serve(&server).await }
        });

        let data = (0..100_000u32).map(|i| (i % 256) as u8).collect::<Vec<_>>();
        let client_manager = HttpTransferManager::client();
        let request = HttpTransferManager::create_request("PUT /upload", true).unwrap();
        client_manager.send_request(&client, &request).await.unwrap();
        let (head, tail) = data.split_at(40_000);
        client_manager.send_chunk_file(&client, head, false).await.unwrap();
        client_manager.send_chunk_file(&client, tail, true).await.unwrap();

        let response = client_manager.receive_response(&client).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.body(), md5_hex(&data).as_bytes());

        let (body, integrity) = rx.recv().await.unwrap();
        assert_eq!(body, data);
        assert_eq!(integrity, Some(true));
    }

    #[tokio::test]
    async fn test_tampered_upload_reports_mismatch() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let server_manager = Arc::new(HttpTransferManager::server());
        server_manager.on_request("PUT /upload", echo_handler());
        tokio::spawn({
            let manager = Arc::clone(&server_manager);
            async move { manager.serve(&server).await }
        });

        let request = HttpTransferManager::create_request("PUT /upload", true).unwrap();
        let mut wire = request.to_bytes().to_vec();
        wire.extend_from_slice(format!("3\r\nabc\r\n0\r\nContent-MD5:{}\r\n", md5_hex(b"abd")).as_bytes());
        client.send(&wire).await.unwrap();

        let response = HttpTransferManager::client().receive_response(&client).await.unwrap();
        assert_eq!(response.body(), b"PUT /upload 3 Some(false)");
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400_and_close() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let server_manager = HttpTransferManager::server();

        client.send(b"BREW /pot HTTP/1.1\r\n\r\n").await.unwrap();
        let error = server_manager.serve(&server).await.unwrap_err();
        assert!(matches!(error, TransferError::Malformed(_)));
        assert_eq!(server.state(), SessionState::Closed);

        let response = HttpTransferManager::client().receive_response(&client).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().connection(), Some(ConnectionDirective::Close));
    }

    #[tokio::test]
    async fn test_handler_error_is_500() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let server_manager = Arc::new(HttpTransferManager::server());
        server_manager.on_request(
            "GET /fail",
            make_handler(|_: RequestContext| async { Err::<HttpResponse, _>("boom") }),
        );
        tokio::spawn({
            let manager = Arc::clone(&server_manager);
            async move { manager.serve(&server).await }
        });

        let response = HttpTransferManager::client().round_trip(&client, "GET /fail", true).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().connection(), Some(ConnectionDirective::KeepAlive));
    }

    #[tokio::test]
    async fn test_http_server_tracks_connections() {
        let server = Arc::new(
            HttpServer::bind("127.0.0.1:0".parse().unwrap(), SessionConfig::new(), RegistryConfig::new())
                .await
                .unwrap(),
        );
        server.on_request("GET /hello", echo_handler());
        let addr = server.local_addr().unwrap();
        let running = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        let ids = SessionIdPool::new(4);
        let allocator = SharedAllocator::new(&SESSION_SIZE_CLASSES);
        let client = Session::connect(TransportKind::Tcp, addr, SessionConfig::new(), &ids, allocator).await.unwrap();

        let manager = HttpTransferManager::client();
        let response = manager.round_trip(&client, "GET /hello", true).await.unwrap();
        assert_eq!(response.body(), b"GET /hello 0 None");

        // the exchange finished, the server side entry went idle
        tokio::time::timeout(Duration::from_secs(1), async {
            while server.registry().len() != 1
                || server.registry().state(1) != Some(ConnState::Idle)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // idle entries go on the next timer tick
        assert_eq!(server.registry().tick(), vec![1]);
        assert!(server.registry().is_empty());

        server.stop().await;
        running.abort();
    }
}
