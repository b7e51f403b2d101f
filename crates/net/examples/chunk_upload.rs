//! Starts an [`HttpServer`] on a loopback port, uploads a generated file as a
//! chunked `PUT` with a `Content-MD5` trailer and prints what the server saw.

use http::StatusCode;
use std::error::Error;
use std::sync::Arc;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use micro_net::buffer::{SESSION_SIZE_CLASSES, SharedAllocator};
use micro_net::codec::md5_hex;
use micro_net::handler::{RequestContext, make_handler};
use micro_net::http::{HttpResponse, HttpServer, HttpTransferManager};
use micro_net::registry::RegistryConfig;
use micro_net::session::{Session, SessionConfig, SessionIdPool, TransportKind};

const UPLOAD_LEN: usize = 1 << 20;

async fn store(ctx: RequestContext) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
    let body = ctx.request.body();
    info!(id = ctx.connection_id, len = body.len(), integrity = ?ctx.integrity, "received upload");
    match ctx.integrity {
        Some(true) => Ok(HttpResponse::text(StatusCode::CREATED, md5_hex(body))),
        _ => Ok(HttpResponse::default_for(StatusCode::BAD_REQUEST)),
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let server = match HttpServer::bind("127.0.0.1:0".parse().unwrap(), SessionConfig::new(), RegistryConfig::new()).await
    {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    };
    server.on_request("PUT /upload", make_handler(store));
    let addr = server.local_addr().unwrap();
    let running = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    if let Err(e) = upload(addr).await {
        error!(cause = %e, "upload failed");
    }

    server.stop().await;
    running.abort();
}

async fn upload(addr: std::net::SocketAddr) -> Result<(), Box<dyn Error + Send + Sync>> {
    let ids = SessionIdPool::new(1);
    let allocator = SharedAllocator::new(&SESSION_SIZE_CLASSES);
    let session = Session::connect(TransportKind::Tcp, addr, SessionConfig::new(), &ids, allocator).await?;

    let data = (0..UPLOAD_LEN).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    let manager = HttpTransferManager::client();
    let request = HttpTransferManager::create_request("PUT /upload", false)?;
    manager.send_request(&session, &request).await?;

    let mut parts = data.chunks(100_000).peekable();
    while let Some(part) = parts.next() {
        manager.send_chunk_file(&session, part, parts.peek().is_none()).await?;
    }

    let response = manager.receive_response(&session).await?;
    info!(
        status = %response.status(),
        digest = %String::from_utf8_lossy(response.body()),
        expected = md5_hex(&data),
        "upload finished"
    );
    Ok(())
}
