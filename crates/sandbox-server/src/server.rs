//! HTTP/1 transport adapter.
//!
//! A thin shim between hyper and the pipeline: collect the request parts,
//! hand them to [`Sandbox::handle`], and write the value-object response
//! back. Owns graceful shutdown: ctrl-c stops accepting and closes the
//! shared store (the file backend snapshots there).

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::pipeline::{Sandbox, SandboxRequest};

pub struct SandboxServer {
    addr: SocketAddr,
    sandbox: Arc<Sandbox>,
}

impl SandboxServer {
    pub fn new(addr: SocketAddr, sandbox: Arc<Sandbox>) -> Self {
        Self { addr, sandbox }
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("sandbox server listening on http://{}", self.addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let io = TokioIo::new(stream);
                    let sandbox = Arc::clone(&self.sandbox);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let sandbox = Arc::clone(&sandbox);
                            async move { serve_request(req, sandbox).await }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("connection error: {}", e);
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    if let Err(e) = self.sandbox.close() {
                        warn!("failed to close state store cleanly: {e}");
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_request(
    req: Request<Incoming>,
    sandbox: Arc<Sandbox>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("").to_string(),
            )
        })
        .collect();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let request = SandboxRequest::new(&method, &target, headers, &body);
    let response = sandbox.handle(request).await;

    let mut builder = Response::builder().status(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in response.headers() {
        builder = builder.header(name.as_str(), value.as_str());
    }
    Ok(builder
        .body(Full::new(Bytes::from(response.body_bytes())))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Full::new(Bytes::from_static(b"")));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        }))
}
