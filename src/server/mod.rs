/*!
Server module: accept loop, per-connection dispatcher, and the public `serve` entry point.

Request flow:
- one request per connection, parsed by http::read_http_request within the read timeout (408);
- routing::classify picks the route, method enforced (405), unknown paths 404;
- the authentication gate runs before any mutating handler (403, empty body);
- handlers::handle renders the enveloped answer, written exactly once.

The dispatch loop runs on a single-threaded runtime; blocking manager calls only run on
the offloader's bounded worker slots.
*/

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::manager::CommandManager;

pub mod auth;
pub mod envelope;
pub mod handlers;
pub mod http;
pub mod multipart;
pub mod offload;
pub mod paths;
pub mod routing;

use handlers::AppState;
use http::{HttpRequest, RequestError, Response};

const LINGER: Duration = Duration::from_secs(2);

pub struct Server {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl Server {
    /// Bind the configured address. Port 0 picks a free port (see [`Server::local_addr`]).
    pub async fn bind(config: Arc<Config>, manager: Arc<dyn CommandManager>) -> io::Result<Server> {
        let listener = TcpListener::bind(config.bind_addr()).await.map_err(|e| {
            io::Error::new(e.kind(), format!("bind {} failed: {e}", config.bind_addr()))
        })?;
        Ok(Server {
            listener,
            state: Arc::new(AppState::new(config, manager)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept until `shutdown` resolves. In-flight requests are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        serve_connection(&state, stream, peer).await;
                    });
                }
            }
        }
    }
}

async fn serve_connection(state: &AppState, stream: TcpStream, peer: SocketAddr) {
    let started = Instant::now();
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);

    let mut unread_input = false;
    let read = tokio::time::timeout(
        state.config.http.read_timeout(),
        http::read_http_request(&mut reader, state.config.http.max_body_bytes),
    )
    .await;
    let (method, path, resp) = match read {
        Ok(Ok(req)) => {
            let method = req.method.to_string();
            let path = req.path.clone();
            (method, path, dispatch(state, req).await)
        }
        Ok(Err(RequestError::Closed)) => return,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "unreadable request");
            unread_input = true;
            (String::from("-"), String::from("-"), request_error_response(&e))
        }
        Err(_) => {
            debug!(peer = %peer, timeout_secs = state.config.http.read_timeout_secs, "request not received in time");
            unread_input = true;
            (String::from("-"), String::from("-"), Response::plain(408, "request timeout\n"))
        }
    };

    if let Err(e) = resp.write_to(&mut wr).await {
        warn!(peer = %peer, error = %e, "failed to write response");
    }
    let _ = wr.shutdown().await;
    if unread_input {
        // Closing with unread input would reset the connection and lose the reply
        let _ = tokio::time::timeout(LINGER, async {
            let mut sink = [0u8; 8192];
            while matches!(reader.read(&mut sink).await, Ok(n) if n > 0) {}
        })
        .await;
    }
    info!(
        peer = %peer,
        method = %method,
        path = %path,
        status = resp.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
}

fn request_error_response(e: &RequestError) -> Response {
    match e {
        RequestError::HeadersTooLarge => Response::plain(431, "request headers too large\n"),
        RequestError::BodyTooLarge => Response::plain(413, "request body too large\n"),
        _ => Response::plain(400, "bad request\n"),
    }
}

/// Route one parsed request through the gate and its handler; yields the single response.
pub async fn dispatch(state: &AppState, req: HttpRequest) -> Response {
    let Some(route) = routing::classify(&req.path) else {
        return Response::plain(404, "not found\n");
    };
    if req.method != route.method() {
        return Response::plain(405, "method not allowed\n")
            .with_header("Allow", route.method().to_string());
    }
    if route.requires_auth() && !auth::authenticate(&state.config, &req).allowed() {
        warn!(route = route.name(), path = %req.path, "authentication failed");
        return auth::forbidden();
    }
    handlers::handle(state, route, req).await
}

/// Run the agent until Ctrl-C on a single-threaded dispatch runtime.
pub fn serve(config: Arc<Config>, manager: Arc<dyn CommandManager>) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.executor.workers + 1)
        .thread_name("minion-worker")
        .build()?;
    rt.block_on(async move {
        let server = Server::bind(config.clone(), manager).await?;
        info!(
            addr = %server.local_addr()?,
            workers = config.executor.workers,
            offload_delay_secs = config.executor.offload_delay_secs,
            debug = config.common.debug,
            "minion listening"
        );
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            })
            .await?;
        Ok(())
    })
}
