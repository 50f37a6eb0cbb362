// src/service/mod.rs

//! HTTP front end for channel operations.
//!
//! Every failure is reported to the caller as a bare 404; the reason only
//! goes to the log.

/// Request path decoding
pub mod route;

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelClient, ChannelError, ChannelRecord};
use crate::config::Transport;
use crate::context::DaemonContext;
use route::{Command, Route, RouteError};

/// Translates HTTP requests into channel operations
pub struct ControlService {
    ctx: Arc<DaemonContext>,

    /// Path prefix the toolstack adds when forwarding plugin requests
    prefix: String,
}

impl ControlService {
    /// Serves channel operations below `prefix`
    pub fn new(ctx: Arc<DaemonContext>, prefix: impl Into<String>) -> Self {
        Self {
            ctx,
            prefix: prefix.into(),
        }
    }

    /// Handles one request
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.dispatch(req).await {
            Ok(body) => {
                info!(method = %method, path = %path, "request succeeded");
                respond(StatusCode::OK, body)
            }
            Err(e) => {
                warn!(method = %method, path = %path, error = %e, "request failed");
                respond(StatusCode::NOT_FOUND, String::new())
            }
        }
    }

    async fn dispatch(&self, req: Request<Body>) -> Result<String, ServiceError> {
        let route = Route::parse(req.uri().path(), req.uri().query(), &self.prefix)?;

        let method = req.method().clone();

        match method {
            Method::GET => self.get(&route).await,
            Method::POST => match (route.cmd, route.key.as_deref()) {
                (Some(cmd), _) => self.command(&route, cmd).await.map(|_| String::new()),
                (None, Some(key)) => self.put(&route.vm, key, req).await.map(|_| String::new()),
                (None, None) => Err(ServiceError::NothingToDo),
            },
            other => Err(ServiceError::UnsupportedMethod(other.to_string())),
        }
    }

    async fn open(&self, vm: &str) -> Result<ChannelClient, ServiceError> {
        Ok(ChannelClient::for_uuid(self.ctx.clone(), vm).await?)
    }

    #[instrument(skip(self))]
    async fn get(&self, route: &Route) -> Result<String, ServiceError> {
        let mut client = self.open(&route.vm).await?;
        let body = client.get(route.key.as_deref()).await?;
        if body.is_empty() {
            return Err(ServiceError::EmptyPayload);
        }
        Ok(body)
    }

    #[instrument(skip(self, route), fields(vm = %route.vm, cmd = %cmd))]
    async fn command(&self, route: &Route, cmd: Command) -> Result<(), ServiceError> {
        let mut client = self.open(&route.vm).await?;

        match cmd {
            Command::Setup => client.setup().await?,
            Command::Delete => {
                let key = route.key.as_deref().ok_or(ServiceError::MissingKey)?;
                delete_reconciled(&mut client, key).await?
            }
            Command::PrepareMigration => client.prepare_migration().await?,
            Command::FinishMigration => client.finish_migration().await?,
        }
        Ok(())
    }

    #[instrument(skip(self, req))]
    async fn put(&self, vm: &str, key: &str, req: Request<Body>) -> Result<(), ServiceError> {
        if !req.headers().contains_key(CONTENT_LENGTH) {
            return Err(ServiceError::MissingContentLength);
        }

        let bytes = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| ServiceError::InvalidBody(e.to_string()))?;
        let value = String::from_utf8(bytes.to_vec()).map_err(|e| ServiceError::InvalidBody(e.to_string()))?;
        let record = ChannelRecord::new(key, value)?;

        let mut client = self.open(vm).await?;
        if let Err(e) = client.put(record.clone()).await {
            warn!(error = %e, "put failed, retrying once");
            client.put(record).await?;
        }
        Ok(())
    }

    /// Serves requests on `transport` until `shutdown` flips
    pub async fn serve(self: Arc<Self>, transport: Transport, mut shutdown: watch::Receiver<bool>) -> Result<(), ServiceError> {
        match transport {
            Transport::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| ServiceError::Bind {
                    address: addr.to_string(),
                    error: e.to_string(),
                })?;
                info!("Control service listening on {}", addr);

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "accepted connection");
                                self.clone().spawn_connection(stream);
                            }
                            Err(e) => warn!(error = %e, "failed to accept connection"),
                        }
                    }
                }
            }
            Transport::Unix(path) => {
                prepare_socket_path(&path).await?;
                let listener = UnixListener::bind(&path).map_err(|e| ServiceError::Bind {
                    address: path.display().to_string(),
                    error: e.to_string(),
                })?;
                info!("Control service listening on {}", path.display());

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => self.clone().spawn_connection(stream),
                            Err(e) => warn!(error = %e, "failed to accept connection"),
                        }
                    }
                }

                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(error = %e, "could not remove socket");
                }
            }
        }

        info!("Control service stopped");
        Ok(())
    }

    fn spawn_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let svc = self.clone();
                async move { Ok::<_, Infallible>(svc.handle(req).await) }
            });

            if let Err(e) = Http::new()
                .http1_only(true)
                .http1_keep_alive(false)
                .serve_connection(stream, service)
                .await
            {
                debug!(error = %e, "connection closed with error");
            }
        });
    }
}

/// Deletes a record, treating a failure as success when the record turns
/// out to be gone anyway
async fn delete_reconciled(client: &mut ChannelClient, key: &str) -> Result<(), ChannelError> {
    let err = match client.delete(key).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    warn!(key = %key, error = %err, "delete failed, checking whether the record still exists");
    match client.get(Some(key)).await {
        Err(ChannelError::RecordNotFound(_)) => {
            info!(key = %key, "record already absent");
            Ok(())
        }
        _ => Err(err),
    }
}

/// Removes a stale socket and creates its directory
async fn prepare_socket_path(path: &Path) -> Result<(), ServiceError> {
    let socket_error = |e: std::io::Error| ServiceError::Socket {
        path: path.display().to_string(),
        error: e.to_string(),
    };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(socket_error)?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(socket_error(e)),
    }
    Ok(())
}

fn respond(status: StatusCode, body: String) -> Response<Body> {
    let len = body.len();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Undecodable request path
    #[error(transparent)]
    Route(#[from] RouteError),

    /// The channel operation failed
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Bare `/vm/<id>` POST
    #[error("Request has neither a command nor a key")]
    NothingToDo,

    /// `cmd=delete` without `key`
    #[error("Delete requires a key")]
    MissingKey,

    /// Value upload without a length
    #[error("Request body without Content-Length")]
    MissingContentLength,

    /// Body unreadable or not UTF-8
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    /// GET answered with no content
    #[error("Guest returned an empty payload")]
    EmptyPayload,

    /// Neither GET nor POST
    #[error("Unsupported method {0}")]
    UnsupportedMethod(String),

    /// Listener could not be bound
    #[error("Failed to bind {address}: {error}")]
    Bind {
        /// Address or socket path
        address: String,
        /// Bind error
        error: String,
    },

    /// Stale socket could not be removed
    #[error("Failed to prepare socket {path}: {error}")]
    Socket {
        /// Socket path
        path: String,
        /// Filesystem error
        error: String,
    },
}

#[cfg(test)]
mod tests;
