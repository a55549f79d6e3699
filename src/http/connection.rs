use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::Instant;

use crate::config::Config;
use crate::http::handler::Handler;
use crate::http::receiver::{ReceiveError, Receiver, Signal};
use crate::http::request::Request;
use crate::http::response::{Response, error_json};

/// One accepted client connection serving exactly one request.
pub struct Connection<S, H> {
    reader: ReadHalf<S>,
    writer: Option<WriteHalf<S>>,
    peer: SocketAddr,
    config: Arc<Config>,
    handler: Arc<H>,
    receiver: Receiver,
    state: ConnectionState,
}

pub enum ConnectionState {
    Reading,
    /// The request and the client's `Accept-Encoding`.
    Processing(Request, String),
    Rejecting(ReceiveError),
    Closed,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler,
{
    pub fn new(stream: S, peer: SocketAddr, config: Arc<Config>, handler: Arc<H>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: Some(writer),
            peer,
            receiver: Receiver::new(config.clone(), peer.ip().to_string()),
            config,
            handler,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.config.request_timeout();

        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = self.read_request(deadline).await?;
                }

                ConnectionState::Processing(req, accept_encoding) => {
                    self.dispatch(req, &accept_encoding).await?;
                }

                ConnectionState::Rejecting(err) => {
                    tracing::warn!(
                        peer = %self.peer,
                        kind = err.kind(),
                        error = %err,
                        "Rejecting request"
                    );
                    self.discard_uploads();

                    if let Some(mut res) = self.response("") {
                        res.set_code(409);
                        res.add_body(error_json(409, &err.to_string()))?;
                        res.end().await?;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn read_request(&mut self, deadline: Instant) -> anyhow::Result<ConnectionState> {
        let mut block = vec![0u8; self.config.block_size()];

        loop {
            let read = tokio::time::timeout_at(
                deadline,
                tokio::time::timeout(self.config.read_timeout(), self.reader.read(&mut block)),
            )
            .await;

            let n = match read {
                Ok(Ok(Ok(n))) => n,
                Ok(Ok(Err(e))) => {
                    self.discard_uploads();
                    return Err(e.into());
                }
                _ => {
                    tracing::warn!(peer = %self.peer, "Timed out reading request");
                    self.discard_uploads();
                    return Ok(ConnectionState::Closed);
                }
            };

            if n == 0 {
                tracing::debug!(peer = %self.peer, "Client closed connection mid-request");
                self.discard_uploads();
                return Ok(ConnectionState::Closed);
            }

            let receiver = &mut self.receiver;
            match blocking(|| receiver.feed(&block[..n])) {
                Ok(Signal::NeedMoreData) => {}
                Ok(Signal::Done) => {
                    let accept_encoding = self.receiver.accept_encoding().to_string();
                    let req = self.receiver.finish()?;
                    return Ok(ConnectionState::Processing(req, accept_encoding));
                }
                Err(e) => return Ok(ConnectionState::Rejecting(e)),
            }
        }
    }

    async fn dispatch(&mut self, req: Request, accept_encoding: &str) -> anyhow::Result<()> {
        let Some(mut res) = self.response(accept_encoding) else {
            return Ok(());
        };

        tracing::debug!(
            peer = %self.peer,
            method = req.method.as_str(),
            path = %req.path,
            "Dispatching request"
        );

        let result = self.handler.handle(req, &mut res).await;

        if res.is_aborted() {
            tracing::error!(peer = %self.peer, "Response aborted by a contract violation");
            return Ok(());
        }

        match result {
            Ok(()) if res.is_sent() => {}
            Ok(()) => {
                tracing::error!(peer = %self.peer, "Handler returned without ending the response");
                res.send_error(500, "Internal Server Error.").await?;
            }
            Err(e) => {
                tracing::error!(peer = %self.peer, error = %e, "Handler failed");
                if !res.is_sent() {
                    res.send_error(500, "Internal Server Error.").await?;
                }
            }
        }

        Ok(())
    }

    fn discard_uploads(&mut self) {
        let receiver = &mut self.receiver;
        blocking(|| receiver.discard_uploads());
    }

    fn response(&mut self, accept_encoding: &str) -> Option<Response> {
        self.writer
            .take()
            .map(|writer| Response::new(Box::new(writer), &self.config, accept_encoding))
    }
}

/// Runs `f`, which may touch the upload directory, without stalling other
/// tasks on a multi-threaded runtime.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
