use std::{io, sync::Arc};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::{self, JoinSet},
};

use super::{GradientServer, Server};
use crate::{error::Result, sparsification::SparseFilter, storage::VectorBuffer};

/// The central server structure, it handles task management and io between workers.
///
/// Every connection gets its own session task, a session only ends when its worker
/// disconnects or its stream fails, which never affects the other sessions.
pub struct ParameterServer<F: SparseFilter> {
    tasks: JoinSet<Result<()>>,
    server: Arc<GradientServer<F>>,
}

impl<F: SparseFilter> ParameterServer<F> {
    /// Creates a new `ParameterServer`.
    ///
    /// # Arguments
    /// * `server` - The protocol state shared between sessions.
    ///
    /// # Returns
    /// A new `ParameterServer` instance.
    pub fn new(server: GradientServer<F>) -> Self {
        Self {
            tasks: JoinSet::new(),
            server: Arc::new(server),
        }
    }

    /// Waits for every session to finish.
    ///
    /// # Returns
    /// The final global model.
    pub async fn run(&mut self) -> VectorBuffer {
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => info!("session finished"),
                Ok(Err(e)) => warn!("session failed: {e}"),
                Err(e) => warn!("session task failed to complete: {e}"),
            }
        }

        info!("all sessions finished");
        self.server.warehouse().global_model()
    }
}

impl<F: SparseFilter + 'static> ParameterServer<F> {
    /// Binds a new worker to this server and spawns its own session task.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: OnoReceiver<R>, tx: OnoSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let server = Arc::clone(&self.server);
        self.tasks.spawn(Self::serve(server, rx, tx));
        info!(sessions = self.tasks.len(); "session started");
    }

    /// Serves a single worker until it disconnects.
    ///
    /// The worker is first sent the synced snapshot so it starts from the server's model.
    /// Malformed frames and rejected messages are logged and dropped, only a failing stream
    /// ends the session early.
    async fn serve<R, W>(
        server: Arc<GradientServer<F>>,
        mut rx: OnoReceiver<R>,
        mut tx: OnoSender<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let opening = server.opening_model();
        tx.send(&opening.as_msg()).await?;
        debug!("sent the opening model");

        let mut rx_buf: Vec<f32> = Vec::new();

        loop {
            let msg: Msg = match rx.recv_into(&mut rx_buf).await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("dropping malformed or unsupported frame: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match msg {
                Msg::Data {
                    sender,
                    version,
                    payload,
                } => {
                    let kind = payload.kind();
                    let reply =
                        task::block_in_place(|| server.handle(sender as usize, version, payload));

                    match reply {
                        Ok(Some(reply)) => tx.send(&reply.as_msg()).await?,
                        Ok(None) => {}
                        Err(e) => warn!(sender = sender, version = version; "dropping {kind}: {e}"),
                    }
                }
                Msg::Control(Command::Disconnect) => {
                    debug!("worker disconnected");
                    tx.send(&Msg::Control(Command::Disconnect)).await?;
                    return Ok(());
                }
                Msg::Control(command) => warn!("unexpected control message {command:?}"),
                Msg::Err(detail) => warn!("worker reported an error: {detail}"),
            }
        }
    }
}

#[async_trait::async_trait]
impl<R, W, F> Server<R, W> for ParameterServer<F>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: SparseFilter + 'static,
{
    /// Indirection call to `Self::run`.
    async fn run(&mut self) -> VectorBuffer {
        self.run().await
    }

    /// Indirection call to `Self::spawn`.
    fn spawn(&mut self, rx: OnoReceiver<R>, tx: OnoSender<W>) {
        self.spawn(rx, tx)
    }
}
