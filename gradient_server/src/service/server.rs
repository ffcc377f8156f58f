use comms::{OnoReceiver, OnoSender};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::storage::VectorBuffer;

/// This trait acts as an indirection layer, allowing the `ServerBuilder` to return
/// servers with different sparsification filters from its unique build method.
#[async_trait::async_trait]
pub trait Server<R, W>: Send
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Indirection method for `ParameterServer::run`.
    async fn run(&mut self) -> VectorBuffer;

    /// Indirection method for `ParameterServer::spawn`
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    fn spawn(&mut self, rx: OnoReceiver<R>, tx: OnoSender<W>);
}
