//! In-process link backed by tokio channels.
//!
//! [`ChannelLink::pair`] returns the kernel-side [`ChannelLink`] and the
//! [`LinkEndpoint`] the outer VM process drives. Concurrent requests from
//! many kernels are multiplexed over one mpsc queue; each carries its own
//! oneshot reply slot. Dropping or closing the endpoint disconnects the link.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{LinkError, LinkRequest, LinkResponse, VmLink};

/// A request waiting for the outer process to answer it.
#[derive(Debug)]
pub struct Envelope {
    /// The request.
    pub request: LinkRequest,
    reply: oneshot::Sender<LinkResponse>,
}

impl Envelope {
    /// Send the answer. Returns `false` if the requester stopped waiting.
    pub fn respond(self, response: LinkResponse) -> bool {
        self.reply.send(response).is_ok()
    }
}

/// Kernel-side half of an in-process link.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    vm_id: String,
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
    closed: CancellationToken,
}

/// Outer-process half of an in-process link.
#[derive(Debug)]
pub struct LinkEndpoint {
    rx: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
}

impl ChannelLink {
    /// Create a connected link pair.
    ///
    /// `buffer` bounds queued requests; `timeout` bounds each exchange.
    pub fn pair(
        vm_id: impl Into<String>,
        buffer: usize,
        timeout: Duration,
    ) -> (ChannelLink, LinkEndpoint) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let closed = CancellationToken::new();
        (
            ChannelLink {
                vm_id: vm_id.into(),
                tx,
                timeout,
                closed: closed.clone(),
            },
            LinkEndpoint { rx, closed },
        )
    }
}

#[async_trait]
impl VmLink for ChannelLink {
    fn vm_id(&self) -> &str {
        &self.vm_id
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    async fn request(&self, request: LinkRequest) -> Result<LinkResponse, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }
        let id = request.id;
        let (reply, wait) = oneshot::channel();
        let exchange = async {
            if self.tx.send(Envelope { request, reply }).await.is_err() {
                return Err(LinkError::Disconnected);
            }
            wait.await.map_err(|_| LinkError::Disconnected)
        };

        let outcome: Result<LinkResponse, LinkError> = tokio::select! {
            result = tokio::time::timeout(self.timeout, exchange) => match result {
                Ok(inner) => inner,
                Err(_) => Err(LinkError::Timeout(self.timeout)),
            },
            () = self.closed.cancelled() => Err(LinkError::Disconnected),
        };
        let response = outcome?;

        if response.id() != id {
            warn!(vm = %self.vm_id, expected = %id, got = %response.id(), "mismatched link reply");
            return Err(LinkError::Protocol(format!(
                "reply {} does not answer request {id}",
                response.id()
            )));
        }
        Ok(response)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl LinkEndpoint {
    /// Next pending request, or `None` once every [`ChannelLink`] is gone or
    /// the endpoint was closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            envelope = self.rx.recv() => envelope,
            () = self.closed.cancelled() => None,
        }
    }

    /// Disconnect the link. Pending and future requests fail with
    /// [`LinkError::Disconnected`].
    pub fn close(&mut self) {
        self.closed.cancel();
        self.rx.close();
        debug!("vm link endpoint closed");
    }

    /// Token that fires when the link disconnects.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Answer every request with `handler` on a background task until the
    /// link disconnects.
    pub fn serve<F>(mut self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&LinkRequest) -> LinkResponse + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(envelope) = self.recv().await {
                let response = handler(&envelope.request);
                if !envelope.respond(response) {
                    debug!("link requester went away before the reply");
                }
            }
        })
    }
}

impl Drop for LinkEndpoint {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
