//! In-memory shepherd for control-channel tests.
//!
//! [`ChannelTransport`] implements the production transport seam over a pair
//! of in-process channels. Every `connect` call yields a fresh
//! [`ShepherdEnd`] on the test side, so reconnect scenarios are just "drop
//! the old end, receive the next one". Dropping a [`ShepherdEnd`] closes the
//! session the same way a TCP hangup would.

use tokio::sync::mpsc;

use merino_core::BoxFuture;
use merino_core::protocol::{SheepMessage, ShepherdMessage};
use merino_core::shepherd::{MessageSink, MessageStream, ShepherdTransport, TransportError};

/// Transport whose sessions terminate inside the test instead of a socket.
pub struct ChannelTransport {
    sessions: mpsc::UnboundedSender<ShepherdEnd>,
}

impl ChannelTransport {
    /// Returns the transport (handed to the control channel) and the stream
    /// of shepherd-side session ends (kept by the test).
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ShepherdEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sessions: tx }, rx)
    }
}

impl ShepherdTransport for ChannelTransport {
    fn connect(
        &self,
    ) -> BoxFuture<'_, Result<(Box<dyn MessageSink>, Box<dyn MessageStream>), TransportError>>
    {
        Box::pin(async move {
            let (to_shepherd_tx, to_shepherd_rx) = mpsc::unbounded_channel();
            let (to_sheep_tx, to_sheep_rx) = mpsc::unbounded_channel();
            let end = ShepherdEnd {
                inbound: to_shepherd_rx,
                outbound: to_sheep_tx,
            };
            // Test dropped the session receiver: behave like a refused
            // connection.
            self.sessions
                .send(end)
                .map_err(|_| TransportError::Closed)?;
            Ok((
                Box::new(ChanSink { tx: to_shepherd_tx }) as Box<dyn MessageSink>,
                Box::new(ChanStream { rx: to_sheep_rx }) as Box<dyn MessageStream>,
            ))
        })
    }
}

struct ChanSink {
    tx: mpsc::UnboundedSender<SheepMessage>,
}

impl MessageSink for ChanSink {
    fn send(&mut self, msg: SheepMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { self.tx.send(msg).map_err(|_| TransportError::Closed) })
    }
}

struct ChanStream {
    rx: mpsc::UnboundedReceiver<ShepherdMessage>,
}

impl MessageStream for ChanStream {
    fn recv(&mut self) -> BoxFuture<'_, Result<ShepherdMessage, TransportError>> {
        Box::pin(async move { self.rx.recv().await.ok_or(TransportError::Closed) })
    }
}

/// The test's side of one session with the sheep under test.
pub struct ShepherdEnd {
    inbound: mpsc::UnboundedReceiver<SheepMessage>,
    outbound: mpsc::UnboundedSender<ShepherdMessage>,
}

impl ShepherdEnd {
    /// Next frame from the sheep; `None` once the sheep hung up.
    pub async fn recv(&mut self) -> Option<SheepMessage> {
        self.inbound.recv().await
    }

    /// `false` once the sheep's reader is gone.
    pub fn send(&self, msg: ShepherdMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// Consume the opening handshake, panicking on any other frame.
    pub async fn expect_handshake(&mut self) -> usize {
        match self.recv().await {
            Some(SheepMessage::Handshake { capacity, .. }) => capacity,
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    /// Complete a session open: consume the handshake and ack it.
    pub async fn accept(&mut self, epoch: u64) -> usize {
        let capacity = self.expect_handshake().await;
        self.send(ShepherdMessage::HandshakeAck {
            session_epoch: epoch,
        });
        capacity
    }

    pub fn assign(&self, request: merino_core::TestRequest) {
        self.send(ShepherdMessage::Assign { request });
    }

    pub fn ack_submit(&self, request_id: u64) {
        self.send(ShepherdMessage::SubmitAck { request_id });
    }

    pub fn ack_heartbeat(&self) {
        self.send(ShepherdMessage::HeartbeatAck);
    }

    /// Await the next `SubmitResult`, acking it, skipping heartbeats (which
    /// are also acked so the session stays healthy). Panics if the sheep
    /// hangs up first.
    pub async fn expect_result(&mut self) -> merino_core::TestResult {
        loop {
            match self.recv().await {
                Some(SheepMessage::SubmitResult { result }) => {
                    self.ack_submit(result.request_id);
                    return result;
                }
                Some(SheepMessage::Heartbeat) => self.ack_heartbeat(),
                other => panic!("expected submit_result, got {other:?}"),
            }
        }
    }
}
