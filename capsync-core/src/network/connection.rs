//! One established link to a peer: a serialized writer plus the reader loop
//! that feeds the listener.
//!
//! Read and write halves are owned separately. The reader lives in its
//! worker; the writer sits behind an async mutex inside [`PeerLink`] so any
//! number of tasks may send without interleaving frames. Every send races
//! the link's cancel token and a write deadline, so a peer that stops
//! reading cannot hold a sender (or [`PeerLink::close`]) forever.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::codec::FrameCodec;
use crate::error::CapsyncError;
use crate::network::transport::ListenerSlot;
use crate::protocol::{Message, wire};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

pub(crate) fn frame_writer<W>(writer: W) -> FrameWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    FramedWrite::new(Box::new(writer) as BoxedWriter, FrameCodec)
}

pub(crate) fn frame_reader<R: AsyncRead>(reader: R) -> FramedRead<R, FrameCodec> {
    FramedRead::new(reader, FrameCodec)
}

/// Send one message outside of any link (handshake replies).
pub(crate) async fn write_message(
    writer: &mut FrameWriter,
    message: &Message,
) -> Result<(), CapsyncError> {
    writer.send(message).await
}

/// Read exactly one message within `deadline`.
pub(crate) async fn read_message<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    deadline: Duration,
) -> Result<Message, CapsyncError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(deadline, frames.next()).await {
        Err(_) => Err(CapsyncError::Timeout(deadline)),
        Ok(None) => Err(CapsyncError::ConnectionClosed),
        Ok(Some(Err(e))) => Err(e),
        Ok(Some(Ok(frame))) => Ok(wire::decode(&frame)?),
    }
}

/// A registered, handshaken connection.
///
/// `serial` tells successive links with the same endpoint id apart, so only
/// the party that actually unregisters a link reports its loss.
pub(crate) struct PeerLink {
    id: String,
    serial: u64,
    writer: tokio::sync::Mutex<FrameWriter>,
    write_timeout: Duration,
    cancel: CancellationToken,
}

impl PeerLink {
    pub(crate) fn new(
        id: impl Into<String>,
        serial: u64,
        writer: FrameWriter,
        write_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            serial,
            writer: tokio::sync::Mutex::new(writer),
            write_timeout,
            cancel,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Token the reader loop for this link watches.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fails with `ConnectionClosed` once the link is cancelled, including
    /// while waiting on the writer, and with `Timeout` past the deadline.
    pub(crate) async fn send(&self, message: &Message) -> Result<(), CapsyncError> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(message).await
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CapsyncError::ConnectionClosed),
            result = tokio::time::timeout(self.write_timeout, write) => {
                result.map_err(|_| CapsyncError::Timeout(self.write_timeout))?
            }
        }
    }

    /// Stop the reader, abort in-flight sends, then shut down the write half.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.get_mut().shutdown().await;
    }
}

/// Why a reader loop ended.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// Closed locally (stop, disconnect, or a failed send).
    Cancelled,
    Eof,
    Failed(CapsyncError),
}

impl CloseReason {
    pub(crate) fn describe(&self) -> String {
        match self {
            CloseReason::Cancelled => "closed locally".into(),
            CloseReason::Eof => "connection closed by peer".into(),
            CloseReason::Failed(e) => e.to_string(),
        }
    }
}

/// Decode frames until EOF, a stream error, or cancellation. Each decoded
/// message goes to the listener in arrival order; a frame that fails to
/// decode is reported through `on_error` and the loop carries on.
pub(crate) async fn run_reader<R>(
    endpoint_id: &str,
    frames: &mut FramedRead<R, FrameCodec>,
    cancel: &CancellationToken,
    listeners: &ListenerSlot,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CloseReason::Cancelled,
            next = frames.next() => next,
        };

        let frame = match next {
            None => return CloseReason::Eof,
            Some(Err(e)) => return CloseReason::Failed(e),
            Some(Ok(frame)) => frame,
        };

        let listener = listeners.get();
        match wire::decode(&frame) {
            Ok(message) => {
                trace!(endpoint = %endpoint_id, kind = %message.kind(), "message received");
                if let Some(listener) = listener {
                    listener.on_message_received(endpoint_id, message).await;
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint_id, error = %e, len = frame.len(), "dropping undecodable frame");
                if let Some(listener) = listener {
                    listener.on_error(endpoint_id, &CapsyncError::Decode(e)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandType;
    use crate::protocol::CommandMessage;

    fn heartbeat(n: i64) -> Message {
        CommandMessage::new(CommandType::Heartbeat, "phone-a", n, "", vec![]).into()
    }

    fn link<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> PeerLink {
        PeerLink::new(
            "phone-a",
            1,
            frame_writer(writer),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    fn big(n: i64) -> Message {
        CommandMessage::new(CommandType::Start, "phone-a", n, "", vec!["x".repeat(4096)]).into()
    }

    #[tokio::test]
    async fn link_sends_frames_in_order() {
        let (local, remote) = tokio::io::duplex(4096);
        let link = link(local);
        assert_eq!(link.id(), "phone-a");
        assert_eq!(link.serial(), 1);

        link.send(&heartbeat(1)).await.unwrap();
        link.send(&heartbeat(2)).await.unwrap();

        let mut frames = frame_reader(remote);
        let deadline = Duration::from_secs(1);
        assert_eq!(read_message(&mut frames, deadline).await.unwrap(), heartbeat(1));
        assert_eq!(read_message(&mut frames, deadline).await.unwrap(), heartbeat(2));
    }

    #[tokio::test]
    async fn closed_link_refuses_sends_and_peer_sees_eof() {
        let (local, remote) = tokio::io::duplex(4096);
        let link = link(local);
        link.close().await;
        assert!(link.cancel_token().is_cancelled());
        assert!(matches!(
            link.send(&heartbeat(1)).await,
            Err(CapsyncError::ConnectionClosed)
        ));

        let mut frames = frame_reader(remote);
        assert!(matches!(
            read_message(&mut frames, Duration::from_secs(1)).await,
            Err(CapsyncError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn close_aborts_a_send_stuck_on_a_stalled_peer() {
        // The peer never reads, so the second frame cannot fit.
        let (local, _remote) = tokio::io::duplex(64);
        let link = std::sync::Arc::new(link(local));
        let sender = link.clone();
        let stuck = tokio::spawn(async move { sender.send(&big(1)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stuck.is_finished());

        tokio::time::timeout(Duration::from_secs(1), link.close())
            .await
            .expect("close waited on the stuck send");
        let result = tokio::time::timeout(Duration::from_secs(1), stuck)
            .await
            .expect("send still blocked")
            .unwrap();
        assert!(matches!(result, Err(CapsyncError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn send_to_a_stalled_peer_times_out() {
        let (local, _remote) = tokio::io::duplex(64);
        let link = PeerLink::new(
            "phone-a",
            1,
            frame_writer(local),
            Duration::from_millis(50),
            CancellationToken::new(),
        );
        let result = tokio::time::timeout(Duration::from_secs(1), link.send(&big(1)))
            .await
            .expect("write deadline not applied");
        assert!(matches!(result, Err(CapsyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn read_message_times_out() {
        let (_local, remote) = tokio::io::duplex(64);
        let mut frames = frame_reader(remote);
        let err = read_message(&mut frames, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CapsyncError::Timeout(_)));
    }

    #[tokio::test]
    async fn reader_stops_on_cancel() {
        let (_local, remote) = tokio::io::duplex(64);
        let mut frames = frame_reader(remote);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reason = run_reader("phone-a", &mut frames, &cancel, &ListenerSlot::default()).await;
        assert!(matches!(reason, CloseReason::Cancelled));
        assert_eq!(reason.describe(), "closed locally");
    }
}
