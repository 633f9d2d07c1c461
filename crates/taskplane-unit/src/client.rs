//! Transport towards the hub.
//!
//! The unit connects exactly once at startup. Inbound frames become
//! [`Promise`]s: a promise carries the decoded frame bytes and must be
//! fulfilled with the encoded reply at most once. Replies go through a
//! writer task so concurrent request handlers never interleave partial
//! frames on the socket; a dropped promise simply never answers, which
//! the hub observes as a timeout or connection teardown.
//!
//! Losing the connection is terminal for the unit process — there is no
//! reconnect.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use taskplane_core::cobs::CobsError;
use taskplane_core::{CobsCodec, ErrorKind, Result};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info};

/// One inbound request frame awaiting its reply.
pub struct Promise {
    /// Decoded frame payload (protobuf bytes of one request).
    pub data: Bytes,
    reply_tx: mpsc::UnboundedSender<Bytes>,
}

impl Promise {
    /// Send the encoded reply for this request. Consumes the promise;
    /// each request is answered at most once.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ReactorError`] when the connection writer is gone.
    pub fn fulfill(self, payload: Bytes) -> Result<()> {
        self.reply_tx
            .send(payload)
            .map_err(|_| ErrorKind::ReactorError)
    }
}

/// The unit's framed connection to the hub.
pub struct UnitClient {
    reader: FramedRead<OwnedReadHalf, CobsCodec>,
    reply_tx: mpsc::UnboundedSender<Bytes>,
}

impl UnitClient {
    /// Connect to the hub and start the reply writer.
    ///
    /// Must run inside a `LocalSet`; the writer is a local task.
    ///
    /// # Errors
    ///
    /// Propagates the connect failure; startup treats it as fatal.
    pub async fn connect(address: &str, port: u16) -> std::io::Result<Self> {
        info!("connecting to hub at {address}:{port}");
        let stream = TcpStream::connect((address, port)).await?;
        let (read_half, write_half) = stream.into_split();

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::task::spawn_local(async move {
            let mut writer = FramedWrite::new(write_half, CobsCodec::new());
            while let Some(payload) = reply_rx.recv().await {
                debug!("sending {} reply bytes", payload.len());
                if let Err(err) = writer.send(payload).await {
                    error!("reply write failed: {err}");
                    break;
                }
            }
        });

        info!("connected to hub");
        Ok(Self {
            reader: FramedRead::new(read_half, CobsCodec::new()),
            reply_tx,
        })
    }

    /// Await the next complete request frame.
    ///
    /// `None` means the hub closed the connection. A codec error is
    /// fatal for the connection and is reported once.
    pub async fn next_request(&mut self) -> Option<Result<Promise>> {
        match self.reader.next().await {
            None => None,
            Some(Ok(frame)) => Some(Ok(Promise {
                data: frame,
                reply_tx: self.reply_tx.clone(),
            })),
            Some(Err(err)) => {
                error!("receive failed: {err}");
                Some(Err(match err {
                    CobsError::Io(_) => ErrorKind::ReactorError,
                    _ => ErrorKind::DecodingFailed,
                }))
            }
        }
    }
}
