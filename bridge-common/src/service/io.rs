use std::io::ErrorKind;

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::service::ServiceCodec;

/// One framed socket. The halves are owned so a backend channel can outlive
/// the scope that accepted it and be parked in the connection pool.
#[derive(Debug)]
pub struct Channel {
    pub stream: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    pub sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

impl Channel {
    pub fn new<CODEC: ServiceCodec>(socket: TcpStream, codec: CODEC) -> Self {
        let (r, w) = socket.into_split();
        let stream = codec.read_frame(r);
        let sink = codec.write_frame(w);
        Channel { stream, sink }
    }

    /// Receive the next complete frame. `None` means the peer closed.
    pub async fn recv(&mut self) -> Option<Result<BytesMut, std::io::Error>> {
        self.stream.next().await
    }

    /// Write every payload in order; the codec prepends the length header.
    pub async fn send(&mut self, payloads: Vec<Bytes>) -> Result<(), std::io::Error> {
        if payloads.is_empty() {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "empty payload"));
        }
        for payload in payloads {
            self.sink.send(payload).await?;
        }
        self.sink.flush().await
    }
}
