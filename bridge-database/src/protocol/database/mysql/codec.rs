use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::codec::{FramedRead, FramedWrite};

use bridge_common::service::ServiceCodec;

/// Largest packet body the 3-byte length header can describe.
pub const MAX_PACKET_LENGTH: usize = 0x00ff_ffff;

/// The wire framing is a 3-byte little-endian payload length followed by a
/// 1-byte sequence id. Inbound frames are delivered with the full 4-byte
/// header still attached; outbound frames are submitted as
/// `[sequence id][payload]` and the codec prepends the length.
pub struct MySQLCodec {}

impl ServiceCodec for MySQLCodec {
    fn write_frame<T: AsyncWrite>(&self, io: T) -> FramedWrite<T, LengthDelimitedCodec> {
        LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(3)
            .length_adjustment(1)
            .little_endian()
            .num_skip(0)
            .max_frame_length(MAX_PACKET_LENGTH + 4)
            .new_write(io)
    }

    fn read_frame<T: AsyncRead>(&self, io: T) -> FramedRead<T, LengthDelimitedCodec> {
        LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(3)
            .length_adjustment(4)
            .little_endian()
            .num_skip(0)
            .max_frame_length(MAX_PACKET_LENGTH + 4)
            .new_read(io)
    }
}

/// One framed packet, header already stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    /// Split an inbound `[len:3][seq:1][payload]` frame.
    pub fn parse(mut frame: BytesMut) -> Self {
        let _len = frame.get_uint_le(3);
        let sequence_id = frame.get_u8();
        Packet {
            sequence_id,
            payload: frame.freeze(),
        }
    }

    /// Assemble the `[seq:1][payload]` form the write side of the codec expects.
    pub fn to_frame(&self) -> Bytes {
        frame(&self.payload, self.sequence_id)
    }

    /// First payload byte, the response/command discriminator.
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Frame a payload for the write side of the codec.
pub fn frame(payload: &[u8], sequence_id: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(sequence_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Parse a raw 4-byte framing header.
pub fn parse_header(header: &[u8]) -> (usize, u8) {
    let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
    (len, header[3])
}

/// Emit the full wire form of one packet, header included. The frames the
/// codec produces on a socket are byte-identical to this.
pub fn to_wire(payload: &[u8], sequence_id: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_uint_le(payload.len() as u64, 3);
    buf.put_u8(sequence_id);
    buf.put_slice(payload);
    buf.freeze()
}
