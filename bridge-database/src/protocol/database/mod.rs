use bytes::Bytes;

use bridge_common::common::Result;

pub mod mysql;

/**
 * Packet payload.
 */
pub trait PacketPayload {
    /**
     * Get byte buf.
     *
     * @return byte buf
     */
    fn get_payload(&mut self) -> Bytes;
}

/**
 * Database packet.
 *
 * @param <T> type of packet payload
 */
pub trait DatabasePacket<T: PacketPayload> {
    /**
     * Write packet to byte buffer.
     *
     * @param payload packet payload to be written
     */
    fn encode(&mut self, _payload: &mut T) {}

    /**
     * Read packet from byte buffer.
     *
     * @param payload packet payload to be read
     */
    fn decode(&mut self, _payload: &mut T) -> Result<()> {
        Ok(())
    }
}

/**
 * Command packet type.
 */
pub trait CommandPacketType {
    fn value_of(t: u8) -> Self;
}
