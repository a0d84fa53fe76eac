use bytes::{Buf, BufMut, Bytes, BytesMut};

use bridge_common::common::{Error, Result};

use crate::protocol::database::mysql::auth::generate_challenge;
use crate::protocol::database::mysql::constant::{
    MySQLCapabilityFlag, MySQLStatusFlag, CHARSET, NUL, PACKET_EOF, PACKET_ERR, PACKET_OK,
    PROTOCOL_VERSION, SERVER_VERSION,
};
use crate::protocol::database::{DatabasePacket, PacketPayload};

pub mod text;

/**
 * MySQL payload operation for MySQL packet data types.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/describing-packets.html">describing packets</a>
 */
pub struct MySQLPacketPayload {
    bytes_mut: BytesMut,
}

impl MySQLPacketPayload {
    pub fn new() -> Self {
        MySQLPacketPayload {
            bytes_mut: BytesMut::new(),
        }
    }

    pub fn new_with_payload(bytes_mut: BytesMut) -> Self {
        MySQLPacketPayload { bytes_mut }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        MySQLPacketPayload {
            bytes_mut: BytesMut::from(bytes),
        }
    }

    pub fn remaining(&self) -> usize {
        self.bytes_mut.len()
    }

    pub fn put_u8(&mut self, val: u8) {
        self.bytes_mut.put_u8(val);
    }

    pub fn put_u16_le(&mut self, val: u16) {
        self.bytes_mut.put_u16_le(val);
    }

    pub fn put_u32_le(&mut self, val: u32) {
        self.bytes_mut.put_u32_le(val);
    }

    pub fn put_slice(&mut self, val: &[u8]) {
        self.bytes_mut.put_slice(val);
    }

    pub fn put_string_with_nul(&mut self, val: &[u8]) {
        self.bytes_mut.put_slice(val);
        self.bytes_mut.put_u8(NUL);
    }

    pub fn get_u8(&mut self) -> u8 {
        self.bytes_mut.get_u8()
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.bytes_mut.first().copied()
    }

    pub fn get_uint_le(&mut self, n: usize) -> u64 {
        self.bytes_mut.get_uint_le(n)
    }

    pub fn advance(&mut self, n: usize) {
        self.bytes_mut.advance(n);
    }

    // string with nul; None when the terminator is missing
    pub fn get_string_nul(&mut self) -> Option<String> {
        let pos = self.bytes_mut.iter().position(|&x| x == NUL)?;
        let bytes = self.bytes_mut.split_to(pos);
        let result = String::from_utf8_lossy(&bytes).to_string();
        self.bytes_mut.advance(1);
        Some(result)
    }

    /**
     * Write lenenc integer to byte buffers.
     *
     * @see <a href="https://dev.mysql.com/doc/internals/en/integer.html#packet-Protocol::LengthEncodedInteger">LengthEncodedInteger</a>
     */
    pub fn put_int_lenenc(&mut self, v: u64) {
        if v < 0xfb {
            self.bytes_mut.put_u8(v as u8);
        } else if v < (1 << 16) {
            self.bytes_mut.put_u8(0xfc);
            self.bytes_mut.put_u16_le(v as u16);
        } else if v < (1 << 24) {
            self.bytes_mut.put_u8(0xfd);
            self.bytes_mut.put_uint_le(v, 3);
        } else {
            self.bytes_mut.put_u8(0xfe);
            self.bytes_mut.put_u64_le(v);
        }
    }

    /**
     * Read lenenc integer from byte buffers.
     */
    pub fn get_int_lenenc(&mut self) -> u64 {
        let first_byte = self.bytes_mut.get_u8();
        match first_byte {
            0xfb => 0,
            0xfc => self.bytes_mut.get_uint_le(2),
            0xfd => self.bytes_mut.get_uint_le(3),
            0xfe => self.bytes_mut.get_uint_le(8),
            b => b as u64,
        }
    }

    pub fn put_string_lenenc(&mut self, val: &[u8]) {
        self.put_int_lenenc(val.len() as u64);
        self.bytes_mut.put_slice(val);
    }

    /**
     * Read lenenc string from byte buffers for bytes.
     */
    pub fn get_string_lenenc(&mut self) -> Vec<u8> {
        let length = self.get_int_lenenc() as usize;
        let length = length.min(self.bytes_mut.len());
        self.bytes_mut.split_to(length).to_vec()
    }

    /**
     * Read a string prefixed with a one-byte length.
     */
    pub fn get_string_fix(&mut self) -> Vec<u8> {
        let length = self.bytes_mut.get_u8() as usize;
        let length = length.min(self.bytes_mut.len());
        self.bytes_mut.split_to(length).to_vec()
    }

    pub fn get_remaining_bytes(&mut self) -> Vec<u8> {
        let len = self.bytes_mut.len();
        self.bytes_mut.split_to(len).to_vec()
    }
}

impl Default for MySQLPacketPayload {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPayload for MySQLPacketPayload {
    fn get_payload(&mut self) -> Bytes {
        let len = self.bytes_mut.len();
        self.bytes_mut.split_to(len).freeze()
    }
}

pub trait MySQLPacket {
    fn get_sequence_id(&self) -> u8;
}

/**
 * Handshake packet protocol for MySQL.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/connection-phase-packets.html#packet-Protocol::Handshake">Handshake</a>
 */
#[derive(Debug, Clone)]
pub struct MySQLHandshakePacket {
    pub sequence_id: u8,
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub capability_flags: MySQLCapabilityFlag,
    pub character_set: u8,
    pub status_flag: u16,
    pub seed1: Vec<u8>,
    pub seed2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl MySQLHandshakePacket {
    pub fn new(thread_id: u32) -> Self {
        let (seed1, seed2) = generate_challenge();

        let capability_flags = MySQLCapabilityFlag::CLIENT_LONG_PASSWORD
            | MySQLCapabilityFlag::CLIENT_FOUND_ROWS
            | MySQLCapabilityFlag::CLIENT_LONG_FLAG
            | MySQLCapabilityFlag::CLIENT_CONNECT_WITH_DB
            | MySQLCapabilityFlag::CLIENT_ODBC
            | MySQLCapabilityFlag::CLIENT_IGNORE_SPACE
            | MySQLCapabilityFlag::CLIENT_PROTOCOL_41
            | MySQLCapabilityFlag::CLIENT_INTERACTIVE
            | MySQLCapabilityFlag::CLIENT_IGNORE_SIGPIPE
            | MySQLCapabilityFlag::CLIENT_TRANSACTIONS
            | MySQLCapabilityFlag::CLIENT_SECURE_CONNECTION;

        MySQLHandshakePacket {
            sequence_id: 0,
            protocol_version: PROTOCOL_VERSION,
            server_version: SERVER_VERSION.to_string(),
            thread_id,
            capability_flags,
            character_set: CHARSET,
            status_flag: MySQLStatusFlag::ServerStatusAutocommit as u16,
            seed1,
            seed2,
            auth_plugin_name: String::new(),
        }
    }

    pub fn empty() -> Self {
        MySQLHandshakePacket {
            sequence_id: 0,
            protocol_version: PROTOCOL_VERSION,
            server_version: String::new(),
            thread_id: 0,
            capability_flags: MySQLCapabilityFlag::empty(),
            character_set: 0,
            status_flag: 0,
            seed1: Vec::new(),
            seed2: Vec::new(),
            auth_plugin_name: String::new(),
        }
    }

    /// The full 20-byte challenge the client scrambles its password with.
    pub fn scramble(&self) -> Vec<u8> {
        [self.seed1.as_slice(), self.seed2.as_slice()].concat()
    }

    /// Compressed and encrypted sessions cannot be interposed: drop the bits
    /// before the challenge is relayed.
    pub fn scrub_capabilities(&mut self) {
        self.capability_flags
            .remove(MySQLCapabilityFlag::CLIENT_COMPRESS | MySQLCapabilityFlag::CLIENT_SSL);
    }

    fn has_plugin_auth(&self) -> bool {
        self.capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_PLUGIN_AUTH)
    }
}

impl MySQLPacket for MySQLHandshakePacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLHandshakePacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_u8(self.protocol_version);
        payload.put_string_with_nul(self.server_version.as_bytes());
        payload.put_u32_le(self.thread_id);
        payload.put_string_with_nul(self.seed1.as_slice());
        payload.put_u16_le(self.capability_flags.bits() as u16); // capability_flags_lower
        payload.put_u8(self.character_set);
        payload.put_u16_le(self.status_flag);
        payload.put_u16_le((self.capability_flags.bits() >> 16) as u16); // capability_flags_upper
        if self.has_plugin_auth() {
            payload.put_u8((self.seed1.len() + self.seed2.len() + 1) as u8);
        } else {
            payload.put_u8(0);
        }
        let reserved: [u8; 10] = [0; 10];
        payload.put_slice(&reserved);
        if self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_SECURE_CONNECTION)
        {
            payload.put_string_with_nul(self.seed2.as_slice());
        }
        if self.has_plugin_auth() {
            payload.put_string_with_nul(self.auth_plugin_name.as_bytes());
        }
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 1 {
            return Err(Error::Protocol("empty handshake packet".to_string()));
        }
        self.protocol_version = payload.get_u8();
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported handshake protocol version {}",
                self.protocol_version
            )));
        }
        self.server_version = payload
            .get_string_nul()
            .ok_or_else(|| Error::Protocol("handshake: truncated server version".to_string()))?;
        if payload.remaining() < 4 + 8 + 1 + 2 {
            return Err(Error::Protocol("handshake: truncated".to_string()));
        }
        self.thread_id = payload.get_uint_le(4) as u32;
        self.seed1 = (0..8).map(|_| payload.get_u8()).collect();
        payload.advance(1); // filler
        let capability_lower = payload.get_uint_le(2) as u32;
        let mut capability = capability_lower;

        if payload.remaining() >= 1 + 2 + 2 + 1 + 10 {
            self.character_set = payload.get_u8();
            self.status_flag = payload.get_uint_le(2) as u16;
            let capability_upper = payload.get_uint_le(2) as u32;
            capability |= capability_upper << 16;
            let _auth_plugin_data_len = payload.get_u8();
            payload.advance(10); // reserved
            if capability & MySQLCapabilityFlag::CLIENT_SECURE_CONNECTION.bits() != 0 {
                self.seed2 = payload
                    .get_string_nul()
                    .ok_or_else(|| {
                        Error::Protocol("handshake: truncated challenge suffix".to_string())
                    })?
                    .into_bytes();
            }
            if capability & MySQLCapabilityFlag::CLIENT_PLUGIN_AUTH.bits() != 0 {
                self.auth_plugin_name = payload.get_string_nul().unwrap_or_default();
            }
        }
        self.capability_flags = MySQLCapabilityFlag::from_bits_truncate(capability);
        Ok(())
    }
}

/**
 * Handshake response above MySQL 4.1 packet protocol.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/connection-phase-packets.html#packet-Protocol::HandshakeResponse41">HandshakeResponse41</a>
 */
#[derive(Debug, Clone)]
pub struct MySQLHandshakeResponse41Packet {
    pub sequence_id: u8,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub capability_flags: MySQLCapabilityFlag,
    pub database: String,
    pub auth_plugin_name: String,
}

impl MySQLHandshakeResponse41Packet {
    pub fn new() -> Self {
        MySQLHandshakeResponse41Packet {
            sequence_id: 0,
            max_packet_size: 0,
            character_set: 0,
            username: String::new(),
            auth_response: Vec::new(),
            capability_flags: MySQLCapabilityFlag::empty(),
            database: String::new(),
            auth_plugin_name: String::new(),
        }
    }
}

impl Default for MySQLHandshakeResponse41Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl MySQLPacket for MySQLHandshakeResponse41Packet {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLHandshakeResponse41Packet {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_u32_le(self.capability_flags.bits());
        payload.put_u32_le(self.max_packet_size);
        payload.put_u8(self.character_set);
        let reserved: [u8; 23] = [0; 23];
        payload.put_slice(&reserved);
        payload.put_string_with_nul(self.username.as_bytes());
        payload.put_u8(self.auth_response.len() as u8);
        payload.put_slice(self.auth_response.as_slice());
        if self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_CONNECT_WITH_DB)
        {
            payload.put_string_with_nul(self.database.as_bytes());
        }
        if self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_PLUGIN_AUTH)
        {
            payload.put_string_with_nul(self.auth_plugin_name.as_bytes());
        }
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 4 + 4 + 1 + 23 {
            return Err(Error::Protocol("auth response: truncated".to_string()));
        }
        self.capability_flags =
            MySQLCapabilityFlag::from_bits_truncate(payload.get_uint_le(4) as u32);
        if !self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_PROTOCOL_41)
        {
            return Err(Error::Protocol(
                "auth response: pre-4.1 authentication is not supported".to_string(),
            ));
        }
        self.max_packet_size = payload.get_uint_le(4) as u32;
        self.character_set = payload.get_u8();
        payload.advance(23);

        self.username = payload
            .get_string_nul()
            .ok_or_else(|| Error::Protocol("auth response: truncated username".to_string()))?;

        self.auth_response = if self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
        {
            payload.get_string_lenenc()
        } else if self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_SECURE_CONNECTION)
        {
            payload.get_string_fix()
        } else {
            payload
                .get_string_nul()
                .ok_or_else(|| Error::Protocol("auth response: truncated scramble".to_string()))?
                .into_bytes()
        };

        self.database = if self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_CONNECT_WITH_DB)
        {
            payload.get_string_nul().unwrap_or_default()
        } else {
            String::new()
        };

        self.auth_plugin_name = if self
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_PLUGIN_AUTH)
        {
            payload.get_string_nul().unwrap_or_default()
        } else {
            String::new()
        };
        Ok(())
    }
}

/**
 * OK packet protocol for MySQL.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/packet-OK_Packet.html">OK Packet</a>
 */
#[derive(Debug, Clone)]
pub struct MySQLOKPacket {
    pub sequence_id: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flag: u16,
    pub warnings: u16,
    pub info: String,
}

impl MySQLOKPacket {
    pub fn new(sequence_id: u8, affected_rows: u64, last_insert_id: u64) -> Self {
        MySQLOKPacket {
            sequence_id,
            affected_rows,
            last_insert_id,
            status_flag: MySQLStatusFlag::ServerStatusAutocommit as u16,
            warnings: 0,
            info: String::new(),
        }
    }
}

impl MySQLPacket for MySQLOKPacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLOKPacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_u8(PACKET_OK);
        payload.put_int_lenenc(self.affected_rows);
        payload.put_int_lenenc(self.last_insert_id);
        payload.put_u16_le(self.status_flag);
        payload.put_u16_le(self.warnings);
        payload.put_slice(self.info.as_bytes());
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 1 {
            return Err(Error::Protocol("empty OK packet".to_string()));
        }
        let header = payload.get_u8();
        if header != PACKET_OK {
            return Err(Error::Protocol(format!(
                "OK packet with header 0x{:02x}",
                header
            )));
        }
        self.affected_rows = payload.get_int_lenenc();
        self.last_insert_id = payload.get_int_lenenc();
        if payload.remaining() >= 4 {
            self.status_flag = payload.get_uint_le(2) as u16;
            self.warnings = payload.get_uint_le(2) as u16;
        }
        self.info = String::from_utf8_lossy(&payload.get_remaining_bytes()).to_string();
        Ok(())
    }
}

/**
 * ERR packet protocol for MySQL.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/packet-ERR_Packet.html">ERR Packet</a>
 */
#[derive(Debug, Clone)]
pub struct MySQLErrPacket {
    pub sequence_id: u8,
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl MySQLErrPacket {
    pub fn new(sequence_id: u8, error_code: u16, sql_state: &str, error_message: &str) -> Self {
        MySQLErrPacket {
            sequence_id,
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }
}

impl MySQLPacket for MySQLErrPacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLErrPacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_u8(PACKET_ERR);
        payload.put_u16_le(self.error_code);
        payload.put_u8(b'#');
        let mut sql_state = self.sql_state.as_bytes().to_vec();
        sql_state.resize(5, b'0');
        payload.put_slice(&sql_state);
        payload.put_slice(self.error_message.as_bytes());
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 3 {
            return Err(Error::Protocol("truncated ERR packet".to_string()));
        }
        let header = payload.get_u8();
        if header != PACKET_ERR {
            return Err(Error::Protocol(format!(
                "ERR packet with header 0x{:02x}",
                header
            )));
        }
        self.error_code = payload.get_uint_le(2) as u16;
        let rest = payload.get_remaining_bytes();
        if rest.first() == Some(&b'#') && rest.len() >= 6 {
            self.sql_state = String::from_utf8_lossy(&rest[1..6]).to_string();
            self.error_message = String::from_utf8_lossy(&rest[6..]).to_string();
        } else {
            self.sql_state = String::new();
            self.error_message = String::from_utf8_lossy(&rest).to_string();
        }
        Ok(())
    }
}

/**
 * EOF packet protocol for MySQL.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/packet-EOF_Packet.html">EOF Packet</a>
 */
#[derive(Debug, Clone)]
pub struct MySQLEOFPacket {
    pub sequence_id: u8,
    pub warnings: u16,
    pub status_flags: u16,
}

impl MySQLEOFPacket {
    pub fn new(sequence_id: u8) -> Self {
        MySQLEOFPacket {
            sequence_id,
            warnings: 0,
            status_flags: MySQLStatusFlag::ServerStatusAutocommit as u16,
        }
    }
}

impl MySQLPacket for MySQLEOFPacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLEOFPacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_u8(PACKET_EOF);
        payload.put_u16_le(self.warnings);
        payload.put_u16_le(self.status_flags);
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 5 {
            return Err(Error::Protocol("truncated EOF packet".to_string()));
        }
        let header = payload.get_u8();
        if header != PACKET_EOF {
            return Err(Error::Protocol(format!(
                "EOF packet with header 0x{:02x}",
                header
            )));
        }
        self.warnings = payload.get_uint_le(2) as u16;
        self.status_flags = payload.get_uint_le(2) as u16;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_payload<P: DatabasePacket<MySQLPacketPayload>>(packet: &mut P) -> MySQLPacketPayload {
        let mut payload = MySQLPacketPayload::new();
        packet.encode(&mut payload);
        // skip the sequence byte, decode sees the payload only
        let bytes = payload.get_payload();
        MySQLPacketPayload::from_slice(&bytes[1..])
    }

    #[test]
    fn test_handshake_round_trip() {
        let mut packet = MySQLHandshakePacket::new(42);
        let mut decoded = MySQLHandshakePacket::empty();
        let mut payload = encode_payload(&mut packet);
        decoded.decode(&mut payload).unwrap();

        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
        assert_eq!(decoded.server_version, SERVER_VERSION);
        assert_eq!(decoded.thread_id, 42);
        assert_eq!(decoded.capability_flags, packet.capability_flags);
        assert_eq!(decoded.character_set, CHARSET);
        assert_eq!(decoded.seed1, packet.seed1);
        assert_eq!(decoded.seed2, packet.seed2);
        assert_eq!(decoded.scramble().len(), 20);
    }

    #[test]
    fn test_handshake_scrub() {
        let mut packet = MySQLHandshakePacket::new(1);
        packet
            .capability_flags
            .insert(MySQLCapabilityFlag::CLIENT_COMPRESS | MySQLCapabilityFlag::CLIENT_SSL);
        packet.scrub_capabilities();
        assert!(!packet
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_COMPRESS));
        assert!(!packet
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_SSL));
        assert!(packet
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_auth_response_round_trip() {
        let mut packet = MySQLHandshakeResponse41Packet::new();
        packet.sequence_id = 1;
        packet.capability_flags = MySQLCapabilityFlag::CLIENT_PROTOCOL_41
            | MySQLCapabilityFlag::CLIENT_SECURE_CONNECTION
            | MySQLCapabilityFlag::CLIENT_CONNECT_WITH_DB;
        packet.max_packet_size = 1 << 24;
        packet.character_set = CHARSET;
        packet.username = "app".to_string();
        packet.auth_response = vec![0xaa; 20];
        packet.database = "orders".to_string();

        let mut payload = encode_payload(&mut packet);
        let mut decoded = MySQLHandshakeResponse41Packet::new();
        decoded.decode(&mut payload).unwrap();

        assert_eq!(decoded.username, "app");
        assert_eq!(decoded.auth_response, vec![0xaa; 20]);
        assert_eq!(decoded.database, "orders");
        assert_eq!(decoded.capability_flags, packet.capability_flags);
    }

    #[test]
    fn test_auth_response_rejects_pre_41() {
        let mut payload = MySQLPacketPayload::new();
        payload.put_u32_le(0); // no CLIENT_PROTOCOL_41
        payload.put_u32_le(0);
        payload.put_u8(0);
        payload.put_slice(&[0u8; 23]);
        payload.put_string_with_nul(b"user");
        let bytes = payload.get_payload();
        let mut decoded = MySQLHandshakeResponse41Packet::new();
        assert!(decoded
            .decode(&mut MySQLPacketPayload::from_slice(&bytes))
            .is_err());
    }

    #[test]
    fn test_ok_round_trip() {
        let mut packet = MySQLOKPacket::new(2, 3, 7);
        let mut payload = encode_payload(&mut packet);
        let mut decoded = MySQLOKPacket::new(0, 0, 0);
        decoded.decode(&mut payload).unwrap();
        assert_eq!(decoded.affected_rows, 3);
        assert_eq!(decoded.last_insert_id, 7);
        assert_eq!(
            decoded.status_flag,
            MySQLStatusFlag::ServerStatusAutocommit as u16
        );
    }

    #[test]
    fn test_err_round_trip() {
        let mut packet = MySQLErrPacket::new(2, 1045, "28000", "Access denied for user");
        let mut payload = encode_payload(&mut packet);
        let mut decoded = MySQLErrPacket::new(0, 0, "", "");
        decoded.decode(&mut payload).unwrap();
        assert_eq!(decoded.error_code, 1045);
        assert_eq!(decoded.sql_state, "28000");
        assert_eq!(decoded.error_message, "Access denied for user");
    }

    #[test]
    fn test_eof_round_trip() {
        let mut packet = MySQLEOFPacket::new(5);
        let mut payload = encode_payload(&mut packet);
        let mut decoded = MySQLEOFPacket::new(0);
        decoded.decode(&mut payload).unwrap();
        assert_eq!(
            decoded.status_flags,
            MySQLStatusFlag::ServerStatusAutocommit as u16
        );
    }

    #[test]
    fn test_lenenc_round_trip() {
        for v in [0u64, 1, 0xfa, 0xfb, 0xffff, 0x1_0000, 0xff_ffff, 0x100_0000] {
            let mut payload = MySQLPacketPayload::new();
            payload.put_int_lenenc(v);
            let bytes = payload.get_payload();
            let mut payload = MySQLPacketPayload::from_slice(&bytes);
            assert_eq!(payload.get_int_lenenc(), v);
        }
    }
}
