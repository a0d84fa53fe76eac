use log::debug;

use bridge_common::common::{Error, Result};

use crate::protocol::database::mysql::constant::{
    COM_BINLOG_DUMP, COM_CHANGE_USER, PACKET_EOF, PACKET_ERR, PACKET_LOCAL_INFILE, PACKET_OK,
};
use crate::protocol::database::mysql::packet::{MySQLPacket, MySQLPacketPayload};
use crate::protocol::database::DatabasePacket;

/**
 * COM_QUERY command packet for MySQL.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/com-query.html">COM_QUERY</a>
 */
pub struct MySQLComQueryPacket {
    pub sequence_id: u8,
    pub command_type: u8,
    pub sql: Vec<u8>,
}

impl MySQLComQueryPacket {
    pub fn new(command_type: u8, sql: &[u8]) -> Self {
        MySQLComQueryPacket {
            sequence_id: 0,
            command_type,
            sql: sql.to_vec(),
        }
    }

    pub fn get_sql(&self) -> &[u8] {
        &self.sql
    }
}

impl MySQLPacket for MySQLComQueryPacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLComQueryPacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_u8(self.command_type);
        payload.put_slice(self.sql.as_slice());
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 1 {
            return Err(Error::Protocol("empty command packet".to_string()));
        }
        self.command_type = payload.get_u8();
        self.sql = payload.get_remaining_bytes();
        Ok(())
    }
}

/**
 * COM_CHANGE_USER command packet, the re-authentication that scrubs
 * session state off a pooled backend connection.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/com-change-user.html">COM_CHANGE_USER</a>
 */
pub struct MySQLComChangeUserPacket {
    pub sequence_id: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: String,
}

impl MySQLComChangeUserPacket {
    pub fn new(username: &str, auth_response: &[u8], database: &str) -> Self {
        MySQLComChangeUserPacket {
            sequence_id: 0,
            username: username.to_string(),
            auth_response: auth_response.to_vec(),
            database: database.to_string(),
        }
    }
}

impl MySQLPacket for MySQLComChangeUserPacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLComChangeUserPacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_u8(COM_CHANGE_USER);
        payload.put_string_with_nul(self.username.as_bytes());
        payload.put_u8(self.auth_response.len() as u8);
        payload.put_slice(self.auth_response.as_slice());
        payload.put_string_with_nul(self.database.as_bytes());
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 1 {
            return Err(Error::Protocol("empty COM_CHANGE_USER".to_string()));
        }
        let command = payload.get_u8();
        if command != COM_CHANGE_USER {
            return Err(Error::Protocol(format!(
                "COM_CHANGE_USER with command byte 0x{:02x}",
                command
            )));
        }
        self.username = payload
            .get_string_nul()
            .ok_or_else(|| Error::Protocol("COM_CHANGE_USER: truncated username".to_string()))?;
        self.auth_response = payload.get_string_fix();
        self.database = payload.get_string_nul().unwrap_or_default();
        Ok(())
    }
}

/**
 * Field count packet, the head of a text result set.
 */
pub struct MySQLFieldCountPacket {
    pub sequence_id: u8,
    pub field_count: u64,
}

impl MySQLFieldCountPacket {
    pub fn new(sequence_id: u8, field_count: u64) -> Self {
        MySQLFieldCountPacket {
            sequence_id,
            field_count,
        }
    }
}

impl MySQLPacket for MySQLFieldCountPacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLFieldCountPacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_int_lenenc(self.field_count);
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        if payload.remaining() < 1 {
            return Err(Error::Protocol("empty field count packet".to_string()));
        }
        self.field_count = payload.get_int_lenenc();
        Ok(())
    }
}

/**
 * Column definition packet for MySQL 4.1+.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/com-query-response.html#packet-Protocol::ColumnDefinition41">ColumnDefinition41</a>
 */
pub struct MySQLColumnDefinition41Packet {
    pub sequence_id: u8,
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl MySQLColumnDefinition41Packet {
    pub fn new(sequence_id: u8, name: &str, column_type: u8) -> Self {
        MySQLColumnDefinition41Packet {
            sequence_id,
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.to_string(),
            org_name: name.to_string(),
            character_set: 0x21,
            column_length: 255,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }
}

impl MySQLPacket for MySQLColumnDefinition41Packet {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLColumnDefinition41Packet {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        payload.put_string_lenenc(self.catalog.as_bytes());
        payload.put_string_lenenc(self.schema.as_bytes());
        payload.put_string_lenenc(self.table.as_bytes());
        payload.put_string_lenenc(self.org_table.as_bytes());
        payload.put_string_lenenc(self.name.as_bytes());
        payload.put_string_lenenc(self.org_name.as_bytes());
        payload.put_u8(0x0c); // length of the fixed fields
        payload.put_u16_le(self.character_set);
        payload.put_u32_le(self.column_length);
        payload.put_u8(self.column_type);
        payload.put_u16_le(self.flags);
        payload.put_u8(self.decimals);
        payload.put_u16_le(0); // filler
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        self.catalog = String::from_utf8_lossy(&payload.get_string_lenenc()).to_string();
        self.schema = String::from_utf8_lossy(&payload.get_string_lenenc()).to_string();
        self.table = String::from_utf8_lossy(&payload.get_string_lenenc()).to_string();
        self.org_table = String::from_utf8_lossy(&payload.get_string_lenenc()).to_string();
        self.name = String::from_utf8_lossy(&payload.get_string_lenenc()).to_string();
        self.org_name = String::from_utf8_lossy(&payload.get_string_lenenc()).to_string();
        if payload.remaining() < 1 + 2 + 4 + 1 + 2 + 1 {
            return Err(Error::Protocol("column definition: truncated".to_string()));
        }
        payload.advance(1); // length of the fixed fields
        self.character_set = payload.get_uint_le(2) as u16;
        self.column_length = payload.get_uint_le(4) as u32;
        self.column_type = payload.get_u8();
        self.flags = payload.get_uint_le(2) as u16;
        self.decimals = payload.get_u8();
        Ok(())
    }
}

/**
 * Text result set row packet for MySQL.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/com-query-response.html#packet-ProtocolText::ResultsetRow">ResultsetRow</a>
 */
pub struct MySQLTextResultSetRowPacket {
    pub sequence_id: u8,
    pub data: Vec<Option<Vec<u8>>>, // NULL = 0xfb
}

impl MySQLTextResultSetRowPacket {
    pub fn new(sequence_id: u8, data: Vec<Option<Vec<u8>>>) -> Self {
        MySQLTextResultSetRowPacket { sequence_id, data }
    }
}

impl MySQLPacket for MySQLTextResultSetRowPacket {
    fn get_sequence_id(&self) -> u8 {
        self.sequence_id
    }
}

impl DatabasePacket<MySQLPacketPayload> for MySQLTextResultSetRowPacket {
    fn encode(&mut self, payload: &mut MySQLPacketPayload) {
        payload.put_u8(self.get_sequence_id()); // seq
        for column in self.data.iter() {
            match column {
                Some(value) => payload.put_string_lenenc(value.as_slice()),
                None => payload.put_u8(PACKET_LOCAL_INFILE), // NULL shares the 0xfb byte
            }
        }
    }

    fn decode(&mut self, payload: &mut MySQLPacketPayload) -> Result<()> {
        self.data.clear();
        while payload.remaining() > 0 {
            if payload.peek_u8() == Some(PACKET_LOCAL_INFILE) {
                payload.advance(1);
                self.data.push(None);
            } else {
                self.data.push(Some(payload.get_string_lenenc()));
            }
        }
        Ok(())
    }
}

/// How far the response to one command has progressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultProgress {
    /// More packets belong to this response.
    Reading,
    /// The response is complete.
    Finished,
    /// The server asked for a LOAD DATA LOCAL file; the driver must relay
    /// the file stream from the client before the final OK/ERR arrives.
    LoadData,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadState {
    FieldCount,
    ColumnDefs,
    Rows,
    LoadDataResult,
    Done,
}

/// Tracks a command's response packets until end-of-result: an immediate
/// OK or ERR, or field count + column definitions + EOF + rows + EOF.
/// COM_BINLOG_DUMP never completes, the binlog stream has no end packet.
pub struct QueryResultReader {
    command: u8,
    state: ReadState,
    columns: u64,
    seen_columns: u64,
    pub rows: u64,
    pub bytes: u64,
}

impl QueryResultReader {
    pub fn new(command: u8) -> Self {
        QueryResultReader {
            command,
            state: ReadState::FieldCount,
            columns: 0,
            seen_columns: 0,
            rows: 0,
            bytes: 0,
        }
    }

    fn is_eof(payload: &[u8]) -> bool {
        payload.first() == Some(&PACKET_EOF) && payload.len() < 9
    }

    /// Feed one response payload; returns how far the response has come.
    pub fn push(&mut self, payload: &[u8]) -> ResultProgress {
        self.bytes += payload.len() as u64 + 4;

        if self.command == COM_BINLOG_DUMP {
            return ResultProgress::Reading;
        }

        let status = payload.first().copied();
        match self.state {
            ReadState::FieldCount => match status {
                Some(PACKET_OK) | Some(PACKET_ERR) => {
                    self.state = ReadState::Done;
                    ResultProgress::Finished
                }
                Some(PACKET_LOCAL_INFILE) => ResultProgress::LoadData,
                _ => {
                    let mut p = MySQLPacketPayload::from_slice(payload);
                    self.columns = p.get_int_lenenc();
                    self.state = ReadState::ColumnDefs;
                    ResultProgress::Reading
                }
            },
            ReadState::ColumnDefs => {
                if Self::is_eof(payload) {
                    if self.seen_columns != self.columns {
                        debug!(
                            "result set announced {} columns, saw {}",
                            self.columns, self.seen_columns
                        );
                    }
                    self.state = ReadState::Rows;
                } else {
                    self.seen_columns += 1;
                }
                ResultProgress::Reading
            }
            ReadState::Rows => {
                if Self::is_eof(payload) || status == Some(PACKET_ERR) {
                    self.state = ReadState::Done;
                    ResultProgress::Finished
                } else {
                    self.rows += 1;
                    ResultProgress::Reading
                }
            }
            ReadState::LoadDataResult => {
                self.state = ReadState::Done;
                ResultProgress::Finished
            }
            ReadState::Done => ResultProgress::Finished,
        }
    }

    /// The client finished streaming its LOAD DATA file; the next server
    /// packet is the final OK/ERR.
    pub fn load_data_done(&mut self) {
        self.state = ReadState::LoadDataResult;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::database::mysql::constant::{MySQLColumnType, COM_QUERY};
    use crate::protocol::database::mysql::packet::{MySQLEOFPacket, MySQLOKPacket};
    use crate::protocol::database::PacketPayload;

    fn payload_of<P: DatabasePacket<MySQLPacketPayload>>(packet: &mut P) -> Vec<u8> {
        let mut payload = MySQLPacketPayload::new();
        packet.encode(&mut payload);
        payload.get_payload()[1..].to_vec()
    }

    #[test]
    fn test_com_query_round_trip() {
        let mut packet = MySQLComQueryPacket::new(COM_QUERY, b"SELECT 1");
        let bytes = payload_of(&mut packet);
        let mut decoded = MySQLComQueryPacket::new(0, b"");
        decoded
            .decode(&mut MySQLPacketPayload::from_slice(&bytes))
            .unwrap();
        assert_eq!(decoded.command_type, COM_QUERY);
        assert_eq!(decoded.get_sql(), b"SELECT 1");
    }

    #[test]
    fn test_change_user_round_trip() {
        let mut packet = MySQLComChangeUserPacket::new("u2", &[0x11; 20], "db2");
        let bytes = payload_of(&mut packet);
        let mut decoded = MySQLComChangeUserPacket::new("", b"", "");
        decoded
            .decode(&mut MySQLPacketPayload::from_slice(&bytes))
            .unwrap();
        assert_eq!(decoded.username, "u2");
        assert_eq!(decoded.auth_response, vec![0x11; 20]);
        assert_eq!(decoded.database, "db2");
    }

    #[test]
    fn test_column_definition_round_trip() {
        let mut packet = MySQLColumnDefinition41Packet::new(
            2,
            "@@hostname",
            MySQLColumnType::MysqlTypeVarString as u8,
        );
        let bytes = payload_of(&mut packet);
        let mut decoded = MySQLColumnDefinition41Packet::new(0, "", 0);
        decoded
            .decode(&mut MySQLPacketPayload::from_slice(&bytes))
            .unwrap();
        assert_eq!(decoded.catalog, "def");
        assert_eq!(decoded.name, "@@hostname");
        assert_eq!(
            decoded.column_type,
            MySQLColumnType::MysqlTypeVarString as u8
        );
    }

    #[test]
    fn test_row_round_trip() {
        let mut packet = MySQLTextResultSetRowPacket::new(
            4,
            vec![Some(b"a".to_vec()), None, Some(b"xyz".to_vec())],
        );
        let bytes = payload_of(&mut packet);
        let mut decoded = MySQLTextResultSetRowPacket::new(0, vec![]);
        decoded
            .decode(&mut MySQLPacketPayload::from_slice(&bytes))
            .unwrap();
        assert_eq!(
            decoded.data,
            vec![Some(b"a".to_vec()), None, Some(b"xyz".to_vec())]
        );
    }

    #[test]
    fn test_reader_immediate_ok() {
        let mut ok = MySQLOKPacket::new(1, 0, 0);
        let mut reader = QueryResultReader::new(COM_QUERY);
        assert_eq!(reader.push(&payload_of(&mut ok)), ResultProgress::Finished);
        assert_eq!(reader.rows, 0);
    }

    #[test]
    fn test_reader_immediate_err() {
        let mut reader = QueryResultReader::new(COM_QUERY);
        assert_eq!(
            reader.push(&[0xff, 0x15, 0x04, b'#', b'2', b'8', b'0', b'0', b'0']),
            ResultProgress::Finished
        );
    }

    #[test]
    fn test_reader_result_set() {
        let mut reader = QueryResultReader::new(COM_QUERY);
        let mut field_count = MySQLFieldCountPacket::new(1, 1);
        assert_eq!(
            reader.push(&payload_of(&mut field_count)),
            ResultProgress::Reading
        );
        let mut column = MySQLColumnDefinition41Packet::new(2, "c", 0xfd);
        assert_eq!(
            reader.push(&payload_of(&mut column)),
            ResultProgress::Reading
        );
        let mut eof = MySQLEOFPacket::new(3);
        assert_eq!(reader.push(&payload_of(&mut eof)), ResultProgress::Reading);
        let mut row = MySQLTextResultSetRowPacket::new(4, vec![Some(b"1".to_vec())]);
        assert_eq!(reader.push(&payload_of(&mut row)), ResultProgress::Reading);
        let mut eof = MySQLEOFPacket::new(5);
        assert_eq!(reader.push(&payload_of(&mut eof)), ResultProgress::Finished);
        assert_eq!(reader.rows, 1);
    }

    #[test]
    fn test_reader_binlog_never_finishes() {
        let mut reader = QueryResultReader::new(COM_BINLOG_DUMP);
        for _ in 0..100 {
            assert_eq!(reader.push(&[0x00, 0x01, 0x02]), ResultProgress::Reading);
        }
    }

    #[test]
    fn test_reader_load_data() {
        let mut reader = QueryResultReader::new(COM_QUERY);
        assert_eq!(
            reader.push(&[PACKET_LOCAL_INFILE, b'f']),
            ResultProgress::LoadData
        );
        reader.load_data_done();
        let mut ok = MySQLOKPacket::new(1, 2, 0);
        assert_eq!(reader.push(&payload_of(&mut ok)), ResultProgress::Finished);
    }

    #[test]
    fn test_reader_row_starting_with_fe_long_payload() {
        // a row whose first column is a long string starting 0xfe must not
        // be mistaken for EOF
        let mut reader = QueryResultReader::new(COM_QUERY);
        let mut field_count = MySQLFieldCountPacket::new(1, 1);
        reader.push(&payload_of(&mut field_count));
        let mut column = MySQLColumnDefinition41Packet::new(2, "c", 0xfd);
        reader.push(&payload_of(&mut column));
        let mut eof = MySQLEOFPacket::new(3);
        reader.push(&payload_of(&mut eof));

        let long_value = vec![b'x'; 300];
        let mut row = MySQLTextResultSetRowPacket::new(4, vec![Some(long_value)]);
        let row_payload = payload_of(&mut row);
        assert_eq!(row_payload[0], 0xfc); // lenenc prefix for 300
        assert_eq!(reader.push(&row_payload), ResultProgress::Reading);
        assert_eq!(reader.rows, 1);
    }
}
