use crate::protocol::database::CommandPacketType;

/// Protocol version is always 0x0A.
pub const PROTOCOL_VERSION: u8 = 0x0A;

/// String with NUL
pub const NUL: u8 = 0x00;

/// Server version the listeners announce.
pub const SERVER_VERSION: &str = "5.0.99-sqlbridge";

/// Charset code 0x21 is utf8_general_ci.
pub const CHARSET: u8 = 0x21;

/// Length of the random challenge split 8 + 12 across the handshake.
pub const SCRAMBLE_LENGTH: usize = 20;

/// Header byte of an OK packet.
pub const PACKET_OK: u8 = 0x00;
/// Header byte of the LOAD DATA LOCAL file request.
pub const PACKET_LOCAL_INFILE: u8 = 0xfb;
/// Header byte of an EOF packet (when the payload is short enough).
pub const PACKET_EOF: u8 = 0xfe;
/// Header byte of an ERR packet.
pub const PACKET_ERR: u8 = 0xff;

/// ER_ACCESS_DENIED_ERROR
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
/// ER_UNKNOWN_ERROR
pub const ER_UNKNOWN_ERROR: u16 = 1105;

/// SQL state reported with authentication failures.
pub const SQLSTATE_ACCESS_DENIED: &str = "28000";
/// Catch-all SQL state.
pub const SQLSTATE_GENERAL: &str = "HY000";

/// Status flags are a bit-field for MySQL.
///
/// @see <a href="https://dev.mysql.com/doc/internals/en/status-flags.html#packet-Protocol::StatusFlags">StatusFlags</a>
///
pub enum MySQLStatusFlag {
    ServerStatusInTrans = 0x0001,
    ServerStatusAutocommit = 0x0002,
    ServerMoreResultsExists = 0x0008,
    ServerStatusNoGoodIndexUsed = 0x0010,
    ServerStatusNoIndexUsed = 0x0020,
    ServerStatusCursorExists = 0x0040,
    ServerStatusLastRowSent = 0x0080,
    ServerStatusDbDropped = 0x0100,
    ServerStatusNoBackslashEscapes = 0x0200,
    ServerStatusMetadataChanged = 0x0400,
    ServerQueryWasSlow = 0x0800,
    ServerPsOutParams = 0x1000,
    ServerStatusInTransReadonly = 0x2000,
    ServerSessionStateChanged = 0x4000,
}

//
// Capability flag for MySQL.
//
// @see <a href="https://dev.mysql.com/doc/internals/en/capability-flags.html#packet-Protocol::CapabilityFlags">CapabilityFlags</a>
//
bitflags! {
    /// Client capability flags
    pub struct MySQLCapabilityFlag: u32 {
        /// Use the improved version of Old Password Authentication.
        const CLIENT_LONG_PASSWORD                  = 0x0000_0001;

        /// Send found rows instead of affected rows in EOF_Packet.
        const CLIENT_FOUND_ROWS                     = 0x0000_0002;

        /// Get all column flags.
        const CLIENT_LONG_FLAG                      = 0x0000_0004;

        /// Database (schema) name can be specified on connect in Handshake Response Packet.
        const CLIENT_CONNECT_WITH_DB                = 0x0000_0008;

        /// Don't allow database.table.column.
        const CLIENT_NO_SCHEMA                      = 0x0000_0010;

        /// Compression protocol supported. Never relayed: compressed
        /// sessions cannot be interposed, the bit is scrubbed from every
        /// server challenge before it reaches a client.
        const CLIENT_COMPRESS                       = 0x0000_0020;

        /// Special handling of ODBC behavior.
        const CLIENT_ODBC                           = 0x0000_0040;

        /// Can use LOAD DATA LOCAL.
        const CLIENT_LOCAL_FILES                    = 0x0000_0080;

        /// Ignore spaces before '('.
        const CLIENT_IGNORE_SPACE                   = 0x0000_0100;

        const CLIENT_PROTOCOL_41                    = 0x0000_0200;

        /// This is an interactive client.
        const CLIENT_INTERACTIVE                    = 0x0000_0400;

        /// Use SSL encryption for the session. Scrubbed alongside
        /// CLIENT_COMPRESS, an encrypted session cannot be interposed either.
        const CLIENT_SSL                            = 0x0000_0800;

        /// Client only flag, do not issue SIGPIPE on network failures.
        const CLIENT_IGNORE_SIGPIPE                 = 0x0000_1000;

        /// Client knows about transactions.
        const CLIENT_TRANSACTIONS                   = 0x0000_2000;

        const CLIENT_RESERVED                       = 0x0000_4000;

        const CLIENT_SECURE_CONNECTION              = 0x0000_8000;

        /// Enable/disable multi-stmt support.
        const CLIENT_MULTI_STATEMENTS               = 0x0001_0000;

        /// Enable/disable multi-results.
        const CLIENT_MULTI_RESULTS                  = 0x0002_0000;

        /// Multi-results and OUT parameters in PS-protocol.
        const CLIENT_PS_MULTI_RESULTS               = 0x0004_0000;

        /// Client supports plugin authentication.
        const CLIENT_PLUGIN_AUTH                    = 0x0008_0000;

        /// Client supports connection attributes.
        const CLIENT_CONNECT_ATTRS                  = 0x0010_0000;

        /// Length of auth response data is a length-encoded integer.
        const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA = 0x0020_0000;

        /// Don't close the connection for a user account with expired password.
        const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS   = 0x0040_0000;

        /// Capable of handling server state change information.
        const CLIENT_SESSION_TRACK                  = 0x0080_0000;

        /// Client no longer needs EOF_Packet and will use OK_Packet instead.
        const CLIENT_DEPRECATE_EOF                  = 0x0100_0000;
    }
}

///
pub const SEED: &[u8] = b"abedefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

///
/// MySQL client/server protocol Authentication Method.
///
/// @see <a href="https://dev.mysql.com/doc/internals/en/authentication-method.html">Authentication Method</a>
///
pub enum MySQLAuthenticationMethod {
    OldPasswordAuthentication,
    SecurePasswordAuthentication,
    ClearTextAuthentication,
}

impl MySQLAuthenticationMethod {
    pub fn value(&self) -> &str {
        match *self {
            MySQLAuthenticationMethod::OldPasswordAuthentication => "mysql_old_password",
            MySQLAuthenticationMethod::SecurePasswordAuthentication => "mysql_native_password",
            MySQLAuthenticationMethod::ClearTextAuthentication => "mysql_clear_password",
        }
    }
}

///
/// Column types for MySQL.
///
/// @see <a href="https://dev.mysql.com/doc/internals/en/com-query-response.html#column-type">Column Type</a>
///
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum MySQLColumnType {
    MysqlTypeDecimal = 0x00,
    MysqlTypeTiny = 0x01,
    MysqlTypeShort = 0x02,
    MysqlTypeLong = 0x03,
    MysqlTypeFloat = 0x04,
    MysqlTypeDouble = 0x05,
    MysqlTypeNull = 0x06,
    MysqlTypeTimestamp = 0x07,
    MysqlTypeLonglong = 0x08,
    MysqlTypeInt24 = 0x09,
    MysqlTypeDate = 0x0a,
    MysqlTypeTime = 0x0b,
    MysqlTypeDatetime = 0x0c,
    MysqlTypeYear = 0x0d,
    MysqlTypeVarchar = 0x0f,
    MysqlTypeBit = 0x10,
    MysqlTypeNewDecimal = 0xf6,
    MysqlTypeEnum = 0xf7,
    MysqlTypeSet = 0xf8,
    MysqlTypeTinyBlob = 0xf9,
    MysqlTypeMediumBlob = 0xfa,
    MysqlTypeLongBlob = 0xfb,
    MysqlTypeBlob = 0xfc,
    MysqlTypeVarString = 0xfd,
    MysqlTypeString = 0xfe,
    MysqlTypeGeometry = 0xff,
}

/**
 * Command packet type for MySQL.
 *
 * @see <a href="https://dev.mysql.com/doc/internals/en/text-protocol.html">Text Protocol</a>
 */
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum MySQLCommandPacketType {
    ComSleep = 0x00,
    ComQuit = 0x01,
    ComInitDb = 0x02,
    ComQuery = 0x03,
    ComFieldList = 0x04,
    ComCreateDb = 0x05,
    ComDropDb = 0x06,
    ComRefresh = 0x07,
    ComShutdown = 0x08,
    ComStatistics = 0x09,
    ComProcessInfo = 0x0a,
    ComConnect = 0x0b,
    ComProcessKill = 0x0c,
    ComDebug = 0x0d,
    ComPing = 0x0e,
    ComTime = 0x0f,
    ComDelayedInsert = 0x10,
    ComChangeUser = 0x11,
    ComBinlogDump = 0x12,
    ComTableDump = 0x13,
    ComConnectOut = 0x14,
    ComRegisterSlave = 0x15,
    ComStmtPrepare = 0x16,
    ComStmtExecute = 0x17,
    ComStmtSendLongData = 0x18,
    ComStmtClose = 0x19,
    ComStmtReset = 0x1a,
    ComSetOption = 0x1b,
    ComStmtFetch = 0x1c,
    ComDaemon = 0x1d,
    ComBinlogDumpGtid = 0x1e,
    ComResetConnection = 0x1f,
    /// Anything past the known range; forwarded verbatim.
    ComUnknown = 0xff,
}

impl CommandPacketType for MySQLCommandPacketType {
    fn value_of(t: u8) -> Self {
        match t {
            0x00 => MySQLCommandPacketType::ComSleep,
            0x01 => MySQLCommandPacketType::ComQuit,
            0x02 => MySQLCommandPacketType::ComInitDb,
            0x03 => MySQLCommandPacketType::ComQuery,
            0x04 => MySQLCommandPacketType::ComFieldList,
            0x05 => MySQLCommandPacketType::ComCreateDb,
            0x06 => MySQLCommandPacketType::ComDropDb,
            0x07 => MySQLCommandPacketType::ComRefresh,
            0x08 => MySQLCommandPacketType::ComShutdown,
            0x09 => MySQLCommandPacketType::ComStatistics,
            0x0a => MySQLCommandPacketType::ComProcessInfo,
            0x0b => MySQLCommandPacketType::ComConnect,
            0x0c => MySQLCommandPacketType::ComProcessKill,
            0x0d => MySQLCommandPacketType::ComDebug,
            0x0e => MySQLCommandPacketType::ComPing,
            0x0f => MySQLCommandPacketType::ComTime,
            0x10 => MySQLCommandPacketType::ComDelayedInsert,
            0x11 => MySQLCommandPacketType::ComChangeUser,
            0x12 => MySQLCommandPacketType::ComBinlogDump,
            0x13 => MySQLCommandPacketType::ComTableDump,
            0x14 => MySQLCommandPacketType::ComConnectOut,
            0x15 => MySQLCommandPacketType::ComRegisterSlave,
            0x16 => MySQLCommandPacketType::ComStmtPrepare,
            0x17 => MySQLCommandPacketType::ComStmtExecute,
            0x18 => MySQLCommandPacketType::ComStmtSendLongData,
            0x19 => MySQLCommandPacketType::ComStmtClose,
            0x1a => MySQLCommandPacketType::ComStmtReset,
            0x1b => MySQLCommandPacketType::ComSetOption,
            0x1c => MySQLCommandPacketType::ComStmtFetch,
            0x1d => MySQLCommandPacketType::ComDaemon,
            0x1e => MySQLCommandPacketType::ComBinlogDumpGtid,
            0x1f => MySQLCommandPacketType::ComResetConnection,
            _ => MySQLCommandPacketType::ComUnknown,
        }
    }
}

pub const COM_QUIT: u8 = MySQLCommandPacketType::ComQuit as u8;
pub const COM_INIT_DB: u8 = MySQLCommandPacketType::ComInitDb as u8;
pub const COM_QUERY: u8 = MySQLCommandPacketType::ComQuery as u8;
pub const COM_PING: u8 = MySQLCommandPacketType::ComPing as u8;
pub const COM_CHANGE_USER: u8 = MySQLCommandPacketType::ComChangeUser as u8;
pub const COM_BINLOG_DUMP: u8 = MySQLCommandPacketType::ComBinlogDump as u8;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::database::CommandPacketType;

    #[test]
    fn test_command_value_of() {
        assert_eq!(
            MySQLCommandPacketType::value_of(0x03),
            MySQLCommandPacketType::ComQuery
        );
        assert_eq!(
            MySQLCommandPacketType::value_of(0x12),
            MySQLCommandPacketType::ComBinlogDump
        );
        assert_eq!(
            MySQLCommandPacketType::value_of(0x7f),
            MySQLCommandPacketType::ComUnknown
        );
    }

    #[test]
    fn test_scrubbed_capabilities_are_distinct() {
        let scrubbed = MySQLCapabilityFlag::CLIENT_COMPRESS | MySQLCapabilityFlag::CLIENT_SSL;
        assert_eq!(scrubbed.bits(), 0x0000_0820);
    }
}
