use log::{debug, error};

use bridge_common::common::Result;

use crate::handler::database::mysql::Connection;
use crate::protocol::database::mysql::auth::verify_scramble;
use crate::protocol::database::mysql::constant::{
    MySQLAuthenticationMethod, COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT,
    ER_ACCESS_DENIED_ERROR, ER_UNKNOWN_ERROR, SQLSTATE_ACCESS_DENIED, SQLSTATE_GENERAL,
};
use crate::protocol::database::mysql::packet::{
    MySQLHandshakePacket, MySQLHandshakeResponse41Packet, MySQLOKPacket, MySQLPacketPayload,
};
use crate::protocol::database::DatabasePacket;
use crate::script::{
    self, materialize_response, resultset_frames, ResponseType, ScriptVerdict,
};
use crate::session::mysql::ConnectionState;

/// Queue the synthesized challenge; the master is the server here, it
/// speaks first.
pub fn con_init(con: &mut Connection) {
    let mut challenge = MySQLHandshakePacket::new(con.id as u32);
    con.client.queue_packet(&mut challenge);
    con.client.challenge = Some(challenge);
    con.state = ConnectionState::SendHandshake;
}

/// Check the client's credentials against the configured master account.
pub async fn read_auth(con: &mut Connection) -> Result<()> {
    let packet = match con.client.read_packet().await? {
        Some(packet) => packet,
        None => {
            con.state = ConnectionState::CloseClient;
            return Ok(());
        }
    };

    let mut auth = MySQLHandshakeResponse41Packet::new();
    auth.sequence_id = packet.sequence_id;
    let mut payload = MySQLPacketPayload::from_slice(&packet.payload);
    if let Err(e) = auth.decode(&mut payload) {
        error!("con {}: {}", con.id, e);
        con.fail_with_error(
            packet.sequence_id.wrapping_add(1),
            "(master) malformed auth packet",
        );
        return Ok(());
    }

    let challenge = con
        .client
        .challenge
        .as_ref()
        .map(|c| c.scramble())
        .unwrap_or_default();
    let reply_seq = packet.sequence_id.wrapping_add(1);

    if !auth.auth_plugin_name.is_empty()
        && auth.auth_plugin_name != MySQLAuthenticationMethod::SecurePasswordAuthentication.value()
    {
        con.fail_with_error(
            reply_seq,
            "(master) only mysql_native_password authentication is supported",
        );
        return Ok(());
    }

    if auth.username != con.config.master.username {
        con.queue_error_to_client(
            reply_seq,
            ER_ACCESS_DENIED_ERROR,
            SQLSTATE_ACCESS_DENIED,
            "unknown user",
        );
        con.state = ConnectionState::SendError;
    } else if !verify_scramble(&con.config.master.password, &challenge, &auth.auth_response) {
        con.queue_error_to_client(
            reply_seq,
            ER_ACCESS_DENIED_ERROR,
            SQLSTATE_ACCESS_DENIED,
            "password doesn't match",
        );
        con.state = ConnectionState::SendError;
    } else {
        let mut ok = MySQLOKPacket::new(reply_seq, 0, 0);
        con.client.queue_packet(&mut ok);
        con.client.is_authed = true;
        con.state = ConnectionState::SendAuthResult;
    }
    con.client.default_db = auth.database.clone();
    con.client.response = Some(auth);
    Ok(())
}

/// Answer one client command from the script, or from the built-in
/// fallbacks when no script is loaded.
pub async fn read_query(con: &mut Connection) -> Result<()> {
    con.st.sent_resultset = 0;
    con.st.response_chunks.clear();

    let packet = match con.client.read_packet().await? {
        Some(packet) => packet,
        None => {
            con.state = ConnectionState::CloseClient;
            return Ok(());
        }
    };
    let command = match packet.status() {
        Some(command) => command,
        None => {
            con.fail_with_error(1, "(master) zero length command packet");
            return Ok(());
        }
    };
    con.parse.command = command;
    con.parse.query_seq = packet.sequence_id;
    let reply_seq = packet.sequence_id.wrapping_add(1);

    if command == COM_QUIT {
        con.state = ConnectionState::CloseClient;
        return Ok(());
    }

    if !con.script.loaded() {
        builtin_response(con, command, &packet.payload, reply_seq);
        con.state = ConnectionState::SendQueryResult;
        return Ok(());
    }

    let outcome = match con
        .script
        .call_hook("read_query", script::packet_ctx(&packet.payload))
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("con {}: {}", con.id, e);
            con.queue_error_to_client(
                reply_seq,
                ER_UNKNOWN_ERROR,
                SQLSTATE_GENERAL,
                "(master) connection script failed to execute, check the error log",
            );
            con.state = ConnectionState::SendError;
            return Ok(());
        }
    };

    match outcome {
        None => {
            // script loaded but without a read_query hook
            builtin_response(con, command, &packet.payload, reply_seq);
            con.state = ConnectionState::SendQueryResult;
        }
        Some(outcome) if outcome.verdict == ScriptVerdict::SendResult => {
            con.st.connection_close |= outcome.connection_close;
            match outcome.response {
                Some(response)
                    if response.response_type == ResponseType::Raw
                        && !response.packets.is_empty() =>
                {
                    // the chunk list is drained lazily, one frame per send
                    // step, sequence ids continuing after the command
                    con.st.response_chunks = response.packets.into();
                    con.client.send_queue.reset_seq(reply_seq);
                }
                Some(response) => {
                    for frame in materialize_response(&response, reply_seq) {
                        con.client.send_queue.append(frame);
                    }
                }
                None => {
                    con.queue_error_to_client(
                        reply_seq,
                        ER_UNKNOWN_ERROR,
                        SQLSTATE_GENERAL,
                        "(master) handling the script response failed, check the error log",
                    );
                }
            }
            con.state = ConnectionState::SendQueryResult;
        }
        Some(_) => {
            con.queue_error_to_client(
                reply_seq,
                ER_UNKNOWN_ERROR,
                SQLSTATE_GENERAL,
                "need a resultset + SEND_RESULT",
            );
            con.state = ConnectionState::SendError;
        }
    }
    Ok(())
}

/// The result iterator of the master: one queued chunk per send step; an
/// exhausted list ends the stream and the connection reads the next command.
pub fn emit_next_chunk(con: &mut Connection) {
    if con.st.connection_close {
        con.state = ConnectionState::Error;
        return;
    }
    match con.st.response_chunks.pop_front() {
        Some(chunk) => {
            con.client.send_queue.append_auto(&chunk);
            debug!(
                "con {}: streaming chunk, {} left",
                con.id,
                con.st.response_chunks.len()
            );
            con.state = ConnectionState::SendQueryResult;
        }
        None => {
            con.state = ConnectionState::ReadQuery;
        }
    }
}

/// Built-in answers used when no script drives the master.
fn builtin_response(con: &mut Connection, command: u8, payload: &[u8], reply_seq: u8) {
    match command {
        COM_QUERY => {
            let sql = &payload[1..];
            if starts_with_ci(sql, b"select @@version_comment") {
                for frame in resultset_frames(
                    &["@@version_comment".to_string()],
                    &[vec![Some("SQLBridge".to_string())]],
                    reply_seq,
                ) {
                    con.client.send_queue.append(frame);
                }
            } else if starts_with_ci(sql, b"select USER()") {
                let user = con
                    .client
                    .username()
                    .unwrap_or("root")
                    .to_string();
                for frame in resultset_frames(
                    &["USER()".to_string()],
                    &[vec![Some(user)]],
                    reply_seq,
                ) {
                    con.client.send_queue.append(frame);
                }
            } else {
                con.queue_error_to_client(
                    reply_seq,
                    ER_UNKNOWN_ERROR,
                    SQLSTATE_GENERAL,
                    "(master) query not known",
                );
            }
        }
        COM_INIT_DB | COM_PING => {
            let mut ok = MySQLOKPacket::new(reply_seq, 0, 0);
            con.client.queue_packet(&mut ok);
        }
        _ => {
            con.queue_error_to_client(
                reply_seq,
                ER_UNKNOWN_ERROR,
                SQLSTATE_GENERAL,
                "unknown COM_*",
            );
        }
    }
}

fn starts_with_ci(haystack: &[u8], prefix: &[u8]) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// The master holds no backend; nothing to release beyond the client half.
pub fn disconnect_client(con: &mut Connection) {
    debug!("con {}: master session ended", con.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_ci() {
        assert!(starts_with_ci(b"SELECT @@version_comment limit 1", b"select @@version_comment"));
        assert!(starts_with_ci(b"select user()", b"select USER()"));
        assert!(!starts_with_ci(b"select 1", b"select USER()"));
        assert!(!starts_with_ci(b"sel", b"select"));
    }
}
