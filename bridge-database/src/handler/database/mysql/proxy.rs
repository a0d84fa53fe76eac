use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, error, warn};

use bridge_common::common::Result;

use crate::discovery::backend::BackendState;
use crate::handler::database::mysql::Connection;
use crate::pool::mysql::take_endpoint;
use crate::protocol::database::mysql::constant::{
    MySQLAuthenticationMethod, MySQLCommandPacketType, COM_QUERY, COM_QUIT,
    ER_ACCESS_DENIED_ERROR, ER_UNKNOWN_ERROR, PACKET_ERR, PACKET_OK, SQLSTATE_ACCESS_DENIED,
    SQLSTATE_GENERAL,
};
use crate::protocol::database::CommandPacketType;
use crate::protocol::database::mysql::packet::text::{MySQLComChangeUserPacket, ResultProgress};
use crate::protocol::database::mysql::packet::{
    MySQLHandshakePacket, MySQLHandshakeResponse41Packet, MySQLOKPacket, MySQLPacketPayload,
};
use crate::protocol::database::DatabasePacket;
use crate::script::{
    self, materialize_response, ResponseType, ScriptOutcome, ScriptResponse, ScriptVerdict,
};
use crate::session::mysql::{ConnectionState, Endpoint, Injection, QueryStat};

/// Queries the script layer must never see: covering them with injected
/// queries would corrupt their results.
const INTERCEPT_BLACKLIST: &[&str] = &["LOAD ", "SHOW ERRORS", "select @@error_count"];

fn bypasses_interception(payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return true;
    }
    let sql = &payload[1..];
    INTERCEPT_BLACKLIST.iter().any(|prefix| {
        sql.len() >= prefix.len() && sql[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    })
}

/// Run a hook; a hook failure is logged and treated as "no decision", the
/// script must never take the connection down with it.
fn run_hook(con: &mut Connection, name: &str, ctx: rhai::Map) -> Option<ScriptOutcome> {
    match con.script.call_hook(name, ctx) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("con {}: {}", con.id, e);
            None
        }
    }
}

/// Pick a backend and attach a connection to it: scripted override first,
/// then a pooled endpoint when asked for, then a fresh shortest-queue-first
/// connect. A failed connect marks the backend DOWN and retries the pick.
pub async fn connect_server(con: &mut Connection) -> Result<()> {
    let mut use_pooled_connection = false;

    if let Some(outcome) = run_hook(con, "connect_server", script::empty_ctx()) {
        if let Some(ndx) = outcome.backend_ndx {
            con.st.backend_ndx = Some(ndx);
        }
        match outcome.verdict {
            ScriptVerdict::SendResult => {
                // the script answers the handshake itself, no backend at all
                let response = outcome.response.unwrap_or_else(script_response_failed);
                for frame in materialize_response(&response, 0) {
                    con.client.send_queue.append(frame);
                }
                con.state = ConnectionState::SendHandshake;
                return Ok(());
            }
            ScriptVerdict::IgnoreResult => use_pooled_connection = true,
            _ => {}
        }
    }

    loop {
        let scripted = con.st.backend_ndx.take().filter(|ndx| {
            con.backends
                .get(*ndx)
                .map(|b| b.state() != BackendState::Down)
                .unwrap_or(false)
        });
        let ndx = match scripted.or_else(|| con.backends.pick_rw()) {
            Some(ndx) => ndx,
            None => {
                error!("con {}: cannot connect, all backends are down", con.id);
                con.fail_with_error(0, "(bridge) all backends are down");
                return Ok(());
            }
        };
        let backend = match con.backends.get(ndx) {
            Some(backend) => backend,
            None => continue,
        };

        if use_pooled_connection {
            if let Some(endpoint) = take_endpoint(backend, None) {
                // replay the cached challenge instead of a fresh round-trip
                let mut challenge = endpoint
                    .challenge
                    .clone()
                    .expect("pooled endpoints always carry a challenge");
                challenge.sequence_id = 0;
                con.client.queue_packet(&mut challenge);
                con.server = Some(endpoint);
                con.backend_ndx = Some(ndx);
                con.state = ConnectionState::SendHandshake;
                return Ok(());
            }
        }

        match Endpoint::connect(&backend.addr).await {
            Ok(endpoint) => {
                backend.set_state(BackendState::Up);
                backend.client_connected();
                con.server = Some(endpoint);
                con.backend_ndx = Some(ndx);
                con.state = ConnectionState::ReadHandshake;
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "con {}: connect({}) failed: {}. Retrying with different backend.",
                    con.id, backend.addr, e
                );
                backend.set_state(BackendState::Down);
                // retry the pick, DOWN backends are skipped
            }
        }
    }
}

/// Parse the handshake the backend sent, cache the challenge, scrub the
/// capabilities we cannot mediate and relay it (or the scripted reply).
pub async fn read_handshake(con: &mut Connection) -> Result<()> {
    let packet = match con.server.as_mut().unwrap().read_packet().await? {
        Some(packet) => packet,
        None => {
            con.fail_with_error(0, "(bridge) backend closed during handshake");
            return Ok(());
        }
    };

    if packet.status() == Some(PACKET_ERR) {
        // the server refused us (too many connections, ...); relay and close
        con.client.queue(packet.sequence_id, &packet.payload);
        con.state = ConnectionState::SendError;
        return Ok(());
    }

    let mut challenge = MySQLHandshakePacket::empty();
    challenge.sequence_id = packet.sequence_id;
    let mut payload = MySQLPacketPayload::from_slice(&packet.payload);
    if let Err(e) = challenge.decode(&mut payload) {
        error!("con {}: {}", con.id, e);
        con.fail_with_error(0, "(bridge) invalid handshake from backend");
        return Ok(());
    }
    challenge.scrub_capabilities();

    let outcome = run_hook(con, "read_handshake", script::packet_ctx(&packet.payload));
    match outcome {
        Some(outcome) if outcome.verdict == ScriptVerdict::SendResult => {
            // the script overrides the challenge, typically to deny early
            let response = outcome.response.unwrap_or_else(script_response_failed);
            if response.response_type == ResponseType::Err {
                con.st.connection_close = true;
            }
            for frame in materialize_response(&response, packet.sequence_id) {
                con.client.send_queue.append(frame);
            }
        }
        _ => {
            let mut relayed = challenge.clone();
            con.client.queue_packet(&mut relayed);
        }
    }
    con.server.as_mut().unwrap().challenge = Some(challenge);
    con.state = ConnectionState::SendHandshake;
    Ok(())
}

/// Parse the client's auth packet and decide how the backend half gets
/// authenticated: forward it, re-auth a pooled connection with
/// COM_CHANGE_USER, compare cached credentials, or answer directly.
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
            "(bridge) malformed auth packet",
        );
        return Ok(());
    }
    if !auth.auth_plugin_name.is_empty()
        && auth.auth_plugin_name != MySQLAuthenticationMethod::SecurePasswordAuthentication.value()
    {
        error!(
            "con {}: client requested auth plugin {:?}",
            con.id, auth.auth_plugin_name
        );
        con.fail_with_error(
            packet.sequence_id.wrapping_add(1),
            "(bridge) only mysql_native_password authentication is supported",
        );
        return Ok(());
    }
    con.client.default_db = auth.database.clone();
    con.client.response = Some(auth.clone());

    if let Some(outcome) = run_hook(con, "read_auth", script::packet_ctx(&packet.payload)) {
        if outcome.verdict == ScriptVerdict::SendResult {
            let response = outcome.response.unwrap_or_else(script_response_failed);
            if response.response_type == ResponseType::Err {
                con.parse.auth_failed = true;
            }
            for frame in materialize_response(&response, packet.sequence_id.wrapping_add(1)) {
                con.client.send_queue.append(frame);
            }
            con.state = ConnectionState::SendAuthResult;
            return Ok(());
        }
    }

    match con.server.as_mut() {
        None => {
            // scripted handshake, nobody to authenticate against: ack it
            let reply_seq = con.client.last_seq.wrapping_add(1);
            let mut ok = MySQLOKPacket::new(reply_seq, 0, 0);
            con.client.queue_packet(&mut ok);
            con.client.is_authed = true;
            con.state = ConnectionState::SendAuthResult;
        }
        Some(server) if !server.is_authed => {
            // fresh backend: the client's packet fits as-is
            server.queue(packet.sequence_id, &packet.payload);
            con.state = ConnectionState::SendAuth;
        }
        Some(server) => {
            // a pooled, already authenticated backend
            if con.config.proxy.pool_change_user {
                // re-auth to scrub temp tables and session variables
                let mut change_user = MySQLComChangeUserPacket::new(
                    &auth.username,
                    &auth.auth_response,
                    &auth.database,
                );
                server.queue_packet(&mut change_user);
                con.state = ConnectionState::SendAuth;
            } else {
                // without the re-auth round-trip only the exact same login
                // may reuse the connection
                let matches = server
                    .response
                    .as_ref()
                    .map(|r| r.username == auth.username && r.auth_response == auth.auth_response)
                    .unwrap_or(false);
                if matches {
                    let mut ok = MySQLOKPacket::new(2, 0, 0);
                    con.client.queue_packet(&mut ok);
                    con.client.is_authed = true;
                } else {
                    con.queue_error_to_client(
                        2,
                        ER_ACCESS_DENIED_ERROR,
                        SQLSTATE_ACCESS_DENIED,
                        "(bridge-pool) login failed",
                    );
                    con.parse.auth_failed = true;
                }
                con.state = ConnectionState::SendAuthResult;
            }
        }
    }
    Ok(())
}

/// Relay the backend's auth verdict to the client, remembering the client's
/// credentials on the backend endpoint for later pool matching.
pub async fn read_auth_result(con: &mut Connection) -> Result<()> {
    let packet = match con.server.as_mut().unwrap().read_packet().await? {
        Some(packet) => packet,
        None => {
            con.fail_with_error(2, "(bridge) backend closed during authentication");
            return Ok(());
        }
    };

    let status = packet.status();
    let client_default_db = con.client.default_db.clone();
    let client_response = con.client.response.clone();

    let reauth_of_pooled;
    {
        let server = con.server.as_mut().unwrap();
        reauth_of_pooled = server.is_authed;
        server.default_db = client_default_db;
        server.response = client_response;
        if status == Some(PACKET_OK) {
            server.is_authed = true;
        }
    }

    // the COM_CHANGE_USER we injected answers with seq 1; the client waits
    // for seq 2
    let sequence_id = if reauth_of_pooled {
        2
    } else {
        packet.sequence_id
    };

    match status {
        Some(PACKET_OK) => {
            con.client.is_authed = true;
        }
        Some(PACKET_ERR) => {
            con.parse.auth_failed = true;
            if con.config.proxy.fix_bug_25371 {
                // some older servers follow the auth ERR with a duplicate
                // ERR; drop it so the client library stays in sync
                let server = con.server.as_mut().unwrap();
                if let Some(Ok(Some(_dup))) = server.read_packet().now_or_never() {
                    debug!("con {}: dropped duplicate auth ERR (bug #25371)", con.id);
                }
            }
        }
        _ => {
            error!("con {}: unexpected auth result {:02x?}", con.id, status);
            con.fail_with_error(2, "(bridge) unsupported authentication exchange");
            return Ok(());
        }
    }

    let outcome = run_hook(con, "read_auth_result", script::packet_ctx(&packet.payload));
    match outcome {
        Some(outcome) if outcome.verdict == ScriptVerdict::SendResult => {
            // the scripted reply replaces the server's verdict
            let response = outcome.response.unwrap_or_else(script_response_failed);
            for frame in materialize_response(&response, sequence_id) {
                con.client.send_queue.append(frame);
            }
        }
        _ => con.client.queue(sequence_id, &packet.payload),
    }

    con.state = ConnectionState::SendAuthResult;
    Ok(())
}

/// Read one client command, give the script a shot at it, then forward it,
/// answer it from the script, or start draining the injection queue.
pub async fn read_query(con: &mut Connection) -> Result<()> {
    con.st.sent_resultset = 0;
    con.st.qstat = QueryStat::default();
    con.st.injections.clear();

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
            con.fail_with_error(1, "(bridge) zero length command packet");
            return Ok(());
        }
    };
    con.parse.command = command;
    con.parse.query_seq = packet.sequence_id;
    debug!(
        "con {}: {:?}",
        con.id,
        MySQLCommandPacketType::value_of(command)
    );

    if command == COM_QUIT {
        con.state = ConnectionState::CloseClient;
        return Ok(());
    }

    let intercepted = command != COM_QUERY || !bypasses_interception(&packet.payload);
    let outcome = if intercepted {
        match con
            .script
            .call_hook("read_query", script::packet_ctx(&packet.payload))
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("con {}: {}", con.id, e);
                con.queue_error_to_client(
                    packet.sequence_id.wrapping_add(1),
                    ER_UNKNOWN_ERROR,
                    SQLSTATE_GENERAL,
                    "(bridge) connection script failed, check the error log",
                );
                con.state = ConnectionState::SendQueryResult;
                return Ok(());
            }
        }
    } else {
        None
    };

    let mut verdict = ScriptVerdict::NoDecision;
    let mut response = None;
    if let Some(outcome) = outcome {
        con.st.connection_close |= outcome.connection_close;
        if let Some(ndx) = outcome.backend_ndx {
            con.st.backend_ndx = Some(ndx);
        }
        verdict = outcome.verdict;
        response = outcome.response;
        if verdict == ScriptVerdict::SendQuery && !outcome.queries.is_empty() {
            con.st.injections = outcome
                .queries
                .into_iter()
                .map(|q| Injection::new(q.id, Bytes::from(q.query), q.resultset_is_needed))
                .collect();
            verdict = ScriptVerdict::SendInjection;
        }
    }

    match verdict {
        ScriptVerdict::SendResult => {
            let response = response.unwrap_or_else(script_response_failed);
            for frame in materialize_response(&response, packet.sequence_id.wrapping_add(1)) {
                con.client.send_queue.append(frame);
            }
            con.state = ConnectionState::SendQueryResult;
        }
        ScriptVerdict::SendInjection => match con.server.as_mut() {
            Some(server) => {
                let head = con.st.injections.front().unwrap();
                con.parse.command = head.query.first().copied().unwrap_or(COM_QUERY);
                server.queue(0, &head.query);
                con.state = ConnectionState::SendQuery;
            }
            None => {
                error!("con {}: no backend for injected queries", con.id);
                con.state = ConnectionState::Error;
            }
        },
        _ => match con.server.as_mut() {
            Some(server) => {
                server.queue(packet.sequence_id, &packet.payload);
                con.state = ConnectionState::SendQuery;
            }
            None => {
                error!("con {}: no backend, closing connection", con.id);
                con.state = ConnectionState::Error;
            }
        },
    }
    Ok(())
}

/// Collect the backend's response packets until end-of-result, then let the
/// script keep, replace, or suppress the result set. At most one result set
/// per client command reaches the client.
pub async fn read_query_result(con: &mut Connection) -> Result<()> {
    let packet = match con.server.as_mut().unwrap().read_packet().await? {
        Some(packet) => packet,
        None => {
            con.fail_with_error(
                con.parse.query_seq.wrapping_add(1),
                "(bridge) backend closed mid result",
            );
            return Ok(());
        }
    };

    if let Some(injection) = con.st.injections.front_mut() {
        if injection.ts_first_result_packet.is_none() {
            injection.ts_first_result_packet = Some(Instant::now());
        }
    }

    if con.streaming_binlog() {
        // unbounded stream, relay every event as it arrives
        con.client.queue(packet.sequence_id, &packet.payload);
        con.state = ConnectionState::SendQueryResult;
        return Ok(());
    }

    let progress = con.parse.reader.as_mut().unwrap().push(&packet.payload);
    con.client.queue(packet.sequence_id, &packet.payload);

    match progress {
        ResultProgress::LoadData => {
            con.state = ConnectionState::ReadLoadDataFile;
        }
        ResultProgress::Reading => {}
        ResultProgress::Finished => {
            let (rows, bytes) = {
                let reader = con.parse.reader.as_ref().unwrap();
                (reader.rows, reader.bytes)
            };
            con.st.qstat = QueryStat { rows, bytes };

            if let Some(mut injection) = con.st.injections.pop_front() {
                injection.ts_last_result_packet = Some(Instant::now());
                injection.rows = rows;
                injection.bytes = bytes;

                let outcome = match con.script.call_hook(
                    "read_query_result",
                    script::injection_ctx(&injection, packet.status()),
                ) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("con {}: {}", con.id, e);
                        None
                    }
                };
                con.st.connection_close |= outcome
                    .as_ref()
                    .map(|o| o.connection_close)
                    .unwrap_or(false);
                let verdict = match outcome {
                    Some(ref o) => o.verdict,
                    // no hook: the injection's own flag decides
                    None => {
                        if injection.resultset_is_needed {
                            ScriptVerdict::NoDecision
                        } else {
                            ScriptVerdict::IgnoreResult
                        }
                    }
                };

                match verdict {
                    ScriptVerdict::SendResult => {
                        // replace the result set the server sent us
                        con.client.send_queue.clear();
                        let response = outcome
                            .and_then(|o| o.response)
                            .unwrap_or_else(script_response_failed);
                        for frame in
                            materialize_response(&response, con.parse.query_seq.wrapping_add(1))
                        {
                            con.client.send_queue.append(frame);
                        }
                        forward_guard(con, injection.id);
                    }
                    ScriptVerdict::IgnoreResult => {
                        con.client.send_queue.clear();
                    }
                    _ => {
                        forward_guard(con, injection.id);
                    }
                }
            } else {
                con.st.sent_resultset += 1;
            }
            con.state = ConnectionState::SendQueryResult;
        }
    }
    Ok(())
}

/// Only one result set per client command may reach the client; later
/// candidates are force-suppressed.
fn forward_guard(con: &mut Connection, injection_id: i64) {
    if con.st.sent_resultset == 0 {
        con.st.sent_resultset = 1;
    } else {
        warn!(
            "con {}: already sent {} resultset(s) for this command, suppressing injection {}",
            con.id, con.st.sent_resultset, injection_id
        );
        con.st.sent_resultset += 1;
        con.client.send_queue.clear();
    }
}

/// Relay the LOAD DATA LOCAL file stream from the client to the backend
/// until the empty terminating packet, then wait for the final OK/ERR.
pub async fn read_load_data_file(con: &mut Connection) -> Result<()> {
    // the client must see the 0xfb file request first
    con.client.flush().await?;
    loop {
        let packet = match con.client.read_packet().await? {
            Some(packet) => packet,
            None => {
                con.state = ConnectionState::Error;
                return Ok(());
            }
        };
        let finished = packet.payload.is_empty();
        let server = con.server.as_mut().unwrap();
        server.queue(packet.sequence_id, &packet.payload);
        server.flush().await?;
        if finished {
            break;
        }
    }
    con.parse.reader.as_mut().unwrap().load_data_done();
    con.state = ConnectionState::ReadQueryResult;
    Ok(())
}

/// Decide what follows a result set written to the client: close, keep
/// streaming binlog events, push the next injection, or read a new command.
pub fn send_query_result(con: &mut Connection) {
    if con.st.connection_close {
        con.state = ConnectionState::Error;
        return;
    }

    if con.streaming_binlog() {
        // the binlog dump has no end packet
        con.state = ConnectionState::ReadQueryResult;
        return;
    }

    if con.server.is_none() && !con.st.injections.is_empty() {
        for injection in con.st.injections.drain(..) {
            warn!(
                "con {}: dropping injection {} without a backend",
                con.id, injection.id
            );
        }
    }

    if con.st.injections.is_empty() {
        debug!(
            "con {}: result done, {} rows / {} bytes",
            con.id, con.st.qstat.rows, con.st.qstat.bytes
        );
        con.state = ConnectionState::ReadQuery;
        return;
    }

    let query = {
        let head = con.st.injections.front().unwrap();
        head.query.clone()
    };
    con.parse.command = query.first().copied().unwrap_or(COM_QUERY);
    con.server.as_mut().unwrap().queue(0, &query);
    con.state = ConnectionState::SendQuery;
}

/// End of session: let the script decide whether the backend half goes back
/// to the pool, otherwise close it and release its slot.
pub async fn disconnect_client(con: &mut Connection) {
    let outcome = run_hook(con, "disconnect_client", script::empty_ctx());
    let keep = matches!(
        outcome.map(|o| o.verdict),
        Some(ScriptVerdict::IgnoreResult)
    ) && con.state == ConnectionState::CloseClient;
    con.release_backend(keep);
}

fn script_response_failed() -> ScriptResponse {
    ScriptResponse {
        response_type: ResponseType::Err,
        error_message: "(bridge) handling the script response failed, check the error log"
            .to_string(),
        error_code: ER_UNKNOWN_ERROR,
        sql_state: SQLSTATE_GENERAL.to_string(),
        affected_rows: 0,
        insert_id: 0,
        columns: Vec::new(),
        rows: Vec::new(),
        packets: Vec::new(),
    }
}
