use std::time::Duration;

use bytes::Bytes;
use log::warn;
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, Map, Module, Scope, AST, INT};

use bridge_common::common::{Error, Result};

use crate::protocol::database::mysql::constant::{
    MySQLColumnType, ER_UNKNOWN_ERROR, SQLSTATE_GENERAL,
};
use crate::protocol::database::mysql::packet::text::{
    MySQLColumnDefinition41Packet, MySQLFieldCountPacket, MySQLTextResultSetRowPacket,
};
use crate::protocol::database::mysql::packet::{
    MySQLEOFPacket, MySQLErrPacket, MySQLOKPacket, MySQLPacketPayload,
};
use crate::protocol::database::{DatabasePacket, PacketPayload};
use crate::session::mysql::Injection;

/// Numeric verdicts a hook returns to steer the state machine.
pub const VERDICT_NO_DECISION: INT = 0;
pub const VERDICT_SEND_QUERY: INT = 1;
pub const VERDICT_SEND_RESULT: INT = 2;
pub const VERDICT_SEND_INJECTION: INT = 3;
pub const VERDICT_IGNORE_RESULT: INT = 4;

pub const RESPONSE_TYPE_OK: INT = 0x00;
pub const RESPONSE_TYPE_RAW: INT = 0xfa;
pub const RESPONSE_TYPE_ERR: INT = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptVerdict {
    NoDecision,
    SendQuery,
    SendResult,
    SendInjection,
    IgnoreResult,
}

impl ScriptVerdict {
    fn from_int(value: INT) -> Self {
        match value {
            VERDICT_SEND_QUERY => ScriptVerdict::SendQuery,
            VERDICT_SEND_RESULT => ScriptVerdict::SendResult,
            VERDICT_SEND_INJECTION => ScriptVerdict::SendInjection,
            VERDICT_IGNORE_RESULT => ScriptVerdict::IgnoreResult,
            VERDICT_NO_DECISION => ScriptVerdict::NoDecision,
            other => {
                warn!("script returned unknown verdict {}, ignoring", other);
                ScriptVerdict::NoDecision
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Ok,
    Err,
    Raw,
}

/// The reply a hook asked the bridge to materialize instead of (or on top
/// of) the wire traffic.
#[derive(Debug, Clone)]
pub struct ScriptResponse {
    pub response_type: ResponseType,
    pub error_message: String,
    pub error_code: u16,
    pub sql_state: String,
    pub affected_rows: u64,
    pub insert_id: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Raw frame payloads, drained one per send step by the master
    /// personality. The end of the list is the end-of-stream sentinel.
    pub packets: Vec<Vec<u8>>,
}

impl ScriptResponse {
    fn ok() -> Self {
        ScriptResponse {
            response_type: ResponseType::Ok,
            error_message: String::new(),
            error_code: 0,
            sql_state: String::new(),
            affected_rows: 0,
            insert_id: 0,
            columns: Vec::new(),
            rows: Vec::new(),
            packets: Vec::new(),
        }
    }
}

/// A query the script wants executed on the backend.
#[derive(Debug, Clone)]
pub struct ScriptQuery {
    pub id: i64,
    /// Full command payload, command byte included.
    pub query: Vec<u8>,
    pub resultset_is_needed: bool,
}

/// Everything a hook invocation decided.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub verdict: ScriptVerdict,
    pub response: Option<ScriptResponse>,
    pub queries: Vec<ScriptQuery>,
    pub backend_ndx: Option<usize>,
    pub connection_close: bool,
}

impl ScriptOutcome {
    pub fn no_decision() -> Self {
        ScriptOutcome {
            verdict: ScriptVerdict::NoDecision,
            response: None,
            queries: Vec::new(),
            backend_ndx: None,
            connection_close: false,
        }
    }
}

/// The embedded interpreter plus the compiled connection script. Hooks are
/// plain script functions named after the transition (`connect_server`,
/// `read_handshake`, `read_auth`, `read_auth_result`, `read_query`,
/// `read_query_result`, `disconnect_client`); an absent function means "no
/// decision". Each hook gets one context map and returns either a bare
/// verdict or a map `#{ verdict, response, queries, backend_ndx,
/// connection_close }`.
pub struct ScriptHost {
    engine: Engine,
    ast: Option<AST>,
}

impl ScriptHost {
    /// A host with no script loaded; every hook reports "no decision".
    pub fn disabled() -> Self {
        ScriptHost {
            engine: new_engine(),
            ast: None,
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_source(&text)
    }

    pub fn from_source(text: &str) -> Result<Self> {
        let engine = new_engine();
        let ast = engine
            .compile(text)
            .map_err(|e| Error::Script(format!("compile failed: {}", e)))?;
        Ok(ScriptHost {
            engine,
            ast: Some(ast),
        })
    }

    pub fn loaded(&self) -> bool {
        self.ast.is_some()
    }

    /// Run one hook. `Ok(None)` when no script is loaded or the script does
    /// not define the hook.
    pub fn call_hook(&self, name: &str, ctx: Map) -> Result<Option<ScriptOutcome>> {
        let ast = match &self.ast {
            Some(ast) => ast,
            None => return Ok(None),
        };
        let mut scope = Scope::new();
        let result: std::result::Result<Dynamic, Box<EvalAltResult>> =
            self.engine.call_fn(&mut scope, ast, name, (ctx,));
        match result {
            Ok(value) => Ok(Some(parse_outcome(value))),
            Err(e) => match *e {
                EvalAltResult::ErrorFunctionNotFound(ref signature, _)
                    if signature.starts_with(name) =>
                {
                    Ok(None)
                }
                other => Err(Error::Script(format!("({}) {}", name, other))),
            },
        }
    }
}

fn new_engine() -> Engine {
    let mut engine = Engine::new();
    // keep a runaway script from wedging the connection task
    engine.set_max_operations(1_000_000);

    let mut module = Module::new();
    module.set_var("NO_DECISION", VERDICT_NO_DECISION);
    module.set_var("SEND_QUERY", VERDICT_SEND_QUERY);
    module.set_var("SEND_RESULT", VERDICT_SEND_RESULT);
    module.set_var("SEND_INJECTION", VERDICT_SEND_INJECTION);
    module.set_var("IGNORE_RESULT", VERDICT_IGNORE_RESULT);
    module.set_var("RESPONSE_OK", RESPONSE_TYPE_OK);
    module.set_var("RESPONSE_RAW", RESPONSE_TYPE_RAW);
    module.set_var("RESPONSE_ERR", RESPONSE_TYPE_ERR);
    engine.register_static_module("proxy", module.into());
    engine
}

/// The context of hooks with nothing to show (connect_server,
/// disconnect_client).
pub fn empty_ctx() -> Map {
    Map::new()
}

/// The context every packet-carrying hook receives.
pub fn packet_ctx(packet: &[u8]) -> Map {
    let mut ctx = Map::new();
    ctx.insert("packet".into(), Dynamic::from_blob(packet.to_vec()));
    ctx
}

/// The context of `read_query_result`: the resolved injection plus its stats.
pub fn injection_ctx(injection: &Injection, response_status: Option<u8>) -> Map {
    let mut ctx = Map::new();
    ctx.insert("id".into(), Dynamic::from(injection.id));
    ctx.insert(
        "query".into(),
        Dynamic::from_blob(injection.query.to_vec()),
    );
    ctx.insert(
        "resultset_is_needed".into(),
        Dynamic::from(injection.resultset_is_needed),
    );
    ctx.insert("rows".into(), Dynamic::from(injection.rows as INT));
    ctx.insert("bytes".into(), Dynamic::from(injection.bytes as INT));
    let elapsed = match (
        injection.ts_first_result_packet,
        injection.ts_last_result_packet,
    ) {
        (Some(first), Some(last)) => last.duration_since(first),
        _ => Duration::from_micros(0),
    };
    ctx.insert(
        "query_time_us".into(),
        Dynamic::from(elapsed.as_micros() as INT),
    );
    if let Some(status) = response_status {
        ctx.insert("response_status".into(), Dynamic::from(status as INT));
    }
    ctx
}

fn parse_outcome(value: Dynamic) -> ScriptOutcome {
    if value.is_int() {
        let mut outcome = ScriptOutcome::no_decision();
        outcome.verdict = ScriptVerdict::from_int(value.as_int().unwrap_or(VERDICT_NO_DECISION));
        return outcome;
    }
    if value.is_unit() {
        return ScriptOutcome::no_decision();
    }
    let map = match value.try_cast::<Map>() {
        Some(map) => map,
        None => {
            warn!("script hook returned neither a verdict nor a map");
            return ScriptOutcome::no_decision();
        }
    };

    let mut outcome = ScriptOutcome::no_decision();
    if let Some(verdict) = map.get("verdict").and_then(|d| d.as_int().ok()) {
        outcome.verdict = ScriptVerdict::from_int(verdict);
    }
    if let Some(ndx) = map.get("backend_ndx").and_then(|d| d.as_int().ok()) {
        if ndx >= 0 {
            outcome.backend_ndx = Some(ndx as usize);
        }
    }
    if let Some(close) = map.get("connection_close").and_then(|d| d.as_bool().ok()) {
        outcome.connection_close = close;
    }
    if let Some(response) = map.get("response") {
        outcome.response = parse_response(response.clone());
    }
    if let Some(queries) = map.get("queries").cloned() {
        outcome.queries = parse_queries(queries);
    }
    outcome
}

fn parse_response(value: Dynamic) -> Option<ScriptResponse> {
    let map = value.try_cast::<Map>()?;
    let mut response = ScriptResponse::ok();
    match map.get("type") {
        Some(t) if t.is_int() => {
            response.response_type = match t.as_int().unwrap_or(RESPONSE_TYPE_OK) {
                RESPONSE_TYPE_ERR => ResponseType::Err,
                RESPONSE_TYPE_RAW => ResponseType::Raw,
                _ => ResponseType::Ok,
            };
        }
        Some(t) => {
            let name = t.clone().into_string().unwrap_or_default();
            response.response_type = match name.to_ascii_lowercase().as_str() {
                "err" | "error" => ResponseType::Err,
                "raw" => ResponseType::Raw,
                _ => ResponseType::Ok,
            };
        }
        None => {}
    }
    if let Some(msg) = map.get("errmsg") {
        response.error_message = msg.clone().into_string().unwrap_or_default();
    }
    if let Some(code) = map.get("errcode").and_then(|d| d.as_int().ok()) {
        response.error_code = code as u16;
    }
    if let Some(state) = map.get("sqlstate") {
        response.sql_state = state.clone().into_string().unwrap_or_default();
    }
    if let Some(rows) = map.get("affected_rows").and_then(|d| d.as_int().ok()) {
        response.affected_rows = rows as u64;
    }
    if let Some(id) = map.get("insert_id").and_then(|d| d.as_int().ok()) {
        response.insert_id = id as u64;
    }
    if let Some(columns) = map.get("columns").cloned().and_then(|d| d.try_cast::<Array>()) {
        response.columns = columns
            .into_iter()
            .filter_map(|c| c.into_string().ok())
            .collect();
    }
    if let Some(rows) = map.get("rows").cloned().and_then(|d| d.try_cast::<Array>()) {
        for row in rows {
            if let Some(cells) = row.try_cast::<Array>() {
                response.rows.push(
                    cells
                        .into_iter()
                        .map(|cell| {
                            if cell.is_unit() {
                                None
                            } else {
                                Some(cell.to_string())
                            }
                        })
                        .collect(),
                );
            }
        }
    }
    if let Some(packets) = map
        .get("packets")
        .cloned()
        .and_then(|d| d.try_cast::<Array>())
    {
        for chunk in packets {
            if let Some(blob) = as_bytes(chunk) {
                response.packets.push(blob);
            } else {
                // the iterator contract allows byte chunks only; poison the
                // stream so the driver can fail the connection
                response.packets.clear();
                response.response_type = ResponseType::Err;
                response.error_code = ER_UNKNOWN_ERROR;
                response.sql_state = SQLSTATE_GENERAL.to_string();
                response.error_message =
                    "response.packets must contain byte chunks".to_string();
                break;
            }
        }
    }
    Some(response)
}

fn parse_queries(value: Dynamic) -> Vec<ScriptQuery> {
    let array = match value.try_cast::<Array>() {
        Some(array) => array,
        None => return Vec::new(),
    };
    let mut queries = Vec::new();
    for (position, entry) in array.into_iter().enumerate() {
        let fallback_id = position as i64 + 1;
        if let Some(bytes) = as_bytes(entry.clone()) {
            queries.push(ScriptQuery {
                id: fallback_id,
                query: bytes,
                resultset_is_needed: false,
            });
            continue;
        }
        if let Some(map) = entry.try_cast::<Map>() {
            let query = map.get("query").cloned().and_then(as_bytes);
            if let Some(query) = query {
                queries.push(ScriptQuery {
                    id: map
                        .get("id")
                        .and_then(|d| d.as_int().ok())
                        .unwrap_or(fallback_id),
                    query,
                    resultset_is_needed: map
                        .get("resultset_is_needed")
                        .and_then(|d| d.as_bool().ok())
                        .unwrap_or(false),
                });
            } else {
                warn!("queries entry without a query field, skipping");
            }
        }
    }
    queries
}

fn as_bytes(value: Dynamic) -> Option<Vec<u8>> {
    if value.is_blob() {
        return value.try_cast::<Blob>();
    }
    value.into_string().ok().map(|s| s.into_bytes())
}

/// Turn a scripted response into client-ready frames, first sequence id
/// supplied by the caller.
pub fn materialize_response(response: &ScriptResponse, sequence_id: u8) -> Vec<Bytes> {
    match response.response_type {
        ResponseType::Ok => {
            let mut packet =
                MySQLOKPacket::new(sequence_id, response.affected_rows, response.insert_id);
            vec![encode_frame(&mut packet)]
        }
        ResponseType::Err => {
            let code = if response.error_code == 0 {
                ER_UNKNOWN_ERROR
            } else {
                response.error_code
            };
            let state = if response.sql_state.is_empty() {
                SQLSTATE_GENERAL
            } else {
                response.sql_state.as_str()
            };
            let mut packet =
                MySQLErrPacket::new(sequence_id, code, state, &response.error_message);
            vec![encode_frame(&mut packet)]
        }
        ResponseType::Raw => {
            if !response.packets.is_empty() {
                let mut frames = Vec::with_capacity(response.packets.len());
                let mut seq = sequence_id;
                for chunk in &response.packets {
                    frames.push(crate::protocol::database::mysql::codec::frame(chunk, seq));
                    seq = seq.wrapping_add(1);
                }
                frames
            } else {
                resultset_frames(&response.columns, &response.rows, sequence_id)
            }
        }
    }
}

/// A full text result set: field count, column definitions, EOF, rows, EOF.
pub fn resultset_frames(
    columns: &[String],
    rows: &[Vec<Option<String>>],
    sequence_id: u8,
) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut seq = sequence_id;

    let mut field_count = MySQLFieldCountPacket::new(seq, columns.len() as u64);
    frames.push(encode_frame(&mut field_count));

    for column in columns {
        seq = seq.wrapping_add(1);
        let mut definition = MySQLColumnDefinition41Packet::new(
            seq,
            column,
            MySQLColumnType::MysqlTypeVarString as u8,
        );
        frames.push(encode_frame(&mut definition));
    }

    seq = seq.wrapping_add(1);
    let mut eof = MySQLEOFPacket::new(seq);
    frames.push(encode_frame(&mut eof));

    for row in rows {
        seq = seq.wrapping_add(1);
        let data = row
            .iter()
            .map(|cell| cell.as_ref().map(|v| v.as_bytes().to_vec()))
            .collect();
        let mut packet = MySQLTextResultSetRowPacket::new(seq, data);
        frames.push(encode_frame(&mut packet));
    }

    seq = seq.wrapping_add(1);
    let mut eof = MySQLEOFPacket::new(seq);
    frames.push(encode_frame(&mut eof));

    frames
}

fn encode_frame<P: DatabasePacket<MySQLPacketPayload>>(packet: &mut P) -> Bytes {
    let mut payload = MySQLPacketPayload::new();
    packet.encode(&mut payload);
    payload.get_payload()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_host_has_no_hooks() {
        let host = ScriptHost::disabled();
        assert!(!host.loaded());
        let outcome = host.call_hook("read_query", packet_ctx(b"\x03SELECT 1")).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_missing_hook_is_none() {
        let host = ScriptHost::from_source("fn read_auth(ctx) { proxy::NO_DECISION }").unwrap();
        assert!(host
            .call_hook("read_query", packet_ctx(b"\x03SELECT 1"))
            .unwrap()
            .is_none());
        assert!(host
            .call_hook("read_auth", packet_ctx(b""))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_bare_verdict() {
        let host = ScriptHost::from_source("fn read_query(ctx) { proxy::SEND_QUERY }").unwrap();
        let outcome = host
            .call_hook("read_query", packet_ctx(b"\x03SELECT 1"))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.verdict, ScriptVerdict::SendQuery);
        assert!(outcome.queries.is_empty());
    }

    #[test]
    fn test_ok_response_outcome() {
        let host = ScriptHost::from_source(
            r#"
            fn read_query(ctx) {
                #{ verdict: proxy::SEND_RESULT,
                   response: #{ type: proxy::RESPONSE_OK, affected_rows: 3 } }
            }
            "#,
        )
        .unwrap();
        let outcome = host
            .call_hook("read_query", packet_ctx(b"\x03UPDATE t"))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.verdict, ScriptVerdict::SendResult);
        let response = outcome.response.unwrap();
        assert_eq!(response.response_type, ResponseType::Ok);
        assert_eq!(response.affected_rows, 3);
    }

    #[test]
    fn test_err_response_defaults() {
        let response = ScriptResponse {
            response_type: ResponseType::Err,
            error_message: "nope".to_string(),
            error_code: 0,
            sql_state: String::new(),
            affected_rows: 0,
            insert_id: 0,
            columns: Vec::new(),
            rows: Vec::new(),
            packets: Vec::new(),
        };
        let frames = materialize_response(&response, 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 1); // seq
        assert_eq!(frames[0][1], 0xff);
        assert_eq!(u16::from_le_bytes([frames[0][2], frames[0][3]]), ER_UNKNOWN_ERROR);
    }

    #[test]
    fn test_queries_list() {
        let host = ScriptHost::from_source(
            r#"
            fn read_query(ctx) {
                let original = ctx.packet;
                #{ verdict: proxy::SEND_QUERY,
                   queries: [
                     #{ id: 1, query: "\x03SELECT @@hostname", resultset_is_needed: false },
                     #{ id: 2, query: original, resultset_is_needed: true },
                   ] }
            }
            "#,
        )
        .unwrap();
        let outcome = host
            .call_hook("read_query", packet_ctx(b"\x03SELECT 1"))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.queries.len(), 2);
        assert_eq!(outcome.queries[0].id, 1);
        assert!(!outcome.queries[0].resultset_is_needed);
        assert_eq!(outcome.queries[1].query, b"\x03SELECT 1".to_vec());
        assert!(outcome.queries[1].resultset_is_needed);
    }

    #[test]
    fn test_script_error_surfaces() {
        let host =
            ScriptHost::from_source("fn read_query(ctx) { this_function_does_not_exist() }")
                .unwrap();
        assert!(host
            .call_hook("read_query", packet_ctx(b"\x03SELECT 1"))
            .is_err());
    }

    #[test]
    fn test_resultset_frames_shape() {
        let frames = resultset_frames(
            &["a".to_string(), "b".to_string()],
            &[vec![Some("1".to_string()), None]],
            1,
        );
        // field count, 2 column defs, EOF, 1 row, EOF
        assert_eq!(frames.len(), 6);
        let seqs: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(frames[0][1], 2); // two columns
        assert_eq!(frames[3][1], 0xfe); // first EOF
    }

    #[test]
    fn test_master_packets_outcome() {
        let host = ScriptHost::from_source(
            r#"
            fn read_query(ctx) {
                #{ verdict: proxy::SEND_RESULT,
                   response: #{ type: proxy::RESPONSE_RAW, packets: ["one", "two", "three"] } }
            }
            "#,
        )
        .unwrap();
        let outcome = host
            .call_hook("read_query", packet_ctx(b"\x12"))
            .unwrap()
            .unwrap();
        let response = outcome.response.unwrap();
        assert_eq!(response.response_type, ResponseType::Raw);
        assert_eq!(response.packets.len(), 3);
        assert_eq!(response.packets[1], b"two".to_vec());
    }
}
