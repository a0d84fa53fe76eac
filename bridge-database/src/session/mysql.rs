use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use tokio::net::TcpStream;

use bridge_common::common::{Error, Result};
use bridge_common::service::io::Channel;

use crate::protocol::database::mysql::codec::{frame, MySQLCodec, Packet};
use crate::protocol::database::mysql::packet::text::QueryResultReader;
use crate::protocol::database::mysql::packet::{
    MySQLHandshakePacket, MySQLHandshakeResponse41Packet, MySQLPacket, MySQLPacketPayload,
};
use crate::protocol::database::{DatabasePacket, PacketPayload};

lazy_static! {
    static ref CONNECTION_ID_GENERATOR: AtomicU64 = AtomicU64::new(1);
}

pub fn next_connection_id() -> u64 {
    CONNECTION_ID_GENERATOR.fetch_add(1, Ordering::SeqCst)
}

/// Ordered frames waiting to be written to one socket. Frames are stored in
/// the write form of the codec, sequence byte first.
#[derive(Debug)]
pub struct PacketQueue {
    chunks: VecDeque<Bytes>,
    next_seq: u8,
}

impl PacketQueue {
    pub fn new() -> Self {
        PacketQueue {
            chunks: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Append an already framed `[seq][payload]` chunk.
    pub fn append(&mut self, chunk: Bytes) {
        if let Some(seq) = chunk.first() {
            self.next_seq = seq.wrapping_add(1);
        }
        self.chunks.push_back(chunk);
    }

    /// Frame a payload with an explicit sequence id and append it.
    pub fn append_packet(&mut self, sequence_id: u8, payload: &[u8]) {
        self.append(frame(payload, sequence_id));
    }

    /// Restart the auto numbering; the next appended payload gets `first`.
    pub fn reset_seq(&mut self, first: u8) {
        self.next_seq = first;
    }

    /// Frame a payload with the next sequence id in line.
    pub fn append_auto(&mut self, payload: &[u8]) {
        let seq = self.next_seq;
        self.append_packet(seq, payload);
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.chunks.pop_front()
    }

    pub fn peek_tail(&self) -> Option<&Bytes> {
        self.chunks.back()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn drain(&mut self) -> Vec<Bytes> {
        self.chunks.drain(..).collect()
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One side of a session: a framed socket plus the protocol metadata the
/// state machine needs to keep about it. The codec's internal buffer plays
/// the role of the receive queue; partial frames never surface.
#[derive(Debug)]
pub struct Endpoint {
    channel: Channel,
    pub addr: String,
    pub send_queue: PacketQueue,
    pub last_seq: u8,
    /// The handshake the server side of this socket sent, kept for pool
    /// replay and scramble checks.
    pub challenge: Option<MySQLHandshakePacket>,
    /// The auth packet the client side of this socket sent, kept for pool
    /// credential matching.
    pub response: Option<MySQLHandshakeResponse41Packet>,
    pub is_authed: bool,
    pub default_db: String,
}

impl Endpoint {
    pub fn from_stream(socket: TcpStream) -> Self {
        let addr = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Endpoint {
            channel: Channel::new(socket, MySQLCodec {}),
            addr,
            send_queue: PacketQueue::new(),
            last_seq: 0,
            challenge: None,
            response: None,
            is_authed: false,
            default_db: String::new(),
        }
    }

    pub async fn connect(addr: &str) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(socket))
    }

    /// Await the next complete packet. `Ok(None)` means the peer closed.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        match self.channel.recv().await {
            Some(Ok(chunk)) => {
                let packet = Packet::parse(chunk);
                self.last_seq = packet.sequence_id;
                Ok(Some(packet))
            }
            Some(Err(e)) => Err(Error::Io(e)),
            None => Ok(None),
        }
    }

    /// Frame and queue one packet body.
    pub fn queue(&mut self, sequence_id: u8, payload: &[u8]) {
        self.send_queue.append_packet(sequence_id, payload);
    }

    /// Queue a structured packet; its encode writes the sequence byte.
    pub fn queue_packet<P>(&mut self, packet: &mut P)
    where
        P: DatabasePacket<MySQLPacketPayload> + MySQLPacket,
    {
        let mut payload = MySQLPacketPayload::new();
        packet.encode(&mut payload);
        self.send_queue.append(payload.get_payload());
    }

    /// Write out everything queued, in order.
    pub async fn flush(&mut self) -> Result<()> {
        let chunks = self.send_queue.drain();
        if chunks.is_empty() {
            return Ok(());
        }
        self.channel.send(chunks).await.map_err(Error::Io)
    }

    /// A pooled endpoint must be silent. Anything readable on it (stray
    /// server traffic or EOF) marks it broken.
    pub fn is_stale(&mut self) -> bool {
        self.channel.recv().now_or_never().is_some()
    }

    /// Cached username of the session authenticated on this socket.
    pub fn username(&self) -> Option<&str> {
        self.response.as_ref().map(|r| r.username.as_str())
    }
}

/// States of the per-connection protocol machine. READ_* states await a
/// packet from the named side, SEND_* states drain a send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ConnectServer,
    ReadHandshake,
    SendHandshake,
    ReadAuth,
    SendAuth,
    ReadAuthResult,
    SendAuthResult,
    ReadQuery,
    SendQuery,
    ReadQueryResult,
    SendQueryResult,
    /// Relaying a LOAD DATA LOCAL file from the client to the backend.
    ReadLoadDataFile,
    SendError,
    CloseClient,
    Error,
}

/// Scratch the driver keeps about the command in flight.
pub struct CommandParse {
    pub command: u8,
    /// Sequence id the client sent the command with; replies start one past it.
    pub query_seq: u8,
    pub reader: Option<QueryResultReader>,
    pub auth_failed: bool,
}

impl CommandParse {
    pub fn new() -> Self {
        CommandParse {
            command: 0,
            query_seq: 0,
            reader: None,
            auth_failed: false,
        }
    }
}

impl Default for CommandParse {
    fn default() -> Self {
        Self::new()
    }
}

/// A script-originated query executed on the backend, with the bookkeeping
/// the script is handed once the result is in.
pub struct Injection {
    pub id: i64,
    /// Full command payload, command byte included.
    pub query: Bytes,
    /// Whether the script wants this result forwarded to the client.
    pub resultset_is_needed: bool,
    pub ts_first_result_packet: Option<Instant>,
    pub ts_last_result_packet: Option<Instant>,
    pub rows: u64,
    pub bytes: u64,
}

impl Injection {
    pub fn new(id: i64, query: Bytes, resultset_is_needed: bool) -> Self {
        Injection {
            id,
            query,
            resultset_is_needed,
            ts_first_result_packet: None,
            ts_last_result_packet: None,
            rows: 0,
            bytes: 0,
        }
    }
}

/// Aggregate stats of the last finished query on this connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStat {
    pub rows: u64,
    pub bytes: u64,
}

/// The per-connection state the script layer owns.
pub struct ScriptConState {
    pub injections: VecDeque<Injection>,
    /// Result sets already forwarded to the client for the current command.
    /// The client must see at most one.
    pub sent_resultset: u32,
    pub connection_close: bool,
    /// Backend index the script picked, overriding the selection policy.
    pub backend_ndx: Option<usize>,
    /// Pending synthesized chunks of a master response.
    pub response_chunks: VecDeque<Vec<u8>>,
    pub qstat: QueryStat,
}

impl ScriptConState {
    pub fn new() -> Self {
        ScriptConState {
            injections: VecDeque::new(),
            sent_resultset: 0,
            connection_close: false,
            backend_ndx: None,
            response_chunks: VecDeque::new(),
            qstat: QueryStat::default(),
        }
    }
}

impl Default for ScriptConState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_order_and_framing() {
        let mut queue = PacketQueue::new();
        queue.append_packet(0, b"\x03one");
        queue.append_packet(1, b"\x03two");
        assert_eq!(queue.len(), 2);
        assert_eq!(&queue.peek_tail().unwrap()[..], b"\x01\x03two");
        assert_eq!(&queue.pop_front().unwrap()[..], b"\x00\x03one");
        assert_eq!(&queue.pop_front().unwrap()[..], b"\x01\x03two");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_queue_auto_numbering() {
        let mut queue = PacketQueue::new();
        queue.reset_seq(1);
        queue.append_auto(b"a");
        queue.append_auto(b"b");
        queue.append_auto(b"c");
        let frames = queue.drain();
        let seqs: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_queue_auto_numbering_follows_explicit_append() {
        let mut queue = PacketQueue::new();
        queue.append_packet(4, b"x");
        queue.append_auto(b"y");
        let frames = queue.drain();
        assert_eq!(frames[1][0], 5);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }

    #[test]
    fn test_injection_defaults() {
        let injection = Injection::new(7, Bytes::from_static(b"\x03SELECT 1"), true);
        assert_eq!(injection.id, 7);
        assert!(injection.ts_first_result_packet.is_none());
        assert_eq!(injection.rows, 0);
    }
}
