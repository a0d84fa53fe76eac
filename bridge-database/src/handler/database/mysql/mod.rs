use std::sync::Arc;

use log::{debug, error};
use tokio::net::TcpStream;
use tokio::sync::watch;

use bridge_common::common::Result;
use bridge_common::config::config::BridgeConfig;

use crate::discovery::backend::BackendRegistry;
use crate::pool::mysql::return_endpoint;
use crate::protocol::database::mysql::constant::{
    COM_BINLOG_DUMP, ER_UNKNOWN_ERROR, SQLSTATE_GENERAL,
};
use crate::protocol::database::mysql::packet::text::QueryResultReader;
use crate::protocol::database::mysql::packet::MySQLErrPacket;
use crate::script::ScriptHost;
use crate::session::mysql::{
    next_connection_id, CommandParse, ConnectionState, Endpoint, ScriptConState,
};

pub mod master;
pub mod proxy;

/// Which handler set drives the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    Proxy,
    Master,
}

/// One client session: its endpoints, the state machine position, the parse
/// scratch for the command in flight and the script-owned state.
pub struct Connection {
    pub id: u64,
    pub personality: Personality,
    pub state: ConnectionState,
    pub client: Endpoint,
    pub server: Option<Endpoint>,
    pub backend_ndx: Option<usize>,
    pub parse: CommandParse,
    pub st: ScriptConState,
    pub config: Arc<BridgeConfig>,
    pub backends: Arc<BackendRegistry>,
    pub script: Arc<ScriptHost>,
    cleaned_up: bool,
}

impl Connection {
    pub fn new(
        personality: Personality,
        socket: TcpStream,
        config: Arc<BridgeConfig>,
        backends: Arc<BackendRegistry>,
        script: Arc<ScriptHost>,
    ) -> Self {
        let state = match personality {
            Personality::Proxy => ConnectionState::ConnectServer,
            Personality::Master => ConnectionState::SendHandshake,
        };
        Connection {
            id: next_connection_id(),
            personality,
            state,
            client: Endpoint::from_stream(socket),
            server: None,
            backend_ndx: None,
            parse: CommandParse::new(),
            st: ScriptConState::new(),
            config,
            backends,
            script,
            cleaned_up: false,
        }
    }

    /// Drive the state machine until the session ends or shutdown is
    /// signalled, then run the cleanup path exactly once.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        if self.personality == Personality::Master {
            master::con_init(self);
        }
        loop {
            if *shutdown.borrow() {
                debug!("con {}: shutting down in {:?}", self.id, self.state);
                break;
            }
            if matches!(
                self.state,
                ConnectionState::CloseClient | ConnectionState::Error
            ) {
                break;
            }
            let stepped = tokio::select! {
                _ = shutdown.changed() => break,
                stepped = self.step() => stepped,
            };
            if let Err(e) = stepped {
                error!("con {}: {} in {:?}", self.id, e, self.state);
                self.state = ConnectionState::Error;
                break;
            }
        }
        self.cleanup().await;
    }

    /// One transition: do the I/O the current state implies, let the
    /// personality's handler decide, move to the state it assigned.
    async fn step(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::ConnectServer => proxy::connect_server(self).await,
            ConnectionState::ReadHandshake => proxy::read_handshake(self).await,
            ConnectionState::SendHandshake => {
                self.client.flush().await?;
                self.state = if self.st.connection_close {
                    ConnectionState::CloseClient
                } else {
                    ConnectionState::ReadAuth
                };
                Ok(())
            }
            ConnectionState::ReadAuth => match self.personality {
                Personality::Proxy => proxy::read_auth(self).await,
                Personality::Master => master::read_auth(self).await,
            },
            ConnectionState::SendAuth => {
                if let Some(server) = self.server.as_mut() {
                    server.flush().await?;
                }
                self.state = ConnectionState::ReadAuthResult;
                Ok(())
            }
            ConnectionState::ReadAuthResult => proxy::read_auth_result(self).await,
            ConnectionState::SendAuthResult => {
                self.client.flush().await?;
                self.state = if self.parse.auth_failed {
                    ConnectionState::CloseClient
                } else {
                    ConnectionState::ReadQuery
                };
                Ok(())
            }
            ConnectionState::ReadQuery => match self.personality {
                Personality::Proxy => proxy::read_query(self).await,
                Personality::Master => master::read_query(self).await,
            },
            ConnectionState::SendQuery => {
                if let Some(server) = self.server.as_mut() {
                    server.flush().await?;
                }
                self.parse.reader = Some(QueryResultReader::new(self.parse.command));
                self.state = ConnectionState::ReadQueryResult;
                Ok(())
            }
            ConnectionState::ReadQueryResult => match self.personality {
                Personality::Proxy => proxy::read_query_result(self).await,
                // aliased to the chunk iterator for the master personality
                Personality::Master => {
                    master::emit_next_chunk(self);
                    Ok(())
                }
            },
            ConnectionState::SendQueryResult => {
                self.client.flush().await?;
                match self.personality {
                    Personality::Proxy => proxy::send_query_result(self),
                    Personality::Master => master::emit_next_chunk(self),
                }
                Ok(())
            }
            ConnectionState::ReadLoadDataFile => proxy::read_load_data_file(self).await,
            ConnectionState::SendError => {
                self.client.flush().await?;
                self.state = ConnectionState::CloseClient;
                Ok(())
            }
            ConnectionState::CloseClient | ConnectionState::Error => Ok(()),
        }
    }

    /// Queue an ERR packet for the client without touching the state.
    pub fn queue_error_to_client(
        &mut self,
        sequence_id: u8,
        error_code: u16,
        sql_state: &str,
        message: &str,
    ) {
        let mut err = MySQLErrPacket::new(sequence_id, error_code, sql_state, message);
        self.client.queue_packet(&mut err);
    }

    /// Queue a generic ERR and head for SEND_ERROR -> CLOSE_CLIENT.
    pub fn fail_with_error(&mut self, sequence_id: u8, message: &str) {
        self.queue_error_to_client(sequence_id, ER_UNKNOWN_ERROR, SQLSTATE_GENERAL, message);
        self.state = ConnectionState::SendError;
    }

    /// Whether the command in flight streams without an end packet.
    pub fn streaming_binlog(&self) -> bool {
        self.parse.command == COM_BINLOG_DUMP
    }

    /// Tear the session down: flush what the client can still get, let the
    /// personality release or pool the backend half. Safe to call twice.
    async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        let _ = self.client.flush().await;
        match self.personality {
            Personality::Proxy => proxy::disconnect_client(self).await,
            Personality::Master => master::disconnect_client(self),
        }
        debug!("con {}: closed", self.id);
    }

    /// Detach the backend endpoint and release its registry accounting;
    /// `keep` parks it in the pool when the endpoint is clean.
    pub(crate) fn release_backend(&mut self, keep: bool) {
        let endpoint = match self.server.take() {
            Some(endpoint) => endpoint,
            None => return,
        };
        let backend = match self.backend_ndx.and_then(|ndx| self.backends.get(ndx)) {
            Some(backend) => backend,
            None => return,
        };
        if keep {
            match return_endpoint(backend, endpoint) {
                Ok(()) => return,
                Err(_dirty) => backend.client_disconnected(),
            }
        } else {
            backend.client_disconnected();
        }
    }
}
