use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio::sync::watch;

use bridge_common::common::Result;
use bridge_common::config::config::{listen_address, BridgeConfig};
use bridge_common::service::Service;

use crate::discovery::backend::BackendRegistry;
use crate::handler::database::mysql::{Connection, Personality};
use crate::script::ScriptHost;

/// The relaying listener: accepts clients and drives each one against the
/// backend registry.
pub struct ProxyService {
    config: Arc<BridgeConfig>,
    backends: Arc<BackendRegistry>,
    script: Arc<ScriptHost>,
    shutdown: watch::Receiver<bool>,
}

impl ProxyService {
    pub fn new(
        config: Arc<BridgeConfig>,
        backends: Arc<BackendRegistry>,
        script: Arc<ScriptHost>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ProxyService {
            config,
            backends,
            script,
            shutdown,
        }
    }
}

#[async_trait]
impl Service for ProxyService {
    async fn serve(&self) -> Result<()> {
        let addr = listen_address(&self.config.proxy.address);
        let listener = TcpListener::bind(&addr).await?;
        info!("proxy listening on {}", addr);
        accept_loop(
            listener,
            Personality::Proxy,
            self.config.clone(),
            self.backends.clone(),
            self.script.clone(),
            self.shutdown.clone(),
        )
        .await
    }
}

/// The self-answering listener: no backends, responses come from the script
/// or the built-in fallbacks.
pub struct MasterService {
    config: Arc<BridgeConfig>,
    backends: Arc<BackendRegistry>,
    script: Arc<ScriptHost>,
    shutdown: watch::Receiver<bool>,
}

impl MasterService {
    pub fn new(
        config: Arc<BridgeConfig>,
        script: Arc<ScriptHost>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        MasterService {
            config,
            backends: Arc::new(BackendRegistry::new()),
            script,
            shutdown,
        }
    }
}

#[async_trait]
impl Service for MasterService {
    async fn serve(&self) -> Result<()> {
        let addr = listen_address(&self.config.master.address);
        let listener = TcpListener::bind(&addr).await?;
        info!("master listening on {}", addr);
        accept_loop(
            listener,
            Personality::Master,
            self.config.clone(),
            self.backends.clone(),
            self.script.clone(),
            self.shutdown.clone(),
        )
        .await
    }
}

/// Accept until shutdown; every connection runs as its own task and stays
/// on the worker that polls it.
pub async fn accept_loop(
    listener: TcpListener,
    personality: Personality,
    config: Arc<BridgeConfig>,
    backends: Arc<BackendRegistry>,
    script: Arc<ScriptHost>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut shutdown_watch = shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown_watch.changed() => {
                info!("{:?} listener shutting down", personality);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("{:?} accepted {}", personality, peer);
                    let mut con = Connection::new(
                        personality,
                        socket,
                        config.clone(),
                        backends.clone(),
                        script.clone(),
                    );
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        con.run(shutdown).await;
                    });
                }
                Err(e) => error!("error accepting socket; error = {:?}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::watch;

    use bridge_common::config::config::BridgeConfig;

    use super::*;
    use crate::discovery::backend::BackendRegistry;
    use crate::protocol::database::mysql::auth::{scramble_password, verify_scramble};
    use crate::protocol::database::mysql::codec::Packet;
    use crate::protocol::database::mysql::constant::{
        MySQLCapabilityFlag, COM_CHANGE_USER, COM_QUERY, ER_ACCESS_DENIED_ERROR, PACKET_ERR,
        PACKET_OK,
    };
    use crate::protocol::database::mysql::packet::text::MySQLComChangeUserPacket;
    use crate::protocol::database::mysql::packet::{
        MySQLErrPacket, MySQLHandshakePacket, MySQLHandshakeResponse41Packet, MySQLOKPacket,
        MySQLPacketPayload,
    };
    use crate::protocol::database::DatabasePacket;
    use crate::script::resultset_frames;
    use crate::session::mysql::Endpoint;

    const BACKEND_PASSWORD: &str = "backend-pw";

    /// What the fake backend observed, for the assertions.
    #[derive(Default)]
    struct BackendLog {
        connections: AtomicUsize,
        queries: Mutex<Vec<String>>,
    }

    /// A minimal MySQL server: handshake, scramble check, canned result
    /// sets whose single row echoes the query text.
    async fn fake_backend(listener: TcpListener, log: Arc<BackendLog>) {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            log.connections.fetch_add(1, Ordering::SeqCst);
            let log = log.clone();
            tokio::spawn(async move {
                let mut endpoint = Endpoint::from_stream(socket);
                let mut challenge = MySQLHandshakePacket::new(99);
                // the bridge must scrub these before the client sees them
                challenge.capability_flags
                    .insert(MySQLCapabilityFlag::CLIENT_COMPRESS | MySQLCapabilityFlag::CLIENT_SSL);
                let scramble = challenge.scramble();
                endpoint.queue_packet(&mut challenge);
                endpoint.flush().await.unwrap();

                let auth_packet = match endpoint.read_packet().await.unwrap() {
                    Some(packet) => packet,
                    None => return,
                };
                let mut auth = MySQLHandshakeResponse41Packet::new();
                auth.decode(&mut MySQLPacketPayload::from_slice(&auth_packet.payload))
                    .unwrap();
                if verify_scramble(BACKEND_PASSWORD, &scramble, &auth.auth_response) {
                    let mut ok = MySQLOKPacket::new(auth_packet.sequence_id.wrapping_add(1), 0, 0);
                    endpoint.queue_packet(&mut ok);
                } else {
                    let mut err = MySQLErrPacket::new(
                        auth_packet.sequence_id.wrapping_add(1),
                        ER_ACCESS_DENIED_ERROR,
                        "28000",
                        "Access denied",
                    );
                    endpoint.queue_packet(&mut err);
                    endpoint.flush().await.unwrap();
                    return;
                }
                endpoint.flush().await.unwrap();

                loop {
                    let packet = match endpoint.read_packet().await {
                        Ok(Some(packet)) => packet,
                        _ => return,
                    };
                    match packet.payload.first().copied() {
                        Some(COM_QUERY) => {
                            let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                            log.queries.lock().unwrap().push(sql.clone());
                            for frame in resultset_frames(
                                &["echo".to_string()],
                                &[vec![Some(sql)]],
                                1,
                            ) {
                                endpoint.send_queue.append(frame);
                            }
                            endpoint.flush().await.unwrap();
                        }
                        Some(COM_CHANGE_USER) => {
                            let mut change = MySQLComChangeUserPacket::new("", b"", "");
                            change
                                .decode(&mut MySQLPacketPayload::from_slice(&packet.payload))
                                .unwrap();
                            log.queries
                                .lock()
                                .unwrap()
                                .push(format!("CHANGE_USER {}", change.username));
                            let mut ok = MySQLOKPacket::new(1, 0, 0);
                            endpoint.queue_packet(&mut ok);
                            endpoint.flush().await.unwrap();
                        }
                        _ => {
                            let mut ok = MySQLOKPacket::new(1, 0, 0);
                            endpoint.queue_packet(&mut ok);
                            endpoint.flush().await.unwrap();
                        }
                    }
                }
            });
        }
    }

    async fn start_backend(log: Arc<BackendLog>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_backend(listener, log));
        addr
    }

    async fn start_listener(
        personality: Personality,
        config: Arc<BridgeConfig>,
        backends: Arc<BackendRegistry>,
        script: Arc<ScriptHost>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx); // the tests never shut the listener down
        tokio::spawn(accept_loop(
            listener,
            personality,
            config,
            backends,
            script,
            rx,
        ));
        addr
    }

    fn proxy_config(backend_addr: SocketAddr) -> Arc<BridgeConfig> {
        let mut config = BridgeConfig::default();
        config.proxy.backend_addresses = vec![backend_addr.to_string()];
        Arc::new(config)
    }

    /// Drive the client half of the handshake + auth exchange.
    async fn authenticate(
        proxy_addr: SocketAddr,
        username: &str,
        password: &str,
        database: &str,
    ) -> (Endpoint, Packet) {
        let mut client = Endpoint::connect(&proxy_addr.to_string()).await.unwrap();
        let handshake_packet = client.read_packet().await.unwrap().unwrap();
        assert_eq!(handshake_packet.sequence_id, 0);

        let mut challenge = MySQLHandshakePacket::empty();
        challenge
            .decode(&mut MySQLPacketPayload::from_slice(&handshake_packet.payload))
            .unwrap();
        assert!(!challenge
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_COMPRESS));
        assert!(!challenge
            .capability_flags
            .contains(MySQLCapabilityFlag::CLIENT_SSL));

        let mut auth = MySQLHandshakeResponse41Packet::new();
        auth.sequence_id = 1;
        auth.capability_flags = MySQLCapabilityFlag::CLIENT_PROTOCOL_41
            | MySQLCapabilityFlag::CLIENT_SECURE_CONNECTION
            | MySQLCapabilityFlag::CLIENT_CONNECT_WITH_DB;
        auth.max_packet_size = 1 << 24;
        auth.character_set = 0x21;
        auth.username = username.to_string();
        auth.auth_response = scramble_password(password, &challenge.scramble());
        auth.database = database.to_string();
        client.queue_packet(&mut auth);
        client.flush().await.unwrap();

        let auth_result = client.read_packet().await.unwrap().unwrap();
        (client, auth_result)
    }

    async fn read_resultset(client: &mut Endpoint) -> Vec<Packet> {
        let mut frames = Vec::new();
        // field count, one column def, EOF, one row, EOF
        for _ in 0..5 {
            frames.push(client.read_packet().await.unwrap().unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_pass_through_select() {
        let log = Arc::new(BackendLog::default());
        let backend_addr = start_backend(log.clone()).await;
        let config = proxy_config(backend_addr);
        let backends = Arc::new(BackendRegistry::from_config(
            &config.proxy.backend_addresses,
            &[],
        ));
        let proxy_addr = start_listener(
            Personality::Proxy,
            config,
            backends.clone(),
            Arc::new(ScriptHost::disabled()),
        )
        .await;

        let (mut client, auth_result) =
            authenticate(proxy_addr, "u", BACKEND_PASSWORD, "db1").await;
        assert_eq!(auth_result.sequence_id, 2);
        assert_eq!(auth_result.status(), Some(PACKET_OK));

        client.queue(0, b"\x03SELECT 1");
        client.flush().await.unwrap();

        let frames = read_resultset(&mut client).await;
        let seqs: Vec<u8> = frames.iter().map(|f| f.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(frames[0].payload[0], 1); // one column
        assert_eq!(frames[4].payload[0], 0xfe); // terminating EOF
        let row = String::from_utf8_lossy(&frames[3].payload).to_string();
        assert!(row.contains("SELECT 1"));
        assert_eq!(backends.get(0).unwrap().connected_clients(), 1);
    }

    #[tokio::test]
    async fn test_wrong_password_yields_err_1045() {
        let log = Arc::new(BackendLog::default());
        let backend_addr = start_backend(log.clone()).await;
        let config = proxy_config(backend_addr);
        let backends = Arc::new(BackendRegistry::from_config(
            &config.proxy.backend_addresses,
            &[],
        ));
        let proxy_addr = start_listener(
            Personality::Proxy,
            config,
            backends,
            Arc::new(ScriptHost::disabled()),
        )
        .await;

        let (mut client, auth_result) =
            authenticate(proxy_addr, "u", "not-the-password", "db1").await;
        assert_eq!(auth_result.status(), Some(PACKET_ERR));
        let mut err = MySQLErrPacket::new(0, 0, "", "");
        err.decode(&mut MySQLPacketPayload::from_slice(&auth_result.payload))
            .unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");

        // the proxy closes the session after the failed auth
        assert!(client.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_script_synthesized_reply_skips_backend() {
        let log = Arc::new(BackendLog::default());
        let backend_addr = start_backend(log.clone()).await;
        let config = proxy_config(backend_addr);
        let backends = Arc::new(BackendRegistry::from_config(
            &config.proxy.backend_addresses,
            &[],
        ));
        let script = ScriptHost::from_source(
            r#"
            fn read_query(ctx) {
                #{ verdict: proxy::SEND_RESULT,
                   response: #{ type: proxy::RESPONSE_OK, affected_rows: 0 } }
            }
            "#,
        )
        .unwrap();
        let proxy_addr =
            start_listener(Personality::Proxy, config, backends, Arc::new(script)).await;

        let (mut client, auth_result) =
            authenticate(proxy_addr, "u", BACKEND_PASSWORD, "db1").await;
        assert_eq!(auth_result.status(), Some(PACKET_OK));

        client.queue(0, b"\x03SELECT 1");
        client.flush().await.unwrap();
        let reply = client.read_packet().await.unwrap().unwrap();
        assert_eq!(reply.sequence_id, 1);
        assert_eq!(reply.status(), Some(PACKET_OK));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // the backend authenticated the session but never saw the query
        assert!(log.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_reuse_with_change_user() {
        let log = Arc::new(BackendLog::default());
        let backend_addr = start_backend(log.clone()).await;
        let config = proxy_config(backend_addr);
        let backends = Arc::new(BackendRegistry::from_config(
            &config.proxy.backend_addresses,
            &[],
        ));
        let script = ScriptHost::from_source(
            r#"
            fn connect_server(ctx) { proxy::IGNORE_RESULT }
            fn disconnect_client(ctx) { proxy::IGNORE_RESULT }
            "#,
        )
        .unwrap();
        let proxy_addr = start_listener(
            Personality::Proxy,
            config,
            backends.clone(),
            Arc::new(script),
        )
        .await;

        // session A authenticates, quits cleanly, its backend gets pooled
        let (mut client_a, auth_result) =
            authenticate(proxy_addr, "u1", BACKEND_PASSWORD, "db1").await;
        assert_eq!(auth_result.status(), Some(PACKET_OK));
        client_a.queue(0, b"\x01"); // COM_QUIT
        client_a.flush().await.unwrap();
        drop(client_a);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backends.get(0).unwrap().pooled(), 1);

        // session B gets the pooled connection and a COM_CHANGE_USER re-auth
        let (mut client_b, auth_result) =
            authenticate(proxy_addr, "u2", BACKEND_PASSWORD, "db2").await;
        assert_eq!(auth_result.sequence_id, 2);
        assert_eq!(auth_result.status(), Some(PACKET_OK));

        client_b.queue(0, b"\x03SELECT 2");
        client_b.flush().await.unwrap();
        let frames = read_resultset(&mut client_b).await;
        let row = String::from_utf8_lossy(&frames[3].payload).to_string();
        assert!(row.contains("SELECT 2"));

        assert_eq!(log.connections.load(Ordering::SeqCst), 1);
        let queries = log.queries.lock().unwrap().clone();
        assert!(queries.contains(&"CHANGE_USER u2".to_string()));
    }

    #[tokio::test]
    async fn test_injection_forwards_only_the_marked_resultset() {
        let log = Arc::new(BackendLog::default());
        let backend_addr = start_backend(log.clone()).await;
        let config = proxy_config(backend_addr);
        let backends = Arc::new(BackendRegistry::from_config(
            &config.proxy.backend_addresses,
            &[],
        ));
        let script = ScriptHost::from_source(
            r#"
            fn read_query(ctx) {
                let original = ctx.packet;
                #{ verdict: proxy::SEND_QUERY,
                   queries: [
                     #{ id: 1, query: "\x03SELECT @@hostname", resultset_is_needed: false },
                     #{ id: 2, query: original, resultset_is_needed: true },
                   ] }
            }
            fn read_query_result(ctx) {
                if ctx.id == 1 { proxy::IGNORE_RESULT } else { proxy::NO_DECISION }
            }
            "#,
        )
        .unwrap();
        let proxy_addr =
            start_listener(Personality::Proxy, config, backends, Arc::new(script)).await;

        let (mut client, auth_result) =
            authenticate(proxy_addr, "u", BACKEND_PASSWORD, "db1").await;
        assert_eq!(auth_result.status(), Some(PACKET_OK));

        client.queue(0, b"\x03SELECT 1");
        client.flush().await.unwrap();

        // only the second (original) result set arrives
        let frames = read_resultset(&mut client).await;
        let row = String::from_utf8_lossy(&frames[3].payload).to_string();
        assert!(row.contains("SELECT 1"));
        assert!(!row.contains("@@hostname"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let queries = log.queries.lock().unwrap().clone();
        assert_eq!(
            queries,
            vec!["SELECT @@hostname".to_string(), "SELECT 1".to_string()]
        );

        // the connection is still usable for the next command
        client.queue(0, b"\x03SELECT 3");
        client.flush().await.unwrap();
        let frames = read_resultset(&mut client).await;
        let row = String::from_utf8_lossy(&frames[3].payload).to_string();
        assert!(row.contains("SELECT 3"));
    }

    #[tokio::test]
    async fn test_master_builtin_version_comment() {
        let config = Arc::new(BridgeConfig::default());
        let master_addr = start_listener(
            Personality::Master,
            config.clone(),
            Arc::new(BackendRegistry::new()),
            Arc::new(ScriptHost::disabled()),
        )
        .await;

        let (mut client, auth_result) = authenticate(
            master_addr,
            &config.master.username,
            &config.master.password,
            "",
        )
        .await;
        assert_eq!(auth_result.sequence_id, 2);
        assert_eq!(auth_result.status(), Some(PACKET_OK));

        client.queue(0, b"\x03select @@version_comment limit 1");
        client.flush().await.unwrap();
        let frames = read_resultset(&mut client).await;
        let seqs: Vec<u8> = frames.iter().map(|f| f.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        let row = String::from_utf8_lossy(&frames[3].payload).to_string();
        assert!(row.contains("SQLBridge"));
    }

    #[tokio::test]
    async fn test_master_rejects_wrong_password() {
        let config = Arc::new(BridgeConfig::default());
        let master_addr = start_listener(
            Personality::Master,
            config.clone(),
            Arc::new(BackendRegistry::new()),
            Arc::new(ScriptHost::disabled()),
        )
        .await;

        let (mut client, auth_result) =
            authenticate(master_addr, &config.master.username, "wrong", "").await;
        assert_eq!(auth_result.status(), Some(PACKET_ERR));
        let mut err = MySQLErrPacket::new(0, 0, "", "");
        err.decode(&mut MySQLPacketPayload::from_slice(&auth_result.payload))
            .unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert!(client.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_master_scripted_chunk_stream() {
        let config = Arc::new(BridgeConfig::default());
        let script = ScriptHost::from_source(
            r#"
            fn read_query(ctx) {
                #{ verdict: proxy::SEND_RESULT,
                   response: #{ type: proxy::RESPONSE_RAW,
                                packets: ["ev1", "ev22", "ev333"] } }
            }
            "#,
        )
        .unwrap();
        let master_addr = start_listener(
            Personality::Master,
            config.clone(),
            Arc::new(BackendRegistry::new()),
            Arc::new(script),
        )
        .await;

        let (mut client, auth_result) = authenticate(
            master_addr,
            &config.master.username,
            &config.master.password,
            "",
        )
        .await;
        assert_eq!(auth_result.status(), Some(PACKET_OK));

        // a binlog dump request answered from the scripted iterator
        client.queue(0, &[0x12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        client.flush().await.unwrap();

        let expected = [b"ev1".to_vec(), b"ev22".to_vec(), b"ev333".to_vec()];
        for (i, want) in expected.iter().enumerate() {
            let frame = client.read_packet().await.unwrap().unwrap();
            assert_eq!(frame.sequence_id, (i + 1) as u8);
            assert_eq!(&frame.payload[..], &want[..]);
        }

        // the stream ended, the master accepts the next command
        client.queue(0, &[0x12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        client.flush().await.unwrap();
        let frame = client.read_packet().await.unwrap().unwrap();
        assert_eq!(frame.sequence_id, 1);
        assert_eq!(&frame.payload[..], b"ev1");
    }
}
