use log::{debug, warn};

use crate::discovery::backend::Backend;
use crate::session::mysql::Endpoint;

/// The per-backend pool of idle authenticated connections.
///
/// An endpoint lives in exactly one place at a time: attached to a session,
/// parked here, or destroyed. Returning moves the endpoint into the pool, so
/// a second return of the same endpoint cannot be expressed. The
/// `connected_clients` counter of a backend includes its pooled endpoints;
/// neither a return nor a take changes it, only creation and destruction do.

/// Park an idle endpoint for reuse. Rejected (handed back) unless the last
/// exchange ended cleanly: authenticated, both cached auth artifacts
/// present, and nothing left queued.
pub fn return_endpoint(
    backend: &Backend,
    endpoint: Endpoint,
) -> std::result::Result<(), Endpoint> {
    if !endpoint.is_authed
        || endpoint.challenge.is_none()
        || endpoint.response.is_none()
        || !endpoint.send_queue.is_empty()
    {
        warn!(
            "refusing to pool a dirty backend connection to {}",
            endpoint.addr
        );
        return Err(endpoint);
    }
    debug!(
        "pooling idle connection to {} (user {:?}, db {:?})",
        endpoint.addr,
        endpoint.username(),
        endpoint.default_db
    );
    backend.pool.lock().unwrap().push(endpoint);
    Ok(())
}

/// Take back the most recently parked endpoint. With `credentials` the
/// endpoint must match (user, default-db); without, any endpoint serves,
/// the re-authentication at READ_AUTH scrubs it. Endpoints that turned
/// readable or closed while parked are broken; they are destroyed on the
/// way and their client slot released.
pub fn take_endpoint(
    backend: &Backend,
    credentials: Option<(&str, &str)>,
) -> Option<Endpoint> {
    let mut pool = backend.pool.lock().unwrap();
    let mut stale: u32 = 0;
    let mut taken = None;
    // LIFO: scan from the most recently returned
    while let Some(position) = pool.iter().rposition(|e| match credentials {
        Some((username, default_db)) => {
            e.username() == Some(username) && e.default_db == default_db
        }
        None => true,
    }) {
        let mut endpoint = pool.remove(position);
        if endpoint.is_stale() {
            stale += 1;
            continue;
        }
        taken = Some(endpoint);
        break;
    }
    drop(pool);
    for _ in 0..stale {
        backend.client_disconnected();
    }
    if stale > 0 {
        debug!("dropped {} stale pooled connection(s) to {}", stale, backend.addr);
    }
    taken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::backend::BackendType;
    use crate::protocol::database::mysql::packet::{
        MySQLHandshakePacket, MySQLHandshakeResponse41Packet,
    };
    use crate::session::mysql::Endpoint;
    use tokio::net::{TcpListener, TcpStream};

    async fn endpoint_pair() -> (Endpoint, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Endpoint::from_stream(client), server)
    }

    fn authed(mut endpoint: Endpoint, username: &str, default_db: &str) -> Endpoint {
        let mut response = MySQLHandshakeResponse41Packet::new();
        response.username = username.to_string();
        response.database = default_db.to_string();
        endpoint.response = Some(response);
        endpoint.challenge = Some(MySQLHandshakePacket::new(1));
        endpoint.is_authed = true;
        endpoint.default_db = default_db.to_string();
        endpoint
    }

    #[tokio::test]
    async fn test_return_and_take() {
        let backend = Backend::new("127.0.0.1:3306", BackendType::ReadWrite);
        let (endpoint, _peer) = endpoint_pair().await;
        let endpoint = authed(endpoint, "u1", "db1");
        backend.client_connected();

        return_endpoint(&backend, endpoint).unwrap();
        assert_eq!(backend.pooled(), 1);
        assert_eq!(backend.connected_clients(), 1);

        let taken = take_endpoint(&backend, Some(("u1", "db1")));
        assert!(taken.is_some());
        assert_eq!(backend.pooled(), 0);
        assert_eq!(backend.connected_clients(), 1);
    }

    #[tokio::test]
    async fn test_take_honors_credentials() {
        let backend = Backend::new("127.0.0.1:3306", BackendType::ReadWrite);
        let (endpoint, _peer) = endpoint_pair().await;
        let endpoint = authed(endpoint, "u1", "db1");
        return_endpoint(&backend, endpoint).unwrap();

        assert!(take_endpoint(&backend, Some(("u2", "db1"))).is_none());
        assert!(take_endpoint(&backend, Some(("u1", "db2"))).is_none());
        assert!(take_endpoint(&backend, Some(("u1", "db1"))).is_some());
        let (extra, _peer2) = endpoint_pair().await;
        let extra = authed(extra, "u9", "db9");
        return_endpoint(&backend, extra).unwrap();
        assert!(take_endpoint(&backend, None).is_some());
    }

    #[tokio::test]
    async fn test_return_rejects_unauthenticated() {
        let backend = Backend::new("127.0.0.1:3306", BackendType::ReadWrite);
        let (endpoint, _peer) = endpoint_pair().await;
        assert!(return_endpoint(&backend, endpoint).is_err());
        assert_eq!(backend.pooled(), 0);
    }

    #[tokio::test]
    async fn test_take_drops_closed_endpoint() {
        let backend = Backend::new("127.0.0.1:3306", BackendType::ReadWrite);
        let (endpoint, peer) = endpoint_pair().await;
        let endpoint = authed(endpoint, "u1", "db1");
        backend.client_connected();
        return_endpoint(&backend, endpoint).unwrap();

        drop(peer); // peer closes while the endpoint is parked
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(take_endpoint(&backend, Some(("u1", "db1"))).is_none());
        assert_eq!(backend.pooled(), 0);
        assert_eq!(backend.connected_clients(), 0);
    }
}
