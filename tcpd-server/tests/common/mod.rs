//! Shared utilities for server lifecycle tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcpd_server::{Handler, Server, ServerConfig, ServerError};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A running server bound to an ephemeral loopback port.
pub struct TestServer<H> {
    pub server: Arc<Server<H>>,
    pub addr: SocketAddr,
    pub serve: JoinHandle<Result<(), ServerError>>,
}

/// Binds an ephemeral port and runs `serve` on a background task.
pub async fn start<H>(config: ServerConfig, handler: H) -> TestServer<H>
where
    H: Handler<TcpStream>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(config, handler));
    let serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };
    TestServer {
        server,
        addr,
        serve,
    }
}

/// Default config for tests; the bind address is unused because tests pass
/// their own listener.
pub fn config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap())
}

/// Opens `n` client connections and waits until the server has registered all of them.
pub async fn connect_n<H>(test: &TestServer<H>, n: usize) -> Vec<TcpStream> {
    let mut clients = Vec::with_capacity(n);
    for _ in 0..n {
        clients.push(TcpStream::connect(test.addr).await.unwrap());
    }
    wait_for_count(&test.server, n).await;
    clients
}

/// Waits until the registry holds exactly `n` connections.
pub async fn wait_for_count<H>(server: &Server<H>, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.connection_count() != n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {} registered connection(s), have {}",
            n,
            server.connection_count()
        )
    });
}

/// Asserts the server side of `client` has been closed: reads hit EOF or a reset.
pub async fn assert_closed(client: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let result = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "connection was not closed by the server");
}
