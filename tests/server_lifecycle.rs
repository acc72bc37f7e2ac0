//! End-to-end tests against a server bound to an ephemeral local port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gecho::{Config, Server, ServerError, ServerState};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn test_config(idle_timeout: Duration) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        idle_timeout,
        ..Config::default()
    }
}

async fn start_server(
    idle_timeout: Duration,
) -> (Arc<Server>, JoinHandle<Result<(), ServerError>>, SocketAddr) {
    let server = Arc::new(Server::with_config(test_config(idle_timeout)));
    let handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    for _ in 0..200 {
        if let Some(addr) = server.local_addr() {
            return (server, handle, addr);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server did not start");
}

async fn wait_for_active(server: &Server, expected: u64) {
    for _ in 0..400 {
        if server.status().active_connections == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "active connections stuck at {}, expected {expected}",
        server.status().active_connections
    );
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Client {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).await.unwrap();
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for a line");
        line
    }

    /// Read until the server closes the connection and return what was left.
    async fn rest(&mut self) -> String {
        let mut rest = String::new();
        timeout(WAIT, self.reader.read_to_string(&mut rest))
            .await
            .expect("server did not close the connection")
            .unwrap();
        rest
    }
}

#[tokio::test]
async fn test_echo_and_quit() {
    let (server, handle, addr) = start_server(Duration::from_secs(60)).await;
    let mut client = Client::connect(addr).await;

    client.send("foo bar\n").await;
    assert_eq!(client.line().await, "ECHO [foo bar]\n");

    client.send("with crlf\r\n").await;
    assert_eq!(client.line().await, "ECHO [with crlf]\n");

    client.send("quit\n").await;
    assert_eq!(client.line().await, "Bye!\n");
    assert_eq!(client.rest().await, "");

    wait_for_active(&server, 0).await;
    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_help_lists_commands() {
    let (server, handle, addr) = start_server(Duration::from_secs(60)).await;
    let mut client = Client::connect(addr).await;

    client.send("help\n").await;
    let mut help = Vec::new();
    loop {
        let line = client.line().await;
        let done = line.starts_with("  <message>");
        help.push(line);
        if done {
            break;
        }
    }

    assert!(help.iter().any(|l| l == "Available commands:\n"));
    for command in ["help", "quit", "time", "status"] {
        assert!(help.iter().any(|l| l.starts_with(&format!("  {command} "))));
    }
    assert_eq!(help.last().unwrap(), "  <message>  - Echo back the message\n");

    drop(client);
    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_empty_lines_get_no_response() {
    let (server, handle, addr) = start_server(Duration::from_secs(60)).await;
    let mut client = Client::connect(addr).await;

    client.send("\n\r\n\n").await;
    client.send("after blanks\n").await;
    assert_eq!(client.line().await, "ECHO [after blanks]\n");

    drop(client);
    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_time_command() {
    let (server, handle, addr) = start_server(Duration::from_secs(60)).await;
    let mut client = Client::connect(addr).await;

    client.send("time\n").await;
    let line = client.line().await;
    assert!(line.starts_with("Current server time: "), "got {line:?}");

    drop(client);
    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_clients_are_counted() {
    const CLIENTS: u64 = 16;
    let (server, handle, addr) = start_server(Duration::from_secs(60)).await;

    let tasks: Vec<_> = (0..CLIENTS)
        .map(|i| {
            tokio::spawn(async move {
                let mut client = Client::connect(addr).await;
                client.send(&format!("hello from {i}\n")).await;
                assert_eq!(client.line().await, format!("ECHO [hello from {i}]\n"));

                client.send("status\n").await;
                let mut total = None;
                let mut active = None;
                loop {
                    let line = client.line().await;
                    if let Some(v) = line.strip_prefix("  Total connections:") {
                        total = Some(v.trim().parse::<u64>().unwrap());
                    }
                    if let Some(v) = line.strip_prefix("  Active connections:") {
                        active = Some(v.trim().parse::<u64>().unwrap());
                        break;
                    }
                }
                let (total, active) = (total.unwrap(), active.unwrap());
                assert!(active >= 1);
                assert!(active <= total);
                assert!(total <= CLIENTS);

                client.send("quit\n").await;
                assert_eq!(client.line().await, "Bye!\n");
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    wait_for_active(&server, 0).await;
    let status = server.status();
    assert_eq!(status.total_connections, CLIENTS);
    assert_eq!(status.active_connections, 0);

    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_client_is_disconnected() {
    let (server, handle, addr) = start_server(Duration::from_millis(200)).await;
    let mut client = Client::connect(addr).await;

    client.send("ping\n").await;
    assert_eq!(client.line().await, "ECHO [ping]\n");

    // Send nothing; the server should hang up on its own.
    assert_eq!(client.rest().await, "");
    wait_for_active(&server, 0).await;
    assert_eq!(server.status().total_connections, 1);

    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_active_sessions() {
    const CLIENTS: usize = 3;
    let (server, handle, addr) = start_server(Duration::from_secs(60)).await;

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let mut client = Client::connect(addr).await;
        client.send("hi\n").await;
        assert_eq!(client.line().await, "ECHO [hi]\n");
        clients.push(client);
    }
    wait_for_active(&server, CLIENTS as u64).await;

    let stopping = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.stop().await })
    };

    // The accept loop exits, but stop() keeps waiting on the open sessions.
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopping.is_finished());
    assert_eq!(server.state(), ServerState::Stopping);

    // Existing sessions keep working while the server drains.
    clients[0].send("still here\n").await;
    assert_eq!(clients[0].line().await, "ECHO [still here]\n");

    // New connections are refused once the listener is closed.
    assert!(TcpStream::connect(addr).await.is_err());

    for mut client in clients {
        client.send("quit\n").await;
        assert_eq!(client.line().await, "Bye!\n");
    }

    timeout(WAIT, stopping).await.unwrap().unwrap().unwrap();
    assert_eq!(server.status().active_connections, 0);
    assert_eq!(server.status().total_connections, CLIENTS as u64);

    // Already stopped: further calls return immediately.
    server.stop().await.unwrap();
}
