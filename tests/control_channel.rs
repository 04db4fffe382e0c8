//! Control-channel integration tests: framing, authentication, dispatch,
//! and persistence across restart, all over real sockets and a temp-file
//! state device.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use snigate::codec::{self, Command, Reply};
use snigate::control::{read_frame, run_control_listener, seal, write_frame};
use snigate::state::SharedState;

const KEY: &[u8] = b"test-control-key";

struct ControlServer {
    addr: SocketAddr,
    device_path: PathBuf,
    _dir: TempDir,
}

impl ControlServer {
    async fn spawn() -> Self {
        let dir = TempDir::new().unwrap();
        let device_path = dir.path().join("state.img");
        let server = Self::spawn_on(&device_path, dir).await;
        server
    }

    async fn spawn_on(device_path: &Path, dir: TempDir) -> Self {
        let state = Arc::new(SharedState::load(device_path).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(run_control_listener(
            listener,
            Arc::new(KEY.to_vec()),
            state,
        ));

        Self {
            addr,
            device_path: device_path.to_path_buf(),
            _dir: dir,
        }
    }

    /// Simulate a process restart: a new state handle over the same device
    /// and a fresh listener.
    async fn restart(self) -> Self {
        let device_path = self.device_path.clone();
        Self::spawn_on(&device_path, self._dir).await
    }
}

async fn roundtrip_raw(addr: SocketAddr, payload: &[u8]) -> Option<Reply> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, payload).await.unwrap();
    let reply_bytes = read_frame(&mut stream).await?;
    Some(codec::reply_of_bytes(&reply_bytes).unwrap())
}

async fn send(addr: SocketAddr, cmd: &Command) -> Reply {
    let message = codec::cmd_to_bytes(cmd).unwrap();
    roundtrip_raw(addr, &seal(KEY, &message))
        .await
        .expect("server closed without reply")
}

fn add(sni: &str, host: &str, port: u16) -> Command {
    Command::Add {
        sni: sni.to_string(),
        host: host.parse().unwrap(),
        port,
    }
}

#[tokio::test]
async fn test_add_then_list() {
    let server = ControlServer::spawn().await;

    let reply = send(server.addr, &add("a.example", "10.0.0.1", 4443)).await;
    assert_eq!(
        reply,
        Reply::Result {
            code: 0,
            message: "a.example was successfully added".to_string()
        }
    );

    match send(server.addr, &Command::List).await {
        Reply::Snis { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].sni, "a.example");
            assert_eq!(entries[0].port, 4443);
        }
        other => panic!("expected Snis, got {:?}", other),
    }
}

#[tokio::test]
async fn test_remove() {
    let server = ControlServer::spawn().await;

    send(server.addr, &add("a.example", "10.0.0.1", 4443)).await;
    let reply = send(
        server.addr,
        &Command::Remove {
            sni: "a.example".to_string(),
        },
    )
    .await;
    assert_eq!(
        reply,
        Reply::Result {
            code: 0,
            message: "a.example was successfully removed".to_string()
        }
    );

    match send(server.addr, &Command::List).await {
        Reply::Snis { entries } => assert!(entries.is_empty()),
        other => panic!("expected Snis, got {:?}", other),
    }
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let server = ControlServer::spawn().await;
    send(server.addr, &add("b.example", "10.0.0.2", 4443)).await;

    let server = server.restart().await;

    match send(server.addr, &Command::List).await {
        Reply::Snis { entries } => {
            assert!(entries.iter().any(|e| e.sni == "b.example"));
        }
        other => panic!("expected Snis, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bad_hmac_rejected_without_state_change() {
    let server = ControlServer::spawn().await;

    // All-zero MAC over a valid List command.
    let message = codec::cmd_to_bytes(&add("evil.example", "10.0.0.66", 6666)).unwrap();
    let mut payload = vec![0u8; 32];
    payload.extend_from_slice(&message);

    let reply = roundtrip_raw(server.addr, &payload).await.unwrap();
    assert_eq!(
        reply,
        Reply::Result {
            code: 3,
            message: "authentication failure".to_string()
        }
    );

    // No state change observed.
    match send(server.addr, &Command::List).await {
        Reply::Snis { entries } => assert!(entries.is_empty()),
        other => panic!("expected Snis, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wrong_key_rejected() {
    let server = ControlServer::spawn().await;

    let message = codec::cmd_to_bytes(&Command::List).unwrap();
    let payload = seal(b"some-other-key", &message);

    let reply = roundtrip_raw(server.addr, &payload).await.unwrap();
    assert_eq!(
        reply,
        Reply::Result {
            code: 3,
            message: "authentication failure".to_string()
        }
    );
}

#[tokio::test]
async fn test_decode_failure_after_auth() {
    let server = ControlServer::spawn().await;

    let reply = roundtrip_raw(server.addr, &seal(KEY, b"not a command"))
        .await
        .unwrap();
    match reply {
        Reply::Result { code, .. } => assert_eq!(code, 2),
        other => panic!("expected Result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_truncated_frame_closed_without_reply() {
    let server = ControlServer::spawn().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    // Announce 100 bytes, deliver 10, then close our write side.
    stream.write_all(&100u64.to_be_bytes()).await.unwrap();
    stream.write_all(&[0u8; 10]).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(read_frame(&mut stream).await.is_none());

    // The server is still serving.
    match send(server.addr, &Command::List).await {
        Reply::Snis { .. } => {}
        other => panic!("expected Snis, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_adds_all_land() {
    let server = ControlServer::spawn().await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let addr = server.addr;
        handles.push(tokio::spawn(async move {
            let cmd = add(&format!("host{}.example", i), "10.0.0.1", 4000 + i as u16);
            send(addr, &cmd).await
        }));
    }
    for handle in handles {
        match handle.await.unwrap() {
            Reply::Result { code: 0, .. } => {}
            other => panic!("add failed: {:?}", other),
        }
    }

    match send(server.addr, &Command::List).await {
        Reply::Snis { entries } => {
            assert_eq!(entries.len(), 8);
            for i in 0..8 {
                assert!(entries.iter().any(|e| e.sni == format!("host{}.example", i)));
            }
        }
        other => panic!("expected Snis, got {:?}", other),
    }
}
