//! Scripted monitor peer and stub hypervisor used by the tests.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::qmp::QmpClient;

pub(crate) const GREETING: &str =
    r#"{"QMP":{"version":{"qemu":{"major":7,"minor":0,"micro":0},"package":""},"capabilities":[]}}"#;

pub(crate) const EMPTY_RETURN: &str = r#"{"return":{}}"#;

/// What the peer does after reading one command.
pub(crate) enum Reply {
    /// Write these lines to the client.
    Lines(Vec<String>),
    /// Read the command but say nothing.
    Silence,
    /// Drop the connection.
    Hangup,
}

impl Reply {
    pub(crate) fn line(line: impl Into<String>) -> Self {
        Reply::Lines(vec![line.into()])
    }
}

/// A scripted QMP peer listening on a throwaway UNIX socket. Commands it
/// receives are recorded by `execute` name, in arrival order.
pub(crate) struct MonitorPeer {
    pub(crate) socket_path: PathBuf,
    commands: mpsc::UnboundedReceiver<String>,
    _dir: tempfile::TempDir,
}

impl MonitorPeer {
    /// Spawns a peer that sends the standard greeting, accepts capability
    /// negotiation, and then works through `replies` one command at a time.
    pub(crate) fn spawn(replies: Vec<Reply>) -> Self {
        let mut script = vec![Reply::line(EMPTY_RETURN)];
        script.extend(replies);
        Self::spawn_raw(Some(GREETING.to_string()), script)
    }

    /// Spawns a peer with full control over the greeting and every reply,
    /// including the capability negotiation one.
    pub(crate) fn spawn_raw(greeting: Option<String>, replies: Vec<Reply>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("monitor.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(listener, greeting, replies, tx));
        Self {
            socket_path,
            commands: rx,
            _dir: dir,
        }
    }

    /// Drains the command names the peer has seen so far.
    pub(crate) fn seen(&mut self) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            seen.push(command);
        }
        seen
    }
}

async fn serve(
    listener: UnixListener,
    greeting: Option<String>,
    replies: Vec<Reply>,
    tx: mpsc::UnboundedSender<String>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (read_half, mut write_half) = stream.into_split();

    if let Some(greeting) = greeting {
        if write_half
            .write_all(format!("{greeting}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }

    let mut lines = BufReader::new(read_half).lines();
    let mut replies = replies.into_iter();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = serde_json::from_str::<serde_json::Value>(&line)
            .ok()
            .and_then(|v| v.get("execute").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(line);
        let _ = tx.send(command);

        match replies.next() {
            Some(Reply::Lines(lines)) => {
                for line in lines {
                    if write_half
                        .write_all(format!("{line}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Some(Reply::Silence) | None => {}
            Some(Reply::Hangup) => return,
        }
    }
}

/// A client already connected to a scripted peer.
pub(crate) async fn connected_client(replies: Vec<Reply>) -> (QmpClient, MonitorPeer) {
    let peer = MonitorPeer::spawn(replies);
    let client = QmpClient::new();
    client.connect_unix(&peer.socket_path).await.unwrap();
    (client, peer)
}

/// Writes an executable shell script posing as the hypervisor binary.
pub(crate) fn stub_hypervisor(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("stub-qemu.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}
