//! Local control protocol.
//!
//! A UI or CLI on the same machine connects to the control listener, skips
//! authentication, and sends commands. Every command gets exactly one reply;
//! failures come back as `UserInterfaceReply { ok: false, .. }` and never
//! close the connection.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use meshfs_net::messages::{ConflictList, PeerList, Pong, UserInterfaceReply};
use meshfs_net::{
    framed, perform_local, ConnectionHandle, FrameReader, FrameWriter, HandlerFactory, Message,
    SessionHandler, MAX_FRAME_LEN,
};

use crate::error::Result;
use crate::node::Node;

/// Creates a [`ControlSession`] per local connection.
pub struct ControlFactory {
    node: Node,
}

impl ControlFactory {
    pub fn new(node: Node) -> Self {
        Self { node }
    }
}

#[async_trait]
impl HandlerFactory for ControlFactory {
    async fn open(&self, conn: &ConnectionHandle) -> meshfs_net::Result<Box<dyn SessionHandler>> {
        tracing::info!(conn = conn.id(), client = conn.remote().display_name(), "control client connected");
        Ok(Box::new(ControlSession {
            node: self.node.clone(),
        }))
    }
}

/// Handles commands from one local client.
pub struct ControlSession {
    node: Node,
}

#[async_trait]
impl SessionHandler for ControlSession {
    async fn handle(&mut self, message: Message, conn: &ConnectionHandle) -> meshfs_net::Result<()> {
        let kind = message.kind();
        let reply = self.execute(message).await;
        tracing::debug!(conn = conn.id(), ?kind, "control command handled");
        conn.send(reply).await
    }
}

impl ControlSession {
    async fn execute(&self, message: Message) -> Message {
        let node = &self.node;
        match message {
            Message::SetDisplayName(cmd) => reply(
                node.set_display_name(&cmd.name)
                    .await
                    .map(|()| format!("display name set to {}", cmd.name.trim())),
            ),
            Message::SetDataDir(cmd) => reply(node.set_data_dir(&cmd.path).map(|saved| {
                if saved {
                    format!("data directory {} takes effect on restart", cmd.path)
                } else {
                    format!(
                        "data directory {} recorded; no config file to persist it",
                        cmd.path
                    )
                }
            })),
            Message::AttemptConnection(cmd) => reply(
                node.connect_to(&cmd.addr)
                    .await
                    .map(|()| format!("connecting to {}", cmd.addr)),
            ),
            Message::GetBackendInfo(_) => node.backend_info().into(),
            Message::StartSync(_) => {
                let asked = node.start_sync().await;
                UserInterfaceReply::ok(format!("sync requested from {} peers", asked)).into()
            }
            Message::ListPeers(_) => match node.peers().await {
                Ok(peers) => PeerList { peers }.into(),
                Err(e) => UserInterfaceReply::err(e.to_string()).into(),
            },
            Message::ListConflicts(_) => match node.conflicts().await {
                Ok(conflicts) => ConflictList { conflicts }.into(),
                Err(e) => UserInterfaceReply::err(e.to_string()).into(),
            },
            Message::Subscribe(cmd) => reply(node.set_subscribed(&cmd.path, cmd.on).await.map(
                |changed| match (changed, cmd.on) {
                    (false, _) => format!("{} is not known", cmd.path),
                    (true, true) => format!("subscribed to {}", cmd.path),
                    (true, false) => format!("unsubscribed from {}", cmd.path),
                },
            )),
            Message::Ping(ping) => Pong { nonce: ping.nonce }.into(),
            other => UserInterfaceReply::err(format!("unsupported command {:?}", other.kind())).into(),
        }
    }
}

fn reply(result: Result<String>) -> Message {
    match result {
        Ok(msg) => UserInterfaceReply::ok(msg).into(),
        Err(e) => UserInterfaceReply::err(e.to_string()).into(),
    }
}

/// Client side of the control protocol.
pub struct ControlClient {
    reader: FrameReader<ReadHalf<TcpStream>>,
    writer: FrameWriter<WriteHalf<TcpStream>>,
    backend_name: String,
}

impl ControlClient {
    /// Connect and run the local handshake.
    pub async fn connect(addr: SocketAddr, client_name: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = framed(stream, MAX_FRAME_LEN, CancellationToken::new());
        let handshake = perform_local(&mut reader, &mut writer, client_name).await?;
        Ok(Self {
            reader,
            writer,
            backend_name: handshake.remote.display_name().to_string(),
        })
    }

    /// Name the backend announced.
    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Send one command and wait for its reply.
    pub async fn request(&mut self, command: impl Into<Message>) -> Result<Message> {
        self.writer.write(&command.into()).await?;
        Ok(self.reader.read().await?)
    }
}
