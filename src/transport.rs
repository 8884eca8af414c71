//! Peer-peer transport: the contract the engine relies on, plus the TCP
//! implementation.
//!
//! For each ordered pair of peers, messages are delivered in send order or
//! not at all, and never duplicated. TCP gives exactly that as long as a
//! single connection lives; a lost connection surfaces as a
//! `Disconnected { peer }` tuple on the inbound queue, and `clear()` tears a
//! connection down deliberately (no tuple) so that a later send reconnects
//! fresh.
//!
//! Server ids double as transport addresses (`host:port`), so the transport
//! needs no separate address book and can connect lazily on first send.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use dashmap::DashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::{Message, MessageTuple};
use crate::queue::MessageQueueTx;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    ZabError,
};
use crate::zxid::ServerId;

/// What the engine requires of a transport. `send` is best-effort and
/// non-blocking; `clear` forces connection teardown and allows a subsequent
/// reconnect. A send to self is looped straight back into the inbound queue.
pub trait Transport: Send + Sync {
    /// Sends a message to the named peer, establishing a connection first if
    /// none is live. Delivery is best-effort.
    fn send(&self, peer: &ServerId, msg: Message);

    /// Tears down the connection to the named peer (if any) without raising
    /// a `Disconnected` tuple.
    fn clear(&self, peer: &ServerId);
}

/// Control commands from `send`/`clear` callers to the acceptor task.
#[derive(Debug)]
enum CtrlCmd {
    /// Connect to a peer (unless already connected) and deliver the message
    /// that triggered the connect.
    Connect { peer: ServerId, msg: Message },

    /// Deliberate connection teardown.
    Clear { peer: ServerId },
}

/// TCP transport module.
pub struct TcpTransport {
    /// My server ID.
    me: ServerId,

    /// Sender side of the control channel to the acceptor task.
    tx_ctrl: mpsc::UnboundedSender<CtrlCmd>,

    /// Map from peer ID -> sender side of its send channel, shared with the
    /// acceptor task (which owns peer lifecycle; senders here are only
    /// looked up).
    tx_sends: Arc<DashMap<ServerId, mpsc::UnboundedSender<Message>>>,

    /// Producer handle of the participant's inbound queue, for loopback.
    tx_recv: MessageQueueTx,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl TcpTransport {
    /// Creates a new TCP transport bound to `me`'s address and spawns the
    /// acceptor task. Inbound messages and disconnect notices go to the
    /// given inbound-queue handle.
    pub async fn new_and_setup(
        me: ServerId,
        tx_recv: MessageQueueTx,
    ) -> Result<TcpTransport, ZabError> {
        let bind_addr: SocketAddr = me.parse()?;
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;

        let (tx_ctrl, rx_ctrl) = mpsc::unbounded_channel();
        let tx_sends = Arc::new(DashMap::new());

        let mut acceptor = TcpTransportAcceptorTask::new(
            me.clone(),
            listener,
            tx_sends.clone(),
            rx_ctrl,
            tx_recv.clone(),
        );
        let acceptor_handle = tokio::spawn(async move { acceptor.run().await });

        Ok(TcpTransport {
            me,
            tx_ctrl,
            tx_sends,
            tx_recv,
            _acceptor_handle: acceptor_handle,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: &ServerId, msg: Message) {
        if peer == &self.me {
            // loopback short-circuits the sockets entirely
            self.tx_recv.push_or_drop(MessageTuple::Message {
                from: self.me.clone(),
                msg,
            });
            return;
        }

        match self.tx_sends.get(peer) {
            Some(tx_send) => {
                // messenger gone mid-send loses the message; best-effort
                let _ = tx_send.send(msg);
            }
            None => {
                // not connected yet; the acceptor task connects lazily and
                // forwards this message once the channel is up
                let _ = self.tx_ctrl.send(CtrlCmd::Connect {
                    peer: peer.clone(),
                    msg,
                });
            }
        }
    }

    fn clear(&self, peer: &ServerId) {
        let _ = self.tx_ctrl.send(CtrlCmd::Clear { peer: peer.clone() });
    }
}

/// TcpTransport acceptor task: owns the listener, the peer registry, and
/// the lifecycle of per-peer messenger tasks.
struct TcpTransportAcceptorTask {
    me: ServerId,

    listener: TcpListener,
    tx_sends: Arc<DashMap<ServerId, mpsc::UnboundedSender<Message>>>,

    rx_ctrl: mpsc::UnboundedReceiver<CtrlCmd>,
    tx_recv: MessageQueueTx,

    /// Peers cleared deliberately; their messenger exit must not surface a
    /// `Disconnected` tuple.
    cleared: HashSet<ServerId>,

    tx_exit: mpsc::UnboundedSender<ServerId>,
    rx_exit: mpsc::UnboundedReceiver<ServerId>,
}

impl TcpTransportAcceptorTask {
    fn new(
        me: ServerId,
        listener: TcpListener,
        tx_sends: Arc<DashMap<ServerId, mpsc::UnboundedSender<Message>>>,
        rx_ctrl: mpsc::UnboundedReceiver<CtrlCmd>,
        tx_recv: MessageQueueTx,
    ) -> Self {
        // exit channel notifies me about terminated messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        TcpTransportAcceptorTask {
            me,
            listener,
            tx_sends,
            rx_ctrl,
            tx_recv,
            cleared: HashSet::new(),
            tx_exit,
            rx_exit,
        }
    }

    /// Registers a connected stream under the peer's id and spawns its
    /// messenger task. `first_msg` (if any) is enqueued before the sender is
    /// published, so no later send can overtake it.
    fn register_peer(
        &mut self,
        peer: ServerId,
        stream: TcpStream,
        first_msg: Option<Message>,
    ) {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        if let Some(msg) = first_msg {
            let _ = tx_send.send(msg);
        }

        let mut messenger = TcpTransportMessengerTask::new(
            peer.clone(),
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { messenger.run().await });

        self.tx_sends.insert(peer.clone(), tx_send);
        self.cleared.remove(&peer);

        pf_debug!(self.me; "registered peer '{}'", peer);
    }

    /// Connects to a peer proactively (triggered by a send to a peer with no
    /// live connection).
    async fn connect_new_peer(
        &mut self,
        peer: ServerId,
        msg: Message,
    ) -> Result<(), ZabError> {
        if let Some(tx_send) = self.tx_sends.get(&peer) {
            // a racing send queued behind an in-flight connect; just forward
            let _ = tx_send.send(msg);
            return Ok(());
        }

        let conn_addr: SocketAddr = peer.parse()?;
        pf_debug!(self.me; "connecting to peer '{}'...", peer);
        let mut stream = tcp_connect_with_retry(conn_addr, 2).await?;

        // handshake: announce my own id
        let id_bytes = self.me.as_bytes();
        stream.write_u32(id_bytes.len() as u32).await?;
        stream.write_all(id_bytes).await?;

        self.register_peer(peer, stream, Some(msg));
        Ok(())
    }

    /// Accepts a new peer connection, reading its id handshake.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), ZabError> {
        let id_len = stream.read_u32().await? as usize;
        if id_len == 0 || id_len > 256 {
            return logged_err!(self.me; "implausible peer id length {}",
                                        id_len);
        }
        let mut id_buf = vec![0u8; id_len];
        stream.read_exact(&mut id_buf).await?;
        let peer = String::from_utf8(id_buf)?;

        if self.tx_sends.contains_key(&peer) {
            // the peer must clear() before reconnecting under the same id
            return logged_err!(self.me; "duplicate connection from peer \
                                         '{}'", peer);
        }

        self.register_peer(peer, stream, None);
        Ok(())
    }

    /// Deregisters a peer; its messenger task exits once it notices the
    /// closed channel.
    fn remove_peer(&mut self, peer: &ServerId) {
        self.tx_sends.remove(peer);
    }

    /// Starts the acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "transport acceptor task spawned");

        loop {
            tokio::select! {
                // control command from send()/clear() callers
                ctrl = self.rx_ctrl.recv() => {
                    match ctrl {
                        Some(CtrlCmd::Connect { peer, msg }) => {
                            if let Err(e) = self.connect_new_peer(
                                peer.clone(),
                                msg,
                            ).await {
                                pf_warn!(self.me; "error connecting to '{}': {}",
                                                  peer, e);
                            }
                        },
                        Some(CtrlCmd::Clear { peer }) => {
                            pf_debug!(self.me; "clearing peer '{}'", peer);
                            self.cleared.insert(peer.clone());
                            self.remove_peer(&peer);
                        },
                        None => break, // transport dropped
                    }
                },

                // new peer connection accepted
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_new_peer(stream).await {
                                pf_warn!(self.me; "error accepting peer: {}", e);
                            }
                        },
                        Err(e) => {
                            pf_warn!(self.me; "error accepting connection: {}", e);
                        }
                    }
                },

                // a peer messenger task exited
                peer = self.rx_exit.recv() => {
                    let peer = peer.unwrap();
                    self.remove_peer(&peer);
                    if self.cleared.remove(&peer) {
                        // deliberate teardown, stay quiet
                        pf_debug!(self.me; "peer '{}' cleared", peer);
                    } else {
                        pf_debug!(self.me; "peer '{}' disconnected", peer);
                        self.tx_recv.push_or_drop(
                            MessageTuple::Disconnected { peer },
                        );
                    }
                },
            }
        }

        pf_debug!(self.me; "transport acceptor task exited");
    }
}

/// TcpTransport per-peer messenger task.
struct TcpTransportMessengerTask {
    /// Corresponding peer's ID.
    peer: ServerId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<Message>,
    read_buf: BytesMut,

    tx_recv: MessageQueueTx,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ServerId>,
}

impl TcpTransportMessengerTask {
    fn new(
        peer: ServerId,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<Message>,
        tx_recv: MessageQueueTx,
        tx_exit: mpsc::UnboundedSender<ServerId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        TcpTransportMessengerTask {
            peer,
            conn_read,
            conn_write,
            rx_send,
            read_buf: BytesMut::with_capacity(8 + 1024),
            tx_recv,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Starts the per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.peer; "messenger task spawned");

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(msg) => {
                            match safe_tcp_write(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    self.retrying = true;
                                }
                                Err(_e) => break,
                            }
                        },
                        None => break, // cleared or transport dropped
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match safe_tcp_write::<Message, _>(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            self.retrying = false;
                        }
                        Ok(false) => {},
                        Err(_e) => break,
                    }
                },

                // receives new message from peer
                msg = safe_tcp_read::<Message, _>(
                    &mut self.read_buf,
                    &mut self.conn_read,
                ) => {
                    match msg {
                        Ok(msg) => {
                            // a full inbound queue blocks this connection,
                            // which is the backpressure we want
                            if self.tx_recv.push(MessageTuple::Message {
                                from: self.peer.clone(),
                                msg,
                            }).await.is_err() {
                                break;
                            }
                        },
                        Err(_e) => break, // peer likely exited ungracefully
                    }
                },
            }
        }

        let _ = self.tx_exit.send(self.peer.clone());
        pf_debug!(self.peer; "messenger task exited");
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::queue::MessageQueue;
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use tokio::time::{self, Duration};

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn api_send_recv() -> Result<(), ZabError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();
        tokio::spawn(async move {
            // peer "127.0.0.1:41811"
            let mut queue = MessageQueue::new();
            let hub = TcpTransport::new_and_setup(
                "127.0.0.1:41811".into(),
                queue.sender(),
            )
            .await?;
            barrier1.wait().await;
            // recv a message from 41810
            match queue.recv().await.unwrap() {
                MessageTuple::Message { from, msg } => {
                    assert_eq!(from, "127.0.0.1:41810".to_string());
                    assert_eq!(msg, Message::QueryLeader);
                }
                tuple => panic!("unexpected tuple {:?}", tuple),
            }
            // reply back over the same connection
            hub.send(
                &"127.0.0.1:41810".to_string(),
                Message::QueryLeaderReply {
                    leader: "127.0.0.1:41811".into(),
                },
            );
            barrier1.wait().await;
            Ok::<(), ZabError>(())
        });
        // peer "127.0.0.1:41810"
        let mut queue = MessageQueue::new();
        let hub = TcpTransport::new_and_setup(
            "127.0.0.1:41810".into(),
            queue.sender(),
        )
        .await?;
        barrier.wait().await;
        // lazy connect on first send
        hub.send(&"127.0.0.1:41811".to_string(), Message::QueryLeader);
        match queue.recv().await.unwrap() {
            MessageTuple::Message { from, msg } => {
                assert_eq!(from, "127.0.0.1:41811".to_string());
                assert_eq!(
                    msg,
                    Message::QueryLeaderReply {
                        leader: "127.0.0.1:41811".into(),
                    }
                );
            }
            tuple => panic!("unexpected tuple {:?}", tuple),
        }
        barrier.wait().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loopback_send() -> Result<(), ZabError> {
        let mut queue = MessageQueue::new();
        let hub = TcpTransport::new_and_setup(
            "127.0.0.1:41820".into(),
            queue.sender(),
        )
        .await?;
        hub.send(&"127.0.0.1:41820".to_string(), Message::Heartbeat);
        assert_eq!(
            queue.recv().await,
            Some(MessageTuple::Message {
                from: "127.0.0.1:41820".into(),
                msg: Message::Heartbeat,
            })
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn disconnect_surfaces() -> Result<(), ZabError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();
        tokio::spawn(async move {
            let mut queue = MessageQueue::new();
            let hub = TcpTransport::new_and_setup(
                "127.0.0.1:41831".into(),
                queue.sender(),
            )
            .await?;
            hub.send(&"127.0.0.1:41830".to_string(), Message::Heartbeat);
            barrier1.wait().await;
            // deliberate teardown on this side; the other side should see a
            // Disconnected tuple
            hub.clear(&"127.0.0.1:41830".to_string());
            time::sleep(Duration::from_millis(300)).await;
            Ok::<(), ZabError>(())
        });
        let mut queue = MessageQueue::new();
        let _hub = TcpTransport::new_and_setup(
            "127.0.0.1:41830".into(),
            queue.sender(),
        )
        .await?;
        match queue.recv().await.unwrap() {
            MessageTuple::Message { from, msg } => {
                assert_eq!(from, "127.0.0.1:41831".to_string());
                assert_eq!(msg, Message::Heartbeat);
            }
            tuple => panic!("unexpected tuple {:?}", tuple),
        }
        barrier.wait().await;
        assert_eq!(
            queue.recv().await,
            Some(MessageTuple::Disconnected {
                peer: "127.0.0.1:41831".into(),
            })
        );
        Ok(())
    }
}
