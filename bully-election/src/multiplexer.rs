//! TCP event loop and node handle.
//!
//! One task owns the [`Coordinator`] and every piece of per-node state. It
//! waits on four sources at once:
//!
//! - **Commands** from [`NodeHandle`]s (status, manual election, shutdown)
//! - **Accepts** on the listener
//! - **Connection events** from per-connection tasks (connected, frame
//!   received, failure)
//! - **The poll ticker**, so timeouts are checked even when nothing happens
//!
//! After each wake-up the coordinator is ticked and its actions are carried
//! out until none are left. Connection tasks never touch election state; they
//! only move frames between a socket and a channel.
//!
//! Each live connection has a reader task and a writer task over the split
//! halves. Closing a connection means dropping its outbound sender: the writer
//! flushes what was queued, shuts the socket down and stops the reader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot},
    task::AbortHandle,
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{debug, info, warn};

use crate::config::ElectionConfig;
use crate::coordinator::{Action, Coordinator};
use crate::directory::join_directory;
use crate::error::PeerError;
use crate::identity::{PeerAddress, ProcessIdentity};
use crate::message::{Message, read_message, write_message};
use crate::state::{ConnId, PeerState};

/// Everything needed to start a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub identity: ProcessIdentity,
    /// Address to bind for peer connections, e.g. "127.0.0.1:0". The bound
    /// address is what gets announced to the directory.
    pub listen_addr: String,
    pub directory: PeerAddress,
    pub election: ElectionConfig,
}

/// Point-in-time view of a running node.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub identity: ProcessIdentity,
    pub address: PeerAddress,
    pub leader: Option<ProcessIdentity>,
    pub phase: PeerState,
    pub members: Vec<ProcessIdentity>,
    pub open_connections: usize,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.identity)
    }
}

/// Handle to a node's event loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<NodeCommand>,
    identity: ProcessIdentity,
    address: PeerAddress,
}

impl NodeHandle {
    pub fn identity(&self) -> ProcessIdentity {
        self.identity
    }

    /// The address peers use to reach this node.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::Status { respond_to })?;
        response.await.context("status response channel closed")
    }

    /// Starts an election now, whatever the node is doing.
    pub async fn start_election(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::StartElection { respond_to })?;
        response.await.context("election response channel closed")
    }

    /// Stops the event loop. Returns once the listener and every connection
    /// have been dropped, so peers see the node as gone.
    pub async fn shutdown(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::Shutdown { respond_to })?;
        response.await.context("shutdown response channel closed")
    }

    fn send(&self, command: NodeCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("node {} is not running", self.identity))
    }
}

#[derive(Debug)]
enum NodeCommand {
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    StartElection {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Reports from connection tasks to the event loop.
enum ConnEvent {
    Connected(ConnId, TcpStream),
    Received(ConnId, Message),
    Failed(ConnId, PeerError),
}

/// Binds the listener, joins the directory and spawns the event loop. The
/// first election starts immediately.
///
/// # Errors
///
/// - Invalid election timing
/// - The listen address cannot be bound
/// - The directory is unreachable or answers nonsense
pub async fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    config.election.validate()?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let address = PeerAddress::from(listener.local_addr()?);

    let snapshot = join_directory(
        &config.directory,
        config.identity,
        &address,
        config.election.failure_timeout,
    )
    .await?;
    info!(
        identity = %config.identity,
        %address,
        members = snapshot.len(),
        "joined group"
    );

    let coordinator = Coordinator::new(
        config.identity,
        address.clone(),
        &snapshot,
        config.election,
        Instant::now(),
    );
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(Multiplexer::new(coordinator, address.clone(), listener, commands_rx).run());

    Ok(NodeHandle {
        commands: commands_tx,
        identity: config.identity,
        address,
    })
}

struct Connection {
    /// Set once the socket is established.
    outbound: Option<mpsc::UnboundedSender<Message>>,
    /// The coordinator asked to write before the socket was ready.
    want_write: bool,
}

struct Multiplexer {
    coordinator: Coordinator,
    address: PeerAddress,
    listener: TcpListener,
    connections: HashMap<ConnId, Connection>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
}

impl Multiplexer {
    fn new(
        coordinator: Coordinator,
        address: PeerAddress,
        listener: TcpListener,
        commands: mpsc::UnboundedReceiver<NodeCommand>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            coordinator,
            address,
            listener,
            connections: HashMap::new(),
            commands,
            events_tx,
            events_rx,
        }
    }

    async fn run(mut self) {
        let mut ticker = interval(self.coordinator.config().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.coordinator.start_election(Instant::now());
        self.apply_actions();

        let done = loop {
            select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown { respond_to }) => break Some(respond_to),
                    Some(NodeCommand::Status { respond_to }) => {
                        let _ = respond_to.send(self.status());
                    }
                    Some(NodeCommand::StartElection { respond_to }) => {
                        info!("election requested");
                        self.coordinator.start_election(Instant::now());
                        let _ = respond_to.send(());
                    }
                    // Every handle is gone; nobody can ask us to stop any more.
                    None => break None,
                },
                accepted = self.listener.accept() => self.handle_accept(accepted),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => {}
            }
            self.coordinator.on_tick(Instant::now());
            self.apply_actions();
        };

        info!(
            identity = %self.coordinator.identity(),
            connections = self.connections.len(),
            "node shutting down"
        );
        drop(self);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            identity: self.coordinator.identity(),
            address: self.address.clone(),
            leader: self.coordinator.leader(),
            phase: self.coordinator.phase(),
            members: self.coordinator.members().identities(),
            open_connections: self.coordinator.open_connections(),
        }
    }

    fn handle_accept(&mut self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, peer)) => {
                let conn = self.coordinator.on_accept(Instant::now());
                debug!(conn, %peer, "accepted connection");
                let outbound = self.attach(conn, stream);
                self.connections.insert(
                    conn,
                    Connection {
                        outbound: Some(outbound),
                        want_write: false,
                    },
                );
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    fn handle_event(&mut self, event: ConnEvent) {
        let now = Instant::now();
        match event {
            ConnEvent::Connected(conn, stream) => self.handle_connected(conn, stream),
            ConnEvent::Received(conn, message) => {
                debug!(conn, kind = message.kind(), "received");
                self.coordinator.on_message(conn, message, now);
            }
            ConnEvent::Failed(conn, error) => {
                self.connections.remove(&conn);
                self.coordinator.on_failure(conn, &error, now);
            }
        }
    }

    fn handle_connected(&mut self, conn: ConnId, stream: TcpStream) {
        if !self.connections.contains_key(&conn) {
            debug!(conn, "connection no longer needed");
            return;
        }
        let outbound = self.attach(conn, stream);
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        connection.outbound = Some(outbound);
        if std::mem::take(&mut connection.want_write) {
            self.coordinator.on_writable(conn, Instant::now());
        }
    }

    /// Carries out coordinator actions until it has nothing more to say.
    fn apply_actions(&mut self) {
        loop {
            let actions = self.coordinator.drain_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.apply(action);
            }
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Connect { conn, address } => {
                self.connections.insert(
                    conn,
                    Connection {
                        outbound: None,
                        want_write: false,
                    },
                );
                self.spawn_connect(conn, address);
            }
            Action::WantWrite(conn) => {
                let ready = match self.connections.get_mut(&conn) {
                    Some(connection) if connection.outbound.is_some() => true,
                    Some(connection) => {
                        connection.want_write = true;
                        false
                    }
                    None => false,
                };
                if ready {
                    self.coordinator.on_writable(conn, Instant::now());
                }
            }
            Action::Send { conn, message } => {
                let outbound = self
                    .connections
                    .get(&conn)
                    .and_then(|connection| connection.outbound.as_ref());
                match outbound {
                    Some(outbound) => {
                        if outbound.send(message).is_err() {
                            debug!(conn, "writer already gone");
                        }
                    }
                    None => debug!(conn, kind = message.kind(), "send on closed connection dropped"),
                }
            }
            Action::Close(conn) => {
                self.connections.remove(&conn);
            }
        }
    }

    fn spawn_connect(&self, conn: ConnId, address: PeerAddress) {
        let events = self.events_tx.clone();
        let limit = self.coordinator.config().failure_timeout;
        tokio::spawn(async move {
            let attempt = timeout(limit, TcpStream::connect((address.host.as_str(), address.port))).await;
            let event = match attempt {
                Ok(Ok(stream)) => ConnEvent::Connected(conn, stream),
                Ok(Err(source)) => ConnEvent::Failed(
                    conn,
                    PeerError::ConnectFailed {
                        addr: address.to_string(),
                        source,
                    },
                ),
                Err(_) => ConnEvent::Failed(conn, PeerError::TimedOut(limit)),
            };
            let _ = events.send(event);
        });
    }

    /// Spawns the reader and writer tasks and returns the writer's inbox.
    fn attach(&self, conn: ConnId, stream: TcpStream) -> mpsc::UnboundedSender<Message> {
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_frames(conn, reader, self.events_tx.clone()));
        tokio::spawn(write_frames(
            conn,
            writer,
            outbound_rx,
            reader_task.abort_handle(),
            self.events_tx.clone(),
        ));
        outbound_tx
    }
}

async fn read_frames(conn: ConnId, reader: OwnedReadHalf, events: mpsc::UnboundedSender<ConnEvent>) {
    let mut reader = BufReader::new(reader);
    loop {
        let event = match read_message::<_, Message>(&mut reader).await {
            Ok(Some(message)) => ConnEvent::Received(conn, message),
            Ok(None) => ConnEvent::Failed(conn, PeerError::Closed),
            Err(err) => ConnEvent::Failed(conn, err),
        };
        let last = !matches!(event, ConnEvent::Received(..));
        if events.send(event).is_err() || last {
            break;
        }
    }
}

async fn write_frames(
    conn: ConnId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    reader: AbortHandle,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            let _ = events.send(ConnEvent::Failed(conn, err));
            break;
        }
    }
    let _ = writer.shutdown().await;
    reader.abort();
}
