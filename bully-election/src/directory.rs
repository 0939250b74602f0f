//! The group directory and the client side of JOIN.
//!
//! The directory is deliberately dumb: every connection sends exactly one
//! JOIN, gets back the membership as it stands after recording the joiner, and
//! is closed. It never notices departures; nodes find those out themselves.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::error::DirectoryError;
use crate::identity::{PeerAddress, ProcessIdentity};
use crate::membership::Membership;
use crate::message::{Message, read_message, write_message};

pub struct Directory {
    listener: TcpListener,
    members: Arc<Mutex<Membership>>,
}

impl Directory {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            members: Arc::new(Mutex::new(Membership::new())),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Directory { listener, members } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    let known = members.lock().await.len();
                    info!(members = known, "directory shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &members);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    members: &Arc<Mutex<Membership>>,
) {
    match result {
        Ok((stream, peer)) => spawn_join_handler(stream, peer, members),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_join_handler(stream: TcpStream, peer: SocketAddr, members: &Arc<Mutex<Membership>>) {
    let members = Arc::clone(members);
    tokio::spawn(async move {
        if let Err(err) = handle_join(stream, members).await {
            warn!(peer = %peer, error = ?err, "join failed");
        }
    });
}

async fn handle_join(stream: TcpStream, members: Arc<Mutex<Membership>>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let message = match read_message::<_, Message>(&mut reader).await? {
        Some(message) => message,
        None => anyhow::bail!("connection closed before JOIN"),
    };
    let (identity, address) = match message {
        Message::Join { identity, address } => (identity, address),
        other => anyhow::bail!("expected JOIN, got {}", other.kind()),
    };

    let snapshot = record_join(&members, identity, address).await;
    write_message(&mut writer, &snapshot).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Records a joiner and returns the membership including it.
async fn record_join(
    members: &Mutex<Membership>,
    identity: ProcessIdentity,
    address: PeerAddress,
) -> Membership {
    let mut members = members.lock().await;
    match members.insert(identity, address.clone()) {
        None => info!(%identity, %address, "member joined"),
        Some(previous) if previous == address => debug!(%identity, "member joined again"),
        Some(previous) => info!(%identity, %previous, %address, "member restarted at a new address"),
    }
    members.clone()
}

/// Announces `identity` at `address` to the directory and returns the
/// membership it answers with. The whole exchange is bounded by `limit`.
pub async fn join_directory(
    directory: &PeerAddress,
    identity: ProcessIdentity,
    address: &PeerAddress,
    limit: Duration,
) -> Result<Membership, DirectoryError> {
    match timeout(limit, exchange_join(directory, identity, address)).await {
        Ok(result) => result,
        Err(_) => Err(DirectoryError::TimedOut {
            addr: directory.to_string(),
            timeout: limit,
        }),
    }
}

async fn exchange_join(
    directory: &PeerAddress,
    identity: ProcessIdentity,
    address: &PeerAddress,
) -> Result<Membership, DirectoryError> {
    let stream = TcpStream::connect((directory.host.as_str(), directory.port))
        .await
        .map_err(|source| DirectoryError::Unreachable {
            addr: directory.to_string(),
            source,
        })?;
    let (reader, mut writer) = stream.into_split();

    let join = Message::Join {
        identity,
        address: address.clone(),
    };
    write_message(&mut writer, &join)
        .await
        .map_err(|err| DirectoryError::Protocol(err.to_string()))?;

    let mut reader = BufReader::new(reader);
    match read_message::<_, Membership>(&mut reader).await {
        Ok(Some(members)) => Ok(members),
        Ok(None) => Err(DirectoryError::Protocol(
            "directory closed the connection without a membership list".to_string(),
        )),
        Err(err) => Err(DirectoryError::Protocol(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejoin_replaces_the_address() {
        let members = Mutex::new(Membership::new());
        let identity = ProcessIdentity::new(4, 2);

        record_join(&members, identity, PeerAddress::new("127.0.0.1", 7001)).await;
        let snapshot = record_join(&members, identity, PeerAddress::new("127.0.0.1", 7002)).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&identity).map(|addr| addr.port), Some(7002));
    }

    #[tokio::test]
    async fn snapshot_includes_the_joiner() {
        let members = Mutex::new(Membership::new());
        let first = ProcessIdentity::new(1, 1);
        let second = ProcessIdentity::new(2, 2);

        let snapshot = record_join(&members, first, PeerAddress::new("a", 1)).await;
        assert!(snapshot.contains(&first));

        let snapshot = record_join(&members, second, PeerAddress::new("b", 2)).await;
        assert_eq!(snapshot.identities(), vec![first, second]);
    }

    #[tokio::test]
    async fn non_join_first_frame_is_refused() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let directory = Directory::new(listener);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(directory.run_until(async {
            let _ = stop_rx.await;
        }));

        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let probe = Message::Probe {
            from: ProcessIdentity::new(1, 1),
        };
        write_message(&mut writer, &probe).await?;

        let mut reader = BufReader::new(reader);
        let reply = read_message::<_, Membership>(&mut reader).await?;
        assert!(reply.is_none(), "directory must hang up without answering");

        let _ = stop_tx.send(());
        server.await??;
        Ok(())
    }
}
