use std::time::Duration;

use anyhow::Result;
use bully_election::{
    config::ElectionConfig,
    directory::{Directory, join_directory},
    error::DirectoryError,
    identity::{PeerAddress, ProcessIdentity},
    multiplexer::{NodeConfig, spawn_node},
};
use tokio::{net::TcpListener, sync::oneshot};

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

async fn spawn_directory() -> Result<(PeerAddress, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let directory = Directory::new(listener);
    let addr = directory.local_addr()?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(directory.run_until(async {
        let _ = stop_rx.await;
    }));
    Ok((PeerAddress::from(addr), stop_tx))
}

/// An address nothing listens on.
async fn closed_address() -> Result<PeerAddress> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(PeerAddress::from(addr))
}

#[tokio::test]
async fn every_join_sees_everyone_before_it() -> Result<()> {
    let (directory, stop) = spawn_directory().await?;
    let ids = [
        ProcessIdentity::new(10, 5),
        ProcessIdentity::new(20, 3),
        ProcessIdentity::new(15, 9),
    ];

    for (joined, identity) in ids.iter().enumerate() {
        let address = PeerAddress::new("127.0.0.1", 7100 + joined as u16);
        let snapshot = join_directory(&directory, *identity, &address, JOIN_TIMEOUT).await?;
        assert_eq!(snapshot.len(), joined + 1);
        assert_eq!(snapshot.get(identity), Some(&address));
        for earlier in &ids[..joined] {
            assert!(snapshot.contains(earlier), "{earlier} missing after {identity} joined");
        }
    }

    let _ = stop.send(());
    Ok(())
}

#[tokio::test]
async fn unreachable_directory_is_reported() -> Result<()> {
    let directory = closed_address().await?;
    let result = join_directory(
        &directory,
        ProcessIdentity::new(1, 1),
        &PeerAddress::new("127.0.0.1", 7200),
        JOIN_TIMEOUT,
    )
    .await;
    assert!(matches!(result, Err(DirectoryError::Unreachable { .. })));
    Ok(())
}

#[tokio::test]
async fn silent_directory_times_out() -> Result<()> {
    // Connections queue in the backlog but nobody ever answers.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let directory = PeerAddress::from(listener.local_addr()?);

    let limit = Duration::from_millis(200);
    let result = join_directory(
        &directory,
        ProcessIdentity::new(1, 1),
        &PeerAddress::new("127.0.0.1", 7201),
        limit,
    )
    .await;
    assert!(matches!(result, Err(DirectoryError::TimedOut { timeout, .. }) if timeout == limit));

    drop(listener);
    Ok(())
}

#[tokio::test]
async fn node_refuses_to_start_without_a_directory() -> Result<()> {
    let config = NodeConfig {
        identity: ProcessIdentity::new(4, 4),
        listen_addr: "127.0.0.1:0".to_string(),
        directory: closed_address().await?,
        election: ElectionConfig::default(),
    };

    let err = spawn_node(config).await.expect_err("node must not start");
    assert!(
        matches!(err.downcast_ref::<DirectoryError>(), Some(DirectoryError::Unreachable { .. })),
        "unexpected error: {err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn node_rejects_zero_timeouts() -> Result<()> {
    let (directory, stop) = spawn_directory().await?;
    let config = NodeConfig {
        identity: ProcessIdentity::new(4, 4),
        listen_addr: "127.0.0.1:0".to_string(),
        directory,
        election: ElectionConfig::default().with_probe_interval(Duration::ZERO),
    };

    assert!(spawn_node(config).await.is_err());

    let _ = stop.send(());
    Ok(())
}
