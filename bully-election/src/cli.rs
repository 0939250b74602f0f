use std::net::SocketAddr;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::config::ElectionConfig;
use crate::error::ConfigError;
use crate::identity::{PeerAddress, ProcessIdentity, parse_birthday};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the group directory that hands out membership to joining nodes.
    Directory(DirectoryArgs),
    /// Join a group and take part in leader election.
    Node(NodeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DirectoryArgs {
    /// Socket address the directory should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Host of the group directory.
    #[arg(long, default_value = "127.0.0.1")]
    pub directory_host: String,

    /// Port of the group directory.
    #[arg(long, default_value_t = 5000)]
    pub directory_port: u16,

    /// Birthday as YYYY-MM-DD. The fewer days until the next one, the lower the priority.
    #[arg(long, value_parser = parse_birthday)]
    pub birthday: NaiveDate,

    /// Numeric id, breaks ties between equal birthdays.
    #[arg(long)]
    pub id: u64,

    /// Address to accept peer connections on.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen: String,

    #[arg(long, default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// How long a peer may take to answer before it is considered failed.
    #[arg(long, default_value_t = 2000)]
    pub failure_timeout_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub probe_interval_ms: u64,

    /// How long to wait for the winner to announce itself after standing
    /// down. Defaults to three failure timeouts.
    #[arg(long)]
    pub victor_timeout_ms: Option<u64>,
}

impl NodeArgs {
    pub fn directory(&self) -> PeerAddress {
        PeerAddress::new(self.directory_host.clone(), self.directory_port)
    }

    pub fn identity(&self, today: NaiveDate) -> Result<ProcessIdentity, ConfigError> {
        ProcessIdentity::from_birthday(self.birthday, today, self.id)
    }

    pub fn election_config(&self) -> ElectionConfig {
        let failure_timeout = Duration::from_millis(self.failure_timeout_ms);
        let victor_timeout = match self.victor_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => failure_timeout * 3,
        };
        ElectionConfig::new()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_failure_timeout(failure_timeout)
            .with_probe_interval(Duration::from_millis(self.probe_interval_ms))
            .with_victor_timeout(victor_timeout)
    }
}
