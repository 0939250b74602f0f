//! Process identities and peer addresses.
//!
//! A process is ranked by how many days remain until its owner's next birthday,
//! ties broken by a numeric id. Identities must be unique among live processes;
//! the membership store never lets a second address take over an identity that
//! is already known, and logs the collision instead.

use std::fmt;
use std::net::SocketAddr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Priority of a process in the election.
///
/// Ordering is lexicographic over `(days_to_birthday, id)`, which is what the
/// derived `Ord` gives us with this field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub days_to_birthday: u32,
    pub id: u64,
}

impl ProcessIdentity {
    pub const fn new(days_to_birthday: u32, id: u64) -> Self {
        Self {
            days_to_birthday,
            id,
        }
    }

    /// Builds the identity for someone born on `birthday`, as seen on `today`.
    pub fn from_birthday(birthday: NaiveDate, today: NaiveDate, id: u64) -> Result<Self, ConfigError> {
        Ok(Self::new(days_until_birthday(birthday, today)?, id))
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.days_to_birthday, self.id)
    }
}

/// Network endpoint a peer listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses a birthday given as `YYYY-MM-DD`.
pub fn parse_birthday(input: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidBirthday(input.to_string()))
}

/// Days from `today` until the next anniversary of `birthday`.
///
/// Zero on the birthday itself. A Feb 29 birthday is celebrated on Mar 1 in
/// non-leap years.
pub fn days_until_birthday(birthday: NaiveDate, today: NaiveDate) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidBirthday(birthday.to_string());
    let this_year = anniversary(birthday, today.year()).ok_or_else(invalid)?;
    let next = if this_year >= today {
        this_year
    } else {
        anniversary(birthday, today.year() + 1).ok_or_else(invalid)?
    };
    u32::try_from((next - today).num_days()).map_err(|_| invalid())
}

fn anniversary(birthday: NaiveDate, year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, birthday.month(), birthday.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))
}
