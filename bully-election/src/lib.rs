//! Bully-algorithm leader election over plain TCP.
//!
//! Every process carries a [`identity::ProcessIdentity`] (days until its next
//! birthday, then a numeric id). Processes discover each other through a small
//! directory service and then elect the live process with the highest identity.
//!
//! # Architecture
//!
//! The election logic is a sans-IO state machine: [`coordinator::Coordinator`]
//! consumes events (accepted connection, connection writable, message received,
//! connection failed, clock tick) and queues [`coordinator::Action`]s. The
//! [`multiplexer`] owns the sockets and drives a single coordinator from one
//! tokio task, so no locking is needed around membership, connection state or
//! the leader field.
//!
//! Tests drive the same coordinator through an in-memory cluster with a virtual
//! clock, which makes elections and failure detection deterministic.
//!
//! # Modules
//!
//! - [`identity`]: process identities, peer addresses, birthday arithmetic
//! - [`membership`]: identity → address map and the merge/evict rules
//! - [`message`]: the wire schema and JSON line framing
//! - [`state`]: per-connection protocol state table
//! - [`coordinator`]: the Bully Algorithm
//! - [`multiplexer`]: TCP event loop, node handle
//! - [`directory`]: group directory server and the JOIN client
//! - [`config`]: election timing
//! - [`error`]: error types
//! - [`cli`]: command-line interface for the binary

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod identity;
pub mod membership;
pub mod message;
pub mod multiplexer;
pub mod state;
