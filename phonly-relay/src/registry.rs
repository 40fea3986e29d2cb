//! Channel registry for the relay server.
//!
//! Tracks every live connection and the channel it has joined, and fans
//! signaling frames out to channel members. Channels exist only while they
//! have members: the first join creates one and the last leave removes it.
//!
//! All state sits behind a single mutex. `connect`, `join`, `forward` and
//! `disconnect` each hold the lock for their whole body and never await, so
//! they are atomic with respect to one another.
//!
//! Entries are ephemeral and lost on relay restart.

use std::collections::{HashMap, HashSet};
use std::fmt;

use axum::extract::ws::{Message, Utf8Bytes};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender half of a connection's outbound queue, drained by its writer task.
pub type PeerSender = mpsc::UnboundedSender<Message>;

/// Process-unique identifier of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocates a fresh, time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The connection is not (or no longer) registered.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Result of a successful [`ChannelRegistry::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection was not in any channel before.
    Joined,
    /// The connection was already a member of this channel.
    AlreadyMember,
    /// The connection left `from` to join the new channel.
    Moved {
        /// Channel the connection was removed from.
        from: String,
    },
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of non-empty channels.
    pub channels: usize,
    /// Number of live connections, joined or not.
    pub connections: usize,
}

struct ConnectionEntry {
    sender: PeerSender,
    channel: Option<String>,
    user_id: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryState {
    /// Removes `id` from `channel`'s member set, dropping the channel once it
    /// is empty.
    fn remove_member(&mut self, channel: &str, id: ConnectionId) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }
}

/// In-memory map of channels to their member connections.
pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    /// Creates a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers a new connection with no channel or user assigned.
    pub fn connect(&self, sender: PeerSender) -> ConnectionId {
        let id = ConnectionId::new();
        self.state.lock().connections.insert(
            id,
            ConnectionEntry {
                sender,
                channel: None,
                user_id: None,
            },
        );
        id
    }

    /// Puts a connection into `channel` and records its user id.
    ///
    /// A connection belongs to at most one channel: joining a different
    /// channel first removes it from the previous one. Joining the same
    /// channel again only refreshes the user id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownConnection`] if `id` has already
    /// disconnected.
    pub fn join(
        &self,
        id: ConnectionId,
        channel: &str,
        user_id: &str,
    ) -> Result<JoinOutcome, RegistryError> {
        let mut state = self.state.lock();
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        entry.user_id = Some(user_id.to_string());
        let previous = entry.channel.replace(channel.to_string());

        let outcome = match previous {
            Some(prev) if prev == channel => JoinOutcome::AlreadyMember,
            Some(prev) => {
                state.remove_member(&prev, id);
                JoinOutcome::Moved { from: prev }
            }
            None => JoinOutcome::Joined,
        };

        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        drop(state);

        Ok(outcome)
    }

    /// Sends `payload` as a text frame to every member of `channel` except
    /// `from`, returning how many recipients accepted it.
    ///
    /// Members whose outbound queue is closed are skipped. A channel with no
    /// members is a no-op.
    pub fn forward(&self, from: ConnectionId, channel: &str, payload: &Utf8Bytes) -> usize {
        let state = self.state.lock();
        let Some(members) = state.channels.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members.iter().filter(|id| **id != from) {
            let Some(entry) = state.connections.get(id) else {
                continue;
            };
            if entry.sender.send(Message::Text(payload.clone())).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(conn = %id, channel = %channel, "skipping closed member");
            }
        }
        delivered
    }

    /// Removes a connection and its channel membership.
    ///
    /// Returns the channel the connection was in, if any. Disconnecting an
    /// unknown connection is a no-op.
    pub fn disconnect(&self, id: ConnectionId) -> Option<String> {
        let mut state = self.state.lock();
        let channel = state.connections.remove(&id)?.channel?;
        state.remove_member(&channel, id);
        Some(channel)
    }

    /// Returns the members of `channel`, or `None` if the channel does not
    /// exist. An existing channel never has an empty member list.
    pub fn members(&self, channel: &str) -> Option<Vec<ConnectionId>> {
        let state = self.state.lock();
        state
            .channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
    }

    /// Returns the names of all current channels, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().channels.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Returns the channel a connection has joined, if any.
    pub fn channel_of(&self, id: ConnectionId) -> Option<String> {
        let state = self.state.lock();
        state.connections.get(&id)?.channel.clone()
    }

    /// Returns the user id a connection joined with, if any.
    pub fn user_of(&self, id: ConnectionId) -> Option<String> {
        let state = self.state.lock();
        state.connections.get(&id)?.user_id.clone()
    }

    /// Returns channel and connection counts taken under one lock.
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            channels: state.channels.len(),
            connections: state.connections.len(),
        }
    }

    /// Queues a close frame on every live connection.
    ///
    /// Each writer task sends the frame and the peer's disconnect then runs
    /// through the normal cleanup path.
    pub fn close_all(&self) {
        let state = self.state.lock();
        for (id, entry) in &state.connections {
            tracing::info!(conn = %id, "sending close frame to peer");
            let _ = entry.sender.send(Message::Close(None));
        }
    }
}
