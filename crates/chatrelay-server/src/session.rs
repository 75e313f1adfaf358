//! Live user ↔ connection bindings plus the offline mailbox.
//!
//! Everything shared between connection tasks sits behind one mutex so that
//! "is the receiver live? if not, enqueue" can never interleave with a bind
//! for that receiver.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use chatrelay_core::{ConnectionId, Envelope, UserId};

use crate::mailbox::OfflineMailbox;

/// The sending side of one connection's outbound queue.
///
/// Frames pushed here are written by that connection's writer task in the
/// order they were pushed.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { id, tx }
    }

    /// A handle with a fresh id and the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionId::new(), tx), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame payload. False once the writer has gone away.
    pub fn send(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Where a routed envelope ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Live,
    Queued,
}

#[derive(Default)]
struct RegistryState {
    users_by_conn: HashMap<ConnectionId, UserId>,
    live: HashMap<UserId, ConnectionHandle>,
    mailbox: OfflineMailbox,
}

impl RegistryState {
    fn bind(&mut self, conn: &ConnectionHandle, user_id: UserId) -> Option<ConnectionId> {
        // A connection re-authenticating as someone else stops being live
        // for its previous user.
        if let Some(previous) = self.users_by_conn.insert(conn.id.clone(), user_id) {
            if previous != user_id && self.live.get(&previous).is_some_and(|h| h.id == conn.id) {
                self.live.remove(&previous);
            }
        }

        let displaced = self
            .live
            .insert(user_id, conn.clone())
            .map(|old| old.id)
            .filter(|old| *old != conn.id);
        if let Some(old) = &displaced {
            self.users_by_conn.remove(old);
        }
        displaced
    }

    fn unbind(&mut self, conn_id: &ConnectionId) -> Option<UserId> {
        let user_id = self.users_by_conn.remove(conn_id)?;
        if self.live.get(&user_id).is_some_and(|h| &h.id == conn_id) {
            self.live.remove(&user_id);
        }
        Some(user_id)
    }

    /// Queue `user_id`'s backlog on `conn`, oldest first.
    ///
    /// Stops at the first envelope that cannot be queued and puts it back
    /// in the mailbox with everything after it. Returns how many were
    /// queued.
    fn flush_backlog<E>(
        &mut self,
        conn: &ConnectionHandle,
        user_id: UserId,
        encode: impl Fn(&Envelope) -> Result<Vec<u8>, E>,
    ) -> usize
    where
        E: std::fmt::Display,
    {
        let mut delivered = 0;
        let mut pending = self.mailbox.drain(user_id).into_iter();
        while let Some(envelope) = pending.next() {
            let sent = match encode(&envelope) {
                Ok(frame) => conn.send(Bytes::from(frame)),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "backlog entry not encodable, keeping");
                    false
                }
            };
            if !sent {
                self.mailbox.enqueue(user_id, envelope);
                for rest in pending.by_ref() {
                    self.mailbox.enqueue(user_id, rest);
                }
                break;
            }
            delivered += 1;
        }
        delivered
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` the live connection for `user_id`.
    ///
    /// Returns the connection that was displaced, if any. The displaced
    /// connection is not notified or closed; it simply stops being
    /// associated with the user.
    pub fn bind(&self, conn: &ConnectionHandle, user_id: UserId) -> Option<ConnectionId> {
        let displaced = self.state.lock().bind(conn, user_id);
        debug!(conn_id = %conn.id, user_id = %user_id, displaced = ?displaced, "session bound");
        displaced
    }

    /// Drop whatever session `conn_id` holds.
    pub fn unbind(&self, conn_id: &ConnectionId) -> Option<UserId> {
        let user_id = self.state.lock().unbind(conn_id);
        if let Some(user_id) = user_id {
            debug!(conn_id = %conn_id, user_id = %user_id, "session unbound");
        }
        user_id
    }

    pub fn resolve_user(&self, conn_id: &ConnectionId) -> Option<UserId> {
        self.state.lock().users_by_conn.get(conn_id).copied()
    }

    pub fn resolve_connection(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.state.lock().live.get(&user_id).cloned()
    }

    pub fn enqueue(&self, user_id: UserId, envelope: Envelope) {
        self.state.lock().mailbox.enqueue(user_id, envelope);
    }

    pub fn drain(&self, user_id: UserId) -> Vec<Envelope> {
        self.state.lock().mailbox.drain(user_id)
    }

    /// Bind `conn` to `user_id` and flush that user's backlog into it.
    ///
    /// Both happen in one critical section, so every backlog frame is queued
    /// on `conn` before any envelope routed afterwards. Returns how many
    /// backlog frames were queued.
    pub fn establish(&self, conn: &ConnectionHandle, user_id: UserId) -> usize {
        let mut state = self.state.lock();
        let displaced = state.bind(conn, user_id);
        let total = state.mailbox.pending(user_id);
        // A closed writer leaves the rest for the next session.
        let delivered = state.flush_backlog(conn, user_id, Envelope::encode_push);
        drop(state);

        debug!(
            conn_id = %conn.id,
            user_id = %user_id,
            displaced = ?displaced,
            backlog = total,
            delivered,
            "session established"
        );
        delivered
    }

    /// Deliver `envelope` to its receiver's live connection, or park it in
    /// the receiver's mailbox. Exactly one of the two happens.
    pub fn route(&self, envelope: Envelope) -> Delivery {
        let receiver = envelope.receiver_id;
        // Encode outside the lock; media frames can be large.
        let frame = match envelope.encode_push() {
            Ok(frame) => Some(Bytes::from(frame)),
            Err(e) => {
                warn!(receiver_id = %receiver, error = %e, "push encoding failed, queueing");
                None
            }
        };

        let mut state = self.state.lock();
        if let (Some(frame), Some(conn)) = (frame, state.live.get(&receiver)) {
            if conn.send(frame) {
                return Delivery::Live;
            }
            debug!(receiver_id = %receiver, conn_id = %conn.id, "live delivery failed, queueing");
        }
        state.mailbox.enqueue(receiver, envelope);
        Delivery::Queued
    }

    /// Users with a live connection.
    pub fn online_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn pending(&self, user_id: UserId) -> usize {
        self.state.lock().mailbox.pending(user_id)
    }
}
