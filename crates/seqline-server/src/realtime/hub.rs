use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use seqline_shared::realtime::ServerEvent;
use seqline_shared::{GroupId, UserId};

use crate::fanout::EventSink;

pub type ConnId = u64;

pub fn group_room(group_id: &GroupId) -> String {
    format!("group:{group_id}")
}

struct ConnEntry {
    user: Option<UserId>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Registry of live realtime connections.
///
/// Every connection owns an unbounded outbound channel drained by its
/// writer task; the hub only ever does non-blocking sends into those
/// channels, so pushes never wait on a slow socket.
#[derive(Clone, Default)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    connections: DashMap<ConnId, ConnEntry>,
    /// user -> their authenticated connections
    users: DashMap<UserId, HashSet<ConnId>>,
    /// room -> member connections
    rooms: DashMap<String, HashSet<ConnId>>,
    /// watched user -> connections subscribed to their presence
    watchers: DashMap<UserId, HashSet<ConnId>>,
    last_seen: DashMap<UserId, DateTime<Utc>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: mpsc::UnboundedSender<ServerEvent>) -> ConnId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .connections
            .insert(id, ConnEntry { user: None, tx });
        trace!(conn = id, "Connection registered");
        id
    }

    /// Attach `user` to `conn`. Returns `true` when this is the user's
    /// first live connection.
    pub fn bind_user(&self, conn: ConnId, user: &UserId) -> bool {
        if let Some(mut entry) = self.inner.connections.get_mut(&conn) {
            entry.user = Some(user.clone());
        }
        let mut conns = self.inner.users.entry(user.clone()).or_default();
        let first = conns.is_empty();
        conns.insert(conn);
        first
    }

    /// Forget `conn`. Returns the user that went offline with it, if this
    /// was their last connection.
    pub fn unregister(&self, conn: ConnId) -> Option<UserId> {
        let (_, entry) = self.inner.connections.remove(&conn)?;
        for mut room in self.inner.rooms.iter_mut() {
            room.remove(&conn);
        }
        self.inner.rooms.retain(|_, members| !members.is_empty());
        for mut watched in self.inner.watchers.iter_mut() {
            watched.remove(&conn);
        }
        self.inner.watchers.retain(|_, w| !w.is_empty());

        let user = entry.user?;
        let mut offline = false;
        if let Some(mut conns) = self.inner.users.get_mut(&user) {
            conns.remove(&conn);
            offline = conns.is_empty();
        }
        if offline {
            self.inner.users.remove(&user);
            self.inner.last_seen.insert(user.clone(), Utc::now());
            debug!(user = %user, "User went offline");
            Some(user)
        } else {
            None
        }
    }

    pub fn join_room(&self, conn: ConnId, room: &str) {
        self.inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn);
    }

    pub fn leave_room(&self, conn: ConnId, room: &str) {
        let mut empty = false;
        if let Some(mut members) = self.inner.rooms.get_mut(room) {
            members.remove(&conn);
            empty = members.is_empty();
        }
        if empty {
            self.inner.rooms.remove(room);
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.inner.users.contains_key(user)
    }

    pub fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.inner.last_seen.get(user).map(|t| *t)
    }

    pub fn send_to_conn(&self, conn: ConnId, event: ServerEvent) {
        if let Some(entry) = self.inner.connections.get(&conn) {
            let _ = entry.tx.send(event);
        }
    }

    /// Subscribe `conn` to presence changes of `users`, returning their
    /// current presence.
    pub fn watch_presence(&self, conn: ConnId, users: &[UserId]) -> Vec<ServerEvent> {
        users
            .iter()
            .map(|user| {
                self.inner
                    .watchers
                    .entry(user.clone())
                    .or_default()
                    .insert(conn);
                self.presence_of(user)
            })
            .collect()
    }

    pub fn presence_of(&self, user: &UserId) -> ServerEvent {
        let is_online = self.is_online(user);
        ServerEvent::Presence {
            user_id: user.clone(),
            is_online,
            last_seen: if is_online { None } else { self.last_seen(user) },
        }
    }

    /// Tell everyone watching `user` about their current presence.
    pub fn broadcast_presence(&self, user: &UserId) {
        let targets = self.snapshot(self.inner.watchers.get(user).as_deref());
        self.send_all(&targets, &self.presence_of(user));
    }

    pub fn push_to_room_except(&self, room: &str, except: Option<&UserId>, event: &ServerEvent) {
        let targets = self.snapshot(self.inner.rooms.get(room).as_deref());
        let skip: HashSet<ConnId> = except
            .map(|u| self.snapshot(self.inner.users.get(u).as_deref()))
            .unwrap_or_default()
            .into_iter()
            .collect();
        let targets: Vec<ConnId> = targets.into_iter().filter(|c| !skip.contains(c)).collect();
        self.send_all(&targets, event);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    // Copy ids out so no map guard is held while sending.
    fn snapshot(&self, set: Option<&HashSet<ConnId>>) -> Vec<ConnId> {
        set.map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    fn send_all(&self, conns: &[ConnId], event: &ServerEvent) {
        for conn in conns {
            self.send_to_conn(*conn, event.clone());
        }
    }
}

impl EventSink for RealtimeHub {
    fn push_to_users(&self, users: &[UserId], event: &ServerEvent) {
        let mut targets = Vec::new();
        for user in users {
            targets.extend(self.snapshot(self.inner.users.get(user).as_deref()));
        }
        self.send_all(&targets, event);
    }

    fn push_to_group(&self, group_id: &GroupId, event: &ServerEvent) {
        self.push_to_room_except(&group_room(group_id), None, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(hub: &RealtimeHub) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (hub.register(tx), rx)
    }

    #[test]
    fn pushes_reach_every_connection_of_a_user() {
        let hub = RealtimeHub::new();
        let bob = UserId::from("bob");
        let (c1, mut rx1) = conn(&hub);
        let (c2, mut rx2) = conn(&hub);
        assert!(hub.bind_user(c1, &bob));
        assert!(!hub.bind_user(c2, &bob));

        hub.push_to_users(&[bob], &ServerEvent::Pong);
        assert_eq!(rx1.try_recv().unwrap(), ServerEvent::Pong);
        assert_eq!(rx2.try_recv().unwrap(), ServerEvent::Pong);
    }

    #[test]
    fn room_push_skips_excluded_user() {
        let hub = RealtimeHub::new();
        let (a, mut rx_a) = conn(&hub);
        let (b, mut rx_b) = conn(&hub);
        hub.bind_user(a, &UserId::from("alice"));
        hub.bind_user(b, &UserId::from("bob"));
        let room = group_room(&GroupId::from("team"));
        hub.join_room(a, &room);
        hub.join_room(b, &room);

        hub.push_to_room_except(&room, Some(&UserId::from("alice")), &ServerEvent::Pong);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), ServerEvent::Pong);

        hub.leave_room(b, &room);
        hub.push_to_group(&GroupId::from("team"), &ServerEvent::Pong);
        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::Pong);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn last_connection_going_away_marks_offline() {
        let hub = RealtimeHub::new();
        let bob = UserId::from("bob");
        let (watcher, mut rx_w) = conn(&hub);
        let (c1, _rx1) = conn(&hub);
        let (c2, _rx2) = conn(&hub);
        hub.bind_user(c1, &bob);
        hub.bind_user(c2, &bob);

        let snapshot = hub.watch_presence(watcher, &[bob.clone()]);
        assert!(matches!(snapshot[0], ServerEvent::Presence { is_online: true, .. }));

        assert_eq!(hub.unregister(c1), None);
        assert_eq!(hub.unregister(c2), Some(bob.clone()));
        hub.broadcast_presence(&bob);
        match rx_w.try_recv().unwrap() {
            ServerEvent::Presence {
                is_online,
                last_seen,
                ..
            } => {
                assert!(!is_online);
                assert!(last_seen.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hub.connection_count(), 1);
    }
}
