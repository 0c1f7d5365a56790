//! Session state and the process-wide session table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;

use meridian_wire::Code;

/// Session id, unique per node for the process lifetime.
pub type Sid = u64;

/// Session lifecycle. Transitions are monotone: `Init → Working → Closed`,
/// never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Connected, handshake not yet acknowledged.
    Init = 0,
    /// Handshake complete, traffic flowing.
    Working = 1,
    /// Torn down; terminal.
    Closed = 2,
}

impl From<u8> for SessionState {
    fn from(value: u8) -> Self {
        match value {
            0 => SessionState::Init,
            1 => SessionState::Working,
            _ => SessionState::Closed,
        }
    }
}

/// Per-connection identity and state. Shared between the agent that owns the
/// connection and anything holding the sid; everything here is safe to read
/// concurrently.
pub struct Session {
    sid: Sid,
    /// 0 until a login flow binds a user id.
    uid: AtomicI64,
    state: AtomicU8,
    /// Unix seconds of the last packet handled on this session.
    last_at: AtomicI64,
    attributes: RwLock<HashMap<String, String>>,
    remote_addr: String,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Session {
    fn new(sid: Sid, remote_addr: String) -> Self {
        Self {
            sid,
            uid: AtomicI64::new(0),
            state: AtomicU8::new(SessionState::Init as u8),
            last_at: AtomicI64::new(unix_now()),
            attributes: RwLock::new(HashMap::new()),
            remote_addr,
        }
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn uid(&self) -> Option<i64> {
        match self.uid.load(Ordering::Acquire) {
            0 => None,
            uid => Some(uid),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.uid().is_some()
    }

    /// Bind the authenticated user id. Once-only; the uid is immutable until
    /// the session closes.
    pub fn bind_uid(&self, uid: i64) -> Result<(), Code> {
        if uid <= 0 {
            return Err(Code::SessionUidNotBind);
        }
        self.uid
            .compare_exchange(0, uid, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Code::SessionUidNotBind)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle. Backward transitions are ignored and reported
    /// with `false`.
    pub fn set_state(&self, state: SessionState) -> bool {
        self.state.fetch_max(state as u8, Ordering::AcqRel) <= state as u8
            && self.state() == state
    }

    pub fn is_working(&self) -> bool {
        self.state() == SessionState::Working
    }

    /// Stamp the heartbeat clock.
    pub fn touch(&self) {
        self.last_at.store(unix_now(), Ordering::Release);
    }

    pub fn last_at(&self) -> i64 {
        self.last_at.load(Ordering::Acquire)
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.write().insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.read().get(key).cloned()
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "session[sid = {}, uid = {}, addr = {}]",
            self.sid,
            self.uid.load(Ordering::Relaxed),
            self.remote_addr
        )
    }
}

/// Process-wide `sid → session` table. Agents insert on accept and remove on
/// close; everyone else resolves sessions by id and never owns them.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<Sid, Arc<Session>>,
    next_sid: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_sid: AtomicU64::new(1),
        }
    }

    pub fn create(&self, remote_addr: String) -> Arc<Session> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(sid, remote_addr));
        self.sessions.insert(sid, session.clone());
        session
    }

    pub fn get(&self, sid: Sid) -> Option<Arc<Session>> {
        self.sessions.get(&sid).map(|s| s.clone())
    }

    pub fn get_by_uid(&self, uid: i64) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| entry.uid() == Some(uid))
            .map(|entry| entry.clone())
    }

    pub fn remove(&self, sid: Sid) -> Option<Arc<Session>> {
        self.sessions.remove(&sid).map(|(_, s)| s)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_binds_exactly_once() {
        let table = SessionTable::new();
        let session = table.create("1.2.3.4:5".into());
        assert!(!session.is_bound());
        session.bind_uid(1001).unwrap();
        assert_eq!(session.uid(), Some(1001));
        assert_eq!(session.bind_uid(2002), Err(Code::SessionUidNotBind));
        assert_eq!(session.uid(), Some(1001));
    }

    #[test]
    fn state_transitions_are_monotone() {
        let table = SessionTable::new();
        let session = table.create("1.2.3.4:5".into());
        assert_eq!(session.state(), SessionState::Init);
        assert!(session.set_state(SessionState::Working));
        assert!(session.set_state(SessionState::Closed));
        // No way back.
        assert!(!session.set_state(SessionState::Working));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn table_assigns_unique_sids() {
        let table = SessionTable::new();
        let a = table.create("a".into());
        let b = table.create("b".into());
        assert_ne!(a.sid(), b.sid());
        assert_eq!(table.count(), 2);

        b.bind_uid(7).unwrap();
        assert_eq!(table.get_by_uid(7).unwrap().sid(), b.sid());

        table.remove(a.sid());
        assert!(table.get(a.sid()).is_none());
        assert_eq!(table.count(), 1);
    }
}
