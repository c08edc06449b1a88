//! Broadcast groups.
//!
//! A [`Group`] is an unordered collection of sessions and other groups,
//! held by weak reference: a session that closes (or a group the
//! application drops) simply stops existing as a member, no unsubscription
//! required. Groups may nest and even form cycles — [`Group::send`] walks
//! the membership graph with a visited set, so every reachable session is
//! delivered to exactly once no matter how tangled the graph is.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use tether_wire::Value;

use crate::session::{Session, SessionState};

/// A member of a [`Group`]: a session or a nested group, weakly held.
#[derive(Clone)]
pub enum GroupMember {
    /// A client session.
    Session(Weak<Session>),
    /// A nested group.
    Group(Weak<Group>),
}

impl GroupMember {
    fn is_alive(&self) -> bool {
        match self {
            Self::Session(weak) => weak.strong_count() > 0,
            Self::Group(weak) => weak.strong_count() > 0,
        }
    }

    fn same(&self, other: &GroupMember) -> bool {
        match (self, other) {
            (Self::Session(a), Self::Session(b)) => Weak::ptr_eq(a, b),
            (Self::Group(a), Self::Group(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&Arc<Session>> for GroupMember {
    fn from(session: &Arc<Session>) -> Self {
        Self::Session(Arc::downgrade(session))
    }
}

impl From<&Arc<Group>> for GroupMember {
    fn from(group: &Arc<Group>) -> Self {
        Self::Group(Arc::downgrade(group))
    }
}

/// A weakly-held set of sessions and sub-groups with cycle-safe broadcast.
pub struct Group {
    members: Mutex<Vec<GroupMember>>,
}

impl Group {
    /// Create an empty group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { members: Mutex::new(Vec::new()) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<GroupMember>> {
        self.members.lock().expect("group members lock poisoned")
    }

    /// Add a member. Adding a present member again is a no-op.
    pub fn add(&self, member: impl Into<GroupMember>) {
        let member = member.into();
        let mut members = self.lock();
        members.retain(GroupMember::is_alive);
        if !members.iter().any(|existing| existing.same(&member)) {
            members.push(member);
        }
    }

    /// Remove a member. Removing an absent member is a no-op.
    pub fn remove(&self, member: impl Into<GroupMember>) {
        let member = member.into();
        self.lock()
            .retain(|existing| existing.is_alive() && !existing.same(&member));
    }

    /// Whether `member` is currently (still) in this group.
    pub fn contains(&self, member: impl Into<GroupMember>) -> bool {
        let member = member.into();
        self.lock().iter().any(|existing| existing.same(&member))
    }

    /// Number of live members (sessions and sub-groups).
    pub fn len(&self) -> usize {
        let mut members = self.lock();
        members.retain(GroupMember::is_alive);
        members.len()
    }

    /// True if the group has no live members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `value` to every session reachable through this group.
    ///
    /// Each reachable session receives the value exactly once, cycles and
    /// shared sub-groups notwithstanding. Delivery is best-effort per
    /// recipient: closed sessions are skipped and individual send failures
    /// are logged, never propagated.
    pub async fn send(self: &Arc<Self>, value: &Value) {
        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(Arc::as_ptr(self) as usize);

        let mut to_visit = vec![self.clone()];
        let mut recipients: Vec<Arc<Session>> = Vec::new();
        while let Some(group) = to_visit.pop() {
            let mut members = group.lock();
            members.retain(GroupMember::is_alive);
            for member in members.iter() {
                match member {
                    GroupMember::Session(weak) => {
                        if let Some(session) = weak.upgrade() {
                            if visited.insert(Arc::as_ptr(&session) as usize) {
                                recipients.push(session);
                            }
                        }
                    }
                    GroupMember::Group(weak) => {
                        if let Some(subgroup) = weak.upgrade() {
                            if visited.insert(Arc::as_ptr(&subgroup) as usize) {
                                to_visit.push(subgroup);
                            }
                        }
                    }
                }
            }
        }

        for session in recipients {
            if session.state().await == SessionState::Closed {
                continue;
            }
            if let Err(error) = session.send(value).await {
                tracing::warn!(session = %session.id(), %error, "group delivery failed");
            }
        }
    }
}
