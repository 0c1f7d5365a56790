//! In-memory member registry.
//!
//! Both indices (id map and per-type buckets) live behind one lock so every
//! reader observes a consistent snapshot. Insertion order within a type
//! bucket is preserved, which is what makes "first of type" routing
//! deterministic across a node's lifetime.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::cluster::Member;
use crate::error::ClusterError;

#[derive(Default)]
struct Indexes {
    members: HashMap<String, Member>,
    by_type: HashMap<String, Vec<String>>,
}

/// Authoritative membership view on one node.
#[derive(Default)]
pub struct MemberRegistry {
    inner: RwLock<Indexes>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Re-adding a byte-equal record is a no-op (`Ok(false)`);
    /// the same id with different fields is a conflict.
    pub fn add(&self, member: Member) -> Result<bool, ClusterError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.members.get(&member.node_id) {
            if *existing == member {
                return Ok(false);
            }
            return Err(ClusterError::MemberConflict(member.node_id));
        }

        inner
            .by_type
            .entry(member.node_type.clone())
            .or_default()
            .push(member.node_id.clone());
        inner.members.insert(member.node_id.clone(), member);
        Ok(true)
    }

    /// Remove a member. Unknown ids are a no-op.
    pub fn remove(&self, node_id: &str) -> Option<Member> {
        let mut inner = self.inner.write();
        let member = inner.members.remove(node_id)?;
        if let Some(bucket) = inner.by_type.get_mut(&member.node_type) {
            bucket.retain(|id| id != node_id);
            if bucket.is_empty() {
                inner.by_type.remove(&member.node_type);
            }
        }
        Some(member)
    }

    pub fn get(&self, node_id: &str) -> Option<Member> {
        self.inner.read().members.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.inner.read().members.contains_key(node_id)
    }

    /// Members of one type, in registration order.
    pub fn list_by_type(&self, node_type: &str) -> Vec<Member> {
        let inner = self.inner.read();
        inner
            .by_type
            .get(node_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.members.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The earliest-registered member of a type, the deterministic routing
    /// pick for type-addressed calls.
    pub fn first_of_type(&self, node_type: &str) -> Option<Member> {
        let inner = self.inner.read();
        let id = inner.by_type.get(node_type)?.first()?;
        inner.members.get(id).cloned()
    }

    /// Point-in-time copy of the whole membership.
    pub fn snapshot(&self) -> Vec<Member> {
        self.inner.read().members.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.inner.read().members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(n: u32) -> Member {
        Member::new(format!("gate-{n}"), "gate", format!("127.0.0.1:51{n:02}"))
    }

    #[test]
    fn add_is_idempotent() {
        let registry = MemberRegistry::new();
        assert!(registry.add(gate(1)).unwrap());
        assert!(!registry.add(gate(1)).unwrap());
        assert_eq!(registry.member_count(), 1);
        assert_eq!(registry.list_by_type("gate").len(), 1);
    }

    #[test]
    fn conflicting_add_is_rejected() {
        let registry = MemberRegistry::new();
        registry.add(gate(1)).unwrap();
        let mut imposter = gate(1);
        imposter.address = "10.0.0.9:9999".into();
        assert!(matches!(
            registry.add(imposter),
            Err(ClusterError::MemberConflict(_))
        ));
        // Original registration untouched.
        assert_eq!(registry.get("gate-1").unwrap().address, "127.0.0.1:5101");
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = MemberRegistry::new();
        registry.add(gate(1)).unwrap();
        assert!(registry.remove("gate-1").is_some());
        assert!(registry.remove("gate-1").is_none());
        assert!(registry.list_by_type("gate").is_empty());
    }

    #[test]
    fn type_buckets_preserve_insertion_order() {
        let registry = MemberRegistry::new();
        registry.add(gate(2)).unwrap();
        registry.add(Member::new("center-1", "center", "127.0.0.1:4000")).unwrap();
        registry.add(gate(1)).unwrap();
        registry.add(gate(3)).unwrap();

        let gates: Vec<String> = registry
            .list_by_type("gate")
            .into_iter()
            .map(|m| m.node_id)
            .collect();
        assert_eq!(gates, vec!["gate-2", "gate-1", "gate-3"]);
        assert_eq!(registry.first_of_type("gate").unwrap().node_id, "gate-2");
        assert!(registry.first_of_type("game").is_none());
    }

    #[test]
    fn remove_keeps_bucket_order_for_the_rest() {
        let registry = MemberRegistry::new();
        registry.add(gate(1)).unwrap();
        registry.add(gate(2)).unwrap();
        registry.add(gate(3)).unwrap();
        registry.remove("gate-2");

        let gates: Vec<String> = registry
            .list_by_type("gate")
            .into_iter()
            .map(|m| m.node_id)
            .collect();
        assert_eq!(gates, vec!["gate-1", "gate-3"]);
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let registry = MemberRegistry::new();
        registry.add(gate(1)).unwrap();
        let snap = registry.snapshot();
        registry.add(gate(2)).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(registry.member_count(), 2);
    }
}
