//! Actor addressing.

use meridian_wire::Code;

/// Parsed form of `nodeId.actorId` or `nodeId.actorId.childId`.
///
/// Parsing is strict: one or two dots, and every segment non-empty — except
/// the node id, which may be empty to mean "apply the routing policy"
/// (the dispatcher substitutes the local node).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorPath {
    pub node_id: String,
    pub actor_id: String,
    pub child_id: Option<String>,
}

impl ActorPath {
    pub fn new(node_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            actor_id: actor_id.into(),
            child_id: None,
        }
    }

    pub fn with_child(
        node_id: impl Into<String>,
        actor_id: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            actor_id: actor_id.into(),
            child_id: Some(child_id.into()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, Code> {
        let segments: Vec<&str> = raw.split('.').collect();
        let (node_id, actor_id, child_id) = match segments.as_slice() {
            [node, actor] => (*node, *actor, None),
            [node, actor, child] => (*node, *actor, Some(*child)),
            _ => return Err(Code::RouteDecodeError),
        };

        if actor_id.is_empty() || child_id.is_some_and(str::is_empty) {
            return Err(Code::RouteDecodeError);
        }

        Ok(Self {
            node_id: node_id.to_string(),
            actor_id: actor_id.to_string(),
            child_id: child_id.map(str::to_string),
        })
    }
}

impl std::str::FromStr for ActorPath {
    type Err = Code;

    fn from_str(s: &str) -> Result<Self, Code> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ActorPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.child_id {
            Some(child) => write!(f, "{}.{}.{}", self.node_id, self.actor_id, child),
            None => write!(f, "{}.{}", self.node_id, self.actor_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_and_three_segment_paths() {
        let p = ActorPath::parse("center-1.account").unwrap();
        assert_eq!(p.node_id, "center-1");
        assert_eq!(p.actor_id, "account");
        assert!(p.child_id.is_none());

        let p = ActorPath::parse("game-1.room.1001").unwrap();
        assert_eq!(p.child_id.as_deref(), Some("1001"));
    }

    #[test]
    fn empty_node_means_routing_policy() {
        let p = ActorPath::parse(".account").unwrap();
        assert!(p.node_id.is_empty());
        assert_eq!(p.actor_id, "account");
    }

    #[test]
    fn rejects_malformed_paths() {
        for raw in ["", "account", "a.b.c.d", "node.", "node..child", "node.actor."] {
            assert_eq!(ActorPath::parse(raw), Err(Code::RouteDecodeError), "{raw:?}");
        }
    }

    #[test]
    fn display_round_trips() {
        for raw in ["n1.actor", "n1.actor.kid"] {
            assert_eq!(ActorPath::parse(raw).unwrap().to_string(), raw);
        }
    }
}
