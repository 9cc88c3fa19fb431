use serde::{Deserialize, Serialize};

/// Lifecycle status shared by entities, members, masters, OpKeys, objects and
/// device nodes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Status {
    Pending = 1,
    Alive = 2,
    Migrating = 3,
    Migrated = 4,
    Deleted = 5,
    Failed = 6,
}

impl Status {
    pub fn is_alive(&self) -> bool {
        matches!(self, Status::Alive)
    }

    /// Terminal for the holder: no further writes accepted.
    pub fn is_closed(&self) -> bool {
        matches!(self, Status::Migrated | Status::Deleted | Status::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Alive => "alive",
            Status::Migrating => "migrating",
            Status::Migrated => "migrated",
            Status::Deleted => "deleted",
            Status::Failed => "failed",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Status::Pending),
            2 => Some(Status::Alive),
            3 => Some(Status::Migrating),
            4 => Some(Status::Migrated),
            5 => Some(Status::Deleted),
            6 => Some(Status::Failed),
            _ => None,
        }
    }

    /// Entity state machine:
    ///
    /// ```text
    /// pending ──create-accepted──▶ alive ──migration-start──▶ migrating ──complete──▶ alive'
    ///   │                            │                            └──handoff──▶ migrated
    ///   └── creation-failed ─▶ failed└── delete-accepted ─▶ deleted
    /// ```
    pub fn entity_can_transition(from: Status, to: Status) -> bool {
        use Status::*;
        matches!(
            (from, to),
            (Pending, Alive)
                | (Pending, Failed)
                | (Alive, Migrating)
                | (Alive, Deleted)
                | (Alive, Migrated)
                | (Migrating, Alive)
                | (Migrating, Migrated)
        ) || from == to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_transitions() {
        assert!(Status::entity_can_transition(Status::Pending, Status::Alive));
        assert!(Status::entity_can_transition(Status::Pending, Status::Failed));
        assert!(Status::entity_can_transition(Status::Alive, Status::Migrating));
        assert!(Status::entity_can_transition(Status::Migrating, Status::Alive));
        assert!(Status::entity_can_transition(Status::Alive, Status::Deleted));
        assert!(!Status::entity_can_transition(Status::Deleted, Status::Alive));
        assert!(!Status::entity_can_transition(Status::Failed, Status::Alive));
        assert!(!Status::entity_can_transition(Status::Pending, Status::Deleted));
    }

    #[test]
    fn test_from_u8_roundtrip() {
        for s in [
            Status::Pending,
            Status::Alive,
            Status::Migrating,
            Status::Migrated,
            Status::Deleted,
            Status::Failed,
        ] {
            assert_eq!(Status::from_u8(s as u8), Some(s));
        }
        assert_eq!(Status::from_u8(0), None);
    }
}
