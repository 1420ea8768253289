use serde::{Deserialize, Serialize};
use wire_proto::ChunkPartType;

use crate::{FsError, FsResult};

/// Replication goal ids: 1..=9 mean that many standard replicas,
/// `XOR_GOAL_BASE + L` means an XOR stripe of level L.
pub const XOR_GOAL_BASE: u8 = 0x10;
pub const DEFAULT_GOAL: u8 = 2;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Goal {
    pub id: u8,
    pub name: String,
}

impl Goal {
    pub fn is_valid_id(id: u8) -> bool {
        (1..=9).contains(&id) || (XOR_GOAL_BASE + 2..=XOR_GOAL_BASE + 9).contains(&id)
    }

    pub fn from_id(id: u8) -> FsResult<Goal> {
        if !Self::is_valid_id(id) {
            return Err(FsError::Inval);
        }
        let name = if id <= 9 {
            id.to_string()
        } else {
            format!("xor{}", id - XOR_GOAL_BASE)
        };
        Ok(Goal { id, name })
    }

    pub fn from_name(name: &str) -> FsResult<Goal> {
        if let Some(level) = name.strip_prefix("xor") {
            let level: u8 = level.parse().map_err(|_| FsError::Inval)?;
            return Goal::from_id(XOR_GOAL_BASE + level);
        }
        let copies: u8 = name.parse().map_err(|_| FsError::Inval)?;
        Goal::from_id(copies)
    }

    /// The chunk parts a healthy chunk with this goal is stored as.
    pub fn parts(&self) -> Vec<ChunkPartType> {
        if self.id <= 9 {
            vec![ChunkPartType::Standard; self.id as usize]
        } else {
            let level = self.id - XOR_GOAL_BASE;
            (1..=level + 1)
                .map(|piece| ChunkPartType::Xor { level, piece })
                .collect()
        }
    }

    /// Physical bytes occupied per logical byte, as a (num, den) ratio.
    pub fn expansion(&self) -> (u64, u64) {
        if self.id <= 9 {
            (self.id as u64, 1)
        } else {
            let level = (self.id - XOR_GOAL_BASE) as u64;
            (level + 1, level)
        }
    }

    pub fn real_size(&self, size: u64) -> u64 {
        let (num, den) = self.expansion();
        size * num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_names_round_trip() {
        assert_eq!(Goal::from_name("2").unwrap().id, 2);
        assert_eq!(Goal::from_name("xor3").unwrap().name, "xor3");
        assert!(Goal::from_name("xor1").is_err());
        assert!(Goal::from_name("0").is_err());
        assert!(Goal::from_name("raid6").is_err());
    }

    #[test]
    fn xor_goal_parts() {
        let goal = Goal::from_name("xor3").unwrap();
        assert_eq!(goal.parts().len(), 4);
        assert_eq!(goal.real_size(300), 400);
        let two = Goal::from_name("2").unwrap();
        assert_eq!(two.parts().len(), 2);
        assert_eq!(two.real_size(300), 600);
    }
}
