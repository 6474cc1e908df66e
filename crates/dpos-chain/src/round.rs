//! Rounds, milestones and forging slots.
//!
//! A round is a run of `active_delegates` consecutive heights. Milestones
//! change the round size and block time from a given height on; milestone
//! heights are expected to fall on round boundaries.

use crate::error::{ChainError, ChainResult};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol parameters effective from `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub height: u32,
    /// Number of forging delegates per round.
    pub active_delegates: u32,
    /// Seconds per slot.
    pub block_time: u32,
}

/// Position of a height within the round schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub round: u32,
    /// First height of the round.
    pub round_height: u32,
    pub next_round: u32,
    /// Delegates forging in this round.
    pub max_delegates: u32,
}

impl RoundInfo {
    /// Last height of the round.
    pub fn last_height(&self) -> u32 {
        self.round_height + self.max_delegates - 1
    }

    pub fn contains(&self, height: u32) -> bool {
        height >= self.round_height && height <= self.last_height()
    }
}

/// Per-height block time.
pub trait BlockTimeLookup: Send + Sync {
    fn block_time(&self, height: u32) -> u32;
}

/// Ordered milestone list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Milestones {
    list: Vec<Milestone>,
}

impl Milestones {
    /// Build a schedule. The first milestone must start at height 1.
    pub fn new(mut list: Vec<Milestone>) -> ChainResult<Self> {
        list.sort_by_key(|m| m.height);
        match list.first() {
            Some(first) if first.height == 1 => {}
            _ => {
                return Err(ChainError::InvalidMilestones(
                    "first milestone must start at height 1".into(),
                ))
            }
        }
        if let Some(m) = list.iter().find(|m| m.active_delegates == 0 || m.block_time == 0) {
            return Err(ChainError::InvalidMilestones(format!(
                "milestone at {} has zero delegates or block time",
                m.height
            )));
        }
        if list.windows(2).any(|w| w[0].height == w[1].height) {
            return Err(ChainError::InvalidMilestones("duplicate milestone height".into()));
        }
        Ok(Self { list })
    }

    /// Single-milestone schedule.
    pub fn single(active_delegates: u32, block_time: u32) -> ChainResult<Self> {
        Self::new(vec![Milestone {
            height: 1,
            active_delegates,
            block_time,
        }])
    }

    /// Milestone in effect at `height`.
    pub fn at(&self, height: u32) -> &Milestone {
        self.list
            .iter()
            .rev()
            .find(|m| m.height <= height)
            .unwrap_or(&self.list[0])
    }

    /// Round schedule position of `height`.
    pub fn round_info(&self, height: u32) -> RoundInfo {
        let height = height.max(1);
        let mut round = 1;
        let mut round_height = 1;
        let mut delegates = self.list[0].active_delegates;

        for next in self.list.iter().skip(1) {
            if next.height > height {
                break;
            }
            let rounds = (next.height - round_height) / delegates;
            round += rounds;
            round_height += rounds * delegates;
            delegates = next.active_delegates;
        }

        let offset = (height - round_height) / delegates;
        round += offset;
        round_height += offset * delegates;

        RoundInfo {
            round,
            round_height,
            next_round: round + 1,
            max_delegates: delegates,
        }
    }
}

impl BlockTimeLookup for Milestones {
    fn block_time(&self, height: u32) -> u32 {
        self.at(height).block_time
    }
}

/// Slot clock anchored at the network epoch.
#[derive(Debug, Clone, Copy)]
pub struct Slots {
    /// Unix seconds of the network epoch.
    epoch: u64,
}

impl Slots {
    pub fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    /// Seconds elapsed since the network epoch.
    pub fn epoch_time(&self) -> u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now.saturating_sub(self.epoch).min(u32::MAX as u64) as u32
    }

    /// Slot containing `timestamp`, using the block time effective at `height`.
    pub fn slot_number(lookup: &dyn BlockTimeLookup, height: u32, timestamp: u32) -> u32 {
        timestamp / lookup.block_time(height).max(1)
    }

    /// Current slot at our tip height.
    pub fn current_slot(&self, lookup: &dyn BlockTimeLookup, height: u32) -> u32 {
        Self::slot_number(lookup, height, self.epoch_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn milestone(height: u32, active_delegates: u32, block_time: u32) -> Milestone {
        Milestone {
            height,
            active_delegates,
            block_time,
        }
    }

    #[test]
    fn test_round_info_single_milestone() {
        let m = Milestones::single(51, 8).unwrap();

        let r = m.round_info(1);
        assert_eq!((r.round, r.round_height, r.max_delegates), (1, 1, 51));
        assert_eq!(r.last_height(), 51);

        let r = m.round_info(51);
        assert_eq!(r.round, 1);

        let r = m.round_info(52);
        assert_eq!((r.round, r.round_height, r.next_round), (2, 52, 3));
        assert!(r.contains(102));
        assert!(!r.contains(103));
    }

    #[test]
    fn test_round_info_across_milestones() {
        // Rounds of 10 for heights 1..=100, rounds of 20 afterwards.
        let m = Milestones::new(vec![milestone(1, 10, 8), milestone(101, 20, 6)]).unwrap();

        let r = m.round_info(100);
        assert_eq!((r.round, r.round_height, r.max_delegates), (10, 91, 10));

        let r = m.round_info(101);
        assert_eq!((r.round, r.round_height, r.max_delegates), (11, 101, 20));

        let r = m.round_info(145);
        assert_eq!((r.round, r.round_height), (13, 141));

        assert_eq!(m.block_time(50), 8);
        assert_eq!(m.block_time(101), 6);
    }

    #[test]
    fn test_invalid_milestones() {
        assert!(Milestones::new(vec![]).is_err());
        assert!(Milestones::new(vec![milestone(5, 10, 8)]).is_err());
        assert!(Milestones::new(vec![milestone(1, 0, 8)]).is_err());
        assert!(Milestones::new(vec![milestone(1, 10, 8), milestone(1, 5, 8)]).is_err());
    }

    #[test]
    fn test_slot_number() {
        let m = Milestones::single(51, 8).unwrap();
        assert_eq!(Slots::slot_number(&m, 1, 0), 0);
        assert_eq!(Slots::slot_number(&m, 1, 7), 0);
        assert_eq!(Slots::slot_number(&m, 1, 8), 1);
        assert_eq!(Slots::slot_number(&m, 1, 800), 100);
    }
}
