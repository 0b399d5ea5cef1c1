use crate::error::CoreError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sanity cap on the number of groups a single allocation may create.
pub const MAX_GROUP_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipantRole {
    Ordinary,
    Distinguished,
}

impl ParticipantRole {
    /// Storage keeps the role as a 0/1 integer column.
    pub fn from_flag(flag: i64) -> Self {
        if flag != 0 {
            Self::Distinguished
        } else {
            Self::Ordinary
        }
    }

    pub fn as_flag(self) -> i64 {
        match self {
            Self::Ordinary => 0,
            Self::Distinguished => 1,
        }
    }

    pub fn is_distinguished(self) -> bool {
        matches!(self, Self::Distinguished)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BalancePolicy {
    RoundRobin,
    #[default]
    SmallestFirst,
}

impl BalancePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "roundRobin" | "round-robin" => Some(Self::RoundRobin),
            "smallestFirst" | "smallest-first" => Some(Self::SmallestFirst),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "roundRobin",
            Self::SmallestFirst => "smallestFirst",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub role: ParticipantRole,
}

impl Candidate {
    pub fn new(id: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Result of one allocation run: `groups[i]` lists the participant ids placed
/// in group index `i`, in placement order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub groups: Vec<Vec<String>>,
}

impl Allocation {
    pub fn sizes(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.len()).collect()
    }

    /// Participant id -> zero-based group index.
    pub fn assignments(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for (idx, members) in self.groups.iter().enumerate() {
            for id in members {
                out.insert(id.clone(), idx);
            }
        }
        out
    }
}

/// Checks a caller-supplied group count before any allocation work is done.
pub fn validate_group_count(count: i64) -> Result<usize, CoreError> {
    if count < 1 || count > MAX_GROUP_COUNT as i64 {
        return Err(CoreError::InvalidGroupCount {
            count,
            max: MAX_GROUP_COUNT,
        });
    }
    Ok(count as usize)
}

pub fn allocate(
    participants: &[Candidate],
    group_count: usize,
    policy: BalancePolicy,
) -> Result<Allocation, CoreError> {
    allocate_with_rng(participants, group_count, policy, &mut rand::thread_rng())
}

/// Spreads distinguished participants one per group first, then distributes
/// everyone else according to `policy`.
///
/// Both subsets are permuted with a uniform Fisher-Yates shuffle. Under
/// `SmallestFirst` the final group sizes differ by at most one; under
/// `RoundRobin` the spread is bounded by the distinguished seeding.
pub fn allocate_with_rng<R: Rng + ?Sized>(
    participants: &[Candidate],
    group_count: usize,
    policy: BalancePolicy,
    rng: &mut R,
) -> Result<Allocation, CoreError> {
    if participants.is_empty() {
        return Err(CoreError::EmptyInput);
    }
    let group_count = validate_group_count(group_count as i64)?;

    let (mut distinguished, mut ordinary): (Vec<&Candidate>, Vec<&Candidate>) = participants
        .iter()
        .partition(|c| c.role.is_distinguished());
    distinguished.shuffle(rng);
    ordinary.shuffle(rng);

    let mut groups: Vec<Vec<String>> = vec![Vec::new(); group_count];

    let seeded = distinguished.len().min(group_count);
    for (idx, c) in distinguished.iter().take(seeded).enumerate() {
        groups[idx].push(c.id.clone());
    }

    let pool = distinguished
        .iter()
        .skip(seeded)
        .chain(ordinary.iter())
        .map(|c| c.id.clone());

    match policy {
        BalancePolicy::RoundRobin => {
            for (i, id) in pool.enumerate() {
                groups[i % group_count].push(id);
            }
        }
        BalancePolicy::SmallestFirst => {
            let mut smallest: Vec<usize> = Vec::with_capacity(group_count);
            for id in pool {
                let min = groups.iter().map(|g| g.len()).min().unwrap_or(0);
                smallest.clear();
                smallest.extend(
                    groups
                        .iter()
                        .enumerate()
                        .filter(|(_, g)| g.len() == min)
                        .map(|(i, _)| i),
                );
                let target = smallest.choose(rng).copied().unwrap_or(0);
                groups[target].push(id);
            }
        }
    }

    Ok(Allocation { groups })
}
