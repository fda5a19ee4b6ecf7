//! Sorted-unique merge of seq lists.
//!
//! Both strategies take ascending inputs (duplicates tolerated) and must
//! return bit-identical output. The strategy is picked once from
//! [`ClientConfig`](crate::config::ClientConfig) when the core starts.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub trait SeqMergeStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Ascending union of both lists without duplicates.
    fn merge(&self, existing: &[u64], incoming: &[u64]) -> Vec<u64>;

    /// Ascending values of `incoming` that are absent from `existing`.
    fn diff(&self, existing: &[u64], incoming: &[u64]) -> Vec<u64>;
}

/// Linear merge walking both lists once.
#[derive(Debug, Default, Clone, Copy)]
pub struct TwoPointerMerge;

impl SeqMergeStrategy for TwoPointerMerge {
    fn name(&self) -> &'static str {
        "two-pointer"
    }

    fn merge(&self, existing: &[u64], incoming: &[u64]) -> Vec<u64> {
        let mut out = Vec::with_capacity(existing.len() + incoming.len());
        let (mut i, mut j) = (0, 0);

        while i < existing.len() || j < incoming.len() {
            let next = if j >= incoming.len() || (i < existing.len() && existing[i] <= incoming[j])
            {
                i += 1;
                existing[i - 1]
            } else {
                j += 1;
                incoming[j - 1]
            };
            if out.last() != Some(&next) {
                out.push(next);
            }
        }
        out
    }

    fn diff(&self, existing: &[u64], incoming: &[u64]) -> Vec<u64> {
        let mut out: Vec<u64> = Vec::new();
        let mut i = 0;

        for &b in incoming {
            if out.last() == Some(&b) {
                continue;
            }
            while i < existing.len() && existing[i] < b {
                i += 1;
            }
            if i < existing.len() && existing[i] == b {
                continue;
            }
            out.push(b);
        }
        out
    }
}

/// Concatenate, sort, dedup. Slower on large chats but trivially correct.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortDedupMerge;

impl SeqMergeStrategy for SortDedupMerge {
    fn name(&self) -> &'static str {
        "sort-dedup"
    }

    fn merge(&self, existing: &[u64], incoming: &[u64]) -> Vec<u64> {
        let mut out = Vec::with_capacity(existing.len() + incoming.len());
        out.extend_from_slice(existing);
        out.extend_from_slice(incoming);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn diff(&self, existing: &[u64], incoming: &[u64]) -> Vec<u64> {
        let known: BTreeSet<u64> = existing.iter().copied().collect();
        let fresh: BTreeSet<u64> = incoming
            .iter()
            .copied()
            .filter(|s| !known.contains(s))
            .collect();
        fresh.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategyKind {
    #[default]
    TwoPointer,
    SortDedup,
}

impl MergeStrategyKind {
    pub fn build(self) -> Box<dyn SeqMergeStrategy> {
        match self {
            Self::TwoPointer => Box::new(TwoPointerMerge),
            Self::SortDedup => Box::new(SortDedupMerge),
        }
    }
}

impl FromStr for MergeStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "two-pointer" => Ok(Self::TwoPointer),
            "sort-dedup" => Ok(Self::SortDedup),
            other => Err(format!("unknown merge strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sorted_with_dups(rng: &mut StdRng, len: usize, max: u64) -> Vec<u64> {
        let mut v: Vec<u64> = (0..len).map(|_| rng.gen_range(1..=max)).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn strategies_agree_on_random_inputs() {
        let mut rng = StdRng::seed_from_u64(0x5e91);
        let a = TwoPointerMerge;
        let b = SortDedupMerge;
        for round in 0..500 {
            let n = rng.gen_range(0..80);
            let existing = sorted_with_dups(&mut rng, n, 200);
            let n = rng.gen_range(0..80);
            let incoming = sorted_with_dups(&mut rng, n, 200);
            assert_eq!(
                a.merge(&existing, &incoming),
                b.merge(&existing, &incoming),
                "merge diverged in round {round}"
            );
            assert_eq!(
                a.diff(&existing, &incoming),
                b.diff(&existing, &incoming),
                "diff diverged in round {round}"
            );
        }
    }

    #[test]
    fn merge_drops_duplicates() {
        let m = TwoPointerMerge;
        assert_eq!(m.merge(&[1, 3, 3, 5], &[2, 3, 6, 6]), vec![1, 2, 3, 5, 6]);
        assert_eq!(m.merge(&[], &[4, 4]), vec![4]);
        assert_eq!(m.diff(&[1, 3, 5], &[1, 2, 2, 5, 7]), vec![2, 7]);
    }

    #[test]
    fn kind_parses_and_builds() {
        let kind: MergeStrategyKind = "sort-dedup".parse().unwrap();
        assert_eq!(kind.build().name(), "sort-dedup");
        assert!("fastest".parse::<MergeStrategyKind>().is_err());
    }
}
