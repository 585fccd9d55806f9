//! Interleaving policies
//!
//! A policy only orders the eligible threads at a decision point. The first
//! thread is explored now; the rest are remembered for backtracking, so every
//! policy eventually enumerates the same interleavings, in a different order.

use std::fmt;
use std::str::FromStr;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterleavingPolicy {
    /// The next thread after the current one, cyclically
    #[default]
    RoundRobin,
    /// Lowest thread index first
    Sequential,
    /// Seeded shuffle; the same seed gives the same order
    Random { seed: u64 },
}

impl InterleavingPolicy {
    /// Order `candidates` (thread ids) for a decision taken while `current`
    /// runs. `decision` numbers the decision along the path and only feeds
    /// the random policy.
    pub fn order(&self, current: usize, candidates: &[usize], decision: u64) -> Vec<usize> {
        let mut out = candidates.to_vec();
        match self {
            InterleavingPolicy::Sequential => out.sort_unstable(),
            InterleavingPolicy::RoundRobin => {
                let n = candidates.iter().copied().max().unwrap_or(0).max(current) + 1;
                out.sort_by_key(|&tid| (tid + n - current - 1) % n);
            }
            InterleavingPolicy::Random { seed } => {
                out.sort_unstable();
                let mut rng = ChaCha8Rng::seed_from_u64(
                    seed.wrapping_add(decision.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
                );
                out.shuffle(&mut rng);
            }
        }
        out
    }
}

impl fmt::Display for InterleavingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterleavingPolicy::RoundRobin => write!(f, "round-robin"),
            InterleavingPolicy::Sequential => write!(f, "sequential"),
            InterleavingPolicy::Random { seed } => write!(f, "random:{}", seed),
        }
    }
}

impl FromStr for InterleavingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        match lower.as_str() {
            "round-robin" | "roundrobin" | "rr" => return Ok(InterleavingPolicy::RoundRobin),
            "sequential" | "seq" => return Ok(InterleavingPolicy::Sequential),
            "random" => return Ok(InterleavingPolicy::Random { seed: 0 }),
            _ => {}
        }
        if let Some(seed) = lower.strip_prefix("random:") {
            let seed = seed
                .parse()
                .map_err(|_| format!("invalid random seed: '{}'", seed))?;
            return Ok(InterleavingPolicy::Random { seed });
        }
        Err(format!(
            "Unknown interleaving policy: '{}'. Valid options: round-robin, sequential, random[:SEED]",
            s
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_starts_after_current() {
        let p = InterleavingPolicy::RoundRobin;
        assert_eq!(p.order(1, &[0, 1, 2, 3], 0), vec![2, 3, 0, 1]);
        assert_eq!(p.order(3, &[0, 2, 3], 0), vec![0, 2, 3]);
        assert_eq!(p.order(0, &[2, 0], 0), vec![2, 0]);
    }

    #[test]
    fn test_sequential_is_sorted() {
        let p = InterleavingPolicy::Sequential;
        assert_eq!(p.order(2, &[3, 1, 2], 0), vec![1, 2, 3]);
    }

    #[test]
    fn test_random_is_deterministic_per_seed() {
        let p = InterleavingPolicy::Random { seed: 7 };
        let candidates: Vec<usize> = (0..8).collect();
        let a = p.order(0, &candidates, 3);
        let b = p.order(0, &[7, 6, 5, 4, 3, 2, 1, 0], 3);
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, candidates);
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("rr".parse::<InterleavingPolicy>().unwrap(), InterleavingPolicy::RoundRobin);
        assert_eq!(
            "random:42".parse::<InterleavingPolicy>().unwrap(),
            InterleavingPolicy::Random { seed: 42 }
        );
        assert_eq!(InterleavingPolicy::Random { seed: 5 }.to_string(), "random:5");
        assert!("fifo".parse::<InterleavingPolicy>().is_err());
    }
}
