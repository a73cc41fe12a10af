// ABOUTME: Absolute-or-percentage pool fractions for rolling update bounds.
// ABOUTME: Accepts a bare integer or an "N%" string, percentages round up.

use serde::{Deserialize, Deserializer};

/// `max_unavailable` / `max_surge` style bound: either an absolute
/// instance count or a percentage of the pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFraction {
    Count(usize),
    Percent(u32),
}

impl PoolFraction {
    /// Resolve against a concrete pool size. Percentages round up, so
    /// `"25%"` of 5 instances is 2, never 0 for a non-zero percentage.
    pub fn resolve(&self, pool_size: usize) -> usize {
        match self {
            PoolFraction::Count(n) => *n,
            PoolFraction::Percent(p) => {
                (*p as usize * pool_size).div_ceil(100)
            }
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if let Some(percent) = s.strip_suffix('%') {
            let value: u32 = percent
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage: {s:?}"))?;
            if value > 100 {
                return Err(format!("percentage out of range: {s:?}"));
            }
            Ok(PoolFraction::Percent(value))
        } else {
            let value: usize = s.parse().map_err(|_| format!("invalid count: {s:?}"))?;
            Ok(PoolFraction::Count(value))
        }
    }
}

impl std::fmt::Display for PoolFraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolFraction::Count(n) => write!(f, "{n}"),
            PoolFraction::Percent(p) => write!(f, "{p}%"),
        }
    }
}

impl<'de> Deserialize<'de> for PoolFraction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(usize),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(PoolFraction::Count(n)),
            Raw::Text(s) => PoolFraction::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}
