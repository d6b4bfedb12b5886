use serde::{Deserialize, Serialize};

/// Priority tier of a ready list. Ordering follows urgency: High > Medium > Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl JobPriority {
    /// All tiers, most urgent first
    pub fn all() -> &'static [JobPriority] {
        &[Self::High, Self::Medium, Self::Low]
    }

    /// Get the numeric value for ordering
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create from numeric value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }

    /// Get human-readable name, also used as the key suffix of ready lists
    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Position in `all()`
    pub(crate) fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Token-bucket weights of the round-robin claimer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: 8,
            medium: 2,
            low: 1,
        }
    }
}

impl PriorityWeights {
    pub fn new(high: u32, medium: u32, low: u32) -> Self {
        Self { high, medium, low }
    }

    pub fn weight(&self, priority: JobPriority) -> u32 {
        match priority {
            JobPriority::High => self.high,
            JobPriority::Medium => self.medium,
            JobPriority::Low => self.low,
        }
    }

    pub fn total(&self) -> u64 {
        self.high as u64 + self.medium as u64 + self.low as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_roundtrips_through_names() {
        for p in JobPriority::all() {
            assert_eq!(p.name().parse::<JobPriority>().unwrap(), *p);
            assert_eq!(JobPriority::from_u8(p.as_u8()), Some(*p));
        }
        assert_eq!("normal".parse::<JobPriority>().unwrap(), JobPriority::Medium);
        assert!("urgent".parse::<JobPriority>().is_err());
    }

    #[test]
    fn all_is_most_urgent_first() {
        let tiers = JobPriority::all();
        assert!(tiers.windows(2).all(|w| w[0] > w[1]));
        for (i, p) in tiers.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }
}
