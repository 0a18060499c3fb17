//! The job's persisted program counter.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use storyforge_core::DomainError;

/// Next unit of work for a job.
///
/// A step always names work that has *not* happened yet, so repeating a tick
/// after a crash re-runs at most one unit. The wire form (`write_ch0_s1`) is
/// only produced and parsed at the persistence boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Step {
    Created,
    Constitution,
    Plan,
    Write { chapter: u32, section: u32 },
    Finalize,
    Complete,
}

impl Step {
    pub fn write(chapter: u32, section: u32) -> Self {
        Self::Write { chapter, section }
    }

    /// The first writing step after planning.
    pub fn first_section() -> Self {
        Self::write(0, 0)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Complete)
    }

    /// Total order over steps: phase first, then chapter and section.
    pub fn ordinal(&self) -> (u8, u32, u32) {
        match *self {
            Step::Created => (0, 0, 0),
            Step::Constitution => (1, 0, 0),
            Step::Plan => (2, 0, 0),
            Step::Write { chapter, section } => (3, chapter, section),
            Step::Finalize => (4, 0, 0),
            Step::Complete => (5, 0, 0),
        }
    }
}

impl PartialOrd for Step {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Step {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.ordinal().cmp(&other.ordinal())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Created => f.write_str("created"),
            Step::Constitution => f.write_str("constitution"),
            Step::Plan => f.write_str("plan"),
            Step::Write { chapter, section } => write!(f, "write_ch{chapter}_s{section}"),
            Step::Finalize => f.write_str("finalize"),
            Step::Complete => f.write_str("complete"),
        }
    }
}

impl FromStr for Step {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => return Ok(Step::Created),
            "constitution" => return Ok(Step::Constitution),
            "plan" => return Ok(Step::Plan),
            "finalize" => return Ok(Step::Finalize),
            "complete" => return Ok(Step::Complete),
            _ => {}
        }

        let invalid = || DomainError::invalid_id(format!("unknown step: {s:?}"));
        let rest = s.strip_prefix("write_ch").ok_or_else(invalid)?;
        let (chapter, section) = rest.split_once("_s").ok_or_else(invalid)?;
        let parse = |digits: &str| {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            digits.parse::<u32>().map_err(|_| invalid())
        };

        Ok(Step::Write {
            chapter: parse(chapter)?,
            section: parse(section)?,
        })
    }
}

impl TryFrom<String> for Step {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Step> for String {
    fn from(step: Step) -> Self {
        step.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_known_steps() {
        assert_eq!("created".parse::<Step>().unwrap(), Step::Created);
        assert_eq!("finalize".parse::<Step>().unwrap(), Step::Finalize);
        assert_eq!("write_ch3_s12".parse::<Step>().unwrap(), Step::write(3, 12));
    }

    #[test]
    fn rejects_malformed_write_steps() {
        for bad in ["write_ch_s1", "write_ch1_s", "write_ch1", "write_chx_s1", "write_ch-1_s0", "writing"] {
            assert!(bad.parse::<Step>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&Step::write(1, 0)).unwrap();
        assert_eq!(json, "\"write_ch1_s0\"");
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Step::write(1, 0));
    }

    #[test]
    fn orders_by_phase_then_position() {
        assert!(Step::Plan < Step::first_section());
        assert!(Step::write(0, 5) < Step::write(1, 0));
        assert!(Step::write(9, 9) < Step::Finalize);
        assert!(Step::Finalize < Step::Complete);
    }

    proptest! {
        #[test]
        fn write_steps_survive_the_wire_format(chapter in 0u32..10_000, section in 0u32..10_000) {
            let step = Step::write(chapter, section);
            prop_assert_eq!(step.to_string().parse::<Step>().unwrap(), step);
        }
    }
}
