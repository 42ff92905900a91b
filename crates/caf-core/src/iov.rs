//! Experiment/run coordinates and intervals of validity.
//!
//! An [`Iov`] is the closed range `(exp_low, run_low) ..= (exp_high, run_high)`.
//! A `-1` upper bound is open: `exp_high == -1` (with `run_high == -1`) is valid
//! forever, `run_high == -1` alone covers every run of `exp_high`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IovError {
    #[error("negative lower bound in IoV ({exp_low},{run_low})")]
    NegativeLowerBound { exp_low: i32, run_low: i32 },
    #[error("invalid open bound in IoV: exp_high={exp_high} run_high={run_high}")]
    InvalidOpenBound { exp_high: i32, run_high: i32 },
    #[error("IoV upper bound ({exp_high},{run_high}) precedes lower bound ({exp_low},{run_low})")]
    Inverted {
        exp_low: i32,
        run_low: i32,
        exp_high: i32,
        run_high: i32,
    },
    #[error("malformed IoV '{0}': expected four comma separated integers")]
    Malformed(String),
}

/// An (experiment, run) pair, ordered by experiment then run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct ExpRun {
    pub exp: i32,
    pub run: i32,
}

impl ExpRun {
    pub fn new(exp: i32, run: i32) -> Self {
        Self { exp, run }
    }
}

impl From<(i32, i32)> for ExpRun {
    fn from((exp, run): (i32, i32)) -> Self {
        Self { exp, run }
    }
}

impl From<ExpRun> for (i32, i32) {
    fn from(value: ExpRun) -> Self {
        (value.exp, value.run)
    }
}

impl fmt::Display for ExpRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exp, self.run)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[i32; 4]", into = "[i32; 4]")]
pub struct Iov {
    exp_low: i32,
    run_low: i32,
    exp_high: i32,
    run_high: i32,
}

impl Iov {
    pub fn new(exp_low: i32, run_low: i32, exp_high: i32, run_high: i32) -> Result<Self, IovError> {
        if exp_low < 0 || run_low < 0 {
            return Err(IovError::NegativeLowerBound { exp_low, run_low });
        }
        let bad_open = exp_high < -1
            || run_high < -1
            || (exp_high == -1 && run_high != -1);
        if bad_open {
            return Err(IovError::InvalidOpenBound { exp_high, run_high });
        }
        let iov = Self {
            exp_low,
            run_low,
            exp_high,
            run_high,
        };
        if iov.upper_key() < iov.low() {
            return Err(IovError::Inverted {
                exp_low,
                run_low,
                exp_high,
                run_high,
            });
        }
        Ok(iov)
    }

    /// Valid for every experiment and run.
    pub fn always() -> Self {
        Self {
            exp_low: 0,
            run_low: 0,
            exp_high: -1,
            run_high: -1,
        }
    }

    /// Smallest closed IoV covering every run in `runs`.
    pub fn from_runs(runs: &[ExpRun]) -> Option<Self> {
        let first = runs.iter().min()?;
        let last = runs.iter().max()?;
        Some(Self {
            exp_low: first.exp,
            run_low: first.run,
            exp_high: last.exp,
            run_high: last.run,
        })
    }

    pub fn exp_low(&self) -> i32 {
        self.exp_low
    }

    pub fn run_low(&self) -> i32 {
        self.run_low
    }

    pub fn exp_high(&self) -> i32 {
        self.exp_high
    }

    pub fn run_high(&self) -> i32 {
        self.run_high
    }

    pub fn low(&self) -> ExpRun {
        ExpRun::new(self.exp_low, self.run_low)
    }

    /// Closed upper bound, `None` when the IoV is open-ended.
    pub fn high(&self) -> Option<ExpRun> {
        if self.is_open_ended() {
            None
        } else {
            Some(ExpRun::new(self.exp_high, self.run_high))
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.run_high == -1
    }

    // Upper bound with open ends mapped to i32::MAX so that plain ordering works.
    fn upper_key(&self) -> ExpRun {
        match (self.exp_high, self.run_high) {
            (-1, _) => ExpRun::new(i32::MAX, i32::MAX),
            (exp, -1) => ExpRun::new(exp, i32::MAX),
            (exp, run) => ExpRun::new(exp, run),
        }
    }

    pub fn contains(&self, exprun: ExpRun) -> bool {
        self.low() <= exprun && exprun <= self.upper_key()
    }

    pub fn overlaps(&self, other: &Iov) -> bool {
        self.low() <= other.upper_key() && other.low() <= self.upper_key()
    }

    /// `expLow,runLow,expHigh,runHigh`, as written in `database.txt`.
    pub fn to_wire(&self) -> String {
        format!(
            "{},{},{},{}",
            self.exp_low, self.run_low, self.exp_high, self.run_high
        )
    }
}

impl TryFrom<[i32; 4]> for Iov {
    type Error = IovError;

    fn try_from(v: [i32; 4]) -> Result<Self, Self::Error> {
        Iov::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Iov> for [i32; 4] {
    fn from(iov: Iov) -> Self {
        [iov.exp_low, iov.run_low, iov.exp_high, iov.run_high]
    }
}

impl fmt::Display for Iov {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.exp_low, self.run_low, self.exp_high, self.run_high
        )
    }
}

impl FromStr for Iov {
    type Err = IovError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let parts = trimmed
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| IovError::Malformed(s.to_string()))?;
        match parts.as_slice() {
            [el, rl, eh, rh] => Iov::new(*el, *rl, *eh, *rh),
            _ => Err(IovError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_inverted_and_bad_open_bounds() {
        assert!(matches!(
            Iov::new(2, 5, 1, 9),
            Err(IovError::Inverted { .. })
        ));
        assert!(matches!(
            Iov::new(1, 5, 1, 4),
            Err(IovError::Inverted { .. })
        ));
        assert!(matches!(
            Iov::new(1, 1, -1, 3),
            Err(IovError::InvalidOpenBound { .. })
        ));
        assert!(matches!(
            Iov::new(-1, 0, 1, 1),
            Err(IovError::NegativeLowerBound { .. })
        ));
        assert!(Iov::new(1, 1, 1, -1).is_ok());
        assert!(Iov::new(1, 7, -1, -1).is_ok());
        assert!(Iov::new(3, 4, 3, 4).is_ok());
    }

    #[test]
    fn contains_handles_open_ends() {
        let open_run = Iov::new(1, 1, 1, -1).expect("iov");
        assert!(open_run.contains(ExpRun::new(1, 1)));
        assert!(open_run.contains(ExpRun::new(1, 100_000)));
        assert!(!open_run.contains(ExpRun::new(2, 0)));
        assert!(!open_run.contains(ExpRun::new(0, 5)));

        let forever = Iov::new(2, 3, -1, -1).expect("iov");
        assert!(forever.contains(ExpRun::new(9, 0)));
        assert!(!forever.contains(ExpRun::new(2, 2)));

        let closed = Iov::new(1, 5, 2, 3).expect("iov");
        assert!(closed.contains(ExpRun::new(1, 900)));
        assert!(closed.contains(ExpRun::new(2, 3)));
        assert!(!closed.contains(ExpRun::new(2, 4)));
    }

    #[test]
    fn overlaps_is_symmetric() {
        let a = Iov::new(1, 1, 1, 10).expect("iov");
        let b = Iov::new(1, 10, 1, -1).expect("iov");
        let c = Iov::new(1, 11, 2, 0).expect("iov");
        assert!(a.overlaps(&b) && b.overlaps(&a));
        assert!(!a.overlaps(&c) && !c.overlaps(&a));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn from_runs_spans_min_to_max() {
        let runs = vec![ExpRun::new(1, 7), ExpRun::new(1, 2), ExpRun::new(2, 1)];
        let iov = Iov::from_runs(&runs).expect("non-empty");
        assert_eq!(iov.to_string(), "(1,2,2,1)");
        assert!(Iov::from_runs(&[]).is_none());
    }

    #[test]
    fn wire_and_display_formats_parse_back() {
        let iov: Iov = "1,1,1,-1".parse().expect("wire");
        assert_eq!(iov.to_wire(), "1,1,1,-1");
        let iov: Iov = "(0, 0, -1, -1)".parse().expect("display");
        assert_eq!(iov, Iov::always());
        assert!(matches!(
            "1,2,3".parse::<Iov>(),
            Err(IovError::Malformed(_))
        ));
    }

    #[test]
    fn serde_uses_four_integer_arrays() {
        let iov = Iov::new(1, 1, 1, -1).expect("iov");
        let json = serde_json::to_string(&iov).expect("serialize");
        assert_eq!(json, "[1,1,1,-1]");
        let err = serde_json::from_str::<Iov>("[3,0,1,0]");
        assert!(err.is_err());
        let runs: Vec<ExpRun> = serde_json::from_str("[[1,2],[1,3]]").expect("runs");
        assert_eq!(runs, vec![ExpRun::new(1, 2), ExpRun::new(1, 3)]);
    }
}
