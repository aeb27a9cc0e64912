//! Template iteration arguments.
//!
//! A template may carry a list of argument specs. Every combination of their values produces one
//! set of frames, enumerated like an odometer: the last spec turns fastest and the sequence ends
//! once the first spec wraps around.
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One argument value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    Int(i64),
    Str(String),
}

/// A description of the values one argument runs through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub enum ArgSpec {
    /// An arithmetic progression from `begin` to `end`, inclusive.
    SimpleFor {
        #[serde(default = "one")]
        begin: i64,
        #[serde(default = "one")]
        step: i64,
        end: i64,
    },
    /// An explicit list of integers.
    IntSeq(Vec<i64>),
    /// An explicit list of strings.
    StrSeq(Vec<String>),
}

fn one() -> i64 {
    1
}

impl ArgSpec {
    /// Shorthand for a `simple-for` spec.
    pub fn simple_for(begin: i64, step: i64, end: i64) -> Self {
        ArgSpec::SimpleFor { begin, step, end }
    }

    /// Check that the spec produces at least one value and is well formed.
    pub fn validate(&self) -> Result<()> {
        match self {
            ArgSpec::SimpleFor { step: 0, .. } => {
                Err(Error::BadNds("simple-for with zero step".into()))
            },
            _ if self.len() == 0 => Err(Error::BadNds(format!("argument spec {} is empty", self))),
            _ => Ok(()),
        }
    }

    /// Number of values, `(end - begin) / step + 1` for a progression.
    pub fn len(&self) -> usize {
        match *self {
            ArgSpec::SimpleFor { begin, step, end } => {
                let span = i128::from(end) - i128::from(begin);
                if step == 0 || span.signum() * i128::from(step.signum()) < 0 {
                    return 0;
                }
                (span / i128::from(step) + 1) as usize
            },
            ArgSpec::IntSeq(ref values) => values.len(),
            ArgSpec::StrSeq(ref values) => values.len(),
        }
    }

    /// Whether the spec has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value at some position, which must be smaller than `len`.
    pub fn value(&self, idx: usize) -> Arg {
        match self {
            ArgSpec::SimpleFor { begin, step, .. } => Arg::Int(begin + step * idx as i64),
            ArgSpec::IntSeq(values) => Arg::Int(values[idx]),
            ArgSpec::StrSeq(values) => Arg::Str(values[idx].clone()),
        }
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArgSpec::SimpleFor { begin, step, end } => {
                write!(f, "simple-for{{{}, {}, {}}}", begin, step, end)
            },
            ArgSpec::IntSeq(values) => write!(f, "int-seq{:?}", values),
            ArgSpec::StrSeq(values) => write!(f, "str-seq{:?}", values),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Arg::Int(value) => write!(f, "{}", value),
            Arg::Str(value) => f.write_str(value),
        }
    }
}

/// The odometer over a list of argument specs.
///
/// Without any spec there is exactly one iteration, with an empty argument array.
#[derive(Debug, Clone)]
pub struct ArgIter<'a> {
    specs: &'a [ArgSpec],
    positions: Vec<usize>,
    done: bool,
}

impl<'a> ArgIter<'a> {
    /// Start iterating, all specs at their first value.
    pub fn new(specs: &'a [ArgSpec]) -> Self {
        ArgIter {
            specs,
            positions: vec![0; specs.len()],
            done: specs.iter().any(ArgSpec::is_empty),
        }
    }

    /// The total number of iterations.
    pub fn total(&self) -> usize {
        self.specs.iter().map(ArgSpec::len).product()
    }

    fn current(&self) -> Vec<Arg> {
        self.specs.iter()
            .zip(&self.positions)
            .map(|(spec, &pos)| spec.value(pos))
            .collect()
    }

    /// Turn the odometer by one; returns false when the first spec wrapped.
    fn advance(&mut self) -> bool {
        for idx in (0..self.specs.len()).rev() {
            self.positions[idx] += 1;
            if self.positions[idx] < self.specs[idx].len() {
                return true;
            }
            self.positions[idx] = 0;
        }
        false
    }
}

impl Iterator for ArgIter<'_> {
    type Item = Vec<Arg>;

    fn next(&mut self) -> Option<Vec<Arg>> {
        if self.done {
            return None;
        }
        let args = self.current();
        self.done = !self.advance();
        Some(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(args: Vec<Arg>) -> Vec<i64> {
        args.into_iter().map(|arg| match arg {
            Arg::Int(value) => value,
            Arg::Str(_) => panic!("not an integer"),
        }).collect()
    }

    #[test]
    fn odometer_order() {
        let specs = [ArgSpec::simple_for(1, 1, 3), ArgSpec::simple_for(10, 10, 20)];
        let iter = ArgIter::new(&specs);
        assert_eq!(iter.total(), 6);
        let all: Vec<_> = iter.map(ints).collect();
        assert_eq!(all, vec![
            vec![1, 10], vec![1, 20],
            vec![2, 10], vec![2, 20],
            vec![3, 10], vec![3, 20],
        ]);
    }

    #[test]
    fn no_specs_is_one_iteration() {
        let mut iter = ArgIter::new(&[]);
        assert_eq!(iter.next(), Some(vec![]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn lengths() {
        assert_eq!(ArgSpec::simple_for(1, 2, 6).len(), 3);
        assert_eq!(ArgSpec::simple_for(5, -1, 1).len(), 5);
        assert_eq!(ArgSpec::simple_for(5, 1, 1).len(), 0);
        assert_eq!(ArgSpec::simple_for(1, 0, 1).len(), 0);
        assert!(ArgSpec::simple_for(1, 0, 1).validate().is_err());
        assert!(ArgSpec::IntSeq(vec![]).validate().is_err());
        assert!(ArgSpec::StrSeq(vec!["a".into()]).validate().is_ok());
    }

    #[test]
    fn mixed_kinds() {
        let specs = [
            ArgSpec::StrSeq(vec!["a".into(), "b".into()]),
            ArgSpec::IntSeq(vec![7]),
        ];
        let all: Vec<_> = ArgIter::new(&specs).collect();
        assert_eq!(all, vec![
            vec![Arg::Str("a".into()), Arg::Int(7)],
            vec![Arg::Str("b".into()), Arg::Int(7)],
        ]);
    }

    #[test]
    fn defaults_from_text() {
        let spec: ArgSpec = serde_json::from_str(r#"{"simple-for": {"end": 3}}"#).unwrap();
        assert_eq!(spec, ArgSpec::simple_for(1, 1, 3));
        let spec: ArgSpec = serde_json::from_str(r#"{"int-seq": [4, 5]}"#).unwrap();
        assert_eq!(spec.len(), 2);
        assert!(serde_json::from_str::<ArgSpec>(r#"{"simple-for": {"begin": 3}}"#).is_err());
    }
}
