//! Argument conditions.
//!
//! A condition compares one of the six syscall arguments against a constant.
//! All comparisons are unsigned and 64 bits wide; the program compiler splits
//! them into 32-bit halves.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConditionError;

/// Number of syscall argument slots.
pub const ARG_COUNT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "ne")]
    NotEqual,
    #[serde(rename = "lt")]
    Less,
    #[serde(rename = "le")]
    LessEqual,
    #[serde(rename = "eq")]
    Equal,
    #[serde(rename = "ge")]
    GreaterEqual,
    #[serde(rename = "gt")]
    Greater,
    /// `(arg & operand1) == operand2`
    #[serde(rename = "masked_eq")]
    MaskedEqual,
    #[serde(skip)]
    Invalid,
}

impl CompareOp {
    /// Decodes a raw operator value (`1..=7`, `SCMP_CMP_*` order).
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => CompareOp::NotEqual,
            2 => CompareOp::Less,
            3 => CompareOp::LessEqual,
            4 => CompareOp::Equal,
            5 => CompareOp::GreaterEqual,
            6 => CompareOp::Greater,
            7 => CompareOp::MaskedEqual,
            _ => CompareOp::Invalid,
        }
    }

    /// Number of operands the operator takes.
    pub const fn operand_count(self) -> usize {
        match self {
            CompareOp::MaskedEqual => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::NotEqual => "NE",
            CompareOp::Less => "LT",
            CompareOp::LessEqual => "LE",
            CompareOp::Equal => "EQ",
            CompareOp::GreaterEqual => "GE",
            CompareOp::Greater => "GT",
            CompareOp::MaskedEqual => "MASKED_EQ",
            CompareOp::Invalid => "INVALID",
        })
    }
}

/// A validated comparison on one syscall argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition {
    arg: u32,
    op: CompareOp,
    operand1: u64,
    operand2: u64,
}

impl Condition {
    /// Builds a condition on argument `arg`.
    ///
    /// `MaskedEqual` takes `[mask, value]`, every other operator a single
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError`] if `arg` is not below [`ARG_COUNT`], `op`
    /// is `Invalid`, or the operand count does not fit `op`.
    pub fn new(arg: u32, op: CompareOp, operands: &[u64]) -> Result<Self, ConditionError> {
        if arg >= ARG_COUNT {
            return Err(ConditionError::ArgumentOutOfRange {
                index: arg,
                max: ARG_COUNT - 1,
            });
        }
        if op == CompareOp::Invalid {
            return Err(ConditionError::InvalidOperator);
        }
        if operands.len() != op.operand_count() {
            return Err(ConditionError::OperandCount {
                op,
                expected: op.operand_count(),
                found: operands.len(),
            });
        }

        Ok(Self {
            arg,
            op,
            operand1: operands[0],
            operand2: operands.get(1).copied().unwrap_or(0),
        })
    }

    pub fn equal(arg: u32, value: u64) -> Result<Self, ConditionError> {
        Self::new(arg, CompareOp::Equal, &[value])
    }

    pub fn masked_equal(arg: u32, mask: u64, value: u64) -> Result<Self, ConditionError> {
        Self::new(arg, CompareOp::MaskedEqual, &[mask, value])
    }

    pub const fn arg(&self) -> u32 {
        self.arg
    }

    pub const fn op(&self) -> CompareOp {
        self.op
    }

    pub const fn operand1(&self) -> u64 {
        self.operand1
    }

    /// Only meaningful for `MaskedEqual`, zero otherwise.
    pub const fn operand2(&self) -> u64 {
        self.operand2
    }

    /// Evaluates the condition against the argument value `value`.
    pub const fn matches(&self, value: u64) -> bool {
        match self.op {
            CompareOp::NotEqual => value != self.operand1,
            CompareOp::Less => value < self.operand1,
            CompareOp::LessEqual => value <= self.operand1,
            CompareOp::Equal => value == self.operand1,
            CompareOp::GreaterEqual => value >= self.operand1,
            CompareOp::Greater => value > self.operand1,
            CompareOp::MaskedEqual => value & self.operand1 == self.operand2,
            CompareOp::Invalid => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            CompareOp::MaskedEqual => write!(
                f,
                "$a{} & {:#x} == {:#x}",
                self.arg, self.operand1, self.operand2
            ),
            op => {
                let sym = match op {
                    CompareOp::NotEqual => "!=",
                    CompareOp::Less => "<",
                    CompareOp::LessEqual => "<=",
                    CompareOp::Equal => "==",
                    CompareOp::GreaterEqual => ">=",
                    CompareOp::Greater => ">",
                    _ => "?",
                };
                write!(f, "$a{} {sym} {:#x}", self.arg, self.operand1)
            }
        }
    }
}

/// Rejects condition sets with more than one condition on the same argument.
pub(crate) fn check_unique_args(conditions: &[Condition]) -> Result<(), ConditionError> {
    let mut seen = 0u8;
    for cond in conditions {
        let bit = 1u8 << cond.arg;
        if seen & bit != 0 {
            return Err(ConditionError::DuplicateArgument(cond.arg));
        }
        seen |= bit;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_argument_out_of_range() {
        assert_eq!(
            Condition::new(6, CompareOp::Equal, &[1]),
            Err(ConditionError::ArgumentOutOfRange { index: 6, max: 5 })
        );
        assert!(Condition::new(u32::MAX, CompareOp::Equal, &[1]).is_err());
    }

    #[test]
    fn rejects_invalid_operator() {
        assert_eq!(
            Condition::new(3, CompareOp::Invalid, &[1]),
            Err(ConditionError::InvalidOperator)
        );
        assert_eq!(CompareOp::from_raw(0), CompareOp::Invalid);
        assert_eq!(CompareOp::from_raw(8), CompareOp::Invalid);
    }

    #[test]
    fn rejects_wrong_operand_count() {
        assert!(Condition::new(3, CompareOp::NotEqual, &[1, 2]).is_err());
        assert!(Condition::new(3, CompareOp::NotEqual, &[]).is_err());
        assert_eq!(
            Condition::new(3, CompareOp::MaskedEqual, &[1]),
            Err(ConditionError::OperandCount {
                op: CompareOp::MaskedEqual,
                expected: 2,
                found: 1,
            })
        );
        assert!(Condition::new(3, CompareOp::MaskedEqual, &[1, 2, 3]).is_err());
    }

    #[test]
    fn keeps_fields_as_supplied() {
        let cond = Condition::new(3, CompareOp::NotEqual, &[1]).unwrap();
        assert_eq!(cond.arg(), 3);
        assert_eq!(cond.op(), CompareOp::NotEqual);
        assert_eq!(cond.operand1(), 1);
        assert_eq!(cond.operand2(), 0);

        let cond = Condition::new(3, CompareOp::MaskedEqual, &[0xf0, 0x10]).unwrap();
        assert_eq!(cond.operand1(), 0xf0);
        assert_eq!(cond.operand2(), 0x10);

        for raw in 1..=7 {
            let op = CompareOp::from_raw(raw);
            let operands = [0u64; 2];
            assert!(Condition::new(5, op, &operands[..op.operand_count()]).is_ok());
        }
    }

    #[test]
    fn comparisons_are_unsigned_64_bit() {
        let lt = Condition::new(0, CompareOp::Less, &[0x1_0000_0000]).unwrap();
        assert!(lt.matches(0xffff_ffff));
        assert!(!lt.matches(u64::MAX));

        let masked = Condition::masked_equal(1, 0xff00, 0x1200).unwrap();
        assert!(masked.matches(0x12_1234));
        assert!(!masked.matches(0x1300));
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        let a = Condition::equal(2, 1).unwrap();
        let b = Condition::equal(2, 5).unwrap();
        let c = Condition::equal(4, 5).unwrap();
        assert_eq!(check_unique_args(&[a, c]), Ok(()));
        assert_eq!(
            check_unique_args(&[a, c, b]),
            Err(ConditionError::DuplicateArgument(2))
        );
    }

    #[test]
    fn display() {
        assert_eq!(CompareOp::MaskedEqual.to_string(), "MASKED_EQ");
        let cond = Condition::equal(0, 1).unwrap();
        assert_eq!(cond.to_string(), "$a0 == 0x1");
    }
}
