//! Termination conditions for digit collection, playback and recording
//!
//! Every blocking I/O request on a voice channel carries an ordered list of stop
//! conditions. The list is built fresh for each request:
//!
//! ```text
//! ┌────────────────┬──────────────────┬────────────────────┬─────────────────────┐
//! │ MaxDigits (n)  │ DigitMask (bits) │ InterDigitTimeout  │ LoopCurrentOff      │
//! │ always         │ if any key maps  │ if timeout != 0    │ always, always last │
//! └────────────────┴──────────────────┴────────────────────┴─────────────────────┘
//! ```
//!
//! The hang-up condition goes last so an earlier match can never mask it.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Keys a caller can press, with their bit in a digit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigitKey {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DigitKey {
    pub fn to_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'a',
            Self::B => 'b',
            Self::C => 'c',
            Self::D => 'd',
        }
    }

    /// Letters are matched case-insensitively; anything else has no key
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Digit0),
            '1' => Some(Self::Digit1),
            '2' => Some(Self::Digit2),
            '3' => Some(Self::Digit3),
            '4' => Some(Self::Digit4),
            '5' => Some(Self::Digit5),
            '6' => Some(Self::Digit6),
            '7' => Some(Self::Digit7),
            '8' => Some(Self::Digit8),
            '9' => Some(Self::Digit9),
            '*' => Some(Self::Star),
            '#' => Some(Self::Pound),
            'A' | 'a' => Some(Self::A),
            'B' | 'b' => Some(Self::B),
            'C' | 'c' => Some(Self::C),
            'D' | 'd' => Some(Self::D),
            _ => None,
        }
    }

    pub fn mask_bit(self) -> DigitMask {
        DigitMask(match self {
            Self::D => 0x0001,
            Self::Digit1 => 0x0002,
            Self::Digit2 => 0x0004,
            Self::Digit3 => 0x0008,
            Self::Digit4 => 0x0010,
            Self::Digit5 => 0x0020,
            Self::Digit6 => 0x0040,
            Self::Digit7 => 0x0080,
            Self::Digit8 => 0x0100,
            Self::Digit9 => 0x0200,
            Self::Digit0 => 0x0400,
            Self::Star => 0x0800,
            Self::Pound => 0x1000,
            Self::A => 0x2000,
            Self::B => 0x4000,
            Self::C => 0x8000,
        })
    }
}

/// Set of terminator keys as a driver bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DigitMask(pub u16);

impl DigitMask {
    pub const EMPTY: Self = Self(0);

    /// Map a terminator string onto mask bits
    ///
    /// The string is trimmed and lowercased first. Characters with no key (including the
    /// timeout marker `t`) contribute nothing.
    pub fn from_terminators(terminators: &str) -> Self {
        terminators
            .trim()
            .to_lowercase()
            .chars()
            .filter_map(DigitKey::from_char)
            .fold(Self::EMPTY, |mask, key| mask | key.mask_bit())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains_key(&self, key: DigitKey) -> bool {
        self.0 & key.mask_bit().0 != 0
    }
}

impl BitOr for DigitMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    MaxDigits,
    DigitMask,
    InterDigitTimeout,
    LoopCurrentOff,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxDigits => write!(f, "MAXDTMF"),
            Self::DigitMask => write!(f, "DIGMASK"),
            Self::InterDigitTimeout => write!(f, "IDDTIME"),
            Self::LoopCurrentOff => write!(f, "LCOFF"),
        }
    }
}

/// Qualifier bits on a single condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConditionFlags(pub u16);

impl ConditionFlags {
    pub const NONE: Self = Self(0);
    /// Threshold is a loop-current drop rather than a count
    pub const LOOP_CURRENT: Self = Self(0x0001);
    /// Threshold is expressed in 10 ms units
    pub const UNITS_10MS: Self = Self(0x0002);
    /// Threshold is expressed in 100 ms units
    pub const UNITS_100MS: Self = Self(0x0004);
}

impl BitOr for ConditionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminationCondition {
    pub kind: ConditionKind,
    pub threshold: u32,
    pub flags: ConditionFlags,
}

/// Loop current must stay off for 30 ms before it counts as a hang-up
const LOOP_CURRENT_OFF_10MS: u32 = 3;

/// Ordered, immutable list of stop conditions for one I/O request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSet {
    conditions: Vec<TerminationCondition>,
}

impl TerminationSet {
    /// Build the stop conditions for a request
    ///
    /// `digits` is clamped to `max_supported`; `timeout_ms` of zero disables the
    /// inter-digit timeout. The driver counts that timeout in tenths of a second, so
    /// anything below 100 ms rounds down to zero and still gets a condition.
    pub fn build(digits: u32, terminators: &str, timeout_ms: u32, max_supported: u32) -> Self {
        let mut conditions = Vec::with_capacity(4);

        conditions.push(TerminationCondition {
            kind: ConditionKind::MaxDigits,
            threshold: digits.min(max_supported),
            flags: ConditionFlags::NONE,
        });

        let mask = DigitMask::from_terminators(terminators);
        if !mask.is_empty() {
            conditions.push(TerminationCondition {
                kind: ConditionKind::DigitMask,
                threshold: u32::from(mask.0),
                flags: ConditionFlags::NONE,
            });
        }

        if timeout_ms != 0 {
            conditions.push(TerminationCondition {
                kind: ConditionKind::InterDigitTimeout,
                threshold: timeout_ms / 100,
                flags: ConditionFlags::UNITS_100MS,
            });
        }

        conditions.push(TerminationCondition {
            kind: ConditionKind::LoopCurrentOff,
            threshold: LOOP_CURRENT_OFF_10MS,
            flags: ConditionFlags::LOOP_CURRENT | ConditionFlags::UNITS_10MS,
        });

        Self { conditions }
    }

    pub fn conditions(&self) -> &[TerminationCondition] {
        &self.conditions
    }

    pub fn get(&self, kind: ConditionKind) -> Option<&TerminationCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn max_digits(&self) -> u32 {
        self.get(ConditionKind::MaxDigits)
            .map(|c| c.threshold)
            .unwrap_or(0)
    }

    pub fn digit_mask(&self) -> DigitMask {
        self.get(ConditionKind::DigitMask)
            .map(|c| DigitMask(c.threshold as u16))
            .unwrap_or(DigitMask::EMPTY)
    }

    pub fn has_timeout(&self) -> bool {
        self.get(ConditionKind::InterDigitTimeout).is_some()
    }
}

impl fmt::Display for TerminationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(|c| format!("{}={}", c.kind, c.threshold))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_full_condition_order() {
        let set = TerminationSet::build(4, "#", 5000, 15);
        let kinds: Vec<ConditionKind> = set.conditions().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ConditionKind::MaxDigits,
                ConditionKind::DigitMask,
                ConditionKind::InterDigitTimeout,
                ConditionKind::LoopCurrentOff,
            ]
        );
        assert_eq!(set.max_digits(), 4);
        assert_eq!(set.digit_mask(), DigitKey::Pound.mask_bit());
        assert_eq!(set.get(ConditionKind::InterDigitTimeout).unwrap().threshold, 50);
        let hangup = set.conditions().last().unwrap();
        assert_eq!(hangup.threshold, 3);
        assert_eq!(hangup.flags, ConditionFlags::LOOP_CURRENT | ConditionFlags::UNITS_10MS);
    }

    #[test]
    fn test_digit_count_is_clamped() {
        assert_eq!(TerminationSet::build(30, "#", 0, 15).max_digits(), 15);
        assert_eq!(TerminationSet::build(3, "#", 0, 15).max_digits(), 3);
    }

    #[test]
    fn test_no_mask_and_no_timeout() {
        let set = TerminationSet::build(1, "t", 0, 15);
        let kinds: Vec<ConditionKind> = set.conditions().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ConditionKind::MaxDigits, ConditionKind::LoopCurrentOff]);
        assert!(!set.has_timeout());
    }

    #[test]
    fn test_mask_is_case_insensitive_and_trimmed() {
        let upper = DigitMask::from_terminators(" AB# ");
        let lower = DigitMask::from_terminators("ab#");
        assert_eq!(upper, lower);
        assert!(upper.contains_key(DigitKey::A));
        assert!(upper.contains_key(DigitKey::Pound));
        assert!(!upper.contains_key(DigitKey::Star));
    }

    #[test]
    fn test_every_key_has_its_own_bit() {
        let all = DigitMask::from_terminators("0123456789*#abcd");
        assert_eq!(all.0, 0xFFFF);
    }

    proptest! {
        #[test]
        fn prop_mask_present_iff_a_key_maps(terminators in ".{0,12}") {
            let set = TerminationSet::build(10, &terminators, 1000, 15);
            let maps = terminators
                .trim()
                .to_lowercase()
                .chars()
                .any(|c| DigitKey::from_char(c).is_some());
            prop_assert_eq!(set.get(ConditionKind::DigitMask).is_some(), maps);
        }

        #[test]
        fn prop_hangup_condition_always_last(
            digits in 0u32..64,
            terminators in "[0-9#*a-dtxT ]{0,8}",
            timeout in 0u32..20_000,
        ) {
            let set = TerminationSet::build(digits, &terminators, timeout, 15);
            let last = set.conditions().last().unwrap();
            prop_assert_eq!(last.kind, ConditionKind::LoopCurrentOff);
            let hangups = set
                .conditions()
                .iter()
                .filter(|c| c.kind == ConditionKind::LoopCurrentOff)
                .count();
            prop_assert_eq!(hangups, 1);
            prop_assert_eq!(set.conditions()[0].kind, ConditionKind::MaxDigits);
            prop_assert!(set.max_digits() <= 15);
        }
    }
}
