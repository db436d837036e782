//! Custom tone definitions installed on each line

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LineError, LineResult};

/// Tone id used for the dial tone definition
pub const DIAL_TONE_TID: u32 = 306;

/// Default dial tone: 350 Hz and 440 Hz, 20 Hz deviation each, leading edge
pub const DEFAULT_DIAL_TONE: &str = "350,20,440,20,L";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToneDetection {
    Leading,
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub on_time: u32,
    pub on_deviation: u32,
    pub off_time: u32,
    pub off_deviation: u32,
    pub repeat_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToneShape {
    /// `freq,dev,L|T`
    Single {
        frequency: u32,
        deviation: u32,
        detection: ToneDetection,
    },
    /// `freq1,dev1,freq2,dev2,L|T`
    Dual {
        frequencies: (u32, u32),
        deviations: (u32, u32),
        detection: ToneDetection,
    },
    /// `freq1,dev1,freq2,dev2,on,ondev,off,offdev,repeat`
    DualWithCadence {
        frequencies: (u32, u32),
        deviations: (u32, u32),
        cadence: Cadence,
    },
}

/// A tone the driver should listen for, with the id it reports on detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTone {
    pub tid: u32,
    pub shape: ToneShape,
}

impl CustomTone {
    pub fn parse(tid: u32, definition: &str) -> LineResult<Self> {
        let parts: Vec<&str> = definition.split(',').map(str::trim).collect();
        let invalid = || LineError::config(format!("Custom tone is invalid: '{definition}'"));
        let num = |s: &str| s.parse::<u32>().map_err(|_| invalid());
        let detection = |s: &str| match s {
            "L" => Ok(ToneDetection::Leading),
            "T" => Ok(ToneDetection::Trailing),
            _ => Err(invalid()),
        };

        let shape = match parts.as_slice() {
            [f, d, mode] => ToneShape::Single {
                frequency: num(f)?,
                deviation: num(d)?,
                detection: detection(mode)?,
            },
            [f1, d1, f2, d2, mode] => ToneShape::Dual {
                frequencies: (num(f1)?, num(f2)?),
                deviations: (num(d1)?, num(d2)?),
                detection: detection(mode)?,
            },
            [f1, d1, f2, d2, on, ondev, off, offdev, rep] => ToneShape::DualWithCadence {
                frequencies: (num(f1)?, num(f2)?),
                deviations: (num(d1)?, num(d2)?),
                cadence: Cadence {
                    on_time: num(on)?,
                    on_deviation: num(ondev)?,
                    off_time: num(off)?,
                    off_deviation: num(offdev)?,
                    repeat_count: num(rep)?,
                },
            },
            _ => return Err(invalid()),
        };

        Ok(Self { tid, shape })
    }

    pub fn dial_tone() -> Self {
        Self {
            tid: DIAL_TONE_TID,
            shape: ToneShape::Dual {
                frequencies: (350, 440),
                deviations: (20, 20),
                detection: ToneDetection::Leading,
            },
        }
    }
}

impl fmt::Display for CustomTone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = |d: &ToneDetection| match d {
            ToneDetection::Leading => "L",
            ToneDetection::Trailing => "T",
        };
        match &self.shape {
            ToneShape::Single {
                frequency,
                deviation,
                detection,
            } => write!(f, "{frequency},{deviation},{}", mode(detection)),
            ToneShape::Dual {
                frequencies,
                deviations,
                detection,
            } => write!(
                f,
                "{},{},{},{},{}",
                frequencies.0,
                deviations.0,
                frequencies.1,
                deviations.1,
                mode(detection)
            ),
            ToneShape::DualWithCadence {
                frequencies,
                deviations,
                cadence,
            } => write!(
                f,
                "{},{},{},{},{},{},{},{},{}",
                frequencies.0,
                deviations.0,
                frequencies.1,
                deviations.1,
                cadence.on_time,
                cadence.on_deviation,
                cadence.off_time,
                cadence.off_deviation,
                cadence.repeat_count
            ),
        }
    }
}

/// `tid:definition`, e.g. `306:350,20,440,20,L`
impl FromStr for CustomTone {
    type Err = LineError;

    fn from_str(s: &str) -> LineResult<Self> {
        let (tid, definition) = s
            .split_once(':')
            .ok_or_else(|| LineError::config(format!("Custom tone needs a tone id: '{s}'")))?;
        let tid = tid
            .trim()
            .parse::<u32>()
            .map_err(|_| LineError::config(format!("Invalid tone id in '{s}'")))?;
        Self::parse(tid, definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dial_tone_parses() {
        let tone = CustomTone::parse(DIAL_TONE_TID, DEFAULT_DIAL_TONE).unwrap();
        assert_eq!(tone, CustomTone::dial_tone());
        assert_eq!(tone.to_string(), DEFAULT_DIAL_TONE);
    }

    #[test]
    fn test_cadence_tone() {
        let tone = CustomTone::parse(310, "480,30,620,40,25,5,25,5,2").unwrap();
        match tone.shape {
            ToneShape::DualWithCadence { frequencies, cadence, .. } => {
                assert_eq!(frequencies, (480, 620));
                assert_eq!(cadence.repeat_count, 2);
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(CustomTone::parse(1, "350,20,440,20,X").is_err());
        assert!(CustomTone::parse(1, "350,20,440").is_err());
        assert!(CustomTone::parse(1, "abc,20,T").is_err());
        assert!("350,20,440,20,L".parse::<CustomTone>().is_err());
    }

    #[test]
    fn test_from_str_with_tid() {
        let tone: CustomTone = "400:1000,50,T".parse().unwrap();
        assert_eq!(tone.tid, 400);
        assert!(matches!(tone.shape, ToneShape::Single { frequency: 1000, .. }));
    }
}
