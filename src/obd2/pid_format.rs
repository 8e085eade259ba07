//! OBD2 Mode 01 value scalings

use std::str::FromStr;

use crate::{DiagError, DiagResult};

/// How a Mode 01 PID value is encoded on the wire.
///
/// The names in brackets are the formula that decodes the value from the data bytes A, B..
/// Values out of range of the encoding are clamped.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    strum_macros::EnumString,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PidFormat {
    /// No data bytes
    #[strum(serialize = "none")]
    NoData,
    /// 1 byte, (A)
    #[strum(serialize = "a")]
    Byte,
    /// 1 byte, (100/255 * A)
    #[strum(serialize = "percent")]
    Percent,
    /// 2 bytes, ((256A+B)/4), EG: engine speed
    #[strum(serialize = "rpm")]
    QuarterWord,
    /// 1 byte, (A-40), EG: temperatures in C
    #[strum(serialize = "temperature")]
    Temperature,
    /// 2 bytes, (256A+B)
    #[strum(serialize = "word")]
    Word,
    /// 2 bytes, ((256A+B)/100), EG: mass air flow
    #[strum(serialize = "centiword")]
    CentiWord,
    /// 1 byte, (3A), EG: fuel pressure
    #[strum(serialize = "triple")]
    Triple,
    /// 1 byte, (A/2-64), EG: timing advance
    #[strum(serialize = "timing")]
    Timing,
    /// 1 byte, (100/128 * A - 100), EG: fuel trims
    #[strum(serialize = "trim")]
    Trim,
    /// 4 bytes, the value is taken as a bit vector
    #[strum(serialize = "bits")]
    BitVector,
}

fn byte(v: f32) -> u8 {
    v.round().clamp(0.0, u8::MAX as f32) as u8
}

fn word(v: f32) -> [u8; 2] {
    (v.round().clamp(0.0, u16::MAX as f32) as u16).to_be_bytes()
}

impl PidFormat {
    /// Parses a format name, EG: "percent"
    pub fn parse(name: &str) -> DiagResult<Self> {
        Self::from_str(name).map_err(|e: strum::ParseError| {
            DiagError::ParameterInvalid(format!("Unknown PID format '{name}': {e}"))
        })
    }

    /// Number of data bytes of the format
    pub fn len(&self) -> usize {
        match self {
            PidFormat::NoData => 0,
            PidFormat::QuarterWord | PidFormat::Word | PidFormat::CentiWord => 2,
            PidFormat::BitVector => 4,
            _ => 1,
        }
    }

    /// Returns true for [PidFormat::NoData]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes a value
    pub fn encode(&self, value: f32) -> Vec<u8> {
        match self {
            PidFormat::NoData => vec![],
            PidFormat::Byte => vec![byte(value)],
            PidFormat::Percent => vec![byte(value * 255.0 / 100.0)],
            PidFormat::QuarterWord => word(value * 4.0).to_vec(),
            PidFormat::Temperature => vec![byte(value + 40.0)],
            PidFormat::Word => word(value).to_vec(),
            PidFormat::CentiWord => word(value * 100.0).to_vec(),
            PidFormat::Triple => vec![byte(value / 3.0)],
            PidFormat::Timing => vec![byte((value + 64.0) * 2.0)],
            PidFormat::Trim => vec![byte((value + 100.0) * 128.0 / 100.0)],
            PidFormat::BitVector => (value.round().clamp(0.0, u32::MAX as f32) as u32)
                .to_be_bytes()
                .to_vec(),
        }
    }

    /// Encoding used by a standard Mode 01 PID
    pub fn for_pid(pid: u8) -> Self {
        match pid {
            0x00 | 0x20 | 0x40 | 0x60 | 0x80 | 0xA0 | 0xC0 | 0xE0 => PidFormat::BitVector,
            0x01 | 0x41 => PidFormat::BitVector,
            0x04 | 0x11 | 0x2C | 0x2E | 0x2F | 0x45 | 0x47..=0x4C | 0x52 | 0x5A | 0x5B => {
                PidFormat::Percent
            }
            0x05 | 0x0F | 0x46 | 0x5C => PidFormat::Temperature,
            0x06..=0x09 | 0x2D => PidFormat::Trim,
            0x0A => PidFormat::Triple,
            0x0C => PidFormat::QuarterWord,
            0x0E => PidFormat::Timing,
            0x10 => PidFormat::CentiWord,
            0x1F | 0x21 | 0x31 | 0x42 | 0x4D | 0x4E => PidFormat::Word,
            _ => PidFormat::Byte,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(PidFormat::QuarterWord.encode(1726.0), vec![0x1A, 0xF8]);
        assert_eq!(PidFormat::Temperature.encode(90.0), vec![130]);
        assert_eq!(PidFormat::Temperature.encode(-60.0), vec![0]);
        assert_eq!(PidFormat::Percent.encode(100.0), vec![255]);
        assert_eq!(PidFormat::Percent.encode(50.0), vec![128]);
        assert_eq!(PidFormat::Trim.encode(0.0), vec![128]);
        assert_eq!(PidFormat::Timing.encode(0.0), vec![128]);
        assert_eq!(PidFormat::Triple.encode(300.0), vec![100]);
        assert_eq!(PidFormat::CentiWord.encode(12.5), vec![0x04, 0xE2]);
        assert_eq!(PidFormat::Byte.encode(300.0), vec![255]);
        assert_eq!(PidFormat::BitVector.encode(256.0), vec![0, 0, 1, 0]);
        assert!(PidFormat::NoData.encode(1.0).is_empty());
        for f in [PidFormat::Word, PidFormat::Timing, PidFormat::BitVector] {
            assert_eq!(f.encode(0.0).len(), f.len());
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(PidFormat::parse("percent").unwrap(), PidFormat::Percent);
        assert_eq!(PidFormat::parse("RPM").unwrap(), PidFormat::QuarterWord);
        assert_eq!(PidFormat::Temperature.to_string(), "temperature");
        assert!(matches!(
            PidFormat::parse("kelvin"),
            Err(DiagError::ParameterInvalid(_))
        ));
    }

    #[test]
    fn test_default_formats() {
        assert_eq!(PidFormat::for_pid(0x0C), PidFormat::QuarterWord);
        assert_eq!(PidFormat::for_pid(0x0D), PidFormat::Byte);
        assert_eq!(PidFormat::for_pid(0x05), PidFormat::Temperature);
        assert_eq!(PidFormat::for_pid(0x20), PidFormat::BitVector);
    }
}
