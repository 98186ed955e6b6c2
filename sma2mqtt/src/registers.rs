use std::str::Utf8Error;

use thiserror::Error;

use crate::snapshot::Value;

/// Binary layout of a register value as served by the inverter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    S16,
    U16,
    S32,
    U32,
    U64,
    Str32,
}

impl Encoding {
    /// Number of 16-bit words occupied by a value of this encoding.
    pub const fn word_count(self) -> u16 {
        match self {
            Encoding::S16 | Encoding::U16 => 1,
            Encoding::S32 | Encoding::U32 => 2,
            Encoding::U64 => 4,
            Encoding::Str32 => 16,
        }
    }
}

/// Fixed-point scaling, named after the FIXn formats of the SMA Modbus profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scale {
    None,
    Div10,
    Div100,
    Div1000,
}

impl Scale {
    fn divisor(self) -> Option<f64> {
        match self {
            Scale::None => None,
            Scale::Div10 => Some(10.),
            Scale::Div100 => Some(100.),
            Scale::Div1000 => Some(1000.),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterSpec {
    pub address: u16,
    pub encoding: Encoding,
    pub scale: Scale,
    pub name: &'static str,
    pub unit: Option<&'static str>,
}

impl RegisterSpec {
    pub const fn word_count(&self) -> u16 {
        self.encoding.word_count()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("register {address}: expected {expected} words, got {actual}")]
    ShortRead {
        address: u16,
        expected: u16,
        actual: usize,
    },
    #[error("register {address}: invalid text: {source}")]
    InvalidText {
        address: u16,
        #[source]
        source: Utf8Error,
    },
}

const fn register(
    address: u16,
    encoding: Encoding,
    scale: Scale,
    name: &'static str,
    unit: Option<&'static str>,
) -> RegisterSpec {
    RegisterSpec {
        address,
        encoding,
        scale,
        name,
        unit,
    }
}

/// Input registers polled from every inverter, in polling order.
pub static REGISTERS: [RegisterSpec; 19] = [
    register(30057, Encoding::U32, Scale::None, "serialNumber", None),
    register(30775, Encoding::S32, Scale::None, "acPower", Some("W")),
    register(30813, Encoding::S32, Scale::None, "acApparentPower", Some("VA")),
    register(30977, Encoding::S32, Scale::Div1000, "acCurrent", Some("A")),
    register(30783, Encoding::S32, Scale::Div100, "acVoltage", Some("V")),
    register(30803, Encoding::U32, Scale::Div100, "gridFreq", Some("Hz")),
    register(30773, Encoding::S32, Scale::None, "dcPower", Some("W")),
    register(30771, Encoding::S32, Scale::Div100, "dcInputVoltage", Some("V")),
    register(30953, Encoding::S32, Scale::Div10, "deviceTemperature", Some("°C")),
    register(30517, Encoding::U64, Scale::None, "dailyYield", Some("Wh")),
    register(30513, Encoding::U64, Scale::None, "totalYield", Some("Wh")),
    register(30521, Encoding::U64, Scale::None, "totalOperationTime", Some("s")),
    register(30525, Encoding::U64, Scale::None, "feedInTime", Some("s")),
    register(30975, Encoding::S32, Scale::Div100, "intermediateVoltage", Some("V")),
    register(30225, Encoding::S32, Scale::None, "isolationResistance", Some("Ω")),
    register(30581, Encoding::U32, Scale::None, "totalEnergyFromGrid", Some("Wh")),
    register(30583, Encoding::U32, Scale::None, "totalEnergyToGrid", Some("Wh")),
    register(30865, Encoding::S32, Scale::None, "powerFromGrid", Some("W")),
    register(30867, Encoding::S32, Scale::None, "powerToGrid", Some("W")),
];

pub fn find(name: &str) -> Option<&'static RegisterSpec> {
    REGISTERS.iter().find(|spec| spec.name == name)
}

/// Joins big-endian words into one big-endian integer.
fn combine(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0_u64, |acc, word| (acc << 16) | u64::from(*word))
}

/// Decodes the raw words of one register into a scaled value.
///
/// Inverters report a fixed "not a number" pattern per type while they are
/// not producing (e.g. at night); those patterns decode to zero.
pub fn decode(words: &[u16], spec: &RegisterSpec) -> Result<Value, DecodeError> {
    let expected = spec.word_count();
    if words.len() < usize::from(expected) {
        return Err(DecodeError::ShortRead {
            address: spec.address,
            expected,
            actual: words.len(),
        });
    }
    let words = &words[..usize::from(expected)];

    let value = match spec.encoding {
        Encoding::S16 => match words[0] as i16 {
            i16::MIN => Value::Signed(0),
            raw => Value::Signed(i64::from(raw)),
        },
        Encoding::U16 => match words[0] {
            u16::MAX => Value::Unsigned(0),
            raw => Value::Unsigned(u64::from(raw)),
        },
        Encoding::S32 => match combine(words) as u32 as i32 {
            i32::MIN => Value::Signed(0),
            raw => Value::Signed(i64::from(raw)),
        },
        Encoding::U32 => match combine(words) as u32 {
            u32::MAX => Value::Unsigned(0),
            raw => Value::Unsigned(u64::from(raw)),
        },
        Encoding::U64 => match combine(words) {
            u64::MAX => Value::Unsigned(0),
            raw => Value::Unsigned(raw),
        },
        Encoding::Str32 => {
            let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
            let text = std::str::from_utf8(&bytes).map_err(|source| DecodeError::InvalidText {
                address: spec.address,
                source,
            })?;
            return Ok(Value::Text(text.trim_end_matches('\0').to_string()));
        }
    };

    Ok(match spec.scale.divisor() {
        Some(divisor) => Value::Float(value.as_f64().unwrap_or_default() / divisor),
        None => value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(encoding: Encoding, scale: Scale) -> RegisterSpec {
        register(40000, encoding, scale, "test", None)
    }

    #[test]
    fn word_counts_match_encoding_width() {
        for spec in REGISTERS.iter() {
            let bits = match spec.encoding {
                Encoding::S16 | Encoding::U16 => 16,
                Encoding::S32 | Encoding::U32 => 32,
                Encoding::U64 => 64,
                Encoding::Str32 => 256,
            };
            assert_eq!(spec.word_count() * 16, bits, "{}", spec.name);
        }
    }

    #[test]
    fn register_names_are_unique() {
        for (i, a) in REGISTERS.iter().enumerate() {
            assert!(REGISTERS[i + 1..].iter().all(|b| b.name != a.name));
        }
    }

    #[test]
    fn s32_sentinel_is_zero() {
        let value = decode(&[0x8000, 0x0000], &spec(Encoding::S32, Scale::None)).unwrap();
        assert_eq!(value, Value::Signed(0));

        let value = decode(&[0x8000, 0x0000], &spec(Encoding::S32, Scale::Div100)).unwrap();
        assert_eq!(value, Value::Float(0.));
    }

    #[test]
    fn other_sentinels_are_zero() {
        assert_eq!(
            decode(&[0xFFFF; 4], &spec(Encoding::U64, Scale::None)).unwrap(),
            Value::Unsigned(0)
        );
        assert_eq!(
            decode(&[0xFFFF, 0xFFFF], &spec(Encoding::U32, Scale::None)).unwrap(),
            Value::Unsigned(0)
        );
        assert_eq!(
            decode(&[0xFFFF], &spec(Encoding::U16, Scale::None)).unwrap(),
            Value::Unsigned(0)
        );
        assert_eq!(
            decode(&[0x8000], &spec(Encoding::S16, Scale::None)).unwrap(),
            Value::Signed(0)
        );
    }

    #[test]
    fn scales_after_decoding() {
        let value = decode(&[0x0000, 12345], &spec(Encoding::S32, Scale::Div100)).unwrap();
        assert_eq!(value, Value::Float(123.45));

        let value = decode(&[0xFFFF, 0xFFF6], &spec(Encoding::S32, Scale::Div10)).unwrap();
        assert_eq!(value, Value::Float(-1.));

        let value = decode(&[0x0001, 0x0000], &spec(Encoding::U32, Scale::Div1000)).unwrap();
        assert_eq!(value, Value::Float(65.536));
    }

    #[test]
    fn unscaled_values_stay_integers() {
        let value = decode(&[0x0000, 0x0001, 0x0000, 0x0002], &spec(Encoding::U64, Scale::None))
            .unwrap();
        assert_eq!(value, Value::Unsigned(0x0001_0000_0002));

        let value = decode(&[0xFFFE], &spec(Encoding::S16, Scale::None)).unwrap();
        assert_eq!(value, Value::Signed(-2));
    }

    #[test]
    fn decodes_text_without_trailing_nul() {
        let mut words = [0_u16; 16];
        words[0] = u16::from_be_bytes(*b"SB");
        words[1] = u16::from_be_bytes(*b"5.");
        words[2] = u16::from_be_bytes([b'0', 0]);
        let value = decode(&words, &spec(Encoding::Str32, Scale::None)).unwrap();
        assert_eq!(value, Value::Text("SB5.0".to_string()));
    }

    #[test]
    fn short_read_is_an_error() {
        let result = decode(&[0x0001], &spec(Encoding::U32, Scale::None));
        assert_eq!(
            result,
            Err(DecodeError::ShortRead {
                address: 40000,
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn finds_registers_by_name() {
        assert_eq!(find("acPower").map(|spec| spec.address), Some(30775));
        assert!(find("nope").is_none());
    }
}
