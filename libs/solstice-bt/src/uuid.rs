//! Attribute UUIDs in 16-, 32- and 128-bit forms.
//!
//! Shorter forms are views into the SIG base UUID, so equality expands
//! both sides before comparing and stays transitive across forms.

use std::fmt;
use std::str::FromStr;

use solstice::Error;

/// `00000000-0000-1000-8000-00805F9B34FB`
const SIG_BASE: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34,
    0xfb,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    U16,
    U32,
    U128,
}

#[derive(Debug, Clone, Copy)]
pub struct Uuid {
    // big-endian, fully expanded
    bytes: [u8; 16],
    form: Form,
}

impl Uuid {
    pub fn from_u16(value: u16) -> Uuid {
        let mut bytes = SIG_BASE;
        bytes[2..4].copy_from_slice(&value.to_be_bytes());
        Uuid {
            bytes,
            form: Form::U16,
        }
    }

    pub fn from_u32(value: u32) -> Uuid {
        let mut bytes = SIG_BASE;
        bytes[0..4].copy_from_slice(&value.to_be_bytes());
        Uuid {
            bytes,
            form: Form::U32,
        }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Uuid {
        Uuid {
            bytes,
            form: Form::U128,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }
}

impl PartialEq for Uuid {
    fn eq(&self, other: &Uuid) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Uuid {}

impl std::hash::Hash for Uuid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Uuid, Error> {
        match s.len() {
            4 => {
                let v = u16::from_str_radix(s, 16).map_err(|_| Error::InvalidInput)?;
                Ok(Uuid::from_u16(v))
            }
            8 => {
                let v = u32::from_str_radix(s, 16).map_err(|_| Error::InvalidInput)?;
                Ok(Uuid::from_u32(v))
            }
            36 => {
                let raw = s.as_bytes();
                for at in [8, 13, 18, 23] {
                    if raw[at] != b'-' {
                        return Err(Error::InvalidInput);
                    }
                }
                let hex: String = s.chars().filter(|c| *c != '-').collect();
                let mut bytes = [0u8; 16];
                solstice::codec::base16_decode(&mut bytes, hex.as_bytes())?;
                Ok(Uuid::from_bytes(bytes))
            }
            _ => Err(Error::InvalidInput),
        }
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.form {
            Form::U16 => {
                let v = u16::from_be_bytes([self.bytes[2], self.bytes[3]]);
                write!(f, "{v:04x}")
            }
            Form::U32 => {
                let v = u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]);
                write!(f, "{v:08x}")
            }
            Form::U128 => {
                let b = &self.bytes;
                for (i, byte) in b.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        write!(f, "-")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms_expand_into_the_sig_base() {
        let short: Uuid = "180a".parse().unwrap();
        let wide: Uuid = "0000180a".parse().unwrap();
        let full: Uuid = "0000180a-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(short, wide);
        assert_eq!(wide, full);
        assert_eq!(short, full);
    }

    #[test]
    fn distinct_values_differ() {
        assert_ne!(Uuid::from_u16(0x180a), Uuid::from_u16(0x180f));
        let vendor: Uuid = "12345678-1234-5678-1234-56789abcdef0".parse().unwrap();
        assert_ne!(vendor, Uuid::from_u32(0x12345678));
    }

    #[test]
    fn display_keeps_the_original_form() {
        assert_eq!(Uuid::from_u16(0x180a).to_string(), "180a");
        assert_eq!(Uuid::from_u32(0xfeedbeef).to_string(), "feedbeef");
        let full = "12345678-1234-5678-1234-56789abcdef0";
        assert_eq!(full.parse::<Uuid>().unwrap().to_string(), full);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!("18".parse::<Uuid>().is_err());
        assert!("zzzz".parse::<Uuid>().is_err());
        assert!("0000180a-0000-1000-8000-00805f9b34f".parse::<Uuid>().is_err());
        assert!(
            "0000180a+0000-1000-8000-00805f9b34fb"
                .parse::<Uuid>()
                .is_err()
        );
    }
}
