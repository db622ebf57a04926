//! Allocation-free codecs over caller-provided buffers.
//!
//! Encoders and decoders never allocate and never write a terminator. The
//! output buffer being too small is `Error::NoSpace`; malformed input is
//! `Error::InvalidInput`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::Error;

const HEX_LOWER: &[u8; 16] = b"0123456789abcdef";
const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Hex-encode `data` into `out`, returning the number of bytes written.
pub fn base16_encode(out: &mut [u8], data: &[u8], uppercase: bool) -> Result<usize, Error> {
    let needed = crate::util::checked_mul(data.len(), 2)?;
    if out.len() < needed {
        return Err(Error::NoSpace);
    }
    let table = if uppercase { HEX_UPPER } else { HEX_LOWER };
    for (i, byte) in data.iter().enumerate() {
        out[i * 2] = table[(byte >> 4) as usize];
        out[i * 2 + 1] = table[(byte & 0x0f) as usize];
    }
    Ok(needed)
}

/// Decode hex `data` (either case) into `out`, returning the number of bytes
/// written.
pub fn base16_decode(out: &mut [u8], data: &[u8]) -> Result<usize, Error> {
    if data.len() % 2 != 0 {
        return Err(Error::InvalidInput);
    }
    let needed = data.len() / 2;
    if out.len() < needed {
        return Err(Error::NoSpace);
    }
    hex::decode_to_slice(data, &mut out[..needed]).map_err(|_| Error::InvalidInput)?;
    Ok(needed)
}

/// Base64-encode (standard alphabet, padded) `data` into `out`.
pub fn base64_encode(out: &mut [u8], data: &[u8]) -> Result<usize, Error> {
    BASE64.encode_slice(data, out).map_err(|_| Error::NoSpace)
}

/// Decode base64 `data` into `out`, returning the number of bytes written.
pub fn base64_decode(out: &mut [u8], data: &[u8]) -> Result<usize, Error> {
    BASE64.decode_slice(data, out).map_err(|err| match err {
        base64::DecodeSliceError::OutputSliceTooSmall => Error::NoSpace,
        base64::DecodeSliceError::DecodeError(_) => Error::InvalidInput,
    })
}

/// Encode a unicode code point as UTF-8 into `out`, returning the encoded
/// length (1 to 4). Surrogates and out-of-range codes are `InvalidInput`.
pub fn utf8_from_unicode(out: &mut [u8], code: u32) -> Result<usize, Error> {
    let c = char::from_u32(code).ok_or(Error::InvalidInput)?;
    let len = c.len_utf8();
    if out.len() < len {
        return Err(Error::NoSpace);
    }
    c.encode_utf8(out);
    Ok(len)
}

/// Decode the first UTF-8 sequence in `data`, returning the code point and
/// the number of bytes it occupied.
pub fn unicode_from_utf8(data: &[u8]) -> Result<(u32, usize), Error> {
    let first = *data.first().ok_or(Error::InvalidInput)?;
    let len = match first {
        0x00..=0x7f => 1,
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => return Err(Error::InvalidInput),
    };
    let prefix = data.get(..len).ok_or(Error::InvalidInput)?;
    let s = std::str::from_utf8(prefix).map_err(|_| Error::InvalidInput)?;
    let c = s.chars().next().ok_or(Error::InvalidInput)?;
    Ok((c as u32, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base16_round_trip() {
        let data = b"\x00\x01\xfe\xffsolstice";
        let mut enc = [0u8; 64];
        let n = base16_encode(&mut enc, data, false).unwrap();
        assert_eq!(n, data.len() * 2);
        let mut dec = [0u8; 64];
        let m = base16_decode(&mut dec, &enc[..n]).unwrap();
        assert_eq!(&dec[..m], data);
    }

    #[test]
    fn base16_uppercase() {
        let mut enc = [0u8; 4];
        let n = base16_encode(&mut enc, &[0xab, 0xcd], true).unwrap();
        assert_eq!(&enc[..n], b"ABCD");
    }

    #[test]
    fn base16_rejects_bad_alphabet() {
        let mut dec = [0u8; 8];
        assert!(matches!(
            base16_decode(&mut dec, b"zz"),
            Err(Error::InvalidInput)
        ));
        assert!(matches!(
            base16_decode(&mut dec, b"abc"),
            Err(Error::InvalidInput)
        ));
    }

    #[test]
    fn base16_short_output() {
        let mut enc = [0u8; 3];
        assert!(matches!(
            base16_encode(&mut enc, &[1, 2], false),
            Err(Error::NoSpace)
        ));
    }

    #[test]
    fn base64_round_trip() {
        let data = b"any carnal pleasure.";
        let mut enc = [0u8; 64];
        let n = base64_encode(&mut enc, data).unwrap();
        let mut dec = [0u8; 64];
        let m = base64_decode(&mut dec, &enc[..n]).unwrap();
        assert_eq!(&dec[..m], data);
    }

    #[test]
    fn base64_rejects_bad_alphabet() {
        let mut dec = [0u8; 64];
        assert!(matches!(
            base64_decode(&mut dec, b"a*b="),
            Err(Error::InvalidInput)
        ));
    }

    #[test]
    fn utf8_round_trip() {
        for code in [0x24u32, 0xa2, 0x20ac, 0x10348, 0x10ffff] {
            let mut buf = [0u8; 4];
            let len = utf8_from_unicode(&mut buf, code).unwrap();
            let (decoded, used) = unicode_from_utf8(&buf[..len]).unwrap();
            assert_eq!(decoded, code);
            assert_eq!(used, len);
        }
    }

    #[test]
    fn utf8_rejects_malformed() {
        assert!(matches!(
            utf8_from_unicode(&mut [0u8; 4], 0xd800),
            Err(Error::InvalidInput)
        ));
        assert!(matches!(
            unicode_from_utf8(&[0x80]),
            Err(Error::InvalidInput)
        ));
        // truncated three byte sequence
        assert!(matches!(
            unicode_from_utf8(&[0xe2, 0x82]),
            Err(Error::InvalidInput)
        ));
        // overlong encoding lead byte
        assert!(matches!(
            unicode_from_utf8(&[0xc0, 0xaf]),
            Err(Error::InvalidInput)
        ));
    }
}
