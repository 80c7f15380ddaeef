//! Deserialize data from the peer wire protocol.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_i32, be_u8, be_u16, be_u64},
};
use nombytes::NomBytes;

/// Convert bytes to a validated UTF-8 string.
/// Returns an error if the bytes are not valid UTF-8.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, nom::Err<nom::error::Error<NomBytes>>> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(
                NomBytes::from(bytes.as_ref()),
                nom::error::ErrorKind::Verify,
            ))
        })
}

/// Parse a u16-length-prefixed string's raw bytes.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u16(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

/// Parse an i32-length-prefixed byte blob.
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i32(s)?;
    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (s, blob) = take(length as usize)(s)?;
    Ok((s, blob.into_bytes()))
}

/// Parse an i32-length-prefixed byte blob where -1 means null.
pub fn parse_nullable_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i32(s)?;
    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (s, blob) = take(length as usize)(s)?;
    Ok((s, Some(blob.into_bytes())))
}

/// Parse a big-endian u64.
pub fn parse_u64(s: NomBytes) -> IResult<NomBytes, u64> {
    be_u64(s)
}

/// Parse a single byte.
pub fn parse_u8(s: NomBytes) -> IResult<NomBytes, u8> {
    be_u8(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string() {
        let data = NomBytes::from(&[0u8, 4, b'f', b'w', b'-', b'a'][..]);
        let (rest, parsed) = parse_string(data).unwrap();
        assert_eq!(bytes_to_string(&parsed).unwrap(), "fw-a");
        assert!(rest.to_bytes().is_empty());
    }

    #[test]
    fn test_parse_bytes_rejects_negative_length() {
        let data = NomBytes::from(&[0xFFu8, 0xFF, 0xFF, 0xFE][..]);
        assert!(parse_bytes(data).is_err());
    }

    #[test]
    fn test_parse_nullable_bytes_null() {
        let data = NomBytes::from(&[0xFFu8, 0xFF, 0xFF, 0xFF][..]);
        let (_, parsed) = parse_nullable_bytes(data).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_parse_nullable_bytes_present() {
        let data = NomBytes::from(&[0u8, 0, 0, 2, b'h', b'i'][..]);
        let (_, parsed) = parse_nullable_bytes(data).unwrap();
        assert_eq!(parsed, Some(Bytes::from_static(b"hi")));
    }

    #[test]
    fn test_parse_u64() {
        let data = NomBytes::from(&[0u8, 0, 0, 0, 0, 0, 0, 42][..]);
        let (_, value) = parse_u64(data).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_bytes_to_string_invalid_utf8() {
        let bad = Bytes::from_static(&[0xFF, 0xFE]);
        assert!(bytes_to_string(&bad).is_err());
    }
}
