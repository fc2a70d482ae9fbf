use crate::IdentityError;

/// Reserved ASCII characters that package file names carry percent-escaped.
const RESERVED_ESCAPES: [(char, &str); 20] = [
    (' ', "%20"),
    ('!', "%21"),
    ('#', "%23"),
    ('$', "%24"),
    ('%', "%25"),
    ('&', "%26"),
    ('\'', "%27"),
    ('(', "%28"),
    (')', "%29"),
    ('+', "%2B"),
    (',', "%2C"),
    (';', "%3B"),
    ('=', "%3D"),
    ('@', "%40"),
    ('[', "%5B"),
    (']', "%5D"),
    ('^', "%5E"),
    ('`', "%60"),
    ('{', "%7B"),
    ('}', "%7D"),
];

const BASE32_ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

const BASE64_INVALID: u8 = 0xFF;
const BASE64_PAD: u8 = 64;
const BASE64_TABLE: [u8; 128] = build_base64_table();

const fn build_base64_table() -> [u8; 128] {
    let alphabet = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut table = [BASE64_INVALID; 128];
    let mut index = 0;
    while index < alphabet.len() {
        table[alphabet[index] as usize] = index as u8;
        index += 1;
    }
    table[b'=' as usize] = BASE64_PAD;
    table
}

pub fn percent_encode_file_name(name: &str) -> Result<String, IdentityError> {
    let units = name.encode_utf16().collect::<Vec<_>>();
    percent_encode_file_name_wide(&units)
}

/// Encodes a UTF-16 file name. Surrogate pairs are combined before encoding;
/// an unpaired surrogate is rejected.
pub fn percent_encode_file_name_wide(units: &[u16]) -> Result<String, IdentityError> {
    let mut encoded = String::with_capacity(units.len());
    let mut index = 0;
    while index < units.len() {
        let unit = units[index];
        let code_point = if is_high_surrogate(unit) {
            let low = units
                .get(index + 1)
                .copied()
                .filter(|next| is_low_surrogate(*next))
                .ok_or_else(|| {
                    IdentityError::InvalidEncoding(format!(
                        "unpaired high surrogate 0x{unit:04X} at position {index}"
                    ))
                })?;
            index += 1;
            0x10000 + ((u32::from(unit) - 0xD800) << 10) + (u32::from(low) - 0xDC00)
        } else if is_low_surrogate(unit) {
            return Err(IdentityError::InvalidEncoding(format!(
                "low surrogate 0x{unit:04X} without a preceding high surrogate at position {index}"
            )));
        } else {
            u32::from(unit)
        };
        index += 1;

        push_encoded_code_point(&mut encoded, code_point)?;
    }
    Ok(encoded)
}

fn push_encoded_code_point(encoded: &mut String, code_point: u32) -> Result<(), IdentityError> {
    let ch = char::from_u32(code_point).ok_or_else(|| {
        IdentityError::InvalidEncoding(format!("invalid code point U+{code_point:X}"))
    })?;
    if ch == '\\' {
        encoded.push('/');
        return Ok(());
    }
    if let Some(escape) = reserved_escape_for(ch) {
        encoded.push_str(escape);
        return Ok(());
    }
    if ch.is_ascii() {
        encoded.push(ch);
        return Ok(());
    }

    let mut utf8 = [0_u8; 4];
    for byte in ch.encode_utf8(&mut utf8).bytes() {
        encoded.push('%');
        encoded.push(hex_digit(byte >> 4));
        encoded.push(hex_digit(byte & 0x0F));
    }
    Ok(())
}

pub fn percent_decode_file_name(encoded: &str) -> Result<String, IdentityError> {
    let units = percent_decode_file_name_wide(encoded)?;
    String::from_utf16(&units).map_err(|err| {
        IdentityError::UnknownFileNameEncoding(format!("'{encoded}' decodes to invalid UTF-16: {err}"))
    })
}

/// Decodes a percent-encoded file name into UTF-16 code units. Multi-byte
/// escapes must form well-formed UTF-8; overlong forms, surrogate code points
/// and values above U+10FFFF are rejected.
pub fn percent_decode_file_name_wide(encoded: &str) -> Result<Vec<u16>, IdentityError> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] != b'%' {
            let ch = encoded[index..].chars().next().ok_or_else(|| {
                IdentityError::UnknownFileNameEncoding(format!(
                    "'{encoded}' ends inside a character"
                ))
            })?;
            let mut buffer = [0_u16; 2];
            decoded.extend_from_slice(ch.encode_utf16(&mut buffer));
            index += ch.len_utf8();
            continue;
        }

        let lead = escaped_byte(encoded, index)?;
        if let Some(ch) = reserved_char_for(lead) {
            decoded.push(ch as u16);
            index += 3;
            continue;
        }

        let (length, (second_low, second_high)) = utf8_sequence_shape(lead).ok_or_else(|| {
            IdentityError::UnknownFileNameEncoding(format!(
                "'{encoded}' has invalid UTF-8 lead byte 0x{lead:02X} at position {index}"
            ))
        })?;
        let mut code_point = match length {
            1 => u32::from(lead),
            2 => u32::from(lead & 0x1F),
            3 => u32::from(lead & 0x0F),
            _ => u32::from(lead & 0x07),
        };
        for continuation in 1..length {
            let position = index + continuation * 3;
            let byte = escaped_byte(encoded, position)?;
            let (low, high) = if continuation == 1 {
                (second_low, second_high)
            } else {
                (0x80, 0xBF)
            };
            if !(low..=high).contains(&byte) {
                return Err(IdentityError::UnknownFileNameEncoding(format!(
                    "'{encoded}' has invalid UTF-8 continuation byte 0x{byte:02X} at position {position}"
                )));
            }
            code_point = (code_point << 6) | u32::from(byte & 0x3F);
        }
        index += length * 3;

        if (0xD800..=0xDFFF).contains(&code_point) || code_point > 0x10FFFF {
            return Err(IdentityError::UnknownFileNameEncoding(format!(
                "'{encoded}' decodes to invalid code point U+{code_point:X}"
            )));
        }
        if code_point > 0xFFFF {
            let offset = code_point - 0x10000;
            decoded.push((0xD800 + (offset >> 10)) as u16);
            decoded.push((0xDC00 + (offset & 0x3FF)) as u16);
        } else {
            decoded.push(code_point as u16);
        }
    }
    Ok(decoded)
}

/// Sequence length for a UTF-8 lead byte and the inclusive bounds of the
/// first continuation byte.
fn utf8_sequence_shape(lead: u8) -> Option<(usize, (u8, u8))> {
    match lead {
        0x00..=0x7F => Some((1, (0x80, 0xBF))),
        0xC2..=0xDF => Some((2, (0x80, 0xBF))),
        0xE0 => Some((3, (0xA0, 0xBF))),
        0xE1..=0xEC | 0xEE..=0xEF => Some((3, (0x80, 0xBF))),
        0xED => Some((3, (0x80, 0x9F))),
        0xF0 => Some((4, (0x90, 0xBF))),
        0xF1..=0xF3 => Some((4, (0x80, 0xBF))),
        0xF4 => Some((4, (0x80, 0x8F))),
        _ => None,
    }
}

fn escaped_byte(encoded: &str, position: usize) -> Result<u8, IdentityError> {
    let bytes = encoded.as_bytes();
    if bytes.get(position) != Some(&b'%') || position + 2 >= bytes.len() {
        return Err(IdentityError::UnknownFileNameEncoding(format!(
            "'{encoded}' has a truncated escape at position {position}"
        )));
    }
    let high = hex_value(bytes[position + 1]);
    let low = hex_value(bytes[position + 2]);
    match (high, low) {
        (Some(high), Some(low)) => Ok((high << 4) | low),
        _ => Err(IdentityError::UnknownFileNameEncoding(format!(
            "'{encoded}' has an invalid hex digit at position {position}"
        ))),
    }
}

fn reserved_escape_for(ch: char) -> Option<&'static str> {
    RESERVED_ESCAPES
        .iter()
        .find(|(reserved, _)| *reserved == ch)
        .map(|(_, escape)| *escape)
}

fn reserved_char_for(byte: u8) -> Option<char> {
    RESERVED_ESCAPES
        .iter()
        .map(|(reserved, _)| *reserved)
        .find(|reserved| *reserved as u32 == u32::from(byte))
}

fn hex_digit(nibble: u8) -> char {
    char::from(b"0123456789ABCDEF"[usize::from(nibble & 0x0F)])
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        _ => None,
    }
}

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..=0xDBFF).contains(&unit)
}

fn is_low_surrogate(unit: u16) -> bool {
    (0xDC00..=0xDFFF).contains(&unit)
}

/// Crockford-style base32 of exactly eight bytes: thirteen characters, the
/// last one zero-padded, no `=` padding.
pub fn base32_encode(bytes: &[u8; 8]) -> String {
    let mut encoded = String::with_capacity(13);
    let mut buffer: u32 = 0;
    let mut bits = 0_u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            encoded.push(char::from(BASE32_ALPHABET[((buffer >> bits) & 0x1F) as usize]));
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        encoded.push(char::from(
            BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1F) as usize],
        ));
    }
    encoded
}

pub fn base64_decode(text: &str) -> Result<Vec<u8>, IdentityError> {
    let bytes = text.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(IdentityError::InvalidParameter(format!(
            "base64 input length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let group_count = bytes.len() / 4;
    let mut decoded = Vec::with_capacity(group_count * 3);
    for (group_index, group) in bytes.chunks_exact(4).enumerate() {
        let mut values = [0_u8; 4];
        for (slot, &ch) in values.iter_mut().zip(group) {
            *slot = base64_value(ch)?;
        }
        let [first, second, third, fourth] = values;

        let padded = third == BASE64_PAD || fourth == BASE64_PAD;
        if first == BASE64_PAD
            || second == BASE64_PAD
            || (third == BASE64_PAD && fourth != BASE64_PAD)
            || (padded && group_index + 1 != group_count)
        {
            return Err(IdentityError::InvalidParameter(format!(
                "base64 padding is misplaced in group {}",
                group_index + 1
            )));
        }

        decoded.push((first << 2) | (second >> 4));
        if third != BASE64_PAD {
            decoded.push((second << 4) | (third >> 2));
            if fourth != BASE64_PAD {
                decoded.push((third << 6) | fourth);
            }
        }
    }
    Ok(decoded)
}

fn base64_value(ch: u8) -> Result<u8, IdentityError> {
    let value = BASE64_TABLE
        .get(usize::from(ch))
        .copied()
        .unwrap_or(BASE64_INVALID);
    if value == BASE64_INVALID {
        return Err(IdentityError::InvalidParameter(format!(
            "byte 0x{ch:02X} is not a base64 character"
        )));
    }
    Ok(value)
}
