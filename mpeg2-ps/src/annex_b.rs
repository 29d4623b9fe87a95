//! H.264 Annex B byte streams: locating NAL units and converting between
//! their encapsulated (EBSP) and raw (RBSP) payload forms.
//!
//! See [ISO/IEC 14496-10](https://www.itu.int/rec/T-REC-H.264) Annex B for
//! the start-code framing and section 7.4.1 for emulation prevention.

use std::cmp;
use std::io::{Read, Seek, SeekFrom};

use bytes::{BufMut, Bytes, BytesMut};
use failure::Error;

use crate::FormatError;

pub const NAL_UNIT_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
pub const NAL_UNIT_START_CODE_LONG: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

// Table 7-1 unit types the segmenter cares about.
pub const NAL_NON_IDR_SLICE: u8 = 1;
pub const NAL_IDR_SLICE: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// One NAL unit with its payload already unescaped to RBSP.
///
/// Serializing and re-parsing a well-formed unit yields an equal value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NalUnit {
    /// Whether the unit was (and will be) framed with the 4-byte
    /// `00 00 00 01` start code rather than the 3-byte one.
    pub is_start_code_long: bool,
    pub nal_ref_idc: u8,
    pub nal_unit_type: u8,
    pub rbsp: Bytes,
}

fn read_byte<R: Read>(stream: &mut R) -> Result<Option<u8>, std::io::Error> {
    let mut buf = [0u8; 1];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Scans forward to the next start code, optionally only stopping on a unit
/// of the given type. On a hit the stream is left at the first byte of the
/// start code prefix (at most three zeros are counted as prefix; earlier
/// zeros belong to the preceding unit) and the unit type is returned.
/// `Ok(None)` at end of stream; byte runs that never form a start code are
/// skipped silently.
pub fn seek_nal_unit<R: Read + Seek>(
    stream: &mut R,
    nal_unit_type: Option<u8>,
) -> Result<Option<u8>, Error> {
    let mut zero_count: u64 = 0;
    loop {
        let current = match read_byte(stream)? {
            None => return Ok(None),
            Some(b) => b,
        };
        if zero_count >= 2 && current == 0x01 {
            let header = match read_byte(stream)? {
                None => return Ok(None),
                Some(b) => b,
            };
            let current_type = header & 0x1f;
            zero_count = cmp::min(zero_count, 3);
            if nal_unit_type.map_or(true, |want| want == current_type) {
                stream.seek(SeekFrom::Current(-((zero_count + 2) as i64)))?;
                return Ok(Some(current_type));
            }
            if header == 0x00 {
                zero_count += 1;
            } else {
                zero_count = 0;
            }
            continue;
        }
        if current == 0x00 {
            zero_count += 1;
        } else {
            zero_count = 0;
        }
    }
}

/// Indexes every NAL unit in the stream as `(position, size)` byte pairs.
/// `position` is the offset of the first start-code prefix byte; `size`
/// extends to the next start code, or to end of stream for the last unit.
pub fn index_nal_units<R: Read + Seek>(stream: &mut R) -> Result<Vec<(u64, u64)>, Error> {
    let mut index = Vec::new();
    let mut last_position: Option<u64> = None;
    while seek_nal_unit(stream, None)?.is_some() {
        let position = stream.seek(SeekFrom::Current(0))?;
        if let Some(last) = last_position {
            index.push((last, position - last));
        }
        last_position = Some(position);
        stream.seek(SeekFrom::Current(4))?;
    }
    if let Some(last) = last_position {
        let position = stream.seek(SeekFrom::Current(0))?;
        index.push((last, position - last));
    }
    Ok(index)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Position of the next `00 00 03` triple that is an emulation prevention
/// escape (followed by a byte ≤ 0x03). A trailing `00 00 03` with nothing
/// after it is not an escape.
fn find_escaped(ebsp: &[u8], from: usize) -> Option<usize> {
    let mut position = from;
    loop {
        position = find(ebsp, &[0x00, 0x00, 0x03], position)?;
        if ebsp.len() <= position + 3 {
            return None;
        }
        if ebsp[position + 3] > 0x03 {
            position += 4;
            continue;
        }
        return Some(position);
    }
}

/// Strips emulation prevention bytes: `00 00 03 XX` becomes `00 00 XX` for
/// `XX ≤ 0x03`. Matches never overlap a prior substitution.
pub fn ebsp_to_rbsp(ebsp: &[u8]) -> Bytes {
    let mut rbsp = BytesMut::with_capacity(ebsp.len());
    let mut current = 0;
    while let Some(escaped) = find_escaped(ebsp, current) {
        rbsp.extend_from_slice(&ebsp[current..escaped]);
        rbsp.extend_from_slice(&[0x00, 0x00, ebsp[escaped + 3]]);
        current = escaped + 4;
    }
    rbsp.extend_from_slice(&ebsp[current..]);
    rbsp.freeze()
}

/// Position of the next `00 00 XX (XX ≤ 0x03)` run needing an escape. A
/// `00 00 03` at the very end of the buffer is left alone so the reader's
/// lookahead round-trips it.
fn find_escape_needed(rbsp: &[u8], from: usize) -> Option<usize> {
    let mut position = from;
    loop {
        position = find(rbsp, &[0x00, 0x00], position)?;
        if rbsp.len() <= position + 2 {
            return None;
        }
        let tail = rbsp[position + 2];
        if tail > 0x03 {
            position += 3;
            continue;
        }
        if position + 2 == rbsp.len() - 1 && tail == 0x03 {
            return None;
        }
        return Some(position);
    }
}

/// Inserts emulation prevention bytes: `00 00 XX` becomes `00 00 03 XX` for
/// `XX ≤ 0x03`, except a trailing `00 00 03`.
pub fn rbsp_to_ebsp(rbsp: &[u8]) -> Bytes {
    let mut ebsp = BytesMut::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut current = 0;
    while let Some(position) = find_escape_needed(rbsp, current) {
        ebsp.extend_from_slice(&rbsp[current..position]);
        ebsp.extend_from_slice(&[0x00, 0x00, 0x03, rbsp[position + 2]]);
        current = position + 3;
    }
    ebsp.extend_from_slice(&rbsp[current..]);
    ebsp.freeze()
}

/// Parses one framed NAL unit: start code prefix, header byte, EBSP payload.
pub fn parse_nal_unit(buffer: &[u8]) -> Result<NalUnit, Error> {
    if buffer.len() < 4 {
        return Err(FormatError::MalformedNalUnit.into());
    }
    let mut zero_count = 0;
    while zero_count < 4 && buffer[zero_count] == 0x00 {
        zero_count += 1;
    }
    if zero_count >= 4 || buffer[zero_count] != 0x01 {
        return Err(FormatError::MalformedNalUnit.into());
    }
    let is_start_code_long = zero_count >= 3;
    let header = match buffer.get(zero_count + 1) {
        None => return Err(FormatError::MalformedNalUnit.into()),
        Some(&b) => b,
    };
    if header & 0x80 != 0 {
        // forbidden_zero_bit
        return Err(FormatError::MalformedNalUnit.into());
    }
    Ok(NalUnit {
        is_start_code_long,
        nal_ref_idc: (header >> 5) & 0x03,
        nal_unit_type: header & 0x1f,
        rbsp: ebsp_to_rbsp(&buffer[zero_count + 2..]),
    })
}

/// Serializes a NAL unit back to its framed Annex B form.
pub fn serialize_nal_unit(nal_unit: &NalUnit) -> Bytes {
    let prefix: &[u8] = if nal_unit.is_start_code_long {
        &NAL_UNIT_START_CODE_LONG
    } else {
        &NAL_UNIT_START_CODE
    };
    let ebsp = rbsp_to_ebsp(&nal_unit.rbsp);
    let mut out = BytesMut::with_capacity(prefix.len() + 1 + ebsp.len());
    out.extend_from_slice(prefix);
    out.put_u8(((nal_unit.nal_ref_idc & 0x03) << 5) | (nal_unit.nal_unit_type & 0x1f));
    out.extend_from_slice(&ebsp);
    out.freeze()
}
