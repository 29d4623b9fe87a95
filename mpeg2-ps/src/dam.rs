//! DAM-specific container layout: the fixed prologue (pack header, system
//! header, program stream map) and the vendor GOP index table stored as a
//! private-stream PES packet right after the program stream map.
//!
//! The index maps each GOP's pack-header byte offset in the finished file to
//! its size and starting PTS, so players can seek without scanning.

use std::convert::TryFrom;

use bitreader::BitReader;
use bytes::Bytes;
use failure::{bail, Error};
use log::warn;

use crate::bitio::{BitWriter, ByteCursor};
use crate::ps::{
    self, AacAudioDescriptor, AvcVideoDescriptor, Descriptor, EsMapEntry, HevcVideoDescriptor,
    PackHeader, PesPacket, PesPacketType2, PStdInfo, ProgramStreamMap, PsPacket, SystemHeader,
};
use crate::FormatError;

/// Stream id of the single elementary stream DAM files carry.
pub const VIDEO_STREAM_ID: u8 = 0xe0;

/// Stream id of the PES packet holding the GOP index.
pub const GOP_INDEX_STREAM_ID: u8 = 0xbf;

const GOP_INDEX_HEADER_SIZE: usize = 6;
const GOP_INDEX_ENTRY_SIZE: usize = 12;
const PES_HEADER_SIZE: usize = 6;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    Avc,
    Aac,
    Hevc,
}

impl std::str::FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "avc" => Ok(Codec::Avc),
            "aac" => Ok(Codec::Aac),
            "hevc" => Ok(Codec::Hevc),
            _ => bail!("unknown codec {:?} (expected avc, aac or hevc)", s),
        }
    }
}

/// One GOP: the byte offset of its pack header in the finished file, its
/// size in bytes, and the PTS of its first access unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GopIndexEntry {
    pub ps_pack_header_position: u64,
    pub access_unit_size: u32,
    pub pts: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GopIndex {
    pub sub_stream_id: u8,
    pub version: u8,
    pub stream_id: u8,
    pub page_number: u8,
    pub page_count: u8,
    pub gops: Vec<GopIndexEntry>,
}

impl GopIndex {
    /// On-disk size of the index PES packet, its 6-byte PES header included.
    pub fn pes_packet_size(&self) -> usize {
        PES_HEADER_SIZE + GOP_INDEX_HEADER_SIZE + self.gops.len() * GOP_INDEX_ENTRY_SIZE
    }
}

/// Serializes the index record. The stored entry count is `len - 1`.
pub fn serialize_gop_index(index: &GopIndex) -> Result<Bytes, Error> {
    let wire_count = match index.gops.len() {
        0 => bail!("GOP index must contain at least one entry"),
        n => u16::try_from(n - 1)?,
    };
    let mut w = BitWriter::with_capacity(
        GOP_INDEX_HEADER_SIZE + index.gops.len() * GOP_INDEX_ENTRY_SIZE,
    );
    w.put_u8(index.sub_stream_id);
    w.put_u8(index.version);
    w.put_u8(index.stream_id);
    w.put_bits(4, u64::from(index.page_number) & 0x0f);
    w.put_bits(4, u64::from(index.page_count) & 0x0f);
    w.put_u16_be(wire_count);
    for gop in &index.gops {
        if gop.ps_pack_header_position >> 40 != 0 {
            bail!(
                "pack header position {} does not fit in 40 bits",
                gop.ps_pack_header_position
            );
        }
        if gop.access_unit_size >> 24 != 0 {
            bail!(
                "access unit size {} does not fit in 24 bits",
                gop.access_unit_size
            );
        }
        w.put_bits(40, gop.ps_pack_header_position);
        w.put_bits(24, u64::from(gop.access_unit_size));
        w.put_u32_be(gop.pts);
    }
    Ok(w.into_bytes())
}

/// Parses an index record; the stored entry count is `field + 1`.
pub fn read_gop_index(payload: &[u8]) -> Result<GopIndex, Error> {
    let mut r = BitReader::new(payload);
    let sub_stream_id = r.read_u8(8)?;
    let version = r.read_u8(8)?;
    let stream_id = r.read_u8(8)?;
    let page_number = r.read_u8(4)?;
    let page_count = r.read_u8(4)?;
    let gop_count = usize::from(r.read_u16(16)?) + 1;
    let mut gops = Vec::with_capacity(gop_count);
    for _ in 0..gop_count {
        let ps_pack_header_position = r.read_u64(40)?;
        let access_unit_size = r.read_u32(24)?;
        let pts = r.read_u32(32)?;
        gops.push(GopIndexEntry {
            ps_pack_header_position,
            access_unit_size,
            pts,
        });
    }
    Ok(GopIndex {
        sub_stream_id,
        version,
        stream_id,
        page_number,
        page_count,
        gops,
    })
}

/// Seeks the first GOP-index PES packet and decodes it. `Ok(None)` when the
/// stream has none.
pub fn load_gop_index(cur: &mut ByteCursor<'_>) -> Result<Option<GopIndex>, Error> {
    if ps::seek_packet(cur, Some(GOP_INDEX_STREAM_ID)).is_none() {
        warn!("GOP index not found");
        return Ok(None);
    }
    let payload = match ps::read_pes_packet(cur)? {
        PesPacket::Type2(p) => p.data,
        _ => return Err(FormatError::InvalidField.into()),
    };
    Ok(Some(read_gop_index(&payload)?))
}

/// Writes the fixed container prologue for the given codec.
pub fn write_container_header(w: &mut BitWriter, codec: Codec) -> Result<(), Error> {
    ps::write_ps_pack_header(
        w,
        &PackHeader {
            scr_base: 0,
            scr_ext: 0,
            program_mux_rate: 20000,
            pack_stuffing_length: 0,
        },
    );
    ps::write_ps_system_header(
        w,
        &SystemHeader {
            rate_bound: 50000,
            audio_bound: 0,
            fixed_flag: false,
            csps_flag: false,
            system_audio_lock_flag: false,
            system_video_lock_flag: true,
            video_bound: 1,
            packet_rate_restriction_flag: true,
            p_std_info: vec![PStdInfo {
                stream_id: VIDEO_STREAM_ID,
                buffer_bound_scale: 1,
                buffer_size_bound: 3051,
            }],
        },
    )?;
    let (stream_type, descriptor) = match codec {
        Codec::Avc => (
            0x1b,
            Descriptor::AvcVideo(AvcVideoDescriptor {
                profile_idc: 77,
                constraint_set0_flag: false,
                constraint_set1_flag: true,
                constraint_set2_flag: false,
                constraint_set3_flag: false,
                constraint_set4_flag: false,
                constraint_set5_flag: false,
                avc_compatible_flags: 0,
                level_idc: 40,
                avc_still_present: false,
                avc_24_hour_picture_flag: false,
                frame_packing_sei_not_present_flag: true,
            }),
        ),
        Codec::Aac => (
            0x0f,
            Descriptor::AacAudio(AacAudioDescriptor {
                profile: 0,
                channel_configuration: 0,
                additional_information: 0,
            }),
        ),
        Codec::Hevc => (
            0x24,
            Descriptor::HevcVideo(HevcVideoDescriptor {
                profile_space: 0,
                tier_flag: false,
                profile_idc: 0,
                profile_compatibility_indication: 0,
                progressive_source_flag: false,
                interlaced_source_flag: false,
                non_packed_constraint_flag: false,
                frame_only_constraint_flag: false,
                copied_44bits: 0,
                level_idc: 0,
                temporal_layer_subset_flag: false,
                hevc_still_present_flag: false,
                hevc_24hr_picture_present_flag: false,
                sub_pic_hrd_params_not_present_flag: false,
                hdr_wcg_idc: 0,
                temporal_id_min: None,
                temporal_id_max: None,
            }),
        ),
    };
    ps::write_program_stream_map(
        w,
        &ProgramStreamMap {
            current_next_indicator: true,
            version: 1,
            descriptors: vec![],
            elementary_stream_map: vec![EsMapEntry {
                stream_type,
                elementary_stream_id: VIDEO_STREAM_ID,
                descriptors: vec![descriptor],
            }],
        },
    )
}

/// Splices a GOP index into a program stream that begins with the container
/// prologue: everything through the first program stream map is copied,
/// then the index PES, then the rest. Every entry position is re-based by
/// the index packet's own size, making the stored offsets valid for the
/// finished file.
///
/// The index payload may itself contain `00 00 01` runs; it is stored
/// without emulation prevention.
pub fn insert_gop_index(input: &[u8], gop_index: &GopIndex) -> Result<Bytes, Error> {
    let mut cur = ByteCursor::new(input);
    if ps::seek_packet(&mut cur, Some(ps::PROGRAM_STREAM_MAP_CODE)).is_none() {
        return Err(FormatError::NotFound.into());
    }
    ps::read_program_stream_map(&mut cur)?;
    let header_size = cur.position();

    let pes_packet_size = gop_index.pes_packet_size() as u64;
    let mut rebased = gop_index.clone();
    for gop in &mut rebased.gops {
        gop.ps_pack_header_position += pes_packet_size;
    }
    let payload = serialize_gop_index(&rebased)?;

    let mut w = BitWriter::with_capacity(input.len() + payload.len() + PES_HEADER_SIZE);
    w.put_bytes(&input[..header_size]);
    ps::write_pes_packet(
        &mut w,
        &PesPacket::Type2(PesPacketType2 {
            stream_id: GOP_INDEX_STREAM_ID,
            data: payload,
        }),
    )?;
    w.put_bytes(&input[header_size..]);
    Ok(w.into_bytes())
}

/// Presence of the records a DAM player needs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ContainerCheck {
    pub pack_header: bool,
    pub system_header: bool,
    pub program_stream_map: bool,
    pub gop_index: bool,
}

impl ContainerCheck {
    pub fn bits(&self) -> u8 {
        (self.pack_header as u8)
            | ((self.system_header as u8) << 1)
            | ((self.program_stream_map as u8) << 2)
            | ((self.gop_index as u8) << 3)
    }

    /// A stream missing its pack or system header cannot be rewritten into
    /// a DAM container.
    pub fn is_convertable(&self) -> bool {
        self.pack_header && self.system_header
    }

    pub fn is_compatible(&self) -> bool {
        self.pack_header && self.system_header && self.program_stream_map && self.gop_index
    }
}

/// Walks the stream and records which container pieces are present. Parse
/// errors end the walk; whatever was not seen stays reported as absent.
pub fn check_container(data: &[u8]) -> ContainerCheck {
    let mut cur = ByteCursor::new(data);
    let mut check = ContainerCheck::default();
    loop {
        match ps::read_ps_packet(&mut cur) {
            Ok(Some(PsPacket::PackHeader(_))) => check.pack_header = true,
            Ok(Some(PsPacket::SystemHeader(_))) => check.system_header = true,
            Ok(Some(PsPacket::ProgramStreamMap(_))) => check.program_stream_map = true,
            Ok(Some(PsPacket::Pes(p))) => {
                if p.stream_id() == GOP_INDEX_STREAM_ID {
                    check.gop_index = true;
                }
            }
            Ok(Some(PsPacket::ProgramEnd)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!("stopping container scan on parse error: {}", e);
                break;
            }
        }
    }
    check
}

/// Recomputes a GOP index from the stream itself: one entry per pack
/// header, sized to the next pack header or the program end, with the PTS
/// of the first matching PES packet under it (the pack's own SCR when no
/// such packet carries one). A terminal zero-size entry points past the
/// program end marker, carrying the last PTS seen.
pub fn analyze_gop_index(data: &[u8], stream_id: u8) -> Result<GopIndex, Error> {
    let mut cur = ByteCursor::new(data);
    let mut gops = Vec::new();
    // Position, first PTS, and SCR fallback of the pack being walked.
    let mut open: Option<(u64, Option<u32>, u32)> = None;
    let mut last_pts = 0u32;
    let mut end_position: Option<u64> = None;

    fn close(
        open: &mut Option<(u64, Option<u32>, u32)>,
        gops: &mut Vec<GopIndexEntry>,
        position: u64,
    ) -> Result<(), Error> {
        if let Some((start, first_pts, scr)) = open.take() {
            gops.push(GopIndexEntry {
                ps_pack_header_position: start,
                access_unit_size: u32::try_from(position - start)?,
                pts: first_pts.unwrap_or(scr),
            });
        }
        Ok(())
    }

    loop {
        let packet_id = match ps::seek_packet(&mut cur, None) {
            None => break,
            Some(id) => id,
        };
        let position = cur.position() as u64;
        match packet_id {
            ps::PROGRAM_END_CODE => {
                cur.skip(4)?;
                // The open GOP ends at the marker; the terminal entry
                // points past it, matching what the generator stores.
                close(&mut open, &mut gops, position)?;
                end_position = Some(position + 4);
                break;
            }
            ps::PACK_HEADER_CODE => {
                let header = ps::read_ps_pack_header(&mut cur)?;
                close(&mut open, &mut gops, position)?;
                open = Some((position, None, u32::try_from(header.scr_base)?));
            }
            ps::SYSTEM_HEADER_CODE => {
                ps::read_ps_system_header(&mut cur)?;
            }
            ps::PROGRAM_STREAM_MAP_CODE => {
                ps::read_program_stream_map(&mut cur)?;
            }
            _ => {
                if let PesPacket::Type1(p) = ps::read_pes_packet(&mut cur)? {
                    if p.stream_id == stream_id {
                        if let Some(pts) = p.pts {
                            let pts = u32::try_from(pts)?;
                            last_pts = pts;
                            if let Some(o) = open.as_mut() {
                                if o.1.is_none() {
                                    o.1 = Some(pts);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let end = end_position.unwrap_or(data.len() as u64);
    close(&mut open, &mut gops, end)?;
    gops.push(GopIndexEntry {
        ps_pack_header_position: end,
        access_unit_size: 0,
        pts: last_pts,
    });
    Ok(GopIndex {
        sub_stream_id: 0xff,
        version: 0x01,
        stream_id,
        page_number: 0,
        page_count: 0,
        gops,
    })
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn two_entry_index() -> GopIndex {
        GopIndex {
            sub_stream_id: 0xff,
            version: 0x01,
            stream_id: 0xe0,
            page_number: 0,
            page_count: 0,
            gops: vec![
                GopIndexEntry {
                    ps_pack_header_position: 0,
                    access_unit_size: 40000,
                    pts: 0,
                },
                GopIndexEntry {
                    ps_pack_header_position: 40000,
                    access_unit_size: 12345,
                    pts: 3003,
                },
            ],
        }
    }

    #[test]
    fn gop_index_fixed_serialization() {
        let index = two_entry_index();
        let bytes = serialize_gop_index(&index).unwrap();
        // gop_count on the wire is N - 1.
        assert_eq!(
            &bytes[..],
            &hex!(
                "ff01e0000001
                 0000000000009c4000000000
                 0000009c4000303900000bbb"
            )[..]
        );
        assert_eq!(read_gop_index(&bytes).unwrap(), index);
        assert_eq!(index.pes_packet_size(), 6 + 6 + 2 * 12);
    }

    #[test]
    fn gop_index_rejects_empty_and_truncated() {
        let empty = GopIndex {
            gops: vec![],
            ..two_entry_index()
        };
        assert!(serialize_gop_index(&empty).is_err());

        let bytes = serialize_gop_index(&two_entry_index()).unwrap();
        assert!(read_gop_index(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn container_header_prologue_bytes() {
        let mut w = BitWriter::new();
        write_container_header(&mut w, Codec::Avc).unwrap();
        let bytes = w.into_bytes();
        // Pack header: SCR 0, mux rate 20000, no stuffing.
        assert_eq!(&bytes[0..14], &hex!("000001ba440004000401013883f8")[..]);
        // System header with the single video P-STD entry.
        assert_eq!(
            &bytes[14..29],
            &hex!("000001bb00098186a10061ffe0ebeb")[..]
        );
        // Program stream map for AVC, CRC excluded from the comparison.
        assert_eq!(
            &bytes[29..bytes.len() - 4],
            &hex!("000001bc0014e1ff0000000a1be0000628044d40283f")[..]
        );
        let stored = u32::from_be_bytes([
            bytes[bytes.len() - 4],
            bytes[bytes.len() - 3],
            bytes[bytes.len() - 2],
            bytes[bytes.len() - 1],
        ]);
        assert_eq!(stored, ps::crc32(&bytes[29..bytes.len() - 4]));
        assert_eq!(bytes.len(), 55);
    }

    #[test]
    fn insert_rebases_offsets_and_preserves_layout() {
        let mut w = BitWriter::new();
        write_container_header(&mut w, Codec::Avc).unwrap();
        let prologue_len = w.byte_len();
        // A dummy payload region the index points into.
        ps::write_ps_pack_header(
            &mut w,
            &PackHeader {
                scr_base: 0,
                scr_ext: 0,
                program_mux_rate: 20000,
                pack_stuffing_length: 0,
            },
        );
        ps::write_program_end(&mut w);
        let input = w.into_bytes();

        let index = GopIndex {
            sub_stream_id: 0xff,
            version: 0x01,
            stream_id: 0xe0,
            page_number: 0,
            page_count: 0,
            gops: vec![GopIndexEntry {
                ps_pack_header_position: prologue_len as u64,
                access_unit_size: 14,
                pts: 0,
            }],
        };
        let out = insert_gop_index(&input, &index).unwrap();
        let pes_size = index.pes_packet_size();
        assert_eq!(out.len(), input.len() + pes_size);
        // Prologue is copied verbatim, the index PES follows immediately.
        assert_eq!(&out[..prologue_len], &input[..prologue_len]);
        assert_eq!(
            &out[prologue_len..prologue_len + 4],
            &[0x00, 0x00, 0x01, GOP_INDEX_STREAM_ID]
        );

        let mut cur = ByteCursor::new(&out);
        let loaded = load_gop_index(&mut cur).unwrap().unwrap();
        let position = loaded.gops[0].ps_pack_header_position as usize;
        assert_eq!(position, prologue_len + pes_size);
        // The stored offset lands on a real pack header.
        assert_eq!(&out[position..position + 4], &hex!("000001ba")[..]);
    }

    #[test]
    fn insert_without_psm_is_not_found() {
        let input = hex!("000001ba440004000401013883f8");
        let err = insert_gop_index(&input, &two_entry_index()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FormatError>(),
            Some(&FormatError::NotFound)
        );
    }

    #[test]
    fn load_returns_none_without_index() {
        let mut w = BitWriter::new();
        write_container_header(&mut w, Codec::Avc).unwrap();
        let bytes = w.into_bytes();
        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(load_gop_index(&mut cur).unwrap(), None);
    }

    #[test]
    fn check_reports_missing_pieces() {
        let empty = check_container(&[]);
        assert_eq!(empty.bits(), 0);
        assert!(!empty.is_convertable());

        let mut w = BitWriter::new();
        write_container_header(&mut w, Codec::Avc).unwrap();
        let prologue_only = w.into_bytes();
        let check = check_container(&prologue_only);
        assert!(check.pack_header && check.system_header && check.program_stream_map);
        assert!(!check.gop_index);
        assert!(check.is_convertable());
        assert!(!check.is_compatible());
    }
}
