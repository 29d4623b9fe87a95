//! MPEG-2 Program Stream records: pack header, system header, program
//! stream map, descriptors, PES packets, program end.
//!
//! Bit layouts follow [ISO/IEC 13818-1](https://www.iso.org/standard/75928.html)
//! section 2.5, narrowed to the fixed values DAM players expect. Readers
//! take a [ByteCursor] positioned at the record's start code; writers append
//! to a [BitWriter].

use std::convert::TryFrom;
use std::fmt;

use bitreader::BitReader;
use bytes::Bytes;
use crc::{Crc, CRC_32_MPEG_2};
use failure::{bail, Error};
use log::warn;
use pretty_hex::PrettyHex;

use crate::bitio::{BitWriter, ByteCursor};
use crate::FormatError;

pub const PACKET_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

pub const PROGRAM_END_CODE: u8 = 0xb9;
pub const PACK_HEADER_CODE: u8 = 0xba;
pub const SYSTEM_HEADER_CODE: u8 = 0xbb;
pub const PROGRAM_STREAM_MAP_CODE: u8 = 0xbc;
pub const PADDING_STREAM_ID: u8 = 0xbe;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC-32/MPEG-2: poly 0x04C11DB7, init 0xFFFFFFFF, MSB-first, no final XOR.
pub fn crc32(buffer: &[u8]) -> u32 {
    CRC32.checksum(buffer)
}

/// Pack header (section 2.5.3.3). The 33-bit SCR base and 9-bit extension
/// express a 27 MHz clock as a 90 kHz tick plus a 1/300 remainder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PackHeader {
    pub scr_base: u64,
    pub scr_ext: u16,
    pub program_mux_rate: u32,
    pub pack_stuffing_length: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PStdInfo {
    pub stream_id: u8,
    pub buffer_bound_scale: u8,
    pub buffer_size_bound: u16,
}

/// System header (section 2.5.3.5).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SystemHeader {
    pub rate_bound: u32,
    pub audio_bound: u8,
    pub fixed_flag: bool,
    pub csps_flag: bool,
    pub system_audio_lock_flag: bool,
    pub system_video_lock_flag: bool,
    pub video_bound: u8,
    pub packet_rate_restriction_flag: bool,
    pub p_std_info: Vec<PStdInfo>,
}

/// Any descriptor tag without a dedicated variant below.
#[derive(Clone, Eq, PartialEq)]
pub struct GenericDescriptor {
    pub tag: u8,
    pub data: Bytes,
}

impl fmt::Debug for GenericDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericDescriptor")
            .field("tag", &self.tag)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

/// AVC video descriptor, tag 0x28 (H.222 amendment 3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AvcVideoDescriptor {
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub avc_compatible_flags: u8,
    pub level_idc: u8,
    pub avc_still_present: bool,
    pub avc_24_hour_picture_flag: bool,
    pub frame_packing_sei_not_present_flag: bool,
}

/// MPEG-2 AAC audio descriptor, tag 0x2B.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AacAudioDescriptor {
    pub profile: u8,
    pub channel_configuration: u8,
    pub additional_information: u8,
}

/// HEVC video descriptor, tag 0x38. The temporal id pair is present exactly
/// when `temporal_layer_subset_flag` is set (15-byte form).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HevcVideoDescriptor {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub profile_compatibility_indication: u32,
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub copied_44bits: u64,
    pub level_idc: u8,
    pub temporal_layer_subset_flag: bool,
    pub hevc_still_present_flag: bool,
    pub hevc_24hr_picture_present_flag: bool,
    pub sub_pic_hrd_params_not_present_flag: bool,
    pub hdr_wcg_idc: u8,
    pub temporal_id_min: Option<u8>,
    pub temporal_id_max: Option<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Descriptor {
    Generic(GenericDescriptor),
    AvcVideo(AvcVideoDescriptor),
    AacAudio(AacAudioDescriptor),
    HevcVideo(HevcVideoDescriptor),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EsMapEntry {
    pub stream_type: u8,
    pub elementary_stream_id: u8,
    pub descriptors: Vec<Descriptor>,
}

/// Program stream map (section 2.5.4.1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgramStreamMap {
    pub current_next_indicator: bool,
    pub version: u8,
    pub descriptors: Vec<Descriptor>,
    pub elementary_stream_map: Vec<EsMapEntry>,
}

/// PES packet carrying the full extension byte set, an optional PTS/DTS
/// pair, and an elementary stream payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PesPacketType1 {
    pub stream_id: u8,
    pub scrambling_control: u8,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original_or_copy: bool,
    pub pts_dts_flags: u8,
    pub escr_flag: bool,
    pub es_rate_flag: bool,
    pub dsm_trick_mode_flag: bool,
    pub additional_copy_info_flag: bool,
    pub crc_flag: bool,
    pub extension_flag: bool,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub data: Bytes,
}

impl PesPacketType1 {
    /// A packet with every optional flag clear, as the packetizer emits.
    pub fn new(
        stream_id: u8,
        pts_dts_flags: u8,
        pts: Option<u64>,
        dts: Option<u64>,
        data: Bytes,
    ) -> Self {
        PesPacketType1 {
            stream_id,
            scrambling_control: 0,
            priority: false,
            data_alignment_indicator: false,
            copyright: false,
            original_or_copy: false,
            pts_dts_flags,
            escr_flag: false,
            es_rate_flag: false,
            dsm_trick_mode_flag: false,
            additional_copy_info_flag: false,
            crc_flag: false,
            extension_flag: false,
            pts,
            dts,
            data,
        }
    }
}

/// PES packet whose body is an opaque byte string (program stream map,
/// private stream 2, ECM/EMM and friends).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PesPacketType2 {
    pub stream_id: u8,
    pub data: Bytes,
}

/// Padding stream packet: a length and nothing else worth keeping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PesPacketType3 {
    pub stream_id: u8,
    pub packet_length: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PesPacket {
    Type1(PesPacketType1),
    Type2(PesPacketType2),
    Type3(PesPacketType3),
}

impl PesPacket {
    pub fn stream_id(&self) -> u8 {
        match self {
            PesPacket::Type1(p) => p.stream_id,
            PesPacket::Type2(p) => p.stream_id,
            PesPacket::Type3(p) => p.stream_id,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PsPacket {
    ProgramEnd,
    PackHeader(PackHeader),
    SystemHeader(SystemHeader),
    ProgramStreamMap(ProgramStreamMap),
    Pes(PesPacket),
}

fn is_type2_stream_id(stream_id: u8) -> bool {
    match stream_id {
        0xbc | 0xbf | 0xf0 | 0xf1 | 0xff | 0xf2 | 0xf8 => true,
        _ => false,
    }
}

/// Scans forward to the next `00 00 01` start code, optionally only stopping
/// on the given packet id. On a hit the cursor is left at the first start
/// code byte and the id is returned; `None` at end of buffer.
pub fn seek_packet(cur: &mut ByteCursor<'_>, packet_id: Option<u8>) -> Option<u8> {
    let mut zero_count = 0u32;
    loop {
        let current = cur.read_u8().ok()?;
        if zero_count >= 2 && current == 0x01 {
            let id = cur.read_u8().ok()?;
            if packet_id.map_or(true, |want| want == id) {
                cur.set_position(cur.position() - 4);
                return Some(id);
            }
            if id == 0x00 {
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

/// The packet id under the cursor, or `None` when the next four bytes are
/// not a start code.
pub fn peek_packet_id(cur: &ByteCursor<'_>) -> Option<u8> {
    let buffer = cur.peek(4)?;
    if buffer[0..3] != PACKET_START_CODE {
        warn!("invalid packet start code {:02x?}", &buffer[0..3]);
        return None;
    }
    Some(buffer[3])
}

fn expect_start_code(cur: &mut ByteCursor<'_>, packet_id: u8) -> Result<(), Error> {
    let code = cur.read(4)?;
    if code[0..3] != PACKET_START_CODE || code[3] != packet_id {
        return Err(FormatError::InvalidStartCode.into());
    }
    Ok(())
}

// 33-bit PTS/DTS and SCR base values are stored with marker bits spliced in
// at fixed positions; these shift the value bits around them.

fn pack_timestamp(marker_bits: u64, value: u64) -> u64 {
    marker_bits
        | ((value & (0x0007 << 30)) << 3)
        | ((value & (0x7fff << 15)) << 2)
        | ((value & 0x7fff) << 1)
}

fn unpack_timestamp(raw: u64) -> u64 {
    ((raw >> 3) & (0x0007 << 30)) | ((raw >> 2) & (0x7fff << 15)) | ((raw >> 1) & 0x7fff)
}

pub fn read_ps_pack_header(cur: &mut ByteCursor<'_>) -> Result<PackHeader, Error> {
    expect_start_code(cur, PACK_HEADER_CODE)?;
    let mut r = BitReader::new(cur.read(10)?);
    let scr_raw = r.read_u64(48)?;
    let scr_base =
        ((scr_raw >> 13) & (0x0007 << 30)) | ((scr_raw >> 12) & (0x7fff << 15)) | ((scr_raw >> 11) & 0x7fff);
    let scr_ext = ((scr_raw >> 1) & 0x01ff) as u16;
    let program_mux_rate = r.read_u32(24)? >> 2;
    r.skip(5)?; // marker bits and reserved
    let pack_stuffing_length = r.read_u8(3)?;
    cur.skip(usize::from(pack_stuffing_length))?;
    Ok(PackHeader {
        scr_base,
        scr_ext,
        program_mux_rate,
        pack_stuffing_length,
    })
}

pub fn write_ps_pack_header(w: &mut BitWriter, data: &PackHeader) {
    w.put_bytes(&PACKET_START_CODE);
    w.put_u8(PACK_HEADER_CODE);
    let mut scr_raw: u64 = 0x4400_0400_0401;
    scr_raw |= (data.scr_base & (0x0007 << 30)) << 13;
    scr_raw |= (data.scr_base & (0x7fff << 15)) << 12;
    scr_raw |= (data.scr_base & 0x7fff) << 11;
    scr_raw |= (u64::from(data.scr_ext) & 0x01ff) << 1;
    w.put_bits(48, scr_raw);
    w.put_bits(24, ((u64::from(data.program_mux_rate) & 0x3f_ffff) << 2) | 0x03);
    w.put_bits(8, 0xf8 | (u64::from(data.pack_stuffing_length) & 0x07));
    for _ in 0..data.pack_stuffing_length {
        w.put_u8(0xff);
    }
}

pub fn read_ps_system_header(cur: &mut ByteCursor<'_>) -> Result<SystemHeader, Error> {
    expect_start_code(cur, SYSTEM_HEADER_CODE)?;
    let header_length = usize::from(cur.read_u16_be()?);
    let body = cur.read(header_length)?;
    let mut r = BitReader::new(body);
    let rate_bound = (r.read_u32(24)? >> 1) & 0x3f_ffff;
    let audio_bound = r.read_u8(6)?;
    let fixed_flag = r.read_bool()?;
    let csps_flag = r.read_bool()?;
    let system_audio_lock_flag = r.read_bool()?;
    let system_video_lock_flag = r.read_bool()?;
    r.skip(1)?; // marker_bit
    let video_bound = r.read_u8(5)?;
    let packet_rate_restriction_flag = r.read_bool()?;
    r.skip(7)?; // reserved_bits
    let mut p_std_info = Vec::new();
    loop {
        let remaining_bits = body.len() as u64 * 8 - r.position();
        if remaining_bits < 8 {
            break;
        }
        let stream_id = r.read_u8(8)?;
        if stream_id & 0x80 != 0x80 {
            break;
        }
        let temp = r.read_u16(16)?;
        p_std_info.push(PStdInfo {
            stream_id,
            buffer_bound_scale: ((temp >> 13) & 0x01) as u8,
            buffer_size_bound: temp & 0x1fff,
        });
    }
    Ok(SystemHeader {
        rate_bound,
        audio_bound,
        fixed_flag,
        csps_flag,
        system_audio_lock_flag,
        system_video_lock_flag,
        video_bound,
        packet_rate_restriction_flag,
        p_std_info,
    })
}

pub fn write_ps_system_header(w: &mut BitWriter, data: &SystemHeader) -> Result<(), Error> {
    let mut body = BitWriter::with_capacity(6 + 3 * data.p_std_info.len());
    body.put_bits(24, 0x80_0001 | ((u64::from(data.rate_bound) & 0x3f_ffff) << 1));
    body.put_bits(6, u64::from(data.audio_bound));
    body.put_bits(1, data.fixed_flag as u64);
    body.put_bits(1, data.csps_flag as u64);
    body.put_bits(1, data.system_audio_lock_flag as u64);
    body.put_bits(1, data.system_video_lock_flag as u64);
    body.put_bits(1, 1); // marker_bit
    body.put_bits(5, u64::from(data.video_bound));
    body.put_bits(1, data.packet_rate_restriction_flag as u64);
    body.put_bits(7, 0x7f); // reserved_bits
    for info in &data.p_std_info {
        body.put_u8(info.stream_id);
        body.put_u16_be(
            0xc000 | ((u16::from(info.buffer_bound_scale) & 0x01) << 13)
                | (info.buffer_size_bound & 0x1fff),
        );
    }
    let body = body.into_bytes();
    w.put_bytes(&PACKET_START_CODE);
    w.put_u8(SYSTEM_HEADER_CODE);
    w.put_u16_be(u16::try_from(body.len())?);
    w.put_bytes(&body);
    Ok(())
}

/// Reads one descriptor, dispatching on the tag. `Ok(None)` when the cursor
/// is exhausted.
pub fn read_descriptor(cur: &mut ByteCursor<'_>) -> Result<Option<Descriptor>, Error> {
    let tag = match cur.peek(1) {
        None => return Ok(None),
        Some(b) => b[0],
    };
    let descriptor = match tag {
        0x28 => Descriptor::AvcVideo(read_avc_video_descriptor(cur)?),
        0x2b => Descriptor::AacAudio(read_aac_audio_descriptor(cur)?),
        0x38 => Descriptor::HevcVideo(read_hevc_video_descriptor(cur)?),
        _ => Descriptor::Generic(read_generic_descriptor(cur)?),
    };
    Ok(Some(descriptor))
}

fn read_generic_descriptor(cur: &mut ByteCursor<'_>) -> Result<GenericDescriptor, Error> {
    let tag = cur.read_u8()?;
    let length = usize::from(cur.read_u8()?);
    Ok(GenericDescriptor {
        tag,
        data: Bytes::copy_from_slice(cur.read(length)?),
    })
}

fn read_avc_video_descriptor(cur: &mut ByteCursor<'_>) -> Result<AvcVideoDescriptor, Error> {
    let tag = cur.read_u8()?;
    let length = cur.read_u8()?;
    if tag != 0x28 || length != 4 {
        return Err(FormatError::InvalidField.into());
    }
    let mut r = BitReader::new(cur.read(4)?);
    Ok(AvcVideoDescriptor {
        profile_idc: r.read_u8(8)?,
        constraint_set0_flag: r.read_bool()?,
        constraint_set1_flag: r.read_bool()?,
        constraint_set2_flag: r.read_bool()?,
        constraint_set3_flag: r.read_bool()?,
        constraint_set4_flag: r.read_bool()?,
        constraint_set5_flag: r.read_bool()?,
        avc_compatible_flags: r.read_u8(2)?,
        level_idc: r.read_u8(8)?,
        avc_still_present: r.read_bool()?,
        avc_24_hour_picture_flag: r.read_bool()?,
        frame_packing_sei_not_present_flag: r.read_bool()?,
    })
}

fn read_aac_audio_descriptor(cur: &mut ByteCursor<'_>) -> Result<AacAudioDescriptor, Error> {
    let tag = cur.read_u8()?;
    let length = cur.read_u8()?;
    if tag != 0x2b || length != 3 {
        return Err(FormatError::InvalidField.into());
    }
    let data = cur.read(3)?;
    Ok(AacAudioDescriptor {
        profile: data[0],
        channel_configuration: data[1],
        additional_information: data[2],
    })
}

fn read_hevc_video_descriptor(cur: &mut ByteCursor<'_>) -> Result<HevcVideoDescriptor, Error> {
    let tag = cur.read_u8()?;
    let length = cur.read_u8()?;
    if tag != 0x38 || (length != 13 && length != 15) {
        return Err(FormatError::InvalidField.into());
    }
    let mut r = BitReader::new(cur.read(usize::from(length))?);
    let profile_space = r.read_u8(2)?;
    let tier_flag = r.read_bool()?;
    let profile_idc = r.read_u8(5)?;
    let profile_compatibility_indication = r.read_u32(32)?;
    let progressive_source_flag = r.read_bool()?;
    let interlaced_source_flag = r.read_bool()?;
    let non_packed_constraint_flag = r.read_bool()?;
    let frame_only_constraint_flag = r.read_bool()?;
    let copied_44bits = r.read_u64(44)?;
    let level_idc = r.read_u8(8)?;
    let temporal_layer_subset_flag = r.read_bool()?;
    let hevc_still_present_flag = r.read_bool()?;
    let hevc_24hr_picture_present_flag = r.read_bool()?;
    let sub_pic_hrd_params_not_present_flag = r.read_bool()?;
    r.skip(2)?; // reserved
    let hdr_wcg_idc = r.read_u8(2)?;
    let (temporal_id_min, temporal_id_max) = if temporal_layer_subset_flag {
        if length != 15 {
            return Err(FormatError::InvalidField.into());
        }
        let min = r.read_u8(3)?;
        r.skip(5)?; // reserved
        let max = r.read_u8(3)?;
        r.skip(5)?; // reserved
        (Some(min), Some(max))
    } else {
        if length != 13 {
            return Err(FormatError::InvalidField.into());
        }
        (None, None)
    };
    Ok(HevcVideoDescriptor {
        profile_space,
        tier_flag,
        profile_idc,
        profile_compatibility_indication,
        progressive_source_flag,
        interlaced_source_flag,
        non_packed_constraint_flag,
        frame_only_constraint_flag,
        copied_44bits,
        level_idc,
        temporal_layer_subset_flag,
        hevc_still_present_flag,
        hevc_24hr_picture_present_flag,
        sub_pic_hrd_params_not_present_flag,
        hdr_wcg_idc,
        temporal_id_min,
        temporal_id_max,
    })
}

pub fn write_descriptor(w: &mut BitWriter, descriptor: &Descriptor) -> Result<(), Error> {
    match descriptor {
        Descriptor::Generic(d) => {
            w.put_u8(d.tag);
            w.put_u8(u8::try_from(d.data.len())?);
            w.put_bytes(&d.data);
        }
        Descriptor::AvcVideo(d) => {
            w.put_bytes(&[0x28, 0x04]);
            w.put_bits(8, u64::from(d.profile_idc));
            w.put_bits(1, d.constraint_set0_flag as u64);
            w.put_bits(1, d.constraint_set1_flag as u64);
            w.put_bits(1, d.constraint_set2_flag as u64);
            w.put_bits(1, d.constraint_set3_flag as u64);
            w.put_bits(1, d.constraint_set4_flag as u64);
            w.put_bits(1, d.constraint_set5_flag as u64);
            w.put_bits(2, u64::from(d.avc_compatible_flags) & 0x03);
            w.put_bits(8, u64::from(d.level_idc));
            w.put_bits(1, d.avc_still_present as u64);
            w.put_bits(1, d.avc_24_hour_picture_flag as u64);
            w.put_bits(1, d.frame_packing_sei_not_present_flag as u64);
            w.put_bits(5, 0x1f); // reserved
        }
        Descriptor::AacAudio(d) => {
            w.put_bytes(&[
                0x2b,
                0x03,
                d.profile,
                d.channel_configuration,
                d.additional_information,
            ]);
        }
        Descriptor::HevcVideo(d) => {
            w.put_u8(0x38);
            w.put_u8(if d.temporal_layer_subset_flag { 0x0f } else { 0x0d });
            w.put_bits(2, u64::from(d.profile_space) & 0x03);
            w.put_bits(1, d.tier_flag as u64);
            w.put_bits(5, u64::from(d.profile_idc) & 0x1f);
            w.put_bits(32, u64::from(d.profile_compatibility_indication));
            w.put_bits(1, d.progressive_source_flag as u64);
            w.put_bits(1, d.interlaced_source_flag as u64);
            w.put_bits(1, d.non_packed_constraint_flag as u64);
            w.put_bits(1, d.frame_only_constraint_flag as u64);
            w.put_bits(44, d.copied_44bits & 0xfff_ffff_ffff);
            w.put_bits(8, u64::from(d.level_idc));
            w.put_bits(1, d.temporal_layer_subset_flag as u64);
            w.put_bits(1, d.hevc_still_present_flag as u64);
            w.put_bits(1, d.hevc_24hr_picture_present_flag as u64);
            w.put_bits(1, d.sub_pic_hrd_params_not_present_flag as u64);
            w.put_bits(2, 0x03); // reserved
            w.put_bits(2, u64::from(d.hdr_wcg_idc) & 0x03);
            if d.temporal_layer_subset_flag {
                w.put_bits(3, u64::from(d.temporal_id_min.unwrap_or(0)) & 0x07);
                w.put_bits(5, 0x1f); // reserved
                w.put_bits(3, u64::from(d.temporal_id_max.unwrap_or(0)) & 0x07);
                w.put_bits(5, 0x1f); // reserved
            }
        }
    }
    Ok(())
}

pub fn read_program_stream_map(cur: &mut ByteCursor<'_>) -> Result<ProgramStreamMap, Error> {
    let record_start = cur.position();
    expect_start_code(cur, PROGRAM_STREAM_MAP_CODE)?;
    let map_length = usize::from(cur.read_u16_be()?);
    let body = cur.read(map_length)?;
    let mut bcur = ByteCursor::new(body);

    let b0 = bcur.read_u8()?;
    let current_next_indicator = b0 & 0x80 != 0;
    let version = b0 & 0x1f;
    bcur.skip(1)?; // reserved and marker_bit

    let info_length = usize::from(bcur.read_u16_be()?);
    let mut icur = ByteCursor::new(bcur.read(info_length)?);
    let mut descriptors = Vec::new();
    while let Some(descriptor) = read_descriptor(&mut icur)? {
        descriptors.push(descriptor);
    }

    let map_body_length = usize::from(bcur.read_u16_be()?);
    let mut ecur = ByteCursor::new(bcur.read(map_body_length)?);
    let mut elementary_stream_map = Vec::new();
    while ecur.remaining() > 0 {
        let stream_type = ecur.read_u8()?;
        if stream_type == 0x00 {
            warn!("reserved stream_type 0x00 in elementary stream map");
            break;
        }
        let elementary_stream_id = ecur.read_u8()?;
        let es_info_length = usize::from(ecur.read_u16_be()?);
        let mut dcur = ByteCursor::new(ecur.read(es_info_length)?);
        let mut es_descriptors = Vec::new();
        while let Some(descriptor) = read_descriptor(&mut dcur)? {
            es_descriptors.push(descriptor);
        }
        elementary_stream_map.push(EsMapEntry {
            stream_type,
            elementary_stream_id,
            descriptors: es_descriptors,
        });
    }

    let stored_crc = bcur.read_u32_be()?;
    let crc_end = record_start + 4 + 2 + map_length - 4;
    let computed_crc = crc32(&cur.get_ref()[record_start..crc_end]);
    if stored_crc != computed_crc {
        warn!(
            "program stream map CRC mismatch: stored {:#010x}, computed {:#010x}",
            stored_crc, computed_crc
        );
    }

    Ok(ProgramStreamMap {
        current_next_indicator,
        version,
        descriptors,
        elementary_stream_map,
    })
}

pub fn write_program_stream_map(w: &mut BitWriter, data: &ProgramStreamMap) -> Result<(), Error> {
    let mut info = BitWriter::new();
    for descriptor in &data.descriptors {
        write_descriptor(&mut info, descriptor)?;
    }
    let info = info.into_bytes();

    let mut map = BitWriter::new();
    for entry in &data.elementary_stream_map {
        map.put_u8(entry.stream_type);
        map.put_u8(entry.elementary_stream_id);
        let mut es_info = BitWriter::new();
        for descriptor in &entry.descriptors {
            write_descriptor(&mut es_info, descriptor)?;
        }
        let es_info = es_info.into_bytes();
        map.put_u16_be(u16::try_from(es_info.len())?);
        map.put_bytes(&es_info);
    }
    let map = map.into_bytes();

    let mut record = BitWriter::with_capacity(6 + 8 + info.len() + map.len());
    record.put_bytes(&PACKET_START_CODE);
    record.put_u8(PROGRAM_STREAM_MAP_CODE);
    // program_stream_map_length counts the trailing CRC too.
    record.put_u16_be(u16::try_from(2 + 2 + info.len() + 2 + map.len() + 4)?);
    record.put_bits(1, data.current_next_indicator as u64);
    record.put_bits(2, 0x03); // reserved
    record.put_bits(5, u64::from(data.version) & 0x1f);
    record.put_bits(8, 0xff); // reserved and marker_bit
    record.put_u16_be(u16::try_from(info.len())?);
    record.put_bytes(&info);
    record.put_u16_be(u16::try_from(map.len())?);
    record.put_bytes(&map);
    let record = record.into_bytes();

    w.put_bytes(&record);
    w.put_u32_be(crc32(&record));
    Ok(())
}

pub fn read_pes_packet(cur: &mut ByteCursor<'_>) -> Result<PesPacket, Error> {
    let code = cur.read(3)?;
    if code != PACKET_START_CODE {
        return Err(FormatError::InvalidStartCode.into());
    }
    let stream_id = cur.read_u8()?;
    let packet_length = cur.read_u16_be()?;
    let body = cur.read(usize::from(packet_length))?;

    if stream_id == PADDING_STREAM_ID {
        return Ok(PesPacket::Type3(PesPacketType3 {
            stream_id,
            packet_length,
        }));
    }
    if is_type2_stream_id(stream_id) {
        return Ok(PesPacket::Type2(PesPacketType2 {
            stream_id,
            data: Bytes::copy_from_slice(body),
        }));
    }

    if body.len() < 3 {
        return Err(FormatError::UnexpectedEof.into());
    }
    let mut r = BitReader::new(&body[0..3]);
    if r.read_u8(2)? != 0b10 {
        return Err(FormatError::InvalidField.into());
    }
    let scrambling_control = r.read_u8(2)?;
    let priority = r.read_bool()?;
    let data_alignment_indicator = r.read_bool()?;
    let copyright = r.read_bool()?;
    let original_or_copy = r.read_bool()?;
    let pts_dts_flags = r.read_u8(2)?;
    let escr_flag = r.read_bool()?;
    let es_rate_flag = r.read_bool()?;
    let dsm_trick_mode_flag = r.read_bool()?;
    let additional_copy_info_flag = r.read_bool()?;
    let crc_flag = r.read_bool()?;
    let extension_flag = r.read_bool()?;
    let header_data_length = usize::from(r.read_u8(8)?);
    if body.len() < 3 + header_data_length {
        return Err(FormatError::UnexpectedEof.into());
    }
    let header_data = &body[3..3 + header_data_length];

    let mut pts = None;
    let mut dts = None;
    if pts_dts_flags == 0x02 || pts_dts_flags == 0x03 {
        let mut hr = BitReader::new(header_data);
        pts = Some(unpack_timestamp(hr.read_u64(40)?));
        if pts_dts_flags == 0x03 {
            dts = Some(unpack_timestamp(hr.read_u64(40)?));
        }
    }

    Ok(PesPacket::Type1(PesPacketType1 {
        stream_id,
        scrambling_control,
        priority,
        data_alignment_indicator,
        copyright,
        original_or_copy,
        pts_dts_flags,
        escr_flag,
        es_rate_flag,
        dsm_trick_mode_flag,
        additional_copy_info_flag,
        crc_flag,
        extension_flag,
        pts,
        dts,
        data: Bytes::copy_from_slice(&body[3 + header_data_length..]),
    }))
}

pub fn write_pes_packet(w: &mut BitWriter, data: &PesPacket) -> Result<(), Error> {
    w.put_bytes(&PACKET_START_CODE);
    match data {
        PesPacket::Type1(p) => {
            let mut header_data = BitWriter::new();
            match p.pts_dts_flags {
                0x02 => {
                    let pts = match p.pts {
                        None => bail!("PTS_DTS_flags=2 requires a PTS"),
                        Some(pts) => pts,
                    };
                    header_data.put_bits(40, pack_timestamp(0x21_0001_0001, pts));
                }
                0x03 => {
                    let (pts, dts) = match (p.pts, p.dts) {
                        (Some(pts), Some(dts)) => (pts, dts),
                        _ => bail!("PTS_DTS_flags=3 requires a PTS and a DTS"),
                    };
                    header_data.put_bits(40, pack_timestamp(0x31_0001_0001, pts));
                    header_data.put_bits(40, pack_timestamp(0x11_0001_0001, dts));
                }
                _ => {}
            }
            let header_data = header_data.into_bytes();

            let mut packet = BitWriter::with_capacity(3 + header_data.len() + p.data.len());
            packet.put_bits(2, 0b10);
            packet.put_bits(2, u64::from(p.scrambling_control) & 0x03);
            packet.put_bits(1, p.priority as u64);
            packet.put_bits(1, p.data_alignment_indicator as u64);
            packet.put_bits(1, p.copyright as u64);
            packet.put_bits(1, p.original_or_copy as u64);
            packet.put_bits(2, u64::from(p.pts_dts_flags) & 0x03);
            packet.put_bits(1, p.escr_flag as u64);
            packet.put_bits(1, p.es_rate_flag as u64);
            packet.put_bits(1, p.dsm_trick_mode_flag as u64);
            packet.put_bits(1, p.additional_copy_info_flag as u64);
            packet.put_bits(1, p.crc_flag as u64);
            packet.put_bits(1, p.extension_flag as u64);
            packet.put_bits(8, header_data.len() as u64);
            packet.put_bytes(&header_data);
            packet.put_bytes(&p.data);
            let packet = packet.into_bytes();

            w.put_u8(p.stream_id);
            w.put_u16_be(u16::try_from(packet.len())?);
            w.put_bytes(&packet);
        }
        PesPacket::Type2(p) => {
            w.put_u8(p.stream_id);
            w.put_u16_be(u16::try_from(p.data.len())?);
            w.put_bytes(&p.data);
        }
        PesPacket::Type3(p) => {
            w.put_u8(p.stream_id);
            w.put_u16_be(p.packet_length);
            for _ in 0..p.packet_length {
                w.put_u8(0xff);
            }
        }
    }
    Ok(())
}

pub fn write_program_end(w: &mut BitWriter) {
    w.put_bytes(&PACKET_START_CODE);
    w.put_u8(PROGRAM_END_CODE);
}

/// Reads the next packet, whatever it is. `Ok(None)` when no further start
/// code exists in the buffer.
pub fn read_ps_packet(cur: &mut ByteCursor<'_>) -> Result<Option<PsPacket>, Error> {
    let packet_id = match seek_packet(cur, None) {
        None => return Ok(None),
        Some(id) => id,
    };
    let packet = match packet_id {
        PROGRAM_END_CODE => {
            cur.skip(4)?;
            PsPacket::ProgramEnd
        }
        PACK_HEADER_CODE => PsPacket::PackHeader(read_ps_pack_header(cur)?),
        SYSTEM_HEADER_CODE => PsPacket::SystemHeader(read_ps_system_header(cur)?),
        PROGRAM_STREAM_MAP_CODE => PsPacket::ProgramStreamMap(read_program_stream_map(cur)?),
        _ => PsPacket::Pes(read_pes_packet(cur)?),
    };
    Ok(Some(packet))
}

pub fn write_ps_packet(w: &mut BitWriter, data: &PsPacket) -> Result<(), Error> {
    match data {
        PsPacket::ProgramEnd => write_program_end(w),
        PsPacket::PackHeader(h) => write_ps_pack_header(w, h),
        PsPacket::SystemHeader(h) => write_ps_system_header(w, h)?,
        PsPacket::ProgramStreamMap(m) => write_program_stream_map(w, m)?,
        PsPacket::Pes(p) => write_pes_packet(w, p)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use hex_literal::hex;

    use super::*;

    fn write_to_bytes<F: FnOnce(&mut BitWriter)>(f: F) -> Bytes {
        let mut w = BitWriter::new();
        f(&mut w);
        w.into_bytes()
    }

    #[test]
    fn crc32_matches_bitwise_reference() {
        // Bit-serial form of the same polynomial, MSB first.
        fn reference(buffer: &[u8]) -> u32 {
            let mut crc: u64 = 0xffff_ffff;
            for &value in buffer {
                crc ^= u64::from(value) << 24;
                for _ in 0..8 {
                    let msb = (crc >> 31) & 1;
                    crc <<= 1;
                    crc ^= msb.wrapping_neg() & 0x1_04c1_1db7;
                }
            }
            crc as u32
        }
        let data = hex!("000001bc0004e0ffffff");
        assert_eq!(crc32(&data), reference(&data));
        assert_eq!(crc32(b""), 0xffff_ffff);
    }

    #[test]
    fn pack_header_fixed_serialization() {
        let header = PackHeader {
            scr_base: 0,
            scr_ext: 0,
            program_mux_rate: 20000,
            pack_stuffing_length: 0,
        };
        let bytes = write_to_bytes(|w| write_ps_pack_header(w, &header));
        assert_eq!(&bytes[..], &hex!("000001ba440004000401013883f8")[..]);
    }

    #[test]
    fn pack_header_round_trip() {
        let header = PackHeader {
            scr_base: 0x1_2345_6789, // 33 bits
            scr_ext: 0x1ff,
            program_mux_rate: 0x3f_ffff,
            pack_stuffing_length: 2,
        };
        let bytes = write_to_bytes(|w| write_ps_pack_header(w, &header));
        assert_eq!(bytes.len(), 14 + 2);
        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(read_ps_pack_header(&mut cur).unwrap(), header);
        // Stuffing bytes are consumed too.
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn pack_header_rejects_wrong_code() {
        let bytes = hex!("000001bb440004000401013883f8");
        let err = read_ps_pack_header(&mut ByteCursor::new(&bytes)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FormatError>(),
            Some(&FormatError::InvalidStartCode)
        );
    }

    #[test]
    fn system_header_round_trip() {
        let header = SystemHeader {
            rate_bound: 50000,
            audio_bound: 1,
            fixed_flag: false,
            csps_flag: true,
            system_audio_lock_flag: false,
            system_video_lock_flag: true,
            video_bound: 1,
            packet_rate_restriction_flag: true,
            p_std_info: vec![
                PStdInfo {
                    stream_id: 0xe0,
                    buffer_bound_scale: 1,
                    buffer_size_bound: 3051,
                },
                PStdInfo {
                    stream_id: 0xc0,
                    buffer_bound_scale: 0,
                    buffer_size_bound: 32,
                },
            ],
        };
        let bytes = write_to_bytes(|w| write_ps_system_header(w, &header).unwrap());
        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(read_ps_system_header(&mut cur).unwrap(), header);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn system_header_stops_at_non_p_std_byte() {
        // One valid entry, then a byte without bit 7 terminates the list.
        let body = hex!("8186a1 0061ff e0ebeb 41");
        let mut bytes = hex!("000001bb000a").to_vec();
        bytes.extend_from_slice(&body);
        let header = read_ps_system_header(&mut ByteCursor::new(&bytes)).unwrap();
        assert_eq!(header.p_std_info.len(), 1);
        assert_eq!(header.p_std_info[0].stream_id, 0xe0);
    }

    #[test]
    fn descriptors_round_trip() {
        let descriptors = vec![
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
            Descriptor::AacAudio(AacAudioDescriptor {
                profile: 1,
                channel_configuration: 2,
                additional_information: 3,
            }),
            Descriptor::HevcVideo(HevcVideoDescriptor {
                profile_space: 1,
                tier_flag: true,
                profile_idc: 2,
                profile_compatibility_indication: 0xdead_beef,
                progressive_source_flag: true,
                interlaced_source_flag: false,
                non_packed_constraint_flag: false,
                frame_only_constraint_flag: true,
                copied_44bits: 0x123_4567_89ab,
                level_idc: 93,
                temporal_layer_subset_flag: true,
                hevc_still_present_flag: false,
                hevc_24hr_picture_present_flag: false,
                sub_pic_hrd_params_not_present_flag: true,
                hdr_wcg_idc: 2,
                temporal_id_min: Some(1),
                temporal_id_max: Some(6),
            }),
            Descriptor::Generic(GenericDescriptor {
                tag: 0x05,
                data: Bytes::from_static(b"HDMV"),
            }),
        ];
        for descriptor in &descriptors {
            let bytes = write_to_bytes(|w| write_descriptor(w, descriptor).unwrap());
            let mut cur = ByteCursor::new(&bytes);
            assert_eq!(read_descriptor(&mut cur).unwrap().as_ref(), Some(descriptor));
            assert_eq!(cur.remaining(), 0);
        }
    }

    #[test]
    fn avc_descriptor_fixed_serialization() {
        let descriptor = Descriptor::AvcVideo(AvcVideoDescriptor {
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
        });
        let bytes = write_to_bytes(|w| write_descriptor(w, &descriptor).unwrap());
        assert_eq!(&bytes[..], &hex!("28044d40283f")[..]);
    }

    #[test]
    fn descriptor_length_mismatch_is_invalid() {
        let mut cur = ByteCursor::new(&hex!("28054d40283fff"));
        let err = read_descriptor(&mut cur).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FormatError>(),
            Some(&FormatError::InvalidField)
        );
    }

    #[test]
    fn program_stream_map_round_trip_and_crc() {
        let map = ProgramStreamMap {
            current_next_indicator: true,
            version: 1,
            descriptors: vec![Descriptor::Generic(GenericDescriptor {
                tag: 0x05,
                data: Bytes::from_static(&[0x01, 0x02]),
            })],
            elementary_stream_map: vec![EsMapEntry {
                stream_type: 0x1b,
                elementary_stream_id: 0xe0,
                descriptors: vec![Descriptor::AvcVideo(AvcVideoDescriptor {
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
                })],
            }],
        };
        let bytes = write_to_bytes(|w| write_program_stream_map(w, &map).unwrap());
        // The length field covers everything after it, CRC included.
        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        assert_eq!(bytes.len(), 6 + length);
        // Stored CRC matches a recomputation over the preceding bytes.
        let stored = u32::from_be_bytes([
            bytes[bytes.len() - 4],
            bytes[bytes.len() - 3],
            bytes[bytes.len() - 2],
            bytes[bytes.len() - 1],
        ]);
        assert_eq!(stored, crc32(&bytes[..bytes.len() - 4]));

        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(read_program_stream_map(&mut cur).unwrap(), map);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn pes_type1_fixed_serialization() {
        let packet = PesPacket::Type1(PesPacketType1::new(
            0xe0,
            0x02,
            Some(0),
            None,
            Bytes::from_static(&[0xaa]),
        ));
        let bytes = write_to_bytes(|w| write_pes_packet(w, &packet).unwrap());
        assert_eq!(&bytes[..], &hex!("000001e0000980800521000100 01aa")[..]);
    }

    #[test]
    fn pes_type1_round_trip_with_pts_and_dts() {
        for &(flags, pts, dts) in &[
            (0u8, None, None),
            (2, Some(3003u64), None),
            (3, Some(0x1_ffff_ffff), Some(3003)),
        ] {
            let packet = PesPacket::Type1(PesPacketType1::new(
                0xe0,
                flags,
                pts,
                dts,
                Bytes::from_static(b"payload"),
            ));
            let bytes = write_to_bytes(|w| write_pes_packet(w, &packet).unwrap());
            let mut cur = ByteCursor::new(&bytes);
            assert_eq!(read_pes_packet(&mut cur).unwrap(), packet);
            assert_eq!(cur.remaining(), 0);
        }
    }

    #[test]
    fn pes_type1_requires_timestamps_for_flags() {
        let packet = PesPacket::Type1(PesPacketType1::new(0xe0, 0x02, None, None, Bytes::new()));
        let mut w = BitWriter::new();
        assert!(write_pes_packet(&mut w, &packet).is_err());
    }

    #[test]
    fn pes_type2_and_type3_round_trip() {
        let type2 = PesPacket::Type2(PesPacketType2 {
            stream_id: 0xbf,
            data: Bytes::from_static(&[0x00, 0x00, 0x01, 0x42]),
        });
        let bytes = write_to_bytes(|w| write_pes_packet(w, &type2).unwrap());
        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(read_pes_packet(&mut cur).unwrap(), type2);

        let type3 = PesPacket::Type3(PesPacketType3 {
            stream_id: 0xbe,
            packet_length: 16,
        });
        let bytes = write_to_bytes(|w| write_pes_packet(w, &type3).unwrap());
        assert_eq!(bytes.len(), 6 + 16);
        assert!(bytes[6..].iter().all(|&b| b == 0xff));
        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(read_pes_packet(&mut cur).unwrap(), type3);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn oversized_pes_payload_is_rejected() {
        let packet = PesPacket::Type2(PesPacketType2 {
            stream_id: 0xbf,
            data: Bytes::from(vec![0u8; 65536]),
        });
        let mut w = BitWriter::new();
        assert!(write_pes_packet(&mut w, &packet).is_err());
    }

    #[test]
    fn seek_packet_scans_past_garbage() {
        let mut bytes = vec![0xde, 0xad, 0x00, 0x00, 0xfe];
        bytes.extend_from_slice(&hex!("000001ba"));
        bytes.extend_from_slice(&[0u8; 10]);
        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(seek_packet(&mut cur, None), Some(PACK_HEADER_CODE));
        assert_eq!(cur.position(), 5);

        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(seek_packet(&mut cur, Some(0xbc)), None);
    }

    #[test]
    fn read_ps_packet_dispatches_program_end() {
        let bytes = hex!("000001b9");
        let mut cur = ByteCursor::new(&bytes);
        assert_eq!(
            read_ps_packet(&mut cur).unwrap(),
            Some(PsPacket::ProgramEnd)
        );
        assert_eq!(read_ps_packet(&mut cur).unwrap(), None);
    }
}
