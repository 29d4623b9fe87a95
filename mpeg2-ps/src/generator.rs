//! Conversion of an H.264 elementary stream into a DAM-compatible MPEG-2
//! Program Stream: access-unit and GOP segmentation, PES packetization, and
//! the timing derivation from a rational frame rate.

use std::cmp;
use std::convert::TryFrom;
use std::io::{Read, Seek, SeekFrom, Write};
use std::str::FromStr;

use bytes::BytesMut;
use failure::{bail, Error};
use log::{debug, warn};

use crate::annex_b::{self, NalUnit};
use crate::bitio::BitWriter;
use crate::dam::{self, Codec, GopIndex, GopIndexEntry};
use crate::ps::{self, PackHeader, PesPacket, PesPacketType1};

const PES_PACKET_LENGTH_MAX: usize = 65535;
const PTS_CLOCK_FREQUENCY: u64 = 90_000;
const SYSTEM_CLOCK_FREQUENCY: u64 = 27_000_000;

/// An exact rational frame rate such as 30000/1001.
///
/// Timing arithmetic stays in integers the whole way; floating point would
/// drift over long streams.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Result<Self, Error> {
        if num == 0 || den == 0 {
            bail!("frame rate terms must be nonzero");
        }
        Ok(FrameRate { num, den })
    }
}

impl FromStr for FrameRate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.find('/') {
            None => FrameRate::new(s.parse()?, 1),
            Some(i) => FrameRate::new(s[..i].parse()?, s[i + 1..].parse()?),
        }
    }
}

/// 90 kHz ticks elapsed after `picture_count` pictures.
fn clock_90k(picture_count: u64, frame_rate: FrameRate) -> u64 {
    let ticks = u128::from(picture_count) * u128::from(PTS_CLOCK_FREQUENCY)
        * u128::from(frame_rate.den)
        / u128::from(frame_rate.num);
    ticks as u64
}

/// The SCR extension: the 27 MHz remainder below one 90 kHz tick.
fn scr_extension(picture_count: u64, frame_rate: FrameRate) -> u16 {
    let ticks = u128::from(picture_count) * u128::from(SYSTEM_CLOCK_FREQUENCY)
        * u128::from(frame_rate.den)
        / u128::from(frame_rate.num);
    (ticks % 300) as u16
}

/// What to do with an access unit and GOP still open when the input ends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrailingPolicy {
    /// Apply the access-unit-delimiter boundary rules once more at end of
    /// input and emit the final GOP if it contains a sequence parameter
    /// set. Streams rarely end with a dangling delimiter, so this is the
    /// default.
    Flush,
    /// Drop the in-flight access unit and GOP.
    Trim,
}

impl Default for TrailingPolicy {
    fn default() -> Self {
        TrailingPolicy::Flush
    }
}

/// Groups NAL units into access units at delimiters (type 9) and access
/// units into GOPs: a delimiter following a sequence parameter set closes
/// the current GOP.
fn segment_sequences(nal_units: &[NalUnit], trailing: TrailingPolicy) -> Vec<Vec<Vec<NalUnit>>> {
    let mut sequences: Vec<Vec<Vec<NalUnit>>> = Vec::new();
    let mut current_sequence: Vec<Vec<NalUnit>> = Vec::new();
    let mut current_access_unit: Vec<NalUnit> = Vec::new();
    let mut sps_detected = false;
    for nal_unit in nal_units {
        if nal_unit.nal_unit_type == annex_b::NAL_AUD {
            if sps_detected {
                if !current_sequence.is_empty() {
                    sequences.push(std::mem::replace(&mut current_sequence, Vec::new()));
                }
                sps_detected = false;
            }
            if !current_access_unit.is_empty() {
                current_sequence.push(std::mem::replace(&mut current_access_unit, Vec::new()));
            }
        }
        if nal_unit.nal_unit_type == annex_b::NAL_SPS {
            sps_detected = true;
        }
        current_access_unit.push(nal_unit.clone());
    }
    match trailing {
        TrailingPolicy::Trim => {}
        TrailingPolicy::Flush => {
            if sps_detected && !current_sequence.is_empty() {
                sequences.push(std::mem::replace(&mut current_sequence, Vec::new()));
            }
            if !current_access_unit.is_empty() {
                current_sequence.push(current_access_unit);
            }
            let has_sps = current_sequence
                .iter()
                .flatten()
                .any(|n| n.nal_unit_type == annex_b::NAL_SPS);
            if !current_sequence.is_empty() && has_sps {
                sequences.push(current_sequence);
            }
        }
    }
    sequences
}

/// DAM-compatible program stream generator. Each instance owns the NAL
/// units it has loaded.
pub struct Generator {
    nal_units: Vec<NalUnit>,
}

impl Generator {
    pub fn new() -> Self {
        Generator {
            nal_units: Vec::new(),
        }
    }

    pub fn nal_units(&self) -> &[NalUnit] {
        &self.nal_units
    }

    /// Indexes and parses every NAL unit in the stream, replacing anything
    /// loaded before. Units that fail to parse are skipped.
    pub fn load_h264_es<R: Read + Seek>(&mut self, stream: &mut R) -> Result<(), Error> {
        self.nal_units.clear();
        let index = annex_b::index_nal_units(stream)?;
        for (position, size) in index {
            stream.seek(SeekFrom::Start(position))?;
            let mut buffer = vec![0u8; usize::try_from(size)?];
            stream.read_exact(&mut buffer)?;
            match annex_b::parse_nal_unit(&buffer) {
                Ok(nal_unit) => self.nal_units.push(nal_unit),
                Err(e) => warn!("skipping NAL unit at offset {}: {}", position, e),
            }
        }
        Ok(())
    }

    /// Writes the loaded stream as a finished DAM program stream.
    ///
    /// Each GOP gets one pack header whose SCR matches the PTS of its first
    /// access unit; every access unit becomes one run of PES packets capped
    /// at the 16-bit PES length. The GOP index is spliced in behind the
    /// container prologue last, once all offsets are final.
    pub fn write_mpeg2_ps<W: Write>(
        &self,
        out: &mut W,
        codec: Codec,
        frame_rate: FrameRate,
        trailing: TrailingPolicy,
    ) -> Result<(), Error> {
        let mut temp = BitWriter::new();
        dam::write_container_header(&mut temp, codec)?;

        let sequences = segment_sequences(&self.nal_units, trailing);
        let mut gops: Vec<GopIndexEntry> = Vec::with_capacity(sequences.len() + 1);
        let mut picture_count: u64 = 0;

        for sequence in &sequences {
            let pack_position = temp.byte_len() as u64;
            let scr_base = clock_90k(picture_count, frame_rate);
            ps::write_ps_pack_header(
                &mut temp,
                &PackHeader {
                    scr_base,
                    scr_ext: scr_extension(picture_count, frame_rate),
                    program_mux_rate: 20000,
                    pack_stuffing_length: 0,
                },
            );

            for access_unit in sequence {
                let pts = clock_90k(picture_count, frame_rate);
                let dts: Option<u64> = None;

                let mut au_buf = BytesMut::new();
                for nal_unit in access_unit {
                    if nal_unit.nal_unit_type == annex_b::NAL_NON_IDR_SLICE
                        || nal_unit.nal_unit_type == annex_b::NAL_IDR_SLICE
                    {
                        picture_count += 1;
                    }
                    au_buf.extend_from_slice(&annex_b::serialize_nal_unit(nal_unit));
                }
                let mut au_buf = au_buf.freeze();

                let (mut pts_dts_flags, mut limit): (u8, usize) = match dts {
                    Some(_) => (3, PES_PACKET_LENGTH_MAX - 13),
                    None => (2, PES_PACKET_LENGTH_MAX - 8),
                };
                let mut first_fragment = true;
                while !au_buf.is_empty() {
                    if !first_fragment {
                        pts_dts_flags = 0;
                        limit = PES_PACKET_LENGTH_MAX - 3;
                    }
                    let chunk = au_buf.split_to(cmp::min(limit, au_buf.len()));
                    let packet = PesPacketType1::new(
                        dam::VIDEO_STREAM_ID,
                        pts_dts_flags,
                        if pts_dts_flags >= 2 { Some(pts) } else { None },
                        if pts_dts_flags == 3 { dts } else { None },
                        chunk,
                    );
                    ps::write_pes_packet(&mut temp, &PesPacket::Type1(packet))?;
                    first_fragment = false;
                }
            }

            let access_unit_size = temp.byte_len() as u64 - pack_position;
            debug!(
                "GOP index entry: position={}, size={}, pts={}",
                pack_position, access_unit_size, scr_base
            );
            gops.push(GopIndexEntry {
                ps_pack_header_position: pack_position,
                access_unit_size: u32::try_from(access_unit_size)?,
                pts: u32::try_from(scr_base)?,
            });
        }

        ps::write_program_end(&mut temp);
        // Terminal entry: where the stream ends and when.
        gops.push(GopIndexEntry {
            ps_pack_header_position: temp.byte_len() as u64,
            access_unit_size: 0,
            pts: u32::try_from(clock_90k(picture_count, frame_rate))?,
        });

        let finished = dam::insert_gop_index(
            &temp.into_bytes(),
            &GopIndex {
                sub_stream_id: 0xff,
                version: 0x01,
                stream_id: dam::VIDEO_STREAM_ID,
                page_number: 0,
                page_count: 0,
                gops,
            },
        )?;
        out.write_all(&finished)?;
        Ok(())
    }
}

impl Default for Generator {
    fn default() -> Self {
        Generator::new()
    }
}
