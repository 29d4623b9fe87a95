//! DAM-compatible MPEG-2 Program Stream toolkit.
//!
//! Converts an H.264 Annex B elementary stream ([ITU-T
//! H.264](https://www.itu.int/rec/T-REC-H.264) byte stream format) into the
//! MPEG-2 Program Stream variant ([ISO/IEC
//! 13818-1](https://www.iso.org/standard/75928.html)) accepted by DAM-family
//! karaoke players, and reads the result back for inspection — notably the
//! vendor-specific GOP index table those players use for seeking.
//!
//! The pipeline: [annex_b] locates and decodes NAL units, [generator] groups
//! them into access units and GOPs and packetizes each GOP behind a pack
//! header, [ps] provides the individual Program Stream records, and [dam]
//! supplies the fixed container prologue and the GOP index.

use failure::Fail;

pub mod annex_b;
pub mod bitio;
pub mod dam;
pub mod generator;
pub mod ps;

/// Record-level failures, reported at the boundary of the record where they
/// were detected. Absence of an optional record is signalled with `None`
/// rather than an error.
#[derive(Clone, Copy, Debug, Eq, Fail, PartialEq)]
pub enum FormatError {
    #[fail(display = "unexpected end of stream")]
    UnexpectedEof,

    #[fail(display = "invalid start code")]
    InvalidStartCode,

    #[fail(display = "invalid field value")]
    InvalidField,

    #[fail(display = "malformed NAL unit")]
    MalformedNalUnit,

    #[fail(display = "packet not found")]
    NotFound,
}
