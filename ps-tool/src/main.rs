//! Command-line front end for DAM-compatible MPEG-2 Program Streams:
//! generate one from an H.264 elementary stream, dump or recompute its GOP
//! index, and check which container pieces a file carries.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use failure::{format_err, Error};
use log::info;
use structopt::StructOpt;

use dam_mpeg2_ps::bitio::ByteCursor;
use dam_mpeg2_ps::dam::{self, Codec, GopIndex};
use dam_mpeg2_ps::generator::{FrameRate, Generator, TrailingPolicy};

#[derive(StructOpt)]
#[structopt(about = "DAM-compatible MPEG2-PS tool")]
enum Cmd {
    /// Convert an H.264 elementary stream into a DAM-compatible program
    /// stream.
    Generate {
        /// Input H.264-ES file path.
        #[structopt(parse(from_os_str))]
        input: PathBuf,

        /// Output program stream file path.
        #[structopt(parse(from_os_str))]
        output: PathBuf,

        /// Input codec: avc or hevc.
        #[structopt(long, default_value = "avc")]
        input_codec: Codec,

        /// Frame rate as an integer or a num/den rational, e.g. 30000/1001.
        #[structopt(long, default_value = "30000/1001")]
        frame_rate: FrameRate,

        /// Drop an in-flight access unit and GOP at end of input instead of
        /// flushing them.
        #[structopt(long)]
        trim_trailing: bool,
    },

    /// Print the GOP index stored in a program stream.
    Dump {
        #[structopt(parse(from_os_str))]
        input: PathBuf,
    },

    /// Recompute a GOP index from the stream contents, ignoring any stored
    /// one.
    Analyze {
        #[structopt(parse(from_os_str))]
        input: PathBuf,

        /// Elementary stream id whose timestamps feed the index.
        #[structopt(long, default_value = "0xe0", parse(try_from_str = parse_stream_id))]
        stream_id: u8,
    },

    /// Report which DAM container pieces are present.
    Check {
        #[structopt(parse(from_os_str))]
        input: PathBuf,
    },
}

fn parse_stream_id(s: &str) -> Result<u8, Error> {
    let parsed = if s.starts_with("0x") || s.starts_with("0X") {
        u8::from_str_radix(&s[2..], 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format_err!("invalid stream id {:?}", s))
}

fn generate(
    input: &Path,
    output: &Path,
    codec: Codec,
    frame_rate: FrameRate,
    trailing: TrailingPolicy,
) -> Result<(), Error> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut generator = Generator::new();
    generator.load_h264_es(&mut reader)?;
    let mut writer = BufWriter::new(File::create(output)?);
    generator.write_mpeg2_ps(&mut writer, codec, frame_rate, trailing)?;
    info!(
        "wrote {} ({} NAL units in)",
        output.display(),
        generator.nal_units().len()
    );
    Ok(())
}

fn print_gop_index(index: &GopIndex) {
    println!(
        "gop_index: sub_stream_id={:#04x}, version={}, stream_id={:#04x}, page_number={}, page_count={}",
        index.sub_stream_id, index.version, index.stream_id, index.page_number, index.page_count
    );
    let pts_offset = match index.gops.first() {
        None => return,
        Some(first) => first.pts,
    };
    for (i, gop) in index.gops.iter().enumerate() {
        println!(
            "gop_index[{}]: ps_pack_header_position={}, access_unit_size={}, pts={}, pts_msec={:.3}, relative_pts_msec={:.3}",
            i,
            gop.ps_pack_header_position,
            gop.access_unit_size,
            gop.pts,
            f64::from(gop.pts) / 90.0,
            f64::from(gop.pts.wrapping_sub(pts_offset)) / 90.0
        );
    }
}

fn dump(input: &Path) -> Result<(), Error> {
    let data = std::fs::read(input)?;
    let mut cur = ByteCursor::new(&data);
    let index = dam::load_gop_index(&mut cur)?
        .ok_or_else(|| format_err!("no GOP index in {}", input.display()))?;
    print_gop_index(&index);
    Ok(())
}

fn analyze(input: &Path, stream_id: u8) -> Result<(), Error> {
    let data = std::fs::read(input)?;
    let index = dam::analyze_gop_index(&data, stream_id)?;
    print_gop_index(&index);
    Ok(())
}

fn check(input: &Path) -> Result<(), Error> {
    let data = std::fs::read(input)?;
    let check = dam::check_container(&data);
    println!(
        "pack_header={} system_header={} program_stream_map={} gop_index={} (mask {:#06b})",
        check.pack_header,
        check.system_header,
        check.program_stream_map,
        check.gop_index,
        check.bits()
    );
    let verdict = if check.is_compatible() {
        "compatible"
    } else if check.is_convertable() {
        "convertable"
    } else {
        "not convertable"
    };
    println!("{}", verdict);
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Cmd::from_args() {
        Cmd::Generate {
            input,
            output,
            input_codec,
            frame_rate,
            trim_trailing,
        } => {
            let trailing = if trim_trailing {
                TrailingPolicy::Trim
            } else {
                TrailingPolicy::Flush
            };
            generate(&input, &output, input_codec, frame_rate, trailing)
        }
        Cmd::Dump { input } => dump(&input),
        Cmd::Analyze { input, stream_id } => analyze(&input, stream_id),
        Cmd::Check { input } => check(&input),
    }
}
