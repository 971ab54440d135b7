// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! dpbtrace, a program replaying a text trace of decoded pictures through a DPB session and
//! printing the order in which pictures are output, with a CRC32 of every frame.
//!
//! The trace has one command per line. Empty lines and lines starting with `#` are ignored.
//!
//! ```text
//! seq ref_frames=4 frame_num_bits=4 poc_type=0 gaps width_mbs=2 height_mbs=2 level=40
//! pic frame fn=0 poc=0 ref=short idr
//! pic top fn=1 poc=4 ref=short mmco=1:0,6:1
//! pic bottom fn=1 poc=5 ref=short
//! flush
//! ```

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use argh::FromArgs;
use bytes::Bytes;

use cros_dpb::codec::h264::output::OutputFrame;
use cros_dpb::codec::h264::output::OutputSink;
use cros_dpb::codec::h264::output::YuvWriter;
use cros_dpb::codec::h264::params::ChromaFormat;
use cros_dpb::codec::h264::params::Point;
use cros_dpb::codec::h264::params::Rect;
use cros_dpb::codec::h264::params::SequenceParams;
use cros_dpb::codec::h264::picture::Field;
use cros_dpb::codec::h264::picture::IsIdr;
use cros_dpb::codec::h264::picture::PictureData;
use cros_dpb::codec::h264::picture::Plane;
use cros_dpb::codec::h264::picture::Planes;
use cros_dpb::codec::h264::picture::Reference;
use cros_dpb::codec::h264::slice::MaxLongTermFrameIdx;
use cros_dpb::codec::h264::slice::RefPicMarkingInner;
use cros_dpb::decoder::DpbConfig;
use cros_dpb::decoder::Session;
use cros_dpb::DecodedFormat;

/// Replays a picture trace through the H.264 DPB
#[derive(Debug, FromArgs)]
struct Args {
    /// trace file
    #[argh(positional)]
    input: PathBuf,

    /// output file to write the output frames to
    #[argh(option)]
    output: Option<PathBuf>,

    /// pixel format of the output file. Default: i420
    #[argh(option, default = "DecodedFormat::I420")]
    output_format: DecodedFormat,

    /// frame stores to add to the size required by the level
    #[argh(option, default = "0")]
    extra_frames: usize,

    /// tolerate missing pictures inside the active part of reference lists
    #[argh(switch)]
    non_conforming_stream: bool,

    /// whether to display the MD5 of the output stream
    #[argh(switch)]
    compute_md5: bool,
}

/// Prints every output frame and optionally writes and hashes it.
struct TraceSink {
    format: DecodedFormat,
    writer: Option<YuvWriter<BufWriter<File>>>,
    md5: Option<md5::Context>,
    frames: usize,
}

impl OutputSink for TraceSink {
    fn write_frame(&mut self, frame: &OutputFrame) -> anyhow::Result<()> {
        let packed = frame.to_packed(self.format);

        println!(
            "{:5} view {} POC {:5} frame_num {:3} crc32 {:08x}",
            self.frames,
            frame.view_id,
            frame.pic_order_cnt,
            frame.frame_num,
            crc32fast::hash(&packed)
        );
        self.frames += 1;

        if let Some(md5) = self.md5.as_mut() {
            md5.consume(&packed);
        }

        match self.writer.as_mut() {
            Some(writer) => writer.write_frame(frame),
            None => Ok(()),
        }
    }
}

enum Command {
    Sequence(SequenceParams),
    Picture(PictureData),
    Flush,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: Option<&str>) -> anyhow::Result<T> {
    value
        .ok_or_else(|| anyhow!("{} needs a value", key))?
        .parse()
        .map_err(|_| anyhow!("invalid value for {}", key))
}

fn parse_sequence<'a>(tokens: impl Iterator<Item = &'a str>) -> anyhow::Result<SequenceParams> {
    let mut sps = SequenceParams::default();

    for token in tokens {
        let mut kv = token.splitn(2, '=');
        let key = kv.next().unwrap_or_default();
        let value = kv.next();

        match key {
            "ref_frames" => sps.max_num_ref_frames = parse_value(key, value)?,
            "frame_num_bits" => {
                let bits: u8 = parse_value(key, value)?;
                sps.log2_max_frame_num_minus4 = bits
                    .checked_sub(4)
                    .ok_or_else(|| anyhow!("frame_num_bits must be at least 4"))?;
            }
            "poc_type" => sps.pic_order_cnt_type = parse_value(key, value)?,
            "gaps" => sps.gaps_in_frame_num_value_allowed_flag = true,
            "interlaced" => sps.frame_mbs_only_flag = false,
            "mono" => sps.chroma_format = ChromaFormat::Monochrome,
            "level" => sps.level_idc = parse_value(key, value)?,
            "width_mbs" => {
                let mbs: u32 = parse_value(key, value)?;
                sps.pic_width_in_mbs_minus1 = mbs.saturating_sub(1);
            }
            "height_mbs" => {
                let mbs: u32 = parse_value(key, value)?;
                sps.pic_height_in_map_units_minus1 = mbs.saturating_sub(1);
            }
            _ => bail!("unknown sequence parameter {}", key),
        }
    }

    Ok(sps)
}

/// Parses a comma-separated list of `op[:arg[:arg]]` memory management operations.
fn parse_mmco(list: &str) -> anyhow::Result<Vec<RefPicMarkingInner>> {
    list.split(',')
        .map(|op| -> anyhow::Result<RefPicMarkingInner> {
            let args = op
                .split(':')
                .map(|a| a.parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid MMCO {}", op))?;
            let arg = |i: usize| args.get(i).copied().unwrap_or(0);

            let mut inner = RefPicMarkingInner {
                memory_management_control_operation: u8::try_from(arg(0))?,
                ..Default::default()
            };

            match inner.memory_management_control_operation {
                1 => inner.difference_of_pic_nums_minus1 = arg(1),
                2 => inner.long_term_pic_num = arg(1),
                3 => {
                    inner.difference_of_pic_nums_minus1 = arg(1);
                    inner.long_term_frame_idx = arg(2);
                }
                4 => inner.max_long_term_frame_idx = MaxLongTermFrameIdx::from_value_plus1(arg(1)),
                6 => inner.long_term_frame_idx = arg(1),
                _ => (),
            }

            Ok(inner)
        })
        .collect()
}

/// Synthesizes the planes of a picture, filled with a value derived from its POC.
fn planes(sps: &SequenceParams, field: Field, poc: i32) -> Planes {
    let width = sps.width() as usize;
    let height = match field {
        Field::Frame => sps.height() as usize,
        _ => sps.height() as usize / 2,
    };
    let luma = (poc & 0xff) as u8;

    let chroma = match sps.chroma_format {
        ChromaFormat::Monochrome => None,
        _ => {
            let (w, h) = (width.div_ceil(2), height.div_ceil(2));
            Some([
                Plane::filled(w, h, luma.wrapping_add(64)),
                Plane::filled(w, h, luma.wrapping_add(128)),
            ])
        }
    };

    Planes {
        luma: Plane::new(Bytes::from(vec![luma; width * height]), width, width, height),
        chroma,
    }
}

fn parse_picture<'a>(
    sps: &SequenceParams,
    mut tokens: impl Iterator<Item = &'a str>,
) -> anyhow::Result<PictureData> {
    let field = match tokens.next() {
        Some("frame") => Field::Frame,
        Some("top") => Field::Top,
        Some("bottom") => Field::Bottom,
        other => bail!("invalid picture structure {:?}", other),
    };

    let mut pic = PictureData::default();
    pic.field = field;
    let mut top = None;
    let mut bottom = None;

    for token in tokens {
        let mut kv = token.splitn(2, '=');
        let key = kv.next().unwrap_or_default();
        let value = kv.next();

        match key {
            "fn" => pic.frame_num = parse_value(key, value)?,
            "poc" => pic.pic_order_cnt = parse_value(key, value)?,
            "top" => top = Some(parse_value(key, value)?),
            "bottom" => bottom = Some(parse_value(key, value)?),
            "ref" => pic.set_reference(match value {
                Some("none") => Reference::None,
                Some("short") => Reference::ShortTerm,
                Some("long") => Reference::LongTerm,
                other => bail!("invalid reference kind {:?}", other),
            }),
            "idr" => pic.is_idr = IsIdr::Yes { idr_pic_id: 0 },
            "no_output" => pic.ref_pic_marking.no_output_of_prior_pics_flag = true,
            "long_term" => pic.ref_pic_marking.long_term_reference_flag = true,
            "view" => pic.view_id = parse_value(key, value)?,
            "inter_view" => pic.inter_view_flag = true,
            "anchor" => pic.anchor_pic_flag = true,
            "mmco" => {
                let list = value.ok_or_else(|| anyhow!("mmco needs a value"))?;
                pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
                pic.ref_pic_marking.inner = parse_mmco(list)?;
            }
            _ => bail!("unknown picture parameter {}", key),
        }
    }

    pic.top_field_order_cnt = top.unwrap_or(pic.pic_order_cnt);
    pic.bottom_field_order_cnt = bottom.unwrap_or(pic.pic_order_cnt);
    if field == Field::Frame {
        pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
    }
    pic.pic_num = pic.frame_num;

    let visible = sps.visible_rectangle();
    pic.visible_rect = match field {
        Field::Frame => visible,
        _ => Rect {
            min: Point {
                x: visible.min.x,
                y: visible.min.y / 2,
            },
            max: Point {
                x: visible.max.x,
                y: visible.max.y / 2,
            },
        },
    };
    pic.planes = planes(sps, field, pic.pic_order_cnt);

    Ok(pic)
}

fn parse_command(sps: Option<&SequenceParams>, line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = line.split_whitespace();
    let command = match tokens.next() {
        Some("seq") => Command::Sequence(parse_sequence(tokens)?),
        Some("pic") => {
            let sps = sps.ok_or_else(|| anyhow!("picture before any sequence"))?;
            Command::Picture(parse_picture(sps, tokens)?)
        }
        Some("flush") => Command::Flush,
        other => bail!("unknown command {:?}", other),
    };

    Ok(Some(command))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = File::open(&args.input)
        .with_context(|| format!("cannot open {}", args.input.display()))?;

    let writer = args
        .output
        .as_ref()
        .map(|path| {
            File::create(path)
                .map(|file| YuvWriter::new(BufWriter::new(file), args.output_format))
                .with_context(|| format!("cannot create {}", path.display()))
        })
        .transpose()?;

    let sink = TraceSink {
        format: args.output_format,
        writer,
        md5: args.compute_md5.then(md5::Context::new),
        frames: 0,
    };

    let config = DpbConfig {
        extra_frames: args.extra_frames,
        non_conforming_stream: args.non_conforming_stream,
        ..Default::default()
    };
    let mut session = Session::new(config, sink);

    for (nr, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        let command = parse_command(session.sequence(), &line)
            .with_context(|| format!("line {}", nr + 1))?;

        match command {
            None => (),
            Some(Command::Sequence(sps)) => session.activate_sequence(&sps)?,
            Some(Command::Picture(pic)) => {
                // Fillers get POCs that follow their frame_num.
                session.begin_picture(pic.view_id, pic.frame_num, pic.is_idr(), |n| n * 2)?;
                session.store_picture(pic)?;
            }
            Some(Command::Flush) => session.flush()?,
        }
    }

    session.flush()?;

    let sink = session.into_sink();
    if let Some(writer) = sink.writer {
        writer.into_inner().flush()?;
    }
    if let Some(md5) = sink.md5 {
        println!("{:x}", md5.compute());
    }

    Ok(())
}
