// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emission of decoded frames in output order.
//!
//! Every frame leaving the DPB goes through an [`OutputScheduler`], which pairs directly-output
//! fields, completes lone fields with a blank complement, enforces strictly increasing POC and
//! finally hands the frame to an [`OutputSink`].

use std::io::Write;

use log::debug;
use log::error;

use crate::codec::h264::arena::PictureArena;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::frame_store::FrameStore;
use crate::codec::h264::params::Rect;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::Plane;
use crate::codec::h264::picture::Planes;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::BLANK_SAMPLE;
use crate::decoded_frame_size;
use crate::DecodedFormat;
use crate::Resolution;

/// A frame handed to an [`OutputSink`]. Samples are borrowed from the picture being output.
#[derive(Debug)]
pub struct OutputFrame<'a> {
    pub view_id: u16,
    pub pic_order_cnt: i32,
    pub frame_num: i32,
    pub timestamp: u64,
    pub visible_rect: Rect<u32>,
    pub planes: &'a Planes,
}

impl<'a> OutputFrame<'a> {
    fn new(pic: &'a PictureData) -> Self {
        Self {
            view_id: pic.view_id,
            pic_order_cnt: pic.pic_order_cnt,
            frame_num: pic.frame_num,
            timestamp: pic.timestamp,
            visible_rect: pic.visible_rect,
            planes: &pic.planes,
        }
    }

    /// The visible rectangle clipped to the luma plane.
    fn crop(&self) -> Rect<u32> {
        let width = self.planes.luma.width() as u32;
        let height = self.planes.luma.height() as u32;

        let mut rect = self.visible_rect;
        rect.max.x = rect.max.x.min(width);
        rect.max.y = rect.max.y.min(height);
        rect.min.x = rect.min.x.min(rect.max.x);
        rect.min.y = rect.min.y.min(rect.max.y);

        rect
    }

    pub fn resolution(&self) -> Resolution {
        let crop = self.crop();

        Resolution {
            width: crop.width(),
            height: crop.height(),
        }
    }

    /// Copies the visible part of the frame into a packed buffer of `format`.
    ///
    /// Monochrome frames get mid-grey chroma planes.
    pub fn to_packed(&self, format: DecodedFormat) -> Vec<u8> {
        let crop = self.crop();
        let width = crop.width() as usize;
        let height = crop.height() as usize;

        let mut out = Vec::with_capacity(decoded_frame_size(format, width, height));
        copy_cropped(&self.planes.luma, crop, (1, 1), &mut out);

        let luma = &self.planes.luma;
        match &self.planes.chroma {
            Some([cb, cr]) => {
                let subsampling = (
                    (luma.width() / cb.width().max(1)).max(1) as u32,
                    (luma.height() / cb.height().max(1)).max(1) as u32,
                );

                match format {
                    DecodedFormat::I420 => {
                        copy_cropped(cb, crop, subsampling, &mut out);
                        copy_cropped(cr, crop, subsampling, &mut out);
                    }
                    DecodedFormat::NV12 => {
                        let mut u = Vec::new();
                        let mut v = Vec::new();
                        copy_cropped(cb, crop, subsampling, &mut u);
                        copy_cropped(cr, crop, subsampling, &mut v);
                        out.extend(u.into_iter().zip(v).flat_map(|(u, v)| [u, v]));
                    }
                }
            }
            None => {
                let uv_size = decoded_frame_size(format, width, height) - width * height;
                out.resize(out.len() + uv_size, BLANK_SAMPLE);
            }
        }

        out
    }
}

/// Copies the samples of `plane` covered by `crop`, expressed in luma coordinates.
fn copy_cropped(plane: &Plane, crop: Rect<u32>, (sx, sy): (u32, u32), out: &mut Vec<u8>) {
    let x0 = (crop.min.x / sx) as usize;
    let x1 = (crop.max.x.div_ceil(sx) as usize).min(plane.width());
    let y0 = (crop.min.y / sy) as usize;
    let y1 = (crop.max.y.div_ceil(sy) as usize).min(plane.height());

    for y in y0..y1 {
        out.extend_from_slice(&plane.row(y)[x0..x1]);
    }
}

/// Receiver of the frames leaving the DPB, in output order.
pub trait OutputSink {
    fn write_frame(&mut self, frame: &OutputFrame) -> anyhow::Result<()>;
}

impl<F> OutputSink for F
where
    F: FnMut(&OutputFrame) -> anyhow::Result<()>,
{
    fn write_frame(&mut self, frame: &OutputFrame) -> anyhow::Result<()> {
        self(frame)
    }
}

/// Writes the visible part of every frame as raw YUV.
pub struct YuvWriter<W: Write> {
    writer: W,
    format: DecodedFormat,
}

impl<W: Write> YuvWriter<W> {
    pub fn new(writer: W, format: DecodedFormat) -> Self {
        Self { writer, format }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for YuvWriter<W> {
    fn write_frame(&mut self, frame: &OutputFrame) -> anyhow::Result<()> {
        self.writer.write_all(&frame.to_packed(self.format))?;
        Ok(())
    }
}

/// Output state of one view: the direct-output field holder and the output order check.
#[derive(Debug)]
pub struct OutputScheduler {
    pending_top: Option<PictureData>,
    pending_bottom: Option<PictureData>,
    last_output_poc: i32,
    frames_written: usize,
    write_errors: usize,
}

impl Default for OutputScheduler {
    fn default() -> Self {
        Self {
            pending_top: None,
            pending_bottom: None,
            last_output_poc: i32::MIN,
            frames_written: 0,
            write_errors: 0,
        }
    }
}

impl OutputScheduler {
    /// POC of the last frame emitted since the last reset.
    pub fn last_output_poc(&self) -> i32 {
        self.last_output_poc
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// Number of frames the sink failed to write.
    pub fn write_errors(&self) -> usize {
        self.write_errors
    }

    /// Whether a directly-output field is waiting for its complement.
    pub fn has_pending(&self) -> bool {
        self.pending_top.is_some() || self.pending_bottom.is_some()
    }

    /// Starts a new output order, as happens after an IDR or a flush.
    pub fn reset_order(&mut self) {
        self.last_output_poc = i32::MIN;
    }

    pub fn discard_pending(&mut self) {
        self.pending_top = None;
        self.pending_bottom = None;
    }

    fn emit(&mut self, sink: &mut dyn OutputSink, pic: &PictureData) -> Result<(), DpbError> {
        if self.last_output_poc >= pic.pic_order_cnt {
            return Err(DpbError::OutputPocRegression {
                last: self.last_output_poc,
                poc: pic.pic_order_cnt,
            });
        }

        self.last_output_poc = pic.pic_order_cnt;

        if pic.nonexisting {
            return Ok(());
        }

        debug!(
            "Output view {} POC {} (frame_num {})",
            pic.view_id, pic.pic_order_cnt, pic.frame_num
        );

        match sink.write_frame(&OutputFrame::new(pic)) {
            Ok(()) => self.frames_written += 1,
            Err(e) => {
                error!("Failed to write frame POC {}: {:#}", pic.pic_order_cnt, e);
                self.write_errors += 1;
            }
        }

        Ok(())
    }

    /// Completes a lone field with a blank field of the opposite parity and emits the result.
    fn write_unpaired_field(
        &mut self,
        sink: &mut dyn OutputSink,
        field: &PictureData,
    ) -> Result<(), DpbError> {
        let blank = field.blank_complement().ok_or(DpbError::MissingPicture)?;

        debug!(
            "Completing unpaired {:?} field POC {} with a blank field",
            field.field, field.pic_order_cnt
        );

        let frame = match field.field {
            Field::Bottom => PictureData::from_fields(&blank, field),
            _ => PictureData::from_fields(field, &blank),
        };

        self.emit(sink, &frame)
    }

    /// Emits the directly-output field waiting for its complement, if any.
    pub fn flush_direct_output(&mut self, sink: &mut dyn OutputSink) -> Result<(), DpbError> {
        match (self.pending_top.take(), self.pending_bottom.take()) {
            (Some(top), Some(bottom)) => self.emit(sink, &PictureData::from_fields(&top, &bottom)),
            (Some(field), None) | (None, Some(field)) => self.write_unpaired_field(sink, &field),
            (None, None) => Ok(()),
        }
    }

    /// Outputs a picture that never enters the DPB. Fields are held until their complement
    /// arrives.
    pub fn direct_output(
        &mut self,
        sink: &mut dyn OutputSink,
        pic: PictureData,
    ) -> Result<(), DpbError> {
        match pic.field {
            Field::Frame => {
                self.flush_direct_output(sink)?;
                return self.emit(sink, &pic);
            }
            Field::Top => {
                if self.pending_top.is_some() {
                    self.flush_direct_output(sink)?;
                }
                self.pending_top = Some(pic);
            }
            Field::Bottom => {
                if self.pending_bottom.is_some() {
                    self.flush_direct_output(sink)?;
                }
                self.pending_bottom = Some(pic);
            }
        }

        if let (Some(top), Some(bottom)) = (&self.pending_top, &self.pending_bottom) {
            let frame = PictureData::from_fields(top, bottom);
            self.discard_pending();
            self.emit(sink, &frame)?;
        }

        Ok(())
    }

    /// Outputs the content of a frame store.
    pub fn write_stored_frame(
        &mut self,
        sink: &mut dyn OutputSink,
        pics: &PictureArena,
        fs: &FrameStore,
    ) -> Result<(), DpbError> {
        self.flush_direct_output(sink)?;

        if fs.is_used < 3 {
            let field = fs
                .picture(pics, Field::Top)
                .or_else(|| fs.picture(pics, Field::Bottom))
                .ok_or(DpbError::MissingPicture)?;

            self.write_unpaired_field(sink, field)
        } else {
            let frame = fs
                .picture(pics, Field::Frame)
                .ok_or(DpbError::MissingPicture)?;

            self.emit(sink, frame)
        }
    }
}
