// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use bytes::BytesMut;
use log::trace;

use crate::codec::h264::arena::PicHandle;
use crate::codec::h264::frame_store::Combined;
use crate::codec::h264::params::Point;
use crate::codec::h264::params::Rect;
use crate::codec::h264::slice::RefPicMarking;

/// Sample value of the pictures synthesized to complete an unpaired field.
pub const BLANK_SAMPLE: u8 = 128;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity.
    pub fn opposite(&self) -> Option<Self> {
        match *self {
            Field::Frame => None,
            Field::Top => Some(Field::Bottom),
            Field::Bottom => Some(Field::Top),
        }
    }

    /// The frame store occupancy bits covered by a picture of this structure.
    pub fn mask(&self) -> u8 {
        match *self {
            Field::Frame => 3,
            Field::Top => 1,
            Field::Bottom => 2,
        }
    }

    pub fn is_field(&self) -> bool {
        !matches!(self, Field::Frame)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// A single sample plane. Field views of a frame plane share its memory and only differ in
/// offset and stride.
#[derive(Clone, Default)]
pub struct Plane {
    data: Bytes,
    offset: usize,
    stride: usize,
    width: usize,
    height: usize,
}

impl Plane {
    /// Wraps `data`, which must hold `height` rows of `stride` bytes.
    pub fn new(data: Bytes, stride: usize, width: usize, height: usize) -> Self {
        debug_assert!(width <= stride);
        debug_assert!(data.len() >= stride * height.saturating_sub(1) + width);

        Self {
            data,
            offset: 0,
            stride,
            width,
            height,
        }
    }

    /// A tightly packed plane with every sample set to `value`.
    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Self::new(Bytes::from(vec![value; width * height]), width, width, height)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row(&self, y: usize) -> &[u8] {
        let start = self.offset + y * self.stride;
        &self.data[start..start + self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.height).map(|y| self.row(y))
    }

    /// Whether `self` and `other` are views into the same buffer.
    pub fn shares_memory_with(&self, other: &Plane) -> bool {
        !self.data.is_empty() && self.data.as_ptr() == other.data.as_ptr()
    }

    /// The rows of parity `field`, without copying.
    pub fn field(&self, field: Field) -> Plane {
        match field {
            Field::Frame => self.clone(),
            Field::Top => Plane {
                data: self.data.clone(),
                offset: self.offset,
                stride: self.stride * 2,
                width: self.width,
                height: (self.height + 1) / 2,
            },
            Field::Bottom => Plane {
                data: self.data.clone(),
                offset: self.offset + self.stride,
                stride: self.stride * 2,
                width: self.width,
                height: self.height / 2,
            },
        }
    }

    /// Builds a frame plane taking even rows from `top` and odd rows from `bottom`.
    pub fn interleave(top: &Plane, bottom: &Plane) -> Plane {
        let width = top.width;
        let height = top.height + bottom.height;
        let mut data = BytesMut::with_capacity(width * height);

        for y in 0..height {
            let src = if y % 2 == 0 { top } else { bottom };
            let start = data.len();
            if y / 2 < src.height {
                let row = src.row(y / 2);
                data.extend_from_slice(&row[..width.min(row.len())]);
            }
            data.resize(start + width, BLANK_SAMPLE);
        }

        Plane::new(data.freeze(), width, width, height)
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Luma plus optional chroma planes, the latter absent for monochrome content.
#[derive(Clone, Debug, Default)]
pub struct Planes {
    pub luma: Plane,
    pub chroma: Option<[Plane; 2]>,
}

impl Planes {
    pub fn field(&self, field: Field) -> Planes {
        Planes {
            luma: self.luma.field(field),
            chroma: self
                .chroma
                .as_ref()
                .map(|[cb, cr]| [cb.field(field), cr.field(field)]),
        }
    }

    pub fn interleave(top: &Planes, bottom: &Planes) -> Planes {
        let chroma = match (&top.chroma, &bottom.chroma) {
            (Some([top_cb, top_cr]), Some([bot_cb, bot_cr])) => Some([
                Plane::interleave(top_cb, bot_cb),
                Plane::interleave(top_cr, bot_cr),
            ]),
            _ => None,
        };

        Planes {
            luma: Plane::interleave(&top.luma, &bottom.luma),
            chroma,
        }
    }

    /// Planes with the geometry of `self`, filled with `value`.
    pub fn filled_like(&self, value: u8) -> Planes {
        Planes {
            luma: Plane::filled(self.luma.width(), self.luma.height(), value),
            chroma: self.chroma.as_ref().map(|[cb, cr]| {
                [
                    Plane::filled(cb.width(), cb.height(), value),
                    Plane::filled(cr.width(), cr.height(), value),
                ]
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

/// Motion parameters of one 4x4 block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockMotion {
    pub mv: [MotionVector; 2],
    pub ref_idx: [i8; 2],
    /// The pictures `ref_idx` designated when the block was reconstructed.
    pub ref_pic: [Option<PicHandle>; 2],
    pub slice_id: u16,
}

impl Default for BlockMotion {
    fn default() -> Self {
        Self {
            mv: Default::default(),
            ref_idx: [-1, -1],
            ref_pic: [None, None],
            slice_id: 0,
        }
    }
}

/// Per-block motion of a picture, in raster order of 4x4 blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionField {
    width: usize,
    height: usize,
    blocks: Vec<BlockMotion>,
}

impl MotionField {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            blocks: vec![Default::default(); width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> Option<&BlockMotion> {
        if x >= self.width {
            return None;
        }
        self.blocks.get(y * self.width + x)
    }

    pub fn get_mut(&mut self, x: usize, y: usize) -> Option<&mut BlockMotion> {
        if x >= self.width {
            return None;
        }
        self.blocks.get_mut(y * self.width + x)
    }

    fn row(&self, y: usize) -> &[BlockMotion] {
        &self.blocks[y * self.width..(y + 1) * self.width]
    }

    /// Block rows of parity `field`.
    pub fn field(&self, field: Field) -> MotionField {
        let first = match field {
            Field::Frame => return self.clone(),
            Field::Top => 0,
            Field::Bottom => 1,
        };

        let rows = (first..self.height).step_by(2);
        let height = rows.len();
        let blocks = rows.flat_map(|y| self.row(y).iter().copied()).collect();

        Self {
            width: self.width,
            height,
            blocks,
        }
    }

    /// Frame motion with even block rows from `top` and odd block rows from `bottom`.
    pub fn interleave(top: &MotionField, bottom: &MotionField) -> MotionField {
        let width = top.width;
        let height = top.height + bottom.height;
        let mut blocks = Vec::with_capacity(width * height);

        for y in 0..height {
            let src = if y % 2 == 0 { top } else { bottom };
            if y / 2 < src.height && src.width == width {
                blocks.extend_from_slice(src.row(y / 2));
            } else {
                blocks.resize(blocks.len() + width, Default::default());
            }
        }

        Self {
            width,
            height,
            blocks,
        }
    }

    /// Rewrites every back-reference through `f`. References for which `f` returns `None` are
    /// left untouched.
    pub fn remap_refs(&mut self, mut f: impl FnMut(PicHandle) -> Option<PicHandle>) {
        for block in self.blocks.iter_mut() {
            for pic in block.ref_pic.iter_mut().flatten() {
                if let Some(mapped) = f(*pic) {
                    *pic = mapped;
                }
            }
        }
    }

    pub fn blocks(&self) -> &[BlockMotion] {
        &self.blocks
    }
}

#[derive(Default)]
pub struct PictureData {
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,

    pub frame_num: i32,
    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub long_term_frame_idx: u32,

    pub is_idr: IsIdr,
    reference: Reference,

    // Set once the picture has been sent to the output sink, or when it must never be sent.
    pub is_output: bool,

    // Created by the decoding process for gaps in frame_num.
    // Not for decode or output.
    pub nonexisting: bool,

    pub field: Field,

    // Values from slice_hdr to be used during reference marking and
    // memory management after finishing this picture.
    pub ref_pic_marking: RefPicMarking,

    pub view_id: u16,
    pub inter_view_flag: bool,
    pub anchor_pic_flag: bool,

    pub planes: Planes,
    pub motion: Rc<MotionField>,
    pub visible_rect: Rect<u32>,

    pub timestamp: u64,

    aliases: Option<Combined>,
}

impl PictureData {
    pub fn new_non_existing(frame_num: i32, timestamp: u64) -> Self {
        PictureData {
            frame_num,
            pic_num: frame_num,
            nonexisting: true,
            is_output: true,
            field: Field::Frame,
            reference: Reference::ShortTerm,
            timestamp,
            ..Default::default()
        }
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_short_term_ref(&self) -> bool {
        matches!(self.reference, Reference::ShortTerm)
    }

    pub fn is_long_term_ref(&self) -> bool {
        matches!(self.reference, Reference::LongTerm)
    }

    pub fn is_idr(&self) -> bool {
        matches!(self.is_idr, IsIdr::Yes { .. })
    }

    /// Returns a reference to the picture's Reference
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Mark the picture as a reference picture.
    pub fn set_reference(&mut self, reference: Reference) {
        trace!(
            "Set reference of {:?} POC {} (frame_num {}) to {:?}",
            self.field,
            self.pic_order_cnt,
            self.frame_num,
            reference
        );
        self.reference = reference;
    }

    /// The frame and field views this picture belongs to, once it is held by a frame store.
    pub fn aliases(&self) -> Option<&Combined> {
        self.aliases.as_ref()
    }

    pub(super) fn set_aliases(&mut self, aliases: Combined) {
        self.aliases = Some(aliases);
    }

    /// A field picture viewing the rows of parity `field` of this frame. Samples are shared.
    pub fn field_view(&self, field: Field) -> PictureData {
        let pic_order_cnt = match field {
            Field::Bottom => self.bottom_field_order_cnt,
            _ => self.top_field_order_cnt,
        };

        PictureData {
            top_field_order_cnt: self.top_field_order_cnt,
            bottom_field_order_cnt: self.bottom_field_order_cnt,
            pic_order_cnt,
            frame_num: self.frame_num,
            pic_num: self.pic_num,
            long_term_pic_num: self.long_term_pic_num,
            long_term_frame_idx: self.long_term_frame_idx,
            is_idr: self.is_idr,
            reference: self.reference,
            is_output: self.is_output,
            nonexisting: self.nonexisting,
            field,
            view_id: self.view_id,
            inter_view_flag: self.inter_view_flag,
            anchor_pic_flag: self.anchor_pic_flag,
            planes: self.planes.field(field),
            motion: Rc::new(self.motion.field(field)),
            visible_rect: Rect {
                min: Point {
                    x: self.visible_rect.min.x,
                    y: self.visible_rect.min.y / 2,
                },
                max: Point {
                    x: self.visible_rect.max.x,
                    y: self.visible_rect.max.y / 2,
                },
            },
            timestamp: self.timestamp,
            ..Default::default()
        }
    }

    /// Builds the frame made of two complementary fields. Samples are interleaved into a new
    /// buffer; the marking state follows 8.2.1: the frame is a reference only if both fields are.
    pub fn from_fields(top: &PictureData, bottom: &PictureData) -> PictureData {
        let reference = match (top.reference, bottom.reference) {
            (Reference::LongTerm, Reference::LongTerm) => Reference::LongTerm,
            (Reference::None, _) | (_, Reference::None) => Reference::None,
            _ => Reference::ShortTerm,
        };

        PictureData {
            top_field_order_cnt: top.pic_order_cnt,
            bottom_field_order_cnt: bottom.pic_order_cnt,
            pic_order_cnt: std::cmp::min(top.pic_order_cnt, bottom.pic_order_cnt),
            frame_num: top.frame_num,
            pic_num: top.frame_num,
            long_term_pic_num: top.long_term_frame_idx as i32,
            long_term_frame_idx: top.long_term_frame_idx,
            is_idr: top.is_idr,
            reference,
            is_output: false,
            nonexisting: top.nonexisting && bottom.nonexisting,
            field: Field::Frame,
            view_id: top.view_id,
            inter_view_flag: top.inter_view_flag && bottom.inter_view_flag,
            anchor_pic_flag: top.anchor_pic_flag,
            planes: Planes::interleave(&top.planes, &bottom.planes),
            motion: Rc::new(MotionField::interleave(&top.motion, &bottom.motion)),
            visible_rect: Rect {
                min: Point {
                    x: top.visible_rect.min.x,
                    y: top.visible_rect.min.y * 2,
                },
                max: Point {
                    x: top.visible_rect.max.x,
                    y: top.visible_rect.max.y * 2,
                },
            },
            timestamp: top.timestamp,
            ..Default::default()
        }
    }

    /// A mid-grey field of the opposite parity, used to complete an unpaired field for output.
    /// Returns `None` if `self` is a frame.
    pub fn blank_complement(&self) -> Option<PictureData> {
        let field = self.field.opposite()?;

        Some(PictureData {
            top_field_order_cnt: self.top_field_order_cnt,
            bottom_field_order_cnt: self.bottom_field_order_cnt,
            pic_order_cnt: self.pic_order_cnt,
            frame_num: self.frame_num,
            field,
            view_id: self.view_id,
            planes: self.planes.filled_like(BLANK_SAMPLE),
            motion: Rc::new(MotionField::new(self.motion.width(), self.motion.height())),
            visible_rect: self.visible_rect,
            timestamp: self.timestamp,
            ..Default::default()
        })
    }

    /// A copy of this picture with shared samples and no aliasing links.
    pub fn detached_copy(&self) -> PictureData {
        PictureData {
            top_field_order_cnt: self.top_field_order_cnt,
            bottom_field_order_cnt: self.bottom_field_order_cnt,
            pic_order_cnt: self.pic_order_cnt,
            frame_num: self.frame_num,
            pic_num: self.pic_num,
            long_term_pic_num: self.long_term_pic_num,
            long_term_frame_idx: self.long_term_frame_idx,
            is_idr: self.is_idr,
            reference: self.reference,
            is_output: self.is_output,
            nonexisting: self.nonexisting,
            field: self.field,
            ref_pic_marking: self.ref_pic_marking.clone(),
            view_id: self.view_id,
            inter_view_flag: self.inter_view_flag,
            anchor_pic_flag: self.anchor_pic_flag,
            planes: self.planes.clone(),
            motion: Rc::clone(&self.motion),
            visible_rect: self.visible_rect,
            timestamp: self.timestamp,
            aliases: None,
        }
    }
}

impl fmt::Debug for PictureData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PictureData")
            .field("field", &self.field)
            .field("pic_order_cnt", &self.pic_order_cnt)
            .field("top_field_order_cnt", &self.top_field_order_cnt)
            .field("bottom_field_order_cnt", &self.bottom_field_order_cnt)
            .field("frame_num", &self.frame_num)
            .field("pic_num", &self.pic_num)
            .field("long_term_pic_num", &self.long_term_pic_num)
            .field("long_term_frame_idx", &self.long_term_frame_idx)
            .field("reference", &self.reference)
            .field("is_idr", &self.is_idr)
            .field("is_output", &self.is_output)
            .field("nonexisting", &self.nonexisting)
            .field("view_id", &self.view_id)
            .field("aliases", &self.aliases)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::Field;
    use super::MotionField;
    use super::MotionVector;
    use super::PictureData;
    use super::Plane;
    use super::Planes;
    use super::Reference;
    use super::BLANK_SAMPLE;

    fn striped_plane(width: usize, height: usize) -> Plane {
        let data = (0..height)
            .flat_map(|y| std::iter::repeat(y as u8).take(width))
            .collect::<Vec<_>>();
        Plane::new(Bytes::from(data), width, width, height)
    }

    #[test]
    fn field_views_share_samples() {
        let frame = striped_plane(4, 6);
        let top = frame.field(Field::Top);
        let bottom = frame.field(Field::Bottom);

        assert!(top.shares_memory_with(&frame));
        assert!(bottom.shares_memory_with(&frame));
        assert_eq!(top.rows().map(|r| r[0]).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(bottom.rows().map(|r| r[0]).collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn interleave_restores_frame() {
        let frame = striped_plane(3, 4);
        let rebuilt = Plane::interleave(&frame.field(Field::Top), &frame.field(Field::Bottom));

        assert!(!rebuilt.shares_memory_with(&frame));
        assert!(rebuilt.rows().eq(frame.rows()));
    }

    #[test]
    fn motion_rows_follow_parity() {
        let mut frame = MotionField::new(2, 4);
        for y in 0..4 {
            frame.get_mut(0, y).unwrap().mv[0] = MotionVector { x: y as i16, y: 0 };
        }

        let top = frame.field(Field::Top);
        let bottom = frame.field(Field::Bottom);
        assert_eq!(top.height(), 2);
        assert_eq!(bottom.get(0, 1).unwrap().mv[0].x, 3);

        assert_eq!(MotionField::interleave(&top, &bottom), frame);
    }

    #[test]
    fn frame_from_fields() {
        let mut top = PictureData {
            field: Field::Top,
            pic_order_cnt: 8,
            frame_num: 3,
            planes: Planes {
                luma: Plane::filled(4, 2, 10),
                chroma: None,
            },
            ..Default::default()
        };
        top.set_reference(Reference::LongTerm);
        let mut bottom = PictureData {
            field: Field::Bottom,
            pic_order_cnt: 7,
            frame_num: 3,
            planes: Planes {
                luma: Plane::filled(4, 2, 20),
                chroma: None,
            },
            ..Default::default()
        };
        bottom.set_reference(Reference::ShortTerm);

        let frame = PictureData::from_fields(&top, &bottom);
        assert_eq!(frame.pic_order_cnt, 7);
        assert_eq!(frame.top_field_order_cnt, 8);
        assert_eq!(*frame.reference(), Reference::ShortTerm);
        assert_eq!(
            frame.planes.luma.rows().map(|r| r[0]).collect::<Vec<_>>(),
            vec![10, 20, 10, 20]
        );
    }

    #[test]
    fn blank_complement() {
        let top = PictureData {
            field: Field::Top,
            pic_order_cnt: 4,
            planes: Planes {
                luma: Plane::filled(2, 2, 0),
                chroma: Some([Plane::filled(1, 1, 0), Plane::filled(1, 1, 0)]),
            },
            ..Default::default()
        };

        let bottom = top.blank_complement().unwrap();
        assert_eq!(bottom.field, Field::Bottom);
        assert_eq!(bottom.pic_order_cnt, 4);
        assert!(!bottom.is_ref());
        assert!(bottom.planes.luma.rows().all(|r| r.iter().all(|s| *s == BLANK_SAMPLE)));
        assert!(bottom.planes.chroma.is_some());

        assert!(PictureData::default().blank_complement().is_none());
    }
}
