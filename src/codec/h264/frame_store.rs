// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use log::debug;

use crate::codec::h264::arena::PicHandle;
use crate::codec::h264::arena::PictureArena;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

/// The cross links between a frame and its two fields.
///
/// Only a [`FrameStore`] can build this value, when it splits a frame into field views or
/// combines two complementary fields into a frame. Every picture of the trio carries a copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Combined {
    frame: PicHandle,
    top: PicHandle,
    bottom: PicHandle,
}

impl Combined {
    pub fn frame(&self) -> PicHandle {
        self.frame
    }

    pub fn top(&self) -> PicHandle {
        self.top
    }

    pub fn bottom(&self) -> PicHandle {
        self.bottom
    }

    /// The view of structure `field`.
    pub fn view(&self, field: Field) -> PicHandle {
        match field {
            Field::Frame => self.frame,
            Field::Top => self.top,
            Field::Bottom => self.bottom,
        }
    }
}

/// A DPB slot holding a frame, a lone field, or a complementary field pair.
///
/// `is_used`, `is_reference`, `is_orig_reference` and `is_long_term` are bitmasks where bit 0
/// stands for the top field and bit 1 for the bottom field, 3 meaning the whole frame.
#[derive(Debug, Default)]
pub struct FrameStore {
    pub is_used: u8,
    pub is_reference: u8,
    pub is_orig_reference: u8,
    pub is_long_term: u8,

    pub frame_num: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: u32,
    pub poc: i32,
    pub is_output: bool,

    pub view_id: u16,
    pub inter_view_flag: [bool; 2],

    pub frame: Option<PicHandle>,
    pub top_field: Option<PicHandle>,
    pub bottom_field: Option<PicHandle>,
}

fn picture(pics: &PictureArena, handle: Option<PicHandle>) -> Option<&PictureData> {
    handle.and_then(|h| pics.get(h))
}

impl FrameStore {
    /// The picture of structure `field`, if present.
    pub fn handle(&self, field: Field) -> Option<PicHandle> {
        match field {
            Field::Frame if self.is_used == 3 => self.frame,
            Field::Top if self.is_used & 1 != 0 => self.top_field,
            Field::Bottom if self.is_used & 2 != 0 => self.bottom_field,
            _ => None,
        }
    }

    pub fn picture<'a>(&self, pics: &'a PictureArena, field: Field) -> Option<&'a PictureData> {
        picture(pics, self.handle(field))
    }

    /// Moves `pic` into this store. A frame is split into field views right away; a second field
    /// of opposite parity gets combined with the first one.
    pub fn insert_picture(
        &mut self,
        pics: &mut PictureArena,
        pic: PictureData,
    ) -> Result<(), DpbError> {
        let field = pic.field;
        let mask = field.mask();

        if self.is_used & mask != 0 {
            return Err(DpbError::FieldAlreadyPresent(field));
        }

        let is_ref = pic.is_ref();
        let is_long_term = pic.is_long_term_ref();
        let long_term_frame_idx = pic.long_term_frame_idx;
        let frame_num = pic.frame_num;
        let poc = pic.pic_order_cnt;
        let is_output = pic.is_output;
        let inter_view_flag = pic.inter_view_flag;

        self.view_id = pic.view_id;
        let handle = pics.insert(pic);

        self.is_used |= mask;
        if is_ref {
            self.is_reference |= mask;
            self.is_orig_reference |= mask;
            if is_long_term {
                self.is_long_term |= mask;
                self.long_term_frame_idx = long_term_frame_idx;
            }
        }

        match field {
            Field::Frame => {
                self.frame = Some(handle);
                self.inter_view_flag = [inter_view_flag; 2];
                self.split_frame(pics)?;
            }
            Field::Top | Field::Bottom => {
                if field == Field::Top {
                    self.top_field = Some(handle);
                    self.inter_view_flag[0] = inter_view_flag;
                } else {
                    self.bottom_field = Some(handle);
                    self.inter_view_flag[1] = inter_view_flag;
                }

                if self.is_used == 3 {
                    self.combine_fields(pics)?;
                } else {
                    self.poc = poc;
                }
            }
        }

        self.frame_num = frame_num;
        self.is_output = is_output;

        Ok(())
    }

    fn link(pics: &mut PictureArena, aliases: Combined) {
        for handle in [aliases.frame, aliases.top, aliases.bottom] {
            if let Some(pic) = pics.get_mut(handle) {
                pic.set_aliases(aliases);
            }
        }
    }

    /// Creates the two field views of the frame held by this store.
    fn split_frame(&mut self, pics: &mut PictureArena) -> Result<(), DpbError> {
        let frame = self.frame.ok_or(DpbError::MissingPicture)?;
        let frame_pic = pics.get(frame).ok_or(DpbError::StaleHandle(frame))?;

        self.poc = frame_pic.pic_order_cnt;
        let top = frame_pic.field_view(Field::Top);
        let bottom = frame_pic.field_view(Field::Bottom);

        let top = pics.insert(top);
        let bottom = pics.insert(bottom);
        Self::link(pics, Combined { frame, top, bottom });

        self.top_field = Some(top);
        self.bottom_field = Some(bottom);

        Ok(())
    }

    /// Synthesizes the frame made of the two complementary fields held by this store.
    ///
    /// Combining twice is a logic error and is rejected without touching the store.
    pub fn combine_fields(&mut self, pics: &mut PictureArena) -> Result<(), DpbError> {
        if self.frame.is_some() {
            return Err(DpbError::AlreadyCombined);
        }

        let top = self.top_field.ok_or(DpbError::MissingPicture)?;
        let bottom = self.bottom_field.ok_or(DpbError::MissingPicture)?;
        let top_pic = pics.get(top).ok_or(DpbError::StaleHandle(top))?;
        let bottom_pic = pics.get(bottom).ok_or(DpbError::StaleHandle(bottom))?;

        debug!(
            "Combining fields POC {}/{} (frame_num {})",
            top_pic.pic_order_cnt, bottom_pic.pic_order_cnt, top_pic.frame_num
        );

        let mut frame = PictureData::from_fields(top_pic, bottom_pic);
        if frame.is_long_term_ref() {
            frame.long_term_frame_idx = self.long_term_frame_idx;
            frame.long_term_pic_num = self.long_term_frame_idx as i32;
        }

        // Field references become references to the frames those fields belong to.
        Rc::make_mut(&mut frame.motion)
            .remap_refs(|h| pics.get(h).and_then(|p| p.aliases()).map(|a| a.frame()));

        self.poc = frame.pic_order_cnt;

        let frame = pics.insert(frame);
        Self::link(pics, Combined { frame, top, bottom });
        self.frame = Some(frame);

        Ok(())
    }

    /// Releases every picture held by this store and resets it.
    pub fn release(&mut self, pics: &mut PictureArena) {
        for handle in [self.frame, self.top_field, self.bottom_field]
            .into_iter()
            .flatten()
        {
            pics.remove(handle);
        }

        *self = Default::default();
    }

    fn views(&self) -> impl Iterator<Item = PicHandle> {
        [
            self.handle(Field::Top),
            self.handle(Field::Bottom),
            self.handle(Field::Frame),
        ]
        .into_iter()
        .flatten()
    }

    fn any_view(&self, pics: &PictureArena, pred: impl Fn(&PictureData) -> bool) -> bool {
        self.views()
            .filter_map(|h| pics.get(h))
            .any(|p| pred(p))
    }

    pub fn is_used_for_reference(&self, pics: &PictureArena) -> bool {
        self.is_reference != 0 || self.any_view(pics, |p| p.is_ref())
    }

    /// Whether the frame or one of its fields is a short-term reference.
    pub fn is_short_term_reference(&self, pics: &PictureArena) -> bool {
        self.any_view(pics, |p| p.is_short_term_ref())
    }

    /// Whether the frame or one of its fields is a long-term reference.
    pub fn is_long_term_reference(&self, pics: &PictureArena) -> bool {
        self.any_view(pics, |p| p.is_long_term_ref())
    }

    fn set_views_reference(&self, pics: &mut PictureArena, mask: u8, reference: Reference) {
        let handles = [
            (1, self.handle(Field::Top)),
            (2, self.handle(Field::Bottom)),
            (3, self.handle(Field::Frame)),
        ];

        for (bits, handle) in handles {
            if mask & bits == 0 {
                continue;
            }

            if let Some(pic) = handle.and_then(|h| pics.get_mut(h)) {
                pic.set_reference(reference);
            }
        }
    }

    pub fn unmark_for_reference(&mut self, pics: &mut PictureArena) {
        self.set_views_reference(pics, 3, Reference::None);
        self.is_reference = 0;
        self.is_long_term = 0;
    }

    pub fn unmark_for_long_term_reference(&mut self, pics: &mut PictureArena) {
        self.unmark_for_reference(pics);
    }

    /// Unmarks the field `field` only. The frame view stops being a reference as well since it is
    /// no longer made of two reference fields.
    pub fn unmark_field_for_reference(&mut self, pics: &mut PictureArena, field: Field) {
        let mask = field.mask();

        self.set_views_reference(pics, mask, Reference::None);
        self.is_reference &= !mask;
        self.is_long_term &= !mask;
    }
}
