// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer: residency, reference marking and output bumping.

mod marking;

use std::fmt;

use log::debug;
use log::trace;
use log::warn;
use thiserror::Error;

use crate::codec::h264::arena::PicHandle;
use crate::codec::h264::arena::PictureArena;
use crate::codec::h264::frame_store::FrameStore;
use crate::codec::h264::output::OutputScheduler;
use crate::codec::h264::output::OutputSink;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::slice::MaxLongTermFrameIdx;

/// Stream conformance violations and misuse of the DPB.
#[derive(Debug, Error)]
pub enum DpbError {
    #[error("DPB size ({size}) is smaller than the number of reference frames ({num_ref_frames})")]
    DpbTooSmall { size: usize, num_ref_frames: usize },
    #[error("max_dec_frame_buffering ({max_dec_frame_buffering}) larger than MaxDpbFrames ({max_dpb_frames})")]
    MaxDecFrameBufferingTooLarge {
        max_dec_frame_buffering: usize,
        max_dpb_frames: usize,
    },
    #[error("undefined level_idc {0}")]
    UndefinedLevel(u8),
    #[error("max number of reference frames exceeded ({num_refs} > {max})")]
    MaxRefFramesExceeded { num_refs: usize, max: usize },
    #[error("duplicate frame_num {0} in short-term reference picture buffer")]
    DuplicateFrameNum(i32),
    #[error("output POC must be in ascending order (last {last}, got {poc})")]
    OutputPocRegression { last: i32, poc: i32 },
    #[error("cannot output frame, DPB empty")]
    Empty,
    #[error("no frames for output available")]
    NothingToOutput,
    #[error("no short term reference picture with pic_num {0}")]
    NoShortTermPic(i32),
    #[error("no long term reference picture with long_term_pic_num {0}")]
    NoLongTermPic(i32),
    #[error("no inter-view reference picture for view_id {0}")]
    NoInterViewPic(u16),
    #[error("field for long term marking not found (picNumX {0})")]
    NoFieldForLongTerm(i32),
    #[error("memory_management_control_operation = 0 not last operation in buffer")]
    MmcoEndNotLast,
    #[error("invalid memory_management_control_operation {0}")]
    InvalidMmco(u8),
    #[error("invalid modification_of_pic_nums_idc {0}")]
    InvalidModificationIdc(u8),
    #[error("more modifications of RefPicList{list} than its {num_active} active entries")]
    TooManyModifications { list: usize, num_active: usize },
    #[error("RefPicList{list}[{idx}] is equal to 'no reference picture'")]
    NoReferencePicture { list: usize, idx: usize },
    #[error("stale picture handle {0:?}")]
    StaleHandle(PicHandle),
    #[error("frame store has no picture where one was expected")]
    MissingPicture,
    #[error("{0:?} already present in frame store")]
    FieldAlreadyPresent(Field),
    #[error("fields already combined into a frame")]
    AlreadyCombined,
    #[error("gap in frame_num ({prev} -> {cur}) while gaps are not allowed")]
    FrameNumGap { prev: i32, cur: i32 },
    #[error("no active sequence")]
    NoActiveSequence,
}

/// The DPB of one view.
///
/// `frame_stores()` always lists the occupied frame stores first-inserted first; removing a frame
/// store shifts the following ones down.
pub struct Dpb {
    pics: PictureArena,
    fs: Vec<FrameStore>,
    /// Indices into `fs` of the short-term references.
    fs_ref: Vec<usize>,
    /// Indices into `fs` of the long-term references.
    fs_ltref: Vec<usize>,
    /// The frame store holding a lone field that may still get its complementary field.
    last_picture: Option<usize>,

    size: usize,
    num_ref_frames: usize,
    max_frame_num: i32,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    last_has_mmco_5: bool,

    out: OutputScheduler,

    layer: u8,
    /// Whether base view pictures flagged for inter-view prediction are registered.
    inter_view_registry: bool,
    inter_view: Option<FrameStore>,
}

impl Dpb {
    pub fn new(layer: u8) -> Self {
        Self {
            pics: PictureArena::new(layer),
            fs: Default::default(),
            fs_ref: Default::default(),
            fs_ltref: Default::default(),
            last_picture: None,
            size: 0,
            num_ref_frames: 0,
            max_frame_num: 16,
            max_long_term_frame_idx: Default::default(),
            last_has_mmco_5: false,
            out: Default::default(),
            layer,
            inter_view_registry: false,
            inter_view: None,
        }
    }

    /// Sets the capacity of the DPB and the reference limits of the stream.
    pub fn set_limits(
        &mut self,
        size: usize,
        num_ref_frames: usize,
        max_frame_num: u32,
    ) -> Result<(), DpbError> {
        if size < num_ref_frames || size == 0 {
            return Err(DpbError::DpbTooSmall {
                size,
                num_ref_frames,
            });
        }

        self.size = size;
        self.num_ref_frames = num_ref_frames;
        self.max_frame_num = max_frame_num as i32;

        Ok(())
    }

    /// Enables the registry of pictures usable for inter-view prediction by other views.
    pub fn set_inter_view_registry(&mut self, enabled: bool) {
        self.inter_view_registry = enabled;
        if !enabled {
            self.release_inter_view();
        }
    }

    pub fn layer(&self) -> u8 {
        self.layer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_ref_frames(&self) -> usize {
        self.num_ref_frames
    }

    pub fn max_frame_num(&self) -> i32 {
        self.max_frame_num
    }

    pub fn max_long_term_frame_idx(&self) -> MaxLongTermFrameIdx {
        self.max_long_term_frame_idx
    }

    /// Whether the last stored picture carried a memory_management_control_operation 5.
    pub fn last_has_mmco_5(&self) -> bool {
        self.last_has_mmco_5
    }

    /// Number of occupied frame stores.
    pub fn len(&self) -> usize {
        self.fs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fs.is_empty()
    }

    pub fn frame_stores(&self) -> &[FrameStore] {
        &self.fs
    }

    pub fn pictures(&self) -> &PictureArena {
        &self.pics
    }

    pub fn output(&self) -> &OutputScheduler {
        &self.out
    }

    /// Resolves `handle`, failing if the picture has been released since.
    pub fn picture(&self, handle: PicHandle) -> Result<&PictureData, DpbError> {
        self.pics.get(handle).ok_or(DpbError::StaleHandle(handle))
    }

    /// The short-term reference frame stores.
    pub fn short_term_refs(&self) -> impl Iterator<Item = &FrameStore> {
        self.fs_ref.iter().map(|&i| &self.fs[i])
    }

    /// The long-term reference frame stores.
    pub fn long_term_refs(&self) -> impl Iterator<Item = &FrameStore> {
        self.fs_ltref.iter().map(|&i| &self.fs[i])
    }

    pub fn num_short_term_refs(&self) -> usize {
        self.fs_ref.len()
    }

    pub fn num_long_term_refs(&self) -> usize {
        self.fs_ltref.len()
    }

    /// The base view picture of the current access unit available for inter-view prediction.
    pub fn inter_view_store(&self) -> Option<&FrameStore> {
        self.inter_view.as_ref()
    }

    /// Recomputes the short-term and long-term reference indexes.
    fn update_ref_lists(&mut self) {
        let pics = &self.pics;

        self.fs_ref = (0..self.fs.len())
            .filter(|&i| self.fs[i].is_short_term_reference(pics))
            .collect();
        self.fs_ltref = (0..self.fs.len())
            .filter(|&i| self.fs[i].is_long_term_reference(pics))
            .collect();
    }

    /// Derives FrameNumWrap, PicNum and LongTermPicNum of every reference relative to a current
    /// picture of structure `field` and number `frame_num`, as per 8.2.4.1.
    pub fn update_pic_nums(&mut self, field: Field, frame_num: i32) {
        let (add_top, add_bottom) = match field {
            Field::Frame => (0, 0),
            Field::Top => (1, 0),
            Field::Bottom => (0, 1),
        };

        for &i in &self.fs_ref {
            let fs = &mut self.fs[i];

            fs.frame_num_wrap = if fs.frame_num > frame_num {
                fs.frame_num - self.max_frame_num
            } else {
                fs.frame_num
            };

            let wrap = fs.frame_num_wrap;
            let views = match field {
                Field::Frame => [Some((Field::Frame, wrap)), None],
                _ => [
                    Some((Field::Top, 2 * wrap + add_top)),
                    Some((Field::Bottom, 2 * wrap + add_bottom)),
                ],
            };

            for (view, pic_num) in views.into_iter().flatten() {
                if let Some(pic) = fs.handle(view).and_then(|h| self.pics.get_mut(h)) {
                    if pic.is_short_term_ref() {
                        pic.pic_num = pic_num;
                    }
                }
            }
        }

        for &i in &self.fs_ltref {
            let fs = &self.fs[i];

            let views = match field {
                Field::Frame => [Some((Field::Frame, 0)), None],
                _ => [Some((Field::Top, add_top)), Some((Field::Bottom, add_bottom))],
            };

            for (view, add) in views.into_iter().flatten() {
                if let Some(pic) = fs.handle(view).and_then(|h| self.pics.get_mut(h)) {
                    if pic.is_long_term_ref() {
                        let idx = pic.long_term_frame_idx as i32;
                        pic.long_term_pic_num = if view == Field::Frame {
                            idx
                        } else {
                            2 * idx + add
                        };
                    }
                }
            }
        }
    }

    /// Checks that the DPB holds no more reference frames than the stream allows.
    fn check_num_ref(&self) -> Result<(), DpbError> {
        let num_refs = self.fs_ref.len() + self.fs_ltref.len();
        let max = std::cmp::max(1, self.num_ref_frames);

        if num_refs > max {
            return Err(DpbError::MaxRefFramesExceeded { num_refs, max });
        }

        Ok(())
    }

    /// Unmarks the short-term reference with the lowest FrameNumWrap if the reference budget is
    /// exhausted, as per 8.2.5.3.
    pub fn sliding_window_marking(&mut self) {
        let max = std::cmp::max(1, self.num_ref_frames);
        let budget = max.saturating_sub(self.fs_ltref.len());

        if self.fs_ref.len() < budget {
            return;
        }

        let victim = self
            .fs_ref
            .iter()
            .copied()
            .min_by_key(|&i| self.fs[i].frame_num_wrap);

        if let Some(victim) = victim {
            let fs = &mut self.fs[victim];
            debug!(
                "Sliding window: unmarking frame_num {} (FrameNumWrap {}, POC {})",
                fs.frame_num, fs.frame_num_wrap, fs.poc
            );

            fs.unmark_for_reference(&mut self.pics);
            self.update_ref_lists();
        }
    }

    /// Marking of an IDR picture, 8.2.5.1. Prior pictures are either discarded or flushed to the
    /// output.
    fn idr_marking(
        &mut self,
        pic: &mut PictureData,
        sink: &mut dyn OutputSink,
    ) -> Result<(), DpbError> {
        if pic.ref_pic_marking.no_output_of_prior_pics_flag {
            debug!("IDR: discarding {} frame stores without output", self.fs.len());
            self.clear();
        } else {
            debug!("IDR: flushing {} frame stores", self.fs.len());
            self.flush(sink)?;
        }

        self.last_picture = None;
        self.update_ref_lists();
        self.out.reset_order();

        if pic.ref_pic_marking.long_term_reference_flag {
            self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            pic.set_reference(Reference::LongTerm);
            pic.long_term_frame_idx = 0;
            pic.long_term_pic_num = 0;
        } else {
            self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            if pic.is_ref() {
                pic.set_reference(Reference::ShortTerm);
            }
        }

        Ok(())
    }

    /// Whether `pic` is the second field of the lone field held in `last_picture`.
    fn completes_last_picture(&self, pic: &PictureData) -> Option<usize> {
        let idx = self.last_picture?;
        let fs = self.fs.get(idx)?;

        let opposite_present = match pic.field {
            Field::Top => fs.is_used == 2,
            Field::Bottom => fs.is_used == 1,
            Field::Frame => false,
        };
        let same_ref_kind = pic.is_ref() == (fs.is_orig_reference != 0);

        (fs.frame_num == pic.frame_num && opposite_present && same_ref_kind).then_some(idx)
    }

    /// Stores a decoded picture, performing reference marking and outputting pictures as needed
    /// to make room for it (C.4.4, C.4.5).
    pub fn store_picture(
        &mut self,
        mut pic: PictureData,
        sink: &mut dyn OutputSink,
    ) -> Result<(), DpbError> {
        self.last_has_mmco_5 = false;
        self.update_pic_nums(pic.field, pic.frame_num);

        let adaptive = pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag;
        if !adaptive && !pic.ref_pic_marking.inner.is_empty() {
            warn!(
                "Picture POC {} carries {} MMCOs without adaptive_ref_pic_marking_mode_flag, ignoring them",
                pic.pic_order_cnt,
                pic.ref_pic_marking.inner.len()
            );
        }

        if pic.is_idr() {
            self.idr_marking(&mut pic, sink)?;
        } else if pic.is_ref() && adaptive {
            self.adaptive_marking(&mut pic, sink)?;
        }

        self.register_inter_view(&pic)?;

        if let Some(idx) = self.completes_last_picture(&pic) {
            debug!(
                "Pairing {:?} field POC {} with frame store {}",
                pic.field, pic.pic_order_cnt, idx
            );
            self.fs[idx].insert_picture(&mut self.pics, pic)?;
            self.update_ref_lists();
            self.last_picture = None;
            trace!("DPB after pairing: {:#?}", self);
            return Ok(());
        }

        if !pic.is_idr() && pic.is_ref() && !adaptive {
            self.sliding_window_marking();
        }

        // First try to remove unused frames.
        if self.fs.len() >= self.size {
            self.remove_unused_frame();
        }

        // Then output frames until one can be removed.
        while self.fs.len() >= self.size {
            if !pic.is_ref() {
                let direct = match self.smallest_poc() {
                    None => true,
                    Some((poc, _)) => pic.pic_order_cnt < poc,
                };

                if direct {
                    debug!(
                        "Direct output of non-reference {:?} POC {}",
                        pic.field, pic.pic_order_cnt
                    );
                    return self.out.direct_output(sink, pic);
                }
            }

            self.output_one_frame(sink)?;
        }

        if pic.is_short_term_ref()
            && self
                .short_term_refs()
                .any(|fs| fs.frame_num == pic.frame_num)
        {
            return Err(DpbError::DuplicateFrameNum(pic.frame_num));
        }

        let is_field = pic.field.is_field();
        let mut fs = FrameStore::default();
        fs.insert_picture(&mut self.pics, pic)?;
        self.fs.push(fs);

        self.last_picture = is_field.then(|| self.fs.len() - 1);
        self.update_ref_lists();
        self.check_num_ref()?;

        trace!("DPB after store: {:#?}", self);

        Ok(())
    }

    /// Registers a copy of a base view picture that other views may use for inter-view
    /// prediction within the same access unit.
    fn register_inter_view(&mut self, pic: &PictureData) -> Result<(), DpbError> {
        if !self.inter_view_registry {
            return Ok(());
        }

        // Any base picture other than the second field of the registered one ends its access
        // unit.
        let pairs = self.inter_view.as_ref().is_some_and(|fs| {
            fs.frame_num == pic.frame_num && fs.is_used & pic.field.mask() == 0 && fs.is_used != 0
        });
        if !pairs {
            self.release_inter_view();
        }

        if !pic.inter_view_flag {
            return Ok(());
        }

        let mut copy = pic.detached_copy();
        copy.set_reference(Reference::None);

        let fs = self.inter_view.get_or_insert_with(Default::default);
        fs.insert_picture(&mut self.pics, copy)
    }

    fn release_inter_view(&mut self) {
        if let Some(mut fs) = self.inter_view.take() {
            fs.release(&mut self.pics);
        }
    }

    /// Finds the frame store with the lowest POC among those not output yet.
    pub fn smallest_poc(&self) -> Option<(i32, usize)> {
        self.fs
            .iter()
            .enumerate()
            .filter(|(_, fs)| !fs.is_output)
            .min_by_key(|(_, fs)| fs.poc)
            .map(|(i, fs)| (fs.poc, i))
    }

    /// Removes the frame store at `pos`, releasing its pictures and shifting the following frame
    /// stores down.
    pub fn remove_frame(&mut self, pos: usize) {
        let mut fs = self.fs.remove(pos);
        debug!(
            "Removing frame store {} (frame_num {}, POC {})",
            pos, fs.frame_num, fs.poc
        );
        fs.release(&mut self.pics);

        self.last_picture = match self.last_picture {
            Some(i) if i == pos => None,
            Some(i) if i > pos => Some(i - 1),
            other => other,
        };

        self.update_ref_lists();
    }

    /// Removes the first frame store that has been output and is not used for reference anymore.
    pub fn remove_unused_frame(&mut self) -> bool {
        let pos = self
            .fs
            .iter()
            .position(|fs| fs.is_output && !fs.is_used_for_reference(&self.pics));

        match pos {
            Some(pos) => {
                self.remove_frame(pos);
                true
            }
            None => false,
        }
    }

    /// Outputs the frame store with the lowest POC, removing it if it is not a reference.
    pub fn output_one_frame(&mut self, sink: &mut dyn OutputSink) -> Result<(), DpbError> {
        if self.fs.is_empty() {
            return Err(DpbError::Empty);
        }

        let (_, pos) = self.smallest_poc().ok_or(DpbError::NothingToOutput)?;

        self.out.write_stored_frame(sink, &self.pics, &self.fs[pos])?;
        self.fs[pos].is_output = true;

        if !self.fs[pos].is_used_for_reference(&self.pics) {
            self.remove_frame(pos);
        }

        Ok(())
    }

    /// Marks every picture as unused for reference and outputs all of them in POC order.
    pub fn flush(&mut self, sink: &mut dyn OutputSink) -> Result<(), DpbError> {
        debug!("Flushing DPB of layer {}", self.layer);

        for fs in self.fs.iter_mut() {
            fs.unmark_for_reference(&mut self.pics);
        }
        self.update_ref_lists();

        while self.remove_unused_frame() {}

        while !self.fs.is_empty() {
            self.output_one_frame(sink)?;
        }

        self.out.flush_direct_output(sink)?;
        self.out.reset_order();
        self.last_picture = None;
        self.release_inter_view();

        Ok(())
    }

    /// Drops every picture without outputting it.
    pub fn clear(&mut self) {
        for fs in self.fs.iter_mut() {
            fs.release(&mut self.pics);
        }

        self.fs.clear();
        self.fs_ref.clear();
        self.fs_ltref.clear();
        self.last_picture = None;
        self.release_inter_view();
        self.out.discard_pending();
    }
}

impl fmt::Debug for Dpb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stores = self
            .fs
            .iter()
            .map(|fs| {
                (
                    fs.frame_num,
                    fs.poc,
                    fs.is_used,
                    fs.is_reference,
                    fs.is_long_term,
                    fs.is_output,
                )
            })
            .collect::<Vec<_>>();

        f.debug_struct("Dpb")
            .field("layer", &self.layer)
            .field("size", &self.size)
            .field("num_ref_frames", &self.num_ref_frames)
            .field("(frame_num, poc, used, ref, lt, output)", &stores)
            .field("fs_ref", &self.fs_ref)
            .field("fs_ltref", &self.fs_ltref)
            .field("last_picture", &self.last_picture)
            .field("max_long_term_frame_idx", &self.max_long_term_frame_idx)
            .field("out", &self.out)
            .finish()
    }
}
