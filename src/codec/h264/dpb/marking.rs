// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adaptive reference picture marking, 8.2.5.4.

use log::debug;
use log::warn;

use super::Dpb;
use super::DpbError;
use crate::codec::h264::output::OutputSink;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::slice::MaxLongTermFrameIdx;

impl Dpb {
    /// Applies the memory management control operations carried by `pic`, in order.
    pub(super) fn adaptive_marking(
        &mut self,
        pic: &mut PictureData,
        sink: &mut dyn OutputSink,
    ) -> Result<(), DpbError> {
        let ops = pic.ref_pic_marking.inner.clone();

        for (i, op) in ops.iter().enumerate() {
            let mmco = op.memory_management_control_operation;
            debug!("MMCO {} on {:?} POC {}", mmco, pic.field, pic.pic_order_cnt);

            match mmco {
                0 => {
                    if i != ops.len() - 1 {
                        return Err(DpbError::MmcoEndNotLast);
                    }
                }
                1 => self.mmco_unmark_short_term(pic, op.difference_of_pic_nums_minus1)?,
                2 => self.mmco_unmark_long_term(pic, op.long_term_pic_num as i32)?,
                3 => self.mmco_assign_long_term(
                    pic,
                    op.difference_of_pic_nums_minus1,
                    op.long_term_frame_idx,
                )?,
                4 => self.mmco_update_max_long_term_frame_idx(op.max_long_term_frame_idx),
                5 => {
                    self.mmco_unmark_all();
                    self.last_has_mmco_5 = true;
                }
                6 => {
                    self.mmco_mark_current_long_term(pic, op.long_term_frame_idx);
                    self.update_ref_lists();
                    self.check_num_ref()?;
                }
                other => return Err(DpbError::InvalidMmco(other)),
            }

            self.update_ref_lists();
        }

        if self.last_has_mmco_5 {
            // The current picture is now the first one after a reset: 8.2.1.
            pic.pic_num = 0;
            pic.frame_num = 0;

            match pic.field {
                Field::Top => {
                    pic.top_field_order_cnt = 0;
                    pic.pic_order_cnt = 0;
                }
                Field::Bottom => {
                    pic.bottom_field_order_cnt = 0;
                    pic.pic_order_cnt = 0;
                }
                Field::Frame => {
                    pic.top_field_order_cnt -= pic.pic_order_cnt;
                    pic.bottom_field_order_cnt -= pic.pic_order_cnt;
                    pic.pic_order_cnt =
                        std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
                }
            }

            self.flush(sink)?;
        }

        Ok(())
    }

    /// picNumX as per 8-39.
    fn pic_num_x(pic: &PictureData, difference_of_pic_nums_minus1: u32) -> i32 {
        let curr_pic_num = match pic.field {
            Field::Frame => pic.frame_num,
            _ => 2 * pic.frame_num + 1,
        };

        curr_pic_num - (difference_of_pic_nums_minus1 as i32 + 1)
    }

    /// Finds the short-term reference of structure `field` whose PicNum is `pic_num`.
    fn find_short_term(&self, field: Field, pic_num: i32) -> Option<(usize, Field)> {
        let candidates: &[Field] = match field {
            Field::Frame => &[Field::Frame],
            _ => &[Field::Top, Field::Bottom],
        };

        self.fs_ref.iter().find_map(|&i| {
            let fs = &self.fs[i];
            candidates.iter().copied().find_map(|view| {
                let in_use = match view {
                    Field::Frame => fs.is_reference == 3 && fs.is_long_term == 0,
                    _ => fs.is_reference & view.mask() != 0 && fs.is_long_term & view.mask() == 0,
                };

                let pic = fs.picture(&self.pics, view)?;
                (in_use && pic.is_short_term_ref() && pic.pic_num == pic_num).then_some((i, view))
            })
        })
    }

    /// Finds the long-term reference of structure `field` whose LongTermPicNum is
    /// `long_term_pic_num`.
    fn find_long_term(&self, field: Field, long_term_pic_num: i32) -> Option<(usize, Field)> {
        let candidates: &[Field] = match field {
            Field::Frame => &[Field::Frame],
            _ => &[Field::Top, Field::Bottom],
        };

        self.fs_ltref.iter().find_map(|&i| {
            let fs = &self.fs[i];
            candidates.iter().copied().find_map(|view| {
                let in_use = match view {
                    Field::Frame => fs.is_long_term == 3,
                    _ => fs.is_long_term & view.mask() != 0,
                };

                let pic = fs.picture(&self.pics, view)?;
                (in_use && pic.is_long_term_ref() && pic.long_term_pic_num == long_term_pic_num)
                    .then_some((i, view))
            })
        })
    }

    /// Unmarks a single view of the frame store at `i`.
    fn unmark_view(&mut self, i: usize, view: Field) {
        let fs = &mut self.fs[i];
        match view {
            Field::Frame => fs.unmark_for_reference(&mut self.pics),
            _ => fs.unmark_field_for_reference(&mut self.pics, view),
        }
    }

    /// MMCO 1.
    fn mmco_unmark_short_term(
        &mut self,
        pic: &PictureData,
        difference_of_pic_nums_minus1: u32,
    ) -> Result<(), DpbError> {
        let pic_num_x = Self::pic_num_x(pic, difference_of_pic_nums_minus1);
        let (i, view) = self
            .find_short_term(pic.field, pic_num_x)
            .ok_or(DpbError::NoShortTermPic(pic_num_x))?;

        debug!("MMCO 1: unmarking {:?} with PicNum {}", view, pic_num_x);
        self.unmark_view(i, view);

        Ok(())
    }

    /// MMCO 2.
    fn mmco_unmark_long_term(
        &mut self,
        pic: &PictureData,
        long_term_pic_num: i32,
    ) -> Result<(), DpbError> {
        let (i, view) = self
            .find_long_term(pic.field, long_term_pic_num)
            .ok_or(DpbError::NoLongTermPic(long_term_pic_num))?;

        debug!(
            "MMCO 2: unmarking {:?} with LongTermPicNum {}",
            view, long_term_pic_num
        );
        self.unmark_view(i, view);

        Ok(())
    }

    /// Unmarks the long-term frame or field pair holding `long_term_frame_idx`.
    fn unmark_long_term_frame_by_idx(&mut self, long_term_frame_idx: u32) {
        for &i in &self.fs_ltref {
            let fs = &mut self.fs[i];
            if fs.long_term_frame_idx == long_term_frame_idx {
                fs.unmark_for_long_term_reference(&mut self.pics);
            }
        }
    }

    /// Unmarks the long-term references holding `long_term_frame_idx`, sparing the field that
    /// is the complement of the field about to be marked.
    ///
    /// With `mark_current`, the field being marked is the current picture and its complement is
    /// the lone field of `frame_num` awaiting pairing. Otherwise the field being marked is the
    /// stored field of PicNum `pic_num`.
    fn unmark_long_term_field_by_idx(
        &mut self,
        field: Field,
        long_term_frame_idx: u32,
        mark_current: bool,
        frame_num: i32,
        mut pic_num: i32,
    ) {
        if pic_num < 0 {
            pic_num += 2 * self.max_frame_num;
        }

        let own_mask = field.mask();
        let complement_mask = 3 & !own_mask;

        let victims = self
            .fs_ltref
            .iter()
            .copied()
            .filter(|&i| {
                let fs = &self.fs[i];
                if fs.long_term_frame_idx != long_term_frame_idx {
                    return false;
                }

                if fs.is_long_term == 3 || fs.is_long_term == own_mask {
                    return true;
                }

                if fs.is_long_term != complement_mask {
                    return false;
                }

                if mark_current {
                    self.last_picture != Some(i) || fs.frame_num != frame_num
                } else {
                    fs.frame_num != pic_num >> 1
                }
            })
            .collect::<Vec<_>>();

        for i in victims {
            self.fs[i].unmark_for_long_term_reference(&mut self.pics);
        }
    }

    /// Turns the short-term reference with PicNum `pic_num` into a long-term one.
    fn mark_pic_long_term(&mut self, pic: &PictureData, long_term_frame_idx: u32, pic_num: i32) {
        let Some((i, view)) = self.find_short_term(pic.field, pic_num) else {
            warn!(
                "Reference {:?} with PicNum {} for long term marking not found",
                pic.field, pic_num
            );
            return;
        };

        let fs = &mut self.fs[i];
        let idx = long_term_frame_idx as i32;

        if view != Field::Frame && fs.is_long_term != 0 && fs.long_term_frame_idx != long_term_frame_idx
        {
            warn!(
                "Assigning LongTermFrameIdx {} different from the other field's ({})",
                long_term_frame_idx, fs.long_term_frame_idx
            );
        }

        fs.long_term_frame_idx = long_term_frame_idx;

        let views: &[Field] = match view {
            Field::Frame => &[Field::Frame, Field::Top, Field::Bottom],
            Field::Top => &[Field::Top],
            Field::Bottom => &[Field::Bottom],
        };

        for &v in views {
            if let Some(p) = fs.handle(v).and_then(|h| self.pics.get_mut(h)) {
                p.set_reference(Reference::LongTerm);
                p.long_term_frame_idx = long_term_frame_idx;
                // Fields of the same parity as the current picture get the odd LongTermPicNum.
                p.long_term_pic_num = match (pic.field, v) {
                    (Field::Frame, _) | (_, Field::Frame) => idx,
                    (current, v) if current == v => 2 * idx + 1,
                    _ => 2 * idx,
                };
            }
        }

        fs.is_long_term |= view.mask();

        if view != Field::Frame && fs.is_long_term == 3 {
            if let Some(frame) = fs.handle(Field::Frame).and_then(|h| self.pics.get_mut(h)) {
                frame.set_reference(Reference::LongTerm);
                frame.long_term_frame_idx = long_term_frame_idx;
                frame.long_term_pic_num = idx;
            }
        }
    }

    /// MMCO 3.
    fn mmco_assign_long_term(
        &mut self,
        pic: &PictureData,
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    ) -> Result<(), DpbError> {
        let pic_num_x = Self::pic_num_x(pic, difference_of_pic_nums_minus1);

        debug!(
            "MMCO 3: PicNum {} becomes LongTermFrameIdx {}",
            pic_num_x, long_term_frame_idx
        );

        match pic.field {
            Field::Frame => self.unmark_long_term_frame_by_idx(long_term_frame_idx),
            _ => {
                let (_, view) = self
                    .find_short_term(pic.field, pic_num_x)
                    .ok_or(DpbError::NoFieldForLongTerm(pic_num_x))?;

                self.unmark_long_term_field_by_idx(view, long_term_frame_idx, false, 0, pic_num_x);
            }
        }

        self.update_ref_lists();
        self.mark_pic_long_term(pic, long_term_frame_idx, pic_num_x);

        Ok(())
    }

    /// MMCO 4.
    fn mmco_update_max_long_term_frame_idx(&mut self, max: MaxLongTermFrameIdx) {
        debug!("MMCO 4: MaxLongTermFrameIdx is now {:?}", max);
        self.max_long_term_frame_idx = max;

        for &i in &self.fs_ltref {
            let fs = &mut self.fs[i];
            if max.excludes(fs.long_term_frame_idx) {
                fs.unmark_for_long_term_reference(&mut self.pics);
            }
        }
    }

    /// MMCO 5.
    fn mmco_unmark_all(&mut self) {
        debug!("MMCO 5: unmarking all reference pictures");

        for &i in self.fs_ref.iter().chain(self.fs_ltref.iter()) {
            self.fs[i].unmark_for_reference(&mut self.pics);
        }

        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
    }

    /// MMCO 6.
    fn mmco_mark_current_long_term(&mut self, pic: &mut PictureData, long_term_frame_idx: u32) {
        debug!(
            "MMCO 6: current {:?} becomes LongTermFrameIdx {}",
            pic.field, long_term_frame_idx
        );

        match pic.field {
            Field::Frame => self.unmark_long_term_frame_by_idx(long_term_frame_idx),
            _ => self.unmark_long_term_field_by_idx(
                pic.field,
                long_term_frame_idx,
                true,
                pic.frame_num,
                0,
            ),
        }

        let idx = long_term_frame_idx as i32;
        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;
        pic.long_term_pic_num = match pic.field {
            Field::Frame => idx,
            _ => 2 * idx + 1,
        };
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::h264::dpb::tests::dpb;
    use crate::codec::h264::dpb::tests::field;
    use crate::codec::h264::dpb::tests::frame;
    use crate::codec::h264::dpb::tests::idr;
    use crate::codec::h264::dpb::tests::PocSink;
    use crate::codec::h264::dpb::DpbError;
    use crate::codec::h264::picture::Field;
    use crate::codec::h264::picture::PictureData;
    use crate::codec::h264::picture::Reference;
    use crate::codec::h264::slice::MaxLongTermFrameIdx;
    use crate::codec::h264::slice::RefPicMarkingInner;

    fn with_mmcos(mut pic: PictureData, ops: &[RefPicMarkingInner]) -> PictureData {
        pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        pic.ref_pic_marking.inner = ops.to_vec();
        pic
    }

    fn mmco(op: u8) -> RefPicMarkingInner {
        RefPicMarkingInner {
            memory_management_control_operation: op,
            ..Default::default()
        }
    }

    #[test]
    fn long_term_round_trip() {
        let _ = env_logger::try_init();
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        dpb.store_picture(idr(0), &mut sink).unwrap();
        dpb.store_picture(frame(1, 2, Reference::ShortTerm), &mut sink)
            .unwrap();

        // Frame 1 (PicNum 1) becomes long-term with index 0.
        let assign = RefPicMarkingInner {
            difference_of_pic_nums_minus1: 0,
            long_term_frame_idx: 0,
            ..mmco(3)
        };
        let max_idx = RefPicMarkingInner {
            max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(1),
            ..mmco(4)
        };
        dpb.store_picture(
            with_mmcos(frame(2, 4, Reference::ShortTerm), &[max_idx, assign]),
            &mut sink,
        )
        .unwrap();

        assert_eq!(dpb.num_long_term_refs(), 1);
        let lt = dpb.long_term_refs().next().unwrap();
        assert_eq!(lt.frame_num, 1);
        assert_eq!(lt.long_term_frame_idx, 0);
        assert_eq!(lt.is_long_term, 3);

        // LongTermPicNum 0 gets unmarked again.
        let unmark = RefPicMarkingInner {
            long_term_pic_num: 0,
            ..mmco(2)
        };
        dpb.store_picture(
            with_mmcos(frame(3, 6, Reference::ShortTerm), &[unmark]),
            &mut sink,
        )
        .unwrap();

        assert_eq!(dpb.num_long_term_refs(), 0);
        let fs = dpb
            .frame_stores()
            .iter()
            .find(|fs| fs.frame_num == 1)
            .unwrap();
        assert_eq!(fs.is_reference, 0);
        assert_eq!(fs.is_long_term, 0);
        assert!(!fs.is_used_for_reference(dpb.pictures()));
    }

    #[test]
    fn unmark_short_term() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        dpb.store_picture(idr(0), &mut sink).unwrap();
        dpb.store_picture(frame(1, 2, Reference::ShortTerm), &mut sink)
            .unwrap();

        // CurrPicNum 2, picNumX = 2 - 2 = 0: the IDR.
        let op = RefPicMarkingInner {
            difference_of_pic_nums_minus1: 1,
            ..mmco(1)
        };
        dpb.store_picture(with_mmcos(frame(2, 4, Reference::ShortTerm), &[op]), &mut sink)
            .unwrap();

        let refs = dpb.short_term_refs().map(|fs| fs.frame_num).collect::<Vec<_>>();
        assert_eq!(refs, vec![1, 2]);

        // Nothing has PicNum -5.
        let op = RefPicMarkingInner {
            difference_of_pic_nums_minus1: 7,
            ..mmco(1)
        };
        assert!(matches!(
            dpb.store_picture(with_mmcos(frame(3, 6, Reference::ShortTerm), &[op]), &mut sink),
            Err(DpbError::NoShortTermPic(-5))
        ));
    }

    #[test]
    fn reset_renormalizes_current_picture() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        dpb.store_picture(idr(0), &mut sink).unwrap();
        dpb.store_picture(frame(1, 4, Reference::ShortTerm), &mut sink)
            .unwrap();

        let mut pic = with_mmcos(frame(2, 10, Reference::ShortTerm), &[mmco(5)]);
        pic.top_field_order_cnt = 10;
        pic.bottom_field_order_cnt = 11;
        dpb.store_picture(pic, &mut sink).unwrap();

        assert!(dpb.last_has_mmco_5());
        assert_eq!(sink.pocs(), vec![0, 4]);
        assert_eq!(dpb.len(), 1);

        let fs = &dpb.frame_stores()[0];
        assert_eq!(fs.frame_num, 0);
        assert_eq!(fs.poc, 0);
        let bottom = fs.picture(dpb.pictures(), Field::Bottom).unwrap();
        assert_eq!(bottom.pic_order_cnt, 1);
    }

    #[test]
    fn max_long_term_frame_idx_evicts() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        let mut first = idr(0);
        first.ref_pic_marking.long_term_reference_flag = true;
        dpb.store_picture(first, &mut sink).unwrap();
        assert_eq!(dpb.num_long_term_refs(), 1);

        let op = RefPicMarkingInner {
            max_long_term_frame_idx: MaxLongTermFrameIdx::NoLongTermFrameIndices,
            ..mmco(4)
        };
        dpb.store_picture(with_mmcos(frame(1, 2, Reference::ShortTerm), &[op]), &mut sink)
            .unwrap();

        assert_eq!(dpb.num_long_term_refs(), 0);
        assert_eq!(
            dpb.max_long_term_frame_idx(),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
    }

    #[test]
    fn current_picture_replaces_long_term_holder() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        let mut first = idr(0);
        first.ref_pic_marking.long_term_reference_flag = true;
        dpb.store_picture(first, &mut sink).unwrap();

        let op = RefPicMarkingInner {
            long_term_frame_idx: 0,
            ..mmco(6)
        };
        dpb.store_picture(with_mmcos(frame(1, 2, Reference::ShortTerm), &[op]), &mut sink)
            .unwrap();

        let lt = dpb.long_term_refs().map(|fs| fs.frame_num).collect::<Vec<_>>();
        assert_eq!(lt, vec![1]);
        assert_eq!(dpb.num_short_term_refs(), 0);
    }

    #[test]
    fn field_pair_marked_long_term_by_parts() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        dpb.store_picture(field(Field::Top, 0, 0, Reference::ShortTerm), &mut sink)
            .unwrap();
        dpb.store_picture(field(Field::Bottom, 0, 1, Reference::ShortTerm), &mut sink)
            .unwrap();

        // Current top field of frame_num 1: CurrPicNum 3. Same parity field 0 has PicNum 1,
        // the opposite parity one PicNum 0.
        let top = RefPicMarkingInner {
            difference_of_pic_nums_minus1: 1,
            long_term_frame_idx: 2,
            ..mmco(3)
        };
        let bottom = RefPicMarkingInner {
            difference_of_pic_nums_minus1: 2,
            long_term_frame_idx: 2,
            ..mmco(3)
        };
        dpb.store_picture(
            with_mmcos(field(Field::Top, 1, 4, Reference::ShortTerm), &[top, bottom]),
            &mut sink,
        )
        .unwrap();

        let fs = &dpb.frame_stores()[0];
        assert_eq!(fs.is_long_term, 3);
        assert_eq!(fs.long_term_frame_idx, 2);
        let frame = fs.picture(dpb.pictures(), Field::Frame).unwrap();
        assert!(frame.is_long_term_ref());
        assert_eq!(frame.long_term_pic_num, 2);
    }

    #[test]
    fn second_field_joins_long_term_first_field() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        dpb.store_picture(idr(0), &mut sink).unwrap();

        let op = RefPicMarkingInner {
            long_term_frame_idx: 0,
            ..mmco(6)
        };
        dpb.store_picture(
            with_mmcos(field(Field::Top, 1, 4, Reference::ShortTerm), &[op.clone()]),
            &mut sink,
        )
        .unwrap();
        assert_eq!(dpb.frame_stores()[1].is_long_term, 1);

        // The bottom field takes the index its own top field already holds.
        dpb.store_picture(
            with_mmcos(field(Field::Bottom, 1, 5, Reference::ShortTerm), &[op]),
            &mut sink,
        )
        .unwrap();

        let fs = &dpb.frame_stores()[1];
        assert_eq!(fs.is_long_term, 3);
        assert_eq!(fs.long_term_frame_idx, 0);
        assert!(fs
            .picture(dpb.pictures(), Field::Top)
            .unwrap()
            .is_long_term_ref());
        assert!(fs
            .picture(dpb.pictures(), Field::Frame)
            .unwrap()
            .is_long_term_ref());
        assert_eq!(dpb.num_long_term_refs(), 1);
        assert_eq!(dpb.num_short_term_refs(), 1);
    }

    #[test]
    fn end_marker_must_be_last() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        dpb.store_picture(idr(0), &mut sink).unwrap();
        assert!(matches!(
            dpb.store_picture(
                with_mmcos(frame(1, 2, Reference::ShortTerm), &[mmco(0), mmco(5)]),
                &mut sink
            ),
            Err(DpbError::MmcoEndNotLast)
        ));
        assert!(matches!(
            dpb.store_picture(with_mmcos(frame(1, 2, Reference::ShortTerm), &[mmco(9)]), &mut sink),
            Err(DpbError::InvalidMmco(9))
        ));
    }
}
