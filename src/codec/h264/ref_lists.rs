// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture list construction, 8.2.4 and H.8.2.4.

use std::cmp::Reverse;

use log::debug;
use log::trace;
use log::warn;

use crate::codec::h264::arena::PicHandle;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::frame_store::Combined;
use crate::codec::h264::frame_store::FrameStore;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::slice::SliceHeader;

/// Capacity of every reference list; unused entries hold `None`.
pub const MAX_LIST_SIZE: usize = 33;

/// RefPicList0 and RefPicList1, followed by the four field lists of MBAFF frames: list `2 + X`
/// holds the fields of list X top field first, list `4 + X` bottom field first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefPicLists {
    lists: [Vec<Option<PicHandle>>; 6],
    sizes: [usize; 6],
}

impl Default for RefPicLists {
    fn default() -> Self {
        Self {
            lists: std::array::from_fn(|_| vec![None; MAX_LIST_SIZE]),
            sizes: [0; 6],
        }
    }
}

impl RefPicLists {
    /// The active entries of list `list`.
    pub fn list(&self, list: usize) -> &[Option<PicHandle>] {
        &self.lists[list][..self.sizes[list]]
    }

    /// List `list` with its padding.
    pub fn padded(&self, list: usize) -> &[Option<PicHandle>] {
        &self.lists[list]
    }

    pub fn size(&self, list: usize) -> usize {
        self.sizes[list]
    }

    /// The picture at `idx` in `list`.
    pub fn get(&self, list: usize, idx: usize) -> Result<PicHandle, DpbError> {
        self.list(list)
            .get(idx)
            .copied()
            .flatten()
            .ok_or(DpbError::NoReferencePicture { list, idx })
    }

    fn set(&mut self, list: usize, mut entries: Vec<Option<PicHandle>>) {
        self.sizes[list] = entries.len();
        entries.resize(std::cmp::max(MAX_LIST_SIZE, entries.len()), None);
        self.lists[list] = entries;
    }

    /// Derives the MBAFF field lists 2 to 5 from lists 0 and 1.
    pub fn derive_mbaff_lists(&mut self, aliases: impl Fn(PicHandle) -> Option<Combined>) {
        for x in 0..2 {
            let mut top_first = Vec::with_capacity(2 * self.sizes[x]);
            let mut bottom_first = Vec::with_capacity(2 * self.sizes[x]);

            for entry in self.list(x) {
                let (top, bottom) = match entry.and_then(&aliases) {
                    Some(c) => (Some(c.top()), Some(c.bottom())),
                    None => (None, None),
                };

                top_first.extend([top, bottom]);
                bottom_first.extend([bottom, top]);
            }

            self.set(2 + x, top_first);
            self.set(4 + x, bottom_first);
        }
    }
}

type PicList<'a> = Vec<(PicHandle, &'a PictureData)>;

fn sort_pic_num_descending(pics: &mut PicList) {
    pics.sort_by_key(|(_, p)| Reverse(p.pic_num));
}

fn sort_long_term_pic_num_ascending(pics: &mut PicList) {
    pics.sort_by_key(|(_, p)| p.long_term_pic_num);
}

fn sort_poc_descending(pics: &mut PicList) {
    pics.sort_by_key(|(_, p)| Reverse(p.pic_order_cnt));
}

fn sort_poc_ascending(pics: &mut PicList) {
    pics.sort_by_key(|(_, p)| p.pic_order_cnt);
}

fn sort_frame_num_wrap_descending(frames: &mut [&FrameStore]) {
    frames.sort_by_key(|fs| Reverse(fs.frame_num_wrap));
}

fn sort_long_term_frame_idx_ascending(frames: &mut [&FrameStore]) {
    frames.sort_by_key(|fs| fs.long_term_frame_idx);
}

fn sort_fs_poc_descending(frames: &mut [&FrameStore]) {
    frames.sort_by_key(|fs| Reverse(fs.poc));
}

fn sort_fs_poc_ascending(frames: &mut [&FrameStore]) {
    frames.sort_by_key(|fs| fs.poc);
}

fn handles(pics: PicList) -> Vec<PicHandle> {
    pics.into_iter().map(|(h, _)| h).collect()
}

// When the reference picture list RefPicList1 has more than one entry
// and RefPicList1 is identical to the reference picture list
// RefPicList0, the first two entries RefPicList1[0] and RefPicList1[1]
// are switched.
fn swap_b1_if_needed(b0: &[PicHandle], b1: &mut [PicHandle]) {
    if b1.len() > 1 && b0 == b1 {
        b1.swap(0, 1);
    }
}

/// Interleaves the fields of `frames` starting with the parity of `field`, as per 8.2.4.2.5.
/// Fields not satisfying `usable` are skipped and the next available field of the same parity is
/// taken instead.
fn gen_pic_list_from_frame_list(
    dpb: &Dpb,
    field: Field,
    frames: &[&FrameStore],
    usable: impl Fn(&PictureData) -> bool,
) -> Vec<PicHandle> {
    let (same, opposite) = match field {
        Field::Bottom => (Field::Bottom, Field::Top),
        _ => (Field::Top, Field::Bottom),
    };

    let usable = &usable;
    let available = |parity: Field| {
        frames.iter().filter_map(move |fs| {
            fs.handle(parity)
                .filter(|&h| dpb.picture(h).is_ok_and(usable))
        })
    };

    let mut same = available(same);
    let mut opposite = available(opposite);
    let mut list = vec![];

    loop {
        match (same.next(), opposite.next()) {
            (None, None) => break,
            (a, b) => list.extend(a.into_iter().chain(b)),
        }
    }

    list
}

/// Builds the reference lists of one slice.
///
/// The picture numbers of the DPB must have been derived for the slice with
/// [`Dpb::update_pic_nums`] beforehand.
pub struct RefPicListBuilder<'a> {
    dpb: &'a Dpb,
    slice: &'a SliceHeader,
    base: Option<&'a Dpb>,
    ref_views: [&'a [u16]; 2],
    pic_order_cnt_type: u8,
    non_conforming_stream: bool,
}

impl<'a> RefPicListBuilder<'a> {
    pub fn new(dpb: &'a Dpb, slice: &'a SliceHeader) -> Self {
        Self {
            dpb,
            slice,
            base: None,
            ref_views: [&[], &[]],
            pic_order_cnt_type: 0,
            non_conforming_stream: false,
        }
    }

    pub fn pic_order_cnt_type(mut self, pic_order_cnt_type: u8) -> Self {
        self.pic_order_cnt_type = pic_order_cnt_type;
        self
    }

    /// Tolerate lists ending with "no reference picture" entries.
    pub fn non_conforming_stream(mut self, non_conforming_stream: bool) -> Self {
        self.non_conforming_stream = non_conforming_stream;
        self
    }

    /// Enables inter-view prediction from the pictures registered by the base view DPB `base`,
    /// restricted to the views in `ref_views` for each list.
    pub fn inter_view(mut self, base: &'a Dpb, ref_views: [&'a [u16]; 2]) -> Self {
        self.base = Some(base);
        self.ref_views = ref_views;
        self
    }

    fn is_own(&self, handle: PicHandle) -> bool {
        handle.layer() == self.dpb.layer()
    }

    fn resolve(&self, handle: PicHandle) -> Result<&'a PictureData, DpbError> {
        match self.base {
            Some(base) if !self.is_own(handle) => base.picture(handle),
            _ => self.dpb.picture(handle),
        }
    }

    fn aliases(&self, handle: PicHandle) -> Option<Combined> {
        self.resolve(handle).ok().and_then(|p| p.aliases()).copied()
    }

    /// The frame view of `fs` if it satisfies `usable`.
    fn frame_of(
        &self,
        fs: &FrameStore,
        usable: impl Fn(&PictureData) -> bool,
    ) -> Option<(PicHandle, &'a PictureData)> {
        let handle = fs.handle(Field::Frame)?;
        let pic = self.dpb.picture(handle).ok()?;

        usable(pic).then_some((handle, pic))
    }

    fn excluded_from_b(&self, pic: &PictureData) -> bool {
        // When pic_order_cnt_type is equal to 0, reference pictures that are
        // marked as "non-existing" as specified in clause 8.2.5.2 are not
        // included in either RefPicList0 or RefPicList1.
        self.pic_order_cnt_type == 0 && pic.nonexisting
    }

    /// 8.2.4.2.1 Initialization process for the reference picture list for P
    /// and SP slices in frames
    fn build_ref_pic_list_p(&self) -> Vec<PicHandle> {
        let mut short_term: PicList = self
            .dpb
            .short_term_refs()
            .filter_map(|fs| self.frame_of(fs, PictureData::is_short_term_ref))
            .collect();
        sort_pic_num_descending(&mut short_term);

        let mut long_term: PicList = self
            .dpb
            .long_term_refs()
            .filter_map(|fs| self.frame_of(fs, PictureData::is_long_term_ref))
            .collect();
        sort_long_term_pic_num_ascending(&mut long_term);

        short_term.append(&mut long_term);
        handles(short_term)
    }

    /// 8.2.4.2.2 Initialization process for the reference picture list for P
    /// and SP slices in fields
    fn build_ref_field_pic_list_p(&self) -> Vec<PicHandle> {
        let field = self.slice.field;

        let mut short_term: Vec<_> = self.dpb.short_term_refs().collect();
        sort_frame_num_wrap_descending(&mut short_term);

        let mut long_term: Vec<_> = self.dpb.long_term_refs().collect();
        sort_long_term_frame_idx_ascending(&mut long_term);

        let mut list =
            gen_pic_list_from_frame_list(self.dpb, field, &short_term, PictureData::is_short_term_ref);
        list.extend(gen_pic_list_from_frame_list(
            self.dpb,
            field,
            &long_term,
            PictureData::is_long_term_ref,
        ));

        list
    }

    // 8.2.4.2.3 Initialization process for reference picture lists for B slices
    // in frames
    fn build_ref_pic_list_b(&self) -> (Vec<PicHandle>, Vec<PicHandle>) {
        let cur_poc = self.slice.pic_order_cnt;

        let short_term: PicList = self
            .dpb
            .short_term_refs()
            .filter_map(|fs| self.frame_of(fs, PictureData::is_short_term_ref))
            .filter(|(_, p)| !self.excluded_from_b(p))
            .collect();

        // [0]: short term pictures with POC <= current, sorted by descending POC.
        // [1]: short term pictures with POC > current, sorted by ascending POC.
        let (mut before, mut after): (PicList, PicList) = short_term
            .into_iter()
            .partition(|(_, p)| p.pic_order_cnt <= cur_poc);
        sort_poc_descending(&mut before);
        sort_poc_ascending(&mut after);

        let mut long_term: PicList = self
            .dpb
            .long_term_refs()
            .filter_map(|fs| self.frame_of(fs, PictureData::is_long_term_ref))
            .filter(|(_, p)| !self.excluded_from_b(p))
            .collect();
        sort_long_term_pic_num_ascending(&mut long_term);

        let before = handles(before);
        let after = handles(after);
        let long_term = handles(long_term);

        let b0 = [&before[..], &after[..], &long_term[..]].concat();
        let mut b1 = [&after[..], &before[..], &long_term[..]].concat();

        swap_b1_if_needed(&b0, &mut b1);

        (b0, b1)
    }

    /// 8.2.4.2.4 Initialization process for reference picture lists for B
    /// slices in fields
    fn build_ref_field_pic_list_b(&self) -> (Vec<PicHandle>, Vec<PicHandle>) {
        let cur_poc = self.slice.pic_order_cnt;
        let field = self.slice.field;

        let (mut before, mut after): (Vec<_>, Vec<_>) = self
            .dpb
            .short_term_refs()
            .filter(|fs| fs.is_used != 0)
            .partition(|fs| fs.poc <= cur_poc);
        sort_fs_poc_descending(&mut before);
        sort_fs_poc_ascending(&mut after);

        let list_0_short_term = [&before[..], &after[..]].concat();
        let list_1_short_term = [&after[..], &before[..]].concat();

        let mut long_term: Vec<_> = self.dpb.long_term_refs().collect();
        sort_long_term_frame_idx_ascending(&mut long_term);

        let short_usable = |p: &PictureData| p.is_short_term_ref() && !self.excluded_from_b(p);
        let long_usable = |p: &PictureData| p.is_long_term_ref() && !self.excluded_from_b(p);

        let long_term = gen_pic_list_from_frame_list(self.dpb, field, &long_term, long_usable);

        let mut b0 = gen_pic_list_from_frame_list(self.dpb, field, &list_0_short_term, short_usable);
        b0.extend_from_slice(&long_term);
        let mut b1 = gen_pic_list_from_frame_list(self.dpb, field, &list_1_short_term, short_usable);
        b1.extend_from_slice(&long_term);

        swap_b1_if_needed(&b0, &mut b1);

        (b0, b1)
    }

    /// The pictures of the base view usable for inter-view prediction in `list`, H.8.2.1.
    fn inter_view_candidates(&self, list: usize) -> Vec<PicHandle> {
        let Some(fs) = self.base.and_then(|base| base.inter_view_store()) else {
            return vec![];
        };

        let field = self.slice.field;
        let flagged = match field {
            Field::Frame => fs.inter_view_flag[0] && fs.inter_view_flag[1],
            Field::Top => fs.inter_view_flag[0],
            Field::Bottom => fs.inter_view_flag[1],
        };

        self.ref_views[list]
            .iter()
            .filter_map(|&view_id| {
                let handle = fs.handle(field)?;
                let pic = self.resolve(handle).ok()?;

                (flagged
                    && fs.view_id == view_id
                    && pic.pic_order_cnt == self.slice.pic_order_cnt)
                    .then_some(handle)
            })
            .collect()
    }

    fn find_short_term(&self, pic_num: i32) -> Option<PicHandle> {
        let views: &[Field] = match self.slice.field {
            Field::Frame => &[Field::Frame],
            _ => &[Field::Top, Field::Bottom],
        };

        self.dpb.short_term_refs().find_map(|fs| {
            views.iter().find_map(|&view| {
                let handle = fs.handle(view)?;
                let pic = self.dpb.picture(handle).ok()?;

                (pic.is_short_term_ref() && pic.pic_num == pic_num).then_some(handle)
            })
        })
    }

    fn find_long_term(&self, long_term_pic_num: i32) -> Option<PicHandle> {
        let views: &[Field] = match self.slice.field {
            Field::Frame => &[Field::Frame],
            _ => &[Field::Top, Field::Bottom],
        };

        self.dpb.long_term_refs().find_map(|fs| {
            views.iter().find_map(|&view| {
                let handle = fs.handle(view)?;
                let pic = self.dpb.picture(handle).ok()?;

                (pic.is_long_term_ref() && pic.long_term_pic_num == long_term_pic_num)
                    .then_some(handle)
            })
        })
    }

    /// Places `handle` at `ref_idx` and removes its later duplicates, as per 8-37 and 8-38.
    fn splice(
        list: &mut Vec<Option<PicHandle>>,
        ref_idx: &mut usize,
        num_active: usize,
        handle: PicHandle,
        is_duplicate: impl Fn(PicHandle) -> bool,
    ) {
        list.insert(*ref_idx, Some(handle));
        *ref_idx += 1;

        let tail = list
            .drain(*ref_idx..)
            .filter(|entry| !entry.is_some_and(&is_duplicate))
            .collect::<Vec<_>>();
        list.extend(tail);
        list.resize(num_active + 1, None);
    }

    /// 8.2.4.3 Modification process for reference picture lists
    fn modify_ref_pic_list(
        &self,
        list: usize,
        entries: &mut Vec<Option<PicHandle>>,
        inter_view: &[PicHandle],
    ) -> Result<(), DpbError> {
        let Some(modifications) = self.slice.ref_pic_list_modification(list) else {
            return Ok(());
        };

        let num_active = self.slice.num_ref_idx_active(list);
        let max_frame_num = self.dpb.max_frame_num();
        let frame_num = i32::from(self.slice.frame_num);
        let (max_pic_num, curr_pic_num) = match self.slice.field {
            Field::Frame => (max_frame_num, frame_num),
            _ => (2 * max_frame_num, 2 * frame_num + 1),
        };

        let mut pic_num_lx_pred = curr_pic_num;
        let mut pic_view_idx_lx_pred = -1;
        let mut ref_idx = 0;

        entries.resize(num_active + 1, None);

        for modification in modifications {
            let idc = modification.modification_of_pic_nums_idc;
            if idc != 3 && ref_idx >= num_active {
                return Err(DpbError::TooManyModifications { list, num_active });
            }

            match idc {
                0 | 1 => {
                    let abs_diff_pic_num = modification.abs_diff_pic_num_minus1 as i32 + 1;

                    let pic_num_lx_no_wrap = if idc == 0 {
                        let no_wrap = pic_num_lx_pred - abs_diff_pic_num;
                        if no_wrap < 0 {
                            no_wrap + max_pic_num
                        } else {
                            no_wrap
                        }
                    } else {
                        let no_wrap = pic_num_lx_pred + abs_diff_pic_num;
                        if no_wrap >= max_pic_num {
                            no_wrap - max_pic_num
                        } else {
                            no_wrap
                        }
                    };

                    pic_num_lx_pred = pic_num_lx_no_wrap;

                    let pic_num_lx = if pic_num_lx_no_wrap > curr_pic_num {
                        pic_num_lx_no_wrap - max_pic_num
                    } else {
                        pic_num_lx_no_wrap
                    };

                    let handle = self
                        .find_short_term(pic_num_lx)
                        .ok_or(DpbError::NoShortTermPic(pic_num_lx))?;
                    debug!("RefPicList{}[{}] = PicNum {}", list, ref_idx, pic_num_lx);

                    Self::splice(entries, &mut ref_idx, num_active, handle, |h| {
                        self.is_own(h)
                            && self
                                .dpb
                                .picture(h)
                                .is_ok_and(|p| p.is_short_term_ref() && p.pic_num == pic_num_lx)
                    });
                }
                2 => {
                    let long_term_pic_num = modification.long_term_pic_num as i32;

                    let handle = self
                        .find_long_term(long_term_pic_num)
                        .ok_or(DpbError::NoLongTermPic(long_term_pic_num))?;
                    debug!(
                        "RefPicList{}[{}] = LongTermPicNum {}",
                        list, ref_idx, long_term_pic_num
                    );

                    Self::splice(entries, &mut ref_idx, num_active, handle, |h| {
                        self.is_own(h)
                            && self.dpb.picture(h).is_ok_and(|p| {
                                p.is_long_term_ref() && p.long_term_pic_num == long_term_pic_num
                            })
                    });
                }
                3 => break,
                4 | 5 => {
                    let ref_views = self.ref_views[list];
                    let max_view_idx = ref_views.len() as i32;
                    let abs_diff_view_idx = modification.abs_diff_view_idx_minus1 as i32 + 1;

                    let pic_view_idx_lx = if idc == 4 {
                        let idx = pic_view_idx_lx_pred - abs_diff_view_idx;
                        if idx < 0 {
                            idx + max_view_idx
                        } else {
                            idx
                        }
                    } else {
                        let idx = pic_view_idx_lx_pred + abs_diff_view_idx;
                        if idx >= max_view_idx {
                            idx - max_view_idx
                        } else {
                            idx
                        }
                    };

                    pic_view_idx_lx_pred = pic_view_idx_lx;

                    let target_view_id = usize::try_from(pic_view_idx_lx)
                        .ok()
                        .and_then(|idx| ref_views.get(idx))
                        .copied()
                        .ok_or(DpbError::InvalidModificationIdc(idc))?;

                    let handle = inter_view
                        .iter()
                        .copied()
                        .find(|&h| self.resolve(h).is_ok_and(|p| p.view_id == target_view_id))
                        .ok_or(DpbError::NoInterViewPic(target_view_id))?;
                    debug!(
                        "RefPicList{}[{}] = inter-view view_id {}",
                        list, ref_idx, target_view_id
                    );

                    let cur_poc = self.slice.pic_order_cnt;
                    Self::splice(entries, &mut ref_idx, num_active, handle, |h| {
                        !self.is_own(h)
                            && self.resolve(h).is_ok_and(|p| {
                                p.view_id == target_view_id && p.pic_order_cnt == cur_poc
                            })
                    });
                }
                other => return Err(DpbError::InvalidModificationIdc(other)),
            }
        }

        entries.truncate(num_active);

        Ok(())
    }

    fn trace_list(&self, name: &str, list: &[Option<PicHandle>]) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        let entries = list
            .iter()
            .map(|entry| match entry.map(|h| self.resolve(h)) {
                Some(Ok(p)) => format!(
                    "{:?} POC {} PicNum {} LongTermPicNum {} view {}",
                    p.field, p.pic_order_cnt, p.pic_num, p.long_term_pic_num, p.view_id
                ),
                Some(Err(_)) => "stale".into(),
                None => "no reference picture".into(),
            })
            .collect::<Vec<_>>();

        trace!("{}: {:#?}", name, entries);
    }

    /// Builds the initial lists, appends the inter-view references, applies the modifications
    /// signalled by the slice and derives the MBAFF lists.
    pub fn build(&self) -> Result<RefPicLists, DpbError> {
        let slice = self.slice;
        let mut lists = RefPicLists::default();

        if slice.num_ref_idx_active(0) == 0 {
            return Ok(lists);
        }

        let (b0, b1) = match (slice.slice_type.uses_list0_only(), slice.field) {
            (true, Field::Frame) => (self.build_ref_pic_list_p(), vec![]),
            (true, _) => (self.build_ref_field_pic_list_p(), vec![]),
            (false, Field::Frame) => self.build_ref_pic_list_b(),
            (false, _) => self.build_ref_field_pic_list_b(),
        };

        for (list, init) in [b0, b1].into_iter().enumerate() {
            let num_active = slice.num_ref_idx_active(list);
            if num_active == 0 {
                continue;
            }

            let inter_view = self.inter_view_candidates(list);

            let mut entries = init
                .into_iter()
                .chain(inter_view.iter().copied())
                .map(Some)
                .collect::<Vec<_>>();
            entries.truncate(num_active);
            self.trace_list(&format!("initial RefPicList{}", list), &entries);

            self.modify_ref_pic_list(list, &mut entries, &inter_view)?;
            entries.resize(num_active, None);

            if entries[num_active - 1].is_none() {
                if self.non_conforming_stream {
                    warn!(
                        "RefPicList{}[{}] is equal to 'no reference picture'",
                        list,
                        num_active - 1
                    );
                } else {
                    return Err(DpbError::NoReferencePicture {
                        list,
                        idx: num_active - 1,
                    });
                }
            }

            self.trace_list(&format!("RefPicList{}", list), &entries);
            lists.set(list, entries);
        }

        if slice.mbaff_frame {
            lists.derive_mbaff_lists(|h| self.aliases(h));
        }

        Ok(lists)
    }
}

#[cfg(test)]
mod tests {
    use super::RefPicListBuilder;
    use super::RefPicLists;
    use super::MAX_LIST_SIZE;
    use crate::codec::h264::arena::PicHandle;
    use crate::codec::h264::dpb::tests::dpb;
    use crate::codec::h264::dpb::tests::field;
    use crate::codec::h264::dpb::tests::frame;
    use crate::codec::h264::dpb::tests::idr;
    use crate::codec::h264::dpb::tests::PocSink;
    use crate::codec::h264::dpb::Dpb;
    use crate::codec::h264::dpb::DpbError;
    use crate::codec::h264::picture::Field;
    use crate::codec::h264::picture::Reference;
    use crate::codec::h264::picture::PictureData;
    use crate::codec::h264::slice::RefPicListModification;
    use crate::codec::h264::slice::RefPicMarkingInner;
    use crate::codec::h264::slice::SliceHeader;
    use crate::codec::h264::slice::SliceType;

    fn slice(slice_type: SliceType, field: Field, frame_num: u16, poc: i32, active: [u8; 2]) -> SliceHeader {
        SliceHeader {
            slice_type,
            field,
            frame_num,
            pic_order_cnt: poc,
            num_ref_idx_l0_active_minus1: active[0] - 1,
            num_ref_idx_l1_active_minus1: active[1] - 1,
            ..Default::default()
        }
    }

    fn build(dpb: &mut Dpb, slice: &SliceHeader) -> Result<RefPicLists, DpbError> {
        dpb.update_pic_nums(slice.field, i32::from(slice.frame_num));
        RefPicListBuilder::new(dpb, slice).build()
    }

    fn pocs(dpb: &Dpb, list: &[Option<PicHandle>]) -> Vec<i32> {
        list.iter()
            .map(|h| dpb.picture(h.unwrap()).unwrap().pic_order_cnt)
            .collect()
    }

    fn frame_nums(dpb: &Dpb, list: &[Option<PicHandle>]) -> Vec<i32> {
        list.iter()
            .map(|h| dpb.picture(h.unwrap()).unwrap().frame_num)
            .collect()
    }

    /// A DPB holding the frames `(frame_num, poc)`, all short-term references.
    fn dpb_with_frames(frames: &[(i32, i32)]) -> Dpb {
        let mut sink = PocSink::default();
        let mut dpb = dpb(8, 8);

        dpb.store_picture(idr(frames[0].1), &mut sink).unwrap();
        for &(frame_num, poc) in &frames[1..] {
            dpb.store_picture(frame(frame_num, poc, Reference::ShortTerm), &mut sink)
                .unwrap();
        }

        dpb
    }

    #[test]
    fn p_frame_list() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(8, 8);

        let mut first = idr(0);
        first.ref_pic_marking.long_term_reference_flag = true;
        dpb.store_picture(first, &mut sink).unwrap();
        for frame_num in 1..4 {
            dpb.store_picture(frame(frame_num, 2 * frame_num, Reference::ShortTerm), &mut sink)
                .unwrap();
        }

        let hdr = slice(SliceType::P, Field::Frame, 4, 8, [4, 1]);
        let lists = build(&mut dpb, &hdr).unwrap();

        assert_eq!(frame_nums(&dpb, lists.list(0)), vec![3, 2, 1, 0]);
        assert_eq!(lists.size(1), 0);
        assert_eq!(lists.padded(0).len(), MAX_LIST_SIZE);
        assert!(lists.padded(0)[4..].iter().all(Option::is_none));

        // Building twice gives the same lists.
        assert_eq!(build(&mut dpb, &hdr).unwrap(), lists);
    }

    #[test]
    fn b_frame_lists() {
        let mut dpb = dpb_with_frames(&[(0, 0), (1, 8), (2, 4), (3, 12)]);

        let hdr = slice(SliceType::B, Field::Frame, 4, 6, [4, 4]);
        let lists = build(&mut dpb, &hdr).unwrap();

        assert_eq!(pocs(&dpb, lists.list(0)), vec![4, 0, 8, 12]);
        assert_eq!(pocs(&dpb, lists.list(1)), vec![8, 12, 4, 0]);
    }

    #[test]
    fn identical_b_lists_are_disambiguated() {
        let mut dpb = dpb_with_frames(&[(0, 0), (1, 4)]);

        let hdr = slice(SliceType::B, Field::Frame, 2, 10, [2, 2]);
        let lists = build(&mut dpb, &hdr).unwrap();

        assert_eq!(pocs(&dpb, lists.list(0)), vec![4, 0]);
        assert_eq!(pocs(&dpb, lists.list(1)), vec![0, 4]);
    }

    #[test]
    fn non_existing_frames_skipped_in_b_lists() {
        let mut dpb = dpb_with_frames(&[(0, 0), (2, 4)]);
        let mut sink = PocSink::default();

        let mut filler = PictureData::new_non_existing(1, 0);
        filler.pic_order_cnt = 2;
        dpb.store_picture(filler, &mut sink).unwrap();

        let hdr = slice(SliceType::B, Field::Frame, 3, 6, [2, 2]);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(pocs(&dpb, lists.list(0)), vec![4, 0]);

        // P lists keep them.
        let hdr = slice(SliceType::P, Field::Frame, 3, 6, [3, 1]);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(frame_nums(&dpb, lists.list(0)), vec![2, 1, 0]);
    }

    #[test]
    fn p_field_lists_alternate_parity() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        for (f, frame_num, poc) in [
            (Field::Top, 0, 0),
            (Field::Bottom, 0, 1),
            (Field::Top, 1, 4),
            (Field::Bottom, 1, 5),
        ] {
            dpb.store_picture(field(f, frame_num, poc, Reference::ShortTerm), &mut sink)
                .unwrap();
        }

        let hdr = slice(SliceType::P, Field::Top, 2, 8, [4, 1]);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(pocs(&dpb, lists.list(0)), vec![4, 5, 0, 1]);

        let hdr = slice(SliceType::P, Field::Bottom, 2, 9, [4, 1]);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(pocs(&dpb, lists.list(0)), vec![5, 4, 1, 0]);
    }

    #[test]
    fn b_field_lists_split_on_poc() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        for (f, frame_num, poc) in [
            (Field::Top, 0, 0),
            (Field::Bottom, 0, 1),
            (Field::Top, 1, 16),
            (Field::Bottom, 1, 17),
            (Field::Top, 2, 8),
            (Field::Bottom, 2, 9),
        ] {
            dpb.store_picture(field(f, frame_num, poc, Reference::ShortTerm), &mut sink)
                .unwrap();
        }

        // Frames at or before the current POC lead list0 in descending order, the later ones
        // lead list1 in ascending order. Fields alternate parity starting with the current one.
        let hdr = slice(SliceType::B, Field::Top, 3, 12, [6, 6]);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(pocs(&dpb, lists.list(0)), vec![8, 9, 0, 1, 16, 17]);
        assert_eq!(pocs(&dpb, lists.list(1)), vec![16, 17, 8, 9, 0, 1]);

        let hdr = slice(SliceType::B, Field::Bottom, 3, 13, [6, 6]);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(pocs(&dpb, lists.list(0)), vec![9, 8, 1, 0, 17, 16]);
        assert_eq!(pocs(&dpb, lists.list(1)), vec![17, 16, 9, 8, 1, 0]);
    }

    #[test]
    fn field_list_skips_unreferenced_fields() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        for (f, frame_num, poc) in [
            (Field::Top, 0, 0),
            (Field::Bottom, 0, 1),
            (Field::Top, 1, 4),
            (Field::Bottom, 1, 5),
        ] {
            dpb.store_picture(field(f, frame_num, poc, Reference::ShortTerm), &mut sink)
                .unwrap();
        }

        // The top field of frame_num 2 unmarks the top field of frame_num 1: CurrPicNum is 5,
        // the same parity field has PicNum 3.
        let mut top = field(Field::Top, 2, 8, Reference::ShortTerm);
        top.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        top.ref_pic_marking.inner = vec![RefPicMarkingInner {
            memory_management_control_operation: 1,
            difference_of_pic_nums_minus1: 1,
            ..Default::default()
        }];
        dpb.store_picture(top, &mut sink).unwrap();

        let hdr = slice(SliceType::P, Field::Bottom, 2, 9, [4, 1]);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(pocs(&dpb, lists.list(0)), vec![5, 8, 1, 0]);
    }

    #[test]
    fn short_term_modification() {
        let mut dpb = dpb_with_frames(&[(0, 0), (1, 2), (2, 4), (3, 6)]);

        let mut hdr = slice(SliceType::P, Field::Frame, 4, 8, [3, 1]);
        hdr.ref_pic_list_modification_flag_l0 = true;
        hdr.ref_pic_list_modification_l0 = vec![
            // PicNum 4 - 4 = 0.
            RefPicListModification {
                modification_of_pic_nums_idc: 0,
                abs_diff_pic_num_minus1: 3,
                ..Default::default()
            },
            // PicNum 0 + 1 = 1.
            RefPicListModification {
                modification_of_pic_nums_idc: 1,
                abs_diff_pic_num_minus1: 0,
                ..Default::default()
            },
            RefPicListModification {
                modification_of_pic_nums_idc: 3,
                ..Default::default()
            },
        ];

        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(frame_nums(&dpb, lists.list(0)), vec![0, 1, 3]);
    }

    #[test]
    fn modification_count_is_bounded() {
        let mut dpb = dpb_with_frames(&[(0, 0), (1, 4)]);

        let mut hdr = slice(SliceType::P, Field::Frame, 2, 8, [1, 1]);
        hdr.ref_pic_list_modification_flag_l0 = true;
        hdr.ref_pic_list_modification_l0 = [0, 0, 1, 0]
            .into_iter()
            .map(|idc| RefPicListModification {
                modification_of_pic_nums_idc: idc,
                abs_diff_pic_num_minus1: 0,
                ..Default::default()
            })
            .collect();

        assert!(matches!(
            build(&mut dpb, &hdr),
            Err(DpbError::TooManyModifications {
                list: 0,
                num_active: 1
            })
        ));

        // A single modification fits the one active entry.
        hdr.ref_pic_list_modification_l0.truncate(1);
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(frame_nums(&dpb, lists.list(0)), vec![1]);
    }

    #[test]
    fn modification_removes_duplicates() {
        let mut dpb = dpb_with_frames(&[(0, 0), (1, 2), (2, 4), (3, 6)]);

        let mut hdr = slice(SliceType::P, Field::Frame, 4, 8, [3, 1]);
        hdr.ref_pic_list_modification_flag_l0 = true;
        hdr.ref_pic_list_modification_l0 = vec![RefPicListModification {
            modification_of_pic_nums_idc: 0,
            abs_diff_pic_num_minus1: 1,
            ..Default::default()
        }];

        // PicNum 2 moves to the front, its original position is dropped.
        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(frame_nums(&dpb, lists.list(0)), vec![2, 3, 1]);
    }

    #[test]
    fn long_term_modification() {
        let mut sink = PocSink::default();
        let mut dpb = dpb(4, 4);

        let mut first = idr(0);
        first.ref_pic_marking.long_term_reference_flag = true;
        dpb.store_picture(first, &mut sink).unwrap();
        dpb.store_picture(frame(1, 2, Reference::ShortTerm), &mut sink)
            .unwrap();
        dpb.store_picture(frame(2, 4, Reference::ShortTerm), &mut sink)
            .unwrap();

        let mut hdr = slice(SliceType::P, Field::Frame, 3, 6, [3, 1]);
        hdr.ref_pic_list_modification_flag_l0 = true;
        hdr.ref_pic_list_modification_l0 = vec![RefPicListModification {
            modification_of_pic_nums_idc: 2,
            long_term_pic_num: 0,
            ..Default::default()
        }];

        let lists = build(&mut dpb, &hdr).unwrap();
        assert_eq!(frame_nums(&dpb, lists.list(0)), vec![0, 2, 1]);

        hdr.ref_pic_list_modification_l0[0].long_term_pic_num = 5;
        assert!(matches!(
            build(&mut dpb, &hdr),
            Err(DpbError::NoLongTermPic(5))
        ));

        hdr.ref_pic_list_modification_l0[0].modification_of_pic_nums_idc = 6;
        assert!(matches!(
            build(&mut dpb, &hdr),
            Err(DpbError::InvalidModificationIdc(6))
        ));
    }

    #[test]
    fn missing_reference_at_end_of_list() {
        let mut dpb = dpb_with_frames(&[(0, 0)]);

        let hdr = slice(SliceType::P, Field::Frame, 1, 2, [2, 1]);
        assert!(matches!(
            build(&mut dpb, &hdr),
            Err(DpbError::NoReferencePicture { list: 0, idx: 1 })
        ));

        dpb.update_pic_nums(Field::Frame, 1);
        let lists = RefPicListBuilder::new(&dpb, &hdr)
            .non_conforming_stream(true)
            .build()
            .unwrap();
        assert_eq!(lists.size(0), 2);
        assert!(lists.get(0, 0).is_ok());
        assert!(matches!(
            lists.get(0, 1),
            Err(DpbError::NoReferencePicture { list: 0, idx: 1 })
        ));
    }

    #[test]
    fn mbaff_field_lists() {
        let mut dpb = dpb_with_frames(&[(0, 0), (1, 2)]);

        let mut hdr = slice(SliceType::P, Field::Frame, 2, 4, [2, 1]);
        hdr.mbaff_frame = true;
        let lists = build(&mut dpb, &hdr).unwrap();

        assert_eq!(lists.size(2), 4);
        assert_eq!(lists.size(4), 4);
        assert_eq!(lists.size(3), 0);

        let structure = |list: usize| {
            lists
                .list(list)
                .iter()
                .map(|h| {
                    let p = dpb.picture(h.unwrap()).unwrap();
                    (p.frame_num, p.field)
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(
            structure(2),
            vec![
                (1, Field::Top),
                (1, Field::Bottom),
                (0, Field::Top),
                (0, Field::Bottom)
            ]
        );
        assert_eq!(
            structure(4),
            vec![
                (1, Field::Bottom),
                (1, Field::Top),
                (0, Field::Bottom),
                (0, Field::Top)
            ]
        );
    }

    #[test]
    fn inter_view_reference() {
        let mut sink = PocSink::default();

        let mut base = Dpb::new(0);
        base.set_limits(2, 1, 16).unwrap();
        base.set_inter_view_registry(true);
        let mut base_pic = idr(0);
        base_pic.inter_view_flag = true;
        base.store_picture(base_pic, &mut sink).unwrap();

        let mut non_base = Dpb::new(1);
        non_base.set_limits(2, 1, 16).unwrap();
        let mut prev = idr(-4);
        prev.view_id = 1;
        non_base.store_picture(prev, &mut sink).unwrap();

        let mut hdr = slice(SliceType::P, Field::Frame, 1, 0, [2, 1]);
        hdr.view_id = 1;
        non_base.update_pic_nums(Field::Frame, 1);

        let ref_views: [&[u16]; 2] = [&[0], &[]];
        let lists = RefPicListBuilder::new(&non_base, &hdr)
            .inter_view(&base, ref_views)
            .build()
            .unwrap();
        assert_eq!(lists.get(0, 0).unwrap().layer(), 1);
        assert_eq!(lists.get(0, 1).unwrap().layer(), 0);

        // Move the inter-view reference to the front.
        hdr.ref_pic_list_modification_flag_l0 = true;
        hdr.ref_pic_list_modification_l0 = vec![RefPicListModification {
            modification_of_pic_nums_idc: 5,
            abs_diff_view_idx_minus1: 0,
            ..Default::default()
        }];
        let lists = RefPicListBuilder::new(&non_base, &hdr)
            .inter_view(&base, ref_views)
            .build()
            .unwrap();
        let first = lists.get(0, 0).unwrap();
        assert_eq!(first.layer(), 0);
        assert_eq!(base.picture(first).unwrap().view_id, 0);
        assert_eq!(lists.get(0, 1).unwrap().layer(), 1);
    }
}
