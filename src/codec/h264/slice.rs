// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The slice header fields that drive reference marking and reference list construction.

use enumn::N;

use crate::codec::h264::picture::Field;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6 in the specification.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6 in the specification.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is a SP slice. See table 7-6 in the specification.
    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    /// Whether slices of this type use reference list 0 only.
    pub fn uses_list0_only(&self) -> bool {
        self.is_p() || self.is_sp()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
    /* if modification_of_pic_nums_idc == 4 || 5 */
    pub abs_diff_view_idx_minus1: u32,
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer
/// with a special value indicating "no long-term frame indices". This type allows easy conversion
/// between the actual and "plus1" representation, while ensuring that the special value is always
/// handled by the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Whether `long_term_frame_idx` is beyond the allowed maximum.
    pub fn excludes(self, long_term_frame_idx: u32) -> bool {
        match self {
            Self::NoLongTermFrameIndices => true,
            Self::Idx(max) => long_term_frame_idx > max,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Specifies a control operation to be applied to affect the reference
    /// picture marking. The values and control operations associated with
    /// `memory_management_control_operation` are specified in Table 7-9.
    pub memory_management_control_operation: u8,

    /// Used (with memory_management_control_operation equal to 3 or 1) to
    /// assign a long-term frame index to a short-term reference picture or to
    /// mark a short-term reference picture as "unused for reference".
    pub difference_of_pic_nums_minus1: u32,

    /// Used (with memory_management_control_operation equal to 2) to mark a
    /// long-term reference picture as "unused for reference".
    pub long_term_pic_num: u32,

    /// Used (with memory_management_control_operation equal to 3 or 6) to
    /// assign a long-term frame index to a picture.
    pub long_term_frame_idx: u32,

    /// Specifies the maximum value of long-term frame index allowed for
    /// long-term reference pictures (until receipt of another value of
    /// `max_long_term_frame_idx_plus1`).
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// If unset, the IDR picture is marked as "used for short-term reference" and
    /// MaxLongTermFrameIdx becomes "no long-term frame indices". If set, the IDR picture is
    /// marked "used for long-term reference" with LongTermFrameIdx 0 and MaxLongTermFrameIdx
    /// becomes 0.
    pub long_term_reference_flag: bool,

    /// Selects the reference picture marking mode of the currently decoded
    /// picture as specified in Table 7-8.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// The memory management control operations, in bitstream order.
    pub inner: Vec<RefPicMarkingInner>,
}

/// The subset of a slice header needed to build the reference lists of that slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub slice_type: SliceType,
    pub frame_num: u16,
    /// Structure of the picture the slice belongs to.
    pub field: Field,
    /// Whether the picture is an MBAFF frame, i.e. `mb_adaptive_frame_field_flag && !field_pic_flag`.
    pub mbaff_frame: bool,
    /// POC of the current picture: the field POC for fields, the frame POC for frames.
    pub pic_order_cnt: i32,

    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    /// View of the picture. Zero for streams without the multi-view extension.
    pub view_id: u16,
    pub anchor_pic_flag: bool,
}

impl SliceHeader {
    /// `num_ref_idx_active` of `list`, zero where the slice type does not use the list.
    pub fn num_ref_idx_active(&self, list: usize) -> usize {
        match (list, self.slice_type) {
            (0, SliceType::P | SliceType::Sp | SliceType::B) => {
                usize::from(self.num_ref_idx_l0_active_minus1) + 1
            }
            (1, SliceType::B) => usize::from(self.num_ref_idx_l1_active_minus1) + 1,
            _ => 0,
        }
    }

    pub fn ref_pic_list_modification(&self, list: usize) -> Option<&[RefPicListModification]> {
        match list {
            0 if self.ref_pic_list_modification_flag_l0 => Some(&self.ref_pic_list_modification_l0),
            1 if self.ref_pic_list_modification_flag_l1 => Some(&self.ref_pic_list_modification_l1),
            _ => None,
        }
    }
}
