// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sequence-level constants consumed by the DPB.
//!
//! These are the values a parameter-set parser extracts from an SPS (and, for multi-view streams,
//! from the subset SPS MVC extension). Only what the buffer and reference management needs is
//! kept here.

use enumn::N;

use crate::codec::h264::dpb::DpbError;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

impl Rect<u32> {
    pub fn width(&self) -> u32 {
        self.max.x.saturating_sub(self.min.x)
    }

    pub fn height(&self) -> u32 {
        self.max.y.saturating_sub(self.min.y)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
    High444P = 244,
    MultiviewHigh = 118,
    StereoHigh = 128,
}

impl Profile {
    /// Whether this is one of the FRExt profiles, for which `constraint_set3_flag` does not
    /// signal level 1b.
    pub fn is_frext(&self) -> bool {
        !matches!(self, Profile::Baseline | Profile::Main | Profile::Extended)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

impl Level {
    /// MaxDpbMbs, Table A.1.
    pub fn max_dpb_mbs(&self) -> u32 {
        match self {
            Level::L1 | Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        }
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl ChromaFormat {
    /// Returns `SubWidthC` and `SubHeightC`, or `None` for monochrome content.
    pub fn subsampling(&self) -> Option<(u32, u32)> {
        match self {
            ChromaFormat::Monochrome => None,
            ChromaFormat::Yuv420 => Some((2, 2)),
            ChromaFormat::Yuv422 => Some((2, 1)),
            ChromaFormat::Yuv444 => Some((1, 1)),
        }
    }
}

/// `frame_crop_*_offset` values, in crop units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCropping {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// The VUI bitstream restriction fields that affect buffering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitstreamRestriction {
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// Inter-view dependencies of one view, from the SPS MVC extension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewDependency {
    pub view_id: u16,
    /// `anchor_ref_l0` and `anchor_ref_l1`.
    pub anchor_refs: [Vec<u16>; 2],
    /// `non_anchor_ref_l0` and `non_anchor_ref_l1`.
    pub non_anchor_refs: [Vec<u16>; 2],
}

impl ViewDependency {
    /// The reference views usable by list `list` of a picture of this view.
    pub fn ref_views(&self, anchor_pic: bool, list: usize) -> &[u16] {
        if anchor_pic {
            &self.anchor_refs[list]
        } else {
            &self.non_anchor_refs[list]
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcParams {
    /// Views in view order index order. The first entry is the base view.
    pub views: Vec<ViewDependency>,
}

impl MvcParams {
    pub fn view(&self, view_id: u16) -> Option<&ViewDependency> {
        self.views.iter().find(|v| v.view_id == view_id)
    }

    pub fn base_view_id(&self) -> u16 {
        self.views.first().map(|v| v.view_id).unwrap_or(0)
    }
}

/// The sequence parameters that drive DPB sizing and reference management.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceParams {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub constraint_set3_flag: bool,

    pub chroma_format: ChromaFormat,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub frame_cropping: Option<FrameCropping>,

    pub max_num_ref_frames: u32,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub bitstream_restriction: Option<BitstreamRestriction>,
    pub mvc: Option<MvcParams>,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            profile_idc: Profile::High as u8,
            level_idc: Level::L4 as u8,
            constraint_set3_flag: false,
            chroma_format: ChromaFormat::Yuv420,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            frame_cropping: None,
            max_num_ref_frames: 1,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            gaps_in_frame_num_value_allowed_flag: false,
            bitstream_restriction: None,
            mvc: None,
        }
    }
}

impl SequenceParams {
    /// Same as MaxFrameNum. See 7-10 in the specification.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn pic_width_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs_minus1 + 1
    }

    /// FrameHeightInMbs, 7-18.
    pub fn frame_height_in_mbs(&self) -> u32 {
        (2 - u32::from(self.frame_mbs_only_flag)) * (self.pic_height_in_map_units_minus1 + 1)
    }

    pub fn width(&self) -> u32 {
        self.pic_width_in_mbs() * 16
    }

    pub fn height(&self) -> u32 {
        self.frame_height_in_mbs() * 16
    }

    /// Returns `CropUnitX` and `CropUnitY`, 7-19 through 7-22.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        let frame_mbs_only = u32::from(self.frame_mbs_only_flag);

        match self.chroma_format.subsampling() {
            None => (1, 2 - frame_mbs_only),
            Some((sub_width_c, sub_height_c)) => (sub_width_c, sub_height_c * (2 - frame_mbs_only)),
        }
    }

    pub fn visible_rectangle(&self) -> Rect<u32> {
        let crop = match self.frame_cropping {
            None => {
                return Rect {
                    min: Point { x: 0, y: 0 },
                    max: Point {
                        x: self.width(),
                        y: self.height(),
                    },
                }
            }
            Some(crop) => crop,
        };

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        Rect {
            min: Point {
                x: crop_unit_x * crop.left,
                y: crop_unit_y * crop.top,
            },
            max: Point {
                x: self.width().saturating_sub(crop_unit_x * crop.right),
                y: self.height().saturating_sub(crop_unit_y * crop.bottom),
            },
        }
    }

    /// The level in effect, resolving the level 1b signalling of A.3.1 and A.3.2.
    pub fn level(&self) -> Result<Level, DpbError> {
        let level = Level::n(self.level_idc).ok_or(DpbError::UndefinedLevel(self.level_idc))?;
        let frext = Profile::n(self.profile_idc)
            .map(|p| p.is_frext())
            .unwrap_or(true);

        if level == Level::L1_1 && !frext && self.constraint_set3_flag {
            Ok(Level::L1B)
        } else {
            Ok(level)
        }
    }

    /// Number of frame buffers the DPB needs for this sequence, before any configured headroom.
    pub fn max_dpb_frames(&self) -> Result<usize, DpbError> {
        let max_dpb_mbs = self.level()?.max_dpb_mbs();
        let frame_mbs = self.pic_width_in_mbs() * self.frame_height_in_mbs();

        let mut size = std::cmp::min((max_dpb_mbs / frame_mbs) as usize, DPB_MAX_SIZE);

        if let Some(restriction) = &self.bitstream_restriction {
            let max_dec_frame_buffering = restriction.max_dec_frame_buffering as usize;
            if max_dec_frame_buffering > size {
                return Err(DpbError::MaxDecFrameBufferingTooLarge {
                    max_dec_frame_buffering,
                    max_dpb_frames: size,
                });
            }

            size = std::cmp::max(1, max_dec_frame_buffering);
        }

        Ok(size)
    }

    /// The view layer a picture of `view_id` is buffered in: 0 for the base view, 1 otherwise.
    pub fn layer_of(&self, view_id: u16) -> u8 {
        match &self.mvc {
            Some(mvc) if mvc.base_view_id() != view_id => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BitstreamRestriction;
    use super::FrameCropping;
    use super::Level;
    use super::Profile;
    use super::SequenceParams;
    use crate::codec::h264::dpb::DpbError;

    fn sps_1080p(level: Level) -> SequenceParams {
        SequenceParams {
            level_idc: level as u8,
            pic_width_in_mbs_minus1: 119,
            pic_height_in_map_units_minus1: 67,
            max_num_ref_frames: 4,
            ..Default::default()
        }
    }

    #[test]
    fn dpb_size_from_level() {
        // 32768 / (120 * 68) = 4.
        assert_eq!(sps_1080p(Level::L4).max_dpb_frames().unwrap(), 4);
        // 184320 / 8160 = 22, capped.
        assert_eq!(sps_1080p(Level::L5_1).max_dpb_frames().unwrap(), 16);
    }

    #[test]
    fn dpb_size_from_vui() {
        let mut sps = sps_1080p(Level::L5_1);
        sps.bitstream_restriction = Some(BitstreamRestriction {
            max_num_reorder_frames: 0,
            max_dec_frame_buffering: 0,
        });
        assert_eq!(sps.max_dpb_frames().unwrap(), 1);

        sps.level_idc = Level::L4 as u8;
        sps.bitstream_restriction = Some(BitstreamRestriction {
            max_num_reorder_frames: 2,
            max_dec_frame_buffering: 5,
        });
        assert!(matches!(
            sps.max_dpb_frames(),
            Err(DpbError::MaxDecFrameBufferingTooLarge { .. })
        ));
    }

    #[test]
    fn level_1b() {
        let mut sps = SequenceParams {
            profile_idc: Profile::Baseline as u8,
            level_idc: Level::L1_1 as u8,
            constraint_set3_flag: true,
            ..Default::default()
        };
        assert_eq!(sps.level().unwrap(), Level::L1B);

        sps.profile_idc = Profile::High as u8;
        assert_eq!(sps.level().unwrap(), Level::L1_1);

        sps.level_idc = 7;
        assert!(matches!(sps.level(), Err(DpbError::UndefinedLevel(7))));
    }

    #[test]
    fn cropped_rectangle() {
        let mut sps = sps_1080p(Level::L4);
        sps.frame_cropping = Some(FrameCropping {
            bottom: 4,
            ..Default::default()
        });

        let rect = sps.visible_rectangle();
        assert_eq!(rect.width(), 1920);
        assert_eq!(rect.height(), 1080);
    }
}
