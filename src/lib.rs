// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded picture buffer and reference picture management for H.264, including the multi-view
//! extension.
//!
//! The [`decoder::Session`] type is the entry point: it sizes one DPB per view from the active
//! sequence, stores decoded pictures, builds the reference picture lists of each slice and hands
//! pictures to an [`codec::h264::output::OutputSink`] in output order.

pub mod codec;
pub mod decoder;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}

/// Returns the size required to store a frame of `format` with size `width`x`height`, without any
/// padding.
pub fn decoded_frame_size(format: DecodedFormat, width: usize, height: usize) -> usize {
    match format {
        DecodedFormat::I420 | DecodedFormat::NV12 => {
            let y_size = width * height;
            // U and V planes need to be aligned to 2.
            let uv_size = width.div_ceil(2) * height.div_ceil(2) * 2;

            y_size + uv_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::decoded_frame_size;
    use super::DecodedFormat;

    #[test]
    fn odd_sizes_round_chroma_up() {
        assert_eq!(decoded_frame_size(DecodedFormat::I420, 4, 2), 8 + 4);
        assert_eq!(decoded_frame_size(DecodedFormat::NV12, 3, 3), 9 + 8);
    }

    #[test]
    fn parse_format() {
        assert_eq!("nv12".parse::<DecodedFormat>(), Ok(DecodedFormat::NV12));
        assert_eq!("I420".parse::<DecodedFormat>(), Ok(DecodedFormat::I420));
        assert!("yuyv".parse::<DecodedFormat>().is_err());
    }
}
