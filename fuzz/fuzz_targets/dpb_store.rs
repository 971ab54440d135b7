#![no_main]

use cros_dpb::codec::h264::output::OutputFrame;
use cros_dpb::codec::h264::params::SequenceParams;
use cros_dpb::codec::h264::picture::Field;
use cros_dpb::codec::h264::picture::IsIdr;
use cros_dpb::codec::h264::picture::PictureData;
use cros_dpb::codec::h264::picture::Reference;
use cros_dpb::codec::h264::slice::MaxLongTermFrameIdx;
use cros_dpb::codec::h264::slice::RefPicListModification;
use cros_dpb::codec::h264::slice::RefPicMarkingInner;
use cros_dpb::codec::h264::slice::SliceHeader;
use cros_dpb::codec::h264::slice::SliceType;
use cros_dpb::decoder::DpbConfig;
use cros_dpb::decoder::Session;
use libfuzzer_sys::fuzz_target;

const FIELDS: [Field; 3] = [Field::Frame, Field::Top, Field::Bottom];

fn field(b: u8) -> Field {
    FIELDS[usize::from(b) % FIELDS.len()]
}

fn picture(chunk: &[u8]) -> PictureData {
    let mut pic = PictureData::default();
    pic.field = field(chunk[1]);
    pic.frame_num = i32::from(chunk[2] & 0xf);
    pic.pic_order_cnt = i32::from(chunk[3] as i8);
    pic.top_field_order_cnt = pic.pic_order_cnt;
    pic.bottom_field_order_cnt = pic.pic_order_cnt + i32::from(chunk[4] & 1);
    pic.pic_num = pic.frame_num;
    pic.set_reference(match chunk[4] >> 1 & 3 {
        0 => Reference::None,
        3 => Reference::LongTerm,
        _ => Reference::ShortTerm,
    });

    if chunk[4] & 0x80 != 0 {
        pic.is_idr = IsIdr::Yes { idr_pic_id: 0 };
        pic.ref_pic_marking.no_output_of_prior_pics_flag = chunk[5] & 1 != 0;
        pic.ref_pic_marking.long_term_reference_flag = chunk[5] & 2 != 0;
    } else if chunk[5] != 0 {
        pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        pic.ref_pic_marking.inner = chunk[5..]
            .chunks(2)
            .map(|op| RefPicMarkingInner {
                memory_management_control_operation: op[0] % 7,
                difference_of_pic_nums_minus1: u32::from(op.get(1).copied().unwrap_or(0) & 0xf),
                long_term_pic_num: u32::from(op.get(1).copied().unwrap_or(0) & 0xf),
                long_term_frame_idx: u32::from(op.get(1).copied().unwrap_or(0) >> 4 & 3),
                max_long_term_frame_idx: MaxLongTermFrameIdx::from_value_plus1(u32::from(
                    op.get(1).copied().unwrap_or(0) & 3,
                )),
            })
            .collect();
    }

    pic
}

fn slice(chunk: &[u8]) -> SliceHeader {
    let modifications = chunk[4..]
        .chunks(2)
        .map(|m| RefPicListModification {
            modification_of_pic_nums_idc: m[0] % 4,
            abs_diff_pic_num_minus1: u32::from(m.get(1).copied().unwrap_or(0) & 0xf),
            long_term_pic_num: u32::from(m.get(1).copied().unwrap_or(0) & 0xf),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    SliceHeader {
        slice_type: if chunk[1] & 1 == 0 { SliceType::P } else { SliceType::B },
        field: field(chunk[1] >> 1),
        mbaff_frame: chunk[1] & 0x80 != 0,
        frame_num: u16::from(chunk[2] & 0xf),
        pic_order_cnt: i32::from(chunk[3] as i8),
        num_ref_idx_l0_active_minus1: chunk[1] >> 3 & 7,
        num_ref_idx_l1_active_minus1: chunk[1] >> 4 & 3,
        ref_pic_list_modification_flag_l0: !modifications.is_empty(),
        ref_pic_list_modification_l0: modifications,
        ..Default::default()
    }
}

fuzz_target!(|data: &[u8]| {
    let Some((&refs, commands)) = data.split_first() else {
        return;
    };

    let sps = SequenceParams {
        max_num_ref_frames: u32::from(refs % 5),
        frame_mbs_only_flag: false,
        gaps_in_frame_num_value_allowed_flag: refs & 0x80 != 0,
        ..Default::default()
    };
    let config = DpbConfig {
        non_conforming_stream: refs & 0x40 != 0,
        ..Default::default()
    };
    let mut session = Session::new(config, |_: &OutputFrame| -> anyhow::Result<()> { Ok(()) });
    if session.activate_sequence(&sps).is_err() {
        return;
    }

    for chunk in commands.chunks(8).filter(|c| c.len() >= 6) {
        let res = match chunk[0] % 4 {
            0 | 1 => {
                let pic = picture(chunk);
                session
                    .begin_picture(0, pic.frame_num, pic.is_idr(), |n| n * 2)
                    .and_then(|()| session.store_picture(pic))
            }
            2 => session.build_ref_pic_lists(&slice(chunk)).map(|_| ()),
            _ => session.flush(),
        };

        if res.is_err() {
            return;
        }
    }
});
