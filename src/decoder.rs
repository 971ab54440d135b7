// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decoding session: owns one DPB per view layer, sizes them from the active sequence and
//! performs the per-picture bookkeeping that sits above a single DPB (frame-num gaps, MMCO 5
//! resets, inter-view lookups).

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use thiserror::Error;

use crate::codec::h264::arena::PicHandle;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::output::OutputSink;
use crate::codec::h264::params::SequenceParams;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::ref_lists::RefPicListBuilder;
use crate::codec::h264::ref_lists::RefPicLists;
use crate::codec::h264::slice::SliceHeader;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Dpb(#[from] DpbError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Session-wide knobs that are not carried by the bitstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DpbConfig {
    /// Frame stores added on top of the size derived from the level limits.
    pub extra_frames: usize,
    /// Tolerate "no reference picture" entries inside the active part of a reference list.
    pub non_conforming_stream: bool,
    /// Number of view layers the session may allocate. Multi-view streams need 2.
    pub max_views: usize,
}

impl Default for DpbConfig {
    fn default() -> Self {
        Self {
            extra_frames: 0,
            non_conforming_stream: false,
            max_views: 2,
        }
    }
}

/// Hook for error concealment strategies that need to inspect or patch the DPB.
pub trait ConcealmentHook {
    /// Called before `pic` is stored into `dpb`.
    fn before_store(&mut self, _dpb: &mut Dpb, _pic: &PictureData) {}

    /// Called after `dpb` has been flushed.
    fn after_flush(&mut self, _dpb: &mut Dpb) {}
}

/// State of one view layer.
struct Layer {
    dpb: Dpb,
    /// `PrevRefFrameNum` of 7.4.3.
    prev_ref_frame_num: i32,
}

pub struct Session<S: OutputSink> {
    config: DpbConfig,
    /// The currently active sequence, if any.
    sps: Option<SequenceParams>,
    layers: Vec<Layer>,
    sink: S,
    hook: Option<Box<dyn ConcealmentHook>>,
}

impl<S: OutputSink> Session<S> {
    pub fn new(config: DpbConfig, sink: S) -> Self {
        Self {
            config,
            sps: None,
            layers: vec![],
            sink,
            hook: None,
        }
    }

    pub fn set_concealment_hook(&mut self, hook: Box<dyn ConcealmentHook>) {
        self.hook = Some(hook);
    }

    pub fn config(&self) -> &DpbConfig {
        &self.config
    }

    pub fn sequence(&self) -> Option<&SequenceParams> {
        self.sps.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// The DPB of view layer `layer`, if it exists.
    pub fn dpb(&self, layer: u8) -> Option<&Dpb> {
        self.layers.get(usize::from(layer)).map(|l| &l.dpb)
    }

    /// Resolves a handle obtained from any of the session's DPBs.
    pub fn picture(&self, handle: PicHandle) -> Result<&PictureData> {
        let dpb = self
            .dpb(handle.layer())
            .ok_or(DpbError::StaleHandle(handle))?;

        Ok(dpb.picture(handle)?)
    }

    /// Makes `sps` the active sequence. Pictures of a previous, different sequence are flushed
    /// and every view layer is resized. Re-activating the current sequence does nothing.
    pub fn activate_sequence(&mut self, sps: &SequenceParams) -> Result<()> {
        if self.sps.as_ref() == Some(sps) {
            return Ok(());
        }

        if self.sps.is_some() {
            debug!("New sequence activated, flushing the DPB");
            self.flush()?;
        }

        let size = sps.max_dpb_frames()? + self.config.extra_frames;
        let num_layers = match sps.mvc {
            Some(_) => self.config.max_views.clamp(1, 2),
            None => 1,
        };

        debug!(
            "Activating sequence: DPB size {}, num_ref_frames {}, {} view layer(s)",
            size, sps.max_num_ref_frames, num_layers
        );

        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let mut dpb = Dpb::new(layer as u8);
            dpb.set_limits(size, sps.max_num_ref_frames as usize, sps.max_frame_num())?;
            dpb.set_inter_view_registry(layer == 0 && sps.mvc.is_some());

            layers.push(Layer {
                dpb,
                prev_ref_frame_num: 0,
            });
        }

        self.layers = layers;
        self.sps = Some(sps.clone());

        Ok(())
    }

    fn layer_index(&self, view_id: u16) -> Result<(usize, &SequenceParams)> {
        let sps = self.sps.as_ref().ok_or(DpbError::NoActiveSequence)?;
        let layer = usize::from(sps.layer_of(view_id));

        if layer >= self.layers.len() {
            return Err(anyhow!("no DPB allocated for view {}", view_id).into());
        }

        Ok((layer, sps))
    }

    /// Prepares the DPB of `view_id` for a new picture numbered `frame_num`, synthesizing
    /// non-existing frames for any gap in `frame_num` (8.2.5.2).
    ///
    /// `gap_poc` returns the POC of the filler frame with the given `frame_num`.
    pub fn begin_picture(
        &mut self,
        view_id: u16,
        frame_num: i32,
        is_idr: bool,
        mut gap_poc: impl FnMut(i32) -> i32,
    ) -> Result<()> {
        let (layer, sps) = self.layer_index(view_id)?;
        let gaps_allowed = sps.gaps_in_frame_num_value_allowed_flag;
        let max_frame_num = sps.max_frame_num() as i32;

        if is_idr {
            return Ok(());
        }

        let prev = self.layers[layer].prev_ref_frame_num;
        if frame_num == prev || frame_num == (prev + 1) % max_frame_num {
            return Ok(());
        }

        if !gaps_allowed {
            return Err(DpbError::FrameNumGap {
                prev,
                cur: frame_num,
            }
            .into());
        }

        let mut unused = (prev + 1) % max_frame_num;
        while unused != frame_num {
            let poc = gap_poc(unused);
            debug!(
                "Filling frame_num gap with non-existing frame {} (POC {})",
                unused, poc
            );

            let mut filler = PictureData::new_non_existing(unused, 0);
            filler.view_id = view_id;
            filler.pic_order_cnt = poc;
            filler.top_field_order_cnt = poc;
            filler.bottom_field_order_cnt = poc;

            self.store_in_layer(layer, filler)
                .with_context(|| format!("while filling frame_num gap at {}", unused))?;

            unused = (unused + 1) % max_frame_num;
        }

        Ok(())
    }

    /// Builds the reference picture lists of `slice`.
    pub fn build_ref_pic_lists(&mut self, slice: &SliceHeader) -> Result<RefPicLists> {
        let (layer, _) = self.layer_index(slice.view_id)?;
        self.layers[layer]
            .dpb
            .update_pic_nums(slice.field, i32::from(slice.frame_num));

        let (_, sps) = self.layer_index(slice.view_id)?;
        let builder = RefPicListBuilder::new(&self.layers[layer].dpb, slice)
            .pic_order_cnt_type(sps.pic_order_cnt_type)
            .non_conforming_stream(self.config.non_conforming_stream);

        let view = sps.mvc.as_ref().and_then(|mvc| mvc.view(slice.view_id));
        let builder = match view {
            Some(view) if layer != 0 => builder.inter_view(
                &self.layers[0].dpb,
                [
                    view.ref_views(slice.anchor_pic_flag, 0),
                    view.ref_views(slice.anchor_pic_flag, 1),
                ],
            ),
            _ => builder,
        };

        Ok(builder.build()?)
    }

    fn store_in_layer(&mut self, layer: usize, pic: PictureData) -> Result<()> {
        let is_ref = pic.is_ref();
        let frame_num = pic.frame_num;
        let Layer {
            dpb,
            prev_ref_frame_num,
        } = &mut self.layers[layer];

        if let Some(hook) = self.hook.as_mut() {
            hook.before_store(dpb, &pic);
        }

        dpb.store_picture(pic, &mut self.sink)?;

        if dpb.last_has_mmco_5() {
            *prev_ref_frame_num = 0;
        } else if is_ref {
            *prev_ref_frame_num = frame_num;
        }

        Ok(())
    }

    /// Stores a decoded picture into the DPB of its view.
    pub fn store_picture(&mut self, pic: PictureData) -> Result<()> {
        let (layer, _) = self.layer_index(pic.view_id)?;
        self.store_in_layer(layer, pic)
    }

    /// Outputs every remaining picture of every view and empties the DPBs.
    pub fn flush(&mut self) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.dpb.flush(&mut self.sink)?;

            if let Some(hook) = self.hook.as_mut() {
                hook.after_flush(&mut layer.dpb);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::ConcealmentHook;
    use super::DpbConfig;
    use super::Error;
    use super::Session;
    use crate::codec::h264::dpb::tests::frame;
    use crate::codec::h264::dpb::tests::idr;
    use crate::codec::h264::dpb::tests::PocSink;
    use crate::codec::h264::dpb::Dpb;
    use crate::codec::h264::dpb::DpbError;
    use crate::codec::h264::params::MvcParams;
    use crate::codec::h264::params::SequenceParams;
    use crate::codec::h264::params::ViewDependency;
    use crate::codec::h264::picture::Field;
    use crate::codec::h264::picture::PictureData;
    use crate::codec::h264::picture::Reference;
    use crate::codec::h264::slice::RefPicMarkingInner;
    use crate::codec::h264::slice::SliceHeader;
    use crate::codec::h264::slice::SliceType;

    fn sps(max_num_ref_frames: u32) -> SequenceParams {
        SequenceParams {
            max_num_ref_frames,
            ..Default::default()
        }
    }

    fn session(sps: &SequenceParams) -> Session<PocSink> {
        let _ = env_logger::try_init();

        let mut session = Session::new(DpbConfig::default(), PocSink::default());
        session.activate_sequence(sps).unwrap();
        session
    }

    #[test]
    fn store_before_activation_fails() {
        let mut session = Session::new(DpbConfig::default(), PocSink::default());

        assert!(matches!(
            session.store_picture(idr(0)),
            Err(Error::Dpb(DpbError::NoActiveSequence))
        ));
    }

    #[test]
    fn pool_is_sized_from_the_level() {
        let sps = sps(4);
        let mut session = Session::new(
            DpbConfig {
                extra_frames: 2,
                ..Default::default()
            },
            PocSink::default(),
        );
        session.activate_sequence(&sps).unwrap();

        let dpb = session.dpb(0).unwrap();
        assert_eq!(dpb.size(), 16 + 2);
        assert_eq!(dpb.num_ref_frames(), 4);
        assert_eq!(dpb.max_frame_num(), 16);
        assert!(session.dpb(1).is_none());
    }

    #[test]
    fn sequence_change_flushes() {
        let first = sps(2);
        let mut session = session(&first);

        session.store_picture(idr(0)).unwrap();
        session
            .store_picture(frame(1, 4, Reference::ShortTerm))
            .unwrap();

        // Same sequence again: nothing happens.
        session.activate_sequence(&first).unwrap();
        assert!(session.sink().pocs().is_empty());
        assert_eq!(session.dpb(0).unwrap().len(), 2);

        session.activate_sequence(&sps(3)).unwrap();
        assert_eq!(session.sink().pocs(), vec![0, 4]);
        assert!(session.dpb(0).unwrap().is_empty());
        assert_eq!(session.dpb(0).unwrap().num_ref_frames(), 3);
    }

    #[test]
    fn frame_num_gap_is_filled() {
        let sps = SequenceParams {
            gaps_in_frame_num_value_allowed_flag: true,
            ..sps(4)
        };
        let mut session = session(&sps);

        session.begin_picture(0, 0, true, |_| 0).unwrap();
        session.store_picture(idr(0)).unwrap();

        session.begin_picture(0, 3, false, |n| n * 2).unwrap();
        let dpb = session.dpb(0).unwrap();
        assert_eq!(dpb.len(), 3);
        assert_eq!(
            dpb.short_term_refs().map(|fs| fs.frame_num).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let filler = dpb.frame_stores()[1]
            .picture(dpb.pictures(), Field::Frame)
            .unwrap();
        assert!(filler.nonexisting);
        assert_eq!(filler.pic_order_cnt, 2);

        session
            .store_picture(frame(3, 6, Reference::ShortTerm))
            .unwrap();
        session.flush().unwrap();

        // Non-existing frames never reach the sink.
        assert_eq!(session.sink().pocs(), vec![0, 6]);
    }

    #[test]
    fn frame_num_gap_is_fatal_when_not_allowed() {
        let mut session = session(&sps(4));

        session.store_picture(idr(0)).unwrap();
        session.begin_picture(0, 1, false, |_| 0).unwrap();

        assert!(matches!(
            session.begin_picture(0, 3, false, |_| 0),
            Err(Error::Dpb(DpbError::FrameNumGap { prev: 0, cur: 3 }))
        ));
    }

    #[test]
    fn mmco5_resets_prev_ref_frame_num() {
        let mut session = session(&sps(4));

        session.store_picture(idr(0)).unwrap();
        session
            .store_picture(frame(1, 4, Reference::ShortTerm))
            .unwrap();

        let mut reset = frame(2, 8, Reference::ShortTerm);
        reset.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        reset.ref_pic_marking.inner = vec![RefPicMarkingInner {
            memory_management_control_operation: 5,
            ..Default::default()
        }];
        session.store_picture(reset).unwrap();

        // The picture after the reset continues from frame_num 0.
        session.begin_picture(0, 1, false, |_| 0).unwrap();
    }

    #[derive(Default)]
    struct CountingHook {
        stores: Rc<Cell<usize>>,
        flushes: Rc<Cell<usize>>,
    }

    impl ConcealmentHook for CountingHook {
        fn before_store(&mut self, _dpb: &mut Dpb, _pic: &PictureData) {
            self.stores.set(self.stores.get() + 1);
        }

        fn after_flush(&mut self, dpb: &mut Dpb) {
            assert!(dpb.is_empty());
            self.flushes.set(self.flushes.get() + 1);
        }
    }

    #[test]
    fn concealment_hook_is_called() {
        let hook = CountingHook::default();
        let stores = hook.stores.clone();
        let flushes = hook.flushes.clone();

        let mut session = session(&sps(2));
        session.set_concealment_hook(Box::new(hook));

        session.store_picture(idr(0)).unwrap();
        session
            .store_picture(frame(1, 2, Reference::None))
            .unwrap();
        session.flush().unwrap();

        assert_eq!(stores.get(), 2);
        assert_eq!(flushes.get(), 1);
    }

    #[test]
    fn non_base_view_references_base_view() {
        let sps = SequenceParams {
            mvc: Some(MvcParams {
                views: vec![
                    ViewDependency::default(),
                    ViewDependency {
                        view_id: 1,
                        anchor_refs: [vec![0], vec![]],
                        non_anchor_refs: [vec![0], vec![]],
                    },
                ],
            }),
            ..sps(2)
        };
        let mut session = session(&sps);
        assert!(session.dpb(1).is_some());

        let mut base = idr(0);
        base.inter_view_flag = true;
        session.store_picture(base).unwrap();

        let mut dependent = idr(0);
        dependent.view_id = 1;
        session.store_picture(dependent).unwrap();

        let mut base = frame(1, 4, Reference::ShortTerm);
        base.inter_view_flag = true;
        session.store_picture(base).unwrap();

        let slice = SliceHeader {
            slice_type: SliceType::P,
            field: Field::Frame,
            frame_num: 1,
            pic_order_cnt: 4,
            num_ref_idx_l0_active_minus1: 1,
            view_id: 1,
            ..Default::default()
        };
        let lists = session.build_ref_pic_lists(&slice).unwrap();

        let own = lists.get(0, 0).unwrap();
        assert_eq!(own.layer(), 1);
        assert_eq!(session.picture(own).unwrap().pic_order_cnt, 0);

        let inter_view = lists.get(0, 1).unwrap();
        assert_eq!(inter_view.layer(), 0);
        let pic = session.picture(inter_view).unwrap();
        assert_eq!((pic.view_id, pic.pic_order_cnt), (0, 4));
    }
}
