// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Storage for the pictures owned by a DPB.
//!
//! Pictures never point at each other directly. Every cross reference (field to frame, motion
//! vector to reference picture, reference list entry) is a [`PicHandle`], which stays valid only
//! as long as the slot it designates has not been recycled. Resolving a handle whose picture has
//! been released yields `None` instead of whatever picture happens to occupy the slot now.

use std::fmt;

use crate::codec::h264::picture::PictureData;

/// A non-owning reference to a picture stored in a [`PictureArena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PicHandle {
    layer: u8,
    index: u32,
    generation: u32,
}

impl PicHandle {
    /// The view layer of the arena this handle was issued by.
    pub fn layer(&self) -> u8 {
        self.layer
    }
}

impl fmt::Debug for PicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pic({}:{}#{})", self.layer, self.index, self.generation)
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    pic: Option<PictureData>,
}

/// Generation-checked slot storage for [`PictureData`].
#[derive(Default)]
pub struct PictureArena {
    layer: u8,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl PictureArena {
    pub fn new(layer: u8) -> Self {
        Self {
            layer,
            ..Default::default()
        }
    }

    /// Moves `pic` into the arena and returns the handle designating it.
    pub fn insert(&mut self, pic: PictureData) -> PicHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Default::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.pic = Some(pic);

        PicHandle {
            layer: self.layer,
            index,
            generation: slot.generation,
        }
    }

    fn slot(&self, handle: PicHandle) -> Option<&Slot> {
        if handle.layer != self.layer {
            return None;
        }

        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub fn get(&self, handle: PicHandle) -> Option<&PictureData> {
        self.slot(handle).and_then(|slot| slot.pic.as_ref())
    }

    pub fn get_mut(&mut self, handle: PicHandle) -> Option<&mut PictureData> {
        self.slot(handle)?;
        self.slots[handle.index as usize].pic.as_mut()
    }

    pub fn contains(&self, handle: PicHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Releases the picture designated by `handle`. Every outstanding copy of `handle` becomes
    /// stale.
    pub fn remove(&mut self, handle: PicHandle) -> Option<PictureData> {
        self.slot(handle)?;

        let slot = &mut self.slots[handle.index as usize];
        let pic = slot.pic.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        pic
    }

    /// Number of live pictures.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PictureArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PictureArena")
            .field("layer", &self.layer)
            .field("live", &self.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}
