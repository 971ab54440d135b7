// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod arena;
pub mod dpb;
pub mod frame_store;
pub mod output;
pub mod params;
pub mod picture;
pub mod ref_lists;
pub mod slice;
