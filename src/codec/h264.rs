// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod nalu;
pub mod nalu_writer;
pub mod slice_header;
pub mod synthesizer;
pub mod syntax;
