// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implementations of [`crate::device::HvaDevice`].
//!
//! Platform drivers live outside this crate. The dummy backend simulates the
//! accelerator in host memory so the encoder can be exercised without
//! hardware.

pub mod dummy;
