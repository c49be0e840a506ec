// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod jgroup;
mod mounts;

pub use jgroup::JGroup;
pub use mounts::{Controller, MountTable};
