// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/protobuf/mod.rs"));
