// SPDX-FileCopyrightText: 2024-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{env, fs, io, path::Path};

use pb_rs::{types::FileDescriptor, ConfigBuilder};

fn main() {
    let out_dir = Path::new(&env::var("OUT_DIR").unwrap()).join("protobuf");
    let in_dir = Path::new(&env::var("CARGO_MANIFEST_DIR").unwrap()).join("protobuf");
    let proto = in_dir.join("update_metadata.proto");

    println!("cargo:rerun-if-changed={}", proto.to_str().unwrap());

    match fs::remove_dir_all(&out_dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        r => r.unwrap(),
    }

    fs::create_dir_all(&out_dir).unwrap();

    // This crate only ever parses manifests, never re-serializes them, and the
    // manifest schema carries no map fields, so pb-rs' nostd/BTreeMap mode for
    // reproducible map ordering (tafia/quick-protobuf#251) buys nothing here.
    // Owned fields instead of Cow keep the decoded manifest independent of the
    // payload buffer it came from.
    let config = ConfigBuilder::new(&[proto], None, Some(&out_dir), &[in_dir])
        .unwrap()
        .dont_use_cow(true)
        .build();

    FileDescriptor::run(&config).unwrap();
}
