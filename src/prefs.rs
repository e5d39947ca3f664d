// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Interface to the daemon's persistent preferences store. The store itself is
//! owned by the daemon; this crate only reads and writes a few keys through
//! this trait.

use std::{collections::HashMap, sync::Mutex};

pub mod keys {
    /// Boot id recorded when an update finished applying. A mismatch with the
    /// running boot id means the device rebooted since.
    pub const UPDATE_COMPLETED_ON_BOOT_ID: &str = "update-completed-on-boot-id";
    /// Hash identifying the payload of the in-progress update, used to detect
    /// resumable updates.
    pub const UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
    /// Set once postinstall finished for the applied update.
    pub const POST_INSTALL_SUCCEEDED: &str = "post-install-succeeded";
}

pub trait Prefs: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str) -> bool;
    fn get_boolean(&self, key: &str) -> Option<bool>;
    fn set_boolean(&self, key: &str, value: bool) -> bool;
    fn exists(&self, key: &str) -> bool;
    fn delete(&self, key: &str) -> bool;
}

/// In-memory store for tests and single-process use.
#[derive(Default)]
pub struct MemoryPrefs {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemoryPrefs {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> bool {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        true
    }

    fn get_boolean(&self, key: &str) -> Option<bool> {
        match self.get_string(key)?.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    fn set_boolean(&self, key: &str, value: bool) -> bool {
        self.set_string(key, if value { "true" } else { "false" })
    }

    fn exists(&self, key: &str) -> bool {
        self.values.lock().unwrap().contains_key(key)
    }

    fn delete(&self, key: &str) -> bool {
        self.values.lock().unwrap().remove(key);
        true
    }
}
