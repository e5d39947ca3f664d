// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use num_traits::PrimInt;
use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer};

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Deserialize a protobuf message from its raw (non-length-prefixed) encoding.
pub fn read_protobuf<'a, M: MessageRead<'a>>(data: &'a [u8]) -> quick_protobuf::Result<M> {
    let mut reader = BytesReader::from_bytes(data);
    M::from_reader(&mut reader, data)
}

/// Serialize a protobuf message to its raw (non-length-prefixed) encoding.
pub fn write_protobuf<M: MessageWrite>(message: &M) -> quick_protobuf::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.get_size());
    let mut writer = Writer::new(&mut buf);
    message.write_message(&mut writer)?;
    Ok(buf)
}
