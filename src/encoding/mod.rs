pub mod reader;
pub mod shared_keys;
pub mod writer;

pub use reader::{ArrayRef, Body, Decoded, DictRef};
pub use shared_keys::SharedKeys;
pub use writer::encode_body;

// Value tags shared by the writer and the reader.
pub(crate) const TAG_NULL: u8 = 0x00;
pub(crate) const TAG_FALSE: u8 = 0x01;
pub(crate) const TAG_TRUE: u8 = 0x02;
pub(crate) const TAG_INT: u8 = 0x03;
pub(crate) const TAG_FLOAT: u8 = 0x04;
pub(crate) const TAG_DOUBLE: u8 = 0x05;
pub(crate) const TAG_STRING: u8 = 0x06;
pub(crate) const TAG_DICT: u8 = 0x07;
pub(crate) const TAG_ARRAY: u8 = 0x08;
