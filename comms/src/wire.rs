use std::io;

/// A message that can be written into a frame.
pub trait Serialize<'a> {
    /// Writes the head of the message into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer where the non zero-copy part of the message is written.
    ///
    /// # Returns
    /// An optional trailing byte slice that must be written right after `buf` without copying it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}

/// A message that can be read back from a frame, borrowing from it when possible.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}

/// Plain numeric types a frame may be read into.
pub trait Align1: bytemuck::Pod {}

/// Receive buffer elements aligned enough to view a frame body as `f32` and `u32` arrays.
pub trait Align4: Align1 {}

macro_rules! impl_align {
    ($trait:ident: $($ty:ty),+) => {
        $(impl $trait for $ty {})+
    };
}

impl_align!(Align1: u8, u32, u64, f32, f64);
impl_align!(Align4: u32, u64, f32, f64);
