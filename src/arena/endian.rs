//! Big-endian integer cells for data stored inside a chain.
//!
//! Every multi-byte integer that lives in mapped memory is kept in
//! canonical big-endian byte order regardless of host endianness, so a
//! file written on one machine reads back on another. The cells are the
//! `zerocopy` byteorder types: plain byte arrays with accessors, safe to
//! place at any alignment inside a `#[repr(C)]` struct. Only 16, 32, and
//! 64 bit widths exist; asking for any other width is a type error.

pub use zerocopy::big_endian::{
    I16 as I16Be, I32 as I32Be, I64 as I64Be, U16 as U16Be, U32 as U32Be, U64 as U64Be,
};
