//! Buffers and fixture helpers

pub mod buffer;
pub mod fixture;
