/// Hashing primitives for content-anchor.
pub mod hash;
