//! beamdrop-core — wire format, payload codec, metadata and configuration.
//! All other beamdrop crates depend on this one.

pub mod chunk;
pub mod codec;
pub mod config;
pub mod metadata;
pub mod wire;

pub use chunk::ChunkPlan;
pub use metadata::TransferMetadata;
pub use wire::{Frame, PeerId};
