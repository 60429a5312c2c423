//! narrator: resumable chunked book narration with word-level timings.
//!
//! Book text is tokenized once into a canonical word index, split into
//! synthesis-sized chunks, and narrated lazily chunk by chunk. Each generated
//! chunk stores its audio and per-word timings aligned back onto the canonical
//! index. Clients read audio through [`assets::AssetCache`].

pub mod assets;
pub mod config;
pub mod error;
pub mod narration;
pub mod storage;
pub mod synthesis;
pub mod text;

#[cfg(test)]
mod testing;
