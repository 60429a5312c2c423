//! Canonical text model: tokenization and synthesis-sized chunking.

pub mod chunker;
pub mod tokenizer;

pub use chunker::{chunk, chunk_with, Chunk, ChunkStrategy};
pub use tokenizer::{tokenize, Token, TokenKind};
