#![doc = include_str!("../README.md")]

pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod request;

pub use error::{Error, Result};
pub use frame::{DEFAULT_MAX_FRAME_BYTES, NetstringCodec};
pub use message::{ACK, ChunkProgress, ClientMessage, ServerMessage};
pub use request::{ChunkSpec, PlaceRequest};
