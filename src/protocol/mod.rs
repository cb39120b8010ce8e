//! PostgreSQL frontend/backend protocol (v3.0) codec

pub mod backend;
pub mod frontend;
pub mod quote;

pub use backend::{Frame, FrameParser, MessageCode, ServerError};
pub use quote::{quote_ident, quote_literal, validate_channel};
