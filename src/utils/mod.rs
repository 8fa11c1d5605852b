//! Helpers for turning model output into usable values.

pub mod code_block;
pub mod json_extraction;

pub use code_block::extract_code;
pub use json_extraction::{extract_json, find_closing, JsonExtractionError};
