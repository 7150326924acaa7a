//! Text finalizers applied to a completed assistant reply

mod citations;
mod sanitizer;

pub use citations::{extract as extract_citations, Citation};
pub use sanitizer::sanitize;
