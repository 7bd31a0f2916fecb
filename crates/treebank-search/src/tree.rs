//! Owned XML trees for match post-processing.
//!
//! Match trees are parsed per match and owned by it. Rewrites (expansion,
//! variable tagging) always work on clones, so a parsed tree shared through
//! a match is never mutated in place.

mod element;
mod path;

pub use element::Element;
pub use path::PathExpr;
