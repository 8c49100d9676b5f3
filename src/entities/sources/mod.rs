//! Concrete frame sources.

pub mod pattern;
pub mod sequence;

pub use pattern::PatternSource;
pub use sequence::SequenceSource;
