//! Clip selection and preparation

pub mod processor;
pub mod selector;

pub use processor::{ClipProcessor, PreparedClip};
pub use selector::{ClipSelector, ClipSpec};
