mod document;
mod fragments;
mod selection;

pub use document::*;
pub use fragments::*;
pub use selection::*;
