//! Pattern matching for selective copy.
//!
//! - [`translate`] compiles a shell glob into an anchored regular expression
//! - [`FileFilter`] evaluates an ordered include/exclude rule stack built
//!   from flags and `.gitignore`-style files

pub mod error;
pub mod filter;
pub mod translate;

pub use error::{PatternError, PatternResult};
pub use filter::{FileFilter, FilterRule};
pub use translate::{compile, is_magic, translate};
