//! VM metadata: klasses, methods, constant pools, and the process-wide
//! registry that owns them.
//!
//! Class-file parsing and the class-loader graph are external collaborators;
//! metadata enters through the builder APIs and is immutable once
//! registered, except for the explicitly atomic pieces (bytecode bytes,
//! pool tags, resolution slots).

mod klass;
mod method;
mod pool;
mod registry;
mod rewriter;

pub use klass::*;
pub use method::*;
pub use pool::*;
pub use registry::*;
pub use rewriter::rewrite_method;
