pub use self::compare::compare;
pub use self::range::Range;
pub use self::value::{json_is_truthy, Value};

pub mod compare;
mod range;
mod value;

/// An owned, materialized JSON document or value tree.
pub type Json = serde_json::Value;
