//! # bitlayout
//!
//! Parse binary data with textual layout schemas.
//!
//! A schema is a short program in a declarative grammar: typed fields, bit
//! groups, nested and repeated structures, and array sizes computed from
//! expressions over earlier fields. It is compiled once into an immutable
//! [compiled::CompiledSchema] and then executed against any byte source,
//! producing a tree of typed values.
//!
//! ## Example
//!
//! ```
//! use bitlayout::schema::Schema;
//!
//! let schema = Schema::compile(
//!     "ubyte count;
//!      points [count] { <short x; <short y; }
//!      bit:4 version; bit:4 flags;",
//! )
//! .unwrap();
//!
//! let root = schema
//!     .parse_bytes(&[2, 1, 0, 2, 0, 0xFF, 0xFF, 3, 0, 0x21])
//!     .unwrap();
//!
//! assert_eq!(root.get_i64("count"), Some(2));
//! let points = root.get_array("points").unwrap();
//! assert_eq!(points.get(1).unwrap().as_struct().unwrap().get_i64("x"), Some(-1));
//! assert_eq!(root.get_i64("version"), Some(1));
//! assert_eq!(root.get_i64("flags"), Some(2));
//! ```

pub mod bits;
pub mod compiled;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod errors;
pub mod expr;
pub mod field;
pub mod handler;
pub mod lexer;
pub mod order;
pub mod schema;
#[cfg(feature = "serde")]
pub mod serde;
pub mod stream;
pub mod value;
pub mod visitor;

pub use schema::Schema;
