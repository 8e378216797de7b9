//! weft: a literate programming tangle engine.
//!
//! A literate document is prose with embedded, named, typed code blocks.
//! Blocks reference each other through placeholders; blocks that share a
//! name — within one document or across many — are threaded into a single
//! chain in document order.  Tangling reconstructs each declared output
//! file by recursively expanding placeholders, carrying the textual
//! indentation of each reference point.
//!
//! The engine is a small compiler plus a virtual machine:
//!
//! * [`tokenizer`] — a hand-written pull lexer over bytes;
//! * [`parser`] — lowers one document into an [`object::Object`]: a flat
//!   bytecode program plus symbol, adjacency and file tables;
//! * [`linker`] — threads same-named block chains across objects with
//!   generation-tagged jumps and patches call sites;
//! * [`interp`] — a stack machine driving a pluggable [`sink::Sink`] that
//!   observes every write, call and return.
//!
//! Most callers want none of that directly: [`database::Database`] owns the
//! objects and the linker, relinks lazily, and exposes the tangle, listing
//! and graph operations the command-line tool is built on.
//!
//! ```
//! use weft::config::DbOptions;
//! use weft::database::Database;
//!
//! let source = concat!(
//!     "    lang: rust esc: none tag: #greeting\n",
//!     "    -----------------------------------\n",
//!     "\n",
//!     "    hello\n",
//! );
//! let mut db = Database::new(DbOptions::default());
//! db.parse("intro.md", source.as_bytes().to_vec()).unwrap();
//! let mut out = Vec::new();
//! db.call_tag("greeting", &mut out).unwrap();
//! assert_eq!(out, b"hello");
//! ```

pub mod config;
pub mod database;
pub mod diag;
#[cfg(feature = "dot")]
pub mod graph;
pub mod instruction;
pub mod interp;
pub mod linker;
pub mod object;
pub mod parser;
pub mod sink;
pub mod tokenizer;

pub use config::{DbOptions, Delimiter};
pub use database::Database;
pub use diag::WeftError;
