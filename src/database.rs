//! Main API entry point for loading and tangling literate documents.
//!
//! A variable of type `Database` represents a loaded set of documents.  You
//! can construct a `Database` object, feed it documents with the `parse`
//! method, then query analysis results which will be computed on demand.
//! Parsing another document invalidates the link result; it is relinked the
//! next time anything needs it.
//!
//! ## On objects
//!
//! Each document is parsed independently into an *object*: the document's
//! bytes plus a flat instruction program and the name tables derived from
//! it.  Objects are the unit of combination — blocks that share a name
//! across documents are threaded into one chain at link time, in document
//! insertion order, without ever copying their text.  An object's program
//! refers to other objects only through `(module, address)` pairs, so the
//! whole set stays relocatable and relinking is cheap enough to do from
//! scratch every time.
//!
//! ## Output discipline
//!
//! Nothing is written to disk until the entire input set has parsed and
//! linked.  Only then are output files created (truncating any previous
//! contents), with parent directories created best-effort first.

use crate::config::DbOptions;
use crate::diag::{render_snippet, WeftError};
#[cfg(feature = "dot")]
use crate::graph::GraphSink;
use crate::interp::Interpreter;
use crate::linker::Linker;
use crate::parser::parse_document;
use crate::sink::StreamSink;
use crate::tokenizer::Location;
use itertools::Itertools;
use log::info;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// One row of a `ls`-style listing: the name, the declaring document, and
/// the declaration site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub object: String,
    pub location: Location,
}

fn time<R, F: FnOnce() -> R>(options: &DbOptions, name: &str, f: F) -> R {
    let now = Instant::now();
    let ret = f();
    if options.timing {
        info!("{} {}ms", name, now.elapsed().as_millis());
    }
    ret
}

/// Master type of document containers.
///
/// A `Database` holds an ordered collection of parsed objects and the
/// linker state derived from them.  The link result is generated lazily and
/// invalidated on any edit to the collection.
#[derive(Debug, Default)]
pub struct Database {
    options: DbOptions,
    linker: Linker,
    linked: bool,
}

impl Database {
    /// Constructs a database representing an empty set of documents.  Use
    /// `parse` to load it with data.
    pub fn new(options: DbOptions) -> Database {
        Database {
            options,
            linker: Linker::new(),
            linked: false,
        }
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    /// Parses one document and appends it to the collection.
    ///
    /// `name` identifies the document in listings and diagnostics; `text`
    /// is its content.  Documents keep their insertion order, which is the
    /// order same-named blocks thread in.  Any previous link result is
    /// invalidated.
    pub fn parse(&mut self, name: &str, text: Vec<u8>) -> Result<(), WeftError> {
        time(&self.options, "parse", || {
            match parse_document(name, text, &self.options) {
                Ok(object) => {
                    self.linker.add_object(object);
                    self.linked = false;
                    Ok(())
                }
                Err(error) => Err(WeftError::Parse {
                    snippet: String::new(),
                    object: name.to_string(),
                    error,
                }),
            }
        })
    }

    /// Like `parse`, but renders an annotated snippet into the error on
    /// failure.  The plain variant exists for callers that do not want
    /// terminal-formatted output.
    pub fn parse_with_snippet(&mut self, name: &str, text: Vec<u8>) -> Result<(), WeftError> {
        let copy = text.clone();
        self.parse(name, text).map_err(|failure| match failure {
            WeftError::Parse { object, error, .. } => {
                let snippet = render_snippet(&object, &copy, &error);
                WeftError::Parse {
                    object,
                    error,
                    snippet,
                }
            }
            other => other,
        })
    }

    /// Obtains the linked program, relinking first if any document was
    /// added since the last link.
    pub fn link_result(&mut self) -> Result<&Linker, WeftError> {
        if !self.linked {
            time(&self.options, "link", || self.linker.link())?;
            self.linked = true;
        }
        Ok(&self.linker)
    }

    /// Expands the named tag into `out`, exactly as written: no trailing
    /// newline is added.
    pub fn call_tag<W: Write>(&mut self, name: &str, out: W) -> Result<(), WeftError> {
        let options = self.options.clone();
        let linker = self.link_result()?;
        let mut sink = StreamSink::plain(out);
        time(&options, "call", || {
            Interpreter::new(linker).call_tag(name, &mut sink)
        })?;
        Ok(())
    }

    /// Expands the named output file into `out` with file conventions (a
    /// final newline unless the options omit it).
    pub fn call_file<W: Write>(&mut self, name: &str, out: W) -> Result<(), WeftError> {
        let options = self.options.clone();
        let linker = self.link_result()?;
        let mut sink = StreamSink::file(out, options.omit_trailing_newline);
        time(&options, "call", || {
            Interpreter::new(linker).call_file(name, &mut sink)
        })?;
        Ok(())
    }

    /// Tangles every declared output file beneath `root`, returning the
    /// paths written.  Files are only created once the whole input set has
    /// linked; parent directories are created best-effort.
    pub fn tangle(&mut self, root: &Path) -> Result<Vec<PathBuf>, WeftError> {
        let options = self.options.clone();
        let linker = self.link_result()?;
        time(&options, "tangle", || {
            let mut written = Vec::new();
            let in_order = linker
                .files()
                .iter()
                .sorted_by_key(|(_, entry)| (entry.module, entry.entry));
            for (name, _) in in_order {
                let path = root.join(name);
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                let file = fs::File::create(&path)?;
                let mut sink =
                    StreamSink::file(io::BufWriter::new(file), options.omit_trailing_newline);
                Interpreter::new(linker).call_file(name, &mut sink)?;
                written.push(path);
            }
            Ok(written)
        })
    }

    /// Every `file:` target, once each, in document order.
    pub fn list_files(&mut self) -> Result<Vec<Listing>, WeftError> {
        let linker = self.link_result()?;
        Ok(linker
            .files()
            .iter()
            .sorted_by_key(|(_, entry)| (entry.module, entry.entry))
            .map(|(name, entry)| Listing {
                name: name.clone(),
                object: linker.object(entry.module).name.clone(),
                location: entry.location,
            })
            .collect())
    }

    /// Every tag, once each (at its first declaration), in document order.
    pub fn list_tags(&mut self) -> Result<Vec<Listing>, WeftError> {
        let linker = self.link_result()?;
        Ok(linker
            .procedures()
            .iter()
            .sorted_by_key(|(_, entry)| (entry.module, entry.entry))
            .map(|(name, entry)| Listing {
                name: name.clone(),
                object: linker.object(entry.module).name.clone(),
                location: entry.location,
            })
            .collect())
    }

    /// Every definition site of each named tag: one row per declaring
    /// document, in chain order.
    pub fn find_tags(&mut self, names: &[&str]) -> Result<Vec<Listing>, WeftError> {
        let linker = self.link_result()?;
        let mut rows = Vec::new();
        for &name in names {
            for object in linker.objects() {
                if let Some(chain) = object.adjacent.get(name) {
                    rows.push(Listing {
                        name: name.to_string(),
                        object: object.name.clone(),
                        location: chain.location,
                    });
                }
            }
        }
        Ok(rows)
    }

    /// Renders the call graph reachable from the named tag as DOT.
    #[cfg(feature = "dot")]
    pub fn graph_tag(&mut self, name: &str) -> Result<String, WeftError> {
        let linker = self.link_result()?;
        let mut sink = GraphSink::new();
        Interpreter::new(linker)
            .call_tag(name, &mut sink)
            .map_err(|error| WeftError::Exec(error.into_any()))?;
        Ok(sink.into_dot())
    }

    /// Renders the call graph reachable from the named output file as DOT.
    #[cfg(feature = "dot")]
    pub fn graph_file(&mut self, name: &str) -> Result<String, WeftError> {
        let linker = self.link_result()?;
        let mut sink = GraphSink::new();
        Interpreter::new(linker)
            .call_file(name, &mut sink)
            .map_err(|error| WeftError::Exec(error.into_any()))?;
        Ok(sink.into_dot())
    }
}
