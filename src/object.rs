//! One parsed document and its derived program and tables.
//!
//! An object is the unit the linker works in: it owns the document's bytes,
//! the flat instruction program the parser lowered them into, and three
//! tables keyed by name.  All text references inside the program are offsets
//! into this object's `text`; all cross-object references go through
//! `(module, address)` pairs resolved at link time, so a loaded object never
//! points into another one.

use crate::instruction::Instruction;
use crate::tokenizer::Location;
use fnv::FnvHashMap;
use tinyvec::TinyVec;

/// Call sites are program indices; almost every placeholder name is used
/// once or twice, so the list stays inline.
pub type CallSites = TinyVec<[u32; 4]>;

/// Per-object record of one block name's chain segment: the first
/// instruction of the first block with that name, the terminating
/// instruction of the last one, and where the name was declared.
#[derive(Debug, Clone, Copy)]
pub struct BlockChain {
    pub entry: u32,
    pub exit: u32,
    pub location: Location,
}

/// Per-object record of one `file:` block.
#[derive(Debug, Clone, Copy)]
pub struct FileBlock {
    pub entry: u32,
    pub location: Location,
}

/// One parsed input document plus its derived program and tables.
#[derive(Debug, Default, Clone)]
pub struct Object {
    /// The document's name, used in listings and diagnostics.
    pub name: String,
    /// The document's bytes.  `Write` and `Ret` payloads index into this.
    pub text: Vec<u8>,
    /// The lowered program.  The linker rewrites `Jmp` and `Call`
    /// instructions in place on every relink.
    pub program: Vec<Instruction>,
    /// Placeholder name to the call sites referencing it.
    pub symbols: FnvHashMap<String, CallSites>,
    /// Block name to its chain segment within this object.
    pub adjacent: FnvHashMap<String, BlockChain>,
    /// Output file name to its block entry.
    pub files: FnvHashMap<String, FileBlock>,
}

impl Object {
    /// The text span `[start, start + len)`.
    pub fn span(&self, start: u32, len: usize) -> &[u8] {
        &self.text[start as usize..start as usize + len]
    }
}
