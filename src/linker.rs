//! Resolves cross-object references and threads block chains.
//!
//! The linker owns an ordered list of objects.  `link()` rebuilds the global
//! procedure and file tables from scratch, rewrites the tail of every block
//! chain segment so that same-named blocks across objects form one forward
//! chain, and patches every call site with its resolved `(address, module)`.
//! Objects may be appended and `link()` rerun any number of times; a
//! generation counter, stamped into every jump the merge pass installs,
//! keeps a relink from re-threading a chain it already threaded.
//!
//! Module indices are 1-based everywhere in the linker: index 0 is reserved
//! to mean "same module" inside instruction payloads.

use crate::instruction::Instruction;
use crate::object::Object;
use crate::tokenizer::Location;
use fnv::FnvHashMap;
use itertools::Itertools;
use log::{debug, error};
use std::error::Error;
use std::fmt;

/// A resolved entry in the global procedure or file table.
#[derive(Debug, Clone, Copy)]
pub struct ProcedureEntry {
    /// Program index of the first instruction of the first segment.
    pub entry: u32,
    /// Owning module, 1-based.
    pub module: u16,
    /// Where the name was first declared.
    pub location: Location,
}

/// A link-time failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The same output file is declared in two objects.
    DuplicateFile {
        name: String,
        first: String,
        second: String,
    },
    /// Placeholders that resolve to no tag anywhere, sorted and deduplicated.
    UnknownSymbols(Vec<String>),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::DuplicateFile {
                name,
                first,
                second,
            } => write!(
                f,
                "multiple files with the same name: '{}' in {} and {}",
                name, first, second
            ),
            LinkError::UnknownSymbols(names) => {
                write!(f, "unknown symbol(s): {}", names.iter().join(", "))
            }
        }
    }
}

impl Error for LinkError {}

/// The linker: objects in insertion order plus the tables the last `link()`
/// produced.
#[derive(Debug, Default)]
pub struct Linker {
    objects: Vec<Object>,
    generation: u16,
    procedures: FnvHashMap<String, ProcedureEntry>,
    files: FnvHashMap<String, ProcedureEntry>,
}

impl Linker {
    pub fn new() -> Linker {
        Linker::default()
    }

    /// Appends an object, returning its 1-based module index.  The new
    /// object is invisible to lookups until the next `link()`.
    pub fn add_object(&mut self, object: Object) -> u16 {
        self.objects.push(object);
        self.objects.len() as u16
    }

    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    /// The object behind a 1-based module index.
    pub fn object(&self, module: u16) -> &Object {
        &self.objects[module as usize - 1]
    }

    /// Tag name to resolved entry, as of the last `link()`.
    pub fn procedures(&self) -> &FnvHashMap<String, ProcedureEntry> {
        &self.procedures
    }

    /// Output file name to resolved entry, as of the last `link()`.
    pub fn files(&self) -> &FnvHashMap<String, ProcedureEntry> {
        &self.files
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    /// Rebuilds the global tables, threads chains, patches calls and
    /// verifies that every referenced symbol resolves.
    pub fn link(&mut self) -> Result<(), LinkError> {
        self.generation = self.generation.wrapping_add(1);
        self.procedures.clear();
        self.files.clear();
        self.build_procedure_table();
        self.build_file_table()?;
        self.merge_adjacent();
        self.update_procedure_calls();
        self.verify_symbols()?;
        debug!(
            "linked {} object(s): {} tags, {} files, generation {}",
            self.objects.len(),
            self.procedures.len(),
            self.files.len(),
            self.generation
        );
        Ok(())
    }

    /// The first object to declare a tag name owns its procedure entry;
    /// later segments are reached through the jump chain.
    fn build_procedure_table(&mut self) {
        for (index, object) in self.objects.iter().enumerate() {
            let module = (index + 1) as u16;
            for (name, chain) in &object.adjacent {
                self.procedures
                    .entry(name.clone())
                    .or_insert(ProcedureEntry {
                        entry: chain.entry,
                        module,
                        location: chain.location,
                    });
            }
        }
    }

    /// File definitions never merge: a second declaration anywhere is fatal.
    /// Names are visited in document order so the report is deterministic.
    fn build_file_table(&mut self) -> Result<(), LinkError> {
        for (index, object) in self.objects.iter().enumerate() {
            let module = (index + 1) as u16;
            let in_order = object
                .files
                .iter()
                .sorted_by_key(|(_, file)| file.entry);
            for (name, file) in in_order {
                if let Some(previous) = self.files.get(name) {
                    return Err(LinkError::DuplicateFile {
                        name: name.clone(),
                        first: self.object(previous.module).name.clone(),
                        second: object.name.clone(),
                    });
                }
                self.files.insert(
                    name.clone(),
                    ProcedureEntry {
                        entry: file.entry,
                        module,
                        location: file.location,
                    },
                );
            }
        }
        Ok(())
    }

    /// Threads every chain across objects: each segment's exit instruction
    /// is overwritten with a generation-stamped jump to the next object's
    /// segment for the same name; the final segment keeps its `ret`.
    ///
    /// A chain whose exit already carries the current generation was
    /// threaded earlier in this same pass (it is some earlier object's
    /// continuation) and is skipped.  Jumps from prior generations are
    /// ordinary jumps and are overwritten, never stacked.
    fn merge_adjacent(&mut self) {
        let generation = self.generation;
        for index in 0..self.objects.len() {
            let names: Vec<String> = self.objects[index].adjacent.keys().cloned().collect();
            for name in names {
                let head = self.objects[index].adjacent[&name];
                if let Instruction::Jmp {
                    generation: stamped,
                    ..
                } = self.objects[index].program[head.exit as usize]
                {
                    if stamped == generation {
                        continue;
                    }
                }
                let mut previous = (index, head.exit);
                for next_index in index + 1..self.objects.len() {
                    let next = match self.objects[next_index].adjacent.get(&name) {
                        Some(chain) => (chain.entry, chain.exit),
                        None => continue,
                    };
                    self.objects[previous.0].program[previous.1 as usize] = Instruction::Jmp {
                        address: next.0,
                        module: (next_index + 1) as u16,
                        generation,
                    };
                    previous = (next_index, next.1);
                }
            }
        }
    }

    /// Fills in `(address, module)` on every call site of every resolved
    /// procedure.
    fn update_procedure_calls(&mut self) {
        let procedures: Vec<(String, ProcedureEntry)> = self
            .procedures
            .iter()
            .map(|(name, entry)| (name.clone(), *entry))
            .collect();
        for (name, procedure) in procedures {
            for index in 0..self.objects.len() {
                let sites = match self.objects[index].symbols.get(&name) {
                    Some(sites) => sites.clone(),
                    None => continue,
                };
                for site in sites {
                    let instruction = &mut self.objects[index].program[site as usize];
                    match instruction {
                        Instruction::Call {
                            address, module, ..
                        } => {
                            *address = procedure.entry;
                            *module = procedure.module;
                        }
                        other => panic!(
                            "symbol table points at {} rather than a call",
                            other.mnemonic()
                        ),
                    }
                }
            }
        }
    }

    /// Every referenced symbol must resolve; all missing names are reported
    /// in one failure so the user sees the full list.
    fn verify_symbols(&self) -> Result<(), LinkError> {
        let missing: Vec<String> = self
            .objects
            .iter()
            .flat_map(|object| object.symbols.keys())
            .filter(|name| !self.procedures.contains_key(*name))
            .cloned()
            .sorted()
            .dedup()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for name in &missing {
            error!("unknown symbol: {}", name);
        }
        Err(LinkError::UnknownSymbols(missing))
    }
}
