//! The stack machine that drives a sink over a linked program.
//!
//! Execution is single-threaded and synchronous: `step` fetches one
//! instruction from the current module, advances, and performs it, invoking
//! the sink's hooks as it goes.  The machine terminates when a `ret` finds
//! the frame stack empty.
//!
//! Frames are keyed by their *call site* — the `(module, ip)` of the call
//! instruction itself, which is unique per placeholder occurrence — so a
//! cycle in the call relation is caught the moment a site tries to re-enter
//! while already live.  Two placeholders referencing the same tag from
//! different sites are distinct keys and never confused.
//!
//! Indentation bookkeeping: every `call` adds its placeholder's column to
//! the live indent and every matching `ret` removes it.  A `write` that
//! begins a fresh output line (the previous write ended in a newline) asks
//! the sink to indent first; the very first write of a run does not.

use crate::instruction::{Instruction, SAME_MODULE};
use crate::linker::Linker;
use crate::sink::Sink;
use std::error::Error;
use std::fmt;

/// An execution failure: a core condition or a propagated sink error.
#[derive(Debug)]
pub enum ExecError<S> {
    /// A call site tried to re-enter while already on the stack.
    CyclicReference { name: String },
    /// `call_tag` was given a name absent from the procedure table.
    UnknownProcedure(String),
    /// `call_file` was given a name absent from the file table.
    UnknownFile(String),
    /// The reserved `shell` opcode was executed.
    ShellUnsupported,
    /// The sink failed; execution stops where it stood.
    Sink(S),
}

impl<S: fmt::Display> fmt::Display for ExecError<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::CyclicReference { name } => {
                write!(f, "cyclic reference detected while expanding '{}'", name)
            }
            ExecError::UnknownProcedure(name) => write!(f, "unknown procedure '{}'", name),
            ExecError::UnknownFile(name) => write!(f, "unknown file '{}'", name),
            ExecError::ShellUnsupported => write!(f, "shell filters are not implemented"),
            ExecError::Sink(error) => error.fmt(f),
        }
    }
}

impl<S: Error + 'static> Error for ExecError<S> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExecError::Sink(error) => Some(error),
            _ => None,
        }
    }
}

impl ExecError<std::convert::Infallible> {
    /// Re-types an error from a sink that cannot fail.
    pub fn into_any<S>(self) -> ExecError<S> {
        match self {
            ExecError::CyclicReference { name } => ExecError::CyclicReference { name },
            ExecError::UnknownProcedure(name) => ExecError::UnknownProcedure(name),
            ExecError::UnknownFile(name) => ExecError::UnknownFile(name),
            ExecError::ShellUnsupported => ExecError::ShellUnsupported,
            ExecError::Sink(absurd) => match absurd {},
        }
    }
}

/// One suspended call: where to resume and how much indent to give back.
#[derive(Debug, Clone, Copy)]
struct Frame {
    site_module: u16,
    site_ip: u32,
    return_ip: u32,
    return_module: u16,
    indent: u16,
}

/// The interpreter borrows the linker immutably; it owns only its stack.
#[derive(Debug)]
pub struct Interpreter<'l> {
    linker: &'l Linker,
    /// Current module, 1-based; 0 is the "not started" sentinel.
    module: u16,
    ip: u32,
    stack: Vec<Frame>,
    indent: u16,
    should_indent: bool,
    last_is_newline: bool,
}

impl<'l> Interpreter<'l> {
    pub fn new(linker: &'l Linker) -> Interpreter<'l> {
        Interpreter {
            linker,
            module: 0,
            ip: 0,
            stack: Vec::new(),
            indent: 0,
            should_indent: false,
            last_is_newline: false,
        }
    }

    /// The live indent, in columns.
    pub fn indent(&self) -> u16 {
        self.indent
    }

    /// Current call depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn reset(&mut self, module: u16, entry: u32) {
        self.module = module;
        self.ip = entry;
        self.stack.clear();
        self.indent = 0;
        self.should_indent = false;
        self.last_is_newline = false;
    }

    /// Expands the named tag into `sink`, driving `step` to completion.
    pub fn call_tag<S: Sink>(&mut self, name: &str, sink: &mut S) -> Result<(), ExecError<S::Error>> {
        let procedure = match self.linker.procedures().get(name) {
            Some(procedure) => *procedure,
            None => return Err(ExecError::UnknownProcedure(name.to_string())),
        };
        self.reset(procedure.module, procedure.entry);
        while self.step(sink)? {}
        Ok(())
    }

    /// Expands the named output file into `sink`.
    pub fn call_file<S: Sink>(
        &mut self,
        name: &str,
        sink: &mut S,
    ) -> Result<(), ExecError<S::Error>> {
        let file = match self.linker.files().get(name) {
            Some(file) => *file,
            None => return Err(ExecError::UnknownFile(name.to_string())),
        };
        self.reset(file.module, file.entry);
        while self.step(sink)? {}
        Ok(())
    }

    /// Executes one instruction.  Returns `false` once the program has
    /// terminated on an unmatched `ret`.
    pub fn step<S: Sink>(&mut self, sink: &mut S) -> Result<bool, ExecError<S::Error>> {
        let linker = self.linker;
        let object = linker.object(self.module);
        let site_ip = self.ip;
        let instruction = object.program[site_ip as usize];
        self.ip += 1;

        match instruction {
            Instruction::Ret {
                name_start,
                name_len,
            } => {
                let name = object.span(name_start, name_len as usize);
                match self.stack.pop() {
                    Some(frame) => {
                        self.ip = frame.return_ip;
                        self.module = frame.return_module;
                        self.indent -= frame.indent;
                        sink.ret(name).map_err(ExecError::Sink)?;
                        Ok(true)
                    }
                    None => {
                        sink.terminate(name).map_err(ExecError::Sink)?;
                        Ok(false)
                    }
                }
            }
            Instruction::Call {
                address,
                module,
                indent,
            } => {
                let site_module = self.module;
                if self
                    .stack
                    .iter()
                    .any(|frame| frame.site_module == site_module && frame.site_ip == site_ip)
                {
                    let target = if module == SAME_MODULE { site_module } else { module };
                    let name = self.tag_name_at(target, address);
                    return Err(ExecError::CyclicReference { name });
                }
                self.stack.push(Frame {
                    site_module,
                    site_ip,
                    return_ip: self.ip,
                    return_module: site_module,
                    indent,
                });
                self.indent += indent;
                self.ip = address;
                if module != SAME_MODULE {
                    self.module = module;
                }
                sink.call().map_err(ExecError::Sink)?;
                Ok(true)
            }
            Instruction::Jmp {
                address, module, ..
            } => {
                if module != SAME_MODULE {
                    self.module = module;
                }
                self.ip = address;
                // The newline boundary between chained segments is the
                // jump's to emit; segment tails carry no newline of their
                // own.
                sink.write(b"\n", 0).map_err(ExecError::Sink)?;
                self.last_is_newline = true;
                sink.jmp(address).map_err(ExecError::Sink)?;
                Ok(true)
            }
            Instruction::Write { start, len, nl } => {
                if self.should_indent && self.last_is_newline {
                    sink.indent(self.indent as usize).map_err(ExecError::Sink)?;
                } else {
                    self.should_indent = true;
                }
                let bytes = object.span(start, len as usize);
                sink.write(bytes, nl as usize).map_err(ExecError::Sink)?;
                self.last_is_newline = nl != 0;
                Ok(true)
            }
            Instruction::Shell { .. } => {
                sink.shell().map_err(ExecError::Sink)?;
                Err(ExecError::ShellUnsupported)
            }
        }
    }

    /// Best-effort name of the block owning `address`, for cycle reports:
    /// the name carried by the chain whose entry matches.
    fn tag_name_at(&self, module: u16, address: u32) -> String {
        let object = self.linker.object(module);
        for (name, chain) in &object.adjacent {
            if chain.entry == address {
                return name.clone();
            }
        }
        String::from("?")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbOptions;
    use crate::parser::parse_document;
    use crate::sink::StreamSink;
    use assert_matches::assert_matches;

    fn block(header: &str, body: &[&str]) -> String {
        let mut out = format!("    {}\n    {}\n\n", header, "-".repeat(header.len()));
        for line in body {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn linked(documents: &[(&str, String)]) -> Linker {
        let mut linker = Linker::new();
        for (name, text) in documents {
            let object =
                parse_document(name, text.as_bytes().to_vec(), &DbOptions::default()).unwrap();
            linker.add_object(object);
        }
        linker.link().unwrap();
        linker
    }

    fn expand_tag(linker: &Linker, name: &str) -> String {
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        Interpreter::new(linker).call_tag(name, &mut sink).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn expand_file(linker: &Linker, name: &str) -> String {
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        Interpreter::new(linker)
            .call_file(name, &mut sink)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn single_tag_emission() {
        let linker = linked(&[("a", block("lang: X esc: none tag: #foo", &["abc"]))]);
        assert_eq!(expand_tag(&linker, "foo"), "abc");
    }

    #[test]
    fn cross_object_threading_joins_with_a_newline() {
        let linker = linked(&[
            ("a", block("lang: X esc: none tag: #foo", &["abc"])),
            ("b", block("lang: X esc: none tag: #foo", &["xyz"])),
        ]);
        assert_eq!(expand_tag(&linker, "foo"), "abc\nxyz");
    }

    #[test]
    fn indent_carries_from_the_placeholder_column() {
        let text = format!(
            "{}\n{}",
            block(
                "lang: X esc: <<>> file: example",
                &["pub fn main() void {", "    <<body>>", "}"],
            ),
            block("lang: X esc: none tag: #body", &["a", "b"])
        );
        let linker = linked(&[("a", text)]);
        assert_eq!(
            expand_file(&linker, "example"),
            "pub fn main() void {\n    a\n    b\n}"
        );
    }

    #[test]
    fn nested_indents_accumulate() {
        let text = format!(
            "{}\n{}\n{}",
            block("lang: X esc: <<>> tag: #top", &["  <<mid>>"]),
            block("lang: X esc: <<>> tag: #mid", &["x", "  <<leaf>>"]),
            block("lang: X esc: none tag: #leaf", &["p", "q"])
        );
        let linker = linked(&[("a", text)]);
        assert_eq!(expand_tag(&linker, "top"), "  x\n    p\n    q");
    }

    #[test]
    fn inline_calls_concatenate() {
        let text = format!(
            "{}\n{}\n{}",
            block("lang: X esc: <<>> tag: #pair", &["<<x>><<y>>"]),
            block("lang: X esc: none tag: #x", &["one"]),
            block("lang: X esc: none tag: #y", &["two"])
        );
        let linker = linked(&[("a", text)]);
        assert_eq!(expand_tag(&linker, "pair"), "onetwo");
    }

    #[test]
    fn cycles_are_detected() {
        let text = format!(
            "{}\n{}",
            block("lang: X esc: <<>> tag: #a", &["<<b>>"]),
            block("lang: X esc: <<>> tag: #b", &["<<a>>"])
        );
        let linker = linked(&[("doc", text)]);
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        let result = Interpreter::new(&linker).call_tag("a", &mut sink);
        assert_matches!(result, Err(ExecError::CyclicReference { .. }));
    }

    #[test]
    fn repeated_use_of_a_tag_is_not_a_cycle() {
        let text = format!(
            "{}\n{}",
            block("lang: X esc: <<>> tag: #twice", &["<<x>> and <<x>>"]),
            block("lang: X esc: none tag: #x", &["ha"])
        );
        let linker = linked(&[("a", text)]);
        assert_eq!(expand_tag(&linker, "twice"), "ha and ha");
    }

    #[test]
    fn unknown_names_fail_lookup() {
        let linker = linked(&[("a", block("lang: X esc: none tag: #foo", &["abc"]))]);
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        assert_matches!(
            Interpreter::new(&linker).call_tag("nope", &mut sink),
            Err(ExecError::UnknownProcedure(name)) if name == "nope"
        );
        let mut sink = StreamSink::plain(&mut out);
        assert_matches!(
            Interpreter::new(&linker).call_file("nope", &mut sink),
            Err(ExecError::UnknownFile(name)) if name == "nope"
        );
    }

    #[test]
    fn shell_opcode_is_fatal() {
        let text = format!(
            "{}\n{}",
            block("lang: X esc: <<>> tag: #a", &["<<x|sort>>"]),
            block("lang: X esc: none tag: #x", &["body"])
        );
        let linker = linked(&[("doc", text)]);
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        assert_matches!(
            Interpreter::new(&linker).call_tag("a", &mut sink),
            Err(ExecError::ShellUnsupported)
        );
    }

    #[test]
    fn terminate_reports_the_entry_name() {
        struct Terminated(Option<String>);
        impl Sink for Terminated {
            type Error = std::convert::Infallible;
            fn write(&mut self, _: &[u8], _: usize) -> Result<(), Self::Error> {
                Ok(())
            }
            fn indent(&mut self, _: usize) -> Result<(), Self::Error> {
                Ok(())
            }
            fn terminate(&mut self, name: &[u8]) -> Result<(), Self::Error> {
                self.0 = Some(String::from_utf8_lossy(name).into_owned());
                Ok(())
            }
        }
        let linker = linked(&[("a", block("lang: X esc: none tag: #foo", &["abc"]))]);
        let mut sink = Terminated(None);
        Interpreter::new(&linker).call_tag("foo", &mut sink).unwrap();
        assert_eq!(sink.0.as_deref(), Some("foo"));
    }

    #[test]
    fn indent_returns_to_zero_after_execution() {
        let text = format!(
            "{}\n{}",
            block("lang: X esc: <<>> tag: #outer", &["    <<inner>>"]),
            block("lang: X esc: none tag: #inner", &["x"])
        );
        let linker = linked(&[("a", text)]);
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        let mut interpreter = Interpreter::new(&linker);
        interpreter.call_tag("outer", &mut sink).unwrap();
        assert_eq!(interpreter.indent(), 0);
        assert_eq!(interpreter.depth(), 0);
    }
}
