//! Lowers one literate document into an [`Object`]: a flat instruction
//! program plus the symbol, adjacency and file tables the linker consumes.
//!
//! ## Block recognition
//!
//! Top-level recognition is line-oriented.  A code block is recognized only
//! when, after a blank-line boundary, the next content begins with exactly
//! four spaces of indent followed by the header keyword `lang`.  An indented
//! run that does not open with `lang` is ordinary (non-literate) code and is
//! skipped until it dedents; everything else is prose and is skipped token
//! by token.  The "missing language specification" diagnostic is the
//! sentinel that separates the two cases: it is raised only before `lang`
//! has been seen, and the top-level loop treats it as "skip this block"
//! rather than a failure.
//!
//! ## Codegen
//!
//! Each body line becomes one `write` covering the line's content (the four
//! structural indent spaces are excluded; deeper indentation is content).  A
//! placeholder splits its line: a `write` for the prefix when non-empty, an
//! optional `shell` for the `|filter` form, a `call` whose `indent` payload
//! is the placeholder's column within the line, and scanning resumes after
//! the closing run.  The line's trailing `write` keeps `nl = 1` even when
//! empty, so the newline boundary survives expansion; a *terminal* empty
//! `write` is stripped again when the block ends.
//!
//! Same-named blocks within one document are threaded as they are parsed:
//! the previous segment's `ret` is overwritten with a generation-zero `jmp`
//! to the new segment, and the chain's exit advances.  Threading across
//! documents is the linker's job.

use crate::config::{DbOptions, Delimiter};
use crate::diag::{Diagnostic, ParseError};
use crate::instruction::{Instruction, SAME_MODULE};
use crate::object::{BlockChain, CallSites, FileBlock, Object};
use crate::tokenizer::{Location, Token, TokenKind, Tokenizer};
use fnv::FnvHashMap;
use log::trace;

/// A block's placeholder delimiter: the open and close bytes and the run
/// length both sides must use.
#[derive(Debug, Clone, Copy)]
struct Esc {
    open: TokenKind,
    close: TokenKind,
    len: usize,
}

/// The target named in a block header.
enum Target {
    /// `file: PATH`; the span covers the path bytes.
    File(usize, usize),
    /// `tag: #NAME`; the span covers the name bytes after the hash.
    Tag(usize, usize),
}

fn open_kind_of(byte: u8) -> Option<TokenKind> {
    match byte {
        b'<' => Some(TokenKind::LAngle),
        b'{' => Some(TokenKind::LBrace),
        b'[' => Some(TokenKind::LBracket),
        b'(' => Some(TokenKind::LParen),
        _ => None,
    }
}

fn closing_kind_for(open: TokenKind) -> TokenKind {
    match open {
        TokenKind::LAngle => TokenKind::RAngle,
        TokenKind::LBrace => TokenKind::RBrace,
        TokenKind::LBracket => TokenKind::RBracket,
        TokenKind::LParen => TokenKind::RParen,
        _ => unreachable!("not an opening delimiter"),
    }
}

fn is_closing_kind(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::RAngle | TokenKind::RBrace | TokenKind::RBracket | TokenKind::RParen
    )
}

/// Parses one document into an object owning `text`.
pub fn parse_document(
    name: &str,
    text: Vec<u8>,
    options: &DbOptions,
) -> Result<Object, ParseError> {
    let parsed = Parser::new(&text, options).parse()?;
    trace!(
        "parsed {}: {} instructions, {} tags, {} files",
        name,
        parsed.program.len(),
        parsed.adjacent.len(),
        parsed.files.len()
    );
    Ok(Object {
        name: name.to_string(),
        text,
        program: parsed.program,
        symbols: parsed.symbols,
        adjacent: parsed.adjacent,
        files: parsed.files,
    })
}

/// The parser's output before the text buffer is moved in.
struct Parsed {
    program: Vec<Instruction>,
    symbols: FnvHashMap<String, CallSites>,
    adjacent: FnvHashMap<String, BlockChain>,
    files: FnvHashMap<String, FileBlock>,
}

struct Parser<'a> {
    text: &'a [u8],
    tokens: Tokenizer<'a>,
    peeked: Option<Token>,
    options: &'a DbOptions,
    program: Vec<Instruction>,
    symbols: FnvHashMap<String, CallSites>,
    adjacent: FnvHashMap<String, BlockChain>,
    files: FnvHashMap<String, FileBlock>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a [u8], options: &'a DbOptions) -> Parser<'a> {
        Parser {
            text,
            tokens: Tokenizer::new(text),
            peeked: None,
            options,
            program: Vec::new(),
            symbols: FnvHashMap::default(),
            adjacent: FnvHashMap::default(),
            files: FnvHashMap::default(),
        }
    }

    fn next(&mut self) -> Token {
        match self.peeked.take() {
            Some(token) => token,
            None => self.tokens.next_token(),
        }
    }

    fn peek(&mut self) -> Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.tokens.next_token());
        }
        self.peeked.unwrap()
    }

    fn token_text(&self, token: Token) -> &'a [u8] {
        &self.text[token.start..token.end]
    }

    fn fail(&self, kind: Diagnostic, token: Token) -> ParseError {
        let location = self.tokens.location_from(Location::start(), token.start);
        ParseError {
            kind,
            token,
            location,
        }
    }

    /// An error for a raw byte span no single token covers.
    fn fail_span(&self, kind: Diagnostic, start: usize, end: usize) -> ParseError {
        self.fail(
            kind,
            Token {
                kind: TokenKind::Unknown,
                start,
                end,
            },
        )
    }

    fn location_of(&self, offset: usize) -> Location {
        self.tokens.location_from(Location::start(), offset)
    }

    /// Takes the raw bytes from the cursor to the end of the current line,
    /// leaving the cursor on the newline (or at end of input).
    fn span_to_eol(&mut self) -> (usize, usize) {
        let start = match self.peeked.take() {
            Some(token) => token.start,
            None => self.tokens.position(),
        };
        let end = self.text[start..]
            .iter()
            .position(|&byte| byte == b'\n')
            .map(|at| start + at)
            .unwrap_or(self.text.len());
        self.tokens.set_position(end);
        (start, end)
    }

    // ------------------------------------------------------------------
    // Top-level loop
    // ------------------------------------------------------------------

    fn parse(mut self) -> Result<Parsed, ParseError> {
        // Beginning of input counts as a blank-line boundary.
        let mut at_boundary = true;
        loop {
            let token = self.peek();
            match token.kind {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.next();
                    // An empty line keeps an existing boundary; otherwise two
                    // consecutive newlines are needed to open one.
                    at_boundary = at_boundary || token.len() >= 2;
                }
                TokenKind::Space if at_boundary && token.len() == 4 => {
                    self.next();
                    match self.parse_block(token) {
                        Ok(()) => {}
                        Err(error) if error.kind == Diagnostic::MissingLanguage => {
                            at_boundary = self.skip_indented();
                        }
                        Err(error) => return Err(error),
                    }
                }
                TokenKind::Space if at_boundary && token.len() > 4 => {
                    at_boundary = self.skip_indented();
                }
                _ => {
                    self.next();
                    at_boundary = false;
                }
            }
        }
        Ok(Parsed {
            program: self.program,
            symbols: self.symbols,
            adjacent: self.adjacent,
            files: self.files,
        })
    }

    /// Skips an indented non-literate run: the rest of the current line and
    /// every following line indented four or more spaces.  Returns whether
    /// the skip ended on a blank-line boundary.
    fn skip_indented(&mut self) -> bool {
        loop {
            loop {
                let token = self.peek();
                match token.kind {
                    TokenKind::Eof => return true,
                    TokenKind::Newline => break,
                    _ => {
                        self.next();
                    }
                }
            }
            let newline = self.next();
            if newline.len() >= 2 {
                return true;
            }
            let token = self.peek();
            match token.kind {
                TokenKind::Space if token.len() >= 4 => {
                    self.next();
                }
                TokenKind::Eof => return true,
                _ => return false,
            }
        }
    }

    // ------------------------------------------------------------------
    // Header
    // ------------------------------------------------------------------

    fn expect_colon(&mut self, missing: Diagnostic) -> Result<(), ParseError> {
        let token = self.peek();
        if token.kind != TokenKind::Colon {
            return Err(self.fail(missing, token));
        }
        self.next();
        Ok(())
    }

    /// A header space must be exactly one byte wide.
    fn expect_single_space(&mut self, missing: Diagnostic) -> Result<(), ParseError> {
        let token = self.peek();
        if token.kind != TokenKind::Space {
            return Err(self.fail(missing, token));
        }
        if token.len() != 1 {
            return Err(self.fail(Diagnostic::DoubledSpaceInHeader, token));
        }
        self.next();
        Ok(())
    }

    fn expect_word(&mut self, missing: Diagnostic) -> Result<Token, ParseError> {
        let token = self.peek();
        if token.kind != TokenKind::Word {
            return Err(self.fail(missing, token));
        }
        self.next();
        Ok(token)
    }

    fn expect_keyword(&mut self, keyword: &[u8], missing: Diagnostic) -> Result<(), ParseError> {
        let token = self.peek();
        if token.kind != TokenKind::Word || self.token_text(token) != keyword {
            return Err(self.fail(missing, token));
        }
        self.next();
        Ok(())
    }

    /// Parses one block starting just after its four-space indent, through
    /// header, division line and body, to the trailing blank (or EOF).
    fn parse_block(&mut self, indent: Token) -> Result<(), ParseError> {
        let header_start = indent.end;
        let header_location = self.location_of(header_start);

        // Anything that is not `lang` here is a non-literate block; the
        // sentinel sends the caller into skip mode.
        self.expect_keyword(b"lang", Diagnostic::MissingLanguage)?;
        self.expect_colon(Diagnostic::ExpectedColonAfterLang)?;
        self.expect_single_space(Diagnostic::ExpectedSpaceAfterLangColon)?;
        self.expect_word(Diagnostic::ExpectedLanguageName)?;
        self.expect_single_space(Diagnostic::ExpectedSpaceAfterLanguage)?;

        self.expect_keyword(b"esc", Diagnostic::ExpectedEscKeyword)?;
        self.expect_colon(Diagnostic::ExpectedColonAfterEsc)?;
        self.expect_single_space(Diagnostic::ExpectedSpaceAfterEscColon)?;
        let esc = self.parse_esc_spec()?;
        self.expect_single_space(Diagnostic::ExpectedSpaceAfterEsc)?;

        let target = self.parse_target()?;

        // The declared escape may be overridden for the whole run.
        let esc = match self.options.delimiter {
            None => esc,
            Some(Delimiter::Ignore) => None,
            Some(delimiter) => delimiter.class().map(|(open, _)| {
                let open = open_kind_of(open).expect("delimiter classes are bracket bytes");
                Esc {
                    open,
                    close: closing_kind_for(open),
                    len: 2,
                }
            }),
        };

        // Division line: next line, same indent, dashes matching the header
        // line's byte length.
        let newline = self.peek();
        if newline.kind != TokenKind::Newline {
            return Err(self.fail(Diagnostic::ExpectedNewlineAfterHeader, newline));
        }
        let header_len = newline.start - header_start;
        if newline.len() >= 2 {
            return Err(self.fail(Diagnostic::BlankLineBeforeDivision, newline));
        }
        self.next();

        let division_indent = self.peek();
        if division_indent.kind != TokenKind::Space || division_indent.len() != 4 {
            return Err(self.fail(Diagnostic::ExpectedDivisionIndent, division_indent));
        }
        self.next();
        let division = self.peek();
        if division.kind != TokenKind::Line {
            return Err(self.fail(Diagnostic::ExpectedDivisionLine, division));
        }
        if division.len() < header_len {
            return Err(self.fail(Diagnostic::DivisionLineTooShort, division));
        }
        if division.len() > header_len {
            return Err(self.fail(Diagnostic::DivisionLineTooLong, division));
        }
        self.next();

        // At least one full empty line before the body; a document may also
        // simply end here.
        let mut has_body = true;
        let token = self.peek();
        match token.kind {
            TokenKind::Eof => has_body = false,
            TokenKind::Newline if token.len() >= 2 => {
                self.next();
            }
            TokenKind::Newline => {
                self.next();
                if self.peek().kind == TokenKind::Eof {
                    has_body = false;
                } else {
                    return Err(self.fail(Diagnostic::MissingBlankAfterDivision, token));
                }
            }
            _ => return Err(self.fail(Diagnostic::ExpectedNewlineAfterDivision, token)),
        }

        let body_entry = self.program.len() as u32;
        if has_body {
            self.parse_body(&esc)?;
        }
        self.finish_block(target, body_entry, header_location)
    }

    /// `none`, or an opening run and a closing run of equal length from the
    /// same bracket family.
    fn parse_esc_spec(&mut self) -> Result<Option<Esc>, ParseError> {
        let token = self.peek();
        if token.kind == TokenKind::Word && self.token_text(token) == b"none" {
            self.next();
            return Ok(None);
        }
        let open = token.kind;
        if !matches!(
            open,
            TokenKind::LAngle | TokenKind::LBrace | TokenKind::LBracket | TokenKind::LParen
        ) {
            return Err(self.fail(Diagnostic::ExpectedEscDelimiters, token));
        }
        let mut open_len = 0;
        while self.peek().kind == open {
            self.next();
            open_len += 1;
        }
        let close_token = self.peek();
        let close = closing_kind_for(open);
        if close_token.kind != close {
            let kind = if is_closing_kind(close_token.kind) {
                Diagnostic::MismatchedEscDelimiters
            } else {
                Diagnostic::ExpectedEscDelimiters
            };
            return Err(self.fail(kind, close_token));
        }
        let mut close_len = 0;
        while self.peek().kind == close {
            self.next();
            close_len += 1;
        }
        if close_len != open_len {
            return Err(self.fail(Diagnostic::UnbalancedEscDelimiters, close_token));
        }
        Ok(Some(Esc {
            open,
            close,
            len: open_len,
        }))
    }

    fn parse_target(&mut self) -> Result<Target, ParseError> {
        let token = self.peek();
        if token.kind != TokenKind::Word {
            return Err(self.fail(Diagnostic::ExpectedTarget, token));
        }
        match self.token_text(token) {
            b"file" => {
                self.next();
                self.expect_colon(Diagnostic::ExpectedColonAfterFile)?;
                self.expect_single_space(Diagnostic::ExpectedSpaceAfterFileColon)?;
                let (start, end) = self.span_to_eol();
                if start == end {
                    return Err(self.fail_span(Diagnostic::ExpectedFilePath, start, end));
                }
                self.validate_path(start, end)?;
                Ok(Target::File(start, end))
            }
            b"tag" => {
                self.next();
                self.expect_colon(Diagnostic::ExpectedColonAfterTag)?;
                self.expect_single_space(Diagnostic::ExpectedSpaceAfterTagColon)?;
                let hash = self.peek();
                if hash.kind != TokenKind::Hash {
                    return Err(self.fail(Diagnostic::ExpectedHashBeforeTagName, hash));
                }
                self.next();
                let (start, end) = self.span_to_eol();
                if start == end {
                    return Err(self.fail_span(Diagnostic::ExpectedTagName, start, end));
                }
                Ok(Target::Tag(start, end))
            }
            _ => Err(self.fail(Diagnostic::ExpectedTarget, token)),
        }
    }

    /// Rejects parent and current-directory references unless the dot is
    /// part of a longer dot run (`.../` is ordinary content), and absolute
    /// paths unless the option permits them.
    fn validate_path(&self, start: usize, end: usize) -> Result<(), ParseError> {
        let path = &self.text[start..end];
        if matches!(path.first(), Some(b'/') | Some(b'~')) && !self.options.allow_absolute_paths {
            return Err(self.fail_span(Diagnostic::AbsolutePathForbidden, start, start + 1));
        }
        for at in 0..path.len() {
            let rest = &path[at..];
            let after_dot = at > 0 && path[at - 1] == b'.';
            if after_dot {
                continue;
            }
            if rest.starts_with(b"../") || rest.starts_with(b"..\\") {
                return Err(self.fail_span(Diagnostic::PathTraversesParent, start + at, start + at + 3));
            }
            if rest.starts_with(b"./") || rest.starts_with(b".\\") {
                return Err(self.fail_span(Diagnostic::PathTraversesCurrent, start + at, start + at + 2));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Body
    // ------------------------------------------------------------------

    fn parse_body(&mut self, esc: &Option<Esc>) -> Result<(), ParseError> {
        loop {
            let token = self.peek();
            match token.kind {
                TokenKind::Eof => return Ok(()),
                TokenKind::Space if token.len() >= 4 => {
                    self.next();
                    self.parse_body_line(token, esc)?;
                    let newline = self.peek();
                    match newline.kind {
                        TokenKind::Eof => return Ok(()),
                        TokenKind::Newline => {
                            self.next();
                            if newline.len() >= 2 {
                                return Ok(());
                            }
                        }
                        _ => unreachable!("body lines stop at newline or end of input"),
                    }
                }
                _ => return Err(self.fail(Diagnostic::MissingBlankAfterBlock, token)),
            }
        }
    }

    /// One body line, already positioned after its indent token.  The first
    /// four spaces are structure; anything beyond them is content.
    fn parse_body_line(&mut self, indent: Token, esc: &Option<Esc>) -> Result<(), ParseError> {
        let content_start = indent.start + 4;
        let mut segment_start = content_start;
        loop {
            let token = self.peek();
            match token.kind {
                TokenKind::Newline | TokenKind::Eof => {
                    // The trailing write keeps its newline even when empty;
                    // block finalization strips it if it ends the block.
                    self.emit_write(segment_start, token.start - segment_start, 1);
                    return Ok(());
                }
                kind if esc.map(|esc| esc.open == kind).unwrap_or(false) => {
                    let esc = esc.as_ref().unwrap();
                    let run_start = token.start;
                    let mut run = 0;
                    while self.peek().kind == kind {
                        self.next();
                        run += 1;
                    }
                    if run < esc.len {
                        // A shorter run is plain text and stays inside the
                        // current write segment.
                        continue;
                    }
                    if run > esc.len {
                        return Err(self.fail_span(
                            Diagnostic::MismatchedDelimiterRun,
                            run_start,
                            run_start + run,
                        ));
                    }
                    if run_start > segment_start {
                        self.emit_write(segment_start, run_start - segment_start, 0);
                    }
                    segment_start = self.parse_placeholder(esc, run_start, content_start)?;
                }
                _ => {
                    self.next();
                }
            }
        }
    }

    /// The innards of one placeholder, from just after the opening run to
    /// just after the closing run.  Returns the offset scanning resumes at.
    fn parse_placeholder(
        &mut self,
        esc: &Esc,
        open_start: usize,
        content_start: usize,
    ) -> Result<usize, ParseError> {
        // The name extends until `|`, `:` or the closing delimiter.
        let name_start = self.peek().start;
        loop {
            let token = self.peek();
            match token.kind {
                TokenKind::Newline => {
                    return Err(self.fail(Diagnostic::UnexpectedNewlineInPlaceholder, token))
                }
                TokenKind::Eof => {
                    return Err(self.fail(Diagnostic::UnexpectedEofInPlaceholder, token))
                }
                TokenKind::Pipe | TokenKind::Colon => break,
                kind if kind == esc.close => break,
                _ => {
                    self.next();
                }
            }
        }
        let terminator = self.peek();
        let name_end = terminator.start;
        if name_end == name_start {
            return Err(self.fail(Diagnostic::ExpectedPlaceholderName, terminator));
        }
        let name = String::from_utf8_lossy(&self.text[name_start..name_end]).into_owned();

        // Optional `:from(type)` cast; syntactic only.
        let mut token = self.peek();
        if token.kind == TokenKind::Colon {
            self.next();
            self.expect_keyword(b"from", Diagnostic::ExpectedCastKeyword)?;
            let paren = self.peek();
            if paren.kind != TokenKind::LParen {
                return Err(self.fail(Diagnostic::ExpectedCastOpenParen, paren));
            }
            self.next();
            self.expect_word(Diagnostic::ExpectedCastType)?;
            let paren = self.peek();
            if paren.kind != TokenKind::RParen {
                return Err(self.fail(Diagnostic::ExpectedCastCloseParen, paren));
            }
            self.next();
            token = self.peek();
        }

        // Optional `|filter`.
        let mut shell = None;
        if token.kind == TokenKind::Pipe {
            self.next();
            let word = self.peek();
            if word.kind != TokenKind::Word {
                return Err(self.fail(Diagnostic::ExpectedShellWord, word));
            }
            self.next();
            shell = Some((word.start as u32, word.len() as u8));
            token = self.peek();
        }

        // Closing run, exactly the declared length.
        match token.kind {
            TokenKind::Newline => {
                return Err(self.fail(Diagnostic::UnexpectedNewlineInPlaceholder, token))
            }
            TokenKind::Eof => return Err(self.fail(Diagnostic::UnexpectedEofInPlaceholder, token)),
            kind if kind == esc.close => {}
            _ => return Err(self.fail(Diagnostic::ExpectedClosingDelimiter, token)),
        }
        let close_start = token.start;
        let mut run = 0;
        while self.peek().kind == esc.close {
            self.next();
            run += 1;
        }
        if run != esc.len {
            return Err(self.fail_span(
                Diagnostic::MismatchedDelimiterRun,
                close_start,
                close_start + run,
            ));
        }

        if let Some((command, len)) = shell {
            self.program.push(Instruction::Shell {
                command,
                module: SAME_MODULE,
                len,
            });
        }
        let call_index = self.program.len() as u32;
        self.program.push(Instruction::Call {
            address: 0,
            module: SAME_MODULE,
            indent: (open_start - content_start) as u16,
        });
        self.symbols.entry(name).or_default().push(call_index);
        Ok(close_start + run)
    }

    /// Emits a write, splitting spans too long for the 16-bit length field.
    /// Zero-length prefix writes are never routed here; zero-length trailing
    /// writes are, deliberately.
    fn emit_write(&mut self, start: usize, len: usize, nl: u16) {
        let mut start = start;
        let mut len = len;
        while len > u16::MAX as usize {
            self.program.push(Instruction::Write {
                start: start as u32,
                len: u16::MAX,
                nl: 0,
            });
            start += u16::MAX as usize;
            len -= u16::MAX as usize;
        }
        self.program.push(Instruction::Write {
            start: start as u32,
            len: len as u16,
            nl,
        });
    }

    // ------------------------------------------------------------------
    // Block finalization
    // ------------------------------------------------------------------

    fn finish_block(
        &mut self,
        target: Target,
        body_entry: u32,
        location: Location,
    ) -> Result<(), ParseError> {
        // Strip a terminal zero-length write, then clear the newline on the
        // last write if one still ends the body: the newline between chained
        // segments is the jump's to emit, and a file's trailing newline is
        // the stream sink's.
        if self.program.len() as u32 > body_entry {
            if let Some(Instruction::Write { len: 0, .. }) = self.program.last() {
                self.program.pop();
            }
        }
        if self.program.len() as u32 > body_entry {
            if let Some(Instruction::Write { nl, .. }) = self.program.last_mut() {
                *nl = 0;
            }
        }

        let exit = self.program.len() as u32;
        let (name_start, name_end) = match target {
            Target::File(start, end) => {
                let name = String::from_utf8_lossy(&self.text[start..end]).into_owned();
                if self.files.contains_key(&name) {
                    return Err(self.fail_span(
                        Diagnostic::DuplicateFileInObject(name),
                        start,
                        end,
                    ));
                }
                trace!("file block '{}' entry={}", name, body_entry);
                self.files.insert(
                    name,
                    FileBlock {
                        entry: body_entry,
                        location,
                    },
                );
                (start, end)
            }
            Target::Tag(start, end) => {
                let name = String::from_utf8_lossy(&self.text[start..end]).into_owned();
                match self.adjacent.get_mut(&name) {
                    Some(chain) => {
                        // Thread the in-document chain: the previous
                        // segment's ret becomes a jump to this one.
                        self.program[chain.exit as usize] = Instruction::Jmp {
                            address: body_entry,
                            module: SAME_MODULE,
                            generation: 0,
                        };
                        trace!("tag block '{}' continues at {}", name, body_entry);
                        chain.exit = exit;
                    }
                    None => {
                        trace!("tag block '{}' entry={}", name, body_entry);
                        self.adjacent.insert(
                            name,
                            BlockChain {
                                entry: body_entry,
                                exit,
                                location,
                            },
                        );
                    }
                }
                (start, end)
            }
        };
        self.program.push(Instruction::Ret {
            name_start: name_start as u32,
            name_len: (name_end - name_start) as u16,
        });
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Builds one block with a correctly sized division line.
    fn block(header: &str, body: &[&str]) -> String {
        let mut out = format!("    {}\n    {}\n\n", header, "-".repeat(header.len()));
        for line in body {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn parse(text: &str) -> Result<Object, ParseError> {
        parse_document("test", text.as_bytes().to_vec(), &DbOptions::default())
    }

    fn parse_ok(text: &str) -> Object {
        match parse(text) {
            Ok(object) => object,
            Err(error) => panic!("unexpected parse failure: {}", error),
        }
    }

    fn body_text(object: &Object, instruction: &Instruction) -> String {
        match *instruction {
            Instruction::Write { start, len, .. } => {
                String::from_utf8_lossy(object.span(start, len as usize)).into_owned()
            }
            ref other => panic!("expected a write, found {}", other),
        }
    }

    #[test]
    fn single_tag_block_lowers_to_write_ret() {
        let object = parse_ok(&block("lang: X esc: none tag: #foo", &["abc"]));
        assert_eq!(object.program.len(), 2);
        assert_matches!(object.program[0], Instruction::Write { len: 3, nl: 0, .. });
        assert_matches!(object.program[1], Instruction::Ret { name_len: 3, .. });
        assert_eq!(body_text(&object, &object.program[0]), "abc");
        let chain = &object.adjacent["foo"];
        assert_eq!((chain.entry, chain.exit), (0, 1));
    }

    #[test]
    fn ret_names_the_block() {
        let object = parse_ok(&block("lang: X esc: none tag: #foo", &["abc"]));
        match object.program[1] {
            Instruction::Ret {
                name_start,
                name_len,
            } => assert_eq!(object.span(name_start, name_len as usize), b"foo"),
            ref other => panic!("expected ret, found {}", other),
        }
    }

    #[test]
    fn interior_lines_keep_their_newlines() {
        let object = parse_ok(&block("lang: X esc: none tag: #foo", &["abc", "xyz"]));
        assert_eq!(object.program.len(), 3);
        assert_matches!(object.program[0], Instruction::Write { len: 3, nl: 1, .. });
        assert_matches!(object.program[1], Instruction::Write { len: 3, nl: 0, .. });
    }

    #[test]
    fn blocks_require_a_preceding_blank_line() {
        let text = format!("prose\n{}", block("lang: X esc: none tag: #foo", &["abc"]));
        let object = parse_ok(&text);
        // Without the blank boundary the indented run is skipped as prose.
        assert!(object.adjacent.is_empty());
        assert!(object.program.is_empty());
    }

    #[test]
    fn non_literate_indented_blocks_are_skipped() {
        let text = format!(
            "    fn main() {{}}\n    more code\n\n{}",
            block("lang: X esc: none tag: #foo", &["abc"])
        );
        let object = parse_ok(&text);
        assert_eq!(object.adjacent.len(), 1);
        assert!(object.adjacent.contains_key("foo"));
    }

    #[test]
    fn prose_between_blocks_is_ignored() {
        let text = format!(
            "Intro prose.\n\n{}\nMore prose, deeper thoughts.\n\n{}",
            block("lang: X esc: none tag: #a", &["one"]),
            block("lang: X esc: none tag: #b", &["two"])
        );
        let object = parse_ok(&text);
        assert_eq!(object.adjacent.len(), 2);
    }

    #[test]
    fn placeholder_splits_the_line() {
        let object = parse_ok(&block("lang: X esc: <<>> tag: #a", &["pre<<x>>post"]));
        assert_eq!(object.program.len(), 4);
        assert_matches!(object.program[0], Instruction::Write { len: 3, nl: 0, .. });
        assert_matches!(
            object.program[1],
            Instruction::Call {
                address: 0,
                module: 0,
                indent: 3
            }
        );
        assert_matches!(object.program[2], Instruction::Write { len: 4, nl: 0, .. });
        assert_matches!(object.program[3], Instruction::Ret { .. });
        assert_eq!(&object.symbols["x"][..], &[1]);
    }

    #[test]
    fn two_inline_placeholders_compile_to_call_call_ret() {
        let object = parse_ok(&block("lang: X esc: <<>> tag: #a", &["<<x>><<y>>"]));
        assert_eq!(object.program.len(), 3);
        assert_matches!(object.program[0], Instruction::Call { indent: 0, .. });
        assert_matches!(object.program[1], Instruction::Call { indent: 5, .. });
        assert_matches!(object.program[2], Instruction::Ret { .. });
    }

    #[test]
    fn placeholder_column_becomes_the_call_indent() {
        let object = parse_ok(&block(
            "lang: X esc: <<>> file: out",
            &["head", "    <<x>>", "tail"],
        ));
        assert_matches!(object.program[0], Instruction::Write { len: 4, nl: 1, .. });
        assert_matches!(object.program[1], Instruction::Write { len: 4, nl: 0, .. });
        assert_matches!(object.program[2], Instruction::Call { indent: 4, .. });
        assert_matches!(object.program[3], Instruction::Write { len: 0, nl: 1, .. });
        assert!(object.files.contains_key("out"));
    }

    #[test]
    fn cast_form_parses_without_codegen_effect() {
        let object = parse_ok(&block("lang: X esc: <<>> tag: #a", &["<<x:from(int)>>"]));
        assert_eq!(object.program.len(), 2);
        assert_matches!(object.program[0], Instruction::Call { .. });
        assert_eq!(&object.symbols["x"][..], &[0]);
    }

    #[test]
    fn shell_form_emits_shell_before_call() {
        let object = parse_ok(&block("lang: X esc: <<>> tag: #a", &["<<x|tr>>"]));
        assert_eq!(object.program.len(), 3);
        assert_matches!(object.program[0], Instruction::Shell { len: 2, .. });
        assert_matches!(object.program[1], Instruction::Call { .. });
        assert_eq!(&object.symbols["x"][..], &[1]);
    }

    #[test]
    fn cast_and_shell_combine() {
        let object = parse_ok(&block("lang: X esc: <<>> tag: #a", &["<<x:from(u8)|sort>>"]));
        assert_matches!(object.program[0], Instruction::Shell { len: 4, .. });
        assert_matches!(object.program[1], Instruction::Call { .. });
    }

    #[test]
    fn same_name_blocks_thread_within_a_document() {
        let text = format!(
            "{}\n{}",
            block("lang: X esc: none tag: #foo", &["abc"]),
            block("lang: X esc: none tag: #foo", &["xyz"])
        );
        let object = parse_ok(&text);
        // First segment's ret was overwritten with a generation-zero jump to
        // the second segment.
        assert_matches!(
            object.program[1],
            Instruction::Jmp {
                address: 2,
                module: 0,
                generation: 0
            }
        );
        assert_matches!(object.program[3], Instruction::Ret { .. });
        let chain = &object.adjacent["foo"];
        assert_eq!((chain.entry, chain.exit), (0, 3));
    }

    #[test]
    fn division_line_length_is_checked_both_ways() {
        let short = parse("    lang: X esc: none tag: #foo\n    -----\n\n    abc\n");
        assert_matches!(
            short,
            Err(ParseError {
                kind: Diagnostic::DivisionLineTooShort,
                ..
            })
        );
        let long = parse(
            "    lang: X esc: none tag: #foo\n    {}\n\n    abc\n"
                .replace("{}", &"-".repeat(40))
                .as_str(),
        );
        assert_matches!(
            long,
            Err(ParseError {
                kind: Diagnostic::DivisionLineTooLong,
                ..
            })
        );
    }

    #[test]
    fn header_spaces_must_be_single() {
        let error = parse(&block("lang:  X esc: none tag: #foo", &["abc"])).unwrap_err();
        assert_eq!(error.kind, Diagnostic::DoubledSpaceInHeader);
    }

    #[test]
    fn esc_spec_families_and_counts_must_match() {
        let unbalanced = parse(&block("lang: X esc: <<> tag: #foo", &["abc"]));
        assert_matches!(
            unbalanced,
            Err(ParseError {
                kind: Diagnostic::UnbalancedEscDelimiters,
                ..
            })
        );
        let crossed = parse(&block("lang: X esc: <<}} tag: #foo", &["abc"]));
        assert_matches!(
            crossed,
            Err(ParseError {
                kind: Diagnostic::MismatchedEscDelimiters,
                ..
            })
        );
    }

    #[test]
    fn every_bracket_family_is_accepted() {
        for (spec, body, name) in [
            ("{{}}", "{{x}}", "x"),
            ("[[]]", "[[y]]", "y"),
            ("(())", "((z))", "z"),
        ] {
            let header = format!("lang: X esc: {} tag: #a", spec);
            let object = parse_ok(&block(&header, &[body]));
            assert!(object.symbols.contains_key(name), "family {}", spec);
        }
    }

    #[test]
    fn paths_may_not_traverse_upward() {
        let parent = parse(&block("lang: X esc: none file: ../out", &["abc"]));
        assert_matches!(
            parent,
            Err(ParseError {
                kind: Diagnostic::PathTraversesParent,
                ..
            })
        );
        let current = parse(&block("lang: X esc: none file: ./out", &["abc"]));
        assert_matches!(
            current,
            Err(ParseError {
                kind: Diagnostic::PathTraversesCurrent,
                ..
            })
        );
        let nested = parse(&block("lang: X esc: none file: src/../out", &["abc"]));
        assert_matches!(
            nested,
            Err(ParseError {
                kind: Diagnostic::PathTraversesParent,
                ..
            })
        );
        // A longer dot run is ordinary content.
        assert!(parse(&block("lang: X esc: none file: .../out", &["abc"])).is_ok());
    }

    #[test]
    fn absolute_paths_need_the_option() {
        let text = block("lang: X esc: none file: /out", &["abc"]);
        assert_matches!(
            parse(&text),
            Err(ParseError {
                kind: Diagnostic::AbsolutePathForbidden,
                ..
            })
        );
        let options = DbOptions {
            allow_absolute_paths: true,
            ..DbOptions::default()
        };
        assert!(parse_document("test", text.as_bytes().to_vec(), &options).is_ok());
    }

    #[test]
    fn duplicate_file_in_one_document_is_fatal() {
        let text = format!(
            "{}\n{}",
            block("lang: X esc: none file: out", &["a"]),
            block("lang: X esc: none file: out", &["b"])
        );
        assert_matches!(
            parse(&text),
            Err(ParseError {
                kind: Diagnostic::DuplicateFileInObject(_),
                ..
            })
        );
    }

    #[test]
    fn placeholders_must_close_on_their_line() {
        let text = block("lang: X esc: <<>> tag: #a", &["<<x"]);
        assert_matches!(
            parse(&text),
            Err(ParseError {
                kind: Diagnostic::UnexpectedNewlineInPlaceholder,
                ..
            })
        );
    }

    #[test]
    fn delimiter_runs_must_match_declared_length() {
        let text = block("lang: X esc: <<>> tag: #a", &["<<<x>>"]);
        assert_matches!(
            parse(&text),
            Err(ParseError {
                kind: Diagnostic::MismatchedDelimiterRun,
                ..
            })
        );
    }

    #[test]
    fn short_delimiter_runs_are_plain_text() {
        let object = parse_ok(&block("lang: X esc: <<>> tag: #a", &["a < b"]));
        assert_eq!(object.program.len(), 2);
        assert_eq!(body_text(&object, &object.program[0]), "a < b");
    }

    #[test]
    fn esc_none_disables_recognition() {
        let object = parse_ok(&block("lang: X esc: none tag: #a", &["<<x>>"]));
        assert_eq!(object.program.len(), 2);
        assert_eq!(body_text(&object, &object.program[0]), "<<x>>");
        assert!(object.symbols.is_empty());
    }

    #[test]
    fn delimiter_override_rules_every_block() {
        let text = block("lang: X esc: <<>> tag: #a", &["{{x}}<<y>>"]);
        let options = DbOptions {
            delimiter: Some(Delimiter::Brace),
            ..DbOptions::default()
        };
        let object = parse_document("test", text.as_bytes().to_vec(), &options).unwrap();
        assert_eq!(object.symbols.len(), 1);
        assert!(object.symbols.contains_key("x"));
        let ignore = DbOptions {
            delimiter: Some(Delimiter::Ignore),
            ..DbOptions::default()
        };
        let object = parse_document("test", text.as_bytes().to_vec(), &ignore).unwrap();
        assert!(object.symbols.is_empty());
    }

    #[test]
    fn dedent_without_blank_is_reported() {
        let text = format!("{}prose\n", block("lang: X esc: none tag: #a", &["abc"]));
        assert_matches!(
            parse(&text),
            Err(ParseError {
                kind: Diagnostic::MissingBlankAfterBlock,
                ..
            })
        );
    }

    #[test]
    fn names_may_contain_spaces() {
        let object = parse_ok(&block(
            "lang: X esc: <<>> tag: #parse the header",
            &["<<read a token>>"],
        ));
        assert!(object.adjacent.contains_key("parse the header"));
        assert!(object.symbols.contains_key("read a token"));
    }

    #[test]
    fn error_locations_are_one_based() {
        let error = parse("    lang X esc: none tag: #a\n").unwrap_err();
        assert_eq!(error.kind, Diagnostic::ExpectedColonAfterLang);
        assert_eq!(error.location.line, 1);
        assert_eq!(error.location.column, 9);
    }
}
