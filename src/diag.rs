//! Diagnostics: the parser's named failure kinds, source-located parse
//! errors, and terminal rendering.
//!
//! Every production in the block grammar fails with its own kind so that a
//! report names exactly the byte that broke and what was expected there.
//! Failures are fatal upward: the parser records the offending token for
//! reporting but never recovers, and the driver prints a
//! `name:line:col: message` line (plus an annotated snippet of the source
//! line) and exits non-zero.

use crate::interp::ExecError;
use crate::linker::LinkError;
use crate::tokenizer::{Location, Token};
use annotate_snippets::display_list::{DisplayList, FormatOptions};
use annotate_snippets::snippet::{Annotation, AnnotationType, Slice, Snippet, SourceAnnotation};
use std::error::Error;
use std::fmt;
use std::io;

/// Every named way a document can fail to parse.
///
/// The `MissingLanguage` kind doubles as the sentinel that distinguishes "an
/// indented run that is not a literate block" (skipped) from a malformed
/// header (fatal): it is only raised before the `lang` keyword has been
/// seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    // Header shape.
    MissingLanguage,
    ExpectedColonAfterLang,
    ExpectedSpaceAfterLangColon,
    ExpectedLanguageName,
    ExpectedSpaceAfterLanguage,
    DoubledSpaceInHeader,
    ExpectedEscKeyword,
    ExpectedColonAfterEsc,
    ExpectedSpaceAfterEscColon,
    ExpectedEscDelimiters,
    UnbalancedEscDelimiters,
    MismatchedEscDelimiters,
    ExpectedSpaceAfterEsc,
    ExpectedTarget,
    ExpectedColonAfterFile,
    ExpectedSpaceAfterFileColon,
    ExpectedFilePath,
    ExpectedColonAfterTag,
    ExpectedSpaceAfterTagColon,
    ExpectedHashBeforeTagName,
    ExpectedTagName,
    ExpectedNewlineAfterHeader,
    BlankLineBeforeDivision,
    ExpectedDivisionIndent,
    ExpectedDivisionLine,
    DivisionLineTooShort,
    DivisionLineTooLong,
    ExpectedNewlineAfterDivision,
    MissingBlankAfterDivision,

    // Path shape.
    PathTraversesParent,
    PathTraversesCurrent,
    AbsolutePathForbidden,

    // Placeholder shape.
    UnexpectedNewlineInPlaceholder,
    UnexpectedEofInPlaceholder,
    ExpectedPlaceholderName,
    MismatchedDelimiterRun,
    ExpectedClosingDelimiter,
    ExpectedCastKeyword,
    ExpectedCastOpenParen,
    ExpectedCastType,
    ExpectedCastCloseParen,
    ExpectedShellWord,

    // Block boundary.
    MissingBlankAfterBlock,
    DuplicateFileInObject(String),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message = match self {
            Diagnostic::MissingLanguage => "missing language specification",
            Diagnostic::ExpectedColonAfterLang => "expected ':' after 'lang'",
            Diagnostic::ExpectedSpaceAfterLangColon => "expected a space after 'lang:'",
            Diagnostic::ExpectedLanguageName => "expected a language name",
            Diagnostic::ExpectedSpaceAfterLanguage => "expected a space after the language name",
            Diagnostic::DoubledSpaceInHeader => "expected exactly one space here",
            Diagnostic::ExpectedEscKeyword => "expected 'esc'",
            Diagnostic::ExpectedColonAfterEsc => "expected ':' after 'esc'",
            Diagnostic::ExpectedSpaceAfterEscColon => "expected a space after 'esc:'",
            Diagnostic::ExpectedEscDelimiters => {
                "expected 'none' or a delimiter pair such as <<>>"
            }
            Diagnostic::UnbalancedEscDelimiters => {
                "opening and closing delimiter runs differ in length"
            }
            Diagnostic::MismatchedEscDelimiters => {
                "closing delimiter is from a different bracket family"
            }
            Diagnostic::ExpectedSpaceAfterEsc => "expected a space after the escape specification",
            Diagnostic::ExpectedTarget => "expected 'file' or 'tag'",
            Diagnostic::ExpectedColonAfterFile => "expected ':' after 'file'",
            Diagnostic::ExpectedSpaceAfterFileColon => "expected a space after 'file:'",
            Diagnostic::ExpectedFilePath => "expected an output file path",
            Diagnostic::ExpectedColonAfterTag => "expected ':' after 'tag'",
            Diagnostic::ExpectedSpaceAfterTagColon => "expected a space after 'tag:'",
            Diagnostic::ExpectedHashBeforeTagName => "expected '#' before the tag name",
            Diagnostic::ExpectedTagName => "expected a tag name",
            Diagnostic::ExpectedNewlineAfterHeader => "expected a newline after the header",
            Diagnostic::BlankLineBeforeDivision => {
                "the division line must follow the header immediately"
            }
            Diagnostic::ExpectedDivisionIndent => "expected four spaces before the division line",
            Diagnostic::ExpectedDivisionLine => "expected a division line of '-'",
            Diagnostic::DivisionLineTooShort => "division line is shorter than the header",
            Diagnostic::DivisionLineTooLong => "division line is longer than the header",
            Diagnostic::ExpectedNewlineAfterDivision => {
                "expected a newline after the division line"
            }
            Diagnostic::MissingBlankAfterDivision => {
                "expected a blank line after the division line"
            }
            Diagnostic::PathTraversesParent => "file path refers to a parent directory",
            Diagnostic::PathTraversesCurrent => "file path refers to the current directory",
            Diagnostic::AbsolutePathForbidden => {
                "absolute file paths require --allow-absolute-paths"
            }
            Diagnostic::UnexpectedNewlineInPlaceholder => "unexpected newline inside a placeholder",
            Diagnostic::UnexpectedEofInPlaceholder => "unexpected end of input inside a placeholder",
            Diagnostic::ExpectedPlaceholderName => "expected a placeholder name",
            Diagnostic::MismatchedDelimiterRun => {
                "delimiter run does not match the declared length"
            }
            Diagnostic::ExpectedClosingDelimiter => "expected the closing delimiter",
            Diagnostic::ExpectedCastKeyword => "expected 'from' after ':'",
            Diagnostic::ExpectedCastOpenParen => "expected '(' after 'from'",
            Diagnostic::ExpectedCastType => "expected a type word",
            Diagnostic::ExpectedCastCloseParen => "expected ')' after the type word",
            Diagnostic::ExpectedShellWord => "expected a shell filter word after '|'",
            Diagnostic::MissingBlankAfterBlock => "expected a blank line after the block",
            Diagnostic::DuplicateFileInObject(name) => {
                return write!(f, "file '{}' is declared twice in this document", name)
            }
        };
        f.write_str(message)
    }
}

/// A fatal parse failure: the kind, the token under the cursor when it was
/// detected, and that token's source location.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub kind: Diagnostic,
    pub token: Token,
    pub location: Location,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.kind)
    }
}

impl Error for ParseError {}

/// Renders a parse error as an annotated snippet of the offending source
/// line.  Used by the driver; the returned string is ready to print.
pub fn render_snippet(origin: &str, text: &[u8], error: &ParseError) -> String {
    let location = error.location;
    let line_start = location.offset - (location.column as usize - 1);
    let line_end = text[line_start..]
        .iter()
        .position(|&byte| byte == b'\n')
        .map(|at| line_start + at)
        .unwrap_or(text.len());
    let source = String::from_utf8_lossy(&text[line_start..line_end]);
    let message = error.kind.to_string();

    let mut annotations = Vec::new();
    let from = (location.column as usize - 1).min(source.len());
    let to = (from + error.token.len().max(1)).min(source.len());
    if from < to {
        annotations.push(SourceAnnotation {
            range: (from, to),
            label: &message,
            annotation_type: AnnotationType::Error,
        });
    }

    let snippet = Snippet {
        title: Some(Annotation {
            label: Some(&message),
            id: None,
            annotation_type: AnnotationType::Error,
        }),
        footer: vec![],
        slices: vec![Slice {
            source: &source,
            line_start: location.line as usize,
            origin: Some(origin),
            fold: false,
            annotations,
        }],
        opt: FormatOptions {
            color: true,
            ..Default::default()
        },
    };
    DisplayList::from(snippet).to_string()
}

/// Any failure surfaced by the database: parse, link, execution, or I/O.
#[derive(Debug)]
pub enum WeftError {
    Parse {
        object: String,
        error: ParseError,
        snippet: String,
    },
    Link(LinkError),
    Exec(ExecError<io::Error>),
    Io(io::Error),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WeftError::Parse { object, error, .. } => write!(f, "{}:{}", object, error),
            WeftError::Link(error) => error.fmt(f),
            WeftError::Exec(error) => error.fmt(f),
            WeftError::Io(error) => error.fmt(f),
        }
    }
}

impl Error for WeftError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WeftError::Parse { error, .. } => Some(error),
            WeftError::Link(error) => Some(error),
            WeftError::Exec(error) => Some(error),
            WeftError::Io(error) => Some(error),
        }
    }
}

impl From<io::Error> for WeftError {
    fn from(error: io::Error) -> WeftError {
        WeftError::Io(error)
    }
}

impl From<LinkError> for WeftError {
    fn from(error: LinkError) -> WeftError {
        WeftError::Link(error)
    }
}

impl From<ExecError<io::Error>> for WeftError {
    fn from(error: ExecError<io::Error>) -> WeftError {
        WeftError::Exec(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::TokenKind;

    #[test]
    fn snippet_points_at_the_offending_token() {
        let text = b"prose\n    lang X\n";
        let error = ParseError {
            kind: Diagnostic::ExpectedColonAfterLang,
            token: Token {
                kind: TokenKind::Space,
                start: 14,
                end: 15,
            },
            location: Location {
                line: 2,
                column: 9,
                offset: 14,
            },
        };
        let rendered = render_snippet("doc.lit", text, &error);
        assert!(rendered.contains("doc.lit"));
        assert!(rendered.contains("expected ':' after 'lang'"));
    }
}
