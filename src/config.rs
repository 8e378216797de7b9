//! Processing options, constant for the lifetime of a database container.

use std::str::FromStr;

/// Placeholder delimiter classes.  A block normally declares its own class
/// in the `esc:` header field; setting a delimiter option overrides every
/// block, and `Ignore` disables placeholder recognition entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Ignore,
    Chevron,
    Brace,
    Bracket,
    Paren,
}

impl Delimiter {
    /// The `(open, close)` byte pair, or `None` for `Ignore`.
    pub fn class(self) -> Option<(u8, u8)> {
        match self {
            Delimiter::Ignore => None,
            Delimiter::Chevron => Some((b'<', b'>')),
            Delimiter::Brace => Some((b'{', b'}')),
            Delimiter::Bracket => Some((b'[', b']')),
            Delimiter::Paren => Some((b'(', b')')),
        }
    }
}

impl FromStr for Delimiter {
    type Err = String;

    fn from_str(value: &str) -> Result<Delimiter, String> {
        match value {
            "ignore" => Ok(Delimiter::Ignore),
            "chevron" => Ok(Delimiter::Chevron),
            "brace" => Ok(Delimiter::Brace),
            "bracket" => Ok(Delimiter::Bracket),
            "paren" => Ok(Delimiter::Paren),
            other => Err(format!("unknown delimiter class '{}'", other)),
        }
    }
}

/// Options that affect database processing.
///
/// Some of these alter tangle semantics (`delimiter`,
/// `allow_absolute_paths`, `omit_trailing_newline`); `timing` only logs how
/// long each pass took.
#[derive(Debug, Default, Clone)]
pub struct DbOptions {
    /// Overrides the per-block `esc:` specification for every block.
    pub delimiter: Option<Delimiter>,
    /// Permits output file paths beginning with `/` or `~`; otherwise the
    /// parser rejects them.
    pub allow_absolute_paths: bool,
    /// Suppresses the final newline the stream sink writes after a file's
    /// output.
    pub omit_trailing_newline: bool,
    /// If true, time in milliseconds is logged after each pass completes.
    pub timing: bool,
}
