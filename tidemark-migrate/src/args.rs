//! Tokenizer for catalog function-argument strings.
//!
//! PostgreSQL reports function arguments as one free-text string such as
//! `a integer, OUT "b c" text, VARIADIC xs numeric(10,2)[] DEFAULT '{1,2}'`.
//! Splitting that on commas is wrong as soon as a type modifier, array literal
//! or quoted default contains one, so the splitter tracks quotes and nesting.

use thiserror::Error;

use crate::model::{FunctionParameter, ParameterMode};

/// Failure to tokenize an argument string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    /// A quote was opened and never closed.
    #[error("unterminated {quote} quote starting at byte {position}")]
    UnterminatedQuote { quote: char, position: usize },

    /// A closing delimiter without its opener, or closing the wrong opener.
    #[error("unexpected '{found}' at byte {position}")]
    UnbalancedDelimiter { found: char, position: usize },

    /// The string ended while a delimiter was still open.
    #[error("unclosed '{0}'")]
    UnclosedDelimiter(char),

    /// Two commas with nothing in between.
    #[error("empty argument at position {0}")]
    EmptyArgument(usize),

    /// An argument without a type.
    #[error("argument '{0}' has no type")]
    MissingType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Normal,
    Single,
    Double,
}

/// Split on top-level commas.
pub fn split_arguments(text: &str) -> Result<Vec<String>, ArgumentError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut stack: Vec<char> = Vec::new();
    let mut state = Scan::Normal;
    let mut quote_start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        match state {
            Scan::Single | Scan::Double => {
                current.push(ch);
                let closing = if state == Scan::Single { '\'' } else { '"' };
                if ch == closing {
                    // Doubled quote is an escaped quote.
                    if chars.peek().map(|(_, c)| *c) == Some(closing) {
                        if let Some((_, c)) = chars.next() {
                            current.push(c);
                        }
                    } else {
                        state = Scan::Normal;
                    }
                }
            }
            Scan::Normal => match ch {
                '\'' => {
                    state = Scan::Single;
                    quote_start = pos;
                    current.push(ch);
                }
                '"' => {
                    state = Scan::Double;
                    quote_start = pos;
                    current.push(ch);
                }
                '(' | '[' => {
                    stack.push(ch);
                    current.push(ch);
                }
                ')' | ']' => {
                    let opener = if ch == ')' { '(' } else { '[' };
                    if stack.pop() != Some(opener) {
                        return Err(ArgumentError::UnbalancedDelimiter {
                            found: ch,
                            position: pos,
                        });
                    }
                    current.push(ch);
                }
                ',' if stack.is_empty() => {
                    let token = current.trim();
                    if token.is_empty() {
                        return Err(ArgumentError::EmptyArgument(parts.len()));
                    }
                    parts.push(token.to_string());
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }

    match state {
        Scan::Single => {
            return Err(ArgumentError::UnterminatedQuote {
                quote: '\'',
                position: quote_start,
            });
        }
        Scan::Double => {
            return Err(ArgumentError::UnterminatedQuote {
                quote: '"',
                position: quote_start,
            });
        }
        Scan::Normal => {}
    }
    if let Some(open) = stack.pop() {
        return Err(ArgumentError::UnclosedDelimiter(open));
    }

    let token = current.trim();
    if token.is_empty() {
        return Err(ArgumentError::EmptyArgument(parts.len()));
    }
    parts.push(token.to_string());
    Ok(parts)
}

/// Parse one argument token into a parameter.
pub fn parse_parameter(token: &str) -> Result<FunctionParameter, ArgumentError> {
    let words = top_level_words(token);
    let mut rest: &[String] = &words;

    let mode = match rest.first().map(|w| w.to_ascii_uppercase()).as_deref() {
        Some("IN") => Some(ParameterMode::In),
        Some("OUT") => Some(ParameterMode::Out),
        Some("INOUT") => Some(ParameterMode::InOut),
        Some("VARIADIC") => Some(ParameterMode::Variadic),
        _ => None,
    };
    if mode.is_some() {
        rest = &rest[1..];
    }

    let default_at = rest
        .iter()
        .position(|w| w == "=" || w.eq_ignore_ascii_case("DEFAULT"));
    let (decl, default) = match default_at {
        Some(i) => (&rest[..i], Some(rest[i + 1..].join(" "))),
        None => (rest, None),
    };

    if decl.is_empty() {
        return Err(ArgumentError::MissingType(token.trim().to_string()));
    }

    let (name, data_type) = if decl.len() == 1 {
        (None, decl[0].clone())
    } else if decl[0].starts_with('"') {
        (Some(unquote(&decl[0])), decl[1..].join(" "))
    } else if is_multi_word_type(&decl.join(" ")) {
        (None, decl.join(" "))
    } else {
        (Some(decl[0].clone()), decl[1..].join(" "))
    };

    if data_type.is_empty() {
        return Err(ArgumentError::MissingType(token.trim().to_string()));
    }

    Ok(FunctionParameter {
        name,
        mode: mode.unwrap_or_default(),
        data_type,
        default: default.filter(|d| !d.is_empty()),
    })
}

/// Parse a full catalog argument string.
pub fn parse_arguments(text: &str) -> Result<Vec<FunctionParameter>, ArgumentError> {
    split_arguments(text)?
        .iter()
        .map(|token| parse_parameter(token))
        .collect()
}

const MULTI_WORD_TYPES: &[&str] = &[
    "double precision",
    "character varying",
    "bit varying",
    "timestamp with",
    "timestamp without",
    "time with",
    "time without",
];

fn is_multi_word_type(decl: &str) -> bool {
    let lowered = decl.to_ascii_lowercase();
    MULTI_WORD_TYPES.iter().any(|t| lowered.starts_with(t))
}

fn unquote(ident: &str) -> String {
    ident
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .map(|s| s.replace("\"\"", "\""))
        .unwrap_or_else(|| ident.to_string())
}

/// Split on whitespace outside quotes and brackets. Assumes balanced input.
fn top_level_words(token: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in token.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '(' | '[' => {
                    depth += 1;
                    current.push(ch);
                }
                ')' | ']' => {
                    depth = depth.saturating_sub(1);
                    current.push(ch);
                }
                c if c.is_whitespace() && depth == 0 => {
                    if !current.is_empty() {
                        words.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(ch),
            },
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
