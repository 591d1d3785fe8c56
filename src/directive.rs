//! Directive syntax for configuring the uwsgi transport.
//!
//! ```text
//! transport uwsgi {
//!     # params sent with every request
//!     uwsgi_param UWSGI_SCRIPT app:application
//!     uwsgi_param SCRIPT_NAME "/my app"
//! }
//! ```
//!
//! The leading `transport` keyword and the block are both optional. Words are
//! separated by whitespace, `"..."` quotes a word (with `\"` and `\\`
//! escapes), and `#` starts a comment that runs to the end of the line. A
//! directive and its arguments share one line.

use thiserror::Error;

use crate::module::MODULE_NAME;
use crate::params::UwsgiParams;
use crate::transport::UwsgiTransport;

/// Directive that sets one static uwsgi param
pub const UWSGI_PARAM: &str = "uwsgi_param";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("line {line}: wrong argument count or unexpected line ending after '{directive}'")]
    ArgCount { line: usize, directive: String },

    #[error("line {line}: unknown subdirective {name}")]
    UnknownSubdirective { line: usize, name: String },

    #[error("line {line}: expected transport 'uwsgi', found '{found}'")]
    WrongModule { line: usize, found: String },

    #[error("line {line}: unexpected '{token}'")]
    Unexpected { line: usize, token: String },

    #[error("line {line}: unterminated quoted string")]
    UnterminatedString { line: usize },

    #[error("line {line}: block opened here is never closed")]
    UnclosedBlock { line: usize },

    #[error("no transport directive found")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
    quoted: bool,
}

impl Token {
    fn is(&self, text: &str) -> bool {
        !self.quoted && self.text == text
    }

    fn is_brace(&self) -> bool {
        self.is("{") || self.is("}")
    }
}

/// Parse a transport definition in directive syntax
pub fn parse_transport(input: &str) -> Result<UwsgiTransport, DirectiveError> {
    let tokens = tokenize(input)?;
    let mut tokens = tokens.into_iter().peekable();

    let mut module = tokens.next().ok_or(DirectiveError::Empty)?;
    if module.is("transport") {
        module = tokens.next().ok_or(DirectiveError::Empty)?;
    }
    if !module.is(MODULE_NAME) {
        return Err(DirectiveError::WrongModule {
            line: module.line,
            found: module.text,
        });
    }

    let mut params = UwsgiParams::new();

    match tokens.next() {
        None => return Ok(UwsgiTransport::new(params)),
        Some(open) if open.is("{") => {
            loop {
                let name = tokens
                    .next()
                    .ok_or(DirectiveError::UnclosedBlock { line: open.line })?;
                if name.is("}") {
                    break;
                }
                if name.is_brace() {
                    return Err(DirectiveError::Unexpected {
                        line: name.line,
                        token: name.text,
                    });
                }

                let mut args = Vec::new();
                while let Some(arg) = tokens.next_if(|t| t.line == name.line && !t.is_brace()) {
                    args.push(arg.text);
                }

                match name.text.as_str() {
                    UWSGI_PARAM => {
                        let [key, value]: [String; 2] =
                            args.try_into().map_err(|_| DirectiveError::ArgCount {
                                line: name.line,
                                directive: name.text.clone(),
                            })?;
                        params.insert(key, value);
                    }
                    _ => {
                        return Err(DirectiveError::UnknownSubdirective {
                            line: name.line,
                            name: name.text.clone(),
                        })
                    }
                }
            }
        }
        Some(other) => {
            return Err(DirectiveError::Unexpected {
                line: other.line,
                token: other.text,
            })
        }
    }

    if let Some(extra) = tokens.next() {
        return Err(DirectiveError::Unexpected {
            line: extra.line,
            token: extra.text,
        });
    }

    Ok(UwsgiTransport::new(params))
}

fn tokenize(input: &str) -> Result<Vec<Token>, DirectiveError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '#' => {
                while chars.next_if(|&c| c != '\n').is_some() {}
            }
            '"' => {
                let start = line;
                let mut text = String::new();
                loop {
                    match chars.next() {
                        None => return Err(DirectiveError::UnterminatedString { line: start }),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\')) => text.push(e),
                            Some(other) => {
                                if other == '\n' {
                                    line += 1;
                                }
                                text.push('\\');
                                text.push(other);
                            }
                            None => return Err(DirectiveError::UnterminatedString { line: start }),
                        },
                        Some(other) => {
                            if other == '\n' {
                                line += 1;
                            }
                            text.push(other);
                        }
                    }
                }
                tokens.push(Token {
                    text,
                    line: start,
                    quoted: true,
                });
            }
            c => {
                let mut text = String::from(c);
                while let Some(next) = chars.next_if(|&n| !n.is_whitespace()) {
                    text.push(next);
                }
                tokens.push(Token {
                    text,
                    line,
                    quoted: false,
                });
            }
        }
    }

    Ok(tokens)
}
