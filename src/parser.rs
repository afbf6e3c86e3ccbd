//! implements a parser for beanstalkd TCP protocol responses.
use std::fmt;

use crate::types::protocol::BeanstalkResponse;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownResponse,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownResponse => "unknown response",
        })
    }
}

impl std::error::Error for ParsingError {}

/// Tube names are at most 200 bytes from this set, and never start with `-`.
fn is_name_byte(c: u8, first: bool) -> bool {
    match c {
        b'-' => !first,
        b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
        _ => c.is_ascii_alphanumeric(),
    }
}

/// Cursor over a response line. Tokens borrow from the line.
struct ParseState<'a> {
    from: &'a [u8],
}

impl<'a> ParseState<'a> {
    /// Yields `result` only if the whole line was consumed.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        match self.from {
            [] => Ok(result),
            _ => Err(ParsingError::BadFormat),
        }
    }

    fn expect_next_token(&mut self) -> Result<&'a [u8], ParsingError> {
        match self.next_token() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// A space, then decimal digits that fit in a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        self.expect_next_token()?.iter().try_fold(0u64, |acc, &b| {
            if !b.is_ascii_digit() {
                return Err(ParsingError::BadFormat);
            }
            acc.checked_mul(10)
                .and_then(|acc| acc.checked_add(u64::from(b - b'0')))
                .ok_or(ParsingError::BadFormat)
        })
    }

    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        u32::try_from(self.expect_next_u64()?)
            .map_err(|_| ParsingError::BadFormat)
    }

    /// A space, then a valid tube name.
    fn expect_next_name(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;
        let valid = token.len() <= 200
            && token
                .iter()
                .enumerate()
                .all(|(i, &c)| is_name_byte(c, i == 0));

        if !valid {
            return Err(ParsingError::BadFormat);
        }
        // Name bytes are all ASCII.
        Ok(token.iter().copied().map(char::from).collect())
    }

    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.split_first() {
            Some((b' ', rest)) => {
                self.from = rest;
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Takes bytes up to the next space or the end of the line, leaving the
    /// space in place. `None` once the line is used up; an empty token
    /// when the cursor already sits on a space.
    fn next_token(&mut self) -> Option<&'a [u8]> {
        if self.from.is_empty() {
            return None;
        }

        let end = self
            .from
            .iter()
            .position(|&c| c == b' ')
            .unwrap_or(self.from.len());
        let (token, rest) = self.from.split_at(end);
        self.from = rest;

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        Self { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait. The input is a single
// response line with its CRLF already stripped.
impl TryFrom<&[u8]> for BeanstalkResponse {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use BeanstalkResponse::*;

        let mut ps: ParseState = value.into();

        let resp = match ps.expect_next_token()? {
            // <resp>
            b"OUT_OF_MEMORY" => OutOfMemory,
            b"INTERNAL_ERROR" => InternalError,
            b"BAD_FORMAT" => BadFormat,
            b"UNKNOWN_COMMAND" => UnknownCommand,
            b"EXPECTED_CRLF" => ExpectedCrlf,
            b"JOB_TOO_BIG" => JobTooBig,
            b"DRAINING" => Draining,
            b"DEADLINE_SOON" => DeadlineSoon,
            b"TIMED_OUT" => TimedOut,
            b"NOT_FOUND" => NotFound,
            b"DELETED" => Deleted,
            b"RELEASED" => Released,
            b"NOT_IGNORED" => NotIgnored,

            // BURIED is sent both bare (bury, release) and with an ID (put).
            b"BURIED" if ps.from.is_empty() => Buried,
            b"BURIED" => BuriedId {
                id: ps.expect_next_u64()?,
            },

            // <resp> <n>
            b"INSERTED" => Inserted {
                id: ps.expect_next_u64()?,
            },
            b"WATCHING" => Watching {
                count: ps.expect_next_u32()?,
            },
            b"OK" => Ok {
                n_bytes: ps.expect_next_u32()?,
            },

            // <resp> <tube>
            b"USING" => Using {
                tube: ps.expect_next_name()?,
            },

            // <resp> <id> <n_bytes>
            b"RESERVED" => Reserved {
                id: ps.expect_next_u64()?,
                n_bytes: ps.expect_next_u32()?,
            },

            _ => return Err(ParsingError::UnknownResponse),
        };

        ps.expect_done_and(resp)
    }
}
