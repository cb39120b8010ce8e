//! Identifier and literal quoting for commands built from user input.

use crate::error::{Error, Result};

/// NAMEDATALEN - 1; the server truncates longer identifiers.
pub const MAX_IDENT_LEN: usize = 63;

/// Check that `name` can be used as a LISTEN/UNLISTEN channel.
pub fn validate_channel(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > MAX_IDENT_LEN {
        "longer than 63 bytes"
    } else if name.contains('\0') {
        "contains a NUL byte"
    } else {
        return Ok(());
    };

    Err(Error::InvalidChannelName {
        name: name.to_string(),
        reason,
    })
}

/// Quote `name` as an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Quote `value` as an SQL string literal.
///
/// Values containing backslashes use the `E'...'` escape form so the result
/// is correct regardless of `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(Error::InvalidLiteral(
            "string literals cannot contain NUL bytes".to_string(),
        ));
    }

    let escape = value.contains('\\');
    let mut quoted = String::with_capacity(value.len() + 3);
    if escape {
        quoted.push('E');
    }
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    Ok(quoted)
}
