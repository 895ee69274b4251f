//! Format strings.
//!
//! An interface declares its positional argument types with a compact
//! `%`-code sequence (`"%d%d"`, `"%d%s"`, `""`) and its return type with a
//! single code or the empty string. These are parsed once at registration
//! and used to validate every value that crosses the wire.

use crate::value::{Value, ValueKind};
use crate::ProtoError;

fn parse_codes(fmt: &str) -> Result<Vec<ValueKind>, ProtoError> {
    let mut kinds = Vec::new();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            return Err(ProtoError::BadFormat(fmt.to_string()));
        }
        match chars.next() {
            Some('d') => kinds.push(ValueKind::Int),
            Some('s') => kinds.push(ValueKind::Str),
            _ => return Err(ProtoError::BadFormat(fmt.to_string())),
        }
    }
    Ok(kinds)
}

/// A parsed argument format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgFormat {
    kinds: Vec<ValueKind>,
}

impl ArgFormat {
    /// Parse a `%`-code sequence. The empty string means no arguments.
    pub fn parse(fmt: &str) -> Result<Self, ProtoError> {
        Ok(Self {
            kinds: parse_codes(fmt)?,
        })
    }

    /// The declared kind at each position.
    pub fn kinds(&self) -> &[ValueKind] {
        &self.kinds
    }

    /// Number of declared arguments.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// True when the interface takes no arguments.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Check a value sequence against this format: count must match and
    /// every value's tag must equal the declared kind at its position.
    pub fn check(&self, values: &[Value]) -> Result<(), ProtoError> {
        if values.len() != self.kinds.len() {
            return Err(ProtoError::ArityMismatch {
                expected: self.kinds.len(),
                actual: values.len(),
            });
        }
        for (index, (value, expected)) in values.iter().zip(&self.kinds).enumerate() {
            if value.kind() != *expected {
                return Err(ProtoError::TypeMismatch {
                    index,
                    expected: *expected,
                    actual: value.kind(),
                });
            }
        }
        Ok(())
    }
}

/// A parsed return format: one `%`-code, or empty for no return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetFormat(pub Option<ValueKind>);

impl RetFormat {
    pub fn parse(fmt: &str) -> Result<Self, ProtoError> {
        let kinds = parse_codes(fmt)?;
        match kinds.as_slice() {
            [] => Ok(RetFormat(None)),
            [kind] => Ok(RetFormat(Some(*kind))),
            _ => Err(ProtoError::BadFormat(fmt.to_string())),
        }
    }

    pub fn kind(self) -> Option<ValueKind> {
        self.0
    }
}
