use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{ErrorKind, SinkError, SinkResult};
use crate::{bail, sink_error};

/// Maximum number of segments in a table name: `database.schema.table`.
const MAX_TABLE_NAME_SEGMENTS: usize = 3;

/// The name of a destination table.
///
/// A name has one to three dot-separated segments (`table`, `database.table`, or
/// `database.schema.table`). A segment that is not a bare SQL identifier must be double-quoted,
/// with embedded quotes doubled, e.g. `db.public."table.with.dots"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    segments: Vec<String>,
}

impl TableName {
    /// Builds a table name from already-unquoted segments.
    pub fn from_segments<I, S>(segments: I) -> SinkResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.len() > MAX_TABLE_NAME_SEGMENTS {
            bail!(
                ErrorKind::InvalidIdentifier,
                "Table name has an invalid number of segments",
                format!("{} segments", segments.len())
            );
        }
        if segments.iter().any(String::is_empty) {
            bail!(
                ErrorKind::InvalidIdentifier,
                "Table name has an empty segment"
            );
        }

        Ok(Self { segments })
    }

    /// Returns the unquoted segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the last segment, the table itself.
    pub fn table(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }
}

/// Returns `true` if `segment` can be written without quotes.
fn is_bare_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

impl FromStr for TableName {
    type Err = SinkError;

    fn from_str(raw: &str) -> SinkResult<Self> {
        let invalid = |reason: &str| {
            sink_error!(
                ErrorKind::InvalidIdentifier,
                "Invalid table name",
                format!("`{raw}`: {reason}")
            )
        };

        let mut segments = Vec::new();
        let mut chars = raw.trim().chars().peekable();

        loop {
            let mut segment = String::new();

            if chars.peek() == Some(&'"') {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            segment.push('"');
                        }
                        Some('"') => break,
                        Some(c) => segment.push(c),
                        None => return Err(invalid("unterminated quoted segment")),
                    }
                }
                if segment.is_empty() {
                    return Err(invalid("empty quoted segment"));
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == '.' {
                        break;
                    }
                    segment.push(c);
                    chars.next();
                }
                if !is_bare_identifier(&segment) {
                    return Err(invalid("segment is not a valid identifier"));
                }
            }

            segments.push(segment);

            match chars.next() {
                None => break,
                Some('.') => continue,
                Some(_) => return Err(invalid("unexpected character after quoted segment")),
            }
        }

        TableName::from_segments(segments).map_err(|_| invalid("too many segments"))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            if is_bare_identifier(segment) {
                f.write_str(segment)?;
            } else {
                write!(f, "\"{}\"", segment.replace('"', "\"\""))?;
            }
        }

        Ok(())
    }
}

impl Serialize for TableName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
