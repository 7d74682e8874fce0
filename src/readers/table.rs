//! Delimited text table parsing.
//!
//! The regional exports this system ingests are header-plus-rows text files
//! with varying delimiters (comma, tab, pipe) and optionally quoted fields.
//! The delimiter is detected once from the header line, never per row.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("file has no header line")]
    Empty,
}

/// One data row, with its 1-based line number for diagnostics.
#[derive(Debug, Clone)]
pub struct TableRow {
    pub line: usize,
    values: Vec<String>,
}

impl TableRow {
    /// Field by column index; empty string for columns this row is short of.
    pub fn get(&self, idx: usize) -> &str {
        self.values.get(idx).map(|s| s.as_str()).unwrap_or("")
    }

    /// Trimmed field by column index, `None` when blank.
    pub fn get_non_empty(&self, idx: usize) -> Option<&str> {
        let v = self.get(idx).trim();
        (!v.is_empty()).then_some(v)
    }
}

/// A parsed delimited table.
#[derive(Debug, Clone)]
pub struct Table {
    pub delimiter: char,
    pub headers: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl Table {
    pub fn parse(content: &str) -> Result<Table, TableError> {
        let mut lines = content.lines().enumerate();
        let (_, header_line) = lines
            .by_ref()
            .find(|(_, l)| !l.trim().is_empty())
            .ok_or(TableError::Empty)?;

        let delimiter = detect_delimiter(header_line);
        let headers: Vec<String> = split_fields(header_line, delimiter)
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (i, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            rows.push(TableRow {
                line: i + 1,
                values: split_fields(line, delimiter),
            });
        }

        Ok(Table {
            delimiter,
            headers,
            rows,
        })
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
    }

    /// First present column among the candidates.
    pub fn find_column(&self, candidates: &[&str]) -> Option<usize> {
        candidates.iter().find_map(|c| self.column(c))
    }
}

/// Pick the delimiter that splits the header into the most fields.
fn detect_delimiter(header: &str) -> char {
    let mut best = ',';
    let mut best_count = 0usize;
    for candidate in [',', '\t', '|'] {
        let count = header.matches(candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Split one line on a delimiter, honoring double-quoted fields with `""`
/// escapes.
fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        current.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => current.push(ch),
            }
        } else if ch == '"' {
            in_quotes = true;
        } else if ch == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    fields.push(current);
    fields
}
