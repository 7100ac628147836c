//! Filter-expression syntax check for automatic collections.
//!
//! # Responsibility
//! - Reject filter strings that can never be evaluated downstream.
//!
//! # Invariants
//! - Only syntax is checked; filters are never evaluated here.
//! - An empty (or whitespace-only) filter is valid and means "no constraint".
//!
//! Grammar accepted:
//!
//! ```text
//! expression := clause (('+' | ',') clause)*
//! clause     := '(' expression ')' | key ':' operator? value
//! operator   := '-' | '~' | '~^' | '~$' | '>' | '>=' | '<' | '<='
//! value      := bare-token | 'quoted' | '[' list ']'
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static CLAUSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z_][A-Za-z0-9_.]*:\s*(?:-|~\^|~\$|~|>=|<=|>|<)?(?:'(?:[^'\\]|\\.)*'|\[[^\[\]]*\]|[^\s'\[\]()+,]+)$",
    )
    .expect("clause pattern is a valid regex")
});

/// Syntax error with the byte offset where parsing gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} at offset {offset}")]
pub struct FilterSyntaxError {
    pub offset: usize,
    pub reason: &'static str,
}

/// Validates the syntax of a filter expression.
///
/// # Errors
/// - Unbalanced parentheses, brackets or quotes.
/// - Empty clauses (`tag:a+`, `,tag:a`).
/// - Clauses that are not `key:value` pairs.
pub fn validate_filter(filter: &str) -> Result<(), FilterSyntaxError> {
    if filter.trim().is_empty() {
        return Ok(());
    }
    validate_expression(filter, 0)
}

fn validate_expression(expr: &str, base: usize) -> Result<(), FilterSyntaxError> {
    for (offset, segment) in split_top_level(expr, base)? {
        let leading = segment.len() - segment.trim_start().len();
        let clause = segment.trim();
        let clause_offset = offset + leading;

        if clause.is_empty() {
            return Err(FilterSyntaxError {
                offset: clause_offset,
                reason: "empty clause",
            });
        }

        if let Some(inner) = clause.strip_prefix('(') {
            let inner = inner.strip_suffix(')').ok_or(FilterSyntaxError {
                offset: clause_offset,
                reason: "group is not closed",
            })?;
            if inner.trim().is_empty() {
                return Err(FilterSyntaxError {
                    offset: clause_offset,
                    reason: "empty group",
                });
            }
            validate_expression(inner, clause_offset + 1)?;
            continue;
        }

        if !CLAUSE_RE.is_match(clause) {
            return Err(FilterSyntaxError {
                offset: clause_offset,
                reason: "expected `key:value` clause",
            });
        }
    }

    Ok(())
}

/// Splits on `+`/`,` outside of groups, lists and quotes.
fn split_top_level(expr: &str, base: usize) -> Result<Vec<(usize, &str)>, FilterSyntaxError> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut parens = 0usize;
    let mut in_list = false;
    let mut in_quote = false;
    let mut escaped = false;

    for (index, ch) in expr.char_indices() {
        if in_quote {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_quote = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '\'' => in_quote = true,
            '[' if in_list => {
                return Err(FilterSyntaxError {
                    offset: base + index,
                    reason: "nested list",
                });
            }
            '[' => in_list = true,
            ']' if !in_list => {
                return Err(FilterSyntaxError {
                    offset: base + index,
                    reason: "unexpected `]`",
                });
            }
            ']' => in_list = false,
            '(' if !in_list => parens += 1,
            ')' if !in_list => {
                parens = parens.checked_sub(1).ok_or(FilterSyntaxError {
                    offset: base + index,
                    reason: "unexpected `)`",
                })?;
            }
            '+' | ',' if parens == 0 && !in_list => {
                segments.push((base + start, &expr[start..index]));
                start = index + ch.len_utf8();
            }
            _ => {}
        }
    }

    let end = base + expr.len();
    if in_quote {
        return Err(FilterSyntaxError {
            offset: end,
            reason: "unterminated quote",
        });
    }
    if in_list {
        return Err(FilterSyntaxError {
            offset: end,
            reason: "unterminated list",
        });
    }
    if parens > 0 {
        return Err(FilterSyntaxError {
            offset: end,
            reason: "unbalanced parentheses",
        });
    }

    segments.push((base + start, &expr[start..]));
    Ok(segments)
}
