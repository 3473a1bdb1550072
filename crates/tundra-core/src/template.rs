// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command template substitution.
//!
//! Compiler and runner command lines are stored as templates over named
//! variables: `$name`, `${name}`, or `${name%suffix}`. The suffix form
//! strips `suffix` from the end of the value when present (shell-style `%`,
//! one non-greedy pass, suffix trim only). The engine renders these to
//! derive a judge-visible binary name from a source filename and to build
//! compiler invocations; nothing is ever passed to a shell here.

use std::collections::HashMap;

use thiserror::Error;

/// Template rendering errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A `$name` or `${name}` reference to a variable that was not supplied.
    #[error("undefined variable: ${0}")]
    UndefinedVariable(String),

    /// A `${…` reference with no closing brace.
    #[error("unterminated variable reference")]
    Unterminated,
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn lookup<'a>(
    variables: &'a HashMap<&str, &str>,
    name: &str,
) -> Result<&'a str, TemplateError> {
    variables
        .get(name)
        .copied()
        .ok_or_else(|| TemplateError::UndefinedVariable(name.to_string()))
}

/// Substitute variables into `template`.
pub fn render(
    template: &str,
    variables: &HashMap<&str, &str>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if !is_ident(c) {
                    break;
                }
                name.push(c);
                chars.next();
            }
            let value = lookup(variables, &name)?;
            match chars.next() {
                Some('}') => out.push_str(value),
                Some('%') => {
                    let mut suffix = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => suffix.push(c),
                            None => return Err(TemplateError::Unterminated),
                        }
                    }
                    out.push_str(value.strip_suffix(&suffix).unwrap_or(value));
                }
                _ => return Err(TemplateError::Unterminated),
            }
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if !is_ident(c) {
                    break;
                }
                name.push(c);
                chars.next();
            }
            out.push_str(lookup(variables, &name)?);
        }
    }
    Ok(out)
}
