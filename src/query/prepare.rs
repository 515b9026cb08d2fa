//! Purpose: Printf-style query templating with typed placeholders and escaping.
//! Exports: `prepare`, `Arg`, `FieldFormat`, `FieldTypes`, `Escape`, `BasicEscaper`.
//! Role: Builds literal SQL for the executor's write helpers and callers' ad-hoc queries.
//! Invariants: Only `%d`, `%f`, `%s` and `%%` are recognized; anything else fails the whole template.
//! Invariants: Placeholder and argument counts must match exactly; no partial output is returned.
//! Invariants: `%f` output is locale independent with six fractional digits.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use bstr::{BString, ByteSlice};
use serde::{Deserialize, Serialize};

/// The driver's real-escape primitive.
pub trait Escape {
    fn escape(&self, text: &str) -> String;
}

/// Connection-less escaping with the same byte set as MySQL's `real_escape_string`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicEscaper;

impl Escape for BasicEscaper {
    fn escape(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 8);
        for ch in text.chars() {
            match ch {
                '\0' => out.push_str("\\0"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\\' => out.push_str("\\\\"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                '\x1a' => out.push_str("\\Z"),
                _ => out.push(ch),
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormat {
    #[serde(alias = "%d", alias = "int")]
    Integer,
    #[serde(alias = "%f")]
    Float,
    #[serde(alias = "%s")]
    String,
}

impl FieldFormat {
    pub fn placeholder(self) -> &'static str {
        match self {
            FieldFormat::Integer => "%d",
            FieldFormat::Float => "%f",
            FieldFormat::String => "%s",
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, FieldFormat::String)
    }
}

/// Column name to format table, built once from configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldTypes {
    formats: BTreeMap<String, FieldFormat>,
}

impl FieldTypes {
    pub fn from_map(map: &BTreeMap<String, FieldFormat>) -> Self {
        Self {
            formats: map.clone(),
        }
    }

    pub fn insert(&mut self, column: impl Into<String>, format: FieldFormat) {
        self.formats.insert(column.into(), format);
    }

    pub fn get(&self, column: &str) -> Option<FieldFormat> {
        self.formats.get(column).copied()
    }

    /// Format for the `index`-th field: the explicit list (falling back to its first
    /// element), then this table, then string.
    pub fn resolve(&self, explicit: &[FieldFormat], index: usize, column: &str) -> FieldFormat {
        if let Some(first) = explicit.first() {
            return explicit.get(index).copied().unwrap_or(*first);
        }
        self.get(column).unwrap_or(FieldFormat::String)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Null,
    Int(i64),
    Float(f64),
    Text(BString),
}

impl Arg {
    pub fn text(value: impl Into<BString>) -> Self {
        Arg::Text(value.into())
    }

    fn as_int(&self) -> i64 {
        match self {
            Arg::Null => 0,
            Arg::Int(value) => *value,
            Arg::Float(value) => *value as i64,
            Arg::Text(text) => leading_number(text).map(|value| value as i64).unwrap_or(0),
        }
    }

    fn as_float(&self) -> f64 {
        match self {
            Arg::Null => 0.0,
            Arg::Int(value) => *value as f64,
            Arg::Float(value) => *value,
            Arg::Text(text) => leading_number(text).unwrap_or(0.0),
        }
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Float(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Text(value.into())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Text(value.into())
    }
}

/// Substitutes `args` into `query`. `None` for a missing template or any malformed input.
pub fn prepare(query: Option<&str>, args: &[Arg], escaper: &dyn Escape) -> Option<String> {
    let query = query?;
    let query = query.replace("'%s'", "%s").replace("\"%s\"", "%s");

    let mut out = String::with_capacity(query.len() + args.len() * 8);
    let mut args_iter = args.iter();
    let mut chars = query.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            '%' => out.push('%'),
            'd' => {
                let arg = args_iter.next()?;
                match arg {
                    Arg::Null => out.push_str("NULL"),
                    _ => write!(out, "{}", arg.as_int()).ok()?,
                }
            }
            'f' | 'F' => {
                let arg = args_iter.next()?;
                match arg {
                    Arg::Null => out.push_str("NULL"),
                    _ => write!(out, "{:.6}", arg.as_float()).ok()?,
                }
            }
            's' => {
                let arg = args_iter.next()?;
                push_string(&mut out, arg, escaper);
            }
            _ => return None,
        }
    }
    if args_iter.next().is_some() {
        return None;
    }
    Some(out)
}

fn push_string(out: &mut String, arg: &Arg, escaper: &dyn Escape) {
    match arg {
        Arg::Null => out.push_str("NULL"),
        Arg::Int(value) => {
            let _ = write!(out, "'{value}'");
        }
        Arg::Float(value) => {
            let _ = write!(out, "'{value}'");
        }
        Arg::Text(text) => match text.to_str() {
            Ok(text) => {
                out.push('\'');
                out.push_str(&escaper.escape(text));
                out.push('\'');
            }
            // Bytes outside UTF-8 travel as a hex literal so the query text stays valid.
            Err(_) => {
                out.push_str("X'");
                for byte in text.iter() {
                    let _ = write!(out, "{byte:02X}");
                }
                out.push('\'');
            }
        },
    }
}

fn leading_number(text: &[u8]) -> Option<f64> {
    let text = text.trim().to_str().ok()?;
    let end = text
        .char_indices()
        .take_while(|(idx, ch)| {
            ch.is_ascii_digit() || *ch == '.' || (*idx == 0 && (*ch == '-' || *ch == '+'))
        })
        .last()
        .map(|(idx, ch)| idx + ch.len_utf8())?;
    text[..end].parse().ok()
}
