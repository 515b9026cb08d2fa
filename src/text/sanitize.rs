//! Purpose: Validate and repair text so it is well formed for its column's charset.
//! Exports: `TextSanitizer`, `SanitizedField`, `sanitize_local`, `strip_invalid_utf8`.
//! Role: Guards every write helper; a failure here rejects the whole write.
//! Invariants: Output only contains well-formed sequences for the resolved charset.
//! Invariants: Pure ASCII, numeric formats, non-text values and binary columns pass through untouched.
//! Invariants: A failed database round trip fails every field in the batch; nothing is half-applied.
//! Invariants: The connection charset is restored after a round trip, including on failure.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use bstr::BString;
use tracing::{debug, warn};

use super::charset::{Charset, CharsetResolver};
use crate::core::error::{Error, ErrorKind};
use crate::core::snapshot::Cell;
use crate::driver::{Driver, Outcome};
use crate::query::prepare::{Arg, FieldFormat, FieldTypes};

/// One value headed for a column, with everything needed to make it safe.
#[derive(Clone, Debug, PartialEq)]
pub struct SanitizedField {
    pub column: String,
    pub raw_value: Arg,
    pub target_format: FieldFormat,
    pub charset: Option<Charset>,
    pub was_ascii_fast_path: bool,
}

impl SanitizedField {
    pub fn new(column: impl Into<String>, raw_value: Arg, target_format: FieldFormat) -> Self {
        Self {
            column: column.into(),
            raw_value,
            target_format,
            charset: None,
            was_ascii_fast_path: false,
        }
    }

    /// Text bytes that still need a charset check, if any.
    fn pending_text(&self) -> Option<&BString> {
        if self.target_format.is_numeric() || self.was_ascii_fast_path {
            return None;
        }
        match (&self.raw_value, &self.charset) {
            (_, None | Some(Charset::Binary)) => None,
            (Arg::Text(text), Some(_)) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TextSanitizer {
    resolver: CharsetResolver,
}

impl TextSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolver(&mut self) -> &mut CharsetResolver {
        &mut self.resolver
    }

    /// Builds fields for `table`, resolving each one's format and column charset.
    pub fn prepare_fields(
        &mut self,
        driver: &mut dyn Driver,
        table: &str,
        values: Vec<(String, Arg)>,
        formats: &[FieldFormat],
        field_types: &FieldTypes,
    ) -> Result<Vec<SanitizedField>, Error> {
        let mut fields = Vec::with_capacity(values.len());
        for (index, (column, value)) in values.into_iter().enumerate() {
            let format = field_types.resolve(formats, index, &column);
            let mut field = SanitizedField::new(column, value, format);
            if !format.is_numeric() {
                if let Arg::Text(text) = &field.raw_value {
                    field.was_ascii_fast_path = text.is_ascii();
                }
            }
            field.charset = self
                .resolver
                .resolve_column_charset(driver, table, &field.column)?;
            fields.push(field);
        }
        Ok(fields)
    }

    /// Repairs every field in place. On error no field has been modified.
    pub fn sanitize_fields(
        &mut self,
        driver: &mut dyn Driver,
        fields: &mut [SanitizedField],
    ) -> Result<(), Error> {
        let mut repaired: Vec<(usize, BString)> = Vec::new();
        let mut remote: BTreeMap<Charset, Vec<usize>> = BTreeMap::new();
        for (index, field) in fields.iter().enumerate() {
            let (Some(text), Some(charset)) = (field.pending_text(), field.charset.as_ref()) else {
                continue;
            };
            match sanitize_local(text, charset) {
                Some(clean) => {
                    if clean != *text {
                        debug!(column = %field.column, charset = %charset, "stripped malformed bytes");
                        repaired.push((index, clean));
                    }
                }
                None => remote.entry(charset.clone()).or_default().push(index),
            }
        }

        for (charset, indexes) in &remote {
            let values: Vec<&BString> = indexes
                .iter()
                .filter_map(|&index| fields[index].pending_text())
                .collect();
            let converted = convert_remote(driver, charset, &values)?;
            repaired.extend(indexes.iter().copied().zip(converted));
        }

        for (index, clean) in repaired {
            fields[index].raw_value = Arg::Text(clean);
        }
        Ok(())
    }

    /// Single-value form of `sanitize_fields`.
    pub fn sanitize(
        &mut self,
        driver: &mut dyn Driver,
        value: &[u8],
        charset: &Charset,
    ) -> Result<BString, Error> {
        if value.is_ascii() {
            return Ok(BString::from(value));
        }
        let mut field = SanitizedField::new("value", Arg::text(value), FieldFormat::String);
        field.charset = Some(charset.clone());
        let mut fields = [field];
        self.sanitize_fields(driver, &mut fields)?;
        match &fields[0].raw_value {
            Arg::Text(text) => Ok(text.clone()),
            _ => Err(Error::new(ErrorKind::Internal).with_message("sanitized value lost its text")),
        }
    }
}

/// Validates with a built-in byte validator; `None` when `charset` needs the database.
pub fn sanitize_local(value: &[u8], charset: &Charset) -> Option<BString> {
    if value.is_ascii() {
        return Some(BString::from(value));
    }
    if !charset.has_local_validator() {
        return None;
    }
    match charset {
        Charset::Utf8 => Some(strip_invalid_utf8(value, false)),
        Charset::Utf8mb4 => Some(strip_invalid_utf8(value, true)),
        _ => Some(BString::from(value)),
    }
}

/// Keeps well-formed UTF-8 sequences and drops every other byte one at a time.
/// Four-byte sequences are only kept when `allow_four_byte` is set.
pub fn strip_invalid_utf8(value: &[u8], allow_four_byte: bool) -> BString {
    let mut out = Vec::with_capacity(value.len());
    let mut rest = value;
    while !rest.is_empty() {
        match sequence_len(rest, allow_four_byte) {
            Some(len) => {
                out.extend_from_slice(&rest[..len]);
                rest = &rest[len..];
            }
            None => rest = &rest[1..],
        }
    }
    BString::from(out)
}

fn sequence_len(bytes: &[u8], allow_four_byte: bool) -> Option<usize> {
    let cont = |idx: usize, lo: u8, hi: u8| bytes.get(idx).is_some_and(|b| (lo..=hi).contains(b));
    let tail = |from: usize, to: usize| (from..to).all(|idx| cont(idx, 0x80, 0xBF));
    let lead = *bytes.first()?;
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF if tail(1, 2) => Some(2),
        0xE0 if cont(1, 0xA0, 0xBF) && tail(2, 3) => Some(3),
        0xE1..=0xEC | 0xEE..=0xEF if tail(1, 3) => Some(3),
        0xED if cont(1, 0x80, 0x9F) && tail(2, 3) => Some(3),
        0xF0 if allow_four_byte && cont(1, 0x90, 0xBF) && tail(2, 4) => Some(4),
        0xF1..=0xF3 if allow_four_byte && tail(1, 4) => Some(4),
        0xF4 if allow_four_byte && cont(1, 0x80, 0x8F) && tail(2, 4) => Some(4),
        _ => None,
    }
}

/// One `SELECT CONVERT(...)` per charset, with the connection charset switched to match.
fn convert_remote(
    driver: &mut dyn Driver,
    charset: &Charset,
    values: &[&BString],
) -> Result<Vec<BString>, Error> {
    let name = charset.as_str();
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(Error::new(ErrorKind::Sanitize)
            .with_message(format!("refusing to convert into charset {name:?}")));
    }
    let mut sql = String::from("SELECT ");
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            sql.push_str(", ");
        }
        sql.push_str("CONVERT(X'");
        for byte in value.iter() {
            let _ = write!(sql, "{byte:02X}");
        }
        let _ = write!(sql, "' USING {name}) AS x{index}");
    }

    let previous = driver.charset();
    driver
        .set_charset(Some(name))
        .map_err(|err| sanitize_error(charset, err))?;
    let result = driver.query(&sql);
    if let Err(err) = driver.set_charset(previous.as_deref()) {
        let previous = previous.as_deref().unwrap_or("default");
        warn!(charset = previous, error = %err, "failed to restore connection charset");
    }

    let row = match result.map_err(|err| sanitize_error(charset, err))? {
        Outcome::Rows(mut rows) if rows.len() == 1 => rows.remove(0),
        _ => {
            return Err(Error::new(ErrorKind::Sanitize)
                .with_message(format!("charset round trip for {name} returned no row")));
        }
    };
    if row.len() != values.len() {
        return Err(Error::new(ErrorKind::Sanitize).with_message(format!(
            "charset round trip for {name} returned {} of {} values",
            row.len(),
            values.len()
        )));
    }
    row.into_iter()
        .map(|cell| match cell {
            Cell::Text(text) => Ok(BString::from(text)),
            Cell::Bytes(bytes) => Ok(bytes),
            _ => Err(Error::new(ErrorKind::Sanitize)
                .with_message(format!("value could not be converted to {name}"))),
        })
        .collect()
}

fn sanitize_error(charset: &Charset, err: Error) -> Error {
    Error::new(ErrorKind::Sanitize)
        .with_message(format!("charset round trip for {charset} failed"))
        .with_source(err)
}
