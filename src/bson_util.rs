use std::io::{Read, Write};

use crate::{
    bson::{Bson, RawBson, RawBsonRef, RawDocument, RawDocumentBuf},
    conn::wire::SyncLittleEndianRead,
    error::{Error, Result},
};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int_raw(val: RawBsonRef<'_>) -> Option<i64> {
    match val {
        RawBsonRef::Int32(i) => get_int(&Bson::Int32(i)),
        RawBsonRef::Int64(i) => get_int(&Bson::Int64(i)),
        RawBsonRef::Double(i) => get_int(&Bson::Double(i)),
        _ => None,
    }
}

/// Interprets the `ok` field of a reply. Booleans are taken as is, numbers are truthy when
/// non-zero, and anything else (including a missing field) is falsy.
pub(crate) fn is_ok(val: Option<RawBsonRef<'_>>) -> bool {
    match val {
        Some(RawBsonRef::Boolean(b)) => b,
        Some(RawBsonRef::Int32(i)) => i != 0,
        Some(RawBsonRef::Int64(i)) => i != 0,
        Some(RawBsonRef::Double(f)) => f != 0.0,
        _ => false,
    }
}

/// The name of a command is the key of its first element.
pub(crate) fn first_key(doc: &RawDocument) -> Result<Option<&str>> {
    match doc.iter().next() {
        Some(result) => Ok(Some(result?.0)),
        None => Ok(None),
    }
}

/// The string entries of the array stored at `key`. A missing field, a field of another type
/// and non-string entries are all skipped.
pub(crate) fn get_string_array(doc: &RawDocument, key: &str) -> Vec<String> {
    let Ok(array) = doc.get_array(key) else {
        return Vec::new();
    };
    array
        .into_iter()
        .filter_map(|entry| entry.ok()?.as_str().map(ToString::to_string))
        .collect()
}

/// Appends `key` to `doc` unless the document already contains it. Returns whether the value was
/// appended.
pub(crate) fn append_if_absent(
    doc: &mut RawDocumentBuf,
    key: &str,
    value: impl Into<RawBson>,
) -> Result<bool> {
    if doc.get(key)?.is_some() {
        return Ok(false);
    }
    doc.append(key, value);
    Ok(true)
}

/// Appends every element of `other` that `this` does not already contain.
pub(crate) fn extend_if_absent(this: &mut RawDocumentBuf, other: &RawDocument) -> Result<()> {
    for result in other.iter() {
        let (k, v) = result?;
        append_if_absent(this, k, v.to_raw_bson())?;
    }
    Ok(())
}

/// The size of a document as an element of a BSON array at `index`.
pub(crate) fn array_entry_size_bytes(index: usize, doc_len: usize) -> usize {
    //   * type (1 byte)
    //   * number of decimal digits in key
    //   * null terminator for the key (1 byte)
    //   * size of value

    1 + num_decimal_digits(index) + 1 + doc_len
}

/// The number of digits in `n` in base 10.
/// Useful for calculating the size of an array entry in BSON.
fn num_decimal_digits(mut n: usize) -> usize {
    let mut digits = 0;

    loop {
        n /= 10;
        digits += 1;

        if n == 0 {
            return digits;
        }
    }
}

/// Read a document's raw BSON bytes from the provided reader.
pub(crate) fn read_document_bytes<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let length = reader.read_i32_sync()?;
    if length < 5 {
        return Err(Error::invalid_response(format!(
            "invalid BSON document length {}",
            length
        )));
    }

    let mut bytes = Vec::with_capacity(length as usize);
    bytes.write_all(&length.to_le_bytes())?;

    reader.take(length as u64 - 4).read_to_end(&mut bytes)?;
    if bytes.len() != length as usize {
        return Err(Error::invalid_response(format!(
            "BSON document declared {} bytes but only {} were available",
            length,
            bytes.len()
        )));
    }

    Ok(bytes)
}
