use std::fmt::Debug;

use crate::{
    bson::{RawBsonRef, RawDocument},
    error::{Error, Result},
};

/// Decides which field names a document may contain before it is written to the wire.
pub trait ElementNameValidator: Send + Sync + Debug {
    /// Whether a field called `name` is allowed at this level.
    fn is_valid(&self, name: &str) -> bool;

    /// The validator for the fields of the subdocument stored under `name`.
    fn validator_for_child(&self, name: &str) -> &dyn ElementNameValidator;
}

/// Accepts every field name.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpElementNameValidator;

impl ElementNameValidator for NoOpElementNameValidator {
    fn is_valid(&self, _name: &str) -> bool {
        true
    }

    fn validator_for_child(&self, _name: &str) -> &dyn ElementNameValidator {
        self
    }
}

/// Validates documents that are stored in a collection, such as inserted documents and
/// replacements: no field may start with `$` (apart from the DBRef fields) or contain a `.`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectionElementNameValidator;

const DBREF_FIELDS: [&str; 3] = ["$ref", "$id", "$db"];

impl ElementNameValidator for CollectionElementNameValidator {
    fn is_valid(&self, name: &str) -> bool {
        if name.starts_with('$') && !DBREF_FIELDS.contains(&name) {
            return false;
        }
        !name.contains('.')
    }

    fn validator_for_child(&self, _name: &str) -> &dyn ElementNameValidator {
        self
    }
}

/// Validates update documents: every top-level field must be an update operator. The operator
/// arguments are not checked.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateElementNameValidator;

impl ElementNameValidator for UpdateElementNameValidator {
    fn is_valid(&self, name: &str) -> bool {
        name.starts_with('$')
    }

    fn validator_for_child(&self, _name: &str) -> &dyn ElementNameValidator {
        &NoOpElementNameValidator
    }
}

/// Checks every field name in `document`, descending into subdocuments and arrays.
pub(crate) fn validate_document(
    validator: &dyn ElementNameValidator,
    document: &RawDocument,
) -> Result<()> {
    for result in document.iter() {
        let (name, value) = result?;
        if !validator.is_valid(name) {
            return Err(Error::invalid_argument(format!(
                "Element name '{}' is not valid",
                name
            )));
        }
        validate_value(validator.validator_for_child(name), value)?;
    }
    Ok(())
}

fn validate_value(validator: &dyn ElementNameValidator, value: RawBsonRef<'_>) -> Result<()> {
    match value {
        RawBsonRef::Document(document) => validate_document(validator, document),
        RawBsonRef::Array(array) => {
            for element in array {
                validate_value(validator, element?)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
