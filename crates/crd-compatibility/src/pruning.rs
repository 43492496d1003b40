//! Removes fields from unstructured objects which are not declared by a [`StructuralSchema`].
//!
//! Unknown fields are kept wherever the schema preserves unknown fields or declares
//! `additionalProperties`. Values whose type does not match the schema are left untouched, the
//! API server rejects them during its own validation.
use serde_json::{Map, Value};

use crate::schema::{SchemaType, StructuralSchema};

/// Prunes `object` in place.
pub fn prune_object(object: &mut Map<String, Value>, schema: &StructuralSchema) {
    let permits_unknown_fields = schema.permits_unknown_fields();

    object.retain(|key, value| match schema.properties.get(key) {
        Some(property) => {
            prune_value(value, property);
            true
        }
        None => permits_unknown_fields,
    });
}

/// Prunes every element of `array` against the items schema of `schema`. Arrays without an items
/// schema are left untouched.
pub fn prune_array(array: &mut [Value], schema: &StructuralSchema) {
    let Some(items) = schema.items.as_deref() else {
        return;
    };

    for element in array {
        prune_value(element, items);
    }
}

fn prune_value(value: &mut Value, schema: &StructuralSchema) {
    match (schema.type_, value) {
        (Some(SchemaType::Object), Value::Object(object)) => prune_object(object, schema),
        (Some(SchemaType::Array), Value::Array(array)) => prune_array(array, schema),
        _ => {}
    }
}
