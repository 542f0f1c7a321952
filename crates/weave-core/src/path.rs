//! Component path parsing and traversal
//!
//! Component trees are JSON objects keyed by name. A path is dot-separated
//! with `[i]` for array items: `"sensors.cams[2].lens"`. Sub-components of
//! a node live under its `"components"` key.

use serde_json::{Map, Value};

use crate::error::{domains, Error, ErrorCode, Result};

// ----------------------------------------------------------------------------
// Path Elements
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathElement<'a> {
    pub name: &'a str,
    pub index: Option<usize>,
}

/// Split a dot path into elements, parsing the `name[index]` form.
pub fn parse(path: &str) -> Result<Vec<PathElement<'_>>> {
    let mut elements = Vec::new();
    for part in path.split('.') {
        let (name, index) = match part.find('[') {
            None => (part, None),
            Some(bracket) => {
                let (name, rest) = part.split_at(bracket);
                let rest = &rest[1..];
                if !rest.ends_with(']') {
                    return Err(Error::property_missing(
                        domains::COMPONENTS,
                        format!("Invalid array element syntax '{part}'"),
                    ));
                }
                let index_str = rest[..rest.len() - 1].trim();
                let index = index_str.parse::<usize>().map_err(|_| {
                    Error::new(
                        domains::COMPONENTS,
                        ErrorCode::InvalidPropValue,
                        format!("Invalid array index '{index_str}'"),
                    )
                })?;
                (name, Some(index))
            }
        };
        if name.is_empty() {
            return Err(Error::property_missing(
                domains::COMPONENTS,
                format!("Empty path element in '{path}'"),
            ));
        }
        elements.push(PathElement { name, index });
    }
    Ok(elements)
}

// ----------------------------------------------------------------------------
// Traversal
// ----------------------------------------------------------------------------

fn descend<'a>(
    root: &'a Map<String, Value>,
    element: &PathElement<'_>,
    walked: &str,
) -> Result<&'a Map<String, Value>> {
    let value = root.get(element.name).ok_or_else(|| {
        Error::property_missing(
            domains::COMPONENTS,
            format!("Component '{}' does not exist at '{}'", element.name, walked),
        )
    })?;

    match (value, element.index) {
        (Value::Array(_), None) => Err(Error::type_mismatch(
            domains::COMPONENTS,
            format!("Element '{}.{}' is an array", walked, element.name),
        )),
        (Value::Object(_), Some(_)) => Err(Error::type_mismatch(
            domains::COMPONENTS,
            format!("Element '{}.{}' is not an array", walked, element.name),
        )),
        (Value::Object(obj), None) => Ok(obj),
        (Value::Array(items), Some(index)) => items
            .get(index)
            .and_then(Value::as_object)
            .ok_or_else(|| {
                Error::property_missing(
                    domains::COMPONENTS,
                    format!(
                        "Element '{}.{}' does not contain item #{}",
                        walked, element.name, index
                    ),
                )
            }),
        _ => Err(Error::type_mismatch(
            domains::COMPONENTS,
            format!("Element '{}.{}' is not a component", walked, element.name),
        )),
    }
}

/// Resolve `path` against a component tree, descending through each node's
/// `"components"` child after the first element.
pub fn find_component<'a>(
    root: &'a Map<String, Value>,
    path: &str,
) -> Result<&'a Map<String, Value>> {
    let elements = parse(path)?;
    let mut current = root;
    let mut walked = String::new();
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            current = current
                .get("components")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    Error::property_missing(
                        domains::COMPONENTS,
                        format!("Component '{}' does not exist at '{}'", element.name, walked),
                    )
                })?;
        }
        current = descend(current, element, &walked)?;
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(element.name);
        if let Some(index) = element.index {
            walked.push_str(&format!("[{index}]"));
        }
    }
    Ok(current)
}

/// Mutable variant of [`find_component`].
pub fn find_component_mut<'a>(
    root: &'a mut Map<String, Value>,
    path: &str,
) -> Result<&'a mut Map<String, Value>> {
    // Resolve immutably first so errors carry the walked prefix, then
    // replay the walk mutably.
    find_component(root, path)?;

    let elements = parse(path)?;
    let mut current = root;
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            current = current
                .get_mut("components")
                .and_then(Value::as_object_mut)
                .expect("validated by immutable walk");
        }
        let value = current
            .get_mut(element.name)
            .expect("validated by immutable walk");
        current = match (value, element.index) {
            (Value::Object(obj), None) => obj,
            (Value::Array(items), Some(index)) => items
                .get_mut(index)
                .and_then(Value::as_object_mut)
                .expect("validated by immutable walk"),
            _ => unreachable!("validated by immutable walk"),
        };
    }
    Ok(current)
}

/// Recursive dictionary merge: object values merge key-by-key, everything
/// else is replaced.
pub fn merge_objects(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Expand a `"trait.prop"` name and a value into the nested object form
/// used by component state.
pub fn nest_property(name: &str, value: Value) -> Result<Map<String, Value>> {
    let (package, prop) = name.split_once('.').ok_or_else(|| {
        Error::property_missing(
            domains::COMPONENTS,
            format!("State property name not specified in '{name}'"),
        )
    })?;
    if package.is_empty() {
        return Err(Error::property_missing(
            domains::COMPONENTS,
            format!("Empty state package in '{name}'"),
        ));
    }
    if prop.is_empty() {
        return Err(Error::property_missing(
            domains::COMPONENTS,
            format!("State property name not specified in '{name}'"),
        ));
    }
    let mut inner = Map::new();
    inner.insert(prop.to_string(), value);
    let mut outer = Map::new();
    outer.insert(package.to_string(), Value::Object(inner));
    Ok(outer)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
