//! Nested form fields decoded from bracket notation.
//!
//! `user[name]=x` becomes `{"user": {"name": "x"}}` and `tags[]=a&tags[]=b`
//! becomes `{"tags": ["a", "b"]}`. A name whose brackets do not nest cleanly
//! is stored verbatim as a single flat key.

use serde::Serialize;
use std::collections::BTreeMap;

pub type FieldMap<T> = BTreeMap<String, Field<T>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Field<T> {
    Value(T),
    List(Vec<Field<T>>),
    Map(FieldMap<T>),
}

impl<T> Field<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Field<T>> {
        match self {
            Field::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn items(&self) -> Option<&[Field<T>]> {
        match self {
            Field::List(items) => Some(items),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Append,
}

/// Splits `a[b][]` into `("a", [Key("b"), Append])`.
///
/// Returns `None` for a plain name and for malformed nesting, both of which
/// are stored as one flat key.
fn split_name(name: &str) -> Option<(&str, Vec<Segment<'_>>)> {
    let open = name.find('[')?;
    let base = &name[..open];
    if base.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    let mut rest = &name[open..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        let key = &inner[..close];
        if key.contains('[') {
            return None;
        }
        segments.push(if key.is_empty() {
            Segment::Append
        } else {
            Segment::Key(key)
        });
        rest = &inner[close + 1..];
    }

    // `[]` only makes sense as the final segment
    let appends_inside = segments
        .iter()
        .rev()
        .skip(1)
        .any(|s| *s == Segment::Append);
    if appends_inside {
        return None;
    }

    Some((base, segments))
}

/// Inserts `value` under the bracket-notation `name`.
///
/// A plain leaf is overwritten by a later value with the same name. A value
/// whose path collides with an existing entry of a different shape is
/// dropped.
pub fn insert<T>(map: &mut FieldMap<T>, name: &str, value: T) {
    match split_name(name) {
        Some((base, segments)) => insert_at(map, base, &segments, value),
        None => insert_at(map, name, &[], value),
    }
}

fn insert_at<T>(map: &mut FieldMap<T>, key: &str, rest: &[Segment<'_>], value: T) {
    match rest.split_first() {
        None => {
            if !matches!(map.get(key), Some(Field::Map(_)) | Some(Field::List(_))) {
                map.insert(key.to_string(), Field::Value(value));
            }
        }
        Some((Segment::Append, _)) => {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| Field::List(Vec::new()));
            if let Field::List(items) = entry {
                items.push(Field::Value(value));
            }
        }
        Some((Segment::Key(next), tail)) => {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| Field::Map(FieldMap::new()));
            if let Field::Map(inner) = entry {
                insert_at(inner, next, tail, value);
            }
        }
    }
}

/// Name under which a field counts against the field quota.
pub fn base_name(name: &str) -> &str {
    match name.find('[') {
        Some(open) => &name[..open],
        None => name,
    }
}

/// Decodes an `application/x-www-form-urlencoded` payload into `map`.
///
/// Keys and values are percent-decoded after splitting on `&` and `=`, so
/// encoded separators inside a value survive.
pub fn decode_urlencoded(map: &mut FieldMap<String>, input: &[u8]) {
    for (name, value) in form_urlencoded::parse(input) {
        if name.is_empty() {
            continue;
        }
        insert(map, &name, value.into_owned());
    }
}
