// Jackson Coxson

//! Binary plist encoder/decoder for the `NSKeyedArchiver` object-graph format
//! used by `XCTestConfiguration` and other DTX-carried archived objects.
//!
//! The wire format is a bplist00 dictionary with `$version`, `$archiver`,
//! `$top` (archive-root name -> uid), and a flat `$objects` array where
//! element 0 is always the literal string `$null`. Custom-class objects are
//! dictionaries with a `$class` uid pointing at a class-description object
//! (`{$classname, $classes}`). References between objects are `Uid` values
//! that index directly into `$objects`.
//!
//! Both sides of this module use a plain arena of nodes so that shared
//! references and cycles fall out for free: a `Uid` is just an index into
//! the same `Vec` the decoder or builder already holds, with no separate
//! remapping pass required.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::IdeviceError;

const NSKEYEDARCHIVER_VERSION: i64 = 100_000;

/// A single value referenced from an archived object's field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A reference to another arena entry.
    Ref(usize),
    /// An inline array of references, as used by `NS.objects`/`NS.keys`.
    RefArray(Vec<usize>),
    Bool(bool),
    Int(i64),
    Real(f64),
    String(String),
    Data(Vec<u8>),
}

/// A decoded custom-class object: `$class` plus its remaining keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedObject {
    pub classname: String,
    pub superclasses: Vec<String>,
    pub fields: Vec<(String, FieldValue)>,
    /// Arena index of the `$class` description object this was decoded
    /// with, before [`resolve_class_refs`] copied its name in. `None` for
    /// class-description objects themselves.
    class_index: Option<usize>,
}

impl ArchivedObject {
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// One entry in the decoded `$objects` arena.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    /// Seconds since the Unix epoch.
    Date(f64),
    Data(Vec<u8>),
    String(String),
    Object(ArchivedObject),
}

/// A decoded keyed archive: the `$objects` arena plus the `$top` root map.
#[derive(Debug, Clone)]
pub struct Archive {
    objects: Vec<Node>,
    top: std::collections::HashMap<String, usize>,
}

impl Archive {
    pub fn decode(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let value: plist::Value = plist::from_bytes(bytes)?;
        let root = value
            .as_dictionary()
            .ok_or_else(|| IdeviceError::ProtocolError("keyed archive root isn't a dict".into()))?;

        let objects_value = root
            .get("$objects")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IdeviceError::ProtocolError("keyed archive missing $objects".into()))?;

        let mut objects = objects_value
            .iter()
            .map(decode_node)
            .collect::<Result<Vec<_>, _>>()?;
        resolve_class_refs(&mut objects);

        let mut top = std::collections::HashMap::new();
        if let Some(top_dict) = root.get("$top").and_then(|v| v.as_dictionary()) {
            for (k, v) in top_dict {
                if let Some(uid) = v.as_uid() {
                    top.insert(k.clone(), uid.get() as usize);
                }
            }
        }

        Ok(Self { objects, top })
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.objects.get(index)
    }

    pub fn root(&self, name: &str) -> Option<&Node> {
        self.top.get(name).and_then(|&i| self.get(i))
    }

    /// Convenience for the common case of a single root named `root`.
    pub fn root_object(&self) -> Option<&Node> {
        self.root("root")
    }
}

fn decode_node(value: &plist::Value) -> Result<Node, IdeviceError> {
    Ok(match value {
        plist::Value::String(s) if s == "$null" => Node::Null,
        plist::Value::String(s) => Node::String(s.clone()),
        plist::Value::Boolean(b) => Node::Bool(*b),
        plist::Value::Integer(i) => Node::Int(i.as_signed().unwrap_or_default()),
        plist::Value::Real(r) => Node::Real(*r),
        plist::Value::Date(d) => Node::Date(date_to_secs(d)),
        plist::Value::Data(d) => Node::Data(d.clone()),
        plist::Value::Dictionary(dict) => {
            if let (Some(classname), Some(classes)) = (
                dict.get("$classname").and_then(|v| v.as_string()),
                dict.get("$classes").and_then(|v| v.as_array()),
            ) {
                // A class-description object, referenced via another
                // object's $class uid; surface it as an Object with no
                // fields so callers can still inspect the class chain.
                let superclasses = classes
                    .iter()
                    .filter_map(|v| v.as_string().map(str::to_string))
                    .collect();
                return Ok(Node::Object(ArchivedObject {
                    classname: classname.to_string(),
                    superclasses,
                    fields: Vec::new(),
                    class_index: None,
                }));
            }

            let class_index = dict
                .get("$class")
                .and_then(|v| v.as_uid())
                .map(|u| u.get() as usize);

            let mut fields = Vec::with_capacity(dict.len());
            for (k, v) in dict {
                if k == "$class" {
                    continue;
                }
                fields.push((k.clone(), decode_field(v)));
            }

            Node::Object(ArchivedObject {
                classname: String::new(),
                superclasses: Vec::new(),
                fields,
                class_index,
            })
        }
        other => {
            return Err(IdeviceError::ProtocolError(format!(
                "unsupported keyed archive object node: {other:?}"
            )));
        }
    })
}

/// Copies each object's class name/chain in from the class-description
/// object its `$class` uid points at. Done as a pass over the finished
/// arena rather than during `decode_node` since the referenced class
/// description may appear later in `$objects` than the object using it.
fn resolve_class_refs(objects: &mut [Node]) {
    let resolved: Vec<Option<(String, Vec<String>)>> = objects
        .iter()
        .map(|node| match node {
            Node::Object(obj) => obj.class_index.and_then(|i| match objects.get(i) {
                Some(Node::Object(class_obj)) if class_obj.class_index.is_none() => {
                    Some((class_obj.classname.clone(), class_obj.superclasses.clone()))
                }
                _ => None,
            }),
            _ => None,
        })
        .collect();

    for (node, resolved) in objects.iter_mut().zip(resolved) {
        if let (Node::Object(obj), Some((classname, superclasses))) = (node, resolved) {
            obj.classname = classname;
            obj.superclasses = superclasses;
        }
    }
}

fn decode_field(value: &plist::Value) -> FieldValue {
    match value {
        plist::Value::Uid(u) => FieldValue::Ref(u.get() as usize),
        plist::Value::Array(arr) => FieldValue::RefArray(
            arr.iter()
                .filter_map(|v| v.as_uid().map(|u| u.get() as usize))
                .collect(),
        ),
        plist::Value::Boolean(b) => FieldValue::Bool(*b),
        plist::Value::Integer(i) => FieldValue::Int(i.as_signed().unwrap_or_default()),
        plist::Value::Real(r) => FieldValue::Real(*r),
        plist::Value::String(s) => FieldValue::String(s.clone()),
        plist::Value::Data(d) => FieldValue::Data(d.clone()),
        _ => FieldValue::Int(0),
    }
}

fn date_to_secs(date: &plist::Date) -> f64 {
    let xml = date.to_xml_format();
    // `2001-01-01T00:00:00Z`-style string; round-trip through SystemTime to
    // get a plain numeric offset rather than re-parsing it by hand.
    plist::Date::from_xml_format(&xml)
        .ok()
        .map(SystemTime::from)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn secs_to_date(secs: f64) -> plist::Date {
    let t = UNIX_EPOCH + std::time::Duration::from_secs_f64(secs.max(0.0));
    plist::Date::from(t)
}

/// Builds a keyed archive's `$objects` arena one node at a time, handing out
/// stable indices as nodes are pushed. Cycles and shared references are
/// expressed directly by reusing an earlier index.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    objects: Vec<plist::Value>,
    class_cache: std::collections::HashMap<(&'static str, &'static [&'static str]), usize>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            objects: vec![plist::Value::String("$null".into())],
            class_cache: std::collections::HashMap::new(),
        }
    }

    pub fn push_bool(&mut self, v: bool) -> usize {
        self.push(plist::Value::Boolean(v))
    }

    pub fn push_int(&mut self, v: i64) -> usize {
        self.push(plist::Value::Integer(v.into()))
    }

    pub fn push_real(&mut self, v: f64) -> usize {
        self.push(plist::Value::Real(v))
    }

    pub fn push_date(&mut self, secs: f64) -> usize {
        self.push(plist::Value::Date(secs_to_date(secs)))
    }

    pub fn push_string(&mut self, v: impl Into<String>) -> usize {
        self.push(plist::Value::String(v.into()))
    }

    pub fn push_data(&mut self, v: impl Into<Vec<u8>>) -> usize {
        self.push(plist::Value::Data(v.into()))
    }

    /// Pushes a `{$classname, $classes}` class-description object, reusing
    /// an already-pushed one for the same class name and chain.
    pub fn push_class(&mut self, classname: &'static str, classes: &'static [&'static str]) -> usize {
        if let Some(&idx) = self.class_cache.get(&(classname, classes)) {
            return idx;
        }
        let mut dict = plist::Dictionary::new();
        dict.insert("$classname".into(), plist::Value::String(classname.into()));
        dict.insert(
            "$classes".into(),
            plist::Value::Array(classes.iter().map(|c| plist::Value::String((*c).into())).collect()),
        );
        let idx = self.push(plist::Value::Dictionary(dict));
        self.class_cache.insert((classname, classes), idx);
        idx
    }

    /// Pushes a custom-class object whose `$class` points at `class_idx`
    /// (as returned by [`Self::push_class`]).
    pub fn push_object(&mut self, class_idx: usize, fields: Vec<(&str, FieldValue)>) -> usize {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "$class".into(),
            plist::Value::Uid(plist::Uid::new(class_idx as u64)),
        );
        for (key, value) in fields {
            dict.insert(key.to_string(), encode_field(value));
        }
        self.push(plist::Value::Dictionary(dict))
    }

    /// Convenience for `NSArray`/`NSMutableArray`/`NSSet`-shaped objects.
    pub fn push_array_object(
        &mut self,
        class_idx: usize,
        elements: Vec<usize>,
    ) -> usize {
        self.push_object(class_idx, vec![("NS.objects", FieldValue::RefArray(elements))])
    }

    /// Convenience for `NSDictionary`-shaped objects.
    pub fn push_dict_object(
        &mut self,
        class_idx: usize,
        keys: Vec<usize>,
        values: Vec<usize>,
    ) -> usize {
        self.push_object(
            class_idx,
            vec![
                ("NS.keys", FieldValue::RefArray(keys)),
                ("NS.objects", FieldValue::RefArray(values)),
            ],
        )
    }

    fn push(&mut self, value: plist::Value) -> usize {
        self.objects.push(value);
        self.objects.len() - 1
    }

    /// Pushes an arbitrary plist value, recursively archiving arrays and
    /// dictionaries as `NSArray`/`NSDictionary` objects. Used for DTX
    /// auxiliary arguments and options dictionaries, which only need to
    /// round-trip through `NSKeyedUnarchiver` on the device side rather
    /// than reconstruct a specific Objective-C class.
    pub fn push_plist_value(&mut self, value: &plist::Value) -> usize {
        match value {
            plist::Value::Boolean(b) => self.push_bool(*b),
            plist::Value::Integer(i) => self.push_int(i.as_signed().unwrap_or_default()),
            plist::Value::Real(r) => self.push_real(*r),
            plist::Value::String(s) => self.push_string(s.clone()),
            plist::Value::Data(d) => self.push_data(d.clone()),
            plist::Value::Date(d) => self.push_date(date_to_secs(d)),
            plist::Value::Array(arr) => {
                let class = self.push_class("NSArray", &["NSArray", "NSObject"]);
                let elements = arr.iter().map(|v| self.push_plist_value(v)).collect();
                self.push_array_object(class, elements)
            }
            plist::Value::Dictionary(dict) => {
                let class = self.push_class("NSDictionary", &["NSDictionary", "NSObject"]);
                let mut keys = Vec::with_capacity(dict.len());
                let mut values = Vec::with_capacity(dict.len());
                for (k, v) in dict {
                    keys.push(self.push_string(k.clone()));
                    values.push(self.push_plist_value(v));
                }
                self.push_dict_object(class, keys, values)
            }
            _ => self.push(plist::Value::String("$null".into())),
        }
    }

    /// Finalizes the archive, rooting it at `root_idx` under the archive
    /// root name `"root"`, and returns the bplist00-encoded bytes.
    pub fn finish(self, root_idx: usize) -> Result<Vec<u8>, IdeviceError> {
        self.finish_named("root", root_idx)
    }

    pub fn finish_named(self, root_name: &str, root_idx: usize) -> Result<Vec<u8>, IdeviceError> {
        let mut top = plist::Dictionary::new();
        top.insert(
            root_name.to_string(),
            plist::Value::Uid(plist::Uid::new(root_idx as u64)),
        );

        let mut root = plist::Dictionary::new();
        root.insert("$version".into(), plist::Value::Integer(NSKEYEDARCHIVER_VERSION.into()));
        root.insert(
            "$archiver".into(),
            plist::Value::String("NSKeyedArchiver".into()),
        );
        root.insert("$top".into(), plist::Value::Dictionary(top));
        root.insert("$objects".into(), plist::Value::Array(self.objects));

        let mut buf = Vec::new();
        plist::Value::Dictionary(root).to_writer_binary(&mut buf)?;
        Ok(buf)
    }
}

fn encode_field(value: FieldValue) -> plist::Value {
    match value {
        FieldValue::Ref(i) => plist::Value::Uid(plist::Uid::new(i as u64)),
        FieldValue::RefArray(v) => plist::Value::Array(
            v.into_iter()
                .map(|i| plist::Value::Uid(plist::Uid::new(i as u64)))
                .collect(),
        ),
        FieldValue::Bool(b) => plist::Value::Boolean(b),
        FieldValue::Int(i) => plist::Value::Integer(i.into()),
        FieldValue::Real(r) => plist::Value::Real(r),
        FieldValue::String(s) => plist::Value::String(s),
        FieldValue::Data(d) => plist::Value::Data(d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_simple_string_array() {
        let mut builder = ArchiveBuilder::new();
        let array_class = builder.push_class("NSArray", &["NSArray", "NSObject"]);
        let a = builder.push_string("alpha");
        let b = builder.push_string("beta");
        let array = builder.push_array_object(array_class, vec![a, b]);
        let bytes = builder.finish(array).unwrap();

        let archive = Archive::decode(&bytes).unwrap();
        let Some(Node::Object(obj)) = archive.root_object() else {
            panic!("expected root object");
        };
        let Some(FieldValue::RefArray(elements)) = obj.field("NS.objects") else {
            panic!("expected NS.objects field");
        };
        assert_eq!(elements.len(), 2);
        assert_eq!(archive.get(elements[0]), Some(&Node::String("alpha".into())));
        assert_eq!(archive.get(elements[1]), Some(&Node::String("beta".into())));
    }

    #[test]
    fn supports_cyclic_object_graphs() {
        // A two-node cycle: node 1 references node 2's slot before it's
        // filled in, which is fine because indices are stable the moment
        // they're handed out.
        let mut builder = ArchiveBuilder::new();
        let class = builder.push_class("Node", &["Node", "NSObject"]);

        // Reserve both slots up front, then backfill their `next` fields.
        let placeholder = builder.push_object(class, vec![("next", FieldValue::Ref(0))]);
        let second = builder.push_object(class, vec![("next", FieldValue::Ref(placeholder))]);

        let bytes = builder.finish(second).unwrap();
        let archive = Archive::decode(&bytes).unwrap();

        let Some(Node::Object(second_obj)) = archive.root_object() else {
            panic!("expected root object");
        };
        assert_eq!(second_obj.field("next"), Some(&FieldValue::Ref(placeholder)));
    }

    #[test]
    fn null_decodes_from_index_zero() {
        let builder = ArchiveBuilder::new();
        let bytes = builder.finish(0).unwrap();
        let archive = Archive::decode(&bytes).unwrap();
        assert_eq!(archive.root_object(), Some(&Node::Null));
    }
}
