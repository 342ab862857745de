//! Reflective discovery of a plugin's configuration schema.
//!
//! [`PluginSchema::describe`] runs a `Default`-constructed plugin value
//! through a recording [`serde::Serializer`] and turns the observed structure
//! into a self-describing field map for external tooling (config validation,
//! documentation, UI generation) and for the binder's unused-field check.
//!
//! The recorder never produces output: it only notes field names, value
//! kinds and non-zero defaults. The `Duration`, `Size` and `Secret` wrapper
//! types are recognized by their newtype-struct names and reported as
//! dedicated semantic types instead of plain strings.

use std::fmt;

use indexmap::IndexMap;
use serde::ser::{self, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    /// A field's kind cannot be represented in a configuration schema.
    /// This is a programming error in the plugin definition.
    #[error("field {field:?} cannot be classified: {kind}")]
    Unclassifiable { field: String, kind: &'static str },
    #[error("schema serialization failed: {0}")]
    Serialize(String),
}

/// The semantic type of one configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Map,
    Object,
    Duration,
    Size,
    Secret,
    Unknown,
}

/// Schema of a single configuration field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub field_type: FieldType,
    /// The field's default, when it differs from the type's zero value.
    pub default: Option<toml::Value>,
    /// Free-form format hint (e.g. "cron", "hostport"), from plugin annotations.
    pub format: Option<String>,
    pub required: bool,
    /// Element type for arrays and maps.
    pub sub_type: Option<FieldType>,
    /// Nested schema for object-typed fields and struct elements.
    pub sub_fields: Option<IndexMap<String, FieldSchema>>,
}

/// A format or required-flag annotation attached to a field by its plugin.
#[derive(Debug, Clone, Copy)]
pub struct FieldHint {
    pub field: &'static str,
    pub format: Option<&'static str>,
    pub required: bool,
}

/// Self-description of a plugin's configuration surface.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSchema {
    pub name: String,
    pub fields: IndexMap<String, FieldSchema>,
}

impl PluginSchema {
    /// Describes `value` (normally the `Default` instance of a plugin).
    pub fn describe<T: Serialize>(name: &str, value: &T) -> Result<Self, SchemaError> {
        Self::describe_with_hints(name, value, &[])
    }

    /// Like [`describe`](Self::describe), applying `format`/`required` hints
    /// to the named top-level fields.
    pub fn describe_with_hints<T: Serialize>(
        name: &str,
        value: &T,
        hints: &[FieldHint],
    ) -> Result<Self, SchemaError> {
        let node = value
            .serialize(Recorder)
            .map_err(|e| SchemaError::Serialize(e.0))?;
        let entries = match node {
            Node::Struct(entries) | Node::Map(entries) => entries,
            _ => {
                return Err(SchemaError::Unclassifiable {
                    field: name.to_owned(),
                    kind: "plugin configuration is not a struct",
                })
            }
        };
        let mut fields = classify_entries(entries)?;
        for hint in hints {
            if let Some(field) = fields.get_mut(hint.field) {
                field.format = hint.format.map(str::to_owned);
                field.required = hint.required;
            }
        }
        Ok(PluginSchema {
            name: name.to_owned(),
            fields,
        })
    }

    /// The top-level field names, as declared keys would appear in a block.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// What the recorder saw for one serialized value.
#[derive(Debug)]
enum Node {
    Scalar(FieldType, Option<toml::Value>),
    Array(Option<Box<Node>>),
    Struct(IndexMap<String, Node>),
    /// Maps collect their entries too: a struct with `#[serde(flatten)]`
    /// members serializes as a map with the flattened keys already merged.
    Map(IndexMap<String, Node>),
    /// `None` / unit: present in the schema but of undetectable type.
    Unit,
    Unsupported(&'static str),
}

fn classify_entries(entries: IndexMap<String, Node>) -> Result<IndexMap<String, FieldSchema>, SchemaError> {
    let mut out = IndexMap::with_capacity(entries.len());
    for (key, node) in entries {
        let schema = classify(&key, node)?;
        out.insert(key, schema);
    }
    Ok(out)
}

fn classify(field: &str, node: Node) -> Result<FieldSchema, SchemaError> {
    let empty = FieldSchema {
        field_type: FieldType::Unknown,
        default: None,
        format: None,
        required: false,
        sub_type: None,
        sub_fields: None,
    };
    match node {
        Node::Scalar(field_type, default) => Ok(FieldSchema {
            field_type,
            default: default.filter(|v| !is_zero(v)),
            ..empty
        }),
        Node::Array(element) => {
            let mut schema = FieldSchema {
                field_type: FieldType::Array,
                ..empty
            };
            if let Some(element) = element {
                attach_element(&mut schema, field, *element)?;
            }
            Ok(schema)
        }
        Node::Map(entries) => {
            let mut schema = FieldSchema {
                field_type: FieldType::Map,
                ..empty
            };
            if let Some(first) = entries.into_values().next() {
                attach_element(&mut schema, field, first)?;
            }
            Ok(schema)
        }
        Node::Struct(entries) => Ok(FieldSchema {
            field_type: FieldType::Object,
            sub_fields: Some(classify_entries(entries)?),
            ..empty
        }),
        Node::Unit => Ok(empty),
        Node::Unsupported(kind) => Err(SchemaError::Unclassifiable {
            field: field.to_owned(),
            kind,
        }),
    }
}

/// Describes the element type of an array or map field.
fn attach_element(schema: &mut FieldSchema, field: &str, element: Node) -> Result<(), SchemaError> {
    let element = classify(field, element)?;
    schema.sub_type = Some(element.field_type);
    schema.sub_fields = element.sub_fields;
    Ok(())
}

fn is_zero(value: &toml::Value) -> bool {
    match value {
        toml::Value::String(s) => s.is_empty(),
        toml::Value::Integer(i) => *i == 0,
        toml::Value::Float(f) => *f == 0.0,
        toml::Value::Boolean(b) => !b,
        toml::Value::Array(a) => a.is_empty(),
        toml::Value::Table(t) => t.is_empty(),
        toml::Value::Datetime(_) => false,
    }
}

#[derive(Debug)]
struct RecordError(String);

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RecordError {}

impl ser::Error for RecordError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        RecordError(msg.to_string())
    }
}

/// The recording serializer. Produces a [`Node`] instead of output.
struct Recorder;

impl ser::Serializer for Recorder {
    type Ok = Node;
    type Error = RecordError;
    type SerializeSeq = SeqRecorder;
    type SerializeTuple = IgnoreRecorder;
    type SerializeTupleStruct = IgnoreRecorder;
    type SerializeTupleVariant = IgnoreRecorder;
    type SerializeMap = MapRecorder;
    type SerializeStruct = StructRecorder;
    type SerializeStructVariant = IgnoreRecorder;

    fn serialize_bool(self, v: bool) -> Result<Node, RecordError> {
        Ok(Node::Scalar(FieldType::Boolean, Some(toml::Value::Boolean(v))))
    }

    fn serialize_i8(self, v: i8) -> Result<Node, RecordError> {
        self.serialize_i64(v.into())
    }

    fn serialize_i16(self, v: i16) -> Result<Node, RecordError> {
        self.serialize_i64(v.into())
    }

    fn serialize_i32(self, v: i32) -> Result<Node, RecordError> {
        self.serialize_i64(v.into())
    }

    fn serialize_i64(self, v: i64) -> Result<Node, RecordError> {
        Ok(Node::Scalar(FieldType::Integer, Some(toml::Value::Integer(v))))
    }

    fn serialize_u8(self, v: u8) -> Result<Node, RecordError> {
        self.serialize_i64(v.into())
    }

    fn serialize_u16(self, v: u16) -> Result<Node, RecordError> {
        self.serialize_i64(v.into())
    }

    fn serialize_u32(self, v: u32) -> Result<Node, RecordError> {
        self.serialize_i64(v.into())
    }

    fn serialize_u64(self, v: u64) -> Result<Node, RecordError> {
        let default = i64::try_from(v).ok().map(toml::Value::Integer);
        Ok(Node::Scalar(FieldType::Integer, default))
    }

    fn serialize_f32(self, v: f32) -> Result<Node, RecordError> {
        self.serialize_f64(v.into())
    }

    fn serialize_f64(self, v: f64) -> Result<Node, RecordError> {
        Ok(Node::Scalar(FieldType::Float, Some(toml::Value::Float(v))))
    }

    fn serialize_char(self, v: char) -> Result<Node, RecordError> {
        Ok(Node::Scalar(
            FieldType::String,
            Some(toml::Value::String(v.to_string())),
        ))
    }

    fn serialize_str(self, v: &str) -> Result<Node, RecordError> {
        Ok(Node::Scalar(
            FieldType::String,
            Some(toml::Value::String(v.to_owned())),
        ))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Node, RecordError> {
        if v.is_empty() {
            Ok(Node::Array(None))
        } else {
            Ok(Node::Array(Some(Box::new(Node::Scalar(FieldType::Integer, None)))))
        }
    }

    fn serialize_none(self) -> Result<Node, RecordError> {
        Ok(Node::Unit)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Node, RecordError> {
        value.serialize(Recorder)
    }

    fn serialize_unit(self) -> Result<Node, RecordError> {
        Ok(Node::Unit)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Node, RecordError> {
        Ok(Node::Unit)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Node, RecordError> {
        // Unit enum variants show up in config files as strings.
        Ok(Node::Scalar(
            FieldType::String,
            Some(toml::Value::String(variant.to_owned())),
        ))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<Node, RecordError> {
        let inner = value.serialize(Recorder)?;
        match name {
            "Duration" => Ok(retype_wrapper(inner, FieldType::Duration, "0s")),
            "Size" => Ok(retype_wrapper(inner, FieldType::Size, "0")),
            "Secret" => Ok(Node::Scalar(FieldType::Secret, None)),
            _ => Ok(inner),
        }
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Node, RecordError> {
        Ok(Node::Unsupported("enum variant with data"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<SeqRecorder, RecordError> {
        Ok(SeqRecorder { first: None })
    }

    fn serialize_tuple(self, _len: usize) -> Result<IgnoreRecorder, RecordError> {
        Ok(IgnoreRecorder("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<IgnoreRecorder, RecordError> {
        Ok(IgnoreRecorder("tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<IgnoreRecorder, RecordError> {
        Ok(IgnoreRecorder("enum variant with data"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapRecorder, RecordError> {
        Ok(MapRecorder {
            entries: IndexMap::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<StructRecorder, RecordError> {
        Ok(StructRecorder {
            entries: IndexMap::with_capacity(len),
        })
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<IgnoreRecorder, RecordError> {
        Ok(IgnoreRecorder("enum variant with data"))
    }
}

struct SeqRecorder {
    first: Option<Box<Node>>,
}

impl ser::SerializeSeq for SeqRecorder {
    type Ok = Node;
    type Error = RecordError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), RecordError> {
        if self.first.is_none() {
            self.first = Some(Box::new(value.serialize(Recorder)?));
        }
        Ok(())
    }

    fn end(self) -> Result<Node, RecordError> {
        Ok(Node::Array(self.first))
    }
}

struct MapRecorder {
    entries: IndexMap<String, Node>,
    pending_key: Option<String>,
}

impl ser::SerializeMap for MapRecorder {
    type Ok = Node;
    type Error = RecordError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), RecordError> {
        let node = key.serialize(Recorder)?;
        self.pending_key = Some(match node {
            Node::Scalar(_, Some(toml::Value::String(s))) => s,
            Node::Scalar(_, Some(other)) => other.to_string(),
            _ => String::new(),
        });
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), RecordError> {
        let key = self.pending_key.take().unwrap_or_default();
        let node = value.serialize(Recorder)?;
        self.entries.insert(key, node);
        Ok(())
    }

    fn end(self) -> Result<Node, RecordError> {
        Ok(Node::Map(self.entries))
    }
}

struct StructRecorder {
    entries: IndexMap<String, Node>,
}

impl ser::SerializeStruct for StructRecorder {
    type Ok = Node;
    type Error = RecordError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), RecordError> {
        let node = value.serialize(Recorder)?;
        self.entries.insert(key.to_owned(), node);
        Ok(())
    }

    fn end(self) -> Result<Node, RecordError> {
        Ok(Node::Struct(self.entries))
    }
}

/// Collector for shapes that cannot appear in a config schema. The error is
/// raised at classification time so it can name the offending field.
struct IgnoreRecorder(&'static str);

macro_rules! impl_ignore {
    ($trait:ident, $method:ident) => {
        impl ser::$trait for IgnoreRecorder {
            type Ok = Node;
            type Error = RecordError;

            fn $method<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), RecordError> {
                Ok(())
            }

            fn end(self) -> Result<Node, RecordError> {
                Ok(Node::Unsupported(self.0))
            }
        }
    };
}

impl_ignore!(SerializeTuple, serialize_element);
impl_ignore!(SerializeTupleStruct, serialize_field);

impl ser::SerializeTupleVariant for IgnoreRecorder {
    type Ok = Node;
    type Error = RecordError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), RecordError> {
        Ok(())
    }

    fn end(self) -> Result<Node, RecordError> {
        Ok(Node::Unsupported(self.0))
    }
}

impl ser::SerializeStructVariant for IgnoreRecorder {
    type Ok = Node;
    type Error = RecordError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        _value: &T,
    ) -> Result<(), RecordError> {
        Ok(())
    }

    fn end(self) -> Result<Node, RecordError> {
        Ok(Node::Unsupported(self.0))
    }
}

fn retype_wrapper(inner: Node, field_type: FieldType, zero: &str) -> Node {
    match inner {
        Node::Scalar(_, Some(toml::Value::String(s))) if s != zero => {
            Node::Scalar(field_type, Some(toml::Value::String(s)))
        }
        _ => Node::Scalar(field_type, None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use serde::Serialize;

    use super::*;
    use crate::config::{Duration, Size};
    use crate::secrets::Secret;

    #[derive(Serialize, Default)]
    struct Auth {
        username: String,
        password: Secret,
    }

    #[derive(Serialize)]
    struct Demo {
        servers: Vec<String>,
        port: u16,
        ratio: f64,
        verbose: bool,
        interval: Duration,
        max_body: Size,
        token: Secret,
        comment: Option<String>,
        auth: Auth,
        headers: BTreeMap<String, String>,
    }

    impl Default for Demo {
        fn default() -> Self {
            Demo {
                servers: vec!["localhost".to_owned()],
                port: 11211,
                ratio: 0.0,
                verbose: false,
                interval: Duration::from_secs(10),
                max_body: Size::ZERO,
                token: Secret::default(),
                comment: None,
                auth: Auth::default(),
                headers: BTreeMap::new(),
            }
        }
    }

    #[test]
    fn classifies_scalars_and_containers() {
        let schema = PluginSchema::describe("demo", &Demo::default()).unwrap();
        let f = |name: &str| &schema.fields[name];

        assert_eq!(f("servers").field_type, FieldType::Array);
        assert_eq!(f("servers").sub_type, Some(FieldType::String));
        assert_eq!(f("port").field_type, FieldType::Integer);
        assert_eq!(f("ratio").field_type, FieldType::Float);
        assert_eq!(f("verbose").field_type, FieldType::Boolean);
        assert_eq!(f("interval").field_type, FieldType::Duration);
        assert_eq!(f("max_body").field_type, FieldType::Size);
        assert_eq!(f("token").field_type, FieldType::Secret);
        assert_eq!(f("comment").field_type, FieldType::Unknown);
        assert_eq!(f("auth").field_type, FieldType::Object);
        assert_eq!(f("headers").field_type, FieldType::Map);
    }

    #[test]
    fn nested_fields_are_described() {
        let schema = PluginSchema::describe("demo", &Demo::default()).unwrap();
        let auth = schema.fields["auth"].sub_fields.as_ref().unwrap();
        assert_eq!(auth["username"].field_type, FieldType::String);
        // secret-typed fields never expose a default
        assert_eq!(auth["password"].field_type, FieldType::Secret);
        assert_eq!(auth["password"].default, None);
    }

    #[test]
    fn non_zero_defaults_are_attached() {
        let schema = PluginSchema::describe("demo", &Demo::default()).unwrap();
        assert_eq!(
            schema.fields["port"].default,
            Some(toml::Value::Integer(11211))
        );
        assert_eq!(
            schema.fields["interval"].default,
            Some(toml::Value::String("10s".to_owned()))
        );
        // zero values carry no default
        assert_eq!(schema.fields["ratio"].default, None);
        assert_eq!(schema.fields["verbose"].default, None);
        assert_eq!(schema.fields["max_body"].default, None);
    }

    #[test]
    fn flattened_structs_merge_into_parent() {
        #[derive(Serialize, Default)]
        struct Common {
            timeout: Duration,
        }

        #[derive(Serialize, Default)]
        struct WithFlatten {
            url: String,
            #[serde(flatten)]
            common: Common,
        }

        let schema = PluginSchema::describe("flat", &WithFlatten::default()).unwrap();
        let names: Vec<&str> = schema.field_names().collect();
        assert_eq!(names, vec!["url", "timeout"]);
        assert_eq!(schema.fields["timeout"].field_type, FieldType::Duration);
    }

    #[test]
    fn hints_set_format_and_required() {
        let schema = PluginSchema::describe_with_hints(
            "demo",
            &Demo::default(),
            &[FieldHint {
                field: "servers",
                format: Some("hostport"),
                required: true,
            }],
        )
        .unwrap();
        assert_eq!(schema.fields["servers"].format.as_deref(), Some("hostport"));
        assert!(schema.fields["servers"].required);
        assert!(!schema.fields["port"].required);
    }

    #[test]
    fn unclassifiable_field_is_a_fatal_fault() {
        #[derive(Serialize, Default)]
        struct Bad {
            pair: (u8, u8),
        }
        let err = PluginSchema::describe("bad", &Bad::default()).unwrap_err();
        match err {
            SchemaError::Unclassifiable { field, .. } => assert_eq!(field, "pair"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn skipped_fields_do_not_appear() {
        #[derive(Default)]
        struct Conn;

        #[derive(Serialize, Default)]
        struct WithState {
            address: String,
            #[serde(skip)]
            #[allow(dead_code)]
            conn: Conn,
        }

        let schema = PluginSchema::describe("state", &WithState::default()).unwrap();
        let names: Vec<&str> = schema.field_names().collect();
        assert_eq!(names, vec!["address"]);
    }
}
