// # Value Model
//
// Tagged values, entities and the custom-type registry. Entities are maps of
// field name to `Value`; custom values travel as `{__type, __value}` maps so
// the record encoding stays self-describing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{DbError, Result};

/// Wire key for the custom-type tag.
const TYPE_KEY: &str = "__type";
/// Wire key for the custom-type payload.
const VALUE_KEY: &str = "__value";
/// Reserved field carrying the per-entity version counter.
pub const VERSION_FIELD: &str = "__version";
/// Reserved field carrying the entity id.
pub const ID_FIELD: &str = "id";

/// A field value. JSON-compatible primitives plus user-tagged custom types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Custom { type_name: String, payload: Box<Value> },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Resolve a dotted field path (`a.b.c`) against this value.
    pub fn path(&self, path: &str) -> Option<&Value> {
        let mut cur = self;
        for seg in path.split('.') {
            match cur {
                Value::Map(m) => cur = m.get(seg)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    /// Build a `Value` from a JSON value. Integers are preserved when the
    /// number fits in `i64`, everything else becomes a float.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                let map = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect();
                Value::Map(map)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::json!(*b),
            Value::Int(i) => serde_json::json!(*i),
            Value::Float(f) => serde_json::json!(*f),
            Value::String(s) => serde_json::json!(s),
            Value::Bytes(b) => serde_json::json!(b),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(m) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in m {
                    obj.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(obj)
            }
            Value::Custom { type_name, payload } => serde_json::json!({
                TYPE_KEY: type_name,
                VALUE_KEY: payload.to_json(),
            }),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Custom { type_name, payload } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(TYPE_KEY, type_name)?;
                map.serialize_entry(VALUE_KEY, payload.as_ref())?;
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a docdb value")
    }

    fn visit_unit<E>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom("integer out of range"))
    }

    fn visit_f64<E>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((k, v)) = access.next_entry::<String, Value>()? {
            map.insert(k, v);
        }
        // A two-entry map tagged with __type/__value is a custom value.
        if map.len() == 2 {
            if let (Some(Value::String(type_name)), Some(payload)) =
                (map.get(TYPE_KEY).cloned(), map.get(VALUE_KEY).cloned())
            {
                return Ok(Value::Custom {
                    type_name,
                    payload: Box::new(payload),
                });
            }
        }
        Ok(Value::Map(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// An entity: stable string id, field map, internal version counter.
///
/// The version starts at 0 for entities that have never been stored and is
/// bumped to 1 on first insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub version: u64,
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    /// Create an entity with a freshly generated time-ordered UUID (v7) id.
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            version: 0,
            fields,
        }
    }

    pub fn with_id(id: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            fields,
        }
    }

    /// Build an entity from a JSON object. An `id` field, when present and a
    /// string, becomes the entity id.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let obj = match json {
            serde_json::Value::Object(obj) => obj,
            other => {
                return Err(DbError::InvalidOperation(format!(
                    "entity must be a JSON object, got {other}"
                )))
            }
        };
        let mut fields = BTreeMap::new();
        let mut id = None;
        for (k, v) in obj {
            if k == ID_FIELD {
                match v {
                    serde_json::Value::String(s) => id = Some(s),
                    other => {
                        return Err(DbError::InvalidOperation(format!(
                            "entity id must be a string, got {other}"
                        )))
                    }
                }
            } else if k != VERSION_FIELD {
                fields.insert(k, Value::from_json(&v));
            }
        }
        Ok(match id {
            Some(id) => Entity::with_id(id, fields),
            None => Entity::new(fields),
        })
    }

    /// Resolve a dotted field path against the entity's fields.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        let root = self.fields.get(head)?;
        match rest {
            Some(rest) => root.path(rest),
            None => Some(root),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(ID_FIELD.to_string(), serde_json::json!(self.id));
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.to_json());
        }
        obj.insert(VERSION_FIELD.to_string(), serde_json::json!(self.version));
        serde_json::Value::Object(obj)
    }
}

/// A user-defined value type. Implementations validate the payload shape of
/// `Value::Custom` fields carrying their type name.
pub trait CustomType: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, payload: &Value) -> Result<()>;
}

/// Registry of custom value types. Passed explicitly on engine open; never a
/// process global.
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<dyn CustomType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, custom: Arc<dyn CustomType>) {
        self.types.insert(custom.name().to_string(), custom);
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Walk a value and validate every `Custom` node against the registry.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::Custom { type_name, payload } => {
                let custom = self.types.get(type_name).ok_or_else(|| {
                    DbError::InvalidOperation(format!("unregistered custom type: {type_name}"))
                })?;
                custom.validate(payload)?;
                self.validate(payload)
            }
            Value::List(items) => items.iter().try_for_each(|v| self.validate(v)),
            Value::Map(m) => m.values().try_for_each(|v| self.validate(v)),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_lookup() {
        let v = Value::from_json(&json!({"a": {"b": {"c": 7}}}));
        assert_eq!(v.path("a.b.c"), Some(&Value::Int(7)));
        assert_eq!(v.path("a.x"), None);
    }

    #[test]
    fn test_entity_from_json() {
        let e = Entity::from_json(json!({"id": "e1", "name": "x", "n": 3})).unwrap();
        assert_eq!(e.id, "e1");
        assert_eq!(e.field("name"), Some(&Value::String("x".to_string())));
        assert_eq!(e.version, 0);
    }

    #[test]
    fn test_entity_json_round_trip() {
        let e = Entity::from_json(json!({"id": "e1", "name": "x", "n": 3})).unwrap();
        let back = e.to_json();
        assert_eq!(back["id"], json!("e1"));
        assert_eq!(back["name"], json!("x"));
        assert_eq!(back["__version"], json!(0));
        assert_eq!(e.field("name").and_then(Value::as_str), Some("x"));
        assert_eq!(e.field("n").and_then(Value::as_float), Some(3.0));
    }

    #[test]
    fn test_generated_id_is_uuid() {
        let e = Entity::new(BTreeMap::new());
        assert_eq!(e.id.len(), 36);
        assert!(uuid::Uuid::parse_str(&e.id).is_ok());
    }

    #[test]
    fn test_custom_value_round_trip() {
        let v = Value::Custom {
            type_name: "point".to_string(),
            payload: Box::new(Value::List(vec![Value::Int(1), Value::Int(2)])),
        };
        let bytes = rmp_serde::to_vec(&v).unwrap();
        let back: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_plain_two_key_map_is_not_custom() {
        let v = Value::from_json(&json!({"a": 1, "b": 2}));
        let bytes = rmp_serde::to_vec(&v).unwrap();
        let back: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert!(matches!(back, Value::Map(_)));
    }

    struct Point;

    impl CustomType for Point {
        fn name(&self) -> &str {
            "point"
        }

        fn validate(&self, payload: &Value) -> Result<()> {
            match payload {
                Value::List(items) if items.len() == 2 => Ok(()),
                _ => Err(DbError::InvalidOperation("point wants [x, y]".to_string())),
            }
        }
    }

    #[test]
    fn test_registry_validation() {
        let mut registry = TypeRegistry::new();
        registry.register(Arc::new(Point));

        let good = Value::Custom {
            type_name: "point".to_string(),
            payload: Box::new(Value::List(vec![Value::Int(0), Value::Int(0)])),
        };
        assert!(registry.validate(&good).is_ok());

        let unknown = Value::Custom {
            type_name: "vector".to_string(),
            payload: Box::new(Value::Null),
        };
        assert!(registry.validate(&unknown).is_err());
    }
}
