use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::Value;

use crate::cache::Cache;
use crate::error::ArgumentError;
use crate::future::{Future, UntypedFuture};

/// A 16-byte BLAKE3 digest used for task identity.
///
/// Rendered as 32 hex characters, this is the `task_id`: two tasks of the
/// same type whose argument records canonicalise to the same bytes share a
/// digest, and therefore a cache slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Digest([u8; 16]);

impl Digest {
    pub(crate) fn of(buffer: impl AsRef<[u8]>) -> Self {
        let hash = blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&hash.as_bytes()[..16]);
        Digest(out)
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 32];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// A leaf or subtree of a task's canonical argument record.
///
/// The canonical byte encoding frames every node with a tag byte, so no two
/// shapes can collide: a list is never byte-equal to a map, a byte string
/// never to a text string, a future reference never to a literal object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
    Future(FutureRef),
}

/// The identity fragment a future contributes to a downstream argument
/// record. `Const` carries its literal value; everything else carries the
/// identities of what it is built from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FutureRef {
    Task { name: String, id: String },
    Const(Box<ArgValue>),
    List(Vec<FutureRef>),
    Dict(BTreeMap<String, FutureRef>),
    Item { base: Box<FutureRef>, key: Key },
}

/// Index into a resolved container: an array position or an object field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Index(usize),
    Field(String),
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Index(i) => write!(f, "[{i}]"),
            Key::Field(s) => write!(f, "['{s}']"),
        }
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Key::Index(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Field(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Field(value)
    }
}

// Tag bytes for the canonical encoding. Every node kind gets its own tag;
// the sequence/mapping distinction is structural, not inferred.
const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_MAP: u8 = 0x08;
const TAG_FUT_TASK: u8 = 0x10;
const TAG_FUT_CONST: u8 = 0x11;
const TAG_FUT_LIST: u8 = 0x12;
const TAG_FUT_DICT: u8 = 0x13;
const TAG_FUT_ITEM: u8 = 0x14;
const TAG_KEY_INDEX: u8 = 0x15;
const TAG_KEY_FIELD: u8 = 0x16;

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

impl ArgValue {
    /// Appends the canonical byte form of this node to `out`.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ArgValue::Null => out.push(TAG_NULL),
            ArgValue::Bool(false) => out.push(TAG_FALSE),
            ArgValue::Bool(true) => out.push(TAG_TRUE),
            ArgValue::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            ArgValue::Float(v) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            ArgValue::Str(s) => {
                out.push(TAG_STR);
                put_str(out, s);
            }
            ArgValue::Bytes(b) => {
                out.push(TAG_BYTES);
                put_len(out, b.len());
                out.extend_from_slice(b);
            }
            ArgValue::List(items) => {
                out.push(TAG_LIST);
                put_len(out, items.len());
                for item in items {
                    item.encode(out);
                }
            }
            ArgValue::Map(map) => {
                // BTreeMap iteration is already sorted by key.
                out.push(TAG_MAP);
                put_len(out, map.len());
                for (key, value) in map {
                    put_str(out, key);
                    value.encode(out);
                }
            }
            ArgValue::Future(fragment) => fragment.encode(out),
        }
    }

    /// Renders the node as JSON for human inspection in `meta.json`.
    ///
    /// Byte strings and future references become tagged objects so the view
    /// stays unambiguous even though JSON itself has fewer shapes.
    pub(crate) fn to_json(&self) -> Value {
        match self {
            ArgValue::Null => Value::Null,
            ArgValue::Bool(v) => Value::Bool(*v),
            ArgValue::Int(v) => Value::from(*v),
            ArgValue::Float(v) => Value::from(*v),
            ArgValue::Str(s) => Value::String(s.clone()),
            ArgValue::Bytes(b) => serde_json::json!({ "__bytes__": BASE64.encode(b) }),
            ArgValue::List(items) => Value::Array(items.iter().map(ArgValue::to_json).collect()),
            ArgValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            ArgValue::Future(fragment) => fragment.to_json(),
        }
    }

    /// Converts a JSON value produced by serde into the canonical form.
    ///
    /// Rejects non-finite floats and integers outside the canonical range;
    /// those cannot take part in a stable identity.
    pub(crate) fn from_json(value: &Value) -> Result<Self, ArgumentError> {
        Ok(match value {
            Value::Null => ArgValue::Null,
            Value::Bool(v) => ArgValue::Bool(*v),
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    ArgValue::Int(v)
                } else if let Some(v) = n.as_u64() {
                    return Err(ArgumentError::IntegerRange(v));
                } else {
                    let v = n.as_f64().unwrap_or(f64::NAN);
                    if !v.is_finite() {
                        return Err(ArgumentError::NonFiniteFloat(v));
                    }
                    ArgValue::Float(v)
                }
            }
            Value::String(s) => ArgValue::Str(s.clone()),
            Value::Array(items) => ArgValue::List(
                items
                    .iter()
                    .map(ArgValue::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => ArgValue::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), ArgValue::from_json(v)?)))
                    .collect::<Result<_, ArgumentError>>()?,
            ),
        })
    }
}

impl FutureRef {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            FutureRef::Task { name, id } => {
                out.push(TAG_FUT_TASK);
                put_str(out, name);
                put_str(out, id);
            }
            FutureRef::Const(value) => {
                out.push(TAG_FUT_CONST);
                value.encode(out);
            }
            FutureRef::List(items) => {
                out.push(TAG_FUT_LIST);
                put_len(out, items.len());
                for item in items {
                    item.encode(out);
                }
            }
            FutureRef::Dict(map) => {
                out.push(TAG_FUT_DICT);
                put_len(out, map.len());
                for (key, value) in map {
                    put_str(out, key);
                    value.encode(out);
                }
            }
            FutureRef::Item { base, key } => {
                out.push(TAG_FUT_ITEM);
                base.encode(out);
                match key {
                    Key::Index(i) => {
                        out.push(TAG_KEY_INDEX);
                        put_len(out, *i);
                    }
                    Key::Field(s) => {
                        out.push(TAG_KEY_FIELD);
                        put_str(out, s);
                    }
                }
            }
        }
    }

    fn to_json(&self) -> Value {
        let (kind, id) = match self {
            FutureRef::Task { name, id } => {
                return serde_json::json!({ "__future__": name, "__id__": id });
            }
            FutureRef::Const(value) => ("__const__", value.to_json()),
            FutureRef::List(items) => (
                "__list__",
                Value::Array(items.iter().map(FutureRef::to_json).collect()),
            ),
            FutureRef::Dict(map) => (
                "__dict__",
                Value::Object(
                    map.iter()
                        .map(|(key, value)| (key.clone(), value.to_json()))
                        .collect(),
                ),
            ),
            FutureRef::Item { base, key } => {
                let key = match key {
                    Key::Index(i) => Value::from(*i),
                    Key::Field(s) => Value::String(s.clone()),
                };
                ("__item__", Value::Array(vec![base.to_json(), key]))
            }
        };
        serde_json::json!({ "__future__": kind, "__id__": id })
    }
}

/// The argument record of a task under construction.
///
/// A [`Recipe`](crate::Recipe) fills its `Plan` inside
/// [`plan`](crate::Recipe::plan): literal configuration goes in with
/// [`literal`](Plan::literal), upstream dependencies with
/// [`input`](Plan::input). The finished record determines the `task_id` and
/// the upstream edges of the task.
pub struct Plan<'a> {
    cache: &'a Cache,
    pub(crate) args: BTreeMap<String, ArgValue>,
    pub(crate) inputs: BTreeMap<String, UntypedFuture>,
}

impl<'a> Plan<'a> {
    pub(crate) fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            args: BTreeMap::new(),
            inputs: BTreeMap::new(),
        }
    }

    /// The cache store tasks in this plan are bound to. Use it to build
    /// upstream tasks inside [`Recipe::plan`](crate::Recipe::plan).
    pub fn cache(&self) -> &Cache {
        self.cache
    }

    fn claim(&mut self, name: &str) -> Result<(), ArgumentError> {
        if name.starts_with("task_") {
            return Err(ArgumentError::ReservedName(name.to_string()));
        }
        if self.args.contains_key(name) {
            return Err(ArgumentError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Declares a literal configuration value.
    ///
    /// The value is serialised with serde and canonicalised; map keys are
    /// sorted, sequence order is preserved. Values that do not reduce to
    /// JSON-representable leaves are rejected.
    pub fn literal<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), ArgumentError> {
        self.claim(name)?;

        let json = serde_json::to_value(value).map_err(|err| ArgumentError::Unrepresentable {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

        let value = ArgValue::from_json(&json)?;
        self.args.insert(name.to_string(), value);
        Ok(())
    }

    /// Declares a literal byte string.
    pub fn bytes(&mut self, name: &str, value: &[u8]) -> Result<(), ArgumentError> {
        self.claim(name)?;
        self.args
            .insert(name.to_string(), ArgValue::Bytes(value.to_vec()));
        Ok(())
    }

    /// Declares a named upstream dependency.
    ///
    /// The future's identity joins the argument record, so a downstream
    /// `task_id` changes whenever an upstream identity does. The body reads
    /// the resolved value back with
    /// [`TaskContext::input`](crate::TaskContext::input) under the same name.
    pub fn input<T>(&mut self, name: &str, future: Future<T>) -> Result<(), ArgumentError> {
        self.claim(name)?;
        let untyped = future.untyped();
        self.args.insert(
            name.to_string(),
            ArgValue::Future(untyped.node.identity_fragment()),
        );
        self.inputs.insert(name.to_string(), untyped);
        Ok(())
    }

    /// Digest of the canonical encoding of the whole record.
    pub(crate) fn task_id(&self) -> String {
        let mut bytes = Vec::new();
        ArgValue::Map(self.args.clone()).encode(&mut bytes);
        Digest::of(&bytes).to_hex()
    }

    /// The record rendered as JSON for `meta.json`.
    pub(crate) fn args_json(&self) -> Value {
        ArgValue::Map(self.args.clone()).to_json()
    }
}

/// Splits `args_json` back into the literal part, dropping future
/// references. This is what the registry feeds to serde when a child
/// process reconstructs a recipe.
pub(crate) fn literal_args(args_json: &Value) -> Value {
    match args_json {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !is_future_ref(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_future_ref(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.contains_key("__future__"))
}
