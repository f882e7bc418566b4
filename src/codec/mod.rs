//! Polymorphic task/result codec.
//!
//! Every encodable object is a flat JSON mapping of its fields plus a type
//! tag stored under [`TAG_KEY`]. Decoding dispatches on that tag through a
//! [`Registry`], which maps each tag to a type-specific reconstruction
//! routine. Types that need validation or cross-link resolution decode in two
//! phases: serde fills a raw representation, then a `TryFrom` conversion
//! checks it and runs the reference fix-up (see [`refs`]).
//!
//! The encoding is plain JSON text so stored payloads stay human-inspectable.
//! This is a trusted, internal codec, not a parser for hostile input.

pub mod refs;
pub mod tagged;

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

pub use self::refs::{Arena, Handle, Keyed, NamedRefs, RefMap};

/// Key under which the type tag is stored in every encoded mapping.
pub const TAG_KEY: &str = "__type__";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoded object carries no `__type__` tag")]
    MissingTag,

    #[error("no decoder registered for tag `{0}`")]
    UnknownTag(String),

    #[error("expected tag `{expected}`, found `{found}`")]
    TagMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("`{0}` does not encode to a JSON object")]
    NotAnObject(&'static str),

    #[error("reference to `{0}` has no matching sibling")]
    UnresolvedReference(String),

    #[error("duplicate key `{0}`")]
    DuplicateKey(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A concrete encodable type with a stable tag.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resample { seed: u64 }
///
/// impl Tagged for Resample {
///     const TAG: &'static str = "resample";
/// }
/// ```
pub trait Tagged: Serialize + DeserializeOwned {
    /// Stable across releases: it is persisted with every stored payload.
    const TAG: &'static str;
}

/// Anything the store can persist as a payload.
///
/// Every [`Tagged`] type is `Encode`. A closed family of task kinds (an enum
/// over several tagged types) implements it by delegating to
/// [`encode_tagged`] for the active variant.
pub trait Encode {
    fn encode(&self) -> Result<Value, CodecError>;
}

impl<S: Tagged> Encode for S {
    fn encode(&self) -> Result<Value, CodecError> {
        encode_tagged(self)
    }
}

/// Encode `value` as its field mapping plus the type tag.
pub fn encode_tagged<S: Tagged>(value: &S) -> Result<Value, CodecError> {
    let Value::Object(mut fields) = serde_json::to_value(value)? else {
        return Err(CodecError::NotAnObject(S::TAG));
    };
    if fields.contains_key(TAG_KEY) {
        return Err(CodecError::DuplicateKey(TAG_KEY.to_string()));
    }
    fields.insert(TAG_KEY.to_string(), Value::String(S::TAG.to_string()));
    Ok(Value::Object(fields))
}

/// Decode a mapping that must carry `S::TAG`.
pub fn decode_tagged<S: Tagged>(value: Value) -> Result<S, CodecError> {
    let (tag, fields) = split_tag(value)?;
    if tag != S::TAG {
        return Err(CodecError::TagMismatch {
            expected: S::TAG,
            found: tag,
        });
    }
    Ok(serde_json::from_value(Value::Object(fields))?)
}

/// Encode to the stored text form.
pub fn to_text<E: Encode + ?Sized>(value: &E) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&value.encode()?)?)
}

fn split_tag(value: Value) -> Result<(String, Map<String, Value>), CodecError> {
    let Value::Object(mut fields) = value else {
        return Err(CodecError::MissingTag);
    };
    match fields.remove(TAG_KEY) {
        Some(Value::String(tag)) => Ok((tag, fields)),
        _ => Err(CodecError::MissingTag),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type DecodeFn<T> = fn(Value) -> Result<T, CodecError>;

fn decode_into<S, T>(value: Value) -> Result<T, CodecError>
where
    S: Tagged + Into<T>,
{
    decode_tagged::<S>(value).map(Into::into)
}

/// Maps type tags to reconstruction routines producing a `T`.
///
/// `T` is usually either a single tagged type or an enum wrapping every task
/// kind a store may hold.
pub struct Registry<T> {
    decoders: HashMap<&'static str, DecodeFn<T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the decoder for `S`. Fails if its tag is already taken.
    pub fn register<S>(&mut self) -> Result<&mut Self, CodecError>
    where
        S: Tagged + Into<T>,
    {
        if self.decoders.contains_key(S::TAG) {
            return Err(CodecError::DuplicateKey(S::TAG.to_string()));
        }
        self.decoders.insert(S::TAG, decode_into::<S, T>);
        Ok(self)
    }

    /// Decode a tagged mapping by dispatching on its tag.
    pub fn decode(&self, value: Value) -> Result<T, CodecError> {
        let tag = value
            .get(TAG_KEY)
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingTag)?;
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| CodecError::UnknownTag(tag.to_string()))?;
        decoder(value)
    }

    /// Decode from the stored text form.
    pub fn decode_str(&self, text: &str) -> Result<T, CodecError> {
        self.decode(serde_json::from_str(text)?)
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl<S: Tagged> Registry<S> {
    /// Registry holding exactly one type.
    pub fn for_type() -> Self {
        let mut registry = Self::new();
        registry
            .decoders
            .insert(S::TAG, decode_into::<S, S> as DecodeFn<S>);
        registry
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
