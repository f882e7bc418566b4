//! serde adapters for nested tagged objects.
//!
//! Use on fields of an encodable type so nested objects carry their own tag
//! and are checked against it on decode:
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Plan {
//!     #[serde(with = "batchq::codec::tagged")]
//!     primary: Step,
//!     #[serde(with = "batchq::codec::tagged::seq")]
//!     fallbacks: Vec<Step>,
//! }
//! ```

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::{Tagged, decode_tagged, encode_tagged};

pub fn serialize<S, Ser>(value: &S, serializer: Ser) -> Result<Ser::Ok, Ser::Error>
where
    S: Tagged,
    Ser: Serializer,
{
    encode_tagged(value)
        .map_err(Ser::Error::custom)?
        .serialize(serializer)
}

pub fn deserialize<'de, S, D>(deserializer: D) -> Result<S, D::Error>
where
    S: Tagged,
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    decode_tagged(value).map_err(D::Error::custom)
}

/// Sequences of tagged objects.
pub mod seq {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use crate::codec::{Tagged, decode_tagged, encode_tagged};

    pub fn serialize<S, Ser>(values: &[S], serializer: Ser) -> Result<Ser::Ok, Ser::Error>
    where
        S: Tagged,
        Ser: Serializer,
    {
        values
            .iter()
            .map(encode_tagged)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, S, D>(deserializer: D) -> Result<Vec<S>, D::Error>
    where
        S: Tagged,
        D: Deserializer<'de>,
    {
        Vec::<Value>::deserialize(deserializer)?
            .into_iter()
            .map(decode_tagged)
            .collect::<Result<_, _>>()
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use crate::codec::{CodecError, Encode, Registry, Tagged};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Step {
        name: String,
    }

    impl Tagged for Step {
        const TAG: &'static str = "step";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Plan {
        #[serde(with = "crate::codec::tagged")]
        primary: Step,
        #[serde(with = "crate::codec::tagged::seq")]
        fallbacks: Vec<Step>,
    }

    impl Tagged for Plan {
        const TAG: &'static str = "plan";
    }

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
        }
    }

    #[test]
    fn nested_objects_carry_their_own_tags() {
        let plan = Plan {
            primary: step("fit"),
            fallbacks: vec![step("retry"), step("skip")],
        };
        assert_eq!(
            plan.encode().unwrap(),
            json!({
                "__type__": "plan",
                "primary": {"__type__": "step", "name": "fit"},
                "fallbacks": [
                    {"__type__": "step", "name": "retry"},
                    {"__type__": "step", "name": "skip"}
                ]
            })
        );

        let registry = Registry::<Plan>::for_type();
        let decoded = registry.decode(plan.encode().unwrap()).unwrap();
        assert_eq!(decoded, plan);
    }

    #[test]
    fn nested_tag_mismatch_fails_decode() {
        let registry = Registry::<Plan>::for_type();
        let err = registry
            .decode(json!({
                "__type__": "plan",
                "primary": {"__type__": "plan", "name": "fit"},
                "fallbacks": []
            }))
            .unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
        assert!(err.to_string().contains("expected tag `step`"));
    }
}
