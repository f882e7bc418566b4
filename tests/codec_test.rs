//! Integration tests for the tagged codec and forward-reference fix-up.

use batchq::codec::{
    Arena, CodecError, Encode, Handle, Keyed, NamedRefs, RefMap, Registry, Tagged, encode_tagged,
};
use batchq::command::CommandTask;
use batchq::model::WorkerId;
use batchq::storage::Store;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

// ---------------------------------------------------------------------------
// A case: profiles plus hypotheses whose dropout rates are keyed by profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    alleles: Vec<String>,
}

impl Keyed for Profile {
    fn key(&self) -> &str {
        &self.name
    }
}

impl Tagged for Profile {
    const TAG: &'static str = "profile";
}

#[derive(Debug)]
struct Hypothesis {
    label: String,
    dropout: RefMap<Profile, f64>,
}

#[derive(Debug)]
struct Case {
    profiles: Arena<Profile>,
    hypotheses: Vec<Hypothesis>,
}

impl Tagged for Case {
    const TAG: &'static str = "case";
}

/// Raw decoded form: references still keyed by name.
#[derive(Serialize, Deserialize)]
struct HypothesisRepr {
    label: String,
    dropout: NamedRefs<f64>,
}

#[derive(Serialize, Deserialize)]
struct CaseRepr {
    #[serde(with = "batchq::codec::tagged::seq")]
    profiles: Vec<Profile>,
    hypotheses: Vec<HypothesisRepr>,
}

impl TryFrom<CaseRepr> for Case {
    type Error = CodecError;

    fn try_from(repr: CaseRepr) -> Result<Self, CodecError> {
        let profiles = Arena::from_items(repr.profiles)?;
        let hypotheses = repr
            .hypotheses
            .into_iter()
            .map(|h| {
                Ok(Hypothesis {
                    label: h.label,
                    dropout: h.dropout.resolve(&profiles)?,
                })
            })
            .collect::<Result<_, CodecError>>()?;
        Ok(Case {
            profiles,
            hypotheses,
        })
    }
}

impl Case {
    fn to_repr(&self) -> Result<CaseRepr, CodecError> {
        Ok(CaseRepr {
            profiles: self.profiles.iter().map(|(_, p)| p.clone()).collect(),
            hypotheses: self
                .hypotheses
                .iter()
                .map(|h| {
                    Ok(HypothesisRepr {
                        label: h.label.clone(),
                        dropout: h.dropout.to_named(&self.profiles)?,
                    })
                })
                .collect::<Result<_, CodecError>>()?,
        })
    }

    fn profile(&self, name: &str) -> Handle<Profile> {
        self.profiles.handle_of(name).unwrap()
    }
}

impl Serialize for Case {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_repr()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Case {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = CaseRepr::deserialize(deserializer)?;
        Case::try_from(repr).map_err(D::Error::custom)
    }
}

fn profile(name: &str, alleles: &[&str]) -> Profile {
    Profile {
        name: name.to_string(),
        alleles: alleles.iter().map(|a| a.to_string()).collect(),
    }
}

fn sample_case() -> Case {
    let profiles = Arena::from_items([
        profile("victim", &["12", "14"]),
        profile("suspect", &["11", "14"]),
    ])
    .unwrap();

    let mut prosecution = RefMap::new();
    prosecution.insert(profiles.handle_of("suspect").unwrap(), 0.1);
    prosecution.insert(profiles.handle_of("victim").unwrap(), 0.05);

    let mut defence = RefMap::new();
    defence.insert(profiles.handle_of("victim").unwrap(), 0.2);

    Case {
        profiles,
        hypotheses: vec![
            Hypothesis {
                label: "Hp".to_string(),
                dropout: prosecution,
            },
            Hypothesis {
                label: "Hd".to_string(),
                dropout: defence,
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// Fix-up
// ---------------------------------------------------------------------------

#[test]
fn references_are_stored_by_name() {
    let value = sample_case().encode().unwrap();
    assert_eq!(value["__type__"], "case");
    assert_eq!(value["profiles"][1]["__type__"], "profile");
    assert_eq!(
        value["hypotheses"][0]["dropout"],
        json!({"suspect": 0.1, "victim": 0.05})
    );
}

#[test]
fn decoded_references_point_at_sibling_objects() {
    let registry = Registry::<Case>::for_type();
    let text = batchq::codec::to_text(&sample_case()).unwrap();
    let case = registry.decode_str(&text).unwrap();

    assert_eq!(case.profiles.len(), 2);
    let hp = &case.hypotheses[0];
    assert_eq!(hp.label, "Hp");
    assert_eq!(hp.dropout.get(case.profile("suspect")), Some(&0.1));
    assert_eq!(hp.dropout.get(case.profile("victim")), Some(&0.05));

    // Keys resolve to the very objects held in the case's profile arena.
    for hypothesis in &case.hypotheses {
        for (target, _) in hypothesis.dropout.resolved(&case.profiles) {
            let held = case.profiles.get(case.profile(&target.name)).unwrap();
            assert!(std::ptr::eq(target, held));
        }
    }

    let (target, rate) = case.hypotheses[1]
        .dropout
        .resolved(&case.profiles)
        .next()
        .unwrap();
    assert_eq!(target, &profile("victim", &["12", "14"]));
    assert_eq!(*rate, 0.2);
}

#[test]
fn reencoding_a_decoded_case_is_stable() {
    let registry = Registry::<Case>::for_type();
    let first = sample_case().encode().unwrap();
    let second = registry.decode(first.clone()).unwrap().encode().unwrap();
    assert_eq!(first, second);
}

#[test]
fn reference_to_missing_sibling_fails_decode() {
    let registry = Registry::<Case>::for_type();
    let err = registry
        .decode(json!({
            "__type__": "case",
            "profiles": [{"__type__": "profile", "name": "victim", "alleles": []}],
            "hypotheses": [{"label": "Hp", "dropout": {"ghost": 0.3}}]
        }))
        .unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");
}

#[test]
fn duplicate_sibling_names_fail_decode() {
    let registry = Registry::<Case>::for_type();
    let err = registry
        .decode(json!({
            "__type__": "case",
            "profiles": [
                {"__type__": "profile", "name": "victim", "alleles": []},
                {"__type__": "profile", "name": "victim", "alleles": ["9"]}
            ],
            "hypotheses": []
        }))
        .unwrap_err();
    assert!(err.to_string().contains("duplicate key `victim`"), "{err}");
}

// ---------------------------------------------------------------------------
// A closed family of payloads sharing one store
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Payload {
    Case(Case),
    Command(CommandTask),
}

impl From<Case> for Payload {
    fn from(case: Case) -> Self {
        Payload::Case(case)
    }
}

impl From<CommandTask> for Payload {
    fn from(task: CommandTask) -> Self {
        Payload::Command(task)
    }
}

impl Encode for Payload {
    fn encode(&self) -> Result<serde_json::Value, CodecError> {
        match self {
            Payload::Case(case) => encode_tagged(case),
            Payload::Command(task) => encode_tagged(task),
        }
    }
}

fn payload_registry() -> Registry<Payload> {
    let mut registry = Registry::new();
    registry
        .register::<Case>()
        .unwrap()
        .register::<CommandTask>()
        .unwrap();
    registry
}

#[test]
fn store_dispatches_mixed_payloads_by_tag() {
    let store = Store::in_memory(payload_registry()).unwrap();
    let payloads = [
        Payload::Command(CommandTask {
            args: vec!["--fast".to_string()],
        }),
        Payload::Case(sample_case()),
    ];
    let ids = store.enqueue(&payloads).unwrap();

    let batch = store.claim_batch(WorkerId(1), 10).unwrap();
    assert_eq!(batch.len(), 2);
    match &batch.iter().find(|t| t.id == ids[0]).unwrap().payload {
        Payload::Command(task) => assert_eq!(task.args, vec!["--fast"]),
        other => panic!("expected command, got {other:?}"),
    }
    match &batch.iter().find(|t| t.id == ids[1]).unwrap().payload {
        Payload::Case(case) => {
            let suspect = case.profile("suspect");
            assert_eq!(case.hypotheses[0].dropout.get(suspect), Some(&0.1));
        }
        other => panic!("expected case, got {other:?}"),
    }
}

#[test]
fn unregistered_tag_is_a_serialization_failure() {
    let registry = Registry::<CommandTask>::for_type();
    let text = batchq::codec::to_text(&sample_case()).unwrap();
    let err = registry.decode_str(&text).unwrap_err();
    assert!(matches!(err, CodecError::UnknownTag(tag) if tag == "case"));
}
