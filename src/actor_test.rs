use crate::actor::{is_name_valid, validate_actor_def, ActorDef};
use crate::error::ActorError;

#[test]
fn new_actor_def_defaults_type_to_name() {
    let def = ActorDef::new("leader");
    assert_eq!(def.r#type, "leader", "expected type to default to name, got {}", def.r#type);
    assert_eq!(def.name, "leader", "unexpected name, got {}", def.name);
    assert!(def.namespace().is_empty(), "expected empty namespace, got {}", def.namespace());
}

#[test]
fn id_is_namespace_and_name() {
    let def = ActorDef::new("peer-0").with_namespace("loadtest");
    assert_eq!(def.id(), "loadtest-peer-0", "unexpected id, got {}", def.id());
    assert_eq!(def.to_string(), "loadtest-peer-0", "unexpected display, got {}", def);
}

#[test]
fn id_is_cached_after_first_use() {
    let mut def = ActorDef::new("peer-0").with_namespace("loadtest");
    let first = def.id().to_string();
    def.set_namespace("other");
    assert_eq!(def.id(), first, "expected id to be stable after first computation, got {} expected {}", def.id(), first);
}

#[test]
fn reg_id_is_stable_and_prefixed_with_id() {
    let (a, b) = (ActorDef::new("peer-0").with_namespace("loadtest"), ActorDef::new("peer-0").with_namespace("loadtest"));
    let (reg_a, reg_b) = (a.reg_id(), b.reg_id());
    assert_eq!(reg_a, reg_b, "expected reg ids of equal defs to match, got {} and {}", reg_a, reg_b);
    assert!(reg_a.starts_with("loadtest-peer-0-"), "expected reg id to be prefixed with id, got {}", reg_a);
    let other = ActorDef::new("peer-1").with_namespace("loadtest").reg_id();
    assert_ne!(reg_a, other, "expected reg ids of different defs to differ, both were {}", reg_a);
}

#[test]
fn validate_reports_type_first() {
    let mut def = ActorDef::new("n").with_namespace("ns");
    def.r#type = String::new();
    assert_eq!(validate_actor_def(&def), Err(ActorError::InvalidActorType));

    // Every field invalid still reports the type.
    let mut def = ActorDef::new("bad name");
    def.r#type = "bad type".into();
    assert_eq!(validate_actor_def(&def), Err(ActorError::InvalidActorType));
}

#[test]
fn validate_reports_name_then_namespace() {
    let mut def = ActorDef::new("n").with_namespace("bad namespace");
    def.name = "has whitespace".into();
    assert_eq!(validate_actor_def(&def), Err(ActorError::InvalidActorName));

    let def = ActorDef::new("n");
    assert_eq!(validate_actor_def(&def), Err(ActorError::InvalidActorNamespace));
}

#[test]
fn validate_accepts_valid_def() {
    let def = ActorDef::new("n").with_namespace("ns");
    assert_eq!(validate_actor_def(&def), Ok(()));
}

#[test]
fn name_grammar() {
    for name in ["a", "peer-0", "peer_0", "loadtest.grid", "ABC123"] {
        assert!(is_name_valid(name), "expected {:?} to be valid", name);
    }
    let too_long = "a".repeat(101);
    for name in ["", " ", "a b", "tab\tname", "new\nline", "slash/name", too_long.as_str()] {
        assert!(!is_name_valid(name), "expected {:?} to be invalid", name);
    }
}
