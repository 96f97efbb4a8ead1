//! Actor definitions.
//!
//! Every participant of the grid's coordination protocol is named by an `ActorDef`. Peers use
//! the grid name as their namespace, so two grids sharing a log never confuse each other's
//! peers.

use std::fmt;
use std::hash::Hasher;
use std::sync::OnceLock;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ActorError;

lazy_static! {
    /// Regular expression used to validate each component of an actor definition.
    static ref RE_NAME: Regex = Regex::new(r"^[-_.a-zA-Z0-9]{1,100}$").expect("failed to compile RE_NAME regex");
}

/// The namespace, name and type of an actor.
#[derive(Clone, Debug, Default)]
pub struct ActorDef {
    /// The type of the actor, by default the same as its name.
    pub r#type: String,
    /// The name of the actor.
    pub name: String,
    namespace: String,
    /// Cached identity, computed on the first call to `id`.
    id: OnceLock<String>,
}

impl ActorDef {
    /// Create a new actor definition with the given name.
    ///
    /// The type defaults to the name; the namespace is assigned by the owning grid.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            r#type: name.clone(),
            name,
            namespace: String::new(),
            id: OnceLock::new(),
        }
    }

    /// Builder-style variant of `set_namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.set_namespace(namespace);
        self
    }

    /// Set the namespace of this actor.
    ///
    /// The identity is cached on first use of `id`, so the namespace must be set before that.
    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The ID of the actor, in the format `{namespace}-{name}`.
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| format!("{}-{}", self.namespace, self.name))
    }

    /// The registration ID of the actor, which is the ID suffixed with a hash of the ID.
    pub fn reg_id(&self) -> String {
        let id = self.id();
        let mut hasher = seahash::SeaHasher::new();
        hasher.write(id.as_bytes());
        format!("{}-{}", id, hasher.finish())
    }
}

impl fmt::Display for ActorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Validate the type, name & namespace of the given definition, in that order.
pub fn validate_actor_def(def: &ActorDef) -> Result<(), ActorError> {
    if !is_name_valid(&def.r#type) {
        return Err(ActorError::InvalidActorType);
    }
    if !is_name_valid(&def.name) {
        return Err(ActorError::InvalidActorName);
    }
    if !is_name_valid(&def.namespace) {
        return Err(ActorError::InvalidActorNamespace);
    }
    Ok(())
}

/// Check if the given name matches the grammar used for actor components.
pub fn is_name_valid(name: &str) -> bool {
    RE_NAME.is_match(name)
}
