use resound_core::collections::HashSet;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Sink,
    Source,
}

/// What to do when a requested name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameRegFail {
    /// Pick a free `name.N` variant instead.
    #[default]
    Rename,
    /// Report the collision to the caller.
    Fail,
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    taken: HashSet<(Namespace, String)>,
}

impl NameRegistry {
    pub fn new() -> NameRegistry {
        NameRegistry::default()
    }

    /// Reserves a name, applying the collision policy. Returns the name that
    /// was actually registered.
    pub fn register(&mut self, ns: Namespace, name: &str, fail: NameRegFail) -> Result<String> {
        if name.is_empty() {
            return Err(Error::InvalidName);
        }

        if !self.taken.contains(&(ns, name.to_owned())) {
            self.taken.insert((ns, name.to_owned()));
            return Ok(name.to_owned());
        }

        if fail == NameRegFail::Fail {
            return Err(Error::NameTaken {
                name: name.to_owned(),
            });
        }

        for n in 1.. {
            let candidate = format!("{name}.{n}");
            if !self.taken.contains(&(ns, candidate.clone())) {
                self.taken.insert((ns, candidate.clone()));
                return Ok(candidate);
            }
        }

        unreachable!()
    }

    pub fn unregister(&mut self, ns: Namespace, name: &str) -> bool {
        self.taken.remove(&(ns, name.to_owned()))
    }

    pub fn is_registered(&self, ns: Namespace, name: &str) -> bool {
        self.taken.contains(&(ns, name.to_owned()))
    }
}
