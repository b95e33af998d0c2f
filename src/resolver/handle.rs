use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::error::Result;
use crate::object::Object;

use super::Resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Read,
    Write,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Read => write!(f, "r"),
            Mode::Write => write!(f, "w"),
        }
    }
}

/// An object checked out of the resolver.
///
/// Holds the URN lock for its mode. Dropping the handle puts the object back
/// into the matching cache and releases the lock.
pub struct Handle {
    resolver: Resolver,
    mode: Mode,
    object: Option<Object>,
}

impl Handle {
    pub(crate) fn new(resolver: Resolver, object: Object, mode: Mode) -> Self {
        Handle {
            resolver,
            mode,
            object: Some(object),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Close the object, then return it to the cache.
    pub fn close(mut self) -> Result<()> {
        let res = self.deref_mut().close();
        if self.mode == Mode::Write {
            // Readers opened earlier saw the unfinished object
            self.resolver.invalidate(self.urn());
        }
        res
    }

    /// Release the lock without caching the object.
    pub fn discard(mut self) {
        if let Some(object) = self.object.take() {
            self.resolver.release(object.urn(), self.mode);
        }
    }
}

impl Deref for Handle {
    type Target = Object;

    fn deref(&self) -> &Object {
        self.object.as_ref().expect("handle used after release")
    }
}

impl DerefMut for Handle {
    fn deref_mut(&mut self) -> &mut Object {
        self.object.as_mut().expect("handle used after release")
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.resolver.return_object(object, self.mode);
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(o) => write!(f, "Handle({}, {}, {})", o.type_name(), o.urn(), self.mode),
            None => write!(f, "Handle(released)"),
        }
    }
}
