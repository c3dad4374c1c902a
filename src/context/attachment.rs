//! Typed, context-scoped attachments.
//!
//! Handlers of one operation share data through attachments instead of
//! globals. A key carries its value type, so a lookup with the wrong key
//! simply finds nothing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Key for an attachment holding a `T`.
pub struct AttachmentKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T: 'static> AttachmentKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn slot(&self) -> (&'static str, TypeId) {
        (self.name, TypeId::of::<T>())
    }
}

impl<T> fmt::Debug for AttachmentKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentKey({})", self.name)
    }
}

#[derive(Default)]
pub(crate) struct Attachments {
    values: HashMap<(&'static str, TypeId), Box<dyn Any + Send>>,
}

impl Attachments {
    /// Store `value`, returning the value it replaced.
    pub(crate) fn attach<T: Any + Send>(&mut self, key: &AttachmentKey<T>, value: T) -> Option<T> {
        self.values
            .insert(key.slot(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Store `value` unless the key is taken; returns the value now attached.
    pub(crate) fn attach_if_absent<T: Any + Send>(&mut self, key: &AttachmentKey<T>, value: T) -> Option<&mut T> {
        self.values
            .entry(key.slot())
            .or_insert_with(|| Box::new(value))
            .downcast_mut::<T>()
    }

    pub(crate) fn get<T: Any + Send>(&self, key: &AttachmentKey<T>) -> Option<&T> {
        self.values.get(&key.slot())?.downcast_ref::<T>()
    }

    pub(crate) fn get_mut<T: Any + Send>(&mut self, key: &AttachmentKey<T>) -> Option<&mut T> {
        self.values.get_mut(&key.slot())?.downcast_mut::<T>()
    }

    pub(crate) fn detach<T: Any + Send>(&mut self, key: &AttachmentKey<T>) -> Option<T> {
        self.values
            .remove(&key.slot())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }
}
