// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::device::{ChildDevice, PlugError};

/// Identity of an open handle on the bus, taken from its file object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-handle state: the child device this handle plugged in, if any.
///
/// The session's forward reference and the child's back-reference are only
/// ever written together, with both locks held (session slot first, then
/// the child's), so no observer can see one set and the other cleared.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    child: Mutex<Option<Arc<ChildDevice>>>,
}

impl Session {
    #[must_use]
    pub const fn new(id: SessionId) -> Self {
        Self {
            id,
            child: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn bound_child(&self) -> Option<Arc<ChildDevice>> {
        self.child.lock().clone()
    }

    pub(crate) fn bind(&self, child: &Arc<ChildDevice>) -> Result<(), PlugError> {
        let mut slot = self.child.lock();
        if slot.is_some() {
            return Err(PlugError::SessionBound(self.id));
        }

        let mut back = child.session.lock();
        *back = Some(self.id);
        *slot = Some(Arc::clone(child));
        Ok(())
    }

    /// Breaks the binding in both directions and hands back the child.
    pub fn detach(&self) -> Option<Arc<ChildDevice>> {
        let mut slot = self.child.lock();
        if let Some(child) = slot.as_ref() {
            *child.session.lock() = None;
        }
        slot.take()
    }
}
