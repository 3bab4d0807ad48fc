//! Bookkeeping for attached hook links.

use std::collections::HashMap;
use std::fmt::Display;

use super::{HookError, HookKind};

/// Link handles of attached hooks.
///
/// Generic over the link type so the removal ordering works for any
/// backend that hands out one owned handle per attachment.
#[derive(Debug)]
pub struct LinkTable<L> {
    links: HashMap<HookKind, L>,
}

impl<L> Default for LinkTable<L> {
    fn default() -> Self {
        Self {
            links: HashMap::with_capacity(HookKind::ALL.len()),
        }
    }
}

impl<L> LinkTable<L> {
    pub fn contains(&self, hook: HookKind) -> bool {
        self.links.contains_key(&hook)
    }

    /// Track `link` for `hook`.
    pub fn insert(&mut self, hook: HookKind, link: L) -> Result<(), HookError> {
        if self.contains(hook) {
            return Err(HookError::AlreadyInstalled(hook));
        }
        self.links.insert(hook, link);
        Ok(())
    }

    /// Detach `hook` from `owner`, the looked-up holder of the attachment.
    ///
    /// A failed lookup leaves the link tracked so removal can be retried.
    /// `detach` consumes the link, so once it runs the hook is no longer
    /// tracked whatever its result.
    pub fn remove_with<P, E1, E2>(
        &mut self,
        hook: HookKind,
        owner: Result<P, E1>,
        detach: impl FnOnce(P, L) -> Result<(), E2>,
    ) -> Result<(), HookError>
    where
        E1: Display,
        E2: Display,
    {
        if !self.contains(hook) {
            return Err(HookError::NotInstalled(hook));
        }

        let owner = owner.map_err(|e| HookError::Remove {
            hook,
            reason: e.to_string(),
        })?;
        let link = self
            .links
            .remove(&hook)
            .ok_or(HookError::NotInstalled(hook))?;

        detach(owner, link).map_err(|e| HookError::Remove {
            hook,
            reason: e.to_string(),
        })
    }
}
