use std::collections::{HashMap, HashSet};

use crate::{Connection, Result};

/// The reference-counted registry of daemon-side match registrations.
///
/// The daemon sees exactly one `AddMatch` per distinct expression and one
/// `RemoveMatch` once the last owner is gone. The registry lives behind an
/// async mutex because the daemon calls themselves suspend; holding the
/// lock across them serializes concurrent add/remove of the same
/// expression.
pub(crate) struct MatchRegistry {
    pub(crate) map: HashMap<String, HashSet<u64>>,
}

impl MatchRegistry {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl Connection {
    /// Register `expr` on behalf of `owner`, calling the daemon only for
    /// the first owner of the expression. The owner is recorded only after
    /// the daemon call succeeds.
    pub(crate) async fn add_match(&self, owner: u64, expr: &str) -> Result<()> {
        let mut registry = self.shared.matches.lock().await;

        if !registry.map.contains_key(expr) {
            tracing::debug!("AddMatch: {expr}");
            self.daemon().add_match(expr).await?;
        }

        registry.map.entry(expr.to_owned()).or_default().insert(owner);
        Ok(())
    }

    /// Drop `owner`'s registration of `expr`, calling the daemon once the
    /// owner set becomes empty.
    pub(crate) async fn remove_match(&self, owner: u64, expr: &str) -> Result<()> {
        let mut registry = self.shared.matches.lock().await;

        let Some(owners) = registry.map.get_mut(expr) else {
            return Ok(());
        };

        owners.remove(&owner);

        if owners.is_empty() {
            registry.map.remove(expr);

            if self.is_running() {
                tracing::debug!("RemoveMatch: {expr}");
                self.daemon().remove_match(expr).await?;
            }
        }

        Ok(())
    }
}
