use std::collections::HashSet;

use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, SecurityError};

/// Signature-counter anti-replay check for authenticator assertions.
///
/// A nonzero stored or presented counter must strictly increase. Authenticators
/// that never increment report zero every time; a zero/zero pair is accepted on
/// the credential's first use, always for allowlisted AAGUIDs, or always when the
/// guard is permissive.
#[derive(Debug, Clone, Default)]
pub struct CounterGuard {
    permissive: bool,
    zero_counter_aaguids: HashSet<Uuid>,
}

impl CounterGuard {
    pub fn new(permissive: bool, zero_counter_aaguids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            permissive,
            zero_counter_aaguids: zero_counter_aaguids.into_iter().collect(),
        }
    }

    pub fn strict() -> Self {
        Self::default()
    }

    pub fn check(
        &self,
        stored: u32,
        presented: u32,
        first_use: bool,
        aaguid: Option<Uuid>,
    ) -> Result<()> {
        if stored == 0 && presented == 0 {
            let allowlisted = aaguid.is_some_and(|id| self.zero_counter_aaguids.contains(&id));
            if first_use || allowlisted || self.permissive {
                return Ok(());
            }
            warn!(aaguid = ?aaguid, "repeated zero signature counter");
            return Err(SecurityError::ReplayDetected);
        }
        if presented <= stored {
            warn!(stored, presented, "signature counter did not increase");
            return Err(SecurityError::ReplayDetected);
        }
        Ok(())
    }
}
