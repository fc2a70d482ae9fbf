use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::DeploymentError;

/// Full names with an operation currently running. A second operation on the
/// same full name is rejected rather than queued.
#[derive(Debug, Default)]
pub struct InFlightPackages {
    names: Mutex<HashSet<String>>,
}

impl InFlightPackages {
    pub fn claim(self: &Arc<Self>, full_name: &str) -> Result<InFlightClaim, DeploymentError> {
        let key = full_name.to_ascii_lowercase();
        if !self.names.lock().insert(key.clone()) {
            return Err(DeploymentError::OperationInProgress(full_name.to_string()));
        }
        Ok(InFlightClaim {
            owner: Arc::clone(self),
            key,
        })
    }

    pub fn is_claimed(&self, full_name: &str) -> bool {
        self.names.lock().contains(&full_name.to_ascii_lowercase())
    }
}

/// Releases its full name when dropped.
#[derive(Debug)]
pub struct InFlightClaim {
    owner: Arc<InFlightPackages>,
    key: String,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.owner.names.lock().remove(&self.key);
    }
}
