// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, watch};

use super::SubmitError;
use crate::forwarder::{ForwarderConfig, RpcConnector, TxForwarder};

/// What the sequencer does with the transactions it receives.
enum SequencerRole {
    Active,
    /// Dropping the sender wakes everyone waiting for the pause to end.
    Paused(watch::Sender<()>),
    Forwarding(Arc<TxForwarder>),
}

/// A copy of the role that can be held across awaits.
#[derive(Clone)]
pub(crate) enum RoleSnapshot {
    Active,
    Paused(watch::Receiver<()>),
    Forwarding(Arc<TxForwarder>),
}

pub(crate) struct RoleState {
    role: Mutex<SequencerRole>,
    /// Signalled whenever a new forwarder is installed.
    pub forwarder_set: Notify,
}

impl RoleState {
    pub fn paused() -> Self {
        let (pause_tx, _) = watch::channel(());
        Self {
            role: Mutex::new(SequencerRole::Paused(pause_tx)),
            forwarder_set: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> RoleSnapshot {
        match &*self.lock() {
            SequencerRole::Active => RoleSnapshot::Active,
            SequencerRole::Paused(pause_tx) => RoleSnapshot::Paused(pause_tx.subscribe()),
            SequencerRole::Forwarding(forwarder) => RoleSnapshot::Forwarding(Arc::clone(forwarder)),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lock(), SequencerRole::Active)
    }

    pub fn forwarder(&self) -> Option<Arc<TxForwarder>> {
        match &*self.lock() {
            SequencerRole::Forwarding(forwarder) => Some(Arc::clone(forwarder)),
            _ => None,
        }
    }

    pub fn forward_target(&self) -> String {
        self.forwarder()
            .map(|forwarder| forwarder.primary_target())
            .unwrap_or_default()
    }

    pub fn pause(&self) {
        let mut role = self.lock();
        if matches!(*role, SequencerRole::Paused(_)) {
            return;
        }
        let (pause_tx, _) = watch::channel(());
        replace(&mut role, SequencerRole::Paused(pause_tx));
        tracing::info!("sequencer paused");
    }

    pub fn activate(&self) {
        let mut role = self.lock();
        replace(&mut role, SequencerRole::Active);
        tracing::info!("sequencer activated");
    }

    /// Starts forwarding to `url`. When the new forwarder can't connect the sequencer becomes
    /// active instead and the error is returned.
    pub fn forward_to(
        &self,
        url: &str,
        config: &ForwarderConfig,
        connector: Arc<dyn RpcConnector>,
    ) -> Result<(), SubmitError> {
        let mut role = self.lock();
        if let SequencerRole::Forwarding(current) = &*role
            && current.primary_target() == url
        {
            tracing::warn!(target = %url, "attempted to update sequencer forward target with existing target");
            return Ok(());
        }

        let forwarder = Arc::new(TxForwarder::new(vec![url.to_string()], config.clone(), connector));
        if let Err(err) = forwarder.connect() {
            replace(&mut role, SequencerRole::Active);
            tracing::error!(target = %url, error = %err, "failed to set forward target, sequencer is active");
            return Err(err.into());
        }
        replace(&mut role, SequencerRole::Forwarding(forwarder));
        drop(role);
        tracing::info!(target = %url, "sequencer forwarding");
        self.forwarder_set.notify_one();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SequencerRole> {
        self.role.lock().expect("sequencer role lock poisoned")
    }
}

/// Swaps in `next`, shutting down whatever the old role owned.
fn replace(role: &mut SequencerRole, next: SequencerRole) {
    match std::mem::replace(role, next) {
        SequencerRole::Forwarding(previous) => previous.disable(),
        // Dropping the sender releases paused waiters.
        SequencerRole::Paused(_) | SequencerRole::Active => {}
    }
}
