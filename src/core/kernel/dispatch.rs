use crate::core::kernel::registry::SubscriptionRegistry;
use crate::core::types::Envelope;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{trace, warn};

/// Result of dispatching one envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Callbacks invoked, including failed ones
    pub invoked: usize,
    /// Callbacks that returned an error or panicked
    pub failed: usize,
}

/// Invokes the callbacks bound to an envelope, isolating their failures
#[derive(Debug, Clone)]
pub struct CallbackDispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl CallbackDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke every callback bound to the envelope's subject and group, in
    /// registration order
    ///
    /// A callback that errors or panics is logged and skipped; the remaining
    /// callbacks still receive the envelope.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let callbacks = self.registry.resolve_callbacks(
            &envelope.subject,
            envelope.group.as_deref(),
            &envelope.item,
        );

        if callbacks.is_empty() {
            trace!(subject = %envelope.subject, item = %envelope.item, "no callback bound");
            return DispatchOutcome::default();
        }

        let mut outcome = DispatchOutcome::default();
        for callback in callbacks {
            outcome.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(
                        subject = %envelope.subject,
                        group = ?envelope.group,
                        item = %envelope.item,
                        error = %e,
                        "callback failed"
                    );
                }
                Err(panic) => {
                    outcome.failed += 1;
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(
                        subject = %envelope.subject,
                        group = ?envelope.group,
                        item = %envelope.item,
                        reason = %reason,
                        "callback panicked"
                    );
                }
            }
        }
        outcome
    }
}
