//! Barcode validation rendezvous.
//!
//! An Inbound executor that has scanned a barcode parks on a one-shot
//! reply slot keyed by `command_id` until the caller answers through
//! `send_validation_result` (or the 5-minute timeout fires). First
//! resolution wins; duplicates and replies for unknown commands are
//! rejected to the caller.

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::types::BarcodeValidationResponse;

/// Keyed one-shot reply slots for in-flight Inbound commands.
#[derive(Debug, Default)]
pub struct BarcodeRendezvous {
    slots: DashMap<String, oneshot::Sender<BarcodeValidationResponse>>,
}

impl BarcodeRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a slot for a command and hand back the receiving half.
    ///
    /// A second registration for the same id replaces the first (the
    /// previous receiver resolves as cancelled); commands are unique per
    /// caller contract, so this only happens on a retried execution.
    pub fn register(&self, command_id: &str) -> oneshot::Receiver<BarcodeValidationResponse> {
        let (tx, rx) = oneshot::channel();
        if self.slots.insert(command_id.to_string(), tx).is_some() {
            tracing::warn!(
                command_id,
                "replaced an existing barcode validation slot"
            );
        }
        rx
    }

    /// Resolve a slot with the caller's verdict.
    ///
    /// First resolution wins. Errors: `NoPendingValidation` when no slot
    /// exists (never scanned, already resolved, or timed out),
    /// `ValidationExpired` when the executor stopped waiting between
    /// lookup and delivery.
    pub fn resolve(
        &self,
        command_id: &str,
        response: BarcodeValidationResponse,
    ) -> Result<(), CoreError> {
        let Some((_, slot)) = self.slots.remove(command_id) else {
            return Err(CoreError::NoPendingValidation(command_id.to_string()));
        };
        slot.send(response)
            .map_err(|_| CoreError::ValidationExpired(command_id.to_string()))
    }

    /// Drop a slot without resolving it (executor timeout/cancellation).
    pub fn cancel(&self, command_id: &str) {
        self.slots.remove(command_id);
    }

    /// Number of commands currently awaiting validation.
    pub fn waiting(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_resolve() {
        let rendezvous = BarcodeRendezvous::new();
        let rx = rendezvous.register("in1");
        assert_eq!(rendezvous.waiting(), 1);

        rendezvous
            .resolve("in1", BarcodeValidationResponse::reject("bad label"))
            .unwrap();
        let response = rx.await.unwrap();
        assert!(!response.valid);
        assert_eq!(rendezvous.waiting(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_resolution_rejected() {
        let rendezvous = BarcodeRendezvous::new();
        let _rx = rendezvous.register("in1");
        rendezvous
            .resolve("in1", BarcodeValidationResponse::reject("first"))
            .unwrap();

        let err = rendezvous
            .resolve("in1", BarcodeValidationResponse::reject("second"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NoPendingValidation(_)));
    }

    #[tokio::test]
    async fn test_resolve_unknown_command() {
        let rendezvous = BarcodeRendezvous::new();
        let err = rendezvous
            .resolve("ghost", BarcodeValidationResponse::reject("?"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NoPendingValidation(_)));
    }

    #[tokio::test]
    async fn test_resolve_after_executor_gave_up() {
        let rendezvous = BarcodeRendezvous::new();
        let rx = rendezvous.register("in1");
        drop(rx); // executor timed out
        let err = rendezvous
            .resolve("in1", BarcodeValidationResponse::reject("late"))
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationExpired(_)));
    }
}
