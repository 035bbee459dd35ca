//! State handlers: one owner per app state.
//!
//! A handler validates inbound transitions, applies them by composing
//! activity-engine calls, and exits cleanly. Every observable effect a
//! handler performs goes through the transaction so it carries a declared
//! inverse.

pub mod active;
pub mod boot;
pub mod init;
pub mod maintenance;
pub mod reset;
pub mod update_config;
pub mod ztp_setup;

pub use active::ActiveStateHandler;
pub use boot::BootStateHandler;
pub use init::InitStateHandler;
pub use maintenance::MaintenanceStateHandler;
pub use reset::ResetStateHandler;
pub use update_config::UpdateConfigStateHandler;
pub use ztp_setup::ZtpSetupHandler;

use std::sync::Arc;

use async_trait::async_trait;

use edgelink_activity::{ActivityService, Transaction};
use edgelink_core::{AppState, Transition};
use edgelink_mq::MqService;

use crate::error::Result;

/// The owner of one state's behavior.
#[async_trait]
pub trait StateHandler: Send + Sync {
    /// The state this handler owns.
    fn state_id(&self) -> AppState;

    /// Reject transitions arriving from unsupported states.
    ///
    /// # Errors
    ///
    /// Returns `TransitionNotSupported` for a disallowed source state.
    fn validate_transition(&self, from: AppState) -> Result<()>;

    /// Apply the transition, optionally emitting a follow-up that runs in
    /// the same transaction.
    ///
    /// # Errors
    ///
    /// An error rolls back the whole transition chain.
    async fn handle(
        &self,
        tx: &Arc<Transaction>,
        transition: &Transition,
    ) -> Result<Option<Transition>>;

    /// Leave the state before the destination handler runs.
    ///
    /// # Errors
    ///
    /// An error aborts the transition.
    async fn on_exit(&self, tx: &Arc<Transaction>, transition: &Transition) -> Result<()>;
}

/// Activate the listed subjects as inline rollback steps.
pub(crate) fn subscribe_subjects(
    activity: &ActivityService,
    tx: &Transaction,
    mq: &Arc<MqService>,
    subjects: &[&str],
) -> Result<()> {
    for subject in subjects {
        let subject = (*subject).to_string();
        let forward_mq = Arc::clone(mq);
        let forward_subject = subject.clone();
        let undo_mq = Arc::clone(mq);
        let undo_subject = subject.clone();
        activity.execute_fn(
            tx,
            &format!("activate {subject}"),
            move || {
                forward_mq
                    .activate_handler(&forward_subject)
                    .map_err(|e| e.to_string())
            },
            move || {
                undo_mq
                    .deactivate_handler(&undo_subject)
                    .map_err(|e| e.to_string())
            },
        )?;
    }
    Ok(())
}

/// Deactivate the listed subjects as inline rollback steps.
pub(crate) fn unsubscribe_subjects(
    activity: &ActivityService,
    tx: &Transaction,
    mq: &Arc<MqService>,
    subjects: &[&str],
) -> Result<()> {
    for subject in subjects {
        let subject = (*subject).to_string();
        let forward_mq = Arc::clone(mq);
        let forward_subject = subject.clone();
        let undo_mq = Arc::clone(mq);
        let undo_subject = subject.clone();
        activity.execute_fn(
            tx,
            &format!("deactivate {subject}"),
            move || {
                forward_mq
                    .deactivate_handler(&forward_subject)
                    .map_err(|e| e.to_string())
            },
            move || {
                undo_mq
                    .activate_handler(&undo_subject)
                    .map_err(|e| e.to_string())
            },
        )?;
    }
    Ok(())
}
