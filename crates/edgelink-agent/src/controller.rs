//! The app-state controller.
//!
//! A single worker owns the live state. External callers hand it a
//! [`Transition`] through [`StateService::perform`] and block until the whole
//! chain finished or rolled back: each dispatch opens a skip-on-fail
//! transaction, runs the transition plus any follow-ups the handlers emit,
//! and finalizes the transaction with the accumulated error.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use edgelink_activity::{ActivityService, Transaction, TransactionOptions};
use edgelink_config::{ConfigService, UpdateOptions};
use edgelink_core::{AppState, Transition};
use edgelink_store::{AppStateSection, DeviceConfig};

use crate::error::{ControlError, Result};
use crate::handlers::StateHandler;

struct TransitionRequest {
    transition: Transition,
    reply: oneshot::Sender<Result<()>>,
}

/// The process-wide state controller.
pub struct StateService {
    config: Arc<ConfigService>,
    activity: Arc<ActivityService>,
    init_state: AppState,

    handlers: RwLock<HashMap<AppState, Arc<dyn StateHandler>>>,
    active_state: Arc<RwLock<AppState>>,
    tx: mpsc::Sender<TransitionRequest>,
    rx: Mutex<Option<mpsc::Receiver<TransitionRequest>>>,
}

impl StateService {
    /// Create the controller; it starts in `boot` until [`Self::boot`] runs.
    #[must_use]
    pub fn new(
        config: Arc<ConfigService>,
        activity: Arc<ActivityService>,
        init_state: AppState,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            config,
            activity,
            init_state,
            handlers: RwLock::new(HashMap::new()),
            active_state: Arc::new(RwLock::new(AppState::Boot)),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Install the state-handler registry.
    ///
    /// # Errors
    ///
    /// A duplicate handler, or a registry without the `boot` and initial
    /// state handlers, is a fatal startup error.
    pub fn set_state_handlers(&self, handlers: Vec<Arc<dyn StateHandler>>) -> Result<()> {
        let mut registry: HashMap<AppState, Arc<dyn StateHandler>> = HashMap::new();
        for handler in handlers {
            let state = handler.state_id();
            if registry.insert(state, handler).is_some() {
                return Err(ControlError::DuplicateHandler(state));
            }
        }

        if !registry.contains_key(&AppState::Boot) {
            return Err(ControlError::HandlerMissing(AppState::Boot));
        }
        if !registry.contains_key(&self.init_state) {
            return Err(ControlError::HandlerMissing(self.init_state));
        }

        *self.handlers.write() = registry;
        Ok(())
    }

    /// The live state.
    #[must_use]
    pub fn active_state(&self) -> AppState {
        *self.active_state.read()
    }

    /// Submit a transition and block until it completed or rolled back.
    ///
    /// # Errors
    ///
    /// Returns the transition's final error after rollback, or
    /// [`ControlError::ControllerClosed`] when the worker is gone.
    pub async fn perform(&self, transition: Transition) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(TransitionRequest {
                transition,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ControlError::ControllerClosed)?;

        match reply_rx.await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::error!(error = %e, "transition failed");
                }
                result
            }
            Err(_) => Err(ControlError::ControllerClosed),
        }
    }

    /// After-boot recovery: re-enter the recorded state through the same
    /// chaining loop used for live transitions.
    ///
    /// # Errors
    ///
    /// A failure here is fatal to startup.
    pub async fn boot(&self) -> Result<()> {
        let tx = self
            .activity
            .start_transaction("after boot transition", TransactionOptions::skip_on_fail())?;

        let result = self.boot_chain(&tx).await;
        let exec_err = result.as_ref().err().map(ToString::to_string);
        self.activity
            .finish_transaction(&tx, exec_err.as_deref())
            .await?;
        result
    }

    async fn boot_chain(&self, tx: &Arc<Transaction>) -> Result<()> {
        let config = self.config.get_config()?;
        let recorded = config
            .app_state
            .as_ref()
            .and_then(|section| AppState::parse(&section.state));
        let to_state = recorded.unwrap_or(self.init_state);

        let mut transition = Transition::OnAfterBoot(to_state);
        loop {
            match self.perform_transition(tx, &transition).await? {
                Some(next) => transition = next,
                None => return Ok(()),
            }
        }
    }

    /// Serve transitions until cancelled. At most one is in flight.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.rx.lock().take() else {
            tracing::error!("state controller already running");
            return;
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                request = rx.recv() => {
                    let Some(request) = request else { return };
                    let result = self.dispatch(request.transition).await;
                    let _ = request.reply.send(result);
                }
            }
        }
    }

    async fn dispatch(&self, transition: Transition) -> Result<()> {
        let tx = self
            .activity
            .start_transaction("perform state transition", TransactionOptions::skip_on_fail())?;

        let result = self.chain(&tx, transition).await;
        let exec_err = result.as_ref().err().map(ToString::to_string);
        match self
            .activity
            .finish_transaction(&tx, exec_err.as_deref())
            .await
        {
            Ok(()) => result,
            Err(finish_err) => {
                tracing::error!(error = %finish_err, "transaction finalization failed");
                result.and(Err(finish_err.into()))
            }
        }
    }

    async fn chain(&self, tx: &Arc<Transaction>, transition: Transition) -> Result<()> {
        let mut transition = transition;
        loop {
            match self.perform_transition(tx, &transition).await? {
                Some(next) => transition = next,
                None => return Ok(()),
            }
        }
    }

    async fn perform_transition(
        &self,
        tx: &Arc<Transaction>,
        transition: &Transition,
    ) -> Result<Option<Transition>> {
        let new_state = transition.target();
        let old_state = self.active_state();
        if old_state == new_state {
            return Err(ControlError::AlreadyInState(old_state));
        }

        let to_handler = self
            .handlers
            .read()
            .get(&new_state)
            .cloned()
            .ok_or(ControlError::HandlerMissing(new_state))?;

        to_handler.validate_transition(old_state)?;

        let active_handler = self.handlers.read().get(&old_state).cloned();
        match active_handler {
            Some(handler) => handler.on_exit(tx, transition).await?,
            None => tracing::error!(state = %old_state, "handler for active state not found"),
        }

        self.update_app_state(tx, old_state, new_state).await?;

        let follow_up = to_handler.handle(tx, transition).await?;

        tracing::info!(
            old_state = %old_state,
            new_state = %new_state,
            transition = transition.kind(),
            "transitioned to new state"
        );

        Ok(follow_up)
    }

    /// Persist the destination state and flip the live variable, both as
    /// rollback steps.
    async fn update_app_state(
        &self,
        tx: &Arc<Transaction>,
        old_state: AppState,
        new_state: AppState,
    ) -> Result<()> {
        let partial = DeviceConfig {
            app_state: Some(AppStateSection {
                state: new_state.as_str().to_string(),
            }),
            ..DeviceConfig::default()
        };
        self.config
            .update_config_with_tx(tx, &partial, UpdateOptions::default())
            .await?;

        let live = Arc::clone(&self.active_state);
        let live_undo = Arc::clone(&self.active_state);
        self.activity.execute_fn(
            tx,
            "switch live state",
            move || {
                *live.write() = new_state;
                Ok(())
            },
            move || {
                if old_state != AppState::Boot {
                    *live_undo.write() = old_state;
                }
                Ok(())
            },
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use edgelink_activity::ServiceOptions;
    use edgelink_config::UpdateStoreSectionHandler;
    use edgelink_store::{RocksStore, Store};
    use tempfile::TempDir;

    type HookResult = std::result::Result<Option<Transition>, String>;

    /// Scripted handler: records calls and replies per transition kind.
    struct ScriptedHandler {
        state: AppState,
        allowed_from: Vec<AppState>,
        log: Arc<Mutex<Vec<String>>>,
        on_handle: Box<dyn Fn(&Transition) -> HookResult + Send + Sync>,
        delay: Option<Duration>,
    }

    impl ScriptedHandler {
        fn passing(state: AppState, allowed_from: Vec<AppState>, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                state,
                allowed_from,
                log,
                on_handle: Box::new(|_| Ok(None)),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl StateHandler for ScriptedHandler {
        fn state_id(&self) -> AppState {
            self.state
        }

        fn validate_transition(&self, from: AppState) -> Result<()> {
            if self.allowed_from.is_empty() || self.allowed_from.contains(&from) {
                Ok(())
            } else {
                Err(ControlError::TransitionNotSupported {
                    from,
                    to: self.state,
                })
            }
        }

        async fn handle(
            &self,
            _tx: &Arc<Transaction>,
            transition: &Transition,
        ) -> Result<Option<Transition>> {
            self.log
                .lock()
                .push(format!("handle:{}:{}", self.state, transition.kind()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
                self.log.lock().push(format!("handled:{}", self.state));
            }
            (self.on_handle)(transition).map_err(ControlError::Internal)
        }

        async fn on_exit(
            &self,
            _tx: &Arc<Transaction>,
            _transition: &Transition,
        ) -> Result<()> {
            self.log.lock().push(format!("exit:{}", self.state));
            Ok(())
        }
    }

    struct Fixture {
        controller: Arc<StateService>,
        config: Arc<ConfigService>,
        log: Arc<Mutex<Vec<String>>>,
        cancel: CancellationToken,
        _dir: TempDir,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn build(handlers: impl FnOnce(Arc<Mutex<Vec<String>>>) -> Vec<Arc<dyn StateHandler>>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let activity = Arc::new(
            ActivityService::new(
                Arc::clone(&store),
                vec![Arc::new(UpdateStoreSectionHandler::new(Arc::clone(&store)))],
                ServiceOptions::default(),
            )
            .unwrap(),
        );
        let config = Arc::new(ConfigService::new(store, Arc::clone(&activity), vec![]));
        let controller = StateService::new(Arc::clone(&config), activity, AppState::Init);

        let log = Arc::new(Mutex::new(Vec::new()));
        controller.set_state_handlers(handlers(Arc::clone(&log))).unwrap();

        let cancel = CancellationToken::new();
        {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await });
        }

        Fixture {
            controller,
            config,
            log,
            cancel,
            _dir: dir,
        }
    }

    fn default_handlers(log: Arc<Mutex<Vec<String>>>) -> Vec<Arc<dyn StateHandler>> {
        vec![
            Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
            Arc::new(ScriptedHandler::passing(AppState::Init, vec![], Arc::clone(&log))),
            Arc::new(ScriptedHandler::passing(AppState::Active, vec![], log)),
        ]
    }

    fn persisted_state(config: &ConfigService) -> Option<String> {
        config
            .get_config()
            .unwrap()
            .app_state
            .map(|section| section.state)
    }

    #[tokio::test]
    async fn registry_rejects_duplicates_and_gaps() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let activity = Arc::new(
            ActivityService::new(Arc::clone(&store), vec![], ServiceOptions::default()).unwrap(),
        );
        let config = Arc::new(ConfigService::new(store, Arc::clone(&activity), vec![]));
        let controller = StateService::new(config, activity, AppState::Init);

        let log = Arc::new(Mutex::new(Vec::new()));
        let err = controller.set_state_handlers(vec![
            Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
            Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
        ]);
        assert!(matches!(err, Err(ControlError::DuplicateHandler(_))));

        let err = controller.set_state_handlers(vec![Arc::new(ScriptedHandler::passing(
            AppState::Boot,
            vec![],
            log,
        ))]);
        assert!(matches!(
            err,
            Err(ControlError::HandlerMissing(AppState::Init))
        ));
    }

    #[tokio::test]
    async fn transition_persists_and_flips_live_state() {
        let fixture = build(default_handlers);

        fixture
            .controller
            .perform(Transition::OnFallback)
            .await
            .unwrap();

        assert_eq!(fixture.controller.active_state(), AppState::Active);
        assert_eq!(
            persisted_state(&fixture.config).as_deref(),
            Some("active")
        );
        assert_eq!(
            fixture.log.lock().clone(),
            vec!["exit:boot", "handle:active:on_fallback"]
        );
    }

    #[tokio::test]
    async fn already_in_state_is_rejected() {
        let fixture = build(default_handlers);

        fixture
            .controller
            .perform(Transition::OnFallback)
            .await
            .unwrap();
        let err = fixture.controller.perform(Transition::OnFallback).await;
        assert!(matches!(err, Err(ControlError::AlreadyInState(_))));
    }

    #[tokio::test]
    async fn missing_destination_handler_is_rejected() {
        let fixture = build(default_handlers);

        let err = fixture.controller.perform(Transition::OnReset).await;
        assert!(matches!(
            err,
            Err(ControlError::HandlerMissing(AppState::Reset))
        ));
    }

    #[tokio::test]
    async fn validate_failure_prevents_exit_and_handle() {
        let fixture = build(|log| {
            vec![
                Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
                Arc::new(ScriptedHandler::passing(AppState::Init, vec![], Arc::clone(&log))),
                Arc::new(ScriptedHandler::passing(
                    AppState::Active,
                    vec![AppState::UpdateConfig],
                    log,
                )),
            ]
        });

        let err = fixture.controller.perform(Transition::OnFallback).await;
        assert!(matches!(
            err,
            Err(ControlError::TransitionNotSupported { .. })
        ));
        assert!(fixture.log.lock().is_empty());
        assert_eq!(fixture.controller.active_state(), AppState::Boot);
    }

    #[tokio::test]
    async fn failed_handle_rolls_back_live_and_persisted_state() {
        let fixture = build(|log| {
            let mut failing = ScriptedHandler::passing(AppState::Active, vec![], Arc::clone(&log));
            failing.on_handle = Box::new(|_| Err("handler exploded".into()));
            vec![
                Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
                Arc::new(ScriptedHandler::passing(AppState::Init, vec![], log)),
                Arc::new(failing),
            ]
        });

        // seed a known-good state first
        fixture
            .controller
            .perform(Transition::OnInitFallback)
            .await
            .unwrap();
        assert_eq!(fixture.controller.active_state(), AppState::Init);

        let err = fixture.controller.perform(Transition::OnFallback).await;
        assert!(err.is_err());

        assert_eq!(fixture.controller.active_state(), AppState::Init);
        assert_eq!(persisted_state(&fixture.config).as_deref(), Some("init"));
    }

    #[tokio::test]
    async fn follow_up_transitions_share_the_transaction() {
        let fixture = build(|log| {
            let mut chaining = ScriptedHandler::passing(AppState::Reset, vec![], Arc::clone(&log));
            chaining.on_handle = Box::new(|_| Ok(Some(Transition::OnInitFallback)));
            vec![
                Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
                Arc::new(ScriptedHandler::passing(AppState::Init, vec![], Arc::clone(&log))),
                Arc::new(ScriptedHandler::passing(AppState::Active, vec![], Arc::clone(&log))),
                Arc::new(chaining),
            ]
        });

        fixture.controller.perform(Transition::OnReset).await.unwrap();

        assert_eq!(fixture.controller.active_state(), AppState::Init);
        assert_eq!(
            fixture.log.lock().clone(),
            vec![
                "exit:boot",
                "handle:reset:on_reset",
                "exit:reset",
                "handle:init:on_init_fallback"
            ]
        );
    }

    #[tokio::test]
    async fn failed_follow_up_rolls_back_the_whole_chain() {
        let fixture = build(|log| {
            let mut chaining = ScriptedHandler::passing(AppState::Reset, vec![], Arc::clone(&log));
            chaining.on_handle = Box::new(|_| Ok(Some(Transition::OnInitFallback)));
            let mut failing = ScriptedHandler::passing(AppState::Init, vec![], Arc::clone(&log));
            failing.on_handle = Box::new(|transition| match transition {
                Transition::OnInitFallback => Err("follow-up exploded".into()),
                _ => Ok(None),
            });
            vec![
                Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
                Arc::new(failing),
                Arc::new(chaining),
            ]
        });

        let err = fixture.controller.perform(Transition::OnReset).await;
        assert!(err.is_err());

        // every persisted write of the chain rolled back; the live variable
        // stops at the first destination because `boot` is never restored
        assert_eq!(fixture.controller.active_state(), AppState::Reset);
        assert_eq!(persisted_state(&fixture.config), None);
    }

    #[tokio::test]
    async fn concurrent_performs_are_serialized() {
        let fixture = build(|log| {
            let mut slow = ScriptedHandler::passing(AppState::Active, vec![], Arc::clone(&log));
            slow.delay = Some(Duration::from_millis(50));
            let mut slow_init = ScriptedHandler::passing(AppState::Init, vec![], Arc::clone(&log));
            slow_init.delay = Some(Duration::from_millis(50));
            vec![
                Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
                Arc::new(slow_init),
                Arc::new(slow),
            ]
        });

        let first = {
            let controller = Arc::clone(&fixture.controller);
            tokio::spawn(async move { controller.perform(Transition::OnFallback).await })
        };
        let second = {
            let controller = Arc::clone(&fixture.controller);
            tokio::spawn(async move { controller.perform(Transition::OnInitFallback).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // no interleaving: each handle is followed by its own handled marker
        let log = fixture.log.lock().clone();
        let positions: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.starts_with("handle"))
            .map(|(index, _)| index)
            .collect();
        assert_eq!(positions.len(), 4);
        assert!(log[positions[0]].starts_with("handle:"));
        assert!(log[positions[0] + 1].starts_with("handled:"));
    }

    #[tokio::test]
    async fn boot_enters_initial_state_on_fresh_device() {
        let fixture = build(default_handlers);

        fixture.controller.boot().await.unwrap();
        assert_eq!(fixture.controller.active_state(), AppState::Init);
        assert_eq!(persisted_state(&fixture.config).as_deref(), Some("init"));
        assert!(fixture
            .log
            .lock()
            .iter()
            .any(|entry| entry == "handle:init:on_after_boot"));
    }

    #[tokio::test]
    async fn boot_follows_the_recorded_state() {
        let fixture = build(default_handlers);

        let partial = DeviceConfig {
            app_state: Some(AppStateSection {
                state: "active".into(),
            }),
            ..DeviceConfig::default()
        };
        fixture.config.update_config(&partial).await.unwrap();

        fixture.controller.boot().await.unwrap();
        assert_eq!(fixture.controller.active_state(), AppState::Active);
    }

    #[tokio::test]
    async fn boot_chains_handler_follow_ups() {
        // a recorded `reset` state whose after-boot handler falls back to init
        let fixture = build(|log| {
            let mut reset = ScriptedHandler::passing(AppState::Reset, vec![], Arc::clone(&log));
            reset.on_handle = Box::new(|transition| match transition {
                Transition::OnAfterBoot(_) => Ok(Some(Transition::OnInitFallback)),
                _ => Ok(None),
            });
            vec![
                Arc::new(ScriptedHandler::passing(AppState::Boot, vec![], Arc::clone(&log))),
                Arc::new(ScriptedHandler::passing(AppState::Init, vec![], Arc::clone(&log))),
                Arc::new(reset),
            ]
        });

        let partial = DeviceConfig {
            app_state: Some(AppStateSection {
                state: "reset".into(),
            }),
            ..DeviceConfig::default()
        };
        fixture.config.update_config(&partial).await.unwrap();

        fixture.controller.boot().await.unwrap();
        assert_eq!(fixture.controller.active_state(), AppState::Init);
        assert_eq!(persisted_state(&fixture.config).as_deref(), Some("init"));
    }
}
