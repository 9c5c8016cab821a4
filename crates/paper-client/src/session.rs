//! One open document, kept in sync by a background task.
//!
//! The task owns a [`Reconciler`] and multiplexes editor input, pushed remote
//! patches, the in-flight push/pull, the debounce timer, the periodic resync
//! and the busy-ceiling timer. Whatever the reconciler decides is reported back
//! as [`SessionUpdate`]s.

use anyhow::Result;
use futures::future::{BoxFuture, OptionFuture};
use paper_core::api::{self, NoteApi};
use paper_core::{ErrorCode, NoteEvent, ReconcileConfig, Reconciler, Selection};
use paper_core::reconcile::Action;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Sleep};
use tracing::{debug, info, warn};
use web_time::Instant;

/// Editor -> session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// `base` is the text the editor showed when the user typed
    Edit {
        base: String,
        text: String,
        selection: Selection,
    },
    CompositionStart,
    CompositionEnd,
    Close,
}

/// Session -> editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The local text was replaced by a merge or a remote change
    Content { text: String, selection: Selection },
    /// A push or pull started (`true`) or finished (`false`)
    Saving(bool),
    /// Editing should be disabled (`false`) or re-enabled (`true`)
    Editable(bool),
    /// Something the user should be told about
    Error { code: ErrorCode, message: String },
}

enum Completion {
    Pulled(api::Result<String>),
    Pushed(api::Result<()>),
}

type InFlight = BoxFuture<'static, Completion>;

/// Deferred-reconcile timer. Re-arming pushes the deadline out, so a burst of
/// deferrals fires once after the last one.
struct Debounce {
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Debounce {
    fn new(delay: Duration) -> Self {
        Self { delay, sleep: None }
    }

    fn arm(&mut self) {
        let deadline = tokio::time::Instant::now() + self.delay;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
    }

    fn disarm(&mut self) {
        self.sleep = None;
    }

    fn deadline(&self) -> Option<tokio::time::Instant> {
        self.sleep.as_ref().map(|sleep| sleep.deadline())
    }
}

/// A document session before it is started.
pub struct DocumentSession<A> {
    api: Arc<A>,
    id: String,
    state: Reconciler,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    in_flight: Option<InFlight>,
    debounce: Debounce,
    editable: bool,
    saving: bool,
}

/// Handle to a running session.
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    task: JoinHandle<Result<Reconciler>>,
}

impl SessionHandle {
    /// Report an edit. `base` is the text the editor showed before it,
    /// normally the last `Content` received.
    pub fn edit(&self, base: impl Into<String>, text: impl Into<String>, selection: Selection) {
        let _ = self.inputs.send(SessionInput::Edit {
            base: base.into(),
            text: text.into(),
            selection,
        });
    }

    pub fn composition_start(&self) {
        let _ = self.inputs.send(SessionInput::CompositionStart);
    }

    pub fn composition_end(&self) {
        let _ = self.inputs.send(SessionInput::CompositionEnd);
    }

    /// Next update from the session; `None` once it has stopped.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        self.updates.recv().await
    }

    /// Stop the session after flushing pending edits. Returns its final state.
    pub async fn close(self) -> Result<Reconciler> {
        let _ = self.inputs.send(SessionInput::Close);
        self.task.await?
    }
}

impl<A: NoteApi + 'static> DocumentSession<A> {
    /// Open note `id`; the session loads the note when started.
    pub fn spawn(api: Arc<A>, id: impl Into<String>, config: ReconcileConfig) -> SessionHandle {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let session = Self {
            api,
            id: id.into(),
            state: Reconciler::new(config),
            updates: updates_tx,
            in_flight: None,
            debounce: Debounce::new(config.debounce),
            editable: true,
            saving: false,
        };
        let task = tokio::spawn(session.run(inputs_rx));

        SessionHandle {
            inputs: inputs_tx,
            updates: updates_rx,
            task,
        }
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) -> Result<Reconciler> {
        let config = *self.state.config();
        self.api.subscribe(&self.id).await?;
        info!("Opened {}", self.id);

        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        let _sub = {
            let id = self.id.clone();
            self.api.events().subscribe(move |event| {
                if let NoteEvent::NoteChanged { id: changed, .. } = event {
                    if *changed == id {
                        let _ = remote_tx.send(event.clone());
                    }
                }
            })
        };

        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + config.resync_interval,
            config.resync_interval,
        );

        self.step();

        loop {
            let busy = self
                .state
                .busy_deadline()
                .filter(|_| self.editable)
                .map(|deadline| sleep_until(tokio::time::Instant::from_std(deadline)));

            tokio::select! {
                biased;

                Some(event) = remote_rx.recv() => {
                    if let NoteEvent::NoteChanged { patch, hash, .. } = event {
                        self.state.on_remote_patch(&patch, hash);
                    }
                    self.step();
                }

                Some(done) = OptionFuture::from(self.in_flight.as_mut()) => {
                    self.in_flight = None;
                    self.complete(done);
                }

                input = inputs.recv() => {
                    match input {
                        Some(SessionInput::Edit { base, text, selection }) => {
                            self.state.on_local_edit_from(&base, text.as_str(), selection);
                            if self.state.local() != text {
                                self.notify(SessionUpdate::Content {
                                    text: self.state.local().to_string(),
                                    selection: self.state.selection(),
                                });
                            }
                            self.step();
                        }
                        Some(SessionInput::CompositionStart) => {
                            self.state.on_composition_start();
                            self.refresh_editable();
                        }
                        Some(SessionInput::CompositionEnd) => {
                            self.state.on_composition_end();
                            self.step();
                        }
                        Some(SessionInput::Close) | None => break,
                    }
                }

                Some(()) = OptionFuture::from(self.debounce.sleep.as_mut()) => {
                    self.debounce.disarm();
                    self.step();
                }

                Some(()) = OptionFuture::from(busy) => {
                    self.refresh_editable();
                }

                _ = resync.tick() => {
                    debug!("Periodic resync of {}", self.id);
                    if let Err(e) = self.api.subscribe(&self.id).await {
                        warn!("Resubscribe to {} failed: {}", self.id, e);
                    }
                    self.state.mark_stale();
                    self.step();
                }
            }
        }

        // Let the last edits reach the server
        while let Some(pending) = self.in_flight.take() {
            let done = pending.await;
            self.complete(done);
        }
        if self.state.has_unsaved_changes() {
            warn!("Closing {} with unsaved changes", self.id);
        }

        if let Err(e) = self.api.unsubscribe(&self.id).await {
            debug!("Unsubscribe from {} failed: {}", self.id, e);
        }
        info!("Closed {}", self.id);
        Ok(self.state)
    }

    /// Reconcile once and start whatever operation it asks for.
    fn step(&mut self) {
        let before = self.state.local().to_string();
        let action = self.state.reconcile(Instant::now());

        if self.state.local() != before {
            self.notify(SessionUpdate::Content {
                text: self.state.local().to_string(),
                selection: self.state.selection(),
            });
        }

        match action {
            Action::Idle => {}
            Action::Defer => self.defer(),
            Action::Pull => {
                let api = Arc::clone(&self.api);
                let id = self.id.clone();
                self.in_flight = Some(Box::pin(async move {
                    Completion::Pulled(api.get(&id).await)
                }));
            }
            Action::Push { patch, hash } => {
                let api = Arc::clone(&self.api);
                let id = self.id.clone();
                self.in_flight = Some(Box::pin(async move {
                    Completion::Pushed(api.save(&id, &patch, hash).await)
                }));
            }
        }

        self.refresh_saving();
        self.refresh_editable();
    }

    fn complete(&mut self, done: Completion) {
        let retry_later = match done {
            Completion::Pulled(result) => {
                let failed = result.is_err();
                self.state.on_pull_result(result);
                failed
            }
            Completion::Pushed(result) => {
                let retry = match &result {
                    Ok(()) => false,
                    Err(e) if e.code() == ErrorCode::HashMismatch => false,
                    Err(e) if e.code() == ErrorCode::ExceededMaxSize => {
                        self.notify(SessionUpdate::Error {
                            code: e.code(),
                            message: e.to_string(),
                        });
                        false
                    }
                    Err(e) => {
                        warn!("Saving {} failed: {}", self.id, e);
                        true
                    }
                };
                self.state.on_push_result(result);
                retry
            }
        };

        if retry_later {
            self.defer();
            self.refresh_saving();
            self.refresh_editable();
        } else {
            self.step();
        }
    }

    fn defer(&mut self) {
        self.debounce.arm();
    }

    fn refresh_saving(&mut self) {
        let saving = self.state.is_saving();
        if saving != self.saving {
            self.saving = saving;
            self.notify(SessionUpdate::Saving(saving));
        }
    }

    fn refresh_editable(&mut self) {
        let editable = self.state.is_editable(Instant::now());
        if editable != self.editable {
            self.editable = editable;
            self.notify(SessionUpdate::Editable(editable));
        }
    }

    fn notify(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}
