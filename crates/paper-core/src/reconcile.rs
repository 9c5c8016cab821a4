//! Client-side reconciliation of one open document.
//!
//! `Reconciler` holds three versions of the note:
//! - `local`: what the user sees and edits
//! - `remote`: the latest server content this client knows of
//! - `common`: the last content both sides agreed on, the merge base
//!
//! It performs no I/O. The owner feeds it edits, pushed patches and operation
//! results, and calls [`Reconciler::reconcile`] afterwards; the returned
//! [`Action`] says what to do next. At most one push or pull is in flight.

use std::time::Duration;
use tracing::{debug, warn};
use web_time::Instant;

use crate::diff3::{apply_patch, create_patch, merge3, Patch, Selection};
use crate::error::{ApiError, ErrorCode};
use crate::hash::ContentHash;

/// Timer settings for a document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Delay before retrying a deferred reconciliation; bursts coalesce
    pub debounce: Duration,
    /// Interval of the periodic re-subscribe and resync
    pub resync_interval: Duration,
    /// In-flight time after which the editor is reported as not editable
    pub busy_ceiling: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            resync_interval: Duration::from_secs(60),
            busy_ceiling: Duration::from_secs(10),
        }
    }
}

/// What the owner of a `Reconciler` should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// In sync; nothing to do until something changes
    Idle,
    /// Work is pending but blocked; reconcile again after the debounce
    Defer,
    /// Fetch the note, then call `on_pull_result`
    Pull,
    /// Save `patch` with expected `hash`, then call `on_push_result`
    Push { patch: Patch, hash: ContentHash },
}

#[derive(Debug, Clone)]
enum InFlight {
    Push { sent: String, started: Instant },
    Pull { started: Instant },
}

impl InFlight {
    fn started(&self) -> Instant {
        match self {
            InFlight::Push { started, .. } | InFlight::Pull { started } => *started,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    local: String,
    selection: Selection,
    remote: String,
    common: String,

    local_updated: bool,
    remote_updated: bool,
    remote_stale: bool,
    compositing: bool,

    in_flight: Option<InFlight>,
    /// Text the server refused as too large; not pushed again until local changes
    rejected: Option<String>,
    merge_failures: usize,
    config: ReconcileConfig,
}

impl Reconciler {
    /// A session that has not loaded the note yet. The first reconcile pulls.
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            local: String::new(),
            selection: Selection::default(),
            remote: String::new(),
            common: String::new(),
            local_updated: false,
            remote_updated: false,
            remote_stale: true,
            compositing: false,
            in_flight: None,
            rejected: None,
            merge_failures: 0,
            config,
        }
    }

    /// A session starting from content known to match the server.
    pub fn with_content(text: impl Into<String>, config: ReconcileConfig) -> Self {
        let text = text.into();
        Self {
            local: text.clone(),
            remote: text.clone(),
            common: text,
            remote_stale: false,
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn common(&self) -> &str {
        &self.common
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn local_updated(&self) -> bool {
        self.local_updated
    }

    pub fn remote_updated(&self) -> bool {
        self.remote_updated
    }

    pub fn remote_stale(&self) -> bool {
        self.remote_stale
    }

    pub fn is_compositing(&self) -> bool {
        self.compositing
    }

    /// A push or pull is waiting for the server.
    pub fn is_saving(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Number of rebases that hit a conflict and discarded local edits.
    pub fn merge_failures(&self) -> usize {
        self.merge_failures
    }

    /// Whether closing now could lose edits.
    pub fn has_unsaved_changes(&self) -> bool {
        self.local_updated || matches!(self.in_flight, Some(InFlight::Push { .. }))
    }

    /// When the in-flight operation crosses the busy ceiling, if one is running.
    pub fn busy_deadline(&self) -> Option<Instant> {
        self.in_flight
            .as_ref()
            .map(|op| op.started() + self.config.busy_ceiling)
    }

    /// The editor stays editable unless an operation has been in flight past
    /// the ceiling. A composing user is never locked out.
    pub fn is_editable(&self, now: Instant) -> bool {
        if self.compositing {
            return true;
        }
        match self.busy_deadline() {
            Some(deadline) => now < deadline,
            None => true,
        }
    }

    /// The user changed the text (or just moved the selection).
    pub fn on_local_edit(&mut self, text: impl Into<String>, selection: Selection) {
        let text = text.into();
        if text != self.local {
            self.local = text;
            self.local_updated = true;
        }
        self.selection = selection.clamp(self.local.chars().count());
    }

    /// An edit the editor made on top of `base`. When `local` has moved on
    /// since (a merge or remote change the editor had not shown yet), the edit
    /// is merged into the current text instead of replacing it.
    pub fn on_local_edit_from(&mut self, base: &str, text: impl Into<String>, selection: Selection) {
        let text = text.into();
        if base == self.local {
            self.on_local_edit(text, selection);
            return;
        }
        match merge3(&self.local, base, &text) {
            Some(merged) => {
                debug!("Merged an edit made on older text");
                let selection = selection.map_through(&create_patch(&text, &merged));
                self.on_local_edit(merged, selection);
            }
            None => {
                warn!("Edit conflicts with newer text, discarding it");
                self.merge_failures += 1;
            }
        }
    }

    pub fn on_composition_start(&mut self) {
        self.compositing = true;
    }

    pub fn on_composition_end(&mut self) {
        self.compositing = false;
    }

    /// Force a pull on the next reconcile.
    pub fn mark_stale(&mut self) {
        self.remote_stale = true;
    }

    /// Another client changed the note; `hash` is the content after `patch`.
    pub fn on_remote_patch(&mut self, patch: &Patch, hash: ContentHash) {
        match apply_patch(&self.remote, patch).filter(|next| ContentHash::of(next) == hash) {
            Some(next) => {
                debug!("Applied remote patch ({})", hash);
                self.remote = next;
                self.remote_updated = true;
                self.remote_stale = false;
            }
            None => {
                debug!("Remote patch does not apply, marking stale");
                self.remote_stale = true;
            }
        }
    }

    /// Result of the `Action::Pull` this reconciler asked for.
    pub fn on_pull_result(&mut self, result: Result<String, ApiError>) {
        if !matches!(self.in_flight.take(), Some(InFlight::Pull { .. })) {
            warn!("Pull result arrived with no pull in flight");
        }
        match result {
            Ok(fetched) => {
                self.remote_updated = fetched != self.common;
                self.remote = fetched;
                self.remote_stale = false;
            }
            Err(e) => debug!("Pull failed: {}", e),
        }
    }

    /// Result of the `Action::Push` this reconciler asked for.
    pub fn on_push_result(&mut self, result: Result<(), ApiError>) {
        let sent = match self.in_flight.take() {
            Some(InFlight::Push { sent, .. }) => sent,
            other => {
                warn!("Push result arrived with no push in flight");
                self.in_flight = other;
                return;
            }
        };

        match result {
            Ok(()) => {
                self.local_updated = self.local != sent;
                self.remote = sent.clone();
                self.common = sent;
                self.remote_updated = false;
                // A remote patch that failed or a resync during the push keeps the note stale
                self.rejected = None;
            }
            Err(e) => match e.code() {
                ErrorCode::HashMismatch => {
                    debug!("Push rejected as stale");
                    self.remote_stale = true;
                }
                ErrorCode::ExceededMaxSize => {
                    warn!("Note exceeds the size limit, holding local edits");
                    self.rejected = Some(sent);
                }
                _ => debug!("Push failed: {}", e),
            },
        }
    }

    /// Decide the next step. Rebases and fast-forwards happen in place;
    /// pushes and pulls are handed back to the caller.
    pub fn reconcile(&mut self, now: Instant) -> Action {
        loop {
            if self.remote_stale {
                if self.in_flight.is_some() {
                    return Action::Defer;
                }
                debug!("Pulling remote");
                self.in_flight = Some(InFlight::Pull { started: now });
                return Action::Pull;
            }

            if self.local_updated && self.remote_updated {
                if self.compositing {
                    return Action::Defer;
                }
                self.rebase();
                continue;
            }

            if self.local_updated {
                if self.in_flight.is_some() || self.compositing {
                    return Action::Defer;
                }
                if self.rejected.as_deref() == Some(self.local.as_str()) {
                    return Action::Idle;
                }
                let patch = create_patch(&self.remote, &self.local);
                let hash = ContentHash::of(&self.local);
                debug!("Pushing local ({} hunks)", patch.hunks.len());
                self.in_flight = Some(InFlight::Push {
                    sent: self.local.clone(),
                    started: now,
                });
                return Action::Push { patch, hash };
            }

            if self.remote_updated {
                if self.compositing {
                    return Action::Defer;
                }
                self.fast_forward();
                continue;
            }

            return Action::Idle;
        }
    }

    fn rebase(&mut self) {
        let merged = match merge3(&self.remote, &self.common, &self.local) {
            Some(merged) => merged,
            None => {
                warn!("Failed to merge, discarding local edits");
                self.merge_failures += 1;
                self.remote.clone()
            }
        };
        debug!("Rebased local onto remote");
        self.replace_local(merged);
        self.common = self.remote.clone();
        self.remote_updated = false;
        if self.local == self.remote {
            self.local_updated = false;
        }
    }

    fn fast_forward(&mut self) {
        debug!("Fast-forwarding local to remote");
        self.replace_local(self.remote.clone());
        self.common = self.remote.clone();
        self.remote_updated = false;
    }

    fn replace_local(&mut self, text: String) {
        if text == self.local {
            return;
        }
        let patch = create_patch(&self.local, &text);
        self.selection = self
            .selection
            .map_through(&patch)
            .clamp(text.chars().count());
        self.local = text;
    }
}
