//! Expectation handle and state machine
//!
//! Every expectation owns its state behind a mutex. Combinators lock their
//! own state before their children's, never the other way around, so the
//! tree can be inspected from any thread while the scheduler loop drives it.

use super::combinators::{CheckThenWait, Multi};
use super::external::ExternalSource;
use super::matcher::Matcher;
use super::{Outcome, Verdict};
use crate::runtime::{lock, Completion, CompletionError};
use crate::scheduler::{Scheduler, WeakScheduler};
use skyctl_shared::{Combine, Event, EventContext, EventMarker};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::error;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DEFERRED: RefCell<Deferred> = RefCell::new(Deferred::default());
}

/// Completions resolved while a node lock is held on this thread
#[derive(Default)]
struct Deferred {
    depth: usize,
    pending: Vec<(Completion<Outcome>, Outcome)>,
}

/// Holds back done callbacks until every node lock on this thread is released
///
/// A child resolved from within its parent's transition would otherwise run
/// user callbacks with the parent still locked.
struct DeferScope;

impl DeferScope {
    fn enter() -> Self {
        DEFERRED.with(|deferred| deferred.borrow_mut().depth += 1);
        DeferScope
    }
}

impl Drop for DeferScope {
    fn drop(&mut self) {
        let ready = DEFERRED.with(|deferred| {
            let mut deferred = deferred.borrow_mut();
            deferred.depth -= 1;
            if deferred.depth == 0 {
                std::mem::take(&mut deferred.pending)
            } else {
                Vec::new()
            }
        });
        // Children first, in the order they resolved
        for (completion, outcome) in ready {
            completion.resolve(outcome);
        }
    }
}

fn settle(completion: &Completion<Outcome>, outcome: Outcome) {
    let now = DEFERRED.with(|deferred| {
        let mut deferred = deferred.borrow_mut();
        if deferred.depth > 0 {
            deferred.pending.push((completion.clone(), outcome));
            None
        } else {
            Some(outcome)
        }
    });
    if let Some(outcome) = now {
        completion.resolve(outcome);
    }
}

pub(super) enum Kind {
    Success,
    Failed(String),
    External(Box<dyn ExternalSource>),
    Leaf(Box<dyn Matcher>),
    Multi(Multi),
    CheckThenWait(CheckThenWait),
}

#[derive(Debug, Clone, PartialEq)]
enum Status {
    Pending,
    Succeeded,
    Cancelled,
    TimedOut,
    Failed(String),
}

impl Status {
    fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending)
    }
}

/// Scheduler an expectation is attached to
///
/// `commit` is false for armed expectations (subscriber filters), which are
/// bound without running any side effect.
pub(super) struct Bound {
    pub scheduler: Scheduler,
    pub commit: bool,
}

struct Binding {
    scheduler: WeakScheduler,
    commit: bool,
}

struct NodeState {
    kind: Kind,
    status: Status,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    binding: Option<Binding>,
}

impl NodeState {
    fn bound(&self) -> Option<Bound> {
        let binding = self.binding.as_ref()?;
        binding.scheduler.upgrade().map(|scheduler| Bound {
            scheduler,
            commit: binding.commit,
        })
    }

    fn is_scheduled(&self) -> bool {
        self.binding.as_ref().map_or(false, |b| b.commit)
    }

    fn expired(&self) -> bool {
        self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Move to the terminal state a verdict describes
    fn apply(&mut self, verdict: Verdict) -> Option<Outcome> {
        let (status, outcome) = match verdict {
            Verdict::Pending => return None,
            Verdict::Matched => (Status::Succeeded, Outcome::Success(self.kind.matched())),
            Verdict::Cancelled => (Status::Cancelled, Outcome::Cancelled),
            Verdict::TimedOut => (Status::TimedOut, Outcome::TimedOut),
            Verdict::Failed(reason) => (Status::Failed(reason.clone()), Outcome::Failed(reason)),
        };
        if status != Status::Succeeded {
            self.kind.cancel();
        }
        self.status = status;
        Some(outcome)
    }
}

impl Kind {
    fn bind(&mut self, bound: &Bound) -> Verdict {
        match self {
            Kind::Success => Verdict::Matched,
            Kind::Failed(reason) => Verdict::Failed(reason.clone()),
            Kind::External(source) => {
                source.wake(&bound.scheduler);
                source.verdict()
            }
            Kind::Leaf(matcher) if bound.commit => matcher.schedule(&bound.scheduler),
            Kind::Leaf(matcher) => matcher.arm(&bound.scheduler),
            Kind::Multi(multi) => multi.bind(bound),
            Kind::CheckThenWait(ctw) => ctw.bind(bound),
        }
    }

    fn check(&mut self, event: &Event, bound: Option<&Bound>) -> Verdict {
        match self {
            Kind::Success | Kind::Failed(_) => Verdict::Pending,
            Kind::External(source) => source.verdict(),
            Kind::Leaf(matcher) => matcher.check(event),
            Kind::Multi(multi) => multi.check(event, bound),
            Kind::CheckThenWait(ctw) => ctw.check(event),
        }
    }

    fn poll(&mut self, bound: Option<&Bound>) -> Verdict {
        match self {
            Kind::Success | Kind::Failed(_) => Verdict::Pending,
            Kind::External(source) => source.verdict(),
            Kind::Leaf(matcher) => matcher.poll(),
            Kind::Multi(multi) => multi.poll(bound),
            Kind::CheckThenWait(ctw) => ctw.poll(),
        }
    }

    fn cancel(&mut self) {
        match self {
            Kind::Success | Kind::Failed(_) => {}
            Kind::External(source) => source.cancel(),
            Kind::Leaf(matcher) => matcher.cancel(),
            Kind::Multi(multi) => multi.cancel(),
            Kind::CheckThenWait(ctw) => ctw.cancel(),
        }
    }

    fn copy(&self) -> Kind {
        match self {
            Kind::Success => Kind::Success,
            Kind::Failed(reason) => Kind::Failed(reason.clone()),
            Kind::External(source) => Kind::External(source.copy()),
            Kind::Leaf(matcher) => Kind::Leaf(matcher.copy()),
            Kind::Multi(multi) => Kind::Multi(multi.copy()),
            Kind::CheckThenWait(ctw) => Kind::CheckThenWait(ctw.copy()),
        }
    }

    fn expected(&self) -> EventContext {
        match self {
            Kind::Success | Kind::Failed(_) | Kind::External(_) => EventContext::new(),
            Kind::Leaf(matcher) => matcher.expected(),
            Kind::Multi(multi) => multi.expected(),
            Kind::CheckThenWait(ctw) => ctw.expected(),
        }
    }

    fn matched(&self) -> EventContext {
        match self {
            Kind::Success | Kind::Failed(_) | Kind::External(_) => EventContext::new(),
            Kind::Leaf(matcher) => matcher.matched(),
            Kind::Multi(multi) => multi.matched(),
            Kind::CheckThenWait(ctw) => ctw.matched(),
        }
    }

    fn unmatched(&self) -> EventContext {
        match self {
            Kind::Success | Kind::Failed(_) | Kind::External(_) => EventContext::new(),
            Kind::Leaf(matcher) => matcher.unmatched(),
            Kind::Multi(multi) => multi.unmatched(),
            Kind::CheckThenWait(ctw) => ctw.unmatched(),
        }
    }

    fn received(&self) -> EventContext {
        match self {
            Kind::Success | Kind::Failed(_) | Kind::External(_) => EventContext::new(),
            Kind::Leaf(matcher) => matcher.received(),
            Kind::Multi(multi) => multi.received(),
            Kind::CheckThenWait(ctw) => ctw.received(),
        }
    }

    fn name(&self) -> String {
        match self {
            Kind::Success => "Success".to_string(),
            Kind::Failed(_) => "Failed".to_string(),
            Kind::External(source) => source.describe(),
            Kind::Leaf(matcher) => matcher.name(),
            Kind::Multi(multi) => multi.name().to_string(),
            Kind::CheckThenWait(_) => "CheckThenWait".to_string(),
        }
    }
}

struct Node {
    id: u64,
    state: Mutex<NodeState>,
    completion: Completion<Outcome>,
}

/// Shared handle to an expectation
///
/// Clones refer to the same expectation. Status queries, [`wait`] and
/// [`cancel`] are safe from any thread; scheduling and event matching are
/// driven by a [`Scheduler`].
///
/// [`wait`]: Expectation::wait
/// [`cancel`]: Expectation::cancel
#[derive(Clone)]
pub struct Expectation {
    node: Arc<Node>,
}

impl Expectation {
    pub(super) fn from_kind(kind: Kind) -> Self {
        let (status, outcome) = match &kind {
            Kind::Success => (Status::Succeeded, Some(Outcome::Success(EventContext::new()))),
            Kind::Failed(reason) => (
                Status::Failed(reason.clone()),
                Some(Outcome::Failed(reason.clone())),
            ),
            _ => (Status::Pending, None),
        };
        let node = Node {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(NodeState {
                kind,
                status,
                timeout: None,
                deadline: None,
                binding: None,
            }),
            completion: Completion::new(),
        };
        if let Some(outcome) = outcome {
            node.completion.resolve(outcome);
        }
        Self {
            node: Arc::new(node),
        }
    }

    /// An expectation that is already successful
    pub fn succeeded() -> Self {
        Self::from_kind(Kind::Success)
    }

    /// An expectation that is already failed; used by schedule hooks to veto
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::from_kind(Kind::Failed(reason.into()))
    }

    /// Leaf expectation driven by a [`Matcher`]
    pub fn from_matcher(matcher: impl Matcher) -> Self {
        Self::from_kind(Kind::Leaf(Box::new(matcher)))
    }

    /// Unique identifier, for logs and identity checks
    pub fn id(&self) -> u64 {
        self.node.id
    }

    /// Whether both handles refer to the same expectation
    pub fn ptr_eq(&self, other: &Expectation) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    // ---- configuration ----

    /// Time out the expectation `timeout` after it is scheduled
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(Some(timeout));
        self
    }

    /// Set or clear the timeout
    ///
    /// The deadline is computed at schedule time; on an already scheduled
    /// expectation the new timeout counts from now.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let mut state = lock(&self.node.state);
        state.timeout = timeout;
        if state.is_scheduled() {
            state.deadline = timeout.map(|t| Instant::now() + t);
        }
        if let Kind::CheckThenWait(ctw) = &state.kind {
            ctw.wait().set_timeout(timeout);
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        lock(&self.node.state).timeout
    }

    /// Time left before the deadline, None without a deadline
    pub fn remaining_time(&self) -> Option<Duration> {
        lock(&self.node.state)
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    // ---- status ----

    pub fn success(&self) -> bool {
        lock(&self.node.state).status == Status::Succeeded
    }

    /// True once cancelled, including by a timeout
    pub fn cancelled(&self) -> bool {
        matches!(
            lock(&self.node.state).status,
            Status::Cancelled | Status::TimedOut
        )
    }

    pub fn timed_out(&self) -> bool {
        lock(&self.node.state).status == Status::TimedOut
    }

    /// Resolved without success: cancelled, timed out or failed
    pub fn failed(&self) -> bool {
        let state = lock(&self.node.state);
        state.status.is_terminal() && state.status != Status::Succeeded
    }

    /// Resolved in any way
    pub fn is_done(&self) -> bool {
        lock(&self.node.state).status.is_terminal()
    }

    /// Reason of a failure (veto or side effect error)
    pub fn failure_reason(&self) -> Option<String> {
        match &lock(&self.node.state).status {
            Status::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Whether the expectation side effects have been committed
    pub fn is_scheduled(&self) -> bool {
        lock(&self.node.state).is_scheduled()
    }

    /// Whether the expectation was scheduled or armed
    pub fn is_bound(&self) -> bool {
        lock(&self.node.state).binding.is_some()
    }

    /// Terminal outcome, None while pending
    pub fn outcome(&self) -> Option<Outcome> {
        self.node
            .completion
            .peek()
            .map(|result| result.unwrap_or(Outcome::Cancelled))
    }

    pub(super) fn failure_verdict(&self) -> Option<Verdict> {
        match &lock(&self.node.state).status {
            Status::Pending | Status::Succeeded => None,
            Status::Cancelled => Some(Verdict::Cancelled),
            Status::TimedOut => Some(Verdict::TimedOut),
            Status::Failed(reason) => Some(Verdict::Failed(reason.clone())),
        }
    }

    // ---- waiting ----

    /// Block until resolved
    ///
    /// If `timeout` expires first the expectation is marked as timed out.
    /// Must not be called from the scheduler loop: there it logs an error and
    /// returns without blocking or changing state, reporting `TimedOut` for a
    /// pending expectation.
    pub fn wait(&self, timeout: Option<Duration>) -> Outcome {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        let on_loop = lock(&self.node.state)
            .bound()
            .map_or(false, |bound| bound.scheduler.is_loop_thread());
        if on_loop {
            error!(expectation = self.id(), "wait() called from the scheduler loop");
            return self.outcome().unwrap_or(Outcome::TimedOut);
        }
        match self.node.completion.result(timeout) {
            Ok(outcome) => outcome,
            Err(CompletionError::Cancelled) => Outcome::Cancelled,
            Err(CompletionError::Timeout) => {
                self.set_timed_out();
                self.outcome().unwrap_or(Outcome::TimedOut)
            }
        }
    }

    /// Await resolution from async code
    pub async fn resolved(&self) -> Outcome {
        self.node
            .completion
            .wait()
            .await
            .unwrap_or(Outcome::Cancelled)
    }

    /// Run `callback` once resolved; runs immediately if already resolved
    ///
    /// Callbacks run on the resolving thread, usually the scheduler loop, and
    /// must not block.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Expectation) + Send + 'static) {
        let node = Arc::downgrade(&self.node);
        self.node.completion.add_done_callback(move |_| {
            if let Some(node) = node.upgrade() {
                callback(&Expectation { node });
            }
        });
    }

    /// Iterate over the children as they resolve
    ///
    /// A leaf yields itself. Once `timeout` elapses the iterator yields a
    /// single [`CompletionError::Timeout`] and stops.
    pub fn as_completed(&self, timeout: Option<Duration>) -> AsCompleted {
        let mut children = self.children();
        if children.is_empty() {
            children.push(self.clone());
        }
        let (tx, rx) = mpsc::channel();
        for child in &children {
            let tx = tx.clone();
            child.add_done_callback(move |done| {
                let _ = tx.send(done.clone());
            });
        }
        AsCompleted {
            rx,
            remaining: children.len(),
            deadline: timeout.map(|t| Instant::now() + t),
            finished: false,
        }
    }

    // ---- state transitions ----

    fn transition(&self, f: impl FnOnce(&mut NodeState) -> Verdict) {
        let _scope = DeferScope::enter();
        let outcome = {
            let mut state = lock(&self.node.state);
            if state.status.is_terminal() {
                return;
            }
            let verdict = f(&mut state);
            state.apply(verdict)
        };
        if let Some(outcome) = outcome {
            settle(&self.node.completion, outcome);
        }
    }

    fn bind(&self, scheduler: &Scheduler, commit: bool) {
        let _scope = DeferScope::enter();
        let outcome = {
            let mut state = lock(&self.node.state);
            let already = match &state.binding {
                Some(binding) => binding.commit || !commit,
                None => false,
            };
            if already {
                return;
            }
            state.binding = Some(Binding {
                scheduler: scheduler.downgrade(),
                commit,
            });
            if state.status.is_terminal() {
                return;
            }
            if commit {
                state.deadline = state.timeout.map(|t| Instant::now() + t);
            }
            let bound = Bound {
                scheduler: scheduler.clone(),
                commit,
            };
            let verdict = state.kind.bind(&bound);
            state.apply(verdict)
        };
        if let Some(outcome) = outcome {
            settle(&self.node.completion, outcome);
        }
    }

    /// Commit side effects and start the deadline; idempotent
    pub(crate) fn schedule_on(&self, scheduler: &Scheduler) {
        self.bind(scheduler, true);
    }

    /// Bind without side effects, used for subscriber filters
    pub(crate) fn arm(&self, scheduler: &Scheduler) {
        self.bind(scheduler, false);
    }

    /// Offer an event; returns self so that calls can be chained
    pub fn check(&self, event: &Event) -> &Self {
        self.transition(|state| {
            if state.expired() {
                return Verdict::TimedOut;
            }
            let bound = state.bound();
            state.kind.check(event, bound.as_ref())
        });
        self
    }

    /// Re-evaluate deadlines and asynchronous results
    pub(crate) fn poll(&self) {
        self.transition(|state| {
            if state.expired() {
                return Verdict::TimedOut;
            }
            let bound = state.bound();
            state.kind.poll(bound.as_ref())
        });
    }

    /// Cancel the expectation and its pending children
    ///
    /// Returns false if it was already resolved.
    pub fn cancel(&self) -> bool {
        self.terminate(Verdict::Cancelled)
    }

    pub(crate) fn set_timed_out(&self) -> bool {
        self.terminate(Verdict::TimedOut)
    }

    fn terminate(&self, verdict: Verdict) -> bool {
        let _scope = DeferScope::enter();
        let outcome = {
            let mut state = lock(&self.node.state);
            if state.status.is_terminal() {
                return false;
            }
            state.apply(verdict)
        };
        if let Some(outcome) = outcome {
            settle(&self.node.completion, outcome);
        }
        true
    }

    /// Resolve the same way `other` did; used when a schedule hook vetoes
    pub(crate) fn adopt(&self, other: &Expectation) {
        let verdict = match other.outcome() {
            Some(Outcome::Success(_)) => Verdict::Matched,
            Some(Outcome::Cancelled) => Verdict::Cancelled,
            Some(Outcome::TimedOut) => Verdict::TimedOut,
            Some(Outcome::Failed(reason)) => Verdict::Failed(reason),
            None => Verdict::Failed(other.explain()),
        };
        self.terminate(verdict);
    }

    // ---- structure ----

    /// Fresh, unattached expectation with the same configuration
    pub fn copy(&self) -> Self {
        let (kind, timeout) = {
            let state = lock(&self.node.state);
            (state.kind.copy(), state.timeout)
        };
        let copy = Self::from_kind(kind);
        copy.set_timeout(timeout);
        copy
    }

    /// Direct children of a combinator, empty for leaves
    pub fn children(&self) -> Vec<Expectation> {
        match &lock(&self.node.state).kind {
            Kind::Multi(multi) => multi.children().to_vec(),
            Kind::CheckThenWait(ctw) => vec![ctw.check_child().clone(), ctw.wait().clone()],
            _ => Vec::new(),
        }
    }

    /// Children that resolved successfully, in match order
    pub fn matched_children(&self) -> Vec<Expectation> {
        match &lock(&self.node.state).kind {
            Kind::Multi(multi) => multi.matched_children(),
            _ => Vec::new(),
        }
    }

    /// Combinator label, None for leaves
    pub fn combine(&self) -> Option<Combine> {
        match &lock(&self.node.state).kind {
            Kind::Multi(multi) => Some(multi.combine()),
            _ => None,
        }
    }

    /// Children to splice into a new `combine` group, or self
    pub(super) fn flattened(&self, combine: Combine) -> Vec<Expectation> {
        let state = lock(&self.node.state);
        match &state.kind {
            Kind::Multi(multi)
                if multi.combine() == combine
                    && state.timeout.is_none()
                    && state.binding.is_none() =>
            {
                multi.children().to_vec()
            }
            _ => vec![self.clone()],
        }
    }

    /// Whether this leaf drives the connection lifecycle
    ///
    /// Combinators are never lifecycle expectations themselves; schedule
    /// hooks visit their children one by one.
    pub fn is_lifecycle(&self) -> bool {
        match &lock(&self.node.state).kind {
            Kind::Leaf(matcher) => matcher.is_lifecycle(),
            _ => false,
        }
    }

    /// Whether this leaf talks to or listens for the device
    pub fn is_device(&self) -> bool {
        match &lock(&self.node.state).kind {
            Kind::Leaf(matcher) => matcher.is_device(),
            _ => false,
        }
    }

    // ---- inspection ----

    pub fn expected_events(&self) -> EventContext {
        lock(&self.node.state).kind.expected()
    }

    pub fn matched_events(&self) -> EventContext {
        lock(&self.node.state).kind.matched()
    }

    pub fn unmatched_events(&self) -> EventContext {
        let state = lock(&self.node.state);
        if state.status == Status::Succeeded {
            return EventContext::new();
        }
        state.kind.unmatched()
    }

    pub fn received_events(&self) -> EventContext {
        lock(&self.node.state).kind.received()
    }

    /// Expected events tagged with `[x]` matched, `[ ]` unmatched, `[~]` ignored
    pub fn marked_events(&self) -> EventContext {
        self.marked_with(EventMarker::Unmatched)
    }

    pub(super) fn marked_with(&self, default: EventMarker) -> EventContext {
        let state = lock(&self.node.state);
        let success = state.status == Status::Succeeded;
        match &state.kind {
            Kind::Multi(multi) => multi.marked(default, success),
            kind if success => kind.expected().with_marker(EventMarker::Matched),
            kind => kind.expected().with_marker(default),
        }
    }

    /// Human readable account of what matched and what did not
    pub fn explain(&self) -> String {
        let (custom, failure) = {
            let state = lock(&self.node.state);
            match &state.kind {
                Kind::Success => return "Success".to_string(),
                Kind::Failed(reason) => return reason.clone(),
                Kind::External(source) => {
                    return format!("{} is {}", source.describe(), status_label(&state.status))
                }
                Kind::Leaf(matcher) => (matcher.explain(), state.status.clone()),
                _ => (None, state.status.clone()),
            }
        };
        let explanation = custom.unwrap_or_else(|| self.marked_events().to_string());
        match failure {
            Status::Failed(reason) => format!("{}: {}", reason, explanation),
            _ => explanation,
        }
    }
}

fn status_label(status: &Status) -> &'static str {
    match status {
        Status::Pending => "pending",
        Status::Succeeded => "successful",
        Status::Cancelled => "cancelled",
        Status::TimedOut => "timed out",
        Status::Failed(_) => "failed",
    }
}

impl std::fmt::Debug for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.node.state);
        f.debug_struct("Expectation")
            .field("id", &self.node.id)
            .field("kind", &state.kind.name())
            .field("status", &state.status)
            .finish()
    }
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.explain())
    }
}

/// Blocking iterator returned by [`Expectation::as_completed`]
pub struct AsCompleted {
    rx: mpsc::Receiver<Expectation>,
    remaining: usize,
    deadline: Option<Instant>,
    finished: bool,
}

impl Iterator for AsCompleted {
    type Item = Result<Expectation, CompletionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.remaining == 0 {
            return None;
        }
        let received = match self.deadline {
            None => self.rx.recv().map_err(|_| CompletionError::Cancelled),
            Some(deadline) => self
                .rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                .map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => CompletionError::Timeout,
                    mpsc::RecvTimeoutError::Disconnected => CompletionError::Cancelled,
                }),
        };
        match received {
            Ok(expectation) => {
                self.remaining -= 1;
                Some(Ok(expectation))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
