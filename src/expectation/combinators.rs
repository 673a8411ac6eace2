//! AnyOf / AllOf / Sequence and CheckThenWait
//!
//! Children are plain [`Expectation`] handles. The combinator keeps the
//! indexes of its successful children in match order; for a sequence that
//! list is always a prefix of the children, so its length is the cursor.

use super::node::{Bound, Expectation, Kind};
use super::Verdict;
use skyctl_shared::{Combine, Event, EventContext, EventMarker, ExpectPolicy};
use std::ops::{BitAnd, BitOr, Shr};

fn bind_child(child: &Expectation, bound: &Bound) {
    if bound.commit {
        child.schedule_on(&bound.scheduler);
    } else {
        child.arm(&bound.scheduler);
    }
}

pub(crate) struct Multi {
    combine: Combine,
    children: Vec<Expectation>,
    matched: Vec<usize>,
}

impl Multi {
    pub(super) fn new(combine: Combine, children: Vec<Expectation>) -> Self {
        Self {
            combine,
            children,
            matched: Vec::new(),
        }
    }

    pub(super) fn combine(&self) -> Combine {
        self.combine
    }

    pub(super) fn name(&self) -> &'static str {
        match self.combine {
            Combine::All => "AllOf",
            Combine::Any => "AnyOf",
            Combine::Sequence => "Sequence",
        }
    }

    pub(super) fn children(&self) -> &[Expectation] {
        &self.children
    }

    pub(super) fn matched_children(&self) -> Vec<Expectation> {
        self.matched
            .iter()
            .map(|&i| self.children[i].clone())
            .collect()
    }

    fn mark(&mut self, index: usize) {
        if !self.matched.contains(&index) {
            self.matched.push(index);
        }
    }

    fn is_matched(&self, index: usize) -> bool {
        self.matched.contains(&index)
    }

    /// Next child a sequence is waiting for
    fn current(&self) -> Option<usize> {
        (self.matched.len() < self.children.len()).then_some(self.matched.len())
    }

    pub(super) fn bind(&mut self, bound: &Bound) -> Verdict {
        match self.combine {
            Combine::All => {
                for i in 0..self.children.len() {
                    let child = self.children[i].clone();
                    bind_child(&child, bound);
                    if child.success() {
                        self.mark(i);
                    }
                }
                self.all_verdict()
            }
            Combine::Any => {
                for i in 0..self.children.len() {
                    let child = self.children[i].clone();
                    bind_child(&child, bound);
                    if child.success() {
                        return self.win(i);
                    }
                }
                self.any_verdict()
            }
            Combine::Sequence => {
                self.advance(Some(bound));
                self.sequence_verdict()
            }
        }
    }

    pub(super) fn check(&mut self, event: &Event, bound: Option<&Bound>) -> Verdict {
        match self.combine {
            Combine::All => {
                for i in 0..self.children.len() {
                    if self.is_matched(i) {
                        continue;
                    }
                    let child = self.children[i].clone();
                    if child.check(event).success() {
                        self.mark(i);
                    }
                }
                self.all_verdict()
            }
            Combine::Any => {
                for i in 0..self.children.len() {
                    let child = self.children[i].clone();
                    if child.check(event).success() {
                        return self.win(i);
                    }
                }
                self.any_verdict()
            }
            Combine::Sequence => {
                self.advance(bound);
                // The same event may satisfy several consecutive children
                while let Some(i) = self.current() {
                    let child = self.children[i].clone();
                    if !child.check(event).success() {
                        break;
                    }
                    self.advance(bound);
                }
                self.sequence_verdict()
            }
        }
    }

    pub(super) fn poll(&mut self, bound: Option<&Bound>) -> Verdict {
        for child in &self.children {
            if child.is_bound() {
                child.poll();
            }
        }
        match self.combine {
            Combine::All => {
                for i in 0..self.children.len() {
                    if self.children[i].success() {
                        self.mark(i);
                    }
                }
                self.all_verdict()
            }
            Combine::Any => {
                match (0..self.children.len()).find(|&i| self.children[i].success()) {
                    Some(i) => self.win(i),
                    None => self.any_verdict(),
                }
            }
            Combine::Sequence => {
                self.advance(bound);
                self.sequence_verdict()
            }
        }
    }

    pub(super) fn cancel(&mut self) {
        for child in &self.children {
            child.cancel();
        }
    }

    pub(super) fn copy(&self) -> Self {
        Self::new(
            self.combine,
            self.children.iter().map(|child| child.copy()).collect(),
        )
    }

    /// AnyOf winner: record it and cancel the losers
    fn win(&mut self, index: usize) -> Verdict {
        self.mark(index);
        for (i, child) in self.children.iter().enumerate() {
            if i != index {
                child.cancel();
            }
        }
        Verdict::Matched
    }

    /// Consume the children of a sequence that already succeeded
    ///
    /// Each newly current child is bound (scheduled or armed like its parent)
    /// before being inspected, so a child with check semantics is consumed
    /// right away.
    fn advance(&mut self, bound: Option<&Bound>) {
        while let Some(i) = self.current() {
            let child = self.children[i].clone();
            if let Some(bound) = bound {
                bind_child(&child, bound);
            }
            if !child.success() {
                break;
            }
            self.mark(i);
        }
    }

    fn all_verdict(&self) -> Verdict {
        if let Some(failure) = self.children.iter().find_map(|c| c.failure_verdict()) {
            return failure;
        }
        if self.matched.len() == self.children.len() {
            Verdict::Matched
        } else {
            Verdict::Pending
        }
    }

    fn any_verdict(&self) -> Verdict {
        if !self.matched.is_empty() {
            return Verdict::Matched;
        }
        let failures: Vec<Verdict> = self
            .children
            .iter()
            .filter_map(|c| c.failure_verdict())
            .collect();
        if failures.len() < self.children.len() {
            return Verdict::Pending;
        }
        if !failures.is_empty() && failures.iter().all(|f| *f == Verdict::TimedOut) {
            return Verdict::TimedOut;
        }
        failures
            .into_iter()
            .find(|f| matches!(f, Verdict::Failed(_)))
            .unwrap_or(Verdict::Cancelled)
    }

    fn sequence_verdict(&self) -> Verdict {
        let Some(cursor) = self.current() else {
            return Verdict::Matched;
        };
        self.children[cursor..]
            .iter()
            .find_map(|c| c.failure_verdict())
            .unwrap_or(Verdict::Pending)
    }

    fn group(&self, contexts: Vec<EventContext>) -> EventContext {
        EventContext::multiple(contexts, self.combine)
    }

    pub(super) fn expected(&self) -> EventContext {
        self.group(self.children.iter().map(|c| c.expected_events()).collect())
    }

    pub(super) fn received(&self) -> EventContext {
        self.group(self.children.iter().map(|c| c.received_events()).collect())
    }

    pub(super) fn matched(&self) -> EventContext {
        self.group(
            self.matched
                .iter()
                .map(|&i| self.children[i].matched_events())
                .collect(),
        )
    }

    pub(super) fn unmatched(&self) -> EventContext {
        self.group(
            (0..self.children.len())
                .filter(|&i| !self.is_matched(i))
                .map(|i| self.children[i].unmatched_events())
                .collect(),
        )
    }

    /// Marked expected events; once resolved, unmatched children are ignored
    pub(super) fn marked(&self, default: EventMarker, success: bool) -> EventContext {
        let default = if success { EventMarker::Ignored } else { default };
        self.group(self.children.iter().map(|c| c.marked_with(default)).collect())
    }
}

pub(crate) struct CheckThenWait {
    check: Expectation,
    wait: Expectation,
    checked: bool,
}

impl CheckThenWait {
    pub(super) fn new(check: Expectation, wait: Expectation) -> Self {
        Self {
            check,
            wait,
            checked: false,
        }
    }

    pub(super) fn check_child(&self) -> &Expectation {
        &self.check
    }

    pub(super) fn wait(&self) -> &Expectation {
        &self.wait
    }

    pub(super) fn bind(&mut self, bound: &Bound) -> Verdict {
        bind_child(&self.check, bound);
        if self.check.success() {
            self.checked = true;
            self.wait.cancel();
            return Verdict::Matched;
        }
        self.check.cancel();
        bind_child(&self.wait, bound);
        self.wait_verdict()
    }

    pub(super) fn check(&mut self, event: &Event) -> Verdict {
        if self.checked {
            return Verdict::Matched;
        }
        self.wait.check(event);
        self.wait_verdict()
    }

    pub(super) fn poll(&mut self) -> Verdict {
        if self.checked {
            return Verdict::Matched;
        }
        if self.wait.is_bound() {
            self.wait.poll();
        }
        self.wait_verdict()
    }

    pub(super) fn cancel(&mut self) {
        self.check.cancel();
        self.wait.cancel();
    }

    pub(super) fn copy(&self) -> Self {
        Self::new(self.check.copy(), self.wait.copy())
    }

    fn wait_verdict(&self) -> Verdict {
        if self.wait.success() {
            Verdict::Matched
        } else {
            self.wait.failure_verdict().unwrap_or(Verdict::Pending)
        }
    }

    fn resolved_child(&self) -> &Expectation {
        if self.checked {
            &self.check
        } else {
            &self.wait
        }
    }

    pub(super) fn expected(&self) -> EventContext {
        let events = self.resolved_child().expected_events();
        EventContext::with_policy(events.events().to_vec(), ExpectPolicy::CheckWait)
    }

    pub(super) fn matched(&self) -> EventContext {
        self.resolved_child().matched_events()
    }

    pub(super) fn unmatched(&self) -> EventContext {
        self.resolved_child().unmatched_events()
    }

    pub(super) fn received(&self) -> EventContext {
        self.resolved_child().received_events()
    }
}

impl Expectation {
    /// Succeeds as soon as one child succeeds; the others are cancelled
    pub fn any_of(children: impl IntoIterator<Item = Expectation>) -> Self {
        Self::from_kind(Kind::Multi(Multi::new(
            Combine::Any,
            children.into_iter().collect(),
        )))
    }

    /// Succeeds once every child succeeded; fails as soon as one fails
    pub fn all_of(children: impl IntoIterator<Item = Expectation>) -> Self {
        Self::from_kind(Kind::Multi(Multi::new(
            Combine::All,
            children.into_iter().collect(),
        )))
    }

    /// Children must succeed in order; each is scheduled once its
    /// predecessor succeeded
    pub fn sequence(children: impl IntoIterator<Item = Expectation>) -> Self {
        Self::from_kind(Kind::Multi(Multi::new(
            Combine::Sequence,
            children.into_iter().collect(),
        )))
    }

    /// Succeed immediately if `check` holds at schedule time, otherwise wait
    /// for `wait`
    pub fn check_then_wait(check: Expectation, wait: Expectation) -> Self {
        Self::from_kind(Kind::CheckThenWait(CheckThenWait::new(check, wait)))
    }

    fn combined(self, other: Expectation, combine: Combine) -> Self {
        let mut children = self.flattened(combine);
        children.extend(other.flattened(combine));
        Self::from_kind(Kind::Multi(Multi::new(combine, children)))
    }
}

impl BitOr for Expectation {
    type Output = Expectation;

    fn bitor(self, rhs: Expectation) -> Expectation {
        self.combined(rhs, Combine::Any)
    }
}

impl BitAnd for Expectation {
    type Output = Expectation;

    fn bitand(self, rhs: Expectation) -> Expectation {
        self.combined(rhs, Combine::All)
    }
}

impl Shr for Expectation {
    type Output = Expectation;

    fn shr(self, rhs: Expectation) -> Expectation {
        self.combined(rhs, Combine::Sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectation::Outcome;
    use crate::testing::{event, scheduler, Probe};
    use skyctl_shared::args;
    use std::time::Duration;

    fn probe(name: &str) -> Expectation {
        Expectation::from_matcher(Probe::new(name))
    }

    #[test]
    fn test_all_of_records_match_order() {
        let all = probe("A") & probe("B") & probe("C");
        assert_eq!(all.children().len(), 3);

        all.check(&event("C", args! {}));
        all.check(&event("A", args! {}));
        assert!(!all.success());
        all.check(&event("B", args! {}));
        assert!(all.success());

        let names: Vec<String> = all
            .matched_children()
            .iter()
            .map(|c| c.expected_events().events()[0].name().to_string())
            .collect();
        assert_eq!(names, ["C", "A", "B"]);
    }

    #[test]
    fn test_all_of_fails_fast() {
        let a = probe("A");
        let b = probe("B");
        let all = Expectation::all_of([a.clone(), b.clone()]);
        a.cancel();
        all.check(&event("C", args! {}));
        assert!(all.cancelled());
        assert!(b.cancelled());
    }

    #[test]
    fn test_any_of_cancels_losers() {
        let a = probe("A");
        let b = probe("B");
        let any = a.clone() | b.clone();
        any.check(&event("B", args! {}));
        assert!(any.success());
        assert!(b.success());
        assert!(a.cancelled());
        assert_eq!(any.matched_children().len(), 1);
    }

    #[test]
    fn test_any_of_cancelled_when_every_child_is() {
        let a = probe("A");
        let b = probe("B");
        let any = Expectation::any_of([a.clone(), b.clone()]);
        a.cancel();
        any.check(&event("C", args! {}));
        assert!(!any.is_done());
        b.set_timed_out();
        any.check(&event("C", args! {}));
        assert!(any.cancelled());
        assert!(!any.timed_out());
    }

    #[test]
    fn test_any_of_times_out_when_every_child_does() {
        let scheduler = scheduler("any-timeout");
        let a = probe("A").with_timeout(Duration::from_millis(20));
        let b = probe("B").with_timeout(Duration::from_millis(20));
        let any = scheduler.schedule(a.clone() | b.clone());

        assert!(any.wait(Some(Duration::from_secs(2))).is_timed_out());
        assert!(any.timed_out());
        assert!(a.timed_out());
        assert!(b.timed_out());
        scheduler.destroy();
    }

    #[test]
    fn test_sequence_requires_order() {
        let seq = probe("A") >> probe("B");
        seq.check(&event("B", args! {}));
        assert!(!seq.success());
        seq.check(&event("A", args! {}));
        assert!(!seq.success());
        seq.check(&event("B", args! {}));
        assert!(seq.success());
    }

    #[test]
    fn test_sequence_offers_event_to_next_child() {
        let seq = probe("A") >> probe("A");
        seq.check(&event("A", args! {}));
        assert!(seq.success());
        assert_eq!(seq.matched_children().len(), 2);
    }

    #[test]
    fn test_operators_flatten_same_kind() {
        let any = probe("A") | probe("B") | probe("C");
        assert_eq!(any.combine(), Some(Combine::Any));
        assert_eq!(any.children().len(), 3);

        let mixed = (probe("A") | probe("B")) & probe("C");
        assert_eq!(mixed.combine(), Some(Combine::All));
        assert_eq!(mixed.children().len(), 2);

        let timed = (probe("A") | probe("B")).with_timeout(std::time::Duration::from_secs(1));
        let nested = timed | probe("C");
        assert_eq!(nested.children().len(), 2);
    }

    #[test]
    fn test_marked_events_explanation() {
        let all = probe("Ack") & probe("FlyingState");
        all.check(&event("Ack", args! {}));
        assert_eq!(all.explain(), "( [x]Ack() & [ ]FlyingState() )");

        let any = probe("A") | probe("B");
        any.check(&event("A", args! {}));
        assert_eq!(any.explain(), "( [x]A() | [~]B() )");
    }

    #[test]
    fn test_matched_events_of_all_of() {
        let all = probe("Ack") & probe("FlyingState");
        all.check(&event("FlyingState", args! { "state" => "hovering" }));
        all.check(&event("Ack", args! { "command" => "takeoff" }));
        match all.outcome() {
            Some(Outcome::Success(events)) => {
                let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
                assert_eq!(names, ["FlyingState", "Ack"]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_copy_copies_children() {
        let all = probe("A") & probe("B");
        all.check(&event("A", args! {}));
        let copy = all.copy();
        assert!(!copy.children()[0].success());
        assert!(copy.matched_children().is_empty());
    }

    #[test]
    fn test_cancel_cascades() {
        let a = probe("A");
        let b = probe("B");
        let seq = Expectation::sequence([a.clone(), b.clone()]);
        seq.check(&event("A", args! {}));
        assert!(seq.cancel());
        assert!(a.success());
        assert!(b.cancelled());
    }

    #[test]
    fn test_check_then_wait_unbound_waits() {
        let ctw = Expectation::check_then_wait(probe("State"), probe("State"));
        ctw.check(&event("State", args! {}));
        assert!(ctw.success());
        assert_eq!(
            ctw.expected_events().events()[0].policy(),
            Some(ExpectPolicy::CheckWait)
        );
    }
}
