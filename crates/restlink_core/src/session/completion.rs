//! Continuation types and the per-call completion coordinator.

use crate::error::{CoreError, CoreResult};
use crate::model::entity_id::EntityId;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// Continuation receiving the outcome of one entity operation.
pub type Callback<T> = Box<dyn FnOnce(CoreResult<T>)>;

/// Result cell for callers that poll instead of passing a closure.
///
/// ```
/// use restlink_core::Completion;
///
/// let completion = Completion::<u32>::new();
/// let callback = completion.callback();
/// assert!(!completion.is_complete());
/// callback(Ok(7));
/// assert_eq!(completion.take().unwrap().unwrap(), 7);
/// ```
pub struct Completion<T> {
    slot: Rc<RefCell<Option<CoreResult<T>>>>,
}

impl<T: 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
        }
    }

    /// Continuation that stores its result in this cell.
    pub fn callback(&self) -> Callback<T> {
        let slot = Rc::clone(&self.slot);
        Box::new(move |result| {
            *slot.borrow_mut() = Some(result);
        })
    }

    pub fn is_complete(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Moves the result out, leaving the cell empty.
    pub fn take(&self) -> Option<CoreResult<T>> {
        self.slot.borrow_mut().take()
    }
}

impl<T: 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}

/// How a pending id was settled.
#[derive(Debug, Clone)]
pub(crate) enum Arrival {
    Loaded,
    Missing,
    Failed(CoreError),
}

/// Continuation parked on a pending fetch.
pub(crate) type Waiter = Box<dyn FnOnce(Arrival)>;

pub(crate) struct GatherOutcome {
    pub missing: HashSet<EntityId>,
    pub failure: Option<CoreError>,
}

type Finish = Box<dyn FnOnce(GatherOutcome)>;

/// Counts arrivals for the ids of one `get` call and fires once when the
/// last one lands. The first failure wins.
pub(crate) struct Gather {
    remaining: usize,
    missing: HashSet<EntityId>,
    failure: Option<CoreError>,
    finish: Option<Finish>,
}

pub(crate) type SharedGather = Rc<RefCell<Gather>>;

impl Gather {
    pub(crate) fn shared(expected: usize) -> SharedGather {
        Rc::new(RefCell::new(Self {
            remaining: expected,
            missing: HashSet::new(),
            failure: None,
            finish: None,
        }))
    }

    pub(crate) fn waiter(gather: &SharedGather, id: EntityId) -> Waiter {
        let gather = Rc::clone(gather);
        Box::new(move |arrival| Self::arrive(&gather, id, arrival))
    }

    pub(crate) fn arrive(gather: &SharedGather, id: EntityId, arrival: Arrival) {
        {
            let mut state = gather.borrow_mut();
            state.remaining = state.remaining.saturating_sub(1);
            match arrival {
                Arrival::Loaded => {}
                Arrival::Missing => {
                    state.missing.insert(id);
                }
                Arrival::Failed(err) => {
                    if state.failure.is_none() {
                        state.failure = Some(err);
                    }
                }
            }
        }
        Self::try_finish(gather);
    }

    /// Installs the final continuation; fires at once if every id already
    /// arrived.
    pub(crate) fn on_finish(gather: &SharedGather, finish: impl FnOnce(GatherOutcome) + 'static) {
        gather.borrow_mut().finish = Some(Box::new(finish));
        Self::try_finish(gather);
    }

    fn try_finish(gather: &SharedGather) {
        let ready = {
            let mut state = gather.borrow_mut();
            if state.remaining > 0 {
                None
            } else {
                state.finish.take().map(|finish| {
                    let outcome = GatherOutcome {
                        missing: std::mem::take(&mut state.missing),
                        failure: state.failure.take(),
                    };
                    (finish, outcome)
                })
            }
        };
        if let Some((finish, outcome)) = ready {
            finish(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Arrival, Gather};
    use crate::error::CoreError;
    use crate::model::entity_id::EntityId;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn fires_once_after_last_arrival() {
        let gather = Gather::shared(2);
        let fired = Rc::new(Cell::new(0));
        let seen = Rc::clone(&fired);
        Gather::on_finish(&gather, move |outcome| {
            assert!(outcome.missing.contains(&EntityId::from(2)));
            seen.set(seen.get() + 1);
        });

        Gather::waiter(&gather, EntityId::from(1))(Arrival::Loaded);
        assert_eq!(fired.get(), 0);
        Gather::waiter(&gather, EntityId::from(2))(Arrival::Missing);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn finish_installed_late_still_fires() {
        let gather = Gather::shared(1);
        Gather::arrive(&gather, EntityId::from(1), Arrival::Failed(CoreError::SessionClosed));

        let fired = Rc::new(Cell::new(false));
        let seen = Rc::clone(&fired);
        Gather::on_finish(&gather, move |outcome| {
            assert!(matches!(outcome.failure, Some(CoreError::SessionClosed)));
            seen.set(true);
        });
        assert!(fired.get());
    }

    #[test]
    fn empty_gather_fires_on_install() {
        let gather = Gather::shared(0);
        let fired = Rc::new(Cell::new(false));
        let seen = Rc::clone(&fired);
        Gather::on_finish(&gather, move |_| seen.set(true));
        assert!(fired.get());
    }
}
