//! Shared lifecycle state machine implemented by the endpoint and every
//! container. Listeners are held in a copy-on-write list so a listener may
//! add or remove listeners while an event is being dispatched.

use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LifecycleState {
    New,
    Initialized,
    StartingPrep,
    Starting,
    Started,
    StoppingPrep,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Failed,
}

impl LifecycleState {
    /// True while user traffic may be dispatched through the component.
    #[inline]
    pub fn is_available(&self) -> bool {
        matches!(self, LifecycleState::Started)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LifecycleEvent {
    BeforeInit,
    AfterInit,
    BeforeStart,
    Start,
    AfterStart,
    BeforeStop,
    Stop,
    AfterStop,
    BeforeDestroy,
    AfterDestroy,
    Failed,
}

pub trait LifecycleListener: Send + Sync {
    fn lifecycle_event(&self, event: LifecycleEvent, state: LifecycleState);
}

#[derive(Debug)]
pub enum LifecycleError {
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    Failed(String),
}

/// Legal transitions of the state machine. `Failed` is reachable from any
/// state; a failed or stopped component may still be destroyed.
fn valid_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;

    if to == Failed {
        return true;
    }

    matches!(
        (from, to),
        (New, Initialized)
            | (Initialized, StartingPrep)
            | (StartingPrep, Starting)
            | (Starting, Started)
            | (Started, StoppingPrep)
            | (StoppingPrep, Stopping)
            | (Stopping, Stopped)
            | (Stopped, StartingPrep)
            | (New, Destroying)
            | (Initialized, Destroying)
            | (Stopped, Destroying)
            | (Failed, StoppingPrep)
            | (Failed, Destroying)
            | (Destroying, Destroyed)
    )
}

fn event_for(state: LifecycleState) -> Option<LifecycleEvent> {
    match state {
        LifecycleState::Initialized => Some(LifecycleEvent::AfterInit),
        LifecycleState::StartingPrep => Some(LifecycleEvent::BeforeStart),
        LifecycleState::Starting => Some(LifecycleEvent::Start),
        LifecycleState::Started => Some(LifecycleEvent::AfterStart),
        LifecycleState::StoppingPrep => Some(LifecycleEvent::BeforeStop),
        LifecycleState::Stopping => Some(LifecycleEvent::Stop),
        LifecycleState::Stopped => Some(LifecycleEvent::AfterStop),
        LifecycleState::Destroying => Some(LifecycleEvent::BeforeDestroy),
        LifecycleState::Destroyed => Some(LifecycleEvent::AfterDestroy),
        LifecycleState::Failed => Some(LifecycleEvent::Failed),
        _ => None,
    }
}

/// State holder embedded by lifecycle-bearing components.
pub struct LifecycleSupport {
    state: Mutex<LifecycleState>,
    listeners: ArcSwap<Vec<Arc<dyn LifecycleListener>>>,
}

impl LifecycleSupport {
    pub fn new() -> LifecycleSupport {
        LifecycleSupport {
            state: Mutex::new(LifecycleState::New),
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("Lifecycle lock poisoned")
    }

    /// Moves to `to`, firing the state's event on success.
    pub fn advance(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.lock().expect("Lifecycle lock poisoned");

            if !valid_transition(*state, to) {
                return Err(LifecycleError::InvalidTransition { from: *state, to });
            }

            *state = to;
        }

        if let Some(event) = event_for(to) {
            self.fire(event, to);
        }

        Ok(())
    }

    /// Unconditional move to FAILED.
    pub fn fail(&self) {
        *self.state.lock().expect("Lifecycle lock poisoned") = LifecycleState::Failed;
        self.fire(LifecycleEvent::Failed, LifecycleState::Failed);
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.rcu(|current| {
            let mut next = (**current).clone();
            next.push(Arc::clone(&listener));
            next
        });
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LifecycleListener>) {
        self.listeners.rcu(|current| {
            current
                .iter()
                .filter(|other| !Arc::ptr_eq(other, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    fn fire(&self, event: LifecycleEvent, state: LifecycleState) {
        let listeners = self.listeners.load();
        for listener in listeners.iter() {
            listener.lifecycle_event(event, state);
        }
    }
}

/// The shared lifecycle contract.
pub trait Lifecycle {
    fn state(&self) -> LifecycleState;
    fn init(&self) -> Result<(), LifecycleError>;
    fn start(&self) -> Result<(), LifecycleError>;
    fn stop(&self) -> Result<(), LifecycleError>;
    fn destroy(&self) -> Result<(), LifecycleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        events: AtomicUsize,
    }

    impl LifecycleListener for Recorder {
        fn lifecycle_event(&self, _event: LifecycleEvent, _state: LifecycleState) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_happy_path() {
        let support = LifecycleSupport::new();

        for state in [
            LifecycleState::Initialized,
            LifecycleState::StartingPrep,
            LifecycleState::Starting,
            LifecycleState::Started,
            LifecycleState::StoppingPrep,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
            LifecycleState::Destroying,
            LifecycleState::Destroyed,
        ] {
            support.advance(state).unwrap();
            assert_eq!(support.state(), state);
        }
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let support = LifecycleSupport::new();

        let result = support.advance(LifecycleState::Started);
        assert!(matches!(
            result,
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert_eq!(support.state(), LifecycleState::New);
    }

    #[test]
    fn test_restart_from_stopped() {
        let support = LifecycleSupport::new();
        support.advance(LifecycleState::Initialized).unwrap();
        support.advance(LifecycleState::StartingPrep).unwrap();
        support.advance(LifecycleState::Starting).unwrap();
        support.advance(LifecycleState::Started).unwrap();
        support.advance(LifecycleState::StoppingPrep).unwrap();
        support.advance(LifecycleState::Stopping).unwrap();
        support.advance(LifecycleState::Stopped).unwrap();

        support.advance(LifecycleState::StartingPrep).unwrap();
        assert_eq!(support.state(), LifecycleState::StartingPrep);
    }

    #[test]
    fn test_fail_from_anywhere() {
        let support = LifecycleSupport::new();
        support.advance(LifecycleState::Failed).unwrap();
        assert_eq!(support.state(), LifecycleState::Failed);
    }

    #[test]
    fn test_listeners_fire_and_remove() {
        let support = LifecycleSupport::new();
        let recorder = Arc::new(Recorder {
            events: AtomicUsize::new(0),
        });

        let listener: Arc<dyn LifecycleListener> = recorder.clone();
        support.add_listener(Arc::clone(&listener));

        support.advance(LifecycleState::Initialized).unwrap();
        assert_eq!(recorder.events.load(Ordering::SeqCst), 1);

        support.remove_listener(&listener);
        support.advance(LifecycleState::StartingPrep).unwrap();
        assert_eq!(recorder.events.load(Ordering::SeqCst), 1);
    }
}
