//! ModeState - the single source of truth for the active routing mode.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use shared_types::Mode;

pub type ModeListener = Arc<dyn Fn(Mode) + Send + Sync>;

const CHAT: u8 = 0;
const CONTROL: u8 = 1;

fn encode(mode: Mode) -> u8 {
    match mode {
        Mode::Chat => CHAT,
        Mode::Control => CONTROL,
    }
}

fn decode(raw: u8) -> Mode {
    if raw == CONTROL {
        Mode::Control
    } else {
        Mode::Chat
    }
}

pub struct ModeState {
    current: AtomicU8,
    listeners: Mutex<Vec<ModeListener>>,
    /// Serializes switches so listeners observe transitions in order.
    switch_lock: Mutex<()>,
}

impl Default for ModeState {
    fn default() -> Self {
        Self::new(Mode::Chat)
    }
}

impl std::fmt::Debug for ModeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeState")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

impl ModeState {
    pub fn new(initial: Mode) -> Self {
        Self {
            current: AtomicU8::new(encode(initial)),
            listeners: Mutex::new(Vec::new()),
            switch_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Mode {
        decode(self.current.load(Ordering::Acquire))
    }

    pub fn is_chat(&self) -> bool {
        self.current() == Mode::Chat
    }

    pub fn is_control(&self) -> bool {
        self.current() == Mode::Control
    }

    pub fn display_name(&self) -> &'static str {
        self.current().display_name()
    }

    /// Register a listener for mode changes. Listeners live for the lifetime
    /// of the state and are invoked in registration order.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(Mode) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    /// Switch to `mode`, notifying listeners synchronously. Returns `false`
    /// (and notifies nobody) when `mode` is already active.
    ///
    /// Listeners must not call `switch_to` themselves.
    pub fn switch_to(&self, mode: Mode) -> bool {
        let _serial = self
            .switch_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = decode(self.current.swap(encode(mode), Ordering::AcqRel));
        if previous == mode {
            return false;
        }
        tracing::info!(from = %previous, to = %mode, "Mode switched");

        let listeners: Vec<ModeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(mode))).is_err() {
                tracing::error!(listener = index, mode = %mode, "Mode listener panicked");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_switch_to_same_mode_is_silent() {
        let state = ModeState::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        state.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!state.switch_to(Mode::Chat));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(state.switch_to(Mode::Control));
        assert!(!state.switch_to(Mode::Control));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(state.is_control());
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let state = ModeState::new(Mode::Chat);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            state.on_change(move |mode| seen.lock().unwrap().push((tag, mode)));
        }

        state.switch_to(Mode::Control);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("first", Mode::Control),
                ("second", Mode::Control),
                ("third", Mode::Control)
            ]
        );
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let state = ModeState::default();
        let reached = Arc::new(AtomicUsize::new(0));
        state.on_change(|_| panic!("listener failure"));
        let counter = reached.clone();
        state.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(state.switch_to(Mode::Control));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(state.current(), Mode::Control);

        assert!(state.switch_to(Mode::Chat));
        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_can_read_current_mode() {
        let state = Arc::new(ModeState::default());
        let observed = Arc::new(Mutex::new(None));
        let reader = state.clone();
        let slot = observed.clone();
        state.on_change(move |_| {
            *slot.lock().unwrap() = Some(reader.current());
        });

        state.switch_to(Mode::Control);
        assert_eq!(*observed.lock().unwrap(), Some(Mode::Control));
    }
}
