//! Stop-the-world coordination. Mutators poll [`Safepoint::check`]; a
//! thread about to block in native code announces itself so collections
//! proceed without it.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct SafepointState {
    /// mutators currently registered
    registered: usize,
    /// mutators announced as blocked in native code
    blocked: usize,
    /// mutators parked inside check()
    parked: usize,
    pause_requested: bool,
    collector_active: bool,
}

#[derive(Debug, Default)]
pub struct Safepoint {
    state: Mutex<SafepointState>,
    /// parked mutators wait here for the pause to end
    resume: Condvar,
    /// the collector waits here for mutators to quiesce
    quiesce: Condvar,
}

impl Safepoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_mutator(&self) {
        let mut state = self.state.lock();
        // never raise the mutator count under an in-progress pause
        while state.pause_requested {
            self.resume.wait(&mut state);
        }
        state.registered += 1;
    }

    pub fn unregister_mutator(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.registered > 0, "unregistering unknown mutator");
        state.registered -= 1;
        // one fewer mutator the collector has to wait for
        self.quiesce.notify_all();
    }

    /// Periodic mutator poll. Parks the caller for as long as a pause is
    /// in progress, counting it as quiesced.
    pub fn check(&self) {
        let mut state = self.state.lock();
        if !state.pause_requested {
            return;
        }
        state.parked += 1;
        self.quiesce.notify_all();
        while state.pause_requested {
            self.resume.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// The calling mutator is about to block in native code. While
    /// announced it counts as already quiesced and collections proceed
    /// without it. No raw heap pointer may be held across the blocking
    /// call outside the thread's registered root set.
    pub fn announce_blocking_mutator(&self) {
        let mut state = self.state.lock();
        state.blocked += 1;
        self.quiesce.notify_all();
    }

    /// Back from native code. Waits out any in-progress pause before the
    /// caller may touch the heap again.
    pub fn return_from_blocking_mutator(&self) {
        let mut state = self.state.lock();
        // stay counted as blocked until the pause is over
        while state.pause_requested {
            self.resume.wait(&mut state);
        }
        debug_assert!(state.blocked > 0, "return without announce");
        state.blocked -= 1;
    }

    /// Stop the world. The caller is itself a registered mutator and is
    /// not waited for. Returns once every other registered mutator is
    /// parked or announced-blocked.
    ///
    /// Concurrent callers elect one collector: a contender that finds a
    /// pause already requested counts itself as quiesced for it, waits the
    /// pause out, and retries.
    pub fn begin_pause(&self) {
        let mut state = self.state.lock();
        while state.pause_requested {
            state.parked += 1;
            self.quiesce.notify_all();
            while state.pause_requested {
                self.resume.wait(&mut state);
            }
            state.parked -= 1;
        }
        debug_assert!(!state.collector_active, "pause ended while active");
        state.pause_requested = true;
        while state.parked + state.blocked + 1 < state.registered {
            self.quiesce.wait(&mut state);
        }
        state.collector_active = true;
    }

    pub fn end_pause(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.collector_active, "end_pause without begin_pause");
        state.pause_requested = false;
        state.collector_active = false;
        self.resume.notify_all();
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.registered, state.blocked, state.parked)
    }
}
