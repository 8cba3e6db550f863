use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use super::Error;

/// The counting signal callers block on until the releaser lets one through.
///
/// `admit()` never blocks. `await_admission()` consumes one permit, waiting
/// (optionally bounded) until a permit exists. A faulted gate wakes every
/// waiter with the stored error and refuses all later waits: misconfiguration
/// must surface to callers instead of starving them.
pub(crate) struct Gate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

struct GateState {
    permits: u64,
    fault: Option<Error>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                permits: 0,
                fault: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Let one waiting caller through.
    pub(crate) fn admit(&self) {
        let mut state = self.state.lock().expect("mutex impossible to be poison");
        state.permits += 1;
        drop(state);

        self.condvar.notify_one();
    }

    /// Discard permits which were granted but never consumed.
    ///
    /// Only sound while nobody is waiting: a leftover permit belongs to a
    /// caller that abandoned its wait in a finished interval.
    pub(crate) fn drain(&self) {
        self.state
            .lock()
            .expect("mutex impossible to be poison")
            .permits = 0;
    }

    /// Mark the gate as broken.
    ///
    /// All current waiters wake with `err` and every later
    /// `await_admission()` fails immediately. The first fault wins.
    pub(crate) fn fault(&self, err: Error) {
        let mut state = self.state.lock().expect("mutex impossible to be poison");
        state.fault.get_or_insert(err);
        drop(state);

        self.condvar.notify_all();
    }

    /// The fault this gate carries, if any.
    pub(crate) fn fault_error(&self) -> Option<Error> {
        self.state
            .lock()
            .expect("mutex impossible to be poison")
            .fault
            .clone()
    }

    /// Block until a permit is available, then consume it.
    ///
    /// With `timeout` set, gives up once the bound expires without a permit.
    pub(crate) fn await_admission(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));

        let mut state = self.state.lock().expect("mutex impossible to be poison");
        loop {
            if let Some(err) = state.fault.as_ref() {
                return Err(err.clone());
            }

            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }

            state = match deadline {
                None => self
                    .condvar
                    .wait(state)
                    .expect("mutex impossible to be poison"),
                Some((deadline, timeout)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::AdmissionTimeout(timeout));
                    }

                    self.condvar
                        .wait_timeout(state, remaining)
                        .expect("mutex impossible to be poison")
                        .0
                }
            };
        }
    }
}
