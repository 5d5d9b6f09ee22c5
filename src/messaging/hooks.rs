//! Lifecycle hooks fired around each unit of work.
//!
//! Listeners run synchronously, in registration order, and may ask the worker
//! to stop by calling [`WorkEvent::stop`]. The worker checks the flag right
//! after dispatch, so this is the only way to end a run between work units.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    BeforeWork,
    AfterWork,
}

impl Hook {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeWork => "Queue.beforeWork",
            Self::AfterWork => "Queue.afterWork",
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Context handed to every listener of one hook dispatch.
#[derive(Debug)]
pub struct WorkEvent<'a> {
    pub hook: Hook,
    pub worker_label: &'a str,
    pub queue: &'a str,
    /// Zero-based index of the current cycle.
    pub cycle: u64,
    stopped: bool,
}

impl<'a> WorkEvent<'a> {
    pub fn new(hook: Hook, worker_label: &'a str, queue: &'a str, cycle: u64) -> Self {
        Self {
            hook,
            worker_label,
            queue,
            cycle,
            stopped: false,
        }
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

pub type Listener = Arc<dyn Fn(&mut WorkEvent<'_>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    listeners: Vec<Listener>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen<F>(&mut self, listener: F)
    where
        F: Fn(&mut WorkEvent<'_>) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Runs every listener, including those after one that requested a stop.
    /// Returns `false` when any listener asked the worker to stop.
    pub fn dispatch(&self, event: &mut WorkEvent<'_>) -> bool {
        for listener in &self.listeners {
            listener(event);
        }
        !event.is_stopped()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_without_listeners_continues() {
        let hooks = Hooks::new();
        let mut event = WorkEvent::new(Hook::BeforeWork, "default", "job1", 0);
        assert!(hooks.dispatch(&mut event));
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_any_listener_can_stop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();

        hooks.listen(|event| {
            if event.hook == Hook::AfterWork && event.queue == "job2" {
                event.stop();
            }
        });
        let log = seen.clone();
        hooks.listen(move |event| {
            log.lock().unwrap().push(format!("{}:{}", event.hook, event.queue));
        });

        let mut before = WorkEvent::new(Hook::BeforeWork, "default", "job2", 0);
        assert!(hooks.dispatch(&mut before));

        let mut after = WorkEvent::new(Hook::AfterWork, "default", "job2", 0);
        assert!(!hooks.dispatch(&mut after));
        assert!(after.is_stopped());

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Queue.beforeWork:job2", "Queue.afterWork:job2"]
        );
        assert_eq!(hooks.len(), 2);
    }
}
