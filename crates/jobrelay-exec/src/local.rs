//! The local handler (C6): executes a job synchronously, in-process, the
//! instant it's accepted. `iterate` only drains the event queue `accept`
//! already filled — there's never any in-flight work for this handler to
//! advance.

use std::collections::VecDeque;
use std::sync::Mutex;

use jobrelay_base::config::ConfigHandler;
use jobrelay_base::job::JobId;

use crate::handler::{execute_inline, AcceptError, Handler, HandlerEvent, Task};

pub struct LocalHandler {
    events: Mutex<VecDeque<HandlerEvent>>,
}

impl LocalHandler {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for LocalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHandler").finish()
    }
}

impl ConfigHandler for LocalHandler {
    fn handler_name(&self) -> &str {
        "local"
    }
}

impl Handler for LocalHandler {
    fn accept(&self, task: Task) -> Result<(), AcceptError> {
        let job_id = task.job_id;
        self.events.lock().unwrap().push_back(HandlerEvent::Started(job_id));
        let outcome = execute_inline(&task);
        self.events
            .lock()
            .unwrap()
            .push_back(HandlerEvent::Finished(job_id, outcome));
        Ok(())
    }

    fn iterate(&self) -> Vec<HandlerEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    fn cancel(&self, _job_id: JobId) -> bool {
        // Already ran to completion inside accept; nothing left to cancel.
        false
    }

    fn is_remote(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_base::value::Value;
    use std::sync::Arc;

    fn task(job_id: JobId, f: impl Fn(&Value) -> Result<Value, jobrelay_base::error::JobError> + Send + Sync + 'static) -> Task {
        Task {
            job_id,
            fingerprint: "fp".into(),
            function_name: "test_fn".into(),
            function_version: "0.1.0".into(),
            label: None,
            function: Arc::new(f),
            args: Value::Int(0),
            container: None,
            timeout: None,
            no_resolve_input_files: false,
            download_results: true,
        }
    }

    #[test]
    fn accept_runs_immediately_and_iterate_harvests_it() {
        let handler = LocalHandler::new();
        let job_id = JobId::new();
        handler
            .accept(task(job_id, |v| Ok(Value::Int(v.as_int().unwrap() + 1))))
            .unwrap();

        let events = handler.iterate();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HandlerEvent::Started(id) if id == job_id));
        match &events[1] {
            HandlerEvent::Finished(id, outcome) => {
                assert_eq!(*id, job_id);
                assert_eq!(outcome.result.as_ref().unwrap(), &Value::Int(1));
            }
            _ => panic!("expected Finished"),
        }
    }

    #[test]
    fn a_panicking_function_becomes_a_user_function_error() {
        let handler = LocalHandler::new();
        let job_id = JobId::new();
        handler.accept(task(job_id, |_| panic!("boom"))).unwrap();
        let events = handler.iterate();
        match &events[1] {
            HandlerEvent::Finished(_, outcome) => assert!(outcome.result.is_err()),
            _ => panic!("expected Finished"),
        }
    }

    #[test]
    fn a_slow_function_times_out_instead_of_blocking_forever() {
        let handler = LocalHandler::new();
        let job_id = JobId::new();
        let mut slow = task(job_id, |_| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            Ok(Value::Null)
        });
        slow.timeout = Some(0.01);
        handler.accept(slow).unwrap();

        let events = handler.iterate();
        match &events[1] {
            HandlerEvent::Finished(_, outcome) => {
                assert!(outcome.runtime_info.timed_out);
                assert!(outcome.result.is_err());
            }
            _ => panic!("expected Finished"),
        }
    }
}
