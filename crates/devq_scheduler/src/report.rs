//! Hand-off of a finished run to whatever renders it.

use thiserror::Error;

use crate::result::RunResult;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to format the run result: {0}")]
    FailedToFormat(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Renders a finished run, e.g. as a terminal summary or a verdict file.
///
/// An emitter sees each run's result exactly once, after the result is final.
pub trait ReportEmitter: Send {
    fn emit(&mut self, result: &RunResult) -> Result<(), EmitError>;
}

/// Hands `result` to every emitter. An emitter's failure does not stop the rest; all failures
/// are returned.
pub fn emit_all(result: &RunResult, emitters: &mut [Box<dyn ReportEmitter>]) -> Vec<EmitError> {
    let mut errors = Vec::new();
    for emitter in emitters.iter_mut() {
        if let Err(error) = emitter.emit(result) {
            tracing::error!(%error, "failed to emit run result");
            errors.push(error);
        }
    }
    errors
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use devq_utils::protocol::RunId;

    use super::{emit_all, EmitError, ReportEmitter};
    use crate::result::{RunResult, Verdict};

    struct Collect(Arc<Mutex<Vec<Verdict>>>);

    impl ReportEmitter for Collect {
        fn emit(&mut self, result: &RunResult) -> Result<(), EmitError> {
            self.0.lock().unwrap().push(result.verdict);
            Ok(())
        }
    }

    struct Broken;

    impl ReportEmitter for Broken {
        fn emit(&mut self, _result: &RunResult) -> Result<(), EmitError> {
            Err(EmitError::FailedToFormat("broken".to_owned()))
        }
    }

    #[test]
    fn failing_emitter_does_not_stop_the_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut emitters: Vec<Box<dyn ReportEmitter>> =
            vec![Box::new(Broken), Box::new(Collect(seen.clone()))];
        let result = RunResult::new(RunId::unique(), vec![], vec![], vec![], false);

        let errors = emit_all(&result, &mut emitters);

        assert_eq!(errors.len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Verdict::Success]);
    }
}
