//! Wall-clock limit for a single evaluation

use super::{Evaluation, Evaluator, EvaluatorError};
use crate::molecule::Geometry;
use log::warn;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Runs the inner evaluator on a worker thread and gives up after `limit`.
///
/// A timed-out worker is left to finish on its own; its result is discarded.
#[derive(Debug)]
pub struct Timeout<E: ?Sized> {
    inner: Arc<E>,
    limit: Duration,
}

impl<E: Evaluator> Timeout<E> {
    pub fn new(inner: E, limit: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            limit,
        }
    }
}

impl<E: Evaluator + ?Sized> Timeout<E> {
    /// Wrap an already shared evaluator
    pub fn shared(inner: Arc<E>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    /// Time limit per evaluation
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl<E: Evaluator + ?Sized + 'static> Evaluator for Timeout<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let geometry = geometry.clone();
        thread::Builder::new()
            .name("evaluator".into())
            .spawn(move || {
                // The receiver is gone if the caller already timed out
                let _ = tx.send(inner.evaluate(&geometry));
            })
            .map_err(|e| EvaluatorError::Failed(format!("could not start evaluator thread: {}", e)))?;

        match rx.recv_timeout(self.limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} did not finish within {:?}", self.inner.name(), self.limit);
                Err(EvaluatorError::Timeout(self.limit))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EvaluatorError::Failed(
                "evaluator thread exited without a result".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    struct Sleepy(Duration);

    impl Evaluator for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn evaluate(&self, geometry: &Geometry) -> Result<Evaluation, EvaluatorError> {
            thread::sleep(self.0);
            Ok(Evaluation {
                energy: 0.0,
                gradient: DVector::zeros(geometry.coords.len()),
            })
        }
    }

    fn atom() -> Geometry {
        Geometry::new(vec!["He".into()], vec![0.0, 0.0, 0.0]).unwrap()
    }

    #[test]
    fn test_fast_evaluation_passes_through() {
        let evaluator = Timeout::new(Sleepy(Duration::from_millis(1)), Duration::from_secs(5));
        assert!(evaluator.evaluate(&atom()).is_ok());
        assert_eq!(evaluator.name(), "sleepy");
    }

    #[test]
    fn test_slow_evaluation_times_out() {
        let limit = Duration::from_millis(20);
        let evaluator = Timeout::new(Sleepy(Duration::from_millis(500)), limit);
        assert_eq!(evaluator.evaluate(&atom()), Err(EvaluatorError::Timeout(limit)));
    }

    #[test]
    fn test_shared_trait_object() {
        let inner: Arc<dyn Evaluator> = Arc::new(Sleepy(Duration::from_millis(1)));
        let evaluator = Timeout::shared(inner, Duration::from_secs(5));
        assert_eq!(evaluator.limit(), Duration::from_secs(5));
        assert!(evaluator.evaluate(&atom()).is_ok());
    }
}
