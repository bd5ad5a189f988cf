//! Threaded backend sessions.
//!
//! Backends are blocking, callback-driven optimizers. Each session runs its
//! backend on a dedicated thread; the backend's objective callback forwards
//! every point over a channel and blocks until the driver replies. That turns
//! the callback API into the pull-style protocol of [`OptimizerSession`].

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ndarray::Array1;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use dt_optimizers::{OptimizerError, Report, Status};
use dt_types::{AdapterError, Outcome, Response, SessionState, TerminationStatus};

use super::{Action, OptimizerSession, Termination};
use crate::layout::ProblemLayout;
use crate::mediator::panic_message;

/// Backend thread to session.
#[derive(Debug)]
pub enum BackendMessage {
    Evaluate { x: Array1<f64>, iteration: usize },
    Finished(Report),
    Failed(String),
}

/// How outcomes are phrased for one backend's calling convention.
pub trait ReplyConvention: Send + 'static {
    type Reply: Send + 'static;

    fn success(layout: &ProblemLayout, response: &Response) -> Result<Self::Reply, String>;

    fn recoverable(layout: &ProblemLayout, reason: &str) -> Self::Reply;

    fn stop(layout: &ProblemLayout) -> Self::Reply;
}

/// Backend-thread end of a session.
pub struct BackendLink<R> {
    requests: Sender<BackendMessage>,
    replies: Receiver<R>,
}

impl<R> BackendLink<R> {
    /// Ask the driver to evaluate `x`. `None` once the session is gone.
    pub fn request(&self, x: &Array1<f64>, iteration: usize) -> Option<R> {
        self.requests
            .send(BackendMessage::Evaluate {
                x: x.clone(),
                iteration,
            })
            .ok()?;
        self.replies.recv().ok()
    }

    pub fn finish(self, result: Result<Report, OptimizerError>) {
        let message = match result {
            Ok(report) => BackendMessage::Finished(report),
            Err(err) => BackendMessage::Failed(err.to_string()),
        };
        // The session may already be closed.
        let _ = self.requests.send(message);
    }
}

pub struct ThreadedSession<C: ReplyConvention> {
    backend: &'static str,
    layout: Arc<ProblemLayout>,
    state: SessionState,
    requests: Option<Receiver<BackendMessage>>,
    replies: Option<Sender<C::Reply>>,
    worker: Option<JoinHandle<()>>,
    timeout: Option<Duration>,
    /// Reason of the fatal outcome that made us stop the backend.
    fatal: Option<String>,
    _convention: PhantomData<C>,
}

impl<C: ReplyConvention> ThreadedSession<C> {
    /// Start `run` on a new thread with the backend end of the channels.
    pub fn spawn<F>(
        backend: &'static str,
        layout: Arc<ProblemLayout>,
        timeout: Option<Duration>,
        run: F,
    ) -> Result<Self, AdapterError>
    where
        F: FnOnce(BackendLink<C::Reply>) + Send + 'static,
    {
        let (request_tx, request_rx) = bounded(1);
        let (reply_tx, reply_rx) = bounded(1);
        let link = BackendLink {
            requests: request_tx,
            replies: reply_rx,
        };

        let worker = thread::Builder::new()
            .name(format!("detour-{backend}"))
            .spawn(move || run(link))
            .map_err(|source| AdapterError::Spawn {
                backend: backend.to_string(),
                source,
            })?;
        debug!(backend, "backend thread started");

        Ok(Self {
            backend,
            layout,
            state: SessionState::Initialized,
            requests: Some(request_rx),
            replies: Some(reply_tx),
            worker: Some(worker),
            timeout,
            fatal: None,
            _convention: PhantomData,
        })
    }

    /// Hang up on the backend and wait for its thread, or leave it behind when
    /// it is not responding.
    fn shutdown(&mut self, wait: bool) -> Result<(), AdapterError> {
        self.state = SessionState::Terminated;
        self.replies.take();
        self.requests.take();

        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if !wait {
            warn!(backend = self.backend, "backend unresponsive, detaching its thread");
            return Ok(());
        }
        match worker.join() {
            Ok(()) => {
                debug!(backend = self.backend, "backend thread joined");
                Ok(())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(backend = self.backend, %message, "backend thread panicked");
                Err(AdapterError::BackendPanicked {
                    backend: self.backend.to_string(),
                    message,
                })
            }
        }
    }

    fn protocol_error(&mut self, message: String, raw: Option<String>, wait: bool) -> AdapterError {
        error!(backend = self.backend, %message, "backend protocol violation");
        if let Err(panicked) = self.shutdown(wait) {
            return panicked;
        }
        AdapterError::BackendProtocol {
            backend: self.backend.to_string(),
            message,
            raw,
        }
    }

    fn receive(&mut self) -> Result<BackendMessage, AdapterError> {
        let Some(requests) = &self.requests else {
            return Err(AdapterError::InvalidTransition {
                state: self.state,
                operation: "next_action",
            });
        };
        let received = match self.timeout {
            Some(timeout) => requests.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => (format!("no response within {timeout:?}"), false),
                RecvTimeoutError::Disconnected => {
                    ("backend exited without a final report".to_string(), true)
                }
            }),
            None => requests
                .recv()
                .map_err(|_| ("backend exited without a final report".to_string(), true)),
        };
        received.map_err(|(message, wait)| self.protocol_error(message, None, wait))
    }

    fn terminate(&mut self, report: Report) -> Result<Action, AdapterError> {
        self.shutdown(true)?;
        if report.x.len() != self.layout.dim() {
            return Err(AdapterError::BackendProtocol {
                backend: self.backend.to_string(),
                message: format!(
                    "final point has dimension {}, expected {}",
                    report.x.len(),
                    self.layout.dim()
                ),
                raw: Some(format!("{:?}", report)),
            });
        }

        let status = match (self.fatal.take(), report.status) {
            (Some(reason), _) => TerminationStatus::Error { reason },
            (None, Status::Converged) => TerminationStatus::Converged,
            (None, Status::Stopped) => TerminationStatus::Stopped,
            (None, other) => TerminationStatus::Unconverged {
                reason: other.describe().to_string(),
            },
        };
        debug!(
            backend = self.backend,
            ?status,
            iterations = report.iterations,
            evaluations = report.evaluations,
            "backend finished"
        );

        Ok(Action::Terminate(Termination {
            status,
            point: Some(self.layout.point(&report.x)),
            objective: report.objective.map(|f| f * self.layout.sign()),
            iterations: report.iterations as u64,
        }))
    }
}

impl<C: ReplyConvention> OptimizerSession for ThreadedSession<C> {
    fn state(&self) -> SessionState {
        self.state
    }

    fn next_action(&mut self) -> Result<Action, AdapterError> {
        match self.state {
            SessionState::Initialized | SessionState::Requesting => {}
            state => {
                return Err(AdapterError::InvalidTransition {
                    state,
                    operation: "next_action",
                })
            }
        }
        self.state = SessionState::Requesting;

        match self.receive()? {
            BackendMessage::Evaluate { x, iteration } => {
                if x.len() != self.layout.dim() {
                    let message = format!(
                        "requested a point of dimension {}, expected {}",
                        x.len(),
                        self.layout.dim()
                    );
                    return Err(self.protocol_error(message, Some(format!("{x}")), true));
                }
                if x.iter().any(|v| !v.is_finite()) {
                    let message = "requested a point with non-finite coordinates".to_string();
                    return Err(self.protocol_error(message, Some(format!("{x}")), true));
                }
                self.state = SessionState::AwaitingOutcome;
                Ok(Action::Evaluate {
                    point: self.layout.point(&x),
                    iteration: iteration as u64,
                })
            }
            BackendMessage::Finished(report) => self.terminate(report),
            BackendMessage::Failed(message) => Err(self.protocol_error(message, None, true)),
        }
    }

    fn accept_outcome(&mut self, outcome: &Outcome) -> Result<(), AdapterError> {
        if self.state != SessionState::AwaitingOutcome {
            return Err(AdapterError::InvalidTransition {
                state: self.state,
                operation: "accept_outcome",
            });
        }

        let reply = match outcome {
            Outcome::Success(response) => C::success(&self.layout, response)
                .map_err(|message| AdapterError::InvalidOutcome { message })?,
            Outcome::RecoverableFailure { reason } => C::recoverable(&self.layout, reason),
            Outcome::FatalFailure { reason, .. } => {
                self.fatal = Some(reason.clone());
                C::stop(&self.layout)
            }
        };

        let delivered = match &self.replies {
            Some(replies) => replies.send(reply).is_ok(),
            None => false,
        };
        if !delivered {
            let message = "backend hung up before receiving the outcome".to_string();
            return Err(self.protocol_error(message, None, true));
        }
        self.state = SessionState::Requesting;
        Ok(())
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        if self.worker.is_none() {
            self.state = SessionState::Terminated;
            return Ok(());
        }
        self.shutdown(true)
    }
}

impl<C: ReplyConvention> Drop for ThreadedSession<C> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.shutdown(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dt_optimizers::{EvalFlag, FlaggedEvaluation};
    use ndarray::array;

    use crate::adapter::flag::FlagConvention;
    use crate::models::Paraboloid;

    type FlagLink = BackendLink<FlaggedEvaluation>;

    fn layout() -> Arc<ProblemLayout> {
        Arc::new(ProblemLayout::from_config(&Paraboloid::bounded_config("session")))
    }

    fn spawn<F>(timeout: Option<Duration>, run: F) -> ThreadedSession<FlagConvention>
    where
        F: FnOnce(FlagLink) + Send + 'static,
    {
        ThreadedSession::<FlagConvention>::spawn("test", layout(), timeout, run).unwrap()
    }

    fn report(x: Array1<f64>, status: Status) -> Report {
        Report {
            x,
            objective: Some(1.5),
            iterations: 4,
            evaluations: 7,
            status,
        }
    }

    fn soft() -> Outcome {
        Outcome::RecoverableFailure {
            reason: "outside the domain".into(),
        }
    }

    fn assert_protocol(err: AdapterError, expected: &str) {
        match err {
            AdapterError::BackendProtocol { backend, message, .. } => {
                assert_eq!(backend, "test");
                assert!(message.contains(expected), "{message}");
            }
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    #[test]
    fn request_and_terminate() {
        let mut session = spawn(None, |link: FlagLink| {
            let reply = link.request(&array![1.0, 2.0], 0);
            let failed = reply.is_some_and(|r| r.flag == EvalFlag::Failed);
            let x = if failed { array![0.5, 1.0] } else { array![9.0, 9.0] };
            link.finish(Ok(report(x, Status::Converged)));
        });
        assert_eq!(session.state(), SessionState::Initialized);

        match session.next_action().unwrap() {
            Action::Evaluate { point, iteration } => {
                assert_eq!(point.scalar("x"), Some(1.0));
                assert_eq!(point.scalar("y"), Some(2.0));
                assert_eq!(iteration, 0);
            }
            other => panic!("expected a request, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::AwaitingOutcome);
        session.accept_outcome(&soft()).unwrap();
        assert_eq!(session.state(), SessionState::Requesting);

        match session.next_action().unwrap() {
            Action::Terminate(termination) => {
                assert_eq!(termination.status, TerminationStatus::Converged);
                assert_eq!(termination.point.and_then(|p| p.scalar("x")), Some(0.5));
                assert_eq!(termination.objective, Some(1.5));
                assert_eq!(termination.iterations, 4);
            }
            other => panic!("expected termination, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn outcome_before_request_is_rejected() {
        let mut session = spawn(None, |link: FlagLink| {
            link.finish(Ok(report(array![0.0, 0.0], Status::Converged)));
        });
        let err = session.accept_outcome(&soft()).unwrap_err();
        assert!(matches!(
            err,
            AdapterError::InvalidTransition {
                state: SessionState::Initialized,
                operation: "accept_outcome",
            }
        ));
        session.close().unwrap();
    }

    #[test]
    fn calls_after_termination_are_rejected() {
        let mut session = spawn(None, |link: FlagLink| {
            link.finish(Ok(report(array![0.0, 0.0], Status::IterationLimit)));
        });
        match session.next_action().unwrap() {
            Action::Terminate(termination) => assert!(matches!(
                termination.status,
                TerminationStatus::Unconverged { .. }
            )),
            other => panic!("expected termination, got {other:?}"),
        }

        assert!(matches!(
            session.next_action(),
            Err(AdapterError::InvalidTransition {
                state: SessionState::Terminated,
                operation: "next_action",
            })
        ));
        assert!(matches!(
            session.accept_outcome(&soft()),
            Err(AdapterError::InvalidTransition {
                state: SessionState::Terminated,
                operation: "accept_outcome",
            })
        ));
        session.close().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn unresponsive_backend_times_out() {
        let mut session = spawn(Some(Duration::from_millis(20)), |link: FlagLink| {
            thread::sleep(Duration::from_millis(500));
            link.finish(Ok(report(array![0.0, 0.0], Status::Converged)));
        });
        assert_protocol(session.next_action().unwrap_err(), "no response within");
        assert_eq!(session.state(), SessionState::Terminated);
        // Detached, not joined.
        assert!(session.worker.is_none());
        session.close().unwrap();
    }

    #[test]
    fn backend_panic_is_reported() {
        let mut session = spawn(None, |_link: FlagLink| panic!("backend blew up"));
        match session.next_action().unwrap_err() {
            AdapterError::BackendPanicked { backend, message } => {
                assert_eq!(backend, "test");
                assert!(message.contains("backend blew up"), "{message}");
            }
            other => panic!("expected a panic report, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn backend_error_is_a_protocol_error() {
        let mut session = spawn(None, |link: FlagLink| {
            link.finish(Err(OptimizerError::NotPositiveDefinite));
        });
        assert_protocol(session.next_action().unwrap_err(), "not positive definite");
    }

    #[test]
    fn wrong_dimension_request_is_rejected() {
        let mut session = spawn(None, |link: FlagLink| {
            let reply = link.request(&array![1.0, 2.0, 3.0], 0);
            assert!(reply.is_none());
        });
        assert_protocol(
            session.next_action().unwrap_err(),
            "requested a point of dimension 3, expected 2",
        );
        assert_eq!(session.state(), SessionState::Terminated);
        session.close().unwrap();
    }

    #[test]
    fn non_finite_request_is_rejected() {
        let mut session = spawn(None, |link: FlagLink| {
            let _ = link.request(&array![1.0, f64::NAN], 0);
        });
        match session.next_action().unwrap_err() {
            AdapterError::BackendProtocol { message, raw, .. } => {
                assert_eq!(message, "requested a point with non-finite coordinates");
                assert!(raw.is_some_and(|raw| raw.contains("NaN")));
            }
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }
}
