//! Actor wrapper that runs a session on a dedicated OS thread.
//!
//! Prefill and decode block on the device, so interactive callers hand the
//! session to an actor and consume streaming events over a channel instead
//! of driving it inline.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{EdgeLmError, Result};
use crate::io::Responses;

use super::{InferenceObserver, Session};

/// Commands sent to the session actor.
pub enum SessionCommand {
    /// Prefill the prompt and stream the decoded response.
    GenerateResponse { prompt: String },

    /// Shut down the actor thread.
    Shutdown,
}

/// Events the actor emits back to the caller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chunk of decoded text.
    Chunk(Responses),

    /// The current generation finished.
    Done,

    /// The current generation failed.
    Error(String),

    /// The actor thread has exited.
    Stopped,
}

/// Handle to a session running on its own thread.
pub struct SessionActor {
    cmd_tx: Sender<SessionCommand>,
    event_rx: Receiver<SessionEvent>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionActor {
    /// Move `session` onto a dedicated thread and return the handle.
    pub fn spawn(session: Session) -> Self {
        let (cmd_tx, cmd_rx) = bounded::<SessionCommand>(16);
        let (event_tx, event_rx) = bounded::<SessionEvent>(256);

        let thread = thread::Builder::new()
            .name("session-actor".into())
            .spawn(move || actor_loop(session, cmd_rx, event_tx))
            .expect("failed to spawn session actor thread");

        SessionActor {
            cmd_tx,
            event_rx,
            thread: Some(thread),
        }
    }

    /// Request a streamed generation for `prompt`.
    pub fn generate(&self, prompt: &str) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::GenerateResponse {
                prompt: prompt.to_string(),
            })
            .map_err(|_| EdgeLmError::Internal("session actor channel closed".into()))
    }

    /// Try to receive the next event (non-blocking).
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Option<SessionEvent> {
        self.event_rx.recv().ok()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Shut down the actor thread and wait for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Adapts observer callbacks onto the event channel.
struct ChannelObserver {
    event_tx: Sender<SessionEvent>,
}

impl InferenceObserver for ChannelObserver {
    fn on_next(&mut self, responses: &Responses) {
        let _ = self.event_tx.send(SessionEvent::Chunk(responses.clone()));
    }

    fn on_done(&mut self) {
        let _ = self.event_tx.send(SessionEvent::Done);
    }

    fn on_error(&mut self, error: &EdgeLmError) {
        let _ = self.event_tx.send(SessionEvent::Error(error.to_string()));
    }
}

fn actor_loop(
    mut session: Session,
    cmd_rx: Receiver<SessionCommand>,
    event_tx: Sender<SessionEvent>,
) {
    loop {
        match cmd_rx.recv() {
            Ok(SessionCommand::GenerateResponse { prompt }) => {
                if let Err(e) = session.run_prefill(&prompt) {
                    let _ = event_tx.send(SessionEvent::Error(e.to_string()));
                    continue;
                }
                let mut observer = ChannelObserver {
                    event_tx: event_tx.clone(),
                };
                // Errors were already reported through the observer.
                let _ = session.run_decode_stream(&mut observer);
            }

            Ok(SessionCommand::Shutdown) | Err(_) => {
                let _ = event_tx.send(SessionEvent::Stopped);
                break;
            }
        }
    }
}
