// ABOUTME: Cancellable live log sessions and the registry tracking them per machine
// ABOUTME: Lines are forwarded through a bounded channel; the follower is stopped on exit

use crate::runtime::{FollowerExit, LogFollower};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const END_OF_LOGS: &str = "--- END LIVE CONTAINER LOGS ---";

#[derive(Default)]
struct Sessions {
    next_id: u64,
    by_machine: HashMap<String, HashMap<u64, watch::Sender<bool>>>,
}

/// Active log sessions keyed by machine id, behind a single lock
#[derive(Clone, Default)]
pub struct LogSessionRegistry {
    inner: Arc<Mutex<Sessions>>,
}

impl LogSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session; it is unregistered when the ticket drops
    pub fn register(&self, machine_id: &str) -> SessionTicket {
        let (tx, rx) = watch::channel(false);
        let mut sessions = self.lock();
        sessions.next_id += 1;
        let id = sessions.next_id;
        sessions
            .by_machine
            .entry(machine_id.to_string())
            .or_default()
            .insert(id, tx);

        SessionTicket {
            registry: self.clone(),
            machine_id: machine_id.to_string(),
            id,
            cancel: rx,
        }
    }

    /// Cancel every session for the machine; returns how many were signalled
    pub fn terminate(&self, machine_id: &str) -> usize {
        let removed = self.lock().by_machine.remove(machine_id);
        let Some(sessions) = removed else {
            return 0;
        };

        let count = sessions.len();
        for (_, tx) in sessions {
            let _ = tx.send(true);
        }
        if count > 0 {
            info!("Terminated {} log session(s) for machine {}", count, machine_id);
        }
        count
    }

    pub fn active_sessions(&self, machine_id: &str) -> usize {
        self.lock()
            .by_machine
            .get(machine_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn unregister(&self, machine_id: &str, id: u64) {
        let mut sessions = self.lock();
        if let Some(machine) = sessions.by_machine.get_mut(machine_id) {
            machine.remove(&id);
            if machine.is_empty() {
                sessions.by_machine.remove(machine_id);
            }
        }
    }
}

/// Registration handle for one session
pub struct SessionTicket {
    registry: LogSessionRegistry,
    machine_id: String,
    id: u64,
    cancel: watch::Receiver<bool>,
}

impl SessionTicket {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.registry.unregister(&self.machine_id, self.id);
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The receiving side went away
    ClientGone,
    /// Terminated through the registry
    Cancelled,
    /// The follower process exited on its own
    Finished(FollowerExit),
    /// No stream was started; an explanatory line was sent instead
    Unavailable,
}

pub struct LogSession {
    follower: Box<dyn LogFollower>,
    ticket: SessionTicket,
    grace: Duration,
}

impl LogSession {
    pub fn new(follower: Box<dyn LogFollower>, ticket: SessionTicket, grace: Duration) -> Self {
        Self {
            follower,
            ticket,
            grace,
        }
    }

    /// Forward lines into `sink` until the client disconnects, the session is
    /// cancelled, or the follower exits. The follower is always finished.
    pub async fn run(self, sink: mpsc::Sender<String>) -> SessionEnd {
        let LogSession {
            mut follower,
            ticket,
            grace,
        } = self;
        let machine_id = ticket.machine_id.clone();
        let mut cancel = ticket.cancel.clone();

        info!("Log session started for machine {}", machine_id);

        let cancelled_early = *cancel.borrow_and_update();
        let outcome = if cancelled_early {
            Outcome::Cancelled
        } else {
            forward(&mut *follower, &sink, &mut cancel).await
        };

        let exit = follower.finish(grace).await;
        drop(ticket);

        let end = match outcome {
            Outcome::ClientGone => SessionEnd::ClientGone,
            Outcome::Cancelled => SessionEnd::Cancelled,
            Outcome::Ended => {
                let message = if exit.success() {
                    END_OF_LOGS.to_string()
                } else {
                    warn!(
                        "Log follower for machine {} exited with {:?}",
                        machine_id, exit.code
                    );
                    format!(
                        "--- LOG STREAM ERROR: log process exited with code {} ---",
                        exit.code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    )
                };
                let _ = sink.send(message).await;
                SessionEnd::Finished(exit)
            }
        };

        info!("Log session for machine {} ended: {:?}", machine_id, end);
        end
    }
}

enum Outcome {
    ClientGone,
    Cancelled,
    Ended,
}

async fn forward(
    follower: &mut dyn LogFollower,
    sink: &mpsc::Sender<String>,
    cancel: &mut watch::Receiver<bool>,
) -> Outcome {
    loop {
        tokio::select! {
            _ = sink.closed() => break Outcome::ClientGone,
            _ = cancel.changed() => break Outcome::Cancelled,
            line = follower.next_line() => {
                let Some(line) = line else {
                    break Outcome::Ended;
                };
                tokio::select! {
                    sent = sink.send(line) => {
                        if sent.is_err() {
                            break Outcome::ClientGone;
                        }
                    }
                    _ = cancel.changed() => break Outcome::Cancelled,
                }
            }
        }
    }
}

/// Send a single explanatory line in place of a stream
pub(crate) async fn send_notice(sink: &mpsc::Sender<String>, message: impl Into<String>) {
    let message = message.into();
    debug!("Log notice: {}", message);
    let _ = sink.send(message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedFollower {
        lines: VecDeque<String>,
        hang: bool,
        code: Option<i32>,
    }

    #[async_trait]
    impl LogFollower for ScriptedFollower {
        async fn next_line(&mut self) -> Option<String> {
            match self.lines.pop_front() {
                Some(line) => Some(line),
                None if self.hang => std::future::pending().await,
                None => None,
            }
        }

        async fn finish(self: Box<Self>, _grace: Duration) -> FollowerExit {
            FollowerExit {
                code: self.code,
                forced: self.hang,
            }
        }
    }

    fn follower(lines: &[&str], hang: bool, code: Option<i32>) -> Box<dyn LogFollower> {
        Box::new(ScriptedFollower {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            hang,
            code,
        })
    }

    #[tokio::test]
    async fn test_natural_end_appends_marker() {
        let registry = LogSessionRegistry::new();
        let session = LogSession::new(
            follower(&["one", "two"], false, Some(0)),
            registry.register("m1"),
            Duration::from_millis(10),
        );
        let (tx, mut rx) = mpsc::channel(8);

        let end = session.run(tx).await;

        assert!(matches!(end, SessionEnd::Finished(exit) if exit.success()));
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", END_OF_LOGS]);
        assert_eq!(registry.active_sessions("m1"), 0);
    }

    #[tokio::test]
    async fn test_failed_follower_reports_error_line() {
        let registry = LogSessionRegistry::new();
        let session = LogSession::new(
            follower(&[], false, Some(1)),
            registry.register("m1"),
            Duration::from_millis(10),
        );
        let (tx, mut rx) = mpsc::channel(8);

        session.run(tx).await;

        let line = rx.recv().await.unwrap();
        assert!(line.contains("exited with code 1"));
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_session() {
        let registry = LogSessionRegistry::new();
        let session = LogSession::new(
            follower(&["one"], true, None),
            registry.register("m1"),
            Duration::from_millis(10),
        );
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(session.run(tx));
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        drop(rx);

        assert_eq!(handle.await.unwrap(), SessionEnd::ClientGone);
        assert_eq!(registry.active_sessions("m1"), 0);
    }

    #[tokio::test]
    async fn test_terminate_cancels_all_sessions_for_machine() {
        let registry = LogSessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let (other_tx, _other_rx) = mpsc::channel(8);

        let first = tokio::spawn(
            LogSession::new(
                follower(&[], true, None),
                registry.register("m1"),
                Duration::from_millis(10),
            )
            .run(tx.clone()),
        );
        let second = tokio::spawn(
            LogSession::new(
                follower(&[], true, None),
                registry.register("m1"),
                Duration::from_millis(10),
            )
            .run(tx),
        );
        let other_ticket = registry.register("m2");
        let other = tokio::spawn(
            LogSession::new(follower(&[], true, None), other_ticket, Duration::from_millis(10))
                .run(other_tx),
        );

        assert_eq!(registry.active_sessions("m1"), 2);
        assert_eq!(registry.terminate("m1"), 2);

        assert_eq!(first.await.unwrap(), SessionEnd::Cancelled);
        assert_eq!(second.await.unwrap(), SessionEnd::Cancelled);
        assert_eq!(registry.active_sessions("m2"), 1);
        assert!(!other.is_finished());
        other.abort();
    }

    #[tokio::test]
    async fn test_terminated_before_start() {
        let registry = LogSessionRegistry::new();
        let ticket = registry.register("m1");
        registry.terminate("m1");
        assert!(ticket.is_cancelled());

        let (tx, _rx) = mpsc::channel(8);
        let end = LogSession::new(follower(&["x"], false, Some(0)), ticket, Duration::ZERO)
            .run(tx)
            .await;
        assert_eq!(end, SessionEnd::Cancelled);
    }
}
