//! Per-worker tick loop
//!
//! Each worker owns an event loop and a role-specific session, and runs a
//! fixed tick clock. At every tick boundary it polls the session's endpoint,
//! absorbs handed-off channels, services ping liveness, and lets the session
//! send its paced burst; between boundaries it drains readable channels. A
//! late wakeup leaves the tick clock alone, so owed ticks fire back to back
//! until the worker catches up.

use crate::error::Result;
use crate::event_loop::{ChannelEvents, EventLoop};
use crate::threading::WorkerControl;
use crate::timing::{now_ns, tick_interval_ns};
use phloem_transport::PollerKind;
use std::fmt;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the transport endpoint to come up
    Connecting,
    /// Transport is up, application handshake and initial exchange pending
    AwaitingSessionSetup,
    /// Paced sending in progress
    SteadyState,
    ShuttingDown,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Connecting => "connecting",
            WorkerState::AwaitingSessionSetup => "awaiting session setup",
            WorkerState::SteadyState => "steady state",
            WorkerState::ShuttingDown => "shutting down",
        };
        f.write_str(s)
    }
}

/// Role-specific behavior plugged into the worker loop.
///
/// The channel callbacks come from [`ChannelEvents`]; the methods here drive
/// the paced side. `send_burst` runs only in steady state and is called once
/// per tick.
pub trait Session: ChannelEvents {
    /// One-time setup before the loop starts
    fn prepare(&mut self, event_loop: &mut EventLoop) -> Result<()>;

    /// Tick-cadence endpoint maintenance: accept waiting clients or retry a
    /// pending connect
    fn poll_endpoint(&mut self, event_loop: &mut EventLoop) -> Result<()>;

    /// True once the transport side is up
    fn connected(&self) -> bool;

    /// True once the application-level setup exchange has finished
    fn setup_complete(&self) -> bool;

    /// True when the session cannot make further progress and the worker
    /// should stop
    fn finished(&self) -> bool;

    /// Paced work for one tick. `tick` counts from zero and wraps every
    /// second. `stop_at_ns` is this tick's deadline; a session holding
    /// backlogged work may keep sending until then.
    fn send_burst(&mut self, tick: u64, event_loop: &mut EventLoop, stop_at_ns: u64) -> Result<()>;
}

pub struct WorkerLoop<S: Session> {
    worker: usize,
    event_loop: EventLoop,
    session: S,
    ticks_per_sec: u64,
    state: WorkerState,
}

impl<S: Session> WorkerLoop<S> {
    pub fn new(worker: usize, kind: PollerKind, ticks_per_sec: u64, session: S) -> Result<Self> {
        Ok(Self {
            worker,
            event_loop: EventLoop::new(kind)?,
            session,
            ticks_per_sec,
            state: WorkerState::Connecting,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Run until shutdown is requested or the session reports it is done.
    /// Errors out of the event loop or the session are fatal to this worker;
    /// channels are closed on every exit path.
    pub fn run(&mut self, control: &WorkerControl) -> Result<()> {
        let result = self.run_inner(control);
        self.state = WorkerState::ShuttingDown;
        info!(worker = self.worker, "shutting down");
        self.event_loop.close_all(&mut self.session);
        if let Err(e) = &result {
            error!(worker = self.worker, error = %e, "worker stopped on error");
        }
        result
    }

    fn run_inner(&mut self, control: &WorkerControl) -> Result<()> {
        self.session.prepare(&mut self.event_loop)?;
        let tick_ns = tick_interval_ns(self.ticks_per_sec);
        let mut current_tick: u64 = 0;
        let mut next_tick_at = now_ns() + tick_ns;

        while !control.shutdown_requested() && !self.session.finished() {
            let now = now_ns();
            if now >= next_tick_at {
                next_tick_at += tick_ns;
                self.session.poll_endpoint(&mut self.event_loop)?;
                self.event_loop.process_new_channels(&mut self.session)?;
                self.advance_state();
                self.event_loop.check_pings(now, &mut self.session);
                if self.state == WorkerState::SteadyState {
                    self.session.send_burst(current_tick, &mut self.event_loop, next_tick_at)?;
                }
                current_tick += 1;
                if current_tick == self.ticks_per_sec {
                    current_tick = 0;
                }
            }
            self.event_loop.read_channels(next_tick_at, &mut self.session)?;
        }
        Ok(())
    }

    /// Recompute the lifecycle state from what the session reports. Covers
    /// regression too: a consumer that loses its channel before setup drops
    /// back to connecting while it retries.
    fn advance_state(&mut self) {
        let next = if !self.session.connected() {
            WorkerState::Connecting
        } else if !self.session.setup_complete() {
            WorkerState::AwaitingSessionSetup
        } else {
            WorkerState::SteadyState
        };
        if next != self.state {
            info!(worker = self.worker, from = %self.state, to = %next, "worker state");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnId, ConnectionHandle};
    use crate::event_loop::CloseReason;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Session stub driven by poll counts, no real channels involved
    struct StubSession {
        polls: u64,
        connected_after: u64,
        setup_after: u64,
        bursts: Vec<u64>,
        first_burst_poll: Option<u64>,
        finish_after_bursts: Option<usize>,
    }

    impl StubSession {
        fn new(connected_after: u64, setup_after: u64) -> Self {
            Self {
                polls: 0,
                connected_after,
                setup_after,
                bursts: Vec::new(),
                first_burst_poll: None,
                finish_after_bursts: None,
            }
        }
    }

    impl ChannelEvents for StubSession {
        fn on_channel_active(&mut self, _conn: &mut ConnectionHandle) -> Result<()> {
            Ok(())
        }

        fn on_payload(&mut self, _conn: &mut ConnectionHandle, _payload: &[u8]) -> Result<()> {
            Ok(())
        }

        fn on_channel_close(&mut self, _id: ConnId, _reason: CloseReason) {}
    }

    impl Session for StubSession {
        fn prepare(&mut self, _event_loop: &mut EventLoop) -> Result<()> {
            Ok(())
        }

        fn poll_endpoint(&mut self, _event_loop: &mut EventLoop) -> Result<()> {
            self.polls += 1;
            Ok(())
        }

        fn connected(&self) -> bool {
            self.polls >= self.connected_after
        }

        fn setup_complete(&self) -> bool {
            self.polls >= self.setup_after
        }

        fn finished(&self) -> bool {
            matches!(self.finish_after_bursts, Some(n) if self.bursts.len() >= n)
        }

        fn send_burst(
            &mut self,
            tick: u64,
            _event_loop: &mut EventLoop,
            _stop_at_ns: u64,
        ) -> Result<()> {
            if self.first_burst_poll.is_none() {
                self.first_burst_poll = Some(self.polls);
            }
            self.bursts.push(tick);
            Ok(())
        }
    }

    fn shutdown_after(control: &Arc<WorkerControl>, delay: Duration) -> thread::JoinHandle<()> {
        let control = Arc::clone(control);
        thread::spawn(move || {
            thread::sleep(delay);
            control.request_shutdown();
        })
    }

    #[test]
    fn test_ticks_count_up_and_wrap() {
        let mut worker =
            WorkerLoop::new(0, PollerKind::default(), 1000, StubSession::new(0, 0)).unwrap();
        let control = Arc::new(WorkerControl::new());
        let timer = shutdown_after(&control, Duration::from_millis(100));
        worker.run(&control).unwrap();
        timer.join().unwrap();

        let bursts = &worker.session().bursts;
        assert!(bursts.len() >= 20, "expected many 1ms ticks, got {}", bursts.len());
        assert!(bursts.iter().all(|&t| t < 1000));
        for pair in bursts.windows(2) {
            assert!(
                pair[1] == pair[0] + 1 || (pair[0] == 999 && pair[1] == 0),
                "ticks must advance one at a time: {} then {}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(worker.state(), WorkerState::ShuttingDown);
    }

    #[test]
    fn test_setup_gates_bursts() {
        let mut worker =
            WorkerLoop::new(0, PollerKind::default(), 1000, StubSession::new(2, 5)).unwrap();
        let control = Arc::new(WorkerControl::new());
        let timer = shutdown_after(&control, Duration::from_millis(50));
        worker.run(&control).unwrap();
        timer.join().unwrap();

        let session = worker.session();
        assert!(session.polls >= 5);
        assert!(session.first_burst_poll.unwrap_or(0) >= 5, "burst before setup completed");
    }

    #[test]
    fn test_finished_session_stops_loop() {
        let mut session = StubSession::new(0, 0);
        session.finish_after_bursts = Some(3);
        let mut worker = WorkerLoop::new(0, PollerKind::default(), 1000, session).unwrap();
        let control = Arc::new(WorkerControl::new());

        let started = Instant::now();
        worker.run(&control).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(worker.session().bursts.len(), 3);
    }
}
