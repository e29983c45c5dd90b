//! Dispatch pump: drains the source and routes each response.
//!
//! [`Dispatcher`] owns the shared source handle. Every call into the source
//! goes through its lock, so a non-reentrant source never sees two calls at
//! once. Responses are routed as follows:
//!
//! - `Open` marks the connection as established.
//! - `Data` is offered to the pending slot registered for its request id.
//! - `Exception` is logged.
//! - `Quit` marks the connection lost and fails every waiting fetch.
//!
//! The pump runs either inline, from the fetch that is waiting, or on the
//! background thread started by [`Dispatcher::spawn`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectError, ConnectionState};
use crate::ids::{DefinitionId, ObjectId, RequestId};
use crate::pending::{Delivery, PendingRegistry, SlotFailure};
use crate::source::{DataKind, SourceError, SourceResponse, TelemetrySource};

/// Counters describing what the pump has delivered so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    /// Data responses that filled a waiting slot.
    pub accepted: u64,
    /// Data responses nobody was waiting for, or that arrived too late.
    pub discarded: u64,
    /// Exception responses received.
    pub exceptions: u64,
}

/// Shared source handle plus the routing state its callback writes to.
#[derive(Debug)]
pub struct Dispatcher<S> {
    source: Mutex<S>,
    registry: Arc<PendingRegistry>,
    connection: Arc<ConnectionState>,
    accepted: AtomicU64,
    discarded: AtomicU64,
    exceptions: AtomicU64,
}

impl<S: TelemetrySource> Dispatcher<S> {
    /// Wrap an open source connection.
    pub fn new(source: S) -> Self {
        Self {
            source: Mutex::new(source),
            registry: Arc::new(PendingRegistry::new()),
            connection: Arc::new(ConnectionState::new()),
            accepted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
        }
    }

    fn lock_source(&self) -> MutexGuard<'_, S> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry of slots waiting for responses.
    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// Connection flags maintained by the pump.
    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
        }
    }

    /// Register a data definition with the source.
    pub fn add_definition(
        &self,
        definition_id: DefinitionId,
        field: &str,
        unit: &str,
        kind: DataKind,
    ) -> Result<(), SourceError> {
        self.lock_source()
            .add_definition(definition_id, field, unit, kind)
    }

    /// Issue a one-shot fetch for the user object.
    pub fn request_once(
        &self,
        request_id: RequestId,
        definition_id: DefinitionId,
    ) -> Result<(), SourceError> {
        self.lock_source()
            .request_once(request_id, definition_id, ObjectId::USER)
    }

    /// Close the source connection.
    pub fn close(&self) -> Result<(), SourceError> {
        self.lock_source().close()
    }

    /// Pump the source once, routing everything it delivers.
    pub fn pump_once(&self) -> Result<usize, SourceError> {
        let mut source = self.lock_source();
        source.pump_dispatch(&mut |response: SourceResponse| self.route(response))
    }

    fn route(&self, response: SourceResponse) {
        match response {
            SourceResponse::Open { application } => {
                if self.connection.mark_connected(&application) {
                    info!(application = %application, "Connected to telemetry source");
                }
            }
            SourceResponse::Data {
                request_id,
                definition_id,
                payload,
                ..
            } => {
                let delivery = self.registry.deliver(request_id, &payload);
                trace!(
                    %request_id,
                    %definition_id,
                    bytes = payload.len(),
                    ?delivery,
                    "Routed data response"
                );
                match delivery {
                    Delivery::Accepted => {
                        self.accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    Delivery::ShortPayload => {
                        warn!(%request_id, bytes = payload.len(), "Data response shorter than its definition");
                        self.discarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Delivery::Foreign
                    | Delivery::Unclaimed
                    | Delivery::Duplicate
                    | Delivery::Abandoned => {
                        debug!(%request_id, ?delivery, "Discarded data response");
                        self.discarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            SourceResponse::Exception { code, detail } => {
                warn!(code, detail = %detail, "Telemetry source reported an exception");
                self.exceptions.fetch_add(1, Ordering::Relaxed);
            }
            SourceResponse::Quit => {
                if self.connection.mark_disconnected() {
                    let failed = self.registry.fail_all(SlotFailure::Disconnected);
                    warn!(failed_fetches = failed, "Telemetry source quit");
                }
            }
        }
    }

    /// Pump until the source completes its handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Timeout`] if no `Open` arrives within
    /// `timeout`, [`ConnectError::Quit`] if the source quits first, or
    /// [`ConnectError::Source`] if pumping fails.
    pub fn await_connection(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ConnectError> {
        let started = Instant::now();
        info!(timeout_ms = millis(timeout), "Waiting for flight to start");
        loop {
            self.pump_once()?;
            if self.connection.is_disconnected() {
                return Err(ConnectError::Quit);
            }
            if self.connection.is_connected() {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(ConnectError::Timeout {
                    waited_ms: millis(elapsed),
                });
            }
            debug!(elapsed_ms = millis(elapsed), "Still waiting for handshake");
            thread::sleep(poll_interval.min(timeout.saturating_sub(elapsed)));
        }
    }
}

impl<S: TelemetrySource + 'static> Dispatcher<S> {
    /// Start a background thread that pumps every `interval` while the
    /// source is idle.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> std::io::Result<DispatchHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name(String::from("simbridge-dispatch"))
            .spawn(move || dispatcher.run(&stop_flag, interval))?;

        info!(interval_ms = millis(interval), "Dispatch thread started");
        Ok(DispatchHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn run(&self, stop: &AtomicBool, interval: Duration) {
        while !stop.load(Ordering::Acquire) {
            match self.pump_once() {
                Ok(0) => thread::sleep(interval),
                Ok(_) => {}
                Err(SourceError::Closed) => {
                    debug!("Source closed, dispatch thread exiting");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Dispatch pump failed");
                    thread::sleep(interval);
                }
            }
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Handle to the background dispatch thread. Stops it when dropped.
#[derive(Debug)]
pub struct DispatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Dispatch thread panicked");
            }
        }
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedSim, SimulatedSource};

    fn dispatcher(sim: &Arc<SimulatedSim>) -> Dispatcher<SimulatedSource> {
        Dispatcher::new(SimulatedSource::open("test", Arc::clone(sim)).unwrap())
    }

    #[test]
    fn await_connection_sees_open() {
        let sim = Arc::new(SimulatedSim::new());
        let dispatcher = dispatcher(&sim);
        dispatcher
            .await_connection(Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();
        assert!(dispatcher.connection().is_live());
    }

    #[test]
    fn await_connection_times_out() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_handshake_delay(Duration::from_secs(60));
        let dispatcher = dispatcher(&sim);
        let err = dispatcher
            .await_connection(Duration::from_millis(20), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, ConnectError::Timeout { .. }));
        assert!(!dispatcher.connection().is_connected());
    }

    #[test]
    fn await_connection_reports_quit() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_handshake_delay(Duration::from_secs(60));
        let dispatcher = dispatcher(&sim);
        sim.quit();
        let err = dispatcher
            .await_connection(Duration::from_secs(1), Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, ConnectError::Quit));
    }

    #[test]
    fn quit_fails_waiting_slots() {
        let sim = Arc::new(SimulatedSim::new());
        let dispatcher = dispatcher(&sim);
        dispatcher.pump_once().unwrap();

        let guard = dispatcher.registry().open(RequestId(1), 8).unwrap();
        sim.quit();
        dispatcher.pump_once().unwrap();

        assert!(dispatcher.connection().is_disconnected());
        assert_eq!(
            guard.slot().wait_for(Duration::ZERO),
            crate::pending::WaitOutcome::Failed(SlotFailure::Disconnected)
        );
    }

    #[test]
    fn unclaimed_and_exception_responses_are_counted() {
        let sim = Arc::new(SimulatedSim::new());
        let dispatcher = dispatcher(&sim);
        sim.inject(SourceResponse::Data {
            request_id: RequestId(77),
            definition_id: DefinitionId(1),
            object_id: ObjectId::USER,
            payload: vec![0; 8],
        });
        sim.inject(SourceResponse::Exception {
            code: 3,
            detail: String::from("unrecognized id"),
        });

        assert_eq!(dispatcher.pump_once().unwrap(), 3);
        let stats = dispatcher.stats();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.exceptions, 1);
    }

    #[test]
    fn background_thread_stops_on_request() {
        let sim = Arc::new(SimulatedSim::new());
        let dispatcher = Arc::new(dispatcher(&sim));
        let handle = dispatcher.spawn(Duration::from_millis(1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !dispatcher.connection().is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(dispatcher.connection().is_connected());
        handle.stop();
    }
}
