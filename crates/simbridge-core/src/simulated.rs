//! In-process simulated telemetry source.
//!
//! [`SimulatedSim`] plays the running simulation: it holds variable values
//! and a few knobs for latency and misbehaviour. [`SimulatedSource`] is a
//! connection to it that behaves like the real SDK. Fetches are answered
//! asynchronously: a request only queues a response, which is handed out by
//! a later [`pump_dispatch`](TelemetrySource::pump_dispatch) once its
//! simulated latency has elapsed. Like the real SDK, the connection answers
//! in request order.
//!
//! The binary serves from it when no real simulator is attached, and the
//! tests use it to script interleavings.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng as _;

use crate::config::SimulatedConfig;
use crate::ids::{DefinitionId, ObjectId, RequestId};
use crate::source::{DataKind, SourceError, SourceResponse, TelemetrySource};

/// Name the simulator reports in its handshake.
pub const SIMULATOR_NAME: &str = "SimBridge Simulator";

#[derive(Debug, Default)]
struct SimState {
    values: BTreeMap<String, f64>,
    handshake_delay: Duration,
    response_delay: Duration,
    response_jitter: Duration,
    muted: bool,
    refuse_connections: bool,
    rejected_definitions: BTreeSet<DefinitionId>,
    injected: VecDeque<SourceResponse>,
    requests_seen: u64,
}

/// Shared control handle for the simulated simulation.
#[derive(Debug, Default)]
pub struct SimulatedSim {
    state: Mutex<SimState>,
}

impl SimulatedSim {
    /// A simulation with no variables set. Unknown variables read as zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A simulation configured from the `source.simulated` config section.
    pub fn from_config(config: &SimulatedConfig) -> Self {
        let sim = Self::new();
        {
            let mut state = sim.lock();
            state.values.clone_from(&config.values);
            state.handshake_delay = Duration::from_millis(config.handshake_delay_ms);
            state.response_delay = Duration::from_millis(config.response_delay_ms);
            state.response_jitter = Duration::from_millis(config.response_jitter_ms);
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a simulation variable.
    pub fn set_value(&self, field: &str, value: f64) {
        self.lock().values.insert(field.to_owned(), value);
    }

    /// Current value of a simulation variable.
    pub fn value(&self, field: &str) -> Option<f64> {
        self.lock().values.get(field).copied()
    }

    /// Delay before the handshake response of new connections is ready.
    pub fn set_handshake_delay(&self, delay: Duration) {
        self.lock().handshake_delay = delay;
    }

    /// Delay before a fetch's response is ready.
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    /// When muted, fetches are accepted but never answered.
    pub fn set_muted(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// Make new connections fail to open.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Make the source reject registration of `definition_id`.
    pub fn reject_definition(&self, definition_id: DefinitionId) {
        self.lock().rejected_definitions.insert(definition_id);
    }

    /// Queue an arbitrary response for the next pump.
    pub fn inject(&self, response: SourceResponse) {
        self.lock().injected.push_back(response);
    }

    /// Queue a `Quit` for the next pump.
    pub fn quit(&self) {
        self.inject(SourceResponse::Quit);
    }

    /// Number of fetches issued against this simulation.
    pub fn requests_seen(&self) -> u64 {
        self.lock().requests_seen
    }
}

#[derive(Debug, Clone)]
struct Definition {
    field: String,
    kind: DataKind,
}

/// A connection to a [`SimulatedSim`].
#[derive(Debug)]
pub struct SimulatedSource {
    sim: Arc<SimulatedSim>,
    app_name: String,
    definitions: BTreeMap<DefinitionId, Vec<Definition>>,
    scheduled: VecDeque<(Instant, SourceResponse)>,
    closed: bool,
}

impl SimulatedSource {
    /// Open a connection on behalf of `app_name`. The handshake response is
    /// queued immediately and becomes ready after the handshake delay.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Open`] if the simulation refuses connections.
    pub fn open(app_name: &str, sim: Arc<SimulatedSim>) -> Result<Self, SourceError> {
        let handshake_delay = {
            let state = sim.lock();
            if state.refuse_connections {
                return Err(SourceError::Open {
                    message: format!("simulator refused connection from {app_name}"),
                });
            }
            state.handshake_delay
        };

        let mut scheduled = VecDeque::new();
        scheduled.push_back((
            ready_at(handshake_delay),
            SourceResponse::Open {
                application: String::from(SIMULATOR_NAME),
            },
        ));

        tracing::debug!(app_name, "Opened simulated source connection");
        Ok(Self {
            sim,
            app_name: app_name.to_owned(),
            definitions: BTreeMap::new(),
            scheduled,
            closed: false,
        })
    }

    /// Name this connection was opened with.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    const fn ensure_open(&self) -> Result<(), SourceError> {
        if self.closed {
            Err(SourceError::Closed)
        } else {
            Ok(())
        }
    }
}

fn ready_at(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or(now)
}

impl TelemetrySource for SimulatedSource {
    fn add_definition(
        &mut self,
        definition_id: DefinitionId,
        field: &str,
        unit: &str,
        kind: DataKind,
    ) -> Result<(), SourceError> {
        self.ensure_open()?;
        if self.sim.lock().rejected_definitions.contains(&definition_id) {
            return Err(SourceError::Definition {
                definition_id,
                reason: format!("simulator rejected {field} ({unit})"),
            });
        }
        self.definitions
            .entry(definition_id)
            .or_default()
            .push(Definition {
                field: field.to_owned(),
                kind,
            });
        Ok(())
    }

    fn request_once(
        &mut self,
        request_id: RequestId,
        definition_id: DefinitionId,
        object_id: ObjectId,
    ) -> Result<(), SourceError> {
        self.ensure_open()?;
        let Some(fields) = self.definitions.get(&definition_id) else {
            return Err(SourceError::Request {
                request_id,
                reason: format!("definition {definition_id} is not registered"),
            });
        };

        let mut state = self.sim.lock();
        state.requests_seen = state.requests_seen.saturating_add(1);
        if state.muted {
            return Ok(());
        }

        let payload: Vec<u8> = fields
            .iter()
            .flat_map(|def| {
                let value = state.values.get(&def.field).copied().unwrap_or_default();
                def.kind.encode(value)
            })
            .collect();

        let mut delay = state.response_delay;
        let jitter_ms = u64::try_from(state.response_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms > 0 {
            let jitter = rand::rng().random_range(0..=jitter_ms);
            delay = delay.saturating_add(Duration::from_millis(jitter));
        }
        drop(state);

        // Answers leave in request order, whatever their individual delay.
        let ready = ready_at(delay);
        let ready = self
            .scheduled
            .back()
            .map_or(ready, |(previous, _)| ready.max(*previous));
        self.scheduled.push_back((
            ready,
            SourceResponse::Data {
                request_id,
                definition_id,
                object_id,
                payload,
            },
        ));
        Ok(())
    }

    fn pump_dispatch(
        &mut self,
        on_response: &mut dyn FnMut(SourceResponse),
    ) -> Result<usize, SourceError> {
        self.ensure_open()?;
        let injected: Vec<SourceResponse> = self.sim.lock().injected.drain(..).collect();
        let mut delivered = injected.len();
        for response in injected {
            on_response(response);
        }

        let now = Instant::now();
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = self
            .scheduled
            .drain(..)
            .partition(|(at, _)| *at <= now);
        self.scheduled = waiting;

        for (_, response) in ready {
            on_response(response);
            delivered = delivered.saturating_add(1);
        }
        Ok(delivered)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.ensure_open()?;
        self.closed = true;
        self.scheduled.clear();
        tracing::debug!(app_name = %self.app_name, "Closed simulated source connection");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pump_all(source: &mut SimulatedSource) -> Vec<SourceResponse> {
        let mut out = Vec::new();
        source.pump_dispatch(&mut |r: SourceResponse| out.push(r)).unwrap();
        out
    }

    #[test]
    fn handshake_is_first_response() {
        let sim = Arc::new(SimulatedSim::new());
        let mut source = SimulatedSource::open("test", sim).unwrap();
        assert_eq!(
            pump_all(&mut source),
            vec![SourceResponse::Open {
                application: String::from(SIMULATOR_NAME)
            }]
        );
        assert!(pump_all(&mut source).is_empty());
    }

    #[test]
    fn request_is_answered_on_a_later_pump() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_value("THROTTLE", 42.5);
        let mut source = SimulatedSource::open("test", Arc::clone(&sim)).unwrap();
        pump_all(&mut source);

        source
            .add_definition(DefinitionId(1), "THROTTLE", "percent", DataKind::Float64)
            .unwrap();
        source
            .request_once(RequestId(1), DefinitionId(1), ObjectId::USER)
            .unwrap();

        let responses = pump_all(&mut source);
        assert_eq!(
            responses,
            vec![SourceResponse::Data {
                request_id: RequestId(1),
                definition_id: DefinitionId(1),
                object_id: ObjectId::USER,
                payload: 42.5_f64.to_le_bytes().to_vec(),
            }]
        );
        assert_eq!(sim.requests_seen(), 1);
    }

    #[test]
    fn delayed_responses_wait_their_turn() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_response_delay(Duration::from_secs(60));
        let mut source = SimulatedSource::open("test", Arc::clone(&sim)).unwrap();
        source
            .add_definition(DefinitionId(1), "X", "number", DataKind::Int32)
            .unwrap();
        source
            .request_once(RequestId(1), DefinitionId(1), ObjectId::USER)
            .unwrap();
        let responses = pump_all(&mut source);
        assert_eq!(responses.len(), 1, "only the handshake is ready");
    }

    #[test]
    fn answers_keep_request_order() {
        let sim = Arc::new(SimulatedSim::new());
        let mut source = SimulatedSource::open("test", Arc::clone(&sim)).unwrap();
        pump_all(&mut source);
        source
            .add_definition(DefinitionId(1), "X", "number", DataKind::Int32)
            .unwrap();

        sim.set_response_delay(Duration::from_millis(30));
        source
            .request_once(RequestId(1), DefinitionId(1), ObjectId::USER)
            .unwrap();
        sim.set_response_delay(Duration::ZERO);
        source
            .request_once(RequestId(2), DefinitionId(1), ObjectId::USER)
            .unwrap();

        assert!(pump_all(&mut source).is_empty(), "second answer waits for the first");
        std::thread::sleep(Duration::from_millis(40));
        let ids: Vec<RequestId> = pump_all(&mut source)
            .into_iter()
            .filter_map(|response| match response {
                SourceResponse::Data { request_id, .. } => Some(request_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![RequestId(1), RequestId(2)]);
    }

    #[test]
    fn unknown_definition_is_rejected() {
        let sim = Arc::new(SimulatedSim::new());
        let mut source = SimulatedSource::open("test", sim).unwrap();
        let err = source
            .request_once(RequestId(1), DefinitionId(9), ObjectId::USER)
            .unwrap_err();
        assert!(matches!(err, SourceError::Request { .. }));
    }

    #[test]
    fn rejected_definition_fails_registration() {
        let sim = Arc::new(SimulatedSim::new());
        sim.reject_definition(DefinitionId(2));
        let mut source = SimulatedSource::open("test", Arc::clone(&sim)).unwrap();
        assert!(
            source
                .add_definition(DefinitionId(1), "A", "number", DataKind::Float64)
                .is_ok()
        );
        assert!(matches!(
            source.add_definition(DefinitionId(2), "B", "number", DataKind::Float64),
            Err(SourceError::Definition { .. })
        ));
    }

    #[test]
    fn refused_connection_fails_open() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_refuse_connections(true);
        assert!(matches!(
            SimulatedSource::open("test", sim),
            Err(SourceError::Open { .. })
        ));
    }

    #[test]
    fn closed_source_refuses_calls() {
        let sim = Arc::new(SimulatedSim::new());
        let mut source = SimulatedSource::open("test", sim).unwrap();
        source.close().unwrap();
        assert_eq!(
            source.pump_dispatch(&mut |_: SourceResponse| {}),
            Err(SourceError::Closed)
        );
        assert_eq!(source.close(), Err(SourceError::Closed));
    }
}
