//! The blocking fetch: one HTTP request, one fetch, one answer.
//!
//! [`Bridge::fetch`] turns the source's callback protocol into a plain
//! function call. It registers a fresh [`PendingFetch`](crate::pending::PendingFetch)
//! slot, issues a one-shot request tagged with the entry's request id, and
//! blocks until the dispatch callback fills the slot or the deadline
//! passes. The formatted payload is returned as a string.
//!
//! # Sync/Async Bridge
//!
//! `fetch` blocks the calling thread. The HTTP layer runs it on Tokio's
//! blocking pool so waiting fetches never stall the async executor.
//!
//! # Dispatch modes
//!
//! - [`DispatchMode::Background`]: the dispatcher thread pumps; the fetch
//!   waits on the slot's condition variable until the deadline.
//! - [`DispatchMode::Inline`]: the fetch pumps the source itself, then
//!   waits for one pump interval, and repeats.
//!
//! Requests for the same entry are serialized by a per-entry gate, so a
//! request id never has two waiters at once.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogEntry, EntryHandle, FormatError};
use crate::config::{DispatchMode, FetchConfig};
use crate::dispatch::{Dispatcher, millis};
use crate::ids::RequestId;
use crate::pending::{InFlight, PendingGuard, SlotFailure, WaitOutcome};
use crate::source::{SourceError, TelemetrySource};

/// Errors returned by a blocking fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// No entry is exposed under this name.
    #[error("no data point named {name}")]
    UnknownEntry {
        /// The requested name.
        name: String,
    },

    /// The handle does not belong to this catalog.
    #[error("no data point at index {index}")]
    UnknownHandle {
        /// The stale index.
        index: usize,
    },

    /// The source has not completed its handshake.
    #[error("telemetry source is not connected")]
    NotConnected,

    /// The source quit.
    #[error("telemetry source disconnected")]
    Disconnected,

    /// No matching response arrived before the deadline.
    #[error("{name} (request {request_id}) timed out after {waited_ms}ms")]
    Timeout {
        /// Data point being fetched.
        name: String,
        /// Tag of the abandoned fetch.
        request_id: RequestId,
        /// How long the fetch waited.
        waited_ms: u64,
    },

    /// The response was shorter than the entry's payload.
    #[error("{name}: response carried {actual} bytes, expected {expected}")]
    ShortPayload {
        /// Data point being fetched.
        name: String,
        /// Bytes the entry declares.
        expected: usize,
        /// Bytes the response carried.
        actual: usize,
    },

    /// The formatter could not render the payload.
    #[error("{name}: {source}")]
    Format {
        /// Data point being fetched.
        name: String,
        /// The formatter's error.
        source: FormatError,
    },

    /// Another fetch holds this request id.
    #[error(transparent)]
    InFlight(#[from] InFlight),

    /// The source rejected the request.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Deadline and pumping behaviour of blocking fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Deadline for a single fetch.
    pub timeout: Duration,
    /// Where the dispatch pump runs.
    pub mode: DispatchMode,
    /// Pause between pumps in inline mode.
    pub pump_interval: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

impl From<&FetchConfig> for FetchOptions {
    fn from(config: &FetchConfig) -> Self {
        Self {
            timeout: config.timeout(),
            mode: config.dispatch,
            pump_interval: config.pump_interval(),
        }
    }
}

/// Serves catalog entries by fetching them from the source on demand.
#[derive(Debug)]
pub struct Bridge<S> {
    catalog: Arc<Catalog>,
    dispatcher: Arc<Dispatcher<S>>,
    gates: Vec<Mutex<()>>,
    options: FetchOptions,
}

impl<S: TelemetrySource> Bridge<S> {
    /// Bind a catalog to a dispatcher.
    pub fn new(catalog: Arc<Catalog>, dispatcher: Arc<Dispatcher<S>>, options: FetchOptions) -> Self {
        let gates = catalog.iter().map(|_| Mutex::new(())).collect();
        Self {
            catalog,
            dispatcher,
            gates,
            options,
        }
    }

    /// The catalog being served.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The dispatcher fetches go through.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    /// Fetch behaviour in effect.
    pub const fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Register the definition of every entry bound to a source variable.
    /// Returns how many definitions were registered.
    ///
    /// # Errors
    ///
    /// Stops at the first definition the source rejects.
    pub fn register_definitions(&self) -> Result<usize, SourceError> {
        let mut registered: usize = 0;
        for (_, entry) in self.catalog.iter() {
            let Some(binding) = entry.binding() else {
                continue;
            };
            self.dispatcher.add_definition(
                entry.definition_id(),
                &binding.field,
                &binding.unit,
                binding.kind,
            )?;
            info!(
                name = entry.name(),
                definition_id = %entry.definition_id(),
                field = %binding.field,
                unit = %binding.unit,
                kind = %binding.kind,
                "Registered definition"
            );
            registered = registered.saturating_add(1);
        }
        Ok(registered)
    }

    /// Fetch the entry exposed under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::UnknownEntry`] for names not in the catalog,
    /// otherwise see [`fetch`](Self::fetch).
    pub fn fetch_by_name(&self, name: &str) -> Result<String, FetchError> {
        let handle = self
            .catalog
            .handle_of(name)
            .ok_or_else(|| FetchError::UnknownEntry {
                name: name.to_owned(),
            })?;
        self.fetch(handle)
    }

    /// Fetch every entry in catalog order.
    pub fn fetch_all(&self) -> Vec<(String, Result<String, FetchError>)> {
        self.catalog
            .iter()
            .map(|(handle, entry)| (entry.name().to_owned(), self.fetch(handle)))
            .collect()
    }

    /// Fetch one entry and return its formatted value.
    ///
    /// Blocks until the matching response arrives or the deadline passes.
    ///
    /// # Errors
    ///
    /// - [`FetchError::NotConnected`] / [`FetchError::Disconnected`] when
    ///   the source is not live.
    /// - [`FetchError::Timeout`] when nothing matching arrives in time.
    /// - [`FetchError::ShortPayload`] / [`FetchError::Format`] when the
    ///   response cannot be rendered.
    /// - [`FetchError::Source`] when the source rejects the request.
    pub fn fetch(&self, handle: EntryHandle) -> Result<String, FetchError> {
        let unknown = || FetchError::UnknownHandle {
            index: handle.index(),
        };
        let entry = self.catalog.get(handle).ok_or_else(unknown)?;
        let gate = self.gates.get(handle.index()).ok_or_else(unknown)?;
        let _serialized = gate.lock().unwrap_or_else(PoisonError::into_inner);

        let started = Instant::now();
        let pending = self
            .dispatcher
            .registry()
            .open(entry.request_id(), entry.payload_size())?;

        // Checked after registering so a concurrent Quit either sees the
        // slot or is seen here.
        let connection = self.dispatcher.connection();
        if connection.is_disconnected() {
            return Err(FetchError::Disconnected);
        }
        if !connection.is_connected() {
            return Err(FetchError::NotConnected);
        }

        self.dispatcher
            .request_once(entry.request_id(), entry.definition_id())?;
        pending.slot().mark_requested();

        let deadline = started
            .checked_add(self.options.timeout)
            .unwrap_or(started);
        let outcome = match self.options.mode {
            DispatchMode::Background => pending.slot().wait_until(deadline),
            DispatchMode::Inline => self.pump_until(&pending, deadline)?,
        };
        drop(pending);

        let waited_ms = millis(started.elapsed());
        match outcome {
            WaitOutcome::Ready(payload) => {
                debug!(name = entry.name(), waited_ms, "Fetch completed");
                entry.format(&payload).map_err(|source| FetchError::Format {
                    name: entry.name().to_owned(),
                    source,
                })
            }
            WaitOutcome::Failed(failure) => Err(Self::failure_error(entry, failure)),
            WaitOutcome::Pending => {
                warn!(
                    name = entry.name(),
                    request_id = %entry.request_id(),
                    waited_ms,
                    "Fetch timed out"
                );
                Err(FetchError::Timeout {
                    name: entry.name().to_owned(),
                    request_id: entry.request_id(),
                    waited_ms,
                })
            }
        }
    }

    fn pump_until(
        &self,
        pending: &PendingGuard,
        deadline: Instant,
    ) -> Result<WaitOutcome, FetchError> {
        loop {
            self.dispatcher.pump_once()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = pending
                .slot()
                .wait_for(self.options.pump_interval.min(remaining));
            if outcome != WaitOutcome::Pending || Instant::now() >= deadline {
                return Ok(outcome);
            }
        }
    }

    fn failure_error(entry: &CatalogEntry, failure: SlotFailure) -> FetchError {
        match failure {
            SlotFailure::ShortPayload { expected, actual } => FetchError::ShortPayload {
                name: entry.name().to_owned(),
                expected,
                actual,
            },
            SlotFailure::Disconnected => FetchError::Disconnected,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use std::thread;

    use super::*;
    use crate::catalog::{CatalogBuilder, FieldBinding, format_hex};
    use crate::config::THROTTLE_FIELD;
    use crate::ids::{DefinitionId, ObjectId};
    use crate::simulated::{SimulatedSim, SimulatedSource};
    use crate::source::{DataKind, SourceResponse};

    fn throttle_catalog() -> Catalog {
        let mut builder = CatalogBuilder::new();
        builder
            .register_field(
                "throttle",
                RequestId(1),
                DefinitionId(1),
                FieldBinding {
                    field: String::from(THROTTLE_FIELD),
                    unit: String::from("percent"),
                    kind: DataKind::Float64,
                },
            )
            .unwrap();
        builder
            .register_field(
                "altitude",
                RequestId(2),
                DefinitionId(2),
                FieldBinding {
                    field: String::from("PLANE ALTITUDE"),
                    unit: String::from("feet"),
                    kind: DataKind::Int32,
                },
            )
            .unwrap();
        builder.build()
    }

    fn options(mode: DispatchMode, timeout_ms: u64) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_millis(timeout_ms),
            mode,
            pump_interval: Duration::from_millis(1),
        }
    }

    /// Connected bridge over a simulated source, pumped inline.
    fn connected_bridge(
        sim: &Arc<SimulatedSim>,
        catalog: Catalog,
        options: FetchOptions,
    ) -> Bridge<SimulatedSource> {
        let source = SimulatedSource::open("test", Arc::clone(sim)).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(source));
        dispatcher
            .await_connection(Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();
        let bridge = Bridge::new(Arc::new(catalog), dispatcher, options);
        bridge.register_definitions().unwrap();
        bridge
    }

    #[test]
    fn throttle_end_to_end() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_value(THROTTLE_FIELD, 42.5);
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 1000));

        assert_eq!(bridge.fetch_by_name("throttle").unwrap(), "42.500000");
        assert_eq!(sim.requests_seen(), 1);
    }

    #[test]
    fn sequential_fetches_do_not_leak_buffers() {
        let sim = Arc::new(SimulatedSim::new());
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 1000));

        let values = [0.0, 12.25, 99.5, -3.0, 100.0];
        let outputs: Vec<String> = values
            .iter()
            .map(|value| {
                sim.set_value(THROTTLE_FIELD, *value);
                bridge.fetch_by_name("throttle").unwrap()
            })
            .collect();

        let expected: Vec<String> = values.iter().map(|v| format!("{v:.6}")).collect();
        assert_eq!(outputs, expected);
        assert!(bridge.dispatcher().registry().is_empty());
    }

    #[test]
    fn foreign_responses_are_ignored() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_value(THROTTLE_FIELD, 7.0);
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 1000));

        for id in [2, 5, 9] {
            sim.inject(SourceResponse::Data {
                request_id: RequestId(id),
                definition_id: DefinitionId(1),
                object_id: ObjectId::USER,
                payload: 1234.0_f64.to_le_bytes().to_vec(),
            });
        }
        assert_eq!(bridge.fetch_by_name("throttle").unwrap(), "7.000000");
        assert_eq!(bridge.dispatcher().stats().discarded, 3);
    }

    #[test]
    fn silent_source_times_out_and_late_answer_is_discarded() {
        let sim = Arc::new(SimulatedSim::new());
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 30));
        sim.set_muted(true);

        let err = bridge.fetch_by_name("throttle").unwrap_err();
        assert!(matches!(err, FetchError::Timeout { request_id: RequestId(1), .. }));

        sim.inject(SourceResponse::Data {
            request_id: RequestId(1),
            definition_id: DefinitionId(1),
            object_id: ObjectId::USER,
            payload: 1.0_f64.to_le_bytes().to_vec(),
        });
        bridge.dispatcher().pump_once().unwrap();
        assert_eq!(bridge.dispatcher().stats().accepted, 0);
        assert_eq!(bridge.dispatcher().stats().discarded, 1);

        sim.set_muted(false);
        sim.set_value(THROTTLE_FIELD, 3.5);
        assert_eq!(bridge.fetch_by_name("throttle").unwrap(), "3.500000");
    }

    #[test]
    fn answer_owed_to_timed_out_fetch_is_not_served_to_the_next() {
        let sim = Arc::new(SimulatedSim::new());
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 100));

        sim.set_value(THROTTLE_FIELD, 1.0);
        sim.set_response_delay(Duration::from_millis(150));
        let first = bridge.fetch_by_name("throttle");
        assert!(matches!(first, Err(FetchError::Timeout { .. })));
        assert_eq!(bridge.dispatcher().registry().stale_count(RequestId(1)), 1);

        // The first answer is still queued ahead of the second request.
        sim.set_value(THROTTLE_FIELD, 2.0);
        sim.set_response_delay(Duration::ZERO);
        assert_eq!(bridge.fetch_by_name("throttle").unwrap(), "2.000000");
        assert_eq!(bridge.dispatcher().registry().stale_count(RequestId(1)), 0);

        let stats = bridge.dispatcher().stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn background_mode_is_woken_by_dispatcher_thread() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_value("PLANE ALTITUDE", 1500.0);
        sim.set_response_delay(Duration::from_millis(10));
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Background, 2000));
        let handle = bridge.dispatcher().spawn(Duration::from_millis(1)).unwrap();

        assert_eq!(bridge.fetch_by_name("altitude").unwrap(), "1500");
        handle.stop();
    }

    #[test]
    fn background_mode_without_pump_times_out() {
        let sim = Arc::new(SimulatedSim::new());
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Background, 20));
        let err = bridge.fetch_by_name("throttle").unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[test]
    fn concurrent_fetches_on_distinct_ids_both_complete() {
        for mode in [DispatchMode::Inline, DispatchMode::Background] {
            let sim = Arc::new(SimulatedSim::new());
            sim.set_value(THROTTLE_FIELD, 55.5);
            sim.set_value("PLANE ALTITUDE", 3000.0);
            sim.set_response_delay(Duration::from_millis(5));
            let bridge = Arc::new(connected_bridge(&sim, throttle_catalog(), options(mode, 2000)));
            let handle = (mode == DispatchMode::Background)
                .then(|| bridge.dispatcher().spawn(Duration::from_millis(1)).unwrap());

            let workers: Vec<_> = ["throttle", "altitude", "throttle", "altitude"]
                .into_iter()
                .map(|name| {
                    let bridge = Arc::clone(&bridge);
                    thread::spawn(move || (name, bridge.fetch_by_name(name).unwrap()))
                })
                .collect();

            for worker in workers {
                let (name, value) = worker.join().unwrap();
                let expected = if name == "throttle" { "55.500000" } else { "3000" };
                assert_eq!(value, expected, "{mode:?}");
            }
            if let Some(handle) = handle {
                handle.stop();
            }
        }
    }

    #[test]
    fn not_connected_before_handshake() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_handshake_delay(Duration::from_secs(60));
        let source = SimulatedSource::open("test", Arc::clone(&sim)).unwrap();
        let bridge = Bridge::new(
            Arc::new(throttle_catalog()),
            Arc::new(Dispatcher::new(source)),
            options(DispatchMode::Inline, 100),
        );
        assert_eq!(bridge.fetch_by_name("throttle"), Err(FetchError::NotConnected));
        assert!(bridge.dispatcher().registry().is_empty());
    }

    #[test]
    fn quit_fails_fetch_fast() {
        let sim = Arc::new(SimulatedSim::new());
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 5000));
        sim.set_muted(true);
        sim.quit();

        let started = Instant::now();
        assert_eq!(bridge.fetch_by_name("throttle"), Err(FetchError::Disconnected));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(bridge.fetch_by_name("throttle"), Err(FetchError::Disconnected));
    }

    #[test]
    fn unknown_names_and_handles() {
        let sim = Arc::new(SimulatedSim::new());
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 100));
        assert!(matches!(
            bridge.fetch_by_name("mixture"),
            Err(FetchError::UnknownEntry { .. })
        ));
    }

    #[test]
    fn short_payload_is_reported() {
        let sim = Arc::new(SimulatedSim::new());
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 1000));
        sim.set_muted(true);

        let injector = {
            let sim = Arc::clone(&sim);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sim.inject(SourceResponse::Data {
                    request_id: RequestId(1),
                    definition_id: DefinitionId(1),
                    object_id: ObjectId::USER,
                    payload: vec![1, 2, 3],
                });
            })
        };
        let err = bridge.fetch_by_name("throttle").unwrap_err();
        injector.join().unwrap();
        assert_eq!(
            err,
            FetchError::ShortPayload {
                name: String::from("throttle"),
                expected: 8,
                actual: 3
            }
        );
    }

    #[test]
    fn zero_and_maximum_payload_sizes_round_trip() {
        use crate::catalog::MAX_PAYLOAD_SIZE;

        let mut builder = CatalogBuilder::new();
        builder
            .register("empty", RequestId(10), DefinitionId(10), 0, Arc::new(format_hex))
            .unwrap();
        builder
            .register(
                "blob",
                RequestId(11),
                DefinitionId(11),
                MAX_PAYLOAD_SIZE,
                Arc::new(format_hex),
            )
            .unwrap();

        let sim = Arc::new(SimulatedSim::new());
        let source = SimulatedSource::open("test", Arc::clone(&sim)).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(source));
        dispatcher
            .await_connection(Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();
        // Definitions for raw entries are registered by the caller.
        dispatcher
            .add_definition(DefinitionId(10), "NOTHING", "number", DataKind::Int32)
            .unwrap();
        dispatcher
            .add_definition(DefinitionId(11), "BLOB", "number", DataKind::Int32)
            .unwrap();
        let bridge = Bridge::new(
            Arc::new(builder.build()),
            dispatcher,
            options(DispatchMode::Inline, 1000),
        );

        // The simulated answer to definition 10 is 4 bytes; only 0 are kept.
        assert_eq!(bridge.fetch_by_name("empty").unwrap(), "");

        // Answer the blob by hand with one extra trailing byte.
        sim.set_muted(true);
        let mut blob: Vec<u8> = (0..MAX_PAYLOAD_SIZE)
            .map(|i| u8::try_from(i % 251).unwrap())
            .collect();
        let expected = format_hex(&blob).unwrap();
        blob.push(0xFF);
        let injector = {
            let sim = Arc::clone(&sim);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sim.inject(SourceResponse::Data {
                    request_id: RequestId(11),
                    definition_id: DefinitionId(11),
                    object_id: ObjectId::USER,
                    payload: blob,
                });
            })
        };
        let rendered = bridge.fetch_by_name("blob").unwrap();
        injector.join().unwrap();
        assert_eq!(rendered.len(), MAX_PAYLOAD_SIZE * 2);
        assert_eq!(rendered, expected);
    }

    #[test]
    fn fetch_all_reports_each_entry() {
        let sim = Arc::new(SimulatedSim::new());
        sim.set_value(THROTTLE_FIELD, 1.0);
        sim.set_value("PLANE ALTITUDE", 2.0);
        let bridge = connected_bridge(&sim, throttle_catalog(), options(DispatchMode::Inline, 1000));

        let all = bridge.fetch_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], (String::from("throttle"), Ok(String::from("1.000000"))));
        assert_eq!(all[1], (String::from("altitude"), Ok(String::from("2"))));
    }

    #[test]
    fn rejected_definition_fails_registration() {
        let sim = Arc::new(SimulatedSim::new());
        sim.reject_definition(DefinitionId(2));
        let source = SimulatedSource::open("test", Arc::clone(&sim)).unwrap();
        let bridge = Bridge::new(
            Arc::new(throttle_catalog()),
            Arc::new(Dispatcher::new(source)),
            options(DispatchMode::Inline, 100),
        );
        assert!(matches!(
            bridge.register_definitions(),
            Err(SourceError::Definition { definition_id: DefinitionId(2), .. })
        ));
    }
}
