//! Catalog of servable data points.
//!
//! Each [`CatalogEntry`] binds an HTTP-exposed name to the request id and
//! definition id it uses in the source's namespace, the size of its raw
//! payload, and the [`Formatter`] that renders that payload as text.
//!
//! The catalog is assembled once at startup through [`CatalogBuilder`] and
//! frozen into an immutable [`Catalog`]. Registration enforces that names,
//! request ids, and definition ids are unique: two entries sharing a request
//! id would let one entry's response satisfy the other's fetch.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::DataPointConfig;
use crate::ids::{DefinitionId, RequestId};
use crate::source::DataKind;

/// Largest payload a single entry may declare.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Renders a raw payload as display text.
///
/// The slice passed in is always exactly the entry's declared payload size.
pub type Formatter = Arc<dyn Fn(&[u8]) -> Result<String, FormatError> + Send + Sync>;

/// Errors produced while decoding a payload for display.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The payload does not have the length the layout requires.
    #[error("expected {expected} bytes, got {actual}")]
    WrongLength {
        /// Bytes the layout needs.
        expected: usize,
        /// Bytes that were supplied.
        actual: usize,
    },
}

/// Errors raised while building the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Another entry already uses this name.
    #[error("duplicate data point name: {name}")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// Another entry already uses this request id.
    #[error("request id {request_id} of {name} is already used by {existing}")]
    DuplicateRequestId {
        /// The repeated request id.
        request_id: RequestId,
        /// Entry being registered.
        name: String,
        /// Entry that registered the id first.
        existing: String,
    },

    /// Another entry already uses this definition id.
    ///
    /// Each entry decodes the whole payload of its definition, so two entries
    /// on one definition would both read the first field.
    #[error("definition id {definition_id} of {name} is already used by {existing}")]
    DuplicateDefinitionId {
        /// The repeated definition id.
        definition_id: DefinitionId,
        /// Entry being registered.
        name: String,
        /// Entry that registered the id first.
        existing: String,
    },

    /// The name cannot be used as a path segment.
    #[error("invalid data point name {name:?}: use letters, digits, '_', '-' or '.'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The declared payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {name} is {size} bytes, limit is {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge {
        /// Entry being registered.
        name: String,
        /// Declared size.
        size: usize,
    },
}

/// Stable position of an entry inside its catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryHandle(usize);

impl EntryHandle {
    /// Position of the entry in registration order.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// The source-side variable an entry reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBinding {
    /// Simulation variable name, e.g. `GENERAL ENG THROTTLE LEVER POSITION:1`.
    pub field: String,
    /// Unit the source converts the variable to.
    pub unit: String,
    /// Encoding of the value.
    pub kind: DataKind,
}

/// One servable data point.
#[derive(Clone)]
pub struct CatalogEntry {
    name: String,
    request_id: RequestId,
    definition_id: DefinitionId,
    payload_size: usize,
    formatter: Formatter,
    binding: Option<FieldBinding>,
}

impl CatalogEntry {
    /// Name exposed over HTTP.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag used for this entry's fetches.
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Layout the source decodes this entry with.
    pub const fn definition_id(&self) -> DefinitionId {
        self.definition_id
    }

    /// Bytes copied out of each response.
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Source variable bound to the definition, if the catalog registers it.
    pub const fn binding(&self) -> Option<&FieldBinding> {
        self.binding.as_ref()
    }

    /// Render a payload of [`payload_size`](Self::payload_size) bytes.
    pub fn format(&self, payload: &[u8]) -> Result<String, FormatError> {
        (self.formatter)(payload)
    }
}

impl core::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("name", &self.name)
            .field("request_id", &self.request_id)
            .field("definition_id", &self.definition_id)
            .field("payload_size", &self.payload_size)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Append-only builder for a [`Catalog`].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entries: Vec<CatalogEntry>,
    by_name: BTreeMap<String, EntryHandle>,
    by_request: BTreeMap<RequestId, EntryHandle>,
    by_definition: BTreeMap<DefinitionId, EntryHandle>,
}

impl CatalogBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data point whose definition the caller registers with the
    /// source itself.
    ///
    /// # Errors
    ///
    /// Fails when the name is not path-safe, when the name or request id is
    /// already taken, or when `payload_size` exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn register(
        &mut self,
        name: &str,
        request_id: RequestId,
        definition_id: DefinitionId,
        payload_size: usize,
        formatter: Formatter,
    ) -> Result<EntryHandle, CatalogError> {
        self.insert(CatalogEntry {
            name: name.to_owned(),
            request_id,
            definition_id,
            payload_size,
            formatter,
            binding: None,
        })
    }

    /// Register a data point bound to a source variable. The payload size
    /// and formatter follow from the binding's [`DataKind`].
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn register_field(
        &mut self,
        name: &str,
        request_id: RequestId,
        definition_id: DefinitionId,
        binding: FieldBinding,
    ) -> Result<EntryHandle, CatalogError> {
        self.insert(CatalogEntry {
            name: name.to_owned(),
            request_id,
            definition_id,
            payload_size: binding.kind.size(),
            formatter: standard_formatter(binding.kind),
            binding: Some(binding),
        })
    }

    fn insert(&mut self, entry: CatalogEntry) -> Result<EntryHandle, CatalogError> {
        if !is_path_safe(&entry.name) {
            return Err(CatalogError::InvalidName { name: entry.name });
        }
        if entry.payload_size > MAX_PAYLOAD_SIZE {
            return Err(CatalogError::PayloadTooLarge {
                name: entry.name,
                size: entry.payload_size,
            });
        }
        if self.by_name.contains_key(&entry.name) {
            return Err(CatalogError::DuplicateName { name: entry.name });
        }
        if let Some(existing) = self
            .by_request
            .get(&entry.request_id)
            .and_then(|handle| self.entries.get(handle.0))
        {
            return Err(CatalogError::DuplicateRequestId {
                request_id: entry.request_id,
                name: entry.name,
                existing: existing.name.clone(),
            });
        }
        if let Some(existing) = self
            .by_definition
            .get(&entry.definition_id)
            .and_then(|handle| self.entries.get(handle.0))
        {
            return Err(CatalogError::DuplicateDefinitionId {
                definition_id: entry.definition_id,
                name: entry.name,
                existing: existing.name.clone(),
            });
        }

        let handle = EntryHandle(self.entries.len());
        self.by_name.insert(entry.name.clone(), handle);
        self.by_request.insert(entry.request_id, handle);
        self.by_definition.insert(entry.definition_id, handle);
        tracing::debug!(
            name = %entry.name,
            request_id = %entry.request_id,
            definition_id = %entry.definition_id,
            payload_size = entry.payload_size,
            "Registered data point"
        );
        self.entries.push(entry);
        Ok(handle)
    }

    /// Freeze the builder.
    pub fn build(self) -> Catalog {
        Catalog {
            entries: self.entries,
            by_name: self.by_name,
        }
    }
}

/// Immutable table of servable data points.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_name: BTreeMap<String, EntryHandle>,
}

impl Catalog {
    /// Build a catalog from configured data points, in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`CatalogError`] raised by registration.
    pub fn from_config(points: &[DataPointConfig]) -> Result<Self, CatalogError> {
        let mut builder = CatalogBuilder::new();
        for point in points {
            builder.register_field(
                &point.name,
                point.request_id,
                point.definition_id,
                FieldBinding {
                    field: point.field.clone(),
                    unit: point.unit.clone(),
                    kind: point.kind,
                },
            )?;
        }
        Ok(builder.build())
    }

    /// Find an entry by its exposed name.
    pub fn lookup(&self, name: &str) -> Option<&CatalogEntry> {
        self.handle_of(name).and_then(|handle| self.get(handle))
    }

    /// Handle of the entry exposed under `name`.
    pub fn handle_of(&self, name: &str) -> Option<EntryHandle> {
        self.by_name.get(name).copied()
    }

    /// Entry behind a handle.
    pub fn get(&self, handle: EntryHandle) -> Option<&CatalogEntry> {
        self.entries.get(handle.0)
    }

    /// All entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryHandle, &CatalogEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (EntryHandle(index), entry))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_path_safe(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

// ---------------------------------------------------------------------------
// Formatters
// ---------------------------------------------------------------------------

/// Formatter matching a [`DataKind`].
pub fn standard_formatter(kind: DataKind) -> Formatter {
    match kind {
        DataKind::Float64 => Arc::new(format_float64),
        DataKind::Float32 => Arc::new(format_float32),
        DataKind::Int32 => Arc::new(format_int32),
        DataKind::Int64 => Arc::new(format_int64),
        DataKind::Bool => Arc::new(format_bool),
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N], FormatError> {
    let Ok(bytes) = <[u8; N]>::try_from(payload) else {
        return Err(FormatError::WrongLength {
            expected: N,
            actual: payload.len(),
        });
    };
    Ok(bytes)
}

/// Decimal rendering of a little-endian `f64` with six fractional digits.
pub fn format_float64(payload: &[u8]) -> Result<String, FormatError> {
    let value = f64::from_le_bytes(fixed(payload)?);
    Ok(format!("{value:.6}"))
}

/// Decimal rendering of a little-endian `f32` with six fractional digits.
pub fn format_float32(payload: &[u8]) -> Result<String, FormatError> {
    let value = f32::from_le_bytes(fixed(payload)?);
    Ok(format!("{value:.6}"))
}

/// Decimal rendering of a little-endian `i32`.
pub fn format_int32(payload: &[u8]) -> Result<String, FormatError> {
    Ok(i32::from_le_bytes(fixed(payload)?).to_string())
}

/// Decimal rendering of a little-endian `i64`.
pub fn format_int64(payload: &[u8]) -> Result<String, FormatError> {
    Ok(i64::from_le_bytes(fixed(payload)?).to_string())
}

/// `true` for any non-zero 32-bit value, `false` otherwise.
pub fn format_bool(payload: &[u8]) -> Result<String, FormatError> {
    let raw = i32::from_le_bytes(fixed(payload)?);
    Ok((raw != 0).to_string())
}

/// Lowercase hex of the whole payload. Accepts any length, including zero.
pub fn format_hex(payload: &[u8]) -> Result<String, FormatError> {
    use core::fmt::Write as _;

    let mut out = String::with_capacity(payload.len().saturating_mul(2));
    for byte in payload {
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn throttle_binding() -> FieldBinding {
        FieldBinding {
            field: String::from("GENERAL ENG THROTTLE LEVER POSITION:1"),
            unit: String::from("percent"),
            kind: DataKind::Float64,
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut builder = CatalogBuilder::new();
        let handle = builder
            .register_field("throttle", RequestId(1), DefinitionId(1), throttle_binding())
            .unwrap();
        let catalog = builder.build();

        assert_eq!(handle.index(), 0);
        let entry = catalog.lookup("throttle").unwrap();
        assert_eq!(entry.request_id(), RequestId(1));
        assert_eq!(entry.payload_size(), 8);
        assert_eq!(catalog.handle_of("throttle"), Some(handle));
        assert!(catalog.lookup("mixture").is_none());
    }

    #[test]
    fn handles_survive_later_registrations() {
        let mut builder = CatalogBuilder::new();
        let first = builder
            .register("a", RequestId(1), DefinitionId(1), 4, Arc::new(format_int32))
            .unwrap();
        for id in 2..20 {
            builder
                .register(
                    &format!("p{id}"),
                    RequestId(id),
                    DefinitionId(id),
                    4,
                    Arc::new(format_int32),
                )
                .unwrap();
        }
        let catalog = builder.build();
        assert_eq!(catalog.get(first).unwrap().name(), "a");
        assert_eq!(catalog.len(), 19);
    }

    #[test]
    fn duplicate_request_id_is_rejected() {
        let mut builder = CatalogBuilder::new();
        builder
            .register_field("throttle", RequestId(1), DefinitionId(1), throttle_binding())
            .unwrap();
        let err = builder
            .register("mixture", RequestId(1), DefinitionId(2), 4, Arc::new(format_int32))
            .unwrap_err();
        assert_eq!(
            err,
            CatalogError::DuplicateRequestId {
                request_id: RequestId(1),
                name: String::from("mixture"),
                existing: String::from("throttle"),
            }
        );
        // The rejected entry must not be reachable.
        assert!(builder.build().lookup("mixture").is_none());
    }

    #[test]
    fn shared_definition_id_is_rejected() {
        let points = vec![
            DataPointConfig {
                name: String::from("throttle"),
                request_id: RequestId(1),
                definition_id: DefinitionId(1),
                field: String::from(crate::config::THROTTLE_FIELD),
                unit: String::from("percent"),
                kind: DataKind::Float64,
            },
            DataPointConfig {
                name: String::from("altitude"),
                request_id: RequestId(2),
                definition_id: DefinitionId(1),
                field: String::from("PLANE ALTITUDE"),
                unit: String::from("feet"),
                kind: DataKind::Int32,
            },
        ];
        assert_eq!(
            Catalog::from_config(&points).unwrap_err(),
            CatalogError::DuplicateDefinitionId {
                definition_id: DefinitionId(1),
                name: String::from("altitude"),
                existing: String::from("throttle"),
            }
        );
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut builder = CatalogBuilder::new();
        builder
            .register("throttle", RequestId(1), DefinitionId(1), 8, Arc::new(format_float64))
            .unwrap();
        let err = builder
            .register("throttle", RequestId(2), DefinitionId(2), 8, Arc::new(format_float64))
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateName { .. }));
    }

    #[test]
    fn names_must_be_path_safe() {
        let mut builder = CatalogBuilder::new();
        for bad in ["", "a/b", "with space", "../up", ".."] {
            let err = builder
                .register(bad, RequestId(9), DefinitionId(9), 0, Arc::new(format_hex))
                .unwrap_err();
            assert!(matches!(err, CatalogError::InvalidName { .. }), "{bad:?}");
        }
        assert!(
            builder
                .register("flaps.index-1_b", RequestId(9), DefinitionId(9), 0, Arc::new(format_hex))
                .is_ok()
        );
    }

    #[test]
    fn payload_limit_is_enforced() {
        let mut builder = CatalogBuilder::new();
        assert!(
            builder
                .register("max", RequestId(1), DefinitionId(1), MAX_PAYLOAD_SIZE, Arc::new(format_hex))
                .is_ok()
        );
        let err = builder
            .register(
                "over",
                RequestId(2),
                DefinitionId(2),
                MAX_PAYLOAD_SIZE.saturating_add(1),
                Arc::new(format_hex),
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::PayloadTooLarge { .. }));
    }

    #[test]
    fn float64_renders_six_decimals() {
        assert_eq!(format_float64(&42.5_f64.to_le_bytes()).unwrap(), "42.500000");
        assert_eq!(format_float64(&(-0.25_f64).to_le_bytes()).unwrap(), "-0.250000");
    }

    #[test]
    fn formatters_reject_wrong_length() {
        assert_eq!(
            format_float64(&[0; 4]).unwrap_err(),
            FormatError::WrongLength { expected: 8, actual: 4 }
        );
        assert!(format_int32(&[0; 8]).is_err());
    }

    #[test]
    fn integer_and_bool_formatters() {
        assert_eq!(format_int32(&(-7_i32).to_le_bytes()).unwrap(), "-7");
        assert_eq!(format_int64(&9_000_000_000_i64.to_le_bytes()).unwrap(), "9000000000");
        assert_eq!(format_bool(&1_i32.to_le_bytes()).unwrap(), "true");
        assert_eq!(format_bool(&0_i32.to_le_bytes()).unwrap(), "false");
    }

    #[test]
    fn hex_handles_empty_payload() {
        assert_eq!(format_hex(&[]).unwrap(), "");
        assert_eq!(format_hex(&[0xde, 0xad, 0x01]).unwrap(), "dead01");
    }

    #[test]
    fn from_config_uses_kind_layout() {
        let points = vec![DataPointConfig {
            name: String::from("altitude"),
            request_id: RequestId(3),
            definition_id: DefinitionId(3),
            field: String::from("PLANE ALTITUDE"),
            unit: String::from("feet"),
            kind: DataKind::Int32,
        }];
        let catalog = Catalog::from_config(&points).unwrap();
        let entry = catalog.lookup("altitude").unwrap();
        assert_eq!(entry.payload_size(), 4);
        assert_eq!(entry.format(&1200_i32.to_le_bytes()).unwrap(), "1200");
        assert_eq!(entry.binding().unwrap().unit, "feet");
    }
}
