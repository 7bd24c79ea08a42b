use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed job description, 1:1 with a work unit.
///
/// Every payload type is a plain Rust struct/enum, not a subclass of
/// anything — dispatch from `PAYLOAD_TYPE` to the right handler happens
/// through the [`crate::handler::CommandRegistry`], not inheritance.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The tag stored alongside the serialized payload and used to pick the
    /// handler. Must be stable: it is persisted.
    const PAYLOAD_TYPE: &'static str;

    /// Human-readable summary, stored as `work_units.description` and fed
    /// into the search index.
    fn description(&self) -> String;

    /// Strings to index for search. Defaults to just `description()`;
    /// override to add more.
    fn search_terms(&self) -> Vec<String> {
        vec![self.description()]
    }
}
