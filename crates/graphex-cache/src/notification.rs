use crate::error::CacheError;

/// One discrete point in a producer run's lifecycle.
///
/// A run emits any number of `Value`s and at most one terminal `Error`.
/// A fresh `Loading` is only ever broadcast when a new run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<S> {
    /// A producer run has started and has not produced state yet.
    Loading,
    /// The accumulated state after folding in the run's latest output.
    Value(S),
    /// The run failed. Terminal until a new subscription restarts the producer.
    Error(CacheError),
}

impl<S> Notification<S> {
    /// Returns the contained state, if any.
    pub fn value(self) -> Option<S> {
        match self {
            Notification::Value(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Notification::Loading)
    }
}
