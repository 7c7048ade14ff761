use std::collections::HashMap;
use std::sync::Arc;

use ccproxy_protocol::Dialect;
use serde_json::Value;

use crate::adapter::{FormatAdapter, FormatError, FormatResult, Stage};
use crate::stream::StreamConverter;

type StreamFactory = Arc<dyn Fn() -> Box<dyn StreamConverter> + Send + Sync>;

/// Mapping `(from, to) -> adapter`, plus optional streaming converter
/// factories per direction.
#[derive(Default)]
pub struct FormatRegistry {
    adapters: HashMap<(Dialect, Dialect), Arc<dyn FormatAdapter>>,
    stream_factories: HashMap<(Dialect, Dialect), StreamFactory>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, from: Dialect, to: Dialect, adapter: Arc<dyn FormatAdapter>) {
        self.adapters.insert((from, to), adapter);
    }

    pub fn register_stream<F>(&mut self, from: Dialect, to: Dialect, factory: F)
    where
        F: Fn() -> Box<dyn StreamConverter> + Send + Sync + 'static,
    {
        self.stream_factories.insert((from, to), Arc::new(factory));
    }

    pub fn get(&self, from: Dialect, to: Dialect) -> FormatResult<Arc<dyn FormatAdapter>> {
        self.adapters
            .get(&(from, to))
            .cloned()
            .ok_or(FormatError::AdapterMissing { from, to })
    }

    pub fn get_if_exists(&self, from: Dialect, to: Dialect) -> Option<Arc<dyn FormatAdapter>> {
        self.adapters.get(&(from, to)).cloned()
    }

    /// Stateful stream converter for one upstream call, or `None` when the
    /// direction has no streaming adapter (caller passes frames through).
    pub fn stream_converter(&self, from: Dialect, to: Dialect) -> Option<Box<dyn StreamConverter>> {
        self.stream_factories.get(&(from, to)).map(|f| f())
    }

    /// Walk a chain for one stage. Request stage goes left to right;
    /// response and error stages go right to left with the per-step
    /// direction reversed.
    pub fn apply_chain(
        &self,
        chain: &[Dialect],
        stage: Stage,
        payload: &Value,
    ) -> FormatResult<Value> {
        let mut current = payload.clone();
        for (from, to) in chain_pairs(chain, stage) {
            let adapter = self.get(from, to)?;
            current = adapter.convert(stage, &current)?;
        }
        Ok(current)
    }

    /// A single synthetic adapter equivalent to the whole chain.
    pub fn compose_from_chain(self: &Arc<Self>, chain: Vec<Dialect>) -> ComposedAdapter {
        ComposedAdapter {
            registry: Arc::clone(self),
            chain,
        }
    }
}

/// Ordered adapter lookups for one stage of a chain.
pub fn chain_pairs(chain: &[Dialect], stage: Stage) -> Vec<(Dialect, Dialect)> {
    if chain.len() < 2 {
        return Vec::new();
    }
    match stage {
        Stage::Request => chain.windows(2).map(|w| (w[0], w[1])).collect(),
        Stage::Response | Stage::Error => {
            let mut pairs: Vec<(Dialect, Dialect)> =
                chain.windows(2).map(|w| (w[1], w[0])).collect();
            pairs.reverse();
            pairs
        }
    }
}

/// Synthetic adapter produced by `compose_from_chain`.
pub struct ComposedAdapter {
    registry: Arc<FormatRegistry>,
    chain: Vec<Dialect>,
}

impl ComposedAdapter {
    pub fn chain(&self) -> &[Dialect] {
        &self.chain
    }
}

impl FormatAdapter for ComposedAdapter {
    fn convert_request(&self, payload: &Value) -> FormatResult<Value> {
        self.registry.apply_chain(&self.chain, Stage::Request, payload)
    }

    fn convert_response(&self, payload: &Value) -> FormatResult<Value> {
        self.registry.apply_chain(&self.chain, Stage::Response, payload)
    }

    fn convert_error(&self, payload: &Value) -> FormatResult<Value> {
        self.registry.apply_chain(&self.chain, Stage::Error, payload)
    }
}
