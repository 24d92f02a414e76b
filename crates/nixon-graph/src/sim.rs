//! In-memory media engine.
//!
//! `SimEngine` interprets just enough of a launch description to know which
//! named elements and valves exist, then tracks states, valve positions and
//! properties. Events are injected with [`SimEngine::emit`]; the calling
//! thread plays the engine's callback thread.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{EngineError, EngineEvent, EventCallback, GraphHandle, GraphState, MediaEngine, Result};

#[derive(Default)]
pub struct SimEngine {
    inner: Mutex<SimInner>,
}

#[derive(Default)]
struct SimInner {
    next_handle: u64,
    builds: u64,
    fail_builds: u32,
    graphs: BTreeMap<GraphHandle, SimGraph>,
}

struct SimGraph {
    description: String,
    elements: BTreeSet<String>,
    valves: HashMap<String, bool>,
    properties: HashMap<(String, String), String>,
    state: GraphState,
    callback: Option<EventCallback>,
}

/// Names and valves declared in a launch description.
struct Parsed {
    elements: BTreeSet<String>,
    valves: HashMap<String, bool>,
}

fn parse(description: &str) -> Result<Parsed> {
    let mut elements = BTreeSet::new();
    let mut valves = HashMap::new();

    for segment in description.split('!') {
        let mut tokens = segment
            .split_whitespace()
            .filter(|t| !t.ends_with('.'));
        let Some(factory) = tokens.next() else {
            return Err(EngineError::Build("empty element in description".to_string()));
        };
        if factory.contains('=') {
            return Err(EngineError::Build(format!("expected element, found {factory}")));
        }

        let mut name = None;
        let mut dropping = false;
        for token in tokens {
            match token.split_once('=') {
                Some(("name", value)) => name = Some(value.trim_matches('"').to_string()),
                Some(("drop", value)) => dropping = value == "true",
                _ => {}
            }
        }

        if let Some(name) = name {
            if factory == "valve" {
                valves.insert(name.clone(), !dropping);
            }
            if !elements.insert(name.clone()) {
                return Err(EngineError::Build(format!("duplicate element name {name}")));
            }
        }
    }

    Ok(Parsed { elements, valves })
}

impl SimEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` builds fail.
    pub fn fail_next_builds(&self, count: u32) {
        self.inner.lock().fail_builds = count;
    }

    /// Number of build attempts, including failed ones.
    pub fn build_count(&self) -> u64 {
        self.inner.lock().builds
    }

    /// Handles of graphs not yet released.
    pub fn live_graphs(&self) -> Vec<GraphHandle> {
        self.inner.lock().graphs.keys().copied().collect()
    }

    /// Most recently built graph still alive.
    pub fn latest(&self) -> Option<GraphHandle> {
        self.inner.lock().graphs.keys().next_back().copied()
    }

    pub fn description(&self, graph: GraphHandle) -> Option<String> {
        self.inner
            .lock()
            .graphs
            .get(&graph)
            .map(|g| g.description.clone())
    }

    pub fn state(&self, graph: GraphHandle) -> Option<GraphState> {
        self.inner.lock().graphs.get(&graph).map(|g| g.state)
    }

    pub fn valve_open(&self, graph: GraphHandle, valve: &str) -> Option<bool> {
        self.inner
            .lock()
            .graphs
            .get(&graph)
            .and_then(|g| g.valves.get(valve).copied())
    }

    pub fn property(&self, graph: GraphHandle, element: &str, key: &str) -> Option<String> {
        self.inner.lock().graphs.get(&graph).and_then(|g| {
            g.properties
                .get(&(element.to_string(), key.to_string()))
                .cloned()
        })
    }

    /// Forget an element so later lookups fail, as if the engine lost it.
    pub fn remove_element(&self, graph: GraphHandle, element: &str) {
        if let Some(g) = self.inner.lock().graphs.get_mut(&graph) {
            g.elements.remove(element);
            g.valves.remove(element);
        }
    }

    /// Deliver `event` to the graph's subscriber on the calling thread.
    /// Returns false when nothing is subscribed.
    pub fn emit(&self, graph: GraphHandle, event: EngineEvent) -> bool {
        // Never hold our lock while the subscriber runs.
        let callback = self
            .inner
            .lock()
            .graphs
            .get(&graph)
            .and_then(|g| g.callback.clone());

        match callback {
            Some(callback) => {
                trace!(%graph, ?event, "emitting");
                callback(event);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to the most recent live graph.
    pub fn emit_latest(&self, event: EngineEvent) -> bool {
        match self.latest() {
            Some(graph) => self.emit(graph, event),
            None => false,
        }
    }

    fn with_graph<T>(
        &self,
        graph: GraphHandle,
        f: impl FnOnce(&mut SimGraph) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        let g = inner
            .graphs
            .get_mut(&graph)
            .ok_or(EngineError::UnknownGraph(graph))?;
        f(g)
    }
}

impl MediaEngine for SimEngine {
    fn build_graph(&self, description: &str) -> Result<GraphHandle> {
        let mut inner = self.inner.lock();
        inner.builds += 1;

        if inner.fail_builds > 0 {
            inner.fail_builds -= 1;
            return Err(EngineError::Build("scripted build failure".to_string()));
        }

        let parsed = parse(description)?;

        inner.next_handle += 1;
        let handle = GraphHandle(inner.next_handle);
        inner.graphs.insert(
            handle,
            SimGraph {
                description: description.to_string(),
                elements: parsed.elements,
                valves: parsed.valves,
                properties: HashMap::new(),
                state: GraphState::Null,
                callback: None,
            },
        );
        debug!(%handle, "graph built");
        Ok(handle)
    }

    fn set_state(&self, graph: GraphHandle, state: GraphState) -> Result<()> {
        self.with_graph(graph, |g| {
            g.state = state;
            Ok(())
        })
    }

    fn set_valve(&self, graph: GraphHandle, valve: &str, open: bool) -> Result<()> {
        self.with_graph(graph, |g| match g.valves.get_mut(valve) {
            Some(position) => {
                *position = open;
                Ok(())
            }
            None => Err(EngineError::ElementMissing(valve.to_string())),
        })
    }

    fn set_property(
        &self,
        graph: GraphHandle,
        element: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.with_graph(graph, |g| {
            if !g.elements.contains(element) {
                return Err(EngineError::ElementMissing(element.to_string()));
            }
            g.properties
                .insert((element.to_string(), key.to_string()), value.to_string());
            Ok(())
        })
    }

    fn subscribe(&self, graph: GraphHandle, callback: EventCallback) -> Result<()> {
        self.with_graph(graph, |g| {
            g.callback = Some(callback);
            Ok(())
        })
    }

    fn release(&self, graph: GraphHandle) {
        if self.inner.lock().graphs.remove(&graph).is_some() {
            debug!(%graph, "graph released");
        }
    }
}
