//! The forest: owns the backbone handles and orchestrates component
//! lifecycles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use decomposer::{Decomposer, DecomposerConfig};
use humus::Humus;
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use river::River;
use soil::Soil;
use wind::Wind;

use crate::nim::{Nim, NimContext, NimRunner};
use crate::source::{Source, SourceContext};
use crate::tree::{Tree, TreeRunner};
use crate::GroveError;

/// The assembled runtime.
///
/// Handles arrive fully constructed (transport first, then bus, streams and
/// state store); the forest never reaches for process-wide state. `start`
/// brings components up in dependency order — decomposer, sources, trees,
/// nims — and `stop` tears them down in reverse.
#[derive(Debug)]
pub struct Forest {
    wind: Arc<dyn Wind>,
    river: River,
    humus: Humus,
    soil: Arc<dyn Soil>,
    decomposer: Arc<Decomposer>,
    sources: Mutex<HashMap<String, PlantedSource>>,
    trees: Mutex<HashMap<String, Arc<TreeRunner>>>,
    nims: Mutex<HashMap<String, Arc<NimRunner>>>,
    running: AtomicBool,
}

#[derive(Debug)]
struct PlantedSource {
    source: Arc<dyn Source>,
    context: SourceContext,
}

impl Forest {
    /// Assemble a forest from backbone handles.
    pub fn new(
        wind: Arc<dyn Wind>,
        river: River,
        humus: Humus,
        soil: Arc<dyn Soil>,
        decomposer_config: DecomposerConfig,
    ) -> Self {
        let decomposer = Arc::new(Decomposer::new(
            humus.clone(),
            Arc::clone(&soil),
            decomposer_config,
        ));
        Self {
            wind,
            river,
            humus,
            soil,
            decomposer,
            sources: Mutex::new(HashMap::new()),
            trees: Mutex::new(HashMap::new()),
            nims: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// The bus handle, for read-only inspection and tests.
    pub fn wind(&self) -> &Arc<dyn Wind> {
        &self.wind
    }

    /// The ingress stream handle.
    pub fn river(&self) -> &River {
        &self.river
    }

    /// The change log handle.
    pub fn humus(&self) -> &Humus {
        &self.humus
    }

    /// The state store handle.
    pub fn soil(&self) -> &Arc<dyn Soil> {
        &self.soil
    }

    /// The projector.
    pub fn decomposer(&self) -> &Arc<Decomposer> {
        &self.decomposer
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a source publishing under `publishes`. When the forest is
    /// already running the source starts immediately.
    pub async fn plant_source(
        &self,
        source: Arc<dyn Source>,
        publishes: &str,
    ) -> Result<(), GroveError> {
        let name = source.name().to_string();
        let context = SourceContext::new(self.river.clone(), publishes);
        {
            let mut sources = self.sources.lock();
            if sources.contains_key(&name) {
                return Err(GroveError::DuplicateName(name));
            }
            sources.insert(
                name.clone(),
                PlantedSource {
                    source: Arc::clone(&source),
                    context: context.clone(),
                },
            );
        }

        if self.is_running() {
            source.start(context).await?;
        }
        info!(source = %name, "source planted");
        Ok(())
    }

    /// Register a tree. When the forest is already running the tree starts
    /// immediately.
    pub async fn plant_tree(&self, tree: Arc<dyn Tree>) -> Result<(), GroveError> {
        let name = tree.name().to_string();
        let runner = Arc::new(TreeRunner::new(
            tree,
            self.river.clone(),
            Arc::clone(&self.wind),
        ));
        {
            let mut trees = self.trees.lock();
            if trees.contains_key(&name) {
                return Err(GroveError::DuplicateName(name));
            }
            trees.insert(name.clone(), Arc::clone(&runner));
        }

        if self.is_running() {
            runner.start().await?;
        }
        info!(tree = %name, "tree planted");
        Ok(())
    }

    /// Register a nim. When the forest is already running the nim starts
    /// immediately.
    pub async fn plant_nim(&self, nim: Arc<dyn Nim>) -> Result<(), GroveError> {
        let name = nim.name().to_string();
        let ctx = NimContext::new(
            Arc::clone(&self.wind),
            self.humus.clone(),
            Arc::clone(&self.soil),
        );
        let runner = Arc::new(NimRunner::new(nim, Arc::clone(&self.wind), ctx));
        {
            let mut nims = self.nims.lock();
            if nims.contains_key(&name) {
                return Err(GroveError::DuplicateName(name));
            }
            nims.insert(name.clone(), Arc::clone(&runner));
        }

        if self.is_running() {
            runner.start().await?;
        }
        info!(nim = %name, "nim planted");
        Ok(())
    }

    /// Stop and remove a planted source.
    pub async fn uproot_source(&self, name: &str) {
        if let Some(planted) = self.sources.lock().remove(name) {
            planted.source.stop().await;
            info!(source = %name, "source uprooted");
        }
    }

    /// Stop and remove a planted tree.
    pub async fn uproot_tree(&self, name: &str) {
        if let Some(runner) = self.trees.lock().remove(name) {
            runner.stop().await;
            info!(tree = %name, "tree uprooted");
        }
    }

    /// Stop and remove a planted nim.
    pub async fn uproot_nim(&self, name: &str) {
        if let Some(runner) = self.nims.lock().remove(name) {
            runner.stop().await;
            info!(nim = %name, "nim uprooted");
        }
    }

    /// Bring the runtime up: decomposer, then sources, trees, nims.
    ///
    /// Fails fast on the first component that cannot start; components
    /// started so far stay up (call `stop` to unwind).
    pub async fn start(&self) -> Result<(), GroveError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GroveError::AlreadyRunning);
        }

        self.decomposer.start().await?;

        let sources: Vec<_> = {
            let sources = self.sources.lock();
            sources
                .values()
                .map(|p| (Arc::clone(&p.source), p.context.clone()))
                .collect()
        };
        for (source, context) in sources {
            source.start(context).await?;
        }

        let trees: Vec<_> = self.trees.lock().values().map(Arc::clone).collect();
        for tree in trees {
            tree.start().await?;
        }

        let nims: Vec<_> = self.nims.lock().values().map(Arc::clone).collect();
        for nim in nims {
            nim.start().await?;
        }

        info!("forest running");
        Ok(())
    }

    /// Tear the runtime down in reverse order: nims, trees, sources,
    /// decomposer. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let nims: Vec<_> = self.nims.lock().values().map(Arc::clone).collect();
        for nim in nims {
            nim.stop().await;
        }

        let trees: Vec<_> = self.trees.lock().values().map(Arc::clone).collect();
        for tree in trees {
            tree.stop().await;
        }

        let sources: Vec<_> = {
            let sources = self.sources.lock();
            sources.values().map(|p| Arc::clone(&p.source)).collect()
        };
        for source in sources {
            source.stop().await;
        }

        self.decomposer.stop().await;
        info!("forest stopped");
    }

    /// Names of the planted sources.
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sources.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the planted trees.
    pub fn tree_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.trees.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the planted nims.
    pub fn nim_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.nims.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for Forest {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("forest dropped while running; components were not drained");
        }
    }
}
