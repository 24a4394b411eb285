//! HNSW vector index.
//!
//! A multi-layer navigable small-world graph over the paged vector and
//! graph indices. Layer 0 holds every node; upper layers thin out
//! geometrically according to the level draw `floor(-ln(U) * mL)`. All
//! state is off-heap and memory-mapped; the singleton metadata file records
//! the entry point and the id high-water mark so reopen needs no replay.
//!
//! Inserts are serialized by a coarse lock; searches are lock-free and may
//! observe a node as soon as its adjacency is published.

use std::collections::{BinaryHeap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::config::HnswParams;
use crate::error::{Result, VulcanoError};
use crate::index::graph::PagedGraphIndex;
use crate::index::similarity::{Cosine, Similarity};
use crate::index::vectors::PagedVectorIndex;
use crate::telemetry::Telemetry;

// Bounds the layer count regardless of the level draw.
const MAX_LAYER: usize = 63;

const META_LEN: u64 = 32;

/// A candidate ordered by similarity (then id, for determinism).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    sim: f32,
    id: u64,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sim
            .total_cmp(&other.sim)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Singleton metadata: entry point, top layer, id high-water mark.
#[derive(Debug, Clone, Copy)]
struct MetaState {
    entry_id: i64,
    entry_layer: i64,
    next_id: i64,
    dimensions: i64,
}

#[derive(Debug)]
struct MetaFile {
    file: Mutex<File>,
}

impl MetaFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < META_LEN {
            file.set_len(META_LEN)?;
        }
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn read(&self) -> Result<Option<MetaState>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let state = MetaState {
            entry_id: file.read_i64::<LittleEndian>()?,
            entry_layer: file.read_i64::<LittleEndian>()?,
            next_id: file.read_i64::<LittleEndian>()?,
            dimensions: file.read_i64::<LittleEndian>()?,
        };
        // A fresh file is all zeros; real state always has dimensions >= 1.
        if state.dimensions == 0 {
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn write(&self, state: MetaState) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_i64::<LittleEndian>(state.entry_id)?;
        file.write_i64::<LittleEndian>(state.entry_layer)?;
        file.write_i64::<LittleEndian>(state.next_id)?;
        file.write_i64::<LittleEndian>(state.dimensions)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

/// Paged, persistable hierarchical navigable small-world index.
pub struct HnswIndex {
    params: HnswParams,
    dir: PathBuf,
    vectors: PagedVectorIndex,
    layers: RwLock<Vec<Arc<PagedGraphIndex>>>,
    entry_point: RwLock<Option<(u64, usize)>>,
    meta: MetaFile,
    sim: Arc<dyn Similarity>,
    insert_lock: Mutex<()>,
    telemetry: Telemetry,
}

impl HnswIndex {
    /// Open or create the index under `dir` with the default cosine
    /// similarity.
    pub fn open(dir: impl Into<PathBuf>, params: HnswParams, telemetry: Telemetry) -> Result<Self> {
        Self::open_with_similarity(dir, params, Arc::new(Cosine), telemetry)
    }

    /// Open or create the index with a caller-supplied similarity.
    pub fn open_with_similarity(
        dir: impl Into<PathBuf>,
        params: HnswParams,
        sim: Arc<dyn Similarity>,
        telemetry: Telemetry,
    ) -> Result<Self> {
        params.validate()?;
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let meta = MetaFile::open(dir.join("meta.dat"))?;
        let state = meta.read()?;
        let (entry_point, next_id) = match state {
            Some(state) => {
                if state.dimensions != params.dimensions as i64 {
                    return Err(VulcanoError::validation(format!(
                        "index at {} holds {}-dimension vectors, configured for {}",
                        dir.display(),
                        state.dimensions,
                        params.dimensions
                    )));
                }
                let entry = if state.entry_id < 0 {
                    None
                } else {
                    Some((state.entry_id as u64, state.entry_layer as usize))
                };
                (entry, state.next_id.max(0) as u64)
            }
            None => (None, 0),
        };

        let vectors = PagedVectorIndex::open(
            dir.join("vectors"),
            params.dimensions,
            params.block_size,
            next_id,
        )?;

        let top_layer = entry_point.map(|(_, layer)| layer);
        let mut layers = Vec::new();
        if let Some(top) = top_layer {
            for layer in 0..=top {
                layers.push(Arc::new(Self::open_layer(&dir, &params, layer)?));
            }
        }

        Ok(Self {
            params,
            dir,
            vectors,
            layers: RwLock::new(layers),
            entry_point: RwLock::new(entry_point),
            meta,
            sim,
            insert_lock: Mutex::new(()),
            telemetry,
        })
    }

    fn open_layer(dir: &PathBuf, params: &HnswParams, layer: usize) -> Result<PagedGraphIndex> {
        let cap = if layer == 0 {
            params.m_max0()
        } else {
            params.m_max()
        };
        PagedGraphIndex::open(dir.join(format!("layer-{layer}")), cap, params.block_size)
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// High-water mark over inserted ids.
    pub fn next_id(&self) -> u64 {
        self.vectors.next_id()
    }

    /// Insert `vector` under the caller-assigned internal id.
    pub fn insert(&self, id: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.params.dimensions {
            return Err(VulcanoError::validation(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.params.dimensions
            )));
        }

        let _guard = self.insert_lock.lock();
        let mut calcs = 0u64;

        self.vectors.put(id, vector)?;
        let level = self.draw_level();
        self.ensure_layers(level)?;

        let entry = *self.entry_point.read();
        let Some((entry_id, top_layer)) = entry else {
            *self.entry_point.write() = Some((id, level));
            self.persist_meta()?;
            return Ok(());
        };

        // Greedy descent through layers above the insertion level.
        let mut current = entry_id;
        if top_layer > level {
            for layer in ((level + 1)..=top_layer).rev() {
                current = self.greedy_descent(vector, current, layer, &mut calcs)?;
            }
        }

        // Beam search and connect from the insertion level down.
        let mut entry_points = vec![current];
        for layer in (0..=level.min(top_layer)).rev() {
            let found = self.search_layer(
                vector,
                &entry_points,
                self.params.ef_construction,
                layer,
                &mut calcs,
            )?;
            let selected = self.select_neighbors(vector, &found, self.params.m, &mut calcs)?;

            let graph = self.layer(layer)?;
            graph.set_connections(id, &selected.iter().map(|s| s.id).collect::<Vec<_>>())?;
            for neighbor in &selected {
                self.connect_back(&graph, neighbor.id, id, &mut calcs)?;
            }

            entry_points = found.iter().map(|s| s.id).collect();
            if entry_points.is_empty() {
                entry_points = vec![current];
            }
        }

        if level > top_layer {
            *self.entry_point.write() = Some((id, level));
        }
        self.persist_meta()?;
        self.telemetry.distance_calcs(calcs);
        Ok(())
    }

    /// k-NN search. Returns `(id, similarity)` pairs, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.params.dimensions {
            return Err(VulcanoError::validation(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.params.dimensions
            )));
        }
        let entry = *self.entry_point.read();
        let Some((entry_id, top_layer)) = entry else {
            return Ok(Vec::new());
        };

        let mut calcs = 0u64;
        let mut current = entry_id;
        for layer in (1..=top_layer).rev() {
            current = self.greedy_descent(query, current, layer, &mut calcs)?;
        }

        let ef = self.params.ef_search.max(k);
        let mut found = self.search_layer(query, &[current], ef, 0, &mut calcs)?;
        found.truncate(k);
        self.telemetry.distance_calcs(calcs);
        Ok(found.into_iter().map(|s| (s.id, s.sim)).collect())
    }

    /// Flush vectors, adjacency, and fsync the metadata.
    pub fn flush(&self) -> Result<()> {
        self.vectors.flush()?;
        for layer in self.layers.read().iter() {
            layer.flush()?;
        }
        self.persist_meta()?;
        self.meta.sync()
    }

    /// Flush and release all mappings.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.vectors.close();
        for layer in self.layers.read().iter() {
            layer.close();
        }
        Ok(())
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.vectors.mapped_bytes()
            + self
                .layers
                .read()
                .iter()
                .map(|layer| layer.mapped_bytes())
                .sum::<u64>()
    }

    fn draw_level(&self) -> usize {
        let ml = self.params.ml();
        if ml <= 0.0 {
            return 0;
        }
        let mut rng = rand::rng();
        // U in (0, 1].
        let u = 1.0 - rng.random::<f64>();
        ((-u.ln() * ml).floor() as usize).min(MAX_LAYER)
    }

    fn ensure_layers(&self, level: usize) -> Result<()> {
        let mut layers = self.layers.write();
        while layers.len() <= level {
            let next = layers.len();
            layers.push(Arc::new(Self::open_layer(&self.dir, &self.params, next)?));
        }
        Ok(())
    }

    fn layer(&self, layer: usize) -> Result<Arc<PagedGraphIndex>> {
        self.layers
            .read()
            .get(layer)
            .cloned()
            .ok_or_else(|| VulcanoError::internal(format!("layer {layer} not materialized")))
    }

    fn score_stored(&self, query: &[f32], id: u64, calcs: &mut u64) -> Result<f32> {
        *calcs += 1;
        self.vectors
            .with_row(id, |row| self.sim.score_row(query, row))
    }

    /// Single-candidate greedy walk toward `query` on one layer.
    fn greedy_descent(
        &self,
        query: &[f32],
        start: u64,
        layer: usize,
        calcs: &mut u64,
    ) -> Result<u64> {
        let graph = self.layer(layer)?;
        let mut best_id = start;
        let mut best_sim = self.score_stored(query, best_id, calcs)?;
        loop {
            let mut improved = false;
            for neighbor in graph.connections(best_id)? {
                let sim = self.score_stored(query, neighbor, calcs)?;
                if sim > best_sim {
                    best_sim = sim;
                    best_id = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return Ok(best_id);
            }
        }
    }

    /// Beam search on one layer. Returns up to `ef` results, best first.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u64],
        ef: usize,
        layer: usize,
        calcs: &mut u64,
    ) -> Result<Vec<Scored>> {
        let graph = self.layer(layer)?;
        let mut visited: HashSet<u64> = HashSet::new();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut best: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let sim = self.score_stored(query, ep, calcs)?;
            let scored = Scored { sim, id: ep };
            candidates.push(scored);
            best.push(std::cmp::Reverse(scored));
        }

        while let Some(candidate) = candidates.pop() {
            let worst = best.peek().map(|r| r.0.sim).unwrap_or(f32::MIN);
            if best.len() >= ef && candidate.sim < worst {
                break;
            }
            for neighbor in graph.connections(candidate.id)? {
                if !visited.insert(neighbor) {
                    continue;
                }
                let sim = self.score_stored(query, neighbor, calcs)?;
                let worst = best.peek().map(|r| r.0.sim).unwrap_or(f32::MIN);
                if best.len() < ef || sim > worst {
                    let scored = Scored { sim, id: neighbor };
                    candidates.push(scored);
                    best.push(std::cmp::Reverse(scored));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut results: Vec<Scored> = best.into_iter().map(|r| r.0).collect();
        results.sort_by(|a, b| b.cmp(a));
        Ok(results)
    }

    /// Diversified neighbor selection: take candidates closest-first but
    /// reject any candidate that sits closer to an already-selected
    /// neighbor than to the query.
    fn select_neighbors(
        &self,
        query: &[f32],
        candidates: &[Scored],
        m: usize,
        calcs: &mut u64,
    ) -> Result<Vec<Scored>> {
        let mut ordered: Vec<Scored> = candidates.to_vec();
        ordered.sort_by(|a, b| b.cmp(a));

        let mut selected: Vec<Scored> = Vec::with_capacity(m);
        for candidate in ordered {
            if selected.len() >= m {
                break;
            }
            let candidate_vec = self.vectors.get(candidate.id)?;
            let mut keep = true;
            for existing in &selected {
                let sim_to_existing = self.score_stored(&candidate_vec, existing.id, calcs)?;
                if sim_to_existing > candidate.sim {
                    keep = false;
                    break;
                }
            }
            if keep {
                selected.push(candidate);
            }
        }
        // Never return an empty set when candidates exist; connectivity
        // beats diversification for the first link.
        if selected.is_empty() && !candidates.is_empty() {
            let mut fallback: Vec<Scored> = candidates.to_vec();
            fallback.sort_by(|a, b| b.cmp(a));
            fallback.truncate(1);
            return Ok(fallback);
        }
        Ok(selected)
    }

    /// Add the back edge `from -> new_id`, re-selecting `from`'s neighbor
    /// set when it would exceed the layer cap.
    fn connect_back(
        &self,
        graph: &PagedGraphIndex,
        from: u64,
        new_id: u64,
        calcs: &mut u64,
    ) -> Result<()> {
        let cap = graph.m_max();
        let current = graph.connections(from)?;
        if current.contains(&new_id) {
            return Ok(());
        }
        if current.len() < cap {
            return graph.add_connection(from, new_id);
        }

        let from_vec = self.vectors.get(from)?;
        let mut candidates = Vec::with_capacity(current.len() + 1);
        for id in current.iter().copied().chain(std::iter::once(new_id)) {
            let sim = self.score_stored(&from_vec, id, calcs)?;
            candidates.push(Scored { sim, id });
        }
        let reselected = self.select_neighbors(&from_vec, &candidates, cap, calcs)?;
        graph.set_connections(from, &reselected.iter().map(|s| s.id).collect::<Vec<_>>())?;
        Ok(())
    }

    fn persist_meta(&self) -> Result<()> {
        let entry = *self.entry_point.read();
        let (entry_id, entry_layer) = match entry {
            Some((id, layer)) => (id as i64, layer as i64),
            None => (-1, 0),
        };
        self.meta.write(MetaState {
            entry_id,
            entry_layer,
            next_id: self.vectors.next_id() as i64,
            dimensions: self.params.dimensions as i64,
        })
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dir", &self.dir)
            .field("dimensions", &self.params.dimensions)
            .field("entry_point", &*self.entry_point.read())
            .finish()
    }
}
