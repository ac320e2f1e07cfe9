//! Layer Table
//!
//! Named layers, their broad-phase buckets and the collision matrices.
//! Features:
//! - Symmetric layer x layer collision matrix, one bitmask row per layer
//! - Derived layer x bucket matrix
//! - Both matrices are rebuilt wholesale from the declarative lists on
//!   every edit; hot-path lookups never recompute anything

use smallvec::SmallVec;

use crate::config::{LayerDef, LayerTableConfig};

/// Maximum number of layers
pub const LAYERS_COUNT: usize = 32;
/// Maximum number of broad-phase buckets
pub const BROADPHASE_COUNT: usize = 4;

/// Numeric layer index
pub type LayerIndex = u8;

/// Unordered pair of layer names
#[derive(Debug, Clone, Eq)]
pub struct LayersPair {
    pub a: String,
    pub b: String,
}

impl LayersPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
        }
    }
}

impl PartialEq for LayersPair {
    fn eq(&self, other: &Self) -> bool {
        (self.a == other.a && self.b == other.b) || (self.a == other.b && self.b == other.a)
    }
}

/// Layer names, buckets and collision matrices
#[derive(Debug, Clone)]
pub struct LayerTable {
    declared_layers: Vec<LayerDef>,
    declared_pairs: Vec<LayersPair>,

    layer_names: Vec<String>,
    layer_broadphase: [u8; LAYERS_COUNT],
    layers_vs_layers: [u32; LAYERS_COUNT],
    layers_vs_broadphase: [u8; LAYERS_COUNT],
}

impl LayerTable {
    /// Table with the built-in layers
    pub fn new() -> Self {
        Self::from_config(&LayerTableConfig::default())
    }

    pub fn from_config(config: &LayerTableConfig) -> Self {
        let mut table = Self {
            declared_layers: config.layers.clone(),
            declared_pairs: Vec::new(),
            layer_names: Vec::new(),
            layer_broadphase: [u8::MAX; LAYERS_COUNT],
            layers_vs_layers: [0; LAYERS_COUNT],
            layers_vs_broadphase: [0; LAYERS_COUNT],
        };
        for (a, b) in &config.collide_with {
            let pair = LayersPair::new(a.as_str(), b.as_str());
            if !table.declared_pairs.contains(&pair) {
                table.declared_pairs.push(pair);
            }
        }
        table.reload();
        table
    }

    /// Declarative form of this table
    pub fn to_config(&self) -> LayerTableConfig {
        LayerTableConfig {
            layers: self.declared_layers.clone(),
            collide_with: self
                .declared_pairs
                .iter()
                .map(|pair| (pair.a.clone(), pair.b.clone()))
                .collect(),
        }
    }

    /// Rebuild both matrices from the declared layers and pairs
    pub fn reload(&mut self) {
        self.layer_names.clear();
        self.layer_broadphase = [u8::MAX; LAYERS_COUNT];
        self.layers_vs_layers = [0; LAYERS_COUNT];
        self.layers_vs_broadphase = [0; LAYERS_COUNT];

        let declared_layers = std::mem::take(&mut self.declared_layers);
        for layer in &declared_layers {
            self.insert_layer(&layer.name, layer.broadphase);
        }
        self.declared_layers = declared_layers;

        let declared_pairs = std::mem::take(&mut self.declared_pairs);
        for pair in &declared_pairs {
            self.apply_pair(&pair.a, &pair.b);
        }
        self.declared_pairs = declared_pairs;

        log::debug!(
            "Layer table reloaded: {} layers, {} pairs",
            self.layer_names.len(),
            self.declared_pairs.len()
        );
    }

    /// Add a layer unless it already exists, returning its index.
    ///
    /// Panics when the layer capacity or the bucket count is exceeded.
    pub fn add_layer(&mut self, name: &str, broadphase: u8) -> LayerIndex {
        if let Some(index) = self.find(name) {
            return index;
        }
        let index = self.insert_layer(name, broadphase);
        self.declared_layers.push(LayerDef::new(name, broadphase));
        index
    }

    /// Make two layers collide with each other
    pub fn set_collidable(&mut self, a: &str, b: &str) -> bool {
        if self.find(a).is_none() || self.find(b).is_none() {
            log::error!("Can't make `{}` and `{}` collide: unknown layer", a, b);
            return false;
        }
        let pair = LayersPair::new(a, b);
        if !self.declared_pairs.contains(&pair) {
            self.declared_pairs.push(pair);
        }
        self.apply_pair(a, b)
    }

    /// Stop two layers from colliding; the matrices are rebuilt
    pub fn remove_collidable(&mut self, a: &str, b: &str) {
        let pair = LayersPair::new(a, b);
        self.declared_pairs.retain(|p| *p != pair);
        self.reload();
    }

    /// Index of a layer, or 0 with a logged error if unknown
    pub fn layer_for_name(&self, name: &str) -> LayerIndex {
        match self.find(name) {
            Some(index) => index,
            None => {
                log::error!("The physics layer `{}` does not exist", name);
                0
            }
        }
    }

    /// Index of a layer if it exists
    pub fn find(&self, name: &str) -> Option<LayerIndex> {
        self.layer_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as LayerIndex)
    }

    /// Name of a layer, or empty if out of range
    pub fn name_for_layer(&self, index: LayerIndex) -> &str {
        self.layer_names
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    #[inline]
    pub fn can_collide(&self, a: LayerIndex, b: LayerIndex) -> bool {
        (a as usize) < LAYERS_COUNT && (self.layers_vs_layers[a as usize] & (1 << (b as u32 & 31))) != 0
    }

    #[inline]
    pub fn can_collide_broadphase(&self, layer: LayerIndex, broadphase: u8) -> bool {
        (layer as usize) < LAYERS_COUNT
            && (broadphase as usize) < BROADPHASE_COUNT
            && (self.layers_vs_broadphase[layer as usize] & (1 << broadphase)) != 0
    }

    /// Layers this layer collides with, one bit per layer
    #[inline]
    pub fn collision_mask(&self, layer: LayerIndex) -> u32 {
        self.layers_vs_layers
            .get(layer as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Bucket of a layer
    pub fn broadphase_of(&self, layer: LayerIndex) -> Option<u8> {
        self.layer_broadphase
            .get(layer as usize)
            .copied()
            .filter(|&bp| bp != u8::MAX)
    }

    /// Highest assigned bucket + 1
    pub fn broadphase_count(&self) -> usize {
        self.layer_names
            .iter()
            .enumerate()
            .map(|(i, _)| self.layer_broadphase[i] as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn layers_count(&self) -> usize {
        self.layer_names.len()
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layer_names.iter().map(String::as_str)
    }

    /// Comma separated layer names
    pub fn layers_comma_separated(&self) -> String {
        self.layer_names.join(",")
    }

    pub fn collide_pairs(&self) -> &[LayersPair] {
        &self.declared_pairs
    }

    fn insert_layer(&mut self, name: &str, broadphase: u8) -> LayerIndex {
        if let Some(index) = self.find(name) {
            return index;
        }
        let index = self.layer_names.len();
        assert!(
            index < LAYERS_COUNT,
            "Layer capacity of {} exceeded by `{}`",
            LAYERS_COUNT,
            name
        );
        assert!(
            (broadphase as usize) < BROADPHASE_COUNT,
            "Broad-phase bucket {} of `{}` exceeds {}",
            broadphase,
            name,
            BROADPHASE_COUNT
        );
        self.layer_names.push(name.to_string());
        self.layer_broadphase[index] = broadphase;
        index as LayerIndex
    }

    fn apply_pair(&mut self, a: &str, b: &str) -> bool {
        let (Some(ia), Some(ib)) = (self.find(a), self.find(b)) else {
            return false;
        };
        let (ia, ib) = (ia as usize, ib as usize);
        self.layers_vs_layers[ia] |= 1 << ib;
        self.layers_vs_layers[ib] |= 1 << ia;
        self.layers_vs_broadphase[ia] |= 1 << self.layer_broadphase[ib];
        self.layers_vs_broadphase[ib] |= 1 << self.layer_broadphase[ia];
        true
    }
}

impl Default for LayerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Layer whitelist for queries; empty admits every layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectLayerFilter {
    layers: SmallVec<[LayerIndex; 4]>,
}

impl ObjectLayerFilter {
    /// Filter admitting every layer
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_layers(layers: impl IntoIterator<Item = LayerIndex>) -> Self {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    /// Resolve names through the table; unknown names map to layer 0
    pub fn from_names<'a>(table: &LayerTable, names: impl IntoIterator<Item = &'a str>) -> Self {
        Self::from_layers(names.into_iter().map(|name| table.layer_for_name(name)))
    }

    #[inline]
    pub fn admits(&self, layer: LayerIndex) -> bool {
        self.layers.is_empty() || self.layers.contains(&layer)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
