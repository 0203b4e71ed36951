//! Census blocks (areal units) and their spatial index
//!
//! `blocks.csv`: `block_id,population,x,y[,outline]` where `outline` is a ring
//! of projected coordinates written as `"x y;x y;..."`. Blocks are kept in id
//! order; an R-tree over their envelopes answers the crow-flies prefilter.

pub mod attach;

use geo::{BoundingRect, Coord, Distance, Euclidean, LineString, Polygon};
use rstar::{Envelope, PointDistance, RTree, RTreeObject, AABB};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::Path;

use crate::core::error::{Error, Result};

pub use attach::{attach, AttachStats, AttachmentIndex};

pub type BlockId = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    /// Carried for downstream scoring, never read by the evaluator
    pub population: f64,
    pub centroid: [f64; 2],
    pub outline: Option<Polygon<f64>>,
}

impl Block {
    pub fn point(id: BlockId, x: f64, y: f64) -> Self {
        Self {
            id,
            population: 0.0,
            centroid: [x, y],
            outline: None,
        }
    }

    pub fn with_outline(mut self, outline: Polygon<f64>) -> Self {
        self.outline = Some(outline);
        self
    }

    /// Bounding box as `(lower, upper)` corners
    pub fn bounds(&self) -> ([f64; 2], [f64; 2]) {
        match self.outline.as_ref().and_then(|p| p.bounding_rect()) {
            Some(rect) => ([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
            None => (self.centroid, self.centroid),
        }
    }

    /// Distance from the block to a point: the outline if present, else the centroid
    pub fn distance_to_point(&self, point: [f64; 2]) -> f64 {
        match &self.outline {
            Some(polygon) => Euclidean::distance(&geo::Point::new(point[0], point[1]), polygon),
            None => {
                let dx = self.centroid[0] - point[0];
                let dy = self.centroid[1] - point[1];
                (dx * dx + dy * dy).sqrt()
            }
        }
    }

    /// Shortest distance between the two blocks' bounding boxes
    pub fn envelope_distance(&self, other: &Block) -> f64 {
        let (a_lo, a_hi) = self.bounds();
        let (b_lo, b_hi) = other.bounds();
        let dx = (b_lo[0] - a_hi[0]).max(a_lo[0] - b_hi[0]).max(0.0);
        let dy = (b_lo[1] - a_hi[1]).max(a_lo[1] - b_hi[1]).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Deserialize)]
struct BlockRecord {
    block_id: BlockId,
    population: f64,
    x: f64,
    y: f64,
    #[serde(default)]
    outline: Option<String>,
}

/// Parse `"x y;x y;..."` into a polygon (closing the ring if needed)
pub fn parse_outline(text: &str) -> Result<Polygon<f64>> {
    let mut coords = Vec::new();
    for pair in text.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.split_whitespace();
        let (Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::DataIntegrity(format!(
                "outline vertex '{pair}' is not 'x y'"
            )));
        };
        let parse = |v: &str| {
            v.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .ok_or_else(|| Error::DataIntegrity(format!("bad outline coordinate '{v}'")))
        };
        coords.push(Coord {
            x: parse(x)?,
            y: parse(y)?,
        });
    }
    if coords.len() < 3 {
        return Err(Error::DataIntegrity(format!(
            "outline needs at least 3 vertices, got {}",
            coords.len()
        )));
    }
    Ok(Polygon::new(LineString::from(coords), vec![]))
}

/// R-tree entry: one block's bounding box
#[derive(Clone, Copy, Debug, PartialEq)]
struct BlockEnvelope {
    lower: [f64; 2],
    upper: [f64; 2],
    slot: usize,
}

impl RTreeObject for BlockEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.lower, self.upper)
    }
}

impl PointDistance for BlockEnvelope {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        Envelope::distance_2(&self.envelope(), point)
    }

    fn contains_point(&self, point: &[f64; 2]) -> bool {
        Envelope::contains_point(&self.envelope(), point)
    }
}

/// All blocks of a run, id-ordered, with an envelope R-tree
pub struct BlockSet {
    blocks: Vec<Block>,
    slots: FxHashMap<BlockId, usize>,
    tree: RTree<BlockEnvelope>,
}

impl BlockSet {
    pub fn new(mut blocks: Vec<Block>) -> Result<Self> {
        blocks.sort_by_key(|b| b.id);

        let mut slots = FxHashMap::default();
        slots.reserve(blocks.len());
        let mut entries = Vec::with_capacity(blocks.len());

        for (slot, block) in blocks.iter().enumerate() {
            if !block.centroid[0].is_finite() || !block.centroid[1].is_finite() {
                return Err(Error::DataIntegrity(format!(
                    "block {} has a non-finite centroid",
                    block.id
                )));
            }
            if slots.insert(block.id, slot).is_some() {
                return Err(Error::DataIntegrity(format!(
                    "duplicate block id {}",
                    block.id
                )));
            }
            let (lower, upper) = block.bounds();
            entries.push(BlockEnvelope { lower, upper, slot });
        }

        Ok(Self {
            blocks,
            slots,
            tree: RTree::bulk_load(entries),
        })
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut blocks = Vec::new();
        for row in reader.deserialize() {
            let record: BlockRecord = row?;
            let outline = match record.outline.as_deref() {
                Some(text) if !text.is_empty() => Some(parse_outline(text).map_err(|e| {
                    Error::DataIntegrity(format!("block {}: {e}", record.block_id))
                })?),
                _ => None,
            };
            blocks.push(Block {
                id: record.block_id,
                population: record.population,
                centroid: [record.x, record.y],
                outline,
            });
        }
        tracing::info!(blocks = blocks.len(), path = %path.display(), "loaded blocks");
        Self::new(blocks)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots.get(&id).map(|&slot| &self.blocks[slot])
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Block ids in ascending order
    pub fn ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    /// Blocks whose envelope lies within `radius` of `point`, ascending ids
    pub fn within_distance_of_point(&self, point: [f64; 2], radius: f64) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .tree
            .locate_within_distance(point, radius * radius)
            .map(|entry| self.blocks[entry.slot].id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Crow-flies prefilter: blocks whose envelope is within `max_distance`
    /// of `origin`'s envelope, ascending ids (the origin itself included)
    pub fn candidates_within(&self, origin: &Block, max_distance: f64) -> Vec<BlockId> {
        let (lower, upper) = origin.bounds();
        let center = [(lower[0] + upper[0]) / 2.0, (lower[1] + upper[1]) / 2.0];
        let half_diagonal = ((upper[0] - lower[0]).powi(2) + (upper[1] - lower[1]).powi(2)).sqrt() / 2.0;
        let reach = max_distance + half_diagonal;

        let mut ids: Vec<BlockId> = self
            .tree
            .locate_within_distance(center, reach * reach)
            .map(|entry| &self.blocks[entry.slot])
            .filter(|block| origin.envelope_distance(block) <= max_distance)
            .map(|block| block.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for BlockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSet")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}
