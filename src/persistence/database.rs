//! World database contract
//!
//! Rows mirror the tables the landscape persists: one landscape row, one
//! row per block with its compressed height and colour blobs, per-block LOD
//! variance rows, per-block paint layer rows and the landscape's ordered
//! procedural layers. Row id 0 means "not saved yet".

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::types::Result;
use crate::core::Error;

pub type RowId = i64;

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LandscapeRow {
    pub id: RowId,
    /// `LandscapeConfig` as JSON
    pub config: String,
    pub field_width: u32,
    pub field_height: u32,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BlockRow {
    pub id: RowId,
    pub landscape_id: RowId,
    pub block_index: u32,
    /// Sample rectangle the blobs cover
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    /// lz4-compressed little-endian `i16` samples
    pub heights: Vec<u8>,
    /// lz4-compressed little-endian ARGB colours, empty without a colour grid
    pub colors: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VarianceRow {
    pub block_id: RowId,
    pub level: u32,
    pub variance: f32,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PaintLayerRow {
    pub id: RowId,
    pub block_id: RowId,
    pub material_id: u32,
    pub reference_count: u32,
    /// lz4-compressed weight map, border included
    pub weights: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ProceduralLayerRow {
    pub id: RowId,
    pub landscape_id: RowId,
    /// Draw order within the landscape
    pub position: u32,
    pub material_id: u32,
    /// Layer parameters as JSON
    pub params: String,
}

/// Row storage used by the landscape.
///
/// Writes outside a transaction apply immediately; inside one they apply
/// on `commit` and vanish on `rollback`.
pub trait WorldDatabase {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self);
    fn in_transaction(&self) -> bool;

    fn insert_landscape(&mut self, row: LandscapeRow) -> Result<RowId>;
    fn update_landscape(&mut self, row: &LandscapeRow) -> Result<()>;
    fn landscape(&self, id: RowId) -> Result<Option<LandscapeRow>>;

    fn insert_block(&mut self, row: BlockRow) -> Result<RowId>;
    fn update_block_data(&mut self, id: RowId, heights: Vec<u8>, colors: Vec<u8>) -> Result<()>;
    /// Blocks of a landscape, ordered by block index
    fn blocks(&self, landscape_id: RowId) -> Result<Vec<BlockRow>>;

    fn replace_variance(&mut self, block_id: RowId, variance: &[f32]) -> Result<()>;
    /// Variance of a block, ordered by level
    fn variance(&self, block_id: RowId) -> Result<Vec<f32>>;

    fn insert_paint_layer(&mut self, row: PaintLayerRow) -> Result<RowId>;
    fn update_paint_layer(&mut self, row: &PaintLayerRow) -> Result<()>;
    fn delete_paint_layer(&mut self, id: RowId) -> Result<()>;
    fn paint_layers(&self, block_id: RowId) -> Result<Vec<PaintLayerRow>>;

    /// Replace every procedural layer of a landscape, returning the new ids
    fn replace_procedural_layers(&mut self, landscape_id: RowId, rows: Vec<ProceduralLayerRow>) -> Result<Vec<RowId>>;
    /// Procedural layers of a landscape, ordered by position
    fn procedural_layers(&self, landscape_id: RowId) -> Result<Vec<ProceduralLayerRow>>;
}

/// Run `f` inside a transaction, rolling back if any step fails
pub fn transaction<D, T>(db: &mut D, f: impl FnOnce(&mut D) -> Result<T>) -> Result<T>
where
    D: WorldDatabase + ?Sized,
{
    db.begin()?;
    let result = f(db).and_then(|value| db.commit().map(|_| value));
    if let Err(e) = &result {
        log::error!("World database transaction rolled back: {}", e);
        if db.in_transaction() {
            db.rollback();
        }
    }
    result
}

pub fn encode_heights(samples: &[i16]) -> Vec<u8> {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    lz4_flex::compress_prepend_size(&bytes)
}

pub fn decode_heights(blob: &[u8]) -> Result<Vec<i16>> {
    let bytes = decompress(blob)?;
    if bytes.len() % 2 != 0 {
        return Err(Error::Persistence(format!("height blob has odd length {}", bytes.len())));
    }
    Ok(bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect())
}

pub fn encode_colors(colors: &[u32]) -> Vec<u8> {
    let bytes: Vec<u8> = colors.iter().flat_map(|c| c.to_le_bytes()).collect();
    lz4_flex::compress_prepend_size(&bytes)
}

pub fn decode_colors(blob: &[u8]) -> Result<Vec<u32>> {
    let bytes = decompress(blob)?;
    if bytes.len() % 4 != 0 {
        return Err(Error::Persistence(format!("colour blob length {} is not a multiple of 4", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_weights(weights: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(weights)
}

pub fn decode_weights(blob: &[u8]) -> Result<Vec<u8>> {
    decompress(blob)
}

fn decompress(blob: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(blob)
        .map_err(|e| Error::Persistence(format!("LZ4 decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_blob_round_trip() {
        let samples = vec![-32767, -1, 0, 1, 1234, 32767];
        assert_eq!(decode_heights(&encode_heights(&samples)).unwrap(), samples);
    }

    #[test]
    fn test_color_blob_round_trip() {
        let colors = vec![0xFFFF_FFFF, 0xFF20_4060, 0];
        assert_eq!(decode_colors(&encode_colors(&colors)).unwrap(), colors);
    }

    #[test]
    fn test_weight_blob_compresses_flat_maps() {
        let weights = vec![0u8; 34 * 34];
        let blob = encode_weights(&weights);
        assert!(blob.len() < weights.len() / 4);
        assert_eq!(decode_weights(&blob).unwrap(), weights);
    }

    #[test]
    fn test_corrupt_blob_is_a_persistence_error() {
        assert!(matches!(decode_heights(&[16, 0, 0, 0, 0xF0]), Err(Error::Persistence(_))));
        let odd = lz4_flex::compress_prepend_size(&[1, 2, 3]);
        assert!(matches!(decode_heights(&odd), Err(Error::Persistence(_))));
    }
}
