//! In-memory world database with compressed snapshot files

use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::types::Result;
use crate::core::Error;
use super::database::{
    BlockRow, LandscapeRow, PaintLayerRow, ProceduralLayerRow, RowId, VarianceRow, WorldDatabase,
};

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct Tables {
    last_id: RowId,
    landscapes: Vec<LandscapeRow>,
    blocks: Vec<BlockRow>,
    variance: Vec<VarianceRow>,
    paint_layers: Vec<PaintLayerRow>,
    procedural_layers: Vec<ProceduralLayerRow>,
}

impl Tables {
    fn next_id(&mut self) -> RowId {
        self.last_id += 1;
        self.last_id
    }
}

/// Transactional row store kept in memory.
///
/// A transaction snapshots the tables on `begin`; `rollback` restores the
/// snapshot. [`MemoryDatabase::save`] writes the committed tables as an
/// lz4-compressed rkyv archive.
#[derive(Clone, Debug, Default)]
pub struct MemoryDatabase {
    tables: Tables,
    committed: Option<Tables>,
    /// Writes left before injected failures start
    write_budget: Option<usize>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write after the next `count` fail
    pub fn fail_writes_after(&mut self, count: usize) {
        self.write_budget = Some(count);
    }

    pub fn block_count(&self) -> usize {
        self.tables.blocks.len()
    }

    pub fn paint_layer_count(&self) -> usize {
        self.tables.paint_layers.len()
    }

    /// Write the committed tables to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let tables = self.committed.as_ref().unwrap_or(&self.tables);
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(tables)
            .map_err(|e| Error::Persistence(format!("snapshot serialization failed: {}", e)))?;
        std::fs::write(path, lz4_flex::compress_prepend_size(&bytes))?;
        log::info!(
            "Saved world database to {} ({} blocks, {} paint layers)",
            path.display(),
            tables.blocks.len(),
            tables.paint_layers.len()
        );
        Ok(())
    }

    /// Read a snapshot written by [`Self::save`]
    pub fn open(path: &Path) -> Result<Self> {
        let compressed = std::fs::read(path)?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| Error::Persistence(format!("LZ4 decompression failed: {}", e)))?;

        // Archives must be read from aligned memory
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(&bytes);
        let tables = rkyv::from_bytes::<Tables, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Persistence(format!("invalid world snapshot: {}", e)))?;

        log::info!("Opened world database {} ({} blocks)", path.display(), tables.blocks.len());
        Ok(Self { tables, committed: None, write_budget: None })
    }

    fn write(&mut self) -> Result<&mut Tables> {
        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::Persistence("write rejected by database".into()));
            }
            *budget -= 1;
        }
        Ok(&mut self.tables)
    }
}

fn missing(table: &str, id: RowId) -> Error {
    Error::Persistence(format!("no {} row with id {}", table, id))
}

impl WorldDatabase for MemoryDatabase {
    fn begin(&mut self) -> Result<()> {
        if self.committed.is_some() {
            return Err(Error::Persistence("transaction already open".into()));
        }
        self.committed = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.committed
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::Persistence("commit without transaction".into()))
    }

    fn rollback(&mut self) {
        if let Some(tables) = self.committed.take() {
            self.tables = tables;
        }
    }

    fn in_transaction(&self) -> bool {
        self.committed.is_some()
    }

    fn insert_landscape(&mut self, mut row: LandscapeRow) -> Result<RowId> {
        let tables = self.write()?;
        row.id = tables.next_id();
        let id = row.id;
        tables.landscapes.push(row);
        Ok(id)
    }

    fn update_landscape(&mut self, row: &LandscapeRow) -> Result<()> {
        let tables = self.write()?;
        let slot = tables
            .landscapes
            .iter_mut()
            .find(|r| r.id == row.id)
            .ok_or_else(|| missing("landscape", row.id))?;
        *slot = row.clone();
        Ok(())
    }

    fn landscape(&self, id: RowId) -> Result<Option<LandscapeRow>> {
        Ok(self.tables.landscapes.iter().find(|r| r.id == id).cloned())
    }

    fn insert_block(&mut self, mut row: BlockRow) -> Result<RowId> {
        let tables = self.write()?;
        row.id = tables.next_id();
        let id = row.id;
        tables.blocks.push(row);
        Ok(id)
    }

    fn update_block_data(&mut self, id: RowId, heights: Vec<u8>, colors: Vec<u8>) -> Result<()> {
        let tables = self.write()?;
        let row = tables.blocks.iter_mut().find(|r| r.id == id).ok_or_else(|| missing("block", id))?;
        row.heights = heights;
        row.colors = colors;
        Ok(())
    }

    fn blocks(&self, landscape_id: RowId) -> Result<Vec<BlockRow>> {
        let mut rows: Vec<BlockRow> = self
            .tables
            .blocks
            .iter()
            .filter(|r| r.landscape_id == landscape_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.block_index);
        Ok(rows)
    }

    fn replace_variance(&mut self, block_id: RowId, variance: &[f32]) -> Result<()> {
        let tables = self.write()?;
        tables.variance.retain(|r| r.block_id != block_id);
        tables.variance.extend(variance.iter().enumerate().map(|(level, v)| VarianceRow {
            block_id,
            level: level as u32,
            variance: *v,
        }));
        Ok(())
    }

    fn variance(&self, block_id: RowId) -> Result<Vec<f32>> {
        let mut rows: Vec<&VarianceRow> = self.tables.variance.iter().filter(|r| r.block_id == block_id).collect();
        rows.sort_by_key(|r| r.level);
        Ok(rows.into_iter().map(|r| r.variance).collect())
    }

    fn insert_paint_layer(&mut self, mut row: PaintLayerRow) -> Result<RowId> {
        let tables = self.write()?;
        row.id = tables.next_id();
        let id = row.id;
        tables.paint_layers.push(row);
        Ok(id)
    }

    fn update_paint_layer(&mut self, row: &PaintLayerRow) -> Result<()> {
        let tables = self.write()?;
        let slot = tables
            .paint_layers
            .iter_mut()
            .find(|r| r.id == row.id)
            .ok_or_else(|| missing("paint layer", row.id))?;
        *slot = row.clone();
        Ok(())
    }

    fn delete_paint_layer(&mut self, id: RowId) -> Result<()> {
        let tables = self.write()?;
        let before = tables.paint_layers.len();
        tables.paint_layers.retain(|r| r.id != id);
        if tables.paint_layers.len() == before {
            return Err(missing("paint layer", id));
        }
        Ok(())
    }

    fn paint_layers(&self, block_id: RowId) -> Result<Vec<PaintLayerRow>> {
        Ok(self.tables.paint_layers.iter().filter(|r| r.block_id == block_id).cloned().collect())
    }

    fn replace_procedural_layers(&mut self, landscape_id: RowId, rows: Vec<ProceduralLayerRow>) -> Result<Vec<RowId>> {
        let tables = self.write()?;
        tables.procedural_layers.retain(|r| r.landscape_id != landscape_id);
        let mut ids = Vec::with_capacity(rows.len());
        for (position, mut row) in rows.into_iter().enumerate() {
            row.id = tables.next_id();
            row.landscape_id = landscape_id;
            row.position = position as u32;
            ids.push(row.id);
            tables.procedural_layers.push(row);
        }
        Ok(ids)
    }

    fn procedural_layers(&self, landscape_id: RowId) -> Result<Vec<ProceduralLayerRow>> {
        let mut rows: Vec<ProceduralLayerRow> = self
            .tables
            .procedural_layers
            .iter()
            .filter(|r| r.landscape_id == landscape_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.position);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::database::{encode_heights, transaction};

    fn block(landscape_id: RowId, index: u32) -> BlockRow {
        BlockRow {
            landscape_id,
            block_index: index,
            right: 9,
            bottom: 9,
            heights: encode_heights(&[index as i16; 81]),
            ..Default::default()
        }
    }

    #[test]
    fn test_ids_are_positive_and_unique() {
        let mut db = MemoryDatabase::new();
        let landscape = db.insert_landscape(LandscapeRow::default()).unwrap();
        let a = db.insert_block(block(landscape, 1)).unwrap();
        let b = db.insert_block(block(landscape, 0)).unwrap();
        assert!(landscape > 0 && a > landscape && b > a);
        let rows = db.blocks(landscape).unwrap();
        assert_eq!(rows.iter().map(|r| r.block_index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut db = MemoryDatabase::new();
        let landscape = db.insert_landscape(LandscapeRow::default()).unwrap();
        db.fail_writes_after(2);

        let result = transaction(&mut db, |db| {
            for index in 0..4 {
                db.insert_block(block(landscape, index))?;
            }
            Ok(())
        });
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(db.block_count(), 0);
        assert!(!db.in_transaction());
    }

    #[test]
    fn test_variance_rows_replace_and_order() {
        let mut db = MemoryDatabase::new();
        db.replace_variance(7, &[0.0, 4.0, 9.0]).unwrap();
        db.replace_variance(7, &[0.0, 16.0]).unwrap();
        db.replace_variance(8, &[1.0]).unwrap();
        assert_eq!(db.variance(7).unwrap(), vec![0.0, 16.0]);
        assert_eq!(db.variance(9).unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn test_procedural_layers_keep_order() {
        let mut db = MemoryDatabase::new();
        let rows = (0..3)
            .map(|i| ProceduralLayerRow { material_id: 10 + i, ..Default::default() })
            .collect();
        let ids = db.replace_procedural_layers(1, rows).unwrap();
        assert_eq!(ids.len(), 3);
        let stored = db.procedural_layers(1).unwrap();
        assert_eq!(stored.iter().map(|r| r.material_id).collect::<Vec<_>>(), vec![10, 11, 12]);
        assert!(stored.iter().all(|r| r.landscape_id == 1));
    }

    #[test]
    fn test_paint_layer_lifecycle() {
        let mut db = MemoryDatabase::new();
        let id = db
            .insert_paint_layer(PaintLayerRow { block_id: 3, material_id: 2, ..Default::default() })
            .unwrap();
        let mut row = db.paint_layers(3).unwrap().remove(0);
        row.reference_count = 12;
        db.update_paint_layer(&row).unwrap();
        assert_eq!(db.paint_layers(3).unwrap()[0].reference_count, 12);
        db.delete_paint_layer(id).unwrap();
        assert!(matches!(db.delete_paint_layer(id), Err(Error::Persistence(_))));
        assert_eq!(db.paint_layer_count(), 0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.rkw");

        let mut db = MemoryDatabase::new();
        let landscape = db
            .insert_landscape(LandscapeRow { config: "{}".into(), field_width: 9, field_height: 9, ..Default::default() })
            .unwrap();
        let block_id = db.insert_block(block(landscape, 0)).unwrap();
        db.replace_variance(block_id, &[0.0, 2.5]).unwrap();
        db.save(&path).unwrap();

        let loaded = MemoryDatabase::open(&path).unwrap();
        assert_eq!(loaded.tables, db.tables);
        assert_eq!(loaded.variance(block_id).unwrap(), vec![0.0, 2.5]);
    }

    #[test]
    fn test_save_skips_uncommitted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.rkw");

        let mut db = MemoryDatabase::new();
        db.insert_landscape(LandscapeRow::default()).unwrap();
        db.begin().unwrap();
        db.insert_block(block(1, 0)).unwrap();
        db.save(&path).unwrap();
        db.commit().unwrap();

        assert_eq!(MemoryDatabase::open(&path).unwrap().block_count(), 0);
        assert_eq!(db.block_count(), 1);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rkw");
        std::fs::write(&path, lz4_flex::compress_prepend_size(&[1, 2, 3, 4, 5])).unwrap();
        assert!(matches!(MemoryDatabase::open(&path), Err(Error::Persistence(_))));
    }
}
