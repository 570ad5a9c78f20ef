use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use log::debug;
use parking_lot::Mutex;

use crate::buffer_pool::ArcBufferPool;
use crate::errors::Error;
use crate::index::{BPlusTree, KeyManager};
use crate::pages::{PageId, CATALOG_META_PAGE_ID, INDEX_ROOTS_PAGE_ID};
use crate::record::{ByteReader, Row, Schema};
use crate::recovery::LogStream;
use crate::table::TableHeap;
use crate::transaction::{LockManager, Transaction};

pub type TableId = u32;
pub type IndexId = u32;

pub const CATALOG_META_MAGIC_NUM: u32 = 89_849;
pub const TABLE_META_MAGIC_NUM: u32 = 344_528;
pub const INDEX_META_MAGIC_NUM: u32 = 627_298;

/// Page-0 directory: which page holds each table's and index's metadata.
#[derive(Debug, Default, PartialEq)]
struct CatalogMeta {
    table_meta_pages: BTreeMap<TableId, PageId>,
    index_meta_pages: BTreeMap<IndexId, PageId>,
}

impl CatalogMeta {
    fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&CATALOG_META_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(self.table_meta_pages.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.index_meta_pages.len() as u32).to_le_bytes());
        for (id, page_id) in &self.table_meta_pages {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&page_id.to_le_bytes());
        }
        for (id, page_id) in &self.index_meta_pages {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&page_id.to_le_bytes());
        }
    }

    fn deserialize_from(reader: &mut ByteReader) -> Self {
        let magic = reader.read_u32();
        assert_eq!(magic, CATALOG_META_MAGIC_NUM, "invalid catalog magic number");
        let table_count = reader.read_u32();
        let index_count = reader.read_u32();

        let mut meta = CatalogMeta::default();
        for _ in 0..table_count {
            let id = reader.read_u32();
            let page_id = reader.read_i32();
            meta.table_meta_pages.insert(id, page_id);
        }
        for _ in 0..index_count {
            let id = reader.read_u32();
            let page_id = reader.read_i32();
            meta.index_meta_pages.insert(id, page_id);
        }
        meta
    }
}

/// Everything the engine needs to operate one table.
pub struct TableInfo {
    table_id: TableId,
    name: String,
    heap: Arc<TableHeap>,
}

impl std::fmt::Debug for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInfo")
            .field("table_id", &self.table_id)
            .field("name", &self.name)
            .finish()
    }
}

impl TableInfo {
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap(&self) -> &Arc<TableHeap> {
        &self.heap
    }

    pub fn schema(&self) -> &Schema {
        self.heap.schema()
    }

    fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&TABLE_META_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.heap.first_page_id().to_le_bytes());
        self.schema().serialize_to(buf);
    }
}

/// A secondary index over a table: key projection plus the B+ tree.
pub struct IndexInfo {
    index_id: IndexId,
    name: String,
    table_id: TableId,
    key_columns: Vec<u32>,
    key_schema: Schema,
    tree: Mutex<BPlusTree>,
}

impl std::fmt::Debug for IndexInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexInfo")
            .field("index_id", &self.index_id)
            .field("name", &self.name)
            .field("table_id", &self.table_id)
            .field("key_columns", &self.key_columns)
            .field("key_schema", &self.key_schema)
            .finish()
    }
}

impl IndexInfo {
    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn key_schema(&self) -> &Schema {
        &self.key_schema
    }

    pub fn tree(&self) -> &Mutex<BPlusTree> {
        &self.tree
    }

    /// Project a table row onto this index's key.
    pub fn key_of(&self, row: &Row, table_schema: &Schema) -> Row {
        row.key_from_row(table_schema, &self.key_schema)
    }

    fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&INDEX_META_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&self.index_id.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&(self.key_columns.len() as u32).to_le_bytes());
        for column in &self.key_columns {
            buf.extend_from_slice(&column.to_le_bytes());
        }
    }
}

/// Table and index bookkeeping persisted through the catalog meta page.
/// On a fresh file it bootstraps pages 0 (catalog meta) and 1 (index
/// roots); otherwise it reloads every table and index from their metadata
/// pages.
pub struct CatalogManager {
    bpm: ArcBufferPool,
    lock_manager: Arc<LockManager>,
    log: Arc<LogStream>,

    meta: CatalogMeta,
    next_table_id: TableId,
    next_index_id: IndexId,

    table_names: HashMap<String, TableId>,
    tables: HashMap<TableId, Arc<TableInfo>>,
    index_names: HashMap<String, HashMap<String, IndexId>>,
    indexes: HashMap<IndexId, Arc<IndexInfo>>,
}

impl CatalogManager {
    pub fn new(
        bpm: ArcBufferPool,
        lock_manager: Arc<LockManager>,
        log: Arc<LogStream>,
    ) -> Result<Self> {
        let fresh = bpm.lock().disk_manager().num_allocated_pages() == 0;
        let mut catalog = CatalogManager {
            bpm,
            lock_manager,
            log,
            meta: CatalogMeta::default(),
            next_table_id: 0,
            next_index_id: 0,
            table_names: HashMap::new(),
            tables: HashMap::new(),
            index_names: HashMap::new(),
            indexes: HashMap::new(),
        };

        if fresh {
            catalog.bootstrap()?;
        } else {
            catalog.load()?;
        }
        Ok(catalog)
    }

    fn bootstrap(&mut self) -> Result<()> {
        let mut bpm = self.bpm.lock();
        for expected in [CATALOG_META_PAGE_ID, INDEX_ROOTS_PAGE_ID] {
            let page = bpm.new_page()?;
            assert_eq!(page.page_id(), expected, "fresh file with pages in use");
            bpm.unpin_page(expected, true);
        }
        drop(bpm);
        self.flush()?;
        debug!("catalog bootstrapped");
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let page = self.bpm.lock().fetch_page(CATALOG_META_PAGE_ID)?;
        {
            let guard = page.read();
            let mut reader = ByteReader::new(guard.as_bytes());
            self.meta = CatalogMeta::deserialize_from(&mut reader);
        }
        self.bpm.lock().unpin_page(CATALOG_META_PAGE_ID, false);

        for (&table_id, &meta_page_id) in &self.meta.table_meta_pages.clone() {
            let page = self.bpm.lock().fetch_page(meta_page_id)?;
            let (id, name, first_page_id, schema) = {
                let guard = page.read();
                let mut reader = ByteReader::new(guard.as_bytes());
                let magic = reader.read_u32();
                assert_eq!(magic, TABLE_META_MAGIC_NUM, "invalid table meta magic");
                let id = reader.read_u32();
                let name_len = reader.read_u32() as usize;
                let name = String::from_utf8(reader.read_bytes(name_len).to_vec()).unwrap();
                let first_page_id = reader.read_i32();
                let schema = Schema::deserialize_from(&mut reader);
                (id, name, first_page_id, schema)
            };
            self.bpm.lock().unpin_page(meta_page_id, false);
            assert_eq!(id, table_id);

            let heap = TableHeap::open(
                self.bpm.clone(),
                self.lock_manager.clone(),
                self.log.clone(),
                first_page_id,
                schema,
            );
            self.table_names.insert(name.clone(), table_id);
            self.tables.insert(
                table_id,
                Arc::new(TableInfo {
                    table_id,
                    name,
                    heap,
                }),
            );
            self.next_table_id = self.next_table_id.max(table_id + 1);
        }

        for (&index_id, &meta_page_id) in &self.meta.index_meta_pages.clone() {
            let page = self.bpm.lock().fetch_page(meta_page_id)?;
            let (id, name, table_id, key_columns) = {
                let guard = page.read();
                let mut reader = ByteReader::new(guard.as_bytes());
                let magic = reader.read_u32();
                assert_eq!(magic, INDEX_META_MAGIC_NUM, "invalid index meta magic");
                let id = reader.read_u32();
                let name_len = reader.read_u32() as usize;
                let name = String::from_utf8(reader.read_bytes(name_len).to_vec()).unwrap();
                let table_id = reader.read_u32();
                let count = reader.read_u32() as usize;
                let key_columns = (0..count).map(|_| reader.read_u32()).collect::<Vec<u32>>();
                (id, name, table_id, key_columns)
            };
            self.bpm.lock().unpin_page(meta_page_id, false);
            assert_eq!(id, index_id);

            let table = self.tables.get(&table_id).expect("index without its table");
            let key_schema = table.schema().project(&key_columns);
            let tree = BPlusTree::new(
                index_id,
                self.bpm.clone(),
                KeyManager::new(key_schema.clone()),
                None,
                None,
            )?;
            self.index_names
                .entry(table.name().to_string())
                .or_default()
                .insert(name.clone(), index_id);
            self.indexes.insert(
                index_id,
                Arc::new(IndexInfo {
                    index_id,
                    name,
                    table_id,
                    key_columns,
                    key_schema,
                    tree: Mutex::new(tree),
                }),
            );
            self.next_index_id = self.next_index_id.max(index_id + 1);
        }

        debug!(
            "catalog loaded: {} tables, {} indexes",
            self.tables.len(),
            self.indexes.len()
        );
        Ok(())
    }

    pub fn create_table(&mut self, name: &str, schema: Schema) -> Result<Arc<TableInfo>> {
        if self.table_names.contains_key(name) {
            bail!(Error::TableAlreadyExists(name.to_string()));
        }

        let table_id = self.next_table_id;
        self.next_table_id += 1;

        let heap = TableHeap::new(
            self.bpm.clone(),
            self.lock_manager.clone(),
            self.log.clone(),
            schema,
        )?;
        let info = Arc::new(TableInfo {
            table_id,
            name: name.to_string(),
            heap,
        });

        let meta_page = self.bpm.lock().new_page()?;
        let meta_page_id = meta_page.page_id();
        {
            let mut bytes = vec![];
            info.serialize_to(&mut bytes);
            let mut guard = meta_page.write();
            guard.write_bytes(0, &bytes);
        }
        self.bpm.lock().unpin_page(meta_page_id, true);

        self.meta.table_meta_pages.insert(table_id, meta_page_id);
        self.table_names.insert(name.to_string(), table_id);
        self.tables.insert(table_id, info.clone());
        self.flush()?;
        debug!("created table {name} (id {table_id})");
        Ok(info)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<TableInfo>> {
        match self.table_names.get(name) {
            Some(table_id) => Ok(self.tables[table_id].clone()),
            None => bail!(Error::TableNotExists(name.to_string())),
        }
    }

    pub fn tables(&self) -> Vec<Arc<TableInfo>> {
        let mut tables: Vec<_> = self.tables.values().cloned().collect();
        tables.sort_by_key(|t| t.table_id());
        tables
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let Some(&table_id) = self.table_names.get(name) else {
            bail!(Error::TableNotExists(name.to_string()));
        };

        // dependent indexes go first
        let dependent: Vec<String> = self
            .index_names
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        for index_name in dependent {
            self.drop_index(name, &index_name)?;
        }
        self.index_names.remove(name);

        let info = self.tables.remove(&table_id).unwrap();
        self.table_names.remove(name);
        info.heap().delete_table()?;

        if let Some(meta_page_id) = self.meta.table_meta_pages.remove(&table_id) {
            self.bpm.lock().delete_page(meta_page_id)?;
        }
        self.flush()?;
        debug!("dropped table {name}");
        Ok(())
    }

    /// Create an index over the named columns and backfill it from the
    /// table's existing rows.
    pub fn create_index(
        &mut self,
        table_name: &str,
        index_name: &str,
        key_column_names: &[&str],
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Arc<IndexInfo>> {
        let table = self.get_table(table_name)?;
        if self
            .index_names
            .get(table_name)
            .is_some_and(|m| m.contains_key(index_name))
        {
            bail!(Error::IndexAlreadyExists(index_name.to_string()));
        }

        let mut key_columns = vec![];
        for &column_name in key_column_names {
            match table.schema().column_index(column_name) {
                Some(index) => key_columns.push(index as u32),
                None => bail!(Error::ColumnNameNotExists(column_name.to_string())),
            }
        }

        let index_id = self.next_index_id;
        self.next_index_id += 1;

        let key_schema = table.schema().project(&key_columns);
        let mut tree = BPlusTree::new(
            index_id,
            self.bpm.clone(),
            KeyManager::new(key_schema.clone()),
            None,
            None,
        )?;

        // existing rows enter the index before it becomes visible
        for (rid, row) in table.heap().iter(txn.cloned()) {
            let key = row.key_from_row(table.schema(), &key_schema);
            tree.insert(&key, rid)?;
        }

        let info = Arc::new(IndexInfo {
            index_id,
            name: index_name.to_string(),
            table_id: table.table_id(),
            key_columns,
            key_schema,
            tree: Mutex::new(tree),
        });

        let meta_page = self.bpm.lock().new_page()?;
        let meta_page_id = meta_page.page_id();
        {
            let mut bytes = vec![];
            info.serialize_to(&mut bytes);
            let mut guard = meta_page.write();
            guard.write_bytes(0, &bytes);
        }
        self.bpm.lock().unpin_page(meta_page_id, true);

        self.meta.index_meta_pages.insert(index_id, meta_page_id);
        self.index_names
            .entry(table_name.to_string())
            .or_default()
            .insert(index_name.to_string(), index_id);
        self.indexes.insert(index_id, info.clone());
        self.flush()?;
        debug!("created index {index_name} on {table_name}");
        Ok(info)
    }

    pub fn get_index(&self, table_name: &str, index_name: &str) -> Result<Arc<IndexInfo>> {
        self.index_names
            .get(table_name)
            .and_then(|m| m.get(index_name))
            .map(|id| self.indexes[id].clone())
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()).into())
    }

    pub fn table_indexes(&self, table_name: &str) -> Result<Vec<Arc<IndexInfo>>> {
        self.get_table(table_name)?;
        let mut indexes: Vec<_> = self
            .index_names
            .get(table_name)
            .map(|m| m.values().map(|id| self.indexes[id].clone()).collect())
            .unwrap_or_default();
        indexes.sort_by_key(|i| i.index_id());
        Ok(indexes)
    }

    pub fn drop_index(&mut self, table_name: &str, index_name: &str) -> Result<()> {
        let Some(&index_id) = self
            .index_names
            .get(table_name)
            .and_then(|m| m.get(index_name))
        else {
            bail!(Error::IndexNotFound(index_name.to_string()));
        };

        let info = self.indexes.remove(&index_id).unwrap();
        info.tree().lock().destroy()?;
        self.index_names
            .get_mut(table_name)
            .unwrap()
            .remove(index_name);

        if let Some(meta_page_id) = self.meta.index_meta_pages.remove(&index_id) {
            self.bpm.lock().delete_page(meta_page_id)?;
        }
        self.flush()?;
        debug!("dropped index {index_name} on {table_name}");
        Ok(())
    }

    /// Serialize the catalog meta into page 0 and write it through.
    pub fn flush(&mut self) -> Result<()> {
        let page = self.bpm.lock().fetch_page(CATALOG_META_PAGE_ID)?;
        {
            let mut bytes = vec![];
            self.meta.serialize_to(&mut bytes);
            let mut guard = page.write();
            guard.write_bytes(0, &bytes);
        }
        let mut bpm = self.bpm.lock();
        bpm.unpin_page(CATALOG_META_PAGE_ID, true);
        bpm.flush_page(CATALOG_META_PAGE_ID)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolManager;
    use crate::disk_manager::DiskManager;
    use crate::record::{Column, Field, TypeId};
    use crate::transaction::{IsolationLevel, TransactionManager};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, true),
            Column::new_char("name", 32, 1, true, false),
        ])
    }

    fn setup() -> (TempDir, CatalogManager, Arc<TransactionManager>) {
        crate::init_test_logger();
        let dir = TempDir::new().unwrap();
        let (catalog, tm) = open(&dir);
        (dir, catalog, tm)
    }

    fn open(dir: &TempDir) -> (CatalogManager, Arc<TransactionManager>) {
        let disk = DiskManager::new(dir.path().join("test.db")).unwrap();
        let bpm: ArcBufferPool = Arc::new(Mutex::new(BufferPoolManager::new(64, Arc::new(disk))));
        let lock_manager = Arc::new(LockManager::new(Duration::from_millis(50)));
        let log = Arc::new(LogStream::new());
        let tm = Arc::new(TransactionManager::new(lock_manager.clone(), log.clone()));
        let catalog = CatalogManager::new(bpm, lock_manager, log).unwrap();
        (catalog, tm)
    }

    fn row(id: i32, name: &str) -> Row {
        Row::new(vec![Field::Int(id), Field::Char(name.to_string())])
    }

    #[test]
    fn test_create_and_get_table() -> Result<()> {
        let (_dir, mut catalog, _tm) = setup();

        let info = catalog.create_table("users", test_schema())?;
        assert_eq!(info.name(), "users");
        assert_eq!(catalog.get_table("users")?.table_id(), info.table_id());

        let err = catalog.create_table("users", test_schema()).unwrap_err();
        assert_eq!(
            err.downcast::<Error>().unwrap(),
            Error::TableAlreadyExists("users".to_string())
        );

        let err = catalog.get_table("ghosts").unwrap_err();
        assert_eq!(
            err.downcast::<Error>().unwrap(),
            Error::TableNotExists("ghosts".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_create_index_validates_columns() -> Result<()> {
        let (_dir, mut catalog, _tm) = setup();
        catalog.create_table("users", test_schema())?;

        let err = catalog
            .create_index("users", "idx_bogus", &["bogus"], None)
            .unwrap_err();
        assert_eq!(
            err.downcast::<Error>().unwrap(),
            Error::ColumnNameNotExists("bogus".to_string())
        );

        catalog.create_index("users", "idx_id", &["id"], None)?;
        let err = catalog
            .create_index("users", "idx_id", &["id"], None)
            .unwrap_err();
        assert_eq!(
            err.downcast::<Error>().unwrap(),
            Error::IndexAlreadyExists("idx_id".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_index_backfill_and_lookup() -> Result<()> {
        let (_dir, mut catalog, _tm) = setup();
        let table = catalog.create_table("users", test_schema())?;

        let mut rids = vec![];
        for i in 0..50 {
            let mut r = row(i, &format!("user-{i}"));
            assert!(table.heap().insert_tuple(&mut r, None)?);
            rids.push(r.rid());
        }

        let index = catalog.create_index("users", "idx_id", &["id"], None)?;
        for i in 0..50 {
            let key = Row::new(vec![Field::Int(i)]);
            assert_eq!(
                index.tree().lock().get_value(&key)?,
                Some(rids[i as usize])
            );
        }

        // new inserts flow through the same tree
        let mut r = row(99, "late");
        table.heap().insert_tuple(&mut r, None)?;
        let key = index.key_of(&r, table.schema());
        index.tree().lock().insert(&key, r.rid())?;
        assert_eq!(
            index.tree().lock().get_value(&Row::new(vec![Field::Int(99)]))?,
            Some(r.rid())
        );
        Ok(())
    }

    #[test]
    fn test_index_over_nullable_column_with_null_rows() -> Result<()> {
        let (_dir, mut catalog, _tm) = setup();
        let table = catalog.create_table("users", test_schema())?;

        let mut named = row(1, "ada");
        table.heap().insert_tuple(&mut named, None)?;
        let mut anonymous = Row::new(vec![Field::Int(2), Field::Null]);
        table.heap().insert_tuple(&mut anonymous, None)?;

        // backfill over the nullable column must not blow up on the null
        let index = catalog.create_index("users", "idx_name", &["name"], None)?;

        assert_eq!(
            index
                .tree()
                .lock()
                .get_value(&Row::new(vec![Field::Null]))?,
            Some(anonymous.rid())
        );
        assert_eq!(
            index
                .tree()
                .lock()
                .get_value(&Row::new(vec![Field::Char("ada".to_string())]))?,
            Some(named.rid())
        );

        // the null key sorts first in a full scan
        let keys: Vec<bool> = index
            .tree()
            .lock()
            .iter()?
            .map(|(key, _)| key.field(0).is_null())
            .collect();
        assert_eq!(keys, vec![true, false]);
        Ok(())
    }

    #[test]
    fn test_catalog_round_trip_through_reopen() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let original_schema = test_schema();
        let rid;
        {
            let (mut catalog, _tm) = open(&dir);
            let table = catalog.create_table("users", original_schema.clone())?;
            let mut r = row(42, "persisted");
            table.heap().insert_tuple(&mut r, None)?;
            rid = r.rid();
            catalog.create_index("users", "idx_id", &["id"], None)?;
            catalog.flush()?;
            catalog.bpm.lock().flush_all()?;
        }

        let (catalog, _tm) = open(&dir);
        let table = catalog.get_table("users")?;
        assert_eq!(table.schema(), &original_schema);

        let read = table.heap().get_tuple(rid, None)?.unwrap();
        assert_eq!(read.field(1), &Field::Char("persisted".to_string()));

        let index = catalog.get_index("users", "idx_id")?;
        assert_eq!(
            index.tree().lock().get_value(&Row::new(vec![Field::Int(42)]))?,
            Some(rid)
        );
        Ok(())
    }

    #[test]
    fn test_drop_table_drops_dependent_indexes() -> Result<()> {
        let (_dir, mut catalog, _tm) = setup();
        let table = catalog.create_table("users", test_schema())?;
        for i in 0..10 {
            let mut r = row(i, "u");
            table.heap().insert_tuple(&mut r, None)?;
        }
        catalog.create_index("users", "idx_id", &["id"], None)?;

        let allocated = catalog.bpm.lock().disk_manager().num_allocated_pages();
        catalog.drop_table("users")?;

        assert!(catalog.get_table("users").is_err());
        assert!(catalog.get_index("users", "idx_id").is_err());
        // heap chain, meta pages and tree pages all returned
        assert!(
            catalog.bpm.lock().disk_manager().num_allocated_pages() < allocated
        );
        Ok(())
    }

    #[test]
    fn test_drop_index() -> Result<()> {
        let (_dir, mut catalog, _tm) = setup();
        catalog.create_table("users", test_schema())?;
        catalog.create_index("users", "idx_id", &["id"], None)?;

        catalog.drop_index("users", "idx_id")?;
        let err = catalog.drop_index("users", "idx_id").unwrap_err();
        assert_eq!(
            err.downcast::<Error>().unwrap(),
            Error::IndexNotFound("idx_id".to_string())
        );
        assert!(catalog.table_indexes("users")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_with_transaction_locks_rows() -> Result<()> {
        let (_dir, mut catalog, tm) = setup();
        let table = catalog.create_table("users", test_schema())?;
        for i in 0..5 {
            let mut r = row(i, "u");
            table.heap().insert_tuple(&mut r, None)?;
        }

        let txn = tm.begin(IsolationLevel::RepeatableRead);
        let count = table.heap().iter(Some(txn.clone())).count();
        assert_eq!(count, 5);
        assert_eq!(txn.locked_rids().len(), 5);
        tm.commit(&txn)?;
        assert!(txn.locked_rids().is_empty());
        Ok(())
    }
}
