//! Database instances and the engine-level owner of all open databases.
//!
//! Each database is one file under the data directory; its instance owns
//! the buffer pool (which owns the disk manager) and the catalog.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata::disk::DiskManager;
use strata::BufferPoolManager;

use crate::catalog::CatalogManager;
use crate::errors::DbError;

/// Default location for database files, overridable via `GRANITE_DATA_DIR`.
pub const DEFAULT_DATA_DIR: &str = "./databases";

/// One open database: buffer pool + catalog over a single file.
pub struct DbInstance {
    bpm: Arc<BufferPoolManager>,
    catalog: CatalogManager,
}

impl DbInstance {
    /// Opens the database file at `path`. `init` formats a fresh database
    /// (reserving the catalog meta and index roots pages); otherwise the
    /// existing catalog is loaded.
    pub fn new(path: &Path, init: bool) -> Result<DbInstance, DbError> {
        let disk = DiskManager::open(path)?;
        let bpm = Arc::new(BufferPoolManager::new(disk));
        if init {
            let catalog_meta = bpm.new_page()?;
            let index_roots = bpm.new_page()?;
            debug_assert_eq!(catalog_meta.page_id(), strata::CATALOG_META_PAGE_ID);
            debug_assert_eq!(index_roots.page_id(), strata::INDEX_ROOTS_PAGE_ID);
        }
        let catalog = CatalogManager::new(Arc::clone(&bpm), init)?;
        Ok(DbInstance { bpm, catalog })
    }

    pub fn catalog(&self) -> &CatalogManager {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut CatalogManager {
        &mut self.catalog
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.bpm
    }

    /// Forces the catalog and every resident page out to the file.
    pub fn flush(&self) -> Result<(), DbError> {
        self.catalog.flush_catalog_meta_page()?;
        self.bpm.flush_all()?;
        Ok(())
    }
}

/// The top-level owner: every database under the data directory, plus the
/// currently selected one.
pub struct DbEngine {
    data_dir: PathBuf,
    databases: HashMap<String, DbInstance>,
    current: Option<String>,
}

impl DbEngine {
    /// Opens every database file already present under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<DbEngine, DbError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(DbError::from)?;
        let mut databases = HashMap::new();
        let entries = fs::read_dir(&data_dir).map_err(DbError::from)?;
        for entry in entries {
            let entry = entry.map_err(DbError::from)?;
            if !entry.file_type().map_err(DbError::from)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            crate::granite_debug_log!("[DbEngine::new] Opening database '{name}'");
            let instance = DbInstance::new(&entry.path(), false)?;
            databases.insert(name, instance);
        }
        Ok(DbEngine {
            data_dir,
            databases,
            current: None,
        })
    }

    pub fn database_names(&self) -> Vec<&str> {
        self.databases.keys().map(String::as_str).collect()
    }

    pub fn create_database(&mut self, name: &str) -> Result<(), DbError> {
        if self.databases.contains_key(name) {
            return Err(DbError::AlreadyExist);
        }
        let path = self.data_dir.join(name);
        let instance = DbInstance::new(&path, true)?;
        self.databases.insert(name.to_string(), instance);
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> Result<(), DbError> {
        let _instance = self.databases.remove(name).ok_or(DbError::NotExist)?;
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        fs::remove_file(self.data_dir.join(name)).map_err(DbError::from)?;
        Ok(())
    }

    pub fn use_database(&mut self, name: &str) -> Result<(), DbError> {
        if !self.databases.contains_key(name) {
            return Err(DbError::NotExist);
        }
        self.current = Some(name.to_string());
        Ok(())
    }

    pub fn current_database(&self) -> Option<&DbInstance> {
        self.current.as_ref().and_then(|name| self.databases.get(name))
    }

    pub fn current_database_mut(&mut self) -> Option<&mut DbInstance> {
        match &self.current {
            Some(name) => self.databases.get_mut(name),
            None => None,
        }
    }

    pub fn database(&self, name: &str) -> Option<&DbInstance> {
        self.databases.get(name)
    }

    pub fn database_mut(&mut self, name: &str) -> Option<&mut DbInstance> {
        self.databases.get_mut(name)
    }

    /// Flushes every open database.
    pub fn flush_all(&self) -> Result<(), DbError> {
        for instance in self.databases.values() {
            instance.flush()?;
        }
        Ok(())
    }
}
