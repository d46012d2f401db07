//! The main entry point for the Granite database engine.
//!
//! Opens every database under the data directory; statement execution is
//! driven by the external shell and parser.

use granite_bin::instance::{DbEngine, DEFAULT_DATA_DIR};

fn main() -> Result<(), granite_bin::errors::DbError> {
    let data_dir =
        std::env::var("GRANITE_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
    let engine = DbEngine::new(data_dir)?;
    let mut names = engine.database_names();
    names.sort_unstable();
    println!("granite: {} database(s) available: {:?}", names.len(), names);
    Ok(())
}
