pub mod database;
pub mod document;
pub mod encoding;
pub mod error;
pub mod storage;
pub mod value;

pub use database::{
    ChangeListenerToken, Database, DatabaseChange, DatabaseOptions, DocumentVersioning,
};
pub use document::{Blob, ConflictResolver, Document, ListenerToken, Subdocument};
pub use error::{DbError, DbResult};
pub use storage::{IndexDefinition, IndexType};
pub use value::Value;
