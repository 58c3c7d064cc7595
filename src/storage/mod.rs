pub mod blob_store;
pub mod index;
pub mod observer;
pub mod record;
pub mod store;

pub use blob_store::{BlobKey, BlobReadStream, BlobStore, BlobWriteSink};
pub use index::{IndexDefinition, IndexType};
pub use observer::{ChangeEntry, ObserverToken};
pub use record::{flags, revid, RawRecord};
pub use store::{next_instance_id, PutRequest, Store};
