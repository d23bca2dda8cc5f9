pub(crate) mod blob;
pub mod id;
pub(crate) mod mount;
pub(crate) mod resources;
pub(crate) mod task;

pub use self::blob::{BlobMeta, BlobState};
pub use self::id::{is_valid_id, new_id, BlobId, RpcId, TaskId};
pub use self::mount::{Mount, MountFlags, MountType};
pub use self::resources::Resources;
pub use self::task::{TaskRecord, TaskSpec, TaskState};
