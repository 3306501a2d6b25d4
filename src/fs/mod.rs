//! FUSE filesystem implementation

pub mod attr;
pub mod bucketfs;
pub mod handles;
pub mod inode;
pub mod ops;

pub use bucketfs::BucketFs;
pub use handles::HandleRegistry;
pub use inode::{InodeTable, ROOT_INO};
pub use ops::{FsError, FsStats, SetAttr};
