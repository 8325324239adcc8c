mod compress;
mod create_backup;
mod delete;
mod upload;

pub use compress::CompressExecutor;
pub use create_backup::CreateBackupExecutor;
pub use delete::DeleteExecutor;
pub use upload::{FileSystemTarget, UploadExecutor, UploadTarget};
