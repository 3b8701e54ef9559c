pub mod decompress;
pub mod encode;
pub mod lock;

pub use decompress::StreamDecompressor;
pub use encode::{format_bytes, join_abs, storage_safe_decode, storage_safe_encode};
pub use lock::{lock as lock_file, try_lock, FileLock};
