pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod serde_ext;
pub mod time;
