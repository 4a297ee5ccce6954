//! Built-in tasks.

mod file_write;
mod script;
mod spec_data;

pub use file_write::{FileToWrite, FileWriteTask};
pub use script::ScriptTask;
pub use spec_data::{ModSpecTask, StoreDataTask};
