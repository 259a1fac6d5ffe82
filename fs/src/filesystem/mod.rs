//! On-disk directory structures and the file cursor built on them.

pub mod attributes;
pub mod directory;
pub mod filename;
pub mod files;
pub mod timestamp;
