//! Contracts shared between the mediadup filesystem and its encodings
//!
//! The filesystem never parses encodings or media containers itself. It
//! consumes them through [`reader::ReaderFactory`], [`reader::Reader`] and
//! [`config::ConfigReader`]. [`segment`] provides a reference encoding that
//! implements those contracts.

pub mod checksum;
pub mod config;
pub mod reader;
pub mod segment;

pub mod prelude {
    pub use crate::config::{
        collect_config_paths, ConfigError, ConfigReader, MountEntry, TomlConfigReader,
    };
    pub use crate::reader::{Reader, ReaderError, ReaderFactory, SourceDependency};
    pub use crate::segment::{Segment, SegmentMap, SegmentReaderFactory};
}
