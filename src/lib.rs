pub mod asn;
pub mod background;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod external;
pub mod files;
pub mod fits_io;
pub mod flat;
pub mod geometry;
pub mod image;
pub mod pipeline;
pub mod recipes;
pub mod regions;
pub mod shifts;

// Main entry point
pub mod cli_main;

// Re-export commonly used items
pub use asn::AsnFile;
pub use config::Config;
pub use external::{ToolRunner, Workspace};
pub use fits_io::{Exposure, FitsFile};
