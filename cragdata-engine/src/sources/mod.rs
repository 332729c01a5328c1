//! Built-in source implementations.
//!
//! These cover the shipped input trio (JSON exports, scraped HTML grade
//! tables, GPX waypoint files) and double as the template for site-specific
//! sources registered by callers. Site grammar stays out: each source reads
//! one generic shape and leaves page-specific selector logic to dedicated
//! implementations.

pub mod gps_points;
pub mod grade_table;
pub mod json_export;

pub use gps_points::GpsPointsSource;
pub use grade_table::GradeTableSource;
pub use json_export::JsonExportSource;
