//! # ps-store
//!
//! Persistence for sweep results: a hierarchical Parquet container
//! ([`SweepStore`]), a flat CSV export and an opt-in interpolation pass that
//! fills failed runs from their successful neighbours.

mod columnar;
pub mod container;
pub mod csv_export;
pub mod interpolate;

pub use container::SweepStore;
pub use csv_export::{export_csv, output_columns, read_csv, write_records, CsvTable};
pub use interpolate::interpolate_failures;
