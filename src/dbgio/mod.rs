//! Background diagnostics.

pub mod csv_dumper;

pub use csv_dumper::{CsvConfig, CsvDumper, CsvEntry, CsvProducer};
