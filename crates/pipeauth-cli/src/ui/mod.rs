//! Terminal output helpers.

mod output;

pub use output::{error, header, info, kv, query, success, table_row, warning};
