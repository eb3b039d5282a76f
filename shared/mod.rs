// Settings are scoped to their owning modules; `config` only aggregates them.
pub mod config;
pub mod faer_ndarray;
pub mod files;
