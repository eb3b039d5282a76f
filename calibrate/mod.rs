#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod diagnostics;
pub mod ensemble;
pub mod folds;
pub mod learners;
pub mod model;
