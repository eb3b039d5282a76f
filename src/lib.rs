#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

#[path = "../shared/mod.rs"]
pub mod shared;

#[path = "../calibrate/mod.rs"]
pub mod calibrate;

#[path = "../map/mod.rs"]
pub mod map;

#[path = "../mrp/mod.rs"]
pub mod mrp;

#[path = "../frame/mod.rs"]
pub mod frame;
