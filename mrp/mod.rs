#![deny(dead_code)]
#![deny(unused_imports)]

pub mod hierarchical;
pub mod posterior;
pub mod poststrat;
pub mod selection;

pub use hierarchical::{
    AreaDesign, EstimationError, FitReliability, FittedHierarchicalModel, HierarchicalConfig,
    RandomEffects, fit_hierarchical,
};
pub use poststrat::{
    AdjustmentMethod, CoefficientSource, PoststratConfig, PoststratReport, PoststratTable,
    Weighting, load_poststrat_table, poststratify,
};
pub use selection::{SelectionOutcome, select_model};
