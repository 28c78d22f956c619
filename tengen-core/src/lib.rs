pub mod batch;
pub mod features;

pub use batch::Batch;
pub use features::{
    encode_features, BoardFeatures, BoardSpec, Color, Policy, Stones, MOVE_HISTORY,
    NUM_STONE_FEATURES, PLAYER_FEATURE,
};
