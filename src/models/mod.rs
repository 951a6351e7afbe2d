pub mod media;

pub use media::{BBox, Caption, ClassificationKey, ClusterLabel, Detection, MediaItem};
