//! Studio artifacts: server-side generation jobs tracked through polling.

pub mod artifact;
pub mod decode;
pub mod tracker;

pub use artifact::{
    to_transport_instructions, Artifact, ArtifactConfig, ArtifactKind, ArtifactStatus,
    SlideInstruction,
};
pub use tracker::ArtifactJobTracker;
