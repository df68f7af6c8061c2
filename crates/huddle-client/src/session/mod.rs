//! Session core: source selection, virtual background, peers and recording

pub mod compositor;
pub mod facade;
pub mod notice;
pub mod peers;
pub mod recorder;
pub mod registry;
pub mod segmentation;

pub use compositor::{Compositor, CompositorConfig};
pub use facade::{MediaState, RecordingToggle, Session, SessionDeps, SessionOptions, SessionSummary};
pub use notice::{Feature, Notice};
pub use peers::{ConnectionState, Participant, PeerSessionManager};
pub use recorder::{Recorder, RecorderConfig, RecordingArtifact, RecordingStart, RecordingState};
pub use registry::{OutboundSelection, SourceChanged, StreamSourceRegistry};
pub use segmentation::{NoModel, Segmentation, Segmenter};
