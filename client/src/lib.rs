//! Client-side synchronization core: clock-skew estimation, drift-corrected
//! playback, and peer-mesh signaling for reaction cameras.

pub mod clock;
pub mod drift;
pub mod link;
pub mod media;
pub mod mesh;
pub mod protocol;
pub mod session;

pub use clock::SkewEstimator;
pub use drift::{DriftAction, DriftController};
pub use link::ServerLink;
pub use media::{CameraCapture, MediaHandle, SimulatedMedia};
pub use mesh::{PeerConnection, PeerConnectionFactory, PeerMeshCoordinator};
pub use session::{ClientSession, SessionConfig, SessionEvent};
