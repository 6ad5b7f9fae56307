pub mod domain;
pub mod telemetry;
pub mod transport;

pub use domain::*;
pub use transport::*;

// Re-export mocks when the testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockEventSink;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockPeerAdapter;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockRegistrationCompleter;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockUpstreamGateway;
