pub mod session;
pub mod settings;
pub mod transport;
pub mod viewport;

pub use session::{ConnectionState, SessionError, StreamingSession};
pub use settings::{SettingsHandle, SettingsOverrides, SettingsStack, StreamSettings};
pub use transport::{StreamTransport, TransportConnector, TransportError, TransportEvent};
