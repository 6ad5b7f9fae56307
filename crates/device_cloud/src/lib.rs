pub mod attributes;
pub mod channel;
pub mod client;
pub mod discovery;
pub mod dispatch;
pub mod gateway;

pub use attributes::AttributeRetrievalDispatcher;
pub use channel::NotificationMode;
pub use client::{SourceCloudClient, SourceCloudConfig};
pub use dispatch::EventDispatcher;
pub use gateway::CloudGateway;
