//! Realtime synchronization core for the scheduling views: a reconnecting
//! channel client, the branch/date scope state, and the coordinators that
//! refresh a view when a relevant event arrives.

pub mod channel;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod fanout;
pub mod rest;
pub mod router;
pub mod scope;
pub mod source;

pub use channel::{ChannelClient, ChannelError, ChannelStatus, ConnectionStatus};
pub use config::{ChannelConfig, Deployment};
pub use connector::{Connection, Connector, Peer, WsConnector};
pub use coordinator::{
    CoordinatorError, CoordinatorStats, EventAction, Notice, NoticeLevel, RefreshCoordinator,
    ViewPhase, ViewProfile, ViewRenderer,
};
pub use fanout::{FanoutReport, HandlerId, HandlerList};
pub use rest::RestAppointmentSource;
pub use router::EventRouter;
pub use scope::{ObserverId, ScopeState};
pub use source::{AppointmentSource, FetchError};
