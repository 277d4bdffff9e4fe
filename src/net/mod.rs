//! Network delivery: wire codec, connections, flow control and the worker

pub mod codec;
pub mod connection;
pub mod flow;
pub mod host;
pub mod keep_alive;
pub mod tls;
pub mod worker;

pub use codec::{ControlFrame, FrameCodec, LumberjackFrameCodec, RawFrameCodec};
pub use connection::{ConnectionInfo, ConnectionManager, ConnectionSettings, LinkState};
pub use flow::{
    ack_window, Ack, AckFlowController, AckReader, FlowController, Unbounded, DEFAULT_WINDOW_SIZE,
};
pub use host::{parse_destinations, HostInfo};
pub use keep_alive::{KeepAlive, SendClock};
pub use tls::TlsConfig;
pub use worker::{DeliveryWorker, Envelope, DEFAULT_MAX_WRITE_ATTEMPTS};
