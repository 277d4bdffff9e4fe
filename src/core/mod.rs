//! Core types and traits

pub mod appender;
pub mod config;
pub mod encoder;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod ring_buffer;
pub mod shutdown;

pub use appender::Appender;
pub use config::{
    AppenderConfig, DeliverySettings, DEFAULT_DROPPED_WARN_FREQUENCY, DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use encoder::{Encoder, JsonLinesEncoder, LineEncoder};
pub use error::{DeliveryError, Result};
pub use listener::{DeliveryListener, Listeners};
pub use metrics::DeliveryMetrics;
pub use ring_buffer::{RingConsumer, RingProducer, DEFAULT_RING_BUFFER_SIZE};
pub use shutdown::ShutdownSignal;
