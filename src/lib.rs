//! relaymq - an MQTT v3.1.1 broker core
//!
//! Three subsystems carry the weight: the packet codec (`codec`,
//! `protocol`), the wildcard-aware topic index (`topic`) and the
//! publish-fanout feed (`feed`). The `broker` module wires them to TCP.

pub mod broker;
pub mod codec;
pub mod config;
pub mod feed;
pub mod protocol;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use codec::{Decoder, Encoder};
pub use config::Config;
pub use feed::{Feed, PublishEvent, Subscription};
pub use protocol::{ConnectReturnCode, Packet, QoS};
pub use topic::TopicIndex;
