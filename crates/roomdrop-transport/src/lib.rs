//! roomdrop transport seam.
//!
//! The protocol layer never talks to a concrete peer-to-peer stack. It talks
//! to a [`PubSubNode`] created by a [`NodeFactory`]: dial bootstrap peers,
//! wait for the push and pull-subscription capabilities, subscribe to a
//! channel, publish bytes, sample the peer count.
//!
//! With the `gossip` feature, `GossipNodeFactory` builds nodes that join
//! one iroh-gossip topic per channel. Bootstrap entries are endpoint ids.
//!
//! [`MemoryNetwork`] is an in-process implementation where every node that
//! dialed a reachable endpoint shares the same broadcast channels. It
//! reflects a node's own publishes back to it, like real relay networks do.
//!
//! # Quick start
//!
//! ```rust
//! use roomdrop_transport::{MemoryNetwork, NodeFactory, Protocol, PubSubNode};
//!
//! # async fn example() -> Result<(), roomdrop_transport::TransportError> {
//! let network = MemoryNetwork::with_endpoints(["/dns4/boot-1.roomdrop/tcp/443/wss"]);
//! let node = network.factory().create().await?;
//! node.dial("/dns4/boot-1.roomdrop/tcp/443/wss").await?;
//! node.wait_for_protocols(&[Protocol::LightPush, Protocol::Filter]).await?;
//!
//! let mut sub = node.subscribe("/roomdrop/1/room-lobby/proto").await?;
//! node.publish("/roomdrop/1/room-lobby/proto", b"hello").await?;
//! assert_eq!(sub.recv().await.as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

mod error;
#[cfg(feature = "gossip")]
mod gossip;
mod memory;
mod node;

pub use error::TransportError;
#[cfg(feature = "gossip")]
pub use gossip::{parse_endpoint, topic_for, GossipNode, GossipNodeFactory};
pub use memory::{MemoryNetwork, MemoryNode, MemoryNodeFactory};
pub use node::{NodeFactory, Protocol, PubSubNode, Subscription, REQUIRED_PROTOCOLS};
