//! Agent messaging
//!
//! Every agent process owns a [`MessageBus`] endpoint on top of a shared
//! [`Transport`]. The bus gives each agent direct, role and task-wide
//! delivery, request/reply with correlation ids, deduplication, TTL expiry,
//! priority dispatch and a heartbeat.
//!
//! ```text
//! ┌──────────────┐   publish    ┌──────────────┐   subscribe   ┌──────────────┐
//! │  MessageBus  │─────────────▶│  Transport   │──────────────▶│  MessageBus  │
//! │  (agent A)   │              │ agents:<tid> │               │  (agent B)   │
//! └──────┬───────┘              └──────────────┘               └──────────────┘
//!        │ spawn
//!        ▼
//! ┌──────────────┐
//! │  AuditSink   │
//! └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use coordination::messaging::{InMemoryTransport, MessageBus, AgentRole, MessageType};
//!
//! let transport = InMemoryTransport::new().shared();
//! let bus = MessageBus::new("coder-1", AgentRole::Coder, "task-1", transport, Default::default())
//!     .shared();
//! let _handle = bus.on_message(MessageType::TaskAssignment, |msg| async move {
//!     println!("assigned: {}", msg.payload);
//!     Ok(())
//! });
//! bus.initialize().await?;
//! ```

pub mod audit;
pub mod bus;
pub mod transport;
pub mod types;

pub use audit::{AuditEntry, AuditError, AuditSink, MemoryAuditLog, SharedAuditSink, TracingAuditSink};
pub use bus::{
    BusError, BusResult, IngestOutcome, MessageBus, MessageHandler, Recipient, SharedMessageBus,
    Unsubscribe,
};
pub use transport::{
    agent_event, agents_channel, role_event, state_channel, InMemoryTransport, SharedTransport,
    Transport, TransportError, TransportResult, EVENT_BROADCAST, EVENT_STATE_CHANGE,
};
pub use types::{
    AgentMessage, AgentRole, HeartbeatPayload, InterruptAction, InterruptPayload, MessageId,
    MessagePriority, MessageType,
};
