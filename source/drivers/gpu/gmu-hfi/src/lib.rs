// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host side of the GMU host-firmware interface (HFI)
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module, integration tests under tests/
//!
//! PUBLIC API:
//!   - RingQueue / QueueTable: shared-memory queues and their directory
//!   - codec: message header packing and protocol constants
//!   - HfiLink: request/ack correlation over the command and message queues
//!   - LinkLifecycle: init/start/stop with version negotiation and table push
//!   - LinkConfig: tunables loaded from TOML
//!   - sim::SimFirmware: in-process firmware model for tests and tooling
//!
//! DEPENDENCIES:
//!   - gmu-hal: shared memory, doorbell and interrupt line collaborators
//!   - parking_lot: pending-request table and queue locks
//!   - log: diagnostics with the "hfi:" prefix

#![forbid(unsafe_code)]
#![deny(clippy::all)]

pub mod budget;
pub mod cmd;
pub mod codec;
pub mod config;
pub mod events;
pub mod irq;
pub mod lifecycle;
pub mod link;
pub mod pending;
pub mod queue;
pub mod sim;
pub mod table;

pub use budget::{Clock, HostClock};
pub use cmd::Request;
pub use codec::ProtocolVersion;
pub use config::{ConfigError, LinkConfig};
pub use events::{EventSink, FirmwareEvent, LogSink};
pub use irq::IrqStatus;
pub use lifecycle::{LinkLifecycle, LinkState, LmConfig, Platform, StaticTables};
pub use link::{HfiLink, LinkStats};
pub use queue::RingQueue;
pub use table::{QueueHeader, QueueId, QueueSpec, QueueTable, TableHeader};

use gmu_hal::HalError;

/// Result type returned by HFI operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the HFI queues, the link and its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The addressed queue is marked disabled in its header.
    #[error("queue is disabled")]
    QueueDisabled,
    /// Nothing to read.
    #[error("queue is empty")]
    Empty,
    /// A message does not fit the destination buffer or the protocol limit.
    #[error("message of {declared} words exceeds capacity of {capacity} words")]
    MessageTooLarge {
        /// Size announced by the message header.
        declared: usize,
        /// Room available to hold it.
        capacity: usize,
    },
    /// A ring index read from shared memory lies outside the ring.
    #[error("ring index {index} outside queue of {capacity} words")]
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Ring size in words.
        capacity: usize,
    },
    /// The command queue has no room for the message right now.
    #[error("insufficient space in queue")]
    InsufficientSpace,
    /// The queue id is not part of the initialised table.
    #[error("unknown queue {0}")]
    UnknownQueue(&'static str),
    /// A header or message is internally inconsistent.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    /// The queue table read from shared memory is not a valid layout.
    #[error("corrupt queue table: {0}")]
    CorruptTable(&'static str),
    /// No acknowledgement arrived within the deadline.
    #[error("timed out waiting for acknowledgement")]
    Timeout,
    /// The firmware acknowledged the request with an error status.
    #[error("firmware rejected request with status {code:#x}")]
    RemoteError {
        /// Status word reported by the firmware.
        code: u32,
    },
    /// The firmware speaks an incompatible major version.
    #[error("firmware version mismatch: expected major {expected}, firmware reports {actual:#010x}")]
    VersionMismatch {
        /// Major version the host requires.
        expected: u32,
        /// Raw version word reported by the firmware.
        actual: u32,
    },
    /// The link is in the faulted state.
    #[error("device faulted")]
    DeviceFaulted,
    /// The link was stopped while the request was outstanding.
    #[error("link stopped")]
    LinkStopped,
    /// The link is not started.
    #[error("link not started")]
    NotStarted,
    /// A caller supplied an out-of-range parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A second request with the same sequence number is already waiting.
    #[error("sequence {0} already has a waiting sender")]
    TooManyInFlight(u16),
    /// Shared memory could not be allocated.
    #[error("shared memory allocation failed")]
    Allocation(#[source] HalError),
    /// The interrupt handler could not be registered.
    #[error("interrupt registration failed")]
    Interrupt(#[source] HalError),
}

impl Error {
    /// Routine transport conditions; callers branch on them and they are not logged.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::QueueDisabled | Self::Empty | Self::InsufficientSpace)
    }

    /// Corrupt shared state or a host/firmware protocol mismatch.
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::MessageTooLarge { .. }
                | Self::UnknownQueue(_)
                | Self::IndexOutOfRange { .. }
                | Self::MalformedMessage(_)
                | Self::CorruptTable(_)
        )
    }
}
