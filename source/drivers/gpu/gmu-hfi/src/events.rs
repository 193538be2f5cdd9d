// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Unsolicited firmware messages and the sink that receives them.

use log::{debug, error, warn};

use crate::codec::{self, id};

/// A message from the firmware that is not an ack for a waiting request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirmwareEvent {
    /// F2H_MSG_ERR: firmware-side error report.
    Error { code_hi: u16, code_lo: u16, text: String },
    /// F2H_MSG_DEBUG.
    Debug { ty: u32, timestamp: u32, data: u32 },
    /// An ack whose sender has already given up, or never existed.
    UnmatchedAck { req_hdr: u32 },
    /// Any other id.
    Unsupported { id: u8 },
    /// The firmware core raised its fault interrupt.
    Fault,
}

impl FirmwareEvent {
    /// Decodes a non-ack message. `msg` starts with its header word.
    pub fn decode(msg: &[u32]) -> Self {
        let hdr = msg.first().copied().unwrap_or(0);
        let word = |i: usize| msg.get(i).copied().unwrap_or(0);
        match codec::msg_id(hdr) {
            id::F2H_ERR => {
                let code = word(1);
                Self::Error {
                    code_hi: (code >> 16) as u16,
                    code_lo: code as u16,
                    text: decode_text(msg.get(2..).unwrap_or(&[])),
                }
            }
            id::F2H_DEBUG => Self::Debug { ty: word(1), timestamp: word(2), data: word(3) },
            other => Self::Unsupported { id: other },
        }
    }
}

/// NUL-terminated little-endian bytes packed into words.
fn decode_text(words: &[u32]) -> String {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .take_while(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Receiver of [`FirmwareEvent`]s. Called on whichever thread drains the queue.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: FirmwareEvent);
}

/// Logs every event; the default sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn deliver(&self, event: FirmwareEvent) {
        match event {
            FirmwareEvent::Error { code_hi, code_lo, text } => {
                error!("hfi: GMU firmware error {code_hi}:{code_lo} {text}")
            }
            FirmwareEvent::Debug { ty, timestamp, data } => {
                debug!("hfi: GMU debug type={ty} ts={timestamp:#x} data={data:#x}")
            }
            FirmwareEvent::UnmatchedAck { req_hdr } => {
                warn!("hfi: ack for {req_hdr:#010x} has no waiting sender")
            }
            FirmwareEvent::Unsupported { id } => {
                warn!("hfi: unsupported message id {id} ({})", codec::id::name(id))
            }
            FirmwareEvent::Fault => error!("hfi: GMU core fault"),
        }
    }
}
