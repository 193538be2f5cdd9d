// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Typed host-to-firmware requests and their wire encoding
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (host)
//!
//! Each request encodes to `[header, body...]` with a sequence of zero; the link
//! stamps the sequence when the message is written. Table payloads (performance
//! levels, bandwidth votes, ACD) are opaque to this layer and framed verbatim.

use crate::codec::{self, id, ty, MAX_MSG_WORDS};
use crate::{Error, Result};

/// Performance and bandwidth levels the firmware accepts.
pub const MAX_GX_LEVELS: u32 = 16;

/// Feature ids carried in FEATURE_CTRL.
pub mod feature {
    pub const LM: u32 = 7;
    pub const ACD: u32 = 12;

    pub const fn name(feature: u32) -> &'static str {
        match feature {
            LM => "LM",
            ACD => "ACD",
            _ => "unknown",
        }
    }
}

/// Value ids carried in GET_VALUE / SET_VALUE.
pub mod value {
    pub const LM_CS0: u32 = 115;
}

/// Requests understood by the firmware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Legacy layout handshake announcing the debug buffer.
    Init { dbg_buffer_addr: u32, dbg_buffer_size: u32 },
    /// Offers the host's version word; the ack carries the firmware's.
    FwVersion { supported: u32 },
    PerfTable(Vec<u32>),
    BwTable(Vec<u32>),
    AcdTable(Vec<u32>),
    FeatureCtrl { feature: u32, enable: bool, data: u32 },
    GetValue { ty: u32, subtype: u32 },
    SetValue { ty: u32, subtype: u32, data: u32 },
    CoreFwStart { handle: u32 },
    GxBwPerfVote { ack_type: u32, freq: u32, bw: u32 },
    PrepareSlumber { bw: u32, freq: u32 },
    Start,
    Test,
}

impl Request {
    pub fn id(&self) -> u8 {
        match self {
            Self::Init { .. } => id::H2F_INIT,
            Self::FwVersion { .. } => id::H2F_FW_VER,
            Self::PerfTable(_) => id::H2F_PERF_TBL,
            Self::BwTable(_) => id::H2F_BW_VOTE_TBL,
            Self::AcdTable(_) => id::H2F_ACD_TBL,
            Self::FeatureCtrl { .. } => id::H2F_FEATURE_CTRL,
            Self::GetValue { .. } => id::H2F_GET_VALUE,
            Self::SetValue { .. } => id::H2F_SET_VALUE,
            Self::CoreFwStart { .. } => id::H2F_CORE_FW_START,
            Self::GxBwPerfVote { .. } => id::H2F_GX_BW_PERF_VOTE,
            Self::PrepareSlumber { .. } => id::H2F_PREPARE_SLUMBER,
            Self::Start => id::H2F_START,
            Self::Test => id::H2F_TEST,
        }
    }

    /// Encodes the request as a command message.
    pub fn encode(&self) -> Result<Vec<u32>> {
        let body: Vec<u32> = match self {
            Self::Init { dbg_buffer_addr, dbg_buffer_size } => {
                // seg_id, debug buffer, boot_state
                vec![0, *dbg_buffer_addr, *dbg_buffer_size, 1]
            }
            Self::FwVersion { supported } => vec![*supported],
            Self::PerfTable(words) | Self::BwTable(words) | Self::AcdTable(words) => words.clone(),
            Self::FeatureCtrl { feature, enable, data } => vec![*feature, u32::from(*enable), *data],
            Self::GetValue { ty, subtype } => vec![*ty, *subtype],
            Self::SetValue { ty, subtype, data } => vec![*ty, *subtype, *data],
            Self::CoreFwStart { handle } => vec![*handle],
            Self::GxBwPerfVote { ack_type, freq, bw } => vec![*ack_type, *freq, *bw],
            Self::PrepareSlumber { bw, freq } => {
                if *freq >= MAX_GX_LEVELS || *bw >= MAX_GX_LEVELS {
                    return Err(Error::InvalidArgument("slumber level out of range"));
                }
                vec![*bw, *freq]
            }
            Self::Start => Vec::new(),
            Self::Test => vec![0],
        };
        frame(self.id(), &body)
    }
}

/// Prepends a command header to `body`.
pub fn frame(msg_id: u8, body: &[u32]) -> Result<Vec<u32>> {
    let words = body.len() + 1;
    // The size field is 8 bits wide.
    if words >= MAX_MSG_WORDS {
        return Err(Error::InvalidArgument("command exceeds maximum message size"));
    }
    let mut msg = Vec::with_capacity(words);
    msg.push(codec::header_for_words(msg_id, words, ty::CMD));
    msg.extend_from_slice(body);
    Ok(msg)
}
