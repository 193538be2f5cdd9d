// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HFI message header codec and protocol constants.
//!
//! Every message starts with one header word:
//!
//! ```text
//!  31        20 19  16 15      8 7       0
//! +------------+------+---------+---------+
//! |  sequence  | type |  size   |   id    |
//! +------------+------+---------+---------+
//! ```
//!
//! `size` counts 32-bit words including the header itself.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Largest message either side may place in a queue, in words.
pub const MAX_MSG_WORDS: usize = 256;
/// Payload words the host keeps from a received message.
pub const MAX_RCVD_PAYLOAD_WORDS: usize = 16;
/// Receive buffer: header, echoed request header, status and payload.
pub const MAX_RCVD_WORDS: usize = MAX_RCVD_PAYLOAD_WORDS + 3;

/// Ring alignment granule on protocol v2, in words.
pub const QUEUE_ALIGN_WORDS: usize = 4;
/// Filler written between an unaligned message end and the next granule.
pub const PAD_COOKIE: u32 = 0xFAFA_FAFA;

/// Sequence numbers occupy 12 bits.
pub const SEQ_MASK: u32 = 0xFFF;
const SEQ_SHIFT: u32 = 20;

/// Status word the firmware places in an ack to reject a request.
pub const ACK_ERROR: u32 = 0xFFFF_FFFF;

/// Message type field values.
pub mod ty {
    /// Command, v2 numbering.
    pub const CMD: u8 = 0;
    /// Acknowledgement, v2 numbering.
    pub const ACK: u8 = 1;
    /// Command, v1 numbering.
    pub const V1_CMD: u8 = 0;
    /// Post (fire-and-forget), v1 numbering.
    pub const V1_POST: u8 = 1;
    /// Acknowledgement, v1 numbering.
    pub const V1_ACK: u8 = 2;
}

/// Message ids.
pub mod id {
    pub const H2F_INIT: u8 = 0;
    pub const H2F_FW_VER: u8 = 1;
    pub const H2F_LM_CFG: u8 = 2;
    pub const H2F_BW_VOTE_TBL: u8 = 3;
    pub const H2F_PERF_TBL: u8 = 4;
    pub const H2F_TEST: u8 = 5;
    pub const H2F_ACD_TBL: u8 = 7;
    pub const H2F_START: u8 = 10;
    pub const H2F_FEATURE_CTRL: u8 = 11;
    pub const H2F_GET_VALUE: u8 = 12;
    pub const H2F_SET_VALUE: u8 = 13;
    pub const H2F_CORE_FW_START: u8 = 14;
    pub const H2F_GX_BW_PERF_VOTE: u8 = 30;
    pub const H2F_FW_HALT: u8 = 32;
    pub const H2F_PREPARE_SLUMBER: u8 = 33;

    pub const F2H_ERR: u8 = 100;
    pub const F2H_DEBUG: u8 = 101;
    pub const F2H_ACK: u8 = 126;

    /// Human-readable name for logs.
    pub const fn name(id: u8) -> &'static str {
        match id {
            H2F_INIT => "INIT",
            H2F_FW_VER => "FW_VER",
            H2F_LM_CFG => "LM_CFG",
            H2F_BW_VOTE_TBL => "BW_VOTE_TBL",
            H2F_PERF_TBL => "PERF_TBL",
            H2F_TEST => "TEST",
            H2F_ACD_TBL => "ACD_TBL",
            H2F_START => "START",
            H2F_FEATURE_CTRL => "FEATURE_CTRL",
            H2F_GET_VALUE => "GET_VALUE",
            H2F_SET_VALUE => "SET_VALUE",
            H2F_CORE_FW_START => "CORE_FW_START",
            H2F_GX_BW_PERF_VOTE => "GX_BW_PERF_VOTE",
            H2F_FW_HALT => "FW_HALT",
            H2F_PREPARE_SLUMBER => "PREPARE_SLUMBER",
            F2H_ERR => "ERR",
            F2H_DEBUG => "DEBUG",
            F2H_ACK => "ACK",
            _ => "UNKNOWN",
        }
    }
}

/// Decoded header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeaderFields {
    pub id: u8,
    pub size_words: usize,
    pub ty: u8,
    pub seq: u16,
}

/// Builds a header word with sequence zero. `size_bytes` is rounded down to whole words.
pub const fn pack_header(id: u8, size_bytes: usize, ty: u8) -> u32 {
    ((ty as u32 & 0xF) << 16) | ((((size_bytes >> 2) as u32) & 0xFF) << 8) | id as u32
}

/// Header for a message of `words` words including the header.
pub const fn header_for_words(id: u8, words: usize, ty: u8) -> u32 {
    pack_header(id, words * 4, ty)
}

pub const fn unpack(hdr: u32) -> HeaderFields {
    HeaderFields {
        id: msg_id(hdr),
        size_words: size_words(hdr),
        ty: msg_type(hdr),
        seq: sequence(hdr),
    }
}

/// Replaces the sequence field, keeping the low 20 bits.
pub const fn set_sequence(hdr: u32, seq: u16) -> u32 {
    (hdr & 0x000F_FFFF) | ((seq as u32 & SEQ_MASK) << SEQ_SHIFT)
}

pub const fn msg_id(hdr: u32) -> u8 {
    (hdr & 0xFF) as u8
}

pub const fn size_words(hdr: u32) -> usize {
    ((hdr >> 8) & 0xFF) as usize
}

pub const fn msg_type(hdr: u32) -> u8 {
    ((hdr >> 16) & 0xF) as u8
}

pub const fn sequence(hdr: u32) -> u16 {
    ((hdr >> SEQ_SHIFT) & SEQ_MASK) as u16
}

/// Rounds `words` up to the ring alignment granule.
pub const fn align_words(words: usize) -> usize {
    (words + QUEUE_ALIGN_WORDS - 1) & !(QUEUE_ALIGN_WORDS - 1)
}

/// Version word as exchanged during FW_VER: major in `[31:28]`, minor in `[27:16]`.
pub const fn version_word(major: u32, minor: u32) -> u32 {
    ((major & 0xF) << 28) | ((minor & 0xFFF) << 16)
}

pub const fn version_major(word: u32) -> u32 {
    word >> 28
}

pub const fn version_minor(word: u32) -> u32 {
    (word >> 16) & 0xFFF
}

/// HFI protocol revision negotiated at build time.
///
/// Protocol 2 aligns ring indices to [`QUEUE_ALIGN_WORDS`], pads with
/// [`PAD_COOKIE`] and uses the v2 type numbering; protocol 1 does neither.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const V1: Self = Self { major: 1, minor: 0 };
    pub const V2: Self = Self { major: 2, minor: 0 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub const fn is_v2(self) -> bool {
        self.major >= 2
    }

    /// Whether ring indices are kept on [`QUEUE_ALIGN_WORDS`] boundaries.
    pub const fn aligned_framing(self) -> bool {
        self.is_v2()
    }

    pub const fn ack_type(self) -> u8 {
        if self.is_v2() {
            ty::ACK
        } else {
            ty::V1_ACK
        }
    }

    pub const fn cmd_type(self) -> u8 {
        if self.is_v2() {
            ty::CMD
        } else {
            ty::V1_CMD
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V2
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
