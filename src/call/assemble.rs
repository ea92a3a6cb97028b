//! Incoming call reassembly.
//!
//! Per-call state machine, the inverse of [`super::fragment`]:
//!
//! ```text
//! IDLE ──first fragment──▶ OPEN (arg1 must be complete here)
//! OPEN ──continue(more=1)──▶ OPEN
//! OPEN ──continue(more=0) | first(more=0)──▶ DONE
//! ```
//!
//! Every fragment is validated as it arrives: the checksum type must match
//! the first fragment's, the chained digest must verify, arg1 must be
//! complete within the first fragment and never exceed its size limit, and
//! a final fragment must leave all three args closed. Violations are the
//! sender's fault and reported as `BadRequest`.

use bytes::{Bytes, BytesMut};

use super::MAX_ARG1_SIZE;
use crate::error::{Result, TChannelError};
use crate::protocol::{ChecksumChain, ChecksumType, FLAG_MORE_FRAGMENTS};

/// The three reassembled byte regions of a completed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledArgs {
    /// Endpoint name (empty in responses by convention).
    pub arg1: Bytes,
    /// Second opaque byte region.
    pub arg2: Bytes,
    /// Third opaque byte region.
    pub arg3: Bytes,
}

/// Reassembles one call's fragments into its three args.
#[derive(Debug)]
pub struct Assembler {
    chain: Option<ChecksumChain>,
    args: [BytesMut; 3],
    /// Arg currently open: chunks append here.
    cursor: usize,
    done: bool,
}

impl Assembler {
    /// Create an assembler in the IDLE state.
    pub fn new() -> Self {
        Self {
            chain: None,
            args: [BytesMut::new(), BytesMut::new(), BytesMut::new()],
            cursor: 0,
            done: false,
        }
    }

    /// Whether the first fragment has been accepted.
    #[inline]
    pub fn started(&self) -> bool {
        self.chain.is_some()
    }

    /// Feed the call's first fragment (`CallRequest` / `CallResponse`).
    ///
    /// Returns the assembled args if this fragment completed the call.
    pub fn first_fragment(
        &mut self,
        checksum_type: ChecksumType,
        checksum: u32,
        flags: u8,
        chunks: &[Bytes],
    ) -> Result<Option<AssembledArgs>> {
        if self.started() {
            return Err(TChannelError::BadRequest(
                "duplicate first fragment for an open call".into(),
            ));
        }
        self.chain = Some(ChecksumChain::new(checksum_type));
        self.accept(checksum_type, checksum, flags, chunks, true)
    }

    /// Feed a continuation fragment.
    pub fn continue_fragment(
        &mut self,
        checksum_type: ChecksumType,
        checksum: u32,
        flags: u8,
        chunks: &[Bytes],
    ) -> Result<Option<AssembledArgs>> {
        if !self.started() {
            return Err(TChannelError::BadRequest(
                "continue fragment before the call's first fragment".into(),
            ));
        }
        self.accept(checksum_type, checksum, flags, chunks, false)
    }

    fn accept(
        &mut self,
        checksum_type: ChecksumType,
        checksum: u32,
        flags: u8,
        chunks: &[Bytes],
        first: bool,
    ) -> Result<Option<AssembledArgs>> {
        if self.done {
            return Err(TChannelError::BadRequest(
                "fragment after the call completed".into(),
            ));
        }
        let chain = self
            .chain
            .as_mut()
            .ok_or_else(|| TChannelError::BadRequest("call not started".into()))?;
        if checksum_type != chain.ty() {
            return Err(TChannelError::BadRequest(format!(
                "checksum type changed mid-call: {:?} then {checksum_type:?}",
                chain.ty()
            )));
        }
        let slices: Vec<&[u8]> = chunks.iter().map(|c| c.as_ref()).collect();
        if !chain.verify(&slices, checksum) {
            return Err(TChannelError::BadRequest("checksum mismatch".into()));
        }

        if chunks.is_empty() {
            return Err(TChannelError::BadRequest(
                "fragment carries no arg chunks".into(),
            ));
        }
        if self.cursor + chunks.len() - 1 > 2 {
            return Err(TChannelError::BadRequest(
                "fragment carries chunks beyond arg3".into(),
            ));
        }

        for (i, chunk) in chunks.iter().enumerate() {
            self.args[self.cursor].extend_from_slice(chunk);
            // Every chunk except the frame's last closes its arg.
            if i + 1 < chunks.len() {
                self.cursor += 1;
            }
        }
        if self.args[0].len() > MAX_ARG1_SIZE {
            return Err(TChannelError::BadRequest(format!(
                "arg1 exceeds the {MAX_ARG1_SIZE}-byte limit"
            )));
        }

        let more = flags & FLAG_MORE_FRAGMENTS != 0;
        if more {
            if first && self.cursor == 0 {
                return Err(TChannelError::BadRequest(
                    "arg1 must be complete within the first fragment".into(),
                ));
            }
            return Ok(None);
        }

        // Final fragment: the last chunk closes its arg too.
        self.cursor += 1;
        if self.cursor != 3 {
            return Err(TChannelError::BadRequest(format!(
                "final fragment left {} of 3 args incomplete",
                3 - self.cursor
            )));
        }
        self.done = true;
        let [arg1, arg2, arg3] = std::mem::take(&mut self.args);
        Ok(Some(AssembledArgs {
            arg1: arg1.freeze(),
            arg2: arg2.freeze(),
            arg3: arg3.freeze(),
        }))
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
