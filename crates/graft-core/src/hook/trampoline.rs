//! Prologue relocation for trampoline stubs.
//!
//! The instructions displaced by a patch are decoded and re-encoded at the
//! stub address; the encoder re-expresses IP-relative operands for the new
//! location. An instruction that cannot be expressed at the stub fails the
//! whole relocation with the faulting address, never a best-effort copy.

use iced_x86::{Decoder, DecoderOptions, Encoder, FlowControl, Instruction, OpKind};

use crate::error::{Error, Result};

const BITNESS: u32 = 64;

/// Instructions re-encoded for the stub, plus how many bytes they occupied
/// at the original site.
#[derive(Debug)]
pub(crate) struct RelocatedPrologue {
    pub bytes: Vec<u8>,
    pub consumed: usize,
}

/// Relocate whole instructions from `source` (mapped at `source_ip`) to
/// `dest_ip` until at least `min_len` original bytes are covered.
pub(crate) fn relocate_prologue(
    source: &[u8],
    source_ip: u64,
    dest_ip: u64,
    min_len: usize,
) -> Result<RelocatedPrologue> {
    let mut decoder = Decoder::with_ip(BITNESS, source, source_ip, DecoderOptions::NONE);
    let mut bytes = Vec::new();
    let mut consumed = 0usize;

    while consumed < min_len {
        if !decoder.can_decode() {
            return Err(Error::NotEnoughSpace {
                address: source_ip as usize + consumed,
            });
        }

        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(Error::DecodeFailed {
                address: instruction.ip() as usize,
            });
        }

        let new_ip = dest_ip + bytes.len() as u64;
        let mut encoder = Encoder::new(BITNESS);
        match encoder.encode(&instruction, new_ip) {
            Ok(_) => bytes.extend_from_slice(&encoder.take_buffer()),
            Err(_) => return Err(relocation_failure(&instruction)),
        }

        consumed += instruction.len();
    }

    Ok(RelocatedPrologue { bytes, consumed })
}

fn relocation_failure(instruction: &Instruction) -> Error {
    let address = instruction.ip() as usize;

    let near_branch = matches!(
        instruction.op0_kind(),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
    );

    match instruction.flow_control() {
        // 8-bit displacement forms (jmp short, jcc short, loop, jrcxz)
        // cannot reach a distant stub at all.
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch
            if near_branch && instruction.len() <= 2 =>
        {
            Error::ShortJumpInPrologue { address }
        }
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call
            if near_branch =>
        {
            Error::IpRelativeOutOfRange { address }
        }
        _ if instruction.is_ip_rel_memory_operand() => Error::IpRelativeOutOfRange { address },
        _ => Error::UnsupportedInstruction { address },
    }
}
