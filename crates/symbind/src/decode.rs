//! Decoding of the two relative-addressing instruction shapes used for pointer chasing.
//!
//! ```text
//! E8 rel32                  call   target              ; target = ip + rel32 + 5
//! 48|4C 8D|8B modrm rel32   lea/mov reg, [rip+rel32]   ; target = ip + rel32 + 7
//! ```

use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

pub const CALL_OPCODE: u8 = 0xE8;
pub const CALL_LEN: usize = 5;

pub const REX_W: u8 = 0x48;
pub const REX_WR: u8 = 0x4C;
pub const LEA_OPCODE: u8 = 0x8D;
pub const MOV_OPCODE: u8 = 0x8B;
pub const LEA_LEN: usize = 7;

/// Which form of RIP-relative load was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RipLoad {
    /// `lea reg, [rip+disp]`: the target is the referenced address.
    Address,
    /// `mov reg, [rip+disp]`: the target is the address the value is loaded from.
    Value,
}

fn rel32(bytes: &[u8]) -> i64 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
}

/// Decode a near call whose first byte is `code[0]`, located at `address`.
pub fn decode_call(code: &[u8], address: u64) -> Result<u64> {
    match code {
        [CALL_OPCODE, disp @ ..] if disp.len() >= 4 => {
            Ok(address.wrapping_add_signed(rel32(disp) + CALL_LEN as i64))
        }
        _ => Err(Error::NotAnInstruction {
            address,
            expected: "call",
        }),
    }
}

/// Decode a RIP-relative lea/mov whose first byte is `code[0]`, located at `address`.
pub fn decode_lea(code: &[u8], address: u64) -> Result<(u64, RipLoad)> {
    let form = match code {
        [REX_W | REX_WR, LEA_OPCODE, ..] => RipLoad::Address,
        [REX_W | REX_WR, MOV_OPCODE, ..] => RipLoad::Value,
        _ => {
            return Err(Error::NotAnInstruction {
                address,
                expected: "lea",
            });
        }
    };

    let disp = code.get(3..7).ok_or(Error::NotAnInstruction {
        address,
        expected: "lea",
    })?;
    Ok((
        address.wrapping_add_signed(rel32(disp) + LEA_LEN as i64),
        form,
    ))
}

/// Absolute callee of the near call at `address`.
pub fn call_to_absolute<R: ReadMemory + ?Sized>(memory: &R, address: u64) -> Result<u64> {
    let code = memory.bytes(address, CALL_LEN)?;
    decode_call(code, address).inspect_err(|e| debug!("call_to_absolute(): {}", e))
}

/// Absolute address referenced by the lea/mov at `address`.
pub fn lea_to_absolute<R: ReadMemory + ?Sized>(memory: &R, address: u64) -> Result<u64> {
    let code = memory.bytes(address, LEA_LEN)?;
    decode_lea(code, address)
        .map(|(target, _)| target)
        .inspect_err(|e| debug!("lea_to_absolute(): {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBuffer;

    fn call(disp: i32) -> Vec<u8> {
        let mut code = vec![CALL_OPCODE];
        code.extend_from_slice(&disp.to_le_bytes());
        code
    }

    fn lea(prefix: u8, opcode: u8, disp: i32) -> Vec<u8> {
        let mut code = vec![prefix, opcode, 0x0D];
        code.extend_from_slice(&disp.to_le_bytes());
        code
    }

    #[test]
    fn test_decode_call() {
        for disp in [0, 0x10, -0x10, i32::MAX, i32::MIN] {
            let address = 0x1_4000_1000u64;
            let expected = address.wrapping_add_signed(disp as i64 + 5);
            assert_eq!(decode_call(&call(disp), address).unwrap(), expected);
        }
    }

    #[test]
    fn test_decode_call_rejects_other_opcodes() {
        let mut code = call(0x10);
        code[0] = 0xE9;
        assert!(matches!(
            decode_call(&code, 0x1000),
            Err(Error::NotAnInstruction {
                expected: "call",
                ..
            })
        ));
        assert!(decode_call(&[CALL_OPCODE, 0, 0], 0x1000).is_err());
    }

    #[test]
    fn test_decode_lea_forms() {
        let address = 0x1_4000_2000u64;
        for (prefix, opcode, form) in [
            (REX_W, LEA_OPCODE, RipLoad::Address),
            (REX_WR, LEA_OPCODE, RipLoad::Address),
            (REX_W, MOV_OPCODE, RipLoad::Value),
            (REX_WR, MOV_OPCODE, RipLoad::Value),
        ] {
            let (target, decoded) = decode_lea(&lea(prefix, opcode, -0x40), address).unwrap();
            assert_eq!(target, address - 0x40 + 7);
            assert_eq!(decoded, form);
        }
    }

    #[test]
    fn test_decode_lea_rejects_other_encodings() {
        assert!(decode_lea(&lea(0x49, LEA_OPCODE, 0), 0).is_err());
        assert!(decode_lea(&lea(REX_W, 0x89, 0), 0).is_err());
        assert!(decode_lea(&[REX_W, LEA_OPCODE, 0x0D, 0], 0).is_err());
    }

    #[test]
    fn test_memory_decoders() {
        let base = 0x1000u64;
        let memory = MemoryBuffer::zeroed(base, 0x40)
            .with(base, &call(0x20))
            .with(base + 0x10, &lea(REX_W, LEA_OPCODE, 0x08));

        assert_eq!(call_to_absolute(&memory, base).unwrap(), base + 0x25);
        assert_eq!(lea_to_absolute(&memory, base + 0x10).unwrap(), base + 0x1F);
        assert!(call_to_absolute(&memory, base + 0x10).is_err());
        assert!(lea_to_absolute(&memory, base).is_err());
        assert!(call_to_absolute(&memory, base + 0x3D).is_err());
    }
}
