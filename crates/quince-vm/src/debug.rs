//! Bytecode disassembler

use crate::chunk::instruction::*;
use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::opcode::OpCode;

/// Render a chunk as human-readable assembly.
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        out.push_str(&disassemble_instruction(chunk, heap, offset));
        out.push('\n');
        offset += 1;
    }
    out
}

pub fn disassemble_instruction(chunk: &Chunk, heap: &Heap, offset: usize) -> String {
    let instruction = chunk.code[offset];
    let line = chunk.lines.get(offset).copied().unwrap_or(0);
    let op_byte = get_op(instruction);

    let Some(op) = OpCode::from_u8(op_byte) else {
        return format!("{:04} {:>4} ???({})", offset, line, op_byte);
    };

    let a = get_a(instruction);
    let b = get_b(instruction);
    let c = get_c(instruction);
    let bx = get_bx(instruction);
    let sbx = get_sbx(instruction);

    let operands = match op {
        OpCode::LoadK
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::Closure
        | OpCode::Import
        | OpCode::Export => {
            let k = chunk
                .constants
                .get(bx as usize)
                .map(|&v| heap.display_value(v))
                .unwrap_or_else(|| "?".to_string());
            format!("{} {} ; {}", a, bx, k)
        }
        OpCode::Jmp => format!("{}", sbx),
        OpCode::TForLoop => format!("{} {}", a, sbx),
        OpCode::Move
        | OpCode::Unm
        | OpCode::Not
        | OpCode::Len
        | OpCode::GetUpval
        | OpCode::SetUpval
        | OpCode::GetIter => format!("{} {}", a, b),
        OpCode::LoadNil | OpCode::Test | OpCode::Print | OpCode::TForCall => {
            format!("{} {} {}", a, b, c)
        }
        OpCode::NewList | OpCode::NewTable => format!("{}", a),
        _ => format!("{} {} {}", a, b, c),
    };

    format!("{:04} {:>4} {:<10} {}", offset, line, op.name(), operands)
}
