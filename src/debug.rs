use crate::code_pack::{CodePack, Op};

/// Print a compiled unit in mnemonic form, one instruction per line.
pub fn disassemble_code_pack(code: &CodePack) {
    if code.name.is_empty() {
        println!("== <script> ==");
    } else {
        println!("== {} ==", code.name);
    }
    for offset in 0..code.len() {
        disassemble_instruction(code, offset);
    }
}

pub fn disassemble_instruction(code: &CodePack, offset: usize) {
    let inst = match code.instructions.get(offset) {
        Some(inst) => *inst,
        None => {
            println!("{:04} <end of code>", offset);
            return;
        }
    };
    match inst.op {
        Op::LoadConst => match code.constant(inst.param as usize) {
            Ok(value) => println!("{:04} {:<12} {:<4} ; {}", offset, inst.op, inst.param, value),
            Err(_) => println!(
                "{:04} {:<12} {:<4} ; <bad constant>",
                offset, inst.op, inst.param
            ),
        },
        Op::Jmp | Op::IfNo => {
            let target = offset as i64 + inst.param as i64;
            println!(
                "{:04} {:<12} {:<4} -> {:04}",
                offset, inst.op, inst.param, target
            );
        }
        _ => println!("{:04} {:<12} {}", offset, inst.op, inst.param),
    }
}
