//! Trivial SH-2 disassembler driven by the specification database; used for trace logging and
//! validation failure reports

use crate::spec;

pub fn disassemble(opcode: u16) -> String {
    let Some(instruction) = spec::decode(opcode) else {
        return format!(".word {opcode:04X}");
    };

    let mut out = instruction.syntax.to_string();

    if instruction.has_rn {
        out = out.replacen("Rn", &format!("R{}", instruction.extract_rn(opcode)), 1);
    }
    if instruction.has_rm {
        out = out.replacen("Rm", &format!("R{}", instruction.extract_rm(opcode)), 1);
    }
    if instruction.imm_bits != 0 {
        let imm = instruction.extract_imm(opcode);
        out = out.replacen("#imm", &format!("#{imm}"), 1).replacen("disp", &imm.to_string(), 1);
        if out.contains("label") {
            out = out.replacen("label", &format!("{:+}", 4 + 2 * imm), 1);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_operands() {
        assert_eq!(disassemble(0x312C), "ADD R2, R1");
        assert_eq!(disassemble(0xE1FF), "MOV #-1, R1");
        assert_eq!(disassemble(0x0009), "NOP");
    }

    #[test]
    fn unknown_words_fall_back_to_raw() {
        assert_eq!(disassemble(0xFFFF), ".word FFFF");
    }
}
