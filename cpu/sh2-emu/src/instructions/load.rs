//! SH-2 data transfer and control register instructions

use crate::Sh2;
use crate::bus::BusInterface;
use crate::instructions::{extend_i8, extend_i16, rm, rn};

// MOV Rm, Rn
// Register to register copy
pub fn mov_rm_rn(cpu: &mut Sh2, opcode: u16) {
    let m = rm(opcode);
    let n = rn(opcode);
    cpu.registers.gpr[n] = cpu.registers.gpr[m];
}

// MOV #imm, Rn
// Sign-extended 8-bit immediate
pub fn mov_b_immediate_rn(cpu: &mut Sh2, opcode: u16) {
    let n = rn(opcode);
    cpu.registers.gpr[n] = extend_i8(opcode as u8);
}

// At the point a handler runs, registers.pc holds the address of the next instruction
// (the executing instruction's address + 2), so "instruction PC + 4" is registers.pc + 2
fn pc_relative_word_address(cpu: &Sh2, opcode: u16) -> u32 {
    let disp = u32::from(opcode & 0xFF) << 1;
    cpu.registers.pc.wrapping_add(2).wrapping_add(disp)
}

fn pc_relative_long_address(cpu: &Sh2, opcode: u16) -> u32 {
    let disp = u32::from(opcode & 0xFF) << 2;
    (cpu.registers.pc.wrapping_add(2) & !3).wrapping_add(disp)
}

// MOV.W @(disp,PC), Rn
// PC-relative word load
pub fn mov_w_immediate_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let address = pc_relative_word_address(cpu, opcode);
    let value = cpu.read_word(address, bus);
    cpu.registers.gpr[rn(opcode)] = extend_i16(value);
}

// MOV.L @(disp,PC), Rn
// PC-relative longword load
pub fn mov_l_immediate_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let address = pc_relative_long_address(cpu, opcode);
    cpu.registers.gpr[rn(opcode)] = cpu.read_longword(address, bus);
}

// MOVA @(disp,PC), R0
// PC-relative effective address
pub fn mova(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[0] = pc_relative_long_address(cpu, opcode);
}

// MOVT Rn
// Store the T flag
pub fn movt(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.sr.t.into();
}

macro_rules! impl_store_indirect {
    ($name:ident, $write:ident $(, mask $mask:literal)?) => {
        pub fn $name<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
            let m = rm(opcode);
            let n = rn(opcode);
            cpu.$write(cpu.registers.gpr[n], (cpu.registers.gpr[m] $(& $mask)?) as _, bus);
        }
    };
}

// MOV.B Rm, @Rn
impl_store_indirect!(mov_b_rm_indirect, write_byte, mask 0xFF);
// MOV.W Rm, @Rn
impl_store_indirect!(mov_w_rm_indirect, write_word, mask 0xFFFF);
// MOV.L Rm, @Rn
impl_store_indirect!(mov_l_rm_indirect, write_longword);

// MOV.B @Rm, Rn
pub fn mov_b_indirect_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let value = cpu.read_byte(cpu.registers.gpr[rm(opcode)], bus);
    cpu.registers.gpr[rn(opcode)] = extend_i8(value);
}

// MOV.W @Rm, Rn
pub fn mov_w_indirect_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let value = cpu.read_word(cpu.registers.gpr[rm(opcode)], bus);
    cpu.registers.gpr[rn(opcode)] = extend_i16(value);
}

// MOV.L @Rm, Rn
pub fn mov_l_indirect_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.registers.gpr[rn(opcode)] = cpu.read_longword(cpu.registers.gpr[rm(opcode)], bus);
}

macro_rules! impl_store_predec {
    ($name:ident, $write:ident, $size:literal) => {
        pub fn $name<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
            let m = rm(opcode);
            let n = rn(opcode);
            let address = cpu.registers.gpr[n].wrapping_sub($size);
            cpu.registers.gpr[n] = address;
            cpu.$write(address, cpu.registers.gpr[m] as _, bus);
        }
    };
}

// MOV.B Rm, @-Rn
impl_store_predec!(mov_b_rm_predec, write_byte, 1);
// MOV.W Rm, @-Rn
impl_store_predec!(mov_w_rm_predec, write_word, 2);
// MOV.L Rm, @-Rn
impl_store_predec!(mov_l_rm_predec, write_longword, 4);

// MOV.B @Rm+, Rn
pub fn mov_b_postinc_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let m = rm(opcode);
    let value = cpu.read_byte(cpu.registers.gpr[m], bus);
    cpu.registers.gpr[m] = cpu.registers.gpr[m].wrapping_add(1);
    cpu.registers.gpr[rn(opcode)] = extend_i8(value);
}

// MOV.W @Rm+, Rn
pub fn mov_w_postinc_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let m = rm(opcode);
    let value = cpu.read_word(cpu.registers.gpr[m], bus);
    cpu.registers.gpr[m] = cpu.registers.gpr[m].wrapping_add(2);
    cpu.registers.gpr[rn(opcode)] = extend_i16(value);
}

// MOV.L @Rm+, Rn
pub fn mov_l_postinc_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let m = rm(opcode);
    let value = cpu.read_longword(cpu.registers.gpr[m], bus);
    cpu.registers.gpr[m] = cpu.registers.gpr[m].wrapping_add(4);
    cpu.registers.gpr[rn(opcode)] = value;
}

// MOV.B R0, @(disp,Rn)
pub fn mov_b_r0_rn_displacement<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let disp = u32::from(opcode & 0xF);
    let address = cpu.registers.gpr[rm(opcode)].wrapping_add(disp);
    cpu.write_byte(address, cpu.registers.gpr[0] as u8, bus);
}

// MOV.W R0, @(disp,Rn)
pub fn mov_w_r0_rn_displacement<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let disp = u32::from(opcode & 0xF) << 1;
    let address = cpu.registers.gpr[rm(opcode)].wrapping_add(disp);
    cpu.write_word(address, cpu.registers.gpr[0] as u16, bus);
}

// MOV.L Rm, @(disp,Rn)
pub fn mov_l_rm_rn_displacement<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let disp = u32::from(opcode & 0xF) << 2;
    let address = cpu.registers.gpr[rn(opcode)].wrapping_add(disp);
    cpu.write_longword(address, cpu.registers.gpr[rm(opcode)], bus);
}

// MOV.B @(disp,Rm), R0
pub fn mov_b_rm_displacement_r0<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let disp = u32::from(opcode & 0xF);
    let address = cpu.registers.gpr[rm(opcode)].wrapping_add(disp);
    let value = cpu.read_byte(address, bus);
    cpu.registers.gpr[0] = extend_i8(value);
}

// MOV.W @(disp,Rm), R0
pub fn mov_w_rm_displacement_r0<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let disp = u32::from(opcode & 0xF) << 1;
    let address = cpu.registers.gpr[rm(opcode)].wrapping_add(disp);
    let value = cpu.read_word(address, bus);
    cpu.registers.gpr[0] = extend_i16(value);
}

// MOV.L @(disp,Rm), Rn
pub fn mov_l_rm_displacement_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let disp = u32::from(opcode & 0xF) << 2;
    let address = cpu.registers.gpr[rm(opcode)].wrapping_add(disp);
    cpu.registers.gpr[rn(opcode)] = cpu.read_longword(address, bus);
}

fn indexed_address(cpu: &Sh2, register: usize) -> u32 {
    cpu.registers.gpr[0].wrapping_add(cpu.registers.gpr[register])
}

// MOV.B Rm, @(R0,Rn)
pub fn mov_b_rm_indirect_indexed<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.write_byte(indexed_address(cpu, rn(opcode)), cpu.registers.gpr[rm(opcode)] as u8, bus);
}

// MOV.W Rm, @(R0,Rn)
pub fn mov_w_rm_indirect_indexed<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.write_word(indexed_address(cpu, rn(opcode)), cpu.registers.gpr[rm(opcode)] as u16, bus);
}

// MOV.L Rm, @(R0,Rn)
pub fn mov_l_rm_indirect_indexed<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.write_longword(indexed_address(cpu, rn(opcode)), cpu.registers.gpr[rm(opcode)], bus);
}

// MOV.B @(R0,Rm), Rn
pub fn mov_b_indirect_indexed_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let value = cpu.read_byte(indexed_address(cpu, rm(opcode)), bus);
    cpu.registers.gpr[rn(opcode)] = extend_i8(value);
}

// MOV.W @(R0,Rm), Rn
pub fn mov_w_indirect_indexed_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let value = cpu.read_word(indexed_address(cpu, rm(opcode)), bus);
    cpu.registers.gpr[rn(opcode)] = extend_i16(value);
}

// MOV.L @(R0,Rm), Rn
pub fn mov_l_indirect_indexed_rn<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.registers.gpr[rn(opcode)] = cpu.read_longword(indexed_address(cpu, rm(opcode)), bus);
}

fn gbr_displacement_address(cpu: &Sh2, opcode: u16, shift: u8) -> u32 {
    let disp = u32::from(opcode & 0xFF) << shift;
    cpu.registers.gbr.wrapping_add(disp)
}

// MOV.B R0, @(disp,GBR)
pub fn mov_b_r0_disp_gbr<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.write_byte(gbr_displacement_address(cpu, opcode, 0), cpu.registers.gpr[0] as u8, bus);
}

// MOV.W R0, @(disp,GBR)
pub fn mov_w_r0_disp_gbr<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.write_word(gbr_displacement_address(cpu, opcode, 1), cpu.registers.gpr[0] as u16, bus);
}

// MOV.L R0, @(disp,GBR)
pub fn mov_l_r0_disp_gbr<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.write_longword(gbr_displacement_address(cpu, opcode, 2), cpu.registers.gpr[0], bus);
}

// MOV.B @(disp,GBR), R0
pub fn mov_b_disp_gbr_r0<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let value = cpu.read_byte(gbr_displacement_address(cpu, opcode, 0), bus);
    cpu.registers.gpr[0] = extend_i8(value);
}

// MOV.W @(disp,GBR), R0
pub fn mov_w_disp_gbr_r0<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    let value = cpu.read_word(gbr_displacement_address(cpu, opcode, 1), bus);
    cpu.registers.gpr[0] = extend_i16(value);
}

// MOV.L @(disp,GBR), R0
pub fn mov_l_disp_gbr_r0<B: BusInterface>(cpu: &mut Sh2, opcode: u16, bus: &mut B) {
    cpu.registers.gpr[0] = cpu.read_longword(gbr_displacement_address(cpu, opcode, 2), bus);
}

// SWAP.B Rm, Rn
// Swap the two low bytes
pub fn swap_b(cpu: &mut Sh2, opcode: u16) {
    let value = cpu.registers.gpr[rm(opcode)];
    cpu.registers.gpr[rn(opcode)] =
        (value & 0xFFFF0000) | ((value & 0xFF) << 8) | ((value >> 8) & 0xFF);
}

// SWAP.W Rm, Rn
// Swap the two words
pub fn swap_w(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.gpr[rm(opcode)].rotate_left(16);
}

// XTRCT Rm, Rn
// Extract the middle 32 bits of Rm:Rn
pub fn xtrct(cpu: &mut Sh2, opcode: u16) {
    let m = rm(opcode);
    let n = rn(opcode);
    cpu.registers.gpr[n] = (cpu.registers.gpr[m] << 16) | (cpu.registers.gpr[n] >> 16);
}

// CLRT
pub fn clrt(cpu: &mut Sh2) {
    cpu.registers.sr.t = false;
}

// SETT
pub fn sett(cpu: &mut Sh2) {
    cpu.registers.sr.t = true;
}

// CLRMAC
pub fn clrmac(cpu: &mut Sh2) {
    cpu.registers.mach = 0;
    cpu.registers.macl = 0;
}

// SLEEP
// Spin on the sleep instruction until an interrupt redirects the PC
pub fn sleep(cpu: &mut Sh2) {
    cpu.registers.pc = cpu.registers.pc.wrapping_sub(2);
    cpu.registers.next_pc = cpu.registers.pc.wrapping_add(2);
}

// LDC Rm, SR
pub fn ldc_rm_sr(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.sr = cpu.registers.gpr[rn(opcode)].into();
}

// LDC Rm, GBR
pub fn ldc_rm_gbr(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gbr = cpu.registers.gpr[rn(opcode)];
}

// LDC Rm, VBR
pub fn ldc_rm_vbr(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.vbr = cpu.registers.gpr[rn(opcode)];
}

macro_rules! impl_ldc_postinc {
    ($name:ident, |$cpu:ident, $value:ident| $apply:expr) => {
        pub fn $name<B: BusInterface>($cpu: &mut Sh2, opcode: u16, bus: &mut B) {
            let n = rn(opcode);
            let $value = $cpu.read_longword($cpu.registers.gpr[n], bus);
            $cpu.registers.gpr[n] = $cpu.registers.gpr[n].wrapping_add(4);
            $apply;
        }
    };
}

// LDC.L @Rm+, SR
impl_ldc_postinc!(ldc_postinc_sr, |cpu, value| cpu.registers.sr = value.into());
// LDC.L @Rm+, GBR
impl_ldc_postinc!(ldc_postinc_gbr, |cpu, value| cpu.registers.gbr = value);
// LDC.L @Rm+, VBR
impl_ldc_postinc!(ldc_postinc_vbr, |cpu, value| cpu.registers.vbr = value);
// LDS.L @Rm+, MACH
impl_ldc_postinc!(lds_postinc_mach, |cpu, value| cpu.registers.mach = value);
// LDS.L @Rm+, MACL
impl_ldc_postinc!(lds_postinc_macl, |cpu, value| cpu.registers.macl = value);
// LDS.L @Rm+, PR
impl_ldc_postinc!(lds_postinc_pr, |cpu, value| cpu.registers.pr = value);

// LDS Rm, MACH
pub fn lds_rm_mach(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.mach = cpu.registers.gpr[rn(opcode)];
}

// LDS Rm, MACL
pub fn lds_rm_macl(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.macl = cpu.registers.gpr[rn(opcode)];
}

// LDS Rm, PR
pub fn lds_rm_pr(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.pr = cpu.registers.gpr[rn(opcode)];
}

// STC SR, Rn
pub fn stc_sr_rn(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.sr.into();
}

// STC GBR, Rn
pub fn stc_gbr_rn(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.gbr;
}

// STC VBR, Rn
pub fn stc_vbr_rn(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.vbr;
}

// STS MACH, Rn
pub fn sts_mach_rn(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.mach;
}

// STS MACL, Rn
pub fn sts_macl_rn(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.macl;
}

// STS PR, Rn
pub fn sts_pr_rn(cpu: &mut Sh2, opcode: u16) {
    cpu.registers.gpr[rn(opcode)] = cpu.registers.pr;
}

macro_rules! impl_store_control_predec {
    ($name:ident, |$cpu:ident| $value:expr) => {
        pub fn $name<B: BusInterface>($cpu: &mut Sh2, opcode: u16, bus: &mut B) {
            let n = rn(opcode);
            let address = $cpu.registers.gpr[n].wrapping_sub(4);
            $cpu.registers.gpr[n] = address;
            let value = $value;
            $cpu.write_longword(address, value, bus);
        }
    };
}

// STC.L SR, @-Rn
impl_store_control_predec!(stc_sr_rn_predec, |cpu| cpu.registers.sr.into());
// STC.L GBR, @-Rn
impl_store_control_predec!(stc_gbr_rn_predec, |cpu| cpu.registers.gbr);
// STC.L VBR, @-Rn
impl_store_control_predec!(stc_vbr_rn_predec, |cpu| cpu.registers.vbr);
// STS.L MACH, @-Rn
impl_store_control_predec!(sts_mach_rn_predec, |cpu| cpu.registers.mach);
// STS.L MACL, @-Rn
impl_store_control_predec!(sts_macl_rn_predec, |cpu| cpu.registers.macl);
// STS.L PR, @-Rn
impl_store_control_predec!(sts_pr_rn_predec, |cpu| cpu.registers.pr);
