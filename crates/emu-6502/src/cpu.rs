//! 6502 CPU implementation.
//!
//! Instruction-stepped: each `step()` services pending signals, then
//! fetches, decodes and executes one whole instruction and returns its
//! cycle count (base count, plus one for a taken branch). `run()` repeats
//! steps until stopped, feeding cycle counts to the pacer so emulated time
//! tracks the wall clock at the configured rate.
//!
//! Nothing in the loop can fail: undefined opcodes execute as a fixed-cost
//! no-op, exactly as the permissive NMOS part treats them in this machine.

use std::sync::Arc;

use emu_core::{Bus, Pacer, TimingProfile};

use crate::alu;
use crate::control::CpuControl;
use crate::flags::{C, D, I, N, V, Z};
use crate::{Registers, Status};

/// RESET vector address.
pub const RESET_VECTOR: u16 = 0xFFFC;

/// NMI vector address.
pub const NMI_VECTOR: u16 = 0xFFFA;

/// IRQ/BRK vector address.
pub const IRQ_VECTOR: u16 = 0xFFFE;

/// Reserved opcode: halt the CPU thread until externally woken.
pub const OP_HALT: u8 = 0x02;

/// Reserved opcode: invoke the external debug handler with an immediate
/// operand.
pub const OP_DEBUG: u8 = 0x22;

/// Cycle cost of an undefined opcode (executed as a no-op).
const UNDEFINED_CYCLES: u64 = 6;

/// Cycle cost of an interrupt or reset sequence.
const INTERRUPT_CYCLES: u64 = 7;

/// One executed instruction, as handed to a trace sink.
///
/// Registers are the pre-execution snapshot; `operands` are the two bytes
/// following the opcode (peeked, so devices are not disturbed), meaningful
/// or not depending on the instruction length.
#[derive(Debug, Clone, Copy)]
pub struct TraceEntry {
    pub pc: u16,
    pub opcode: u8,
    pub operands: [u8; 2],
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub s: u8,
    pub p: Status,
}

/// Receives executed instructions while tracing is enabled.
///
/// Formatting and persistence are the sink's concern; the CPU only hands
/// over raw entries.
pub trait TraceSink: Send {
    fn record(&mut self, entry: &TraceEntry);
}

/// Handles the reserved debug opcode.
///
/// Returns `true` if the operand was recognised; an unrecognised operand
/// makes the CPU rewind and retry the same instruction.
pub trait DebugHandler: Send {
    fn debug(&mut self, code: u8) -> bool;
}

/// The MOS 6502 CPU.
pub struct Cpu6502 {
    /// CPU registers.
    pub regs: Registers,

    control: Arc<CpuControl>,
    pacer: Pacer,
    trace_sink: Option<Box<dyn TraceSink>>,
    debug_handler: Option<Box<dyn DebugHandler>>,

    /// Total cycles executed (for debugging).
    total_cycles: u64,
}

impl Cpu6502 {
    /// Create a CPU wired to the given control block and timing profile.
    ///
    /// Registers are in reset state; PC is loaded from the reset vector on
    /// the first `reset()` (or by raising RESET before running).
    #[must_use]
    pub fn new(control: Arc<CpuControl>, profile: TimingProfile) -> Self {
        Self {
            regs: Registers::new(),
            control,
            pacer: Pacer::new(profile),
            trace_sink: None,
            debug_handler: None,
            total_cycles: 0,
        }
    }

    /// The shared control surface.
    #[must_use]
    pub fn control(&self) -> &Arc<CpuControl> {
        &self.control
    }

    /// Attach a trace sink (entries flow only while tracing is enabled).
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace_sink = Some(sink);
    }

    /// Attach the debug-opcode handler.
    pub fn set_debug_handler(&mut self, handler: Box<dyn DebugHandler>) {
        self.debug_handler = Some(handler);
    }

    /// Total cycles executed since construction.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Reinitialise all registers and jump through the reset vector.
    pub fn reset<B: Bus>(&mut self, bus: &mut B) {
        self.regs = Registers::new();
        self.regs.pc = self.read_word(bus, RESET_VECTOR);
        self.control.set_irq_masked(self.regs.p.is_set(I));
        self.pacer.restart();
    }

    /// Run until a stop is requested. Checks the stop flag between
    /// instructions, never mid-instruction.
    pub fn run<B: Bus>(&mut self, bus: &mut B) {
        self.pacer.restart();
        while !self.control.stop_requested() {
            self.step(bus);
        }
    }

    /// Service signals, execute one instruction, pace, and return the
    /// cycle count.
    pub fn step<B: Bus>(&mut self, bus: &mut B) -> u64 {
        // Highest-priority pending signal first. RESET wipes the others.
        let cycles = if self.control.take_reset() {
            self.control.discard_pending_interrupts();
            self.reset(bus);
            INTERRUPT_CYCLES
        } else if self.control.take_nmi() {
            // NMI pushes P as-is (break flag preserved).
            self.interrupt(bus, NMI_VECTOR, self.regs.p.to_byte())
        } else if self.control.take_irq() {
            // Maskability was checked at signal time, not here.
            self.interrupt(bus, IRQ_VECTOR, self.regs.p.to_byte_irq())
        } else {
            self.execute_one(bus)
        };

        self.control.set_irq_masked(self.regs.p.is_set(I));
        self.control.count_instruction();
        self.total_cycles += cycles;
        self.pacer.advance(cycles, self.control.nanos_per_cycle());
        cycles
    }

    /// Push PC and status, set I, and jump through a vector.
    fn interrupt<B: Bus>(&mut self, bus: &mut B, vector: u16, pushed_status: u8) -> u64 {
        self.push_word(bus, self.regs.pc);
        self.push(bus, pushed_status);
        self.regs.p.set(I);
        self.regs.pc = self.read_word(bus, vector);
        INTERRUPT_CYCLES
    }

    /// Fetch, decode and execute one instruction.
    fn execute_one<B: Bus>(&mut self, bus: &mut B) -> u64 {
        let pc = self.regs.pc;
        let opcode = bus.read(pc);
        self.regs.pc = pc.wrapping_add(1);

        if self.control.trace_enabled()
            && let Some(sink) = self.trace_sink.as_mut()
        {
            let entry = TraceEntry {
                pc,
                opcode,
                operands: [bus.peek(pc.wrapping_add(1)), bus.peek(pc.wrapping_add(2))],
                a: self.regs.a,
                x: self.regs.x,
                y: self.regs.y,
                s: self.regs.s,
                p: self.regs.p,
            };
            sink.record(&entry);
        }

        self.execute(bus, opcode)
    }

    /// Execute the given opcode; returns its cycle count.
    fn execute<B: Bus>(&mut self, bus: &mut B, opcode: u8) -> u64 {
        match opcode {
            // BRK - 7 cycles
            0x00 => self.op_brk(bus),

            // ORA (zp,X) - 6 cycles
            0x01 => {
                let addr = self.addr_izx(bus);
                self.read_op(bus, addr, Self::do_ora);
                6
            }

            // Reserved: halt until externally woken - 2 cycles
            OP_HALT => self.op_halt(),

            // ORA zp - 3 cycles
            0x05 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_ora);
                3
            }

            // ASL zp - 5 cycles
            0x06 => {
                let addr = self.addr_zp(bus);
                self.rmw_op(bus, addr, Self::do_asl);
                5
            }

            // PHP - 3 cycles
            0x08 => {
                let status = self.regs.p.to_byte_brk();
                self.push(bus, status);
                3
            }

            // ORA imm - 2 cycles
            0x09 => {
                let value = self.fetch(bus);
                self.do_ora(value);
                2
            }

            // ASL A - 2 cycles
            0x0A => {
                self.regs.a = alu::shl(&mut self.regs.p, self.regs.a);
                2
            }

            // ORA abs - 4 cycles
            0x0D => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_ora);
                4
            }

            // ASL abs - 6 cycles
            0x0E => {
                let addr = self.addr_abs(bus);
                self.rmw_op(bus, addr, Self::do_asl);
                6
            }

            // BPL rel - 2/3 cycles
            0x10 => self.branch(bus, !self.regs.p.is_set(N)),

            // ORA (zp),Y - 5 cycles
            0x11 => {
                let addr = self.addr_izy(bus);
                self.read_op(bus, addr, Self::do_ora);
                5
            }

            // ORA zp,X - 4 cycles
            0x15 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_ora);
                4
            }

            // ASL zp,X - 6 cycles
            0x16 => {
                let addr = self.addr_zpx(bus);
                self.rmw_op(bus, addr, Self::do_asl);
                6
            }

            // CLC - 2 cycles
            0x18 => {
                self.regs.p.clear(C);
                2
            }

            // ORA abs,Y - 4 cycles
            0x19 => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_ora);
                4
            }

            // ORA abs,X - 4 cycles
            0x1D => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_ora);
                4
            }

            // ASL abs,X - 7 cycles
            0x1E => {
                let addr = self.addr_abx(bus);
                self.rmw_op(bus, addr, Self::do_asl);
                7
            }

            // JSR abs - 6 cycles
            0x20 => {
                let target = self.addr_abs(bus);
                // Push the address of the last byte of this instruction.
                self.push_word(bus, self.regs.pc.wrapping_sub(1));
                self.regs.pc = target;
                6
            }

            // AND (zp,X) - 6 cycles
            0x21 => {
                let addr = self.addr_izx(bus);
                self.read_op(bus, addr, Self::do_and);
                6
            }

            // Reserved: external debug callback - 2 cycles
            OP_DEBUG => self.op_debug(bus),

            // BIT zp - 3 cycles
            0x24 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_bit);
                3
            }

            // AND zp - 3 cycles
            0x25 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_and);
                3
            }

            // ROL zp - 5 cycles
            0x26 => {
                let addr = self.addr_zp(bus);
                self.rmw_op(bus, addr, Self::do_rol);
                5
            }

            // PLP - 4 cycles
            0x28 => {
                let value = self.pop(bus);
                self.regs.p = Status::from_byte(value);
                4
            }

            // AND imm - 2 cycles
            0x29 => {
                let value = self.fetch(bus);
                self.do_and(value);
                2
            }

            // ROL A - 2 cycles
            0x2A => {
                self.regs.a = alu::rol(&mut self.regs.p, self.regs.a);
                2
            }

            // BIT abs - 4 cycles
            0x2C => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_bit);
                4
            }

            // AND abs - 4 cycles
            0x2D => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_and);
                4
            }

            // ROL abs - 6 cycles
            0x2E => {
                let addr = self.addr_abs(bus);
                self.rmw_op(bus, addr, Self::do_rol);
                6
            }

            // BMI rel - 2/3 cycles
            0x30 => self.branch(bus, self.regs.p.is_set(N)),

            // AND (zp),Y - 5 cycles
            0x31 => {
                let addr = self.addr_izy(bus);
                self.read_op(bus, addr, Self::do_and);
                5
            }

            // AND zp,X - 4 cycles
            0x35 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_and);
                4
            }

            // ROL zp,X - 6 cycles
            0x36 => {
                let addr = self.addr_zpx(bus);
                self.rmw_op(bus, addr, Self::do_rol);
                6
            }

            // SEC - 2 cycles
            0x38 => {
                self.regs.p.set(C);
                2
            }

            // AND abs,Y - 4 cycles
            0x39 => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_and);
                4
            }

            // AND abs,X - 4 cycles
            0x3D => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_and);
                4
            }

            // ROL abs,X - 7 cycles
            0x3E => {
                let addr = self.addr_abx(bus);
                self.rmw_op(bus, addr, Self::do_rol);
                7
            }

            // RTI - 6 cycles
            0x40 => {
                let status = self.pop(bus);
                self.regs.p = Status::from_byte(status);
                self.regs.pc = self.pop_word(bus);
                6
            }

            // EOR (zp,X) - 6 cycles
            0x41 => {
                let addr = self.addr_izx(bus);
                self.read_op(bus, addr, Self::do_eor);
                6
            }

            // EOR zp - 3 cycles
            0x45 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_eor);
                3
            }

            // LSR zp - 5 cycles
            0x46 => {
                let addr = self.addr_zp(bus);
                self.rmw_op(bus, addr, Self::do_lsr);
                5
            }

            // PHA - 3 cycles
            0x48 => {
                let a = self.regs.a;
                self.push(bus, a);
                3
            }

            // EOR imm - 2 cycles
            0x49 => {
                let value = self.fetch(bus);
                self.do_eor(value);
                2
            }

            // LSR A - 2 cycles
            0x4A => {
                self.regs.a = alu::shr(&mut self.regs.p, self.regs.a);
                2
            }

            // JMP abs - 3 cycles
            0x4C => {
                self.regs.pc = self.addr_abs(bus);
                3
            }

            // EOR abs - 4 cycles
            0x4D => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_eor);
                4
            }

            // LSR abs - 6 cycles
            0x4E => {
                let addr = self.addr_abs(bus);
                self.rmw_op(bus, addr, Self::do_lsr);
                6
            }

            // BVC rel - 2/3 cycles
            0x50 => self.branch(bus, !self.regs.p.is_set(V)),

            // EOR (zp),Y - 5 cycles
            0x51 => {
                let addr = self.addr_izy(bus);
                self.read_op(bus, addr, Self::do_eor);
                5
            }

            // EOR zp,X - 4 cycles
            0x55 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_eor);
                4
            }

            // LSR zp,X - 6 cycles
            0x56 => {
                let addr = self.addr_zpx(bus);
                self.rmw_op(bus, addr, Self::do_lsr);
                6
            }

            // CLI - 2 cycles
            0x58 => {
                self.regs.p.clear(I);
                2
            }

            // EOR abs,Y - 4 cycles
            0x59 => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_eor);
                4
            }

            // EOR abs,X - 4 cycles
            0x5D => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_eor);
                4
            }

            // LSR abs,X - 7 cycles
            0x5E => {
                let addr = self.addr_abx(bus);
                self.rmw_op(bus, addr, Self::do_lsr);
                7
            }

            // RTS - 6 cycles
            0x60 => {
                self.regs.pc = self.pop_word(bus).wrapping_add(1);
                6
            }

            // ADC (zp,X) - 6 cycles
            0x61 => {
                let addr = self.addr_izx(bus);
                self.read_op(bus, addr, Self::do_adc);
                6
            }

            // ADC zp - 3 cycles
            0x65 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_adc);
                3
            }

            // ROR zp - 5 cycles
            0x66 => {
                let addr = self.addr_zp(bus);
                self.rmw_op(bus, addr, Self::do_ror);
                5
            }

            // PLA - 4 cycles
            0x68 => {
                self.regs.a = self.pop(bus);
                self.regs.p.update_nz(self.regs.a);
                4
            }

            // ADC imm - 2 cycles
            0x69 => {
                let value = self.fetch(bus);
                self.do_adc(value);
                2
            }

            // ROR A - 2 cycles
            0x6A => {
                self.regs.a = alu::ror(&mut self.regs.p, self.regs.a);
                2
            }

            // JMP (ind) - 5 cycles
            0x6C => {
                let pointer = self.addr_abs(bus);
                self.regs.pc = self.read_word(bus, pointer);
                5
            }

            // ADC abs - 4 cycles
            0x6D => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_adc);
                4
            }

            // ROR abs - 6 cycles
            0x6E => {
                let addr = self.addr_abs(bus);
                self.rmw_op(bus, addr, Self::do_ror);
                6
            }

            // BVS rel - 2/3 cycles
            0x70 => self.branch(bus, self.regs.p.is_set(V)),

            // ADC (zp),Y - 5 cycles
            0x71 => {
                let addr = self.addr_izy(bus);
                self.read_op(bus, addr, Self::do_adc);
                5
            }

            // ADC zp,X - 4 cycles
            0x75 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_adc);
                4
            }

            // ROR zp,X - 6 cycles
            0x76 => {
                let addr = self.addr_zpx(bus);
                self.rmw_op(bus, addr, Self::do_ror);
                6
            }

            // SEI - 2 cycles
            0x78 => {
                self.regs.p.set(I);
                2
            }

            // ADC abs,Y - 4 cycles
            0x79 => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_adc);
                4
            }

            // ADC abs,X - 4 cycles
            0x7D => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_adc);
                4
            }

            // ROR abs,X - 7 cycles
            0x7E => {
                let addr = self.addr_abx(bus);
                self.rmw_op(bus, addr, Self::do_ror);
                7
            }

            // STA (zp,X) - 6 cycles
            0x81 => {
                let addr = self.addr_izx(bus);
                bus.write(addr, self.regs.a);
                6
            }

            // STY zp - 3 cycles
            0x84 => {
                let addr = self.addr_zp(bus);
                bus.write(addr, self.regs.y);
                3
            }

            // STA zp - 3 cycles
            0x85 => {
                let addr = self.addr_zp(bus);
                bus.write(addr, self.regs.a);
                3
            }

            // STX zp - 3 cycles
            0x86 => {
                let addr = self.addr_zp(bus);
                bus.write(addr, self.regs.x);
                3
            }

            // DEY - 2 cycles
            0x88 => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.regs.p.update_nz(self.regs.y);
                2
            }

            // TXA - 2 cycles
            0x8A => {
                self.regs.a = self.regs.x;
                self.regs.p.update_nz(self.regs.a);
                2
            }

            // STY abs - 4 cycles
            0x8C => {
                let addr = self.addr_abs(bus);
                bus.write(addr, self.regs.y);
                4
            }

            // STA abs - 4 cycles
            0x8D => {
                let addr = self.addr_abs(bus);
                bus.write(addr, self.regs.a);
                4
            }

            // STX abs - 4 cycles
            0x8E => {
                let addr = self.addr_abs(bus);
                bus.write(addr, self.regs.x);
                4
            }

            // BCC rel - 2/3 cycles
            0x90 => self.branch(bus, !self.regs.p.is_set(C)),

            // STA (zp),Y - 6 cycles
            0x91 => {
                let addr = self.addr_izy(bus);
                bus.write(addr, self.regs.a);
                6
            }

            // STY zp,X - 4 cycles
            0x94 => {
                let addr = self.addr_zpx(bus);
                bus.write(addr, self.regs.y);
                4
            }

            // STA zp,X - 4 cycles
            0x95 => {
                let addr = self.addr_zpx(bus);
                bus.write(addr, self.regs.a);
                4
            }

            // STX zp,Y - 4 cycles
            0x96 => {
                let addr = self.addr_zpy(bus);
                bus.write(addr, self.regs.x);
                4
            }

            // TYA - 2 cycles
            0x98 => {
                self.regs.a = self.regs.y;
                self.regs.p.update_nz(self.regs.a);
                2
            }

            // STA abs,Y - 5 cycles
            0x99 => {
                let addr = self.addr_aby(bus);
                bus.write(addr, self.regs.a);
                5
            }

            // TXS - 2 cycles (no flags)
            0x9A => {
                self.regs.s = self.regs.x;
                2
            }

            // STA abs,X - 5 cycles
            0x9D => {
                let addr = self.addr_abx(bus);
                bus.write(addr, self.regs.a);
                5
            }

            // LDY imm - 2 cycles
            0xA0 => {
                let value = self.fetch(bus);
                self.do_ldy(value);
                2
            }

            // LDA (zp,X) - 6 cycles
            0xA1 => {
                let addr = self.addr_izx(bus);
                self.read_op(bus, addr, Self::do_lda);
                6
            }

            // LDX imm - 2 cycles
            0xA2 => {
                let value = self.fetch(bus);
                self.do_ldx(value);
                2
            }

            // LDY zp - 3 cycles
            0xA4 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_ldy);
                3
            }

            // LDA zp - 3 cycles
            0xA5 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_lda);
                3
            }

            // LDX zp - 3 cycles
            0xA6 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_ldx);
                3
            }

            // TAY - 2 cycles
            0xA8 => {
                self.regs.y = self.regs.a;
                self.regs.p.update_nz(self.regs.y);
                2
            }

            // LDA imm - 2 cycles
            0xA9 => {
                let value = self.fetch(bus);
                self.do_lda(value);
                2
            }

            // TAX - 2 cycles
            0xAA => {
                self.regs.x = self.regs.a;
                self.regs.p.update_nz(self.regs.x);
                2
            }

            // LDY abs - 4 cycles
            0xAC => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_ldy);
                4
            }

            // LDA abs - 4 cycles
            0xAD => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_lda);
                4
            }

            // LDX abs - 4 cycles
            0xAE => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_ldx);
                4
            }

            // BCS rel - 2/3 cycles
            0xB0 => self.branch(bus, self.regs.p.is_set(C)),

            // LDA (zp),Y - 5 cycles
            0xB1 => {
                let addr = self.addr_izy(bus);
                self.read_op(bus, addr, Self::do_lda);
                5
            }

            // LDY zp,X - 4 cycles
            0xB4 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_ldy);
                4
            }

            // LDA zp,X - 4 cycles
            0xB5 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_lda);
                4
            }

            // LDX zp,Y - 4 cycles
            0xB6 => {
                let addr = self.addr_zpy(bus);
                self.read_op(bus, addr, Self::do_ldx);
                4
            }

            // CLV - 2 cycles
            0xB8 => {
                self.regs.p.clear(V);
                2
            }

            // LDA abs,Y - 4 cycles
            0xB9 => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_lda);
                4
            }

            // TSX - 2 cycles
            0xBA => {
                self.regs.x = self.regs.s;
                self.regs.p.update_nz(self.regs.x);
                2
            }

            // LDY abs,X - 4 cycles
            0xBC => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_ldy);
                4
            }

            // LDA abs,X - 4 cycles
            0xBD => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_lda);
                4
            }

            // LDX abs,Y - 4 cycles
            0xBE => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_ldx);
                4
            }

            // CPY imm - 2 cycles
            0xC0 => {
                let value = self.fetch(bus);
                alu::cmp(&mut self.regs.p, self.regs.y, value);
                2
            }

            // CMP (zp,X) - 6 cycles
            0xC1 => {
                let addr = self.addr_izx(bus);
                self.read_op(bus, addr, Self::do_cmp);
                6
            }

            // CPY zp - 3 cycles
            0xC4 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_cpy);
                3
            }

            // CMP zp - 3 cycles
            0xC5 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_cmp);
                3
            }

            // DEC zp - 5 cycles
            0xC6 => {
                let addr = self.addr_zp(bus);
                self.rmw_op(bus, addr, Self::do_dec);
                5
            }

            // INY - 2 cycles
            0xC8 => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.regs.p.update_nz(self.regs.y);
                2
            }

            // CMP imm - 2 cycles
            0xC9 => {
                let value = self.fetch(bus);
                self.do_cmp(value);
                2
            }

            // DEX - 2 cycles
            0xCA => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.regs.p.update_nz(self.regs.x);
                2
            }

            // CPY abs - 4 cycles
            0xCC => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_cpy);
                4
            }

            // CMP abs - 4 cycles
            0xCD => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_cmp);
                4
            }

            // DEC abs - 6 cycles
            0xCE => {
                let addr = self.addr_abs(bus);
                self.rmw_op(bus, addr, Self::do_dec);
                6
            }

            // BNE rel - 2/3 cycles
            0xD0 => self.branch(bus, !self.regs.p.is_set(Z)),

            // CMP (zp),Y - 5 cycles
            0xD1 => {
                let addr = self.addr_izy(bus);
                self.read_op(bus, addr, Self::do_cmp);
                5
            }

            // CMP zp,X - 4 cycles
            0xD5 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_cmp);
                4
            }

            // DEC zp,X - 6 cycles
            0xD6 => {
                let addr = self.addr_zpx(bus);
                self.rmw_op(bus, addr, Self::do_dec);
                6
            }

            // CLD - 2 cycles
            0xD8 => {
                self.regs.p.clear(D);
                2
            }

            // CMP abs,Y - 4 cycles
            0xD9 => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_cmp);
                4
            }

            // CMP abs,X - 4 cycles
            0xDD => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_cmp);
                4
            }

            // DEC abs,X - 7 cycles
            0xDE => {
                let addr = self.addr_abx(bus);
                self.rmw_op(bus, addr, Self::do_dec);
                7
            }

            // CPX imm - 2 cycles
            0xE0 => {
                let value = self.fetch(bus);
                alu::cmp(&mut self.regs.p, self.regs.x, value);
                2
            }

            // SBC (zp,X) - 6 cycles
            0xE1 => {
                let addr = self.addr_izx(bus);
                self.read_op(bus, addr, Self::do_sbc);
                6
            }

            // CPX zp - 3 cycles
            0xE4 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_cpx);
                3
            }

            // SBC zp - 3 cycles
            0xE5 => {
                let addr = self.addr_zp(bus);
                self.read_op(bus, addr, Self::do_sbc);
                3
            }

            // INC zp - 5 cycles
            0xE6 => {
                let addr = self.addr_zp(bus);
                self.rmw_op(bus, addr, Self::do_inc);
                5
            }

            // INX - 2 cycles
            0xE8 => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.regs.p.update_nz(self.regs.x);
                2
            }

            // SBC imm - 2 cycles
            0xE9 => {
                let value = self.fetch(bus);
                self.do_sbc(value);
                2
            }

            // NOP - 2 cycles
            0xEA => 2,

            // CPX abs - 4 cycles
            0xEC => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_cpx);
                4
            }

            // SBC abs - 4 cycles
            0xED => {
                let addr = self.addr_abs(bus);
                self.read_op(bus, addr, Self::do_sbc);
                4
            }

            // INC abs - 6 cycles
            0xEE => {
                let addr = self.addr_abs(bus);
                self.rmw_op(bus, addr, Self::do_inc);
                6
            }

            // BEQ rel - 2/3 cycles
            0xF0 => self.branch(bus, self.regs.p.is_set(Z)),

            // SBC (zp),Y - 5 cycles
            0xF1 => {
                let addr = self.addr_izy(bus);
                self.read_op(bus, addr, Self::do_sbc);
                5
            }

            // SBC zp,X - 4 cycles
            0xF5 => {
                let addr = self.addr_zpx(bus);
                self.read_op(bus, addr, Self::do_sbc);
                4
            }

            // INC zp,X - 6 cycles
            0xF6 => {
                let addr = self.addr_zpx(bus);
                self.rmw_op(bus, addr, Self::do_inc);
                6
            }

            // SED - 2 cycles
            0xF8 => {
                self.regs.p.set(D);
                2
            }

            // SBC abs,Y - 4 cycles
            0xF9 => {
                let addr = self.addr_aby(bus);
                self.read_op(bus, addr, Self::do_sbc);
                4
            }

            // SBC abs,X - 4 cycles
            0xFD => {
                let addr = self.addr_abx(bus);
                self.read_op(bus, addr, Self::do_sbc);
                4
            }

            // INC abs,X - 7 cycles
            0xFE => {
                let addr = self.addr_abx(bus);
                self.rmw_op(bus, addr, Self::do_inc);
                7
            }

            // Undefined opcodes execute as a fixed-cost no-op.
            _ => UNDEFINED_CYCLES,
        }
    }

    // ========================================================================
    // Reserved simulator opcodes
    // ========================================================================

    /// Halt until `CpuControl::wake()` (or stop). The pacer is re-anchored
    /// afterwards so the halt time is not paid back as a sprint.
    fn op_halt(&mut self) -> u64 {
        self.control.halt_wait();
        self.pacer.restart();
        2
    }

    /// Debug callback with an immediate operand. If the handler does not
    /// recognise the operand, the PC is rewound so the same instruction
    /// retries.
    fn op_debug<B: Bus>(&mut self, bus: &mut B) -> u64 {
        let code = self.fetch(bus);
        let handled = self
            .debug_handler
            .as_mut()
            .is_some_and(|handler| handler.debug(code));
        if !handled {
            self.regs.pc = self.regs.pc.wrapping_sub(2);
        }
        2
    }

    /// BRK: push PC past the pad byte, push status with B set, take the
    /// IRQ vector.
    fn op_brk<B: Bus>(&mut self, bus: &mut B) -> u64 {
        self.push_word(bus, self.regs.pc.wrapping_add(1));
        let status = self.regs.p.to_byte_brk();
        self.push(bus, status);
        self.regs.p.set(I);
        self.regs.pc = self.read_word(bus, IRQ_VECTOR);
        7
    }

    // ========================================================================
    // Addressing mode resolution
    // ========================================================================

    /// Fetch the next instruction byte.
    fn fetch<B: Bus>(&mut self, bus: &mut B) -> u8 {
        let value = bus.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    /// Fetch a little-endian word from the instruction stream.
    fn fetch_word<B: Bus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch(bus);
        let hi = self.fetch(bus);
        u16::from(lo) | (u16::from(hi) << 8)
    }

    /// Read a little-endian word; the high byte wraps within the 64 KB
    /// space.
    fn read_word<B: Bus>(&mut self, bus: &mut B, addr: u16) -> u16 {
        let lo = bus.read(addr);
        let hi = bus.read(addr.wrapping_add(1));
        u16::from(lo) | (u16::from(hi) << 8)
    }

    /// Read a little-endian word from the zero page; the high byte wraps
    /// within the zero page ($FF -> $00, never $100).
    fn read_word_zp<B: Bus>(&mut self, bus: &mut B, zp_addr: u8) -> u16 {
        let lo = bus.read(u16::from(zp_addr));
        let hi = bus.read(u16::from(zp_addr.wrapping_add(1)));
        u16::from(lo) | (u16::from(hi) << 8)
    }

    fn addr_zp<B: Bus>(&mut self, bus: &mut B) -> u16 {
        u16::from(self.fetch(bus))
    }

    fn addr_zpx<B: Bus>(&mut self, bus: &mut B) -> u16 {
        u16::from(self.fetch(bus).wrapping_add(self.regs.x))
    }

    fn addr_zpy<B: Bus>(&mut self, bus: &mut B) -> u16 {
        u16::from(self.fetch(bus).wrapping_add(self.regs.y))
    }

    fn addr_abs<B: Bus>(&mut self, bus: &mut B) -> u16 {
        self.fetch_word(bus)
    }

    fn addr_abx<B: Bus>(&mut self, bus: &mut B) -> u16 {
        self.fetch_word(bus).wrapping_add(u16::from(self.regs.x))
    }

    fn addr_aby<B: Bus>(&mut self, bus: &mut B) -> u16 {
        self.fetch_word(bus).wrapping_add(u16::from(self.regs.y))
    }

    /// (zp,X): X is added to the pointer modulo 256 *before* the pointer
    /// read.
    fn addr_izx<B: Bus>(&mut self, bus: &mut B) -> u16 {
        let pointer = self.fetch(bus).wrapping_add(self.regs.x);
        self.read_word_zp(bus, pointer)
    }

    /// (zp),Y: the pointer is read first, then Y is added to the 16-bit
    /// base. The classic asymmetry with (zp,X).
    fn addr_izy<B: Bus>(&mut self, bus: &mut B) -> u16 {
        let pointer = self.fetch(bus);
        self.read_word_zp(bus, pointer)
            .wrapping_add(u16::from(self.regs.y))
    }

    /// Conditional relative branch; taken branches cost one extra cycle.
    fn branch<B: Bus>(&mut self, bus: &mut B, condition: bool) -> u64 {
        let offset = self.fetch(bus) as i8;
        if condition {
            self.regs.pc = self.regs.pc.wrapping_add_signed(i16::from(offset));
            3
        } else {
            2
        }
    }

    // ========================================================================
    // Operation helpers
    // ========================================================================

    /// Read from memory and apply a value-consuming operation.
    fn read_op<B: Bus>(&mut self, bus: &mut B, addr: u16, op: fn(&mut Self, u8)) {
        let value = bus.read(addr);
        op(self, value);
    }

    /// Read-modify-write at a memory address.
    fn rmw_op<B: Bus>(&mut self, bus: &mut B, addr: u16, op: fn(&mut Self, u8) -> u8) {
        let value = bus.read(addr);
        let result = op(self, value);
        bus.write(addr, result);
    }

    fn push<B: Bus>(&mut self, bus: &mut B, value: u8) {
        let addr = self.regs.push();
        bus.write(addr, value);
    }

    fn push_word<B: Bus>(&mut self, bus: &mut B, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, (value & 0xFF) as u8);
    }

    fn pop<B: Bus>(&mut self, bus: &mut B) -> u8 {
        let addr = self.regs.pop();
        bus.read(addr)
    }

    fn pop_word<B: Bus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.pop(bus);
        let hi = self.pop(bus);
        u16::from(lo) | (u16::from(hi) << 8)
    }

    fn do_lda(&mut self, value: u8) {
        self.regs.a = value;
        self.regs.p.update_nz(value);
    }

    fn do_ldx(&mut self, value: u8) {
        self.regs.x = value;
        self.regs.p.update_nz(value);
    }

    fn do_ldy(&mut self, value: u8) {
        self.regs.y = value;
        self.regs.p.update_nz(value);
    }

    fn do_ora(&mut self, value: u8) {
        self.regs.a = alu::ora(&mut self.regs.p, self.regs.a, value);
    }

    fn do_and(&mut self, value: u8) {
        self.regs.a = alu::and(&mut self.regs.p, self.regs.a, value);
    }

    fn do_eor(&mut self, value: u8) {
        self.regs.a = alu::eor(&mut self.regs.p, self.regs.a, value);
    }

    fn do_adc(&mut self, value: u8) {
        let decimal = self.regs.p.is_set(D);
        self.regs.a = alu::add(&mut self.regs.p, self.regs.a, value, decimal);
    }

    fn do_sbc(&mut self, value: u8) {
        let decimal = self.regs.p.is_set(D);
        self.regs.a = alu::sub(&mut self.regs.p, self.regs.a, value, decimal);
    }

    fn do_cmp(&mut self, value: u8) {
        alu::cmp(&mut self.regs.p, self.regs.a, value);
    }

    fn do_cpx(&mut self, value: u8) {
        alu::cmp(&mut self.regs.p, self.regs.x, value);
    }

    fn do_cpy(&mut self, value: u8) {
        alu::cmp(&mut self.regs.p, self.regs.y, value);
    }

    /// BIT: Z from A AND value, N and V copied from the value.
    fn do_bit(&mut self, value: u8) {
        self.regs.p.set_if(Z, self.regs.a & value == 0);
        self.regs.p.set_if(N, value & 0x80 != 0);
        self.regs.p.set_if(V, value & 0x40 != 0);
    }

    fn do_asl(&mut self, value: u8) -> u8 {
        alu::shl(&mut self.regs.p, value)
    }

    fn do_lsr(&mut self, value: u8) -> u8 {
        alu::shr(&mut self.regs.p, value)
    }

    fn do_rol(&mut self, value: u8) -> u8 {
        alu::rol(&mut self.regs.p, value)
    }

    fn do_ror(&mut self, value: u8) -> u8 {
        alu::ror(&mut self.regs.p, value)
    }

    fn do_inc(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        self.regs.p.update_nz(result);
        result
    }

    fn do_dec(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        self.regs.p.update_nz(result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Flat 64 KB RAM bus for CPU tests.
    struct TestBus {
        mem: Vec<u8>,
    }

    impl TestBus {
        fn new() -> Self {
            Self { mem: vec![0; 0x10000] }
        }

        /// Load a program at an address and point the reset vector at it.
        fn with_program(origin: u16, program: &[u8]) -> Self {
            let mut bus = Self::new();
            bus.mem[origin as usize..origin as usize + program.len()].copy_from_slice(program);
            bus.mem[RESET_VECTOR as usize] = (origin & 0xFF) as u8;
            bus.mem[RESET_VECTOR as usize + 1] = (origin >> 8) as u8;
            bus
        }
    }

    impl Bus for TestBus {
        fn read(&mut self, address: u16) -> u8 {
            self.mem[address as usize]
        }

        fn write(&mut self, address: u16, value: u8) {
            self.mem[address as usize] = value;
        }

        fn peek(&self, address: u16) -> u8 {
            self.mem[address as usize]
        }
    }

    fn make_cpu() -> Cpu6502 {
        // Unregulated clock, no real calibration needed in tests.
        let control = Arc::new(CpuControl::new(0.0));
        Cpu6502::new(control, TimingProfile::assume(Duration::from_millis(1)))
    }

    fn cpu_with_program(origin: u16, program: &[u8]) -> (Cpu6502, TestBus) {
        let mut bus = TestBus::with_program(origin, program);
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    #[test]
    fn reset_loads_vector() {
        let (cpu, _bus) = cpu_with_program(0x1234, &[0xEA]);
        assert_eq!(cpu.regs.pc, 0x1234);
        assert!(cpu.regs.p.is_set(I));
    }

    #[test]
    fn lda_immediate_sets_flags() {
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[0xA9, 0x00, 0xA9, 0x80]);
        let cycles = cpu.step(&mut bus);
        assert_eq!(cycles, 2);
        assert_eq!(cpu.regs.a, 0x00);
        assert!(cpu.regs.p.is_set(Z));

        cpu.step(&mut bus);
        assert_eq!(cpu.regs.a, 0x80);
        assert!(cpu.regs.p.is_set(N));
        assert!(!cpu.regs.p.is_set(Z));
    }

    #[test]
    fn zero_page_indirect_wraps_within_zero_page() {
        // LDA ($FF,X) with X=0: pointer low at $FF, high at $00 - not $100.
        let mut bus = TestBus::with_program(0x0200, &[0xA1, 0xFF]);
        bus.mem[0x00FF] = 0x34;
        bus.mem[0x0000] = 0x12;
        bus.mem[0x0100] = 0x99; // must NOT be used as the pointer high byte
        bus.mem[0x1234] = 0x42;

        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.regs.x = 0;
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.a, 0x42);
    }

    #[test]
    fn indexed_indirect_adds_x_before_pointer_read() {
        // LDA ($F0,X) with X=$0F reads the pointer from $FF (mod 256).
        let mut bus = TestBus::with_program(0x0200, &[0xA1, 0xF0]);
        bus.mem[0x00FF] = 0x00;
        bus.mem[0x0000] = 0x30;
        bus.mem[0x3000] = 0x55;

        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.regs.x = 0x0F;
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.a, 0x55);
    }

    #[test]
    fn indirect_indexed_adds_y_after_pointer_read() {
        // LDA ($10),Y: pointer read from $10/$11, then Y added to the base.
        let mut bus = TestBus::with_program(0x0200, &[0xB1, 0x10]);
        bus.mem[0x0010] = 0xFF;
        bus.mem[0x0011] = 0x20; // base $20FF
        bus.mem[0x2100] = 0x77; // $20FF + 1

        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.regs.y = 0x01;
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.a, 0x77);
    }

    #[test]
    fn jmp_indirect_wraps_within_64k() {
        // JMP ($FFFF): low byte from $FFFF, high byte wraps to $0000.
        let mut bus = TestBus::with_program(0x0200, &[0x6C, 0xFF, 0xFF]);
        bus.mem[0xFFFF] = 0x00;
        bus.mem[0x0000] = 0x80;

        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x8000);
    }

    #[test]
    fn branch_taken_costs_extra_cycle() {
        // BEQ taken vs not taken.
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[0xF0, 0x02, 0xF0, 0x02]);
        cpu.regs.p.clear(Z);
        assert_eq!(cpu.step(&mut bus), 2, "branch not taken");
        assert_eq!(cpu.regs.pc, 0x0202);

        cpu.regs.p.set(Z);
        assert_eq!(cpu.step(&mut bus), 3, "branch taken");
        assert_eq!(cpu.regs.pc, 0x0206);
    }

    #[test]
    fn branch_backwards() {
        // BNE -2 loops onto itself.
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[0xD0, 0xFE]);
        cpu.regs.p.clear(Z);
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x0200);
    }

    #[test]
    fn stack_pointer_wraps_within_stack_page() {
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[0x48, 0x48]);
        cpu.regs.s = 0x00;
        cpu.regs.a = 0xAB;
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x0100], 0xAB);
        assert_eq!(cpu.regs.s, 0xFF, "stack pointer wraps to $FF");
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x01FF], 0xAB);
    }

    #[test]
    fn jsr_rts_round_trip() {
        // JSR $0280; at $0280: RTS. Next instruction after return is at $0203.
        let mut bus = TestBus::with_program(0x0200, &[0x20, 0x80, 0x02]);
        bus.mem[0x0280] = 0x60; // RTS
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);

        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.regs.pc, 0x0280);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.regs.pc, 0x0203);
    }

    #[test]
    fn brk_pushes_status_with_break_set() {
        let mut bus = TestBus::with_program(0x0200, &[0x00]);
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x90;
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        let s_before = cpu.regs.s;

        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.regs.pc, 0x9000);
        assert!(cpu.regs.p.is_set(I));
        let pushed_status = bus.mem[0x0100 + cpu.regs.s.wrapping_add(1) as usize];
        assert_ne!(pushed_status & 0x10, 0, "BRK pushes B set");
        // Return address is BRK + 2 (past the pad byte).
        let ret_lo = bus.mem[0x0100 + s_before.wrapping_sub(1) as usize];
        let ret_hi = bus.mem[0x0100 + s_before as usize];
        assert_eq!(u16::from(ret_lo) | (u16::from(ret_hi) << 8), 0x0202);
    }

    #[test]
    fn nmi_wins_over_simultaneous_irq() {
        let mut bus = TestBus::with_program(0x0200, &[0xEA, 0xEA]);
        bus.mem[NMI_VECTOR as usize] = 0x00;
        bus.mem[NMI_VECTOR as usize + 1] = 0x70;
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x80;

        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.regs.p.clear(I);
        cpu.control().set_irq_masked(false);

        cpu.control().raise_nmi();
        cpu.control().raise_irq();

        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x7000, "NMI serviced first");
        // IRQ stays latched and is serviced next... but servicing the NMI
        // set I, which does not matter: maskability was captured at raise
        // time.
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x8000, "IRQ serviced after NMI");
    }

    #[test]
    fn irq_raise_is_noop_while_i_set() {
        let mut bus = TestBus::with_program(0x0200, &[0xEA, 0xEA]);
        bus.mem[IRQ_VECTOR as usize + 1] = 0x80;

        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        // Reset leaves I set; the mirror is refreshed by reset().
        cpu.control().raise_irq();
        assert!(!cpu.control().irq_pending());

        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x0201, "no interrupt was serviced");
    }

    #[test]
    fn irq_services_after_cli() {
        // CLI; NOP - after CLI executes, a raised IRQ is latched and
        // serviced before the NOP.
        let mut bus = TestBus::with_program(0x0200, &[0x58, 0xEA]);
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x80;

        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.step(&mut bus); // CLI
        cpu.control().raise_irq();
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x8000);
        assert!(cpu.regs.p.is_set(I), "servicing sets I");
    }

    #[test]
    fn reset_signal_discards_pending_interrupts() {
        let mut bus = TestBus::with_program(0x0200, &[0xEA, 0xEA]);
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.control().set_irq_masked(false);
        cpu.control().raise_nmi();
        cpu.control().raise_irq();
        cpu.control().raise_reset();

        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x0200, "reset re-read the vector");
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x0201, "no interrupt survived the reset");
    }

    #[test]
    fn rti_restores_status_and_pc() {
        let mut bus = TestBus::with_program(0x0200, &[0x40]);
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        // Hand-build an interrupt frame: PC $1234, status with C set.
        cpu.regs.s = 0xFC;
        bus.mem[0x01FD] = 0x01 | 0x20; // status: C | U
        bus.mem[0x01FE] = 0x34;
        bus.mem[0x01FF] = 0x12;

        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x1234);
        assert!(cpu.regs.p.is_set(C));
    }

    #[test]
    fn decimal_mode_adc() {
        // SED; CLC; LDA #$19; ADC #$03 -> $22 in BCD.
        let (mut cpu, mut bus) =
            cpu_with_program(0x0200, &[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x03]);
        for _ in 0..4 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.regs.a, 0x22);
        assert!(!cpu.regs.p.is_set(C));
    }

    #[test]
    fn undefined_opcode_is_six_cycle_noop() {
        // $FF is undefined: nothing changes but PC and cycles.
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[0xFF, 0xEA]);
        let regs_before = cpu.regs;
        let cycles = cpu.step(&mut bus);
        assert_eq!(cycles, 6);
        assert_eq!(cpu.regs.pc, 0x0201);
        assert_eq!(cpu.regs.a, regs_before.a);
        assert_eq!(cpu.regs.p, regs_before.p);
    }

    #[test]
    fn rmw_writes_back() {
        // INC $10
        let mut bus = TestBus::with_program(0x0200, &[0xE6, 0x10]);
        bus.mem[0x0010] = 0x7F;
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x0010], 0x80);
        assert!(cpu.regs.p.is_set(N));
    }

    #[test]
    fn bit_copies_value_bits() {
        let mut bus = TestBus::with_program(0x0200, &[0x24, 0x10]);
        bus.mem[0x0010] = 0xC0;
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        cpu.regs.a = 0x3F;
        cpu.step(&mut bus);
        assert!(cpu.regs.p.is_set(N));
        assert!(cpu.regs.p.is_set(V));
        assert!(cpu.regs.p.is_set(Z), "A & value == 0");
    }

    #[test]
    fn debug_opcode_rewinds_when_unhandled() {
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[OP_DEBUG, 0x7F]);
        // No handler attached: PC must rewind to the opcode.
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x0200);
    }

    #[test]
    fn debug_opcode_advances_when_handled() {
        struct Recorder(Arc<Mutex<Vec<u8>>>);
        impl DebugHandler for Recorder {
            fn debug(&mut self, code: u8) -> bool {
                self.0.lock().expect("lock").push(code);
                code == 0x01
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[OP_DEBUG, 0x01, 0xEA]);
        cpu.set_debug_handler(Box::new(Recorder(Arc::clone(&seen))));

        cpu.step(&mut bus);
        assert_eq!(cpu.regs.pc, 0x0202);
        assert_eq!(*seen.lock().expect("lock"), vec![0x01]);
    }

    #[test]
    fn halt_opcode_blocks_until_woken() {
        let mut bus = TestBus::with_program(0x0200, &[OP_HALT, 0xEA]);
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        let control = Arc::clone(cpu.control());

        let handle = std::thread::spawn(move || {
            cpu.step(&mut bus); // parks in the halt opcode
            cpu.regs.pc
        });

        // Give the CPU thread time to park, then wake it.
        while !control.is_halted() {
            std::thread::sleep(Duration::from_millis(1));
        }
        control.wake();
        let pc = handle.join().expect("cpu thread");
        assert_eq!(pc, 0x0201);
    }

    #[test]
    fn trace_sink_sees_instructions() {
        struct Collect(Arc<Mutex<Vec<TraceEntry>>>);
        impl TraceSink for Collect {
            fn record(&mut self, entry: &TraceEntry) {
                self.0.lock().expect("lock").push(*entry);
            }
        }

        let entries = Arc::new(Mutex::new(Vec::new()));
        let (mut cpu, mut bus) = cpu_with_program(0x0200, &[0xA9, 0x42, 0xEA]);
        cpu.set_trace_sink(Box::new(Collect(Arc::clone(&entries))));

        // Disabled: nothing recorded.
        cpu.step(&mut bus);
        assert!(entries.lock().expect("lock").is_empty());

        cpu.control().set_trace_enabled(true);
        cpu.step(&mut bus);
        let recorded = entries.lock().expect("lock");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].pc, 0x0202);
        assert_eq!(recorded[0].opcode, 0xEA);
        assert_eq!(recorded[0].a, 0x42);
    }

    #[test]
    fn run_stops_on_request() {
        // Infinite loop: JMP $0200.
        let mut bus = TestBus::with_program(0x0200, &[0x4C, 0x00, 0x02]);
        let mut cpu = make_cpu();
        cpu.reset(&mut bus);
        let control = Arc::clone(cpu.control());

        let handle = std::thread::spawn(move || {
            cpu.run(&mut bus);
            cpu.total_cycles()
        });
        std::thread::sleep(Duration::from_millis(20));
        control.request_stop();
        let cycles = handle.join().expect("cpu thread");
        assert!(cycles > 0);
    }
}
