// Interrupt Descriptor Table and trap stubs

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::PrivilegeLevel;

use crate::hal::interrupt::{exception_dispatch, irq_dispatch, ExceptionContext};

use super::pic;

/// Vector of the kernel-call trap.
pub const KCALL_VECTOR: u8 = 0x80;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        // Remapped IRQ range.
        idt[pic::PIC_VECTOR_OFFSET].set_handler_fn(irq0_handler);
        idt[pic::PIC_VECTOR_OFFSET + 1].set_handler_fn(irq1_handler);
        idt[pic::PIC_VECTOR_OFFSET + 2].set_handler_fn(irq2_handler);
        idt[pic::PIC_VECTOR_OFFSET + 3].set_handler_fn(irq3_handler);
        idt[pic::PIC_VECTOR_OFFSET + 4].set_handler_fn(irq4_handler);
        idt[pic::PIC_VECTOR_OFFSET + 5].set_handler_fn(irq5_handler);
        idt[pic::PIC_VECTOR_OFFSET + 6].set_handler_fn(irq6_handler);
        idt[pic::PIC_VECTOR_OFFSET + 7].set_handler_fn(irq7_handler);
        idt[pic::PIC_VECTOR_OFFSET + 8].set_handler_fn(irq8_handler);
        idt[pic::PIC_VECTOR_OFFSET + 9].set_handler_fn(irq9_handler);
        idt[pic::PIC_VECTOR_OFFSET + 10].set_handler_fn(irq10_handler);
        idt[pic::PIC_VECTOR_OFFSET + 11].set_handler_fn(irq11_handler);
        idt[pic::PIC_VECTOR_OFFSET + 12].set_handler_fn(irq12_handler);
        idt[pic::PIC_VECTOR_OFFSET + 13].set_handler_fn(irq13_handler);
        idt[pic::PIC_VECTOR_OFFSET + 14].set_handler_fn(irq14_handler);
        idt[pic::PIC_VECTOR_OFFSET + 15].set_handler_fn(irq15_handler);

        // Everything above the IRQ range gets a stub too, so a stray
        // vector is observed instead of double-faulting.
        for vector in (pic::PIC_VECTOR_OFFSET + 16)..=255u8 {
            if vector != KCALL_VECTOR {
                idt[vector].set_handler_fn(unexpected_interrupt_handler);
            }
        }

        // Kernel-call trap, reachable from ring 3. The interrupt gate masks
        // IF on entry, satisfying the dispatch ordering contract.
        unsafe {
            idt[KCALL_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(kcall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

/// Loads the IDT. All 256 vectors are wired when this returns.
pub fn init() {
    IDT.load();
}

fn forward_exception(num: u8, frame: &InterruptStackFrame, error_code: u64, addr: u64) {
    let ctx = ExceptionContext {
        num,
        instruction: frame.instruction_pointer.as_u64(),
        addr,
        error_code,
        user_mode: frame.code_segment.rpl() == PrivilegeLevel::Ring3,
    };
    exception_dispatch(&ctx);
}

macro_rules! exception_handler {
    ($name:ident, $num:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            forward_exception($num, &frame, 0, 0);
        }
    };
}

macro_rules! exception_handler_errcode {
    ($name:ident, $num:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            forward_exception($num, &frame, error_code, 0);
        }
    };
}

exception_handler!(divide_error_handler, 0);
exception_handler!(debug_handler, 1);
exception_handler!(nmi_handler, 2);
exception_handler!(breakpoint_handler, 3);
exception_handler!(overflow_handler, 4);
exception_handler!(bound_range_handler, 5);
exception_handler!(invalid_opcode_handler, 6);
exception_handler!(device_not_available_handler, 7);
exception_handler_errcode!(invalid_tss_handler, 10);
exception_handler_errcode!(segment_not_present_handler, 11);
exception_handler_errcode!(stack_segment_handler, 12);
exception_handler_errcode!(general_protection_handler, 13);
exception_handler!(x87_floating_point_handler, 16);
exception_handler_errcode!(alignment_check_handler, 17);
exception_handler!(simd_floating_point_handler, 19);
exception_handler!(virtualization_handler, 20);

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read()
        .map(|a| a.as_u64())
        .unwrap_or(0);
    forward_exception(14, &frame, error_code.bits(), addr);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _error_code: u64) -> ! {
    // A fault while handling a fault: the kernel state is gone.
    crate::kprintln!("double fault at {:#x}", frame.instruction_pointer.as_u64());
    crate::hal::kpanic("double fault");
}

extern "x86-interrupt" fn unexpected_interrupt_handler(_frame: InterruptStackFrame) {
    log::warn!("interrupt on an unclaimed vector");
}

macro_rules! irq_handler {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            irq_dispatch($irq);
            // Acknowledge after the handler, before iretq restores IF, so
            // a storm on the same line cannot re-enter.
            pic::eoi($irq);
            // Honor an expired quantum on the way out.
            crate::pm::sched::preempt_point();
        }
    };
}

irq_handler!(irq0_handler, 0);
irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);

/// Register block captured by the kernel-call stub, in push order.
#[repr(C)]
struct KcallFrame {
    r11: u64,
    rcx: u64,
    r9: u64,
    r8: u64,
    r10: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    rax: u64,
}

extern "C" fn kcall_trap(frame: &mut KcallFrame) {
    let result = crate::kcall::dispatch(
        frame.rax as usize,
        [
            frame.rdi as usize,
            frame.rsi as usize,
            frame.rdx as usize,
            frame.r10 as usize,
            frame.r8 as usize,
            frame.r9 as usize,
        ],
    );
    frame.rax = result as u64;
}

/// Kernel-call trap stub.
///
/// Register slots: rax = call number, rdi rsi rdx r10 r8 r9 = arguments,
/// rax = result. The stub spills the slots, hands the Rust dispatcher a
/// pointer to them, and restores everything but rax.
#[unsafe(naked)]
unsafe extern "C" fn kcall_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rdi",
        "push rsi",
        "push rdx",
        "push r10",
        "push r8",
        "push r9",
        "push rcx",
        "push r11",
        "mov rdi, rsp",
        "call {trap}",
        "pop r11",
        "pop rcx",
        "pop r9",
        "pop r8",
        "pop r10",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rax",
        "iretq",
        trap = sym kcall_trap,
    );
}
