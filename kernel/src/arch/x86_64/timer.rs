// 8253/8254 programmable interval timer

use x86_64::instructions::port::Port;

/// Input clock of the PIT, in Hz.
const PIT_INPUT_HZ: u32 = 1_193_182;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, rate generator.
const PIT_MODE_RATE: u8 = 0x36;

/// Programs channel 0 to fire IRQ 0 at `frequency_hz`.
pub fn init(frequency_hz: u32) {
    let divisor = PIT_INPUT_HZ / frequency_hz;

    // SAFETY: writes the standard PIT ports during single-threaded
    // bring-up; the divisor fits the 16-bit reload register at any
    // frequency this kernel configures.
    unsafe {
        let mut command: Port<u8> = Port::new(PIT_COMMAND);
        let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);

        command.write(PIT_MODE_RATE);
        channel0.write((divisor & 0xff) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    log::info!("timer programmed at {} Hz", frequency_hz);
}
