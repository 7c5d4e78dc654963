// UART 16550 stdout backend

use uart_16550::SerialPort;

use crate::dev::stdout::StdoutDevice;

const COM1: u16 = 0x3f8;

/// Standard output over the first serial port.
pub struct SerialOut {
    port: Option<SerialPort>,
}

impl SerialOut {
    pub const fn new() -> Self {
        Self { port: None }
    }
}

impl StdoutDevice for SerialOut {
    fn init(&mut self) {
        // SAFETY: COM1 is the standard port block for the first UART.
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        self.port = Some(port);
    }

    fn write(&mut self, buf: &[u8]) {
        if let Some(port) = self.port.as_mut() {
            for &byte in buf {
                port.send(byte);
            }
        }
    }
}
