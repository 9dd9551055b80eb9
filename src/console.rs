//! Serial console on COM1, the sink for kernel logging.

use core::fmt::{self, Write};
use spin::Mutex;
use x86_64::instructions::port::Port;

const COM1_BASE: u16 = 0x3f8;

/// 16550-style UART behind four I/O ports.
struct SerialPort {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            interrupt_enable: Port::new(base + 1),
            fifo_control: Port::new(base + 2),
            line_control: Port::new(base + 3),
            line_status: Port::new(base + 5),
        }
    }

    /// 115200 baud, 8 data bits, no parity, one stop bit, FIFOs on.
    fn init(&mut self) {
        unsafe {
            self.interrupt_enable.write(0x00);
            self.line_control.write(0x80); // DLAB on
            self.data.write(0x01); // divisor low: 115200
            self.interrupt_enable.write(0x00); // divisor high
            self.line_control.write(0x03); // 8n1, DLAB off
            self.fifo_control.write(0xc7);
        }
    }

    fn send(&mut self, byte: u8) {
        unsafe {
            while self.line_status.read() & 0x20 == 0 {}
            self.data.write(byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

static CONSOLE: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

/// Program the UART; call once before the first print.
pub fn init() {
    CONSOLE.lock().init();
}

pub fn print(args: fmt::Arguments) {
    CONSOLE.lock().write_fmt(args).unwrap();
}

/// print string macro
#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?))
    }
}

/// println string macro
#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    }
}
