//! Board devices init drives directly
//!
//! The register-level drivers live with the board support code; init only
//! needs a byte-oriented console and an on/off LED.

/// Console UART
pub trait Uart {
    fn putchar(&mut self, c: u8);

    fn write(&mut self, bytes: &[u8]) {
        for &c in bytes {
            self.putchar(c);
        }
    }

    /// Next received byte, if any
    fn getchar(&mut self) -> Option<u8>;
}

/// Status LED
pub trait Led {
    fn set(&mut self, on: bool);
}

/// UART that drops output and never has input
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUart;

impl Uart for NullUart {
    fn putchar(&mut self, _c: u8) {}

    fn getchar(&mut self) -> Option<u8> {
        None
    }
}

/// LED that only remembers its state
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLed {
    pub on: bool,
}

impl Led for NullLed {
    fn set(&mut self, on: bool) {
        self.on = on;
    }
}
