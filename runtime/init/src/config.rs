//! Init configuration

use alloc::string::String;
use alloc::vec::Vec;
use core::time::Duration;

use tern_platform::DEFAULT_ENDPOINT_BUF_WORDS;

/// Interrupt line of the console UART
pub const UART_IRQ: usize = 106;

/// Init configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    /// Receive buffer of every endpoint init creates, in words
    pub buf_words: usize,

    /// How long a routed `FIND_SERVICE` may wait for the provider's answer
    pub lookup_timeout: Duration,

    /// Longest the event loop sleeps before checking deadlines again
    pub idle_poll: Duration,

    /// Initial number of domain-table entries
    pub domain_capacity: usize,

    /// Boot modules spawned on the local core at start
    pub autostart: Vec<String>,

    /// Interrupt that signals UART input, if the board wires one up
    pub uart_irq: Option<usize>,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            buf_words: DEFAULT_ENDPOINT_BUF_WORDS,
            lookup_timeout: Duration::from_secs(2),
            idle_poll: Duration::from_millis(50),
            domain_capacity: 8,
            autostart: Vec::new(),
            uart_irq: Some(UART_IRQ),
        }
    }
}

impl InitConfig {
    /// Default configuration that starts `modules` at boot
    pub fn with_autostart<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { autostart: modules.into_iter().map(Into::into).collect(), ..Self::default() }
    }
}
