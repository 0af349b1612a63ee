// Console output for the loader
// Sink-based: the embedding firmware injects where messages go

use core::fmt::{self, Write};
use spin::Mutex;
use lazy_static::lazy_static;
use heapless::String;

// === CONSOLE MACROS ===

#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {{
        let console = $crate::console::CONSOLE.lock();
        console.print(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! console_println {
    () => {
        $crate::console_print!("\r\n")
    };
    ($($arg:tt)*) => {{
        $crate::console_print!($($arg)*);
        $crate::console_print!("\r\n");
    }};
}

// === CONSOLE ===

/// Where formatted console text goes (UART, semihosting, test capture)
pub type ConsoleSink = fn(&str);

pub struct Console {
    sink: Option<ConsoleSink>,
}

impl Console {
    pub const fn new() -> Self {
        Console { sink: None }
    }

    pub fn set_sink(&mut self, sink: ConsoleSink) {
        self.sink = Some(sink);
    }

    pub fn clear_sink(&mut self) {
        self.sink = None;
    }

    pub fn print(&self, args: fmt::Arguments) {
        if let Some(sink) = self.sink {
            sink(format_args_to_string(args).as_str());
        }
    }
}

// Global console instance; silent until a sink is injected
lazy_static! {
    pub static ref CONSOLE: Mutex<Console> = Mutex::new(Console::new());
}

pub fn set_sink(sink: ConsoleSink) {
    CONSOLE.lock().set_sink(sink);
}

// Helper to convert format_args to string
fn format_args_to_string(args: fmt::Arguments) -> String<256> {
    let mut string = String::new();
    let _ = write!(string, "{}", args);
    string
}
