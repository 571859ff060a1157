use std::fmt::Display;

use console::Style;

/// Formats user-facing messages. Holds nothing but whether to colour them.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    color: bool,
}

impl Printer {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    /// Colour only when stdout is a terminal that supports it.
    pub fn detect() -> Self {
        Self::new(console::colors_enabled())
    }

    pub fn info(&self, msg: impl Display) {
        println!("{}", self.format_info(msg));
    }

    pub fn bullet(&self, item: impl Display) {
        self.info(format_args!("* {item}"));
    }

    pub fn warn(&self, msg: impl Display) {
        eprintln!("{}", self.paint(Style::new().yellow(), msg));
    }

    pub fn format_info(&self, msg: impl Display) -> String {
        self.paint(Style::new().cyan(), msg)
    }

    fn paint(&self, style: Style, msg: impl Display) -> String {
        style.force_styling(self.color).apply_to(msg).to_string()
    }
}
