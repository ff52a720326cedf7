//! Operator-facing terminal output.

use std::io::{IsTerminal, Write};

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::supervisor::output::{LineSink, OutputLine};

/// Tag colors handed out to services by launch position.
const TAG_COLORS: [Color; 5] = [Color::Cyan, Color::Magenta, Color::Yellow, Color::Green, Color::Blue];

#[derive(Debug, Clone, Copy)]
pub struct Console {
    choice: ColorChoice,
}

impl Console {
    pub fn new(no_color: bool) -> Self {
        let choice = if no_color || !std::io::stdout().is_terminal() {
            ColorChoice::Never
        } else {
            ColorChoice::Auto
        };
        Self { choice }
    }

    pub fn header(&self, msg: &str) {
        let mut stdout = StandardStream::stdout(self.choice);
        let rule = "─".repeat(60);
        let _ = writeln!(stdout);
        let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)));
        let _ = writeln!(stdout, "  {rule}");
        let _ = stdout.set_color(ColorSpec::new().set_bold(true));
        let _ = writeln!(stdout, "  {msg}");
        let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)));
        let _ = writeln!(stdout, "  {rule}");
        let _ = stdout.reset();
    }

    pub fn info(&self, msg: &str) {
        self.line(Color::Blue, "ℹ", msg, false);
    }

    pub fn success(&self, msg: &str) {
        self.line(Color::Green, "✓", msg, false);
    }

    pub fn warn(&self, msg: &str) {
        self.line(Color::Yellow, "⚠", msg, true);
    }

    pub fn error(&self, msg: &str) {
        self.line(Color::Red, "✗", msg, true);
    }

    /// Dimmed detail line, indented under the previous message.
    pub fn detail(&self, msg: &str) {
        let mut stdout = StandardStream::stdout(self.choice);
        let _ = stdout.set_color(ColorSpec::new().set_dimmed(true));
        let _ = writeln!(stdout, "    {msg}");
        let _ = stdout.reset();
    }

    fn line(&self, color: Color, glyph: &str, msg: &str, color_text: bool) {
        let mut stdout = StandardStream::stdout(self.choice);
        let _ = stdout.set_color(ColorSpec::new().set_fg(Some(color)));
        let _ = write!(stdout, "  {glyph}  ");
        if !color_text {
            let _ = stdout.reset();
        }
        let _ = writeln!(stdout, "{msg}");
        let _ = stdout.reset();
    }
}

/// Writes child output to stdout with a colored service tag.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    console: Console,
}

impl ConsoleSink {
    pub fn new(console: Console) -> Self {
        Self { console }
    }
}

impl LineSink for ConsoleSink {
    fn emit(&self, line: &OutputLine) {
        let stdout = StandardStream::stdout(self.console.choice);
        let mut out = stdout.lock();
        let color = TAG_COLORS[line.slot % TAG_COLORS.len()];
        let _ = out.set_color(ColorSpec::new().set_fg(Some(color)));
        let _ = write!(out, "  [{:8}]", line.service);
        let _ = out.reset();
        let _ = writeln!(out, " {}", line.line);
    }
}
