//! Log line formatting for the tether binary.
//!
//! Lines go to stderr, since stdout carries stream data:
//!
//! ```text
//! 14:03:27.118 INFO  socket       Connected
//! 14:03:27.140 DEBUG multiplexer  Stream 0 initialized success=true
//! ```
//!
//! The component column comes from a `component` field when the event has
//! one, and otherwise from the last segment of the event's module path.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COMPONENT_WIDTH: usize = 12;

/// Log through `tracing` at `$level` with a `component` field
#[macro_export]
macro_rules! component {
    ($level:ident, $component:expr, $($arg:tt)*) => {
        tracing::$level!(component = $component, $($arg)*)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Plain,
    Ansi,
}

impl Style {
    fn detect() -> Self {
        let no_color = std::env::var_os("NO_COLOR").is_some()
            || std::env::var("TERM").map(|t| t == "dumb").unwrap_or(false);

        if !no_color && std::io::stderr().is_terminal() {
            Style::Ansi
        } else {
            Style::Plain
        }
    }

    fn paint(self, level: Level, text: &str) -> String {
        let code = match level {
            Level::ERROR => "31",
            Level::WARN => "33",
            Level::INFO => "32",
            Level::DEBUG | Level::TRACE => "2",
        };

        match self {
            Style::Plain => text.to_string(),
            Style::Ansi => format!("\x1b[{}m{}\x1b[0m", code, text),
        }
    }
}

/// Event formatter installed by `main`
pub struct TetherLogFormatter {
    style: Style,
}

impl Default for TetherLogFormatter {
    fn default() -> Self {
        Self {
            style: Style::detect(),
        }
    }
}

impl TetherLogFormatter {
    fn line(&self, level: Level, target: &str, fields: &Fields) -> String {
        let component = fields
            .component
            .as_deref()
            .unwrap_or_else(|| target.rsplit("::").next().unwrap_or(target));

        let mut line = format!(
            "{} {} {}",
            self.style.paint(level, &format!("{:<5}", level.as_str())),
            column(component),
            fields.message
        );
        for (key, value) in &fields.extra {
            line.push_str(&format!(" {}={}", key, value));
        }
        line
    }
}

fn column(component: &str) -> String {
    if component.chars().count() > COMPONENT_WIDTH {
        component.chars().take(COMPONENT_WIDTH).collect()
    } else {
        format!("{:<width$}", component, width = COMPONENT_WIDTH)
    }
}

impl<S, N> FormatEvent<S, N> for TetherLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        let metadata = event.metadata();
        writeln!(
            writer,
            "{} {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            self.line(*metadata.level(), metadata.target(), &fields)
        )
    }
}

#[derive(Default)]
struct Fields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Fields {
    fn put(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => self.extra.push((name, value)),
        }
    }
}

impl tracing::field::Visit for Fields {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.put(field.name(), format!("{:?}", value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> TetherLogFormatter {
        TetherLogFormatter {
            style: Style::Plain,
        }
    }

    fn fields(component: Option<&str>, message: &str) -> Fields {
        Fields {
            message: message.to_string(),
            component: component.map(str::to_string),
            extra: Vec::new(),
        }
    }

    #[test]
    fn test_component_from_field_or_target() {
        let formatter = plain();

        assert_eq!(
            formatter.line(Level::INFO, "tether", &fields(Some("socket"), "Connected")),
            "INFO  socket       Connected"
        );
        assert_eq!(
            formatter.line(
                Level::DEBUG,
                "tether_session::multiplexer",
                &fields(None, "Stream 0 initialized")
            ),
            "DEBUG multiplexer  Stream 0 initialized"
        );
    }

    #[test]
    fn test_extra_fields_and_truncation() {
        let formatter = plain();
        let mut event = fields(Some("transport-layer"), "Dialed");
        event.extra.push(("attempt", "2".to_string()));

        assert_eq!(
            formatter.line(Level::WARN, "tether", &event),
            "WARN  transport-la Dialed attempt=2"
        );
    }

    #[test]
    fn test_ansi_wraps_level_only() {
        assert_eq!(Style::Ansi.paint(Level::ERROR, "ERROR"), "\x1b[31mERROR\x1b[0m");
        assert_eq!(Style::Plain.paint(Level::ERROR, "ERROR"), "ERROR");
    }
}
