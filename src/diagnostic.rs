use std::fmt;

/// Byte range in the source buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self::new(0, 0)
    }
}

/// A fatal compile diagnostic.
///
/// Compilation is fail-fast: the first diagnostic aborts the whole run, so
/// there is no severity ladder and no collection phase. `Display` is the
/// canonical one-line `"<line>: <message>"` form; `render` produces the full
/// source-annotated report.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub message: String,
    pub line: usize,
    pub span: Span,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, line: usize, span: Span) -> Self {
        Self {
            message: message.into(),
            line,
            span,
            help: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Render the diagnostic to stderr using ariadne.
    pub fn render(&self, filename: &str, source: &str) {
        use ariadne::{Color, Label, Report, ReportKind, Source};

        let end = (self.span.end as usize).min(source.len());
        let start = (self.span.start as usize).min(end);

        let mut report = Report::build(ReportKind::Error, filename, start)
            .with_message(&self.message)
            .with_label(
                Label::new((filename, start..end))
                    .with_message(&self.message)
                    .with_color(Color::Red),
            );

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        if report.finish().eprint((filename, Source::from(source))).is_err() {
            // Fall back to the one-line form if the terminal write failed.
            eprintln!("{self}");
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}
